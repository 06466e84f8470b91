//! Readiness detection for launched game servers
//!
//! The executable has no startup handshake; it is considered ready once its
//! standard output has printed every required marker. The marker text is the
//! executable's own logging and must match it exactly.

use event_system::ServerId;

/// Observes output lines and decides when a launch is ready.
pub trait ReadinessDetector: Send {
    /// Feeds one line of output. Returns true once every marker was seen.
    fn observe(&mut self, line: &str) -> bool;

    fn is_ready(&self) -> bool;

    /// Markers not yet observed, for error reporting.
    fn missing(&self) -> Vec<String>;
}

/// Case-insensitive substring matching over a fixed set of markers.
#[derive(Debug, Clone)]
pub struct MarkerReadiness {
    markers: Vec<(String, bool)>,
}

impl MarkerReadiness {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(|m| (m.into().to_lowercase(), false))
                .collect(),
        }
    }

    /// Markers printed by a game server hosting on `port`, plus the adapter
    /// plugin marker when the plugin is enabled.
    pub fn for_server(server_id: ServerId, port: u32, plugin_enabled: bool) -> Self {
        let mut markers = vec![format!("listening for clients on port {port}")];
        if plugin_enabled {
            markers.push(format!(
                "adapter plugin for server {} is active",
                server_id.get()
            ));
        }
        Self::new(markers)
    }
}

impl ReadinessDetector for MarkerReadiness {
    fn observe(&mut self, line: &str) -> bool {
        let line = line.to_lowercase();
        for (marker, seen) in self.markers.iter_mut() {
            if !*seen && line.contains(marker.as_str()) {
                *seen = true;
            }
        }
        self.is_ready()
    }

    fn is_ready(&self) -> bool {
        self.markers.iter().all(|(_, seen)| *seen)
    }

    fn missing(&self) -> Vec<String> {
        self.markers
            .iter()
            .filter(|(_, seen)| !*seen)
            .map(|(marker, _)| marker.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_every_marker() {
        let mut detector = MarkerReadiness::for_server(ServerId(2), 11753, true);
        assert!(!detector.observe("Loading park..."));
        assert!(!detector.observe("Listening for clients on port 11753"));
        assert_eq!(detector.missing(), vec!["adapter plugin for server 2 is active"]);
        assert!(detector.observe("[script] Adapter plugin for server 2 is active"));
        assert!(detector.missing().is_empty());
    }

    #[test]
    fn test_markers_arrive_in_any_order() {
        let mut detector = MarkerReadiness::for_server(ServerId(1), 12000, true);
        assert!(!detector.observe("adapter plugin for server 1 is active"));
        assert!(detector.observe("listening for clients on port 12000"));
    }

    #[test]
    fn test_plugin_marker_skipped_when_disabled() {
        let mut detector = MarkerReadiness::for_server(ServerId(1), 12000, false);
        assert!(!detector.observe("listening for clients on port 12001"));
        assert!(detector.observe("listening for clients on port 12000"));
    }
}
