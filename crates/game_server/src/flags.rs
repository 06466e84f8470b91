//! Operation Flag Table
//!
//! Admission control for high-level operations. A flag is keyed by
//! `(ServerId, OperationKind)`; its presence means the operation is in
//! flight. Setting a flag never blocks: a second attempt is refused
//! immediately and callers must act on the returned `bool`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use event_system::ServerId;
use std::fmt;
use uuid::Uuid;

/// Operations guarded by the flag table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Start,
    StartDefer,
    Screenshot,
    Save,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Start,
        OperationKind::StartDefer,
        OperationKind::Screenshot,
        OperationKind::Save,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Start => "start",
            OperationKind::StartDefer => "start.defer",
            OperationKind::Screenshot => "screenshot",
            OperationKind::Save => "save",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of a deferred start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredState {
    /// Counting down; cancellation still wins.
    Pending,
    /// Countdown expired and the launch has begun; cancellation is too late.
    Launching,
}

/// Payload of a `start.defer` flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredStart {
    /// Identifies one countdown so a stale loop never clears a newer flag.
    pub session: Uuid,
    /// Name of the scenario that will be launched.
    pub scenario: String,
    pub state: DeferredState,
}

/// Flag value, one variant per operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationFlag {
    Start,
    StartDefer(DeferredStart),
    Screenshot,
    Save,
}

impl OperationFlag {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationFlag::Start => OperationKind::Start,
            OperationFlag::StartDefer(_) => OperationKind::StartDefer,
            OperationFlag::Screenshot => OperationKind::Screenshot,
            OperationFlag::Save => OperationKind::Save,
        }
    }
}

#[derive(Debug, Default)]
pub struct OperationFlags {
    flags: DashMap<(ServerId, OperationKind), OperationFlag>,
}

impl OperationFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the flag iff no flag of the same kind is set for `id`.
    pub fn try_set(&self, id: ServerId, flag: OperationFlag) -> bool {
        match self.flags.entry((id, flag.kind())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(flag);
                true
            }
        }
    }

    pub fn delete(&self, id: ServerId, kind: OperationKind) -> Option<OperationFlag> {
        self.flags.remove(&(id, kind)).map(|(_, flag)| flag)
    }

    pub fn has(&self, id: ServerId, kind: OperationKind) -> bool {
        self.flags.contains_key(&(id, kind))
    }

    pub fn get(&self, id: ServerId, kind: OperationKind) -> Option<OperationFlag> {
        self.flags.get(&(id, kind)).map(|flag| flag.value().clone())
    }

    /// Every flag currently set for `id`, in [`OperationKind`] order.
    pub fn list_for(&self, id: ServerId) -> Vec<OperationFlag> {
        OperationKind::ALL
            .iter()
            .filter_map(|kind| self.get(id, *kind))
            .collect()
    }

    /// Server ids that currently hold a flag of `kind`.
    pub fn servers_with(&self, kind: OperationKind) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self
            .flags
            .iter()
            .filter(|entry| entry.key().1 == kind)
            .map(|entry| entry.key().0)
            .collect();
        ids.sort();
        ids
    }

    /// Removes a deferred start that is still counting down and returns it.
    /// A deferred start that has begun launching is left alone.
    pub fn cancel_pending_deferred(&self, id: ServerId) -> Option<DeferredStart> {
        self.flags
            .remove_if(&(id, OperationKind::StartDefer), |_, flag| {
                matches!(flag, OperationFlag::StartDefer(d) if d.state == DeferredState::Pending)
            })
            .and_then(|(_, flag)| match flag {
                OperationFlag::StartDefer(deferred) => Some(deferred),
                _ => None,
            })
    }

    /// Moves the countdown `session` from pending to launching.
    ///
    /// Returns false when the session was cancelled (or replaced) first.
    pub fn begin_deferred_launch(&self, id: ServerId, session: Uuid) -> bool {
        match self.flags.get_mut(&(id, OperationKind::StartDefer)) {
            Some(mut flag) => match flag.value_mut() {
                OperationFlag::StartDefer(deferred)
                    if deferred.session == session && deferred.state == DeferredState::Pending =>
                {
                    deferred.state = DeferredState::Launching;
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    /// Whether the countdown `session` still owns the `start.defer` flag.
    pub fn is_deferred_session(&self, id: ServerId, session: Uuid) -> bool {
        matches!(
            self.get(id, OperationKind::StartDefer),
            Some(OperationFlag::StartDefer(d)) if d.session == session
        )
    }

    /// Clears the `start.defer` flag only if `session` still owns it.
    pub fn remove_deferred_session(&self, id: ServerId, session: Uuid) -> bool {
        self.flags
            .remove_if(&(id, OperationKind::StartDefer), |_, flag| {
                matches!(flag, OperationFlag::StartDefer(d) if d.session == session)
            })
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deferred(scenario: &str) -> (Uuid, OperationFlag) {
        let session = Uuid::new_v4();
        (
            session,
            OperationFlag::StartDefer(DeferredStart {
                session,
                scenario: scenario.to_string(),
                state: DeferredState::Pending,
            }),
        )
    }

    #[test]
    fn test_try_set_is_compare_and_set() {
        let flags = OperationFlags::new();
        let id = ServerId(1);

        assert!(flags.try_set(id, OperationFlag::Start));
        assert!(!flags.try_set(id, OperationFlag::Start));
        assert!(flags.try_set(id, OperationFlag::Save));
        assert!(flags.try_set(ServerId(2), OperationFlag::Start));

        assert!(flags.has(id, OperationKind::Start));
        assert_eq!(flags.delete(id, OperationKind::Start), Some(OperationFlag::Start));
        assert!(!flags.has(id, OperationKind::Start));
        assert!(flags.try_set(id, OperationFlag::Start));
    }

    #[test]
    fn test_list_for_reports_every_flag() {
        let flags = OperationFlags::new();
        let id = ServerId(3);
        let (_, flag) = deferred("forest.sc6");

        flags.try_set(id, OperationFlag::Screenshot);
        flags.try_set(id, flag);
        let kinds: Vec<_> = flags.list_for(id).iter().map(|f| f.kind()).collect();
        assert_eq!(kinds, vec![OperationKind::StartDefer, OperationKind::Screenshot]);
        assert!(flags.list_for(ServerId(4)).is_empty());
        assert_eq!(flags.servers_with(OperationKind::StartDefer), vec![id]);
    }

    #[test]
    fn test_cancel_loses_to_launching_session() {
        let flags = OperationFlags::new();
        let id = ServerId(1);
        let (session, flag) = deferred("forest.sc6");
        flags.try_set(id, flag);

        assert!(flags.begin_deferred_launch(id, session));
        assert!(flags.cancel_pending_deferred(id).is_none());
        assert!(flags.has(id, OperationKind::StartDefer));
        assert!(flags.remove_deferred_session(id, session));
    }

    #[test]
    fn test_cancel_wins_over_pending_session() {
        let flags = OperationFlags::new();
        let id = ServerId(1);
        let (session, flag) = deferred("forest.sc6");
        flags.try_set(id, flag);

        let cancelled = flags.cancel_pending_deferred(id).unwrap();
        assert_eq!(cancelled.scenario, "forest.sc6");
        assert!(!flags.begin_deferred_launch(id, session));
        assert!(!flags.is_deferred_session(id, session));
    }

    #[test]
    fn test_stale_session_never_clears_newer_flag() {
        let flags = OperationFlags::new();
        let id = ServerId(1);
        let (old, first) = deferred("a.park");
        flags.try_set(id, first);
        flags.cancel_pending_deferred(id);

        let (_, second) = deferred("b.park");
        flags.try_set(id, second);
        assert!(!flags.remove_deferred_session(id, old));
        assert!(flags.has(id, OperationKind::StartDefer));
    }
}
