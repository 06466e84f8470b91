//! Event bus for the park server supervisor
//!
//! The controller raises lifecycle, network and scenario events here and any
//! number of subscribers (notification relays, loggers, tests) observe them.
//! Pass-through events are forwarded untouched; computed events such as
//! scenario completion are derived by the controller before being emitted.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

pub mod types;

pub use types::*;

// ============================================================================
// Event Traits and Core Infrastructure
// ============================================================================

pub trait Event: Send + Sync + Any + std::fmt::Debug {
    fn type_name() -> &'static str
    where
        Self: Sized;
    fn serialize(&self) -> Result<Vec<u8>, EventError>;
    fn deserialize(data: &[u8]) -> Result<Self, EventError>
    where
        Self: Sized;
}

impl<T> Event for T
where
    T: Serialize + DeserializeOwned + Send + Sync + Any + std::fmt::Debug + 'static,
{
    fn type_name() -> &'static str {
        std::any::type_name::<T>()
    }

    fn serialize(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(EventError::Serialization)
    }

    fn deserialize(data: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(data).map_err(EventError::Deserialization)
    }
}

/// An event payload with a fixed, well-known name on the bus.
pub trait NamedEvent: Event {
    const NAME: &'static str;
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, data: &[u8]) -> Result<(), EventError>;
    fn expected_type_id(&self) -> TypeId;
    fn handler_name(&self) -> &str;
}

pub struct TypedEventHandler<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync,
{
    handler: F,
    name: String,
    _phantom: std::marker::PhantomData<T>,
}

impl<T, F> TypedEventHandler<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync,
{
    pub fn new(name: String, handler: F) -> Self {
        Self {
            handler,
            name,
            _phantom: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, F> EventHandler for TypedEventHandler<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync,
{
    async fn handle(&self, data: &[u8]) -> Result<(), EventError> {
        let event = T::deserialize(data)?;
        (self.handler)(event)
    }

    fn expected_type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Event System
// ============================================================================

/// Subscriber registry keyed by event name.
///
/// Every handler registered for a name receives each emitted payload in
/// registration order. A failing handler is logged and does not prevent the
/// remaining handlers from running.
pub struct EventSystem {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    stats: RwLock<EventSystemStats>,
}

impl Default for EventSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSystem {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            stats: RwLock::new(EventSystemStats::default()),
        }
    }

    /// Registers a handler for the named event.
    ///
    /// A name is bound to the payload type of its first handler; handlers
    /// expecting another type are rejected.
    pub async fn on<T, F>(&self, event_name: &str, handler: F) -> Result<(), EventError>
    where
        T: Event + 'static,
        F: Fn(T) -> Result<(), EventError> + Send + Sync + 'static,
    {
        let handler_name = format!("{}::{}", event_name, T::type_name());
        let handler_arc: Arc<dyn EventHandler> =
            Arc::new(TypedEventHandler::new(handler_name, handler));

        let mut handlers = self.handlers.write().await;
        let registered = handlers.entry(event_name.to_string()).or_insert_with(Vec::new);
        if let Some(bound) = registered.first() {
            if bound.expected_type_id() != handler_arc.expected_type_id() {
                return Err(EventError::PayloadMismatch {
                    event: event_name.to_string(),
                    bound: bound.handler_name().to_string(),
                });
            }
        }
        registered.push(handler_arc);

        let mut stats = self.stats.write().await;
        stats.total_handlers += 1;

        info!("📝 Registered handler for {}", event_name);
        Ok(())
    }

    /// Registers a handler for a [`NamedEvent`] payload type.
    pub async fn subscribe<T, F>(&self, handler: F) -> Result<(), EventError>
    where
        T: NamedEvent + 'static,
        F: Fn(T) -> Result<(), EventError> + Send + Sync + 'static,
    {
        self.on(T::NAME, handler).await
    }

    /// Emits a [`NamedEvent`] under its own name.
    pub async fn publish<T>(&self, event: &T) -> Result<(), EventError>
    where
        T: NamedEvent,
    {
        self.emit(T::NAME, event).await
    }

    /// Emits a payload to every handler registered for `event_name`.
    pub async fn emit<T>(&self, event_name: &str, event: &T) -> Result<(), EventError>
    where
        T: Event,
    {
        let data = event.serialize()?;
        let handlers = self.handlers.read().await;

        if let Some(event_handlers) = handlers.get(event_name) {
            debug!(
                "📤 Emitting {} to {} handlers",
                event_name,
                event_handlers.len()
            );

            for handler in event_handlers {
                if let Err(e) = handler.handle(&data).await {
                    error!("❌ Handler {} failed: {}", handler.handler_name(), e);
                }
            }
        } else {
            debug!("No handlers for event: {}", event_name);
        }

        let mut stats = self.stats.write().await;
        stats.events_emitted += 1;

        Ok(())
    }

    pub async fn get_stats(&self) -> EventSystemStats {
        let stats = self.stats.read().await;
        stats.clone()
    }
}

// ============================================================================
// Statistics and Error Types
// ============================================================================

#[derive(Debug, Default, Clone)]
pub struct EventSystemStats {
    pub total_handlers: usize,
    pub events_emitted: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),
    #[error("Handler execution error: {0}")]
    HandlerExecution(String),
    #[error("Event {event} is already bound to {bound}")]
    PayloadMismatch { event: String, bound: String },
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Seconds since the Unix epoch, saturating to zero on a clock before 1970.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn create_event_system() -> Arc<EventSystem> {
    Arc::new(EventSystem::new())
}
