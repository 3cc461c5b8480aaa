//! # Event Bus System
//!
//! Broadcasts reconciliation lifecycle events using `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The sync coordinator publishes one `RunStarted` and exactly one terminal
//! event (`RunCompleted`, `RunFailed` or `RunCancelled`) per run, plus an
//! `EntityFailed` or `ReviewRequired` event for every entity that could not be
//! reconciled automatically. Hosts subscribe to surface these to users (tray
//! notifications, a review queue in the API layer).
//!
//! ```text
//! ┌──────────────────┐   emit    ┌───────────┐  subscribe  ┌──────────────┐
//! │ SyncCoordinator  ├──────────>│ EventBus  ├────────────>│ API layer    │
//! └──────────────────┘           │ (broadcast│             └──────────────┘
//!                                │  channel) ├────────────>┌──────────────┐
//!                                └───────────┘             │ Notifications│
//!                                                          └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
//! use bridge_traits::EntityKind;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(64);
//! let mut stream = bus.subscribe();
//!
//! bus.emit(CoreEvent::Sync(SyncEvent::RunStarted {
//!     run_id: "run-1".to_string(),
//!     kind: EntityKind::Note,
//!     dry_run: false,
//! }))
//! .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.description(), "Reconciliation started");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber fell behind and missed `n` events.
//! - **`RecvError::Closed`**: every sender was dropped.
//!
//! `emit` fails only when nobody is subscribed; publishers call `.ok()` on it.

use bridge_traits::EntityKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast::{self, error::RecvError, error::SendError, Receiver};

/// Default number of events buffered per subscriber
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Event Types
// ============================================================================

/// Top-level event published on the bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Reconciliation run events
    Sync(SyncEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::RunFailed { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::EntityFailed { .. }) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::ReviewRequired { .. }) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::RunCompleted { .. }) => EventSeverity::Info,
            CoreEvent::Sync(SyncEvent::RunCancelled { .. }) => EventSeverity::Info,
            CoreEvent::Sync(SyncEvent::RunStarted { .. }) => EventSeverity::Debug,
        }
    }

    /// Kind the event concerns
    pub fn kind(&self) -> EntityKind {
        match self {
            CoreEvent::Sync(e) => e.kind(),
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Events emitted over the life of a reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// A run acquired its partition and started fetching snapshots.
    RunStarted {
        run_id: String,
        kind: EntityKind,
        dry_run: bool,
    },
    /// An entity failed to normalize or apply.
    EntityFailed {
        run_id: String,
        kind: EntityKind,
        /// Local or remote id of the entity, whichever is known
        entity_id: String,
        message: String,
        /// Whether the failure was transient (it will be retried next run)
        retryable: bool,
    },
    /// A pair was held back for a human decision.
    ReviewRequired {
        run_id: String,
        kind: EntityKind,
        local_id: Option<String>,
        remote_id: Option<String>,
        reason: String,
    },
    /// The run finished; some entities may still have failed.
    RunCompleted {
        run_id: String,
        kind: EntityKind,
        /// Actions applied (or planned, for a dry run)
        applied: u64,
        failed: u64,
        unchanged: u64,
        duration_ms: u64,
    },
    /// The run aborted before applying anything further.
    RunFailed {
        run_id: String,
        kind: EntityKind,
        message: String,
    },
    /// The run was cancelled; in-flight applies were committed.
    RunCancelled {
        run_id: String,
        kind: EntityKind,
        applied: u64,
        skipped: u64,
    },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::RunStarted { .. } => "Reconciliation started",
            SyncEvent::EntityFailed { .. } => "Entity could not be reconciled",
            SyncEvent::ReviewRequired { .. } => "Entity needs review",
            SyncEvent::RunCompleted { .. } => "Reconciliation completed",
            SyncEvent::RunFailed { .. } => "Reconciliation failed",
            SyncEvent::RunCancelled { .. } => "Reconciliation cancelled",
        }
    }

    /// Kind the event concerns
    pub fn kind(&self) -> EntityKind {
        match self {
            SyncEvent::RunStarted { kind, .. }
            | SyncEvent::EntityFailed { kind, .. }
            | SyncEvent::ReviewRequired { kind, .. }
            | SyncEvent::RunCompleted { kind, .. }
            | SyncEvent::RunFailed { kind, .. }
            | SyncEvent::RunCancelled { kind, .. } => *kind,
        }
    }

    /// Run the event belongs to
    pub fn run_id(&self) -> &str {
        match self {
            SyncEvent::RunStarted { run_id, .. }
            | SyncEvent::EntityFailed { run_id, .. }
            | SyncEvent::ReviewRequired { run_id, .. }
            | SyncEvent::RunCompleted { run_id, .. }
            | SyncEvent::RunFailed { run_id, .. }
            | SyncEvent::RunCancelled { run_id, .. } => run_id,
        }
    }

    /// Terminal events close a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncEvent::RunCompleted { .. }
                | SyncEvent::RunFailed { .. }
                | SyncEvent::RunCancelled { .. }
        )
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central broadcast channel for core events.
///
/// Cloning an `EventBus` shares the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of events to buffer per subscriber.
    ///   A subscriber that falls further behind receives `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are no active subscribers.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventSeverity, EventStream};
///
/// let bus = EventBus::new(16);
/// let problems = EventStream::new(bus.subscribe())
///     .filter(|event| event.severity() >= EventSeverity::Warning);
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking receive. Returns `None` when no matching event is queued.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        use tokio::sync::broadcast::error::TryRecvError;

        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.matches(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Lagged(n)) => return Some(Err(RecvError::Lagged(n))),
                Err(TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }

    fn matches(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |f| f(event))
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn started(run_id: &str, kind: EntityKind) -> CoreEvent {
        CoreEvent::Sync(SyncEvent::RunStarted {
            run_id: run_id.to_string(),
            kind,
            dry_run: false,
        })
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        assert!(bus.emit(started("r1", EntityKind::Note)).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let event = started("r1", EntityKind::Reminder);
        assert_eq!(bus.emit(event.clone()).unwrap(), 2);

        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_filter_by_severity() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| event.severity() >= EventSeverity::Warning);

        bus.emit(started("r1", EntityKind::Note)).ok();
        bus.emit(CoreEvent::Sync(SyncEvent::ReviewRequired {
            run_id: "r1".to_string(),
            kind: EntityKind::Note,
            local_id: Some("n1".to_string()),
            remote_id: Some("r-n1".to_string()),
            reason: "conflict oscillation".to_string(),
        }))
        .ok();

        let received = stream.recv().await.unwrap();
        assert!(matches!(
            received,
            CoreEvent::Sync(SyncEvent::ReviewRequired { .. })
        ));
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.emit(started(&format!("r{}", i), EntityKind::Photo)).ok();
        }
        assert!(matches!(sub.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_terminal_events_and_accessors() {
        let completed = SyncEvent::RunCompleted {
            run_id: "r9".to_string(),
            kind: EntityKind::Credential,
            applied: 3,
            failed: 1,
            unchanged: 10,
            duration_ms: 42,
        };
        assert!(completed.is_terminal());
        assert_eq!(completed.run_id(), "r9");
        assert_eq!(completed.kind(), EntityKind::Credential);

        let failed = SyncEvent::EntityFailed {
            run_id: "r9".to_string(),
            kind: EntityKind::Credential,
            entity_id: "c1".to_string(),
            message: "vault locked".to_string(),
            retryable: true,
        };
        assert!(!failed.is_terminal());
    }

    #[test]
    fn test_event_serialization_shape() {
        let json = serde_json::to_value(started("r1", EntityKind::Note)).unwrap();
        assert_eq!(json["type"], "Sync");
        assert_eq!(json["payload"]["event"], "RunStarted");
        assert_eq!(json["payload"]["kind"], "note");
    }
}
