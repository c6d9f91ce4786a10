//! Session Event Bus
//!
//! Typed publish/subscribe channel for connection-state and
//! delay-measurement events.
//!
//! # Delivery
//!
//! Publishing never blocks the sender. Subscribers that fall behind
//! lose the oldest events (best-effort broadcast), so a slow observer
//! cannot stall the stats timer.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default buffered events per subscriber.
const BUS_CAPACITY: usize = 64;

/// Connection state of the active session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session is active
    Disconnected,
    /// Engine start requested, not yet confirmed running
    Connecting,
    /// Engine reports running
    Connected,
}

impl ConnectionState {
    /// Check if the session is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Lock-free cell holding the current [`ConnectionState`].
///
/// Shared between the lifecycle manager and the stats timer task.
#[derive(Debug, Default)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// Snapshot of the session published once per timer tick and once on
/// disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfoEvent {
    /// Current connection state
    pub state: ConnectionState,
    /// Session duration, formatted "HH:MM:SS"
    pub duration: String,
    /// Upload speed (bytes per tick interval)
    pub upload_speed: i64,
    /// Download speed (bytes per tick interval)
    pub download_speed: i64,
    /// Cumulative uploaded bytes this session
    pub total_upload: i64,
    /// Cumulative downloaded bytes this session
    pub total_download: i64,
}

impl ConnectionInfoEvent {
    /// Event emitted when the session reaches DISCONNECTED.
    pub fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            duration: "00:00:00".to_string(),
            upload_speed: 0,
            download_speed: 0,
            total_upload: 0,
            total_download: 0,
        }
    }
}

/// Result of an asynchronous delay probe. `delay_ms == -1` signals
/// failure (engine absent or probe error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayMeasuredEvent {
    pub delay_ms: i64,
}

/// Events broadcast to session observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Periodic state/traffic snapshot
    ConnectionInfo(ConnectionInfoEvent),
    /// Delay probe finished
    DelayMeasured(DelayMeasuredEvent),
}

/// Process-wide broadcast channel for [`SessionEvent`]s.
///
/// Cheap to clone; all clones publish into the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: Arc<broadcast::Sender<SessionEvent>>,
}

impl EventBus {
    /// Create a bus with the default per-subscriber capacity.
    pub fn new() -> Self {
        Self::with_capacity(BUS_CAPACITY)
    }

    /// Create a bus with an explicit per-subscriber capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// Never blocks; an event published with no subscribers is dropped.
    pub fn publish(&self, event: SessionEvent) {
        // send only fails when there are no receivers
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
    }

    #[test]
    fn test_state_cell_roundtrip() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), ConnectionState::Disconnected);

        cell.set(ConnectionState::Connecting);
        assert_eq!(cell.get(), ConnectionState::Connecting);

        cell.set(ConnectionState::Connected);
        assert_eq!(cell.get(), ConnectionState::Connected);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        // Must not error or panic
        bus.publish(SessionEvent::DelayMeasured(DelayMeasuredEvent {
            delay_ms: 42,
        }));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::ConnectionInfo(
            ConnectionInfoEvent::disconnected(),
        ));

        match rx.recv().await {
            Ok(SessionEvent::ConnectionInfo(info)) => {
                assert_eq!(info.state, ConnectionState::Disconnected);
                assert_eq!(info.duration, "00:00:00");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_all_clones_share_channel() {
        let bus = EventBus::new();
        let clone = bus.clone();
        let mut rx = bus.subscribe();

        clone.publish(SessionEvent::DelayMeasured(DelayMeasuredEvent {
            delay_ms: -1,
        }));

        let event = rx.recv().await.expect("event delivered");
        assert_eq!(
            event,
            SessionEvent::DelayMeasured(DelayMeasuredEvent { delay_ms: -1 })
        );
    }
}
