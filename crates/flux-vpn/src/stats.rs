//! Session Statistics Timer
//!
//! Periodic 1-second ticker owning the session's elapsed-time clock
//! and traffic counters. Each tick queries the engine's byte counters
//! (when traffic statistics are enabled) and publishes one
//! [`ConnectionInfoEvent`] through the event bus.
//!
//! The ticker runs in bounded cycles and restarts transparently while
//! the engine still reports running, so a long-lived session keeps its
//! statistics across the cycle boundary.

use crate::engine::{DIRECTION_DOWNLINK, DIRECTION_UPLINK, EngineController, TRAFFIC_TAGS};
use crate::events::{ConnectionInfoEvent, ConnectionState, EventBus, SessionEvent, StateCell};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Tick interval.
const TICK: Duration = Duration::from_secs(1);

/// Ticks per timer cycle before the running-check and restart.
const TIMER_CYCLE_TICKS: u32 = 7200;

/// Elapsed time and traffic aggregate for the active session.
///
/// Owned exclusively by the timer task; zeroed on every session start
/// and reported as zeroes on disconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    seconds: u32,
    minutes: u32,
    hours: u32,
    /// Bytes uploaded during the last tick interval
    pub upload_speed: i64,
    /// Bytes downloaded during the last tick interval
    pub download_speed: i64,
    /// Cumulative uploaded bytes
    pub total_upload: i64,
    /// Cumulative downloaded bytes
    pub total_download: i64,
}

impl SessionStats {
    /// Advance the clock by one second. Hours wrap at 24, so a full
    /// day of ticks returns the clock to 00:00:00 without ending the
    /// session.
    pub fn advance_clock(&mut self) {
        self.seconds += 1;
        if self.seconds == 60 {
            self.seconds = 0;
            self.minutes += 1;
            if self.minutes == 60 {
                self.minutes = 0;
                self.hours += 1;
                if self.hours == 24 {
                    self.hours = 0;
                }
            }
        }
    }

    /// Record one tick's instantaneous speeds and fold them into the
    /// cumulative totals.
    pub fn record_traffic(&mut self, upload: i64, download: i64) {
        self.upload_speed = upload;
        self.download_speed = download;
        self.total_upload += upload;
        self.total_download += download;
    }

    /// Elapsed duration formatted "HH:MM:SS".
    pub fn formatted_duration(&self) -> String {
        format!("{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)
    }

    fn snapshot(&self, state: ConnectionState) -> ConnectionInfoEvent {
        ConnectionInfoEvent {
            state,
            duration: self.formatted_duration(),
            upload_speed: self.upload_speed,
            download_speed: self.download_speed,
            total_upload: self.total_upload,
            total_download: self.total_download,
        }
    }
}

/// Handle over the spawned ticker task.
pub(crate) struct StatsTimer {
    handle: JoinHandle<()>,
}

impl StatsTimer {
    /// Spawn the ticker. `controller` is queried for byte counters and
    /// for the running-check at each cycle boundary; `state` supplies
    /// the connection state stamped onto every event.
    pub fn spawn(
        controller: Option<Arc<dyn EngineController>>,
        state: Arc<StateCell>,
        bus: EventBus,
        traffic_stats: bool,
    ) -> Self {
        let handle = tokio::spawn(async move {
            run_ticker(controller, state, bus, traffic_stats).await;
        });
        Self { handle }
    }

    /// Stop the ticker. The final disconnect event is emitted by the
    /// lifecycle manager, not here.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for StatsTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_ticker(
    controller: Option<Arc<dyn EngineController>>,
    state: Arc<StateCell>,
    bus: EventBus,
    traffic_stats: bool,
) {
    let mut stats = SessionStats::default();
    let mut interval = tokio::time::interval(TICK);
    // The first interval tick completes immediately; consume it so the
    // first published event lands one second in.
    interval.tick().await;

    loop {
        for _ in 0..TIMER_CYCLE_TICKS {
            interval.tick().await;
            stats.advance_clock();

            if traffic_stats {
                if let Some(controller) = &controller {
                    let download = sum_stats(controller.as_ref(), DIRECTION_DOWNLINK);
                    let upload = sum_stats(controller.as_ref(), DIRECTION_UPLINK);
                    stats.record_traffic(upload, download);
                }
            }

            debug!("stats tick => {}", stats.formatted_duration());
            bus.publish(SessionEvent::ConnectionInfo(stats.snapshot(state.get())));
        }

        // Cycle bound reached; keep going only while the engine runs.
        match &controller {
            Some(controller) if controller.is_running() => continue,
            _ => break,
        }
    }
}

/// Sum one direction's counters across all traffic classes.
fn sum_stats(controller: &dyn EngineController, direction: &str) -> i64 {
    TRAFFIC_TAGS
        .iter()
        .map(|tag| controller.query_stats(tag, direction))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockController;
    use crate::events::ConnectionState;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_clock_carries_minutes_and_hours() {
        let mut stats = SessionStats::default();
        for _ in 0..3661 {
            stats.advance_clock();
        }
        assert_eq!(stats.formatted_duration(), "01:01:01");
    }

    #[test]
    fn test_clock_wraps_after_full_day() {
        let mut stats = SessionStats::default();
        for _ in 0..86_400 {
            stats.advance_clock();
        }
        assert_eq!(stats.formatted_duration(), "00:00:00");

        // The clock keeps counting after the wrap
        stats.advance_clock();
        assert_eq!(stats.formatted_duration(), "00:00:01");
    }

    #[test]
    fn test_duration_is_zero_padded() {
        let mut stats = SessionStats::default();
        for _ in 0..9 {
            stats.advance_clock();
        }
        assert_eq!(stats.formatted_duration(), "00:00:09");
    }

    #[test]
    fn test_traffic_accumulates() {
        let mut stats = SessionStats::default();

        stats.record_traffic(100, 200);
        assert_eq!(stats.upload_speed, 100);
        assert_eq!(stats.download_speed, 200);

        stats.record_traffic(50, 75);
        assert_eq!(stats.upload_speed, 50);
        assert_eq!(stats.download_speed, 75);
        assert_eq!(stats.total_upload, 150);
        assert_eq!(stats.total_download, 275);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_publishes_one_event_per_second() {
        let controller = MockController::new();
        controller.set_running(true);
        controller.stats_per_query.store(10, Ordering::SeqCst);

        let state = Arc::new(StateCell::default());
        state.set(ConnectionState::Connected);
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let timer = StatsTimer::spawn(
            Some(controller.clone()),
            state.clone(),
            bus.clone(),
            true,
        );

        // Two traffic classes at 10 bytes each per direction
        let first = rx.recv().await.expect("first tick");
        match first {
            SessionEvent::ConnectionInfo(info) => {
                assert_eq!(info.duration, "00:00:01");
                assert_eq!(info.state, ConnectionState::Connected);
                assert_eq!(info.upload_speed, 20);
                assert_eq!(info.download_speed, 20);
                assert_eq!(info.total_upload, 20);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let second = rx.recv().await.expect("second tick");
        match second {
            SessionEvent::ConnectionInfo(info) => {
                assert_eq!(info.duration, "00:00:02");
                assert_eq!(info.total_upload, 40);
                assert_eq!(info.total_download, 40);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        timer.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_freezes_traffic_when_disabled() {
        let controller = MockController::new();
        controller.set_running(true);
        controller.stats_per_query.store(10, Ordering::SeqCst);

        let state = Arc::new(StateCell::default());
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let timer = StatsTimer::spawn(Some(controller.clone()), state, bus.clone(), false);

        match rx.recv().await.expect("tick") {
            SessionEvent::ConnectionInfo(info) => {
                // Engine counters are not queried at all
                assert_eq!(info.upload_speed, 0);
                assert_eq!(info.download_speed, 0);
                assert_eq!(info.total_upload, 0);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        timer.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_survives_cycle_boundary_while_running() {
        let controller = MockController::new();
        controller.set_running(true);
        controller.stats_per_query.store(1, Ordering::SeqCst);

        let state = Arc::new(StateCell::default());
        let bus = EventBus::with_capacity(TIMER_CYCLE_TICKS as usize * 2 + 8);
        let mut rx = bus.subscribe();

        let timer = StatsTimer::spawn(Some(controller.clone()), state, bus.clone(), true);

        // Drain one full cycle plus one tick; totals must be continuous
        let mut last_total = 0;
        for _ in 0..(TIMER_CYCLE_TICKS + 1) {
            match rx.recv().await.expect("tick") {
                SessionEvent::ConnectionInfo(info) => last_total = info.total_upload,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(last_total, (TIMER_CYCLE_TICKS as i64 + 1) * 2);

        timer.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stops_at_cycle_boundary_when_engine_stopped() {
        let controller = MockController::new();
        controller.set_running(false);

        let state = Arc::new(StateCell::default());
        let bus = EventBus::with_capacity(TIMER_CYCLE_TICKS as usize + 8);
        let mut rx = bus.subscribe();

        let timer = StatsTimer::spawn(Some(controller.clone()), state, bus.clone(), false);

        for _ in 0..TIMER_CYCLE_TICKS {
            assert!(rx.recv().await.is_ok());
        }

        // Engine not running: the ticker ends instead of restarting
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));

        timer.cancel();
    }
}
