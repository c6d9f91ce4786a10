//! Session Lifecycle Manager
//!
//! Owns the active session's state machine, the protocol-engine
//! control handle, and the stats timer.
//!
//! # State machine
//!
//! ```text
//! DISCONNECTED --start--> CONNECTING --engine running--> CONNECTED
//!      ^                      |                             |
//!      |                (start failed)                 stop / engine
//!      +----------------------+---------------------------shutdown
//! ```
//!
//! One manager instance exists per session host; tests construct a
//! fresh instance per case. Engine-issued lifecycle callbacks arrive
//! on the [`EngineSignal`](crate::engine::EngineSignal) channel
//! registered at initialization and are handled by the host's command
//! loop, not here.

use crate::config::SessionConfig;
use crate::engine::{EngineController, EngineEnv, EngineError, EngineRuntime, SignalSender};
use crate::events::{ConnectionInfoEvent, ConnectionState, EventBus, SessionEvent, StateCell};
use crate::stats::StatsTimer;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Lifecycle manager errors
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Engine environment was never initialized")]
    NotInitialized,

    #[error("Engine controller is unavailable")]
    EngineUnavailable,

    #[error("Engine initialization failed: {0}")]
    Initialization(EngineError),

    #[error("Engine start failed: {0}")]
    StartFailure(EngineError),
}

/// Owns the protocol-engine handle, the connection state, and the
/// stats timer for the single active session.
pub struct SessionLifecycleManager {
    runtime: Arc<dyn EngineRuntime>,
    bus: EventBus,
    state: Arc<StateCell>,
    controller: Mutex<Option<Arc<dyn EngineController>>>,
    timer: Mutex<Option<StatsTimer>>,
    initialized: AtomicBool,
}

impl SessionLifecycleManager {
    pub fn new(runtime: Arc<dyn EngineRuntime>, bus: EventBus) -> Self {
        Self {
            runtime,
            bus,
            state: Arc::new(StateCell::default()),
            controller: Mutex::new(None),
            timer: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Prepare the engine environment and create the control handle,
    /// registering `signals` as the channel the engine reports
    /// lifecycle requests on.
    ///
    /// Idempotent: a second call on an initialized manager is a no-op.
    /// On failure the manager stays uninitialized and [`start`] is
    /// rejected until a later call succeeds.
    ///
    /// [`start`]: Self::start
    pub fn initialize(&self, env: &EngineEnv, signals: SignalSender) -> Result<(), ManagerError> {
        if self.initialized.load(Ordering::SeqCst) {
            debug!("manager already initialized, keeping existing controller");
            return Ok(());
        }

        self.runtime
            .init_env(env)
            .map_err(ManagerError::Initialization)?;
        let controller = self
            .runtime
            .new_controller(signals)
            .map_err(ManagerError::Initialization)?;

        *self.controller.lock().unwrap() = Some(controller);
        self.initialized.store(true, Ordering::SeqCst);
        info!("engine environment initialized");
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Engine-reported running flag. Never errors; an absent
    /// controller reads as not running.
    pub fn is_running(&self) -> bool {
        self.controller
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.is_running())
            .unwrap_or(false)
    }

    /// Start the session: begin the stats timer, submit the config
    /// payload to the engine loop, and transition to CONNECTED.
    ///
    /// A session that is already running is stopped first, so callers
    /// may use `start` as a restart. On failure all partial state is
    /// reverted: the timer is cancelled, the state returns to
    /// DISCONNECTED, and a final zeroed connection-info event is
    /// emitted.
    pub fn start(&self, config: &SessionConfig) -> Result<(), ManagerError> {
        if !self.initialized.load(Ordering::SeqCst) {
            error!("start rejected: engine environment not initialized");
            return Err(ManagerError::NotInitialized);
        }

        if self.is_running() {
            info!("session already running, restarting");
            self.stop();
        }

        self.state.set(ConnectionState::Connecting);
        let controller = self.controller.lock().unwrap().clone();

        // Timer starts with the attempt; a failed start cancels it.
        self.replace_timer(Some(StatsTimer::spawn(
            controller.clone(),
            self.state.clone(),
            self.bus.clone(),
            config.enable_traffic_stats,
        )));

        let Some(controller) = controller else {
            error!("start failed: engine controller is unavailable");
            self.disconnect_cleanup();
            return Err(ManagerError::EngineUnavailable);
        };

        if let Err(e) = controller.start_loop(&config.config_json) {
            error!("start failed: {}", e);
            self.disconnect_cleanup();
            return Err(ManagerError::StartFailure(e));
        }

        self.state.set(ConnectionState::Connected);
        info!("session connected ({})", config.remark);
        Ok(())
    }

    /// Stop the session. Safe to call unconditionally: when nothing is
    /// running this still cancels the timer and emits the final zeroed
    /// connection-info event.
    pub fn stop(&self) {
        let controller = self.controller.lock().unwrap().clone();
        match controller {
            Some(controller) if controller.is_running() => {
                controller.stop_loop();
                info!("engine loop stopped");
            }
            _ => debug!("stop: engine not running"),
        }
        self.disconnect_cleanup();
    }

    /// Probe the connected server. Blocking network operation; run it
    /// off the command path. Returns −1 on any failure.
    pub fn measure_delay(&self, url: &str) -> i64 {
        let controller = self.controller.lock().unwrap().clone();
        let Some(controller) = controller else {
            warn!("delay probe skipped: engine controller is unavailable");
            return -1;
        };
        match controller.measure_delay(url) {
            Ok(delay) => delay,
            Err(e) => {
                warn!("delay probe failed: {}", e);
                -1
            }
        }
    }

    /// Probe a server from its config payload without starting the
    /// engine loop. Routing rules are stripped from the payload first
    /// so rule-dependent connectivity does not skew the measurement;
    /// a payload that does not parse is probed unmodified. Returns −1
    /// on any failure.
    pub fn measure_delay_with_config(&self, config_json: &str, url: &str) -> i64 {
        let probe_payload = match strip_routing_rules(config_json) {
            Some(stripped) => stripped,
            None => {
                debug!("config payload not parseable, probing unmodified");
                config_json.to_string()
            }
        };
        match self.runtime.measure_outbound_delay(&probe_payload, url) {
            Ok(delay) => delay,
            Err(e) => {
                warn!("outbound delay probe failed: {}", e);
                -1
            }
        }
    }

    /// Cancel the timer, revert to DISCONNECTED, and emit the final
    /// zeroed connection-info event.
    fn disconnect_cleanup(&self) {
        self.replace_timer(None);
        self.state.set(ConnectionState::Disconnected);
        self.bus
            .publish(SessionEvent::ConnectionInfo(ConnectionInfoEvent::disconnected()));
    }

    fn replace_timer(&self, timer: Option<StatsTimer>) {
        let mut slot = self.timer.lock().unwrap();
        if let Some(old) = slot.take() {
            old.cancel();
        }
        *slot = timer;
    }
}

impl Drop for SessionLifecycleManager {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.cancel();
        }
    }
}

/// Remove `routing.rules` from a serialized engine config. Returns
/// `None` when the payload is not a JSON object carrying a routing
/// object.
fn strip_routing_rules(config_json: &str) -> Option<String> {
    let mut value: serde_json::Value = serde_json::from_str(config_json).ok()?;
    let routing = value.get_mut("routing")?.as_object_mut()?;
    routing.remove("rules");
    Some(value.to_string())
}
