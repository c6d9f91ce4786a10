//! Engine Interfaces
//!
//! Narrow control interfaces over the two opaque native subsystems:
//! the protocol engine (connection multiplexing, encryption, routing)
//! and the packet-forwarding engine (virtual-interface descriptor to
//! local SOCKS bridge).
//!
//! Lifecycle callbacks the protocol engine issues from its own threads
//! are modeled as an inbound [`EngineSignal`] channel rather than as
//! direct mutation of shared state; the session host selects on that
//! channel alongside its command queue.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Traffic classes the engine keeps byte counters for.
pub const TRAFFIC_TAGS: [&str; 2] = ["block", "proxy"];

/// Counter direction: engine to remote.
pub const DIRECTION_UPLINK: &str = "uplink";
/// Counter direction: remote to engine.
pub const DIRECTION_DOWNLINK: &str = "downlink";

/// Runtime environment for the protocol engine.
#[derive(Debug, Clone, Default)]
pub struct EngineEnv {
    /// Directory holding geo/rule asset files the engine loads
    pub asset_path: PathBuf,
    /// Opaque extra environment string, passed through untouched
    pub extra: String,
}

/// Lifecycle requests the protocol engine issues to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineSignal {
    /// Engine asks the host to prepare the virtual interface
    StartupRequested,
    /// Engine asks the host to tear the session down
    ShutdownRequested,
    /// Engine status emission; log-only
    Status { code: i64, message: String },
}

/// Sender half of the engine signal channel, handed to the engine at
/// controller creation time.
pub type SignalSender = mpsc::UnboundedSender<EngineSignal>;

/// Receiver half, owned by the session host's command loop.
pub type SignalReceiver = mpsc::UnboundedReceiver<EngineSignal>;

/// Protocol engine errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Engine environment setup failed: {0}")]
    EnvSetup(String),

    #[error("Controller creation failed: {0}")]
    ControllerCreation(String),

    #[error("Engine start failed: {0}")]
    StartFailed(String),

    #[error("Delay probe failed: {0}")]
    ProbeFailed(String),
}

/// Process-level entry points of the protocol engine.
///
/// One implementation exists per engine build; `init_env` is called
/// once, before any controller is created.
pub trait EngineRuntime: Send + Sync {
    /// Prepare the engine's runtime environment.
    fn init_env(&self, env: &EngineEnv) -> Result<(), EngineError>;

    /// Create the control handle, registering the signal channel the
    /// engine reports lifecycle requests on.
    fn new_controller(
        &self,
        signals: SignalSender,
    ) -> Result<Arc<dyn EngineController>, EngineError>;

    /// Probe a config payload without starting the engine loop.
    /// Blocking network operation; callers run it off the command path.
    fn measure_outbound_delay(&self, config_json: &str, url: &str) -> Result<i64, EngineError>;
}

/// Control handle over a created engine instance.
pub trait EngineController: Send + Sync {
    /// Start the engine loop with the given serialized configuration.
    fn start_loop(&self, config_json: &str) -> Result<(), EngineError>;

    /// Stop the engine loop.
    fn stop_loop(&self);

    /// Engine-reported running flag.
    fn is_running(&self) -> bool;

    /// Byte counter for one traffic class and direction. Counters are
    /// consumed on read (delta since the previous query).
    fn query_stats(&self, tag: &str, direction: &str) -> i64;

    /// Probe the connected server. Blocking network operation.
    fn measure_delay(&self, url: &str) -> Result<i64, EngineError>;
}

/// Forwarding engine errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ForwarderError {
    #[error("Forwarding engine failed to start: {0}")]
    StartFailed(String),

    #[error("Forwarding engine is not running")]
    NotRunning,
}

/// Keeps engine-owned sockets outside the tunnel so engine traffic is
/// not routed back into the interface it feeds.
pub trait SocketProtector: Send + Sync {
    fn protect(&self, fd: i32) -> bool;
}

/// Control interface over the packet-forwarding engine, which relays
/// raw IP packets between a virtual-interface descriptor and the local
/// SOCKS endpoint.
pub trait ForwardingEngine: Send + Sync {
    /// Start forwarding between `fd` and `socks_host:socks_port`.
    fn start(
        &self,
        fd: i32,
        socks_host: &str,
        socks_port: u16,
        mtu: u32,
        protector: Arc<dyn SocketProtector>,
    ) -> Result<(), ForwarderError>;

    /// Stop forwarding. Safe to call when not running.
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Bytes written towards the SOCKS endpoint since start.
    fn tx_bytes(&self) -> i64;

    /// Bytes written back into the interface since start.
    fn rx_bytes(&self) -> i64;
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory engine doubles for unit tests.

    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    /// Scriptable protocol engine controller.
    pub struct MockController {
        running: AtomicBool,
        pub fail_start: AtomicBool,
        /// Value returned for every `query_stats` call
        pub stats_per_query: AtomicI64,
        /// Value returned by `measure_delay`; negative means Err
        pub delay_ms: AtomicI64,
        /// Signal channel registered at controller creation
        signals: Mutex<Option<SignalSender>>,
        /// Every payload passed to `start_loop`
        pub started_with: Mutex<Vec<String>>,
        pub stop_calls: AtomicI64,
    }

    impl MockController {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                running: AtomicBool::new(false),
                fail_start: AtomicBool::new(false),
                stats_per_query: AtomicI64::new(0),
                delay_ms: AtomicI64::new(100),
                signals: Mutex::new(None),
                started_with: Mutex::new(Vec::new()),
                stop_calls: AtomicI64::new(0),
            })
        }

        pub fn attach_signals(&self, tx: SignalSender) {
            *self.signals.lock().unwrap() = Some(tx);
        }

        pub fn emit(&self, signal: EngineSignal) {
            if let Some(tx) = self.signals.lock().unwrap().as_ref() {
                let _ = tx.send(signal);
            }
        }

        pub fn set_running(&self, running: bool) {
            self.running.store(running, Ordering::SeqCst);
        }
    }

    impl EngineController for MockController {
        fn start_loop(&self, config_json: &str) -> Result<(), EngineError> {
            self.started_with
                .lock()
                .unwrap()
                .push(config_json.to_string());
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(EngineError::StartFailed("scripted failure".into()));
            }
            self.running.store(true, Ordering::SeqCst);
            // The real engine requests interface setup from its loop.
            self.emit(EngineSignal::StartupRequested);
            Ok(())
        }

        fn stop_loop(&self) {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn query_stats(&self, _tag: &str, _direction: &str) -> i64 {
            self.stats_per_query.load(Ordering::SeqCst)
        }

        fn measure_delay(&self, _url: &str) -> Result<i64, EngineError> {
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay < 0 {
                Err(EngineError::ProbeFailed("scripted failure".into()))
            } else {
                Ok(delay)
            }
        }
    }

    /// Scriptable protocol engine runtime.
    pub struct MockRuntime {
        pub controller: Arc<MockController>,
        pub fail_init: AtomicBool,
        /// Value returned by `measure_outbound_delay`; negative means Err
        pub outbound_delay_ms: AtomicI64,
        /// Every payload passed to `measure_outbound_delay`
        pub probed_with: Mutex<Vec<String>>,
    }

    impl MockRuntime {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                controller: MockController::new(),
                fail_init: AtomicBool::new(false),
                outbound_delay_ms: AtomicI64::new(80),
                probed_with: Mutex::new(Vec::new()),
            })
        }
    }

    impl EngineRuntime for MockRuntime {
        fn init_env(&self, _env: &EngineEnv) -> Result<(), EngineError> {
            if self.fail_init.load(Ordering::SeqCst) {
                return Err(EngineError::EnvSetup("scripted failure".into()));
            }
            Ok(())
        }

        fn new_controller(
            &self,
            signals: SignalSender,
        ) -> Result<Arc<dyn EngineController>, EngineError> {
            self.controller.attach_signals(signals);
            Ok(self.controller.clone())
        }

        fn measure_outbound_delay(
            &self,
            config_json: &str,
            _url: &str,
        ) -> Result<i64, EngineError> {
            self.probed_with.lock().unwrap().push(config_json.to_string());
            let delay = self.outbound_delay_ms.load(Ordering::SeqCst);
            if delay < 0 {
                Err(EngineError::ProbeFailed("scripted failure".into()))
            } else {
                Ok(delay)
            }
        }
    }

    /// Scriptable forwarding engine.
    pub struct MockForwarder {
        running: AtomicBool,
        pub fail_start: AtomicBool,
        /// (fd, socks_host, socks_port, mtu) of the last start call
        pub last_start: Mutex<Option<(i32, String, u16, u32)>>,
        pub stop_calls: AtomicI64,
    }

    impl MockForwarder {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                running: AtomicBool::new(false),
                fail_start: AtomicBool::new(false),
                last_start: Mutex::new(None),
                stop_calls: AtomicI64::new(0),
            })
        }
    }

    impl ForwardingEngine for MockForwarder {
        fn start(
            &self,
            fd: i32,
            socks_host: &str,
            socks_port: u16,
            mtu: u32,
            protector: Arc<dyn SocketProtector>,
        ) -> Result<(), ForwarderError> {
            *self.last_start.lock().unwrap() =
                Some((fd, socks_host.to_string(), socks_port, mtu));
            // The real forwarder protects its SOCKS-side socket.
            protector.protect(fd);
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(ForwarderError::StartFailed("scripted failure".into()));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn tx_bytes(&self) -> i64 {
            0
        }

        fn rx_bytes(&self) -> i64 {
            0
        }
    }

    /// Protector that records protected descriptors.
    pub struct MockProtector {
        pub protected: Mutex<Vec<i32>>,
    }

    impl MockProtector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                protected: Mutex::new(Vec::new()),
            })
        }
    }

    impl SocketProtector for MockProtector {
        fn protect(&self, fd: i32) -> bool {
            self.protected.lock().unwrap().push(fd);
            true
        }
    }
}
