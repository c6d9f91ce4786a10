//! VPN Session Host
//!
//! Externally visible session host: consumes [`SessionCommand`]s from
//! a single queue, drives the lifecycle manager, establishes the
//! virtual interface, and bridges its descriptor to the local SOCKS
//! endpoint through the forwarding engine.
//!
//! The command queue is the only serialization point for start/stop;
//! commands are processed strictly one at a time. Engine-issued
//! lifecycle requests arrive on the signal channel and are handled on
//! the same loop.

use crate::config::SessionConfig;
use crate::engine::{
    EngineEnv, EngineRuntime, EngineSignal, ForwardingEngine, SignalReceiver, SocketProtector,
};
use crate::events::{DelayMeasuredEvent, EventBus, SessionEvent};
use crate::manager::SessionLifecycleManager;
use crate::tun::{TunProvider, TunnelInterfaceBuilder, VirtualInterface};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Host address the forwarding engine bridges to.
const SOCKS_HOST: &str = "127.0.0.1";

/// Commands accepted by the session host.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Start (or restart) a session with the given configuration
    Start(SessionConfig),
    /// Tear the active session down
    Stop,
    /// Probe the connected server; result arrives as a
    /// [`DelayMeasuredEvent`]
    MeasureDelay,
}

/// Sending half of the host's command queue.
pub type CommandSender = mpsc::UnboundedSender<SessionCommand>;

/// Ongoing-notification side effect, interface only. The embedder
/// renders the notification; the host only says when.
pub trait Notifier: Send + Sync {
    /// Present the ongoing-session notification.
    fn present_ongoing(&self, title: &str, icon: &str, disconnect_label: &str);

    /// Remove the ongoing-session notification.
    fn clear(&self);
}

/// Notifier that does nothing, for embedders without notifications.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn present_ongoing(&self, _title: &str, _icon: &str, _disconnect_label: &str) {}
    fn clear(&self) {}
}

/// Host-level settings, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct HostSettings {
    /// Our own application id, always excluded from the tunnel
    pub app_id: String,
    /// Engine runtime environment
    pub engine_env: EngineEnv,
    /// URL probed by [`SessionCommand::MeasureDelay`]
    pub delay_probe_url: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            app_id: "com.fluxvpn.app".to_string(),
            engine_env: EngineEnv::default(),
            delay_probe_url: "https://www.google.com/generate_204".to_string(),
        }
    }
}

/// Owns the virtual-interface handle and the forwarding engine for the
/// single active session, and runs the command loop.
pub struct VpnSessionHost {
    settings: HostSettings,
    manager: Arc<SessionLifecycleManager>,
    forwarder: Arc<dyn ForwardingEngine>,
    tun: Arc<dyn TunProvider>,
    notifier: Arc<dyn Notifier>,
    protector: Arc<dyn SocketProtector>,
    builder: TunnelInterfaceBuilder,
    bus: EventBus,
    interface: Option<Box<dyn VirtualInterface>>,
    active: Option<SessionConfig>,
    running: bool,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    signals: SignalReceiver,
    signals_open: bool,
}

impl VpnSessionHost {
    /// Create the host and its command queue. The engine environment
    /// is initialized here; if that fails the host still runs, but
    /// start commands are rejected until the engine becomes available.
    pub fn new(
        settings: HostSettings,
        runtime: Arc<dyn EngineRuntime>,
        forwarder: Arc<dyn ForwardingEngine>,
        tun: Arc<dyn TunProvider>,
        notifier: Arc<dyn Notifier>,
        protector: Arc<dyn SocketProtector>,
        bus: EventBus,
    ) -> (Self, CommandSender) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(SessionLifecycleManager::new(runtime, bus.clone()));
        if let Err(e) = manager.initialize(&settings.engine_env, signal_tx) {
            error!("engine initialization failed: {}", e);
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let builder = TunnelInterfaceBuilder::new(settings.app_id.clone());

        let host = Self {
            settings,
            manager,
            forwarder,
            tun,
            notifier,
            protector,
            builder,
            bus,
            interface: None,
            active: None,
            running: false,
            commands: command_rx,
            signals: signal_rx,
            signals_open: true,
        };
        (host, command_tx)
    }

    /// Lifecycle manager handle, for embedders that query state or
    /// probe delays directly.
    pub fn manager(&self) -> Arc<SessionLifecycleManager> {
        self.manager.clone()
    }

    /// Whether the forwarding path is currently established.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Run the command loop until the command queue closes. The active
    /// session, if any, is torn down on exit.
    pub async fn run(mut self) {
        info!("session host running");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Start(config)) => self.handle_start(config),
                    Some(SessionCommand::Stop) => self.teardown(),
                    Some(SessionCommand::MeasureDelay) => self.handle_measure_delay(),
                    None => {
                        debug!("command queue closed");
                        self.teardown();
                        break;
                    }
                },
                signal = self.signals.recv(), if self.signals_open => match signal {
                    Some(signal) => self.handle_signal(signal),
                    None => self.signals_open = false,
                },
            }
        }
        info!("session host stopped");
    }

    fn handle_start(&mut self, config: SessionConfig) {
        if let Err(e) = config.validate() {
            error!("start rejected: {}", e);
            return;
        }

        self.active = Some(config.clone());
        match self.manager.start(&config) {
            Ok(()) => {
                if self.manager.is_running() {
                    self.notifier.present_ongoing(
                        &config.remark,
                        &config.icon,
                        &config.disconnect_button_label,
                    );
                }
            }
            Err(e) => {
                error!("session start failed: {}", e);
                self.teardown();
            }
        }
    }

    fn handle_signal(&mut self, signal: EngineSignal) {
        match signal {
            EngineSignal::StartupRequested => self.setup(),
            EngineSignal::ShutdownRequested => {
                info!("engine requested shutdown");
                self.teardown();
            }
            EngineSignal::Status { code, message } => {
                debug!("engine status => {}: {}", code, message);
            }
        }
    }

    /// Establish the virtual interface and start the forwarding
    /// engine. Runs when the engine requests startup.
    fn setup(&mut self) {
        let Some(config) = self.active.clone() else {
            warn!("startup requested with no active config");
            return;
        };

        // Consent must have been obtained beforehand; no prompting here.
        if !self.tun.prepare() {
            warn!("virtual-interface permission not granted, aborting setup");
            return;
        }

        let (spec, diagnostics) = self.builder.build(&config);
        for diagnostic in &diagnostics {
            warn!("interface build: {}", diagnostic);
        }

        if let Some(mut previous) = self.interface.take() {
            previous.close();
        }

        let interface = match self.tun.establish(&spec) {
            Ok(interface) => interface,
            Err(e) => {
                error!("failed to establish virtual interface: {}", e);
                self.teardown();
                return;
            }
        };
        let fd = interface.raw_fd();
        self.interface = Some(interface);
        info!("virtual interface established (fd {})", fd);

        if let Err(e) = self.forwarder.start(
            fd,
            SOCKS_HOST,
            config.socks_port,
            spec.mtu,
            self.protector.clone(),
        ) {
            error!("forwarding engine failed to start: {}", e);
            self.teardown();
            return;
        }

        self.running = true;
        info!("forwarding engine started ({})", config.socks_url());
    }

    /// Best-effort teardown: every step runs regardless of the others.
    fn teardown(&mut self) {
        debug!(
            "tearing session down (forwarder tx={} rx={})",
            self.forwarder.tx_bytes(),
            self.forwarder.rx_bytes()
        );

        self.forwarder.stop();
        self.manager.stop();
        self.notifier.clear();
        if let Some(mut interface) = self.interface.take() {
            interface.close();
        }

        self.running = false;
        self.active = None;
    }

    /// Probe the connected server off the command loop; the blocking
    /// probe must not delay start/stop processing.
    fn handle_measure_delay(&self) {
        let manager = self.manager.clone();
        let bus = self.bus.clone();
        let url = self.settings.delay_probe_url.clone();

        tokio::spawn(async move {
            let delay_ms = tokio::task::spawn_blocking(move || manager.measure_delay(&url))
                .await
                .unwrap_or(-1);
            bus.publish(SessionEvent::DelayMeasured(DelayMeasuredEvent { delay_ms }));
        });
    }
}
