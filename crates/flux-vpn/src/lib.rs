//! Flux VPN - Tunnel Session Orchestration
//!
//! Manages the lifecycle of a single local VPN/proxy tunnel session:
//! starts and stops the opaque protocol engine, establishes the
//! virtual network interface, bridges its descriptor to a local SOCKS
//! endpoint through the packet-forwarding engine, and publishes
//! connection state and traffic statistics to observers.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      VpnSessionHost                        │
//! │   command queue ──▶ start / stop / measure-delay           │
//! │        │                                                   │
//! │        ▼                                                   │
//! │  SessionLifecycleManager ──▶ Protocol Engine (opaque)      │
//! │        │        ▲                  │                       │
//! │   StatsTimer    └── signal channel ┘                       │
//! │        │                                                   │
//! │        ▼                                                   │
//! │     EventBus ──▶ observers (state + traffic snapshots)     │
//! │                                                            │
//! │  TunnelInterfaceBuilder ──▶ virtual interface fd           │
//! │                                  │                         │
//! │                                  ▼                         │
//! │  Forwarding Engine (opaque) ──▶ SOCKS 127.0.0.1:port       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **At most one active session** per host; `start` on a running
//!   session restarts it, `stop` is always safe to call.
//! - **Best-effort teardown**: every teardown step runs even when an
//!   earlier one fails.
//! - **Non-blocking observation**: event publishing never stalls the
//!   stats timer; slow subscribers lose events instead.
//! - **Graceful degradation**: a missing engine turns probes into a
//!   −1 sentinel and starts into explicit errors, never panics.

mod config;
mod engine;
mod events;
mod host;
mod manager;
mod stats;
mod tun;

pub use config::{ConfigError, DEFAULT_SOCKS_PORT, SessionConfig};
pub use engine::{
    DIRECTION_DOWNLINK, DIRECTION_UPLINK, EngineController, EngineEnv, EngineError, EngineRuntime,
    EngineSignal, ForwarderError, ForwardingEngine, SignalReceiver, SignalSender, SocketProtector,
    TRAFFIC_TAGS,
};
pub use events::{
    ConnectionInfoEvent, ConnectionState, DelayMeasuredEvent, EventBus, SessionEvent,
};
pub use host::{
    CommandSender, HostSettings, NoopNotifier, Notifier, SessionCommand, VpnSessionHost,
};
pub use manager::{ManagerError, SessionLifecycleManager};
pub use stats::SessionStats;
pub use tun::{
    BuildDiagnostic, FALLBACK_DNS, InterfaceSpec, Route, TUN_ADDRESS, TUN_MTU, TUN_PREFIX,
    TunError, TunProvider, TunnelInterfaceBuilder, VirtualInterface,
};
