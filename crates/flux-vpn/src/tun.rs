//! Virtual Interface Specification
//!
//! Pure computation of the routes, DNS servers, and excluded
//! applications to apply when establishing the tunnel's virtual
//! interface, plus the provider traits the platform implements.
//!
//! Per-entry parse failures never abort a build; they are collected
//! into a diagnostics list returned alongside the spec so callers and
//! tests can see what was skipped.

use crate::config::SessionConfig;
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// Fixed MTU of the virtual interface.
pub const TUN_MTU: u32 = 1500;

/// Statically assigned local address of the interface.
pub const TUN_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 2);

/// Prefix length of the interface address.
pub const TUN_PREFIX: u8 = 24;

/// Resolvers used when the engine payload carries no usable DNS block.
pub const FALLBACK_DNS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
];

/// One route applied to the virtual interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub address: IpAddr,
    pub prefix: u8,
}

impl Route {
    /// Route covering all IPv4 traffic.
    pub fn default_v4() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix: 0,
        }
    }

    /// Check if this is the all-traffic default route.
    pub fn is_default(&self) -> bool {
        self.prefix == 0
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// Everything the platform needs to establish the virtual interface.
/// Computed from a [`SessionConfig`], consumed exactly once per start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSpec {
    /// Session display name
    pub session_name: String,
    /// Interface MTU
    pub mtu: u32,
    /// Local interface address
    pub address: IpAddr,
    /// Prefix length of the local address
    pub address_prefix: u8,
    /// Routes delivered into the tunnel
    pub routes: Vec<Route>,
    /// DNS servers configured on the interface
    pub dns_servers: Vec<IpAddr>,
    /// Application ids excluded from the tunnel (the host app first)
    pub disallowed_apps: Vec<String>,
}

/// A per-entry failure encountered while building an [`InterfaceSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildDiagnostic {
    /// Bypass subnet entry skipped
    InvalidSubnet { entry: String, reason: String },
    /// DNS server entry skipped
    InvalidDnsEntry { entry: String },
    /// `dns.servers` absent or payload not parseable; fallback applied
    DnsFallback,
}

impl std::fmt::Display for BuildDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildDiagnostic::InvalidSubnet { entry, reason } => {
                write!(f, "skipped bypass subnet {:?}: {}", entry, reason)
            }
            BuildDiagnostic::InvalidDnsEntry { entry } => {
                write!(f, "skipped DNS entry {:?}", entry)
            }
            BuildDiagnostic::DnsFallback => {
                write!(f, "no usable dns.servers block, using fallback resolvers")
            }
        }
    }
}

/// Builds [`InterfaceSpec`]s from session configs.
///
/// Stateless apart from the host application's own id, which is always
/// excluded from the tunnel so host traffic cannot loop back into it.
#[derive(Debug, Clone)]
pub struct TunnelInterfaceBuilder {
    own_app_id: String,
}

impl TunnelInterfaceBuilder {
    pub fn new(own_app_id: impl Into<String>) -> Self {
        Self {
            own_app_id: own_app_id.into(),
        }
    }

    /// Compute the interface spec for one session start.
    pub fn build(&self, config: &SessionConfig) -> (InterfaceSpec, Vec<BuildDiagnostic>) {
        let mut diagnostics = Vec::new();

        let routes = self.build_routes(&config.bypass_subnets, &mut diagnostics);
        let dns_servers = extract_dns_servers(&config.config_json, &mut diagnostics);

        let mut disallowed_apps = Vec::with_capacity(config.blocked_apps.len() + 1);
        disallowed_apps.push(self.own_app_id.clone());
        for app in &config.blocked_apps {
            if !disallowed_apps.contains(app) {
                disallowed_apps.push(app.clone());
            }
        }

        let spec = InterfaceSpec {
            session_name: config.remark.clone(),
            mtu: TUN_MTU,
            address: IpAddr::V4(TUN_ADDRESS),
            address_prefix: TUN_PREFIX,
            routes,
            dns_servers,
            disallowed_apps,
        };

        for diag in &diagnostics {
            debug!("interface build: {}", diag);
        }

        (spec, diagnostics)
    }

    fn build_routes(
        &self,
        bypass_subnets: &[String],
        diagnostics: &mut Vec<BuildDiagnostic>,
    ) -> Vec<Route> {
        if bypass_subnets.is_empty() {
            return vec![Route::default_v4()];
        }

        let mut routes = Vec::with_capacity(bypass_subnets.len());
        for entry in bypass_subnets {
            match parse_subnet(entry) {
                Ok(route) => routes.push(route),
                Err(reason) => diagnostics.push(BuildDiagnostic::InvalidSubnet {
                    entry: entry.clone(),
                    reason,
                }),
            }
        }
        routes
    }
}

/// Parse one "address/prefix" bypass entry.
fn parse_subnet(entry: &str) -> Result<Route, String> {
    let parts: Vec<&str> = entry.split('/').collect();
    if parts.len() != 2 {
        return Err("expected address/prefix".to_string());
    }

    let address: IpAddr = parts[0]
        .parse()
        .map_err(|_| format!("invalid address {:?}", parts[0]))?;
    let prefix: u8 = parts[1]
        .parse()
        .map_err(|_| format!("invalid prefix {:?}", parts[1]))?;

    let max_prefix = match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max_prefix {
        return Err(format!("prefix {} out of range", prefix));
    }

    Ok(Route { address, prefix })
}

/// Pull DNS servers out of the engine payload's `dns.servers` array.
///
/// Entries are accepted as bare address strings or as objects carrying
/// an `address` field. If the block is absent, the payload does not
/// parse, or no entry is usable, the fixed fallback resolvers are
/// returned instead.
fn extract_dns_servers(config_json: &str, diagnostics: &mut Vec<BuildDiagnostic>) -> Vec<IpAddr> {
    let servers = serde_json::from_str::<Value>(config_json)
        .ok()
        .as_ref()
        .and_then(|v| v.get("dns"))
        .and_then(|dns| dns.get("servers"))
        .and_then(|s| s.as_array())
        .map(|entries| {
            let mut servers = Vec::with_capacity(entries.len());
            for entry in entries {
                match dns_entry_address(entry) {
                    Some(addr) => servers.push(addr),
                    None => diagnostics.push(BuildDiagnostic::InvalidDnsEntry {
                        entry: entry.to_string(),
                    }),
                }
            }
            servers
        })
        .unwrap_or_default();

    if servers.is_empty() {
        diagnostics.push(BuildDiagnostic::DnsFallback);
        return FALLBACK_DNS.to_vec();
    }
    servers
}

fn dns_entry_address(entry: &Value) -> Option<IpAddr> {
    let raw = match entry {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => obj.get("address")?.as_str()?,
        _ => return None,
    };
    raw.parse().ok()
}

/// Tunnel interface errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TunError {
    #[error("Permission to establish a virtual interface was not granted")]
    PermissionDenied,

    #[error("Failed to establish virtual interface: {0}")]
    EstablishFailed(String),
}

/// Established virtual interface handle. The session host owns exactly
/// one of these while running.
pub trait VirtualInterface: Send {
    /// Raw descriptor handed to the forwarding engine.
    fn raw_fd(&self) -> i32;

    /// Close the interface. Idempotent.
    fn close(&mut self);
}

/// Platform hook that turns an [`InterfaceSpec`] into a live interface.
pub trait TunProvider: Send + Sync {
    /// Whether the user has granted permission to establish the
    /// interface. No prompting happens here.
    fn prepare(&self) -> bool;

    /// Establish the interface described by `spec`. Failures to apply
    /// individual app exclusions are swallowed by the platform; only a
    /// failure to establish the interface itself is an error.
    fn establish(&self, spec: &InterfaceSpec) -> Result<Box<dyn VirtualInterface>, TunError>;
}
