//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use nearby_core::ServiceType;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/nearby/config.toml or /etc/nearby/config.toml.
/// Env overrides: NEARBY_DISPLAY_NAME, NEARBY_SERVICE_TYPE, NEARBY_DISCOVERY_PORT,
/// NEARBY_TRANSPORT_PORT, NEARBY_AUTO_ACCEPT, NEARBY_INVITE_TIMEOUT_SECS, NEARBY_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to other peers (default: host name).
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Discovery namespace; only peers with the same one see each other (default "my-app").
    #[serde(default)]
    pub service_type: ServiceType,
    /// Beacon multicast group (default 239.255.60.61).
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Invitation TCP port; 0 picks a free one and announces it (default 0).
    #[serde(default)]
    pub transport_port: u16,
    #[serde(default = "default_beacon_interval_secs")]
    pub beacon_interval_secs: u64,
    /// Silence after which a nearby peer is dropped (default 8).
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
    /// Bound on an outbound invitation (default 30). An inbound one waits at most 3/4 of it.
    #[serde(default = "default_invite_timeout_secs")]
    pub invite_timeout_secs: u64,
    /// Accept every inbound invitation without asking (default true).
    #[serde(default = "default_auto_accept")]
    pub auto_accept: bool,
    /// Default tracing filter when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_display_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "nearby-device".to_string())
}
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 60, 61)
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_beacon_interval_secs() -> u64 {
    2
}
fn default_peer_timeout_secs() -> u64 {
    8
}
fn default_invite_timeout_secs() -> u64 {
    30
}
fn default_auto_accept() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            service_type: ServiceType::default(),
            multicast_group: default_multicast_group(),
            discovery_port: default_discovery_port(),
            transport_port: 0,
            beacon_interval_secs: default_beacon_interval_secs(),
            peer_timeout_secs: default_peer_timeout_secs(),
            invite_timeout_secs: default_invite_timeout_secs(),
            auto_accept: default_auto_accept(),
            log_level: default_log_level(),
        }
    }
}

/// Config plus anything that was ignored while loading it. Logging is not up yet at load time,
/// so the caller reports these once the subscriber exists.
pub struct Loaded {
    pub config: Config,
    pub warnings: Vec<String>,
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Loaded {
    let mut warnings = Vec::new();
    let mut config = load_file(&mut warnings).unwrap_or_default();
    apply_env(&mut config, |key| std::env::var(key).ok(), &mut warnings);
    Loaded { config, warnings }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nearby/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearby/config.toml"));
    out
}

fn load_file(warnings: &mut Vec<String>) -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) => {
            warnings.push(format!("{}: {e}; using defaults", path.display()));
            return None;
        }
    };
    match parse(&text) {
        Ok(c) => Some(c),
        Err(e) => {
            warnings.push(format!("{}: {e}; using defaults", path.display()));
            None
        }
    }
}

fn parse(text: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(text)
}

fn apply_env<F>(c: &mut Config, var: F, warnings: &mut Vec<String>)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(s) = var("NEARBY_DISPLAY_NAME") {
        c.display_name = s;
    }
    if let Some(s) = var("NEARBY_SERVICE_TYPE") {
        match ServiceType::new(&s) {
            Ok(st) => c.service_type = st,
            Err(e) => warnings.push(format!("NEARBY_SERVICE_TYPE: {e}")),
        }
    }
    if let Some(s) = var("NEARBY_DISCOVERY_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.discovery_port = p,
            Err(_) => warnings.push(format!("NEARBY_DISCOVERY_PORT: not a port: {s:?}")),
        }
    }
    if let Some(s) = var("NEARBY_TRANSPORT_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.transport_port = p,
            Err(_) => warnings.push(format!("NEARBY_TRANSPORT_PORT: not a port: {s:?}")),
        }
    }
    if let Some(s) = var("NEARBY_AUTO_ACCEPT") {
        match parse_bool(&s) {
            Some(b) => c.auto_accept = b,
            None => warnings.push(format!("NEARBY_AUTO_ACCEPT: not a boolean: {s:?}")),
        }
    }
    if let Some(s) = var("NEARBY_INVITE_TIMEOUT_SECS") {
        match s.parse::<u64>() {
            Ok(secs) if secs > 0 => c.invite_timeout_secs = secs,
            _ => warnings.push(format!("NEARBY_INVITE_TIMEOUT_SECS: not a positive number: {s:?}")),
        }
    }
    if let Some(s) = var("NEARBY_LOG") {
        c.log_level = s;
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
