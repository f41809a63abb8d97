//! Load config from file, environment and command line.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;

use partyline_core::OverlayConfig;

/// Daemon configuration. File: ~/.config/partyline/config.toml or /etc/partyline/config.toml.
/// Env overrides: PARTYLINE_PORT, PARTYLINE_ADVERTISE_IP, PARTYLINE_BOOTSTRAP, PARTYLINE_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port (default 0x0dab).
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,
    /// Address other nodes reach us at; goes into the bootstrap token.
    #[serde(default = "default_advertise_ip")]
    pub advertise_ip: IpAddr,
    /// Bootstrap token to join through at startup.
    #[serde(default)]
    pub bootstrap: Option<String>,
    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_port() -> u16 {
    0x0dab
}
fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_advertise_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
fn default_liveness_interval_secs() -> u64 {
    partyline_core::config::DEFAULT_LIVENESS_INTERVAL_MS / 1000
}
fn default_stale_after_secs() -> u64 {
    partyline_core::config::DEFAULT_STALE_AFTER_MS / 1000
}
fn default_log_filter() -> String {
    "partyline=info".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_ip: default_bind_ip(),
            advertise_ip: default_advertise_ip(),
            bootstrap: None,
            liveness_interval_secs: default_liveness_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Core tunables derived from this config.
    pub fn overlay(&self) -> OverlayConfig {
        OverlayConfig {
            liveness_interval_ms: self.liveness_interval_secs.max(1) * 1000,
            stale_after_ms: self.stale_after_secs.max(1) * 1000,
            ..OverlayConfig::default()
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
/// A config file that exists but cannot be used is reported in the second
/// value; defaults apply in its place.
pub fn load() -> (Config, Option<String>) {
    let (mut c, problem) = match load_file(&config_paths()) {
        Ok(c) => (c.unwrap_or_default(), None),
        Err(problem) => (Config::default(), Some(problem)),
    };
    apply_env(&mut c, |name| std::env::var(name).ok());
    (c, problem)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = parsed(var("PARTYLINE_PORT")) {
        c.port = p;
    }
    if let Some(ip) = parsed(var("PARTYLINE_ADVERTISE_IP")) {
        c.advertise_ip = ip;
    }
    if let Some(token) = var("PARTYLINE_BOOTSTRAP").filter(|s| !s.trim().is_empty()) {
        c.bootstrap = Some(token);
    }
    if let Some(filter) = var("PARTYLINE_LOG") {
        c.log_filter = filter;
    }
}

fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|s| s.trim().parse().ok())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/partyline/config.toml"));
    }
    out.push(PathBuf::from("/etc/partyline/config.toml"));
    out
}

/// First existing file wins; later paths are not consulted.
fn load_file(paths: &[PathBuf]) -> Result<Option<Config>, String> {
    let Some(p) = paths.iter().find(|p| p.exists()) else {
        return Ok(None);
    };
    let s = std::fs::read_to_string(p).map_err(|e| format!("{}: {e}", p.display()))?;
    toml::from_str::<Config>(&s)
        .map(Some)
        .map_err(|e| format!("{}: {e}", p.display()))
}
