//! Configuration resolution for kitemux.
//!
//! Resolution order (lowest to highest priority):
//! 1. Built-in defaults
//! 2. Config file (`--config`, or `~/.config/kitemux/config.json`)
//! 3. Environment variables (`KITEMUX_*`)
//! 4. CLI arguments, applied by the daemon binary

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::kite::Kite;

/// Minimum number of kite slots.
pub const MIN_KITE_ALLOC: usize = 4;
/// Minimum number of frontend/tunnel slots.
pub const MIN_FE_ALLOC: usize = 2;
/// Minimum number of backend connection slots.
pub const MIN_CONN_ALLOC: usize = 16;

/// Minimum seconds between housekeeping passes.
pub const HOUSEKEEPING_INTERVAL_MIN: u64 = 57;
/// Ceiling for the exponential tick backoff, in seconds.
pub const HOUSEKEEPING_INTERVAL_MAX: u64 = 900;
/// Seconds between full "check the world" passes.
pub const CHECK_WORLD_INTERVAL: u64 = 1800;

/// A frontend relay candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontendSpec {
    pub host: String,
    pub port: u16,
    /// Always keep a tunnel to this frontend, regardless of latency.
    #[serde(default)]
    pub nailed_up: bool,
}

impl FrontendSpec {
    /// Parse `host:port`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (host, port) = spec
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("frontend {spec:?} is not host:port")))?;
        let port = port
            .parse()
            .map_err(|_| Error::Config(format!("bad frontend port in {spec:?}")))?;
        if host.is_empty() {
            return Err(Error::Config(format!("empty frontend host in {spec:?}")));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            nailed_up: false,
        })
    }
}

/// Complete manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Kite table capacity.
    pub max_kites: usize,
    /// Tunnel (frontend) table capacity.
    pub max_tunnels: usize,
    /// Backend connection pool capacity.
    pub max_conns: usize,
    pub housekeeping_interval_min_secs: u64,
    pub housekeeping_interval_max_secs: u64,
    pub check_world_interval_secs: u64,
    /// Frontends to keep connected in addition to the fastest one.
    pub spare_frontends: usize,
    /// URL template with three `%s` slots: domain, address list, signature.
    pub dynamic_dns_url: Option<String>,
    /// Evict the idlest backend connection when the pool is full and it has
    /// been idle this long. Zero disables eviction.
    pub conn_eviction_idle_secs: u64,
    /// Use random latencies instead of probing frontends.
    pub fake_ping: bool,
    /// Keep the housekeeping timer running even when healthy.
    pub enable_timer: bool,
    /// Blocking worker threads. Zero disables background housekeeping; the
    /// embedding application then drives reconnects itself.
    pub workers: usize,
    /// Wrap HTML rejection pages in the pagekite.net frame.
    pub fancy_rejection: bool,
    /// Short application id shown on rejection pages.
    pub app_id: String,
    pub log_level: String,
    pub kites: Vec<Kite>,
    pub frontends: Vec<FrontendSpec>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_kites: MIN_KITE_ALLOC,
            max_tunnels: MIN_FE_ALLOC,
            max_conns: MIN_CONN_ALLOC,
            housekeeping_interval_min_secs: HOUSEKEEPING_INTERVAL_MIN,
            housekeeping_interval_max_secs: HOUSEKEEPING_INTERVAL_MAX,
            check_world_interval_secs: CHECK_WORLD_INTERVAL,
            spare_frontends: 0,
            dynamic_dns_url: None,
            conn_eviction_idle_secs: 0,
            fake_ping: false,
            enable_timer: true,
            workers: 1,
            fancy_rejection: true,
            app_id: "kitemux".to_string(),
            log_level: "info".to_string(),
            kites: Vec::new(),
            frontends: Vec::new(),
        }
    }
}

impl ManagerConfig {
    /// Clamp capacities to their minimums and check interval bounds.
    pub fn validate(mut self) -> Result<Self> {
        self.max_kites = self.max_kites.max(MIN_KITE_ALLOC).max(self.kites.len());
        self.max_tunnels = self.max_tunnels.max(MIN_FE_ALLOC);
        self.max_conns = self.max_conns.max(MIN_CONN_ALLOC);
        if self.housekeeping_interval_min_secs == 0 {
            return Err(Error::Config(
                "housekeeping_interval_min_secs must be positive".into(),
            ));
        }
        if self.housekeeping_interval_max_secs < self.housekeeping_interval_min_secs {
            return Err(Error::Config(format!(
                "housekeeping interval max ({}) below min ({})",
                self.housekeeping_interval_max_secs, self.housekeeping_interval_min_secs
            )));
        }
        if let Some(url) = &self.dynamic_dns_url
            && url.matches("%s").count() != 3
        {
            return Err(Error::Config(format!(
                "dynamic_dns_url needs three %s slots: {url}"
            )));
        }
        Ok(self)
    }

    pub const fn housekeeping_interval_min(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_min_secs)
    }

    pub const fn housekeeping_interval_max(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_max_secs)
    }

    pub const fn check_world_interval(&self) -> Duration {
        Duration::from_secs(self.check_world_interval_secs)
    }

    /// `None` when eviction is disabled.
    pub const fn eviction_idle(&self) -> Option<Duration> {
        if self.conn_eviction_idle_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.conn_eviction_idle_secs))
        }
    }
}

/// Load configuration from `path` (or the default location), then apply
/// environment overrides and validate.
pub fn load_config(path: Option<&Path>) -> Result<ManagerConfig> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => ManagerConfig::default(),
        },
    };
    apply_env_overrides(&mut config);
    config.validate()
}

/// Default config file location.
pub fn global_config_path() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        .map(|p| p.join("kitemux").join("config.json"))
}

fn load_config_file(path: &Path) -> Result<ManagerConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut ManagerConfig) {
    if let Ok(val) = std::env::var("KITEMUX_DDNS_URL") {
        config.dynamic_dns_url = Some(val);
    }
    if let Ok(val) = std::env::var("KITEMUX_SPARE_FRONTENDS")
        && let Ok(n) = val.parse()
    {
        config.spare_frontends = n;
    }
    if let Ok(val) = std::env::var("KITEMUX_WORKERS")
        && let Ok(n) = val.parse()
    {
        config.workers = n;
    }
    if let Ok(val) = std::env::var("KITEMUX_EVICTION_IDLE_SECS")
        && let Ok(n) = val.parse()
    {
        config.conn_eviction_idle_secs = n;
    }
    if let Ok(val) = std::env::var("KITEMUX_FAKE_PING") {
        config.fake_ping = matches!(val.as_str(), "1" | "true" | "yes");
    }
    if let Ok(val) = std::env::var("KITEMUX_LOG_LEVEL") {
        config.log_level = val;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_respect_minimums() {
        let config = ManagerConfig::default().validate().unwrap();
        assert_eq!(config.max_kites, MIN_KITE_ALLOC);
        assert_eq!(config.max_tunnels, MIN_FE_ALLOC);
        assert_eq!(config.max_conns, MIN_CONN_ALLOC);
        assert!(config.eviction_idle().is_none());
        assert!(config.enable_timer);
    }

    #[test]
    fn small_capacities_are_clamped() {
        let config = ManagerConfig {
            max_kites: 1,
            max_tunnels: 0,
            max_conns: 3,
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(config.max_kites, MIN_KITE_ALLOC);
        assert_eq!(config.max_tunnels, MIN_FE_ALLOC);
        assert_eq!(config.max_conns, MIN_CONN_ALLOC);
    }

    #[test]
    fn ddns_url_needs_three_slots() {
        let bad = ManagerConfig {
            dynamic_dns_url: Some("http://up.example.com/?host=%s".into()),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let good = ManagerConfig {
            dynamic_dns_url: Some("http://up.example.com/?hostname=%s&myip=%s&sign=%s".into()),
            ..Default::default()
        };
        assert!(good.validate().is_ok());
    }

    #[test]
    fn inverted_intervals_rejected() {
        let config = ManagerConfig {
            housekeeping_interval_min_secs: 100,
            housekeeping_interval_max_secs: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "max_conns": 64,
                "spare_frontends": 1,
                "kites": [{{
                    "protocol": "http",
                    "public_domain": "x.example.com",
                    "secret": "s",
                    "local_domain": "localhost",
                    "local_port": 8080
                }}],
                "frontends": [{{"host": "fe.example.com", "port": 443}}]
            }}"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.max_conns, 64);
        assert_eq!(config.spare_frontends, 1);
        assert_eq!(config.kites.len(), 1);
        assert_eq!(config.kites[0].public_port, 0);
        assert_eq!(config.frontends[0].port, 443);
        assert!(!config.frontends[0].nailed_up);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/kitemux.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn frontend_spec_parse() {
        let fe = FrontendSpec::parse("fe.example.com:443").unwrap();
        assert_eq!(fe.host, "fe.example.com");
        assert_eq!(fe.port, 443);
        assert!(FrontendSpec::parse("fe.example.com").is_err());
        assert!(FrontendSpec::parse(":443").is_err());
    }
}
