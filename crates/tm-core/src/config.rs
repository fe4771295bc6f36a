//! Configuration for Tool Meister programs.
//!
//! Values are layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. Optional TOML file (`$XDG_CONFIG_HOME/pbench/tool-meister.toml`)
//! 3. Environment (`PBENCH_REDIS_SERVER`, `benchmark_run_dir`, `_pbench_full_hostname`)
//! 4. Command-line flags, applied by each binary

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::channel::{ChannelNames, DEFAULT_CHANNEL_PREFIX};
use crate::error::{DomainError, DomainResult};

/// Default broker port ("One Tool", 0x17001).
pub const DEFAULT_BROKER_PORT: u16 = 17001;

/// Default broker host.
pub const DEFAULT_BROKER_HOST: &str = "localhost";

/// Default roster key.
pub const DEFAULT_ROSTER_KEY: &str = "tm-pids";

/// Default bound on waiting for the roster key, in seconds.
pub const DEFAULT_ROSTER_TIMEOUT_SECS: u64 = 5;

/// Environment variable naming an existing broker as `<host>[:<port>]`.
pub const ENV_BROKER: &str = "PBENCH_REDIS_SERVER";

/// Environment variable holding the benchmark run directory.
pub const ENV_RUN_DIR: &str = "benchmark_run_dir";

/// Environment variable holding this host's full hostname.
pub const ENV_HOSTNAME: &str = "_pbench_full_hostname";

/// Where the broker listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `<host>[:<port>]`, defaulting the port.
    pub fn parse(spec: &str) -> DomainResult<Self> {
        let invalid = || DomainError::InvalidFieldValue {
            field: "broker".to_string(),
            value: spec.to_string(),
            expected: "<host>[:<port>]".to_string(),
        };

        let spec = spec.trim();
        if spec.is_empty() {
            return Err(invalid());
        }
        match spec.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(invalid());
                }
                let port = port.parse::<u16>().map_err(|_| invalid())?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(spec, DEFAULT_BROKER_PORT)),
        }
    }
}

impl Default for BrokerAddress {
    fn default() -> Self {
        Self::new(DEFAULT_BROKER_HOST, DEFAULT_BROKER_PORT)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Configuration shared by the client and the participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmConfig {
    /// Broker location
    pub broker: BrokerAddress,

    /// Prefix for the command and status channel names
    pub channel_prefix: String,

    /// Key holding the participant roster
    pub roster_key: String,

    /// Benchmark run directory (holds `tm/redis_<port>.pid`)
    pub run_dir: Option<PathBuf>,

    /// This host's full hostname; discovered when unset
    pub hostname: Option<String>,

    /// How long the client waits for the roster key to appear
    pub roster_timeout_secs: u64,
}

impl Default for TmConfig {
    fn default() -> Self {
        Self {
            broker: BrokerAddress::default(),
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            roster_key: DEFAULT_ROSTER_KEY.to_string(),
            run_dir: None,
            hostname: None,
            roster_timeout_secs: DEFAULT_ROSTER_TIMEOUT_SECS,
        }
    }
}

impl TmConfig {
    /// Loads the layered configuration from the default file and the
    /// process environment.
    pub fn load() -> DomainResult<Self> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Default location of the configuration file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("pbench").join("tool-meister.toml"))
    }

    /// Reads a TOML configuration file.
    pub fn from_file(path: &Path) -> DomainResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| DomainError::Config {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml_str(&raw).map_err(|e| match e {
            DomainError::Config { reason, .. } => DomainError::Config {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Parses configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> DomainResult<Self> {
        toml::from_str(raw).map_err(|e| DomainError::Config {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })
    }

    /// Applies environment overrides using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> DomainResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(spec) = lookup(ENV_BROKER).filter(|s| !s.is_empty()) {
            self.broker = BrokerAddress::parse(&spec)?;
        }
        if let Some(dir) = lookup(ENV_RUN_DIR).filter(|s| !s.is_empty()) {
            self.run_dir = Some(PathBuf::from(dir));
        }
        if let Some(host) = lookup(ENV_HOSTNAME).filter(|s| !s.is_empty()) {
            self.hostname = Some(host);
        }
        Ok(())
    }

    /// Channel names derived from the configured prefix.
    pub fn channels(&self) -> ChannelNames {
        ChannelNames::with_prefix(&self.channel_prefix)
    }

    /// Bound on waiting for the roster key.
    pub fn roster_timeout(&self) -> Duration {
        Duration::from_secs(self.roster_timeout_secs)
    }

    /// This host's full hostname, falling back to the system hostname.
    pub fn resolved_hostname(&self) -> String {
        self.hostname
            .clone()
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Path of the broker's PID file inside the run directory, if known.
    pub fn broker_pid_file(&self) -> Option<PathBuf> {
        self.run_dir
            .as_ref()
            .map(|dir| dir.join("tm").join(format!("redis_{}.pid", self.broker.port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = TmConfig::default();
        assert_eq!(config.broker.to_string(), "localhost:17001");
        assert_eq!(config.roster_key, "tm-pids");
        assert_eq!(config.channels().command, "tool-meister-chan");
        assert!(config.broker_pid_file().is_none());
    }

    #[test]
    fn test_broker_address_parse() {
        assert_eq!(
            BrokerAddress::parse("redis.example.com:6379").unwrap(),
            BrokerAddress::new("redis.example.com", 6379)
        );
        assert_eq!(
            BrokerAddress::parse("ctl").unwrap(),
            BrokerAddress::new("ctl", DEFAULT_BROKER_PORT)
        );
        assert!(BrokerAddress::parse("ctl:notaport").is_err());
        assert!(BrokerAddress::parse(":80").is_err());
        assert!(BrokerAddress::parse("").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = TmConfig::default();
        config
            .apply_env(env_of(&[
                (ENV_BROKER, "ctl.example.com:17002"),
                (ENV_RUN_DIR, "/var/lib/pbench-agent/run1"),
                (ENV_HOSTNAME, "h1.example.com"),
            ]))
            .unwrap();
        assert_eq!(config.broker, BrokerAddress::new("ctl.example.com", 17002));
        assert_eq!(config.resolved_hostname(), "h1.example.com");
        assert_eq!(
            config.broker_pid_file().unwrap(),
            PathBuf::from("/var/lib/pbench-agent/run1/tm/redis_17002.pid")
        );
    }

    #[test]
    fn test_bad_env_broker_is_error() {
        let mut config = TmConfig::default();
        let result = config.apply_env(env_of(&[(ENV_BROKER, "host:99999")]));
        assert!(matches!(result, Err(DomainError::InvalidFieldValue { .. })));
    }

    #[test]
    fn test_toml_partial_file() {
        let config = TmConfig::from_toml_str(
            r#"
            channel_prefix = "bench"
            roster_timeout_secs = 30

            [broker]
            host = "10.0.0.5"
            port = 17001
            "#,
        )
        .unwrap();
        assert_eq!(config.channel_prefix, "bench");
        assert_eq!(config.roster_timeout(), Duration::from_secs(30));
        assert_eq!(config.broker.host, "10.0.0.5");
        assert_eq!(config.roster_key, DEFAULT_ROSTER_KEY);
    }

    #[test]
    fn test_from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool-meister.toml");
        std::fs::write(&path, "roster_timeout_secs = \"soon\"").unwrap();
        match TmConfig::from_file(&path) {
            Err(DomainError::Config { path: p, .. }) => assert!(p.ends_with("tool-meister.toml")),
            other => panic!("expected config error, got {other:?}"),
        }
    }
}
