use crate::address::BackendAddress;
use crate::probe::ProbeConfig;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener and dispatch settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Default settings shared by all backends
    #[serde(default)]
    pub defaults: BackendDefaults,

    /// Backends in registration order (ties in load go to the earliest)
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address", alias = "host")]
    pub bind: String,

    /// Listen port (default: 3000, 0 picks an ephemeral port)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Seconds to wait after launching backends before accepting connections
    #[serde(default)]
    pub startup_delay_secs: u64,

    /// Delay before re-dispatching a connection nobody could take (milliseconds)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Fixed reply for connections that arrive before any backend is ready.
    /// When unset, such connections are queued and retried instead.
    pub rejection_data: Option<String>,
}

impl ServerConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn rejection_payload(&self) -> Option<Vec<u8>> {
        self.rejection_data.as_ref().map(|data| data.as_bytes().to_vec())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            startup_delay_secs: 0,
            retry_delay_ms: default_retry_delay(),
            rejection_data: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendDefaults {
    /// Seconds a backend may take to accept its first connection.
    /// Unset means probe indefinitely.
    pub startup_timeout_secs: Option<u64>,

    /// Backoff between readiness probe attempts in milliseconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Upper bound on a single probe connection attempt in milliseconds
    #[serde(default = "default_probe_connect_timeout")]
    pub probe_connect_timeout_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for BackendDefaults {
    fn default() -> Self {
        Self {
            startup_timeout_secs: None,
            probe_interval_ms: default_probe_interval(),
            probe_connect_timeout_ms: default_probe_connect_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

/// Configuration for a single backend
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// proxy. Configuration files must only be writable by trusted users.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Where the backend listens once it has booted
    #[serde(alias = "socket")]
    pub address: BackendAddress,

    /// Command that starts the backend. Without one the backend is assumed
    /// to be managed elsewhere and is only probed.
    pub command: Option<String>,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Startup timeout in seconds (overrides default)
    pub startup_timeout_secs: Option<u64>,

    /// Probe backoff in milliseconds (overrides default)
    pub probe_interval_ms: Option<u64>,

    /// Grace period in seconds between SIGTERM and SIGKILL (overrides default)
    pub shutdown_grace_period_secs: Option<u64>,
}

impl BackendConfig {
    /// A backend started by running `command`
    pub fn local(command: &str, address: BackendAddress) -> Self {
        Self {
            command: Some(command.to_string()),
            ..Self::external(address)
        }
    }

    /// A backend started by someone else; only its address is probed
    pub fn external(address: BackendAddress) -> Self {
        Self {
            address,
            command: None,
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            startup_timeout_secs: None,
            probe_interval_ms: None,
            shutdown_grace_period_secs: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn is_external(&self) -> bool {
        self.command.is_none()
    }

    pub fn startup_timeout(&self, defaults: &BackendDefaults) -> Option<Duration> {
        self.startup_timeout_secs
            .or(defaults.startup_timeout_secs)
            .map(Duration::from_secs)
    }

    pub fn probe_interval(&self, defaults: &BackendDefaults) -> Duration {
        Duration::from_millis(self.probe_interval_ms.unwrap_or(defaults.probe_interval_ms))
    }

    pub fn shutdown_grace_period(&self, defaults: &BackendDefaults) -> Duration {
        Duration::from_secs(
            self.shutdown_grace_period_secs
                .unwrap_or(defaults.shutdown_grace_period_secs),
        )
    }

    /// Readiness probe settings for this backend
    pub fn probe_config(&self, defaults: &BackendDefaults) -> ProbeConfig {
        ProbeConfig {
            interval: self.probe_interval(defaults),
            timeout: self.startup_timeout(defaults),
            connect_timeout: Duration::from_millis(defaults.probe_connect_timeout_ms),
        }
    }

    /// Validate the backend configuration
    pub fn validate(&self, index: usize) -> Result<(), String> {
        if let Some(ref command) = self.command {
            if command.trim().is_empty() {
                return Err(format!("Backend #{}: 'command' must not be empty", index));
            }
        }

        if self.probe_interval_ms == Some(0) {
            return Err(format!(
                "Backend #{}: 'probe_interval_ms' must be greater than 0",
                index
            ));
        }

        if !self.address.is_supported() {
            return Err(format!(
                "Backend #{}: address {} is not supported on this platform",
                index, self.address
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_retry_delay() -> u64 {
    1000 // 1 second between dispatch retries
}

fn default_probe_interval() -> u64 {
    5000 // 5 seconds between probe attempts
}

fn default_probe_connect_timeout() -> u64 {
    2000
}

fn default_shutdown_grace_period() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.backends.is_empty() {
            errors.push("At least one backend must be configured".to_string());
        }

        if self.defaults.probe_interval_ms == 0 {
            errors.push("'defaults.probe_interval_ms' must be greater than 0".to_string());
        }

        let mut seen = HashSet::new();
        for (i, backend) in self.backends.iter().enumerate() {
            let index = i + 1;
            if let Err(e) = backend.validate(index) {
                errors.push(e);
            }
            if !seen.insert(&backend.address) {
                errors.push(format!(
                    "Backend #{}: address {} is used by another backend",
                    index, backend.address
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
startup_delay_secs = 3
retry_delay_ms = 250
rejection_data = "BUSY"

[defaults]
startup_timeout_secs = 60
probe_interval_ms = 1000
shutdown_grace_period_secs = 4

[[backends]]
address = "/tmp/web.1.sock"
command = "bundle"
args = ["exec", "thin", "start", "--socket", "/tmp/web.1.sock"]
working_dir = "/app"

[backends.env]
RACK_ENV = "production"

[[backends]]
address = "127.0.0.1:9002"
startup_timeout_secs = 10
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.startup_delay(), Duration::from_secs(3));
        assert_eq!(config.server.retry_delay(), Duration::from_millis(250));
        assert_eq!(config.server.rejection_payload(), Some(b"BUSY".to_vec()));

        assert_eq!(config.backends.len(), 2);
        let first = &config.backends[0];
        assert_eq!(first.address, BackendAddress::Unix(PathBuf::from("/tmp/web.1.sock")));
        assert_eq!(first.command.as_deref(), Some("bundle"));
        assert_eq!(first.args.len(), 5);
        assert_eq!(first.working_dir.as_deref(), Some("/app"));
        assert_eq!(first.env.get("RACK_ENV"), Some(&"production".to_string()));

        let second = &config.backends[1];
        assert!(second.is_external());
        assert_eq!(
            second.startup_timeout(&config.defaults),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.startup_delay(), Duration::ZERO);
        assert_eq!(config.retry_delay(), Duration::from_secs(1));
        assert!(config.rejection_payload().is_none());
    }

    #[test]
    fn test_default_backend_defaults() {
        let defaults = BackendDefaults::default();
        assert_eq!(defaults.startup_timeout_secs, None);
        assert_eq!(defaults.probe_interval_ms, 5000);
        assert_eq!(defaults.probe_connect_timeout_ms, 2000);
        assert_eq!(defaults.shutdown_grace_period_secs, 10);
    }

    #[test]
    fn test_backend_config_uses_defaults() {
        let defaults = BackendDefaults {
            startup_timeout_secs: Some(45),
            probe_interval_ms: 750,
            probe_connect_timeout_ms: 300,
            shutdown_grace_period_secs: 7,
        };
        let backend = BackendConfig::external("127.0.0.1:9001".parse().unwrap());

        assert_eq!(backend.startup_timeout(&defaults), Some(Duration::from_secs(45)));
        assert_eq!(backend.probe_interval(&defaults), Duration::from_millis(750));
        assert_eq!(backend.shutdown_grace_period(&defaults), Duration::from_secs(7));

        let probe = backend.probe_config(&defaults);
        assert_eq!(probe.interval, Duration::from_millis(750));
        assert_eq!(probe.timeout, Some(Duration::from_secs(45)));
        assert_eq!(probe.connect_timeout, Duration::from_millis(300));
    }

    #[test]
    fn test_backend_config_overrides_defaults() {
        let defaults = BackendDefaults::default();
        let mut backend = BackendConfig::local("thin", "127.0.0.1:9001".parse().unwrap());
        backend.startup_timeout_secs = Some(2);
        backend.probe_interval_ms = Some(100);
        backend.shutdown_grace_period_secs = Some(1);

        assert_eq!(backend.startup_timeout(&defaults), Some(Duration::from_secs(2)));
        assert_eq!(backend.probe_interval(&defaults), Duration::from_millis(100));
        assert_eq!(backend.shutdown_grace_period(&defaults), Duration::from_secs(1));
    }

    #[test]
    fn test_unset_timeout_probes_forever() {
        let backend = BackendConfig::external("127.0.0.1:9001".parse().unwrap());
        assert_eq!(backend.startup_timeout(&BackendDefaults::default()), None);
        assert_eq!(backend.probe_config(&BackendDefaults::default()).timeout, None);
    }

    #[test]
    fn test_socket_alias_and_host_alias() {
        let toml = r#"
[server]
host = "127.0.0.1"

[[backends]]
socket = "unix:/tmp/a.sock"
command = "app"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert!(config.backends[0].address.is_unix());
    }

    #[test]
    fn test_invalid_address_rejected() {
        let toml = r#"
[[backends]]
address = "not-an-address"
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_empty_config_fails_validation() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert!(config.backends.is_empty());

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("At least one backend"));
    }

    #[test]
    fn test_duplicate_addresses_fail_validation() {
        let toml = r#"
[[backends]]
address = "127.0.0.1:9001"

[[backends]]
address = "127.0.0.1:9001"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Backend #2"));
        assert!(err.to_string().contains("used by another backend"));
    }

    #[test]
    fn test_empty_command_and_zero_interval_fail_validation() {
        let mut backend = BackendConfig::local("  ", "127.0.0.1:9001".parse().unwrap());
        backend.probe_interval_ms = Some(0);
        let config = Config {
            server: ServerConfig::default(),
            defaults: BackendDefaults::default(),
            backends: vec![backend],
        };

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'command' must not be empty"));
        assert!(!err.contains("probe_interval_ms")); // first error per backend wins
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forwardgate.toml");
        std::fs::write(
            &path,
            r#"
[[backends]]
address = "127.0.0.1:9001"
command = "app"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.backends.len(), 1);

        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
