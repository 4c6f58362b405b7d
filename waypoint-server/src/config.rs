//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via WAYPOINT_CONFIG)
//! 3. Environment variables
//!
//! CLI flags applied by the binary override all of the above.

use serde::{Deserialize, Serialize};
use std::path::Path;
use waypoint_protocol::{DEFAULT_CLIENT_PORT, DEFAULT_CONTROL_PORT};

/// Gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client (WebSocket) channel.
    pub client: ChannelConfig,
    /// Control (TCP) channel.
    pub control: ControlConfig,
    /// Logging.
    pub log: LogConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("WAYPOINT_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.display().to_string(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        self.client.apply_env_overrides("WAYPOINT_WS");
        self.control.apply_env_overrides();
        self.log.apply_env_overrides();
    }
}

/// Bind host and port for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        // any web client may connect
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_CLIENT_PORT,
        }
    }
}

impl ChannelConfig {
    fn apply_env_overrides(&mut self, prefix: &str) {
        if let Ok(host) = std::env::var(format!("{prefix}_HOST")) {
            self.host = host;
        }
        if let Ok(port) = std::env::var(format!("{prefix}_PORT")) {
            if let Ok(parsed) = port.parse() {
                self.port = parsed;
            }
        }
    }

    /// Bind address tuple for `TcpListener::bind`.
    pub fn bind_addr(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

/// Control channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub host: String,
    pub port: u16,
    /// Watchdog timeout until an unanswered connection is torn down.
    pub wait_timeout_secs: f64,
    /// Close the connection right after a successful response write.
    pub end_with_response: bool,
    /// Attach statistics to every response, not just `getStats`.
    pub add_stats: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            // control messages come from the trusted local backend only
            host: "127.0.0.1".to_string(),
            port: DEFAULT_CONTROL_PORT,
            wait_timeout_secs: 3.0,
            end_with_response: true,
            add_stats: false,
        }
    }
}

impl ControlConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("WAYPOINT_TCP_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("WAYPOINT_TCP_PORT") {
            if let Ok(parsed) = port.parse() {
                self.port = parsed;
            }
        }
        if let Ok(timeout) = std::env::var("WAYPOINT_WAIT_TIMEOUT") {
            if let Ok(parsed) = timeout.parse() {
                self.wait_timeout_secs = parsed;
            }
        }
        if let Ok(flag) = std::env::var("WAYPOINT_ADD_STATS") {
            self.add_stats = flag == "1" || flag.to_lowercase() == "true";
        }
    }

    pub fn bind_addr(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    pub fn wait_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.wait_timeout_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Verbosity: 0 silent, 1 errors, 2 errors + info, 3 full.
    pub verbosity: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { verbosity: 2 }
    }
}

impl LogConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("WAYPOINT_DEBUG") {
            if let Ok(parsed) = level.parse() {
                self.verbosity = parsed;
            }
        }
    }

    /// Tracing filter directive for the configured verbosity.
    pub fn filter_directive(&self) -> &'static str {
        match self.verbosity {
            0 => "off",
            1 => "error",
            2 => "info",
            _ => "debug",
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    Io(String, std::io::Error),

    #[error("failed to parse config file '{0}': {1}")]
    Parse(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.client.host, "0.0.0.0");
        assert_eq!(config.client.port, 8020);
        assert_eq!(config.control.host, "127.0.0.1");
        assert_eq!(config.control.port, 5555);
        assert!((config.control.wait_timeout_secs - 3.0).abs() < f64::EPSILON);
        assert!(config.control.end_with_response);
        assert!(!config.control.add_stats);
        assert_eq!(config.log.verbosity, 2);
    }

    #[test]
    fn test_filter_directives() {
        assert_eq!(LogConfig { verbosity: 0 }.filter_directive(), "off");
        assert_eq!(LogConfig { verbosity: 1 }.filter_directive(), "error");
        assert_eq!(LogConfig { verbosity: 2 }.filter_directive(), "info");
        assert_eq!(LogConfig { verbosity: 3 }.filter_directive(), "debug");
        assert_eq!(LogConfig { verbosity: 9 }.filter_directive(), "debug");
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.client.port, config.client.port);
        assert_eq!(parsed.control.wait_timeout_secs, config.control.wait_timeout_secs);
    }

    #[test]
    fn test_from_file_partial_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "control:\n  port: 6666\n  add_stats: true").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.control.port, 6666);
        assert!(config.control.add_stats);
        // untouched sections keep their defaults
        assert_eq!(config.client.port, 8020);
    }

    #[test]
    fn test_from_file_missing() {
        let result = Config::from_file("/nonexistent/waypoint.yml");
        assert!(matches!(result, Err(ConfigError::Io(_, _))));
    }
}
