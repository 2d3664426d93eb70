//! Configuration loading.
//!
//! Connection parameters come from the command line; tuning knobs can also be
//! set in an optional `hostlink.json` in the working directory or through
//! environment variables. Precedence, lowest to highest: defaults, config
//! file, environment, command line.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, time::Duration};

use crate::constants::{
    CONFIG_FILE_NAME, DEFAULT_CALL_TIMEOUT, DEFAULT_HOST, MIN_RECONNECT_DELAY, RECONNECT_DELAY,
};
use crate::transport::{ExponentialBackoff, FixedDelay, TransportConfig};
use crate::ws;

/// Command-line arguments passed by the host application when it launches
/// the plugin.
#[derive(Parser, Debug, Clone)]
#[command(name = "hostlink")]
#[command(version)]
#[command(about = "Plugin-side command transport for a local host application")]
pub struct Args {
    /// Port the host application listens on.
    #[arg(long)]
    pub port: u16,

    /// Opaque plugin instance identifier, announced in the startup handshake.
    #[arg(long = "plugin-id")]
    pub plugin_id: String,

    /// Working directory for the config file and log output.
    #[arg(long)]
    pub dir: PathBuf,

    /// Host address to dial. Overrides the config file.
    #[arg(long)]
    pub host: Option<String>,
}

/// Resolved configuration for one plugin process.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Host address to dial.
    pub host: String,
    /// Port the host listens on (command line only).
    #[serde(skip)]
    pub port: u16,
    /// Plugin instance identifier (command line only).
    #[serde(skip)]
    pub plugin_id: String,
    /// Working directory (command line only).
    #[serde(skip)]
    pub dir: PathBuf,
    /// Default call timeout in milliseconds; 0 disables the timeout.
    pub call_timeout_ms: u64,
    /// Delay between reconnect attempts in milliseconds. Values below 100
    /// are raised to 100.
    pub reconnect_delay_ms: u64,
    /// Grow the reconnect delay exponentially instead of keeping it fixed.
    pub exponential_backoff: bool,
    /// Identifier stamped on outbound envelopes as `senderID`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: 0,
            plugin_id: String::new(),
            dir: PathBuf::from("."),
            call_timeout_ms: millis(DEFAULT_CALL_TIMEOUT),
            reconnect_delay_ms: millis(RECONNECT_DELAY),
            exponential_backoff: false,
            sender_id: None,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Build the configuration for `args`, reading the working directory's
    /// config file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or
    /// parsed.
    pub fn load(args: &Args) -> Result<Self> {
        let mut config = Self::load_from_file(&args.dir)?;
        config.apply_env_overrides();
        config.apply_args(args);
        Ok(config)
    }

    /// Read `hostlink.json` from `dir`, falling back to defaults when absent.
    fn load_from_file(dir: &std::path::Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", config_path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply `HOSTLINK_*` overrides using `lookup` to read variables.
    ///
    /// Unparseable values are ignored.
    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(timeout) = lookup("HOSTLINK_CALL_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                self.call_timeout_ms = ms;
            }
        }

        if let Some(delay) = lookup("HOSTLINK_RECONNECT_DELAY_MS") {
            if let Ok(ms) = delay.parse::<u64>() {
                self.reconnect_delay_ms = ms;
            }
        }

        if let Some(sender_id) = lookup("HOSTLINK_SENDER_ID") {
            self.sender_id = Some(sender_id).filter(|s| !s.is_empty());
        }
    }

    fn apply_args(&mut self, args: &Args) {
        self.port = args.port;
        self.plugin_id = args.plugin_id.clone();
        self.dir = args.dir.clone();
        if let Some(ref host) = args.host {
            self.host = host.clone();
        }
    }

    /// WebSocket URL of the host application.
    pub fn url(&self) -> String {
        ws::local_url(&self.host, self.port)
    }

    /// Default call timeout; `None` when disabled.
    pub fn call_timeout(&self) -> Option<Duration> {
        Some(Duration::from_millis(self.call_timeout_ms)).filter(|t| !t.is_zero())
    }

    /// Transport settings derived from this configuration.
    pub fn transport_config(&self) -> TransportConfig {
        let delay = Duration::from_millis(self.reconnect_delay_ms).max(MIN_RECONNECT_DELAY);
        let mut config = TransportConfig::new(self.url(), self.plugin_id.clone())
            .with_default_timeout(self.call_timeout());

        config = if self.exponential_backoff {
            config.with_reconnect(ExponentialBackoff {
                initial: delay,
                ..ExponentialBackoff::default()
            })
        } else {
            config.with_reconnect(FixedDelay(delay))
        };

        match self.sender_id {
            Some(ref sender_id) => config.with_sender_id(sender_id.clone()),
            None => config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(dir: &std::path::Path) -> Args {
        Args::try_parse_from([
            "hostlink",
            "--port",
            "28196",
            "--plugin-id",
            "plugin-7",
            "--dir",
            dir.to_str().unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.call_timeout_ms, 5000);
        assert_eq!(config.reconnect_delay_ms, 5000);
        assert!(!config.exponential_backoff);
        assert!(config.sender_id.is_none());
    }

    #[test]
    fn test_missing_required_args_is_an_error() {
        assert!(Args::try_parse_from(["hostlink"]).is_err());
        assert!(Args::try_parse_from(["hostlink", "--port", "1", "--plugin-id", "p"]).is_err());
        assert!(Args::try_parse_from(["hostlink", "--port", "x", "--plugin-id", "p", "--dir", "."]).is_err());
    }

    #[test]
    fn test_load_without_config_file_uses_defaults_and_args() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load_from_file(dir.path()).unwrap();
        config.apply_args(&args(dir.path()));

        assert_eq!(config.port, 28196);
        assert_eq!(config.plugin_id, "plugin-7");
        assert_eq!(config.dir, dir.path());
        assert_eq!(config.url(), "ws://127.0.0.1:28196");
        assert_eq!(config.call_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_config_file_values_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{ "host": "localhost", "call_timeout_ms": 250, "sender_id": "me" }"#,
        )
        .unwrap();

        let config = Config::load_from_file(dir.path()).unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.call_timeout_ms, 250);
        assert_eq!(config.sender_id.as_deref(), Some("me"));
        // Unspecified fields keep their defaults.
        assert_eq!(config.reconnect_delay_ms, 5000);
    }

    #[test]
    fn test_invalid_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), "{ not json").unwrap();
        assert!(Config::load_from_file(dir.path()).is_err());
    }

    #[test]
    fn test_env_overrides_file_and_args_override_env() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), r#"{ "host": "10.0.0.1", "call_timeout_ms": 250 }"#)
            .unwrap();

        let env: HashMap<&str, &str> = HashMap::from([
            ("HOSTLINK_CALL_TIMEOUT_MS", "0"),
            ("HOSTLINK_RECONNECT_DELAY_MS", "oops"),
        ]);

        let mut config = Config::load_from_file(dir.path()).unwrap();
        config.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()));

        let mut cli = args(dir.path());
        cli.host = Some("127.0.0.2".to_string());
        config.apply_args(&cli);

        assert_eq!(config.call_timeout_ms, 0);
        assert_eq!(config.call_timeout(), None);
        assert_eq!(config.reconnect_delay_ms, 5000);
        assert_eq!(config.host, "127.0.0.2");
    }

    #[test]
    fn test_transport_config_carries_settings() {
        let mut config = Config {
            port: 9000,
            plugin_id: "abc".to_string(),
            sender_id: Some("abc".to_string()),
            reconnect_delay_ms: 100,
            ..Config::default()
        };

        let transport = config.transport_config();
        assert_eq!(transport.url, "ws://127.0.0.1:9000");
        assert_eq!(transport.plugin_id, "abc");
        assert_eq!(transport.sender_id.as_deref(), Some("abc"));
        assert_eq!(transport.default_timeout, Some(Duration::from_secs(5)));
        assert_eq!(transport.reconnect.next_delay(3), Duration::from_millis(100));

        config.reconnect_delay_ms = 0;
        let transport = config.transport_config();
        assert_eq!(transport.reconnect.next_delay(1), MIN_RECONNECT_DELAY);

        config.reconnect_delay_ms = 100;
        config.exponential_backoff = true;
        let transport = config.transport_config();
        assert!(transport.reconnect.next_delay(3) >= Duration::from_millis(400));
    }
}
