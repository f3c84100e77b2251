//! Configuration management for the Nakivo exporter.
//!
//! Supports loading configuration from:
//! - YAML configuration files (any format the `config` crate understands)
//! - Environment variables (with `NAKIVO_EXPORTER` prefix)
//!
//! Host entries under `nakivo_hosts` are deliberately loose at load time and
//! are only checked when a scrape polls them, so that one bogus entry never
//! keeps the exporter from starting.

use crate::error::{NakivoError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::Path;

/// Default configuration file, looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "nakivo_prometheus_exporter.yaml";

/// HTTP server settings for the `/metrics` endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct HttpServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// HTTP Basic username expected from Prometheus
    #[serde(default)]
    pub username: String,

    /// HTTP Basic password expected from Prometheus
    #[serde(default)]
    pub password: String,

    /// Serve metrics without HTTP Basic authentication
    #[serde(default)]
    pub no_auth: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Also append logs to this file
    #[serde(default)]
    pub log_file: Option<String>,
}

impl std::fmt::Debug for HttpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerConfig")
            .field("listen", &self.listen)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***REDACTED***")
            .field("no_auth", &self.no_auth)
            .field("log_level", &self.log_level)
            .field("log_file", &self.log_file)
            .finish()
    }
}

impl HttpServerConfig {
    /// `listen:port` as handed to the TCP listener.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen, self.port)
    }
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            no_auth: false,
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

/// Knobs for the collection pass run on every scrape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Skip jobs whose status is `GRAY` (never scheduled)
    #[serde(default = "default_filter_active_only")]
    pub filter_active_only: bool,

    /// How many Nakivo hosts are polled at the same time (1 = sequential)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Per-request timeout against the Nakivo API, in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            filter_active_only: default_filter_active_only(),
            max_concurrency: default_max_concurrency(),
            timeout_seconds: default_timeout(),
        }
    }
}

/// A `nakivo_hosts` entry exactly as found in the configuration.
///
/// Every field is optional here; [`HostEntry::validate`] turns it into a
/// [`HostConfig`] or explains what is missing.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct HostEntry {
    /// Nakivo URL or hostname (e.g. "https://nakivo.example.com:4443")
    #[serde(default)]
    pub host: Option<String>,

    /// Nakivo API user
    #[serde(default)]
    pub username: Option<String>,

    /// Nakivo API password
    #[serde(default)]
    pub password: Option<String>,

    /// Verify the Nakivo TLS certificate
    #[serde(default)]
    pub cert_verify: Option<bool>,

    /// Why the raw entry could not be read, if it could not
    #[serde(skip)]
    pub malformed: Option<String>,
}

impl std::fmt::Debug for HostEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEntry")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***REDACTED***"))
            .field("cert_verify", &self.cert_verify)
            .field("malformed", &self.malformed)
            .finish()
    }
}

impl HostEntry {
    /// Read one raw `nakivo_hosts` element.
    ///
    /// Never fails: an element of the wrong shape becomes an entry that
    /// [`HostEntry::validate`] rejects with the deserialization error.
    pub fn from_value(raw: Value) -> Self {
        match HostEntry::deserialize(&raw) {
            Ok(entry) => entry,
            Err(e) => HostEntry {
                host: raw.get("host").and_then(Value::as_str).map(str::to_string),
                malformed: Some(e.to_string()),
                ..HostEntry::default()
            },
        }
    }

    /// Check that the entry was readable and all four fields are present and non-empty.
    pub fn validate(&self) -> Result<HostConfig> {
        let label = self
            .host
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or("<unknown host>");
        let invalid = |reason: &str| NakivoError::InvalidHost {
            host: label.to_string(),
            reason: reason.to_string(),
        };

        if let Some(reason) = &self.malformed {
            return Err(invalid(reason));
        }

        let host = required(&self.host).ok_or_else(|| invalid("missing host"))?;
        let username = required(&self.username).ok_or_else(|| invalid("missing username"))?;
        let password = required(&self.password).ok_or_else(|| invalid("missing password"))?;
        let cert_verify = self
            .cert_verify
            .ok_or_else(|| invalid("missing cert_verify"))?;

        Ok(HostConfig {
            host,
            username,
            password,
            cert_verify,
        })
    }
}

fn required(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

/// A validated Nakivo host, immutable for the duration of one poll.
#[derive(Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    pub cert_verify: bool,
}

impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"***REDACTED***")
            .field("cert_verify", &self.cert_verify)
            .finish()
    }
}

/// Main configuration structure for the Nakivo exporter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// HTTP server configuration
    #[serde(default)]
    pub http_server: HttpServerConfig,

    /// Collection pass configuration
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Nakivo instances to poll on every scrape
    #[serde(default, deserialize_with = "deserialize_host_entries")]
    pub nakivo_hosts: Vec<HostEntry>,
}

/// Read `nakivo_hosts` element by element so one bad entry only affects its host.
fn deserialize_host_entries<'de, D>(deserializer: D) -> std::result::Result<Vec<HostEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(HostEntry::from_value)
        .collect())
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9119
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_filter_active_only() -> bool {
    true
}

fn default_max_concurrency() -> usize {
    4
}

fn default_timeout() -> u64 {
    30
}

impl Settings {
    /// Load configuration from a file and environment variables.
    ///
    /// # Arguments
    ///
    /// * `config_path` - Path to the configuration file
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use nakivo_exporter::config::Settings;
    ///
    /// let settings = Settings::load("nakivo_prometheus_exporter.yaml").unwrap();
    /// ```
    pub fn load(config_path: &str) -> Result<Self> {
        if !Path::new(config_path).exists() {
            return Err(NakivoError::Config(config::ConfigError::Message(format!(
                "Cannot load config file {}",
                config_path
            ))));
        }

        let config = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .add_source(
                config::Environment::with_prefix("NAKIVO_EXPORTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let settings: Settings = config.try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration settings.
    fn validate(&self) -> Result<()> {
        if !self.http_server.no_auth
            && (self.http_server.username.is_empty() || self.http_server.password.is_empty())
        {
            return Err(NakivoError::Config(config::ConfigError::Message(
                "http_server username and password are required unless no_auth is set"
                    .to_string(),
            )));
        }

        if self.collector.max_concurrency == 0 {
            return Err(NakivoError::Config(config::ConfigError::Message(
                "collector max_concurrency must be at least 1".to_string(),
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(host: &str, username: &str, password: &str, cert_verify: Option<bool>) -> HostEntry {
        HostEntry {
            host: Some(host.to_string()),
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            cert_verify,
            ..HostEntry::default()
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.http_server.listen_address(), "0.0.0.0:9119");
        assert!(settings.collector.filter_active_only);
        assert_eq!(settings.collector.max_concurrency, 4);
        assert!(settings.nakivo_hosts.is_empty());
        assert!(settings.http_server.log_file.is_none());
    }

    #[test]
    fn test_validation_fails_without_credentials() {
        let settings = Settings::default();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_passes_with_no_auth() {
        let mut settings = Settings::default();
        settings.http_server.no_auth = true;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_host_entry_validates() {
        let host = entry("https://nakivo:4443", "admin", "secret", Some(false))
            .validate()
            .unwrap();
        assert_eq!(host.host, "https://nakivo:4443");
        assert!(!host.cert_verify);
    }

    #[test]
    fn test_host_entry_rejects_missing_fields() {
        assert!(entry("nakivo", "", "secret", Some(true)).validate().is_err());
        assert!(entry("nakivo", "admin", "secret", None).validate().is_err());
        assert!(HostEntry::default().validate().is_err());

        let err = entry("nakivo", "admin", "", Some(true)).validate().unwrap_err();
        assert!(err.to_string().contains("nakivo"));
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_debug_redacts_passwords() {
        let e = entry("nakivo", "admin", "hunter2", Some(true));
        assert!(!format!("{:?}", e).contains("hunter2"));
        assert!(!format!("{:?}", e.validate().unwrap()).contains("hunter2"));
    }

    #[test]
    fn test_load_yaml_file() {
        let path = std::env::temp_dir().join("nakivo_exporter_config_test.yaml");
        std::fs::write(
            &path,
            "http_server:\n  port: 9200\n  no_auth: true\n  log_file: /var/log/nakivo_exporter.log\nnakivo_hosts:\n  - host: https://nakivo:4443\n    username: admin\n    password: secret\n    cert_verify: false\n  - host: broken\n",
        )
        .unwrap();

        let settings = Settings::load(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.http_server.port, 9200);
        assert_eq!(
            settings.http_server.log_file.as_deref(),
            Some("/var/log/nakivo_exporter.log")
        );
        assert_eq!(settings.nakivo_hosts.len(), 2);
        assert!(settings.nakivo_hosts[0].validate().is_ok());
        assert!(settings.nakivo_hosts[1].validate().is_err());

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_host_entry_from_malformed_value() {
        let scalar = HostEntry::from_value(json!("just-a-hostname"));
        let err = scalar.validate().unwrap_err();
        assert!(matches!(err, NakivoError::InvalidHost { .. }));
        assert!(err.to_string().contains("<unknown host>"));

        let bad_flag = HostEntry::from_value(json!({
            "host": "nakivo",
            "username": "admin",
            "password": "secret",
            "cert_verify": "maybe"
        }));
        let err = bad_flag.validate().unwrap_err();
        assert!(err.to_string().contains("nakivo"));
        assert!(!format!("{:?}", bad_flag).contains("secret"));

        let good = HostEntry::from_value(json!({
            "host": "nakivo",
            "username": "admin",
            "password": "secret",
            "cert_verify": true
        }));
        assert!(good.validate().is_ok());
    }

    #[test]
    fn test_load_keeps_good_hosts_next_to_malformed_ones() {
        let path = std::env::temp_dir().join("nakivo_exporter_malformed_hosts_test.yaml");
        std::fs::write(
            &path,
            "http_server:\n  no_auth: true\nnakivo_hosts:\n  - host: https://nakivo:4443\n    username: admin\n    password: secret\n    cert_verify: true\n  - just-a-hostname\n  - host: https://other:4443\n    username: admin\n    password: secret\n    cert_verify: maybe\n",
        )
        .unwrap();

        let settings = Settings::load(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.nakivo_hosts.len(), 3);
        assert_eq!(
            settings.nakivo_hosts[0].validate().unwrap().host,
            "https://nakivo:4443"
        );
        assert!(settings.nakivo_hosts[1].validate().is_err());
        let err = settings.nakivo_hosts[2].validate().unwrap_err();
        assert!(err.to_string().contains("https://other:4443"));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_empty_host_list_loads() {
        let path = std::env::temp_dir().join("nakivo_exporter_empty_hosts_test.yaml");
        std::fs::write(&path, "http_server:\n  no_auth: true\nnakivo_hosts:\n").unwrap();

        let settings = Settings::load(path.to_str().unwrap()).unwrap();
        assert!(settings.nakivo_hosts.is_empty());

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Settings::load("/nonexistent/nakivo.yaml").is_err());
    }
}
