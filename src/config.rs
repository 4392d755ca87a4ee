//! Configuration module for the kvgate server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::server::ConnectionConfig;
use crate::store::StoreConfig;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "kvgate")]
#[command(version)]
#[command(about = "A memcached text protocol front end for a key-value store", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:11211)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Read deadline per command in milliseconds (0 = none)
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Write deadline per response in milliseconds (0 = none)
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// Maximum bytes a single command may span (0 = unlimited)
    #[arg(long)]
    pub max_request_bytes: Option<usize>,

    /// Maximum memory usage in bytes (e.g., 67108864 for 64MB)
    #[arg(short = 'm', long)]
    pub max_memory: Option<usize>,

    /// TTL applied to every item in seconds (0 = no expiration)
    #[arg(long)]
    pub ttl: Option<u64>,

    /// statsd daemon to send metrics to (e.g., 127.0.0.1:8125)
    #[arg(long)]
    pub statsd: Option<String>,

    /// Prefix for every metric name
    #[arg(long)]
    pub statsd_prefix: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub metrics: MetricsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub write_timeout_ms: u64,
    #[serde(default)]
    pub max_request_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            threads: default_threads(),
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            max_request_bytes: 0,
        }
    }
}

/// Storage-related configuration
#[derive(Debug, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_max_memory")]
    pub max_memory: usize,
    /// Seconds until an item expires
    #[serde(default)]
    pub ttl: u64,
    /// Interval for running expiration cleanup in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            max_memory: default_max_memory(),
            ttl: 0,
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Deserialize)]
pub struct MetricsSection {
    /// statsd address; metrics are discarded when unset
    pub statsd: Option<String>,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
    /// Flush interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub interval: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            statsd: None,
            prefix: default_metrics_prefix(),
            interval: default_metrics_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:11211".to_string()
}

fn default_threads() -> usize {
    10
}

fn default_max_memory() -> usize {
    64 * 1024 * 1024 // 64 MB
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_metrics_prefix() -> String {
    "kvgate".to_string()
}

fn default_metrics_interval() -> u64 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub threads: usize,
    pub connection: ConnectionConfig,
    pub storage: StoreConfig,
    pub statsd: Option<SocketAddr>,
    pub metrics_prefix: String,
    pub metrics_interval: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge CLI args with the TOML file they name, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref config_path) => {
                let contents = std::fs::read_to_string(config_path)
                    .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
                toml::from_str(&contents)
                    .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
            }
            None => TomlConfig::default(),
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(file.server.listen);
        let listen = parse_addr("listen", &listen)?;

        let threads = cli.threads.unwrap_or(file.server.threads);
        if threads == 0 {
            return Err(ConfigError::Invalid {
                field: "threads",
                reason: "must be at least 1".to_string(),
            });
        }

        let cleanup_interval = file.storage.cleanup_interval;
        if cleanup_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "cleanup_interval",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if file.metrics.interval == 0 {
            return Err(ConfigError::Invalid {
                field: "metrics.interval",
                reason: "must be at least 1 second".to_string(),
            });
        }

        let statsd = cli
            .statsd
            .or(file.metrics.statsd)
            .map(|addr| parse_addr("statsd", &addr))
            .transpose()?;

        Ok(Config {
            listen,
            threads,
            connection: ConnectionConfig {
                read_timeout: millis(cli.read_timeout_ms.unwrap_or(file.server.read_timeout_ms)),
                write_timeout: millis(
                    cli.write_timeout_ms
                        .unwrap_or(file.server.write_timeout_ms),
                ),
                max_request_bytes: cli
                    .max_request_bytes
                    .unwrap_or(file.server.max_request_bytes),
            },
            storage: StoreConfig {
                max_memory: cli.max_memory.unwrap_or(file.storage.max_memory),
                ttl: cli.ttl.unwrap_or(file.storage.ttl),
                cleanup_interval,
            },
            statsd,
            metrics_prefix: cli.statsd_prefix.unwrap_or(file.metrics.prefix),
            metrics_interval: Duration::from_secs(file.metrics.interval),
            log_level: cli.log_level.unwrap_or(file.logging.level),
        })
    }
}

/// Zero disables the deadline.
fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn parse_addr(field: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        field,
        reason: format!("'{value}' is not a socket address"),
    })
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:11211");
        assert_eq!(config.server.threads, 10);
        assert_eq!(config.storage.max_memory, 64 * 1024 * 1024);
        assert_eq!(config.storage.ttl, 0);
        assert_eq!(config.metrics.statsd, None);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:11211"
            threads = 4
            read_timeout_ms = 5000

            [storage]
            max_memory = 134217728
            ttl = 3600

            [metrics]
            statsd = "127.0.0.1:8125"
            prefix = "cache"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:11211");
        assert_eq!(config.server.threads, 4);
        assert_eq!(config.server.read_timeout_ms, 5000);
        assert_eq!(config.server.write_timeout_ms, 0);
        assert_eq!(config.storage.max_memory, 134217728);
        assert_eq!(config.storage.ttl, 3600);
        assert_eq!(config.storage.cleanup_interval, 60);
        assert_eq!(config.metrics.statsd.as_deref(), Some("127.0.0.1:8125"));
        assert_eq!(config.metrics.prefix, "cache");
        assert_eq!(config.metrics.interval, 1);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        assert!(toml::from_str::<TomlConfig>("[sever]\nlisten = \"x\"\n").is_err());
    }

    #[test]
    fn test_defaults_resolve() {
        let config = Config::merge(CliArgs::default(), TomlConfig::default()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:11211".parse().unwrap());
        assert_eq!(config.threads, 10);
        assert_eq!(config.connection.read_timeout, None);
        assert_eq!(config.connection.write_timeout, None);
        assert_eq!(config.connection.max_request_bytes, 0);
        assert_eq!(config.storage.cleanup_interval, 60);
        assert_eq!(config.statsd, None);
        assert_eq!(config.metrics_prefix, "kvgate");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:11211"
            threads = 4
            write_timeout_ms = 250

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();
        let cli = CliArgs {
            listen: Some("127.0.0.1:22122".to_string()),
            read_timeout_ms: Some(1000),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };

        let config = Config::merge(cli, file).unwrap();
        assert_eq!(config.listen.port(), 22122);
        assert_eq!(config.threads, 4);
        assert_eq!(
            config.connection.read_timeout,
            Some(Duration::from_millis(1000))
        );
        assert_eq!(
            config.connection.write_timeout,
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_invalid_values() {
        let cli = CliArgs {
            listen: Some("not-an-address".to_string()),
            ..Default::default()
        };
        let err = Config::merge(cli, TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "listen", .. }));

        let cli = CliArgs {
            threads: Some(0),
            ..Default::default()
        };
        let err = Config::merge(cli, TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "threads", .. }));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("kvgate-test-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[storage]\nttl = 30\n\n[metrics]\nstatsd = \"127.0.0.1:8125\"").unwrap();
        drop(file);

        let cli = CliArgs {
            config: Some(path.clone()),
            ..Default::default()
        };
        let config = Config::from_args(cli).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.storage.ttl, 30);
        assert_eq!(config.statsd, Some("127.0.0.1:8125".parse().unwrap()));
    }

    #[test]
    fn test_missing_file_is_reported() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/kvgate.toml")),
            ..Default::default()
        };
        let err = Config::from_args(cli).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
        assert!(err.to_string().contains("/nonexistent/kvgate.toml"));
    }
}
