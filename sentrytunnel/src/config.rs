use serde::Deserialize;
use std::fs::File;
use tunnel::config::Config as TunnelConfig;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default log filter, `RUST_LOG` takes precedence when set
    #[serde(default = "default_level")]
    pub level: String,
    pub sentry_dsn: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_level(),
            sentry_dsn: None,
        }
    }
}

fn default_level() -> String {
    "info".into()
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub tunnel: TunnelConfig,
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn full_config() {
        let yaml = r#"
            tunnel:
                listener:
                    host: 0.0.0.0
                    port: 8080
                trusted_dsns:
                    - https://sentry.example.com/1
                strip_dsn_credentials: true
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                level: debug
                sentry_dsn: https://key@o0.ingest.sentry.io/0
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert!(config.tunnel.validate().is_ok());
        assert_eq!(config.tunnel.listener.port, 8080);
        assert_eq!(config.tunnel.trusted_dsns, vec!["https://sentry.example.com/1"]);
        assert!(config.tunnel.strip_dsn_credentials);
        assert_eq!(
            config.metrics,
            Some(MetricsConfig {
                statsd_host: "127.0.0.1".into(),
                statsd_port: 8125,
            })
        );
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.logging.sentry_dsn.as_deref(),
            Some("https://key@o0.ingest.sentry.io/0")
        );
    }

    #[test]
    fn minimal_config() {
        let yaml = r#"
            tunnel:
                listener: {host: 0.0.0.0, port: 8080}
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert!(config.metrics.is_none());
        assert_eq!(config.logging, LoggingConfig::default());
        assert_eq!(config.tunnel.path, "/tunnel");
    }

    #[test]
    fn load_errors() {
        assert!(matches!(
            Config::from_file(std::path::Path::new("/nonexistent/sentrytunnel.yaml")),
            Err(ConfigError::LoadError(_))
        ));

        let tmp = write_tmp_file("metrics: {statsd_host: 127.0.0.1, statsd_port: 8125}");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));
    }
}
