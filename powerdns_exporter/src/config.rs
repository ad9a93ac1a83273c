//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
//!
//! Configuration comes from an optional YAML file. Command line flags, see
//! [`Overrides`], take precedence over anything set in the file.

use std::{
    fs,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use url::Url;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The metrics path does not start with a slash.
    #[error("Metric path must start with '/': {0}")]
    MetricPath(String),
    /// A timeout of zero would fail every scrape.
    #[error("API timeout must be at least one second")]
    ZeroTimeout,
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9130))
}

fn default_metric_path() -> String {
    "/metrics".to_string()
}

fn default_api_url() -> Url {
    Url::parse("http://localhost:8001/").expect("default API URL is valid")
}

fn default_api_timeout_seconds() -> u64 {
    5
}

fn default_concurrent_requests_max() -> usize {
    100
}

/// Main configuration struct for this program
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address to listen on for the metrics endpoint and landing page
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,
    /// Path under which metrics are exposed
    #[serde(default = "default_metric_path")]
    pub metric_path: String,
    /// Base URL of the PowerDNS API
    #[serde(default = "default_api_url")]
    pub api_url: Url,
    /// PowerDNS API key
    #[serde(default)]
    pub api_key: String,
    /// Bound on each request to the PowerDNS API, in seconds
    #[serde(default = "default_api_timeout_seconds")]
    pub api_timeout_seconds: u64,
    /// Number of concurrent HTTP connections to allow
    #[serde(default = "default_concurrent_requests_max")]
    pub concurrent_requests_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            metric_path: default_metric_path(),
            api_url: default_api_url(),
            api_key: String::new(),
            api_timeout_seconds: default_api_timeout_seconds(),
            concurrent_requests_max: default_concurrent_requests_max(),
        }
    }
}

/// Values given on the command line, each replacing its [`Config`] field
/// when set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// See [`Config::listen_address`]
    pub listen_address: Option<SocketAddr>,
    /// See [`Config::metric_path`]
    pub metric_path: Option<String>,
    /// See [`Config::api_url`]
    pub api_url: Option<Url>,
    /// See [`Config::api_key`]
    pub api_key: Option<String>,
    /// See [`Config::api_timeout_seconds`]
    pub api_timeout_seconds: Option<u64>,
    /// See [`Config::concurrent_requests_max`]
    pub concurrent_requests_max: Option<usize>,
}

impl Config {
    /// Parse a YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error if `contents` is not a valid configuration.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse the YAML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid
    /// configuration.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_yaml(&contents)
    }

    /// Replace every field set in `overrides`.
    ///
    /// # Errors
    ///
    /// Returns an error if the result is not a valid configuration.
    pub fn apply(mut self, overrides: Overrides) -> Result<Self, Error> {
        if let Some(listen_address) = overrides.listen_address {
            self.listen_address = listen_address;
        }
        if let Some(metric_path) = overrides.metric_path {
            self.metric_path = metric_path;
        }
        if let Some(api_url) = overrides.api_url {
            self.api_url = api_url;
        }
        if let Some(api_key) = overrides.api_key {
            self.api_key = api_key;
        }
        if let Some(api_timeout_seconds) = overrides.api_timeout_seconds {
            self.api_timeout_seconds = api_timeout_seconds;
        }
        if let Some(concurrent_requests_max) = overrides.concurrent_requests_max {
            self.concurrent_requests_max = concurrent_requests_max;
        }
        self.validate()?;
        Ok(self)
    }

    /// The PowerDNS API request timeout.
    #[must_use]
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds)
    }

    fn validate(&self) -> Result<(), Error> {
        if !self.metric_path.starts_with('/') {
            return Err(Error::MetricPath(self.metric_path.clone()));
        }
        if self.api_timeout_seconds == 0 {
            return Err(Error::ZeroTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_yaml("{}").expect("valid config");
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_address.port(), 9130);
        assert_eq!(config.metric_path, "/metrics");
        assert_eq!(config.api_url.as_str(), "http://localhost:8001/");
        assert_eq!(config.api_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn full_document() {
        let contents = r#"
listen_address: "127.0.0.1:9999"
metric_path: "/pdns"
api_url: "http://ns1.example.com:8082/api/v1/"
api_key: "changeme"
api_timeout_seconds: 2
concurrent_requests_max: 4
"#;
        let config = Config::from_yaml(contents).expect("valid config");
        assert_eq!(
            config,
            Config {
                listen_address: "127.0.0.1:9999".parse().expect("valid addr"),
                metric_path: "/pdns".to_string(),
                api_url: Url::parse("http://ns1.example.com:8082/api/v1/").expect("valid url"),
                api_key: "changeme".to_string(),
                api_timeout_seconds: 2,
                concurrent_requests_max: 4,
            }
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Config::from_yaml("api_secret: nope\n").expect_err("unknown field");
        assert!(matches!(err, Error::SerdeYaml(_)), "{err:?}");
    }

    #[test]
    fn metric_path_needs_leading_slash() {
        let err = Config::from_yaml("metric_path: metrics\n").expect_err("relative path");
        assert!(matches!(err, Error::MetricPath(_)), "{err:?}");
    }

    #[test]
    fn overrides_replace_file_values() {
        let config = Config::from_yaml("api_key: from-file\napi_timeout_seconds: 9\n")
            .expect("valid config")
            .apply(Overrides {
                api_key: Some("from-flag".to_string()),
                metric_path: Some("/stats".to_string()),
                ..Overrides::default()
            })
            .expect("valid overrides");

        assert_eq!(config.api_key, "from-flag");
        assert_eq!(config.metric_path, "/stats");
        assert_eq!(config.api_timeout_seconds, 9);
    }

    #[test]
    fn zero_timeout_override_is_rejected() {
        let err = Config::default()
            .apply(Overrides {
                api_timeout_seconds: Some(0),
                ..Overrides::default()
            })
            .expect_err("zero timeout");
        assert!(matches!(err, Error::ZeroTimeout), "{err:?}");
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "api_url: \"http://10.0.0.53:8081/\"").expect("write config");

        let config = Config::load(file.path()).expect("valid config");
        assert_eq!(config.api_url.as_str(), "http://10.0.0.53:8081/");
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = Config::load(&dir.path().join("absent.yaml")).expect_err("no such file");
        assert!(matches!(err, Error::ReadFile { .. }), "{err:?}");
    }
}
