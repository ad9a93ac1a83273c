//! PowerDNS HTTP API client
//!
//! Both the recursor and the authoritative server expose a JSON API guarded
//! by an `X-API-Key` header. We read two documents from it: the server
//! identity, once at startup, and the statistics list, once per collection
//! cycle. Nothing here retries; a failed fetch is reported to the caller and
//! the next scrape simply tries again.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, de::DeserializeOwned};
use tracing::{debug, trace};
use url::Url;

/// Header carrying the PowerDNS API key.
pub const API_KEY_HEADER: &str = "X-API-Key";
/// Endpoint of the server identity document, relative to the API base URL.
pub const INFO_ENDPOINT: &str = "servers/localhost";
/// Endpoint of the statistics list, relative to the API base URL.
pub const STATS_ENDPOINT: &str = "servers/localhost/statistics";

/// Errors produced by [`Fetcher`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The request could not be sent, timed out or its body could not be read.
    #[error("Request to {url} failed: {source}")]
    Transport {
        /// The requested URL
        url: String,
        /// Underlying reqwest error
        #[source]
        source: reqwest::Error,
    },
    /// PowerDNS answered with something other than 200 OK.
    #[error("PowerDNS responded with {status}: {body}")]
    Protocol {
        /// The response status
        status: StatusCode,
        /// The response body, PowerDNS puts its error message here
        body: String,
    },
    /// The response body was not the expected JSON document.
    #[error("Failed to decode PowerDNS response: {0}")]
    Decode(#[from] serde_json::Error),
    /// The endpoint could not be resolved against the base URL.
    #[error("Invalid PowerDNS API URL: {0}")]
    Url(#[from] url::ParseError),
    /// The HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// One entry of the PowerDNS statistics list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatEntry {
    /// Statistic name, for instance `questions`
    pub name: String,
    /// PowerDNS' item type, for instance `StatisticItem`
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Statistic value
    #[serde(deserialize_with = "number_or_numeric_string")]
    pub value: f64,
}

/// The PowerDNS server identity document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerInfo {
    /// Object type, always `Server`
    #[serde(rename = "type")]
    pub kind: String,
    /// Server id, `localhost` for the local daemon
    pub id: String,
    /// API path of this server
    pub url: String,
    /// `recursor`, `authoritative` or `dnsdist`
    pub daemon_type: String,
    /// PowerDNS version string
    pub version: String,
    /// API path template of the configuration settings
    pub config_url: String,
    /// API path template of the zones
    pub zones_url: String,
}

// PowerDNS encodes statistic values as strings, "1024". Plain numbers are
// accepted as well.
fn number_or_numeric_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|err| serde::de::Error::custom(format!("invalid value {text:?}: {err}"))),
    }
}

/// A source of PowerDNS statistics.
///
/// [`crate::collector::Collector`] pulls one statistics list per cycle
/// through this trait. [`Fetcher`] is the HTTP implementation.
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Fetch the current statistics list.
    ///
    /// # Errors
    ///
    /// Returns an error if the statistics could not be retrieved or decoded.
    async fn fetch_stats(&self) -> Result<Vec<StatEntry>, Error>;
}

/// Authenticated client for one PowerDNS API.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl Fetcher {
    /// Create a new [`Fetcher`]
    ///
    /// Every request made through this fetcher, connection and response body
    /// included, is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(base_url: Url, api_key: String, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::Client)?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    /// The API base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// GET `endpoint`, relative to the base URL, and decode the JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the request fails or times out,
    /// [`Error::Protocol`] if the status is not 200 and [`Error::Decode`] if
    /// the body is not a `T`.
    pub async fn fetch_json<T>(&self, endpoint: &str) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let url = self.base_url.join(endpoint)?;
        debug!("fetching {url}");

        let transport = |source| Error::Transport {
            url: url.to_string(),
            source,
        };
        let resp = self
            .client
            .get(url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(transport)?;
        trace!("{url} responded {status} with {len} bytes", len = body.len());

        if status != StatusCode::OK {
            return Err(Error::Protocol {
                status,
                body: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }

        Ok(serde_json::from_slice(&body)?)
    }

    /// Fetch the server identity document.
    ///
    /// # Errors
    ///
    /// See [`Fetcher::fetch_json`].
    pub async fn fetch_server_info(&self) -> Result<ServerInfo, Error> {
        self.fetch_json(INFO_ENDPOINT).await
    }

    /// Fetch the statistics list.
    ///
    /// # Errors
    ///
    /// See [`Fetcher::fetch_json`].
    pub async fn fetch_stats(&self) -> Result<Vec<StatEntry>, Error> {
        self.fetch_json(STATS_ENDPOINT).await
    }
}

#[async_trait]
impl StatsSource for Fetcher {
    async fn fetch_stats(&self) -> Result<Vec<StatEntry>, Error> {
        Fetcher::fetch_stats(self).await
    }
}
