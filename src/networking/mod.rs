use std::time::Duration;

use log::{debug, warn};
use reqwest::Client;
use thiserror::Error;

use crate::engine::models::Manifest;

pub mod probe;

pub const USER_AGENT: &str = concat!("samp-launcher/", env!("CARGO_PKG_VERSION"));
const MANIFEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("timed out fetching {0}")]
    Timeout(String),
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("connection error: {0}")]
    Connection(String),
    #[error("manifest is not a JSON object")]
    NotAnObject,
    #[error("invalid manifest: {0}")]
    Parse(String),
}

impl FetchError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(url.to_owned())
        } else if let Some(status) = err.status() {
            FetchError::HttpStatus {
                url: url.to_owned(),
                status: status.as_u16(),
            }
        } else {
            FetchError::Connection(err.to_string())
        }
    }
}

/// Connect and read timeouts for HTTP requests.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct NetworkClient {
    client: Client,
}

impl NetworkClient {
    pub fn new(timeouts: Timeouts) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(timeouts.connect)
            .read_timeout(timeouts.read)
            .build()
            .unwrap_or_else(|err| {
                warn!("network client: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client }
    }

    pub fn http(&self) -> &Client {
        &self.client
    }

    /// Fetch and parse the release manifest. A body that is not a JSON object is an error.
    pub async fn fetch_manifest(&self, url: &str) -> Result<Manifest, FetchError> {
        debug!("manifest: fetching {url}");
        let response = self
            .client
            .get(url)
            .timeout(MANIFEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?
            .error_for_status()
            .map_err(|e| FetchError::from_reqwest(url, e))?;
        let text = response
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;
        parse_manifest(&text)
    }
}

impl Default for NetworkClient {
    fn default() -> Self {
        Self::new(Timeouts::default())
    }
}

pub fn parse_manifest(text: &str) -> Result<Manifest, FetchError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| FetchError::Parse(e.to_string()))?;
    if !value.is_object() {
        return Err(FetchError::NotAnObject);
    }
    serde_json::from_value(value).map_err(|e| FetchError::Parse(e.to_string()))
}
