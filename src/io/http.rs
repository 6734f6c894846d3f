//! Blocking HTTP client seam used by the catalog and metadata readers

use crate::params::NetworkConfig;
use crate::types::{MosaicError, MosaicResult};

/// Minimal HTTP surface needed for catalog search and metadata fetches.
///
/// Implemented by [`ReqwestClient`] in production and by canned-response
/// mocks in tests.
pub trait HttpClient: Send + Sync {
    /// GET `url`, returning the response body
    fn get(&self, url: &str) -> MosaicResult<Vec<u8>>;

    /// POST a JSON document to `url`, returning the response body
    fn post_json(&self, url: &str, json_body: &str) -> MosaicResult<Vec<u8>>;
}

/// reqwest-backed client honouring proxy, timeout and certificate settings
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    pub fn new(config: &NetworkConfig) -> MosaicResult<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| MosaicError::Config(format!("Invalid proxy '{}': {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| MosaicError::Http(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    fn finish(response: reqwest::blocking::Response, url: &str) -> MosaicResult<Vec<u8>> {
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status.as_u16(), url));
        }
        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| request_error(e, url))
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, url: &str) -> MosaicResult<Vec<u8>> {
        log::debug!("GET {}", url);
        let response = self.client.get(url).send().map_err(|e| request_error(e, url))?;
        Self::finish(response, url)
    }

    fn post_json(&self, url: &str, json_body: &str) -> MosaicResult<Vec<u8>> {
        log::debug!("POST {}", url);
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(json_body.to_string())
            .send()
            .map_err(|e| request_error(e, url))?;
        Self::finish(response, url)
    }
}

/// Map an HTTP status to an error; throttling and server errors are retryable
pub fn status_error(status: u16, url: &str) -> MosaicError {
    let message = format!("HTTP {} from {}", status, url);
    if status == 429 || (500..600).contains(&status) {
        MosaicError::Transient(message)
    } else {
        MosaicError::Http(message)
    }
}

fn request_error(e: reqwest::Error, url: &str) -> MosaicError {
    let message = format!("Request to {} failed: {}", url, e);
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        MosaicError::Transient(message)
    } else if let Some(status) = e.status() {
        status_error(status.as_u16(), url)
    } else {
        MosaicError::Http(message)
    }
}
