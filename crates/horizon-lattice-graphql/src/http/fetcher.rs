//! The network seam of the HTTP transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue};
use reqwest::redirect::Policy;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, ErrorKind, Result};
use crate::logging::targets;
use crate::tls::{RejectionLog, TlsConfig};

/// Raw HTTP response: status, headers and body bytes.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

impl RawResponse {
    /// Check if the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs one HTTP POST of a GraphQL request body.
///
/// Implementations map connection, DNS, timeout and TLS failures to
/// [`Error::Transport`](crate::Error::Transport), except a certificate
/// validator rejection, which maps to
/// [`Error::CertificateRejected`](crate::Error::CertificateRejected).
/// Non-2xx statuses are not errors at this level.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// POST `body` to `url` with `headers`.
    async fn fetch(&self, url: &Url, headers: &HeaderMap, body: Bytes) -> Result<RawResponse>;
}

/// Configuration for the HTTP client.
#[derive(Clone, Debug)]
pub struct HttpClientConfig {
    /// Request timeout.
    pub timeout: Option<Duration>,
    /// Connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Whether to follow redirects.
    pub follow_redirects: bool,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
    /// Default user agent.
    pub user_agent: Option<String>,
    /// Proxy URL.
    pub proxy: Option<String>,
    /// TLS configuration.
    pub tls: TlsConfig,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            connect_timeout: Some(Duration::from_secs(10)),
            follow_redirects: true,
            max_redirects: 10,
            user_agent: Some(default_user_agent()),
            proxy: None,
            tls: TlsConfig::default(),
        }
    }
}

fn default_user_agent() -> String {
    format!("HorizonLatticeGraphQL/{} (Rust)", env!("CARGO_PKG_VERSION"))
}

/// Timeouts and identity settings that can be read from configuration
/// files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Request timeout in milliseconds; `0` disables it.
    pub timeout_ms: u64,
    /// Connect timeout in milliseconds; `0` disables it.
    pub connect_timeout_ms: u64,
    /// Whether to follow redirects.
    pub follow_redirects: bool,
    /// User agent override.
    pub user_agent: Option<String>,
    /// Proxy URL.
    pub proxy: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            follow_redirects: true,
            user_agent: None,
            proxy: None,
        }
    }
}

impl HttpSettings {
    /// Apply these settings on top of a client configuration.
    pub fn apply(&self, config: &mut HttpClientConfig) {
        let millis = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        config.timeout = millis(self.timeout_ms);
        config.connect_timeout = millis(self.connect_timeout_ms);
        config.follow_redirects = self.follow_redirects;
        if let Some(ref user_agent) = self.user_agent {
            config.user_agent = Some(user_agent.clone());
        }
        if let Some(ref proxy) = self.proxy {
            config.proxy = Some(proxy.clone());
        }
    }
}

/// [`HttpFetcher`] backed by a `reqwest` client.
#[derive(Clone, Debug)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
    rejections: Option<Arc<RejectionLog>>,
}

impl ReqwestFetcher {
    /// Build a fetcher from configuration.
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(connect_timeout) = config.connect_timeout {
            builder = builder.connect_timeout(connect_timeout);
        }

        if config.follow_redirects {
            builder = builder.redirect(Policy::limited(config.max_redirects));
        } else {
            builder = builder.redirect(Policy::none());
        }

        if let Some(ref ua) = config.user_agent {
            builder = builder.user_agent(ua);
        }

        if let Some(ref proxy_url) = config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }

        let mut rejections = None;
        if !config.tls.is_default() {
            let tls = config.tls.build_rustls_config()?;
            builder = builder.use_preconfigured_tls(rustls::ClientConfig::clone(&tls));
            rejections = Some(config.tls.rejections().clone());
        }

        Ok(Self {
            client: builder.build()?,
            rejections,
        })
    }

    /// Wrap an existing reqwest client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self {
            client,
            rejections: None,
        }
    }

    fn rejection_count(&self) -> u64 {
        self.rejections.as_ref().map_or(0, |log| log.count())
    }

    /// Map a send failure, attributing it to the certificate validator
    /// when the validator rejected a handshake during the send.
    fn send_error(&self, err: reqwest::Error, rejections_before: u64) -> Error {
        tracing::debug!(target: targets::HTTP, error = %err, "Request failed");
        let err = Error::from(err);
        if err.kind() != ErrorKind::Transport || self.rejection_count() == rejections_before {
            return err;
        }
        let reason = self
            .rejections
            .as_ref()
            .and_then(|log| log.last_reason())
            .unwrap_or_else(|| err.to_string());
        Error::CertificateRejected(reason)
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &Url, headers: &HeaderMap, body: Bytes) -> Result<RawResponse> {
        let mut headers = headers.clone();
        headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("application/json"));
        headers.entry(ACCEPT).or_insert(HeaderValue::from_static(
            "application/graphql-response+json, application/json",
        ));

        let rejections_before = self.rejection_count();
        let response = self
            .client
            .post(url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| self.send_error(e, rejections_before))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_apply() {
        let mut config = HttpClientConfig::default();
        HttpSettings {
            timeout_ms: 0,
            connect_timeout_ms: 2_500,
            follow_redirects: false,
            user_agent: Some("films/1.0".into()),
            proxy: None,
        }
        .apply(&mut config);

        assert_eq!(config.timeout, None);
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(2_500)));
        assert!(!config.follow_redirects);
        assert_eq!(config.user_agent.as_deref(), Some("films/1.0"));
    }

    #[test]
    fn test_reqwest_fetcher_builds() {
        assert!(ReqwestFetcher::new(&HttpClientConfig::default()).is_ok());

        let pinned = HttpClientConfig {
            tls: TlsConfig::new().validator(crate::tls::CertificatePins::new()),
            ..HttpClientConfig::default()
        };
        assert!(ReqwestFetcher::new(&pinned).is_ok());
    }

    #[test]
    fn test_raw_response_success_range() {
        let response = |status| RawResponse {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        assert!(response(200).is_success());
        assert!(response(204).is_success());
        assert!(!response(304).is_success());
        assert!(!response(500).is_success());
    }
}
