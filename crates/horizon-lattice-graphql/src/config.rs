//! File-based client configuration.
//!
//! ```toml
//! http_url = "https://api.example.com/graphql"
//! cache_policy = "cache_first"
//! persisted_queries = true
//!
//! [headers]
//! x-client = "films"
//!
//! [retry]
//! max_retries = 2
//!
//! [http]
//! timeout_ms = 15000
//!
//! [subscription]
//! allow_duplicates = false
//!
//! [tls]
//! min_version = "1.3"
//! pins = ["sha256/47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::client::GraphQLClientBuilder;
use crate::error::{Error, Result};
use crate::http::{HttpClientConfig, HttpSettings};
use crate::interceptor::{CachePolicy, RetryConfig};
use crate::logging::targets;
use crate::subscription::{SubscriptionConfig, SubscriptionSettings};
use crate::tls::{Certificate, CertificatePins, TlsConfig, TlsVersion};

/// Client configuration as read from a TOML document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Endpoint for queries and mutations.
    pub http_url: String,
    /// Endpoint for subscriptions; derived from `http_url` when absent.
    #[serde(default)]
    pub subscription_url: Option<String>,
    /// Headers sent with every HTTP request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Default cache policy.
    #[serde(default)]
    pub cache_policy: CachePolicy,
    /// Enable automatic persisted queries.
    #[serde(default)]
    pub persisted_queries: bool,
    /// Retry guard settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// HTTP client settings.
    #[serde(default)]
    pub http: HttpSettings,
    /// Subscription transport settings.
    #[serde(default)]
    pub subscription: SubscriptionSettings,
    /// Transport security settings.
    #[serde(default)]
    pub tls: TlsSettings,
}

impl ClientConfig {
    /// Create a configuration for `http_url` with defaults elsewhere.
    pub fn new(http_url: impl Into<String>) -> Self {
        Self {
            http_url: http_url.into(),
            subscription_url: None,
            headers: BTreeMap::new(),
            cache_policy: CachePolicy::default(),
            persisted_queries: false,
            retry: RetryConfig::default(),
            http: HttpSettings::default(),
            subscription: SubscriptionSettings::default(),
            tls: TlsSettings::default(),
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(
            target: targets::CLIENT,
            path = %path.display(),
            http_url = %config.http_url,
            "Loaded client configuration"
        );
        Ok(config)
    }

    /// Serialize to a pretty-printed TOML document.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    /// Create a client builder from this configuration.
    ///
    /// Collaborators that cannot live in a file (header sources, custom
    /// steps, fetchers) can be added to the returned builder.
    pub fn builder(&self) -> Result<GraphQLClientBuilder> {
        let mut http = HttpClientConfig::default();
        self.http.apply(&mut http);
        let mut subscription = SubscriptionConfig::default();
        self.subscription.apply(&mut subscription);

        let mut builder = GraphQLClientBuilder::new(self.http_url.clone())
            .http_config(http)
            .subscription_config(subscription)
            .retry(self.retry.clone())
            .cache_policy(self.cache_policy)
            .persisted_queries(self.persisted_queries)
            .headers(self.headers.clone());

        if let Some(ref url) = self.subscription_url {
            builder = builder.subscription_url(url.clone());
        }
        let tls = self.tls.to_tls_config()?;
        if !tls.is_default() {
            builder = builder.tls(tls);
        }
        Ok(builder)
    }
}

/// Transport security options that can be read from configuration files.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Minimum protocol version, `"1.2"` or `"1.3"`.
    pub min_version: TlsVersion,
    /// PEM files with additional trusted roots.
    pub root_certificates: Vec<PathBuf>,
    /// Trust only `root_certificates`.
    pub use_only_custom_roots: bool,
    /// Certificate pins, `sha256/<base64>` or hex.
    pub pins: Vec<String>,
    /// With pins set, also require a valid chain.
    pub verify_chain: bool,
}

impl TlsSettings {
    /// Build the TLS configuration these settings describe.
    pub fn to_tls_config(&self) -> Result<TlsConfig> {
        let mut tls = TlsConfig::new().min_version(self.min_version);
        for path in &self.root_certificates {
            tls = tls.add_root_certificate(Certificate::from_pem_file(path)?);
        }
        if self.use_only_custom_roots {
            tls = tls.use_only_custom_roots();
        }
        if !self.pins.is_empty() {
            let mut pins = CertificatePins::new();
            for pin in &self.pins {
                pins = pins.pin(pin)?;
            }
            tls = tls.validator(pins);
            if self.verify_chain {
                tls = tls.verify_chain_too();
            }
        }
        Ok(tls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        http_url = "https://api.example.com/graphql"
        subscription_url = "wss://stream.example.com/graphql"
        cache_policy = "network_only"
        persisted_queries = true

        [headers]
        x-client = "films"

        [retry]
        max_retries = 1
        initial_delay_ms = 50

        [http]
        timeout_ms = 15000
        user_agent = "films/1.0"

        [subscription]
        allow_duplicates = false
        reconnect_interval_ms = 250
        client_name = "films"
        client_version = "1.0"

        [tls]
        min_version = "1.3"
        pins = ["sha256/47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="]
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ClientConfig::from_toml_str(r#"http_url = "http://localhost:4000/graphql""#)
            .unwrap();
        assert_eq!(config, ClientConfig::new("http://localhost:4000/graphql"));
        assert_eq!(config.cache_policy, CachePolicy::CacheFirst);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.subscription.allow_duplicates);
    }

    #[test]
    fn test_full_config() {
        let config = ClientConfig::from_toml_str(FULL).unwrap();
        assert_eq!(
            config.subscription_url.as_deref(),
            Some("wss://stream.example.com/graphql")
        );
        assert_eq!(config.cache_policy, CachePolicy::NetworkOnly);
        assert!(config.persisted_queries);
        assert_eq!(config.headers.get("x-client").map(String::as_str), Some("films"));
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.initial_delay_ms, 50);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.http.timeout_ms, 15_000);
        assert!(!config.subscription.allow_duplicates);
        assert_eq!(config.tls.min_version, TlsVersion::Tls1_3);
        assert_eq!(config.tls.pins.len(), 1);
    }

    #[test]
    fn test_missing_url_is_rejected() {
        let err = ClientConfig::from_toml_str("persisted_queries = true").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bad_pin_is_rejected() {
        let mut config = ClientConfig::new("https://api.example.com/graphql");
        config.tls.pins.push("sha256/not-base64!".into());
        assert!(matches!(config.builder(), Err(Error::Config(_))));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ClientConfig::from_toml_str(FULL).unwrap();
        let text = config.to_toml_string().unwrap();
        assert_eq!(ClientConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_tls_settings() {
        let tls = TlsSettings::default().to_tls_config().unwrap();
        assert!(tls.is_default());

        let tls = ClientConfig::from_toml_str(FULL)
            .unwrap()
            .tls
            .to_tls_config()
            .unwrap();
        assert!(tls.validator.is_some());
        assert_eq!(tls.min_version, TlsVersion::Tls1_3);
        assert!(!tls.verify_chain_with_validator);
    }

    #[tokio::test]
    async fn test_builder_from_config() {
        let config = ClientConfig::from_toml_str(FULL).unwrap();
        let client = config.builder().unwrap().build().unwrap();
        assert_eq!(client.http_url().as_str(), "https://api.example.com/graphql");
        assert_eq!(
            client.subscription_url().as_str(),
            "wss://stream.example.com/graphql"
        );
    }
}
