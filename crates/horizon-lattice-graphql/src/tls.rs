//! TLS configuration and certificate pinning.
//!
//! Both transports build their rustls configuration from a [`TlsConfig`].
//! When a [`CertificateValidator`] is installed, it is consulted for every
//! connection attempt, HTTP and WebSocket alike, before any application
//! data is exchanged. A rejection aborts the handshake and surfaces as
//! [`Error::CertificateRejected`].
//!
//! # Pinning
//!
//! ```ignore
//! use horizon_lattice_graphql::tls::{CertificatePins, TlsConfig};
//!
//! let pins = CertificatePins::new()
//!     .pin("sha256/47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=")?;
//!
//! // Trust only the pinned certificates.
//! let tls = TlsConfig::new().validator(pins);
//!
//! // Or require both a valid chain and a pin match.
//! let tls = TlsConfig::new().validator(pins).verify_chain_too();
//! ```

use std::io::{BufReader, Cursor};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::Engine;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::logging::targets;

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.2 (default minimum).
    #[default]
    #[serde(rename = "1.2")]
    Tls1_2,
    /// TLS 1.3.
    #[serde(rename = "1.3")]
    Tls1_3,
}

impl TlsVersion {
    pub(crate) fn to_rustls_versions(self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        match self {
            TlsVersion::Tls1_2 => vec![&rustls::version::TLS12, &rustls::version::TLS13],
            TlsVersion::Tls1_3 => vec![&rustls::version::TLS13],
        }
    }
}

/// ALPN (Application-Layer Protocol Negotiation) protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlpnProtocol {
    /// HTTP/1.1
    Http1,
    /// HTTP/2
    H2,
    /// Custom protocol identifier.
    Custom(Vec<u8>),
}

impl AlpnProtocol {
    /// Get the protocol identifier bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AlpnProtocol::Http1 => b"http/1.1",
            AlpnProtocol::H2 => b"h2",
            AlpnProtocol::Custom(bytes) => bytes,
        }
    }
}

/// A certificate, used as an extra trust root or as a pin source.
#[derive(Clone)]
pub struct Certificate {
    der_certs: Vec<CertificateDer<'static>>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("cert_count", &self.der_certs.len())
            .finish()
    }
}

impl Certificate {
    /// Load certificates from PEM-encoded bytes.
    pub fn from_pem(pem_data: impl AsRef<[u8]>) -> Result<Self> {
        let mut reader = BufReader::new(Cursor::new(pem_data.as_ref()));
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::config(format!("Failed to parse PEM certificate: {}", e)))?;

        if certs.is_empty() {
            return Err(Error::config("No certificates found in PEM data"));
        }

        Ok(Self { der_certs: certs })
    }

    /// Load certificates from a PEM-encoded file.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        let pem_data = std::fs::read(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read certificate file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_pem(pem_data)
    }

    /// Wrap a DER-encoded certificate.
    pub fn from_der(der_data: impl Into<Vec<u8>>) -> Self {
        Self {
            der_certs: vec![CertificateDer::from(der_data.into())],
        }
    }

    pub(crate) fn der_certs(&self) -> &[CertificateDer<'static>] {
        &self.der_certs
    }
}

/// The certificate chain presented by a peer during the handshake.
#[derive(Debug)]
pub struct PeerCertificates<'a> {
    /// DER bytes of the end-entity certificate.
    pub end_entity: &'a [u8],
    /// DER bytes of intermediate certificates, in presentation order.
    pub intermediates: Vec<&'a [u8]>,
    /// The server name the client is connecting to.
    pub server_name: String,
}

impl PeerCertificates<'_> {
    /// Iterate over every certificate in the chain, end entity first.
    pub fn chain(&self) -> impl Iterator<Item = &[u8]> {
        std::iter::once(self.end_entity).chain(self.intermediates.iter().copied())
    }
}

/// Decision returned by a [`CertificateValidator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateVerdict {
    /// Trust the peer.
    Accept,
    /// Refuse the peer, with a reason for logging.
    Reject(String),
}

/// Approves or rejects a peer's certificate chain.
///
/// Invoked once per connection attempt, before any data is exchanged.
pub trait CertificateValidator: Send + Sync {
    /// Inspect the peer chain.
    fn validate(&self, peer: &PeerCertificates<'_>) -> CertificateVerdict;
}

impl<F> CertificateValidator for F
where
    F: Fn(&PeerCertificates<'_>) -> CertificateVerdict + Send + Sync,
{
    fn validate(&self, peer: &PeerCertificates<'_>) -> CertificateVerdict {
        self(peer)
    }
}

/// A validator that accepts a peer only if some certificate in its chain
/// has a pinned SHA-256 fingerprint.
#[derive(Debug, Clone, Default)]
pub struct CertificatePins {
    pins: Vec<[u8; 32]>,
}

impl CertificatePins {
    /// Create an empty pin set. An empty set rejects every peer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pin given as `sha256/<base64>` or as 64 hex characters.
    pub fn pin(mut self, pin: &str) -> Result<Self> {
        self.pins.push(parse_pin(pin)?);
        Ok(self)
    }

    /// Pin every certificate contained in `cert`.
    pub fn pin_certificate(mut self, cert: &Certificate) -> Self {
        for der in cert.der_certs() {
            self.pins.push(fingerprint(der.as_ref()));
        }
        self
    }

    /// Pin a raw SHA-256 fingerprint.
    pub fn pin_fingerprint(mut self, fingerprint: [u8; 32]) -> Self {
        self.pins.push(fingerprint);
        self
    }

    /// Number of pins.
    pub fn len(&self) -> usize {
        self.pins.len()
    }

    /// Check if no pins are configured.
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

impl CertificateValidator for CertificatePins {
    fn validate(&self, peer: &PeerCertificates<'_>) -> CertificateVerdict {
        for der in peer.chain() {
            let digest = fingerprint(der);
            if self.pins.contains(&digest) {
                return CertificateVerdict::Accept;
            }
        }
        CertificateVerdict::Reject(format!(
            "no pinned certificate in chain for '{}'",
            peer.server_name
        ))
    }
}

/// SHA-256 fingerprint of DER certificate bytes.
pub fn fingerprint(der: &[u8]) -> [u8; 32] {
    Sha256::digest(der).into()
}

/// Format a fingerprint as `sha256/<base64>`.
pub fn format_pin(fingerprint: &[u8; 32]) -> String {
    format!(
        "sha256/{}",
        base64::engine::general_purpose::STANDARD.encode(fingerprint)
    )
}

fn parse_pin(pin: &str) -> Result<[u8; 32]> {
    let bytes = if let Some(encoded) = pin.strip_prefix("sha256/") {
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::config(format!("Invalid pin '{pin}': {e}")))?
    } else {
        hex::decode(pin).map_err(|e| Error::config(format!("Invalid pin '{pin}': {e}")))?
    };
    bytes
        .try_into()
        .map_err(|_| Error::config(format!("Pin '{pin}' is not a SHA-256 digest")))
}

/// TLS configuration shared by the HTTP and WebSocket transports.
#[derive(Clone, Default)]
pub struct TlsConfig {
    /// Additional root certificates to trust.
    pub root_certificates: Vec<Certificate>,
    /// Whether to use only the provided root certificates (no bundled roots).
    pub use_only_custom_roots: bool,
    /// Minimum TLS version.
    pub min_version: TlsVersion,
    /// ALPN protocols to advertise.
    pub alpn_protocols: Vec<AlpnProtocol>,
    /// Application certificate validator (pinning).
    pub validator: Option<Arc<dyn CertificateValidator>>,
    /// When a validator is set, also require a valid chain to the roots.
    pub verify_chain_with_validator: bool,
    rejections: Arc<RejectionLog>,
}

/// Rejections made by the validator of one [`TlsConfig`].
///
/// Every rustls configuration built from the same `TlsConfig` records
/// here, so a transport can attribute a failed handshake to the validator
/// even when its client library does not expose the rustls error.
#[derive(Debug, Default)]
pub(crate) struct RejectionLog {
    count: AtomicU64,
    last_reason: Mutex<Option<String>>,
}

impl RejectionLog {
    fn record(&self, reason: &str) {
        *self.last_reason.lock() = Some(reason.to_string());
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of rejections so far.
    pub(crate) fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Reason given for the most recent rejection.
    pub(crate) fn last_reason(&self) -> Option<String> {
        self.last_reason.lock().clone()
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("root_certificates", &self.root_certificates)
            .field("use_only_custom_roots", &self.use_only_custom_roots)
            .field("min_version", &self.min_version)
            .field("alpn_protocols", &self.alpn_protocols)
            .field("validator", &self.validator.is_some())
            .field("verify_chain_with_validator", &self.verify_chain_with_validator)
            .finish()
    }
}

impl TlsConfig {
    /// Create a new TLS configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root certificate to trust.
    pub fn add_root_certificate(mut self, cert: Certificate) -> Self {
        self.root_certificates.push(cert);
        self
    }

    /// Use only custom root certificates.
    pub fn use_only_custom_roots(mut self) -> Self {
        self.use_only_custom_roots = true;
        self
    }

    /// Set the minimum TLS version.
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    /// Add an ALPN protocol.
    pub fn alpn_protocol(mut self, protocol: AlpnProtocol) -> Self {
        self.alpn_protocols.push(protocol);
        self
    }

    /// Install a certificate validator. By default it replaces chain
    /// validation against the trust store.
    pub fn validator(mut self, validator: impl CertificateValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Install a shared certificate validator.
    pub fn shared_validator(mut self, validator: Arc<dyn CertificateValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Require trust-store validation in addition to the validator.
    pub fn verify_chain_too(mut self) -> Self {
        self.verify_chain_with_validator = true;
        self
    }

    /// Check if this configuration has any custom settings.
    pub fn is_default(&self) -> bool {
        self.root_certificates.is_empty()
            && !self.use_only_custom_roots
            && self.min_version == TlsVersion::Tls1_2
            && self.alpn_protocols.is_empty()
            && self.validator.is_none()
    }

    /// The rejection log shared by configurations built from this one.
    pub(crate) fn rejections(&self) -> &Arc<RejectionLog> {
        &self.rejections
    }

    /// Build a rustls client configuration.
    pub fn build_rustls_config(&self) -> Result<Arc<ClientConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let versions = self.min_version.to_rustls_versions();

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&versions)
            .map_err(|e| Error::config(format!("Unsupported TLS versions: {e}")))?;

        let mut config = match self.validator {
            Some(ref validator) => {
                let chain_verifier = if self.verify_chain_with_validator {
                    let roots = Arc::new(self.build_root_store()?);
                    let verifier = WebPkiServerVerifier::builder_with_provider(roots, provider.clone())
                        .build()
                        .map_err(|e| Error::config(format!("Invalid trust store: {e}")))?;
                    Some(verifier)
                } else {
                    None
                };
                let verifier = ValidatingVerifier {
                    validator: validator.clone(),
                    chain_verifier,
                    provider,
                    rejections: self.rejections.clone(),
                };
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(verifier))
                    .with_no_client_auth()
            }
            None => builder
                .with_root_certificates(self.build_root_store()?)
                .with_no_client_auth(),
        };

        if !self.alpn_protocols.is_empty() {
            config.alpn_protocols = self
                .alpn_protocols
                .iter()
                .map(|p| p.as_bytes().to_vec())
                .collect();
        }

        Ok(Arc::new(config))
    }

    fn build_root_store(&self) -> Result<RootCertStore> {
        let mut root_store = RootCertStore::empty();

        if !self.use_only_custom_roots {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        for cert in &self.root_certificates {
            for der_cert in cert.der_certs() {
                root_store
                    .add(der_cert.clone())
                    .map_err(|e| Error::config(format!("Failed to add root certificate: {}", e)))?;
            }
        }

        if root_store.is_empty() {
            return Err(Error::config(
                "No root certificates available. Either add custom certificates or \
                 don't use use_only_custom_roots()",
            ));
        }

        Ok(root_store)
    }
}

/// rustls verifier that delegates the trust decision to a
/// [`CertificateValidator`], optionally after webpki chain validation.
pub(crate) struct ValidatingVerifier {
    validator: Arc<dyn CertificateValidator>,
    chain_verifier: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    rejections: Arc<RejectionLog>,
}

impl std::fmt::Debug for ValidatingVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatingVerifier")
            .field("verify_chain", &self.chain_verifier.is_some())
            .finish()
    }
}

impl ServerCertVerifier for ValidatingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if let Some(ref chain_verifier) = self.chain_verifier {
            chain_verifier.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            )?;
        }

        let peer = PeerCertificates {
            end_entity: end_entity.as_ref(),
            intermediates: intermediates.iter().map(|c| c.as_ref()).collect(),
            server_name: server_name.to_str().into_owned(),
        };

        match self.validator.validate(&peer) {
            CertificateVerdict::Accept => Ok(ServerCertVerified::assertion()),
            CertificateVerdict::Reject(reason) => {
                tracing::warn!(
                    target: targets::TLS,
                    server = %peer.server_name,
                    %reason,
                    "Peer certificate rejected"
                );
                self.rejections.record(&reason);
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Whether an error chain contains a rejection from the certificate
/// validator.
///
/// TLS errors reach the transports wrapped in one or more `io::Error`s,
/// whose `source()` skips the wrapped error, so those are unwrapped
/// explicitly.
pub(crate) fn is_certificate_rejection(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(tls) = err.downcast_ref::<rustls::Error>() {
            return matches!(
                tls,
                rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
            );
        }
        current = match err.downcast_ref::<std::io::Error>() {
            Some(io) => io
                .get_ref()
                .map(|inner| inner as &(dyn std::error::Error + 'static)),
            None => err.source(),
        };
    }
    false
}
