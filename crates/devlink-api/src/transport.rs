// HTTP transport: reqwest client construction and a retrying request helper.
//
// Hub registration and any application-side REST calls go through
// `HttpClient`, which retries connect failures, timeouts and 5xx answers
// according to a `RetryPolicy`. Client errors (4xx) are returned as-is.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::de::DeserializeOwned;
use tokio_tungstenite::Connector;
use url::Url;

use crate::error::Error;

const USER_AGENT: &str = concat!("devlink/", env!("CARGO_PKG_VERSION"));

/// TLS verification mode.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Use the bundled web PKI roots.
    #[default]
    System,
    /// Trust an additional CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate (lab platforms with self-signed certs).
    DangerAcceptInvalid,
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    /// Default per-request timeout; individual requests may override it.
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::System,
            timeout: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT);

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&cert_pem)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }
}

// ── WebSocket TLS ────────────────────────────────────────────────────

impl TlsMode {
    /// Connector for `wss://` sessions. `None` keeps tungstenite's
    /// default, which trusts the bundled web PKI roots.
    pub fn websocket_connector(&self) -> Result<Option<Connector>, Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = match self {
            Self::System => return Ok(None),
            Self::CustomCa(path) => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                for cert in read_ca_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                }
                rustls_builder(provider)?
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
            Self::DangerAcceptInvalid => rustls_builder(Arc::clone(&provider))?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
                .with_no_client_auth(),
        };
        Ok(Some(Connector::Rustls(Arc::new(config))))
    }
}

fn rustls_builder(
    provider: Arc<CryptoProvider>,
) -> Result<rustls::ConfigBuilder<rustls::ClientConfig, rustls::WantsVerifier>, Error> {
    rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("unsupported TLS setup: {e}")))
}

fn read_ca_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Skips chain and hostname checks; handshake signatures are still verified.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

// ── Retry policy ─────────────────────────────────────────────────────

/// How many times a request is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts. `0` is treated as `1`.
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.retries.max(1)
    }
}

// ── Request / response ───────────────────────────────────────────────

/// A single HTTP request, replayable across retries.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: reqwest::Method,
    pub url: Url,
    pub body: Option<serde_json::Value>,
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: reqwest::Method, url: Url) -> Self {
        Self {
            method,
            url,
            body: None,
            headers: HeaderMap::new(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl HttpResponse {
    async fn read(resp: reqwest::Response) -> Result<Self, Error> {
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.text().await?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_str(&self.body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: self.body.clone(),
        })
    }
}

// ── HttpClient ───────────────────────────────────────────────────────

/// reqwest wrapper that applies a [`RetryPolicy`] to every request.
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(transport: &TransportConfig, retry: RetryPolicy) -> Result<Self, Error> {
        Ok(Self {
            http: transport.build_client()?,
            retry,
        })
    }

    /// Wrap an existing `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, retry: RetryPolicy) -> Self {
        Self { http, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Send `request`, retrying transient failures.
    ///
    /// A 5xx on the last attempt is returned as a response so callers can
    /// inspect the body; a transport failure on the last attempt becomes
    /// [`Error::RetriesExhausted`].
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        let attempts = self.retry.attempts();
        let mut reason = String::new();

        for attempt in 1..=attempts {
            let last = attempt == attempts;
            let mut builder = self
                .http
                .request(request.method.clone(), request.url.clone())
                .headers(request.headers.clone());
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }

            tracing::debug!(method = %request.method, url = %request.url, attempt, "HTTP request");

            match builder.send().await {
                Ok(resp) if resp.status().is_server_error() && !last => {
                    tracing::warn!(
                        url = %request.url,
                        status = resp.status().as_u16(),
                        attempt,
                        "Server error, retrying"
                    );
                }
                Ok(resp) => return HttpResponse::read(resp).await,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    tracing::warn!(url = %request.url, error = %e, attempt, "HTTP request failed");
                    reason = e.to_string();
                }
                Err(e) => return Err(Error::Transport(e)),
            }

            if !last {
                tokio::time::sleep(self.retry.retry_delay).await;
            }
        }

        Err(Error::RetriesExhausted {
            url: request.url.to_string(),
            attempts,
            reason,
        })
    }

    pub async fn get(&self, url: &Url) -> Result<HttpResponse, Error> {
        self.send(HttpRequest::new(reqwest::Method::GET, url.clone()))
            .await
    }

    pub async fn head(&self, url: &Url) -> Result<HttpResponse, Error> {
        self.send(HttpRequest::new(reqwest::Method::HEAD, url.clone()))
            .await
    }

    pub async fn delete(&self, url: &Url) -> Result<HttpResponse, Error> {
        self.send(HttpRequest::new(reqwest::Method::DELETE, url.clone()))
            .await
    }

    pub async fn post_json(
        &self,
        url: &Url,
        body: serde_json::Value,
    ) -> Result<HttpResponse, Error> {
        self.send(HttpRequest::new(reqwest::Method::POST, url.clone()).json(body))
            .await
    }

    pub async fn put_json(
        &self,
        url: &Url,
        body: serde_json::Value,
    ) -> Result<HttpResponse, Error> {
        self.send(HttpRequest::new(reqwest::Method::PUT, url.clone()).json(body))
            .await
    }
}
