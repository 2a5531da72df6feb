use std::future::Future;

use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

/// Path the platform answers on every mapped host with its verification token.
pub const VERIFY_PATH: &str = "/.well-known/hostmap/verify";

/// Checks a hostname from the outside.
pub trait Probe: Send + Sync {
    /// Confirms the host answers over plain HTTP with this platform's token.
    fn check_reachable(&self, host: &str) -> impl Future<Output = Result<(), ProbeError>> + Send;

    /// Returns `true` when the same check succeeds over HTTPS.
    fn check_https(&self, host: &str) -> impl Future<Output = bool> + Send;
}

/// Probe that fetches [`VERIFY_PATH`] over HTTP(S) using `reqwest`.
#[derive(Clone)]
pub struct HttpProbe {
    http: Client,
    expected_token: String,
    http_port: Option<u16>,
    https_port: Option<u16>,
}

impl HttpProbe {
    /// Creates a probe expecting `expected_token` as the response body.
    pub fn new(http: Client, expected_token: impl Into<String>) -> Self {
        Self {
            http,
            expected_token: expected_token.into(),
            http_port: None,
            https_port: None,
        }
    }

    /// Overrides the ports probed for each scheme.
    pub fn with_ports(mut self, http_port: Option<u16>, https_port: Option<u16>) -> Self {
        self.http_port = http_port;
        self.https_port = https_port;
        self
    }

    fn verify_url(&self, scheme: &str, host: &str) -> Result<Url, ProbeError> {
        let port = match scheme {
            "https" => self.https_port,
            _ => self.http_port,
        };
        let authority = match port {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok(Url::parse(&format!("{scheme}://{authority}{VERIFY_PATH}"))?)
    }

    async fn fetch_token(&self, url: Url) -> Result<(), ProbeError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status { status });
        }

        let body = response.text().await?;
        if body.trim() != self.expected_token {
            return Err(ProbeError::TokenMismatch);
        }
        Ok(())
    }
}

impl Probe for HttpProbe {
    async fn check_reachable(&self, host: &str) -> Result<(), ProbeError> {
        let url = self.verify_url("http", host)?;
        self.fetch_token(url).await
    }

    async fn check_https(&self, host: &str) -> bool {
        match self.verify_url("https", host) {
            Ok(url) => self.fetch_token(url).await.is_ok(),
            Err(_) => false,
        }
    }
}

/// Errors produced while probing a host.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}")]
    Status { status: StatusCode },
    #[error("host answered with a different verification token")]
    TokenMismatch,
}

impl ProbeError {
    /// Whether retrying later may succeed.
    ///
    /// Network trouble and server errors are transient; a malformed host or a
    /// host served by someone else is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Url(_) => false,
            Self::Http(err) => !err.is_builder(),
            Self::Status { status } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::TokenMismatch => false,
        }
    }
}
