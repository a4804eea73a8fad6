//! HTTPS transport for the PIA APIs
//!
//! Two kinds of request are made:
//! - plain GETs to public URLs (token, region list, public-IP check)
//! - GETs to a VPN server dialed by IP, where TLS is validated against the PIA
//!   root CA for the server's advertised hostname, which is also sent as the
//!   `Host` header

use crate::pia::models::Host;
use reqwest::{Certificate, Client};
use std::fs;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Applied to every request that does not set its own timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub const CA_CERT_URL: &str =
    "https://raw.githubusercontent.com/pia-foss/manual-connections/master/ca.rsa.4096.crt";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to cache CA certificate at {path}: {source}")]
    CaCache {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Connection failed: {0}")]
    Connect(String),
}

impl TransportError {
    /// Failed on this machine rather than on the network
    pub fn is_local(&self) -> bool {
        matches!(self, TransportError::CaCache { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Url(String),
    /// Dial `host.ip:port`, present `host.hostname` for TLS and `Host`
    Pinned { host: Host, port: u16, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub target: Target,
    pub query: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Target::Url(url.into()))
    }

    pub fn pinned(host: &Host, port: u16, path: impl Into<String>) -> Self {
        Self::new(Target::Pinned {
            host: host.clone(),
            port,
            path: path.into(),
        })
    }

    fn new(target: Target) -> Self {
        Self {
            target,
            query: Vec::new(),
            basic_auth: None,
            timeout: None,
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn basic_auth(mut self, username: &str, password: &str) -> Self {
        self.basic_auth = Some((username.to_string(), password.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Full URL for public requests, path for pinned ones
    pub fn route(&self) -> &str {
        match &self.target {
            Target::Url(url) => url,
            Target::Pinned { path, .. } => path,
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Sends one GET and returns the raw status and body.
///
/// Only network-level failures are errors; interpreting the status is left to
/// the caller.
pub trait Transport {
    fn get(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send;
}

/// `Transport` backed by reqwest with rustls
pub struct HttpTransport {
    client: Client,
    ca_path: PathBuf,
    ca_url: String,
}

impl HttpTransport {
    /// `ca_path` is where the PIA root certificate is cached; it is downloaded
    /// the first time a pinned request is made.
    pub fn new(ca_path: impl Into<PathBuf>) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            ca_path: ca_path.into(),
            ca_url: CA_CERT_URL.to_string(),
        })
    }

    async fn ca_certificate(&self) -> Result<Certificate, TransportError> {
        let cache_err = |source: io::Error| TransportError::CaCache {
            path: self.ca_path.clone(),
            source,
        };

        if !self.ca_path.exists() {
            info!("Downloading PIA SSL certificate");
            let pem = self
                .client
                .get(&self.ca_url)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;
            // Reject anything that is not a certificate before caching it
            Certificate::from_pem(pem.as_bytes())?;
            if let Some(parent) = self.ca_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(cache_err)?;
            }
            fs::write(&self.ca_path, &pem).map_err(cache_err)?;
        }

        let pem = fs::read(&self.ca_path).map_err(cache_err)?;
        Ok(Certificate::from_pem(&pem)?)
    }

    fn pinned_client(
        &self,
        host: &Host,
        port: u16,
        ca: Certificate,
    ) -> Result<Client, TransportError> {
        Ok(Client::builder()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .resolve(&host.hostname, SocketAddr::new(host.ip, port))
            .timeout(DEFAULT_TIMEOUT)
            .build()?)
    }
}

impl Transport for HttpTransport {
    async fn get(&self, request: Request) -> Result<Response, TransportError> {
        let (client, url) = match &request.target {
            Target::Url(url) => (self.client.clone(), url.clone()),
            Target::Pinned { host, port, path } => {
                let ca = self.ca_certificate().await?;
                let client = self.pinned_client(host, *port, ca)?;
                (client, format!("https://{}:{}{}", host.hostname, port, path))
            }
        };
        debug!("GET {}", url);

        let mut builder = client.get(&url).query(&request.query);
        if let Some((username, password)) = &request.basic_auth {
            builder = builder.basic_auth(username, Some(password));
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!("Response {} ({} bytes)", status, body.len());
        Ok(Response { status, body })
    }
}
