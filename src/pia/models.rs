//! Typed records exchanged with the PIA APIs
//!
//! Every record here is persisted verbatim in the data file, so field names
//! double as the on-disk schema.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Invalid IP address for {hostname}: {value}")]
    InvalidIp { hostname: String, value: String },
}

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("Payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Payload was not issued under the stored signature")]
    SignatureMismatch,
    #[error("Lease expired at {0}")]
    Expired(DateTime<Utc>),
}

/// A server reachable at `ip` whose TLS certificate is issued for `hostname`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub hostname: String,
    pub ip: IpAddr,
}

impl Host {
    pub fn new(hostname: impl Into<String>, ip: &str) -> Result<Self, ModelError> {
        let hostname = hostname.into();
        let ip = ip.trim().parse().map_err(|_| ModelError::InvalidIp {
            hostname: hostname.clone(),
            value: ip.to_string(),
        })?;
        Ok(Self { hostname, ip })
    }
}

/// A server region with its WireGuard-capable hosts, in provider order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub name: String,
    pub port_forward: bool,
    pub servers: Vec<Host>,
}

/// The result of registering a public key on a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub endpoint: Host,
    pub port: u16,
    pub assigned_address: String,
    pub server_public_key: String,
    pub dns_servers: Vec<String>,
}

impl Connection {
    /// Address the tunnel's UDP traffic is sent to
    pub fn endpoint_addr(&self) -> SocketAddr {
        SocketAddr::new(self.endpoint.ip, self.port)
    }
}

/// Port-forward lease: a server-issued payload and the signature it was issued with.
///
/// The two are always stored together; the payload is only ever decoded for its
/// claims, never re-verified cryptographically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub signature: String,
    pub payload: String,
}

/// Fields carried inside a lease payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LeaseClaims {
    #[serde(default)]
    pub signature: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub port: u16,
}

impl Lease {
    pub fn new(signature: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            payload: payload.into(),
        }
    }

    /// Decode the payload without judging it
    pub fn claims(&self) -> Result<LeaseClaims, LeaseError> {
        let raw = BASE64.decode(self.payload.trim())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Decode the payload and check it is usable at `now`
    pub fn validate_at(&self, now: DateTime<Utc>) -> Result<LeaseClaims, LeaseError> {
        let claims = self.claims()?;
        if claims.signature.as_deref() != Some(self.signature.as_str()) {
            return Err(LeaseError::SignatureMismatch);
        }
        if claims.expires_at <= now {
            return Err(LeaseError::Expired(claims.expires_at));
        }
        Ok(claims)
    }

}

#[cfg(test)]
pub(crate) fn encode_payload(
    signature: Option<&str>,
    expires_at: DateTime<Utc>,
    port: u16,
) -> String {
    let mut claims = serde_json::json!({
        "expires_at": expires_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        "port": port,
    });
    if let Some(sig) = signature {
        claims["signature"] = serde_json::Value::String(sig.to_string());
    }
    BASE64.encode(claims.to_string())
}
