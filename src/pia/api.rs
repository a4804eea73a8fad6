//! Typed PIA API operations
//!
//! Each operation is a single request/response exchange. Results that are worth
//! keeping (token, region list, connection, lease) are written through to the
//! data store as soon as they arrive.

use crate::pia::models::{Connection, Host, Lease, LeaseError, ModelError, Region};
use crate::pia::transport::{Request, Response, Transport, TransportError};
use crate::state::{DataStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::{debug, error, info};

pub const TOKEN_URL: &str = "https://www.privateinternetaccess.com/gtoken/generateToken";
pub const REGION_URL: &str = "https://serverlist.piaservers.net/vpninfo/servers/v6";

/// Tokens are good for an hour from when they were fetched
pub const TOKEN_LIFE_SECS: i64 = 3600;
pub const REGION_LIFE_SECS: i64 = 12 * 3600;

/// Anything shorter is a truncated download, not a real region list
pub const MIN_REGION_BODY_LEN: usize = 1000;

pub const AUTH_PORT: u16 = 1337;
pub const PORT_FORWARD_PORT: u16 = 19999;

const STATUS_OK: &str = "OK";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Failed to {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("Failed to {operation} ({message})")]
    Rejected {
        operation: &'static str,
        message: String,
    },
    #[error("Failed to {operation} (HTTP {status})")]
    HttpStatus { operation: &'static str, status: u16 },
    #[error("Invalid response: {0}")]
    Validation(String),
    #[error("Region ID \"{0}\" not found")]
    UnknownRegion(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    /// Errors no amount of retrying will fix: bad configuration and local I/O
    pub fn is_fatal(&self) -> bool {
        match self {
            ApiError::UnknownRegion(_) | ApiError::Store(_) => true,
            ApiError::Transport { source, .. } => source.is_local(),
            _ => false,
        }
    }
}

impl From<ModelError> for ApiError {
    fn from(e: ModelError) -> Self {
        ApiError::Validation(e.to_string())
    }
}

impl From<LeaseError> for ApiError {
    fn from(e: LeaseError) -> Self {
        ApiError::Validation(format!("Unusable port forward payload: {}", e))
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    status: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegionList {
    regions: Vec<RawRegion>,
}

#[derive(Debug, Deserialize)]
struct RawRegion {
    id: String,
    name: String,
    #[serde(default)]
    port_forward: bool,
    servers: RawServers,
}

// Other server kinds (ikev2, ovpntcp, meta...) are ignored
#[derive(Debug, Deserialize)]
struct RawServers {
    #[serde(default)]
    wg: Option<Vec<RawServer>>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    cn: String,
    ip: String,
}

#[derive(Debug, Deserialize)]
struct AddKeyResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    peer_ip: Option<String>,
    #[serde(default)]
    dns_servers: Vec<String>,
    #[serde(default)]
    server_key: Option<String>,
    #[serde(default)]
    server_ip: Option<String>,
    #[serde(default, deserialize_with = "deserialize_port")]
    server_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct SignatureResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    payload: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BindResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

/// The port arrives as a number from some servers and a string from others
fn deserialize_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(u16),
        Text(String),
    }

    match Option::<RawPort>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawPort::Number(port)) => Ok(Some(port)),
        Some(RawPort::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Client for one PIA account, owning that account's data store
pub struct PiaClient<T> {
    transport: T,
    credentials: Credentials,
    store: DataStore,
}

impl<T: Transport> PiaClient<T> {
    pub fn new(transport: T, credentials: Credentials, store: DataStore) -> Self {
        Self {
            transport,
            credentials,
            store,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    /// Auth token for the configured account, fetched only when the cached one
    /// is missing, stale or belongs to someone else
    pub async fn token(&mut self) -> Result<String, ApiError> {
        if let Some(token) = self.store.data().cached_token(&self.credentials.username) {
            return Ok(token.to_string());
        }
        let (token, _) = self.fetch_token().await?;
        Ok(token)
    }

    pub async fn fetch_token(&mut self) -> Result<(String, DateTime<Utc>), ApiError> {
        const OP: &str = "fetch token";
        info!("Fetching a new token for user {}", self.credentials.username);

        let request = Request::get(TOKEN_URL)
            .basic_auth(&self.credentials.username, &self.credentials.password);
        let fetched_at = Utc::now();
        let response = self.send(OP, request).await?;
        let reply: TokenResponse = decode(OP, &response)?;
        check_status(OP, &reply.status, reply.message)?;
        let token = required(OP, reply.token, "token")?;

        let expiry = fetched_at + Duration::seconds(TOKEN_LIFE_SECS);
        let username = self.credentials.username.clone();
        let stored = token.clone();
        self.store.update(|data| {
            data.username = username;
            data.set_token(stored, expiry);
        })?;
        info!("Successfully got new token");
        Ok((token, expiry))
    }

    /// Region list, refreshed when the cached copy goes stale
    pub async fn regions(&mut self) -> Result<Vec<Region>, ApiError> {
        if let Some(regions) = self.store.data().cached_regions() {
            return Ok(regions.to_vec());
        }
        self.fetch_regions().await
    }

    pub async fn fetch_regions(&mut self) -> Result<Vec<Region>, ApiError> {
        info!("Fetching new region list");
        let response = self.send("fetch region list", Request::get(REGION_URL)).await?;
        let regions = parse_regions(&response)?;

        let expiry = Utc::now() + Duration::seconds(REGION_LIFE_SECS);
        let stored = regions.clone();
        self.store.update(|data| data.set_regions(stored, expiry))?;
        info!("Stored {} regions", regions.len());
        Ok(regions)
    }

    /// Register `pubkey` on server `server_index` of `region_id`
    pub async fn authenticate(
        &mut self,
        region_id: &str,
        pubkey: &str,
        server_index: usize,
    ) -> Result<Connection, ApiError> {
        const OP: &str = "authenticate";

        let regions = self.regions().await?;
        let region = regions
            .iter()
            .find(|r| r.id == region_id)
            .ok_or_else(|| ApiError::UnknownRegion(region_id.to_string()))?;
        let server = region.servers.get(server_index).ok_or_else(|| {
            ApiError::Validation(format!(
                "Region {} has {} server(s), no server #{}",
                region_id,
                region.servers.len(),
                server_index
            ))
        })?;
        let token = self.token().await?;

        let request = Request::pinned(server, AUTH_PORT, "/addKey")
            .query("pt", token)
            .query("pubkey", pubkey);
        let response = self.send(OP, request).await?;
        let reply: AddKeyResponse = decode(OP, &response)?;
        check_status(OP, &reply.status, reply.message)?;

        let server_ip = required(OP, reply.server_ip, "server_ip")?;
        let connection = Connection {
            endpoint: Host::new(server.hostname.clone(), &server_ip)?,
            port: required(OP, reply.server_port, "server_port")?,
            assigned_address: required(OP, reply.peer_ip, "peer_ip")?,
            server_public_key: required(OP, reply.server_key, "server_key")?,
            dns_servers: reply.dns_servers,
        };

        let stored = connection.clone();
        self.store.update(|data| {
            let same_server = data
                .connection
                .as_ref()
                .is_some_and(|old| old.endpoint == stored.endpoint);
            if !same_server {
                data.lease = None;
            }
            data.connection = Some(stored);
        })?;
        info!(
            "Authenticated {} on {}",
            connection.server_public_key, connection.endpoint.hostname
        );
        Ok(connection)
    }

    /// Fetch a new port-forward signature and payload from the connected server.
    ///
    /// The lease is only stored if its payload decodes, carries the signature it
    /// came with, and has not already expired.
    pub async fn fetch_lease(&mut self, connection: &Connection) -> Result<Lease, ApiError> {
        const OP: &str = "get signature";

        let token = self.token().await?;
        let request = Request::pinned(&connection.endpoint, PORT_FORWARD_PORT, "/getSignature")
            .query("token", token);
        let response = self.send(OP, request).await?;
        let reply: SignatureResponse = decode(OP, &response)?;
        check_status(OP, &reply.status, reply.message)?;

        let lease = Lease::new(
            required(OP, reply.signature, "signature")?,
            required(OP, reply.payload, "payload")?,
        );
        let claims = lease.validate_at(Utc::now())?;
        debug!("New lease for port {} expires at {}", claims.port, claims.expires_at);

        let stored = lease.clone();
        self.store.update(|data| data.lease = Some(stored))?;
        Ok(lease)
    }

    /// Bind (or re-bind) the leased port. A refusal from the server is a
    /// `false` result, not an error.
    pub async fn bind_port(
        &self,
        connection: &Connection,
        lease: &Lease,
    ) -> Result<bool, ApiError> {
        const OP: &str = "bind port";

        let request = Request::pinned(&connection.endpoint, PORT_FORWARD_PORT, "/bindPort")
            .query("payload", lease.payload.clone())
            .query("signature", lease.signature.clone());
        let response = self.send(OP, request).await?;
        let reply: BindResponse = decode(OP, &response)?;

        if reply.status != STATUS_OK {
            error!(
                "Failed to bind port ({})",
                reply.message.unwrap_or_else(|| reply.status.clone())
            );
            return Ok(false);
        }
        Ok(true)
    }

    pub fn record_success(&mut self) -> Result<(), StoreError> {
        self.store.update(|data| data.last_success = Some(Utc::now()))
    }

    /// Drop the stored connection once its tunnel config is gone, along with
    /// its lease: a lease only binds on the server that issued it
    pub fn forget_connection(&mut self) -> Result<(), StoreError> {
        let data = self.store.data();
        if data.connection.is_none() && data.lease.is_none() {
            return Ok(());
        }
        self.store.update(|data| {
            data.connection = None;
            data.lease = None;
        })
    }

    /// Drop the stored lease so the next renewal fetches a new one
    pub fn forget_lease(&mut self) -> Result<(), StoreError> {
        if self.store.data().lease.is_none() {
            return Ok(());
        }
        self.store.update(|data| data.lease = None)
    }

    async fn send(&self, operation: &'static str, request: Request) -> Result<Response, ApiError> {
        self.transport
            .get(request)
            .await
            .map_err(|source| ApiError::Transport { operation, source })
    }
}

/// Validate and parse a region list download.
///
/// Only the first line is JSON; the provider appends a signature after it.
/// Regions without WireGuard servers are dropped and the rest sorted by id.
pub fn parse_regions(response: &Response) -> Result<Vec<Region>, ApiError> {
    if response.status != 200 {
        return Err(ApiError::HttpStatus {
            operation: "fetch region list",
            status: response.status,
        });
    }
    if response.body.len() < MIN_REGION_BODY_LEN {
        return Err(ApiError::Validation(format!(
            "Region list is suspiciously short ({} bytes)",
            response.body.len()
        )));
    }

    let first_line = response.body.lines().next().unwrap_or_default();
    let list: RegionList = serde_json::from_str(first_line)
        .map_err(|e| ApiError::Validation(format!("Malformed region list: {}", e)))?;

    let mut regions = Vec::with_capacity(list.regions.len());
    for raw in list.regions {
        let servers = raw.servers.wg.unwrap_or_default();
        if servers.is_empty() {
            debug!("Skipping region {} (no WireGuard servers)", raw.id);
            continue;
        }
        let servers = servers
            .into_iter()
            .map(|s| Host::new(s.cn, &s.ip))
            .collect::<Result<Vec<_>, _>>()?;
        regions.push(Region {
            id: raw.id,
            name: raw.name,
            port_forward: raw.port_forward,
            servers,
        });
    }
    regions.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(regions)
}

fn decode<R: DeserializeOwned>(
    operation: &'static str,
    response: &Response,
) -> Result<R, ApiError> {
    serde_json::from_str(&response.body).map_err(|e| {
        if response.status != 200 {
            ApiError::HttpStatus {
                operation,
                status: response.status,
            }
        } else {
            ApiError::Validation(format!("Malformed {} response: {}", operation, e))
        }
    })
}

fn check_status(
    operation: &'static str,
    status: &str,
    message: Option<String>,
) -> Result<(), ApiError> {
    if status == STATUS_OK {
        return Ok(());
    }
    Err(ApiError::Rejected {
        operation,
        message: message.unwrap_or_else(|| status.to_string()),
    })
}

fn required<V>(operation: &'static str, value: Option<V>, field: &str) -> Result<V, ApiError> {
    value.ok_or_else(|| {
        ApiError::Validation(format!("{} response is missing {}", operation, field))
    })
}
