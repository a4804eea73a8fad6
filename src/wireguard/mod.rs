//! Local WireGuard tunnel management
//!
//! The connection manager only sees `TunnelSupervisor`; `WgQuickSupervisor`
//! implements it with the `wg` and `wg-quick` tools.

pub mod config;
pub mod keys;
pub mod wg_quick;

use crate::pia::models::Connection;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

pub use keys::{generate_keypair, KeyPair, PrivateKey, PublicKey};
pub use wg_quick::WgQuickSupervisor;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{tool} {action} failed: {stderr}")]
    Command {
        tool: &'static str,
        action: &'static str,
        stderr: String,
    },
}

/// Transfer totals and handshake state of the tunnel's peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub endpoint: Option<SocketAddr>,
    pub latest_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Everything the connection manager needs from the local tunnel.
///
/// Anything that runs an external tool is async; the config file calls are
/// plain filesystem work.
pub trait TunnelSupervisor {
    fn config_exists(&self) -> bool;
    fn interface_active(&self) -> impl Future<Output = bool>;
    /// Bring the interface up; `false` when it did not come up
    fn bring_up(&self) -> impl Future<Output = bool>;
    fn bring_down(&self) -> impl Future<Output = Result<(), TunnelError>>;
    fn write_config(
        &self,
        connection: &Connection,
        private_key: &PrivateKey,
    ) -> Result<(), TunnelError>;
    /// Remove the local config, taking the interface down first if it is up.
    ///
    /// A failed `bring_down` is logged and the file is removed anyway; only
    /// failing to delete the file is an error.
    fn remove_config(&self) -> impl Future<Output = Result<(), TunnelError>>;
    /// Connection recorded in the local config, if there is a readable one
    fn read_connection(&self) -> Result<Option<Connection>, TunnelError>;
    fn traffic_stats(&self) -> impl Future<Output = Option<TrafficStats>>;
}

/// Parse `wg show <interface> dump`.
///
/// The first line describes the interface; the first peer line after it holds
/// the numbers.
pub fn parse_dump(dump: &str) -> Option<TrafficStats> {
    let peer = dump.lines().nth(1)?;
    let fields: Vec<&str> = peer.split('\t').collect();
    if fields.len() < 7 {
        return None;
    }
    let handshake: i64 = fields[4].parse().ok()?;
    Some(TrafficStats {
        endpoint: fields[2].parse().ok(),
        latest_handshake: if handshake > 0 {
            DateTime::from_timestamp(handshake, 0)
        } else {
            None
        },
        rx_bytes: fields[5].parse().ok()?,
        tx_bytes: fields[6].parse().ok()?,
    })
}

const UNITS: [&str; 9] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];

/// Human-readable byte count in binary units
pub fn format_bytes(bytes: u128) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
