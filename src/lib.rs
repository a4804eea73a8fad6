//! pia-wg - Private Internet Access over WireGuard
//!
//! Registers a fresh WireGuard key with a PIA server, writes a wg-quick config
//! for it, brings the interface up and checks traffic really leaves through the
//! server. Optionally keeps a forwarded port bound.
//!
//! # Architecture
//!
//! - `state`: persistent data file (token, regions, connection, lease)
//! - `pia`: PIA API client and port-forward lease renewal
//! - `wireguard`: keys, config files and the `wg-quick` supervisor
//! - `verify`: public address check
//! - `connection`: bounded-retry connection lifecycle
//! - `hooks`: user command run when the forwarded port changes
//! - `config`: configuration file handling (TOML)
//! - `platform`: runtime requirement checks
//!
//! # Usage
//!
//! Typically run from a timer every few minutes:
//! ```bash
//! sudo pia-wg --username p1234567 --region uk --port-forward connect
//! ```

pub mod config;
pub mod connection;
pub mod hooks;
pub mod pia;
pub mod platform;
pub mod state;
pub mod verify;
pub mod wireguard;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use connection::{ConnectError, ConnectOptions, ConnectionManager, Outcome};
pub use state::DataStore;
