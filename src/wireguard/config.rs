//! WireGuard configuration file format
//!
//! The server hostname has no place in the wg-quick format, so it rides along
//! as a comment in the peer section. That is enough to rebuild the connection
//! from the file alone.

use crate::pia::models::{Connection, Host};
use crate::wireguard::keys::PrivateKey;
use std::fmt::Write as _;

pub const PERSISTENT_KEEPALIVE: u16 = 25;
const HOSTNAME_COMMENT: &str = "# Hostname =";

pub fn render_config(connection: &Connection, private_key: &PrivateKey) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "Address = {}", connection.assigned_address);
    let _ = writeln!(out, "PrivateKey = {}", private_key.to_base64());
    if !connection.dns_servers.is_empty() {
        let _ = writeln!(out, "DNS = {}", connection.dns_servers.join(", "));
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[Peer]");
    let _ = writeln!(out, "PersistentKeepalive = {}", PERSISTENT_KEEPALIVE);
    let _ = writeln!(out, "PublicKey = {}", connection.server_public_key);
    let _ = writeln!(out, "AllowedIPs = 0.0.0.0/0");
    let _ = writeln!(out, "Endpoint = {}", connection.endpoint_addr());
    let _ = writeln!(out, "{} {}", HOSTNAME_COMMENT, connection.endpoint.hostname);
    out
}

/// Recover the connection a config file was written from.
///
/// Returns `None` for files this crate did not write or that were edited into
/// something incomplete.
pub fn parse_config(content: &str) -> Option<Connection> {
    let mut address = None;
    let mut dns = Vec::new();
    let mut server_key = None;
    let mut endpoint = None;
    let mut hostname = None;

    for line in content.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix(HOSTNAME_COMMENT) {
            hostname = Some(rest.trim().to_string());
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Address" => address = Some(value.to_string()),
            "DNS" => {
                dns = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }
            "PublicKey" => server_key = Some(value.to_string()),
            "Endpoint" => endpoint = value.parse::<std::net::SocketAddr>().ok(),
            _ => {}
        }
    }

    let endpoint = endpoint?;
    Some(Connection {
        endpoint: Host::new(hostname?, &endpoint.ip().to_string()).ok()?,
        port: endpoint.port(),
        assigned_address: address?,
        server_public_key: server_key?,
        dns_servers: dns,
    })
}
