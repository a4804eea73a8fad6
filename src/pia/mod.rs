//! Private Internet Access API client
//!
//! - `models`: typed records (hosts, regions, connections, leases)
//! - `transport`: HTTPS transport, including requests pinned to a server IP
//! - `api`: token, region list and key registration
//! - `port_forward`: port-forward lease renewal

pub mod api;
pub mod models;
pub mod port_forward;
pub mod transport;

pub use api::{ApiError, Credentials, PiaClient};
pub use models::{Connection, Host, Lease, Region};
pub use port_forward::{LeaseSource, PortForward};
pub use transport::{HttpTransport, Request, Response, Transport, TransportError};
