//! Public address verification
//!
//! The tunnel is only trusted once traffic to the outside world appears to
//! come from the VPN server. Failure here is an ordinary outcome, so nothing in
//! this module returns an error.

use crate::pia::transport::{Request, Transport};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const IP_CHECK_URL: &str = "https://api.ipify.org";
pub const IP_CHECK_RETRIES: u32 = 3;
pub const IP_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Ask `url` for this host's public address, retrying transport failures and
/// malformed answers
pub async fn public_ip<T: Transport>(transport: &T, url: &str) -> Option<IpAddr> {
    for attempt in 1..=IP_CHECK_RETRIES {
        let request = Request::get(url).timeout(IP_CHECK_TIMEOUT);
        match transport.get(request).await {
            Ok(response) if response.status == 200 => match response.body.trim().parse() {
                Ok(ip) => return Some(ip),
                Err(_) => debug!(
                    "Public IP check returned garbage (attempt {}): {:?}",
                    attempt,
                    response.body.trim()
                ),
            },
            Ok(response) => debug!(
                "Public IP check returned HTTP {} (attempt {})",
                response.status, attempt
            ),
            Err(e) => debug!("Public IP check failed (attempt {}): {}", attempt, e),
        }
    }
    warn!("Could not determine public IP after {} attempts", IP_CHECK_RETRIES);
    None
}

/// True when the public address seen from outside is `expected`
pub async fn endpoint_reachable<T: Transport>(transport: &T, url: &str, expected: IpAddr) -> bool {
    match public_ip(transport, url).await {
        Some(ip) if ip == expected => {
            info!("Connection OK");
            true
        }
        Some(ip) => {
            warn!("IP mismatch. Public: {}, Expected: {}", ip, expected);
            false
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;

    const URL: &str = "https://ip.test";

    #[tokio::test]
    async fn test_public_ip_first_try() {
        let transport = FakeTransport::new();
        transport.reply(URL, 200, "9.9.9.9\n");

        assert_eq!(public_ip(&transport, URL).await, Some("9.9.9.9".parse().unwrap()));
        assert_eq!(transport.count(URL), 1);
        assert_eq!(transport.requests_to(URL)[0].timeout, Some(IP_CHECK_TIMEOUT));
    }

    #[tokio::test]
    async fn test_public_ip_retries_transport_errors_and_garbage() {
        let transport = FakeTransport::new();
        transport.fail(URL, "timed out");
        transport.reply(URL, 200, "<html>rate limited</html>");
        transport.reply(URL, 200, "9.9.9.9");

        assert_eq!(public_ip(&transport, URL).await, Some("9.9.9.9".parse().unwrap()));
        assert_eq!(transport.count(URL), 3);
    }

    #[tokio::test]
    async fn test_public_ip_gives_up() {
        let transport = FakeTransport::new();
        transport.fail(URL, "unreachable");

        assert_eq!(public_ip(&transport, URL).await, None);
        assert_eq!(transport.count(URL), IP_CHECK_RETRIES as usize);
    }

    #[tokio::test]
    async fn test_endpoint_reachable() {
        let transport = FakeTransport::new();
        transport.reply(URL, 200, "9.9.9.9");

        assert!(endpoint_reachable(&transport, URL, "9.9.9.9".parse().unwrap()).await);
        assert!(!endpoint_reachable(&transport, URL, "1.1.1.1".parse().unwrap()).await);
    }
}
