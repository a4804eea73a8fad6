//! Port-forward lease renewal
//!
//! A lease is a signed payload naming the forwarded port and when it expires.
//! The port stays forwarded only while it is re-bound regularly, so every
//! renewal binds, but a new lease is only fetched once the stored one is
//! unusable.

use crate::hooks::{render_command, CommandHook};
use crate::pia::api::{ApiError, PiaClient};
use crate::pia::models::Connection;
use crate::pia::transport::Transport;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseSource {
    /// Fetched during this renewal; the port may have changed
    Fetched,
    /// Still-valid lease from the data file
    Reused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    pub port: u16,
    pub source: LeaseSource,
    pub bound: bool,
}

impl<T: Transport> PiaClient<T> {
    /// Renew port forwarding on `connection`.
    ///
    /// `command` runs through `hook` only when a new lease was fetched and
    /// bound, so a reused lease never re-triggers it. Its exit status is
    /// logged but does not affect the result.
    pub async fn port_forward<H: CommandHook>(
        &mut self,
        connection: &Connection,
        command: Option<&str>,
        hook: &H,
    ) -> Result<PortForward, ApiError> {
        let cached = self.store().data().cached_lease().cloned();
        let (lease, source) = match cached {
            Some(lease) => (lease, LeaseSource::Reused),
            None => {
                info!("Fetching a new port forward lease");
                (self.fetch_lease(connection).await?, LeaseSource::Fetched)
            }
        };
        let claims = lease.claims()?;

        let bound = self.bind_port(connection, &lease).await?;
        if bound {
            info!("Port {} bound", claims.port);
        } else if source == LeaseSource::Reused {
            warn!("Stored lease for port {} was refused, dropping it", claims.port);
            self.forget_lease()?;
        }

        if let (LeaseSource::Fetched, true, Some(template)) = (source, bound, command) {
            let rendered = render_command(template, claims.port);
            info!("Port changed, running: {}", rendered);
            match hook.run(&rendered).await {
                Ok(status) if status.success() => {}
                Ok(status) => warn!("Port change command exited with {}", status),
                Err(e) => error!("Failed to run port change command: {}", e),
            }
        }

        Ok(PortForward {
            port: claims.port,
            source,
            bound,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pia::api::{Credentials, TOKEN_URL};
    use crate::pia::models::{encode_payload, Host, Lease};
    use crate::state::DataStore;
    use crate::testing::{FakeTransport, RecordingHook};
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn connection() -> Connection {
        Connection {
            endpoint: Host::new("host0", "9.9.9.9").unwrap(),
            port: 1337,
            assigned_address: "10.0.0.2".to_string(),
            server_public_key: "pk".to_string(),
            dns_servers: vec![],
        }
    }

    fn client(temp_dir: &TempDir, lease: Option<Lease>) -> PiaClient<FakeTransport> {
        let mut store =
            DataStore::open_for_account(temp_dir.path().join("data.json"), "u").unwrap();
        store
            .update(|d| {
                d.set_token("tok".to_string(), Utc::now() + Duration::hours(1));
                d.lease = lease;
            })
            .unwrap();
        PiaClient::new(FakeTransport::new(), Credentials::new("u", "p"), store)
    }

    fn signature_reply(port: u16, expires_in: Duration) -> String {
        let payload = encode_payload(Some("newsig"), Utc::now() + expires_in, port);
        format!(
            r#"{{"status": "OK", "signature": "newsig", "payload": "{}"}}"#,
            payload
        )
    }

    #[tokio::test]
    async fn test_reused_lease_only_binds() {
        let temp_dir = TempDir::new().unwrap();
        let lease = Lease::new(
            "sig",
            encode_payload(Some("sig"), Utc::now() + Duration::days(1), 5000),
        );
        let mut api = client(&temp_dir, Some(lease.clone()));
        api.transport().reply(
            "/bindPort",
            200,
            r#"{"status": "OK", "message": "port scheduled for add"}"#,
        );
        let hook = RecordingHook::new();

        let result = api
            .port_forward(&connection(), Some("echo {port}"), &hook)
            .await
            .unwrap();

        assert_eq!(
            result,
            PortForward {
                port: 5000,
                source: LeaseSource::Reused,
                bound: true
            }
        );
        assert_eq!(api.transport().requests().len(), 1);
        let bind = &api.transport().requests_to("/bindPort")[0];
        assert_eq!(bind.param("payload"), Some(lease.payload.as_str()));
        assert_eq!(bind.param("signature"), Some("sig"));
        assert!(hook.commands().is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_fetches_binds_and_notifies() {
        let temp_dir = TempDir::new().unwrap();
        let stale = Lease::new(
            "sig",
            encode_payload(Some("sig"), Utc::now() - Duration::minutes(1), 5000),
        );
        let mut api = client(&temp_dir, Some(stale));
        api.transport().reply("/getSignature", 200, signature_reply(6000, Duration::days(60)));
        api.transport().reply("/bindPort", 200, r#"{"status": "OK"}"#);
        let hook = RecordingHook::new();

        let result = api
            .port_forward(&connection(), Some("notify {port}"), &hook)
            .await
            .unwrap();

        assert_eq!(result.port, 6000);
        assert_eq!(result.source, LeaseSource::Fetched);
        assert_eq!(api.transport().requests().len(), 2);
        assert_eq!(api.transport().requests_to("/getSignature")[0].param("token"), Some("tok"));
        assert_eq!(hook.commands(), vec!["notify 6000".to_string()]);

        // Stored for the next renewal
        let stored = api.store().data().lease.clone().unwrap();
        assert_eq!(stored.signature, "newsig");
        assert_eq!(stored.claims().unwrap().port, 6000);
    }

    #[tokio::test]
    async fn test_absent_lease_without_command() {
        let temp_dir = TempDir::new().unwrap();
        let mut api = client(&temp_dir, None);
        api.transport().reply("/getSignature", 200, signature_reply(7000, Duration::days(60)));
        api.transport().reply("/bindPort", 200, r#"{"status": "OK"}"#);
        let hook = RecordingHook::new();

        let result = api.port_forward(&connection(), None, &hook).await.unwrap();
        assert_eq!(result.source, LeaseSource::Fetched);
        assert!(result.bound);
        assert_eq!(api.transport().count(TOKEN_URL), 0);
        assert!(hook.commands().is_empty());
    }

    #[tokio::test]
    async fn test_failed_bind_skips_command() {
        let temp_dir = TempDir::new().unwrap();
        let mut api = client(&temp_dir, None);
        api.transport().reply("/getSignature", 200, signature_reply(7000, Duration::days(60)));
        api.transport().reply("/bindPort", 200, r#"{"status": "ERROR", "message": "nope"}"#);
        let hook = RecordingHook::new();

        let result = api
            .port_forward(&connection(), Some("echo {port}"), &hook)
            .await
            .unwrap();
        assert!(!result.bound);
        assert!(hook.commands().is_empty());
    }

    #[tokio::test]
    async fn test_refused_stored_lease_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let lease = Lease::new(
            "sig",
            encode_payload(Some("sig"), Utc::now() + Duration::days(30), 1111),
        );
        let mut api = client(&temp_dir, Some(lease));
        let refused = r#"{"status": "ERROR", "message": "unknown payload"}"#;
        api.transport().reply("/bindPort", 200, refused);
        api.transport().reply("/bindPort", 200, r#"{"status": "OK"}"#);
        api.transport()
            .reply("/getSignature", 200, signature_reply(2222, Duration::days(60)));
        let hook = RecordingHook::new();

        let first = api
            .port_forward(&connection(), Some("echo {port}"), &hook)
            .await
            .unwrap();
        assert_eq!(first.source, LeaseSource::Reused);
        assert!(!first.bound);
        assert!(api.store().data().lease.is_none());

        let second = api
            .port_forward(&connection(), Some("echo {port}"), &hook)
            .await
            .unwrap();
        assert_eq!(
            second,
            PortForward {
                port: 2222,
                source: LeaseSource::Fetched,
                bound: true
            }
        );
        assert_eq!(api.transport().count("/getSignature"), 1);
        assert_eq!(hook.commands(), vec!["echo 2222".to_string()]);
    }

    #[tokio::test]
    async fn test_fresh_lease_already_expired_fails_fast() {
        let temp_dir = TempDir::new().unwrap();
        let mut api = client(&temp_dir, None);
        api.transport().reply("/getSignature", 200, signature_reply(7000, -Duration::minutes(5)));
        let hook = RecordingHook::new();

        let err = api
            .port_forward(&connection(), Some("echo {port}"), &hook)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert_eq!(api.transport().count("/bindPort"), 0);
        assert!(api.store().data().lease.is_none());
    }

    #[tokio::test]
    async fn test_signature_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut api = client(&temp_dir, None);
        api.transport().reply(
            "/getSignature",
            200,
            r#"{"status": "ERROR", "message": "port forwarding not supported"}"#,
        );
        let hook = RecordingHook::new();

        let err = api.port_forward(&connection(), None, &hook).await.unwrap_err();
        assert!(err.to_string().contains("port forwarding not supported"));
    }
}
