//! Connection lifecycle
//!
//! One pass of `ConnectionManager::update` makes up to `CONNECTION_ATTEMPTS`
//! attempts. Each attempt walks the same stages:
//!
//! 1. `NoConfig`: without a local tunnel config, register a fresh key with the
//!    region and write one
//! 2. `ConfigWritten`: bring the interface up if it is down
//! 3. `InterfaceUp`: check the public address is the server's
//! 4. `Verified`: renew port forwarding and record the success
//!
//! Any failure after the config exists discards it, so the next attempt starts
//! again from a fresh key registration instead of reusing a half-working tunnel.

use crate::hooks::CommandHook;
use crate::pia::api::{ApiError, PiaClient};
use crate::pia::models::Connection;
use crate::pia::port_forward::PortForward;
use crate::pia::transport::Transport;
use crate::state::StoreError;
use crate::verify::{endpoint_reachable, IP_CHECK_URL};
use crate::wireguard::{generate_keypair, TunnelError, TunnelSupervisor};
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const CONNECTION_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    NoConfig,
    Authenticating,
    ConfigWritten,
    InterfaceUp,
    Verified,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::NoConfig => "no config",
            Stage::Authenticating => "authenticating",
            Stage::ConfigWritten => "config written",
            Stage::InterfaceUp => "interface up",
            Stage::Verified => "verified",
        };
        f.write_str(name)
    }
}

/// Failures that end `update` early instead of being retried
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

impl ConnectError {
    pub fn is_fatal(&self) -> bool {
        match self {
            ConnectError::Api(e) => e.is_fatal(),
            ConnectError::Store(_) => true,
            // Tool failures are retried; only the config file itself is fatal
            ConnectError::Tunnel(e) => matches!(e, TunnelError::Io { .. }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Connected {
        /// 1-based attempt that succeeded
        attempt: u32,
        port_forward: Option<PortForward>,
    },
    Failed {
        attempts: u32,
        /// Stage the last attempt stopped at
        stage: Stage,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub region: String,
    pub port_forward: bool,
    /// Run after a new forwarded port is bound; `{port}` is substituted
    pub port_forward_command: Option<String>,
    pub ip_check_url: String,
}

impl ConnectOptions {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            port_forward: false,
            port_forward_command: None,
            ip_check_url: IP_CHECK_URL.to_string(),
        }
    }
}

/// Why a single attempt did not connect
struct AttemptFailure {
    stage: Stage,
    reason: String,
}

impl AttemptFailure {
    fn new(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

pub struct ConnectionManager<T, S, H> {
    client: PiaClient<T>,
    supervisor: S,
    hook: H,
    options: ConnectOptions,
}

impl<T, S, H> ConnectionManager<T, S, H>
where
    T: Transport,
    S: TunnelSupervisor,
    H: CommandHook,
{
    pub fn new(client: PiaClient<T>, supervisor: S, hook: H, options: ConnectOptions) -> Self {
        Self {
            client,
            supervisor,
            hook,
            options,
        }
    }

    pub fn client(&self) -> &PiaClient<T> {
        &self.client
    }

    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }

    /// Bring the connection up, or confirm it still is.
    ///
    /// Ordinary failures are retried and reported through `Outcome::Failed`.
    /// `Err` is reserved for configuration and local I/O problems that another
    /// attempt would not fix.
    pub async fn update(&mut self) -> Result<Outcome, ConnectError> {
        let mut last = AttemptFailure::new(Stage::NoConfig, "no attempt made");

        for attempt in 1..=CONNECTION_ATTEMPTS {
            info!("Connection attempt {}/{}", attempt, CONNECTION_ATTEMPTS);
            match self.attempt().await? {
                Ok(connection) => {
                    let port_forward = self.renew_port_forward(&connection).await?;
                    self.client.record_success()?;
                    info!(
                        "Connected to {} ({})",
                        connection.endpoint.hostname,
                        connection.endpoint_addr()
                    );
                    return Ok(Outcome::Connected {
                        attempt,
                        port_forward,
                    });
                }
                Err(failure) => {
                    warn!(
                        "Attempt {} failed at {}: {}",
                        attempt, failure.stage, failure.reason
                    );
                    last = failure;
                }
            }
        }

        error!(
            "Failed to connect after {} attempts: {}",
            CONNECTION_ATTEMPTS, last.reason
        );
        Ok(Outcome::Failed {
            attempts: CONNECTION_ATTEMPTS,
            stage: last.stage,
            reason: last.reason,
        })
    }

    // Outer `Err` aborts the whole update, inner `Err` only this attempt.
    async fn attempt(&mut self) -> Result<Result<Connection, AttemptFailure>, ConnectError> {
        if !self.supervisor.config_exists() {
            debug!("No tunnel config, authenticating");
            if let Err(e) = self.establish().await {
                if e.is_fatal() {
                    return Err(e);
                }
                return Ok(Err(AttemptFailure::new(Stage::Authenticating, e.to_string())));
            }
        }

        if !self.supervisor.interface_active().await && !self.supervisor.bring_up().await {
            self.discard().await?;
            return Ok(Err(AttemptFailure::new(
                Stage::ConfigWritten,
                "Interface did not come up",
            )));
        }

        let Some(connection) = self.expected_connection()? else {
            self.discard().await?;
            return Ok(Err(AttemptFailure::new(
                Stage::InterfaceUp,
                "Tunnel config does not name a server",
            )));
        };

        let reachable = endpoint_reachable(
            self.client.transport(),
            &self.options.ip_check_url,
            connection.endpoint.ip,
        )
        .await;
        if !reachable {
            self.discard().await?;
            return Ok(Err(AttemptFailure::new(
                Stage::InterfaceUp,
                format!("Traffic is not leaving through {}", connection.endpoint.ip),
            )));
        }
        Ok(Ok(connection))
    }

    async fn establish(&mut self) -> Result<(), ConnectError> {
        self.client.token().await?;
        let keys = generate_keypair();
        let connection = self
            .client
            .authenticate(&self.options.region, &keys.public.to_base64(), 0)
            .await?;
        self.supervisor.write_config(&connection, &keys.private)?;
        Ok(())
    }

    /// Server the tunnel should be going through: the stored connection, or
    /// failing that the one recorded in the tunnel config
    fn expected_connection(&self) -> Result<Option<Connection>, ConnectError> {
        if let Some(connection) = &self.client.store().data().connection {
            return Ok(Some(connection.clone()));
        }
        Ok(self.supervisor.read_connection()?)
    }

    async fn discard(&mut self) -> Result<(), ConnectError> {
        info!("Discarding tunnel config");
        if let Err(e) = self.supervisor.remove_config().await {
            let e = ConnectError::from(e);
            if e.is_fatal() {
                return Err(e);
            }
            warn!("Failed to discard tunnel config: {}", e);
        }
        self.client.forget_connection()?;
        Ok(())
    }

    async fn renew_port_forward(
        &mut self,
        connection: &Connection,
    ) -> Result<Option<PortForward>, ConnectError> {
        if !self.options.port_forward {
            return Ok(None);
        }
        let supported = self
            .client
            .store()
            .data()
            .regions
            .iter()
            .find(|r| r.id == self.options.region)
            .map(|r| r.port_forward);
        if supported == Some(false) {
            warn!("Region {} does not support port forwarding", self.options.region);
            return Ok(None);
        }

        let command = self.options.port_forward_command.as_deref();
        match self.client.port_forward(connection, command, &self.hook).await {
            Ok(forward) => Ok(Some(forward)),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                error!("Port forwarding failed: {}", e);
                Ok(None)
            }
        }
    }
}
