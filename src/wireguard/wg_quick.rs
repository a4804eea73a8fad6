//! `TunnelSupervisor` backed by the `wg` and `wg-quick` tools

use crate::pia::models::Connection;
use crate::wireguard::config::{parse_config, render_config};
use crate::wireguard::keys::PrivateKey;
use crate::wireguard::{parse_dump, TrafficStats, TunnelError, TunnelSupervisor};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

pub const DEFAULT_WIREGUARD_DIR: &str = "/etc/wireguard";

const WG: &str = "wg";
const WG_QUICK: &str = "wg-quick";

/// One interface, configured by `<dir>/<interface>.conf`
#[derive(Debug, Clone)]
pub struct WgQuickSupervisor {
    dir: PathBuf,
    interface: String,
    wg: PathBuf,
    wg_quick: PathBuf,
}

impl WgQuickSupervisor {
    pub fn new(dir: impl Into<PathBuf>, interface: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            interface: interface.into(),
            wg: PathBuf::from(WG),
            wg_quick: PathBuf::from(WG_QUICK),
        }
    }

    /// Same supervisor, running other executables in place of `wg` and `wg-quick`
    #[cfg(test)]
    fn with_tools(mut self, wg: impl Into<PathBuf>, wg_quick: impl Into<PathBuf>) -> Self {
        self.wg = wg.into();
        self.wg_quick = wg_quick.into();
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(format!("{}.conf", self.interface))
    }

    fn io_err(&self, source: io::Error) -> TunnelError {
        TunnelError::Io {
            path: self.config_path(),
            source,
        }
    }

    async fn run_wg_quick(&self, action: &'static str) -> Result<(), TunnelError> {
        let path = self.config_path();
        info!("Running: {} {} {}", WG_QUICK, action, path.display());
        let output = Command::new(&self.wg_quick)
            .arg(action)
            .arg(&path)
            .output()
            .await
            .map_err(|source| TunnelError::Spawn {
                tool: WG_QUICK,
                source,
            })?;

        if !output.status.success() {
            return Err(TunnelError::Command {
                tool: WG_QUICK,
                action,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn wg_show(&self, extra: &[&str]) -> Option<String> {
        let output = Command::new(&self.wg)
            .arg("show")
            .arg(&self.interface)
            .args(extra)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl TunnelSupervisor for WgQuickSupervisor {
    fn config_exists(&self) -> bool {
        self.config_path().exists()
    }

    async fn interface_active(&self) -> bool {
        self.wg_show(&[]).await.is_some()
    }

    async fn bring_up(&self) -> bool {
        match self.run_wg_quick("up").await {
            Ok(()) => {
                info!("Interface {} is up", self.interface);
                true
            }
            Err(e) => {
                error!("Failed to bring up {}: {}", self.interface, e);
                false
            }
        }
    }

    async fn bring_down(&self) -> Result<(), TunnelError> {
        self.run_wg_quick("down").await?;
        info!("Interface {} is down", self.interface);
        Ok(())
    }

    fn write_config(
        &self,
        connection: &Connection,
        private_key: &PrivateKey,
    ) -> Result<(), TunnelError> {
        let path = self.config_path();
        fs::create_dir_all(&self.dir).map_err(|e| self.io_err(e))?;
        write_private(&path, &render_config(connection, private_key))
            .map_err(|e| self.io_err(e))?;
        info!("WireGuard config written to {}", path.display());
        Ok(())
    }

    async fn remove_config(&self) -> Result<(), TunnelError> {
        if self.interface_active().await {
            if let Err(e) = self.bring_down().await {
                warn!("Removing config with {} still up: {}", self.interface, e);
            }
        }
        let path = self.config_path();
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("WireGuard config removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn read_connection(&self) -> Result<Option<Connection>, TunnelError> {
        match fs::read_to_string(self.config_path()) {
            Ok(content) => Ok(parse_config(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    async fn traffic_stats(&self) -> Option<TrafficStats> {
        let dump = self.wg_show(&["dump"]).await?;
        let stats = parse_dump(&dump);
        if stats.is_none() {
            debug!("No peer in wg dump for {}", self.interface);
        }
        stats
    }
}

// The file holds the private key, so it is never readable by other users.
#[cfg(unix)]
fn write_private(path: &Path, content: &str) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies to new files
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(content.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &str) -> io::Result<()> {
    fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pia::models::Host;
    use tempfile::TempDir;

    fn connection() -> Connection {
        Connection {
            endpoint: Host::new("host0", "9.9.9.9").unwrap(),
            port: 1337,
            assigned_address: "10.0.0.2".to_string(),
            server_public_key: "pk".to_string(),
            dns_servers: vec!["8.8.8.8".to_string()],
        }
    }

    fn supervisor(temp_dir: &TempDir) -> WgQuickSupervisor {
        // Unlikely to exist, so `wg show` fails and the interface reads as down
        WgQuickSupervisor::new(temp_dir.path().join("wireguard"), "pia-wg-test0")
    }

    #[test]
    fn test_config_path() {
        let sup = WgQuickSupervisor::new("/etc/wireguard", "pia");
        assert_eq!(sup.config_path(), PathBuf::from("/etc/wireguard/pia.conf"));
        assert_eq!(sup.interface(), "pia");
    }

    #[tokio::test]
    async fn test_write_read_remove_config() {
        let temp_dir = TempDir::new().unwrap();
        let sup = supervisor(&temp_dir);
        assert!(!sup.config_exists());
        assert_eq!(sup.read_connection().unwrap(), None);

        sup.write_config(&connection(), &PrivateKey::generate()).unwrap();
        assert!(sup.config_exists());
        assert_eq!(sup.read_connection().unwrap(), Some(connection()));

        sup.remove_config().await.unwrap();
        assert!(!sup.config_exists());
        // Removing twice is fine
        sup.remove_config().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_bring_down_still_removes_config() {
        let temp_dir = TempDir::new().unwrap();
        // `wg show` succeeds so the interface reads as up; `wg-quick` always fails
        let sup = supervisor(&temp_dir).with_tools("true", "false");
        sup.write_config(&connection(), &PrivateKey::generate()).unwrap();
        assert!(sup.interface_active().await);

        let err = sup.bring_down().await.unwrap_err();
        assert!(matches!(err, TunnelError::Command { action: "down", .. }));

        sup.remove_config().await.unwrap();
        assert!(!sup.config_exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bring_up_reports_failure() {
        let temp_dir = TempDir::new().unwrap();
        let sup = supervisor(&temp_dir).with_tools("false", "false");
        assert!(!sup.interface_active().await);
        assert!(!sup.bring_up().await);
        assert_eq!(sup.traffic_stats().await, None);

        let sup = supervisor(&temp_dir).with_tools("true", "true");
        assert!(sup.bring_up().await);
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("no-such-tool");
        let sup = supervisor(&temp_dir).with_tools(&missing, &missing);
        assert!(!sup.interface_active().await);
        let err = sup.bring_down().await.unwrap_err();
        assert!(matches!(err, TunnelError::Spawn { tool: "wg-quick", .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_config_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let sup = supervisor(&temp_dir);
        sup.write_config(&connection(), &PrivateKey::generate()).unwrap();

        let mode = fs::metadata(sup.config_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
