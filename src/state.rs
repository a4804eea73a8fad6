//! Persistent data shared between invocations
//!
//! One JSON record per data file, belonging to exactly one PIA account. It is
//! read fully at start-up and rewritten whole after every mutation, so a crash
//! loses at most the attempt in progress.

use crate::pia::models::{Connection, Lease, Region};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access data file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Data file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentData {
    pub username: String,
    pub token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub regions: Vec<Region>,
    pub regions_expiry: Option<DateTime<Utc>>,
    pub connection: Option<Connection>,
    pub lease: Option<Lease>,
    pub last_success: Option<DateTime<Utc>>,
}

impl PersistentData {
    pub fn for_account(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    /// Stored token, if it belongs to `username` and is still live at `now`
    pub fn token_at(&self, username: &str, now: DateTime<Utc>) -> Option<&str> {
        let token = self.token.as_deref()?;
        if self.username != username {
            debug!("Stored token is for a different user");
            return None;
        }
        match self.token_expiry {
            Some(expiry) if now < expiry => {
                debug!(
                    "Valid token found (good for {} more minute(s))",
                    (expiry - now).num_minutes()
                );
                Some(token)
            }
            _ => {
                debug!("Stored token is stale");
                None
            }
        }
    }

    pub fn cached_token(&self, username: &str) -> Option<&str> {
        self.token_at(username, Utc::now())
    }

    pub fn set_token(&mut self, token: String, expiry: DateTime<Utc>) {
        self.token = Some(token);
        self.token_expiry = Some(expiry);
    }

    /// Stored region list, if it has not gone stale at `now`
    pub fn regions_at(&self, now: DateTime<Utc>) -> Option<&[Region]> {
        if self.regions.is_empty() {
            debug!("No stored regions found");
            return None;
        }
        match self.regions_expiry {
            Some(expiry) if now < expiry => Some(&self.regions),
            _ => {
                debug!("Stored regions are stale");
                None
            }
        }
    }

    pub fn cached_regions(&self) -> Option<&[Region]> {
        self.regions_at(Utc::now())
    }

    pub fn set_regions(&mut self, regions: Vec<Region>, expiry: DateTime<Utc>) {
        self.regions = regions;
        self.regions_expiry = Some(expiry);
    }

    /// Stored lease, if its payload is intact, signed by the stored signature
    /// and unexpired at `now`
    pub fn lease_at(&self, now: DateTime<Utc>) -> Option<&Lease> {
        let lease = self.lease.as_ref()?;
        match lease.validate_at(now) {
            Ok(claims) => {
                debug!(
                    "Valid lease found for port {} (good for {} more hour(s))",
                    claims.port,
                    (claims.expires_at - now).num_hours()
                );
                Some(lease)
            }
            Err(e) => {
                debug!("Stored lease is unusable: {}", e);
                None
            }
        }
    }

    pub fn cached_lease(&self) -> Option<&Lease> {
        self.lease_at(Utc::now())
    }
}

/// A `PersistentData` record bound to the file it is saved to
#[derive(Debug)]
pub struct DataStore {
    path: PathBuf,
    data: PersistentData,
}

impl DataStore {
    /// Open the data file as-is, whatever account it belongs to.
    ///
    /// A missing file yields an empty record.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = read_record(&path)?.unwrap_or_default();
        Ok(Self { path, data })
    }

    /// Open the data file for `username`.
    ///
    /// Anything cached for another account is discarded and replaced by a blank
    /// record, so tokens and leases never cross accounts.
    pub fn open_for_account(path: impl Into<PathBuf>, username: &str) -> Result<Self, StoreError> {
        let mut store = Self::open(path)?;
        if store.data.username != username {
            if !store.data.username.is_empty() {
                info!("Data file belongs to another account, starting fresh");
            }
            store.data = PersistentData::for_account(username);
        }
        Ok(store)
    }

    pub fn data(&self) -> &PersistentData {
        &self.data
    }

    /// Apply `update` to the record and write it out
    pub fn update<F>(&mut self, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut PersistentData),
    {
        update(&mut self.data);
        self.save()
    }

    pub fn save(&self) -> Result<(), StoreError> {
        write_record(&self.path, &self.data)
    }
}

fn read_record(path: &Path) -> Result<Option<PersistentData>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No data file at {}, starting empty", path.display());
            return Ok(None);
        }
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

// Written to a sibling temp file and renamed into place, so a reader never sees
// a half-written record.
fn write_record(path: &Path, data: &PersistentData) -> Result<(), StoreError> {
    let io_err = |source: io::Error| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let content = serde_json::to_string_pretty(data).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}
