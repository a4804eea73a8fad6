//! Runtime requirements: root privileges and the WireGuard tools

use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Tools `WgQuickSupervisor` shells out to
pub const REQUIRED_TOOLS: [&str; 2] = ["wg", "wg-quick"];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Must be run as root")]
    NotRoot,
    #[error("Required tool not found in PATH: {0}")]
    MissingTool(&'static str),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Check everything `connect` and `disconnect` need is in place
pub fn check_requirements() -> Result<(), PlatformError> {
    if !is_root()? {
        return Err(PlatformError::NotRoot);
    }
    let path = env::var_os("PATH").unwrap_or_default();
    let dirs: Vec<PathBuf> = env::split_paths(&path).collect();
    for tool in REQUIRED_TOOLS {
        if find_executable(tool, &dirs).is_none() {
            return Err(PlatformError::MissingTool(tool));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_root() -> Result<bool, PlatformError> {
    Ok(nix::unistd::geteuid().is_root())
}

#[cfg(not(unix))]
fn is_root() -> Result<bool, PlatformError> {
    Err(PlatformError::UnsupportedPlatform)
}

/// First executable file called `name` in `dirs`
pub fn find_executable(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
