//! User command run when the forwarded port changes

use std::future::Future;
use std::io;
use std::process::ExitStatus;
use tokio::process::Command;
use tracing::debug;

/// Replaced by the bound port number in the user's command
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Runs a shell command to completion and reports how it exited
pub trait CommandHook {
    fn run(&self, command: &str) -> impl Future<Output = io::Result<ExitStatus>>;
}

/// Runs commands with `sh -c`
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellHook;

impl CommandHook for ShellHook {
    async fn run(&self, command: &str) -> io::Result<ExitStatus> {
        debug!("Running: sh -c {:?}", command);
        Command::new("sh").arg("-c").arg(command).status().await
    }
}

pub fn render_command(template: &str, port: u16) -> String {
    template.replace(PORT_PLACEHOLDER, &port.to_string())
}
