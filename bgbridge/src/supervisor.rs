//! Chip process supervision through configured shell commands.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::process::Command;

use crate::discovery::ChipSupervisor;
use crate::tracing::prelude::*;

/// Runs `sh -c <command>` for each supervision action. Unset commands are
/// logged and skipped.
#[derive(Debug, Default)]
pub struct CommandSupervisor {
    restart: Option<String>,
    patch: Option<String>,
    patched: AtomicBool,
}

impl CommandSupervisor {
    pub fn new(restart: Option<String>, patch: Option<String>) -> Self {
        Self {
            restart,
            patch,
            patched: AtomicBool::new(false),
        }
    }
}

async fn run_shell(action: &str, command: &str) {
    debug!(action, command, "Running");
    match Command::new("sh").arg("-c").arg(command).status().await {
        Ok(status) if status.success() => info!(action, "Done."),
        Ok(status) => warn!(action, %status, "Command failed"),
        Err(e) => error!(action, error = %e, "Failed to spawn command"),
    }
}

#[async_trait]
impl ChipSupervisor for CommandSupervisor {
    async fn restart_chip_process(&self) {
        match &self.restart {
            Some(command) => run_shell("restart", command).await,
            None => warn!("Chip restart needed but no restart command configured"),
        }
    }

    async fn on_discovery_start(&self) {
        let Some(command) = &self.patch else {
            return;
        };
        if self.patched.swap(true, Ordering::AcqRel) {
            return;
        }
        run_shell("patch", command).await;
    }
}
