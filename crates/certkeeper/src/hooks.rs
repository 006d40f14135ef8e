//! Post-install reload hook
//!
//! Runs an operator-supplied command (e.g. `systemctl reload nginx`) so the
//! consumer of the live directory picks up a freshly installed certificate.

use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("reload command is empty")]
    Empty,

    #[error("failed to run reload command '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("reload command '{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// A command run after each successful install
#[derive(Debug, Clone)]
pub struct ReloadHook {
    argv: Vec<String>,
}

impl ReloadHook {
    pub fn new(argv: Vec<String>) -> Result<Self, HookError> {
        match argv.first() {
            Some(program) if !program.trim().is_empty() => Ok(Self { argv }),
            _ => Err(HookError::Empty),
        }
    }

    /// Hook for an optional configured command
    pub fn from_config(argv: Option<&Vec<String>>) -> Result<Option<Self>, HookError> {
        argv.map(|argv| Self::new(argv.clone())).transpose()
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub async fn run(&self) -> Result<(), HookError> {
        let program = self.program().to_string();
        debug!(program = %program, args = ?&self.argv[1..], "Running reload command");

        let output = Command::new(&program)
            .args(&self.argv[1..])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| HookError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(program = %program, status = %output.status, "Reload command failed");
            return Err(HookError::Failed {
                program,
                status: output.status,
                stderr,
            });
        }

        info!(program = %program, "Reload command completed");
        Ok(())
    }
}
