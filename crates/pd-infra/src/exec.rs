use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

/// Runs external commands on behalf of workflows that shell out
/// (currently only the backup pipeline's rsync fan-out).
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(&self, program: &str, args: &[String]) -> Result<()>;
}

/// Runner that spawns real processes.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<()> {
        debug!(program, ?args, "running command");

        let status = Command::new(program).args(args).status().await?;

        if !status.success() {
            return Err(Error::Command {
                command: program.to_string(),
                status: status.to_string(),
            });
        }

        Ok(())
    }
}
