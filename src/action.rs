//! External command run on every scheduled tick, via
//! [`tokio::process::Command`].
//!
//! The child is killed when its invocation token is cancelled (schedule
//! replaced, shutdown, or timeout).  Failures are logged and never reach the
//! scheduler.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::ActionConfig;
use crate::sync::scheduler::{Action, ActionFuture};

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct CommandAction {
    inner: Arc<CommandSpec>,
}

#[derive(Debug)]
struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl CommandAction {
    pub fn new(program: impl Into<String>, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            inner: Arc::new(CommandSpec {
                program: program.into(),
                args,
                env,
            }),
        }
    }

    pub fn from_config(config: &ActionConfig) -> Result<Self> {
        let Some((program, args)) = config.command.split_first() else {
            bail!("action command is empty");
        };
        Ok(Self::new(program.clone(), args.to_vec(), config.env.clone()))
    }

    /// Run the command once, killing it if `cancel` fires first.
    pub async fn execute(&self, cancel: CancellationToken) -> Result<Outcome> {
        self.inner.execute(cancel).await
    }
}

impl CommandSpec {
    #[instrument(skip_all, fields(program = %self.program))]
    async fn execute(&self, cancel: CancellationToken) -> Result<Outcome> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!("spawning action");

        let output = tokio::select! {
            output = cmd.output() => {
                output.with_context(|| format!("failed to spawn {}", self.program))?
            }
            () = cancel.cancelled() => {
                debug!("action cancelled, child killed");
                return Ok(Outcome::Cancelled);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} failed (status {}): {}",
                self.program,
                output.status,
                stderr.trim(),
            );
        }

        debug!("action succeeded");
        Ok(Outcome::Succeeded)
    }
}

impl Action for CommandAction {
    fn run(&self, cancel: CancellationToken) -> ActionFuture {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            if let Err(e) = inner.execute(cancel).await {
                warn!(error = %format!("{e:#}"), "action failed");
            }
        })
    }
}
