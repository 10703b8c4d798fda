// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Undoing installs.
//!
//! Every ledger entry is visited in the order it was recorded. The agent is
//! staged again (the install session already removed its workspace), the
//! recorded uninstall runs, and the workspace goes away. Nothing here
//! returns an error: each failure is logged, collected into the report, and
//! the next entry is tried.

use crate::agent::agent_path;
use crate::context::RunContext;
use crate::errors::DeployError;
use crate::ledger::LedgerEntry;
use dbfleet_remote_exec::BoxedChannel;
use dbfleet_remote_exec::ChannelError;
use display_error_chain::DisplayErrorChain;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::fmt;

/// One step that failed while undoing one node.
#[derive(Debug)]
pub struct RollbackStepFailure {
    pub address: String,
    pub step: &'static str,
    pub error: DeployError,
}

impl fmt::Display for RollbackStepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}: {}",
            self.address,
            self.step,
            DisplayErrorChain::new(&self.error)
        )
    }
}

#[derive(Debug, Default)]
pub struct RollbackReport {
    /// Addresses visited, in order.
    pub attempted: Vec<String>,
    pub failures: Vec<RollbackStepFailure>,
    /// Installed addresses deliberately left running.
    pub left_intact: Vec<String>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for RollbackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rolled back {} of {} installed nodes",
            self.attempted.len() - self.failures.len(),
            self.attempted.len(),
        )?;
        for failure in &self.failures {
            write!(f, "\n  failed: {failure}")?;
        }
        if !self.left_intact.is_empty() {
            write!(f, "\n  left running: {}", self.left_intact.join(", "))?;
        }
        Ok(())
    }
}

pub struct RollbackCoordinator<'a> {
    log: Logger,
    ctx: &'a RunContext,
}

impl<'a> RollbackCoordinator<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        RollbackCoordinator {
            log: ctx.log.new(o!("component" => "RollbackCoordinator")),
            ctx,
        }
    }

    pub async fn roll_back(&self, entries: &[LedgerEntry]) -> RollbackReport {
        let mut report = RollbackReport::default();
        for entry in entries {
            let address = entry.address();
            info!(
                self.log,
                "uninstalling";
                "address" => &address,
                "phase" => &entry.phase,
            );
            report.attempted.push(address.clone());
            if let Err((step, error)) = self.undo(entry).await {
                warn!(
                    self.log,
                    "rollback step failed";
                    "address" => &address,
                    "step" => step,
                    "error" => %DisplayErrorChain::new(&error),
                );
                report.failures.push(RollbackStepFailure { address, step, error });
            }
        }
        report
    }

    async fn undo(
        &self,
        entry: &LedgerEntry,
    ) -> Result<(), (&'static str, DeployError)> {
        let channel = self
            .ctx
            .connect_for_cleanup(&entry.node)
            .await
            .map_err(|e| ("connect", e))?;
        let result = self.uninstall(entry, &channel).await;
        let teardown = channel
            .remove_all(&entry.node.workspace)
            .await
            .map_err(|e| {
                let step = "workspace teardown";
                (step, self.channel_error(entry, step, e))
            });
        result.and(teardown)
    }

    async fn uninstall(
        &self,
        entry: &LedgerEntry,
        channel: &BoxedChannel,
    ) -> Result<(), (&'static str, DeployError)> {
        let ws = &entry.node.workspace;
        let agent = agent_path(ws);
        let stage = |e: ChannelError| {
            let step = "agent staging";
            (step, self.channel_error(entry, step, e))
        };
        channel.make_dir_all(ws).await.map_err(stage)?;
        channel
            .copy_file(&self.ctx.artifacts.agent_binary, &agent)
            .await
            .map_err(stage)?;
        channel.set_executable(&agent).await.map_err(stage)?;

        let line = entry.uninstall.command_line(&agent);
        channel
            .run_elevated(&line)
            .await
            .map_err(|e| ("uninstall", self.channel_error(entry, "uninstall", e)))?;
        info!(self.log, "uninstalled"; "address" => entry.address());
        Ok(())
    }

    fn channel_error(
        &self,
        entry: &LedgerEntry,
        step: &'static str,
        source: ChannelError,
    ) -> DeployError {
        DeployError::from_channel(&entry.node.host, step, source)
    }
}
