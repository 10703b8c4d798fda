// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The four operator commands: deploy, check, remove and status.

use crate::agent::removal_command;
use crate::bootstrap::sharded;
use crate::bootstrap::QuorumMachine;
use crate::bootstrap::ReplicaSetMachine;
use crate::bootstrap::ShardedPhase;
use crate::config::ClusterSpec;
use crate::confirm::Confirm;
use crate::context::RunContext;
use crate::context::WorkspaceLocks;
use crate::errors::DeployError;
use crate::ledger::InstallationLedger;
use crate::ledger::LedgerEntry;
use crate::planner::plan;
use crate::planner::DeploymentPlan;
use crate::rollback::RollbackCoordinator;
use crate::rollback::RollbackReport;
use crate::session::provision;
use crate::session::ArtifactSet;
use crate::session::SessionMode;
use crate::status::MemberObservation;
use crate::status::StatusProbe;
use crate::summary::ConnectionSummary;
use dbfleet_node_agent::Role;
use dbfleet_remote_exec::ChannelConnector;
use display_error_chain::DisplayErrorChain;
use futures::stream;
use futures::StreamExt;
use itertools::Itertools;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, Default)]
pub struct DeployOptions {
    /// Leave whatever was installed in place if the run fails.
    pub no_rollback: bool,
}

/// What happened to the installed nodes after a failed deploy.
#[derive(Debug)]
pub enum RollbackOutcome {
    /// Nothing had been installed.
    NotNeeded,
    /// Rollback is disabled; these are still installed.
    Skipped { left_in_place: Vec<String> },
    Performed(RollbackReport),
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackOutcome::NotNeeded => write!(f, "nothing was installed"),
            RollbackOutcome::Skipped { left_in_place } => write!(
                f,
                "rollback disabled; left installed: {}",
                left_in_place.join(", ")
            ),
            RollbackOutcome::Performed(report) => write!(f, "{report}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("deployment failed")]
pub struct DeployFailure {
    #[source]
    pub error: DeployError,
    pub rollback: RollbackOutcome,
}

impl From<DeployError> for DeployFailure {
    fn from(error: DeployError) -> Self {
        DeployFailure { error, rollback: RollbackOutcome::NotNeeded }
    }
}

/// Outcome of `check`: which nodes passed the dry run and which did not.
#[derive(Debug, Default)]
pub struct CheckReport {
    pub passed: Vec<String>,
    pub failed: Vec<(String, DeployError)>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} nodes passed",
            self.passed.len(),
            self.passed.len() + self.failed.len()
        )?;
        for (address, err) in &self.failed {
            write!(f, "\n  {address}: {}", DisplayErrorChain::new(err))?;
        }
        Ok(())
    }
}

/// How much of the ledger a failure rolls back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RollbackScope {
    Everything,
    /// Shard registration failed: converged replica sets stay up.
    RoutersOnly,
}

pub struct Deployer {
    log: Logger,
    spec: Arc<ClusterSpec>,
    connector: Arc<dyn ChannelConnector>,
    cancel: CancellationToken,
}

impl Deployer {
    pub fn new(
        log: &Logger,
        spec: ClusterSpec,
        connector: Arc<dyn ChannelConnector>,
    ) -> Self {
        Deployer {
            log: log.new(o!(
                "component" => "Deployer",
                "engine" => spec.engine.as_str(),
                "topology" => spec.topology.as_str(),
            )),
            spec: Arc::new(spec),
            connector,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token fails the step in flight; a deploy then rolls
    /// back like after any other failure.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    fn context(&self, artifacts: ArtifactSet, rollback: bool) -> RunContext {
        RunContext {
            log: self.log.clone(),
            spec: self.spec.clone(),
            connector: self.connector.clone(),
            artifacts,
            ledger: InstallationLedger::new(),
            cancel: self.cancel.clone(),
            workspaces: WorkspaceLocks::default(),
            rollback,
        }
    }

    fn describe_plan(&self, verb: &str, plan: &DeploymentPlan) -> String {
        format!(
            "{verb} {} {} on {}?",
            self.spec.engine,
            self.spec.topology,
            plan.nodes().iter().map(|n| n.address()).join(", "),
        )
    }

    pub async fn deploy(
        &self,
        options: DeployOptions,
        confirm: &mut dyn Confirm,
    ) -> Result<ConnectionSummary, DeployFailure> {
        let plan = plan(&self.spec);
        if !confirm.confirm(&self.describe_plan("deploy", &plan)) {
            return Err(DeployError::Confirmation(
                "deployment declined by operator".to_string(),
            )
            .into());
        }

        let artifacts = ArtifactSet::resolve(&self.spec)?;
        artifacts.verify_package().await?;

        let rollback = self.spec.rollback_on_failure && !options.no_rollback;
        let ctx = self.context(artifacts, rollback);
        info!(
            self.log,
            "deploying";
            "nodes" => plan.nodes().len(),
            "rollback" => rollback,
        );

        match bring_up(&ctx, &plan).await {
            Ok(()) => {
                let summary = ConnectionSummary::new(&self.spec, &plan);
                info!(self.log, "deployed"; "connect" => &summary.connection_string);
                Ok(summary)
            }
            Err((error, scope)) => {
                error!(
                    self.log,
                    "deployment failed";
                    "error" => %DisplayErrorChain::new(&error),
                );
                let rollback = recover(&ctx, scope).await;
                Err(DeployFailure { error, rollback })
            }
        }
    }

    /// Stages and dry-runs the agent on every node without installing
    /// anything.
    pub async fn check(&self) -> Result<CheckReport, DeployError> {
        let artifacts = ArtifactSet::resolve(&self.spec)?;
        artifacts.verify_package().await?;
        let ctx = self.context(artifacts, true);
        let plan = plan(&self.spec);
        let ctx = &ctx;

        let results: Vec<(String, Result<(), DeployError>)> =
            stream::iter(plan.nodes())
                .map(|node| async move {
                    let result =
                        provision(ctx, node, "check", SessionMode::CheckOnly)
                            .await
                            .map(|_| ());
                    (node.address(), result)
                })
                .buffered(self.spec.parallelism.max(1))
                .collect()
                .await;

        let mut report = CheckReport::default();
        for (address, result) in results {
            match result {
                Ok(()) => report.passed.push(address),
                Err(err) => {
                    warn!(
                        self.log,
                        "check failed";
                        "address" => &address,
                        "error" => %DisplayErrorChain::new(&err),
                    );
                    report.failed.push((address, err));
                }
            }
        }
        Ok(report)
    }

    /// Uninstalls every node in the cluster, last installed first. Best
    /// effort: per-node failures end up in the report.
    pub async fn remove(
        &self,
        confirm: &mut dyn Confirm,
    ) -> Result<RollbackReport, DeployError> {
        let plan = plan(&self.spec);
        if !confirm.confirm(&self.describe_plan("remove", &plan)) {
            return Err(DeployError::Confirmation(
                "removal declined by operator".to_string(),
            ));
        }
        let ctx = self.context(ArtifactSet::resolve(&self.spec)?, true);
        let entries: Vec<LedgerEntry> = plan
            .nodes()
            .into_iter()
            .rev()
            .map(|planned| LedgerEntry {
                node: planned.node.clone(),
                role: planned.role,
                phase: "remove".to_string(),
                uninstall: removal_command(&self.spec, planned),
            })
            .collect();
        Ok(RollbackCoordinator::new(&ctx).roll_back(&entries).await)
    }

    /// One status reading from every node.
    pub async fn status(&self) -> Vec<MemberObservation> {
        let ctx = self.context(ArtifactSet::unstaged(&self.spec), false);
        let plan = plan(&self.spec);
        let probe = StatusProbe::survey(&ctx, plan.nodes()).await;
        probe.observe().await
    }
}

async fn bring_up(
    ctx: &RunContext,
    plan: &DeploymentPlan,
) -> Result<(), (DeployError, RollbackScope)> {
    let everything = |error: DeployError| (error, RollbackScope::Everything);
    match plan {
        DeploymentPlan::Single(node) => {
            provision(ctx, node, "single", SessionMode::Install)
                .await
                .map_err(everything)?;
        }
        DeploymentPlan::PrimaryReplica(set) => {
            ReplicaSetMachine::new(ctx, set, "replica set")
                .run()
                .await
                .map_err(everything)?;
        }
        DeploymentPlan::MultiPrimary(set) => {
            ReplicaSetMachine::new(ctx, set, "multi-primary")
                .multi_primary()
                .run()
                .await
                .map_err(everything)?;
        }
        DeploymentPlan::Quorum(quorum) => {
            QuorumMachine::new(ctx, quorum).run().await.map_err(everything)?;
        }
        DeploymentPlan::Sharded(plan) => {
            sharded::assemble(ctx, plan).await.map_err(|failure| {
                let scope = if failure.phase == ShardedPhase::Registration {
                    RollbackScope::RoutersOnly
                } else {
                    RollbackScope::Everything
                };
                (failure.error, scope)
            })?;
        }
    }
    Ok(())
}

async fn recover(ctx: &RunContext, scope: RollbackScope) -> RollbackOutcome {
    let entries = ctx.ledger.snapshot();
    if entries.is_empty() {
        return RollbackOutcome::NotNeeded;
    }
    if !ctx.rollback {
        let left_in_place = ctx.ledger.addresses();
        warn!(
            ctx.log,
            "rollback disabled; installed nodes left in place";
            "nodes" => left_in_place.join(", "),
        );
        return RollbackOutcome::Skipped { left_in_place };
    }

    let (undo, keep): (Vec<LedgerEntry>, Vec<LedgerEntry>) = match scope {
        RollbackScope::Everything => (entries, Vec::new()),
        RollbackScope::RoutersOnly => {
            entries.into_iter().partition(|e| e.role == Role::Router)
        }
    };
    let mut report = RollbackCoordinator::new(ctx).roll_back(&undo).await;
    report.left_intact = keep.iter().map(LedgerEntry::address).collect();
    if !report.left_intact.is_empty() {
        info!(
            ctx.log,
            "converged replica sets left running";
            "nodes" => report.left_intact.join(", "),
        );
    }
    RollbackOutcome::Performed(report)
}
