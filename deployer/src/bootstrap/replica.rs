// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Primary/replica sets, and MySQL multi-primary pairs built on top of them.

use super::await_convergence;
use super::not_yet;
use crate::context::RunContext;
use crate::engine;
use crate::engine::mysql;
use crate::errors::DeployError;
use crate::planner::ReplicaSetPlan;
use crate::poller::RetryPolicy;
use crate::session::provision;
use crate::session::SessionMode;
use crate::status::MemberKind;
use crate::status::MemberObservation;
use crate::status::StatusProbe;
use dbfleet_node_agent::Role;
use slog::info;
use slog::o;
use slog::Logger;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaSetState {
    Installing,
    AwaitingReplicaCatchUp,
    Converged,
    Failed,
}

impl fmt::Display for ReplicaSetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReplicaSetState::Installing => "installing",
            ReplicaSetState::AwaitingReplicaCatchUp => "awaiting replica catch-up",
            ReplicaSetState::Converged => "converged",
            ReplicaSetState::Failed => "failed",
        })
    }
}

/// Installs a replica set primary-first and waits for every member to
/// report its role.
pub struct ReplicaSetMachine<'a> {
    log: Logger,
    ctx: &'a RunContext,
    plan: &'a ReplicaSetPlan,
    phase: String,
    policy: RetryPolicy,
    multi_primary: bool,
    state: ReplicaSetState,
}

impl<'a> ReplicaSetMachine<'a> {
    pub fn new(
        ctx: &'a RunContext,
        plan: &'a ReplicaSetPlan,
        phase: impl Into<String>,
    ) -> Self {
        let phase = phase.into();
        ReplicaSetMachine {
            log: ctx.log.new(o!("phase" => phase.clone())),
            ctx,
            plan,
            phase,
            policy: ctx.spec.retry.replication,
            multi_primary: false,
            state: ReplicaSetState::Installing,
        }
    }

    /// After the set converges, point the primary back at the second head
    /// and require both heads to replicate.
    pub fn multi_primary(mut self) -> Self {
        self.multi_primary = true;
        self
    }

    fn advance(&mut self, next: ReplicaSetState) {
        info!(
            self.log,
            "replica set state change";
            "set" => &self.plan.name,
            "from" => %self.state,
            "to" => %next,
        );
        self.state = next;
    }

    /// Runs the machine to `Converged` or `Failed`. On success returns the
    /// set's `name/host:port,...` descriptor.
    pub async fn run(&mut self) -> Result<String, DeployError> {
        match self.assemble().await {
            Ok(()) => {
                self.advance(ReplicaSetState::Converged);
                Ok(self.plan.descriptor())
            }
            Err(err) => {
                self.advance(ReplicaSetState::Failed);
                Err(err)
            }
        }
    }

    async fn assemble(&mut self) -> Result<(), DeployError> {
        let ctx = self.ctx;
        let plan = self.plan;

        // The primary is up before anything tries to join it.
        for member in &plan.members {
            provision(ctx, member, &self.phase, SessionMode::Install).await?;
        }

        self.advance(ReplicaSetState::AwaitingReplicaCatchUp);
        let probe = StatusProbe::connect(ctx, &plan.members).await?;
        let expects_arbiter = plan.expects_arbiter();
        await_convergence(
            ctx,
            &probe,
            &format!("replica set {}", plan.name),
            self.policy,
            |observed| replica_set_converged(observed, expects_arbiter),
        )
        .await?;

        if self.multi_primary {
            self.cross_wire().await?;
            await_convergence(
                ctx,
                &probe,
                &format!("multi-primary pair {}", plan.name),
                self.policy,
                multi_primary_converged,
            )
            .await?;
        }
        Ok(())
    }

    /// Issued from the second head, whose client connects to the first.
    async fn cross_wire(&self) -> Result<(), DeployError> {
        let ctx = self.ctx;
        let head = &self.plan.members[0];
        let follower = &self.plan.members[1];
        let channel = ctx.connect(&follower.node).await?;
        let command = mysql::cross_wire_command(
            &engine::client_path(&ctx.spec, follower),
            (head.host(), head.node.options.port),
            (follower.host(), follower.node.options.port),
            &ctx.spec.credentials,
        );
        ctx.guard("cross-wiring", async {
            channel.run(&command).await.map_err(|e| {
                DeployError::from_channel(follower.host(), "cross-wiring", e)
            })
        })
        .await?;
        info!(
            self.log,
            "heads cross-wired";
            "head" => head.address(),
            "follows" => follower.address(),
        );
        Ok(())
    }
}

/// Exactly one primary, every other data member a caught-up replica, and an
/// arbiter if one was asked for.
pub fn replica_set_converged(
    observations: &[MemberObservation],
    expects_arbiter: bool,
) -> Result<(), String> {
    let primaries = observations
        .iter()
        .filter(|o| o.status.is(MemberKind::Primary))
        .count();
    if primaries != 1 {
        return not_yet(format!("{primaries} members report primary"), observations);
    }
    let behind: Vec<&str> = observations
        .iter()
        .filter(|o| o.role != Role::Arbiter && !o.status.is(MemberKind::Primary))
        .filter(|o| !(o.status.is(MemberKind::Replica) && o.status.caught_up()))
        .map(|o| o.address.as_str())
        .collect();
    if !behind.is_empty() {
        return not_yet(format!("not caught up: {}", behind.join(", ")), observations);
    }
    if expects_arbiter
        && !observations.iter().any(|o| o.status.is(MemberKind::Arbiter))
    {
        return not_yet("no member reports arbiter", observations);
    }
    Ok(())
}

/// Still one writable primary, and both heads replicating from each other.
/// Members after the heads are plain replicas of the first.
pub fn multi_primary_converged(
    observations: &[MemberObservation],
) -> Result<(), String> {
    replica_set_converged(observations, false)?;
    let idle: Vec<&str> = observations
        .iter()
        .take(2)
        .filter(|o| !o.status.replicating())
        .map(|o| o.address.as_str())
        .collect();
    if idle.is_empty() {
        Ok(())
    } else {
        not_yet(format!("heads not replicating: {}", idle.join(", ")), observations)
    }
}
