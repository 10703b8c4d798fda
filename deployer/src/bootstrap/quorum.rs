// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Galera quorum bootstrap.
//!
//! The designated node starts alone with the new-cluster flag. Once it
//! reports a synced one-member cluster the flag is taken back out of its
//! unit file, so that a later restart rejoins instead of splitting off a
//! second cluster. Only then do the peers join.

use super::await_convergence;
use super::not_yet;
use crate::context::RunContext;
use crate::engine::mysql;
use crate::errors::DeployError;
use crate::planner::QuorumPlan;
use crate::session::provision;
use crate::session::SessionMode;
use crate::status::MemberKind;
use crate::status::MemberObservation;
use crate::status::StatusProbe;
use slog::info;
use slog::o;
use slog::Logger;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumState {
    FirstNodeBootstrap,
    FirstNodeOnline,
    PeersJoining,
    Converged,
    Failed,
}

impl fmt::Display for QuorumState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QuorumState::FirstNodeBootstrap => "first node bootstrap",
            QuorumState::FirstNodeOnline => "first node online",
            QuorumState::PeersJoining => "peers joining",
            QuorumState::Converged => "converged",
            QuorumState::Failed => "failed",
        })
    }
}

pub struct QuorumMachine<'a> {
    log: Logger,
    ctx: &'a RunContext,
    plan: &'a QuorumPlan,
    state: QuorumState,
}

impl<'a> QuorumMachine<'a> {
    pub fn new(ctx: &'a RunContext, plan: &'a QuorumPlan) -> Self {
        QuorumMachine {
            log: ctx.log.new(o!("phase" => "quorum")),
            ctx,
            plan,
            state: QuorumState::FirstNodeBootstrap,
        }
    }

    fn advance(&mut self, next: QuorumState) {
        info!(
            self.log,
            "quorum state change";
            "from" => %self.state,
            "to" => %next,
        );
        self.state = next;
    }

    pub async fn run(&mut self) -> Result<(), DeployError> {
        match self.assemble().await {
            Ok(()) => {
                self.advance(QuorumState::Converged);
                Ok(())
            }
            Err(err) => {
                self.advance(QuorumState::Failed);
                Err(err)
            }
        }
    }

    async fn assemble(&mut self) -> Result<(), DeployError> {
        let ctx = self.ctx;
        let plan = self.plan;
        let policy = ctx.spec.retry.quorum;

        provision(ctx, &plan.bootstrap, "quorum bootstrap", SessionMode::Install)
            .await?;
        let probe = StatusProbe::connect(ctx, [&plan.bootstrap]).await?;
        await_convergence(
            ctx,
            &probe,
            &format!("quorum bootstrap node {}", plan.bootstrap.address()),
            policy,
            |observed| quorum_converged(observed, 1),
        )
        .await?;
        self.advance(QuorumState::FirstNodeOnline);

        self.retract_bootstrap_flag().await?;

        self.advance(QuorumState::PeersJoining);
        for peer in &plan.peers {
            provision(ctx, peer, "quorum", SessionMode::Install).await?;
        }
        let probe = StatusProbe::connect(
            ctx,
            std::iter::once(&plan.bootstrap).chain(plan.peers.iter()),
        )
        .await?;
        let size = plan.size();
        await_convergence(
            ctx,
            &probe,
            "quorum",
            policy,
            |observed| quorum_converged(observed, size),
        )
        .await?;
        Ok(())
    }

    async fn retract_bootstrap_flag(&self) -> Result<(), DeployError> {
        const STEP: &str = "bootstrap flag retraction";
        let ctx = self.ctx;
        let node = &self.plan.bootstrap;
        let channel = ctx.connect(&node.node).await?;
        let command = mysql::retract_bootstrap_command(
            &ctx.spec.environment.layout.service_dir,
            &ctx.spec.engine.unit_name(node.node.options.port),
        );
        ctx.guard(STEP, async {
            channel
                .run_elevated(&command)
                .await
                .map_err(|e| DeployError::from_channel(node.host(), STEP, e))
        })
        .await?;
        info!(self.log, "bootstrap flag retracted"; "host" => node.host());
        Ok(())
    }
}

/// Every member synced and seeing a cluster of exactly `size`.
pub fn quorum_converged(
    observations: &[MemberObservation],
    size: usize,
) -> Result<(), String> {
    let ready = observations.iter().all(|o| {
        o.status.is(MemberKind::QuorumMember)
            && o.status.caught_up()
            && o.status.members_seen.map(|n| n as usize) == Some(size)
    });
    if ready {
        Ok(())
    } else {
        not_yet(format!("waiting for {size} synced members"), observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ReplicationStatus;
    use crate::status::SyncState;
    use dbfleet_node_agent::Role;

    fn member(address: &str, state: SyncState, seen: u32) -> MemberObservation {
        MemberObservation {
            address: address.to_string(),
            role: Role::QuorumMember,
            status: ReplicationStatus::new(MemberKind::QuorumMember)
                .with_field("local_state", state)
                .with_members(seen),
        }
    }

    #[test]
    fn membership_must_match_cluster_size() {
        let mut members = vec![
            member("db1:3306", SyncState::Applied, 3),
            member("db2:3306", SyncState::Applied, 3),
            member("db3:3306", SyncState::Lagging, 3),
        ];
        assert!(quorum_converged(&members, 3).is_err());
        members[2] = member("db3:3306", SyncState::Applied, 2);
        let err = quorum_converged(&members, 3).unwrap_err();
        assert!(err.contains("db3:3306 [quorum-member local_state=applied members=2]"));
        members[2] = member("db3:3306", SyncState::Applied, 3);
        quorum_converged(&members, 3).unwrap();
        quorum_converged(&members[..1], 1).unwrap_err();
    }
}
