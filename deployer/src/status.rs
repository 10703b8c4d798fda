// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Engine-neutral view of replication state, and the probe that collects it.

use crate::context::RunContext;
use crate::engine;
use crate::errors::DeployError;
use crate::planner::PlannedNode;
use dbfleet_node_agent::Role;
use dbfleet_remote_exec::BoxedChannel;
use display_error_chain::DisplayErrorChain;
use futures::future::join_all;
use serde::Serialize;
use slog::debug;
use slog::warn;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Applied,
    Lagging,
    Unreachable,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncState::Applied => "applied",
            SyncState::Lagging => "lagging",
            SyncState::Unreachable => "unreachable",
        })
    }
}

/// What a member says it is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemberKind {
    Primary,
    Replica,
    Arbiter,
    Router,
    QuorumMember,
}

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemberKind::Primary => "primary",
            MemberKind::Replica => "replica",
            MemberKind::Arbiter => "arbiter",
            MemberKind::Router => "router",
            MemberKind::QuorumMember => "quorum-member",
        })
    }
}

/// One member's replication state as reported by its engine.
///
/// `kind` is `None` when the member could not be queried or its answer
/// could not be understood; `fields` then holds a single `unreachable`
/// entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationStatus {
    pub kind: Option<MemberKind>,
    pub fields: BTreeMap<String, SyncState>,
    /// Membership count as seen by this member, where the engine reports
    /// one.
    pub members_seen: Option<u32>,
}

impl ReplicationStatus {
    pub fn new(kind: MemberKind) -> Self {
        ReplicationStatus { kind: Some(kind), ..Default::default() }
    }

    pub fn unreachable() -> Self {
        ReplicationStatus::default().with_field("status", SyncState::Unreachable)
    }

    pub fn with_field(mut self, name: &str, state: SyncState) -> Self {
        self.fields.insert(name.to_string(), state);
        self
    }

    pub fn with_members(mut self, count: u32) -> Self {
        self.members_seen = Some(count);
        self
    }

    pub fn is(&self, kind: MemberKind) -> bool {
        self.kind == Some(kind)
    }

    /// True if every reported field is applied.
    pub fn caught_up(&self) -> bool {
        self.kind.is_some()
            && self.fields.values().all(|s| *s == SyncState::Applied)
    }

    /// True if the member reports replication fields and all are applied.
    pub fn replicating(&self) -> bool {
        !self.fields.is_empty() && self.caught_up()
    }
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{kind}")?,
            None => write!(f, "unknown")?,
        }
        for (name, state) in &self.fields {
            write!(f, " {name}={state}")?;
        }
        if let Some(count) = self.members_seen {
            write!(f, " members={count}")?;
        }
        Ok(())
    }
}

/// A status reading for one planned member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberObservation {
    pub address: String,
    pub role: Role,
    pub status: ReplicationStatus,
}

/// Renders a group observation for logs and timeout errors.
pub fn describe(observations: &[MemberObservation]) -> String {
    observations
        .iter()
        .map(|o| format!("{} [{}]", o.address, o.status))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Status queries against a fixed set of members. Channels are opened once.
pub struct StatusProbe<'a> {
    ctx: &'a RunContext,
    members: Vec<(&'a PlannedNode, Option<BoxedChannel>)>,
}

impl<'a> StatusProbe<'a> {
    /// Opens a channel to every member. A member that cannot be reached is
    /// a connectivity failure.
    pub async fn connect(
        ctx: &'a RunContext,
        members: impl IntoIterator<Item = &'a PlannedNode>,
    ) -> Result<StatusProbe<'a>, DeployError> {
        let mut opened = Vec::new();
        for member in members {
            let channel = ctx.connect(&member.node).await?;
            opened.push((member, Some(channel)));
        }
        Ok(StatusProbe { ctx, members: opened })
    }

    /// Like [`StatusProbe::connect`], but a member that cannot be reached
    /// reads as unreachable on every poll instead.
    pub async fn survey(
        ctx: &'a RunContext,
        members: impl IntoIterator<Item = &'a PlannedNode>,
    ) -> StatusProbe<'a> {
        let mut opened = Vec::new();
        for member in members {
            let channel = match ctx.connect(&member.node).await {
                Ok(channel) => Some(channel),
                Err(err) => {
                    warn!(
                        ctx.log,
                        "status channel unavailable";
                        "host" => member.host(),
                        "error" => %DisplayErrorChain::new(&err),
                    );
                    None
                }
            };
            opened.push((member, channel));
        }
        StatusProbe { ctx, members: opened }
    }

    pub async fn observe(&self) -> Vec<MemberObservation> {
        join_all(self.members.iter().map(|(member, channel)| async move {
            let status = match channel {
                Some(channel) => self.query(member, channel).await,
                None => ReplicationStatus::unreachable(),
            };
            MemberObservation {
                address: member.address(),
                role: member.role,
                status,
            }
        }))
        .await
    }

    async fn query(
        &self,
        member: &PlannedNode,
        channel: &BoxedChannel,
    ) -> ReplicationStatus {
        let spec = &self.ctx.spec;
        let command = engine::status_command(spec, member);
        match channel.run(&command).await {
            Ok(output) => {
                engine::parse_status(spec.engine, member.role, &output.stdout)
            }
            Err(err) => {
                debug!(
                    self.ctx.log,
                    "status query failed";
                    "host" => member.host(),
                    "error" => %DisplayErrorChain::new(&err),
                );
                ReplicationStatus::unreachable()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_is_never_caught_up() {
        let status = ReplicationStatus::unreachable();
        assert!(!status.caught_up());
        assert_eq!(status.to_string(), "unknown status=unreachable");
    }

    #[test]
    fn replica_needs_every_field_applied() {
        let status = ReplicationStatus::new(MemberKind::Replica)
            .with_field("io_thread", SyncState::Applied)
            .with_field("lag", SyncState::Lagging);
        assert!(!status.caught_up());
        let status = status.with_field("lag", SyncState::Applied);
        assert!(status.caught_up());
        assert!(status.replicating());
        assert!(!ReplicationStatus::new(MemberKind::Primary).replicating());
    }
}
