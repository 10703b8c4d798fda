// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bringing a planned cluster up, one topology at a time.
//!
//! Each machine installs its members through [`crate::session::provision`]
//! and then waits for the engine to report the expected shape. None of them
//! undo anything; a failed machine leaves its installs in the ledger for
//! the rollback coordinator.

use crate::context::RunContext;
use crate::errors::DeployError;
use crate::poller::poll_until;
use crate::poller::RetryPolicy;
use crate::status::describe;
use crate::status::MemberObservation;
use crate::status::StatusProbe;

pub mod quorum;
pub mod replica;
pub mod sharded;

pub use quorum::QuorumMachine;
pub use quorum::QuorumState;
pub use replica::ReplicaSetMachine;
pub use replica::ReplicaSetState;
pub use sharded::ShardedFailure;
pub use sharded::ShardedPhase;

/// Polls `probe` until `predicate` accepts a full observation.
async fn await_convergence<P>(
    ctx: &RunContext,
    probe: &StatusProbe<'_>,
    what: &str,
    policy: RetryPolicy,
    predicate: P,
) -> Result<Vec<MemberObservation>, DeployError>
where
    P: Fn(&[MemberObservation]) -> Result<(), String>,
{
    let observations = poll_until(
        &ctx.log,
        what,
        policy,
        &ctx.cancel,
        || probe.observe(),
        |observed: &Vec<MemberObservation>| predicate(observed.as_slice()),
    )
    .await?;
    Ok(observations)
}

/// A predicate rejection carrying the whole observation.
fn not_yet(reason: impl AsRef<str>, observations: &[MemberObservation]) -> Result<(), String> {
    Err(format!("{}: {}", reason.as_ref(), describe(observations)))
}
