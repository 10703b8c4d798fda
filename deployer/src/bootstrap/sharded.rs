// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MongoDB sharded cluster assembly.

use super::replica::ReplicaSetMachine;
use crate::context::RunContext;
use crate::engine;
use crate::engine::mongodb;
use crate::errors::DeployError;
use crate::planner::PlannedNode;
use crate::planner::ReplicaSetPlan;
use crate::planner::ShardedPlan;
use crate::poller::poll_until;
use crate::poller::PollError;
use crate::session::provision;
use crate::session::SessionMode;
use dbfleet_remote_exec::BoxedChannel;
use futures::stream;
use futures::StreamExt;
use slog::info;
use std::fmt;

/// The four phases, in the order they run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardedPhase {
    Shards,
    ConfigServers,
    Routers,
    Registration,
}

impl fmt::Display for ShardedPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShardedPhase::Shards => "shard replica sets",
            ShardedPhase::ConfigServers => "config replica set",
            ShardedPhase::Routers => "routers",
            ShardedPhase::Registration => "shard registration",
        })
    }
}

/// A failed assembly and the phase it failed in. Rollback scope depends on
/// the phase.
#[derive(Debug)]
pub struct ShardedFailure {
    pub phase: ShardedPhase,
    pub error: DeployError,
}

fn failed(phase: ShardedPhase) -> impl FnOnce(DeployError) -> ShardedFailure {
    move |error| ShardedFailure { phase, error }
}

pub async fn assemble(
    ctx: &RunContext,
    plan: &ShardedPlan,
) -> Result<(), ShardedFailure> {
    let parallelism = ctx.spec.parallelism.max(1);

    // Shard sets are independent of each other. Let every one of them
    // finish before looking at the results, so nothing is still installing
    // when rollback starts.
    let results: Vec<Result<String, DeployError>> = stream::iter(&plan.shards)
        .map(|shard| async move {
            ReplicaSetMachine::new(ctx, shard, format!("shard {}", shard.name))
                .run()
                .await
        })
        .buffer_unordered(parallelism)
        .collect()
        .await;
    for result in results {
        let descriptor = result.map_err(failed(ShardedPhase::Shards))?;
        info!(ctx.log, "shard converged"; "descriptor" => descriptor);
    }

    let descriptor = ReplicaSetMachine::new(ctx, &plan.config, "config servers")
        .run()
        .await
        .map_err(failed(ShardedPhase::ConfigServers))?;
    info!(ctx.log, "config servers converged"; "descriptor" => descriptor);

    let results: Vec<Result<(), DeployError>> = stream::iter(&plan.routers)
        .map(|router| async move { start_router(ctx, router).await })
        .buffer_unordered(parallelism)
        .collect()
        .await;
    for result in results {
        result.map_err(failed(ShardedPhase::Routers))?;
    }

    for router in &plan.routers {
        register_shards(ctx, router, &plan.shards)
            .await
            .map_err(failed(ShardedPhase::Registration))?;
    }
    Ok(())
}

/// Installs a router and waits until it answers a ping.
async fn start_router(
    ctx: &RunContext,
    router: &PlannedNode,
) -> Result<(), DeployError> {
    provision(ctx, router, "router", SessionMode::Install).await?;
    let channel = ctx.connect(&router.node).await?;
    let command = mongodb::ping_command(
        &engine::client_path(&ctx.spec, router),
        router.node.options.port,
    );
    let channel = &channel;
    let command = command.as_str();
    poll_until(
        &ctx.log,
        &format!("router {}", router.address()),
        ctx.spec.retry.router,
        &ctx.cancel,
        || async move {
            match channel.run(command).await {
                Ok(output) => mongodb::parse_ping(&output.stdout),
                Err(_) => false,
            }
        },
        |alive: &bool| {
            if *alive {
                Ok(())
            } else {
                Err("router does not answer ping".to_string())
            }
        },
    )
    .await?;
    Ok(())
}

/// Adds every shard to `router`, in order, each confirmed by `listShards`
/// before the next.
async fn register_shards(
    ctx: &RunContext,
    router: &PlannedNode,
    shards: &[ReplicaSetPlan],
) -> Result<(), DeployError> {
    let channel = ctx.connect(&router.node).await?;
    for shard in shards {
        register_shard(ctx, router, &channel, shard).await?;
    }
    Ok(())
}

async fn register_shard(
    ctx: &RunContext,
    router: &PlannedNode,
    channel: &BoxedChannel,
    shard: &ReplicaSetPlan,
) -> Result<(), DeployError> {
    let client = engine::client_path(&ctx.spec, router);
    let port = router.node.options.port;
    let add = mongodb::add_shard_command(&client, port, &shard.descriptor());
    let list = mongodb::list_shards_command(&client, port);
    let (add, list) = (add.as_str(), list.as_str());
    let name = shard.name.as_str();

    let listed = || async move {
        let output = channel.run(list).await.map_err(|e| e.to_string())?;
        mongodb::parse_list_shards(&output.stdout)
    };
    let attempt = || async move {
        let shards = listed().await?;
        if shards.iter().any(|s| s == name) {
            return Ok(shards);
        }
        channel.run(add).await.map_err(|e| e.to_string())?;
        listed().await
    };
    let result = poll_until(
        &ctx.log,
        &format!("registration of {name} on {}", router.address()),
        ctx.spec.retry.shard_registration,
        &ctx.cancel,
        attempt,
        |observed: &Result<Vec<String>, String>| match observed {
            Ok(shards) if shards.iter().any(|s| s == name) => Ok(()),
            Ok(shards) => Err(format!("listShards returned {shards:?}")),
            Err(err) => Err(err.clone()),
        },
    )
    .await;
    match result {
        Ok(_) => {
            info!(
                ctx.log,
                "shard registered";
                "router" => router.address(),
                "shard" => name,
            );
            Ok(())
        }
        Err(PollError::Timeout { attempts, last_observation, .. }) => {
            Err(DeployError::Registration {
                router: router.address(),
                shard: name.to_string(),
                attempts,
                last_observation,
            })
        }
        Err(err @ PollError::Cancelled { .. }) => Err(err.into()),
    }
}
