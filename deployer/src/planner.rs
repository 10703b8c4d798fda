// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turns a [`ClusterSpec`] into roles and install order.
//!
//! Planning is a pure function of the cluster: the same `ClusterSpec` always
//! produces the same plan, and every node gets exactly one [`Role`].

use crate::config::ClusterSpec;
use crate::config::NodeSpec;
use crate::config::Tier;
use crate::config::Topology;
use dbfleet_node_agent::EngineKind;
use dbfleet_node_agent::Role;
use std::collections::BTreeMap;

/// Replica set name of the MongoDB config servers.
pub const CONFIG_REPLICA_SET: &str = "cfg";

/// One node with everything the agent needs to know about its place in the
/// cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedNode {
    pub node: NodeSpec,
    pub role: Role,
    /// Members this node follows, joins, or (for routers) reads config from.
    pub peers: Vec<String>,
    pub replica_set: Option<String>,
    pub bootstrap: bool,
    /// Join an existing replica set through `peers[0]`.
    pub add_replica: bool,
}

impl PlannedNode {
    pub fn host(&self) -> &str {
        &self.node.host
    }

    pub fn address(&self) -> String {
        self.node.address()
    }
}

/// A replica set: a primary followed by the members that join it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaSetPlan {
    pub name: String,
    /// `members[0]` is the primary.
    pub members: Vec<PlannedNode>,
}

impl ReplicaSetPlan {
    pub fn primary(&self) -> &PlannedNode {
        &self.members[0]
    }

    pub fn joiners(&self) -> &[PlannedNode] {
        &self.members[1..]
    }

    pub fn expects_arbiter(&self) -> bool {
        self.members.iter().any(|m| m.role == Role::Arbiter)
    }

    /// `name/host:port,...` over the data-bearing members, the form
    /// `sh.addShard` takes.
    pub fn descriptor(&self) -> String {
        let hosts: Vec<String> = self
            .members
            .iter()
            .filter(|m| m.role.holds_data())
            .map(PlannedNode::address)
            .collect();
        format!("{}/{}", self.name, hosts.join(","))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuorumPlan {
    pub bootstrap: PlannedNode,
    pub peers: Vec<PlannedNode>,
}

impl QuorumPlan {
    pub fn size(&self) -> usize {
        1 + self.peers.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardedPlan {
    /// Sorted by shard name.
    pub shards: Vec<ReplicaSetPlan>,
    pub config: ReplicaSetPlan,
    pub routers: Vec<PlannedNode>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeploymentPlan {
    Single(PlannedNode),
    PrimaryReplica(ReplicaSetPlan),
    /// The first two members are the heads.
    MultiPrimary(ReplicaSetPlan),
    Quorum(QuorumPlan),
    Sharded(ShardedPlan),
}

impl DeploymentPlan {
    /// Every planned node, in the order they are installed.
    pub fn nodes(&self) -> Vec<&PlannedNode> {
        match self {
            DeploymentPlan::Single(node) => vec![node],
            DeploymentPlan::PrimaryReplica(set)
            | DeploymentPlan::MultiPrimary(set) => set.members.iter().collect(),
            DeploymentPlan::Quorum(quorum) => std::iter::once(&quorum.bootstrap)
                .chain(quorum.peers.iter())
                .collect(),
            DeploymentPlan::Sharded(sharded) => sharded
                .shards
                .iter()
                .flat_map(|s| s.members.iter())
                .chain(sharded.config.members.iter())
                .chain(sharded.routers.iter())
                .collect(),
        }
    }
}

pub fn plan(spec: &ClusterSpec) -> DeploymentPlan {
    let all: Vec<&NodeSpec> = spec.nodes.iter().collect();
    match spec.topology {
        Topology::Single => {
            let replica_set = (spec.engine == EngineKind::Mongodb)
                .then(|| spec.replica_set.clone());
            DeploymentPlan::Single(standalone(all[0], Role::Primary, replica_set))
        }
        Topology::PrimaryReplica => DeploymentPlan::PrimaryReplica(replica_set(
            spec.engine,
            &spec.replica_set,
            &all,
            Role::Primary,
            Role::Replica,
        )),
        Topology::MultiPrimary => DeploymentPlan::MultiPrimary(replica_set(
            spec.engine,
            &spec.replica_set,
            &all,
            Role::Primary,
            Role::Replica,
        )),
        Topology::Quorum => DeploymentPlan::Quorum(quorum(&all)),
        Topology::Sharded => DeploymentPlan::Sharded(sharded(spec)),
    }
}

fn standalone(
    node: &NodeSpec,
    role: Role,
    replica_set: Option<String>,
) -> PlannedNode {
    PlannedNode {
        node: node.clone(),
        role,
        peers: Vec::new(),
        replica_set,
        bootstrap: false,
        add_replica: false,
    }
}

/// The tagged primary, else the first data-bearing node in file order.
fn choose_primary(nodes: &[&NodeSpec]) -> usize {
    nodes
        .iter()
        .position(|n| n.placement.primary)
        .or_else(|| nodes.iter().position(|n| !n.placement.arbiter))
        .unwrap_or(0)
}

fn replica_set(
    engine: EngineKind,
    name: &str,
    nodes: &[&NodeSpec],
    primary_role: Role,
    member_role: Role,
) -> ReplicaSetPlan {
    let replica_set =
        (engine == EngineKind::Mongodb).then(|| name.to_string());
    let primary_index = choose_primary(nodes);
    let primary = nodes[primary_index];
    let primary_address = primary.address();

    let mut members =
        vec![standalone(primary, primary_role, replica_set.clone())];
    members.extend(
        nodes.iter().enumerate().filter(|(i, _)| *i != primary_index).map(
            |(_, node)| PlannedNode {
                node: (*node).clone(),
                role: if node.placement.arbiter {
                    Role::Arbiter
                } else {
                    member_role
                },
                peers: vec![primary_address.clone()],
                replica_set: replica_set.clone(),
                bootstrap: false,
                add_replica: true,
            },
        ),
    );
    ReplicaSetPlan { name: name.to_string(), members }
}

fn quorum(nodes: &[&NodeSpec]) -> QuorumPlan {
    let first = nodes.iter().position(|n| n.placement.bootstrap).unwrap_or(0);
    let addresses: Vec<String> = nodes.iter().map(|n| n.address()).collect();
    let member = |index: usize| {
        let node = nodes[index];
        PlannedNode {
            node: node.clone(),
            role: Role::QuorumMember,
            peers: addresses
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, a)| a.clone())
                .collect(),
            replica_set: None,
            bootstrap: index == first,
            add_replica: false,
        }
    };
    QuorumPlan {
        bootstrap: member(first),
        peers: (0..nodes.len()).filter(|i| *i != first).map(member).collect(),
    }
}

fn sharded(spec: &ClusterSpec) -> ShardedPlan {
    let mut groups: BTreeMap<&str, Vec<&NodeSpec>> = BTreeMap::new();
    let mut config = Vec::new();
    let mut routers = Vec::new();
    for node in &spec.nodes {
        match (node.placement.tier, &node.placement.shard) {
            (Tier::Data, Some(shard)) => {
                groups.entry(shard.as_str()).or_default().push(node)
            }
            (Tier::Data, None) => {}
            (Tier::Config, _) => config.push(node),
            (Tier::Router, _) => routers.push(node),
        }
    }

    let shards = groups
        .into_iter()
        .map(|(name, nodes)| {
            replica_set(
                spec.engine,
                name,
                &nodes,
                Role::ShardMember,
                Role::ShardMember,
            )
        })
        .collect();
    let config = replica_set(
        spec.engine,
        CONFIG_REPLICA_SET,
        &config,
        Role::ConfigMember,
        Role::ConfigMember,
    );
    let config_addresses: Vec<String> =
        config.members.iter().map(PlannedNode::address).collect();
    let routers = routers
        .into_iter()
        .map(|node| PlannedNode {
            node: node.clone(),
            role: Role::Router,
            peers: config_addresses.clone(),
            replica_set: Some(CONFIG_REPLICA_SET.to_string()),
            bootstrap: false,
            add_replica: false,
        })
        .collect();
    ShardedPlan { shards, config, routers }
}
