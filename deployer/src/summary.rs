// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What the operator is told after a successful deploy.

use crate::config::ClusterSpec;
use crate::config::Topology;
use crate::planner::DeploymentPlan;
use crate::planner::PlannedNode;
use dbfleet_node_agent::EngineKind;
use dbfleet_node_agent::Role;
use serde::Serialize;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MemberSummary {
    pub host: String,
    pub port: u16,
    pub role: Role,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    pub engine: EngineKind,
    pub topology: Topology,
    pub user: String,
    pub members: Vec<MemberSummary>,
    pub connection_string: String,
}

impl ConnectionSummary {
    pub fn new(spec: &ClusterSpec, plan: &DeploymentPlan) -> Self {
        let nodes = plan.nodes();
        let members = nodes
            .iter()
            .map(|n| MemberSummary {
                host: n.node.host.clone(),
                port: n.node.options.port,
                role: n.role,
            })
            .collect();
        ConnectionSummary {
            engine: spec.engine,
            topology: spec.topology,
            user: spec.credentials.user.clone(),
            members,
            connection_string: connection_string(spec, plan, &nodes),
        }
    }
}

fn connection_string(
    spec: &ClusterSpec,
    plan: &DeploymentPlan,
    nodes: &[&PlannedNode],
) -> String {
    let user = &spec.credentials.user;
    let data = nodes
        .iter()
        .filter(|n| n.role.holds_data())
        .map(|n| n.address())
        .collect::<Vec<_>>()
        .join(",");
    match (spec.engine, plan) {
        (EngineKind::Mongodb, DeploymentPlan::Sharded(sharded)) => {
            let routers: Vec<String> =
                sharded.routers.iter().map(PlannedNode::address).collect();
            format!("mongodb://{user}@{}/", routers.join(","))
        }
        (EngineKind::Mongodb, _) => format!(
            "mongodb://{user}@{data}/?replicaSet={}",
            spec.replica_set
        ),
        (EngineKind::Postgres, _) => format!(
            "postgresql://{user}@{data}/postgres?target_session_attrs=read-write"
        ),
        (EngineKind::Mysql, _) => format!("mysql://{user}@{data}/"),
        (EngineKind::Redis, _) => {
            // Clients discover replicas through the primary.
            let primary = nodes.first().map(|n| n.address()).unwrap_or_default();
            format!("redis://{user}@{primary}")
        }
    }
}

impl fmt::Display for ConnectionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {} cluster is up", self.engine, self.topology)?;
        for member in &self.members {
            let address = format!("{}:{}", member.host, member.port);
            writeln!(f, "  {address:<40} {}", member.role)?;
        }
        writeln!(f, "user: {}", self.user)?;
        write!(f, "connect: {}", self.connection_string)
    }
}
