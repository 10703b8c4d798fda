// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-engine client invocations run on the hosts, and parsers for what
//! they print.
//!
//! Every command here runs the engine's own client from the instance
//! directory the agent unpacked, against the instance on the local host.
//! Passwords travel in the client's environment variable rather than on
//! its command line.

use crate::config::ClusterSpec;
use crate::planner::PlannedNode;
use crate::status::ReplicationStatus;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use dbfleet_node_agent::EngineKind;
use dbfleet_node_agent::Role;

pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod redis;

/// The local address every status query connects to.
const LOCALHOST: &str = "127.0.0.1";

/// The client binary for `member`'s instance.
pub fn client_path(spec: &ClusterSpec, member: &PlannedNode) -> Utf8PathBuf {
    spec.engine.client_path(
        &spec.environment.layout.install_base,
        member.node.options.port,
    )
}

/// The command that reports `member`'s replication state.
pub fn status_command(spec: &ClusterSpec, member: &PlannedNode) -> String {
    let client = client_path(spec, member);
    let port = member.node.options.port;
    let credentials = &spec.credentials;
    match spec.engine {
        EngineKind::Mysql if member.role == Role::QuorumMember => {
            mysql::galera_status_command(&client, port, credentials)
        }
        EngineKind::Mysql => mysql::status_command(&client, port, credentials),
        EngineKind::Postgres => {
            postgres::status_command(&client, port, credentials)
        }
        EngineKind::Mongodb => mongodb::status_command(&client, port),
        EngineKind::Redis => redis::status_command(&client, port, credentials),
    }
}

/// Parses the output of [`status_command`]. Output that cannot be
/// understood reads as unreachable.
pub fn parse_status(
    engine: EngineKind,
    role: Role,
    stdout: &str,
) -> ReplicationStatus {
    match engine {
        EngineKind::Mysql if role == Role::QuorumMember => {
            mysql::parse_galera_status(stdout)
        }
        EngineKind::Mysql => mysql::parse_status(stdout),
        EngineKind::Postgres => postgres::parse_status(stdout),
        EngineKind::Mongodb => mongodb::parse_status(stdout),
        EngineKind::Redis => redis::parse_status(stdout),
    }
}

/// `NAME=value client args...`, quoted for the remote shell.
fn client_command(
    secret: Option<(&str, &str)>,
    client: &Utf8Path,
    args: &[&str],
) -> String {
    let mut words: Vec<String> = Vec::with_capacity(args.len() + 1);
    words.push(client.to_string());
    words.extend(args.iter().map(|a| a.to_string()));
    let line = shell_words::join(words);
    match secret {
        Some((name, value)) => {
            format!("{name}={} {line}", shell_words::quote(value))
        }
        None => line,
    }
}
