// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MongoDB member status and shard registration through `mongosh`.
//!
//! Each script prints a single JSON line, which is all the parsers look at.

use super::client_command;
use super::LOCALHOST;
use crate::status::MemberKind;
use crate::status::ReplicationStatus;
use crate::status::SyncState;
use camino::Utf8Path;
use serde::Deserialize;

/// Seconds a secondary may trail the primary and still count as applied.
const MAX_APPLIED_LAG_SECS: f64 = 1.0;

const STATUS_SCRIPT: &str = r#"const h = db.hello();
let lag = null;
if (h.secondary) {
  const s = rs.status();
  const me = s.members.find((m) => m.self);
  const p = s.members.find((m) => m.stateStr === "PRIMARY");
  if (me && p) { lag = (p.optimeDate - me.optimeDate) / 1000; }
}
print(JSON.stringify({
  primary: !!h.isWritablePrimary,
  secondary: !!h.secondary,
  arbiter: !!h.arbiterOnly,
  router: h.msg === "isdbgrid",
  members: (h.hosts || []).length + (h.arbiters || []).length,
  lag: lag,
}));"#;

const LIST_SHARDS_SCRIPT: &str = "print(JSON.stringify(\
     db.adminCommand({ listShards: 1 }).shards.map((s) => s._id)))";

const PING_SCRIPT: &str = "print(db.adminCommand({ ping: 1 }).ok)";

fn eval_command(client: &Utf8Path, port: u16, script: &str) -> String {
    let port = port.to_string();
    client_command(
        None,
        client,
        &["--quiet", "--host", LOCALHOST, "--port", &port, "--eval", script],
    )
}

pub fn status_command(client: &Utf8Path, port: u16) -> String {
    eval_command(client, port, STATUS_SCRIPT)
}

/// Registers the replica set described by `descriptor` with the router on
/// `port`.
pub fn add_shard_command(client: &Utf8Path, port: u16, descriptor: &str) -> String {
    let script = format!(
        "printjson(sh.addShard({}))",
        serde_json::Value::from(descriptor)
    );
    eval_command(client, port, &script)
}

pub fn list_shards_command(client: &Utf8Path, port: u16) -> String {
    eval_command(client, port, LIST_SHARDS_SCRIPT)
}

pub fn ping_command(client: &Utf8Path, port: u16) -> String {
    eval_command(client, port, PING_SCRIPT)
}

fn last_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}

#[derive(Debug, Deserialize)]
struct HelloSummary {
    primary: bool,
    secondary: bool,
    arbiter: bool,
    router: bool,
    members: u32,
    lag: Option<f64>,
}

pub fn parse_status(stdout: &str) -> ReplicationStatus {
    let Some(summary) = last_line(stdout)
        .and_then(|line| serde_json::from_str::<HelloSummary>(line).ok())
    else {
        return ReplicationStatus::unreachable();
    };
    if summary.router {
        ReplicationStatus::new(MemberKind::Router)
    } else if summary.primary {
        ReplicationStatus::new(MemberKind::Primary).with_members(summary.members)
    } else if summary.arbiter {
        ReplicationStatus::new(MemberKind::Arbiter).with_members(summary.members)
    } else if summary.secondary {
        let lag = match summary.lag {
            Some(secs) if secs <= MAX_APPLIED_LAG_SECS => SyncState::Applied,
            _ => SyncState::Lagging,
        };
        ReplicationStatus::new(MemberKind::Replica)
            .with_field("membership", SyncState::Applied)
            .with_field("lag", lag)
            .with_members(summary.members)
    } else {
        // Starting up, recovering or not yet added.
        ReplicationStatus::new(MemberKind::Replica)
            .with_field("membership", SyncState::Lagging)
    }
}

/// Names of the shards a router lists.
pub fn parse_list_shards(stdout: &str) -> Result<Vec<String>, String> {
    let line = last_line(stdout).ok_or_else(|| "no output".to_string())?;
    serde_json::from_str(line)
        .map_err(|err| format!("unexpected listShards output {line:?}: {err}"))
}

pub fn parse_ping(stdout: &str) -> bool {
    last_line(stdout) == Some("1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_and_secondary() {
        let primary = parse_status(
            r#"{"primary":true,"secondary":false,"arbiter":false,"router":false,"members":3,"lag":null}"#,
        );
        assert!(primary.is(MemberKind::Primary));
        assert_eq!(primary.members_seen, Some(3));

        let secondary = parse_status(
            r#"{"primary":false,"secondary":true,"arbiter":false,"router":false,"members":3,"lag":0}"#,
        );
        assert!(secondary.replicating());

        let behind = parse_status(
            r#"{"primary":false,"secondary":true,"arbiter":false,"router":false,"members":3,"lag":12.5}"#,
        );
        assert!(!behind.caught_up());
    }

    #[test]
    fn arbiter_and_router() {
        let arbiter = parse_status(
            r#"{"primary":false,"secondary":false,"arbiter":true,"router":false,"members":3,"lag":null}"#,
        );
        assert!(arbiter.is(MemberKind::Arbiter));
        assert!(arbiter.caught_up());

        let router = parse_status(
            "Current Mongosh Log ID: 1\n\
             {\"primary\":false,\"secondary\":false,\"arbiter\":false,\"router\":true,\"members\":0,\"lag\":null}\n",
        );
        assert!(router.is(MemberKind::Router));
    }

    #[test]
    fn shard_listing() {
        assert_eq!(
            parse_list_shards("[\"shard1\",\"shard2\"]\n").unwrap(),
            vec!["shard1", "shard2"]
        );
        assert!(parse_list_shards("MongoServerError: not authorized").is_err());
        assert!(parse_ping("1\n"));
        assert!(!parse_ping("MongoNetworkError: connect ECONNREFUSED"));
    }

    #[test]
    fn add_shard_quotes_the_descriptor() {
        let line = add_shard_command(
            Utf8Path::new("/opt/dbfleet/mongodb-27017/bin/mongosh"),
            27017,
            "shard1/db1:27018,db2:27018",
        );
        assert!(line.contains(r#"sh.addShard("shard1/db1:27018,db2:27018")"#));
        assert!(line.contains("--port 27017"));
    }
}
