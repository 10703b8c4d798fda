// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MySQL replica and Galera status, and the statements the orchestrator
//! issues itself.

use super::client_command;
use super::LOCALHOST;
use crate::config::Credentials;
use crate::status::MemberKind;
use crate::status::ReplicationStatus;
use crate::status::SyncState;
use camino::Utf8Path;
use dbfleet_node_agent::engine::GALERA_BOOTSTRAP_FLAG;
use dbfleet_node_agent::install::mysql_follow_sql;
use std::collections::BTreeMap;

const REPLICA_STATUS_SQL: &str =
    "SELECT @@global.read_only AS read_only; SHOW SLAVE STATUS";

const GALERA_STATUS_SQL: &str = "SHOW GLOBAL STATUS WHERE Variable_name IN \
     ('wsrep_local_state_comment', 'wsrep_cluster_status', 'wsrep_ready', \
     'wsrep_cluster_size')";

fn sql_command(
    client: &Utf8Path,
    host: &str,
    port: u16,
    credentials: &Credentials,
    sql: &str,
) -> String {
    let port = port.to_string();
    client_command(
        Some(("MYSQL_PWD", &credentials.password)),
        client,
        &[
            "-h",
            host,
            "-P",
            &port,
            "-u",
            &credentials.user,
            "--vertical",
            "-e",
            sql,
        ],
    )
}

pub fn status_command(
    client: &Utf8Path,
    port: u16,
    credentials: &Credentials,
) -> String {
    sql_command(client, LOCALHOST, port, credentials, REPLICA_STATUS_SQL)
}

pub fn galera_status_command(
    client: &Utf8Path,
    port: u16,
    credentials: &Credentials,
) -> String {
    sql_command(client, LOCALHOST, port, credentials, GALERA_STATUS_SQL)
}

/// Points the head at `head` back at `follow`, both `(host, port)`.
///
/// Runs on the follow host: its client connects out to the head.
pub fn cross_wire_command(
    client: &Utf8Path,
    head: (&str, u16),
    follow: (&str, u16),
    credentials: &Credentials,
) -> String {
    let repl_user = credentials.repl_user.as_deref().unwrap_or(&credentials.user);
    let repl_password = credentials
        .repl_password
        .as_deref()
        .unwrap_or(&credentials.password);
    let sql = mysql_follow_sql(follow.0, follow.1, repl_user, repl_password);
    sql_command(client, head.0, head.1, credentials, &sql)
}

/// Removes the new-cluster flag from a persisted unit file and reloads
/// the service manager. Runs elevated.
pub fn retract_bootstrap_command(service_dir: &Utf8Path, unit: &str) -> String {
    let expression = format!("s/ {GALERA_BOOTSTRAP_FLAG}//g");
    let unit_path = service_dir.join(unit);
    format!(
        "sed -i {} {} && systemctl daemon-reload",
        shell_words::quote(&expression),
        shell_words::quote(unit_path.as_str()),
    )
}

/// `key: value` lines of `--vertical` output. Later rows overwrite earlier
/// ones; the statements here return at most one row per key.
fn vertical_fields(stdout: &str) -> BTreeMap<&str, &str> {
    stdout
        .lines()
        .filter(|line| !line.starts_with("***"))
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect()
}

fn thread_state(value: Option<&&str>) -> SyncState {
    match value.copied() {
        Some("Yes") => SyncState::Applied,
        Some("Connecting") => SyncState::Lagging,
        _ => SyncState::Unreachable,
    }
}

fn lag_state(value: Option<&&str>) -> SyncState {
    match value.and_then(|v| v.parse::<u64>().ok()) {
        Some(0) => SyncState::Applied,
        Some(_) => SyncState::Lagging,
        None => SyncState::Unreachable,
    }
}

pub fn parse_status(stdout: &str) -> ReplicationStatus {
    let fields = vertical_fields(stdout);
    let kind = match fields.get("read_only").copied() {
        Some("0") => MemberKind::Primary,
        Some("1") => MemberKind::Replica,
        _ => return ReplicationStatus::unreachable(),
    };
    let status = ReplicationStatus::new(kind);
    if !fields.contains_key("Slave_IO_Running") {
        return status;
    }
    status
        .with_field("io_thread", thread_state(fields.get("Slave_IO_Running")))
        .with_field("sql_thread", thread_state(fields.get("Slave_SQL_Running")))
        .with_field("lag", lag_state(fields.get("Seconds_Behind_Master")))
}

/// `Variable_name`/`Value` pairs of `SHOW STATUS` in vertical form.
fn status_variables(stdout: &str) -> BTreeMap<&str, &str> {
    let mut variables = BTreeMap::new();
    let mut name = None;
    for (key, value) in stdout
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
    {
        match key {
            "Variable_name" => name = Some(value),
            "Value" => {
                if let Some(name) = name.take() {
                    variables.insert(name, value);
                }
            }
            _ => {}
        }
    }
    variables
}

pub fn parse_galera_status(stdout: &str) -> ReplicationStatus {
    let variables = status_variables(stdout);
    if variables.is_empty() {
        return ReplicationStatus::unreachable();
    }
    let local_state = match variables.get("wsrep_local_state_comment").copied() {
        Some("Synced") => SyncState::Applied,
        Some(state)
            if state.starts_with("Join") || state.starts_with("Donor") =>
        {
            SyncState::Lagging
        }
        _ => SyncState::Unreachable,
    };
    let cluster_status = match variables.get("wsrep_cluster_status").copied() {
        Some("Primary") => SyncState::Applied,
        _ => SyncState::Unreachable,
    };
    let ready = match variables.get("wsrep_ready").copied() {
        Some("ON") => SyncState::Applied,
        _ => SyncState::Lagging,
    };
    let status = ReplicationStatus::new(MemberKind::QuorumMember)
        .with_field("local_state", local_state)
        .with_field("cluster_status", cluster_status)
        .with_field("ready", ready);
    match variables.get("wsrep_cluster_size").and_then(|s| s.parse().ok()) {
        Some(size) => status.with_members(size),
        None => status,
    }
}
