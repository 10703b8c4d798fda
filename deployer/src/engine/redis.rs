// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::client_command;
use super::LOCALHOST;
use crate::config::Credentials;
use crate::status::MemberKind;
use crate::status::ReplicationStatus;
use crate::status::SyncState;
use camino::Utf8Path;
use std::collections::BTreeMap;

pub fn status_command(
    client: &Utf8Path,
    port: u16,
    credentials: &Credentials,
) -> String {
    let port = port.to_string();
    client_command(
        Some(("REDISCLI_AUTH", &credentials.password)),
        client,
        &["-h", LOCALHOST, "-p", &port, "info", "replication"],
    )
}

/// Parses `INFO replication`.
pub fn parse_status(stdout: &str) -> ReplicationStatus {
    let info: BTreeMap<&str, &str> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .collect();
    match info.get("role").copied() {
        Some("master") => {
            let replicas = info
                .get("connected_slaves")
                .and_then(|n| n.parse::<u32>().ok())
                .unwrap_or(0);
            ReplicationStatus::new(MemberKind::Primary).with_members(replicas + 1)
        }
        Some("slave") => {
            let link = match info.get("master_link_status").copied() {
                Some("up") => SyncState::Applied,
                Some(_) => SyncState::Lagging,
                None => SyncState::Unreachable,
            };
            let sync = match info.get("master_sync_in_progress").copied() {
                Some("0") => SyncState::Applied,
                _ => SyncState::Lagging,
            };
            ReplicationStatus::new(MemberKind::Replica)
                .with_field("link", link)
                .with_field("sync", sync)
        }
        _ => ReplicationStatus::unreachable(),
    }
}
