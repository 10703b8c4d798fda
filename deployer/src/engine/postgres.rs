// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PostgreSQL streaming replication status.

use super::client_command;
use super::LOCALHOST;
use crate::config::Credentials;
use crate::status::MemberKind;
use crate::status::ReplicationStatus;
use crate::status::SyncState;
use camino::Utf8Path;

/// One row: in recovery, attached standbys, WAL receiver state, and whether
/// everything received has been replayed.
const STATUS_SQL: &str = "SELECT pg_is_in_recovery(), \
     (SELECT count(*) FROM pg_stat_replication), \
     COALESCE((SELECT status FROM pg_stat_wal_receiver LIMIT 1), 'none'), \
     COALESCE(pg_last_wal_receive_lsn() = pg_last_wal_replay_lsn(), true)";

pub fn status_command(
    client: &Utf8Path,
    port: u16,
    credentials: &Credentials,
) -> String {
    let port = port.to_string();
    client_command(
        Some(("PGPASSWORD", &credentials.password)),
        client,
        &[
            "-h",
            LOCALHOST,
            "-p",
            &port,
            "-U",
            &credentials.user,
            "-d",
            "postgres",
            "-At",
            "-c",
            STATUS_SQL,
        ],
    )
}

pub fn parse_status(stdout: &str) -> ReplicationStatus {
    let Some(row) = stdout.lines().map(str::trim).find(|l| l.contains('|'))
    else {
        return ReplicationStatus::unreachable();
    };
    let columns: Vec<&str> = row.split('|').collect();
    let [in_recovery, standbys, receiver, replayed] = columns[..] else {
        return ReplicationStatus::unreachable();
    };
    match in_recovery {
        "f" => {
            let Ok(standbys) = standbys.parse::<u32>() else {
                return ReplicationStatus::unreachable();
            };
            ReplicationStatus::new(MemberKind::Primary)
                .with_members(standbys + 1)
        }
        "t" => {
            let receiver = match receiver {
                "streaming" => SyncState::Applied,
                "starting" | "catchup" | "waiting" => SyncState::Lagging,
                _ => SyncState::Unreachable,
            };
            let replay = if replayed == "t" {
                SyncState::Applied
            } else {
                SyncState::Lagging
            };
            ReplicationStatus::new(MemberKind::Replica)
                .with_field("receiver", receiver)
                .with_field("replay", replay)
        }
        _ => ReplicationStatus::unreachable(),
    }
}
