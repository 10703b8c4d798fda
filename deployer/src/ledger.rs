// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The record of what this run installed.

use crate::config::NodeSpec;
use dbfleet_node_agent::AgentCommand;
use dbfleet_node_agent::Role;
use std::sync::Arc;
use std::sync::Mutex;

/// A node whose install succeeded, and how to undo it.
#[derive(Clone, Debug)]
pub struct LedgerEntry {
    pub node: NodeSpec,
    pub role: Role,
    /// Bootstrap phase that installed the node, e.g. `shard shard1`.
    pub phase: String,
    pub uninstall: AgentCommand,
}

impl LedgerEntry {
    pub fn address(&self) -> String {
        self.node.address()
    }
}

/// Append-only list of installed nodes, shared by every branch of a run.
///
/// Created empty at the start of a run and dropped at its end; never
/// persisted.
#[derive(Clone, Debug, Default)]
pub struct InstallationLedger {
    entries: Arc<Mutex<Vec<LedgerEntry>>>,
}

impl InstallationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: LedgerEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    /// Entries in the order they were recorded.
    pub fn snapshot(&self) -> Vec<LedgerEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn addresses(&self) -> Vec<String> {
        self.entries.lock().unwrap().iter().map(LedgerEntry::address).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::removal_command;
    use crate::config::ClusterFile;
    use crate::planner::plan;

    #[test]
    fn entries_keep_insertion_order_across_clones() {
        let spec = ClusterFile::from_toml(
            r#"
            engine = "postgres"
            topology = "primary-replica"
            version = "16.2"

            [credentials]
            user = "postgres"
            password = "secret"

            [ssh]
            password = "pw"

            [environment]
            package_dir = "/srv/packages"

            [[nodes]]
            host = "pg1"
            [[nodes]]
            host = "pg2"
            "#,
        )
        .unwrap()
        .resolve()
        .unwrap();

        let ledger = InstallationLedger::new();
        let shared = ledger.clone();
        for planned in plan(&spec).nodes().into_iter().rev() {
            shared.record(LedgerEntry {
                node: planned.node.clone(),
                role: planned.role,
                phase: "replica set".to_string(),
                uninstall: removal_command(&spec, planned),
            });
        }
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.addresses(), vec!["pg2:5432", "pg1:5432"]);
        assert_eq!(ledger.snapshot()[1].role, Role::Primary);
    }
}
