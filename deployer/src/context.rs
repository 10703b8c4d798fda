// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! State shared by every step of one run.

use crate::config::ClusterSpec;
use crate::config::NodeSpec;
use crate::errors::DeployError;
use crate::ledger::InstallationLedger;
use crate::session::ArtifactSet;
use camino::Utf8PathBuf;
use dbfleet_remote_exec::BoxedChannel;
use dbfleet_remote_exec::ChannelConnector;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

type WorkspaceKey = (String, Utf8PathBuf);

/// One lock per remote workspace. Nodes that share a host also share its
/// workspace path, so their sessions must not overlap.
#[derive(Debug, Default)]
pub struct WorkspaceLocks {
    locks: Mutex<BTreeMap<WorkspaceKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkspaceLocks {
    pub async fn acquire(&self, node: &NodeSpec) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .unwrap()
            .entry((node.host.clone(), node.workspace.clone()))
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

pub struct RunContext {
    pub log: Logger,
    pub spec: Arc<ClusterSpec>,
    pub connector: Arc<dyn ChannelConnector>,
    pub artifacts: ArtifactSet,
    pub ledger: InstallationLedger,
    pub cancel: CancellationToken,
    pub workspaces: WorkspaceLocks,
    /// Whether a failed run is rolled back. Also tells the agent whether to
    /// clean up a failed local install.
    pub rollback: bool,
}

impl RunContext {
    pub fn node_log(&self, node: &NodeSpec) -> Logger {
        self.log.new(o!(
            "host" => node.host.clone(),
            "port" => node.options.port,
        ))
    }

    /// Runs `step`, failing with [`DeployError::Cancelled`] if the run is
    /// cancelled first.
    pub async fn guard<T, F>(&self, what: &str, step: F) -> Result<T, DeployError>
    where
        F: Future<Output = Result<T, DeployError>>,
    {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                Err(DeployError::Cancelled { what: what.to_string() })
            }
            result = step => result,
        }
    }

    /// Waits until no other session is using `node`'s workspace.
    pub async fn claim_workspace(
        &self,
        node: &NodeSpec,
    ) -> Result<OwnedMutexGuard<()>, DeployError> {
        let what = format!("waiting for {} on {}", node.workspace, node.host);
        self.guard(&what, async { Ok(self.workspaces.acquire(node).await) })
            .await
    }

    pub async fn connect(
        &self,
        node: &NodeSpec,
    ) -> Result<BoxedChannel, DeployError> {
        self.guard(&format!("connecting to {}", node.host), async {
            self.connector.connect(&node.ssh).await.map_err(|source| {
                DeployError::Connectivity { host: node.host.clone(), source }
            })
        })
        .await
    }

    /// Connects without honoring cancellation. Used by cleanup, which has to
    /// run after a cancelled step.
    pub async fn connect_for_cleanup(
        &self,
        node: &NodeSpec,
    ) -> Result<BoxedChannel, DeployError> {
        self.connector.connect(&node.ssh).await.map_err(|source| {
            DeployError::Connectivity { host: node.host.clone(), source }
        })
    }
}
