// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::config::ParseError;
use crate::config::ValidationError;
use crate::poller::PollError;
use camino::Utf8PathBuf;
use dbfleet_node_agent::package::PackageError;
use dbfleet_remote_exec::ChannelError;

/// Everything that can end a deploy run.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("cannot reach {host}")]
    Connectivity {
        host: String,
        #[source]
        source: ChannelError,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ParseError),

    #[error("workspace {path} on {host} exists and is not an empty directory")]
    WorkspaceConflict { host: String, path: Utf8PathBuf },

    #[error("environment check failed on {host}")]
    EnvironmentCheck {
        host: String,
        #[source]
        source: ChannelError,
    },

    #[error("copying {artifact} to {host} failed")]
    Transfer {
        host: String,
        artifact: Utf8PathBuf,
        #[source]
        source: ChannelError,
    },

    #[error("{step} failed on {host}")]
    Install {
        host: String,
        step: &'static str,
        #[source]
        source: ChannelError,
    },

    #[error(
        "{what} did not converge after {attempts} attempts \
         (last observed: {last_observation})"
    )]
    ConvergenceTimeout { what: String, attempts: u32, last_observation: String },

    #[error(
        "router {router} never listed shard {shard} after {attempts} \
         attempts (last observed: {last_observation})"
    )]
    Registration {
        router: String,
        shard: String,
        attempts: u32,
        last_observation: String,
    },

    #[error("package verification failed")]
    Package(#[from] PackageError),

    #[error("cancelled during {what}")]
    Cancelled { what: String },

    #[error("{0}")]
    Confirmation(String),
}

impl DeployError {
    /// The host the failure happened on, when there is exactly one.
    pub fn host(&self) -> Option<&str> {
        match self {
            DeployError::Connectivity { host, .. }
            | DeployError::WorkspaceConflict { host, .. }
            | DeployError::EnvironmentCheck { host, .. }
            | DeployError::Transfer { host, .. }
            | DeployError::Install { host, .. } => Some(host),
            DeployError::Registration { router, .. } => Some(router),
            _ => None,
        }
    }

    /// Maps a channel failure during `step` on `host` to the right variant.
    pub fn from_channel(
        host: &str,
        step: &'static str,
        source: ChannelError,
    ) -> DeployError {
        if source.is_connectivity() {
            DeployError::Connectivity { host: host.to_string(), source }
        } else {
            DeployError::Install { host: host.to_string(), step, source }
        }
    }
}

impl From<PollError> for DeployError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::Timeout { what, attempts, last_observation } => {
                DeployError::ConvergenceTimeout {
                    what,
                    attempts,
                    last_observation,
                }
            }
            PollError::Cancelled { what } => DeployError::Cancelled { what },
        }
    }
}
