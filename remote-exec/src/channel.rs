// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// How to authenticate to a remote host.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SshAuth {
    Password(String),
    KeyFile(Utf8PathBuf),
}

// Passwords end up in log lines via `Debug` otherwise.
impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(<redacted>)"),
            SshAuth::KeyFile(path) => {
                f.debug_tuple("KeyFile").field(path).finish()
            }
        }
    }
}

/// SSH coordinates of a single host.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

impl SshTarget {
    pub fn is_root(&self) -> bool {
        self.username == "root"
    }

    /// Returns the host in the form accepted by `scp` and `rsync`
    /// destinations, bracketing IPv6 literals.
    pub fn host_for_copy(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

/// Captured output of a command that exited successfully.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Describes a remote command that ran but exited unsuccessfully.
#[derive(Debug)]
pub struct CommandFailureInfo {
    pub host: String,
    pub command: String,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "command [{}] on {} failed with status: ", self.command, self.host)?;
        match self.status {
            Some(code) => write!(f, "{code}")?,
            None => write!(f, "<killed by signal>")?,
        }
        if !self.stdout.trim().is_empty() {
            write!(f, "  stdout: {}", self.stdout.trim())?;
        }
        if !self.stderr.trim().is_empty() {
            write!(f, "  stderr: {}", self.stderr.trim())?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("failed to start [{command}] for {host}")]
    Spawn {
        host: String,
        command: String,
        #[source]
        err: std::io::Error,
    },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    #[error("command [{command}] on {host} timed out after {timeout:?}")]
    Timeout { host: String, command: String, timeout: Duration },

    #[error("copying {local} to {host}:{remote} failed: {reason}")]
    Transfer {
        host: String,
        local: Utf8PathBuf,
        remote: Utf8PathBuf,
        reason: String,
    },
}

impl ChannelError {
    /// Returns true if the failure was in reaching the host at all, rather
    /// than in the command that ran there.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ChannelError::Connect { .. })
    }

    /// Returns the stdout captured from a failed command, if any.
    pub fn stdout(&self) -> Option<&str> {
        match self {
            ChannelError::CommandFailure(info) => Some(&info.stdout),
            _ => None,
        }
    }
}

/// Describes the commonly-used trait object for a connected channel.
pub type BoxedChannel = Box<dyn RemoteChannel>;

/// An authenticated connection to one host.
///
/// The filesystem helpers have default implementations in terms of
/// [`RemoteChannel::run`] so that implementations only need to provide
/// command execution and file transfer.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// The host this channel is connected to.
    fn host(&self) -> &str;

    /// Runs `command` through the remote login shell as the login user.
    async fn run(&self, command: &str) -> Result<CommandOutput, ChannelError>;

    /// Runs `command` with elevated privileges.
    async fn run_elevated(
        &self,
        command: &str,
    ) -> Result<CommandOutput, ChannelError>;

    /// Copies a single local file to `remote`.
    async fn copy_file(
        &self,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<(), ChannelError>;

    /// Copies the contents of the local directory `local` into `remote`.
    async fn copy_tree(
        &self,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<(), ChannelError>;

    async fn path_exists(&self, path: &Utf8Path) -> Result<bool, ChannelError> {
        self.test(&format!("test -e {}", quote(path))).await
    }

    async fn is_directory(
        &self,
        path: &Utf8Path,
    ) -> Result<bool, ChannelError> {
        self.test(&format!("test -d {}", quote(path))).await
    }

    /// Returns true if `path` is a directory with no entries.
    async fn is_empty_dir(
        &self,
        path: &Utf8Path,
    ) -> Result<bool, ChannelError> {
        let path = quote(path);
        self.test(&format!(
            "test -d {path} && test -z \"$(ls -A {path})\""
        ))
        .await
    }

    async fn make_dir_all(&self, path: &Utf8Path) -> Result<(), ChannelError> {
        self.run(&format!("mkdir -p {}", quote(path))).await.map(|_| ())
    }

    async fn set_executable(
        &self,
        path: &Utf8Path,
    ) -> Result<(), ChannelError> {
        self.run(&format!("chmod 0755 {}", quote(path))).await.map(|_| ())
    }

    /// Removes `path` and everything beneath it. Files written by elevated
    /// commands may be owned by root, so this runs elevated.
    async fn remove_all(&self, path: &Utf8Path) -> Result<(), ChannelError> {
        self.run_elevated(&format!("rm -rf {}", quote(path))).await.map(|_| ())
    }

    /// Runs a shell test expression, mapping its exit status to a bool
    /// without treating "false" as a failure.
    async fn test(&self, expr: &str) -> Result<bool, ChannelError> {
        let output = self
            .run(&format!("if {expr}; then echo yes; else echo no; fi"))
            .await?;
        Ok(output.stdout.trim() == "yes")
    }
}

/// Opens channels. Production code uses [`crate::SshConnector`]; tests use
/// [`crate::fakes::FakeConnector`].
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(
        &self,
        target: &SshTarget,
    ) -> Result<BoxedChannel, ChannelError>;
}

fn quote(path: &Utf8Path) -> std::borrow::Cow<'_, str> {
    shell_words::quote(path.as_str())
}
