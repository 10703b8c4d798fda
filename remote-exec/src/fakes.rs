// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory [`RemoteChannel`] for tests.
//!
//! A [`FakeConnector`] hands out channels to [`FakeHost`]s. Each host keeps a
//! small virtual filesystem (enough for the workspace checks), records every
//! command it is asked to run, and answers commands through a scripted
//! handler.

use crate::channel::BoxedChannel;
use crate::channel::ChannelConnector;
use crate::channel::ChannelError;
use crate::channel::CommandFailureInfo;
use crate::channel::CommandOutput;
use crate::channel::RemoteChannel;
use crate::channel::SshTarget;
use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use slog::debug;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

/// What a scripted command "printed" and how it exited.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl FakeOutput {
    pub fn success() -> Self {
        FakeOutput { status: 0, stdout: String::new(), stderr: String::new() }
    }

    pub fn stdout(stdout: impl Into<String>) -> Self {
        FakeOutput { stdout: stdout.into(), ..FakeOutput::success() }
    }

    pub fn failure(status: i32, stderr: impl Into<String>) -> Self {
        FakeOutput { status, stdout: String::new(), stderr: stderr.into() }
    }

    /// Simulates the ssh transport dropping mid-command.
    pub fn disconnected() -> Self {
        FakeOutput::failure(255, "Connection reset by peer")
    }
}

/// One command as seen by a fake host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCommand {
    pub command: String,
    pub elevated: bool,
}

/// Handler called for every command run on a fake host.
pub type CommandFn = dyn FnMut(&str, bool) -> FakeOutput + Send;
pub type BoxedCommandFn = Box<CommandFn>;

#[derive(Default)]
struct FakeFs {
    dirs: BTreeSet<Utf8PathBuf>,
    files: BTreeSet<Utf8PathBuf>,
}

impl FakeFs {
    fn has_children(&self, path: &Utf8Path) -> bool {
        self.dirs
            .iter()
            .chain(self.files.iter())
            .any(|p| p != path && p.starts_with(path))
    }

    fn make_dir_all(&mut self, path: &Utf8Path) {
        for ancestor in path.ancestors() {
            if ancestor.as_str().is_empty() {
                continue;
            }
            self.dirs.insert(ancestor.to_owned());
        }
    }

    fn remove_all(&mut self, path: &Utf8Path) {
        self.dirs.retain(|p| !p.starts_with(path));
        self.files.retain(|p| !p.starts_with(path));
    }
}

/// A scripted remote host.
pub struct FakeHost {
    name: String,
    fs: Mutex<FakeFs>,
    commands: Mutex<Vec<RecordedCommand>>,
    handler: Mutex<BoxedCommandFn>,
    connect_error: Mutex<Option<String>>,
    connects: Mutex<usize>,
    interleave: AtomicBool,
}

impl FakeHost {
    fn new(name: &str) -> Self {
        FakeHost {
            name: name.to_string(),
            fs: Mutex::new(FakeFs::default()),
            commands: Mutex::new(Vec::new()),
            handler: Mutex::new(Box::new(|_, _| FakeOutput::success())),
            connect_error: Mutex::new(None),
            connects: Mutex::new(0),
            interleave: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the command handler to an arbitrary function.
    pub fn set_handler(&self, f: BoxedCommandFn) {
        *self.handler.lock().unwrap() = f;
    }

    /// Make every future connection attempt to this host fail.
    pub fn refuse_connections(&self, reason: &str) {
        *self.connect_error.lock().unwrap() = Some(reason.to_string());
    }

    /// Yield to the runtime before every channel operation, so concurrent
    /// sessions on this host interleave step by step.
    pub fn yield_between_operations(&self) {
        self.interleave.store(true, Ordering::SeqCst);
    }

    pub fn add_dir(&self, path: impl AsRef<Utf8Path>) {
        self.fs.lock().unwrap().make_dir_all(path.as_ref());
    }

    pub fn add_file(&self, path: impl AsRef<Utf8Path>) {
        let path = path.as_ref();
        let mut fs = self.fs.lock().unwrap();
        if let Some(parent) = path.parent() {
            fs.make_dir_all(parent);
        }
        fs.files.insert(path.to_owned());
    }

    pub fn exists(&self, path: impl AsRef<Utf8Path>) -> bool {
        let path = path.as_ref();
        let fs = self.fs.lock().unwrap();
        fs.dirs.contains(path) || fs.files.contains(path)
    }

    /// Every command run on this host, in order.
    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.commands.lock().unwrap().clone()
    }

    /// Commands containing `needle`, in order.
    pub fn commands_containing(&self, needle: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.command.contains(needle))
            .map(|c| c.command.clone())
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        *self.connects.lock().unwrap()
    }

    fn record(&self, command: &str, elevated: bool) {
        self.commands
            .lock()
            .unwrap()
            .push(RecordedCommand { command: command.to_string(), elevated });
    }
}

/// Hands out [`FakeChannel`]s. Hosts are created on first use.
pub struct FakeConnector {
    log: Logger,
    hosts: Mutex<BTreeMap<String, Arc<FakeHost>>>,
}

impl FakeConnector {
    pub fn new(log: &Logger) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            log: log.new(o!("component" => "FakeConnector")),
            hosts: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn host(&self, name: &str) -> Arc<FakeHost> {
        self.hosts
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FakeHost::new(name)))
            .clone()
    }

    /// Names of hosts that were ever connected to.
    pub fn connected_hosts(&self) -> Vec<String> {
        self.hosts
            .lock()
            .unwrap()
            .values()
            .filter(|h| h.connect_count() > 0)
            .map(|h| h.name.clone())
            .collect()
    }
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn connect(
        &self,
        target: &SshTarget,
    ) -> Result<BoxedChannel, ChannelError> {
        let host = self.host(&target.host);
        *host.connects.lock().unwrap() += 1;
        if let Some(reason) = host.connect_error.lock().unwrap().clone() {
            return Err(ChannelError::Connect {
                host: target.host.clone(),
                reason,
            });
        }
        Ok(Box::new(FakeChannel {
            log: self.log.new(o!("host" => target.host.clone())),
            host,
        }))
    }
}

pub struct FakeChannel {
    log: Logger,
    host: Arc<FakeHost>,
}

impl FakeChannel {
    async fn pause(&self) {
        if self.host.interleave.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }

    fn execute(
        &self,
        command: &str,
        elevated: bool,
    ) -> Result<CommandOutput, ChannelError> {
        debug!(self.log, "fake command"; "command" => command, "elevated" => elevated);
        self.host.record(command, elevated);
        let output = (self.host.handler.lock().unwrap())(command, elevated);
        match output.status {
            0 => Ok(CommandOutput {
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            255 => Err(ChannelError::Connect {
                host: self.host.name.clone(),
                reason: output.stderr,
            }),
            status => {
                Err(ChannelError::CommandFailure(Box::new(CommandFailureInfo {
                    host: self.host.name.clone(),
                    command: command.to_string(),
                    status: Some(status),
                    stdout: output.stdout,
                    stderr: output.stderr,
                })))
            }
        }
    }
}

#[async_trait]
impl RemoteChannel for FakeChannel {
    fn host(&self) -> &str {
        &self.host.name
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, ChannelError> {
        self.pause().await;
        self.execute(command, false)
    }

    async fn run_elevated(
        &self,
        command: &str,
    ) -> Result<CommandOutput, ChannelError> {
        self.pause().await;
        self.execute(command, true)
    }

    async fn copy_file(
        &self,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<(), ChannelError> {
        self.pause().await;
        self.host.record(&format!("copy {local} {remote}"), false);
        self.host.add_file(remote);
        Ok(())
    }

    async fn copy_tree(
        &self,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<(), ChannelError> {
        self.pause().await;
        self.host.record(&format!("copy-tree {local} {remote}"), false);
        self.host.add_dir(remote);
        Ok(())
    }

    async fn path_exists(&self, path: &Utf8Path) -> Result<bool, ChannelError> {
        self.pause().await;
        Ok(self.host.exists(path))
    }

    async fn is_directory(
        &self,
        path: &Utf8Path,
    ) -> Result<bool, ChannelError> {
        self.pause().await;
        Ok(self.host.fs.lock().unwrap().dirs.contains(path))
    }

    async fn is_empty_dir(
        &self,
        path: &Utf8Path,
    ) -> Result<bool, ChannelError> {
        self.pause().await;
        let fs = self.host.fs.lock().unwrap();
        Ok(fs.dirs.contains(path) && !fs.has_children(path))
    }

    async fn make_dir_all(&self, path: &Utf8Path) -> Result<(), ChannelError> {
        self.pause().await;
        self.host.record(&format!("mkdir -p {path}"), false);
        self.host.add_dir(path);
        Ok(())
    }

    async fn set_executable(
        &self,
        path: &Utf8Path,
    ) -> Result<(), ChannelError> {
        self.pause().await;
        self.host.record(&format!("chmod 0755 {path}"), false);
        Ok(())
    }

    async fn remove_all(&self, path: &Utf8Path) -> Result<(), ChannelError> {
        self.pause().await;
        // Removal still goes through the handler so tests can make it fail.
        self.execute(&format!("rm -rf {path}"), true)?;
        self.host.fs.lock().unwrap().remove_all(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SshAuth;

    fn target(host: &str) -> SshTarget {
        SshTarget {
            host: host.to_string(),
            port: 22,
            username: "root".to_string(),
            auth: SshAuth::Password("pw".to_string()),
        }
    }

    #[tokio::test]
    async fn virtual_fs_tracks_workspace_state() {
        let log = Logger::root(slog::Discard, o!());
        let connector = FakeConnector::new(&log);
        let channel = connector.connect(&target("db1")).await.unwrap();
        let ws = Utf8Path::new("/tmp/dbfleet");

        assert!(!channel.path_exists(ws).await.unwrap());
        channel.make_dir_all(ws).await.unwrap();
        assert!(channel.is_empty_dir(ws).await.unwrap());
        channel
            .copy_file(Utf8Path::new("/local/dbfleet"), &ws.join("dbfleet"))
            .await
            .unwrap();
        assert!(channel.is_directory(ws).await.unwrap());
        assert!(!channel.is_empty_dir(ws).await.unwrap());
        channel
            .copy_tree(Utf8Path::new("/local/conf.d"), &ws.join("conf.d"))
            .await
            .unwrap();
        assert!(channel.is_directory(&ws.join("conf.d")).await.unwrap());
        channel.remove_all(ws).await.unwrap();
        assert!(!channel.path_exists(ws).await.unwrap());
        assert!(!connector.host("db1").exists(ws.join("dbfleet")));
        assert!(!connector.host("db1").exists(ws.join("conf.d")));
    }

    #[tokio::test]
    async fn scripted_failures_become_typed_errors() {
        let log = Logger::root(slog::Discard, o!());
        let connector = FakeConnector::new(&log);
        connector.host("db1").set_handler(Box::new(|cmd, _| {
            if cmd.starts_with("boom") {
                FakeOutput::failure(3, "kaboom")
            } else if cmd.starts_with("drop") {
                FakeOutput::disconnected()
            } else {
                FakeOutput::stdout("ok")
            }
        }));
        connector.host("db2").refuse_connections("no route to host");

        let channel = connector.connect(&target("db1")).await.unwrap();
        assert_eq!(channel.run("echo").await.unwrap().stdout, "ok");
        match channel.run_elevated("boom now").await {
            Err(ChannelError::CommandFailure(info)) => {
                assert_eq!(info.status, Some(3));
                assert_eq!(info.stderr, "kaboom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(channel.run("drop").await.unwrap_err().is_connectivity());

        let err = connector.connect(&target("db2")).await.err().unwrap();
        assert!(err.is_connectivity());
        assert_eq!(connector.connected_hosts(), vec!["db1", "db2"]);

        let recorded = connector.host("db1").commands();
        assert_eq!(recorded.len(), 3);
        assert!(recorded[1].elevated);
    }
}
