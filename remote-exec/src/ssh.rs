// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`RemoteChannel`] implementation on top of the system OpenSSH clients.

use crate::channel::BoxedChannel;
use crate::channel::ChannelConnector;
use crate::channel::ChannelError;
use crate::channel::CommandFailureInfo;
use crate::channel::CommandOutput;
use crate::channel::RemoteChannel;
use crate::channel::SshAuth;
use crate::channel::SshTarget;
use async_trait::async_trait;
use camino::Utf8Path;
use slog::debug;
use slog::info;
use slog::o;
use slog::Logger;
use std::process::Stdio;
use std::str::from_utf8;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// ssh(1) exits with 255 when the failure is its own rather than the remote
/// command's.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Flags whose following argument must never reach a log line.
const SECRET_FLAGS: &[&str] = &["--password", "--repl-password"];

/// Environment assignments and SQL clauses whose values are credentials.
const SECRET_ASSIGNMENTS: &[&str] =
    &["MYSQL_PWD", "PGPASSWORD", "REDISCLI_AUTH", "MASTER_PASSWORD"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SshTimeouts {
    pub connect: Duration,
    pub command: Duration,
}

impl Default for SshTimeouts {
    fn default() -> Self {
        SshTimeouts {
            connect: Duration::from_secs(30),
            command: Duration::from_secs(3600),
        }
    }
}

pub struct SshConnector {
    log: Logger,
    timeouts: SshTimeouts,
}

impl SshConnector {
    pub fn new(log: &Logger, timeouts: SshTimeouts) -> Self {
        SshConnector { log: log.new(o!("component" => "SshConnector")), timeouts }
    }
}

#[async_trait]
impl ChannelConnector for SshConnector {
    async fn connect(
        &self,
        target: &SshTarget,
    ) -> Result<BoxedChannel, ChannelError> {
        let channel = SshChannel {
            log: self.log.new(o!("host" => target.host.clone())),
            target: target.clone(),
            timeouts: self.timeouts,
            counter: AtomicU64::new(0),
        };

        // Open and close one session up front so that unreachable hosts and
        // bad credentials surface as connect errors rather than as the first
        // real command failing.
        match channel.run_with_timeout("true", None, self.timeouts.connect).await
        {
            Ok(_) => Ok(Box::new(channel)),
            Err(ChannelError::Connect { host, reason }) => {
                Err(ChannelError::Connect { host, reason })
            }
            Err(err) => Err(ChannelError::Connect {
                host: target.host.clone(),
                reason: err.to_string(),
            }),
        }
    }
}

pub struct SshChannel {
    log: Logger,
    target: SshTarget,
    timeouts: SshTimeouts,
    counter: AtomicU64,
}

impl SshChannel {
    /// Returns a command for `program` with authentication wired up: wrapped
    /// in `sshpass -e` for password auth, or given the key for key auth.
    fn authenticated(&self, program: &str) -> Command {
        match &self.target.auth {
            SshAuth::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(program).env("SSHPASS", password);
                cmd
            }
            SshAuth::KeyFile(_) => Command::new(program),
        }
    }

    /// Options shared by `ssh`, `scp` and the `ssh` that `rsync` runs.
    fn common_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.timeouts.connect.as_secs()),
        ];
        if let SshAuth::KeyFile(key) = &self.target.auth {
            opts.extend([
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-i".to_string(),
                key.to_string(),
            ]);
        }
        opts
    }

    fn ssh_command(&self, remote_cmd: &str) -> Command {
        let mut cmd = self.authenticated("ssh");
        cmd.args(self.common_options())
            .arg("-p")
            .arg(self.target.port.to_string())
            .arg("-l")
            .arg(&self.target.username)
            .arg(&self.target.host)
            .arg(remote_cmd);
        cmd
    }

    fn destination(&self, remote: &Utf8Path) -> String {
        format!(
            "{}@{}:{}",
            self.target.username,
            self.target.host_for_copy(),
            remote
        )
    }

    async fn run_with_timeout(
        &self,
        remote_cmd: &str,
        stdin: Option<String>,
        timeout: Duration,
    ) -> Result<CommandOutput, ChannelError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let shown = redact_for_log(remote_cmd);
        info!(self.log, "running remote command"; "id" => id, "command" => &shown);

        let mut cmd = self.ssh_command(remote_cmd);
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let spawn_err = |err| ChannelError::Spawn {
            host: self.target.host.clone(),
            command: shown.clone(),
            err,
        };
        let mut child = cmd.spawn().map_err(spawn_err)?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await.map_err(spawn_err)?;
            drop(pipe);
        }

        let output =
            match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(result) => result.map_err(spawn_err)?,
                Err(_) => {
                    return Err(ChannelError::Timeout {
                        host: self.target.host.clone(),
                        command: shown,
                        timeout,
                    })
                }
            };

        let stdout = from_utf8(&output.stdout)
            .unwrap_or("<Not valid UTF-8>")
            .to_string();
        let stderr = from_utf8(&output.stderr)
            .unwrap_or("<Not valid UTF-8>")
            .to_string();
        info!(
            self.log,
            "finished remote command";
            "id" => id,
            "result" => if output.status.success() { "OK" } else { "ERROR" },
            "status" => output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string()),
        );
        if !stdout.is_empty() {
            debug!(self.log, "remote command stdout"; "id" => id, "stdout" => &stdout);
        }
        if !stderr.is_empty() {
            debug!(self.log, "remote command stderr"; "id" => id, "stderr" => &stderr);
        }

        match output.status.code() {
            Some(0) => Ok(CommandOutput { stdout, stderr }),
            Some(SSH_TRANSPORT_FAILURE) => Err(ChannelError::Connect {
                host: self.target.host.clone(),
                reason: stderr.trim().to_string(),
            }),
            status => {
                Err(ChannelError::CommandFailure(Box::new(CommandFailureInfo {
                    host: self.target.host.clone(),
                    command: shown,
                    status,
                    stdout,
                    stderr,
                })))
            }
        }
    }

    async fn run_copy(
        &self,
        mut cmd: Command,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<(), ChannelError> {
        info!(
            self.log,
            "copying to remote host";
            "local" => %local,
            "remote" => %remote,
        );
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let transfer_err = |reason: String| ChannelError::Transfer {
            host: self.target.host.clone(),
            local: local.to_owned(),
            remote: remote.to_owned(),
            reason,
        };
        let output = tokio::time::timeout(self.timeouts.command, cmd.output())
            .await
            .map_err(|_| {
                transfer_err(format!(
                    "timed out after {:?}",
                    self.timeouts.command
                ))
            })?
            .map_err(|err| transfer_err(err.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(transfer_err(format!(
                "{}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    fn host(&self) -> &str {
        &self.target.host
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, ChannelError> {
        self.run_with_timeout(command, None, self.timeouts.command).await
    }

    async fn run_elevated(
        &self,
        command: &str,
    ) -> Result<CommandOutput, ChannelError> {
        if self.target.is_root() {
            return self.run(command).await;
        }
        let wrapped = shell_words::quote(command);
        match &self.target.auth {
            SshAuth::Password(password) => {
                self.run_with_timeout(
                    &format!("sudo -S -p '' sh -c {wrapped}"),
                    Some(format!("{password}\n")),
                    self.timeouts.command,
                )
                .await
            }
            SshAuth::KeyFile(_) => {
                self.run(&format!("sudo -n sh -c {wrapped}")).await
            }
        }
    }

    async fn copy_file(
        &self,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<(), ChannelError> {
        let mut cmd = self.authenticated("scp");
        cmd.args(self.common_options())
            .arg("-P")
            .arg(self.target.port.to_string())
            .arg(local)
            .arg(self.destination(remote));
        self.run_copy(cmd, local, remote).await
    }

    async fn copy_tree(
        &self,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<(), ChannelError> {
        let mut rsh = vec!["ssh".to_string()];
        rsh.extend(self.common_options());
        rsh.extend(["-p".to_string(), self.target.port.to_string()]);

        // For rsync to copy the directory's contents rather than the
        // directory itself the source needs a trailing slash.
        let src = format!("{}/", local.as_str().trim_end_matches('/'));
        let mut cmd = self.authenticated("rsync");
        cmd.arg("-az")
            .arg("-e")
            .arg(shell_words::join(&rsh))
            .arg(src)
            .arg(format!("{}/", self.destination(remote)));
        self.run_copy(cmd, local, remote).await
    }
}

/// Replaces the values of credential flags in a command line with a
/// placeholder.
pub(crate) fn redact_for_log(command: &str) -> String {
    let mut redact_next = false;
    command
        .split(' ')
        .map(|word| {
            if redact_next {
                redact_next = false;
                return "<redacted>".to_string();
            }
            if let Some((flag, _)) = word.split_once('=') {
                if SECRET_FLAGS.contains(&flag)
                    || SECRET_ASSIGNMENTS.contains(&flag)
                {
                    return format!("{flag}=<redacted>");
                }
            }
            if SECRET_FLAGS.contains(&word) {
                redact_next = true;
            }
            word.to_string()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(auth: SshAuth, username: &str) -> SshChannel {
        SshChannel {
            log: Logger::root(slog::Discard, o!()),
            target: SshTarget {
                host: "db1.example.com".to_string(),
                port: 2222,
                username: username.to_string(),
                auth,
            },
            timeouts: SshTimeouts::default(),
            counter: AtomicU64::new(0),
        }
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        std::iter::once(cmd.as_std().get_program())
            .chain(cmd.as_std().get_args())
            .map(|s| s.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn redacts_credential_flags() {
        assert_eq!(
            redact_for_log("./dbfleet mysql install --password s3cret --port 3306"),
            "./dbfleet mysql install --password <redacted> --port 3306"
        );
        assert_eq!(
            redact_for_log("x --repl-password=abc --user root"),
            "x --repl-password=<redacted> --user root"
        );
        assert_eq!(
            redact_for_log("MYSQL_PWD=s3cret mysql -u admin"),
            "MYSQL_PWD=<redacted> mysql -u admin"
        );
    }

    #[test]
    fn password_auth_goes_through_sshpass() {
        let channel = channel(SshAuth::Password("pw".to_string()), "root");
        let cmd = channel.ssh_command("uptime");
        let args = args_of(&cmd);
        assert_eq!(&args[..3], &["sshpass", "-e", "ssh"]);
        assert!(!args.iter().any(|a| a == "BatchMode=yes"));
        assert_eq!(args.last().map(String::as_str), Some("uptime"));
        let env: Vec<_> = cmd.as_std().get_envs().collect();
        assert!(env
            .iter()
            .any(|(k, v)| *k == "SSHPASS" && v.is_some_and(|v| v == "pw")));
    }

    #[test]
    fn key_auth_uses_batch_mode_and_identity() {
        let channel =
            channel(SshAuth::KeyFile("/keys/id_ed25519".into()), "deploy");
        let args = args_of(&channel.ssh_command("uptime"));
        assert_eq!(args[0], "ssh");
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/id_ed25519"]));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(args.windows(2).any(|w| w == ["-l", "deploy"]));
        assert!(args.iter().any(|a| a == "BatchMode=yes"));
    }
}
