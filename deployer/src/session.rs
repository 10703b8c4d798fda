// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives one node through the staged install protocol.
//!
//! For each node, strictly in order:
//!
//! 1. the remote workspace must be absent or an empty directory;
//! 2. the agent executable, package manifest, unit template and package
//!    archive are copied into it and the agent is made executable;
//! 3. the agent runs with `--only-check`, which checks everything the real
//!    install needs without changing anything;
//! 4. the agent runs for real; on success the node goes into the ledger;
//! 5. the workspace is removed, whatever happened before.
//!
//! A session is used for exactly one node and its flags only move forward.

use crate::agent::agent_path;
use crate::agent::install_command;
use crate::agent::uninstall_command;
use crate::agent::AgentFlags;
use crate::config::ClusterSpec;
use crate::config::ValidationError;
use crate::context::RunContext;
use crate::errors::DeployError;
use crate::ledger::LedgerEntry;
use crate::planner::PlannedNode;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use dbfleet_node_agent::package::PackageManifest;
use dbfleet_node_agent::workspace;
use dbfleet_remote_exec::BoxedChannel;
use dbfleet_remote_exec::ChannelError;
use display_error_chain::DisplayErrorChain;
use slog::info;
use slog::warn;
use slog::Logger;
use tokio::sync::OwnedMutexGuard;

/// Local files staged on every host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactSet {
    pub agent_binary: Utf8PathBuf,
    pub manifest: Utf8PathBuf,
    pub unit_template: Utf8PathBuf,
    pub package: Utf8PathBuf,
}

impl ArtifactSet {
    /// Locates every artifact, failing if any of them is missing.
    pub fn resolve(spec: &ClusterSpec) -> Result<ArtifactSet, DeployError> {
        let mut problems = Vec::new();
        let env = &spec.environment;
        let agent_binary = match &env.agent_binary {
            Some(path) => path.clone(),
            None => match std::env::current_exe()
                .map_err(|e| e.to_string())
                .and_then(|p| {
                    Utf8PathBuf::try_from(p).map_err(|e| e.to_string())
                }) {
                Ok(path) => path,
                Err(reason) => {
                    problems.push(format!(
                        "cannot locate the running executable: {reason}"
                    ));
                    Utf8PathBuf::new()
                }
            },
        };
        let artifacts = ArtifactSet {
            agent_binary,
            manifest: env.manifest.clone(),
            unit_template: env.unit_template.clone(),
            package: spec.package_path(),
        };
        for (what, path) in artifacts.local_files() {
            if !path.as_str().is_empty() && !path.is_file() {
                problems.push(format!("{what} {path} does not exist"));
            }
        }
        if problems.is_empty() {
            Ok(artifacts)
        } else {
            Err(ValidationError { problems }.into())
        }
    }

    /// Where the artifacts would be, without checking any of it. For runs
    /// that never stage anything.
    pub fn unstaged(spec: &ClusterSpec) -> ArtifactSet {
        let env = &spec.environment;
        ArtifactSet {
            agent_binary: env.agent_binary.clone().unwrap_or_default(),
            manifest: env.manifest.clone(),
            unit_template: env.unit_template.clone(),
            package: spec.package_path(),
        }
    }

    /// Checks the package archive against the manifest before anything is
    /// copied anywhere.
    pub async fn verify_package(&self) -> Result<(), DeployError> {
        let manifest = PackageManifest::load(&self.manifest).await?;
        manifest.verify(&self.package).await?;
        Ok(())
    }

    fn local_files(&self) -> [(&'static str, &Utf8Path); 4] {
        [
            ("agent binary", self.agent_binary.as_path()),
            ("package manifest", self.manifest.as_path()),
            ("unit template", self.unit_template.as_path()),
            ("package", self.package.as_path()),
        ]
    }

    /// `(local, remote)` pairs for a workspace.
    fn transfers(&self, ws: &Utf8Path) -> Vec<(&Utf8Path, Utf8PathBuf)> {
        let package_name = self.package.file_name().unwrap_or("package");
        vec![
            (self.agent_binary.as_path(), agent_path(ws)),
            (self.manifest.as_path(), ws.join(workspace::MANIFEST)),
            (self.unit_template.as_path(), ws.join(workspace::UNIT_TEMPLATE)),
            (self.package.as_path(), ws.join(package_name)),
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    /// Stop after the dry-run environment check.
    CheckOnly,
    Install,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub workspace_checked: bool,
    pub artifacts_transferred: bool,
    pub installed: bool,
    pub service_started: bool,
}

pub struct ProvisioningSession<'a> {
    log: Logger,
    ctx: &'a RunContext,
    planned: &'a PlannedNode,
    phase: &'a str,
    channel: BoxedChannel,
    flags: SessionFlags,
    _workspace: OwnedMutexGuard<()>,
}

/// Opens a session for `planned` and runs it to completion.
pub async fn provision(
    ctx: &RunContext,
    planned: &PlannedNode,
    phase: &str,
    mode: SessionMode,
) -> Result<SessionFlags, DeployError> {
    ProvisioningSession::open(ctx, planned, phase).await?.run(mode).await
}

impl<'a> ProvisioningSession<'a> {
    pub async fn open(
        ctx: &'a RunContext,
        planned: &'a PlannedNode,
        phase: &'a str,
    ) -> Result<ProvisioningSession<'a>, DeployError> {
        let log = ctx.node_log(&planned.node);
        let channel = ctx.connect(&planned.node).await?;
        let workspace = ctx.claim_workspace(&planned.node).await?;
        info!(log, "connected"; "role" => %planned.role, "phase" => phase);
        Ok(ProvisioningSession {
            log,
            ctx,
            planned,
            phase,
            channel,
            flags: SessionFlags::default(),
            _workspace: workspace,
        })
    }

    /// Runs every stage, then tears the workspace down whether or not the
    /// stages succeeded.
    pub async fn run(
        mut self,
        mode: SessionMode,
    ) -> Result<SessionFlags, DeployError> {
        let result = self.stages(mode).await;
        self.teardown().await;
        result.map(|()| self.flags)
    }

    async fn stages(&mut self, mode: SessionMode) -> Result<(), DeployError> {
        self.check_workspace().await?;
        self.transfer().await?;
        self.environment_check().await?;
        if mode == SessionMode::Install {
            self.install().await?;
        }
        Ok(())
    }

    fn host(&self) -> &str {
        self.planned.host()
    }

    fn workspace(&self) -> &Utf8Path {
        &self.planned.node.workspace
    }

    async fn check_workspace(&mut self) -> Result<(), DeployError> {
        let ws = self.workspace();
        let host = self.host();
        let channel = &self.channel;
        self.ctx
            .guard("workspace check", async {
                let exists = channel
                    .path_exists(ws)
                    .await
                    .map_err(|e| DeployError::from_channel(host, "workspace check", e))?;
                if !exists {
                    return Ok(());
                }
                let empty = channel
                    .is_empty_dir(ws)
                    .await
                    .map_err(|e| DeployError::from_channel(host, "workspace check", e))?;
                if empty {
                    Ok(())
                } else {
                    Err(DeployError::WorkspaceConflict {
                        host: host.to_string(),
                        path: ws.to_owned(),
                    })
                }
            })
            .await?;
        self.flags.workspace_checked = true;
        Ok(())
    }

    async fn transfer(&mut self) -> Result<(), DeployError> {
        let ws = self.workspace().to_owned();
        let host = self.host();
        let channel = &self.channel;
        let transfer_err = |artifact: &Utf8Path, source: ChannelError| {
            if ChannelError::is_connectivity(&source) {
                DeployError::Connectivity { host: host.to_string(), source }
            } else {
                DeployError::Transfer {
                    host: host.to_string(),
                    artifact: artifact.to_owned(),
                    source,
                }
            }
        };
        self.ctx
            .guard("artifact transfer", async {
                channel
                    .make_dir_all(&ws)
                    .await
                    .map_err(|e| transfer_err(&ws, e))?;
                for (local, remote) in self.ctx.artifacts.transfers(&ws) {
                    channel
                        .copy_file(local, &remote)
                        .await
                        .map_err(|e| transfer_err(local, e))?;
                }
                let agent = agent_path(&ws);
                channel
                    .set_executable(&agent)
                    .await
                    .map_err(|e| transfer_err(&agent, e))
            })
            .await?;
        info!(self.log, "artifacts staged"; "workspace" => %ws);
        self.flags.artifacts_transferred = true;
        Ok(())
    }

    fn agent_flags(&self, only_check: bool) -> AgentFlags {
        AgentFlags { only_check, no_rollback: !self.ctx.rollback }
    }

    async fn environment_check(&mut self) -> Result<(), DeployError> {
        let command =
            install_command(&self.ctx.spec, self.planned, self.agent_flags(true));
        let line = command.command_line(&agent_path(self.workspace()));
        let host = self.host();
        let channel = &self.channel;
        self.ctx
            .guard("environment check", async {
                channel.run_elevated(&line).await.map_err(|source| {
                    if source.is_connectivity() {
                        DeployError::Connectivity { host: host.to_string(), source }
                    } else {
                        DeployError::EnvironmentCheck {
                            host: host.to_string(),
                            source,
                        }
                    }
                })
            })
            .await?;
        info!(self.log, "environment check passed");
        Ok(())
    }

    async fn install(&mut self) -> Result<(), DeployError> {
        let command = install_command(
            &self.ctx.spec,
            self.planned,
            self.agent_flags(false),
        );
        let line = command.command_line(&agent_path(self.workspace()));
        let host = self.host();
        let channel = &self.channel;
        self.ctx
            .guard("install", async {
                channel
                    .run_elevated(&line)
                    .await
                    .map_err(|e| DeployError::from_channel(host, "install", e))
            })
            .await?;

        // The agent only returns once the unit is enabled and listening.
        self.flags.installed = true;
        self.flags.service_started = true;
        self.ctx.ledger.record(LedgerEntry {
            node: self.planned.node.clone(),
            role: self.planned.role,
            phase: self.phase.to_string(),
            uninstall: uninstall_command(&command),
        });
        info!(self.log, "installed"; "role" => %self.planned.role);
        Ok(())
    }

    async fn teardown(&self) {
        if let Err(err) = self.channel.remove_all(self.workspace()).await {
            warn!(
                self.log,
                "failed to remove workspace";
                "workspace" => %self.workspace(),
                "error" => %DisplayErrorChain::new(&err),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterFile;
    use crate::context::WorkspaceLocks;
    use crate::ledger::InstallationLedger;
    use crate::planner::plan;
    use dbfleet_remote_exec::fakes::FakeConnector;
    use dbfleet_remote_exec::fakes::FakeOutput;
    use slog::o;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn context() -> (RunContext, Arc<FakeConnector>) {
        let spec = ClusterFile::from_toml(
            r#"
            engine = "redis"
            topology = "single"
            version = "7.2.4"

            [credentials]
            user = "default"
            password = "secret"

            [ssh]
            password = "pw"

            [environment]
            package_dir = "/srv/packages"
            arch = "x86_64"

            [[nodes]]
            host = "cache1"
            "#,
        )
        .unwrap()
        .resolve()
        .unwrap();
        let log = Logger::root(slog::Discard, o!());
        let connector = FakeConnector::new(&log);
        let ctx = RunContext {
            log,
            spec: Arc::new(spec),
            connector: connector.clone(),
            artifacts: ArtifactSet {
                agent_binary: "/usr/local/bin/dbfleet".into(),
                manifest: "/srv/packages/manifest.toml".into(),
                unit_template: "/srv/packages/unit.template".into(),
                package: "/srv/packages/redis-7.2.4-linux-x86_64.tar.gz".into(),
            },
            ledger: InstallationLedger::new(),
            cancel: CancellationToken::new(),
            workspaces: WorkspaceLocks::default(),
            rollback: true,
        };
        (ctx, connector)
    }

    fn planned(ctx: &RunContext) -> PlannedNode {
        plan(&ctx.spec).nodes()[0].clone()
    }

    #[tokio::test]
    async fn install_runs_every_stage_in_order() {
        let (ctx, connector) = context();
        let node = planned(&ctx);
        let flags = provision(&ctx, &node, "single", SessionMode::Install)
            .await
            .unwrap();
        assert_eq!(
            flags,
            SessionFlags {
                workspace_checked: true,
                artifacts_transferred: true,
                installed: true,
                service_started: true,
            }
        );

        let host = connector.host("cache1");
        let commands: Vec<String> =
            host.commands().into_iter().map(|c| c.command).collect();
        assert_eq!(commands[0], "mkdir -p /tmp/dbfleet");
        assert_eq!(commands[1], "copy /usr/local/bin/dbfleet /tmp/dbfleet/dbfleet");
        assert!(commands[4].ends_with("/tmp/dbfleet/redis-7.2.4-linux-x86_64.tar.gz"));
        assert_eq!(commands[5], "chmod 0755 /tmp/dbfleet/dbfleet");
        assert!(commands[6].starts_with("/tmp/dbfleet/dbfleet redis install "));
        assert!(commands[6].contains("--only-check"));
        assert!(commands[7].starts_with("/tmp/dbfleet/dbfleet redis install "));
        assert!(!commands[7].contains("--only-check"));
        assert_eq!(commands[8], "rm -rf /tmp/dbfleet");
        assert_eq!(commands.len(), 9);
        assert!(!host.exists("/tmp/dbfleet"));

        let ledger = ctx.ledger.snapshot();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].address(), "cache1:6379");
        assert_eq!(ledger[0].phase, "single");
    }

    #[tokio::test]
    async fn check_mode_installs_nothing() {
        let (ctx, connector) = context();
        let node = planned(&ctx);
        let flags = provision(&ctx, &node, "check", SessionMode::CheckOnly)
            .await
            .unwrap();
        assert!(flags.artifacts_transferred);
        assert!(!flags.installed);
        assert!(ctx.ledger.is_empty());
        let host = connector.host("cache1");
        assert_eq!(host.commands_containing("--only-check").len(), 1);
        assert_eq!(host.commands_containing("redis install").len(), 1);
    }

    #[tokio::test]
    async fn occupied_workspace_is_a_conflict() {
        let (ctx, connector) = context();
        let host = connector.host("cache1");
        host.add_file("/tmp/dbfleet/leftover");
        let node = planned(&ctx);
        let err = provision(&ctx, &node, "single", SessionMode::Install)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::WorkspaceConflict { .. }), "{err}");
        assert!(host.commands_containing("dbfleet redis").is_empty());
        // Teardown still runs.
        assert_eq!(host.commands_containing("rm -rf").len(), 1);
    }

    #[tokio::test]
    async fn failed_check_stops_before_install() {
        let (ctx, connector) = context();
        let host = connector.host("cache1");
        host.set_handler(Box::new(|cmd, _| {
            if cmd.contains("--only-check") {
                FakeOutput::failure(1, "port 6379 is in use")
            } else {
                FakeOutput::success()
            }
        }));
        let node = planned(&ctx);
        let err = provision(&ctx, &node, "single", SessionMode::Install)
            .await
            .unwrap_err();
        match &err {
            DeployError::EnvironmentCheck { host, source } => {
                assert_eq!(host, "cache1");
                assert!(source.to_string().contains("port 6379 is in use"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(host.commands_containing("redis install").len(), 1);
        assert!(ctx.ledger.is_empty());
    }

    #[tokio::test]
    async fn teardown_failure_is_not_escalated() {
        let (ctx, connector) = context();
        connector.host("cache1").set_handler(Box::new(|cmd, _| {
            if cmd.starts_with("rm -rf") {
                FakeOutput::failure(1, "device busy")
            } else {
                FakeOutput::success()
            }
        }));
        let node = planned(&ctx);
        let flags = provision(&ctx, &node, "single", SessionMode::Install)
            .await
            .unwrap();
        assert!(flags.installed);
        assert_eq!(ctx.ledger.len(), 1);
    }
}
