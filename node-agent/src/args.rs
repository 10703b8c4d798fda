// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent command line: `<engine> <install|uninstall|msinstall|unmsinstall>`.
//!
//! The deployer builds these with [`AgentCommand::to_args`] and the staged
//! agent parses them back with clap, so this module is the whole wire
//! contract between the two.

use crate::engine::EngineKind;
use crate::engine::Role;
use crate::limits::ResourceLimits;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use clap::Args;
use clap::Subcommand;

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum AgentCommand {
    /// Install or remove a MySQL instance on this host
    Mysql {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Install or remove a PostgreSQL instance on this host
    Postgres {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Install or remove a MongoDB instance on this host
    Mongodb {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Install or remove a Redis instance on this host
    Redis {
        #[command(subcommand)]
        action: AgentAction,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum AgentAction {
    /// Install a standalone instance (or a quorum member, or a router)
    Install(InstallArgs),
    /// Remove an instance created by `install`
    Uninstall(UninstallArgs),
    /// Install an instance as a member of a replica set
    Msinstall(InstallArgs),
    /// Remove a replica set member created by `msinstall`
    Unmsinstall(UninstallArgs),
}

/// The four agent verbs, without their arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentVerb {
    Install,
    Uninstall,
    Msinstall,
    Unmsinstall,
}

impl AgentVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentVerb::Install => "install",
            AgentVerb::Uninstall => "uninstall",
            AgentVerb::Msinstall => "msinstall",
            AgentVerb::Unmsinstall => "unmsinstall",
        }
    }

    /// The verb that undoes this one.
    pub fn inverse(&self) -> AgentVerb {
        match self {
            AgentVerb::Install => AgentVerb::Uninstall,
            AgentVerb::Uninstall => AgentVerb::Install,
            AgentVerb::Msinstall => AgentVerb::Unmsinstall,
            AgentVerb::Unmsinstall => AgentVerb::Msinstall,
        }
    }
}

/// Where things live on the target host.
#[derive(Clone, Debug, PartialEq, Eq, Args)]
pub struct HostLayout {
    /// Directory under which instances are unpacked
    #[arg(long, default_value = "/opt/dbfleet")]
    pub install_base: Utf8PathBuf,

    /// Directory systemd loads unit files from
    #[arg(long, default_value = "/etc/systemd/system")]
    pub service_dir: Utf8PathBuf,

    /// Unprivileged account the database runs as
    #[arg(long, default_value = "dbfleet")]
    pub os_user: String,
}

impl Default for HostLayout {
    fn default() -> Self {
        HostLayout {
            install_base: Utf8PathBuf::from("/opt/dbfleet"),
            service_dir: Utf8PathBuf::from("/etc/systemd/system"),
            os_user: "dbfleet".to_string(),
        }
    }
}

impl HostLayout {
    fn push_args(&self, out: &mut Vec<String>) {
        push(out, "--install-base", self.install_base.as_str());
        push(out, "--service-dir", self.service_dir.as_str());
        push(out, "--os-user", &self.os_user);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Args)]
pub struct InstallArgs {
    /// Engine version; selects the package archive
    #[arg(long = "version")]
    pub version: String,

    #[arg(long)]
    pub port: u16,

    #[arg(long)]
    pub data_dir: Utf8PathBuf,

    /// Administrative database user
    #[arg(long)]
    pub user: String,

    #[arg(long)]
    pub password: String,

    /// Replication user (defaults to the administrative user)
    #[arg(long)]
    pub repl_user: Option<String>,

    #[arg(long)]
    pub repl_password: Option<String>,

    #[arg(long, value_enum)]
    pub role: Role,

    /// `host:port` of another member: the primary to follow, the quorum
    /// members to join, or the config servers a router uses
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    #[arg(long)]
    pub replica_set: Option<String>,

    /// Start this node as the first member of a new quorum
    #[arg(long)]
    pub bootstrap: bool,

    /// Memory budget for caches and buffers
    #[arg(long)]
    pub memory_mb: Option<u64>,

    #[arg(long)]
    pub resource_limit: Option<ResourceLimits>,

    /// Run every precondition check and exit without changing anything
    #[arg(long)]
    pub only_check: bool,

    /// Join an existing replica set through the first `--peer`
    #[arg(long)]
    pub add_replica: bool,

    /// Leave a failed install in place instead of removing it
    #[arg(long)]
    pub no_rollback: bool,

    /// Listen on IPv6 as well as IPv4
    #[arg(long)]
    pub ipv6: bool,

    /// Directory holding the staged package, manifest and unit template
    #[arg(long)]
    pub workspace: Utf8PathBuf,

    /// File name of the package archive within the workspace
    #[arg(long)]
    pub package: String,

    /// Address other members use to reach this node
    #[arg(long)]
    pub advertise: String,

    #[command(flatten)]
    pub layout: HostLayout,
}

impl InstallArgs {
    pub fn to_args(&self) -> Vec<String> {
        let mut out = Vec::new();
        push(&mut out, "--version", &self.version);
        push(&mut out, "--port", &self.port.to_string());
        push(&mut out, "--data-dir", self.data_dir.as_str());
        push(&mut out, "--user", &self.user);
        push(&mut out, "--password", &self.password);
        if let Some(repl_user) = &self.repl_user {
            push(&mut out, "--repl-user", repl_user);
        }
        if let Some(repl_password) = &self.repl_password {
            push(&mut out, "--repl-password", repl_password);
        }
        push(&mut out, "--role", self.role.as_str());
        for peer in &self.peers {
            push(&mut out, "--peer", peer);
        }
        if let Some(name) = &self.replica_set {
            push(&mut out, "--replica-set", name);
        }
        if let Some(memory_mb) = self.memory_mb {
            push(&mut out, "--memory-mb", &memory_mb.to_string());
        }
        if let Some(limits) = &self.resource_limit {
            if !limits.is_empty() {
                push(&mut out, "--resource-limit", &limits.to_string());
            }
        }
        for (set, flag) in [
            (self.bootstrap, "--bootstrap"),
            (self.only_check, "--only-check"),
            (self.add_replica, "--add-replica"),
            (self.no_rollback, "--no-rollback"),
            (self.ipv6, "--ipv6"),
        ] {
            if set {
                out.push(flag.to_string());
            }
        }
        push(&mut out, "--workspace", self.workspace.as_str());
        push(&mut out, "--package", &self.package);
        push(&mut out, "--advertise", &self.advertise);
        self.layout.push_args(&mut out);
        out
    }

    pub fn repl_user(&self) -> &str {
        self.repl_user.as_deref().unwrap_or(&self.user)
    }

    pub fn repl_password(&self) -> &str {
        self.repl_password.as_deref().unwrap_or(&self.password)
    }

    pub fn package_path(&self) -> Utf8PathBuf {
        self.workspace.join(&self.package)
    }

    /// The member address other nodes use for this instance.
    pub fn member_address(&self) -> String {
        join_host_port(&self.advertise, self.port)
    }

    /// The arguments needed to undo this install.
    pub fn uninstall_args(&self) -> UninstallArgs {
        UninstallArgs {
            port: self.port,
            data_dir: self.data_dir.clone(),
            role: self.role,
            peers: if self.add_replica { self.peers.clone() } else { vec![] },
            user: self.user.clone(),
            password: self.password.clone(),
            advertise: self.advertise.clone(),
            layout: self.layout.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Args)]
pub struct UninstallArgs {
    #[arg(long)]
    pub port: u16,

    #[arg(long)]
    pub data_dir: Utf8PathBuf,

    #[arg(long, value_enum)]
    pub role: Role,

    /// Member to ask to forget this node before it is removed
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    #[arg(long)]
    pub user: String,

    #[arg(long)]
    pub password: String,

    #[arg(long)]
    pub advertise: String,

    #[command(flatten)]
    pub layout: HostLayout,
}

impl UninstallArgs {
    pub fn to_args(&self) -> Vec<String> {
        let mut out = Vec::new();
        push(&mut out, "--port", &self.port.to_string());
        push(&mut out, "--data-dir", self.data_dir.as_str());
        push(&mut out, "--role", self.role.as_str());
        for peer in &self.peers {
            push(&mut out, "--peer", peer);
        }
        push(&mut out, "--user", &self.user);
        push(&mut out, "--password", &self.password);
        push(&mut out, "--advertise", &self.advertise);
        self.layout.push_args(&mut out);
        out
    }

    pub fn member_address(&self) -> String {
        join_host_port(&self.advertise, self.port)
    }
}

impl AgentAction {
    pub fn verb(&self) -> AgentVerb {
        match self {
            AgentAction::Install(_) => AgentVerb::Install,
            AgentAction::Uninstall(_) => AgentVerb::Uninstall,
            AgentAction::Msinstall(_) => AgentVerb::Msinstall,
            AgentAction::Unmsinstall(_) => AgentVerb::Unmsinstall,
        }
    }
}

impl AgentCommand {
    pub fn new(engine: EngineKind, action: AgentAction) -> AgentCommand {
        match engine {
            EngineKind::Mysql => AgentCommand::Mysql { action },
            EngineKind::Postgres => AgentCommand::Postgres { action },
            EngineKind::Mongodb => AgentCommand::Mongodb { action },
            EngineKind::Redis => AgentCommand::Redis { action },
        }
    }

    pub fn engine(&self) -> EngineKind {
        match self {
            AgentCommand::Mysql { .. } => EngineKind::Mysql,
            AgentCommand::Postgres { .. } => EngineKind::Postgres,
            AgentCommand::Mongodb { .. } => EngineKind::Mongodb,
            AgentCommand::Redis { .. } => EngineKind::Redis,
        }
    }

    pub fn action(&self) -> &AgentAction {
        match self {
            AgentCommand::Mysql { action }
            | AgentCommand::Postgres { action }
            | AgentCommand::Mongodb { action }
            | AgentCommand::Redis { action } => action,
        }
    }

    /// Arguments following the executable name.
    pub fn to_args(&self) -> Vec<String> {
        let action = self.action();
        let mut out = vec![
            self.engine().as_str().to_string(),
            action.verb().as_str().to_string(),
        ];
        match action {
            AgentAction::Install(args) | AgentAction::Msinstall(args) => {
                out.extend(args.to_args())
            }
            AgentAction::Uninstall(args) | AgentAction::Unmsinstall(args) => {
                out.extend(args.to_args())
            }
        }
        out
    }

    /// A shell command line running `exe` with these arguments.
    pub fn command_line(&self, exe: &Utf8Path) -> String {
        let mut words = vec![exe.to_string()];
        words.extend(self.to_args());
        shell_words::join(words)
    }
}

/// Formats `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Splits `host:port` (or `[v6]:port`).
pub fn split_host_port(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host, port.parse().ok()?))
}

fn push(out: &mut Vec<String>, flag: &str, value: &str) {
    out.push(flag.to_string());
    out.push(value.to_string());
}
