// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cluster file.
//!
//! A cluster is described by one TOML document (see
//! `deployer/cluster-example.toml`):
//!
//! ```toml
//! engine = "mysql"
//! topology = "primary-replica"
//! version = "8.0.36"
//!
//! [credentials]
//! user = "admin"
//! password = "..."
//!
//! [ssh]
//! user = "root"
//! key_file = "/root/.ssh/id_ed25519"
//!
//! [environment]
//! package_dir = "/srv/dbfleet/packages"
//!
//! [[nodes]]
//! host = "10.0.0.1"
//! primary = true
//!
//! [[nodes]]
//! host = "10.0.0.2"
//! ```
//!
//! [`ClusterFile`] is the document as written. [`ClusterFile::resolve`]
//! applies defaults, checks every rule at once, and produces the immutable
//! [`ClusterSpec`] the rest of the deployer works from. Nothing touches the
//! network until a `ClusterSpec` exists.

use crate::logging::LogConfig;
use crate::poller::RetryPolicy;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use dbfleet_node_agent::args::join_host_port;
use dbfleet_node_agent::EngineKind;
use dbfleet_node_agent::HostLayout;
use dbfleet_node_agent::ResourceLimits;
use dbfleet_node_agent::Role;
use dbfleet_remote_exec::SshAuth;
use dbfleet_remote_exec::SshTarget;
use dbfleet_remote_exec::SshTimeouts;
use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Errors which may be returned when reading the cluster file.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Error deserializing toml from {path}: {err}")]
    Toml { path: Utf8PathBuf, err: toml::de::Error },
    #[error("IO error: {message}: {err}")]
    Io { message: String, err: std::io::Error },
}

pub fn parse<P: AsRef<Utf8Path>, C: DeserializeOwned>(
    path: P,
) -> Result<C, ParseError> {
    let path = path.as_ref();
    let contents = fs_err::read_to_string(path).map_err(|err| {
        ParseError::Io { message: format!("failed reading {path:?}"), err }
    })?;
    let cfg = toml::from_str::<C>(&contents)
        .map_err(|err| ParseError::Toml { path: path.to_path_buf(), err })?;
    Ok(cfg)
}

/// Every problem found in a cluster file, reported together.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub struct ValidationError {
    pub problems: Vec<String>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid cluster specification:")?;
        for problem in &self.problems {
            write!(f, "\n  - {problem}")?;
        }
        Ok(())
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    Single,
    PrimaryReplica,
    MultiPrimary,
    Quorum,
    Sharded,
}

impl Topology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::Single => "single",
            Topology::PrimaryReplica => "primary-replica",
            Topology::MultiPrimary => "multi-primary",
            Topology::Quorum => "quorum",
            Topology::Sharded => "sharded",
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of a sharded cluster a node belongs to.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Data,
    Config,
    Router,
}

impl Tier {
    /// The role used to pick a default port for this tier.
    fn port_role(&self, topology: Topology) -> Role {
        match (self, topology) {
            (Tier::Config, _) => Role::ConfigMember,
            (Tier::Router, _) => Role::Router,
            (Tier::Data, Topology::Sharded) => Role::ShardMember,
            (Tier::Data, _) => Role::Primary,
        }
    }
}

/// Database accounts created on every node.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub repl_user: Option<String>,
    #[serde(default)]
    pub repl_password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("repl_user", &self.repl_user)
            .finish_non_exhaustive()
    }
}

/// `[ssh]`: connection settings shared by every node unless overridden.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshDefaults {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_file: Option<Utf8PathBuf>,
    #[serde(default = "default_workspace")]
    pub workspace: Utf8PathBuf,
}

impl Default for SshDefaults {
    fn default() -> Self {
        SshDefaults {
            user: default_ssh_user(),
            port: default_ssh_port(),
            password: None,
            key_file: None,
            workspace: default_workspace(),
        }
    }
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_workspace() -> Utf8PathBuf {
    Utf8PathBuf::from("/tmp/dbfleet")
}

/// `[defaults]`: engine options shared by every node unless overridden.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDefaults {
    #[serde(default)]
    pub port: Option<u16>,
    /// Parent of each node's data directory; nodes get
    /// `<data_root>/<engine>-<port>`.
    #[serde(default)]
    pub data_root: Option<Utf8PathBuf>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

/// `[retry]`: the polling budget for each bootstrap phase.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_replication")]
    pub replication: RetryPolicy,
    #[serde(default = "default_quorum")]
    pub quorum: RetryPolicy,
    #[serde(default = "default_shard_registration")]
    pub shard_registration: RetryPolicy,
    #[serde(default = "default_router")]
    pub router: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            replication: RetryPolicy::REPLICATION,
            quorum: RetryPolicy::QUORUM,
            shard_registration: RetryPolicy::SHARD_REGISTRATION,
            router: RetryPolicy::ROUTER,
        }
    }
}

fn default_replication() -> RetryPolicy {
    RetryPolicy::REPLICATION
}

fn default_quorum() -> RetryPolicy {
    RetryPolicy::QUORUM
}

fn default_shard_registration() -> RetryPolicy {
    RetryPolicy::SHARD_REGISTRATION
}

fn default_router() -> RetryPolicy {
    RetryPolicy::ROUTER
}

/// `[environment]`: where things are on the deploying machine and on the
/// targets.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentFile {
    pub package_dir: Utf8PathBuf,
    #[serde(default)]
    pub manifest: Option<Utf8PathBuf>,
    #[serde(default)]
    pub unit_template: Option<Utf8PathBuf>,
    /// The executable staged on each host. Defaults to the running one.
    #[serde(default)]
    pub agent_binary: Option<Utf8PathBuf>,
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default)]
    pub install_base: Option<Utf8PathBuf>,
    #[serde(default)]
    pub service_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub os_user: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_arch() -> String {
    std::env::consts::ARCH.to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    3600
}

/// One `[[nodes]]` entry as written.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeFile {
    pub host: String,

    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub data_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,

    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub ssh_password: Option<String>,
    #[serde(default)]
    pub ssh_key_file: Option<Utf8PathBuf>,
    #[serde(default)]
    pub workspace: Option<Utf8PathBuf>,

    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub arbiter: bool,
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(default)]
    pub shard: Option<String>,
    #[serde(default)]
    pub tier: Tier,
}

/// The cluster file as written.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterFile {
    pub engine: EngineKind,
    pub topology: Topology,
    pub version: String,
    /// Replica set name for non-sharded MongoDB clusters.
    #[serde(default)]
    pub replica_set: Option<String>,
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub ipv6: bool,
    pub credentials: Credentials,
    #[serde(default)]
    pub ssh: SshDefaults,
    #[serde(default)]
    pub defaults: NodeDefaults,
    #[serde(default)]
    pub retry: RetryConfig,
    pub environment: EnvironmentFile,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub nodes: Vec<NodeFile>,
}

fn default_true() -> bool {
    true
}

fn default_parallelism() -> usize {
    1
}

/// Engine options every node has, whatever the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommonOptions {
    pub port: u16,
    pub data_dir: Utf8PathBuf,
    pub memory_mb: Option<u64>,
    pub limits: Option<ResourceLimits>,
}

/// Tags the planner uses to assign roles.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Placement {
    pub primary: bool,
    pub arbiter: bool,
    pub bootstrap: bool,
    pub shard: Option<String>,
    pub tier: Tier,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSpec {
    pub host: String,
    pub ssh: SshTarget,
    pub workspace: Utf8PathBuf,
    pub options: CommonOptions,
    pub placement: Placement,
}

impl NodeSpec {
    /// `host:port` of the database instance on this node.
    pub fn address(&self) -> String {
        join_host_port(&self.host, self.options.port)
    }
}

/// Resolved `[environment]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Environment {
    pub package_dir: Utf8PathBuf,
    pub manifest: Utf8PathBuf,
    pub unit_template: Utf8PathBuf,
    pub agent_binary: Option<Utf8PathBuf>,
    pub arch: String,
    pub layout: HostLayout,
    pub timeouts: SshTimeouts,
}

/// A validated cluster. Immutable once built.
#[derive(Clone, Debug)]
pub struct ClusterSpec {
    pub engine: EngineKind,
    pub topology: Topology,
    pub version: String,
    pub replica_set: String,
    pub nodes: Vec<NodeSpec>,
    pub credentials: Credentials,
    pub rollback_on_failure: bool,
    pub parallelism: usize,
    pub ipv6: bool,
    pub retry: RetryConfig,
    pub environment: Environment,
    pub log: LogConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl ClusterSpec {
    pub fn load(path: &Utf8Path) -> Result<ClusterSpec, LoadError> {
        let file: ClusterFile = parse(path)?;
        Ok(file.resolve()?)
    }

    /// File name of the package archive this cluster installs.
    pub fn package_name(&self) -> String {
        self.engine.package_name(&self.version, &self.environment.arch)
    }

    pub fn package_path(&self) -> Utf8PathBuf {
        self.environment.package_dir.join(self.package_name())
    }
}

impl ClusterFile {
    pub fn from_toml(contents: &str) -> Result<ClusterFile, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Applies defaults and checks the whole file.
    pub fn resolve(self) -> Result<ClusterSpec, ValidationError> {
        let mut problems = Vec::new();

        if self.version.trim().is_empty() {
            problems.push("version must not be empty".to_string());
        }
        if self.parallelism == 0 {
            problems.push("parallelism must be at least 1".to_string());
        }
        for (name, policy) in [
            ("retry.replication", &self.retry.replication),
            ("retry.quorum", &self.retry.quorum),
            ("retry.shard_registration", &self.retry.shard_registration),
            ("retry.router", &self.retry.router),
        ] {
            if policy.attempts == 0 {
                problems.push(format!("{name}.attempts must be at least 1"));
            }
        }
        if self.credentials.user.is_empty()
            || self.credentials.password.is_empty()
        {
            problems.push(
                "credentials.user and credentials.password are required"
                    .to_string(),
            );
        }
        validate_absolute_path(
            &self.environment.package_dir,
            "environment.package_dir",
            &mut problems,
        );

        let nodes: Vec<NodeSpec> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, node)| self.resolve_node(i, node, &mut problems))
            .collect();
        if self.nodes.is_empty() {
            problems.push("at least one node is required".to_string());
        }

        let duplicates: Vec<String> = nodes
            .iter()
            .map(|n| n.address())
            .duplicates()
            .collect();
        for address in duplicates {
            problems.push(format!("{address} is listed more than once"));
        }

        validate_topology(self.engine, self.topology, &nodes, &mut problems);

        if !problems.is_empty() {
            return Err(ValidationError { problems });
        }

        let environment = self.resolve_environment();
        Ok(ClusterSpec {
            engine: self.engine,
            topology: self.topology,
            version: self.version,
            replica_set: self.replica_set.unwrap_or_else(|| "rs0".to_string()),
            nodes,
            credentials: self.credentials,
            rollback_on_failure: self.rollback_on_failure,
            parallelism: self.parallelism,
            ipv6: self.ipv6,
            retry: self.retry,
            environment,
            log: self.log,
        })
    }

    fn resolve_node(
        &self,
        index: usize,
        node: &NodeFile,
        problems: &mut Vec<String>,
    ) -> Option<NodeSpec> {
        let label = if node.host.is_empty() {
            format!("nodes[{index}]")
        } else {
            format!("nodes[{index}] ({})", node.host)
        };
        if node.host.trim().is_empty() {
            problems.push(format!("{label}: host must not be empty"));
            return None;
        }

        let auth = match (&node.ssh_password, &node.ssh_key_file) {
            (Some(_), Some(_)) => {
                problems.push(format!(
                    "{label}: set ssh_password or ssh_key_file, not both"
                ));
                return None;
            }
            (Some(password), None) => SshAuth::Password(password.clone()),
            (None, Some(key)) => SshAuth::KeyFile(key.clone()),
            (None, None) => match (&self.ssh.password, &self.ssh.key_file) {
                (Some(_), Some(_)) => {
                    problems.push(format!(
                        "{label}: [ssh] sets both password and key_file"
                    ));
                    return None;
                }
                (Some(password), None) => SshAuth::Password(password.clone()),
                (None, Some(key)) => SshAuth::KeyFile(key.clone()),
                (None, None) => {
                    problems.push(format!(
                        "{label}: no ssh password or key file configured"
                    ));
                    return None;
                }
            },
        };

        let workspace =
            node.workspace.clone().unwrap_or_else(|| self.ssh.workspace.clone());
        validate_absolute_path(
            &workspace,
            &format!("{label}: workspace"),
            problems,
        );

        let port = node.port.or(self.defaults.port).unwrap_or_else(|| {
            self.engine.default_port(node.tier.port_role(self.topology))
        });
        let data_dir = match (&node.data_dir, &self.defaults.data_root) {
            (Some(dir), _) => dir.clone(),
            (None, Some(root)) => {
                root.join(format!("{}-{port}", self.engine))
            }
            (None, None) => Utf8PathBuf::from("/var/lib/dbfleet")
                .join(format!("{}-{port}", self.engine)),
        };
        validate_absolute_path(
            &data_dir,
            &format!("{label}: data_dir"),
            problems,
        );

        Some(NodeSpec {
            host: node.host.clone(),
            ssh: SshTarget {
                host: node.host.clone(),
                port: node.ssh_port.unwrap_or(self.ssh.port),
                username: node
                    .ssh_user
                    .clone()
                    .unwrap_or_else(|| self.ssh.user.clone()),
                auth,
            },
            workspace,
            options: CommonOptions {
                port,
                data_dir,
                memory_mb: node.memory_mb.or(self.defaults.memory_mb),
                limits: node.limits.or(self.defaults.limits),
            },
            placement: Placement {
                primary: node.primary,
                arbiter: node.arbiter,
                bootstrap: node.bootstrap,
                shard: node.shard.clone(),
                tier: node.tier,
            },
        })
    }

    fn resolve_environment(&self) -> Environment {
        let env = &self.environment;
        let defaults = HostLayout::default();
        Environment {
            manifest: env.manifest.clone().unwrap_or_else(|| {
                env.package_dir.join(dbfleet_node_agent::workspace::MANIFEST)
            }),
            unit_template: env.unit_template.clone().unwrap_or_else(|| {
                env.package_dir
                    .join(dbfleet_node_agent::workspace::UNIT_TEMPLATE)
            }),
            package_dir: env.package_dir.clone(),
            agent_binary: env.agent_binary.clone(),
            arch: env.arch.clone(),
            layout: HostLayout {
                install_base: env
                    .install_base
                    .clone()
                    .unwrap_or(defaults.install_base),
                service_dir: env
                    .service_dir
                    .clone()
                    .unwrap_or(defaults.service_dir),
                os_user: env.os_user.clone().unwrap_or(defaults.os_user),
            },
            timeouts: SshTimeouts {
                connect: Duration::from_secs(env.connect_timeout_secs),
                command: Duration::from_secs(env.command_timeout_secs),
            },
        }
    }
}

fn validate_absolute_path(
    path: &Utf8Path,
    field: &str,
    problems: &mut Vec<String>,
) {
    if !path.is_absolute() {
        problems.push(format!("{field} must be an absolute path"));
    }
}

fn validate_topology(
    engine: EngineKind,
    topology: Topology,
    nodes: &[NodeSpec],
    problems: &mut Vec<String>,
) {
    let mut require = |ok: bool, problem: &str| {
        if !ok {
            problems.push(format!("{topology} {engine}: {problem}"));
        }
    };

    let data: Vec<&NodeSpec> =
        nodes.iter().filter(|n| !n.placement.arbiter).collect();
    let arbiters = nodes.len() - data.len();
    let primaries = nodes.iter().filter(|n| n.placement.primary).count();
    let bootstraps = nodes.iter().filter(|n| n.placement.bootstrap).count();

    if topology != Topology::Sharded {
        require(
            nodes.iter().all(|n| {
                n.placement.shard.is_none() && n.placement.tier == Tier::Data
            }),
            "shard and tier are only meaningful for sharded clusters",
        );
    }
    if topology != Topology::Quorum {
        require(
            bootstraps == 0,
            "bootstrap is only meaningful for quorum clusters",
        );
    }
    require(
        arbiters == 0 || engine.supports_arbiter(),
        "this engine has no arbiter members",
    );
    require(
        !nodes.iter().any(|n| n.placement.primary && n.placement.arbiter),
        "a node cannot be both primary and arbiter",
    );

    match topology {
        Topology::Single => {
            require(nodes.len() == 1, "exactly one node is required");
            require(arbiters == 0, "arbiters need a replica set");
        }
        Topology::PrimaryReplica => {
            require(
                data.len() >= 2,
                "at least two data-bearing nodes are required",
            );
            require(primaries <= 1, "at most one node may be primary");
        }
        Topology::MultiPrimary => {
            require(
                engine == EngineKind::Mysql,
                "multi-primary is only supported for mysql",
            );
            require(data.len() >= 2, "at least two nodes are required");
            require(primaries <= 1, "at most one node may be primary");
        }
        Topology::Quorum => {
            require(
                engine == EngineKind::Mysql,
                "quorum clusters are only supported for mysql",
            );
            require(arbiters == 0, "quorum clusters have no arbiters");
            require(
                data.len() >= 3,
                "at least three members are required for a quorum",
            );
            require(bootstraps <= 1, "at most one node may be bootstrap");
            require(primaries == 0, "quorum members have no primary");
        }
        Topology::Sharded => {
            require(
                engine == EngineKind::Mongodb,
                "sharded clusters are only supported for mongodb",
            );
            let by_tier = |tier: Tier| {
                nodes.iter().filter(move |n| n.placement.tier == tier)
            };
            require(
                by_tier(Tier::Config).next().is_some(),
                "at least one config node is required",
            );
            require(
                by_tier(Tier::Router).next().is_some(),
                "at least one router node is required",
            );
            require(
                by_tier(Tier::Data).next().is_some(),
                "at least one shard node is required",
            );
            require(
                by_tier(Tier::Data).all(|n| n.placement.shard.is_some()),
                "every data node needs a shard name",
            );
            require(
                by_tier(Tier::Config)
                    .chain(by_tier(Tier::Router))
                    .all(|n| n.placement.shard.is_none()),
                "config and router nodes do not belong to a shard",
            );
            require(
                by_tier(Tier::Router)
                    .all(|n| !n.placement.arbiter && !n.placement.primary),
                "routers cannot be primary or arbiter",
            );

            let mut shards: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
            for node in by_tier(Tier::Data) {
                if let Some(shard) = &node.placement.shard {
                    let entry = shards.entry(shard.as_str()).or_default();
                    if !node.placement.arbiter {
                        entry.0 += 1;
                    }
                    if node.placement.primary {
                        entry.1 += 1;
                    }
                }
            }
            for (shard, (data, primaries)) in &shards {
                require(
                    *data >= 1,
                    &format!("shard {shard} has no data-bearing member"),
                );
                require(
                    *primaries <= 1,
                    &format!("shard {shard} has more than one primary"),
                );
            }
            let config_primaries = by_tier(Tier::Config)
                .filter(|n| n.placement.primary)
                .count();
            require(
                config_primaries <= 1,
                "at most one config node may be primary",
            );
            let names: BTreeSet<&str> = shards.keys().copied().collect();
            require(
                !names.contains(crate::planner::CONFIG_REPLICA_SET),
                "shard name collides with the config replica set",
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const VALID_HEADER: &str = r#"
        engine = "mysql"
        version = "8.0.36"

        [credentials]
        user = "admin"
        password = "secret"

        [ssh]
        key_file = "/root/.ssh/id_ed25519"

        [environment]
        package_dir = "/srv/dbfleet/packages"
    "#;

    fn resolve(contents: &str) -> Result<ClusterSpec, ValidationError> {
        ClusterFile::from_toml(contents).unwrap().resolve()
    }

    fn nodes(count: usize) -> String {
        (1..=count)
            .map(|i| format!("[[nodes]]\nhost = \"10.0.0.{i}\"\n"))
            .collect()
    }

    #[test]
    fn defaults_are_applied() {
        let spec = resolve(&format!(
            "topology = \"primary-replica\"\n{VALID_HEADER}\n{}",
            nodes(3)
        ))
        .unwrap();
        assert_eq!(spec.nodes.len(), 3);
        let node = &spec.nodes[0];
        assert_eq!(node.options.port, 3306);
        assert_eq!(node.options.data_dir, "/var/lib/dbfleet/mysql-3306");
        assert_eq!(node.workspace, "/tmp/dbfleet");
        assert_eq!(node.ssh.username, "root");
        assert_eq!(node.ssh.port, 22);
        assert_eq!(
            spec.environment.manifest,
            "/srv/dbfleet/packages/manifest.toml"
        );
        assert_eq!(spec.environment.layout, HostLayout::default());
        assert_eq!(spec.retry, RetryConfig::default());
        assert!(spec.rollback_on_failure);
        assert_eq!(spec.parallelism, 1);
    }

    #[test]
    fn node_settings_override_defaults() {
        let spec = resolve(&format!(
            r#"
            topology = "single"
            {VALID_HEADER}

            [defaults]
            port = 3307
            data_root = "/data"
            limits = "cpu=200"

            [retry.replication]
            attempts = 4
            delay_secs = 1

            [[nodes]]
            host = "db1"
            ssh_user = "deploy"
            ssh_password = "pw"
            memory_mb = 2048
            "#
        ))
        .unwrap();
        let node = &spec.nodes[0];
        assert_eq!(node.options.port, 3307);
        assert_eq!(node.options.data_dir, "/data/mysql-3307");
        assert_eq!(node.options.memory_mb, Some(2048));
        assert_eq!(node.options.limits.as_ref().unwrap().cpu_percent, Some(200));
        assert_eq!(node.ssh.username, "deploy");
        assert_eq!(node.ssh.auth, SshAuth::Password("pw".to_string()));
        assert_eq!(spec.retry.replication.attempts, 4);
        assert_eq!(spec.retry.quorum, RetryPolicy::QUORUM);
    }

    #[test]
    fn quorum_needs_three_members() {
        let error = resolve(&format!(
            "topology = \"quorum\"\n{VALID_HEADER}\n{}",
            nodes(2)
        ))
        .unwrap_err();
        assert_eq!(
            error.problems,
            vec![
                "quorum mysql: at least three members are required for a \
                 quorum"
                    .to_string()
            ]
        );
        assert!(resolve(&format!(
            "topology = \"quorum\"\n{VALID_HEADER}\n{}",
            nodes(3)
        ))
        .is_ok());
    }

    #[test]
    fn all_problems_are_reported_together() {
        let error = resolve(&format!(
            r#"
            topology = "single"
            parallelism = 0
            {VALID_HEADER}

            [[nodes]]
            host = "db1"
            workspace = "relative/ws"

            [[nodes]]
            host = "db1"
            arbiter = true
            "#
        ))
        .unwrap_err();
        let text = error.to_string();
        assert!(text.starts_with("invalid cluster specification:"));
        assert!(text.contains("parallelism must be at least 1"));
        assert!(text.contains("workspace must be an absolute path"));
        assert!(text.contains("db1:3306 is listed more than once"));
        assert!(text.contains("exactly one node is required"));
        assert!(text.contains("this engine has no arbiter members"));
    }

    #[test]
    fn ssh_auth_must_be_unambiguous() {
        let error = resolve(&format!(
            r#"
            topology = "single"
            {VALID_HEADER}

            [[nodes]]
            host = "db1"
            ssh_password = "pw"
            ssh_key_file = "/root/.ssh/id_rsa"
            "#
        ))
        .unwrap_err();
        assert!(error.problems[0].contains("not both"));
    }

    #[test]
    fn sharded_layout_rules() {
        let header = VALID_HEADER.replace("mysql", "mongodb");
        let spec = resolve(&format!(
            r#"
            topology = "sharded"
            {header}

            [[nodes]]
            host = "s1a"
            shard = "shard1"
            [[nodes]]
            host = "s1b"
            shard = "shard1"
            [[nodes]]
            host = "cfg1"
            tier = "config"
            [[nodes]]
            host = "mongos1"
            tier = "router"
            "#
        ))
        .unwrap();
        let ports: Vec<u16> = spec.nodes.iter().map(|n| n.options.port).collect();
        assert_eq!(ports, vec![27018, 27018, 27019, 27017]);

        let error = resolve(&format!(
            r#"
            topology = "sharded"
            {header}

            [[nodes]]
            host = "s1a"
            [[nodes]]
            host = "mongos1"
            tier = "router"
            shard = "shard1"
            "#
        ))
        .unwrap_err();
        let text = error.to_string();
        assert!(text.contains("at least one config node is required"));
        assert!(text.contains("every data node needs a shard name"));
        assert!(text.contains("config and router nodes do not belong"));
    }

    #[test]
    fn credentials_are_not_debug_printed() {
        let credentials = Credentials {
            user: "admin".to_string(),
            password: "hunter2".to_string(),
            repl_user: None,
            repl_password: Some("hunter3".to_string()),
        };
        let text = format!("{credentials:?}");
        assert!(!text.contains("hunter"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let error = ClusterFile::from_toml(&format!(
            "topology = \"single\"\nflavor = \"x\"\n{VALID_HEADER}"
        ))
        .err()
        .unwrap();
        assert!(error.to_string().contains("unknown field `flavor`"));
    }

    #[test]
    fn example_file_is_valid() {
        let spec = ClusterFile::from_toml(include_str!("../cluster-example.toml"))
            .unwrap()
            .resolve()
            .unwrap();
        assert_eq!(spec.topology, Topology::PrimaryReplica);
        assert_eq!(spec.nodes.len(), 3);
        assert_eq!(spec.nodes[0].options.data_dir, "/data/mysql-3306");
        assert_eq!(spec.nodes[2].ssh.username, "deploy");
        assert!(matches!(spec.log, LogConfig::File { .. }));
    }
}
