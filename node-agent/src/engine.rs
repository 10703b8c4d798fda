// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-engine naming and defaults.

use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Start option that makes a Galera node form a new cluster by itself.
pub const GALERA_BOOTSTRAP_FLAG: &str = "--wsrep-new-cluster";

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Mysql,
    Postgres,
    Mongodb,
    Redis,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Mysql => "mysql",
            EngineKind::Postgres => "postgres",
            EngineKind::Mongodb => "mongodb",
            EngineKind::Redis => "redis",
        }
    }

    /// Name of the systemd unit for the instance listening on `port`.
    pub fn unit_name(&self, port: u16) -> String {
        format!("dbfleet-{}-{port}.service", self.as_str())
    }

    /// File name of the package archive for `version` on `arch`.
    pub fn package_name(&self, version: &str, arch: &str) -> String {
        format!("{}-{version}-linux-{arch}.tar.gz", self.as_str())
    }

    /// Port used when neither the node nor the cluster sets one.
    pub fn default_port(&self, role: Role) -> u16 {
        match (self, role) {
            (EngineKind::Mysql, _) => 3306,
            (EngineKind::Postgres, _) => 5432,
            (EngineKind::Mongodb, Role::ConfigMember) => 27019,
            (EngineKind::Mongodb, Role::ShardMember) => 27018,
            (EngineKind::Mongodb, _) => 27017,
            (EngineKind::Redis, _) => 6379,
        }
    }

    /// Shared library name prefixes the engine binaries link against and that
    /// are not shipped in the package.
    pub fn required_libraries(&self) -> &'static [&'static str] {
        match self {
            EngineKind::Mysql => &["libaio.so", "libnuma.so"],
            EngineKind::Postgres => &["libreadline.so", "libz.so"],
            EngineKind::Mongodb => &["libcurl.so", "libssl.so"],
            EngineKind::Redis => &[],
        }
    }

    /// Where the instance listening on `port` is unpacked.
    pub fn instance_dir(&self, install_base: &Utf8Path, port: u16) -> Utf8PathBuf {
        install_base.join(format!("{}-{port}", self.as_str()))
    }

    /// The interactive client used for status queries and post-start setup.
    pub fn client_binary(&self) -> &'static str {
        match self {
            EngineKind::Mysql => "mysql",
            EngineKind::Postgres => "psql",
            EngineKind::Mongodb => "mongosh",
            EngineKind::Redis => "redis-cli",
        }
    }

    pub fn client_path(&self, install_base: &Utf8Path, port: u16) -> Utf8PathBuf {
        self.instance_dir(install_base, port)
            .join("bin")
            .join(self.client_binary())
    }

    /// Whether the engine has a voting non-data member.
    pub fn supports_arbiter(&self) -> bool {
        matches!(self, EngineKind::Mongodb)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The part a single node plays in its cluster.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Primary,
    Replica,
    Arbiter,
    QuorumMember,
    ShardMember,
    ConfigMember,
    Router,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Replica => "replica",
            Role::Arbiter => "arbiter",
            Role::QuorumMember => "quorum-member",
            Role::ShardMember => "shard-member",
            Role::ConfigMember => "config-member",
            Role::Router => "router",
        }
    }

    /// Roles whose members hold a copy of the data.
    pub fn holds_data(&self) -> bool {
        !matches!(self, Role::Arbiter | Role::Router)
    }

    /// Roles that are installed into a replica set with `msinstall`.
    pub fn is_replicated(&self) -> bool {
        matches!(
            self,
            Role::Primary
                | Role::Replica
                | Role::Arbiter
                | Role::ShardMember
                | Role::ConfigMember
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
