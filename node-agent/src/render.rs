// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Engine configuration files and service units.
//!
//! These are pure functions of the install arguments; the installer writes
//! their output to disk.

use crate::args::split_host_port;
use crate::args::InstallArgs;
use crate::engine::EngineKind;
use crate::engine::Role;
use crate::engine::GALERA_BOOTSTRAP_FLAG;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use itertools::Itertools;
use std::fmt::Write;

/// A file the installer must write, and its contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedFile {
    pub path: Utf8PathBuf,
    pub contents: String,
}

/// Path of the main configuration file for an instance.
pub fn config_path(engine: EngineKind, role: Role, instance_dir: &Utf8Path) -> Utf8PathBuf {
    let name = match (engine, role) {
        (EngineKind::Mysql, _) => "my.cnf",
        (EngineKind::Postgres, _) => "postgresql.conf",
        (EngineKind::Mongodb, Role::Router) => "mongos.conf",
        (EngineKind::Mongodb, _) => "mongod.conf",
        (EngineKind::Redis, _) => "redis.conf",
    };
    instance_dir.join(name)
}

/// Every configuration file the instance needs.
pub fn config_files(
    engine: EngineKind,
    args: &InstallArgs,
    instance_dir: &Utf8Path,
) -> Vec<RenderedFile> {
    let path = config_path(engine, args.role, instance_dir);
    match engine {
        EngineKind::Mysql => {
            vec![RenderedFile { path, contents: mysql_config(args, instance_dir) }]
        }
        EngineKind::Postgres => vec![
            RenderedFile { path, contents: postgres_config(args, instance_dir) },
            RenderedFile {
                path: instance_dir.join("pg_hba.conf"),
                contents: postgres_hba(args),
            },
        ],
        EngineKind::Mongodb => {
            vec![RenderedFile { path, contents: mongodb_config(args, instance_dir) }]
        }
        EngineKind::Redis => {
            vec![RenderedFile { path, contents: redis_config(args) }]
        }
    }
}

/// The command systemd runs to start the instance.
pub fn exec_start(
    engine: EngineKind,
    args: &InstallArgs,
    instance_dir: &Utf8Path,
) -> String {
    let bin = instance_dir.join("bin");
    let config = config_path(engine, args.role, instance_dir);
    match engine {
        EngineKind::Mysql => {
            let mut cmd =
                format!("{}/mysqld --defaults-file={config}", bin);
            if args.bootstrap {
                cmd.push(' ');
                cmd.push_str(GALERA_BOOTSTRAP_FLAG);
            }
            cmd
        }
        EngineKind::Postgres => format!(
            "{bin}/postgres -D {} -c config_file={config}",
            args.data_dir
        ),
        EngineKind::Mongodb if args.role == Role::Router => {
            format!("{bin}/mongos --config {config}")
        }
        EngineKind::Mongodb => format!("{bin}/mongod --config {config}"),
        EngineKind::Redis => format!("{bin}/redis-server {config}"),
    }
}

fn bind_address(args: &InstallArgs) -> &'static str {
    if args.ipv6 {
        "::"
    } else {
        "0.0.0.0"
    }
}

/// A stable, non-zero MySQL server id for this member.
pub fn server_id(advertise: &str, port: u16) -> u32 {
    // FNV-1a over the member address.
    let mut hash: u32 = 0x811c9dc5;
    for byte in advertise.bytes().chain(port.to_be_bytes()) {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x01000193);
    }
    (hash % (u32::MAX - 1)) + 1
}

fn mysql_config(args: &InstallArgs, instance_dir: &Utf8Path) -> String {
    let mut out = String::from("[mysqld]\n");
    let mut set = |key: &str, value: &dyn std::fmt::Display| {
        let _ = writeln!(out, "{key} = {value}");
    };
    set("datadir", &args.data_dir);
    set("port", &args.port);
    set("bind-address", &bind_address(args));
    set("socket", &instance_dir.join("mysql.sock"));
    set("pid-file", &instance_dir.join("mysqld.pid"));
    set("log-error", &instance_dir.join("mysqld.err"));
    set("server-id", &server_id(&args.advertise, args.port));
    set("report-host", &args.advertise);
    set("log-bin", &"binlog");
    set("gtid_mode", &"ON");
    set("enforce_gtid_consistency", &"ON");
    set("log_replica_updates", &"ON");
    if let Some(memory_mb) = args.memory_mb {
        set("innodb_buffer_pool_size", &format!("{}M", memory_mb * 3 / 4));
    }
    match args.role {
        Role::Replica => {
            set("read_only", &"ON");
            set("super_read_only", &"ON");
        }
        Role::QuorumMember => {
            let peers = args
                .peers
                .iter()
                .filter_map(|p| split_host_port(p).map(|(host, _)| host))
                .join(",");
            set("wsrep_on", &"ON");
            set("wsrep_provider", &instance_dir.join("lib/libgalera_smm.so"));
            set(
                "wsrep_cluster_name",
                &args.replica_set.as_deref().unwrap_or("dbfleet"),
            );
            set("wsrep_cluster_address", &format!("gcomm://{peers}"));
            set("wsrep_node_address", &args.advertise);
            set("wsrep_sst_method", &"rsync");
            set("binlog_format", &"ROW");
            set("default_storage_engine", &"InnoDB");
            set("innodb_autoinc_lock_mode", &"2");
        }
        _ => {}
    }
    out
}

fn postgres_config(args: &InstallArgs, instance_dir: &Utf8Path) -> String {
    let mut lines = vec![
        "listen_addresses = '*'".to_string(),
        format!("port = {}", args.port),
        format!("hba_file = '{}'", instance_dir.join("pg_hba.conf")),
        format!("unix_socket_directories = '{instance_dir}'"),
        "wal_level = replica".to_string(),
        "max_wal_senders = 10".to_string(),
        "max_replication_slots = 10".to_string(),
        "hot_standby = on".to_string(),
        "password_encryption = 'scram-sha-256'".to_string(),
    ];
    if let Some(memory_mb) = args.memory_mb {
        lines.push(format!("shared_buffers = {}MB", memory_mb / 4));
        lines.push(format!("effective_cache_size = {}MB", memory_mb * 3 / 4));
    }
    lines.join("\n") + "\n"
}

fn postgres_hba(args: &InstallArgs) -> String {
    let mut lines = vec!["local all all peer".to_string()];
    let mut nets = vec!["0.0.0.0/0"];
    if args.ipv6 {
        nets.push("::/0");
    }
    for net in nets {
        lines.push(format!("host all all {net} scram-sha-256"));
        lines.push(format!(
            "host replication {} {net} scram-sha-256",
            args.repl_user()
        ));
    }
    lines.join("\n") + "\n"
}

fn mongodb_config(args: &InstallArgs, instance_dir: &Utf8Path) -> String {
    let log_name =
        if args.role == Role::Router { "mongos.log" } else { "mongod.log" };
    let bind_ip = if args.ipv6 { "::,0.0.0.0" } else { "0.0.0.0" };
    let mut out = format!(
        "systemLog:\n  destination: file\n  path: {}\n  logAppend: true\n\
         net:\n  port: {}\n  bindIp: \"{bind_ip}\"\n  ipv6: {}\n",
        instance_dir.join(log_name),
        args.port,
        args.ipv6,
    );
    if args.role == Role::Router {
        let config_set = args.replica_set.as_deref().unwrap_or("cfg");
        let _ = write!(
            out,
            "sharding:\n  configDB: \"{config_set}/{}\"\n",
            args.peers.join(",")
        );
        return out;
    }

    let _ = write!(out, "storage:\n  dbPath: {}\n", args.data_dir);
    if let Some(memory_mb) = args.memory_mb {
        let cache_gb = (memory_mb as f64 / 2048.0).max(0.25);
        let _ = write!(
            out,
            "  wiredTiger:\n    engineConfig:\n      cacheSizeGB: {cache_gb:.2}\n"
        );
    }
    if let Some(name) = &args.replica_set {
        let _ = write!(out, "replication:\n  replSetName: {name}\n");
    }
    match args.role {
        Role::ShardMember => out.push_str("sharding:\n  clusterRole: shardsvr\n"),
        Role::ConfigMember => {
            out.push_str("sharding:\n  clusterRole: configsvr\n")
        }
        _ => {}
    }
    out
}

fn redis_config(args: &InstallArgs) -> String {
    let mut lines = vec![
        format!("port {}", args.port),
        if args.ipv6 { "bind 0.0.0.0 ::".to_string() } else { "bind 0.0.0.0".to_string() },
        format!("dir {}", args.data_dir),
        "daemonize no".to_string(),
        "supervised systemd".to_string(),
        "appendonly yes".to_string(),
        format!("requirepass {}", args.password),
        format!("masterauth {}", args.password),
    ];
    if let Some(memory_mb) = args.memory_mb {
        lines.push(format!("maxmemory {memory_mb}mb"));
    }
    if args.role == Role::Replica {
        if let Some((host, port)) =
            args.peers.first().and_then(|p| split_host_port(p))
        {
            lines.push(format!("replicaof {host} {port}"));
        }
    }
    lines.join("\n") + "\n"
}

/// Values substituted into the service unit template.
#[derive(Clone, Debug)]
pub struct UnitParams {
    pub description: String,
    pub exec_start: String,
    pub user: String,
    pub working_directory: Utf8PathBuf,
    pub limits: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("unit template has no {{{{exec_start}}}} placeholder")]
    MissingExecStart,
    #[error("unit template uses unknown placeholder {0}")]
    UnknownPlaceholder(String),
}

/// Fills in a unit template.
///
/// Recognized placeholders are `{{description}}`, `{{exec_start}}`,
/// `{{user}}`, `{{working_directory}}` and `{{limits}}` (one directive per
/// line).
pub fn render_unit(
    template: &str,
    params: &UnitParams,
) -> Result<String, RenderError> {
    if !template.contains("{{exec_start}}") {
        return Err(RenderError::MissingExecStart);
    }
    let rendered = template
        .replace("{{description}}", &params.description)
        .replace("{{exec_start}}", &params.exec_start)
        .replace("{{user}}", &params.user)
        .replace("{{working_directory}}", params.working_directory.as_str())
        .replace("{{limits}}", &params.limits.join("\n"));
    if let Some(start) = rendered.find("{{") {
        let end = rendered[start..]
            .find("}}")
            .map(|i| start + i + 2)
            .unwrap_or(rendered.len());
        return Err(RenderError::UnknownPlaceholder(
            rendered[start..end].to_string(),
        ));
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::HostLayout;

    const TEMPLATE: &str = "\
[Unit]
Description={{description}}
After=network-online.target

[Service]
User={{user}}
WorkingDirectory={{working_directory}}
ExecStart={{exec_start}}
{{limits}}
Restart=on-failure

[Install]
WantedBy=multi-user.target
";

    fn args(role: Role) -> InstallArgs {
        InstallArgs {
            version: "8.0.36".to_string(),
            port: 3306,
            data_dir: "/data/mysql".into(),
            user: "admin".to_string(),
            password: "pw".to_string(),
            repl_user: None,
            repl_password: None,
            role,
            peers: vec!["10.0.0.2:3306".to_string(), "10.0.0.3:3306".to_string()],
            replica_set: Some("galera1".to_string()),
            bootstrap: false,
            memory_mb: Some(4096),
            resource_limit: None,
            only_check: false,
            add_replica: false,
            no_rollback: false,
            ipv6: false,
            workspace: "/tmp/dbfleet".into(),
            package: "mysql-8.0.36-linux-x86_64.tar.gz".to_string(),
            advertise: "10.0.0.1".to_string(),
            layout: HostLayout::default(),
        }
    }

    #[test]
    fn galera_bootstrap_flag_only_on_bootstrap_node() {
        let dir = Utf8Path::new("/opt/dbfleet/mysql-3306");
        let mut a = args(Role::QuorumMember);
        assert!(!exec_start(EngineKind::Mysql, &a, dir)
            .contains(GALERA_BOOTSTRAP_FLAG));
        a.bootstrap = true;
        assert_eq!(
            exec_start(EngineKind::Mysql, &a, dir),
            "/opt/dbfleet/mysql-3306/bin/mysqld \
             --defaults-file=/opt/dbfleet/mysql-3306/my.cnf --wsrep-new-cluster"
        );

        let config = mysql_config(&a, dir);
        assert!(config.contains("wsrep_cluster_address = gcomm://10.0.0.2,10.0.0.3"));
        assert!(config.contains("innodb_buffer_pool_size = 3072M"));
    }

    #[test]
    fn replicas_are_read_only() {
        let dir = Utf8Path::new("/opt/dbfleet/mysql-3306");
        assert!(mysql_config(&args(Role::Replica), dir).contains("read_only = ON"));
        assert!(!mysql_config(&args(Role::Primary), dir).contains("read_only"));
    }

    #[test]
    fn mongodb_router_points_at_config_set() {
        let mut a = args(Role::Router);
        a.replica_set = Some("cfg".to_string());
        a.peers = vec!["c1:27019".to_string(), "c2:27019".to_string()];
        let dir = Utf8Path::new("/opt/dbfleet/mongodb-27017");
        let files = config_files(EngineKind::Mongodb, &a, dir);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, dir.join("mongos.conf"));
        assert!(files[0].contents.contains("configDB: \"cfg/c1:27019,c2:27019\""));
        assert!(!files[0].contents.contains("dbPath"));
    }

    #[test]
    fn redis_replica_follows_first_peer() {
        let a = args(Role::Replica);
        let config = redis_config(&a);
        assert!(config.contains("replicaof 10.0.0.2 3306"));
        assert!(config.contains("maxmemory 4096mb"));
    }

    #[test]
    fn unit_rendering() {
        let params = UnitParams {
            description: "dbfleet mysql on port 3306".to_string(),
            exec_start: "/opt/x/bin/mysqld".to_string(),
            user: "dbfleet".to_string(),
            working_directory: "/opt/x".into(),
            limits: vec!["MemoryMax=2048M".to_string()],
        };
        let unit = render_unit(TEMPLATE, &params).unwrap();
        assert!(unit.contains("ExecStart=/opt/x/bin/mysqld\n"));
        assert!(unit.contains("MemoryMax=2048M\n"));
        assert!(!unit.contains("{{"));

        assert_eq!(
            render_unit("[Service]\n", &params),
            Err(RenderError::MissingExecStart)
        );
        assert_eq!(
            render_unit("ExecStart={{exec_start}} {{bogus}}", &params),
            Err(RenderError::UnknownPlaceholder("{{bogus}}".to_string()))
        );
    }

    #[test]
    fn server_ids_are_stable_and_nonzero() {
        let a = server_id("10.0.0.1", 3306);
        assert_eq!(a, server_id("10.0.0.1", 3306));
        assert_ne!(a, server_id("10.0.0.2", 3306));
        assert_ne!(a, 0);
    }
}
