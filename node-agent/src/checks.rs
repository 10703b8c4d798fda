// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Preconditions for an install.
//!
//! These run before every install and are all that `--only-check` does. None
//! of them change anything on the host.

use crate::args::InstallArgs;
use crate::engine::EngineKind;
use crate::engine::Role;
use crate::package::PackageManifest;
use crate::workspace;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use std::fmt;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;

/// Tools every install needs on `PATH`.
const BASE_TOOLS: &[&str] = &["systemctl"];

/// Tools Galera's rsync state transfer needs on joining members.
const GALERA_SST_TOOLS: &[&str] = &["rsync", "socat"];

const DEFAULT_LIB_DIRS: &[&str] = &[
    "/lib",
    "/lib64",
    "/usr/lib",
    "/usr/lib64",
    "/lib/x86_64-linux-gnu",
    "/usr/lib/x86_64-linux-gnu",
    "/lib/aarch64-linux-gnu",
    "/usr/lib/aarch64-linux-gnu",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Check {
    Arguments,
    Port,
    DataDir,
    InstanceDir,
    ServiceDir,
    Unit,
    Library,
    Tool,
    Package,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Check::Arguments => "arguments",
            Check::Port => "port",
            Check::DataDir => "data directory",
            Check::InstanceDir => "instance directory",
            Check::ServiceDir => "service directory",
            Check::Unit => "service unit",
            Check::Library => "shared library",
            Check::Tool => "required tool",
            Check::Package => "package",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckFailure {
    pub check: Check,
    pub detail: String,
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.check, self.detail)
    }
}

/// Where the checks look for libraries and tools.
#[derive(Clone, Debug)]
pub struct CheckEnvironment {
    pub lib_dirs: Vec<Utf8PathBuf>,
    pub path_dirs: Vec<Utf8PathBuf>,
}

impl CheckEnvironment {
    pub fn from_host() -> Self {
        let path_dirs = std::env::var("PATH")
            .unwrap_or_default()
            .split(':')
            .filter(|p| !p.is_empty())
            .map(Utf8PathBuf::from)
            .collect();
        CheckEnvironment {
            lib_dirs: DEFAULT_LIB_DIRS.iter().map(Utf8PathBuf::from).collect(),
            path_dirs,
        }
    }

    fn has_tool(&self, tool: &str) -> bool {
        self.path_dirs.iter().any(|dir| dir.join(tool).is_file())
    }

    fn has_library(&self, prefix: &str) -> bool {
        self.lib_dirs.iter().any(|dir| {
            let Ok(entries) = dir.read_dir_utf8() else {
                return false;
            };
            entries
                .filter_map(Result::ok)
                .any(|entry| entry.file_name().starts_with(prefix))
        })
    }
}

/// Runs every precondition, returning all failures rather than stopping at
/// the first.
pub async fn run_checks(
    engine: EngineKind,
    args: &InstallArgs,
    env: &CheckEnvironment,
) -> Vec<CheckFailure> {
    let mut failures = Vec::new();
    let mut fail = |check, detail: String| {
        failures.push(CheckFailure { check, detail })
    };

    for problem in argument_problems(engine, args) {
        fail(Check::Arguments, problem);
    }

    if let Err(detail) = port_available(args.port, args.ipv6).await {
        fail(Check::Port, detail);
    }

    if let Err(detail) = absent_or_empty(&args.data_dir).await {
        fail(Check::DataDir, detail);
    }
    let instance_dir = engine.instance_dir(&args.layout.install_base, args.port);
    if instance_dir.exists() {
        fail(
            Check::InstanceDir,
            format!("{instance_dir} already exists; is another instance installed?"),
        );
    }

    let service_dir = &args.layout.service_dir;
    if !service_dir.is_dir() {
        fail(Check::ServiceDir, format!("{service_dir} is not a directory"));
    } else {
        let unit = service_dir.join(engine.unit_name(args.port));
        if unit.exists() {
            fail(Check::Unit, format!("{unit} already exists"));
        }
    }

    if args.role != Role::Router || engine != EngineKind::Mongodb {
        for lib in engine.required_libraries() {
            if !env.has_library(lib) {
                fail(Check::Library, format!("{lib} not found in any library directory"));
            }
        }
    }

    let mut tools = BASE_TOOLS.to_vec();
    if engine == EngineKind::Mysql && args.role == Role::QuorumMember {
        tools.extend_from_slice(GALERA_SST_TOOLS);
    }
    for tool in tools {
        if !env.has_tool(tool) {
            fail(Check::Tool, format!("{tool} not found on PATH"));
        }
    }

    for detail in package_problems(args).await {
        fail(Check::Package, detail);
    }

    failures
}

fn argument_problems(engine: EngineKind, args: &InstallArgs) -> Vec<String> {
    let mut problems = Vec::new();
    if args.add_replica && args.peers.is_empty() {
        problems.push("--add-replica needs a --peer to join through".to_string());
    }
    if args.bootstrap && args.role != Role::QuorumMember {
        problems.push(format!("--bootstrap is only valid for role {}", Role::QuorumMember));
    }
    if args.role == Role::Arbiter && !engine.supports_arbiter() {
        problems.push(format!("{engine} has no arbiter role"));
    }
    if args.role == Role::Router {
        if engine != EngineKind::Mongodb {
            problems.push(format!("{engine} has no router role"));
        }
        if args.peers.is_empty() || args.replica_set.is_none() {
            problems.push(
                "a router needs --replica-set and --peer for the config servers"
                    .to_string(),
            );
        }
    }
    if args.role == Role::Replica
        && engine != EngineKind::Mongodb
        && args.peers.is_empty()
    {
        problems.push("a replica needs a --peer to follow".to_string());
    }
    if engine == EngineKind::Mongodb
        && args.role.is_replicated()
        && args.replica_set.is_none()
    {
        problems.push("replica set members need --replica-set".to_string());
    }
    if !args.data_dir.is_absolute() {
        problems.push(format!("--data-dir {} is not absolute", args.data_dir));
    }
    problems
}

async fn port_available(port: u16, ipv6: bool) -> Result<(), String> {
    let mut addrs = vec![SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))];
    if ipv6 {
        addrs.push(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)));
    }
    for addr in addrs {
        // The listener is dropped straight away; only whether the bind
        // succeeds matters.
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|err| format!("cannot bind {addr}: {err}"))?;
    }
    Ok(())
}

async fn absent_or_empty(path: &Utf8Path) -> Result<(), String> {
    match fs_err::tokio::metadata(path).await {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.to_string()),
        Ok(meta) if !meta.is_dir() => {
            Err(format!("{path} exists and is not a directory"))
        }
        Ok(_) => {
            let mut entries = fs_err::tokio::read_dir(path)
                .await
                .map_err(|err| err.to_string())?;
            match entries.next_entry().await {
                Ok(None) => Ok(()),
                Ok(Some(_)) => Err(format!("{path} is not empty")),
                Err(err) => Err(err.to_string()),
            }
        }
    }
}

async fn package_problems(args: &InstallArgs) -> Vec<String> {
    let mut problems = Vec::new();
    let template = args.workspace.join(workspace::UNIT_TEMPLATE);
    if !template.is_file() {
        problems.push(format!("unit template {template} is missing"));
    }
    let manifest_path = args.workspace.join(workspace::MANIFEST);
    match PackageManifest::load(&manifest_path).await {
        Ok(manifest) => {
            if let Err(err) = manifest.verify(&args.package_path()).await {
                problems.push(err.to_string());
            }
        }
        Err(err) => problems.push(err.to_string()),
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::HostLayout;
    use crate::package::sha256_file;
    use camino_tempfile::Utf8TempDir;

    struct Fixture {
        _dir: Utf8TempDir,
        args: InstallArgs,
        env: CheckEnvironment,
    }

    /// Lays out a host where every check passes for a MySQL quorum member.
    async fn fixture() -> Fixture {
        let dir = Utf8TempDir::new().unwrap();
        let root = dir.path();

        let ws = root.join("ws");
        fs_err::create_dir_all(&ws).unwrap();
        let package = "mysql-8.0.36-linux-x86_64.tar.gz";
        fs_err::write(ws.join(package), b"not really a tarball").unwrap();
        let digest = sha256_file(&ws.join(package)).await.unwrap();
        fs_err::write(
            ws.join(workspace::MANIFEST),
            format!("[packages]\n\"{package}\" = \"{digest}\"\n"),
        )
        .unwrap();
        fs_err::write(
            ws.join(workspace::UNIT_TEMPLATE),
            "ExecStart={{exec_start}}\n",
        )
        .unwrap();

        let lib_dir = root.join("lib");
        fs_err::create_dir_all(&lib_dir).unwrap();
        fs_err::write(lib_dir.join("libaio.so.1"), b"").unwrap();
        fs_err::write(lib_dir.join("libnuma.so.1"), b"").unwrap();

        let bin_dir = root.join("bin");
        fs_err::create_dir_all(&bin_dir).unwrap();
        for tool in ["systemctl", "rsync", "socat"] {
            fs_err::write(bin_dir.join(tool), b"").unwrap();
        }

        let service_dir = root.join("systemd");
        fs_err::create_dir_all(&service_dir).unwrap();

        // Grab a port nobody is using right now.
        let port = std::net::TcpListener::bind("0.0.0.0:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let args = InstallArgs {
            version: "8.0.36".to_string(),
            port,
            data_dir: root.join("data"),
            user: "admin".to_string(),
            password: "pw".to_string(),
            repl_user: None,
            repl_password: None,
            role: Role::QuorumMember,
            peers: vec!["10.0.0.2:3306".to_string()],
            replica_set: None,
            bootstrap: true,
            memory_mb: None,
            resource_limit: None,
            only_check: true,
            add_replica: false,
            no_rollback: false,
            ipv6: false,
            workspace: ws,
            package: package.to_string(),
            advertise: "10.0.0.1".to_string(),
            layout: HostLayout {
                install_base: root.join("opt"),
                service_dir,
                os_user: "dbfleet".to_string(),
            },
        };
        let env = CheckEnvironment { lib_dirs: vec![lib_dir], path_dirs: vec![bin_dir] };
        Fixture { _dir: dir, args, env }
    }

    #[tokio::test]
    async fn clean_host_passes() {
        let f = fixture().await;
        let failures = run_checks(EngineKind::Mysql, &f.args, &f.env).await;
        assert_eq!(failures, vec![]);
    }

    #[tokio::test]
    async fn reports_every_problem_at_once() {
        let mut f = fixture().await;
        fs_err::create_dir_all(&f.args.data_dir).unwrap();
        fs_err::write(f.args.data_dir.join("ibdata1"), b"").unwrap();
        fs_err::remove_file(f.env.path_dirs[0].join("socat")).unwrap();
        fs_err::remove_file(f.env.lib_dirs[0].join("libnuma.so.1")).unwrap();
        fs_err::write(f.args.package_path(), b"tampered").unwrap();
        let _listener =
            std::net::TcpListener::bind(("0.0.0.0", f.args.port)).unwrap();
        f.args.role = Role::Replica;
        f.args.peers.clear();

        let failures = run_checks(EngineKind::Mysql, &f.args, &f.env).await;
        let checks: Vec<Check> = failures.iter().map(|f| f.check).collect();
        assert!(checks.contains(&Check::Arguments), "{failures:?}");
        assert!(checks.contains(&Check::Port), "{failures:?}");
        assert!(checks.contains(&Check::DataDir), "{failures:?}");
        assert!(checks.contains(&Check::Library), "{failures:?}");
        assert!(checks.contains(&Check::Package), "{failures:?}");
        // Replicas don't need the Galera transfer tools.
        assert!(!checks.contains(&Check::Tool), "{failures:?}");
    }

    #[tokio::test]
    async fn galera_members_need_sst_tools() {
        let f = fixture().await;
        fs_err::remove_file(f.env.path_dirs[0].join("socat")).unwrap();
        let failures = run_checks(EngineKind::Mysql, &f.args, &f.env).await;
        assert_eq!(
            failures,
            vec![CheckFailure {
                check: Check::Tool,
                detail: "socat not found on PATH".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn existing_unit_is_a_conflict() {
        let f = fixture().await;
        let unit = f
            .args
            .layout
            .service_dir
            .join(EngineKind::Mysql.unit_name(f.args.port));
        fs_err::write(&unit, b"").unwrap();
        let failures = run_checks(EngineKind::Mysql, &f.args, &f.env).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].check, Check::Unit);
    }
}
