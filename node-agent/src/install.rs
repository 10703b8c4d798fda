// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Install and uninstall sequences for one local instance.

use crate::args::split_host_port;
use crate::args::AgentAction;
use crate::args::AgentCommand;
use crate::args::AgentVerb;
use crate::args::InstallArgs;
use crate::args::UninstallArgs;
use crate::checks::run_checks;
use crate::checks::CheckEnvironment;
use crate::checks::CheckFailure;
use crate::engine::EngineKind;
use crate::engine::Role;
use crate::executor::BoxedExecutor;
use crate::executor::ExecutionError;
use crate::executor::Invocation;
use crate::package::unpack;
use crate::package::PackageError;
use crate::render;
use crate::render::RenderError;
use crate::render::UnitParams;
use crate::workspace;
use backoff::future::retry_notify;
use backoff::ExponentialBackoff;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use itertools::Itertools;
use serde_json::json;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("environment check failed: {}", .0.iter().join("; "))]
    Checks(Vec<CheckFailure>),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("failed to write {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("{what} did not become ready: {reason}")]
    NotReady { what: String, reason: String },

    #[error("role {role} needs a usable --peer address")]
    MissingPeer { role: Role },

    #[error("uninstall incomplete: {}", .0.join("; "))]
    Uninstall(Vec<String>),
}

fn io_err(path: &Utf8Path) -> impl FnOnce(std::io::Error) -> AgentError + '_ {
    move |err| AgentError::Io { path: path.to_owned(), err }
}

/// Performs agent actions on the local host.
pub struct Agent {
    log: Logger,
    executor: BoxedExecutor,
    env: CheckEnvironment,
    ready_timeout: Duration,
}

impl Agent {
    pub fn new(
        log: &Logger,
        executor: BoxedExecutor,
        env: CheckEnvironment,
    ) -> Self {
        Agent {
            log: log.new(o!("component" => "Agent")),
            executor,
            env,
            ready_timeout: Duration::from_secs(300),
        }
    }

    /// How long to wait for a started service to answer.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub async fn run(&self, command: &AgentCommand) -> Result<(), AgentError> {
        let engine = command.engine();
        let verb = command.action().verb();
        let log = self.log.new(o!(
            "engine" => engine.as_str(),
            "action" => verb.as_str(),
        ));
        match command.action() {
            AgentAction::Install(args) | AgentAction::Msinstall(args) => {
                self.install(&log, engine, args).await
            }
            AgentAction::Uninstall(args) | AgentAction::Unmsinstall(args) => {
                self.uninstall(&log, engine, verb, args).await
            }
        }
    }

    async fn install(
        &self,
        log: &Logger,
        engine: EngineKind,
        args: &InstallArgs,
    ) -> Result<(), AgentError> {
        let failures = run_checks(engine, args, &self.env).await;
        if !failures.is_empty() {
            for failure in &failures {
                warn!(
                    log,
                    "check failed";
                    "check" => %failure.check,
                    "detail" => &failure.detail,
                );
            }
            return Err(AgentError::Checks(failures));
        }
        if args.only_check {
            info!(log, "all checks passed"; "port" => args.port);
            return Ok(());
        }

        match self.install_steps(log, engine, args).await {
            Ok(()) => {
                info!(
                    log,
                    "install complete";
                    "port" => args.port,
                    "role" => %args.role,
                );
                Ok(())
            }
            Err(err) if args.no_rollback => {
                warn!(
                    log,
                    "install failed; leaving it in place";
                    "error" => %err,
                );
                Err(err)
            }
            Err(err) => {
                warn!(log, "install failed; removing it"; "error" => %err);
                // The node never joined anything, so there is no peer to
                // tell about its removal.
                let mut undo = args.uninstall_args();
                undo.peers.clear();
                if let Err(undo_err) =
                    self.uninstall_local(log, engine, &undo).await
                {
                    warn!(
                        log,
                        "local rollback incomplete";
                        "error" => %undo_err,
                    );
                }
                Err(err)
            }
        }
    }

    async fn install_steps(
        &self,
        log: &Logger,
        engine: EngineKind,
        args: &InstallArgs,
    ) -> Result<(), AgentError> {
        let layout = &args.layout;
        let instance_dir = engine.instance_dir(&layout.install_base, args.port);

        self.ensure_os_user(&layout.os_user).await?;

        info!(
            log,
            "unpacking";
            "package" => &args.package,
            "dest" => %instance_dir,
        );
        unpack(&args.package_path(), &instance_dir)?;

        fs_err::tokio::create_dir_all(&args.data_dir)
            .await
            .map_err(io_err(&args.data_dir))?;
        let owner = format!("{0}:{0}", layout.os_user);
        for dir in [&instance_dir, &args.data_dir] {
            let chown = Invocation::new("chown")
                .args(["-R", owner.as_str(), dir.as_str()]);
            self.executor.execute(&chown).await?;
        }
        if engine == EngineKind::Postgres {
            let chmod =
                Invocation::new("chmod").args(["0700", args.data_dir.as_str()]);
            self.executor.execute(&chmod).await?;
        }

        for file in render::config_files(engine, args, &instance_dir) {
            fs_err::tokio::write(&file.path, file.contents)
                .await
                .map_err(io_err(&file.path))?;
        }

        self.initialize(log, engine, args, &instance_dir).await?;

        let unit_name = engine.unit_name(args.port);
        let unit_path = layout.service_dir.join(&unit_name);
        let template_path = args.workspace.join(workspace::UNIT_TEMPLATE);
        let template = fs_err::tokio::read_to_string(&template_path)
            .await
            .map_err(io_err(&template_path))?;
        let unit = render::render_unit(
            &template,
            &UnitParams {
                description: format!(
                    "dbfleet {engine} {} on port {}",
                    args.role, args.port
                ),
                exec_start: render::exec_start(engine, args, &instance_dir),
                user: layout.os_user.clone(),
                working_directory: instance_dir.clone(),
                limits: args
                    .resource_limit
                    .map(|l| l.unit_directives())
                    .unwrap_or_default(),
            },
        )?;
        fs_err::tokio::write(&unit_path, unit)
            .await
            .map_err(io_err(&unit_path))?;

        info!(log, "starting service"; "unit" => &unit_name);
        self.systemctl(&["daemon-reload"]).await?;
        self.systemctl(&["enable", "--now", &unit_name]).await?;
        self.wait_for_port(log, args.port).await?;

        self.post_start(log, engine, args, &instance_dir).await
    }

    async fn ensure_os_user(&self, user: &str) -> Result<(), AgentError> {
        let id = Invocation::new("id").args(["-u", user]);
        if self.executor.execute(&id).await.is_ok() {
            return Ok(());
        }
        self.executor
            .execute(&Invocation::new("useradd").args([
                "--system",
                "--no-create-home",
                "--shell",
                "/usr/sbin/nologin",
                user,
            ]))
            .await?;
        Ok(())
    }

    async fn systemctl(&self, args: &[&str]) -> Result<(), AgentError> {
        self.executor
            .execute(&Invocation::new("systemctl").args(args.iter().copied()))
            .await?;
        Ok(())
    }

    /// Creates the initial data directory contents.
    async fn initialize(
        &self,
        log: &Logger,
        engine: EngineKind,
        args: &InstallArgs,
        instance_dir: &Utf8Path,
    ) -> Result<(), AgentError> {
        let bin = instance_dir.join("bin");
        let os_user = &args.layout.os_user;
        match (engine, args.role) {
            (EngineKind::Mysql, _) => {
                let config =
                    render::config_path(engine, args.role, instance_dir);
                info!(log, "initializing data directory");
                let mysqld = Invocation::new(bin.join("mysqld").as_str()).args([
                    format!("--defaults-file={config}"),
                    "--initialize-insecure".to_string(),
                    format!("--user={os_user}"),
                ]);
                self.executor.execute(&mysqld).await?;
            }
            (EngineKind::Postgres, Role::Replica) => {
                let (host, port) = first_peer(args)?;
                info!(
                    log,
                    "cloning primary";
                    "primary" => host,
                    "port" => port,
                );
                let port = port.to_string();
                self.executor
                    .execute(
                        &Invocation::new("runuser")
                            .args(["-u", os_user.as_str(), "--"])
                            .arg(bin.join("pg_basebackup").as_str())
                            .args(["-h", host, "-p", port.as_str()])
                            .args(["-U", args.repl_user()])
                            .args(["-D", args.data_dir.as_str()])
                            .args(["-R", "-X", "stream"])
                            .env("PGPASSWORD", args.repl_password()),
                    )
                    .await?;
            }
            (EngineKind::Postgres, _) => {
                let pwfile = instance_dir.join(".pwfile");
                fs_err::tokio::write(&pwfile, format!("{}\n", args.password))
                    .await
                    .map_err(io_err(&pwfile))?;
                let chown = Invocation::new("chown")
                    .args([os_user.as_str(), pwfile.as_str()]);
                self.executor.execute(&chown).await?;
                info!(log, "initializing data directory");
                let result = self
                    .executor
                    .execute(
                        &Invocation::new("runuser")
                            .args(["-u", os_user.as_str(), "--"])
                            .arg(bin.join("initdb").as_str())
                            .args(["-D", args.data_dir.as_str()])
                            .args(["-U", args.user.as_str()])
                            .arg(format!("--pwfile={pwfile}"))
                            .arg("--auth-host=scram-sha-256")
                            .arg("--auth-local=peer"),
                    )
                    .await;
                if let Err(err) = fs_err::tokio::remove_file(&pwfile).await {
                    warn!(
                        log,
                        "failed to remove password file";
                        "path" => %pwfile,
                        "error" => %err,
                    );
                }
                result?;
            }
            (EngineKind::Mongodb, _) | (EngineKind::Redis, _) => {}
        }
        Ok(())
    }

    async fn wait_for_port(
        &self,
        log: &Logger,
        port: u16,
    ) -> Result<(), AgentError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            current_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(self.ready_timeout),
            ..ExponentialBackoff::default()
        };
        retry_notify(
            policy,
            || async move {
                tokio::net::TcpStream::connect(addr)
                    .await
                    .map(|_| ())
                    .map_err(backoff::Error::transient)
            },
            |err, delay: Duration| {
                info!(
                    log,
                    "service not listening yet";
                    "port" => port,
                    "error" => %err,
                    "retry_after" => ?delay,
                );
            },
        )
        .await
        .map_err(|err| AgentError::NotReady {
            what: format!("service on port {port}"),
            reason: err.to_string(),
        })
    }

    /// Replication and account setup once the service is up.
    async fn post_start(
        &self,
        log: &Logger,
        engine: EngineKind,
        args: &InstallArgs,
        instance_dir: &Utf8Path,
    ) -> Result<(), AgentError> {
        let bin = instance_dir.join("bin");
        match engine {
            EngineKind::Mysql => {
                let socket = instance_dir.join("mysql.sock");
                let mysql = |sql: String| {
                    Invocation::new(bin.join("mysql").as_str())
                        .arg(format!("--socket={socket}"))
                        .args(["-uroot", "-e"])
                        .arg(sql)
                };
                let creates_accounts = match args.role {
                    Role::QuorumMember => args.bootstrap,
                    _ => !args.add_replica,
                };
                if args.role == Role::Replica {
                    let (host, port) = first_peer(args)?;
                    info!(log, "starting replication"; "source" => host);
                    self.executor
                        .execute(&mysql(mysql_follow_sql(
                            host,
                            port,
                            args.repl_user(),
                            args.repl_password(),
                        )))
                        .await?;
                } else if creates_accounts {
                    info!(log, "creating accounts");
                    self.executor
                        .execute(&mysql(mysql_accounts_sql(args)))
                        .await?;
                }
            }
            EngineKind::Postgres => {
                if args.role != Role::Replica && args.repl_user() != args.user {
                    let port = args.port.to_string();
                    let sql = format!(
                        "CREATE ROLE \"{}\" \
                         WITH REPLICATION LOGIN PASSWORD '{}'",
                        args.repl_user().replace('"', "\"\""),
                        sql_escape(args.repl_password()),
                    );
                    self.executor
                        .execute(
                            &Invocation::new(bin.join("psql").as_str())
                                .args(["-h", "127.0.0.1", "-p", port.as_str()])
                                .args(["-U", args.user.as_str()])
                                .args(["-d", "postgres", "-c"])
                                .arg(sql)
                                .env("PGPASSWORD", &args.password),
                        )
                        .await?;
                }
            }
            EngineKind::Mongodb => {
                let mongosh = bin.join("mongosh");
                if args.role == Role::Router {
                    return Ok(());
                }
                if args.add_replica {
                    let (host, port) = first_peer(args)?;
                    let member = json!(args.member_address());
                    let js = if args.role == Role::Arbiter {
                        format!("rs.addArb({member})")
                    } else {
                        format!("rs.add({member})")
                    };
                    info!(log, "joining replica set"; "via" => host);
                    self.executor
                        .execute(&mongo_eval(&mongosh, host, port, &js))
                        .await?;
                    return Ok(());
                }
                let name = args.replica_set.as_deref().unwrap_or("rs0");
                let config = json!({
                    "_id": name,
                    "configsvr": args.role == Role::ConfigMember,
                    "members": [{ "_id": 0, "host": args.member_address() }],
                });
                info!(log, "initiating replica set"; "name" => name);
                self.executor
                    .execute(&mongo_eval(
                        &mongosh,
                        "127.0.0.1",
                        args.port,
                        &format!("rs.initiate({config})"),
                    ))
                    .await?;
                self.wait_writable_primary(log, &mongosh, args.port).await?;
                let user = json!({
                    "user": args.user,
                    "pwd": args.password,
                    "roles": [{ "role": "root", "db": "admin" }],
                });
                self.executor
                    .execute(&mongo_eval(
                        &mongosh,
                        "127.0.0.1",
                        args.port,
                        &format!(
                            "db.getSiblingDB(\"admin\").createUser({user})"
                        ),
                    ))
                    .await?;
            }
            EngineKind::Redis => {}
        }
        Ok(())
    }

    async fn wait_writable_primary(
        &self,
        log: &Logger,
        mongosh: &Utf8Path,
        port: u16,
    ) -> Result<(), AgentError> {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(self.ready_timeout),
            ..ExponentialBackoff::default()
        };
        let probe = mongo_eval(
            mongosh,
            "127.0.0.1",
            port,
            "db.hello().isWritablePrimary",
        );
        let executor = &self.executor;
        let probe = &probe;
        retry_notify(
            policy,
            || async move {
                let output = executor
                    .execute(probe)
                    .await
                    .map_err(|e| backoff::Error::transient(e.to_string()))?;
                if output.stdout.trim() == "true" {
                    Ok(())
                } else {
                    Err(backoff::Error::transient(format!(
                        "isWritablePrimary is {}",
                        output.stdout.trim()
                    )))
                }
            },
            |err, delay: Duration| {
                info!(
                    log,
                    "waiting to become primary";
                    "status" => %err,
                    "retry_after" => ?delay,
                );
            },
        )
        .await
        .map_err(|reason| AgentError::NotReady {
            what: "replica set primary".to_string(),
            reason,
        })
    }

    async fn uninstall(
        &self,
        log: &Logger,
        engine: EngineKind,
        verb: AgentVerb,
        args: &UninstallArgs,
    ) -> Result<(), AgentError> {
        if verb == AgentVerb::Unmsinstall && engine == EngineKind::Mongodb {
            let peer = args.peers.first().and_then(|p| split_host_port(p));
            if let Some((host, port)) = peer {
                let mongosh = engine
                    .instance_dir(&args.layout.install_base, args.port)
                    .join("bin")
                    .join("mongosh");
                let js = format!("rs.remove({})", json!(args.member_address()));
                let remove = mongo_eval(&mongosh, host, port, &js);
                if let Err(err) = self.executor.execute(&remove).await {
                    // It may never have been added.
                    warn!(
                        log,
                        "could not remove member from replica set";
                        "error" => %err,
                    );
                }
            }
        }
        self.uninstall_local(log, engine, args).await
    }

    /// Stops and removes everything an install created on this host. Every
    /// step is attempted even if an earlier one fails.
    async fn uninstall_local(
        &self,
        log: &Logger,
        engine: EngineKind,
        args: &UninstallArgs,
    ) -> Result<(), AgentError> {
        let mut failures = Vec::new();
        let unit_name = engine.unit_name(args.port);
        let unit_path = args.layout.service_dir.join(&unit_name);

        if unit_path.exists() {
            if let Err(err) =
                self.systemctl(&["disable", "--now", &unit_name]).await
            {
                failures.push(err.to_string());
            }
            if let Err(err) = fs_err::tokio::remove_file(&unit_path).await {
                failures.push(err.to_string());
            }
            if let Err(err) = self.systemctl(&["daemon-reload"]).await {
                failures.push(err.to_string());
            }
        }

        let instance_dir =
            engine.instance_dir(&args.layout.install_base, args.port);
        for dir in [&args.data_dir, &instance_dir] {
            match fs_err::tokio::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => failures.push(err.to_string()),
            }
        }

        if failures.is_empty() {
            info!(log, "uninstalled"; "unit" => &unit_name);
            Ok(())
        } else {
            Err(AgentError::Uninstall(failures))
        }
    }
}

fn first_peer(args: &InstallArgs) -> Result<(&str, u16), AgentError> {
    args.peers
        .first()
        .and_then(|p| split_host_port(p))
        .ok_or(AgentError::MissingPeer { role: args.role })
}

fn mongo_eval(
    mongosh: &Utf8Path,
    host: &str,
    port: u16,
    js: &str,
) -> Invocation {
    let port = port.to_string();
    Invocation::new(mongosh.as_str()).args([
        "--quiet",
        "--host",
        host,
        "--port",
        port.as_str(),
        "--eval",
        js,
    ])
}

fn sql_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "''")
}

fn mysql_accounts_sql(args: &InstallArgs) -> String {
    let mut sql = format!(
        "CREATE USER IF NOT EXISTS '{user}'@'%' IDENTIFIED BY '{pw}'; \
         GRANT ALL PRIVILEGES ON *.* TO '{user}'@'%' WITH GRANT OPTION; ",
        user = sql_escape(&args.user),
        pw = sql_escape(&args.password),
    );
    if args.repl_user() != args.user {
        sql.push_str(&format!(
            "CREATE USER IF NOT EXISTS '{user}'@'%' IDENTIFIED BY '{pw}'; \
             GRANT REPLICATION SLAVE, REPLICATION CLIENT \
             ON *.* TO '{user}'@'%'; ",
            user = sql_escape(args.repl_user()),
            pw = sql_escape(args.repl_password()),
        ));
    }
    sql.push_str(&format!(
        "ALTER USER 'root'@'localhost' IDENTIFIED BY '{}'; FLUSH PRIVILEGES;",
        sql_escape(&args.password)
    ));
    sql
}

/// Statements that make the local server replicate from `host:port`.
pub fn mysql_follow_sql(
    host: &str,
    port: u16,
    user: &str,
    password: &str,
) -> String {
    format!(
        "STOP SLAVE; CHANGE MASTER TO MASTER_HOST='{}', MASTER_PORT={port}, \
         MASTER_USER='{}', MASTER_PASSWORD='{}', MASTER_AUTO_POSITION=1, \
         GET_MASTER_PUBLIC_KEY=1; START SLAVE;",
        sql_escape(host),
        sql_escape(user),
        sql_escape(password),
    )
}
