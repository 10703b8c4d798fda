// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared setup for the deployer integration tests.

#![allow(dead_code)]

use camino_tempfile::Utf8TempDir;
use dbfleet::config::ClusterFile;
use dbfleet::config::ValidationError;
use dbfleet::ClusterSpec;
use dbfleet::Deployer;
use dbfleet_node_agent::package::sha256_file;
use dbfleet_remote_exec::fakes::FakeConnector;
use dbfleet_remote_exec::fakes::FakeOutput;
use slog::o;
use slog::Drain;
use slog::Logger;
use std::sync::Arc;
use std::sync::Mutex;

pub fn test_logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!("test" => true))
}

/// A cluster file with its artifacts on local disk and fake hosts behind
/// it.
pub struct Fixture {
    // Holds the package directory for the life of the test.
    _dir: Utf8TempDir,
    pub log: Logger,
    pub spec: ClusterSpec,
    pub connector: Arc<FakeConnector>,
}

impl Fixture {
    /// `body` is everything after the engine, version and environment: at
    /// least a topology, credentials and nodes.
    pub async fn new(engine: &str, version: &str, body: &str) -> Fixture {
        Fixture::try_new(engine, version, body).await.unwrap()
    }

    pub async fn try_new(
        engine: &str,
        version: &str,
        body: &str,
    ) -> Result<Fixture, ValidationError> {
        let dir = camino_tempfile::tempdir().unwrap();
        let package_name = format!("{engine}-{version}-linux-x86_64.tar.gz");
        let package = dir.path().join(&package_name);
        fs_err::write(&package, b"not really a tarball").unwrap();
        let digest = sha256_file(&package).await.unwrap();
        fs_err::write(
            dir.path().join("manifest.toml"),
            format!("[packages]\n\"{package_name}\" = \"{digest}\"\n"),
        )
        .unwrap();
        fs_err::write(
            dir.path().join("unit.template"),
            "[Service]\nExecStart={{exec_start}}\n",
        )
        .unwrap();
        let agent = dir.path().join("dbfleet");
        fs_err::write(&agent, b"#!/bin/sh\n").unwrap();

        let contents = format!(
            r#"
            engine = "{engine}"
            version = "{version}"
            {body}

            [environment]
            package_dir = "{dir}"
            agent_binary = "{agent}"
            arch = "x86_64"
            "#,
            dir = dir.path(),
        );
        let spec = ClusterFile::from_toml(&contents).unwrap().resolve()?;
        let log = test_logger();
        let connector = FakeConnector::new(&log);
        Ok(Fixture { _dir: dir, log, spec, connector })
    }

    pub fn deployer(&self) -> Deployer {
        Deployer::new(&self.log, self.spec.clone(), self.connector.clone())
    }

    /// Commands containing `needle` on every host, prefixed with the host.
    pub fn commands_containing(&self, hosts: &[&str], needle: &str) -> Vec<String> {
        hosts
            .iter()
            .flat_map(|h| {
                self.connector
                    .host(h)
                    .commands_containing(needle)
                    .into_iter()
                    .map(move |c| format!("{h}: {c}"))
            })
            .collect()
    }
}

/// Zero-delay retry budgets, so convergence tests do not sleep.
pub fn fast_retries(attempts: u32) -> String {
    ["replication", "quorum", "shard_registration", "router"]
        .iter()
        .map(|phase| {
            format!("[retry.{phase}]\nattempts = {attempts}\ndelay_secs = 0\n")
        })
        .collect()
}

/// An event log shared by several host handlers, for checking ordering
/// across hosts.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn first(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    pub fn last(&self, event: &str) -> Option<usize> {
        self.events().iter().rposition(|e| e == event)
    }
}

pub fn mysql_primary() -> FakeOutput {
    FakeOutput::stdout(
        "*************************** 1. row ***************************\n\
         read_only: 0\n",
    )
}

pub fn mysql_replica(caught_up: bool) -> FakeOutput {
    let (io, lag) = if caught_up { ("Yes", "0") } else { ("Connecting", "NULL") };
    FakeOutput::stdout(format!(
        "*************************** 1. row ***************************\n\
         read_only: 1\n\
         *************************** 1. row ***************************\n\
         Slave_IO_Running: {io}\n\
         Slave_SQL_Running: Yes\n\
         Seconds_Behind_Master: {lag}\n"
    ))
}

pub fn galera(state: &str, size: u32) -> FakeOutput {
    FakeOutput::stdout(format!(
        "Variable_name: wsrep_cluster_size\nValue: {size}\n\
         Variable_name: wsrep_cluster_status\nValue: Primary\n\
         Variable_name: wsrep_local_state_comment\nValue: {state}\n\
         Variable_name: wsrep_ready\nValue: ON\n"
    ))
}

pub fn mongo_hello(primary: bool) -> FakeOutput {
    FakeOutput::stdout(format!(
        "{{\"primary\":{primary},\"secondary\":{},\"arbiter\":false,\
         \"router\":false,\"members\":1,\"lag\":0}}\n",
        !primary
    ))
}

pub fn is_mysql_status(command: &str) -> bool {
    command.contains("SHOW SLAVE STATUS")
}

pub fn is_galera_status(command: &str) -> bool {
    command.contains("wsrep_cluster_size")
}

pub fn is_mongo_status(command: &str) -> bool {
    command.contains("db.hello()")
}
