// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A failed install undoes exactly what this run installed.

mod common;

use common::fast_retries;
use common::is_mysql_status;
use common::mysql_primary;
use common::mysql_replica;
use common::Fixture;
use dbfleet::confirm::AssumeYes;
use dbfleet::deploy::RollbackOutcome;
use dbfleet::DeployError;
use dbfleet::DeployOptions;
use dbfleet_remote_exec::fakes::FakeOutput;

const HOSTS: [&str; 3] = ["db1", "db2", "db3"];

async fn fixture(rollback_on_failure: bool) -> Fixture {
    let body = format!(
        r#"
        topology = "primary-replica"
        rollback_on_failure = {rollback_on_failure}

        [credentials]
        user = "admin"
        password = "secret"

        [ssh]
        password = "pw"

        {retries}

        [[nodes]]
        host = "db1"
        [[nodes]]
        host = "db2"
        [[nodes]]
        host = "db3"
        "#,
        retries = fast_retries(3),
    );
    let fixture = Fixture::new("mysql", "8.0.36", &body).await;
    for host in ["db1", "db2"] {
        fixture.connector.host(host).set_handler(Box::new(move |cmd, _| {
            match (host, is_mysql_status(cmd)) {
                ("db1", true) => mysql_primary(),
                (_, true) => mysql_replica(true),
                _ => FakeOutput::success(),
            }
        }));
    }
    // The dry run passes; the real install does not.
    fixture.connector.host("db3").set_handler(Box::new(|cmd, _| {
        if cmd.contains("mysql msinstall") && !cmd.contains("--only-check") {
            FakeOutput::failure(1, "mysqld failed to start")
        } else {
            FakeOutput::success()
        }
    }));
    fixture
}

#[tokio::test]
async fn failed_install_rolls_back_earlier_nodes_in_order() {
    let fixture = fixture(true).await;
    let failure = fixture
        .deployer()
        .deploy(DeployOptions::default(), &mut AssumeYes)
        .await
        .unwrap_err();

    match &failure.error {
        DeployError::Install { host, step, source } => {
            assert_eq!(host, "db3");
            assert_eq!(*step, "install");
            assert!(source.to_string().contains("mysqld failed to start"));
        }
        other => panic!("unexpected error: {other}"),
    }
    let RollbackOutcome::Performed(report) = &failure.rollback else {
        panic!("expected a rollback, got {}", failure.rollback);
    };
    assert_eq!(report.attempted, vec!["db1:3306", "db2:3306"]);
    assert!(report.is_clean(), "{report}");
    assert!(report.left_intact.is_empty());

    for (host, uninstalls) in [("db1", 1), ("db2", 1), ("db3", 0)] {
        assert_eq!(
            fixture.connector.host(host).commands_containing("mysql unmsinstall").len(),
            uninstalls,
            "{host}"
        );
    }
    // The staged agent is cleaned up after the uninstall too.
    for host in ["db1", "db2"] {
        assert!(!fixture.connector.host(host).exists("/tmp/dbfleet"), "{host}");
    }
}

#[tokio::test]
async fn rollback_continues_past_a_failed_uninstall() {
    let fixture = fixture(true).await;
    fixture.connector.host("db1").set_handler(Box::new(|cmd, _| {
        if cmd.contains("mysql unmsinstall") {
            FakeOutput::failure(1, "unit is busy")
        } else if is_mysql_status(cmd) {
            mysql_primary()
        } else {
            FakeOutput::success()
        }
    }));

    let failure = fixture
        .deployer()
        .deploy(DeployOptions::default(), &mut AssumeYes)
        .await
        .unwrap_err();
    let RollbackOutcome::Performed(report) = &failure.rollback else {
        panic!("expected a rollback, got {}", failure.rollback);
    };
    assert_eq!(report.attempted, vec!["db1:3306", "db2:3306"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].address, "db1:3306");
    assert_eq!(report.failures[0].step, "uninstall");
    assert_eq!(
        fixture.connector.host("db2").commands_containing("mysql unmsinstall").len(),
        1
    );
}

#[tokio::test]
async fn no_rollback_leaves_installed_nodes_in_place() {
    let fixture = fixture(true).await;
    let failure = fixture
        .deployer()
        .deploy(DeployOptions { no_rollback: true }, &mut AssumeYes)
        .await
        .unwrap_err();

    match &failure.rollback {
        RollbackOutcome::Skipped { left_in_place } => {
            assert_eq!(left_in_place, &vec!["db1:3306", "db2:3306"]);
        }
        other => panic!("expected rollback to be skipped, got {other}"),
    }
    assert!(fixture.commands_containing(&HOSTS, "unmsinstall").is_empty());
    // The agent is told not to clean up after itself either.
    assert!(fixture
        .connector
        .host("db3")
        .commands_containing("mysql msinstall")
        .iter()
        .all(|c| c.contains("--no-rollback")));
}

#[tokio::test]
async fn rollback_can_be_disabled_in_the_cluster_file() {
    let fixture = fixture(false).await;
    let failure = fixture
        .deployer()
        .deploy(DeployOptions::default(), &mut AssumeYes)
        .await
        .unwrap_err();
    assert!(
        matches!(failure.rollback, RollbackOutcome::Skipped { .. }),
        "{}",
        failure.rollback
    );
}

#[tokio::test]
async fn failure_on_the_first_node_needs_no_rollback() {
    let fixture = fixture(true).await;
    fixture.connector.host("db1").refuse_connections("connection refused");
    let failure = fixture
        .deployer()
        .deploy(DeployOptions::default(), &mut AssumeYes)
        .await
        .unwrap_err();
    assert!(
        matches!(failure.error, DeployError::Connectivity { ref host, .. } if host == "db1"),
        "{}",
        failure.error
    );
    assert!(matches!(failure.rollback, RollbackOutcome::NotNeeded));
    assert_eq!(fixture.connector.host("db2").connect_count(), 0);
}
