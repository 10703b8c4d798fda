// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bootstrapping a synchronous quorum cluster.

mod common;

use common::fast_retries;
use common::galera;
use common::is_galera_status;
use common::Fixture;
use common::Journal;
use dbfleet::confirm::AssumeYes;
use dbfleet::deploy::RollbackOutcome;
use dbfleet::DeployError;
use dbfleet::DeployOptions;
use dbfleet_remote_exec::fakes::FakeOutput;

fn body(hosts: &[&str], attempts: u32) -> String {
    let nodes: String = hosts
        .iter()
        .map(|h| format!("[[nodes]]\nhost = \"{h}\"\n"))
        .collect();
    format!(
        r#"
        topology = "quorum"

        [credentials]
        user = "admin"
        password = "secret"

        [ssh]
        password = "pw"

        {retries}

        {nodes}
        "#,
        retries = fast_retries(attempts),
    )
}

/// Records installs and the bootstrap retraction; `status` answers the
/// status queries.
fn script_host<F>(fixture: &Fixture, journal: &Journal, host: &'static str, mut status: F)
where
    F: FnMut() -> FakeOutput + Send + 'static,
{
    let journal = journal.clone();
    fixture.connector.host(host).set_handler(Box::new(move |cmd, _| {
        if is_galera_status(cmd) {
            return status();
        }
        if cmd.contains("mysql install") && !cmd.contains("--only-check") {
            journal.push(format!("{host} install"));
        } else if cmd.contains("sed -i") {
            journal.push(format!("{host} retract"));
        }
        FakeOutput::success()
    }));
}

#[tokio::test]
async fn two_members_are_not_a_quorum() {
    let Err(err) = Fixture::try_new("mysql", "8.0.36", &body(&["db1", "db2"], 3)).await
    else {
        panic!("two-member quorum was accepted");
    };
    assert!(
        err.problems.contains(
            &"quorum mysql: at least three members are required for a quorum"
                .to_string()
        ),
        "{err}"
    );
}

#[tokio::test]
async fn bootstrap_node_comes_up_before_peers_join() {
    let fixture =
        Fixture::new("mysql", "8.0.36", &body(&["db1", "db2", "db3"], 5)).await;
    let journal = Journal::default();
    let mut queries = 0;
    script_host(&fixture, &journal, "db1", move || {
        queries += 1;
        // Alone until the peers have joined.
        galera("Synced", if queries == 1 { 1 } else { 3 })
    });
    script_host(&fixture, &journal, "db2", || galera("Synced", 3));
    script_host(&fixture, &journal, "db3", || galera("Synced", 3));

    fixture
        .deployer()
        .deploy(DeployOptions::default(), &mut AssumeYes)
        .await
        .unwrap();

    assert_eq!(
        journal.events(),
        vec!["db1 install", "db1 retract", "db2 install", "db3 install"]
    );
    let install = |host: &str| {
        fixture
            .connector
            .host(host)
            .commands_containing("mysql install")
            .into_iter()
            .find(|c| !c.contains("--only-check"))
            .unwrap()
    };
    assert!(install("db1").contains("--bootstrap"));
    for peer in ["db2", "db3"] {
        let line = install(peer);
        assert!(!line.contains("--bootstrap"), "{line}");
        assert!(line.contains("--peer db1:3306"), "{line}");
    }
    let retract = fixture.connector.host("db1").commands_containing("sed -i");
    assert_eq!(retract.len(), 1);
    assert!(retract[0].contains("--wsrep-new-cluster"));
    assert!(retract[0].contains("systemctl daemon-reload"));
}

#[tokio::test]
async fn bootstrap_node_that_never_syncs_stops_the_run() {
    let fixture =
        Fixture::new("mysql", "8.0.36", &body(&["db1", "db2", "db3"], 2)).await;
    let journal = Journal::default();
    script_host(&fixture, &journal, "db1", || galera("Joining: receiving State Transfer", 1));

    let failure = fixture
        .deployer()
        .deploy(DeployOptions::default(), &mut AssumeYes)
        .await
        .unwrap_err();
    match &failure.error {
        DeployError::ConvergenceTimeout { what, attempts, .. } => {
            assert_eq!(what, "quorum bootstrap node db1:3306");
            assert_eq!(*attempts, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fixture.connector.host("db1").commands_containing("sed -i").is_empty());
    assert_eq!(fixture.connector.host("db2").connect_count(), 0);
    assert_eq!(fixture.connector.host("db3").connect_count(), 0);

    let RollbackOutcome::Performed(report) = &failure.rollback else {
        panic!("expected a rollback, got {}", failure.rollback);
    };
    assert_eq!(report.attempted, vec!["db1:3306"]);
    assert_eq!(
        fixture.connector.host("db1").commands_containing("mysql uninstall").len(),
        1
    );
}
