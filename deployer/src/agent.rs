// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builds the agent command lines run on each host.

use crate::config::ClusterSpec;
use crate::config::Topology;
use crate::planner::PlannedNode;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use dbfleet_node_agent::workspace;
use dbfleet_node_agent::AgentAction;
use dbfleet_node_agent::AgentCommand;
use dbfleet_node_agent::InstallArgs;

/// Where the staged agent lives inside a workspace.
pub fn agent_path(workspace_dir: &Utf8Path) -> Utf8PathBuf {
    workspace_dir.join(workspace::AGENT_BINARY)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AgentFlags {
    pub only_check: bool,
    pub no_rollback: bool,
}

/// The install (or dry-run) command for one planned node.
pub fn install_command(
    spec: &ClusterSpec,
    planned: &PlannedNode,
    flags: AgentFlags,
) -> AgentCommand {
    let node = &planned.node;
    let args = InstallArgs {
        version: spec.version.clone(),
        port: node.options.port,
        data_dir: node.options.data_dir.clone(),
        user: spec.credentials.user.clone(),
        password: spec.credentials.password.clone(),
        repl_user: spec.credentials.repl_user.clone(),
        repl_password: spec.credentials.repl_password.clone(),
        role: planned.role,
        peers: planned.peers.clone(),
        replica_set: planned.replica_set.clone(),
        bootstrap: planned.bootstrap,
        memory_mb: node.options.memory_mb,
        resource_limit: node.options.limits,
        only_check: flags.only_check,
        add_replica: planned.add_replica,
        no_rollback: flags.no_rollback,
        ipv6: spec.ipv6,
        workspace: node.workspace.clone(),
        package: spec.package_name(),
        advertise: node.host.clone(),
        layout: spec.environment.layout.clone(),
    };
    let action = if spec.topology != Topology::Single && planned.role.is_replicated()
    {
        AgentAction::Msinstall(args)
    } else {
        AgentAction::Install(args)
    };
    AgentCommand::new(spec.engine, action)
}

/// The command that undoes `install`. Uninstall commands are returned
/// unchanged.
pub fn uninstall_command(install: &AgentCommand) -> AgentCommand {
    let action = match install.action() {
        AgentAction::Install(args) => AgentAction::Uninstall(args.uninstall_args()),
        AgentAction::Msinstall(args) => {
            AgentAction::Unmsinstall(args.uninstall_args())
        }
        other => other.clone(),
    };
    AgentCommand::new(install.engine(), action)
}

/// The uninstall command for a planned node, for removing a cluster this
/// run did not install.
pub fn removal_command(spec: &ClusterSpec, planned: &PlannedNode) -> AgentCommand {
    uninstall_command(&install_command(spec, planned, AgentFlags::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterFile;
    use crate::planner::plan;
    use crate::planner::DeploymentPlan;
    use dbfleet_node_agent::AgentVerb;
    use dbfleet_node_agent::Role;

    fn spec(topology: &str) -> ClusterSpec {
        ClusterFile::from_toml(&format!(
            r#"
            engine = "mysql"
            topology = "{topology}"
            version = "8.0.36"

            [credentials]
            user = "admin"
            password = "secret"

            [ssh]
            password = "pw"

            [environment]
            package_dir = "/srv/packages"
            arch = "x86_64"

            [[nodes]]
            host = "db1"
            limits = "cpu=150"
            [[nodes]]
            host = "db2"
            [[nodes]]
            host = "db3"
            "#
        ))
        .unwrap()
        .resolve()
        .unwrap()
    }

    #[test]
    fn replica_gets_msinstall_with_peer() {
        let spec = spec("primary-replica");
        let DeploymentPlan::PrimaryReplica(set) = plan(&spec) else {
            panic!("wrong plan");
        };
        let command = install_command(
            &spec,
            &set.joiners()[0],
            AgentFlags { only_check: true, no_rollback: false },
        );
        let AgentAction::Msinstall(args) = command.action() else {
            panic!("expected msinstall, got {command:?}");
        };
        assert_eq!(args.role, Role::Replica);
        assert_eq!(args.peers, vec!["db1:3306"]);
        assert!(args.add_replica);
        assert!(args.only_check);
        assert_eq!(args.package, "mysql-8.0.36-linux-x86_64.tar.gz");
        assert_eq!(args.workspace, "/tmp/dbfleet");

        let undo = uninstall_command(&command);
        assert_eq!(undo.action().verb(), AgentVerb::Unmsinstall);
        assert_eq!(uninstall_command(&undo), undo);
    }

    #[test]
    fn quorum_members_use_plain_install() {
        let spec = spec("quorum");
        let DeploymentPlan::Quorum(quorum) = plan(&spec) else {
            panic!("wrong plan");
        };
        let command =
            install_command(&spec, &quorum.bootstrap, AgentFlags::default());
        let line = command.command_line(&agent_path(Utf8Path::new("/tmp/ws")));
        assert!(line.starts_with("/tmp/ws/dbfleet mysql install "));
        assert!(line.contains("--bootstrap"));
        assert!(line.contains("--resource-limit cpu=150"));
        assert_eq!(
            removal_command(&spec, &quorum.bootstrap).action().verb(),
            AgentVerb::Uninstall
        );
    }
}
