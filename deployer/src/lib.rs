// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deploys database clusters to hosts reachable over ssh.
//!
//! A cluster file is loaded into a validated [`ClusterSpec`] and planned
//! into a [`DeploymentPlan`]: every node with its role and peers. The
//! [`Deployer`] then drives each node through a provisioning session
//! (stage the agent, dry-run it, install), waits for the engine to report
//! the expected replication shape, and on failure uninstalls whatever this
//! run installed.
//!
//! The same executable is the agent: staged on each host, it is invoked as
//! `dbfleet <engine> <action>` (see [`dbfleet_node_agent`]).

pub mod agent;
pub mod bootstrap;
pub mod config;
pub mod confirm;
pub mod context;
pub mod deploy;
pub mod engine;
pub mod errors;
pub mod ledger;
pub mod logging;
pub mod planner;
pub mod poller;
pub mod rollback;
pub mod session;
pub mod status;
pub mod summary;

pub use config::ClusterSpec;
pub use deploy::DeployFailure;
pub use deploy::DeployOptions;
pub use deploy::Deployer;
pub use errors::DeployError;
pub use planner::DeploymentPlan;
pub use summary::ConnectionSummary;
