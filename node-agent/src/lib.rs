// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host-local half of dbfleet.
//!
//! The deployer stages a copy of its own executable on each target host and
//! runs it with an `<engine> <action>` subcommand. Everything that subcommand
//! does lives here: argument definitions (the wire contract between deployer
//! and host), environment checks, package verification, configuration and
//! unit rendering, and the install and uninstall sequences themselves.

pub mod args;
pub mod checks;
pub mod engine;
pub mod executor;
pub mod install;
pub mod limits;
pub mod package;
pub mod render;

pub use args::AgentAction;
pub use args::AgentCommand;
pub use args::AgentVerb;
pub use args::HostLayout;
pub use args::InstallArgs;
pub use args::UninstallArgs;
pub use engine::EngineKind;
pub use engine::Role;
pub use install::Agent;
pub use install::AgentError;
pub use limits::ResourceLimits;

/// File names used inside the remote workspace. The deployer writes these
/// and the agent reads them, so both sides share one definition.
pub mod workspace {
    pub const AGENT_BINARY: &str = "dbfleet";
    pub const MANIFEST: &str = "manifest.toml";
    pub const UNIT_TEMPLATE: &str = "unit.template";
}
