// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Authenticated remote shell and file-transfer access to one host.
//!
//! Everything the deployer does to a remote machine goes through a
//! [`RemoteChannel`]. In production this is an [`SshChannel`], which drives
//! the system `ssh`, `scp` and `rsync` clients; under test a
//! [`fakes::FakeChannel`] records commands and answers from a script.

mod channel;
pub mod fakes;
mod ssh;

pub use channel::BoxedChannel;
pub use channel::ChannelConnector;
pub use channel::ChannelError;
pub use channel::CommandFailureInfo;
pub use channel::CommandOutput;
pub use channel::RemoteChannel;
pub use channel::SshAuth;
pub use channel::SshTarget;
pub use ssh::SshChannel;
pub use ssh::SshConnector;
pub use ssh::SshTimeouts;
