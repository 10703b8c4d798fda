// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The operator confirmation gate in front of `deploy` and `remove`.

use reedline::DefaultPrompt;
use reedline::DefaultPromptSegment;
use reedline::Reedline;
use reedline::Signal;

pub trait Confirm {
    /// Asks the operator to approve `message`. Anything but an explicit yes
    /// is a no.
    fn confirm(&mut self, message: &str) -> bool;
}

/// Interactive prompt on the controlling terminal.
pub struct ConfirmationPrompt(Reedline);

impl ConfirmationPrompt {
    pub fn new() -> Self {
        Self(Reedline::create())
    }
}

impl Default for ConfirmationPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl Confirm for ConfirmationPrompt {
    fn confirm(&mut self, message: &str) -> bool {
        let prompt = DefaultPrompt::new(
            DefaultPromptSegment::Basic(format!("{message} [y/N]")),
            DefaultPromptSegment::Empty,
        );
        match self.0.read_line(&prompt) {
            Ok(Signal::Success(input)) => is_yes(&input),
            _ => false,
        }
    }
}

fn is_yes(input: &str) -> bool {
    let input = input.trim();
    input.eq_ignore_ascii_case("y") || input.eq_ignore_ascii_case("yes")
}

/// `--yes`.
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&mut self, _message: &str) -> bool {
        true
    }
}

/// Declines everything.
pub struct Decline;

impl Confirm for Decline {
    fn confirm(&mut self, _message: &str) -> bool {
        false
    }
}
