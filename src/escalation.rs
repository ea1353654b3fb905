// vmctl - control Proxmox guests across nodes over SSH
// Copyright (C) 2024 Mathias Uhl <mathiasuhl@gmx.de>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Sudo escalation over a non-interactive ssh channel.
//!
//! Every command is first tried with `sudo -n`. When sudo asks for a password
//! and `--askpass` is on, the password is prompted for and piped to
//! `sudo -S`, up to [`MAX_PASSWORD_ATTEMPTS`] times. Only a rejected password
//! is retried; any other failure ends the call.

use crate::config::NodeConfig;
use crate::error::{RemoteError, sudo_required_message};
use crate::remote::{RemoteExecutor, SshTarget, SudoMode};
use tracing::{debug, info};
use zeroize::Zeroizing;

pub const MAX_PASSWORD_ATTEMPTS: usize = 3;

/// True when sudo refused to run because it needs a password.
///
/// This is a plain substring check on the combined output, so unrelated
/// output mentioning all three words is classified the same way.
pub fn is_sudo_password_required(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("sudo") && lower.contains("password") && lower.contains("required")
}

/// True when sudo rejected a supplied password.
///
/// Like [`is_sudo_password_required`] this is a substring check, so any
/// output containing "try again" counts as a rejection.
pub fn is_sudo_auth_failed(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("try again")
        || lower.contains("incorrect password")
        || lower.contains("authentication failure")
}

/// Source of sudo passwords.
pub trait SecretPrompt {
    fn prompt(&self, message: &str) -> Result<Zeroizing<String>, RemoteError>;
}

/// Reads the password from the controlling terminal without echo.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl SecretPrompt for TerminalPrompt {
    fn prompt(&self, message: &str) -> Result<Zeroizing<String>, RemoteError> {
        rpassword::prompt_password(message)
            .map(Zeroizing::new)
            .map_err(|err| RemoteError::SudoRequired(err.to_string()))
    }
}

pub struct Escalation<'a> {
    executor: &'a dyn RemoteExecutor,
    prompt: &'a dyn SecretPrompt,
    askpass: bool,
}

impl<'a> Escalation<'a> {
    pub fn new(
        executor: &'a dyn RemoteExecutor,
        prompt: &'a dyn SecretPrompt,
        askpass: bool,
    ) -> Self {
        Self {
            executor,
            prompt,
            askpass,
        }
    }

    /// Runs `command` under sudo on `node` and returns its stdout.
    ///
    /// `label` names the command family (`qm`, `pct`) in the message shown
    /// when passwordless sudo is missing.
    pub fn run(&self, node: &NodeConfig, command: &str, label: &str) -> Result<String, RemoteError> {
        let target = SshTarget::from(node);
        let output = self
            .executor
            .run(&target, command, SudoMode::NonInteractive)?;
        if output.success() {
            return Ok(output.stdout);
        }

        let combined = output.combined();
        if is_sudo_password_required(&combined) {
            if !self.askpass {
                debug!(node = %node.name, "sudo needs a password and --askpass is off");
                return Err(RemoteError::SudoRequired(sudo_required_message(
                    label, &node.name, &node.host,
                )));
            }
            return self.retry_with_password(node, &target, command, label);
        }

        Err(RemoteError::from_output(&combined))
    }

    fn retry_with_password(
        &self,
        node: &NodeConfig,
        target: &SshTarget,
        command: &str,
        label: &str,
    ) -> Result<String, RemoteError> {
        let message = format!("Password for sudo on node '{}' ({}): ", node.name, node.host);

        for attempt in 1..=MAX_PASSWORD_ATTEMPTS {
            let output = {
                let secret = self.prompt.prompt(&message).map_err(|err| {
                    RemoteError::SudoRequired(format!(
                        "{} Could not read the password: {err}",
                        sudo_required_message(label, &node.name, &node.host)
                    ))
                })?;
                self.executor
                    .run(target, command, SudoMode::Password(secret.as_str()))?
            };

            if output.success() {
                return Ok(output.stdout);
            }
            let combined = output.combined();
            if !is_sudo_auth_failed(&combined) {
                return Err(RemoteError::from_output(&combined));
            }
            info!(node = %node.name, attempt, "sudo rejected the password");
            if attempt == MAX_PASSWORD_ATTEMPTS {
                return Err(RemoteError::AuthFailed {
                    node: node.name.clone(),
                    host: node.host.clone(),
                    attempts: MAX_PASSWORD_ATTEMPTS,
                });
            }
        }

        Err(RemoteError::SudoRequired(sudo_required_message(
            label, &node.name, &node.host,
        )))
    }
}
