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

//! Error taxonomy shared by the resolver, the escalation controller and the CLI.

use crate::config::ConfigError;
use thiserror::Error;

pub const EXIT_OK: u8 = 0;
pub const EXIT_PARTIAL: u8 = 1;
pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_NOT_FOUND: u8 = 3;
pub const EXIT_REMOTE: u8 = 4;
pub const EXIT_SUDO: u8 = 5;

/// Generic message used when a remote command fails without printing anything.
pub const REMOTE_FAILED_FALLBACK: &str = "Remote command failed";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Unknown guest ID: {0}")]
    UnknownGuestId(String),
    #[error("Guest ID is not unique: {0}")]
    AmbiguousGuestId(String),
    #[error("Unknown guest name: {0}")]
    UnknownGuestName(String),
    #[error("Guest name is not unique: {0}")]
    AmbiguousGuestName(String),
    #[error("Unknown node: {0}")]
    UnknownNode(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Escalation is needed but not permitted, or the retry loop ran out without a clear signal.
    #[error("{0}")]
    SudoRequired(String),
    #[error("sudo authentication failed after {attempts} attempts on node '{node}' ({host})")]
    AuthFailed {
        node: String,
        host: String,
        attempts: usize,
    },
    #[error("{0}")]
    CommandFailed(String),
}

impl RemoteError {
    /// Builds a `CommandFailed` from remote output, falling back to a generic message.
    pub fn from_output(output: &str) -> Self {
        let trimmed = output.trim();
        if trimmed.is_empty() {
            Self::CommandFailed(REMOTE_FAILED_FALLBACK.to_string())
        } else {
            Self::CommandFailed(trimmed.to_string())
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::SudoRequired(_) | Self::AuthFailed { .. } => EXIT_SUDO,
            Self::CommandFailed(_) => EXIT_REMOTE,
        }
    }
}

pub fn sudo_required_message(label: &str, node: &str, host: &str) -> String {
    format!(
        "sudo password is required for {label} commands. \
         Configure passwordless sudo for {label} on node '{node}' ({host})."
    )
}

/// Maps any error surfaced to `main` onto the documented process exit code.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG;
    }
    if err.downcast_ref::<ResolveError>().is_some() {
        return EXIT_NOT_FOUND;
    }
    if let Some(remote) = err.downcast_ref::<RemoteError>() {
        return remote.exit_code();
    }
    EXIT_REMOTE
}
