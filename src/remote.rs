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

//! Runs one `sudo` command on a node through the local `ssh` client.

use crate::config::NodeConfig;
use crate::error::RemoteError;
use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, trace};

/// Where and how to reach a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub identities_only: bool,
    pub ssh_options: Vec<String>,
}

impl From<&NodeConfig> for SshTarget {
    fn from(node: &NodeConfig) -> Self {
        Self {
            host: node.host.clone(),
            port: node.port,
            user: node.user.name.clone(),
            identity_file: Some(node.user.identity_file.clone()),
            identities_only: node.user.identities_only,
            ssh_options: node.ssh_options.clone(),
        }
    }
}

impl SshTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Arguments for the local `ssh` binary, ending with the remote command.
    pub fn ssh_args(&self, remote_command: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-p".into(), self.port.to_string().into()];
        if let Some(identity) = &self.identity_file {
            args.push("-i".into());
            args.push(identity.clone().into_os_string());
        }
        if self.identities_only {
            args.push("-o".into());
            args.push("IdentitiesOnly=yes".into());
        }
        for opt in &self.ssh_options {
            if !opt.starts_with('-') {
                args.push("-o".into());
            }
            args.push(opt.into());
        }
        args.push(self.destination().into());
        args.push(remote_command.into());
        args
    }
}

/// How sudo is invoked on the node.
#[derive(Clone, Copy)]
pub enum SudoMode<'a> {
    /// `sudo -n`: fail instead of prompting.
    NonInteractive,
    /// `sudo -S -p ''`: read the password from stdin without a prompt.
    Password(&'a str),
}

impl SudoMode<'_> {
    pub fn flags(&self) -> &'static str {
        match self {
            SudoMode::NonInteractive => "-n",
            SudoMode::Password(_) => "-S -p ''",
        }
    }
}

// Hand-written so the password never shows up in `{:?}` output.
impl std::fmt::Debug for SudoMode<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SudoMode::NonInteractive => f.write_str("NonInteractive"),
            SudoMode::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

pub fn sudo_command(mode: SudoMode<'_>, command: &str) -> String {
    format!("sudo {} {}", mode.flags(), command)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status of the ssh process; `-1` when it was killed by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len());
        out.push_str(&self.stdout);
        out.push_str(&self.stderr);
        out
    }
}

/// Runs a privileged command on a node. A non-zero remote exit is reported
/// through [`CommandOutput::status`], not as an error.
pub trait RemoteExecutor {
    fn run(
        &self,
        target: &SshTarget,
        command: &str,
        mode: SudoMode<'_>,
    ) -> Result<CommandOutput, RemoteError>;
}

#[derive(Debug, Clone)]
pub struct SshExecutor {
    program: OsString,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            program: "ssh".into(),
        }
    }
}

impl SshExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses another binary in place of `ssh`.
    #[cfg(test)]
    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl RemoteExecutor for SshExecutor {
    fn run(
        &self,
        target: &SshTarget,
        command: &str,
        mode: SudoMode<'_>,
    ) -> Result<CommandOutput, RemoteError> {
        let remote = sudo_command(mode, command);
        debug!(
            host = %target.host,
            port = target.port,
            command = %remote,
            "running remote command"
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(target.ssh_args(&remote))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.stdin(match mode {
            SudoMode::NonInteractive => Stdio::null(),
            SudoMode::Password(_) => Stdio::piped(),
        });

        let spawn_failed = |err: std::io::Error| {
            RemoteError::CommandFailed(format!(
                "failed to run {}: {err}",
                self.program.to_string_lossy()
            ))
        };
        let mut child = cmd.spawn().map_err(&spawn_failed)?;

        if let SudoMode::Password(secret) = mode {
            if let Some(mut stdin) = child.stdin.take() {
                // A closed pipe means ssh exited early; its status tells the story.
                let written = stdin
                    .write_all(secret.as_bytes())
                    .and_then(|_| stdin.write_all(b"\n"));
                if let Err(err) = written {
                    trace!(error = %err, "ssh closed stdin before the password was written");
                }
            }
        }

        let output = child.wait_with_output().map_err(&spawn_failed)?;
        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(host = %target.host, status = result.status, "remote command finished");
        Ok(result)
    }
}
