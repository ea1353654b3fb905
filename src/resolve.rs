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

use crate::config::{Config, NodeConfig};
use crate::error::ResolveError;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum GuestKind {
    #[serde(rename = "VM")]
    Vm,
    #[serde(rename = "LXC")]
    Container,
}

impl GuestKind {
    /// Proxmox tool that manages this kind of guest.
    pub fn command(self) -> &'static str {
        match self {
            GuestKind::Vm => "qm",
            GuestKind::Container => "pct",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GuestKind::Vm => "VM",
            GuestKind::Container => "LXC",
        }
    }
}

impl fmt::Display for GuestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestRef {
    pub node: String,
    pub kind: GuestKind,
    pub id: u32,
}

fn is_numeric(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

fn guests(node: &NodeConfig) -> impl Iterator<Item = (&String, u32, GuestKind)> {
    node.vms
        .iter()
        .map(|(name, id)| (name, *id, GuestKind::Vm))
        .chain(
            node.lxcs
                .iter()
                .map(|(name, id)| (name, *id, GuestKind::Container)),
        )
}

/// Maps a guest name or numeric id to the single guest it names across the fleet.
pub fn resolve_guest(config: &Config, target: &str) -> Result<GuestRef, ResolveError> {
    let numeric = is_numeric(target);
    // Ids beyond u32 cannot be configured, so they simply match nothing.
    let wanted_id = if numeric { target.parse::<u32>().ok() } else { None };

    let mut matches = Vec::new();
    for (node_name, node) in &config.nodes {
        for (name, id, kind) in guests(node) {
            let hit = if numeric {
                wanted_id == Some(id)
            } else {
                name == target
            };
            if hit {
                matches.push(GuestRef {
                    node: node_name.clone(),
                    kind,
                    id,
                });
            }
        }
    }

    match (matches.len(), numeric) {
        (1, _) => Ok(matches.remove(0)),
        (0, true) => Err(ResolveError::UnknownGuestId(target.to_string())),
        (0, false) => Err(ResolveError::UnknownGuestName(target.to_string())),
        (_, true) => Err(ResolveError::AmbiguousGuestId(target.to_string())),
        (_, false) => Err(ResolveError::AmbiguousGuestName(target.to_string())),
    }
}

/// The nodes a listing should visit, in name order.
pub fn select_nodes<'a>(
    config: &'a Config,
    node: Option<&str>,
) -> Result<Vec<&'a NodeConfig>, ResolveError> {
    match node {
        Some(name) => config
            .nodes
            .get(name)
            .map(|n| vec![n])
            .ok_or_else(|| ResolveError::UnknownNode(name.to_string())),
        None => Ok(config.nodes.values().collect()),
    }
}
