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

//! Fleet-wide guest inventory.
//!
//! Nodes are visited one at a time in name order. A node that cannot be
//! listed is recorded in [`Listing::failed_nodes`] unless strict mode is on,
//! in which case the first failure aborts the listing.

use crate::config::{Config, ListingStrategy, NodeConfig};
use crate::error::{REMOTE_FAILED_FALLBACK, RemoteError};
use crate::escalation::Escalation;
use crate::resolve::{GuestKind, select_nodes};
use crate::table::{parse_status_line, parse_status_map};
use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

pub const QM_LIST: &str = "/usr/sbin/qm list";
pub const PCT_LIST: &str = "/usr/sbin/pct list";
pub const UNKNOWN_STATUS: &str = "unknown";

const MARKER: &str = "@@vmctl";

pub fn pct_status_command(ctid: u32) -> String {
    format!("/usr/sbin/pct status {ctid}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Running,
    Stopped,
}

impl StatusFilter {
    pub fn keeps(self, status: &str) -> bool {
        let wanted = match self {
            StatusFilter::Running => "running",
            StatusFilter::Stopped => "stopped",
        };
        status.eq_ignore_ascii_case(wanted)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub node: Option<String>,
    pub filter: Option<StatusFilter>,
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestStatus {
    pub node: String,
    pub id: u32,
    pub name: String,
    pub status: String,
    #[serde(rename = "type")]
    pub kind: GuestKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFailure {
    pub node: String,
    pub host: String,
    pub port: u16,
    pub message: String,
}

impl NodeFailure {
    fn new(node: &NodeConfig, err: &RemoteError) -> Self {
        Self {
            node: node.name.clone(),
            host: node.host.clone(),
            port: node.port,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub guests: Vec<GuestStatus>,
    pub failed_nodes: Vec<NodeFailure>,
}

impl Listing {
    /// True when at least one node could not be listed completely.
    pub fn is_partial(&self) -> bool {
        !self.failed_nodes.is_empty()
    }

    /// Guests grouped by node, keeping the sorted order.
    pub fn by_node(&self) -> Vec<(&str, Vec<&GuestStatus>)> {
        let mut groups: Vec<(&str, Vec<&GuestStatus>)> = Vec::new();
        for guest in &self.guests {
            match groups.last_mut() {
                Some((node, rows)) if *node == guest.node => rows.push(guest),
                _ => groups.push((guest.node.as_str(), vec![guest])),
            }
        }
        groups
    }
}

/// Output of one bundled session, split at the marker lines.
#[derive(Debug, Default, PartialEq, Eq)]
struct Bundle {
    qm: String,
    pct: String,
    /// ctid -> (exit status, combined output of `pct status`).
    status: BTreeMap<u32, (i32, String)>,
}

enum Section {
    None,
    Qm,
    Pct,
    Status(u32),
}

impl Bundle {
    fn script(ctids: &BTreeSet<u32>) -> String {
        let mut steps = vec![
            format!("echo {MARKER} qm-list"),
            format!("{QM_LIST} || exit $?"),
            format!("echo {MARKER} pct-list"),
            format!("{PCT_LIST} || exit $?"),
        ];
        for ctid in ctids {
            steps.push(format!("echo {MARKER} pct-status {ctid}"));
            steps.push(format!("{} 2>&1", pct_status_command(*ctid)));
            steps.push(format!("echo {MARKER} rc $?"));
        }
        format!("sh -c '{}'", steps.join("; "))
    }

    fn parse(output: &str) -> Self {
        let mut bundle = Bundle::default();
        let mut section = Section::None;
        for line in output.lines() {
            if let Some(marker) = line.trim().strip_prefix(MARKER) {
                let mut words = marker.split_whitespace();
                match (words.next(), words.next()) {
                    (Some("qm-list"), _) => section = Section::Qm,
                    (Some("pct-list"), _) => section = Section::Pct,
                    (Some("pct-status"), Some(id)) => match id.parse() {
                        Ok(ctid) => {
                            bundle.status.insert(ctid, (-1, String::new()));
                            section = Section::Status(ctid);
                        }
                        Err(_) => section = Section::None,
                    },
                    (Some("rc"), Some(code)) => {
                        if let Section::Status(ctid) = section {
                            if let Some(entry) = bundle.status.get_mut(&ctid) {
                                entry.0 = code.parse().unwrap_or(-1);
                            }
                        }
                        section = Section::None;
                    }
                    _ => {}
                }
                continue;
            }
            let target = match section {
                Section::None => continue,
                Section::Qm => &mut bundle.qm,
                Section::Pct => &mut bundle.pct,
                Section::Status(ctid) => match bundle.status.get_mut(&ctid) {
                    Some(entry) => &mut entry.1,
                    None => continue,
                },
            };
            target.push_str(line);
            target.push('\n');
        }
        bundle
    }

    fn container_status(&self, ctid: u32) -> Result<String, RemoteError> {
        match self.status.get(&ctid) {
            Some((0, text)) => Ok(text.clone()),
            Some((_, text)) => Err(RemoteError::from_output(text)),
            None => Err(RemoteError::from_output("")),
        }
    }
}

/// Narrows a bundled failure to the output of the step that failed.
///
/// Everything up to the last marker line belongs to steps that succeeded.
fn failing_section(err: RemoteError) -> RemoteError {
    match err {
        RemoteError::CommandFailed(message) => {
            let mut tail: Vec<&str> = message
                .lines()
                .rev()
                .take_while(|line| !line.trim_start().starts_with(MARKER))
                .collect();
            tail.reverse();
            RemoteError::from_output(&tail.join("\n"))
        }
        other => other,
    }
}

/// Listings of one node before they are matched against the config.
struct NodeListings {
    qm: String,
    pct: String,
    bundle: Option<Bundle>,
}

pub struct FleetLister<'a> {
    escalation: &'a Escalation<'a>,
    strategy: ListingStrategy,
}

impl<'a> FleetLister<'a> {
    pub fn new(escalation: &'a Escalation<'a>, strategy: ListingStrategy) -> Self {
        Self {
            escalation,
            strategy,
        }
    }

    pub fn list(&self, config: &Config, opts: &ListOptions) -> Result<Listing> {
        let nodes = select_nodes(config, opts.node.as_deref())?;
        debug!(nodes = nodes.len(), strategy = ?self.strategy, "listing fleet");

        let mut listing = Listing::default();
        for node in nodes {
            let listings = match self.fetch_listings(node) {
                Ok(listings) => listings,
                Err(err) if opts.strict => return Err(err.into()),
                Err(err) => {
                    info!(node = %node.name, error = %err, "node listing failed");
                    listing.failed_nodes.push(NodeFailure::new(node, &err));
                    continue;
                }
            };

            let vm_statuses = parse_status_map(&listings.qm);
            for (name, vmid) in &node.vms {
                let status = vm_statuses
                    .get(vmid)
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_STATUS.to_string());
                listing.guests.push(GuestStatus {
                    node: node.name.clone(),
                    id: *vmid,
                    name: name.clone(),
                    status,
                    kind: GuestKind::Vm,
                });
            }

            let ct_statuses = parse_status_map(&listings.pct);
            for (name, ctid) in &node.lxcs {
                let mut status = ct_statuses
                    .get(ctid)
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_STATUS.to_string());
                if status.eq_ignore_ascii_case(UNKNOWN_STATUS) {
                    match self.container_status(node, *ctid, listings.bundle.as_ref()) {
                        Ok(output) => {
                            if let Some(fallback) = parse_status_line(&output) {
                                status = fallback;
                            }
                        }
                        Err(err) if opts.strict => return Err(err.into()),
                        Err(err) => {
                            info!(node = %node.name, ctid, error = %err, "container status failed");
                            listing.failed_nodes.push(NodeFailure::new(node, &err));
                            continue;
                        }
                    }
                }
                listing.guests.push(GuestStatus {
                    node: node.name.clone(),
                    id: *ctid,
                    name: name.clone(),
                    status,
                    kind: GuestKind::Container,
                });
            }
        }

        if let Some(filter) = opts.filter {
            listing.guests.retain(|guest| filter.keeps(&guest.status));
        }
        listing
            .guests
            .sort_by(|a, b| (a.node.as_str(), a.id).cmp(&(b.node.as_str(), b.id)));
        Ok(listing)
    }

    fn fetch_listings(&self, node: &NodeConfig) -> Result<NodeListings, RemoteError> {
        match self.strategy {
            ListingStrategy::Sequential => {
                let qm = self.escalation.run(node, QM_LIST, "qm")?;
                let pct = self.escalation.run(node, PCT_LIST, "pct")?;
                Ok(NodeListings {
                    qm,
                    pct,
                    bundle: None,
                })
            }
            ListingStrategy::Bundled => {
                let ctids: BTreeSet<u32> = node.lxcs.values().copied().collect();
                let output = self
                    .escalation
                    .run(node, &Bundle::script(&ctids), "qm")
                    .map_err(failing_section)?;
                let bundle = Bundle::parse(&output);
                Ok(NodeListings {
                    qm: bundle.qm.clone(),
                    pct: bundle.pct.clone(),
                    bundle: Some(bundle),
                })
            }
        }
    }

    fn container_status(
        &self,
        node: &NodeConfig,
        ctid: u32,
        bundle: Option<&Bundle>,
    ) -> Result<String, RemoteError> {
        match bundle {
            Some(bundle) => bundle.container_status(ctid),
            None => self
                .escalation
                .run(node, &pct_status_command(ctid), "pct"),
        }
    }
}
