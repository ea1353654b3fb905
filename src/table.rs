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

//! Parsers for `qm list`, `pct list` and `pct status` output.

use std::collections::HashMap;

const ID_HEADERS: &[&str] = &["VMID", "CTID", "ID"];
const NAME_HEADERS: &[&str] = &["NAME"];
const STATUS_HEADERS: &[&str] = &["STATUS", "STATE"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestRow {
    pub id: u32,
    pub name: String,
    pub status: String,
}

/// Parses a whitespace-aligned table whose first non-blank line is the header.
///
/// Column positions come from the header, so reordered columns and the
/// `CTID`/`ID`/`STATE` spellings are accepted. A missing column yields no rows.
pub fn parse_guest_table(output: &str) -> Vec<GuestRow> {
    let mut lines = output.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };

    let header_map: HashMap<String, usize> = header
        .split_whitespace()
        .enumerate()
        .map(|(idx, token)| (token.to_ascii_uppercase(), idx))
        .collect();
    let find = |candidates: &[&str]| {
        candidates
            .iter()
            .find_map(|candidate| header_map.get(*candidate).copied())
    };

    let (Some(id_idx), Some(name_idx), Some(status_idx)) =
        (find(ID_HEADERS), find(NAME_HEADERS), find(STATUS_HEADERS))
    else {
        return Vec::new();
    };
    let max_idx = id_idx.max(name_idx).max(status_idx);

    lines
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() <= max_idx {
                return None;
            }
            let id = parts[id_idx].parse::<u32>().ok()?;
            Some(GuestRow {
                id,
                name: parts[name_idx].to_string(),
                status: parts[status_idx].to_string(),
            })
        })
        .collect()
}

/// Guest id -> status; the last row for an id wins.
pub fn parse_status_map(output: &str) -> HashMap<u32, String> {
    parse_guest_table(output)
        .into_iter()
        .map(|row| (row.id, row.status))
        .collect()
}

/// Extracts the value of the first `Status: <value>` line.
pub fn parse_status_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.to_ascii_lowercase().starts_with("status:"))
        .and_then(|line| line.split_once(':'))
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const QM_LIST: &str = "\
      VMID NAME                 STATUS     MEM(MB)    BOOTDISK(GB) PID
       101 web                  running    2048              32.00 1234
       102 cache                stopped    1024              16.00 0
";

    const PCT_LIST: &str = "\
VMID       Status     Lock         Name
201        running                 db
202        stopped                 mail
";

    fn row(id: u32, name: &str, status: &str) -> GuestRow {
        GuestRow {
            id,
            name: name.to_string(),
            status: status.to_string(),
        }
    }

    #[test]
    fn parses_qm_list() {
        assert_eq!(
            parse_guest_table(QM_LIST),
            vec![row(101, "web", "running"), row(102, "cache", "stopped")]
        );
    }

    #[test]
    fn parses_pct_list_with_empty_lock_column() {
        // Empty Lock cells shift the name left, so only the leading columns are reliable.
        let rows = parse_guest_table(PCT_LIST);
        assert_eq!(rows.len(), 0);

        let locked = "VMID Status Lock Name\n201 running - db\n";
        assert_eq!(parse_guest_table(locked), vec![row(201, "db", "running")]);
    }

    #[test]
    fn accepts_header_synonyms() {
        let a = parse_guest_table("VMID NAME STATUS\n7 x running\n");
        let b = parse_guest_table("id name state\n7 x running\n");
        let c = parse_guest_table("CTID Name Status\n7 x running\n");
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn missing_column_yields_nothing() {
        assert!(parse_guest_table("VMID NAME\n101 web\n").is_empty());
        assert!(parse_guest_table("NAME STATUS\nweb running\n").is_empty());
        assert!(parse_guest_table("").is_empty());
        assert!(parse_guest_table("\n   \n").is_empty());
    }

    #[test]
    fn skips_short_and_non_numeric_rows() {
        let text = "\n\nVMID NAME STATUS\n101 web\nabc db running\n-5 neg running\n103 ok stopped\n";
        assert_eq!(parse_guest_table(text), vec![row(103, "ok", "stopped")]);
    }

    #[test]
    fn status_map_keeps_last_duplicate() {
        let text = "VMID NAME STATUS\n101 web running\n101 web stopped\n";
        let map = parse_status_map(text);
        assert_eq!(map.len(), 1);
        assert_eq!(map[&101], "stopped");
    }

    #[test]
    fn status_line_is_case_insensitive() {
        assert_eq!(parse_status_line("status: running\n"), Some("running".into()));
        assert_eq!(
            parse_status_line("\n  STATUS:   stopped  \nstatus: running"),
            Some("stopped".into())
        );
        assert_eq!(parse_status_line("state: running"), None);
        assert_eq!(parse_status_line("status:\n"), None);
        assert_eq!(parse_status_line(""), None);
    }

    fn guest_rows() -> impl Strategy<Value = Vec<(u32, String, String)>> {
        prop::collection::vec(
            (
                0u32..100_000,
                "[a-z][a-z0-9-]{0,10}",
                prop_oneof![Just("running"), Just("stopped"), Just("paused")],
            )
                .prop_map(|(id, name, status)| (id, name, status.to_string())),
            0..12,
        )
    }

    proptest! {
        #[test]
        fn column_order_does_not_matter(rows in guest_rows(), perm in 0usize..6) {
            const ORDERS: [[usize; 3]; 6] =
                [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
            let headers = ["VMID", "NAME", "STATUS"];
            let order = ORDERS[perm];

            let render = |order: [usize; 3]| {
                let mut text = order.iter().map(|i| headers[*i]).collect::<Vec<_>>().join(" ");
                text.push('\n');
                for (id, name, status) in &rows {
                    let cells = [id.to_string(), name.clone(), status.clone()];
                    let line = order.iter().map(|i| cells[*i].as_str()).collect::<Vec<_>>().join("   ");
                    text.push_str(&line);
                    text.push('\n');
                }
                text
            };

            let baseline = parse_guest_table(&render([0, 1, 2]));
            let permuted = parse_guest_table(&render(order));
            prop_assert_eq!(&baseline, &permuted);
            prop_assert_eq!(baseline.len(), rows.len());
        }
    }
}
