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

use dirs::{config_dir, home_dir};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_PORT: u16 = 22;
pub const LOCAL_CONFIG_FILE: &str = "vmctl.yaml";
pub const CONFIG_DIR_ENV: &str = "VMCTL_CONFIG_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("No config file found. Tried: {0}")]
    NoConfig(String),
    #[error("Failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// How `list` gathers guest state from a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStrategy {
    /// One ssh session per remote command.
    #[default]
    Sequential,
    /// A single ssh session running a marker-delimited script.
    Bundled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserConfig {
    pub name: String,
    pub identity_file: PathBuf,
    pub identities_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: UserConfig,
    pub ssh_options: Vec<String>,
    pub vms: BTreeMap<String, u32>,
    pub lxcs: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefaultsConfig {
    pub port: u16,
    pub user: UserConfig,
    pub ssh_options: Vec<String>,
    pub listing: ListingStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    pub nodes: BTreeMap<String, NodeConfig>,
    /// VM name -> (node name, VM id).
    pub vm_index: BTreeMap<String, (String, u32)>,
    pub defaults: DefaultsConfig,
}

/// Candidate config locations, in lookup order.
pub fn default_config_paths(cwd: &Path) -> Vec<PathBuf> {
    let mut paths = vec![cwd.join(LOCAL_CONFIG_FILE)];
    if let Ok(custom) = env::var(CONFIG_DIR_ENV) {
        paths.push(PathBuf::from(custom).join("config.yaml"));
    } else if let Some(base) = config_dir() {
        paths.push(base.join("vmctl-ng").join("config.yaml"));
    }
    paths
}

pub fn find_config_path(override_path: Option<&Path>, cwd: &Path) -> Result<PathBuf, ConfigError> {
    if let Some(path) = override_path {
        let path = expand_home(&path.to_string_lossy());
        if !path.is_file() {
            return Err(ConfigError::NotFound(path));
        }
        return Ok(path);
    }

    let candidates = default_config_paths(cwd);
    if let Some(found) = candidates.iter().find(|p| p.is_file()) {
        return Ok(found.clone());
    }
    let tried = candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(ConfigError::NoConfig(tried))
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    debug!(path = %path.display(), "loading config");
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&contents)
}

/// Locates and loads the config in one step.
pub fn resolve(override_path: Option<&Path>, cwd: &Path) -> Result<(PathBuf, Config), ConfigError> {
    let path = find_config_path(override_path, cwd)?;
    let config = load_config(&path)?;
    Ok((path, config))
}

pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    if contents.trim().is_empty() {
        return Err(invalid("Config is empty"));
    }
    let raw: Value = serde_yaml::from_str(contents)?;
    if raw.is_null() {
        return Err(invalid("Config is empty"));
    }

    let root = require_mapping(&raw, "root")?;
    let nodes_raw = require_mapping(get(root, "nodes"), "nodes")?;
    let defaults_raw = require_mapping(get(root, "defaults"), "defaults")?;
    if has_key(defaults_raw, "identity_file") || has_key(defaults_raw, "identities_only") {
        return Err(invalid(
            "defaults.identity_file and defaults.identities_only are not supported; use defaults.user",
        ));
    }

    let defaults_user = match get(defaults_raw, "user") {
        Value::Null => return Err(invalid("defaults.user is required")),
        Value::Mapping(_) => require_user(get(defaults_raw, "user"), "defaults.user")?,
        _ => {
            return Err(invalid(
                "defaults.user must be a mapping with name/identity_file/identities_only",
            ));
        }
    };
    let defaults = DefaultsConfig {
        port: require_port(get(defaults_raw, "port"), "defaults.port", DEFAULT_PORT)?,
        user: defaults_user,
        ssh_options: require_ssh_options(get(defaults_raw, "ssh_options"), "defaults.ssh_options")?
            .unwrap_or_default(),
        listing: require_listing(get(defaults_raw, "listing"), "defaults.listing")?,
    };

    let mut nodes = BTreeMap::new();
    let mut vm_index: BTreeMap<String, (String, u32)> = BTreeMap::new();

    for (key, node_data) in nodes_raw {
        let node_name = match key.as_str() {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => return Err(invalid("Node names must be non-empty strings")),
        };
        let label = format!("nodes.{node_name}");
        let node_map = require_mapping(node_data, &label)?;
        if has_key(node_map, "identity_file") || has_key(node_map, "identities_only") {
            return Err(invalid(format!(
                "{label} uses deprecated keys identity_file/identities_only; \
                 use user.name/user.identity_file/user.identities_only"
            )));
        }

        let host = require_str(get(node_map, "host"), &format!("{label}.host"))?;
        let user = match get(node_map, "user") {
            Value::Null => defaults.user.clone(),
            Value::Mapping(_) => require_user(get(node_map, "user"), &format!("{label}.user"))?,
            _ => {
                return Err(invalid(format!(
                    "{label}.user must be a mapping with name/identity_file/identities_only"
                )));
            }
        };
        let port = require_port(get(node_map, "port"), &format!("{label}.port"), defaults.port)?;
        let ssh_options = require_ssh_options(
            get(node_map, "ssh_options"),
            &format!("{label}.ssh_options"),
        )?
        .unwrap_or_else(|| defaults.ssh_options.clone());
        let vms = require_guests(get(node_map, "vms"), &format!("{label}.vms"), "VM")?;
        let lxcs = require_guests(get(node_map, "lxcs"), &format!("{label}.lxcs"), "LXC")?;

        for (vm_name, vmid) in &vms {
            if let Some((prev_node, _)) = vm_index.get(vm_name) {
                return Err(invalid(format!(
                    "VM name '{vm_name}' is duplicated in nodes '{prev_node}' and '{node_name}'"
                )));
            }
            vm_index.insert(vm_name.clone(), (node_name.clone(), *vmid));
        }

        nodes.insert(
            node_name.clone(),
            NodeConfig {
                name: node_name,
                host,
                port,
                user,
                ssh_options,
                vms,
                lxcs,
            },
        );
    }

    if nodes.is_empty() {
        return Err(invalid("No nodes configured"));
    }

    Ok(Config {
        nodes,
        vm_index,
        defaults,
    })
}

/// Expands a leading `~` to the current user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

static NULL: Value = Value::Null;

fn get<'a>(map: &'a Mapping, key: &str) -> &'a Value {
    map.get(key).unwrap_or(&NULL)
}

fn has_key(map: &Mapping, key: &str) -> bool {
    map.contains_key(key)
}

fn require_mapping<'a>(value: &'a Value, label: &str) -> Result<&'a Mapping, ConfigError> {
    value
        .as_mapping()
        .ok_or_else(|| invalid(format!("{label} must be a mapping")))
}

fn require_str(value: &Value, label: &str) -> Result<String, ConfigError> {
    match value.as_str() {
        Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
        _ => Err(invalid(format!("{label} must be a non-empty string"))),
    }
}

fn require_bool(value: &Value, label: &str) -> Result<bool, ConfigError> {
    match value {
        Value::Null => Ok(false),
        Value::Bool(b) => Ok(*b),
        _ => Err(invalid(format!("{label} must be a boolean"))),
    }
}

fn require_port(value: &Value, label: &str, default: u16) -> Result<u16, ConfigError> {
    match value {
        Value::Null => Ok(default),
        Value::Number(n) if n.is_i64() || n.is_u64() => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p > 0)
            .ok_or_else(|| invalid(format!("{label} must be between 1 and 65535"))),
        _ => Err(invalid(format!("{label} must be an integer"))),
    }
}

fn require_listing(value: &Value, label: &str) -> Result<ListingStrategy, ConfigError> {
    match value {
        Value::Null => Ok(ListingStrategy::default()),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(ListingStrategy::Sequential),
            "bundled" => Ok(ListingStrategy::Bundled),
            _ => Err(invalid(format!(
                "{label} must be one of: sequential, bundled"
            ))),
        },
        _ => Err(invalid(format!("{label} must be one of: sequential, bundled"))),
    }
}

fn require_ssh_options(value: &Value, label: &str) -> Result<Option<Vec<String>>, ConfigError> {
    let items = match value {
        Value::Null => return Ok(None),
        Value::Sequence(items) => items,
        _ => return Err(invalid(format!("{label} must be a list"))),
    };
    items
        .iter()
        .map(|item| match item.as_str() {
            Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
            _ => Err(invalid(format!("{label} entries must be non-empty strings"))),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn require_user(value: &Value, label: &str) -> Result<UserConfig, ConfigError> {
    let user = require_mapping(value, label)?;
    let name = require_str(get(user, "name"), &format!("{label}.name"))?;
    let identity_file = require_str(get(user, "identity_file"), &format!("{label}.identity_file"))?;
    let identities_only = require_bool(
        get(user, "identities_only"),
        &format!("{label}.identities_only"),
    )?;
    Ok(UserConfig {
        name,
        identity_file: expand_home(&identity_file),
        identities_only,
    })
}

fn require_guests(
    value: &Value,
    label: &str,
    kind: &str,
) -> Result<BTreeMap<String, u32>, ConfigError> {
    if value.is_null() {
        return Ok(BTreeMap::new());
    }
    let guests = require_mapping(value, label)?;
    let mut normalized = BTreeMap::new();
    for (key, id) in guests {
        let name = match key.as_str() {
            Some(name) if !name.trim().is_empty() => name,
            _ => return Err(invalid(format!("{label} keys must be non-empty strings"))),
        };
        let id = match id {
            Value::Number(n) if n.is_i64() || n.is_u64() => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| invalid(format!("{kind} id for '{name}' is out of range")))?,
            _ => return Err(invalid(format!("{kind} id for '{name}' must be an integer"))),
        };
        normalized.insert(name.to_string(), id);
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};
    use tempfile::tempdir;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    const SAMPLE: &str = r#"
defaults:
  port: 22
  user:
    name: root
    identity_file: /keys/id_ed25519
    identities_only: true
  ssh_options:
    - ConnectTimeout=5
nodes:
  alpha:
    host: 10.0.0.1
    vms:
      web: 101
    lxcs:
      db: 201
  beta:
    host: beta.lan
    port: 2222
    user:
      name: admin
      identity_file: /keys/beta
    ssh_options: ["-4"]
    vms:
      cache: 102
"#;

    fn expect_invalid(contents: &str, needle: &str) {
        let err = parse_config(contents).unwrap_err();
        assert!(
            err.to_string().contains(needle),
            "expected `{needle}` in `{err}`"
        );
    }

    #[test]
    fn parses_nodes_and_inherits_defaults() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.nodes.len(), 2);

        let alpha = &config.nodes["alpha"];
        assert_eq!(alpha.port, 22);
        assert_eq!(alpha.user.name, "root");
        assert!(alpha.user.identities_only);
        assert_eq!(alpha.ssh_options, vec!["ConnectTimeout=5".to_string()]);
        assert_eq!(alpha.vms["web"], 101);
        assert_eq!(alpha.lxcs["db"], 201);

        let beta = &config.nodes["beta"];
        assert_eq!(beta.port, 2222);
        assert_eq!(beta.user.name, "admin");
        assert!(!beta.user.identities_only);
        assert_eq!(beta.ssh_options, vec!["-4".to_string()]);
        assert!(beta.lxcs.is_empty());

        assert_eq!(config.vm_index["web"], ("alpha".to_string(), 101));
        assert_eq!(config.vm_index["cache"], ("beta".to_string(), 102));
        assert_eq!(config.defaults.listing, ListingStrategy::Sequential);
    }

    #[test]
    fn rejects_duplicate_vm_names_across_nodes() {
        let contents = r#"
defaults:
  user: {name: root, identity_file: /k}
nodes:
  alpha: {host: a, vms: {web: 101}}
  beta: {host: b, vms: {web: 102}}
"#;
        expect_invalid(
            contents,
            "VM name 'web' is duplicated in nodes 'alpha' and 'beta'",
        );
    }

    #[test]
    fn rejects_deprecated_flat_identity_keys() {
        let in_defaults = r#"
defaults:
  identity_file: /k
  user: {name: root, identity_file: /k}
nodes:
  alpha: {host: a}
"#;
        expect_invalid(in_defaults, "use defaults.user");

        let in_node = r#"
defaults:
  user: {name: root, identity_file: /k}
nodes:
  alpha: {host: a, identities_only: true}
"#;
        expect_invalid(in_node, "nodes.alpha uses deprecated keys");
    }

    #[test]
    fn reports_type_errors_with_field_labels() {
        expect_invalid("", "Config is empty");
        expect_invalid("defaults: {}\nnodes: {}\n", "defaults.user is required");
        expect_invalid(
            "defaults:\n  user: root\nnodes: {}\n",
            "defaults.user must be a mapping",
        );
        expect_invalid(
            "defaults:\n  user: {name: root, identity_file: /k}\nnodes: {}\n",
            "No nodes configured",
        );
        expect_invalid(
            "defaults:\n  user: {name: root, identity_file: /k}\nnodes:\n  a: {host: x, port: ssh}\n",
            "nodes.a.port must be an integer",
        );
        expect_invalid(
            "defaults:\n  user: {name: root, identity_file: /k}\nnodes:\n  a: {host: '  '}\n",
            "nodes.a.host must be a non-empty string",
        );
        expect_invalid(
            "defaults:\n  user: {name: root, identity_file: /k, identities_only: 'yes'}\nnodes:\n  a: {host: x}\n",
            "defaults.user.identities_only must be a boolean",
        );
        expect_invalid(
            "defaults:\n  user: {name: root, identity_file: /k}\nnodes:\n  a: {host: x, vms: {web: abc}}\n",
            "VM id for 'web' must be an integer",
        );
        expect_invalid(
            "defaults:\n  user: {name: root, identity_file: /k}\nnodes:\n  a: {host: x, ssh_options: ['']}\n",
            "nodes.a.ssh_options entries must be non-empty strings",
        );
        expect_invalid(
            "defaults:\n  user: {name: root, identity_file: /k}\n  listing: parallel\nnodes:\n  a: {host: x}\n",
            "defaults.listing must be one of",
        );
    }

    #[test]
    fn invalid_yaml_is_a_config_error() {
        let err = parse_config("nodes: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
        assert!(err.to_string().starts_with("Invalid YAML"));
    }

    #[test]
    fn reads_bundled_listing_strategy() {
        let contents = "defaults:\n  user: {name: root, identity_file: /k}\n  listing: Bundled\nnodes:\n  a: {host: x}\n";
        let config = parse_config(contents).unwrap();
        assert_eq!(config.defaults.listing, ListingStrategy::Bundled);
    }

    #[test]
    fn expands_home_in_identity_file() {
        let contents = "defaults:\n  user: {name: root, identity_file: ~/.ssh/id}\nnodes:\n  a: {host: x}\n";
        let config = parse_config(contents).unwrap();
        let identity = &config.nodes["a"].user.identity_file;
        if let Some(home) = home_dir() {
            assert_eq!(identity, &home.join(".ssh/id"));
        }
    }

    #[test]
    fn override_path_must_be_a_file() {
        let dir = tempdir().unwrap();
        let err = find_config_path(Some(dir.path()), dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
        assert!(err.to_string().starts_with("Config file not found"));
    }

    #[test]
    fn prefers_project_file_over_user_dir() {
        let _guard = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let cwd = tempdir().unwrap();
        let user_dir = cwd.path().join("user");
        fs::create_dir_all(&user_dir).unwrap();
        unsafe {
            env::set_var(CONFIG_DIR_ENV, &user_dir);
        }

        fs::write(user_dir.join("config.yaml"), SAMPLE).unwrap();
        let found = find_config_path(None, cwd.path()).unwrap();
        assert_eq!(found, user_dir.join("config.yaml"));

        fs::write(cwd.path().join(LOCAL_CONFIG_FILE), SAMPLE).unwrap();
        let found = find_config_path(None, cwd.path()).unwrap();
        assert_eq!(found, cwd.path().join(LOCAL_CONFIG_FILE));

        let (path, config) = resolve(None, cwd.path()).unwrap();
        assert_eq!(path, cwd.path().join(LOCAL_CONFIG_FILE));
        assert_eq!(config.nodes.len(), 2);
    }

    #[test]
    fn errors_when_no_config_exists() {
        let _guard = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let cwd = tempdir().unwrap();
        unsafe {
            env::set_var(CONFIG_DIR_ENV, cwd.path().join("missing"));
        }
        let err = find_config_path(None, cwd.path()).unwrap_err();
        assert!(err.to_string().starts_with("No config file found. Tried:"));
        assert!(err.to_string().contains(LOCAL_CONFIG_FILE));
    }
}
