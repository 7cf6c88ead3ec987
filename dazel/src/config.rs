use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::DazelError;

pub const WORKSPACE_MARKER: &str = "WORKSPACE";
pub const CONFIG_FILENAME: &str = ".dazelrc";
pub const ENV_PREFIX: &str = "DAZEL_";

pub const KEY_WORKSPACE_ROOT: &str = "WORKSPACE_ROOT";
pub const KEY_PORTS: &str = "PORTS";
pub const KEY_ENV_VARS: &str = "ENV_VARS";
pub const KEY_DOCKER_COMPOSE_FILE: &str = "DOCKER_COMPOSE_FILE";
pub const KEY_BAZEL_RC_FILE: &str = "BAZEL_RC_FILE";
pub const KEY_DOCKER_RUN_PRIVILEGED: &str = "DOCKER_RUN_PRIVILEGED";
pub const KEY_USER: &str = "USER";

/// Merged configuration keyed by the unprefixed key name.
pub type RawConfig = BTreeMap<String, RawValue>;

/// A configuration value as it appeared in `.dazelrc` or the environment,
/// before any key-specific interpretation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Absent,
    Flag(bool),
    Number(serde_yaml::Number),
    Text(String),
    List(Vec<RawScalar>),
    Unsupported(serde_yaml::Value),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawScalar {
    Text(String),
    Number(serde_yaml::Number),
}

impl RawValue {
    #[cfg(test)]
    pub fn text(value: impl Into<String>) -> Self {
        RawValue::Text(value.into())
    }

    #[cfg(test)]
    pub fn list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RawValue::List(items.into_iter().map(|s| RawScalar::Text(s.into())).collect())
    }

    pub fn shape(&self) -> &'static str {
        match self {
            RawValue::Absent => "null",
            RawValue::Flag(_) => "a boolean",
            RawValue::Number(_) => "a number",
            RawValue::Text(_) => "a string",
            RawValue::List(_) => "a list",
            RawValue::Unsupported(serde_yaml::Value::Mapping(_)) => "a mapping",
            RawValue::Unsupported(serde_yaml::Value::Sequence(_)) => "a list with non-string items",
            RawValue::Unsupported(serde_yaml::Value::Tagged(_)) => "a tagged value",
            RawValue::Unsupported(_) => "an unsupported value",
        }
    }
}

impl RawScalar {
    fn to_text(&self) -> String {
        match self {
            RawScalar::Text(text) => text.clone(),
            RawScalar::Number(number) => number.to_string(),
        }
    }
}

/// Finds the workspace root above the current directory. A current
/// directory that cannot be resolved (e.g. deleted) has no workspace.
pub fn locate_workspace() -> Option<PathBuf> {
    locate_workspace_from_cwd(env::current_dir())
}

fn locate_workspace_from_cwd(cwd: io::Result<PathBuf>) -> Option<PathBuf> {
    let cwd = cwd.and_then(fs::canonicalize).ok()?;
    locate_workspace_from(&cwd)
}

/// Walks from `start` up to the filesystem root and returns the first
/// directory holding the workspace marker.
pub fn locate_workspace_from(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(WORKSPACE_MARKER).is_file())
        .map(Path::to_path_buf)
}

/// Resolves the merged configuration for this invocation. Values from
/// `DAZEL_*` environment variables override the ones from `.dazelrc`.
pub fn resolve() -> Result<RawConfig, DazelError> {
    let root = locate_workspace();
    let mut config = config_from_file(root.as_deref())?;
    config.extend(config_from_env(env::vars_os()));
    Ok(config)
}

pub fn config_from_file(root: Option<&Path>) -> Result<RawConfig, DazelError> {
    let mut config = RawConfig::new();
    let root_text = root
        .map(|path| path.to_string_lossy().to_string())
        .unwrap_or_default();
    config.insert(KEY_WORKSPACE_ROOT.to_string(), RawValue::Text(root_text));

    let Some(root) = root else {
        return Ok(config);
    };
    let path = root.join(CONFIG_FILENAME);
    if !path.is_file() {
        return Ok(config);
    }
    let content = fs::read_to_string(&path).map_err(|source| DazelError::ConfigRead {
        path: path.clone(),
        source,
    })?;
    config.extend(parse_config_file(&path, &content)?);
    Ok(config)
}

pub fn parse_config_file(path: &Path, content: &str) -> Result<RawConfig, DazelError> {
    let syntax = |message: String| DazelError::ConfigSyntax {
        path: path.to_path_buf(),
        message,
    };

    let blank = content.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#')
    });
    if blank {
        return Ok(RawConfig::new());
    }

    let document: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|err| syntax(err.to_string()))?;
    if document.is_null() {
        return Ok(RawConfig::new());
    }
    let entries: BTreeMap<String, RawValue> =
        serde_yaml::from_value(document).map_err(|err| {
            syntax(format!("expected a mapping of configuration keys ({err})"))
        })?;

    let mut config = RawConfig::new();
    for (key, value) in entries {
        let canonical = canonical_key(&key).to_string();
        if config.contains_key(&canonical) {
            return Err(DazelError::InvalidConfig {
                key: canonical.clone(),
                message: format!(
                    "set twice in {} (as both {canonical} and {ENV_PREFIX}{canonical})",
                    path.display()
                ),
            });
        }
        config.insert(canonical, value);
    }
    Ok(config)
}

/// Collects `DAZEL_<KEY>` variables as `<KEY>`. Non-unicode entries are skipped.
pub fn config_from_env<I>(vars: I) -> RawConfig
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)))
        .filter_map(|(name, value)| {
            let key = name.strip_prefix(ENV_PREFIX)?;
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), RawValue::Text(value)))
        })
        .collect()
}

fn canonical_key(key: &str) -> &str {
    match key.strip_prefix(ENV_PREFIX) {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => key,
    }
}

/// Turns a comma-separated string or a list into an ordered list of entries.
///
/// Strings are split on commas and every piece is trimmed; list items are
/// taken as written. Empty and absent values yield an empty list.
pub fn normalize_list(key: &str, value: Option<&RawValue>) -> Result<Vec<String>, DazelError> {
    match value {
        None | Some(RawValue::Absent) => Ok(Vec::new()),
        Some(RawValue::Text(text)) if text.is_empty() => Ok(Vec::new()),
        Some(RawValue::Text(text)) => Ok(text.split(',').map(|entry| entry.trim().to_string()).collect()),
        Some(RawValue::List(items)) => Ok(items.iter().map(RawScalar::to_text).collect()),
        Some(other) => Err(DazelError::InvalidConfig {
            key: key.to_string(),
            message: format!(
                "must be a comma-separated string or a list of strings, found {}",
                other.shape()
            ),
        }),
    }
}

/// Renders entries as repeated `<flag> "<entry>"` tokens.
pub fn render_fragment(flag: &str, entries: &[String]) -> String {
    entries
        .iter()
        .map(|entry| format!("{flag} \"{entry}\""))
        .collect::<Vec<_>>()
        .join(" ")
}
