use std::path::{Path, PathBuf};

use crate::config::{
    normalize_list, render_fragment, RawConfig, RawValue, KEY_BAZEL_RC_FILE,
    KEY_DOCKER_COMPOSE_FILE, KEY_DOCKER_RUN_PRIVILEGED, KEY_ENV_VARS, KEY_PORTS, KEY_USER,
    KEY_WORKSPACE_ROOT,
};
use crate::DazelError;

/// Fully resolved settings for one invocation. Built once from the merged
/// configuration and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchProfile {
    workspace_root: Option<PathBuf>,
    ports: Vec<String>,
    env_vars: Vec<String>,
    compose_file: Option<String>,
    runtime_config_file: Option<String>,
    privileged: bool,
    run_as_user: Option<String>,
}

impl LaunchProfile {
    pub fn from_config(config: RawConfig) -> Result<Self, DazelError> {
        let workspace_root = workspace_root(config.get(KEY_WORKSPACE_ROOT))?;
        let ports = clean_entries(KEY_PORTS, normalize_list(KEY_PORTS, config.get(KEY_PORTS))?)?;
        let env_vars = clean_entries(
            KEY_ENV_VARS,
            normalize_list(KEY_ENV_VARS, config.get(KEY_ENV_VARS))?,
        )?;
        Ok(Self {
            workspace_root,
            ports,
            env_vars,
            compose_file: text_value(KEY_DOCKER_COMPOSE_FILE, config.get(KEY_DOCKER_COMPOSE_FILE))?,
            runtime_config_file: text_value(KEY_BAZEL_RC_FILE, config.get(KEY_BAZEL_RC_FILE))?,
            privileged: flag_value(
                KEY_DOCKER_RUN_PRIVILEGED,
                config.get(KEY_DOCKER_RUN_PRIVILEGED),
            )?,
            run_as_user: text_value(KEY_USER, config.get(KEY_USER))?,
        })
    }

    pub fn workspace_root(&self) -> Option<&Path> {
        self.workspace_root.as_deref()
    }

    pub fn ports(&self) -> &[String] {
        &self.ports
    }

    pub fn env_vars(&self) -> &[String] {
        &self.env_vars
    }

    pub fn runtime_config_file(&self) -> Option<&str> {
        self.runtime_config_file.as_deref()
    }

    pub fn privileged(&self) -> bool {
        self.privileged
    }

    pub fn run_as_user(&self) -> Option<&str> {
        self.run_as_user.as_deref()
    }

    /// Compose file joined onto the workspace root. Without a root the
    /// configured path is used relative to the current directory.
    pub fn compose_path(&self) -> Option<PathBuf> {
        let file = self.compose_file.as_deref()?;
        Some(match &self.workspace_root {
            Some(root) => root.join(file),
            None => PathBuf::from(file),
        })
    }

    pub fn ports_fragment(&self) -> String {
        render_fragment("-p", &self.ports)
    }

    pub fn env_fragment(&self) -> String {
        render_fragment("-e", &self.env_vars)
    }
}

fn invalid(key: &str, message: impl Into<String>) -> DazelError {
    DazelError::InvalidConfig {
        key: key.to_string(),
        message: message.into(),
    }
}

fn workspace_root(value: Option<&RawValue>) -> Result<Option<PathBuf>, DazelError> {
    let Some(root) = text_value(KEY_WORKSPACE_ROOT, value)? else {
        return Ok(None);
    };
    let root = PathBuf::from(root);
    if !root.is_dir() {
        return Err(invalid(
            KEY_WORKSPACE_ROOT,
            format!("{} is not a directory", root.display()),
        ));
    }
    Ok(Some(root))
}

fn clean_entries(key: &str, entries: Vec<String>) -> Result<Vec<String>, DazelError> {
    for entry in &entries {
        if entry.is_empty() {
            return Err(invalid(key, "contains an empty entry"));
        }
        if entry.trim() != entry {
            return Err(invalid(
                key,
                format!("entry {entry:?} has surrounding whitespace"),
            ));
        }
    }
    Ok(entries)
}

fn text_value(key: &str, value: Option<&RawValue>) -> Result<Option<String>, DazelError> {
    match value {
        None | Some(RawValue::Absent) => Ok(None),
        Some(RawValue::Text(text)) if text.is_empty() => Ok(None),
        Some(RawValue::Text(text)) => Ok(Some(text.clone())),
        Some(RawValue::Number(number)) => Ok(Some(number.to_string())),
        Some(other) => Err(invalid(key, format!("must be a string, found {}", other.shape()))),
    }
}

fn flag_value(key: &str, value: Option<&RawValue>) -> Result<bool, DazelError> {
    match value {
        None | Some(RawValue::Absent) => Ok(false),
        Some(RawValue::Flag(flag)) => Ok(*flag),
        Some(RawValue::Text(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "" | "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(
                key,
                format!("{text:?} is not a boolean (use true/false, 1/0, yes/no or on/off)"),
            )),
        },
        Some(other) => Err(invalid(key, format!("must be a boolean, found {}", other.shape()))),
    }
}
