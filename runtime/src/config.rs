//! Runtime configuration: `<state_dir>/config.toml` layered with `COWORKER_*`
//! environment overrides, plus the allowed-roots assembly that turns
//! configuration and per-task metadata into a [`Policy`].
//!
//! Grounded in `coworker/config.py`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use coworker_types::Policy;
use serde::Deserialize;

/// Runtime-wide configuration, loaded from `<state_dir>/config.toml` and
/// overridden one field at a time by `COWORKER_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoworkerConfig {
    pub state_dir: PathBuf,
    pub allowed_paths: Vec<PathBuf>,
    pub max_read_bytes: u64,
    pub max_write_bytes: u64,
    pub web_max_bytes: u64,
    pub web_max_query_chars: usize,
    pub require_approval: bool,
    pub web_enabled: bool,
    pub web_allowlist: Vec<String>,
    pub poll_seconds: u64,
    pub worker_count: usize,
}

impl Default for CoworkerConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            allowed_paths: Vec::new(),
            max_read_bytes: 200_000,
            max_write_bytes: 200_000,
            web_max_bytes: 200_000,
            web_max_query_chars: 256,
            require_approval: true,
            web_enabled: false,
            web_allowlist: Vec::new(),
            poll_seconds: 2,
            worker_count: 1,
        }
    }
}

impl CoworkerConfig {
    /// Assemble a [`Policy`] from this configuration plus per-task roots.
    ///
    /// Allowed roots are built from three sources, in order, then
    /// de-duplicated by canonical string form, preserving first-seen order:
    /// configured `allowed_paths`, the parents of `selected_paths` (a file
    /// contributes its parent, a directory contributes itself), and
    /// caller-supplied `extra_roots` (e.g. task metadata `allow_roots`).
    #[must_use]
    pub fn build_policy(&self, selected_paths: &[PathBuf], extra_roots: &[PathBuf]) -> Policy {
        let mut roots = Vec::new();
        roots.extend(self.allowed_paths.iter().cloned());
        for path in selected_paths {
            let root = if path.is_dir() { path.clone() } else { path.parent().map(Path::to_path_buf).unwrap_or_else(|| path.clone()) };
            roots.push(root);
        }
        roots.extend(extra_roots.iter().cloned());

        let mut seen = HashSet::new();
        let deduped: Vec<PathBuf> = roots
            .into_iter()
            .filter(|root| {
                let canonical = std::fs::canonicalize(root).unwrap_or_else(|_| root.clone());
                seen.insert(canonical.to_string_lossy().into_owned())
            })
            .collect();

        Policy {
            allowed_roots: deduped,
            max_read_bytes: self.max_read_bytes,
            max_write_bytes: self.max_write_bytes,
            max_web_bytes: self.web_max_bytes,
            max_query_chars: self.web_max_query_chars,
            require_approval: self.require_approval,
            web_enabled: self.web_enabled,
            web_allowlist: self.web_allowlist.clone(),
        }
    }
}

#[must_use]
pub fn default_state_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("coworker")
}

/// Load configuration: `<state_dir>/config.toml` (if present) layered with
/// `COWORKER_*` environment overrides. A malformed config file is a hard
/// error; a missing one falls back to built-in defaults.
///
/// `explicit_state_dir` takes precedence over both the config file and
/// `COWORKER_STATE_DIR`/`COWORKER_RUNTIME_STATE_DIR` when given.
pub fn load_config(explicit_state_dir: Option<&Path>) -> Result<CoworkerConfig> {
    let state_dir = explicit_state_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("COWORKER_RUNTIME_STATE_DIR").ok().map(PathBuf::from))
        .or_else(|| std::env::var("COWORKER_STATE_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_state_dir);

    let config_path = state_dir.join("config.toml");
    let mut config = if config_path.exists() {
        let text = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file: {}", config_path.display()))?;
        toml::from_str::<CoworkerConfig>(&text)
            .with_context(|| format!("malformed config file: {}", config_path.display()))?
    } else {
        CoworkerConfig::default()
    };

    config.state_dir = state_dir;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Whether `coworker-runtime` subcommands are permitted to run at all.
/// Controlled by `COWORKER_RUNTIME_ENABLED`; unset or any value other than
/// `"0"`/`"false"` means enabled.
#[must_use]
pub fn runtime_enabled() -> bool {
    match std::env::var("COWORKER_RUNTIME_ENABLED") {
        Ok(value) => !matches!(value.trim(), "0" | "false"),
        Err(_) => true,
    }
}

fn apply_env_overrides(config: &mut CoworkerConfig) -> Result<()> {
    if let Some(dir) = env_path("COWORKER_RUNTIME_STATE_DIR").or_else(|| env_path("COWORKER_STATE_DIR")) {
        config.state_dir = dir;
    }
    if let Ok(paths) = std::env::var("COWORKER_ALLOWED_PATHS") {
        config.allowed_paths = split_paths(&paths);
    }
    if let Some(v) = env_u64("COWORKER_MAX_READ_BYTES")? {
        config.max_read_bytes = v;
    }
    if let Some(v) = env_u64("COWORKER_MAX_WRITE_BYTES")? {
        config.max_write_bytes = v;
    }
    if let Some(v) = env_u64("COWORKER_WEB_MAX_BYTES")? {
        config.web_max_bytes = v;
    }
    if let Some(v) = env_usize("COWORKER_WEB_MAX_QUERY_CHARS")? {
        config.web_max_query_chars = v;
    }
    if let Some(v) = env_bool("COWORKER_REQUIRE_APPROVAL")? {
        config.require_approval = v;
    }
    if let Some(v) = env_bool("COWORKER_WEB_ENABLED")? {
        config.web_enabled = v;
    }
    if let Ok(list) = std::env::var("COWORKER_WEB_ALLOWLIST") {
        config.web_allowlist = list.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect();
    }
    if let Some(v) = env_u64("COWORKER_POLL_SECONDS")? {
        config.poll_seconds = v;
    }
    if let Some(v) = env_usize("COWORKER_WORKER_COUNT")? {
        config.worker_count = v;
    }
    Ok(())
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn split_paths(value: &str) -> Vec<PathBuf> {
    value.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect()
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(value) => value.trim().parse().map(Some).with_context(|| format!("{key} must be a non-negative integer")),
        Err(_) => Ok(None),
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(value) => value.trim().parse().map(Some).with_context(|| format!("{key} must be a non-negative integer")),
        Err(_) => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(value) => match value.trim() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            other => bail!("{key} must be a boolean, got '{other}'"),
        },
        Err(_) => Ok(None),
    }
}
