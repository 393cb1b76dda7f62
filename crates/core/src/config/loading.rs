use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::keys;
use super::types::{NodeConfig, ShareTieBreak, SharingPolicy, StaticPartition};

/// Prefix for environment overrides: `SGPU_NUM_GPU` replaces `NUM_GPU`.
pub const ENV_PREFIX: &str = "SGPU_";

const DEFAULT_LOCK_DIR: &str = "/tmp/sgpu";
const DEFAULT_NAMESPACE: &str = "sgpu";

impl NodeConfig {
    /// Load config from a file path, with `SGPU_*` overrides taken from the
    /// process environment.
    ///
    /// A missing file is reported as [`ConfigError::FileNotFound`], distinct
    /// from a file that lacks a required key.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_env(path, std::env::vars())
    }

    /// Load config from a file path, with overrides taken from `vars` only.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse_with_env(&content, vars)
    }

    /// Parse config text, then apply overrides from the process environment.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Self::parse_with_env(content, std::env::vars())
    }

    /// Parse config text, then apply `SGPU_*` overrides found in `vars`.
    pub fn parse_with_env(
        content: &str,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, ConfigError> {
        let mut raw = parse_pairs(content)?;
        apply_env_overrides(&mut raw, vars);
        Self::from_pairs(&raw)
    }

    /// Build a config from already-split key/value pairs.
    pub fn from_pairs(raw: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let ranks_per_node = required_count(raw, keys::MPI_TASKS_PER_NODE)?;
        let device_count = required_count(raw, keys::NUM_GPU)?;

        let policy = if optional_flag(raw, keys::USE_SHARED)? {
            SharingPolicy::Shared(optional_parsed::<ShareTieBreak>(raw, keys::SHARE_TIE_BREAK)?)
        } else {
            SharingPolicy::Static(optional_parsed::<StaticPartition>(raw, keys::STATIC_PARTITION)?)
        };

        let mut affinities = BTreeMap::new();
        for (key, value) in raw {
            if let Some(idx) = key.strip_prefix(keys::GPU_CPUS_AFF_PREFIX) {
                let device: usize = idx.parse().map_err(|_| invalid(key, value))?;
                if device >= device_count {
                    tracing::warn!(device, device_count, "affinity given for a device beyond NUM_GPU");
                }
                affinities.insert(device, value.clone());
            }
        }

        Ok(Self {
            ranks_per_node,
            device_count,
            policy,
            use_gpu_blas: optional_flag(raw, keys::USE_GPU_BLAS)?,
            use_gpu_conv: optional_flag(raw, keys::USE_GPU_CONV)?,
            affinities,
            lock_dir: raw
                .get(keys::LOCK_DIR)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCK_DIR)),
            lock_namespace: raw
                .get(keys::LOCK_NAMESPACE)
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            dispatch_threads: optional_usize(raw, keys::DISPATCH_THREADS)?.unwrap_or(0),
        })
    }

    /// Ensure `rank` is one of this node's local ranks.
    pub fn validate_rank(&self, rank: usize) -> Result<(), ConfigError> {
        if rank >= self.ranks_per_node {
            return Err(ConfigError::RankOutOfRange {
                rank,
                ranks_per_node: self.ranks_per_node,
            });
        }
        Ok(())
    }
}

/// Split `KEY=value` lines. Comments and blank lines are skipped.
pub(crate) fn parse_pairs(content: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut pairs = BTreeMap::new();
    for item in dotenvy::from_read_iter(content.as_bytes()) {
        let (key, value) = item.map_err(|e| ConfigError::Parse(e.to_string()))?;
        pairs.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(pairs)
}

/// Apply `SGPU_<KEY>` overrides for recognised keys.
pub(crate) fn apply_env_overrides(
    raw: &mut BTreeMap<String, String>,
    vars: impl IntoIterator<Item = (String, String)>,
) {
    for (name, value) in vars {
        let Some(key) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        if keys::is_known(key) {
            tracing::debug!(key, "config key overridden from environment");
            raw.insert(key.to_string(), value);
        }
    }
}

// ── Typed accessors ─────────────────────────────────────────────────

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn required_count(raw: &BTreeMap<String, String>, key: &str) -> Result<usize, ConfigError> {
    let value = raw
        .get(key)
        .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))?;
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(key, value)),
    }
}

fn optional_usize(raw: &BTreeMap<String, String>, key: &str) -> Result<Option<usize>, ConfigError> {
    match raw.get(key) {
        None => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|_| invalid(key, v)),
    }
}

fn optional_flag(raw: &BTreeMap<String, String>, key: &str) -> Result<bool, ConfigError> {
    match raw.get(key).map(String::as_str) {
        None | Some("0") => Ok(false),
        Some("1") => Ok(true),
        Some(other) => Err(invalid(key, other)),
    }
}

fn optional_parsed<T>(raw: &BTreeMap<String, String>, key: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + Default,
{
    match raw.get(key) {
        None => Ok(T::default()),
        Some(v) => v.parse().map_err(|_| invalid(key, v)),
    }
}
