use crate::classify::ManifestRules;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from crucible.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub results_dir: PathBuf,
    pub tasks_file: PathBuf,
    pub summary_file: PathBuf,
    pub conditions: Vec<ConditionConfig>,
    pub compare: CompareConfig,
    pub manifest: ManifestConfig,
}

/// One experimental arm: directory key under results_dir plus a human label.
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionConfig {
    pub key: String,
    #[serde(default)]
    pub label: String,
}

/// Which two conditions the delta table compares.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CompareConfig {
    pub baseline: String,
    pub treatment: String,
}

/// Manifest-detection rules; see ManifestRules for the matching semantics.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    pub marker: String,
    pub probe_prefixes: Vec<String>,
    pub probe_keywords: Vec<String>,
}

// --- Default implementations ---

impl Default for Config {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            tasks_file: PathBuf::from("tasks.json"),
            summary_file: PathBuf::from("results/summary.json"),
            conditions: vec![
                ConditionConfig {
                    key: "A".to_string(),
                    label: "vanilla".to_string(),
                },
                ConditionConfig {
                    key: "B".to_string(),
                    label: "fmm".to_string(),
                },
            ],
            compare: CompareConfig::default(),
            manifest: ManifestConfig::default(),
        }
    }
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            baseline: "A".to_string(),
            treatment: "B".to_string(),
        }
    }
}

impl Default for ManifestConfig {
    fn default() -> Self {
        let rules = ManifestRules::default();
        Self {
            marker: rules.marker,
            probe_prefixes: rules.probe_prefixes,
            probe_keywords: rules.probe_keywords,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing file means defaults;
    /// an unreadable or invalid file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Condition keys in configured order.
    pub fn condition_keys(&self) -> Vec<String> {
        self.conditions.iter().map(|c| c.key.clone()).collect()
    }

    /// Human label for a condition key; the key itself if unlabeled.
    pub fn label_for<'a>(&'a self, key: &'a str) -> &'a str {
        self.conditions
            .iter()
            .find(|c| c.key == key)
            .map(|c| c.label.as_str())
            .filter(|l| !l.is_empty())
            .unwrap_or(key)
    }

    /// Manifest-detection rules from the config section.
    pub fn manifest_rules(&self) -> ManifestRules {
        ManifestRules {
            marker: self.manifest.marker.clone(),
            probe_prefixes: self.manifest.probe_prefixes.clone(),
            probe_keywords: self.manifest.probe_keywords.clone(),
        }
    }
}

/// Errors from loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}
