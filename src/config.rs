use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::AuditError;

pub const DEFAULT_CONFIG_FILE: &str = "on-audit.json";
pub const API_KEY_ENV: &str = "OPENNEURO_API_KEY";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub clone_base_url: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
    #[serde(default)]
    pub batch_timeout_secs: Option<u64>,
    #[serde(default)]
    pub file_ceiling: Option<usize>,
    #[serde(default)]
    pub backup_before_append: Option<bool>,
    #[serde(default)]
    pub private_sibling: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub endpoint: String,
    pub clone_base_url: String,
    pub api_key_file: PathBuf,
    pub batch_size: usize,
    pub task_timeout: Duration,
    pub batch_timeout: Duration,
    pub file_ceiling: usize,
    pub backup_before_append: bool,
    pub private_sibling: Option<String>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://openneuro.org/crn/graphql".to_string(),
            clone_base_url: "https://github.com/OpenNeuroDatasets".to_string(),
            api_key_file: PathBuf::from("api_key.txt"),
            batch_size: 50,
            task_timeout: Duration::from_secs(500),
            batch_timeout: Duration::from_secs(3600),
            file_ceiling: 900,
            backup_before_append: false,
            private_sibling: None,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, AuditError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if !config_path.exists() {
            if path.is_some() {
                return Err(AuditError::MissingConfig(config_path));
            }
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| AuditError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| AuditError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, AuditError> {
        let defaults = ResolvedConfig::default();

        let batch_size = config.batch_size.unwrap_or(defaults.batch_size);
        if batch_size == 0 {
            return Err(AuditError::ConfigParse(
                "batch_size must be at least 1".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            endpoint: config.endpoint.unwrap_or(defaults.endpoint),
            clone_base_url: config
                .clone_base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.clone_base_url),
            api_key_file: config
                .api_key_file
                .map(PathBuf::from)
                .unwrap_or(defaults.api_key_file),
            batch_size,
            task_timeout: config
                .task_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.task_timeout),
            batch_timeout: config
                .batch_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.batch_timeout),
            file_ceiling: config.file_ceiling.unwrap_or(defaults.file_ceiling),
            backup_before_append: config
                .backup_before_append
                .unwrap_or(defaults.backup_before_append),
            private_sibling: config.private_sibling.filter(|name| !name.trim().is_empty()),
        })
    }
}

pub fn workers_for_cpus(n_cpus: usize) -> usize {
    n_cpus.saturating_sub(1).max(1)
}

#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: &str) -> Result<Self, AuditError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(AuditError::MissingCredentials("empty API key".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn resolve(config: &ResolvedConfig) -> Result<Self, AuditError> {
        if let Ok(value) = std::env::var(API_KEY_ENV) {
            if !value.trim().is_empty() {
                return Self::new(&value);
            }
        }

        let mut candidates = vec![config.api_key_file.clone()];
        if let Some(dirs) = BaseDirs::new() {
            candidates.push(
                dirs.config_dir()
                    .join("openneuro-audit")
                    .join("api_key.txt"),
            );
        }

        for candidate in &candidates {
            if let Ok(content) = fs::read_to_string(candidate) {
                if let Some(line) = content.lines().next() {
                    return Self::new(line);
                }
            }
        }

        Err(AuditError::MissingCredentials(format!(
            "set {API_KEY_ENV} or create {}",
            config.api_key_file.display()
        )))
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ApiKey(***)")
    }
}
