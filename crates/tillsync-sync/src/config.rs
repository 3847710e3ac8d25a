use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ScopeRegistry {
    #[serde(default)]
    pub scopes: Vec<ScopeConfig>,
}

/// A store (or other partition) of the ledger synced as its own window.
#[derive(Debug, Clone, Deserialize)]
pub struct ScopeConfig {
    pub scope_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ScopeRegistry {
    /// Missing file means "sync unscoped".
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self { scopes: Vec::new() });
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// One entry per enabled scope, or a single unscoped entry.
    pub fn window_scopes(&self) -> Vec<Option<String>> {
        let enabled: Vec<Option<String>> = self
            .scopes
            .iter()
            .filter(|s| s.enabled)
            .map(|s| Some(s.scope_id.clone()))
            .collect();
        if enabled.is_empty() {
            vec![None]
        } else {
            enabled
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub ledger_url: String,
    pub ledger_token: Option<String>,
    pub ledger_fixture: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub recompute_chunk_size: usize,
    pub recompute_workers: usize,
    pub job_timeout: Option<Duration>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub db_max_connections: u32,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            ledger_url: "http://localhost:8087/v1".to_string(),
            ledger_token: None,
            ledger_fixture: None,
            archive_dir: None,
            scheduler_enabled: false,
            recompute_chunk_size: 1000,
            recompute_workers: 4,
            job_timeout: None,
            http_timeout_secs: 20,
            user_agent: "tillsync/0.1".to_string(),
            db_max_connections: 8,
            workspace_root: PathBuf::from("."),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            ledger_url: std::env::var("TILLSYNC_LEDGER_URL").unwrap_or(defaults.ledger_url),
            ledger_token: std::env::var("TILLSYNC_LEDGER_TOKEN").ok(),
            ledger_fixture: std::env::var("TILLSYNC_LEDGER_FIXTURE").ok().map(PathBuf::from),
            archive_dir: std::env::var("TILLSYNC_ARCHIVE_DIR").ok().map(PathBuf::from),
            scheduler_enabled: std::env::var("TILLSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            recompute_chunk_size: env_parse("TILLSYNC_RECOMPUTE_CHUNK_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.recompute_chunk_size),
            recompute_workers: env_parse("TILLSYNC_RECOMPUTE_WORKERS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.recompute_workers),
            job_timeout: env_parse::<u64>("TILLSYNC_JOB_TIMEOUT_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
            http_timeout_secs: env_parse("TILLSYNC_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("TILLSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            db_max_connections: env_parse("TILLSYNC_DB_MAX_CONNECTIONS")
                .unwrap_or(defaults.db_max_connections),
            workspace_root: std::env::var("TILLSYNC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
    }

    pub fn scope_registry_path(&self) -> PathBuf {
        self.workspace_root.join("scopes.yaml")
    }
}
