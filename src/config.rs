use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_LOG_FILTER: &str = "gradebookd=info";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub cache_ttl: Duration,
    pub log_filter: String,
    /// Workspace opened at startup, before any `workspace.select`.
    pub workspace: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            workspace: None,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();
        if let Some(raw) = lookup("GRADEBOOKD_CACHE_TTL_MS") {
            let ms: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("GRADEBOOKD_CACHE_TTL_MS must be milliseconds, got {raw:?}"))?;
            cfg.cache_ttl = Duration::from_millis(ms);
        }
        if let Some(filter) = lookup("GRADEBOOKD_LOG").filter(|s| !s.trim().is_empty()) {
            cfg.log_filter = filter;
        }
        cfg.workspace = lookup("GRADEBOOKD_WORKSPACE")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
        Ok(cfg)
    }
}
