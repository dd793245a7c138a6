use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use bcf_adapters::{ParsePolicy, SnapshotLayout};
use bcf_core::{CategoryTable, CategoryTableFile};
use bcf_storage::{FetchConfig, RetryPolicy};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    /// Newest archive directories kept under `artifacts_dir`; zero keeps all.
    pub archive_retention: usize,
    pub workspace_root: PathBuf,
    pub webhook_secret: Option<String>,
    pub poll_interval: Duration,
    pub download_timeout: Duration,
    pub max_snapshot_bytes: u64,
    pub recompute_chunk_size: usize,
    pub max_rejected_row_fraction: f64,
    pub max_rule_failure_fraction: f64,
    pub propagate_candidate_changes: bool,
    pub scheduler_enabled: bool,
    pub full_recompute_cron: String,
    pub web_port: u16,
    pub user_agent: String,
    pub cache_max_entries: usize,
    pub layout: SnapshotLayout,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://bcf.db".to_string(),
            artifacts_dir: PathBuf::from("./artifacts"),
            archive_retention: 7,
            workspace_root: PathBuf::from("."),
            webhook_secret: None,
            poll_interval: Duration::from_secs(120),
            download_timeout: Duration::from_secs(300),
            max_snapshot_bytes: 64 * 1024 * 1024,
            recompute_chunk_size: 50,
            max_rejected_row_fraction: 0.05,
            max_rule_failure_fraction: 0.10,
            propagate_candidate_changes: true,
            scheduler_enabled: false,
            full_recompute_cron: "0 0 3 * * *".to_string(),
            web_port: 8000,
            user_agent: "bcf-sync/0.1".to_string(),
            cache_max_entries: 1024,
            layout: SnapshotLayout::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            archive_retention: env_parse("BCF_ARCHIVE_RETENTION")
                .unwrap_or(defaults.archive_retention),
            workspace_root: std::env::var("BCF_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            webhook_secret: std::env::var("BCF_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            poll_interval: env_parse("BCF_POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            download_timeout: env_parse("BCF_DOWNLOAD_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.download_timeout),
            max_snapshot_bytes: env_parse("BCF_MAX_SNAPSHOT_BYTES")
                .unwrap_or(defaults.max_snapshot_bytes),
            recompute_chunk_size: env_parse::<usize>("BCF_RECOMPUTE_CHUNK_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.recompute_chunk_size),
            max_rejected_row_fraction: env_parse("BCF_MAX_REJECTED_ROW_FRACTION")
                .unwrap_or(defaults.max_rejected_row_fraction),
            max_rule_failure_fraction: env_parse("BCF_MAX_RULE_FAILURE_FRACTION")
                .unwrap_or(defaults.max_rule_failure_fraction),
            propagate_candidate_changes: env_flag("BCF_PROPAGATE_CANDIDATE_CHANGES")
                .unwrap_or(defaults.propagate_candidate_changes),
            scheduler_enabled: env_flag("BCF_SCHEDULER_ENABLED")
                .unwrap_or(defaults.scheduler_enabled),
            full_recompute_cron: std::env::var("BCF_FULL_RECOMPUTE_CRON")
                .unwrap_or(defaults.full_recompute_cron),
            web_port: env_parse("BCF_WEB_PORT").unwrap_or(defaults.web_port),
            user_agent: std::env::var("BCF_USER_AGENT").unwrap_or(defaults.user_agent),
            cache_max_entries: env_parse("BCF_CACHE_MAX_ENTRIES")
                .unwrap_or(defaults.cache_max_entries),
            layout: defaults.layout,
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            deadline: self.download_timeout,
            max_bytes: self.max_snapshot_bytes,
            user_agent: Some(self.user_agent.clone()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn parse_policy(&self) -> ParsePolicy {
        ParsePolicy {
            max_rejected_fraction: self.max_rejected_row_fraction,
        }
    }

    /// The built-in category table, unless `rules/categories.yaml` exists under the workspace root.
    pub fn category_table(&self) -> anyhow::Result<CategoryTable> {
        load_category_table(&self.workspace_root)
    }
}

pub fn load_category_table(workspace_root: &Path) -> anyhow::Result<CategoryTable> {
    let path = workspace_root.join("rules/categories.yaml");
    if !path.exists() {
        return Ok(CategoryTable::builtin());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: CategoryTableFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(CategoryTable::from_file(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcf_core::Category;

    #[test]
    fn missing_rules_file_falls_back_to_builtin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = load_category_table(dir.path()).expect("table");
        assert_eq!(table, CategoryTable::builtin());
    }

    #[test]
    fn rules_file_replaces_the_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("rules")).expect("mkdir");
        std::fs::write(
            dir.path().join("rules/categories.yaml"),
            "version: 1\npairs:\n  - source: Showers\n    targets: [Shower Doors, Walls]\n",
        )
        .expect("write");

        let table = load_category_table(dir.path()).expect("table");
        assert_eq!(
            table.targets_for(Category::Showers),
            &[Category::ShowerDoors, Category::Walls]
        );
        assert!(!table.is_source(Category::ShowerBases));
    }

    #[test]
    fn workspace_rules_file_matches_builtin() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let table = load_category_table(&root).expect("table");
        assert_eq!(table, CategoryTable::builtin());
    }
}
