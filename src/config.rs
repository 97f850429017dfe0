//! Configuration management for crawl-access using the prefer crate.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::access::PlanLayer;
use crate::escalation::QueueSettings;

/// Default worker pool size for `fetch`.
pub const DEFAULT_JOBS: usize = 4;

/// Default per-attempt transport timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 30;

const QUEUE_FILE: &str = "manual_queue.json";
const STRATEGY_CACHE_FILE: &str = "strategy_cache.json";
const ATTEMPT_LOG_FILE: &str = "attempts.jsonl";
const RECORDS_FILE: &str = "records.jsonl";
const SUMMARY_FILE: &str = "run_summary.json";
const PLAYBOOK_FILE: &str = "playbooks.yaml";
const RECON_CACHE_FILE: &str = "recon_cache.json";
const RULES_FILE: &str = "classifier_rules.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },
}

/// Application settings, fully resolved.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    pub queue_file: PathBuf,
    pub strategy_cache_file: PathBuf,
    pub attempt_log_file: PathBuf,
    pub records_file: PathBuf,
    pub summary_file: PathBuf,
    pub playbook_file: PathBuf,
    pub recon_cache_file: PathBuf,
    pub rules_file: PathBuf,
    /// User agent mode: None for the crawler UA, "impersonate", or a literal.
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    /// Request timeout in seconds.
    pub request_timeout: u64,
    pub jobs: usize,
    /// Remote DevTools endpoint for browser strategies.
    pub browser_url: Option<String>,
    pub strategy_cache_max_age_days: i64,
    /// System-defaults layer of the access plan.
    pub plan_defaults: PlanLayer,
    pub queue: QueueSettings,
}

impl Default for Settings {
    fn default() -> Self {
        // Platform data dir, falling back to home and then the working directory.
        let data_dir = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("crawl-access");
        Self::with_data_dir(data_dir)
    }
}

impl Settings {
    /// Settings with every state file under `data_dir`.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            queue_file: data_dir.join(QUEUE_FILE),
            strategy_cache_file: data_dir.join(STRATEGY_CACHE_FILE),
            attempt_log_file: data_dir.join(ATTEMPT_LOG_FILE),
            records_file: data_dir.join(RECORDS_FILE),
            summary_file: data_dir.join(SUMMARY_FILE),
            playbook_file: data_dir.join(PLAYBOOK_FILE),
            recon_cache_file: data_dir.join(RECON_CACHE_FILE),
            rules_file: data_dir.join(RULES_FILE),
            data_dir,
            user_agent: None,
            proxy: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            jobs: DEFAULT_JOBS,
            browser_url: None,
            strategy_cache_max_age_days: crate::access::strategy_cache::DEFAULT_MAX_AGE_DAYS,
            plan_defaults: PlanLayer::default(),
            queue: QueueSettings::default(),
        }
    }

    /// Ensure the data directory exists.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create data directory '{}': {}",
                    self.data_dir.display(),
                    e
                ),
            )
        })
    }
}

/// Configuration file structure.
///
/// ```toml
/// data_dir = "~/crawl"
/// user_agent = "impersonate"
/// jobs = 8
///
/// [access]
/// max_attempts = 4
/// allow_visible = false
///
/// [queue]
/// lookback_days = 90
/// perpetual_threshold = 3
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// Request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbooks: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recon_cache: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_cache_max_age_days: Option<i64>,
    /// Access plan defaults.
    #[serde(default)]
    pub access: PlanLayer,
    #[serde(default)]
    pub queue: QueueSettings,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Discover a config file with prefer. No file means defaults.
    pub async fn load() -> Result<Self, ConfigError> {
        match prefer::load("crawl-access").await {
            Ok(discovered) => match discovered.source_path() {
                Some(path) => Self::load_from_path(path).await,
                None => Ok(Self::default()),
            },
            Err(e) => {
                tracing::debug!("No config file discovered: {}", e);
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file path.
    /// Format is picked by extension: TOML, YAML, otherwise JSON.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
        let mut config = Self::parse(path, &contents)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let parse_err = |message: String| ConfigError::Parse {
            path: path.display().to_string(),
            message,
        };
        match path.extension().and_then(|e| e.to_str()).unwrap_or("json") {
            "toml" => toml::from_str(contents).map_err(|e| parse_err(e.to_string())),
            "yaml" | "yml" => serde_yaml::from_str(contents).map_err(|e| parse_err(e.to_string())),
            _ => serde_json::from_str(contents).map_err(|e| parse_err(e.to_string())),
        }
    }

    /// Directory relative paths are resolved against.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a path that may be relative to the config file.
    /// - Absolute paths are returned as-is
    /// - Paths starting with ~ are expanded
    /// - Relative paths are joined onto `base_dir`
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) {
        if let Some(ref data_dir) = self.data_dir {
            *settings = Settings::with_data_dir(self.resolve_path(data_dir, base_dir));
        }
        if let Some(ref user_agent) = self.user_agent {
            settings.user_agent = Some(user_agent.clone());
        }
        if let Some(ref proxy) = self.proxy {
            settings.proxy = Some(proxy.clone());
        }
        if let Some(timeout) = self.request_timeout {
            settings.request_timeout = timeout;
        }
        if let Some(jobs) = self.jobs {
            settings.jobs = jobs.max(1);
        }
        if let Some(ref url) = self.browser_url {
            settings.browser_url = Some(url.clone());
        }
        if let Some(ref path) = self.playbooks {
            settings.playbook_file = self.resolve_path(path, base_dir);
        }
        if let Some(ref path) = self.recon_cache {
            settings.recon_cache_file = self.resolve_path(path, base_dir);
        }
        if let Some(ref path) = self.rules {
            settings.rules_file = self.resolve_path(path, base_dir);
        }
        if let Some(days) = self.strategy_cache_max_age_days {
            settings.strategy_cache_max_age_days = days;
        }
        settings.plan_defaults = self.access.clone();
        settings.queue = self.queue;
    }

    /// SHA-256 of the serialized config, logged so runs can be compared.
    pub fn hash(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides discovery).
    pub config_path: Option<PathBuf>,
    /// Data directory (`--data-dir`), overrides the config file.
    pub data_dir: Option<PathBuf>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

/// Load settings: defaults, then config file, then environment, then `options`.
pub async fn load_settings_with_options(
    options: LoadOptions,
) -> Result<(Settings, Config), ConfigError> {
    let config = match options.config_path {
        Some(ref path) => Config::load_from_path(path).await?,
        None => Config::load().await?,
    };

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let base_dir = config.base_dir().unwrap_or_else(|| cwd.clone());

    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings, &base_dir);
    apply_env_overrides(&mut settings, &config, &cwd);

    if let Some(data_dir) = options.data_dir {
        rebase_data_dir(&mut settings, &config, config.resolve_path(&data_dir.to_string_lossy(), &cwd), &base_dir);
    }

    tracing::debug!(
        "Using data dir {} (config hash {})",
        settings.data_dir.display(),
        &config.hash()[..12]
    );
    Ok((settings, config))
}

fn apply_env_overrides(settings: &mut Settings, config: &Config, cwd: &Path) {
    if let Some(dir) = env_var("CRAWL_ACCESS_DATA_DIR") {
        tracing::debug!("Using CRAWL_ACCESS_DATA_DIR from environment: {}", dir);
        let base_dir = config.base_dir().unwrap_or_else(|| cwd.to_path_buf());
        rebase_data_dir(settings, config, config.resolve_path(&dir, cwd), &base_dir);
    }
    if let Some(timeout) = env_var("CRAWL_ACCESS_TIMEOUT") {
        match timeout.parse() {
            Ok(secs) => settings.request_timeout = secs,
            Err(_) => tracing::warn!("Ignoring invalid CRAWL_ACCESS_TIMEOUT '{}'", timeout),
        }
    }
    if let Some(user_agent) = env_var("CRAWL_ACCESS_USER_AGENT") {
        settings.user_agent = Some(user_agent);
    }
    if let Some(url) = env_var("BROWSER_URL") {
        settings.browser_url = Some(url);
    }
}

/// Move every state file under `data_dir`, keeping explicit file paths from the config.
fn rebase_data_dir(settings: &mut Settings, config: &Config, data_dir: PathBuf, base_dir: &Path) {
    let mut rebased = Settings::with_data_dir(data_dir);
    let explicit = Config {
        data_dir: None,
        ..config.clone()
    };
    explicit.apply_to_settings(&mut rebased, base_dir);
    rebased.user_agent = settings.user_agent.take();
    rebased.request_timeout = settings.request_timeout;
    rebased.browser_url = settings.browser_url.take();
    *settings = rebased;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_toml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawl-access.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "state"
jobs = 8
user_agent = "impersonate"

[access]
max_attempts = 5
allow_visible = true

[queue]
lookback_days = 30
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).await.unwrap();
        assert_eq!(config.jobs, Some(8));
        assert_eq!(config.access.max_attempts, Some(5));
        assert_eq!(config.queue.lookback_days, 30);
        assert_eq!(config.queue.perpetual_threshold, 3);

        let mut settings = Settings::default();
        config.apply_to_settings(&mut settings, dir.path());
        assert_eq!(settings.data_dir, dir.path().join("state"));
        assert_eq!(settings.queue_file, dir.path().join("state").join(QUEUE_FILE));
        assert_eq!(settings.jobs, 8);
        assert_eq!(settings.plan_defaults.allow_visible, Some(true));
    }

    #[tokio::test]
    async fn test_load_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("c.yaml");
        std::fs::write(&yaml, "request_timeout: 12\naccess:\n  patient_mode: true\n").unwrap();
        let config = Config::load_from_path(&yaml).await.unwrap();
        assert_eq!(config.request_timeout, Some(12));
        assert_eq!(config.access.patient_mode, Some(true));

        let json = dir.path().join("c.json");
        std::fs::write(&json, r#"{"proxy": "socks5://127.0.0.1:9050"}"#).unwrap();
        let config = Config::load_from_path(&json).await.unwrap();
        assert_eq!(config.proxy.as_deref(), Some("socks5://127.0.0.1:9050"));
    }

    #[tokio::test]
    async fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "jobs = [").unwrap();
        let err = Config::load_from_path(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_explicit_file_paths_survive_rebase() {
        let config = Config {
            playbooks: Some("/etc/crawl/playbooks.yaml".into()),
            ..Config::default()
        };
        let mut settings = Settings::default();
        rebase_data_dir(
            &mut settings,
            &config,
            PathBuf::from("/tmp/crawl"),
            Path::new("/"),
        );
        assert_eq!(settings.queue_file, PathBuf::from("/tmp/crawl").join(QUEUE_FILE));
        assert_eq!(
            settings.playbook_file,
            PathBuf::from("/etc/crawl/playbooks.yaml")
        );
    }

    #[test]
    fn test_resolve_path() {
        let config = Config::default();
        let base = Path::new("/srv/crawl");
        assert_eq!(
            config.resolve_path("/abs/file", base),
            PathBuf::from("/abs/file")
        );
        assert_eq!(
            config.resolve_path("rel/file", base),
            PathBuf::from("/srv/crawl/rel/file")
        );
        assert!(!config.resolve_path("~/x", base).starts_with("~"));
    }
}
