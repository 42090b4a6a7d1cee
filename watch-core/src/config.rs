use crate::paths;
use crate::suspicion::HIGH_CONFIDENCE_SCORE;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Config {
  pub logging: LoggingConfig,
  pub feed: FeedConfig,
  pub registry: RegistryConfig,
  pub worker: WorkerConfig,
  pub queue: QueueConfig,
  pub notify: NotifyConfig,
  /// Channel secrets. Environment only, never written to `config.toml`.
  pub credentials: Credentials,
  /// Log what would be sent instead of calling the channels.
  pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
  #[serde(default = "default_log_level")]
  pub level: String,

  #[serde(default = "default_retention_days")]
  pub retention_days: u64,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      retention_days: default_retention_days(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
  /// Feed root; its `update_seq` anchors a fresh install at the feed head.
  #[serde(default = "default_feed_base_url")]
  pub base_url: String,

  #[serde(default = "default_changes_url")]
  pub changes_url: String,

  #[serde(default = "default_changes_limit")]
  pub changes_limit: u32,

  #[serde(default = "default_poll_ms")]
  pub poll_ms: u64,

  #[serde(default = "default_timeout_seconds")]
  pub timeout_seconds: u64,
}

impl Default for FeedConfig {
  fn default() -> Self {
    Self {
      base_url: default_feed_base_url(),
      changes_url: default_changes_url(),
      changes_limit: default_changes_limit(),
      poll_ms: default_poll_ms(),
      timeout_seconds: default_timeout_seconds(),
    }
  }
}

impl FeedConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_ms)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
  #[serde(default = "default_registry_url")]
  pub base_url: String,

  /// Human-facing package page prefix used in chat messages.
  #[serde(default = "default_package_page_url")]
  pub package_page_url: String,

  #[serde(default = "default_timeout_seconds")]
  pub timeout_seconds: u64,
}

impl Default for RegistryConfig {
  fn default() -> Self {
    Self {
      base_url: default_registry_url(),
      package_page_url: default_package_page_url(),
      timeout_seconds: default_timeout_seconds(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
  #[serde(default = "default_concurrency")]
  pub concurrency: usize,

  #[serde(default = "default_max_jobs_per_second")]
  pub max_jobs_per_second: u32,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      concurrency: default_concurrency(),
      max_jobs_per_second: default_max_jobs_per_second(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,

  #[serde(default = "default_backoff_base_ms")]
  pub backoff_base_ms: u64,

  #[serde(default = "default_backoff_max_ms")]
  pub backoff_max_ms: u64,

  /// An un-acked delivery older than this is handed out again.
  #[serde(default = "default_visibility_timeout_seconds")]
  pub visibility_timeout_seconds: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
      backoff_base_ms: default_backoff_base_ms(),
      backoff_max_ms: default_backoff_max_ms(),
      visibility_timeout_seconds: default_visibility_timeout_seconds(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
  #[serde(default = "default_timeout_seconds")]
  pub timeout_seconds: u64,

  /// Findings below this score never open an issue.
  #[serde(default = "default_issue_min_score")]
  pub issue_min_score: u32,
}

impl Default for NotifyConfig {
  fn default() -> Self {
    Self {
      timeout_seconds: default_timeout_seconds(),
      issue_min_score: default_issue_min_score(),
    }
  }
}

impl NotifyConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_seconds)
  }
}

#[derive(Clone, Default)]
pub struct Credentials {
  pub telegram_bot_token: Option<String>,
  pub telegram_chat_id: Option<String>,
  pub discord_webhook_url: Option<String>,
  pub github_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Credentials")
      .field("telegram_bot_token", &self.telegram_bot_token.as_ref().map(|_| "<set>"))
      .field("telegram_chat_id", &self.telegram_chat_id)
      .field("discord_webhook_url", &self.discord_webhook_url.as_ref().map(|_| "<set>"))
      .field("github_token", &self.github_token.as_ref().map(|_| "<set>"))
      .finish()
  }
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_retention_days() -> u64 {
  14
}

fn default_feed_base_url() -> String {
  "https://replicate.npmjs.com/".to_string()
}

fn default_changes_url() -> String {
  "https://replicate.npmjs.com/registry/_changes".to_string()
}

fn default_changes_limit() -> u32 {
  200
}

fn default_poll_ms() -> u64 {
  1500
}

fn default_timeout_seconds() -> u64 {
  10
}

fn default_registry_url() -> String {
  "https://registry.npmjs.org/".to_string()
}

fn default_package_page_url() -> String {
  "https://www.npmjs.com/package/".to_string()
}

fn default_concurrency() -> usize {
  10
}

fn default_max_jobs_per_second() -> u32 {
  10
}

fn default_max_attempts() -> u32 {
  5
}

fn default_backoff_base_ms() -> u64 {
  2_000
}

fn default_backoff_max_ms() -> u64 {
  300_000
}

fn default_visibility_timeout_seconds() -> u64 {
  300
}

fn default_issue_min_score() -> u32 {
  HIGH_CONFIDENCE_SCORE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
  #[serde(default)]
  pub logging: Option<LoggingConfig>,

  #[serde(default)]
  pub feed: Option<FeedConfig>,

  #[serde(default)]
  pub registry: Option<RegistryConfig>,

  #[serde(default)]
  pub worker: Option<WorkerConfig>,

  #[serde(default)]
  pub queue: Option<QueueConfig>,

  #[serde(default)]
  pub notify: Option<NotifyConfig>,
}

impl ConfigFile {
  fn normalize(self) -> Config {
    let mut cfg = Config::default();
    if let Some(l) = self.logging {
      cfg.logging = l;
    }
    if let Some(f) = self.feed {
      cfg.feed = f;
    }
    if let Some(r) = self.registry {
      cfg.registry = r;
    }
    if let Some(w) = self.worker {
      cfg.worker = w;
    }
    if let Some(q) = self.queue {
      cfg.queue = q;
    }
    if let Some(n) = self.notify {
      cfg.notify = n;
    }
    sanitize(&mut cfg);
    cfg
  }

  fn needs_upgrade(&self) -> bool {
    self.logging.is_none()
      || self.feed.is_none()
      || self.registry.is_none()
      || self.worker.is_none()
      || self.queue.is_none()
      || self.notify.is_none()
  }
}

/// Loads `config.toml`, writing defaults when it is missing and upgrading it
/// in place (with a backup) when sections are missing.
pub fn load_or_create_default(path: &Path) -> anyhow::Result<Config> {
  load_impl(path, true)
}

pub fn load_or_default_readonly(path: &Path) -> anyhow::Result<Config> {
  load_impl(path, false)
}

fn load_impl(path: &Path, allow_writes: bool) -> anyhow::Result<Config> {
  let parent = path
    .parent()
    .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", path.display()))?;
  if allow_writes {
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
  }

  if !path.exists() {
    let cfg = Config::default();
    if allow_writes {
      write_config(path, &cfg)?;
    } else {
      eprintln!(
        "script-watch: config missing at {}; using defaults (read-only).",
        path.display()
      );
    }
    return Ok(cfg);
  }

  let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
  match toml::from_str::<ConfigFile>(&raw) {
    Ok(file) => {
      let needs_upgrade = file.needs_upgrade();
      let cfg = file.normalize();
      if allow_writes && needs_upgrade {
        let backup = parent.join(format!("config.toml.bak-{}", now_unix_s()));
        let _ = fs::copy(path, &backup);
        let _ = write_config(path, &cfg);
        eprintln!(
          "script-watch: upgraded config defaults written to {} (backup: {})",
          path.display(),
          backup.display()
        );
      }
      Ok(cfg)
    }
    Err(e) => {
      let cfg = Config::default();
      if allow_writes {
        let backup = parent.join(format!("config.toml.bad-{}", now_unix_s()));
        let _ = fs::rename(path, &backup);
        write_config(path, &cfg)?;
        eprintln!(
          "script-watch: invalid config at {} (backed up to {}): {e}",
          path.display(),
          backup.display()
        );
      } else {
        eprintln!(
          "script-watch: invalid config at {}; using defaults (read-only): {e}",
          path.display()
        );
      }
      Ok(cfg)
    }
  }
}

fn write_config(path: &Path, cfg: &Config) -> anyhow::Result<()> {
  let raw = toml::to_string_pretty(&to_config_file(cfg)).context("serialize config")?;
  paths::write_atomic(path, raw.as_bytes())
}

fn to_config_file(cfg: &Config) -> ConfigFile {
  ConfigFile {
    logging: Some(cfg.logging.clone()),
    feed: Some(cfg.feed.clone()),
    registry: Some(cfg.registry.clone()),
    worker: Some(cfg.worker.clone()),
    queue: Some(cfg.queue.clone()),
    notify: Some(cfg.notify.clone()),
  }
}

/// Applies environment overrides on top of the file config. `lookup` is
/// `std::env::var` in production.
pub fn apply_env<F>(cfg: &mut Config, lookup: F)
where
  F: Fn(&str) -> Option<String>,
{
  let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

  if let Some(v) = get("NPM_FEED_URL") {
    cfg.feed.base_url = v;
  }
  if let Some(v) = get("NPM_CHANGES_URL") {
    cfg.feed.changes_url = v;
  }
  if let Some(v) = get("NPM_REGISTRY_URL") {
    cfg.registry.base_url = v;
  }
  if let Some(v) = get("LOG_LEVEL") {
    cfg.logging.level = v;
  }
  parse_env(&get, "WORKER_CONCURRENCY", &mut cfg.worker.concurrency);
  parse_env(
    &get,
    "WORKER_MAX_JOBS_PER_SECOND",
    &mut cfg.worker.max_jobs_per_second,
  );
  parse_env(&get, "CHANGES_LIMIT", &mut cfg.feed.changes_limit);
  parse_env(&get, "POLL_MS", &mut cfg.feed.poll_ms);

  cfg.credentials.telegram_bot_token = get("TELEGRAM_BOT_TOKEN");
  cfg.credentials.telegram_chat_id = get("TELEGRAM_CHAT_ID");
  cfg.credentials.discord_webhook_url = get("DISCORD_WEBHOOK_URL");
  cfg.credentials.github_token = get("GITHUB_TOKEN");

  sanitize(cfg);
}

fn parse_env<G, T>(get: &G, key: &str, slot: &mut T)
where
  G: Fn(&str) -> Option<String>,
  T: std::str::FromStr,
{
  let Some(raw) = get(key) else {
    return;
  };
  match raw.parse::<T>() {
    Ok(v) => *slot = v,
    Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
  }
}

/// Replaces values that would stall or break the pipeline with defaults.
fn sanitize(cfg: &mut Config) {
  if let Some(reason) = validate_feed_config(&cfg.feed) {
    tracing::warn!(reason = %reason, "feed config invalid; using defaults");
    cfg.feed = FeedConfig::default();
  }
  if let Some(reason) = validate_url(&cfg.registry.base_url) {
    tracing::warn!(reason = %reason, "registry base_url invalid; using default");
    cfg.registry.base_url = default_registry_url();
  }
  if cfg.registry.timeout_seconds == 0 {
    cfg.registry.timeout_seconds = default_timeout_seconds();
  }
  if cfg.worker.concurrency == 0 {
    tracing::warn!("worker.concurrency must be > 0; using default");
    cfg.worker.concurrency = default_concurrency();
  }
  if cfg.worker.max_jobs_per_second == 0 {
    tracing::warn!("worker.max_jobs_per_second must be > 0; using default");
    cfg.worker.max_jobs_per_second = default_max_jobs_per_second();
  }
  if cfg.queue.max_attempts == 0 {
    cfg.queue.max_attempts = default_max_attempts();
  }
  if cfg.notify.timeout_seconds == 0 {
    cfg.notify.timeout_seconds = default_timeout_seconds();
  }
}

fn validate_feed_config(cfg: &FeedConfig) -> Option<String> {
  if cfg.poll_ms == 0 {
    return Some("poll_ms must be > 0".to_string());
  }
  if cfg.changes_limit == 0 {
    return Some("changes_limit must be > 0".to_string());
  }
  if cfg.timeout_seconds == 0 {
    return Some("timeout_seconds must be > 0".to_string());
  }
  validate_url(&cfg.base_url).or_else(|| validate_url(&cfg.changes_url))
}

fn validate_url(raw: &str) -> Option<String> {
  let Ok(url) = reqwest::Url::parse(raw) else {
    return Some(format!("invalid URL: {raw}"));
  };
  if url.scheme() != "https" && url.scheme() != "http" {
    return Some(format!("URL must use http(s): {raw}"));
  }
  if url.host_str().is_none() {
    return Some(format!("URL has no host: {raw}"));
  }
  None
}

fn now_unix_s() -> u64 {
  crate::types::now_unix_ms() / 1000
}
