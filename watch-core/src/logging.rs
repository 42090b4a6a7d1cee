use crate::config::LoggingConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_FILE_NAME: &str = "script-watch.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Daily rolling file under `log_dir` plus stderr. Used by the long-running
/// monitor.
pub fn init_file_and_stderr(log_dir: &Path, cfg: &LoggingConfig) -> anyhow::Result<()> {
  fs::create_dir_all(log_dir)?;
  cleanup_old_logs(log_dir, cfg.retention_days)?;

  let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
  let _ = FILE_GUARD.set(guard);

  let file_layer = tracing_subscriber::fmt::layer()
    .with_ansi(false)
    .with_writer(file_writer)
    .with_target(true);
  let stderr_layer = tracing_subscriber::fmt::layer()
    .with_ansi(false)
    .with_writer(std::io::stderr)
    .with_target(true);

  tracing_subscriber::registry()
    .with(env_filter(&cfg.level))
    .with(file_layer)
    .with(stderr_layer)
    .try_init()?;
  Ok(())
}

/// Runs `f` under a stderr-only subscriber scoped to the calling thread.
/// Covers startup work done before the global subscriber exists, and
/// one-shot commands that should leave no log files.
pub fn with_stderr_logging<T>(level: &str, f: impl FnOnce() -> T) -> T {
  tracing::subscriber::with_default(stderr_subscriber(level, std::io::stderr), f)
}

fn stderr_subscriber<W>(level: &str, writer: W) -> impl tracing::Subscriber + Send + Sync + 'static
where
  W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
  tracing_subscriber::registry().with(env_filter(level)).with(
    tracing_subscriber::fmt::layer()
      .with_ansi(false)
      .with_writer(writer)
      .with_target(false),
  )
}

fn env_filter(level: &str) -> tracing_subscriber::EnvFilter {
  tracing_subscriber::EnvFilter::try_new(level)
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> anyhow::Result<()> {
  if retention_days == 0 {
    return Ok(());
  }

  let cutoff = SystemTime::now()
    .checked_sub(Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60)))
    .unwrap_or(SystemTime::UNIX_EPOCH);
  remove_logs_older_than(log_dir, cutoff);
  Ok(())
}

fn remove_logs_older_than(log_dir: &Path, cutoff: SystemTime) {
  let Ok(entries) = fs::read_dir(log_dir) else {
    return;
  };

  for entry in entries.flatten() {
    let path: PathBuf = entry.path();
    if !is_own_log_file(&path) {
      continue;
    }
    let modified = entry.metadata().and_then(|m| m.modified());
    if matches!(modified, Ok(t) if t < cutoff) {
      let _ = fs::remove_file(&path);
    }
  }
}

fn is_own_log_file(path: &Path) -> bool {
  match path.file_name().and_then(|n| n.to_str()) {
    Some(name) => name == LOG_FILE_NAME || name.starts_with("script-watch.log."),
    None => false,
  }
}
