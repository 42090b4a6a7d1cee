use std::path::{Path, PathBuf};

pub const HOME_ENV: &str = "SCRIPTWATCH_HOME";

pub fn base_dir() -> anyhow::Result<PathBuf> {
  match std::env::var(HOME_ENV) {
    Ok(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir)),
    _ => Ok(std::env::current_dir()?.join("data")),
  }
}

pub fn config_path(base: &Path) -> PathBuf {
  base.join("config.toml")
}

pub fn blacklist_path(base: &Path) -> PathBuf {
  base.join("blacklist.toml")
}

pub fn cursor_path(base: &Path) -> PathBuf {
  base.join("cursor.toml")
}

pub fn logs_dir(base: &Path) -> PathBuf {
  base.join("logs")
}

pub fn queue_dir(base: &Path) -> PathBuf {
  base.join("queue")
}

pub fn findings_dir(base: &Path) -> PathBuf {
  base.join("findings")
}

/// Writes `contents` to a sibling temp file and renames it over `path`, so a
/// concurrent reader sees either the old record or the new one.
pub fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
  use anyhow::Context;
  use std::sync::atomic::{AtomicU64, Ordering};

  static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

  let parent = path
    .parent()
    .ok_or_else(|| anyhow::anyhow!("file path has no parent: {}", path.display()))?;
  std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;

  let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("tmp");
  let tmp = parent.join(format!(
    ".{name}.{}-{}.tmp",
    std::process::id(),
    TMP_SEQ.fetch_add(1, Ordering::Relaxed)
  ));
  std::fs::write(&tmp, contents).with_context(|| format!("write {}", tmp.display()))?;
  std::fs::rename(&tmp, path)
    .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
  Ok(())
}
