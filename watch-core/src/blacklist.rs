//! Persisted set of publishing authors whose changes are never enqueued.
//!
//! Readers go through [`ConfigStore::get`] on every poll cycle; the only
//! writer is the administrative [`add_author`] / [`remove_author`] path.

use crate::paths;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistConfig {
  #[serde(default)]
  pub blacklisted_authors: BTreeSet<String>,
}

impl BlacklistConfig {
  pub fn is_blacklisted(&self, author: &str) -> bool {
    self.blacklisted_authors.contains(author)
  }
}

pub trait ConfigStore: Send + Sync {
  /// Returns an empty blacklist when no record exists.
  fn get(&self) -> anyhow::Result<BlacklistConfig>;

  /// Replaces the persisted record atomically.
  fn save(&self, cfg: &BlacklistConfig) -> anyhow::Result<()>;
}

pub struct FileConfigStore {
  path: PathBuf,
}

impl FileConfigStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn at_base(base: &Path) -> Self {
    Self::new(paths::blacklist_path(base))
  }
}

impl ConfigStore for FileConfigStore {
  fn get(&self) -> anyhow::Result<BlacklistConfig> {
    if !self.path.exists() {
      return Ok(BlacklistConfig::default());
    }
    let raw = fs::read_to_string(&self.path)
      .with_context(|| format!("read {}", self.path.display()))?;
    match toml::from_str::<BlacklistConfig>(&raw) {
      Ok(cfg) => Ok(cfg),
      Err(e) => {
        tracing::warn!(
          path = %self.path.display(),
          error = %e,
          "blacklist record unreadable; treating as empty"
        );
        Ok(BlacklistConfig::default())
      }
    }
  }

  fn save(&self, cfg: &BlacklistConfig) -> anyhow::Result<()> {
    let raw = toml::to_string_pretty(cfg).context("serialize blacklist")?;
    paths::write_atomic(&self.path, raw.as_bytes())
  }
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
  inner: RwLock<BlacklistConfig>,
}

impl ConfigStore for MemoryConfigStore {
  fn get(&self) -> anyhow::Result<BlacklistConfig> {
    Ok(self.inner.read().unwrap_or_else(|p| p.into_inner()).clone())
  }

  fn save(&self, cfg: &BlacklistConfig) -> anyhow::Result<()> {
    *self.inner.write().unwrap_or_else(|p| p.into_inner()) = cfg.clone();
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistChange {
  Added,
  AlreadyPresent,
  Removed,
  NotPresent,
}

pub fn add_author(store: &dyn ConfigStore, author: &str) -> anyhow::Result<BlacklistChange> {
  let author = normalize_author(author)?;
  let mut cfg = store.get()?;
  if !cfg.blacklisted_authors.insert(author.clone()) {
    return Ok(BlacklistChange::AlreadyPresent);
  }
  store.save(&cfg)?;
  tracing::info!(author = %author, "author blacklisted");
  Ok(BlacklistChange::Added)
}

pub fn remove_author(store: &dyn ConfigStore, author: &str) -> anyhow::Result<BlacklistChange> {
  let author = normalize_author(author)?;
  let mut cfg = store.get()?;
  if !cfg.blacklisted_authors.remove(&author) {
    return Ok(BlacklistChange::NotPresent);
  }
  store.save(&cfg)?;
  tracing::info!(author = %author, "author removed from blacklist");
  Ok(BlacklistChange::Removed)
}

fn normalize_author(author: &str) -> anyhow::Result<String> {
  let trimmed = author.trim();
  if trimmed.is_empty() {
    anyhow::bail!("author name must not be empty");
  }
  Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_file_reads_as_empty_blacklist() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileConfigStore::at_base(dir.path());
    assert_eq!(store.get().unwrap(), BlacklistConfig::default());
  }

  #[test]
  fn add_and_remove_round_through_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileConfigStore::at_base(dir.path());

    assert_eq!(add_author(&store, "mallory").unwrap(), BlacklistChange::Added);
    assert_eq!(
      add_author(&store, " mallory ").unwrap(),
      BlacklistChange::AlreadyPresent
    );
    assert!(store.get().unwrap().is_blacklisted("mallory"));

    assert_eq!(remove_author(&store, "mallory").unwrap(), BlacklistChange::Removed);
    assert_eq!(
      remove_author(&store, "mallory").unwrap(),
      BlacklistChange::NotPresent
    );
    assert!(!store.get().unwrap().is_blacklisted("mallory"));
  }

  #[test]
  fn empty_author_is_rejected() {
    let store = MemoryConfigStore::default();
    assert!(add_author(&store, "   ").is_err());
  }

  #[test]
  fn save_leaves_no_temp_files_behind() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileConfigStore::at_base(dir.path());
    add_author(&store, "a").unwrap();
    add_author(&store, "b").unwrap();

    let names: Vec<String> = fs::read_dir(dir.path())
      .unwrap()
      .flatten()
      .map(|e| e.file_name().to_string_lossy().into_owned())
      .collect();
    assert_eq!(names, vec!["blacklist.toml".to_string()]);
  }

  #[test]
  fn corrupt_record_reads_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = paths::blacklist_path(dir.path());
    fs::write(&path, "blacklisted_authors = 7").unwrap();
    let store = FileConfigStore::new(path);
    assert!(store.get().unwrap().blacklisted_authors.is_empty());
  }
}
