use crate::paths;
use crate::types::{now_unix_ms, ScriptFinding};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingRecord {
  pub finding_id: String,
  pub detected_at_unix_ms: u64,
  pub finding: ScriptFinding,
}

/// One TOML file per finding under `<base>/findings`, for later review with
/// `--findings`.
pub struct FindingStore {
  dir: PathBuf,
}

impl FindingStore {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  pub fn at_base(base: &Path) -> Self {
    Self::new(paths::findings_dir(base))
  }

  pub fn store(&self, finding: &ScriptFinding) -> anyhow::Result<PathBuf> {
    let record = FindingRecord {
      finding_id: uuid::Uuid::new_v4().to_string(),
      detected_at_unix_ms: now_unix_ms(),
      finding: finding.clone(),
    };
    let path = self.dir.join(format!("{}.toml", record.finding_id));
    let raw = toml::to_string_pretty(&record).context("serialize finding record")?;
    paths::write_atomic(&path, raw.as_bytes())?;
    tracing::debug!(finding_id = %record.finding_id, path = %path.display(), "finding stored");
    Ok(path)
  }

  /// Newest first. Unreadable records are skipped.
  pub fn list_recent(&self, limit: usize) -> anyhow::Result<Vec<FindingRecord>> {
    if !self.dir.exists() {
      return Ok(Vec::new());
    }

    let mut out: Vec<FindingRecord> = fs::read_dir(&self.dir)
      .with_context(|| format!("read {}", self.dir.display()))?
      .flatten()
      .map(|e| e.path())
      .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("toml"))
      .filter_map(|p| {
        let raw = fs::read_to_string(&p).ok()?;
        match toml::from_str::<FindingRecord>(&raw) {
          Ok(r) => Some(r),
          Err(e) => {
            tracing::debug!(path = %p.display(), error = %e, "skipping unreadable finding record");
            None
          }
        }
      })
      .collect();

    out.sort_by(|a, b| b.detected_at_unix_ms.cmp(&a.detected_at_unix_ms));
    out.truncate(limit);
    Ok(out)
  }
}
