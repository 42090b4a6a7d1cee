use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of lifecycle scripts the installer runs on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
  Postinstall,
  Preinstall,
}

impl ScriptType {
  pub const ALL: [ScriptType; 2] = [ScriptType::Postinstall, ScriptType::Preinstall];

  pub fn as_str(self) -> &'static str {
    match self {
      ScriptType::Postinstall => "postinstall",
      ScriptType::Preinstall => "preinstall",
    }
  }

  /// `Postinstall`, `Preinstall` for message headings.
  pub fn label(self) -> &'static str {
    match self {
      ScriptType::Postinstall => "Postinstall",
      ScriptType::Preinstall => "Preinstall",
    }
  }
}

impl fmt::Display for ScriptType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
  Added,
  Changed,
}

impl AlertType {
  pub fn as_str(self) -> &'static str {
    match self {
      AlertType::Added => "added",
      AlertType::Changed => "changed",
    }
  }
}

impl fmt::Display for AlertType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One row of the registry change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
  pub seq: u64,
  pub package_name: String,
  pub author_name: Option<String>,
  pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageJob {
  pub package_name: String,
  pub enqueued_at_unix_ms: u64,
}

impl PackageJob {
  pub fn new(package_name: impl Into<String>) -> Self {
    Self {
      package_name: package_name.into(),
      enqueued_at_unix_ms: now_unix_ms(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptFinding {
  pub package_name: String,
  pub latest_version: String,
  pub previous_version: Option<String>,
  pub script_type: ScriptType,
  pub script_content: String,
  pub previous_script_content: Option<String>,
  pub suspicion_score: u32,
  pub alert_type: AlertType,
}

impl ScriptFinding {
  pub fn is_high_confidence(&self, min_score: u32) -> bool {
    self.suspicion_score >= min_score
  }
}

pub fn now_unix_ms() -> u64 {
  use std::time::{SystemTime, UNIX_EPOCH};
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as u64
}

/// Trims an error chain to something that fits on one log line.
pub fn short_error(e: &anyhow::Error) -> String {
  let text = format!("{e:#}");
  let count = text.chars().count();
  if count <= 180 {
    return text;
  }
  let prefix: String = text.chars().take(180).collect();
  format!("{prefix}...")
}
