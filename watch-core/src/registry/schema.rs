use super::ChangesPage;
use crate::types::{ChangeEvent, ScriptType};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Feed sequence. The public feed sends numbers; older CouchDB-style feeds
/// send strings such as `"123-g1AAAA"`, of which only the numeric prefix
/// orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "RawSeq")]
pub struct Seq(pub u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSeq {
  Number(u64),
  Text(String),
}

impl TryFrom<RawSeq> for Seq {
  type Error = String;

  fn try_from(raw: RawSeq) -> Result<Self, Self::Error> {
    match raw {
      RawSeq::Number(n) => Ok(Seq(n)),
      RawSeq::Text(s) => {
        let digits = s.split('-').next().unwrap_or_default().trim();
        digits
          .parse::<u64>()
          .map(Seq)
          .map_err(|_| format!("unsupported feed sequence: {s:?}"))
      }
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedHead {
  pub update_seq: Seq,
}

/// One page of the changes feed. Rows stay raw until `into_page` so a
/// single malformed row cannot sink the whole page.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangesResponse {
  #[serde(default)]
  pub results: Vec<Value>,

  #[serde(default, alias = "lastSeq")]
  pub last_seq: Option<Value>,
}

impl ChangesResponse {
  /// Decodes each row on its own; malformed rows are logged and dropped.
  /// Without a usable `last_seq`, the page ends at the highest sequence any
  /// row carried, dropped rows included, so the cursor still moves past them.
  pub fn into_page(self) -> ChangesPage {
    let mut events = Vec::with_capacity(self.results.len());
    let mut highest: Option<u64> = None;
    let mut dropped = 0usize;

    for raw in self.results {
      if let Some(seq) = raw.get("seq").and_then(seq_of) {
        highest = highest.max(Some(seq));
      }
      match serde_json::from_value::<ChangeRow>(raw.clone()) {
        Ok(row) if !row.id.trim().is_empty() => events.push(ChangeEvent::from(row)),
        Ok(_) => {
          dropped += 1;
          tracing::warn!(row = %raw, "dropping feed row with empty id");
        }
        Err(e) => {
          dropped += 1;
          tracing::warn!(row = %raw, error = %e, "dropping malformed feed row");
        }
      }
    }

    let last_seq = match self.last_seq {
      Some(v) => seq_of(&v).or_else(|| {
        tracing::warn!(last_seq = %v, "ignoring unparseable last_seq");
        None
      }),
      None => None,
    };
    if dropped > 0 {
      tracing::warn!(dropped, kept = events.len(), "feed page had malformed rows");
    }

    ChangesPage {
      events,
      last_seq: last_seq.or(highest),
    }
  }
}

fn seq_of(v: &Value) -> Option<u64> {
  serde_json::from_value::<Seq>(v.clone()).ok().map(|s| s.0)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRow {
  pub seq: Seq,
  pub id: String,

  #[serde(default)]
  pub deleted: bool,

  #[serde(default)]
  pub author: Option<AuthorField>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AuthorField {
  Name(String),
  Person {
    #[serde(default)]
    name: Option<String>,
  },
}

impl AuthorField {
  pub fn name(&self) -> Option<&str> {
    let name = match self {
      AuthorField::Name(n) => Some(n.as_str()),
      AuthorField::Person { name } => name.as_deref(),
    };
    name.map(str::trim).filter(|n| !n.is_empty())
  }
}

impl From<ChangeRow> for ChangeEvent {
  fn from(row: ChangeRow) -> Self {
    let author_name = row.author.as_ref().and_then(|a| a.name()).map(str::to_string);
    ChangeEvent {
      seq: row.seq.0,
      package_name: row.id,
      author_name,
      deleted: row.deleted,
    }
  }
}

/// The two lifecycle scripts of one published version. Any other script
/// keys are dropped at parse time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionDoc {
  pub preinstall: Option<String>,
  pub postinstall: Option<String>,
}

impl VersionDoc {
  pub fn from_value(value: &Value) -> Self {
    let scripts = value.get("scripts").and_then(Value::as_object);
    let pick = |key: &str| {
      scripts
        .and_then(|s| s.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
    };
    Self {
      preinstall: pick(ScriptType::Preinstall.as_str()),
      postinstall: pick(ScriptType::Postinstall.as_str()),
    }
  }

  /// The raw script text, or `None` when absent or blank.
  pub fn script(&self, script_type: ScriptType) -> Option<&str> {
    let raw = match script_type {
      ScriptType::Preinstall => self.preinstall.as_deref(),
      ScriptType::Postinstall => self.postinstall.as_deref(),
    };
    raw.filter(|s| !s.trim().is_empty())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packument {
  pub name: String,
  pub versions: BTreeMap<String, VersionDoc>,
  pub repository_url: Option<String>,
}

#[derive(Deserialize)]
struct RawPackument {
  #[serde(default)]
  name: Option<String>,

  #[serde(default)]
  versions: Option<serde_json::Map<String, Value>>,

  #[serde(default)]
  repository: Option<Value>,
}

impl Packument {
  /// Builds a packument from the registry document. A document without a
  /// usable `versions` object yields an empty version map.
  pub fn from_value(value: Value, requested_name: &str) -> anyhow::Result<Self> {
    let raw: RawPackument = serde_json::from_value(value)?;
    let versions = raw
      .versions
      .unwrap_or_default()
      .iter()
      .map(|(k, v)| (k.clone(), VersionDoc::from_value(v)))
      .collect();

    Ok(Self {
      name: raw
        .name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| requested_name.to_string()),
      versions,
      repository_url: raw.repository.as_ref().and_then(repository_url),
    })
  }
}

fn repository_url(repo: &Value) -> Option<String> {
  let url = match repo {
    Value::String(s) => Some(s.as_str()),
    Value::Object(o) => o.get("url").and_then(Value::as_str),
    _ => None,
  };
  url.map(str::trim).filter(|u| !u.is_empty()).map(str::to_string)
}
