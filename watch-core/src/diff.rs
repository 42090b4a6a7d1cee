//! Decides whether the newest version of a package added or changed a
//! lifecycle script relative to the version ranked just below it.

use crate::registry::{Packument, VersionDoc};
use crate::suspicion;
use crate::types::{AlertType, ScriptFinding, ScriptType};
use semver::Version;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPair {
  pub latest: String,
  pub previous: Option<String>,
}

/// Parses a version key the way the registry's own tooling accepts it:
/// surrounding whitespace and a leading `v` or `=` are tolerated.
pub fn parse_version(key: &str) -> Option<Version> {
  let trimmed = key.trim().trim_start_matches(['v', '=']).trim_start();
  Version::parse(trimmed).ok()
}

/// Highest and second-highest valid semantic versions among the packument's
/// version keys. Keys that do not parse are ignored, and `dist-tags` is
/// never consulted.
///
/// "Previous" is the runner-up in version order across every publish, not the
/// release published right before `latest`.
pub fn pick_latest_and_previous(packument: &Packument) -> Option<VersionPair> {
  let mut ranked: Vec<(Version, &str)> = packument
    .versions
    .keys()
    .filter_map(|k| parse_version(k).map(|v| (v, k.as_str())))
    .collect();
  ranked.sort_by(|a, b| b.0.cmp(&a.0));

  let mut keys = ranked.into_iter().map(|(_, k)| k.to_string());
  let latest = keys.next()?;
  Some(VersionPair {
    latest,
    previous: keys.next(),
  })
}

/// Findings for one packument, postinstall first. Each finding is already
/// scored over the latest script text.
pub fn detect(packument: &Packument) -> Vec<ScriptFinding> {
  let Some(pair) = pick_latest_and_previous(packument) else {
    return Vec::new();
  };
  let Some(latest_doc) = packument.versions.get(&pair.latest) else {
    return Vec::new();
  };
  let previous_doc = pair
    .previous
    .as_ref()
    .and_then(|p| packument.versions.get(p));

  ScriptType::ALL
    .into_iter()
    .filter_map(|script_type| {
      compare_script(script_type, latest_doc, previous_doc).map(|(alert_type, latest, prev)| {
        ScriptFinding {
          package_name: packument.name.clone(),
          latest_version: pair.latest.clone(),
          previous_version: pair.previous.clone(),
          script_type,
          script_content: latest.to_string(),
          previous_script_content: prev.map(str::to_string),
          suspicion_score: suspicion::score(Some(latest)),
          alert_type,
        }
      })
    })
    .collect()
}

fn compare_script<'a>(
  script_type: ScriptType,
  latest: &'a VersionDoc,
  previous: Option<&'a VersionDoc>,
) -> Option<(AlertType, &'a str, Option<&'a str>)> {
  let latest_cmd = latest.script(script_type)?;
  match previous.and_then(|p| p.script(script_type)) {
    None => Some((AlertType::Added, latest_cmd, None)),
    Some(prev_cmd) if prev_cmd != latest_cmd => {
      Some((AlertType::Changed, latest_cmd, Some(prev_cmd)))
    }
    Some(_) => None,
  }
}
