use super::{Alert, Channel, Delivered};
use crate::http;
use crate::types::{AlertType, ScriptFinding};
use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::Url;
use serde::Serialize;
use std::time::Duration;

const API_BASE: &str = "https://api.github.com";
const GITHUB_HOSTS: [&str; 2] = ["github.com", "www.github.com"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSlug {
  pub owner: String,
  pub repo: String,
}

#[derive(Serialize)]
struct NewIssue<'a> {
  title: &'a str,
  body: &'a str,
}

/// Opens an issue on the package's own repository for high-confidence
/// findings.
pub struct GithubChannel {
  client: Client,
  token: String,
  min_score: u32,
}

impl GithubChannel {
  pub fn new(token: &str, min_score: u32, timeout: Duration) -> anyhow::Result<Self> {
    Ok(Self {
      client: http::build_client(timeout).context("build github HTTP client")?,
      token: token.to_string(),
      min_score,
    })
  }
}

impl Channel for GithubChannel {
  fn name(&self) -> &'static str {
    "github"
  }

  fn send(&self, alert: &Alert<'_>) -> anyhow::Result<Delivered> {
    let f = alert.finding;
    if !f.is_high_confidence(self.min_score) {
      return Ok(Delivered::Skipped(format!(
        "score {} below {}",
        f.suspicion_score, self.min_score
      )));
    }
    let Some(repo_url) = alert.repository_url else {
      return Ok(Delivered::Skipped("no repository url".to_string()));
    };
    let Some(slug) = parse_repo_slug(repo_url) else {
      tracing::warn!(
        package = %f.package_name,
        repository = %repo_url,
        "repository is not a recognisable GitHub URL; issue not opened"
      );
      return Ok(Delivered::Skipped("repository is not on GitHub".to_string()));
    };

    let url = Url::parse(&format!(
      "{API_BASE}/repos/{}/{}/issues",
      urlencoding::encode(&slug.owner),
      urlencoding::encode(&slug.repo)
    ))
    .context("build issues URL")?;

    let title = issue_title(f);
    let body = issue_body(f);
    http::post_json(
      &self.client,
      &url,
      &NewIssue {
        title: &title,
        body: &body,
      },
      &[
        ("Authorization", format!("token {}", self.token)),
        ("Accept", "application/vnd.github.v3+json".to_string()),
      ],
      "github",
    )?;
    tracing::info!(owner = %slug.owner, repo = %slug.repo, package = %f.package_name, "issue opened");
    Ok(Delivered::Sent)
  }
}

/// Owner and repository from the forms `repository.url` takes in the wild:
/// `git+https://github.com/o/r.git`, `git://github.com/o/r`,
/// `git@github.com:o/r.git`, `github:o/r`, or bare `o/r`. Anything hosted
/// elsewhere yields `None`.
pub fn parse_repo_slug(raw: &str) -> Option<RepoSlug> {
  let raw = raw.trim();
  let raw = raw.strip_prefix("git+").unwrap_or(raw);

  let path = if let Some(rest) = raw.strip_prefix("github:") {
    rest.to_string()
  } else if let Some(rest) = raw.strip_prefix("git@github.com:") {
    rest.to_string()
  } else if raw.contains("://") {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    if !GITHUB_HOSTS.contains(&host.as_str()) {
      return None;
    }
    url.path().to_string()
  } else if !raw.contains(':') && raw.matches('/').count() == 1 {
    raw.to_string()
  } else {
    return None;
  };

  let mut parts = path.split('/').filter(|p| !p.is_empty());
  let owner = parts.next()?.to_string();
  let repo = parts.next()?;
  let repo = repo.strip_suffix(".git").unwrap_or(repo).to_string();
  if repo.is_empty() {
    return None;
  }
  Some(RepoSlug { owner, repo })
}

pub fn issue_title(f: &ScriptFinding) -> String {
  match f.alert_type {
    AlertType::Changed => format!(
      "[Security Alert] `{}` script changed in `{}@{}`",
      f.script_type, f.package_name, f.latest_version
    ),
    AlertType::Added => format!(
      "[Security Alert] New `{}` script added in `{}@{}`",
      f.script_type, f.package_name, f.latest_version
    ),
  }
}

pub fn issue_body(f: &ScriptFinding) -> String {
  let st = f.script_type;
  let intro = match f.alert_type {
    AlertType::Changed => format!(
      "The `{st}` script was changed in version `{}` of the package `{}`.",
      f.latest_version, f.package_name
    ),
    AlertType::Added => format!(
      "A new `{st}` script was detected in version `{}` of the package `{}`.",
      f.latest_version, f.package_name
    ),
  };

  let mut body = format!("{intro}\n\n**Suspicion score:** {}\n\n", f.suspicion_score);
  match f.alert_type {
    AlertType::Changed => {
      body.push_str(&format!(
        "**Previous version:** {}\n**Previous script:**\n```\n{}\n```\n\n**New script:**\n```\n{}\n```\n",
        f.previous_version.as_deref().unwrap_or("none"),
        f.previous_script_content.as_deref().unwrap_or_default(),
        f.script_content,
      ));
    }
    AlertType::Added => {
      body.push_str(&format!("**Script content:**\n```\n{}\n```\n", f.script_content));
    }
  }
  body.push_str("\nThis could be a security risk. Please investigate.\n");
  body
}
