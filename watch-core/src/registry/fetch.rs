use super::schema::{ChangesResponse, FeedHead, Packument};
use super::{ChangeFeed, ChangesPage, FeedError, PackumentSource};
use crate::config::{FeedConfig, RegistryConfig};
use crate::http::{self, HttpError};
use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::Url;
use std::time::Duration;

const MAX_FEED_PAGE_BYTES: usize = 16 * 1024 * 1024;
const MAX_PACKUMENT_BYTES: usize = 64 * 1024 * 1024;

/// Statuses the feed answers with when `since` is unknown or out of range.
const CURSOR_REJECTED_STATUSES: &[u16] = &[400, 404, 410, 416];

/// Registry-convention name encoding: `@scope/name` becomes `@scope%2Fname`,
/// unscoped names are percent-encoded as a single path segment.
pub fn encode_package_name(name: &str) -> String {
  match name.strip_prefix('@') {
    Some(rest) if rest.contains('/') => format!("@{}", urlencoding::encode(rest)),
    _ => urlencoding::encode(name).into_owned(),
  }
}

/// `base` joined with the encoded package name as its last path segment.
pub fn package_url(base: &str, name: &str) -> anyhow::Result<Url> {
  let mut raw = base.to_string();
  if !raw.ends_with('/') {
    raw.push('/');
  }
  raw.push_str(&encode_package_name(name));
  Url::parse(&raw).with_context(|| format!("build package URL for {name}"))
}

pub struct HttpRegistry {
  feed_client: Client,
  registry_client: Client,
  feed_base: Url,
  changes_url: Url,
  registry_base: String,
}

impl HttpRegistry {
  pub fn new(feed: &FeedConfig, registry: &RegistryConfig) -> anyhow::Result<Self> {
    let feed_client = http::build_client(Duration::from_secs(feed.timeout_seconds))
      .context("build feed HTTP client")?;
    let registry_client = http::build_client(Duration::from_secs(registry.timeout_seconds))
      .context("build registry HTTP client")?;

    Ok(Self {
      feed_client,
      registry_client,
      feed_base: Url::parse(&feed.base_url)
        .with_context(|| format!("invalid feed base URL: {}", feed.base_url))?,
      changes_url: Url::parse(&feed.changes_url)
        .with_context(|| format!("invalid changes URL: {}", feed.changes_url))?,
      registry_base: registry.base_url.clone(),
    })
  }

  fn changes_url_for(&self, since: u64, limit: u32) -> Url {
    let mut url = self.changes_url.clone();
    url
      .query_pairs_mut()
      .append_pair("since", &since.to_string())
      .append_pair("limit", &limit.to_string());
    url
  }
}

impl ChangeFeed for HttpRegistry {
  fn head(&self) -> Result<u64, FeedError> {
    let head: FeedHead = http::get_json(&self.feed_client, &self.feed_base, MAX_FEED_PAGE_BYTES)?;
    Ok(head.update_seq.0)
  }

  fn changes_since(&self, since: u64, limit: u32) -> Result<ChangesPage, FeedError> {
    let url = self.changes_url_for(since, limit);
    let page: ChangesResponse =
      match http::get_json(&self.feed_client, &url, MAX_FEED_PAGE_BYTES) {
        Ok(p) => p,
        Err(HttpError::Status { status, .. }) if CURSOR_REJECTED_STATUSES.contains(&status) => {
          return Err(FeedError::CursorRejected { since, status });
        }
        Err(e) => return Err(e.into()),
      };

    Ok(page.into_page())
  }
}

impl PackumentSource for HttpRegistry {
  fn packument(&self, package_name: &str) -> anyhow::Result<Packument> {
    let url = package_url(&self.registry_base, package_name)?;
    let doc: serde_json::Value = http::get_json(&self.registry_client, &url, MAX_PACKUMENT_BYTES)
      .with_context(|| format!("fetch packument for {package_name}"))?;
    Packument::from_value(doc, package_name)
      .with_context(|| format!("parse packument for {package_name}"))
  }
}
