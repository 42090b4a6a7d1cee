use crate::http::HttpError;
use crate::types::ChangeEvent;
use thiserror::Error;

pub mod fetch;
pub mod schema;

pub use fetch::{encode_package_name, HttpRegistry};
pub use schema::{Packument, VersionDoc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesPage {
  pub events: Vec<ChangeEvent>,
  /// Feed-reported end of this page, when the feed sends one.
  pub last_seq: Option<u64>,
}

#[derive(Debug, Error)]
pub enum FeedError {
  /// The feed refused `since`; the caller has to pick a new starting point.
  #[error("feed rejected cursor {since} (HTTP {status})")]
  CursorRejected { since: u64, status: u16 },

  #[error(transparent)]
  Http(#[from] HttpError),
}

/// Cursor-addressed change feed.
pub trait ChangeFeed: Send + Sync {
  /// Current head sequence of the feed.
  fn head(&self) -> Result<u64, FeedError>;

  fn changes_since(&self, since: u64, limit: u32) -> Result<ChangesPage, FeedError>;
}

/// Per-package metadata document source. Never cached between calls.
pub trait PackumentSource: Send + Sync {
  fn packument(&self, package_name: &str) -> anyhow::Result<Packument>;
}
