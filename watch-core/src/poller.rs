//! Producer side: turns the registry change feed into queued package jobs.

use crate::blacklist::ConfigStore;
use crate::paths;
use crate::queue::JobQueue;
use crate::registry::{ChangeFeed, FeedError};
use crate::types::{now_unix_ms, short_error, PackageJob};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CursorRecord {
  last_seq: u64,
  updated_at_unix_ms: u64,
}

/// Feed position persisted across restarts in `cursor.toml`.
pub struct CursorStore {
  path: PathBuf,
}

impl CursorStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn at_base(base: &Path) -> Self {
    Self::new(paths::cursor_path(base))
  }

  /// `None` when nothing was saved yet. An unreadable record is moved aside
  /// and also reads as `None`, which re-anchors at the feed head.
  pub fn load(&self) -> anyhow::Result<Option<u64>> {
    if !self.path.exists() {
      return Ok(None);
    }
    let raw = fs::read_to_string(&self.path)
      .with_context(|| format!("read {}", self.path.display()))?;
    match toml::from_str::<CursorRecord>(&raw) {
      Ok(rec) => Ok(Some(rec.last_seq)),
      Err(e) => {
        let backup = self
          .path
          .with_extension(format!("toml.bad-{}", now_unix_ms() / 1000));
        let _ = fs::rename(&self.path, &backup);
        tracing::warn!(
          path = %self.path.display(),
          backup = %backup.display(),
          error = %e,
          "cursor record unreadable; re-anchoring at feed head"
        );
        Ok(None)
      }
    }
  }

  pub fn save(&self, seq: u64) -> anyhow::Result<()> {
    let rec = CursorRecord {
      last_seq: seq,
      updated_at_unix_ms: now_unix_ms(),
    };
    let raw = toml::to_string_pretty(&rec).context("serialize cursor")?;
    paths::write_atomic(&self.path, raw.as_bytes())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
  /// First run: cursor placed at the feed head, nothing enqueued.
  Anchored { seq: u64 },
  Batch {
    enqueued: usize,
    deleted: usize,
    blacklisted: usize,
    duplicates: usize,
    cursor: u64,
  },
  /// The feed no longer recognises the cursor; it was moved back.
  Reset { from: u64, to: u64 },
  /// Nothing changed; retried on the next interval.
  Failed(String),
}

pub struct Poller {
  feed: Arc<dyn ChangeFeed>,
  queue: Arc<dyn JobQueue>,
  blacklist: Arc<dyn ConfigStore>,
  cursor: CursorStore,
  limit: u32,
}

impl Poller {
  pub fn new(
    feed: Arc<dyn ChangeFeed>,
    queue: Arc<dyn JobQueue>,
    blacklist: Arc<dyn ConfigStore>,
    cursor: CursorStore,
    limit: u32,
  ) -> Self {
    Self {
      feed,
      queue,
      blacklist,
      cursor,
      limit: limit.max(1),
    }
  }

  /// Sequential loop: wait one interval, poll, repeat. A message on
  /// `stop_rx` or a dropped sender ends it.
  pub fn run(&self, stop_rx: mpsc::Receiver<()>, interval: Duration) {
    tracing::info!(interval_ms = interval.as_millis() as u64, limit = self.limit, "feed poller started");
    loop {
      match stop_rx.recv_timeout(interval) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        Err(RecvTimeoutError::Timeout) => {}
      }
      self.poll_once();
    }
    tracing::info!("feed poller exiting");
  }

  pub fn poll_once(&self) -> PollOutcome {
    let since = match self.cursor.load() {
      Ok(Some(seq)) => seq,
      Ok(None) => return self.anchor(),
      Err(e) => return failed("load cursor", &e),
    };

    // Re-read every cycle so admin changes apply without a restart.
    let blacklist = match self.blacklist.get() {
      Ok(b) => b,
      Err(e) => return failed("read blacklist", &e),
    };

    let page = match self.feed.changes_since(since, self.limit) {
      Ok(page) => page,
      Err(FeedError::CursorRejected { status, .. }) => {
        tracing::warn!(cursor = since, status, "feed rejected cursor; restarting from 0");
        return self.reset(since, 0);
      }
      Err(e) => return failed("fetch changes", &anyhow::Error::from(e)),
    };

    if let Some(last) = page.last_seq {
      if last < since {
        tracing::warn!(cursor = since, last_seq = last, "feed sequence went backwards; moving cursor back");
        return self.reset(since, last);
      }
    }

    let mut seen = HashSet::new();
    let (mut enqueued, mut deleted, mut blacklisted, mut duplicates) = (0, 0, 0, 0);
    for ev in &page.events {
      if ev.deleted {
        deleted += 1;
        continue;
      }
      if let Some(author) = ev.author_name.as_deref() {
        if blacklist.is_blacklisted(author) {
          tracing::debug!(package = %ev.package_name, author = %author, "skipping blacklisted author");
          blacklisted += 1;
          continue;
        }
      }
      if !seen.insert(ev.package_name.as_str()) {
        duplicates += 1;
        continue;
      }
      if let Err(e) = self.queue.enqueue(PackageJob::new(ev.package_name.clone())) {
        // Cursor stays put; jobs already queued collapse on the retry.
        return failed("enqueue job", &e);
      }
      enqueued += 1;
    }

    let cursor = page
      .last_seq
      .or_else(|| page.events.iter().map(|e| e.seq).max())
      .unwrap_or(since)
      .max(since);
    if cursor != since {
      if let Err(e) = self.cursor.save(cursor) {
        return failed("save cursor", &e);
      }
    }

    if enqueued > 0 || !page.events.is_empty() {
      tracing::info!(
        events = page.events.len(),
        enqueued,
        deleted,
        blacklisted,
        duplicates,
        cursor,
        "feed batch processed"
      );
    }
    PollOutcome::Batch {
      enqueued,
      deleted,
      blacklisted,
      duplicates,
      cursor,
    }
  }

  fn anchor(&self) -> PollOutcome {
    let head = match self.feed.head() {
      Ok(seq) => seq,
      Err(e) => return failed("fetch feed head", &anyhow::Error::from(e)),
    };
    if let Err(e) = self.cursor.save(head) {
      return failed("save cursor", &e);
    }
    tracing::info!(seq = head, "no saved cursor; starting at feed head");
    PollOutcome::Anchored { seq: head }
  }

  fn reset(&self, from: u64, to: u64) -> PollOutcome {
    if let Err(e) = self.cursor.save(to) {
      return failed("save cursor", &e);
    }
    PollOutcome::Reset { from, to }
  }
}

fn failed(step: &str, e: &anyhow::Error) -> PollOutcome {
  let reason = short_error(e);
  tracing::warn!(step, error = %reason, "poll cycle failed; retrying next interval");
  PollOutcome::Failed(reason)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::blacklist::{add_author, remove_author, MemoryConfigStore};
  use crate::http::HttpError;
  use crate::queue::{Delivery, RetryOutcome};
  use crate::registry::schema::ChangesResponse;
  use crate::registry::ChangesPage;
  use crate::types::ChangeEvent;
  use std::collections::VecDeque;
  use std::sync::Mutex;

  #[derive(Default)]
  struct FakeFeed {
    head: u64,
    pages: Mutex<VecDeque<Result<ChangesPage, FeedError>>>,
    asked: Mutex<Vec<u64>>,
  }

  impl FakeFeed {
    fn push(&self, page: Result<ChangesPage, FeedError>) {
      self.pages.lock().unwrap().push_back(page);
    }
  }

  impl ChangeFeed for FakeFeed {
    fn head(&self) -> Result<u64, FeedError> {
      Ok(self.head)
    }

    fn changes_since(&self, since: u64, _limit: u32) -> Result<ChangesPage, FeedError> {
      self.asked.lock().unwrap().push(since);
      self.pages.lock().unwrap().pop_front().unwrap_or_else(|| {
        Ok(ChangesPage {
          events: Vec::new(),
          last_seq: None,
        })
      })
    }
  }

  #[derive(Default)]
  struct RecordingQueue {
    jobs: Mutex<Vec<String>>,
  }

  impl JobQueue for RecordingQueue {
    fn enqueue(&self, job: PackageJob) -> anyhow::Result<()> {
      self.jobs.lock().unwrap().push(job.package_name);
      Ok(())
    }

    fn consume(&self, _wait: Duration) -> anyhow::Result<Option<Delivery>> {
      Ok(None)
    }

    fn ack(&self, _delivery: &Delivery) -> anyhow::Result<()> {
      Ok(())
    }

    fn retry_later(&self, _delivery: &Delivery, _reason: &str) -> anyhow::Result<RetryOutcome> {
      Ok(RetryOutcome::PermanentlyFailed)
    }
  }

  fn ev(seq: u64, name: &str, author: Option<&str>, deleted: bool) -> ChangeEvent {
    ChangeEvent {
      seq,
      package_name: name.to_string(),
      author_name: author.map(str::to_string),
      deleted,
    }
  }

  fn page(events: Vec<ChangeEvent>, last_seq: Option<u64>) -> Result<ChangesPage, FeedError> {
    Ok(ChangesPage { events, last_seq })
  }

  struct Harness {
    _tmp: tempfile::TempDir,
    feed: Arc<FakeFeed>,
    queue: Arc<RecordingQueue>,
    blacklist: Arc<MemoryConfigStore>,
    cursor_path: PathBuf,
    poller: Poller,
  }

  fn harness(start: Option<u64>, head: u64) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let cursor_path = paths::cursor_path(tmp.path());
    if let Some(seq) = start {
      CursorStore::new(&cursor_path).save(seq).unwrap();
    }
    let feed = Arc::new(FakeFeed {
      head,
      ..FakeFeed::default()
    });
    let queue = Arc::new(RecordingQueue::default());
    let blacklist = Arc::new(MemoryConfigStore::default());
    let poller = Poller::new(
      feed.clone(),
      queue.clone(),
      blacklist.clone(),
      CursorStore::new(&cursor_path),
      100,
    );
    Harness {
      _tmp: tmp,
      feed,
      queue,
      blacklist,
      cursor_path,
      poller,
    }
  }

  impl Harness {
    fn cursor(&self) -> Option<u64> {
      CursorStore::new(&self.cursor_path).load().unwrap()
    }

    fn jobs(&self) -> Vec<String> {
      self.queue.jobs.lock().unwrap().clone()
    }
  }

  #[test]
  fn first_run_anchors_at_head_without_enqueueing() {
    let h = harness(None, 9_000);
    assert_eq!(h.poller.poll_once(), PollOutcome::Anchored { seq: 9_000 });
    assert_eq!(h.cursor(), Some(9_000));
    assert!(h.feed.asked.lock().unwrap().is_empty());
    assert!(h.jobs().is_empty());
  }

  #[test]
  fn cursor_advances_past_skipped_entries() {
    let h = harness(Some(10), 0);
    add_author(h.blacklist.as_ref(), "mallory").unwrap();
    h.feed.push(page(
      vec![
        ev(11, "a", Some("alice"), false),
        ev(12, "gone", None, true),
        ev(13, "bad", Some("mallory"), false),
        ev(14, "a", Some("alice"), false),
        ev(15, "b", None, false),
      ],
      Some(15),
    ));

    let out = h.poller.poll_once();
    assert_eq!(
      out,
      PollOutcome::Batch {
        enqueued: 2,
        deleted: 1,
        blacklisted: 1,
        duplicates: 1,
        cursor: 15
      }
    );
    assert_eq!(h.jobs(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(h.cursor(), Some(15));
  }

  #[test]
  fn cursor_uses_last_event_when_feed_sends_no_last_seq() {
    let h = harness(Some(10), 0);
    h.feed.push(page(vec![ev(12, "gone", None, true), ev(17, "x", None, true)], None));
    h.poller.poll_once();
    assert_eq!(h.cursor(), Some(17));
    assert!(h.jobs().is_empty());
  }

  #[test]
  fn malformed_feed_row_does_not_stall_the_cursor() {
    let h = harness(Some(10), 0);
    let raw: ChangesResponse = serde_json::from_value(serde_json::json!({
      "results": [{"seq": 10, "id": "ok-pkg"}, {"seq": 11, "id": null}],
      "last_seq": 11
    }))
    .unwrap();
    h.feed.push(Ok(raw.into_page()));

    match h.poller.poll_once() {
      PollOutcome::Batch { enqueued, cursor, .. } => {
        assert_eq!(enqueued, 1);
        assert_eq!(cursor, 11);
      }
      other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(h.jobs(), vec!["ok-pkg".to_string()]);
    assert_eq!(h.cursor(), Some(11));

    h.poller.poll_once();
    assert_eq!(*h.feed.asked.lock().unwrap(), vec![10, 11]);
  }

  #[test]
  fn unblacklisting_is_seen_on_the_next_poll() {
    let h = harness(Some(0), 0);
    add_author(h.blacklist.as_ref(), "mallory").unwrap();
    h.feed.push(page(vec![ev(1, "p1", Some("mallory"), false)], Some(1)));
    h.poller.poll_once();
    assert!(h.jobs().is_empty());

    remove_author(h.blacklist.as_ref(), "mallory").unwrap();
    h.feed.push(page(vec![ev(2, "p2", Some("mallory"), false)], Some(2)));
    h.poller.poll_once();
    assert_eq!(h.jobs(), vec!["p2".to_string()]);
  }

  #[test]
  fn http_failure_leaves_cursor_untouched() {
    let h = harness(Some(42), 0);
    h.feed.push(Err(FeedError::Http(HttpError::Timeout {
      label: "changes".to_string(),
    })));
    assert!(matches!(h.poller.poll_once(), PollOutcome::Failed(r) if r.contains("request timeout")));
    assert_eq!(h.cursor(), Some(42));

    h.feed.push(page(vec![ev(43, "later", None, false)], Some(43)));
    h.poller.poll_once();
    assert_eq!(*h.feed.asked.lock().unwrap(), vec![42, 42]);
    assert_eq!(h.cursor(), Some(43));
  }

  #[test]
  fn regression_moves_cursor_back_to_feed_last_seq() {
    let h = harness(Some(500), 0);
    h.feed.push(page(Vec::new(), Some(120)));
    assert_eq!(h.poller.poll_once(), PollOutcome::Reset { from: 500, to: 120 });
    assert_eq!(h.cursor(), Some(120));
  }

  #[test]
  fn rejected_cursor_resets_to_zero() {
    let h = harness(Some(500), 0);
    h.feed.push(Err(FeedError::CursorRejected { since: 500, status: 400 }));
    assert_eq!(h.poller.poll_once(), PollOutcome::Reset { from: 500, to: 0 });
    assert_eq!(h.cursor(), Some(0));
  }

  #[test]
  fn corrupt_cursor_re_anchors() {
    let h = harness(None, 77);
    fs::write(&h.cursor_path, "last_seq = \"nope").unwrap();
    assert_eq!(h.poller.poll_once(), PollOutcome::Anchored { seq: 77 });
    assert_eq!(h.cursor(), Some(77));
  }

  #[test]
  fn run_stops_when_sender_is_dropped() {
    let h = harness(Some(0), 0);
    let (tx, rx) = mpsc::channel::<()>();
    drop(tx);
    h.poller.run(rx, Duration::from_millis(1));
  }
}
