//! Durable at-least-once job queue between the feed poller and the workers.
//!
//! Each pending job is one JSON file under `queue/pending`. A job stays on
//! disk until it is acked, so anything in flight when the process dies is
//! delivered again on the next start.

use crate::config::QueueConfig;
use crate::paths;
use crate::types::{now_unix_ms, PackageJob};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
  pub id: String,
  pub job: PackageJob,
  /// 1 for the first delivery.
  pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
  Scheduled { delay: Duration },
  PermanentlyFailed,
}

pub trait JobQueue: Send + Sync {
  fn enqueue(&self, job: PackageJob) -> anyhow::Result<()>;

  /// Waits up to `wait` for a job that is due.
  fn consume(&self, wait: Duration) -> anyhow::Result<Option<Delivery>>;

  fn ack(&self, delivery: &Delivery) -> anyhow::Result<()>;

  fn retry_later(&self, delivery: &Delivery, reason: &str) -> anyhow::Result<RetryOutcome>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub backoff_base: Duration,
  pub backoff_max: Duration,
  pub visibility_timeout: Duration,
}

impl RetryPolicy {
  pub fn from_config(cfg: &QueueConfig) -> Self {
    Self {
      max_attempts: cfg.max_attempts.max(1),
      backoff_base: Duration::from_millis(cfg.backoff_base_ms),
      backoff_max: Duration::from_millis(cfg.backoff_max_ms),
      visibility_timeout: Duration::from_secs(cfg.visibility_timeout_seconds),
    }
  }

  /// `base * 2^(failures-1)`, capped at `backoff_max`.
  pub fn backoff(&self, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(20);
    self
      .backoff_base
      .saturating_mul(1u32 << exp)
      .min(self.backoff_max)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from_config(&QueueConfig::default())
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
  id: String,
  job: PackageJob,
  #[serde(default)]
  failures: u32,
  #[serde(default)]
  not_before_unix_ms: u64,
  #[serde(default)]
  last_error: Option<String>,
}

#[derive(Debug, Default)]
struct State {
  records: HashMap<String, JobRecord>,
  ready: VecDeque<String>,
  /// id -> redelivery deadline
  in_flight: HashMap<String, u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
  pub pending: usize,
  pub in_flight: usize,
}

pub struct FileQueue {
  pending_dir: PathBuf,
  failed_dir: PathBuf,
  policy: RetryPolicy,
  state: Mutex<State>,
  available: Condvar,
}

impl FileQueue {
  /// Opens (or creates) the queue under `dir` and reloads every job that was
  /// not acked before the last shutdown.
  pub fn open(dir: &Path, policy: RetryPolicy) -> anyhow::Result<Self> {
    let pending_dir = dir.join("pending");
    let failed_dir = dir.join("failed");
    fs::create_dir_all(&pending_dir).with_context(|| format!("create {}", pending_dir.display()))?;
    fs::create_dir_all(&failed_dir).with_context(|| format!("create {}", failed_dir.display()))?;

    let mut records = Vec::new();
    for entry in fs::read_dir(&pending_dir)
      .with_context(|| format!("read {}", pending_dir.display()))?
      .flatten()
    {
      let path = entry.path();
      if path.extension().and_then(|s| s.to_str()) != Some("json") {
        continue;
      }
      let parsed = fs::read(&path)
        .map_err(anyhow::Error::from)
        .and_then(|raw| serde_json::from_slice::<JobRecord>(&raw).map_err(anyhow::Error::from));
      match parsed {
        Ok(rec) => records.push(rec),
        Err(e) => {
          tracing::warn!(path = %path.display(), error = %e, "unreadable queue record; moving to failed");
          let _ = fs::rename(&path, failed_dir.join(path.file_name().unwrap_or_default()));
        }
      }
    }
    records.sort_by_key(|r| r.job.enqueued_at_unix_ms);

    let mut state = State::default();
    for rec in records {
      state.ready.push_back(rec.id.clone());
      state.records.insert(rec.id.clone(), rec);
    }
    if !state.records.is_empty() {
      tracing::info!(pending = state.records.len(), "queue reloaded unacknowledged jobs");
    }

    Ok(Self {
      pending_dir,
      failed_dir,
      policy,
      state: Mutex::new(state),
      available: Condvar::new(),
    })
  }

  pub fn open_at_base(base: &Path, policy: RetryPolicy) -> anyhow::Result<Self> {
    Self::open(&paths::queue_dir(base), policy)
  }

  pub fn stats(&self) -> QueueStats {
    let state = self.lock();
    QueueStats {
      pending: state.records.len(),
      in_flight: state.in_flight.len(),
    }
  }

  /// Wakes every blocked consumer, e.g. on shutdown.
  pub fn wake_all(&self) {
    self.available.notify_all();
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|p| p.into_inner())
  }

  fn record_path(&self, id: &str) -> PathBuf {
    self.pending_dir.join(format!("{id}.json"))
  }

  fn persist(&self, rec: &JobRecord) -> anyhow::Result<()> {
    let raw = serde_json::to_vec_pretty(rec).context("serialize queue record")?;
    paths::write_atomic(&self.record_path(&rec.id), &raw)
  }

  fn take_due(&self, state: &mut State, now: u64) -> Option<Delivery> {
    let expired: Vec<String> = state
      .in_flight
      .iter()
      .filter(|(_, deadline)| **deadline <= now)
      .map(|(id, _)| id.clone())
      .collect();
    for id in expired {
      state.in_flight.remove(&id);
      if state.records.contains_key(&id) {
        tracing::warn!(job_id = %id, "delivery not acknowledged in time; redelivering");
        state.ready.push_back(id);
      }
    }

    let pos = state.ready.iter().position(|id| {
      state
        .records
        .get(id)
        .is_some_and(|r| r.not_before_unix_ms <= now)
    })?;
    let id = state.ready.remove(pos)?;
    let rec = state.records.get(&id)?.clone();
    let visibility_ms = self.policy.visibility_timeout.as_millis() as u64;
    state.in_flight.insert(id.clone(), now.saturating_add(visibility_ms));

    Some(Delivery {
      id,
      job: rec.job,
      attempt: rec.failures + 1,
    })
  }

  fn next_wake(&self, state: &State, now: u64) -> Option<u64> {
    let due = state
      .ready
      .iter()
      .filter_map(|id| state.records.get(id))
      .map(|r| r.not_before_unix_ms);
    let redelivery = state.in_flight.values().copied();
    due.chain(redelivery).min().map(|t| t.saturating_sub(now))
  }
}

impl JobQueue for FileQueue {
  fn enqueue(&self, job: PackageJob) -> anyhow::Result<()> {
    let mut state = self.lock();

    // A waiting job for the same package will fetch fresh metadata anyway.
    let duplicate = state.ready.iter().any(|id| {
      state
        .records
        .get(id)
        .is_some_and(|r| r.job.package_name == job.package_name && r.failures == 0)
    });
    if duplicate {
      tracing::debug!(package = %job.package_name, "job already pending; not enqueued again");
      return Ok(());
    }

    let rec = JobRecord {
      id: uuid::Uuid::new_v4().simple().to_string(),
      job,
      failures: 0,
      not_before_unix_ms: 0,
      last_error: None,
    };
    self.persist(&rec)?;
    state.ready.push_back(rec.id.clone());
    state.records.insert(rec.id.clone(), rec);
    drop(state);

    self.available.notify_one();
    Ok(())
  }

  fn consume(&self, wait: Duration) -> anyhow::Result<Option<Delivery>> {
    let deadline = now_unix_ms().saturating_add(wait.as_millis() as u64);
    let mut state = self.lock();
    loop {
      let now = now_unix_ms();
      if let Some(delivery) = self.take_due(&mut state, now) {
        return Ok(Some(delivery));
      }
      if now >= deadline {
        return Ok(None);
      }

      let mut sleep_ms = deadline - now;
      if let Some(wake) = self.next_wake(&state, now) {
        sleep_ms = sleep_ms.min(wake.max(1));
      }
      let (guard, _) = self
        .available
        .wait_timeout(state, Duration::from_millis(sleep_ms))
        .unwrap_or_else(|p| p.into_inner());
      state = guard;
    }
  }

  fn ack(&self, delivery: &Delivery) -> anyhow::Result<()> {
    let mut state = self.lock();
    state.in_flight.remove(&delivery.id);
    state.ready.retain(|id| id != &delivery.id);
    if state.records.remove(&delivery.id).is_none() {
      return Ok(());
    }
    drop(state);

    let path = self.record_path(&delivery.id);
    match fs::remove_file(&path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
  }

  fn retry_later(&self, delivery: &Delivery, reason: &str) -> anyhow::Result<RetryOutcome> {
    let mut state = self.lock();
    state.in_flight.remove(&delivery.id);
    let Some(mut rec) = state.records.get(&delivery.id).cloned() else {
      // Already acked by a redelivered copy.
      return Ok(RetryOutcome::PermanentlyFailed);
    };

    rec.failures = delivery.attempt.max(rec.failures + 1);
    rec.last_error = Some(reason.chars().take(500).collect());

    if rec.failures >= self.policy.max_attempts {
      state.records.remove(&rec.id);
      state.ready.retain(|id| id != &rec.id);
      drop(state);

      let raw = serde_json::to_vec_pretty(&rec).context("serialize failed record")?;
      paths::write_atomic(&self.failed_dir.join(format!("{}.json", rec.id)), &raw)?;
      let _ = fs::remove_file(self.record_path(&rec.id));
      tracing::error!(
        job_id = %rec.id,
        package = %rec.job.package_name,
        attempts = rec.failures,
        reason = %reason,
        "job permanently failed"
      );
      return Ok(RetryOutcome::PermanentlyFailed);
    }

    let delay = self.policy.backoff(rec.failures);
    rec.not_before_unix_ms = now_unix_ms().saturating_add(delay.as_millis() as u64);
    self.persist(&rec)?;
    if !state.ready.contains(&rec.id) {
      state.ready.push_back(rec.id.clone());
    }
    state.records.insert(rec.id.clone(), rec);
    drop(state);

    self.available.notify_one();
    Ok(RetryOutcome::Scheduled { delay })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn policy() -> RetryPolicy {
    RetryPolicy {
      max_attempts: 3,
      backoff_base: Duration::from_millis(1),
      backoff_max: Duration::from_millis(4),
      visibility_timeout: Duration::from_secs(60),
    }
  }

  fn pending_files(dir: &Path) -> usize {
    fs::read_dir(dir.join("pending")).unwrap().flatten().count()
  }

  #[test]
  fn enqueue_consume_ack_removes_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let q = FileQueue::open(dir.path(), policy()).unwrap();
    q.enqueue(PackageJob::new("left-pad")).unwrap();
    assert_eq!(pending_files(dir.path()), 1);

    let d = q.consume(Duration::from_millis(10)).unwrap().unwrap();
    assert_eq!(d.job.package_name, "left-pad");
    assert_eq!(d.attempt, 1);
    q.ack(&d).unwrap();
    q.ack(&d).unwrap();

    assert_eq!(pending_files(dir.path()), 0);
    assert!(q.consume(Duration::from_millis(5)).unwrap().is_none());
  }

  #[test]
  fn unacked_jobs_are_redelivered_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
      let q = FileQueue::open(dir.path(), policy()).unwrap();
      q.enqueue(PackageJob::new("a")).unwrap();
      q.enqueue(PackageJob::new("b")).unwrap();
      let _in_flight = q.consume(Duration::from_millis(10)).unwrap().unwrap();
      // Process "crashes" here without acking.
    }

    let q = FileQueue::open(dir.path(), policy()).unwrap();
    assert_eq!(q.stats().pending, 2);
    let mut names = vec![
      q.consume(Duration::from_millis(10)).unwrap().unwrap().job.package_name,
      q.consume(Duration::from_millis(10)).unwrap().unwrap().job.package_name,
    ];
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
  }

  #[test]
  fn retries_are_capped_and_land_in_failed() {
    let dir = tempfile::tempdir().unwrap();
    let q = FileQueue::open(dir.path(), policy()).unwrap();
    q.enqueue(PackageJob::new("flaky")).unwrap();

    for expected_attempt in 1..=2 {
      let d = q.consume(Duration::from_millis(200)).unwrap().unwrap();
      assert_eq!(d.attempt, expected_attempt);
      let outcome = q.retry_later(&d, "HTTP 503").unwrap();
      assert!(matches!(outcome, RetryOutcome::Scheduled { .. }));
    }

    let d = q.consume(Duration::from_millis(200)).unwrap().unwrap();
    assert_eq!(d.attempt, 3);
    assert_eq!(q.retry_later(&d, "HTTP 503").unwrap(), RetryOutcome::PermanentlyFailed);

    assert_eq!(pending_files(dir.path()), 0);
    assert_eq!(fs::read_dir(dir.path().join("failed")).unwrap().count(), 1);
    assert!(q.consume(Duration::from_millis(20)).unwrap().is_none());
  }

  #[test]
  fn retry_waits_for_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = policy();
    p.backoff_base = Duration::from_secs(30);
    p.backoff_max = Duration::from_secs(30);
    let q = FileQueue::open(dir.path(), p).unwrap();
    q.enqueue(PackageJob::new("slow")).unwrap();

    let d = q.consume(Duration::from_millis(10)).unwrap().unwrap();
    q.retry_later(&d, "timeout").unwrap();
    assert!(q.consume(Duration::from_millis(20)).unwrap().is_none());
    assert_eq!(q.stats().pending, 1);
  }

  #[test]
  fn expired_visibility_triggers_redelivery() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = policy();
    p.visibility_timeout = Duration::from_millis(5);
    let q = FileQueue::open(dir.path(), p).unwrap();
    q.enqueue(PackageJob::new("stuck")).unwrap();

    let first = q.consume(Duration::from_millis(10)).unwrap().unwrap();
    let second = q.consume(Duration::from_millis(200)).unwrap().unwrap();
    assert_eq!(first.id, second.id);
  }

  #[test]
  fn waiting_duplicate_is_collapsed_but_in_flight_is_not() {
    let dir = tempfile::tempdir().unwrap();
    let q = FileQueue::open(dir.path(), policy()).unwrap();
    q.enqueue(PackageJob::new("dup")).unwrap();
    q.enqueue(PackageJob::new("dup")).unwrap();
    assert_eq!(q.stats().pending, 1);

    let _d = q.consume(Duration::from_millis(10)).unwrap().unwrap();
    q.enqueue(PackageJob::new("dup")).unwrap();
    assert_eq!(q.stats().pending, 2);
  }

  #[test]
  fn backoff_doubles_and_caps() {
    let p = RetryPolicy {
      max_attempts: 10,
      backoff_base: Duration::from_secs(2),
      backoff_max: Duration::from_secs(10),
      visibility_timeout: Duration::from_secs(1),
    };
    assert_eq!(p.backoff(1), Duration::from_secs(2));
    assert_eq!(p.backoff(2), Duration::from_secs(4));
    assert_eq!(p.backoff(3), Duration::from_secs(8));
    assert_eq!(p.backoff(4), Duration::from_secs(10));
  }
}
