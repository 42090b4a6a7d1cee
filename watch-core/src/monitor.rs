//! Lifecycle of the whole pipeline: poller thread, worker pool and queue.

use crate::blacklist::{ConfigStore, FileConfigStore};
use crate::config::Config;
use crate::finding_store::FindingStore;
use crate::notify::Dispatcher;
use crate::poller::{CursorStore, Poller};
use crate::queue::{FileQueue, RetryPolicy};
use crate::ratelimit::RateLimiter;
use crate::registry::{ChangeFeed, HttpRegistry, PackumentSource};
use crate::worker::{PackageWorker, WorkerPool};
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

/// External collaborators the pipeline talks to.
pub struct Components {
  pub feed: Arc<dyn ChangeFeed>,
  pub packuments: Arc<dyn PackumentSource>,
  pub dispatcher: Arc<Dispatcher>,
  pub blacklist: Arc<dyn ConfigStore>,
}

impl Components {
  pub fn from_config(cfg: &Config, base: &Path) -> anyhow::Result<Self> {
    let registry = Arc::new(HttpRegistry::new(&cfg.feed, &cfg.registry)?);
    Ok(Self {
      feed: registry.clone(),
      packuments: registry,
      dispatcher: Arc::new(Dispatcher::from_config(cfg)?),
      blacklist: Arc::new(FileConfigStore::at_base(base)),
    })
  }
}

struct Running {
  poller: JoinHandle<()>,
  poller_stop: mpsc::Sender<()>,
  pool: WorkerPool,
  workers_stop: Arc<AtomicBool>,
  queue: Arc<FileQueue>,
}

pub struct Monitor {
  cfg: Config,
  base: PathBuf,
  components: Option<Components>,
  running: Option<Running>,
}

impl Monitor {
  pub fn new(cfg: Config, base: &Path, components: Components) -> Self {
    Self {
      cfg,
      base: base.to_path_buf(),
      components: Some(components),
      running: None,
    }
  }

  /// Opens the queue (redelivering anything left from the last run), then
  /// starts the workers and the feed poller.
  pub fn start(&mut self) -> anyhow::Result<()> {
    if self.running.is_some() {
      return Ok(());
    }
    let components = self
      .components
      .take()
      .ok_or_else(|| anyhow::anyhow!("monitor cannot be restarted after stop"))?;

    let queue = Arc::new(
      FileQueue::open_at_base(&self.base, RetryPolicy::from_config(&self.cfg.queue))
        .context("open job queue")?,
    );

    let worker = Arc::new(PackageWorker::new(
      components.packuments,
      components.dispatcher,
      Some(FindingStore::at_base(&self.base)),
    ));
    let workers_stop = Arc::new(AtomicBool::new(false));
    let pool = WorkerPool::spawn(
      self.cfg.worker.concurrency,
      queue.clone(),
      Arc::new(RateLimiter::new(self.cfg.worker.max_jobs_per_second)),
      worker,
      workers_stop.clone(),
    );
    let pool = match pool {
      Ok(p) => p,
      Err(e) => {
        workers_stop.store(true, Ordering::SeqCst);
        queue.wake_all();
        return Err(e);
      }
    };

    let poller = Poller::new(
      components.feed,
      queue.clone(),
      components.blacklist,
      CursorStore::at_base(&self.base),
      self.cfg.feed.changes_limit,
    );
    let interval = self.cfg.feed.poll_interval();
    let (poller_stop, stop_rx) = mpsc::channel::<()>();
    let spawned = thread::Builder::new()
      .name("feed-poller".to_string())
      .spawn(move || poller.run(stop_rx, interval));
    let poller = match spawned {
      Ok(h) => h,
      Err(e) => {
        workers_stop.store(true, Ordering::SeqCst);
        queue.wake_all();
        pool.join();
        return Err(e).context("spawn feed poller thread");
      }
    };

    tracing::info!(
      base = %self.base.display(),
      workers = pool.len(),
      pending = queue.stats().pending,
      dry_run = self.cfg.dry_run,
      "monitor started"
    );
    self.running = Some(Running {
      poller,
      poller_stop,
      pool,
      workers_stop,
      queue,
    });
    Ok(())
  }

  /// False once stopped, or if the poller thread died on its own.
  pub fn is_running(&self) -> bool {
    self.running.as_ref().is_some_and(|r| !r.poller.is_finished())
  }

  /// Stops taking new work, lets in-flight jobs finish and joins every
  /// thread. Un-acked jobs stay on disk for the next start.
  pub fn stop(&mut self) {
    let Some(running) = self.running.take() else {
      return;
    };
    tracing::info!("monitor stopping");

    let _ = running.poller_stop.send(());
    if running.poller.join().is_err() {
      tracing::error!("feed poller exited by panic");
    }

    running.workers_stop.store(true, Ordering::SeqCst);
    running.queue.wake_all();
    running.pool.join();

    let stats = running.queue.stats();
    tracing::info!(pending = stats.pending, "monitor stopped");
  }
}

impl Drop for Monitor {
  fn drop(&mut self) {
    self.stop();
  }
}
