pub mod blacklist;
pub mod config;
pub mod console;
pub mod diff;
pub mod finding_store;
pub mod http;
pub mod logging;
pub mod monitor;
pub mod notify;
pub mod paths;
pub mod poller;
pub mod queue;
pub mod ratelimit;
pub mod registry;
pub mod suspicion;
pub mod types;
pub mod worker;

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

/// How often the main thread checks that the pipeline is still alive.
const LIVENESS_TICK: Duration = Duration::from_secs(1);

/// Level for the scoped stderr subscriber used before config is known.
const BOOTSTRAP_LOG_LEVEL: &str = "info";

pub fn run_console(args: &[String]) -> anyhow::Result<()> {
  let base = paths::base_dir()?;
  let (cfg, command) = logging::with_stderr_logging(BOOTSTRAP_LOG_LEVEL, || {
    let mut cfg = config::load_or_create_default(&paths::config_path(&base))?;
    config::apply_env(&mut cfg, |key| std::env::var(key).ok());
    if args.iter().any(|a| a == "--dry-run") {
      cfg.dry_run = true;
    }
    let command = console::parse_command(args)?;
    anyhow::Ok((cfg, command))
  })?;

  let action = logging::with_stderr_logging(&cfg.logging.level, || {
    console::run_console_command(&base, command)
  })?;
  if action == console::ConsoleAction::ExitOk {
    return Ok(());
  }

  logging::init_file_and_stderr(&paths::logs_dir(&base), &cfg.logging)?;
  tracing::info!(
    version = env!("CARGO_PKG_VERSION"),
    base = %base.display(),
    "starting script-watch"
  );

  let components = monitor::Components::from_config(&cfg, &base)?;
  let mut monitor = monitor::Monitor::new(cfg, &base, components);
  monitor.start()?;

  let (stop_tx, stop_rx) = mpsc::channel::<()>();
  ctrlc::set_handler(move || {
    let _ = stop_tx.send(());
  })?;

  loop {
    match stop_rx.recv_timeout(LIVENESS_TICK) {
      Ok(()) | Err(RecvTimeoutError::Disconnected) => {
        tracing::info!("shutdown requested");
        break;
      }
      Err(RecvTimeoutError::Timeout) if !monitor.is_running() => {
        tracing::error!("feed poller stopped unexpectedly; shutting down");
        break;
      }
      Err(RecvTimeoutError::Timeout) => {}
    }
  }

  monitor.stop();
  tracing::info!("script-watch stopped");
  Ok(())
}
