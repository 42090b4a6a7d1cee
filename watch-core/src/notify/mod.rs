//! Fan-out of findings to the configured alert channels.
//!
//! Channels run side by side and never see each other's failures: an error,
//! timeout, or panic in one is logged and reported for that channel only.

use crate::config::Config;
use crate::http::HttpError;
use crate::types::{short_error, ScriptFinding};
use std::thread;

pub mod discord;
pub mod github;
pub mod telegram;

pub use discord::DiscordChannel;
pub use github::GithubChannel;
pub use telegram::TelegramChannel;

/// Everything a channel may need to render one finding.
#[derive(Debug, Clone, Copy)]
pub struct Alert<'a> {
  pub finding: &'a ScriptFinding,
  /// `repository.url` from the packument, when present.
  pub repository_url: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
  Sent,
  Skipped(String),
}

pub trait Channel: Send + Sync {
  fn name(&self) -> &'static str;

  fn send(&self, alert: &Alert<'_>) -> anyhow::Result<Delivered>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
  Sent,
  Skipped(String),
  TimedOut(String),
  Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
  pub outcomes: Vec<(&'static str, DeliveryOutcome)>,
}

impl DispatchReport {
  pub fn outcome(&self, channel: &str) -> Option<&DeliveryOutcome> {
    self
      .outcomes
      .iter()
      .find(|(name, _)| *name == channel)
      .map(|(_, o)| o)
  }

  pub fn sent(&self) -> usize {
    self
      .outcomes
      .iter()
      .filter(|(_, o)| *o == DeliveryOutcome::Sent)
      .count()
  }
}

pub struct Dispatcher {
  channels: Vec<Box<dyn Channel>>,
  dry_run: bool,
}

impl Dispatcher {
  pub fn new(channels: Vec<Box<dyn Channel>>, dry_run: bool) -> Self {
    Self { channels, dry_run }
  }

  /// Builds one channel per complete set of credentials. Channels without
  /// credentials are left out.
  pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
    let creds = &cfg.credentials;
    let timeout = cfg.notify.timeout();
    let mut channels: Vec<Box<dyn Channel>> = Vec::new();

    match (&creds.telegram_bot_token, &creds.telegram_chat_id) {
      (Some(token), Some(chat_id)) => channels.push(Box::new(TelegramChannel::new(
        token,
        chat_id,
        &cfg.registry.package_page_url,
        timeout,
      )?)),
      (None, None) => tracing::debug!(channel = "telegram", "not configured"),
      _ => tracing::warn!(
        channel = "telegram",
        "TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must both be set; channel disabled"
      ),
    }

    if let Some(url) = &creds.discord_webhook_url {
      channels.push(Box::new(DiscordChannel::new(url, timeout)?));
    } else {
      tracing::debug!(channel = "discord", "not configured");
    }

    if let Some(token) = &creds.github_token {
      channels.push(Box::new(GithubChannel::new(
        token,
        cfg.notify.issue_min_score,
        timeout,
      )?));
    } else {
      tracing::debug!(channel = "github", "not configured");
    }

    let names: Vec<&str> = channels.iter().map(|c| c.name()).collect();
    tracing::info!(channels = ?names, dry_run = cfg.dry_run, "notification channels ready");
    Ok(Self::new(channels, cfg.dry_run))
  }

  pub fn channel_names(&self) -> Vec<&'static str> {
    self.channels.iter().map(|c| c.name()).collect()
  }

  pub fn dispatch(&self, alert: &Alert<'_>) -> DispatchReport {
    let finding = alert.finding;
    if self.dry_run {
      let outcomes = self
        .channels
        .iter()
        .map(|c| {
          tracing::warn!(
            channel = c.name(),
            package = %finding.package_name,
            version = %finding.latest_version,
            script = %finding.script_type,
            "DRY-RUN: would send alert"
          );
          (c.name(), DeliveryOutcome::Skipped("dry-run".to_string()))
        })
        .collect();
      return DispatchReport { outcomes };
    }

    let outcomes = thread::scope(|s| {
      let handles: Vec<_> = self
        .channels
        .iter()
        .map(|c| (c.name(), s.spawn(move || c.send(alert))))
        .collect();

      handles
        .into_iter()
        .map(|(name, handle)| {
          let outcome = match handle.join() {
            Ok(Ok(Delivered::Sent)) => DeliveryOutcome::Sent,
            Ok(Ok(Delivered::Skipped(reason))) => DeliveryOutcome::Skipped(reason),
            Ok(Err(e)) if is_timeout(&e) => DeliveryOutcome::TimedOut(short_error(&e)),
            Ok(Err(e)) => DeliveryOutcome::Failed(short_error(&e)),
            Err(_) => DeliveryOutcome::Failed("channel panicked".to_string()),
          };
          log_outcome(name, finding, &outcome);
          (name, outcome)
        })
        .collect()
    });

    DispatchReport { outcomes }
  }
}

fn is_timeout(e: &anyhow::Error) -> bool {
  e.chain()
    .filter_map(|c| c.downcast_ref::<HttpError>())
    .any(HttpError::is_timeout)
}

fn log_outcome(channel: &'static str, finding: &ScriptFinding, outcome: &DeliveryOutcome) {
  let package = &finding.package_name;
  match outcome {
    DeliveryOutcome::Sent => tracing::info!(channel, package = %package, "alert delivered"),
    DeliveryOutcome::Skipped(reason) => {
      tracing::debug!(channel, package = %package, reason = %reason, "alert skipped")
    }
    DeliveryOutcome::TimedOut(reason) => tracing::warn!(
      channel,
      package = %package,
      reason = %reason,
      "alert delivery timed out"
    ),
    DeliveryOutcome::Failed(reason) => tracing::warn!(
      channel,
      package = %package,
      reason = %reason,
      "alert delivery failed"
    ),
  }
}

/// Escapes text for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  for ch in text.chars() {
    match ch {
      '&' => out.push_str("&amp;"),
      '<' => out.push_str("&lt;"),
      '>' => out.push_str("&gt;"),
      '"' => out.push_str("&quot;"),
      _ => out.push(ch),
    }
  }
  out
}
