use super::{escape_html, Alert, Channel, Delivered};
use crate::http;
use crate::registry::encode_package_name;
use crate::types::{AlertType, ScriptFinding};
use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::Url;
use serde::Serialize;
use std::time::Duration;

const API_BASE: &str = "https://api.telegram.org";

#[derive(Serialize)]
struct SendMessage<'a> {
  chat_id: &'a str,
  text: &'a str,
  parse_mode: &'static str,
  disable_web_page_preview: bool,
}

pub struct TelegramChannel {
  client: Client,
  send_url: Url,
  chat_id: String,
  package_page_url: String,
}

impl TelegramChannel {
  pub fn new(
    bot_token: &str,
    chat_id: &str,
    package_page_url: &str,
    timeout: Duration,
  ) -> anyhow::Result<Self> {
    let send_url = Url::parse(&format!("{API_BASE}/bot{bot_token}/sendMessage"))
      .context("build telegram sendMessage URL")?;
    Ok(Self {
      client: http::build_client(timeout).context("build telegram HTTP client")?,
      send_url,
      chat_id: chat_id.to_string(),
      package_page_url: package_page_url.to_string(),
    })
  }
}

impl Channel for TelegramChannel {
  fn name(&self) -> &'static str {
    "telegram"
  }

  fn send(&self, alert: &Alert<'_>) -> anyhow::Result<Delivered> {
    let text = format_message(alert.finding, &self.package_page_url);
    let body = SendMessage {
      chat_id: &self.chat_id,
      text: &text,
      parse_mode: "HTML",
      disable_web_page_preview: true,
    };
    http::post_json(&self.client, &self.send_url, &body, &[], "telegram")?;
    Ok(Delivered::Sent)
  }
}

/// `sendMessage` rejects text longer than this.
const MAX_TEXT_CHARS: usize = 4096;

/// HTML-mode message. Every interpolated value is escaped, and script text
/// is cut so the whole message stays within `MAX_TEXT_CHARS`.
pub fn format_message(f: &ScriptFinding, package_page_url: &str) -> String {
  let label = f.script_type.label();
  let page = format!(
    "{}{}",
    package_page_url,
    encode_package_name(&f.package_name)
  );
  let previous = f.previous_version.as_deref().unwrap_or("none");

  let mut msg = format!(
    "🚨 <b>{label} script {}</b>\n\n\
     Package: <code>{}@{}</code>\n\
     <a href=\"{}\">View on registry</a>\n\
     Previous version: {}\n\
     Suspicion score: {}\n",
    f.alert_type,
    escape_html(&f.package_name),
    escape_html(&f.latest_version),
    escape_html(&page),
    escape_html(previous),
    f.suspicion_score,
  );

  let scripts = |old: &str, new: &str| match f.alert_type {
    AlertType::Added => format!("<code>{new}</code>"),
    AlertType::Changed => {
      format!("Previous {label}: <code>{old}</code>\nNew {label}: <code>{new}</code>")
    }
  };
  let room = MAX_TEXT_CHARS.saturating_sub(msg.chars().count() + scripts("", "").chars().count());

  match f.alert_type {
    AlertType::Added => {
      msg.push_str(&scripts("", &escape_capped(&f.script_content, room)));
    }
    AlertType::Changed => {
      let half = room / 2;
      let old = escape_capped(f.previous_script_content.as_deref().unwrap_or_default(), half);
      let new = escape_capped(&f.script_content, half);
      msg.push_str(&scripts(&old, &new));
    }
  }
  msg
}

/// Escapes `text`, cutting it on a character boundary before escaping so no
/// entity is split. The result, ellipsis included, is at most `budget` chars.
fn escape_capped(text: &str, budget: usize) -> String {
  let escaped = escape_html(text);
  if escaped.chars().count() <= budget {
    return escaped;
  }
  let limit = budget.saturating_sub(1);
  let mut out = String::new();
  let mut used = 0;
  let mut buf = [0u8; 4];
  for ch in text.chars() {
    let piece = escape_html(ch.encode_utf8(&mut buf));
    let n = piece.chars().count();
    if used + n > limit {
      break;
    }
    out.push_str(&piece);
    used += n;
  }
  if budget > 0 {
    out.push('…');
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::notify::tests::finding;

  #[test]
  fn script_text_cannot_inject_markup() {
    let mut f = finding(31);
    f.script_content = "node -e \"</code><a href='x'>click</a>\"".to_string();
    let msg = format_message(&f, "https://www.npmjs.com/package/");
    assert!(!msg.contains("<a href='x'>"));
    assert!(msg.contains("&lt;/code&gt;&lt;a href='x'&gt;click&lt;/a&gt;"));
  }

  #[test]
  fn link_uses_encoded_scoped_name() {
    let msg = format_message(&finding(0), "https://www.npmjs.com/package/");
    assert!(msg.contains("https://www.npmjs.com/package/@evil%2Fpkg"));
    assert!(msg.contains("Postinstall script added"));
  }

  #[test]
  fn changed_alert_shows_both_scripts() {
    let mut f = finding(0);
    f.alert_type = AlertType::Changed;
    f.previous_script_content = Some("echo old".to_string());
    f.script_content = "echo new".to_string();
    let msg = format_message(&f, "https://www.npmjs.com/package/");
    assert!(msg.contains("Previous Postinstall: <code>echo old</code>"));
    assert!(msg.contains("New Postinstall: <code>echo new</code>"));
  }

  #[test]
  fn long_script_is_cut_to_fit_the_message_limit() {
    let mut f = finding(40);
    f.script_content = "node -e \"eval(atob('QUFB'));\" && ".repeat(300);
    let msg = format_message(&f, "https://www.npmjs.com/package/");
    assert!(msg.chars().count() <= MAX_TEXT_CHARS);
    assert!(msg.ends_with("…</code>"));
    assert!(msg.contains("Suspicion score: 40"));

    let cut = msg.rsplit("<code>").next().unwrap();
    let last_amp = cut.rfind('&').unwrap();
    assert!(cut[last_amp..].starts_with("&quot;") || cut[last_amp..].starts_with("&amp;"));
  }

  #[test]
  fn changed_alert_splits_the_room_between_both_scripts() {
    let mut f = finding(0);
    f.alert_type = AlertType::Changed;
    f.previous_script_content = Some("a".repeat(5000));
    f.script_content = "b".repeat(5000);
    let msg = format_message(&f, "https://www.npmjs.com/package/");
    assert!(msg.chars().count() <= MAX_TEXT_CHARS);
    assert!(msg.contains("aaa…</code>"));
    assert!(msg.contains("bbb…</code>"));
  }

  #[test]
  fn short_scripts_are_not_touched() {
    assert_eq!(escape_capped("a&b", 100), "a&amp;b");
    assert_eq!(escape_capped("a&b", 3), "a…");
    assert_eq!(escape_capped("abc", 0), "");
  }
}
