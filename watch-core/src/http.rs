//! Blocking HTTP helpers shared by the registry client and the channels.
//!
//! Every client built here carries a hard timeout, and a timeout is reported
//! as [`HttpError::Timeout`] rather than folded into transport failures.

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::USER_AGENT;
use reqwest::redirect::Policy;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;

const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum HttpError {
  #[error("{label}: request timeout")]
  Timeout { label: String },

  #[error("{label}: HTTP {status}: {body}")]
  Status {
    label: String,
    status: u16,
    body: String,
  },

  #[error("{label}: {source}")]
  Transport {
    label: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("{label}: response exceeds {max_bytes} bytes")]
  TooLarge { label: String, max_bytes: usize },

  #[error("{label}: decode response: {reason}")]
  Decode { label: String, reason: String },
}

impl HttpError {
  pub fn is_timeout(&self) -> bool {
    matches!(self, HttpError::Timeout { .. })
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      HttpError::Status { status, .. } => Some(*status),
      _ => None,
    }
  }

  fn from_reqwest(label: &str, e: reqwest::Error) -> Self {
    if e.is_timeout() {
      return HttpError::Timeout {
        label: label.to_string(),
      };
    }
    // Channel URLs can embed credentials; keep them out of the message.
    HttpError::Transport {
      label: label.to_string(),
      source: e.without_url(),
    }
  }
}

pub fn build_client(timeout: Duration) -> anyhow::Result<Client> {
  let client = Client::builder()
    .timeout(timeout)
    .connect_timeout(timeout)
    .redirect(Policy::limited(5))
    .build()?;
  Ok(client)
}

fn user_agent() -> String {
  format!("script-watch/{}", env!("CARGO_PKG_VERSION"))
}

pub fn get_json<T: DeserializeOwned>(
  client: &Client,
  url: &Url,
  max_bytes: usize,
) -> Result<T, HttpError> {
  let label = safe_url_label(url);
  let response = send(&label, client.get(url.clone()).header(USER_AGENT, user_agent()))?;
  let bytes = read_with_limit(&label, response, max_bytes)?;
  serde_json::from_slice(&bytes).map_err(|e| HttpError::Decode {
    label,
    reason: e.to_string(),
  })
}

/// POSTs `body` as JSON. Any non-2xx status is an error; the response body
/// is otherwise discarded.
pub fn post_json<B: Serialize + ?Sized>(
  client: &Client,
  url: &Url,
  body: &B,
  headers: &[(&str, String)],
  label: &str,
) -> Result<(), HttpError> {
  let mut req = client
    .post(url.clone())
    .header(USER_AGENT, user_agent())
    .json(body);
  for (name, value) in headers {
    req = req.header(*name, value.as_str());
  }
  send(label, req).map(|_| ())
}

fn send(label: &str, req: RequestBuilder) -> Result<Response, HttpError> {
  let response = req.send().map_err(|e| HttpError::from_reqwest(label, e))?;
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let body = response.text().unwrap_or_default();
  Err(HttpError::Status {
    label: label.to_string(),
    status: status.as_u16(),
    body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
  })
}

fn read_with_limit(label: &str, response: Response, max_bytes: usize) -> Result<Vec<u8>, HttpError> {
  let mut out = Vec::new();
  let mut limited = response.take((max_bytes.saturating_add(1)) as u64);
  if let Err(e) = limited.read_to_end(&mut out) {
    // The blocking body reader surfaces the client timeout as an io error.
    let timed_out = e.kind() == std::io::ErrorKind::TimedOut
      || e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        .is_some_and(|re| re.is_timeout());
    if timed_out {
      return Err(HttpError::Timeout {
        label: label.to_string(),
      });
    }
    return Err(HttpError::Decode {
      label: label.to_string(),
      reason: format!("read body: {e}"),
    });
  }

  if out.len() > max_bytes {
    return Err(HttpError::TooLarge {
      label: label.to_string(),
      max_bytes,
    });
  }
  Ok(out)
}

/// `host/path` without query string, so tokens in URLs never reach the logs.
pub fn safe_url_label(url: &Url) -> String {
  let host = url.host_str().unwrap_or("<no-host>");
  let mut path = url.path().to_string();
  if path.is_empty() {
    path = "/".to_string();
  }
  format!("{host}{path}")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn label_drops_query_and_keeps_path() {
    let url = Url::parse("https://replicate.npmjs.com/registry/_changes?since=5&limit=2").unwrap();
    assert_eq!(safe_url_label(&url), "replicate.npmjs.com/registry/_changes");
  }

  #[test]
  fn timeout_is_distinct_from_status_errors() {
    let t = HttpError::Timeout {
      label: "telegram".to_string(),
    };
    assert!(t.is_timeout());
    assert_eq!(t.to_string(), "telegram: request timeout");

    let s = HttpError::Status {
      label: "discord".to_string(),
      status: 429,
      body: "slow down".to_string(),
    };
    assert!(!s.is_timeout());
    assert_eq!(s.status(), Some(429));
  }

  use std::io::Write;
  use std::net::{TcpListener, TcpStream};
  use std::thread;

  const SHORT: Duration = Duration::from_millis(300);

  /// One-connection loopback server: reads the request head, then hands the
  /// stream to `reply`.
  fn serve_once(reply: impl FnOnce(&mut TcpStream) + Send + 'static) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
      if let Ok((mut stream, _)) = listener.accept() {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
          match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => break,
          }
        }
        reply(&mut stream);
      }
    });
    Url::parse(&format!("http://{addr}/p")).unwrap()
  }

  fn loopback_client() -> Client {
    Client::builder().timeout(SHORT).no_proxy().build().unwrap()
  }

  #[test]
  fn silent_server_is_a_timeout() {
    let url = serve_once(|_| thread::sleep(Duration::from_secs(3)));
    let err = post_json(&loopback_client(), &url, &serde_json::json!({"x": 1}), &[], "discord")
      .unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert_eq!(err.to_string(), "discord: request timeout");
  }

  #[test]
  fn body_stalling_mid_read_is_a_timeout() {
    let url = serve_once(|stream| {
      let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n{\"a\":");
      let _ = stream.flush();
      thread::sleep(Duration::from_secs(3));
    });
    let err = get_json::<serde_json::Value>(&loopback_client(), &url, 1024).unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert_eq!(err.to_string(), "127.0.0.1/p: request timeout");
  }

  #[test]
  fn server_error_keeps_its_status() {
    let url = serve_once(|stream| {
      let _ = stream.write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\nboom");
    });
    let err = get_json::<serde_json::Value>(&loopback_client(), &url, 1024).unwrap_err();
    assert!(!err.is_timeout());
    assert_eq!(err.status(), Some(500));
    assert_eq!(err.to_string(), "127.0.0.1/p: HTTP 500: boom");
  }
}
