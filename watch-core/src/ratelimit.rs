//! Process-wide token bucket shared by every worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Longest single sleep while waiting for a token, so a stop request is
/// noticed promptly.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

pub struct RateLimiter {
  per_second: f64,
  capacity: f64,
  bucket: Mutex<Bucket>,
}

struct Bucket {
  tokens: f64,
  refilled_at: Instant,
}

impl RateLimiter {
  /// `per_second == 0` disables limiting. Bursts are capped at one second's
  /// worth of tokens.
  pub fn new(per_second: u32) -> Self {
    let per_second = f64::from(per_second);
    Self {
      per_second,
      capacity: per_second.max(1.0),
      bucket: Mutex::new(Bucket {
        tokens: per_second.max(1.0),
        refilled_at: Instant::now(),
      }),
    }
  }

  pub fn is_unlimited(&self) -> bool {
    self.per_second <= 0.0
  }

  /// Takes a token if one is available. On refusal returns how long until
  /// the next token.
  pub fn try_acquire(&self) -> Result<(), Duration> {
    self.try_acquire_at(Instant::now())
  }

  fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
    if self.is_unlimited() {
      return Ok(());
    }
    let mut b = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
    let elapsed = now.saturating_duration_since(b.refilled_at).as_secs_f64();
    b.tokens = (b.tokens + elapsed * self.per_second).min(self.capacity);
    b.refilled_at = now;

    if b.tokens >= 1.0 {
      b.tokens -= 1.0;
      return Ok(());
    }
    Err(Duration::from_secs_f64((1.0 - b.tokens) / self.per_second))
  }

  /// Blocks until a token is taken. Returns false if `stop` was raised first.
  pub fn acquire(&self, stop: &AtomicBool) -> bool {
    loop {
      if stop.load(Ordering::SeqCst) {
        return false;
      }
      match self.try_acquire() {
        Ok(()) => return true,
        Err(wait) => thread::sleep(wait.min(MAX_WAIT_SLICE)),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn burst_is_capped_at_one_second_of_tokens() {
    let rl = RateLimiter::new(3);
    let now = Instant::now();
    assert!(rl.try_acquire_at(now).is_ok());
    assert!(rl.try_acquire_at(now).is_ok());
    assert!(rl.try_acquire_at(now).is_ok());
    let wait = rl.try_acquire_at(now).unwrap_err();
    assert!(wait > Duration::ZERO && wait <= Duration::from_millis(334));
  }

  #[test]
  fn tokens_refill_over_time() {
    let rl = RateLimiter::new(2);
    let start = Instant::now();
    assert!(rl.try_acquire_at(start).is_ok());
    assert!(rl.try_acquire_at(start).is_ok());
    assert!(rl.try_acquire_at(start).is_err());
    assert!(rl.try_acquire_at(start + Duration::from_millis(500)).is_ok());
    // A long idle period does not bank more than the burst size.
    let later = start + Duration::from_secs(60);
    assert!(rl.try_acquire_at(later).is_ok());
    assert!(rl.try_acquire_at(later).is_ok());
    assert!(rl.try_acquire_at(later).is_err());
  }

  #[test]
  fn zero_rate_is_unlimited() {
    let rl = RateLimiter::new(0);
    for _ in 0..1000 {
      assert!(rl.try_acquire().is_ok());
    }
  }

  #[test]
  fn acquire_gives_up_when_stopped() {
    let rl = RateLimiter::new(1);
    let stop = AtomicBool::new(false);
    assert!(rl.acquire(&stop));
    stop.store(true, Ordering::SeqCst);
    assert!(!rl.acquire(&stop));
  }
}
