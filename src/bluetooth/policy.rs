//! Caller-supplied connect and reconnect policy.
//!
//! The transport never retries on its own. A policy decides whether an
//! attempt is bounded in time and whether an unrequested link loss is
//! followed by another attempt.

use std::{fmt, time::Duration};

use rand::Rng;
use smol_str::SmolStr;

/// Maximum reconnect delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);

/// Why a link ended without being asked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
   ConnectFailed(SmolStr),
   DiscoveryFailed(SmolStr),
   LinkLost,
}

impl fmt::Display for DisconnectReason {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::ConnectFailed(e) => write!(f, "connect failed: {e}"),
         Self::DiscoveryFailed(e) => write!(f, "service discovery failed: {e}"),
         Self::LinkLost => f.write_str("link lost"),
      }
   }
}

pub trait LinkPolicy: Send + Sync {
   /// Upper bound on a single connect attempt.
   fn connect_timeout(&self) -> Option<Duration> {
      None
   }

   /// Delay before reconnect attempt number `attempt` (1-based) after an
   /// unrequested link loss, or `None` to stay disconnected.
   fn reconnect_delay(&self, attempt: u32) -> Option<Duration> {
      let _ = attempt;
      None
   }
}

/// No timeout, no reconnect.
#[derive(Debug, Default, Clone, Copy)]
pub struct Manual;

impl LinkPolicy for Manual {}

/// Jittered exponential backoff for a bounded number of attempts.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
   pub max_attempts: u32,
   pub base_delay: Duration,
   pub connect_timeout: Option<Duration>,
}

impl LinkPolicy for Backoff {
   fn connect_timeout(&self) -> Option<Duration> {
      self.connect_timeout
   }

   fn reconnect_delay(&self, attempt: u32) -> Option<Duration> {
      (attempt <= self.max_attempts).then(|| calc_retry_delay(self.base_delay, attempt))
   }
}

fn calc_retry_delay(base_delay: Duration, retry_count: u32) -> Duration {
   let exponential = base_delay * (1 << retry_count.min(4));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_manual_never_reconnects() {
      let policy = Manual;
      assert!(policy.connect_timeout().is_none());
      assert!(policy.reconnect_delay(1).is_none());
   }

   #[test]
   fn test_backoff_is_bounded() {
      let policy = Backoff {
         max_attempts: 3,
         base_delay: Duration::from_secs(2),
         connect_timeout: Some(Duration::from_secs(20)),
      };
      assert_eq!(policy.connect_timeout(), Some(Duration::from_secs(20)));

      let first = policy.reconnect_delay(1).unwrap();
      assert!(first >= Duration::from_secs(4) && first < Duration::from_secs(5));
      let third = policy.reconnect_delay(3).unwrap();
      assert!(third >= Duration::from_secs(16) && third < Duration::from_secs(17));
      assert!(policy.reconnect_delay(4).is_none());
   }

   #[test]
   fn test_retry_delay_caps() {
      let delay = calc_retry_delay(Duration::from_secs(60), 10);
      assert!(delay >= MAX_RETRY_DELAY && delay < MAX_RETRY_DELAY + Duration::from_secs(1));
   }
}
