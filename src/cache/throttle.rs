use chrono::{DateTime, Duration, Utc};

/// Leading-edge throttle: at most one acquisition per window.
#[derive(Debug, Clone)]
pub struct Throttle {
  window: Duration,
  last: Option<DateTime<Utc>>,
}

impl Throttle {
  pub fn new(window: Duration) -> Self {
    Self { window, last: None }
  }

  /// Take the slot if the window has passed since the last acquisition.
  ///
  /// Returns the time left until the next slot otherwise.
  pub fn try_acquire(&mut self, now: DateTime<Utc>) -> Result<(), Duration> {
    let remaining = self.remaining(now);
    if remaining > Duration::zero() {
      return Err(remaining);
    }
    self.last = Some(now);
    Ok(())
  }

  /// Record an acquisition made outside [`Self::try_acquire`] (e.g. a trailing call).
  pub fn mark(&mut self, now: DateTime<Utc>) {
    self.last = Some(now);
  }

  pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
    match self.last {
      Some(last) => (last + self.window - now).max(Duration::zero()),
      None => Duration::zero(),
    }
  }

  pub fn window(&self) -> Duration {
    self.window
  }
}
