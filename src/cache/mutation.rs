//! Writes paused while offline.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::VecDeque;

use super::key::QueryKey;

/// Outcome of one attempt at running a paused write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
  /// The write finished (successfully or not) and its caller was notified
  Settled,
  /// The network went away again; keep it queued
  Paused,
}

/// Re-runnable write. Each call is one attempt.
pub(crate) type ReplayFn = Box<dyn FnMut() -> BoxFuture<'static, Replay> + Send>;

/// A write waiting for connectivity.
pub struct PendingMutation {
  pub id: u64,
  pub mutation_key: Option<QueryKey>,
  pub submitted_at: DateTime<Utc>,
  pub(crate) run: ReplayFn,
}

impl std::fmt::Debug for PendingMutation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PendingMutation")
      .field("id", &self.id)
      .field("mutation_key", &self.mutation_key)
      .field("submitted_at", &self.submitted_at)
      .finish_non_exhaustive()
  }
}

/// FIFO of paused writes, ordered by submission.
#[derive(Debug, Default)]
pub struct MutationQueue {
  queue: VecDeque<PendingMutation>,
}

impl MutationQueue {
  /// Add a write, keeping submission order even when it was paused after a
  /// later one.
  pub fn push(&mut self, mutation: PendingMutation) {
    let pos = self
      .queue
      .iter()
      .position(|m| m.id > mutation.id)
      .unwrap_or(self.queue.len());
    self.queue.insert(pos, mutation);
  }

  pub fn pop_front(&mut self) -> Option<PendingMutation> {
    self.queue.pop_front()
  }

  pub fn push_front(&mut self, mutation: PendingMutation) {
    self.queue.push_front(mutation);
  }

  pub fn len(&self) -> usize {
    self.queue.len()
  }

  pub fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  /// Drop every paused write. Their callers see a cancellation error.
  pub fn clear(&mut self) -> usize {
    let n = self.queue.len();
    self.queue.clear();
    n
  }
}
