//! Pending-with-deadline bookkeeping for optimistic mutations.
//!
//! Every locally-initiated mutation is tracked under a key until its echo
//! arrives. A periodic sweep resends operations whose echo is overdue and,
//! after the retry budget is spent, hands them back for rollback.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tracing::debug;

/// Deadline and retry budget for pending operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for PendingPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 2,
        }
    }
}

/// One operation awaiting its echo
#[derive(Debug, Clone)]
pub struct PendingOp<A> {
    pub op: A,
    /// First send
    pub since: Instant,
    /// Most recent (re)send
    pub sent_at: Instant,
    pub retries: u32,
}

/// What the sweep decided for an overdue operation
#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome<K, A> {
    /// Publish again; the entry stays pending
    Resend { key: K, op: A },
    /// Retry budget spent; roll the mutation back
    Expired { key: K, op: A },
}

/// Envelopes produced by a store sweep
#[derive(Debug, Clone, PartialEq)]
pub struct Swept<A> {
    /// Publish again
    pub resend: Vec<A>,
    /// Rolled back locally; any queued copy must not go out
    pub expired: Vec<A>,
}

impl<A> Default for Swept<A> {
    fn default() -> Self {
        Self {
            resend: Vec::new(),
            expired: Vec::new(),
        }
    }
}

impl<A> Swept<A> {
    pub fn is_empty(&self) -> bool {
        self.resend.is_empty() && self.expired.is_empty()
    }
}

#[derive(Debug)]
pub struct PendingLedger<K, A> {
    entries: HashMap<K, PendingOp<A>>,
}

impl<K, A> Default for PendingLedger<K, A> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K, A> PendingLedger<K, A>
where
    K: Eq + Hash + Clone + Debug,
    A: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an operation. A newer operation on the same key supersedes the
    /// older one; the original send instant is kept.
    pub fn track(&mut self, key: K, op: A, now: Instant) {
        let since = self.entries.get(&key).map(|p| p.since).unwrap_or(now);
        self.entries.insert(
            key,
            PendingOp {
                op,
                since,
                sent_at: now,
                retries: 0,
            },
        );
    }

    /// The echo arrived. Returns the round-trip time since the first send.
    pub fn resolve(&mut self, key: &K, now: Instant) -> Option<Duration> {
        let entry = self.entries.remove(key)?;
        let rtt = now.saturating_duration_since(entry.since);
        debug!("{:?} confirmed after {}ms", key, rtt.as_millis());
        Some(rtt)
    }

    /// Drop an operation without an echo (refused send, superseded)
    pub fn cancel(&mut self, key: &K) -> Option<A> {
        self.entries.remove(key).map(|p| p.op)
    }

    pub fn get(&self, key: &K) -> Option<&PendingOp<A>> {
        self.entries.get(key)
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &PendingOp<A>)> {
        self.entries.iter()
    }

    /// Restart every deadline from `now`.
    ///
    /// Operations queued while offline are only written when the channel
    /// reconnects, so their clocks start there.
    pub fn restart(&mut self, now: Instant) {
        for entry in self.entries.values_mut() {
            entry.sent_at = now;
        }
    }

    /// Resend or expire everything whose last send is older than the timeout
    pub fn sweep(&mut self, now: Instant, policy: &PendingPolicy) -> Vec<SweepOutcome<K, A>> {
        let overdue: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent_at) >= policy.timeout)
            .map(|(k, _)| k.clone())
            .collect();

        let mut outcomes = Vec::with_capacity(overdue.len());
        for key in overdue {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            if entry.retries < policy.max_retries {
                entry.retries += 1;
                entry.sent_at = now;
                outcomes.push(SweepOutcome::Resend {
                    key,
                    op: entry.op.clone(),
                });
            } else if let Some(entry) = self.entries.remove(&key) {
                outcomes.push(SweepOutcome::Expired { key, op: entry.op });
            }
        }
        outcomes
    }
}
