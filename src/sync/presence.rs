//! Remote cursor presence.
//!
//! This module handles ephemeral pointer state that is never persisted:
//! - Jitter smoothing for remote cursors (render slightly in the past and
//!   interpolate between bracketing samples)
//! - The registry of peers' cursors, keyed by user name
//! - Throttling of our own pointer broadcasts

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::protocol::CursorPosition;
use super::UserName;

/// How far in the past remote cursors are rendered
pub const DEFAULT_BUFFER: Duration = Duration::from_millis(60);

/// Samples kept per remote cursor
pub const DEFAULT_MAX_SAMPLES: usize = 8;

/// Minimum spacing of our own pointer broadcasts
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(60);

/// How long a silent peer's cursor stays visible
const CURSOR_RETENTION: Duration = Duration::from_secs(5);

/// Render cadence of the cursor task (~60 fps)
const RENDER_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorSample {
    pub x: f64,
    pub y: f64,
    pub t: Instant,
}

/// Bounded sample queue for one remote cursor
#[derive(Debug, Clone)]
pub struct PositionInterpolator {
    buffer: Duration,
    max_samples: usize,
    samples: VecDeque<CursorSample>,
}

impl Default for PositionInterpolator {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER, DEFAULT_MAX_SAMPLES)
    }
}

impl PositionInterpolator {
    pub fn new(buffer: Duration, max_samples: usize) -> Self {
        let max_samples = max_samples.max(2);
        Self {
            buffer,
            max_samples,
            samples: VecDeque::with_capacity(max_samples),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Queue a sample, discarding the oldest when full
    pub fn push(&mut self, x: f64, y: f64, t: Instant) {
        // timestamps never go backwards
        let t = match self.samples.back() {
            Some(last) if t < last.t => last.t,
            _ => t,
        };
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(CursorSample { x, y, t });
    }

    /// Position to draw at `now`, or `None` with no samples
    pub fn sample(&mut self, now: Instant) -> Option<(f64, f64)> {
        let target = now.checked_sub(self.buffer).unwrap_or(now);

        while self.samples.len() >= 2 && self.samples[1].t <= target {
            self.samples.pop_front();
        }

        let a = *self.samples.front()?;
        let Some(b) = self.samples.get(1).copied() else {
            return Some((a.x, a.y));
        };

        let span = b.t.duration_since(a.t).as_secs_f64().max(0.001);
        let elapsed = target.saturating_duration_since(a.t).as_secs_f64();
        let u = (elapsed / span).clamp(0.0, 1.0);

        Some((a.x + (b.x - a.x) * u, a.y + (b.y - a.y) * u))
    }
}

/// A peer's cursor as last rendered
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCursor {
    pub user_name: UserName,
    pub x: f64,
    pub y: f64,
    /// Last sample arrival (milliseconds since epoch)
    pub updated_at_ms: i64,
}

#[derive(Debug)]
struct CursorEntry {
    rendered: RemoteCursor,
    interpolator: PositionInterpolator,
    last_seen: Instant,
}

/// Remote cursors of the current plan
#[derive(Debug)]
pub struct RemoteCursors {
    own_user: UserName,
    buffer: Duration,
    max_samples: usize,
    retention: Duration,
    cursors: DashMap<UserName, CursorEntry>,
}

impl RemoteCursors {
    pub fn new(own_user: impl Into<UserName>, buffer: Duration, max_samples: usize) -> Self {
        Self {
            own_user: own_user.into(),
            buffer,
            max_samples,
            retention: CURSOR_RETENTION,
            cursors: DashMap::new(),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn own_user(&self) -> &str {
        &self.own_user
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Record an incoming position. Our own echo is ignored.
    pub fn record(&self, position: &CursorPosition, now: Instant) -> bool {
        if position.user_name == self.own_user {
            return false;
        }

        let mut entry = self
            .cursors
            .entry(position.user_name.clone())
            .or_insert_with(|| {
                debug!("cursor from {} appeared", position.user_name);
                CursorEntry {
                    rendered: RemoteCursor {
                        user_name: position.user_name.clone(),
                        x: position.x,
                        y: position.y,
                        updated_at_ms: 0,
                    },
                    interpolator: PositionInterpolator::new(self.buffer, self.max_samples),
                    last_seen: now,
                }
            });
        entry.interpolator.push(position.x, position.y, now);
        entry.last_seen = now;
        entry.rendered.updated_at_ms = chrono::Utc::now().timestamp_millis();
        true
    }

    /// Advance every cursor to its interpolated position and drop silent ones
    pub fn render(&self, now: Instant) -> Vec<RemoteCursor> {
        self.evict_stale(now);

        self.cursors
            .iter_mut()
            .map(|mut entry| {
                if let Some((x, y)) = entry.interpolator.sample(now) {
                    entry.rendered.x = x;
                    entry.rendered.y = y;
                }
                entry.rendered.clone()
            })
            .collect()
    }

    /// Last rendered positions without advancing
    pub fn snapshot(&self) -> Vec<RemoteCursor> {
        let mut cursors: Vec<RemoteCursor> =
            self.cursors.iter().map(|e| e.rendered.clone()).collect();
        cursors.sort_by(|a, b| a.user_name.cmp(&b.user_name));
        cursors
    }

    pub fn get(&self, user_name: &str) -> Option<RemoteCursor> {
        self.cursors.get(user_name).map(|e| e.rendered.clone())
    }

    pub fn evict_stale(&self, now: Instant) {
        let retention = self.retention;
        self.cursors.retain(|user, entry| {
            let keep = now.saturating_duration_since(entry.last_seen) <= retention;
            if !keep {
                debug!("cursor from {} expired", user);
            }
            keep
        });
    }

    /// Forget every cursor (plan switch, teardown)
    pub fn clear(&self) {
        self.cursors.clear();
    }

    /// Drive rendering until shutdown; queues are cleared on exit
    pub fn start_render_task(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RENDER_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.render(Instant::now());
                    }
                    _ = shutdown.recv() => {
                        info!("Cursor render task shutting down");
                        self.clear();
                        break;
                    }
                }
            }
        })
    }
}

/// Leading + trailing throttle for our own pointer broadcasts.
///
/// The first move after a quiet period goes out immediately; moves inside the
/// window collapse into one trailing position released by `flush`.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
    trailing: Option<(f64, f64)>,
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE)
    }
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            trailing: None,
        }
    }

    fn open(&self, now: Instant) -> bool {
        self.last_sent
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval)
    }

    /// Offer a pointer position; returns it when it should be sent now
    pub fn offer(&mut self, x: f64, y: f64, now: Instant) -> Option<(f64, f64)> {
        if self.open(now) {
            self.last_sent = Some(now);
            self.trailing = None;
            Some((x, y))
        } else {
            self.trailing = Some((x, y));
            None
        }
    }

    /// Release the trailing position once the window has passed
    pub fn flush(&mut self, now: Instant) -> Option<(f64, f64)> {
        if self.trailing.is_some() && self.open(now) {
            self.last_sent = Some(now);
            return self.trailing.take();
        }
        None
    }

    pub fn has_trailing(&self) -> bool {
        self.trailing.is_some()
    }
}
