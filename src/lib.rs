//! plan-sync: realtime synchronization core for collaborative trip plans.
//!
//! A plan is shared over five STOMP-over-WebSocket channels (whiteboard,
//! day schedule, day place, bookmark, cursor):
//! - STOMP 1.2 frame codec (`stomp`)
//! - Per-domain channel managers with outbox buffering and reconnect (`channel`)
//! - Optimistic stores reconciled against echoes and REST baselines (`store`)
//! - Typed envelopes, cursor presence and the plan session (`sync`)

pub mod baseline;
pub mod channel;
pub mod config;
pub mod stomp;
pub mod store;
pub mod sync;

pub use baseline::{BaselineSource, HttpBaseline};
pub use config::{ConfigError, SyncConfig};
pub use sync::{Domain, PlanId, PlanSession, SessionSnapshot, SyncError, SyncResult};
