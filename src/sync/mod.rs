//! Realtime synchronization for a shared trip plan.
//!
//! This module ties the per-domain channels to the optimistic stores:
//! - Typed action envelopes for every channel (`protocol`)
//! - Remote cursor smoothing and presence (`presence`)
//! - Token-gated activation and room fan-out (`supervisor`)
//! - The plan session that reconciles echoes into the stores (`session`)

pub mod presence;
pub mod protocol;
pub mod session;
pub mod supervisor;

pub use session::{PlanSession, SessionSnapshot};
pub use supervisor::ConnectionSupervisor;

use serde::{Deserialize, Serialize};

use crate::channel::TransportError;
use crate::stomp::FrameError;
use protocol::ProtocolError;

/// Room identifier: every topic and every stored collection is scoped by it
pub type PlanId = i64;

/// Identifier a peer is known by on the cursor channel
pub type UserName = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// The five realtime channels of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Domain {
    Whiteboard,
    DaySchedule,
    DayPlace,
    Bookmark,
    Cursor,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::Whiteboard,
        Domain::DaySchedule,
        Domain::DayPlace,
        Domain::Bookmark,
        Domain::Cursor,
    ];

    /// Topic path segment
    pub fn segment(&self) -> &'static str {
        match self {
            Domain::Whiteboard => "whiteboard",
            Domain::DaySchedule => "daySchedule",
            Domain::DayPlace => "dayPlace",
            Domain::Bookmark => "bookmark",
            Domain::Cursor => "mouse",
        }
    }

    /// Broker topic the channel subscribes to
    pub fn topic(&self, plan_id: PlanId) -> String {
        format!("/topic/{}/{}", self.segment(), plan_id)
    }

    /// Application destination the channel publishes to
    pub fn destination(&self, plan_id: PlanId) -> String {
        match self {
            Domain::Cursor => format!("/app/mouse/move/{}", plan_id),
            other => format!("/app/{}/{}", other.segment(), plan_id),
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.segment())
    }
}

/// Errors that can occur during synchronization
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("No plan selected for {0} channel")]
    MissingRoom(Domain),

    #[error("No usable access token")]
    MissingToken,

    #[error("Outbox full on {domain} channel ({capacity} queued)")]
    OutboxFull { domain: Domain, capacity: usize },

    #[error("Channel {0} has shut down")]
    ChannelClosed(Domain),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Baseline load failed: {0}")]
    Baseline(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),
}
