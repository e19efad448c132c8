//! STOMP 1.2 framing for the text WebSocket channel.
//!
//! Every channel speaks STOMP over a single WebSocket: CONNECT/CONNECTED for the
//! session handshake, SUBSCRIBE/UNSUBSCRIBE for room topics, SEND for publishing
//! action envelopes and MESSAGE for broker fan-out. Heart-beats are bare EOLs.

mod frame;

pub use frame::{Command, Frame, FrameError};

/// Protocol version announced in `accept-version`
pub const STOMP_VERSION: &str = "1.2";

/// Content type used for every JSON envelope we publish
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Heart-beat frame (a single EOL)
pub const HEARTBEAT: &str = "\n";

/// Negotiated heart-beat intervals in milliseconds.
///
/// A value of zero means "not wanted" on that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartBeat {
    pub outgoing_ms: u64,
    pub incoming_ms: u64,
}

impl HeartBeat {
    pub fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self {
            outgoing_ms,
            incoming_ms,
        }
    }

    /// Parse a `heart-beat` header value (`cx,cy`)
    pub fn parse(value: &str) -> Option<Self> {
        let (out, inc) = value.split_once(',')?;
        Some(Self {
            outgoing_ms: out.trim().parse().ok()?,
            incoming_ms: inc.trim().parse().ok()?,
        })
    }

    /// Intervals actually in effect once the server replied with its own header.
    ///
    /// Each direction uses the larger of the two wishes, or zero if either side
    /// declined it.
    pub fn negotiate(&self, server: &HeartBeat) -> HeartBeat {
        let pick = |ours: u64, theirs: u64| {
            if ours == 0 || theirs == 0 {
                0
            } else {
                ours.max(theirs)
            }
        };
        HeartBeat {
            outgoing_ms: pick(self.outgoing_ms, server.incoming_ms),
            incoming_ms: pick(self.incoming_ms, server.outgoing_ms),
        }
    }

    pub fn header_value(&self) -> String {
        format!("{},{}", self.outgoing_ms, self.incoming_ms)
    }
}

impl Default for HeartBeat {
    fn default() -> Self {
        Self::new(10_000, 10_000)
    }
}
