//! Channel manager: one STOMP subscription/publish pair per domain.
//!
//! The bookkeeping lives in `ChannelCore`, a synchronous state machine that
//! turns lifecycle events into `Effect`s (activate, deactivate, write a frame).
//! `ChannelManager` runs the core against a live transport on a tokio task.
//!
//! The outbox is the only shared mutable state of a channel: public `send`
//! calls enqueue while disconnected and the driver drains it exactly once per
//! successful CONNECTED, both under the same lock.

mod manager;
mod transport;

pub use manager::{ChannelEvent, ChannelManager, ChannelOptions};
pub use transport::{
    Connector, MemoryConnector, MemoryPeer, Transport, TransportError, WebSocketConnector,
    WsMessage,
};

use serde::Serialize;
use std::collections::VecDeque;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::stomp::{Command, Frame, HeartBeat};
use crate::sync::{Domain, PlanId, SyncError, SyncResult};

/// Tokens shorter than this are treated as absent
pub const MIN_TOKEN_LEN: usize = 10;

/// Connection state of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No usable token: the socket stays deactivated
    NoToken,
    Connecting,
    Connected,
    /// Dropped; the driver retries after the reconnect delay
    Disconnected,
}

/// What to do with a publish when the outbox is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Refuse the new message (`SyncError::OutboxFull`)
    #[default]
    Reject,
    /// Evict the oldest queued message
    DropOldest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(OverflowPolicy::Reject),
            "drop-oldest" | "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            other => Err(format!("unknown outbox policy '{}'", other)),
        }
    }
}

/// A publish waiting for a live connection
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub destination: String,
    pub body: String,
}

impl OutboundMessage {
    pub fn to_frame(&self) -> Frame {
        Frame::send(&self.destination, self.body.clone())
    }
}

/// Bounded FIFO of publishes queued while disconnected
#[derive(Debug)]
pub struct Outbox {
    queue: VecDeque<OutboundMessage>,
    capacity: usize,
    policy: OverflowPolicy,
    evicted: u64,
}

impl Outbox {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            policy,
            evicted: 0,
        }
    }

    /// Enqueue a message.
    ///
    /// `Ok(Some(old))` reports an eviction under `DropOldest`,
    /// `Err(msg)` hands back a message refused under `Reject`.
    pub fn push(
        &mut self,
        msg: OutboundMessage,
    ) -> Result<Option<OutboundMessage>, OutboundMessage> {
        if self.queue.len() < self.capacity {
            self.queue.push_back(msg);
            return Ok(None);
        }
        match self.policy {
            OverflowPolicy::Reject => Err(msg),
            OverflowPolicy::DropOldest => {
                let old = self.queue.pop_front();
                self.queue.push_back(msg);
                self.evicted += 1;
                Ok(old)
            }
        }
    }

    /// Put a message back at the head (failed write), ignoring capacity
    pub fn push_front(&mut self, msg: OutboundMessage) {
        self.queue.push_front(msg);
    }

    /// Withdraw a queued message that must no longer go out
    pub fn remove(&mut self, destination: &str, body: &str) -> bool {
        let found = self
            .queue
            .iter()
            .position(|m| m.destination == destination && m.body == body);
        match found {
            Some(index) => self.queue.remove(index).is_some(),
            None => false,
        }
    }

    /// Take everything in FIFO order
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of messages dropped by `DropOldest` so far
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

/// Side effects requested by the channel core
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open the socket (and keep reconnecting)
    Activate,
    /// Close the socket and stop reconnecting
    Deactivate,
    /// Write a frame on the live socket
    Write(Frame),
    /// A subscription for this plan was just issued
    Subscribed(PlanId),
}

/// The active broker subscription
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub plan_id: PlanId,
    pub topic: String,
}

/// Synchronous state of one channel
#[derive(Debug)]
pub struct ChannelCore {
    domain: Domain,
    state: ConnectionState,
    token: Option<String>,
    room: Option<PlanId>,
    subscription: Option<Subscription>,
    next_subscription: u64,
    /// Completed STOMP handshakes so far
    connections: u64,
    outbox: Outbox,
}

impl ChannelCore {
    pub fn new(domain: Domain, outbox: Outbox) -> Self {
        Self {
            domain,
            state: ConnectionState::NoToken,
            token: None,
            room: None,
            subscription: None,
            next_subscription: 0,
            connections: 0,
            outbox,
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn room(&self) -> Option<PlanId> {
        self.room
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Bumped on every CONNECTED, so callers can tell a reconnect happened
    pub fn connections(&self) -> u64 {
        self.connections
    }

    /// Install or clear the access token.
    ///
    /// A token shorter than `MIN_TOKEN_LEN` counts as no token. Changing the
    /// token on a live connection reconnects so the new header is used.
    pub fn set_token(&mut self, token: Option<String>) -> Vec<Effect> {
        let token = token.filter(|t| t.len() >= MIN_TOKEN_LEN);

        let Some(token) = token else {
            self.token = None;
            if self.state == ConnectionState::NoToken {
                return Vec::new();
            }
            warn!("[{}] token missing -> keep disconnected", self.domain);
            self.state = ConnectionState::NoToken;
            self.subscription = None;
            return vec![Effect::Deactivate];
        };

        let changed = self.token.as_deref() != Some(token.as_str());
        self.token = Some(token);

        match self.state {
            ConnectionState::NoToken => {
                self.state = ConnectionState::Connecting;
                vec![Effect::Activate]
            }
            ConnectionState::Connected if changed => {
                info!("[{}] token changed, reconnecting", self.domain);
                self.state = ConnectionState::Connecting;
                self.subscription = None;
                vec![Effect::Deactivate, Effect::Activate]
            }
            _ => Vec::new(),
        }
    }

    /// Idempotent activation; silently stays down without a token
    pub fn connect(&mut self) -> Vec<Effect> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => Vec::new(),
            _ if self.token.is_none() => {
                debug!("[{}] connect skipped: no token", self.domain);
                Vec::new()
            }
            _ => {
                self.state = ConnectionState::Connecting;
                vec![Effect::Activate]
            }
        }
    }

    /// Explicit teardown. The token is forgotten; `set_token` re-activates.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        self.set_token(None)
    }

    /// Start a connection attempt, yielding the CONNECT frame to send.
    ///
    /// `None` means the token went away and the attempt must be abandoned.
    pub fn begin_attempt(&mut self, host: &str, heart_beat: HeartBeat) -> Option<Frame> {
        let token = self.token.as_deref()?;
        self.state = ConnectionState::Connecting;
        Some(Frame::connect(host, token, heart_beat))
    }

    /// CONNECTED received: subscribe first, then flush the outbox in FIFO order
    pub fn on_connected(&mut self) -> Vec<Effect> {
        self.state = ConnectionState::Connected;
        self.connections += 1;
        let mut effects = self.subscribe_effects();

        let queued = self.outbox.drain();
        if !queued.is_empty() {
            info!("[{}] flushing {} queued messages", self.domain, queued.len());
        }
        effects.extend(queued.iter().map(|msg| Effect::Write(msg.to_frame())));
        effects
    }

    /// The socket dropped. Broker-side subscriptions die with it.
    pub fn on_disconnected(&mut self) {
        self.subscription = None;
        if self.state != ConnectionState::NoToken {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Switch rooms: unsubscribe the old topic before subscribing the new one
    pub fn set_room(&mut self, room: Option<PlanId>) -> Vec<Effect> {
        if self.room == room {
            return Vec::new();
        }
        self.room = room;

        if self.state != ConnectionState::Connected {
            return Vec::new();
        }

        let mut effects = Vec::new();
        if let Some(previous) = self.subscription.take() {
            debug!("[{}] UNSUBSCRIBE -> {}", self.domain, previous.topic);
            effects.push(Effect::Write(Frame::unsubscribe(&previous.id)));
        }
        effects.extend(self.subscribe_effects());
        effects
    }

    /// Publish now if connected, otherwise queue
    pub fn send(&mut self, body: String) -> SyncResult<Vec<Effect>> {
        let Some(room) = self.room else {
            warn!("[{}] send skipped: missing planId", self.domain);
            return Err(SyncError::MissingRoom(self.domain));
        };

        let msg = OutboundMessage {
            destination: self.domain.destination(room),
            body,
        };

        if self.state == ConnectionState::Connected {
            return Ok(vec![Effect::Write(msg.to_frame())]);
        }

        match self.outbox.push(msg) {
            Ok(None) => {
                debug!("[{}] queued ({} pending)", self.domain, self.outbox.len());
                Ok(Vec::new())
            }
            Ok(Some(evicted)) => {
                warn!(
                    "[{}] outbox full, dropped oldest message for {}",
                    self.domain, evicted.destination
                );
                Ok(Vec::new())
            }
            Err(_) => {
                warn!("[{}] outbox full, message refused", self.domain);
                Err(SyncError::OutboxFull {
                    domain: self.domain,
                    capacity: self.outbox.capacity(),
                })
            }
        }
    }

    /// Publish only on a live connection. Nothing is queued; `Ok(None)` means
    /// the message was dropped.
    pub fn send_live(&mut self, body: String) -> SyncResult<Option<Effect>> {
        let Some(room) = self.room else {
            return Err(SyncError::MissingRoom(self.domain));
        };
        if self.state != ConnectionState::Connected {
            return Ok(None);
        }
        Ok(Some(Effect::Write(Frame::send(
            &self.domain.destination(room),
            body,
        ))))
    }

    /// Drop a queued publish of `body`, if it has not gone out yet
    pub fn withdraw(&mut self, body: &str) -> bool {
        let Some(room) = self.room else {
            return false;
        };
        let withdrawn = self.outbox.remove(&self.domain.destination(room), body);
        if withdrawn {
            debug!("[{}] queued message withdrawn", self.domain);
        }
        withdrawn
    }

    /// A SEND frame could not be written: keep it for the next connection.
    ///
    /// Cursor positions are never replayed.
    pub fn requeue(&mut self, frame: &Frame) {
        if frame.command != Command::Send || self.domain == Domain::Cursor {
            return;
        }
        let (Some(destination), Ok(body)) = (frame.header("destination"), frame.body_text())
        else {
            return;
        };
        self.outbox.push_front(OutboundMessage {
            destination: destination.to_string(),
            body: body.to_string(),
        });
    }

    /// Requeue unsent frames (oldest first) ahead of anything queued since
    pub fn requeue_all(&mut self, frames: &[Frame]) {
        for frame in frames.iter().rev() {
            self.requeue(frame);
        }
    }

    /// Accept a MESSAGE frame only if it belongs to the current subscription.
    ///
    /// Returns the plan the message is scoped to.
    pub fn accept(&self, frame: &Frame) -> Option<PlanId> {
        if frame.command != Command::Message {
            return None;
        }
        let sub = self.subscription.as_ref()?;

        let matches = match frame.header("subscription") {
            Some(id) => id == sub.id,
            None => frame.header("destination") == Some(sub.topic.as_str()),
        };

        if matches {
            Some(sub.plan_id)
        } else {
            debug!("[{}] dropping message for a stale subscription", self.domain);
            None
        }
    }

    fn subscribe_effects(&mut self) -> Vec<Effect> {
        let Some(plan_id) = self.room else {
            warn!("[{}] planId missing -> skip subscribe", self.domain);
            return Vec::new();
        };

        self.next_subscription += 1;
        let sub = Subscription {
            id: format!("{}-{}", self.domain, self.next_subscription),
            plan_id,
            topic: self.domain.topic(plan_id),
        };
        info!("[{}] SUBSCRIBE -> {}", self.domain, sub.topic);

        let frame = Frame::subscribe(&sub.id, &sub.topic);
        self.subscription = Some(sub);
        vec![Effect::Write(frame), Effect::Subscribed(plan_id)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "token-0123456789";

    fn core(domain: Domain) -> ChannelCore {
        ChannelCore::new(domain, Outbox::new(16, OverflowPolicy::Reject))
    }

    fn connected(domain: Domain, room: PlanId) -> ChannelCore {
        let mut core = core(domain);
        core.set_room(Some(room));
        core.set_token(Some(TOKEN.to_string()));
        core.begin_attempt("localhost", HeartBeat::default());
        core.on_connected();
        core
    }

    fn written(effects: &[Effect]) -> Vec<(Command, Option<String>)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Write(f) => Some((
                    f.command,
                    f.header("destination").map(str::to_string),
                )),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_short_token_keeps_deactivated() {
        let mut core = core(Domain::Bookmark);
        assert!(core.set_token(Some("short".to_string())).is_empty());
        assert_eq!(core.state(), ConnectionState::NoToken);
        assert!(core.connect().is_empty());
        assert!(core.begin_attempt("localhost", HeartBeat::default()).is_none());
    }

    #[test]
    fn test_token_activates_once() {
        let mut core = core(Domain::Bookmark);
        assert_eq!(core.set_token(Some(TOKEN.to_string())), vec![Effect::Activate]);
        assert_eq!(core.state(), ConnectionState::Connecting);
        assert!(core.connect().is_empty());
        assert!(core.set_token(Some(TOKEN.to_string())).is_empty());
    }

    #[test]
    fn test_connect_frame_carries_bearer() {
        let mut core = core(Domain::DayPlace);
        core.set_token(Some(TOKEN.to_string()));
        let frame = core.begin_attempt("broker", HeartBeat::default()).unwrap();
        assert_eq!(frame.command, Command::Connect);
        assert_eq!(
            frame.header("Authorization"),
            Some(format!("Bearer {}", TOKEN).as_str())
        );
    }

    #[test]
    fn test_token_cleared_deactivates() {
        let mut core = connected(Domain::Bookmark, 5);
        assert_eq!(core.set_token(None), vec![Effect::Deactivate]);
        assert_eq!(core.state(), ConnectionState::NoToken);
        assert!(core.subscription().is_none());

        // drop after teardown keeps NoToken
        core.on_disconnected();
        assert_eq!(core.state(), ConnectionState::NoToken);
    }

    #[test]
    fn test_token_change_reconnects() {
        let mut core = connected(Domain::Whiteboard, 1);
        let effects = core.set_token(Some("another-token-xyz".to_string()));
        assert_eq!(effects, vec![Effect::Deactivate, Effect::Activate]);
        assert_eq!(core.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_outbox_flushes_fifo_after_subscribe() {
        let mut core = core(Domain::Bookmark);
        core.set_room(Some(5));
        for i in 0..3 {
            let effects = core.send(format!("{{\"n\":{}}}", i)).unwrap();
            assert!(effects.is_empty());
        }
        assert_eq!(core.outbox().len(), 3);

        core.set_token(Some(TOKEN.to_string()));
        core.begin_attempt("localhost", HeartBeat::default());
        let effects = core.on_connected();

        assert_eq!(
            written(&effects),
            vec![
                (Command::Subscribe, Some("/topic/bookmark/5".to_string())),
                (Command::Send, Some("/app/bookmark/5".to_string())),
                (Command::Send, Some("/app/bookmark/5".to_string())),
                (Command::Send, Some("/app/bookmark/5".to_string())),
            ]
        );
        let bodies: Vec<String> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Write(f) if f.command == Command::Send => {
                    Some(f.body_text().unwrap().to_string())
                }
                _ => None,
            })
            .collect();
        assert_eq!(bodies, vec!["{\"n\":0}", "{\"n\":1}", "{\"n\":2}"]);
        assert!(effects.contains(&Effect::Subscribed(5)));
        assert!(core.outbox().is_empty());
    }

    #[test]
    fn test_send_when_connected_writes_directly() {
        let mut core = connected(Domain::DaySchedule, 3);
        let effects = core.send("{}".to_string()).unwrap();
        assert_eq!(
            written(&effects),
            vec![(Command::Send, Some("/app/daySchedule/3".to_string()))]
        );
        assert!(core.outbox().is_empty());
    }

    #[test]
    fn test_send_without_room_is_skipped() {
        let mut core = core(Domain::DayPlace);
        assert!(matches!(
            core.send("{}".to_string()),
            Err(SyncError::MissingRoom(Domain::DayPlace))
        ));
        assert!(core.outbox().is_empty());
    }

    #[test]
    fn test_room_switch_unsubscribes_first() {
        let mut core = connected(Domain::Bookmark, 5);
        let old_id = core.subscription().unwrap().id.clone();

        let effects = core.set_room(Some(7));
        match &effects[0] {
            Effect::Write(f) => {
                assert_eq!(f.command, Command::Unsubscribe);
                assert_eq!(f.header("id"), Some(old_id.as_str()));
            }
            other => panic!("expected UNSUBSCRIBE, got {:?}", other),
        }
        assert_eq!(
            written(&effects[1..]),
            vec![(Command::Subscribe, Some("/topic/bookmark/7".to_string()))]
        );
        assert_eq!(core.subscription().unwrap().plan_id, 7);
    }

    #[test]
    fn test_stale_subscription_messages_dropped() {
        let mut core = connected(Domain::Bookmark, 5);
        let old_id = core.subscription().unwrap().id.clone();
        core.set_room(Some(7));
        let new_id = core.subscription().unwrap().id.clone();

        let stale = Frame::new(Command::Message)
            .with_header("subscription", old_id)
            .with_header("destination", "/topic/bookmark/5");
        assert_eq!(core.accept(&stale), None);

        let fresh = Frame::new(Command::Message)
            .with_header("subscription", new_id)
            .with_header("destination", "/topic/bookmark/7");
        assert_eq!(core.accept(&fresh), Some(7));

        let by_destination =
            Frame::new(Command::Message).with_header("destination", "/topic/bookmark/7");
        assert_eq!(core.accept(&by_destination), Some(7));
    }

    #[test]
    fn test_missing_room_skips_subscribe() {
        let mut core = core(Domain::Cursor);
        core.set_token(Some(TOKEN.to_string()));
        core.begin_attempt("localhost", HeartBeat::default());
        let effects = core.on_connected();
        assert!(effects.is_empty());
        assert!(core.subscription().is_none());
        assert_eq!(core.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_same_room_is_noop() {
        let mut core = connected(Domain::Bookmark, 5);
        assert!(core.set_room(Some(5)).is_empty());
    }

    #[test]
    fn test_disconnect_clears_subscription() {
        let mut core = connected(Domain::Whiteboard, 2);
        core.on_disconnected();
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(core.subscription().is_none());
        assert!(core.accept(
            &Frame::new(Command::Message).with_header("destination", "/topic/whiteboard/2")
        )
        .is_none());
    }

    #[test]
    fn test_outbox_reject_policy() {
        let mut core = ChannelCore::new(Domain::Bookmark, Outbox::new(2, OverflowPolicy::Reject));
        core.set_room(Some(1));
        core.send("a".to_string()).unwrap();
        core.send("b".to_string()).unwrap();
        let err = core.send("c".to_string()).unwrap_err();
        assert!(matches!(err, SyncError::OutboxFull { capacity: 2, .. }));
        assert_eq!(core.outbox().len(), 2);
    }

    #[test]
    fn test_live_send_never_queues() {
        let mut core = core(Domain::Cursor);
        assert!(core.send_live("{}".to_string()).is_err());

        core.set_room(Some(4));
        assert_eq!(core.send_live("{}".to_string()).unwrap(), None);
        assert!(core.outbox().is_empty());

        core.set_token(Some(TOKEN.to_string()));
        core.begin_attempt("localhost", HeartBeat::default());
        core.on_connected();
        let effect = core.send_live("{\"x\":1}".to_string()).unwrap();
        assert_eq!(
            written(&effect.into_iter().collect::<Vec<_>>()),
            vec![(Command::Send, Some("/app/mouse/move/4".to_string()))]
        );
    }

    #[test]
    fn test_withdraw_queued_message() {
        let mut core = core(Domain::Bookmark);
        core.set_room(Some(5));
        core.send("a".to_string()).unwrap();
        core.send("b".to_string()).unwrap();

        assert!(core.withdraw("a"));
        assert!(!core.withdraw("a"));
        assert_eq!(core.outbox().len(), 1);

        core.set_token(Some(TOKEN.to_string()));
        core.begin_attempt("localhost", HeartBeat::default());
        let effects = core.on_connected();
        assert_eq!(written(&effects).len(), 2);
        assert_eq!(core.connections(), 1);
    }

    #[test]
    fn test_requeue_all_keeps_order() {
        let mut core = core(Domain::Bookmark);
        core.set_room(Some(5));
        core.send("c".to_string()).unwrap();

        let frames: Vec<Frame> = ["a", "b"]
            .iter()
            .map(|b| Frame::send("/app/bookmark/5", b.to_string()))
            .collect();
        core.requeue_all(&frames);

        core.set_token(Some(TOKEN.to_string()));
        core.begin_attempt("localhost", HeartBeat::default());
        let bodies: Vec<String> = core
            .on_connected()
            .iter()
            .filter_map(|e| match e {
                Effect::Write(f) if f.command == Command::Send => {
                    Some(f.body_text().unwrap().to_string())
                }
                _ => None,
            })
            .collect();
        assert_eq!(bodies, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cursor_frames_never_requeued() {
        let mut core = core(Domain::Cursor);
        core.set_room(Some(5));
        core.requeue(&Frame::send("/app/mouse/move/5", "{}".to_string()));
        assert!(core.outbox().is_empty());
    }

    #[test]
    fn test_outbox_drop_oldest_policy() {
        let mut outbox = Outbox::new(2, OverflowPolicy::DropOldest);
        let msg = |b: &str| OutboundMessage {
            destination: "/app/x/1".to_string(),
            body: b.to_string(),
        };
        assert_eq!(outbox.push(msg("a")), Ok(None));
        assert_eq!(outbox.push(msg("b")), Ok(None));
        assert_eq!(outbox.push(msg("c")), Ok(Some(msg("a"))));
        assert_eq!(outbox.evicted(), 1);
        let drained: Vec<String> = outbox.drain().into_iter().map(|m| m.body).collect();
        assert_eq!(drained, vec!["b", "c"]);
    }

    #[test]
    fn test_requeue_puts_message_first() {
        let mut core = core(Domain::Bookmark);
        core.set_room(Some(1));
        core.send("second".to_string()).unwrap();
        core.requeue(&Frame::send("/app/bookmark/1", "first"));
        core.requeue(&Frame::subscribe("x", "/topic/bookmark/1"));

        let bodies: Vec<String> = core.outbox.drain().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec!["first", "second"]);
    }

    #[test]
    fn test_overflow_policy_parse() {
        assert_eq!("reject".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Reject));
        assert_eq!(
            "drop-oldest".parse::<OverflowPolicy>(),
            Ok(OverflowPolicy::DropOldest)
        );
        assert!("whatever".parse::<OverflowPolicy>().is_err());
    }
}
