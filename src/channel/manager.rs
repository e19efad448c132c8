//! Async driver for one channel.
//!
//! `ChannelManager` is the handle the rest of the crate talks to; the driver
//! task owns the socket. Public calls lock the `ChannelCore`, compute effects
//! and hand them to the driver while still holding the lock, so effects reach
//! the driver in the same order the core produced them.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::transport::{Connector, Transport, WsMessage};
use super::{ChannelCore, ConnectionState, Effect, Outbox, OverflowPolicy};
use crate::stomp::{Command, Frame, HeartBeat, HEARTBEAT};
use crate::sync::{Domain, PlanId, SyncError, SyncResult};

/// Missed incoming heart-beats tolerated before the broker is presumed gone
const HEARTBEAT_TOLERANCE: u32 = 2;

/// Connection settings shared by every channel of a session
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// WebSocket endpoint of the STOMP broker
    pub url: String,
    /// Value of the CONNECT `host` header
    pub host: String,
    pub heart_beat: HeartBeat,
    pub reconnect_delay: Duration,
    pub outbox_capacity: usize,
    pub outbox_policy: OverflowPolicy,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws/websocket".to_string(),
            host: "localhost".to_string(),
            heart_beat: HeartBeat::default(),
            reconnect_delay: Duration::from_millis(5_000),
            outbox_capacity: 512,
            outbox_policy: OverflowPolicy::Reject,
        }
    }
}

/// Notifications from a channel to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A MESSAGE for the current subscription
    Message {
        domain: Domain,
        plan_id: PlanId,
        body: String,
    },
    /// A SUBSCRIBE for this plan was written on a live connection
    Subscribed { domain: Domain, plan_id: PlanId },
}

/// Handle to a running channel
pub struct ChannelManager {
    domain: Domain,
    core: Arc<Mutex<ChannelCore>>,
    effects_tx: mpsc::UnboundedSender<Effect>,
    state: Arc<watch::Sender<ConnectionState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelManager {
    /// Spawn the driver task. Nothing connects until a token is set.
    pub fn spawn(
        domain: Domain,
        options: ChannelOptions,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<ChannelEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let outbox = Outbox::new(options.outbox_capacity, options.outbox_policy);
        let core = Arc::new(Mutex::new(ChannelCore::new(domain, outbox)));
        let (effects_tx, effects_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::NoToken);
        let state = Arc::new(state_tx);

        let driver = Driver {
            domain,
            core: core.clone(),
            connector,
            options,
            effects_rx,
            deferred: VecDeque::new(),
            events,
            state: state.clone(),
            shutdown,
            active: false,
        };
        let task = tokio::spawn(driver.run());

        Self {
            domain,
            core,
            effects_tx,
            state,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn state(&self) -> ConnectionState {
        self.core.lock().state()
    }

    /// Subscribe to state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn room(&self) -> Option<PlanId> {
        self.core.lock().room()
    }

    pub fn outbox_len(&self) -> usize {
        self.core.lock().outbox().len()
    }

    /// Completed handshakes so far; changes on every reconnect
    pub fn connections(&self) -> u64 {
        self.core.lock().connections()
    }

    pub fn set_token(&self, token: Option<String>) {
        self.apply(|core| core.set_token(token));
    }

    pub fn connect(&self) {
        self.apply(ChannelCore::connect);
    }

    pub fn disconnect(&self) {
        self.apply(ChannelCore::disconnect);
    }

    /// Point the channel at a room (or none); resubscribes when live
    pub fn subscribe(&self, plan_id: Option<PlanId>) {
        self.apply(|core| core.set_room(plan_id));
    }

    /// Publish a JSON body, queuing it while disconnected
    pub fn send(&self, body: String) -> SyncResult<()> {
        let mut core = self.core.lock();
        let effects = core.send(body)?;
        for effect in effects {
            self.effects_tx
                .send(effect)
                .map_err(|_| SyncError::ChannelClosed(self.domain))?;
        }
        Ok(())
    }

    /// Publish only on a live connection, dropping the body otherwise.
    /// Returns whether it was handed to the socket.
    pub fn send_live(&self, body: String) -> SyncResult<bool> {
        let mut core = self.core.lock();
        let Some(effect) = core.send_live(body)? else {
            return Ok(false);
        };
        self.effects_tx
            .send(effect)
            .map_err(|_| SyncError::ChannelClosed(self.domain))?;
        Ok(true)
    }

    /// Take back a queued publish that has not been written yet
    pub fn withdraw(&self, body: &str) -> bool {
        self.core.lock().withdraw(body)
    }

    /// Wait for the driver task to finish (after shutdown)
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("[{}] channel driver panicked: {}", self.domain, e);
            }
        }
    }

    fn apply(&self, f: impl FnOnce(&mut ChannelCore) -> Vec<Effect>) {
        let mut core = self.core.lock();
        let effects = f(&mut core);
        publish(&self.state, core.state());
        for effect in effects {
            if self.effects_tx.send(effect).is_err() {
                debug!("[{}] driver gone, effect dropped", self.domain);
            }
        }
    }
}

fn publish(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    state.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

enum SessionEnd {
    Dropped,
    Deactivated,
    Shutdown,
}

struct Driver {
    domain: Domain,
    core: Arc<Mutex<ChannelCore>>,
    connector: Arc<dyn Connector>,
    options: ChannelOptions,
    effects_rx: mpsc::UnboundedReceiver<Effect>,
    /// Control effects pulled off the queue while tearing a connection down
    deferred: VecDeque<Effect>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: broadcast::Receiver<()>,
    active: bool,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let deferred: Vec<Effect> = self.deferred.drain(..).collect();
            self.on_idle(deferred);

            if !self.active {
                tokio::select! {
                    effect = self.effects_rx.recv() => match effect {
                        Some(effect) => {
                            let batch = self.with_queued(effect);
                            self.on_idle(batch);
                        }
                        None => break,
                    },
                    _ = self.shutdown.recv() => break,
                }
                continue;
            }

            match self.session().await {
                SessionEnd::Shutdown => break,
                SessionEnd::Deactivated => continue,
                SessionEnd::Dropped => {
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }
        info!("[{}] channel driver shutting down", self.domain);
    }

    /// `first` plus every effect already waiting behind it
    fn with_queued(&mut self, first: Effect) -> Vec<Effect> {
        let mut batch = vec![first];
        while let Ok(effect) = self.effects_rx.try_recv() {
            batch.push(effect);
        }
        batch
    }

    /// Effects that arrive while there is no live connection.
    ///
    /// Writes of one batch are requeued together so they keep their order.
    fn on_idle(&mut self, batch: Vec<Effect>) {
        let mut unsent = Vec::new();
        for effect in batch {
            match effect {
                Effect::Activate => self.active = true,
                Effect::Deactivate => self.active = false,
                Effect::Write(frame) => unsent.push(frame),
                Effect::Subscribed(_) => {}
            }
        }
        if !unsent.is_empty() {
            self.core.lock().requeue_all(&unsent);
        }
    }

    /// Fixed-delay wait before the next attempt. Returns false on shutdown.
    async fn backoff(&mut self) -> bool {
        let deferred: Vec<Effect> = self.deferred.drain(..).collect();
        self.on_idle(deferred);
        if !self.active {
            return true;
        }

        debug!(
            "[{}] reconnecting in {:?}",
            self.domain, self.options.reconnect_delay
        );
        let sleep = tokio::time::sleep(self.options.reconnect_delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                effect = self.effects_rx.recv() => match effect {
                    Some(effect) => {
                        let batch = self.with_queued(effect);
                        self.on_idle(batch);
                        if !self.active {
                            return true;
                        }
                    }
                    None => return false,
                },
                _ = self.shutdown.recv() => return false,
            }
        }
    }

    /// One connection from CONNECT to teardown
    async fn session(&mut self) -> SessionEnd {
        let connect_frame = {
            let mut core = self.core.lock();
            let frame = core.begin_attempt(&self.options.host, self.options.heart_beat);
            publish(&self.state, core.state());
            frame
        };
        let Some(connect_frame) = connect_frame else {
            self.active = false;
            return SessionEnd::Deactivated;
        };

        info!("[{}] connecting to {}", self.domain, self.options.url);
        let connected = tokio::select! {
            result = self.connector.connect(&self.options.url) => result,
            _ = self.shutdown.recv() => return SessionEnd::Shutdown,
        };
        let mut transport = match connected {
            Ok(transport) => transport,
            Err(e) => {
                warn!("[{}] {}", self.domain, e);
                self.lost(Vec::new());
                return SessionEnd::Dropped;
            }
        };

        if let Err(e) = write_frame(transport.as_mut(), &connect_frame).await {
            warn!("[{}] CONNECT not sent: {}", self.domain, e);
            self.lost(Vec::new());
            return SessionEnd::Dropped;
        }

        let mut stomp_connected = false;
        let mut heartbeat: Option<Interval> = None;
        let mut read_limit: Option<Duration> = None;
        let mut last_read = Instant::now();
        // SENDs that showed up before CONNECTED, oldest first
        let mut held: Vec<Frame> = Vec::new();

        loop {
            tokio::select! {
                incoming = transport.recv() => {
                    if matches!(incoming, Some(Ok(_))) {
                        last_read = Instant::now();
                    }
                    let data = match incoming {
                        Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
                        Some(Ok(WsMessage::Binary(data))) => data,
                        Some(Ok(WsMessage::Close)) | None => {
                            info!("[{}] socket closed", self.domain);
                            self.lost(writes(held));
                            return SessionEnd::Dropped;
                        }
                        Some(Err(e)) => {
                            warn!("[{}] socket error: {}", self.domain, e);
                            self.lost(writes(held));
                            return SessionEnd::Dropped;
                        }
                    };

                    let frame = match Frame::decode(&data) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("[{}] undecodable frame dropped: {}", self.domain, e);
                            continue;
                        }
                    };

                    match frame.command {
                        Command::Connected => {
                            stomp_connected = true;
                            let agreed = self.negotiate(&frame);
                            heartbeat = outgoing_interval(agreed);
                            read_limit = incoming_limit(agreed);
                            let effects = {
                                let mut core = self.core.lock();
                                core.requeue_all(&std::mem::take(&mut held));
                                let effects = core.on_connected();
                                publish(&self.state, core.state());
                                effects
                            };
                            info!("[{}] STOMP connected", self.domain);
                            let mut effects = effects.into_iter();
                            while let Some(effect) = effects.next() {
                                if let Err(failed) =
                                    self.perform(transport.as_mut(), effect).await
                                {
                                    // the rest of the flush goes back to the outbox
                                    let mut leftover: Vec<Effect> =
                                        failed.map(Effect::Write).into_iter().collect();
                                    leftover.extend(effects);
                                    self.lost(leftover);
                                    return SessionEnd::Dropped;
                                }
                            }
                        }
                        Command::Message => self.deliver(&frame),
                        Command::Error => {
                            error!(
                                "[{}] STOMP error: {} {}",
                                self.domain,
                                frame.header("message").unwrap_or_default(),
                                frame.body_text().unwrap_or_default()
                            );
                        }
                        Command::Receipt => {
                            debug!("[{}] receipt {:?}", self.domain, frame.header("receipt-id"));
                        }
                        other => {
                            debug!("[{}] ignoring {} frame", self.domain, other.as_str());
                        }
                    }
                }

                effect = self.effects_rx.recv() => match effect {
                    Some(Effect::Deactivate) => {
                        self.core.lock().requeue_all(&held);
                        self.close(transport.as_mut(), stomp_connected).await;
                        self.active = false;
                        return SessionEnd::Deactivated;
                    }
                    Some(Effect::Activate) => {}
                    Some(Effect::Write(frame)) if !stomp_connected => held.push(frame),
                    Some(effect) => {
                        if let Err(failed) = self.perform(transport.as_mut(), effect).await {
                            self.lost(failed.map(Effect::Write).into_iter().collect());
                            return SessionEnd::Dropped;
                        }
                    }
                    None => {
                        self.core.lock().requeue_all(&held);
                        self.close(transport.as_mut(), stomp_connected).await;
                        return SessionEnd::Shutdown;
                    }
                },

                _ = tick(&mut heartbeat) => {
                    if let Err(e) = transport.send_text(HEARTBEAT.to_string()).await {
                        warn!("[{}] heart-beat failed: {}", self.domain, e);
                        self.lost(Vec::new());
                        return SessionEnd::Dropped;
                    }
                }

                _ = silence(read_limit, last_read) => {
                    warn!(
                        "[{}] nothing from the broker for {:?}, dropping connection",
                        self.domain,
                        read_limit.unwrap_or_default()
                    );
                    if let Err(e) = transport.close().await {
                        debug!("[{}] close: {}", self.domain, e);
                    }
                    self.lost(Vec::new());
                    return SessionEnd::Dropped;
                }

                _ = self.shutdown.recv() => {
                    self.core.lock().requeue_all(&held);
                    self.close(transport.as_mut(), stomp_connected).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    /// Run a live-connection effect. On a failed write the frame is handed back.
    async fn perform(
        &mut self,
        transport: &mut dyn Transport,
        effect: Effect,
    ) -> Result<(), Option<Frame>> {
        match effect {
            Effect::Write(frame) => {
                if let Err(e) = write_frame(transport, &frame).await {
                    warn!("[{}] write failed: {}", self.domain, e);
                    return Err(Some(frame));
                }
                Ok(())
            }
            Effect::Subscribed(plan_id) => {
                let _ = self.events.send(ChannelEvent::Subscribed {
                    domain: self.domain,
                    plan_id,
                });
                Ok(())
            }
            Effect::Activate | Effect::Deactivate => {
                self.deferred.push_back(effect);
                Ok(())
            }
        }
    }

    fn deliver(&self, frame: &Frame) {
        let Some(plan_id) = self.core.lock().accept(frame) else {
            return;
        };
        match frame.body_text() {
            Ok(body) => {
                let _ = self.events.send(ChannelEvent::Message {
                    domain: self.domain,
                    plan_id,
                    body: body.to_string(),
                });
            }
            Err(e) => warn!("[{}] message body dropped: {}", self.domain, e),
        }
    }

    /// Connection lost: move every unsent publish back into the outbox.
    ///
    /// `leftover` holds effects that were taken but not carried out, oldest
    /// first; they go ahead of whatever is still waiting on the channel. Runs
    /// under the core lock so no `send` can slip between the drain and the
    /// state change.
    fn lost(&mut self, leftover: Vec<Effect>) {
        let mut core = self.core.lock();

        let mut pending = leftover;
        while let Ok(effect) = self.effects_rx.try_recv() {
            pending.push(effect);
        }

        let mut unsent = Vec::new();
        for effect in pending {
            match effect {
                Effect::Write(frame) if frame.command == Command::Send => unsent.push(frame),
                Effect::Write(_) | Effect::Subscribed(_) => {}
                control => self.deferred.push_back(control),
            }
        }

        core.on_disconnected();
        core.requeue_all(&unsent);
        if !unsent.is_empty() {
            info!("[{}] {} unsent messages requeued", self.domain, unsent.len());
        }
        publish(&self.state, core.state());
    }

    async fn close(&mut self, transport: &mut dyn Transport, stomp_connected: bool) {
        if stomp_connected {
            let _ = write_frame(transport, &Frame::disconnect(self.domain.segment())).await;
        }
        if let Err(e) = transport.close().await {
            debug!("[{}] close: {}", self.domain, e);
        }
        let mut core = self.core.lock();
        core.on_disconnected();
        publish(&self.state, core.state());
    }

    fn negotiate(&self, connected: &Frame) -> HeartBeat {
        let server = connected
            .header("heart-beat")
            .and_then(HeartBeat::parse)
            .unwrap_or(HeartBeat::new(0, 0));
        let agreed = self.options.heart_beat.negotiate(&server);
        debug!(
            "[{}] heart-beat out {}ms, in {}ms",
            self.domain, agreed.outgoing_ms, agreed.incoming_ms
        );
        agreed
    }
}

fn writes(frames: Vec<Frame>) -> Vec<Effect> {
    frames.into_iter().map(Effect::Write).collect()
}

fn outgoing_interval(agreed: HeartBeat) -> Option<Interval> {
    if agreed.outgoing_ms == 0 {
        return None;
    }
    let period = Duration::from_millis(agreed.outgoing_ms);
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

fn incoming_limit(agreed: HeartBeat) -> Option<Duration> {
    if agreed.incoming_ms == 0 {
        return None;
    }
    Some(Duration::from_millis(agreed.incoming_ms) * HEARTBEAT_TOLERANCE)
}

async fn write_frame(
    transport: &mut dyn Transport,
    frame: &Frame,
) -> Result<(), crate::channel::TransportError> {
    let text = frame
        .encode_text()
        .map_err(|e| crate::channel::TransportError::SendFailed(e.to_string()))?;
    debug!(">>> {}", frame.command.as_str());
    transport.send_text(text).await
}

/// Resolves once nothing has been read for `limit`
async fn silence(limit: Option<Duration>, last_read: Instant) {
    match limit {
        Some(limit) => tokio::time::sleep_until(last_read + limit).await,
        None => std::future::pending::<()>().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
