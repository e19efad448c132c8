//! Plan session: the stores of one plan kept in sync over the five channels.
//!
//! Local edits go through the session so that the optimistic mutation and
//! its publish happen under the same store lock. A refused publish (no plan,
//! full outbox) is rolled back before the lock is released. Echoes and peer
//! edits arrive as `ChannelEvent`s on the event task.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::presence::{CursorThrottle, RemoteCursor, RemoteCursors};
use super::protocol::{
    self, BookmarkId, CursorPosition, DayPlaceAction, DayPlaceId, DayScheduleAction,
    DayScheduleId, Envelope, Inbound, ObjectAttrs, ObjectId, ObjectPosition, PlaceInfo,
    WhiteboardAction,
};
use super::supervisor::{ChannelStatus, ConnectionSupervisor};
use super::{Domain, PlanId, SyncError, SyncResult};
use crate::baseline::BaselineSource;
use crate::channel::{ChannelEvent, ConnectionState, Connector};
use crate::config::SyncConfig;
use crate::store::schedule::ScheduleOutbound;
use crate::store::{
    BoardObject, Bookmark, BookmarkStore, Day, ScheduleStore, Toggle, WhiteboardStore,
};

/// How often overdue optimistic edits are checked
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Everything the agent API reports about a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Random id of this agent run
    pub session_id: Uuid,
    pub plan_id: Option<PlanId>,
    pub user_name: String,
    pub channels: Vec<ChannelStatus>,
    pub bookmarks: Vec<Bookmark>,
    pub days: Vec<Day>,
    pub whiteboard: Vec<BoardObject>,
    pub cursors: Vec<RemoteCursor>,
    /// Local edits still waiting for their echo
    pub pending: usize,
    pub uptime_seconds: u64,
}

pub struct PlanSession {
    id: Uuid,
    config: SyncConfig,
    supervisor: ConnectionSupervisor,
    baseline: Arc<dyn BaselineSource>,
    bookmarks: RwLock<BookmarkStore>,
    schedule: RwLock<ScheduleStore>,
    whiteboard: RwLock<WhiteboardStore>,
    cursors: Arc<RemoteCursors>,
    throttle: Mutex<CursorThrottle>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    changes_tx: broadcast::Sender<Domain>,
    /// Connection count per channel as of the last sweep
    seen_connections: Mutex<HashMap<Domain, u64>>,
    started_at: Instant,
}

/// What a store's channels looked like at sweep time
enum Link {
    Offline,
    /// Reconnected since the last sweep; the outbox flush is the real send
    Fresh,
    Steady,
}

impl PlanSession {
    /// Spawn the channels (idle until `activate` or `set_token`)
    pub fn new(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        baseline: Arc<dyn BaselineSource>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = ConnectionSupervisor::new(config.channel_options(), connector, events_tx);
        let cursors = Arc::new(RemoteCursors::new(
            config.user_name.clone(),
            config.cursor_buffer,
            config.cursor_max_samples,
        ));
        let (changes_tx, _) = broadcast::channel(256);

        Self {
            id: Uuid::new_v4(),
            throttle: Mutex::new(CursorThrottle::new(config.cursor_throttle)),
            config,
            supervisor,
            baseline,
            bookmarks: RwLock::new(BookmarkStore::new()),
            schedule: RwLock::new(ScheduleStore::new()),
            whiteboard: RwLock::new(WhiteboardStore::new()),
            cursors,
            events_rx: Mutex::new(Some(events_rx)),
            changes_tx,
            seen_connections: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        }
    }

    /// Apply the configured plan and token and start connecting
    pub fn activate(&self) {
        info!("Activating session {}", self.id);
        self.set_plan(self.config.plan_id);
        self.set_token(self.config.token.clone());
        self.supervisor.connect();
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn plan_id(&self) -> Option<PlanId> {
        self.supervisor.plan_id()
    }

    pub fn set_token(&self, token: Option<String>) {
        self.supervisor.set_token(token);
    }

    /// Switch plans: every store starts over and every channel resubscribes
    pub fn set_plan(&self, plan_id: Option<PlanId>) {
        if self.plan_id() == plan_id {
            return;
        }
        self.bookmarks.write().set_plan(plan_id);
        self.schedule.write().set_plan(plan_id);
        self.whiteboard.write().set_plan(plan_id);
        self.cursors.clear();
        self.supervisor.set_plan(plan_id);
        for domain in Domain::ALL {
            self.notify(domain);
        }
    }

    pub fn connect(&self) {
        self.supervisor.connect();
    }

    pub fn disconnect(&self) {
        self.supervisor.disconnect();
    }

    /// Notified with the domain whose state changed
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Domain> {
        self.changes_tx.subscribe()
    }

    fn notify(&self, domain: Domain) {
        let _ = self.changes_tx.send(domain);
    }

    // ========================================================================
    // READ ACCESS
    // ========================================================================

    pub fn bookmarks(&self) -> Vec<Bookmark> {
        self.bookmarks.read().items().to_vec()
    }

    pub fn is_bookmarked(&self, bookmark_id: Option<BookmarkId>, place: &PlaceInfo) -> bool {
        self.bookmarks.read().is_bookmarked(bookmark_id, place)
    }

    pub fn days(&self) -> Vec<Day> {
        self.schedule.read().days().to_vec()
    }

    pub fn board(&self) -> Vec<BoardObject> {
        self.whiteboard.read().objects().to_vec()
    }

    pub fn cursors(&self) -> Vec<RemoteCursor> {
        self.cursors.snapshot()
    }

    pub fn pending_count(&self) -> usize {
        self.bookmarks.read().pending_count()
            + self.schedule.read().pending_count()
            + self.whiteboard.read().pending_count()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            plan_id: self.plan_id(),
            user_name: self.config.user_name.clone(),
            channels: self.supervisor.statuses(),
            bookmarks: self.bookmarks(),
            days: self.days(),
            whiteboard: self.board(),
            cursors: self.cursors(),
            pending: self.pending_count(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    // ========================================================================
    // PUBLISHING
    // ========================================================================

    fn publish<T: Envelope>(&self, msg: &T) -> SyncResult<()> {
        let body = protocol::encode(msg)?;
        debug!("[{}] publish {}", T::DOMAIN, msg.action());
        self.supervisor.send(T::DOMAIN, body)
    }

    /// Mutate a store and publish the result, rolling back if refused
    fn commit<S, T: Envelope>(
        &self,
        store: &RwLock<S>,
        apply: impl FnOnce(&mut S, Instant) -> SyncResult<T>,
        rollback: impl FnOnce(&mut S, &T),
    ) -> SyncResult<T> {
        let result = {
            let mut guard = store.write();
            let outbound = apply(&mut *guard, Instant::now())?;
            match self.publish(&outbound) {
                Ok(()) => Ok(outbound),
                Err(e) => {
                    warn!("[{}] {} refused, rolling back: {}", T::DOMAIN, outbound.action(), e);
                    rollback(&mut *guard, &outbound);
                    Err(e)
                }
            }
        };
        self.notify(T::DOMAIN);
        result
    }

    /// Publish a transient preview; nothing to roll back
    fn preview<T: Envelope>(&self, msg: SyncResult<T>) -> SyncResult<T> {
        let msg = msg?;
        self.publish(&msg)?;
        Ok(msg)
    }

    // ========================================================================
    // BOOKMARKS
    // ========================================================================

    /// Save the place, or remove it if it is already saved
    pub fn toggle_bookmark(
        &self,
        bookmark_id: Option<BookmarkId>,
        place: &PlaceInfo,
    ) -> SyncResult<Toggle> {
        let result = {
            let mut store = self.bookmarks.write();
            let toggle = store.toggle(bookmark_id, place, Instant::now());
            let outbound = match &toggle {
                Toggle::Added(action) => Some(action),
                Toggle::Removed(action) => action.as_ref(),
            };
            match outbound.map(|action| (action, self.publish(action))) {
                Some((action, Err(e))) => {
                    warn!("[bookmark] {} refused, rolling back: {}", action.action(), e);
                    store.reject(action);
                    Err(e)
                }
                _ => Ok(toggle.clone()),
            }
        };
        self.notify(Domain::Bookmark);
        result
    }

    // ========================================================================
    // DAY SCHEDULE
    // ========================================================================

    pub fn create_day(&self, title: impl Into<String>) -> SyncResult<DayScheduleAction> {
        let title = title.into();
        self.commit(
            &self.schedule,
            |s, now| Ok(s.create_day(title, now)),
            reject_day,
        )
    }

    pub fn rename_day(
        &self,
        id: DayScheduleId,
        title: impl Into<String>,
    ) -> SyncResult<DayScheduleAction> {
        let title = title.into();
        self.commit(&self.schedule, |s, now| s.rename_day(id, title, now), reject_day)
    }

    /// Broadcast a day drag in progress
    pub fn preview_day_move(&self, id: DayScheduleId, to: usize) -> SyncResult<DayScheduleAction> {
        let msg = self.schedule.read().preview_day_move(id, to);
        self.preview(msg)
    }

    pub fn move_day(&self, id: DayScheduleId, to: usize) -> SyncResult<DayScheduleAction> {
        self.commit(&self.schedule, |s, now| s.move_day(id, to, now), reject_day)
    }

    pub fn delete_day(&self, id: DayScheduleId) -> SyncResult<DayScheduleAction> {
        self.commit(&self.schedule, |s, now| s.delete_day(id, now), reject_day)
    }

    // ========================================================================
    // DAY PLACES
    // ========================================================================

    pub fn add_place(
        &self,
        day_id: DayScheduleId,
        place_id: Option<i64>,
        place: PlaceInfo,
        at: Option<usize>,
    ) -> SyncResult<DayPlaceAction> {
        self.commit(
            &self.schedule,
            |s, now| s.add_place(day_id, place_id, place, at, now),
            reject_place,
        )
    }

    pub fn set_memo(
        &self,
        day_id: DayScheduleId,
        id: DayPlaceId,
        memo: Option<String>,
    ) -> SyncResult<DayPlaceAction> {
        self.commit(
            &self.schedule,
            |s, now| s.set_memo(day_id, id, memo, now),
            reject_place,
        )
    }

    /// Broadcast a place drag in progress
    pub fn preview_place_move(
        &self,
        id: DayPlaceId,
        to_day: DayScheduleId,
        to: usize,
    ) -> SyncResult<DayPlaceAction> {
        let msg = self.schedule.read().preview_place_move(id, to_day, to);
        self.preview(msg)
    }

    /// Reorder within the place's own day
    pub fn move_place(&self, id: DayPlaceId, to: usize) -> SyncResult<DayPlaceAction> {
        self.commit(&self.schedule, |s, now| s.move_place(id, to, now), reject_place)
    }

    /// Move a place to another day
    pub fn transfer_place(
        &self,
        id: DayPlaceId,
        to_day: DayScheduleId,
        to: usize,
    ) -> SyncResult<DayPlaceAction> {
        self.commit(
            &self.schedule,
            |s, now| s.transfer_place(id, to_day, to, now),
            reject_place,
        )
    }

    pub fn delete_place(&self, id: DayPlaceId) -> SyncResult<DayPlaceAction> {
        self.commit(&self.schedule, |s, now| s.delete_place(id, now), reject_place)
    }

    // ========================================================================
    // WHITEBOARD
    // ========================================================================

    /// Pin a place to the board; it appears with the server echo
    pub fn pin_place(
        &self,
        place_id: Option<i64>,
        place: PlaceInfo,
        at: ObjectPosition,
    ) -> SyncResult<WhiteboardAction> {
        let msg = self.whiteboard.read().pin_place(place_id, place, at);
        self.preview(Ok(msg))
    }

    /// Draw a shape; it appears with the server echo
    pub fn draw(&self, attrs: ObjectAttrs) -> SyncResult<WhiteboardAction> {
        let msg = self.whiteboard.read().draw(attrs);
        self.preview(Ok(msg))
    }

    pub fn preview_object_move(
        &self,
        id: ObjectId,
        at: ObjectPosition,
    ) -> SyncResult<WhiteboardAction> {
        let msg = self.whiteboard.read().preview_move(id, at);
        self.preview(msg)
    }

    pub fn modify_object(&self, id: ObjectId, update: ObjectAttrs) -> SyncResult<WhiteboardAction> {
        self.commit(
            &self.whiteboard,
            |s, now| s.modify(id, update, now),
            |s, outbound| s.reject(outbound),
        )
    }

    pub fn delete_object(&self, id: ObjectId) -> SyncResult<WhiteboardAction> {
        self.commit(
            &self.whiteboard,
            |s, now| s.delete(id, now),
            |s, outbound| s.reject(outbound),
        )
    }

    // ========================================================================
    // CURSOR
    // ========================================================================

    /// Report our pointer; returns whether it went out now. Positions
    /// throttled away or produced while offline are dropped.
    pub fn move_cursor(&self, x: f64, y: f64) -> SyncResult<bool> {
        let next = self.throttle.lock().offer(x, y, Instant::now());
        match next {
            Some((x, y)) => self.send_cursor(x, y),
            None => Ok(false),
        }
    }

    /// Send the trailing pointer position once the throttle window has passed
    pub fn flush_cursor(&self) -> SyncResult<bool> {
        let next = self.throttle.lock().flush(Instant::now());
        match next {
            Some((x, y)) => self.send_cursor(x, y),
            None => Ok(false),
        }
    }

    fn send_cursor(&self, x: f64, y: f64) -> SyncResult<bool> {
        let body = protocol::encode(&CursorPosition {
            user_name: self.config.user_name.clone(),
            x,
            y,
        })?;
        self.supervisor.channel(Domain::Cursor).send_live(body)
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    pub async fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message {
                domain,
                plan_id,
                body,
            } => {
                self.handle_message(domain, plan_id, &body);
            }
            // the day schedule baseline already carries every place
            ChannelEvent::Subscribed {
                domain: Domain::DayPlace,
                ..
            } => {}
            ChannelEvent::Subscribed { domain, plan_id } => {
                if let Err(e) = self.load_baseline(domain, plan_id).await {
                    warn!("[{}] baseline for plan {} not loaded: {}", domain, plan_id, e);
                }
            }
        }
    }

    /// Reconcile one message body. Returns whether any state changed.
    pub fn handle_message(&self, domain: Domain, plan_id: PlanId, body: &str) -> bool {
        if self.plan_id() != Some(plan_id) {
            debug!("[{}] message for plan {} ignored", domain, plan_id);
            return false;
        }

        let inbound = match Inbound::decode(domain, body) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("[{}] dropping message: {}", domain, e);
                return false;
            }
        };

        let now = Instant::now();
        let changed = match &inbound {
            Inbound::Bookmark(action) => self.bookmarks.write().apply_remote(action, now),
            Inbound::DaySchedule(action) => self.schedule.write().apply_day(action, now),
            Inbound::DayPlace(action) => self.schedule.write().apply_place(action, now),
            Inbound::Whiteboard(action) => self.whiteboard.write().apply_remote(action, now),
            Inbound::Cursor(position) => self.cursors.record(position, now),
        };

        if changed {
            self.notify(domain);
        }
        changed
    }

    /// Fetch a domain's REST baseline and merge it under pending local edits
    pub async fn load_baseline(&self, domain: Domain, plan_id: PlanId) -> SyncResult<()> {
        let token = self.supervisor.token().ok_or(SyncError::MissingToken)?;

        let loaded = match domain {
            Domain::Bookmark => {
                let items = self.baseline.bookmarks(plan_id, &token).await?;
                let count = items.len();
                self.merge(plan_id, || self.bookmarks.write().load_baseline(plan_id, items));
                count
            }
            Domain::DaySchedule => {
                let days = self.baseline.schedule(plan_id, &token).await?;
                let count = days.len();
                self.merge(plan_id, || self.schedule.write().load_baseline(plan_id, days));
                count
            }
            Domain::Whiteboard => {
                let objects = self.baseline.whiteboard(plan_id, &token).await?;
                let count = objects.len();
                self.merge(plan_id, || self.whiteboard.write().load_baseline(plan_id, objects));
                count
            }
            Domain::DayPlace | Domain::Cursor => return Ok(()),
        };

        info!("[{}] baseline for plan {}: {} entries", domain, plan_id, loaded);
        self.notify(domain);
        Ok(())
    }

    /// Skip a baseline that arrived after the plan changed
    fn merge(&self, plan_id: PlanId, apply: impl FnOnce()) {
        if self.plan_id() == Some(plan_id) {
            apply();
        } else {
            debug!("baseline for plan {} arrived after a plan switch", plan_id);
        }
    }

    // ========================================================================
    // PENDING SWEEP
    // ========================================================================

    /// Resend overdue edits and roll back those out of retries.
    ///
    /// Edits only age while their channel is connected. Right after a
    /// (re)connect the deadlines restart, since the outbox flush is when
    /// queued edits actually left.
    pub fn sweep(&self, now: Instant) -> usize {
        let policy = self.config.pending;
        let mut resent = 0;

        let before = self.pending_count();

        match self.link(&[Domain::Bookmark]) {
            Link::Offline => {}
            Link::Fresh => self.bookmarks.write().restart_pending(now),
            Link::Steady => {
                let swept = self.bookmarks.write().sweep(now, &policy);
                resent += swept.resend.iter().filter(|a| self.resend(*a)).count();
                for action in &swept.expired {
                    self.withdraw(action);
                }
            }
        }

        match self.link(&[Domain::DaySchedule, Domain::DayPlace]) {
            Link::Offline => {}
            Link::Fresh => self.schedule.write().restart_pending(now),
            Link::Steady => {
                let swept = self.schedule.write().sweep(now, &policy);
                for outbound in &swept.resend {
                    let sent = match outbound {
                        ScheduleOutbound::Day(action) => self.resend(action),
                        ScheduleOutbound::Place(action) => self.resend(action),
                    };
                    resent += sent as usize;
                }
                for outbound in &swept.expired {
                    match outbound {
                        ScheduleOutbound::Day(action) => self.withdraw(action),
                        ScheduleOutbound::Place(action) => self.withdraw(action),
                    }
                }
            }
        }

        match self.link(&[Domain::Whiteboard]) {
            Link::Offline => {}
            Link::Fresh => self.whiteboard.write().restart_pending(now),
            Link::Steady => {
                let swept = self.whiteboard.write().sweep(now, &policy);
                resent += swept.resend.iter().filter(|a| self.resend(*a)).count();
                for action in &swept.expired {
                    self.withdraw(action);
                }
            }
        }

        if self.pending_count() < before {
            for domain in [Domain::Bookmark, Domain::DaySchedule, Domain::Whiteboard] {
                self.notify(domain);
            }
        }
        resent
    }

    fn link(&self, domains: &[Domain]) -> Link {
        let channels: Vec<_> = domains.iter().map(|d| self.supervisor.channel(*d)).collect();
        if channels.iter().any(|c| c.state() != ConnectionState::Connected) {
            return Link::Offline;
        }

        let mut seen = self.seen_connections.lock();
        let mut link = Link::Steady;
        for (domain, channel) in domains.iter().zip(channels) {
            let connections = channel.connections();
            if seen.insert(*domain, connections) != Some(connections) {
                link = Link::Fresh;
            }
        }
        link
    }

    /// Pull a rolled-back edit out of the outbox if it never left
    fn withdraw<T: Envelope>(&self, msg: &T) {
        match protocol::encode(msg) {
            Ok(body) => {
                if self.supervisor.channel(T::DOMAIN).withdraw(&body) {
                    debug!("[{}] withdrew queued {}", T::DOMAIN, msg.action());
                }
            }
            Err(e) => warn!("[{}] cannot withdraw {}: {}", T::DOMAIN, msg.action(), e),
        }
    }

    fn resend<T: Envelope>(&self, msg: &T) -> bool {
        match self.publish(msg) {
            Ok(()) => true,
            Err(e) => {
                debug!("[{}] resend of {} deferred: {}", T::DOMAIN, msg.action(), e);
                false
            }
        }
    }

    // ========================================================================
    // BACKGROUND TASKS
    // ========================================================================

    /// Start the event, sweep and cursor tasks; they stop on `shutdown`
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let session = self.clone();
        let events = session.events_rx.lock().take();
        let mut shutdown = session.supervisor.shutdown_receiver();

        // Event task
        let event_handle = tokio::spawn(async move {
            let Some(mut events) = events else {
                warn!("Event task already running");
                return;
            };

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => session.handle_event(event).await,
                        None => break,
                    },
                    _ = shutdown.recv() => {
                        info!("Event task shutting down");
                        break;
                    }
                }
            }
        });

        let session = self.clone();
        let mut shutdown = session.supervisor.shutdown_receiver();

        // Sweep task, also releases the trailing cursor position
        let sweep_handle = tokio::spawn(async move {
            let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
            let flush_every = session.config.cursor_throttle.max(Duration::from_millis(1));
            let mut cursor = tokio::time::interval(flush_every);

            loop {
                tokio::select! {
                    _ = sweep.tick() => {
                        let resent = session.sweep(Instant::now());
                        if resent > 0 {
                            debug!("Resent {} overdue edits", resent);
                        }
                    }
                    _ = cursor.tick() => {
                        if let Err(e) = session.flush_cursor() {
                            debug!("Trailing cursor dropped: {}", e);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Sweep task shutting down");
                        break;
                    }
                }
            }
        });

        let cursor_handle = self
            .cursors
            .clone()
            .start_render_task(self.supervisor.shutdown_receiver());

        BackgroundTaskHandles {
            event_task: event_handle,
            sweep_task: sweep_handle,
            cursor_task: cursor_handle,
        }
    }

    /// Stop channels and background tasks
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

fn reject_day(store: &mut ScheduleStore, outbound: &DayScheduleAction) {
    store.reject(&ScheduleOutbound::Day(outbound.clone()));
}

fn reject_place(store: &mut ScheduleStore, outbound: &DayPlaceAction) {
    store.reject(&ScheduleOutbound::Place(outbound.clone()));
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub event_task: JoinHandle<()>,
    pub sweep_task: JoinHandle<()>,
    pub cursor_task: JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = tokio::join!(self.event_task, self.sweep_task, self.cursor_task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::StaticBaseline;
    use crate::channel::{MemoryConnector, MemoryPeer, WsMessage};
    use crate::stomp::{Command, Frame};
    use crate::store::PendingPolicy;
    use std::collections::HashMap;
    use tokio::time::timeout;

    const TOKEN: &str = "token-0123456789";
    const WAIT: Duration = Duration::from_secs(2);

    fn cafe() -> PlaceInfo {
        PlaceInfo {
            google_place_id: Some("g-cafe".to_string()),
            place_name: Some("Cafe".to_string()),
            latitude: Some(37.5),
            longitude: Some(127.0),
            ..Default::default()
        }
    }

    fn session_with(
        config: SyncConfig,
    ) -> (
        Arc<PlanSession>,
        mpsc::UnboundedReceiver<MemoryPeer>,
        Arc<StaticBaseline>,
    ) {
        let (connector, accept) = MemoryConnector::new();
        let baseline = Arc::new(StaticBaseline::new());
        let session = PlanSession::new(config, Arc::new(connector), baseline.clone());
        (Arc::new(session), accept, baseline)
    }

    fn test_config() -> SyncConfig {
        SyncConfig::default()
            .with_user_name("me")
            .with_ws_url("mem://broker")
            .with_heartbeat_ms(0)
            .with_reconnect_delay(Duration::from_millis(20))
    }

    async fn next_frame(peer: &mut MemoryPeer) -> Frame {
        loop {
            let text = timeout(WAIT, peer.from_client.recv()).await.unwrap().unwrap();
            if let Some(frame) = Frame::decode(text.as_bytes()).unwrap() {
                return frame;
            }
        }
    }

    /// Complete the handshake on every channel; returns (peer, subscription id)
    async fn connect_all(
        accept: &mut mpsc::UnboundedReceiver<MemoryPeer>,
        plan_id: PlanId,
    ) -> HashMap<Domain, (MemoryPeer, String)> {
        let mut peers = HashMap::new();
        for _ in 0..Domain::ALL.len() {
            let mut peer = timeout(WAIT, accept.recv()).await.unwrap().unwrap();
            assert_eq!(next_frame(&mut peer).await.command, Command::Connect);
            peer.to_client
                .send(WsMessage::Text(
                    Frame::new(Command::Connected).encode_text().unwrap(),
                ))
                .unwrap();
            let subscribe = next_frame(&mut peer).await;
            let topic = subscribe.header("destination").unwrap().to_string();
            let id = subscribe.header("id").unwrap().to_string();
            let domain = Domain::ALL
                .into_iter()
                .find(|d| d.topic(plan_id) == topic)
                .unwrap();
            peers.insert(domain, (peer, id));
        }
        peers
    }

    async fn wait_until(session: &PlanSession, mut done: impl FnMut(&PlanSession) -> bool) {
        let mut changes = session.subscribe_changes();
        timeout(WAIT, async {
            while !done(session) {
                let _ = changes.recv().await;
            }
        })
        .await
        .expect("state never converged");
    }

    #[tokio::test]
    async fn test_refused_send_rolls_back() {
        let (session, _accept, _) = session_with(test_config());

        let err = session.toggle_bookmark(None, &cafe()).unwrap_err();
        assert!(matches!(err, SyncError::MissingRoom(Domain::Bookmark)));
        assert!(session.bookmarks().is_empty());
        assert_eq!(session.pending_count(), 0);

        assert!(session.create_day("Day 1").is_err());
        assert!(session.days().is_empty());
    }

    #[tokio::test]
    async fn test_offline_edits_are_queued() {
        let (session, _accept, _) = session_with(test_config());
        session.set_plan(Some(3));

        let toggle = session.toggle_bookmark(None, &cafe()).unwrap();
        assert!(matches!(toggle, Toggle::Added(_)));
        session.create_day("Day 1").unwrap();

        let bookmarks = session.bookmarks();
        assert_eq!(bookmarks.len(), 1);
        assert!(bookmarks[0].pending);
        assert_eq!(session.supervisor().channel(Domain::Bookmark).outbox_len(), 1);
        assert_eq!(session.supervisor().channel(Domain::DaySchedule).outbox_len(), 1);
        assert_eq!(session.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_echo_confirms_pending_bookmark() {
        let (session, _accept, _) = session_with(test_config());
        session.set_plan(Some(3));
        session.toggle_bookmark(None, &cafe()).unwrap();

        let echo = r#"{"action":"CREATE","bookmarkId":10,"googlePlaceId":"g-cafe","placeName":"Cafe"}"#;
        assert!(session.handle_message(Domain::Bookmark, 3, echo));
        // replaying the echo changes nothing
        assert!(!session.handle_message(Domain::Bookmark, 3, echo));

        let bookmarks = session.bookmarks();
        assert_eq!(bookmarks.len(), 1);
        assert_eq!(bookmarks[0].bookmark_id, Some(10));
        assert!(!bookmarks[0].pending);
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_and_malformed_messages_dropped() {
        let (session, _accept, _) = session_with(test_config());
        session.set_plan(Some(3));

        let echo = r#"{"action":"CREATE","bookmarkId":10,"googlePlaceId":"g-1"}"#;
        assert!(!session.handle_message(Domain::Bookmark, 4, echo));
        assert!(!session.handle_message(Domain::Bookmark, 3, "not json"));
        assert!(!session.handle_message(Domain::Bookmark, 3, r#"{"action":"EXPLODE"}"#));
        assert!(session.bookmarks().is_empty());
    }

    #[tokio::test]
    async fn test_cursor_self_echo_ignored() {
        let (session, _accept, _) = session_with(test_config());
        session.set_plan(Some(3));

        assert!(!session.handle_message(Domain::Cursor, 3, r#"{"userName":"me","x":1,"y":2}"#));
        assert!(session.handle_message(Domain::Cursor, 3, r#"{"userName":"kim","x":1,"y":2}"#));

        let cursors = session.cursors();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].user_name, "kim");
    }

    #[tokio::test]
    async fn test_cursor_not_queued_offline() {
        let (session, _accept, _) = session_with(test_config());
        session.set_plan(Some(3));

        assert!(!session.move_cursor(1.0, 1.0).unwrap());
        assert!(!session.move_cursor(2.0, 2.0).unwrap());
        assert_eq!(session.supervisor().channel(Domain::Cursor).outbox_len(), 0);
    }

    #[tokio::test]
    async fn test_place_subscription_skips_baseline() {
        let (session, _accept, baseline) = session_with(test_config());
        session.set_plan(Some(3));
        session.set_token(Some(TOKEN.to_string()));
        baseline.set_schedule(3, vec![Day::new(Some(1), "Day 1")]);

        session
            .handle_event(ChannelEvent::Subscribed {
                domain: Domain::DayPlace,
                plan_id: 3,
            })
            .await;
        assert!(session.days().is_empty());

        session
            .handle_event(ChannelEvent::Subscribed {
                domain: Domain::DaySchedule,
                plan_id: 3,
            })
            .await;
        assert_eq!(session.days().len(), 1);
    }

    #[tokio::test]
    async fn test_baseline_requires_token() {
        let (session, _accept, baseline) = session_with(test_config());
        session.set_plan(Some(3));
        baseline.set_bookmarks(3, vec![Bookmark::confirmed(Some(1), cafe())]);

        assert!(matches!(
            session.load_baseline(Domain::Bookmark, 3).await,
            Err(SyncError::MissingToken)
        ));

        session.set_token(Some(TOKEN.to_string()));
        session.load_baseline(Domain::Bookmark, 3).await.unwrap();
        assert_eq!(session.bookmarks().len(), 1);

        // a baseline for a plan we already left is discarded
        baseline.set_schedule(3, vec![Day::new(Some(1), "Day 1")]);
        session.set_plan(Some(4));
        session.load_baseline(Domain::DaySchedule, 3).await.unwrap();
        assert!(session.days().is_empty());
    }

    #[tokio::test]
    async fn test_expired_edit_rolls_back() {
        let config = test_config().with_pending(PendingPolicy {
            timeout: Duration::from_secs(10),
            max_retries: 1,
        });
        let (session, mut accept, _) = session_with(config);
        session.set_plan(Some(3));
        session.toggle_bookmark(None, &cafe()).unwrap();
        let outbox = || session.supervisor().channel(Domain::Bookmark).outbox_len();

        // offline the edit neither ages nor gets queued twice
        let start = Instant::now();
        for secs in [10, 20, 30] {
            assert_eq!(session.sweep(start + Duration::from_secs(secs)), 0);
        }
        assert_eq!(session.bookmarks().len(), 1);
        assert_eq!(outbox(), 1);

        session.set_token(Some(TOKEN.to_string()));
        session.supervisor().connect();
        let mut peers = connect_all(&mut accept, 3).await;
        let (bookmark_peer, _) = peers.get_mut(&Domain::Bookmark).unwrap();
        let sent = next_frame(bookmark_peer).await;
        assert!(sent.body_text().unwrap().contains("\"CREATE\""));
        assert_eq!(outbox(), 0);

        // the deadline starts at the flush
        let flushed = start + Duration::from_secs(40);
        assert_eq!(session.sweep(flushed), 0);
        assert_eq!(session.sweep(flushed + Duration::from_secs(10)), 1);
        let resent = next_frame(bookmark_peer).await;
        assert_eq!(resent.body_text().unwrap(), sent.body_text().unwrap());

        assert_eq!(session.sweep(flushed + Duration::from_secs(20)), 0);
        assert!(session.bookmarks().is_empty());
        assert_eq!(outbox(), 0);
    }

    #[tokio::test]
    async fn test_rolled_back_edit_leaves_outbox() {
        let (session, _accept, _) = session_with(test_config());
        session.set_plan(Some(3));
        let action = session.create_day("Day 1").unwrap();
        let channel = session.supervisor().channel(Domain::DaySchedule);
        assert_eq!(channel.outbox_len(), 1);

        session.withdraw(&action);
        assert_eq!(channel.outbox_len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_object_sends_nothing() {
        let (session, _accept, _) = session_with(test_config());
        session.set_plan(Some(3));
        assert!(matches!(
            session.delete_object(99),
            Err(SyncError::UnknownEntity(_))
        ));
        assert_eq!(session.supervisor().channel(Domain::Whiteboard).outbox_len(), 0);
    }

    #[tokio::test]
    async fn test_live_session_roundtrip() {
        let config = test_config().with_plan(8).with_token(TOKEN);
        let (session, mut accept, baseline) = session_with(config);
        baseline.set_bookmarks(8, vec![Bookmark::confirmed(Some(1), cafe())]);
        baseline.set_schedule(8, vec![Day::new(Some(5), "Day 1")]);

        let handles = session.clone().start_background_tasks();
        session.activate();
        let mut peers = connect_all(&mut accept, 8).await;

        wait_until(&session, |s| s.bookmarks().len() == 1 && s.days().len() == 1).await;

        // a peer's bookmark arrives on the live subscription
        let (bookmark_peer, sub_id) = peers.get_mut(&Domain::Bookmark).unwrap();
        let message = Frame::new(Command::Message)
            .with_header("subscription", sub_id.as_str())
            .with_header("destination", Domain::Bookmark.topic(8))
            .with_header("message-id", "m-1")
            .with_body(r#"{"action":"CREATE","bookmarkId":2,"googlePlaceId":"g-2","placeName":"Museum"}"#);
        bookmark_peer
            .to_client
            .send(WsMessage::Text(message.encode_text().unwrap()))
            .unwrap();
        wait_until(&session, |s| s.bookmarks().len() == 2).await;

        // our own edit goes out on the day schedule channel
        session.rename_day(5, "Arrival").unwrap();
        let (schedule_peer, _) = peers.get_mut(&Domain::DaySchedule).unwrap();
        let sent = next_frame(schedule_peer).await;
        assert_eq!(sent.command, Command::Send);
        assert_eq!(sent.header("destination"), Some("/app/daySchedule/8"));
        assert!(sent.body_text().unwrap().contains("\"RENAME\""));
        assert_eq!(session.days()[0].title, "Arrival");

        let snapshot = session.snapshot();
        assert_eq!(snapshot.plan_id, Some(8));
        assert_eq!(snapshot.channels.len(), 5);
        assert_eq!(snapshot.session_id, session.id());

        session.shutdown().await;
        timeout(WAIT, handles.wait()).await.unwrap();
    }
}
