//! Bookmark store: the plan's shared list of saved places.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::identity::{self, normalize_name, Identified, PlaceIdentity};
use super::pending::{PendingLedger, PendingPolicy, SweepOutcome, Swept};
use crate::sync::protocol::{BookmarkAction, BookmarkId, BookmarkPayload, BookmarkRef, PlaceInfo};
use crate::sync::PlanId;

/// A saved place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    /// Assigned by the server; `None` until the CREATE echo arrives
    pub bookmark_id: Option<BookmarkId>,
    #[serde(flatten)]
    pub place: PlaceInfo,
    #[serde(default)]
    pub pending: bool,
}

impl Bookmark {
    pub fn confirmed(bookmark_id: Option<BookmarkId>, place: PlaceInfo) -> Self {
        Self {
            bookmark_id,
            place,
            pending: false,
        }
    }
}

impl Identified for Bookmark {
    fn identity(&self) -> PlaceIdentity<'_> {
        PlaceIdentity::of(self.bookmark_id, &self.place)
    }
}

/// Ledger key of an in-flight bookmark operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BookmarkKey {
    Id(BookmarkId),
    GooglePlace(String),
    Name(String),
}

impl BookmarkKey {
    fn for_place(place: &PlaceInfo) -> Self {
        match place.google_place_id.as_deref().filter(|g| !g.is_empty()) {
            Some(g) => BookmarkKey::GooglePlace(g.to_string()),
            None => BookmarkKey::Name(normalize_name(place.place_name.as_deref().unwrap_or(""))),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Undo {
    /// Drop the optimistic entry
    Remove,
    /// Put a removed entry back at its old position
    Restore(Bookmark, usize),
}

#[derive(Debug, Clone)]
pub struct PendingBookmark {
    pub outbound: BookmarkAction,
    pub undo: Undo,
}

/// Result of a toggle
#[derive(Debug, Clone, PartialEq)]
pub enum Toggle {
    /// Added optimistically; publish the CREATE
    Added(BookmarkAction),
    /// Removed; publish the DELETE if the entry had a server id
    Removed(Option<BookmarkAction>),
}

#[derive(Debug, Default)]
pub struct BookmarkStore {
    plan_id: Option<PlanId>,
    items: Vec<Bookmark>,
    pending: PendingLedger<BookmarkKey, PendingBookmark>,
}

impl BookmarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan_id(&self) -> Option<PlanId> {
        self.plan_id
    }

    pub fn items(&self) -> &[Bookmark] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Switch plans; the old plan's entries and in-flight operations are dropped
    pub fn set_plan(&mut self, plan_id: Option<PlanId>) {
        if self.plan_id != plan_id {
            self.plan_id = plan_id;
            self.items.clear();
            self.pending.clear();
        }
    }

    /// Whether the described place is already saved (any identity rule)
    pub fn is_bookmarked(&self, bookmark_id: Option<BookmarkId>, place: &PlaceInfo) -> bool {
        self.find(bookmark_id, place).is_some()
    }

    pub fn find(&self, bookmark_id: Option<BookmarkId>, place: &PlaceInfo) -> Option<&Bookmark> {
        let target = PlaceIdentity::of(bookmark_id, place);
        identity::find_match(&self.items, &target).map(|(i, _)| &self.items[i])
    }

    /// Bookmark the place if it is not saved yet, otherwise remove it
    pub fn toggle(
        &mut self,
        bookmark_id: Option<BookmarkId>,
        place: &PlaceInfo,
        now: Instant,
    ) -> Toggle {
        let target = PlaceIdentity::of(bookmark_id, place);
        match identity::find_match(&self.items, &target) {
            Some((index, kind)) => {
                debug!("toggle matched existing bookmark by {:?}", kind);
                Toggle::Removed(self.remove_at(index, now))
            }
            None => Toggle::Added(self.add(place.clone(), now)),
        }
    }

    /// Append a pending entry and return the CREATE to publish
    pub fn add(&mut self, place: PlaceInfo, now: Instant) -> BookmarkAction {
        let outbound = BookmarkAction::Create(BookmarkPayload {
            details: place.clone(),
            ..Default::default()
        });
        let key = BookmarkKey::for_place(&place);
        self.items.push(Bookmark {
            bookmark_id: None,
            place,
            pending: true,
        });
        self.pending.track(
            key,
            PendingBookmark {
                outbound: outbound.clone(),
                undo: Undo::Remove,
            },
            now,
        );
        outbound
    }

    /// Remove the entry at `index`.
    ///
    /// Without a server id there is nothing to delete remotely: the removal
    /// stays local and `None` is returned.
    pub fn remove_at(&mut self, index: usize, now: Instant) -> Option<BookmarkAction> {
        if index >= self.items.len() {
            return None;
        }
        let entry = self.items.remove(index);

        let Some(id) = entry.bookmark_id else {
            warn!(
                "bookmark {:?} has no id, removed locally only",
                entry.place.place_name
            );
            self.pending.cancel(&BookmarkKey::for_place(&entry.place));
            return None;
        };

        let outbound = BookmarkAction::Delete(BookmarkRef {
            bookmark_id: Some(id),
            ..Default::default()
        });
        self.pending.track(
            BookmarkKey::Id(id),
            PendingBookmark {
                outbound: outbound.clone(),
                undo: Undo::Restore(entry, index),
            },
            now,
        );
        Some(outbound)
    }

    /// Reconcile an echo (ours or a peer's). Returns whether the list changed.
    pub fn apply_remote(&mut self, action: &BookmarkAction, now: Instant) -> bool {
        match action {
            BookmarkAction::Create(payload) | BookmarkAction::Update(payload) => {
                self.upsert(payload, now)
            }
            BookmarkAction::Delete(target) => self.delete(target, now),
        }
    }

    fn upsert(&mut self, payload: &BookmarkPayload, now: Instant) -> bool {
        let echo = Bookmark::confirmed(payload.id(), payload.place_info());
        let target = echo.identity();

        // server ids first; fuzzy identity only against our own pending entries
        let index = identity::find_strong_match(&self.items, &target).or_else(|| {
            identity::find_match(&self.items, &target)
                .filter(|(i, _)| self.items[*i].pending)
                .map(|(i, _)| i)
        });

        self.resolve_keys(&echo, now);

        match index {
            Some(i) => {
                if self.items[i] == echo {
                    return false;
                }
                self.items[i] = echo;
            }
            None => {
                debug!("bookmark {:?} created remotely", echo.bookmark_id);
                self.items.push(echo);
            }
        }
        true
    }

    fn delete(&mut self, target: &BookmarkRef, now: Instant) -> bool {
        let before = self.items.len();
        match (target.id(), target.google_place_id.as_deref()) {
            (Some(id), _) => {
                self.items.retain(|b| b.bookmark_id != Some(id));
                self.pending.resolve(&BookmarkKey::Id(id), now);
            }
            (None, Some(g)) => {
                self.items
                    .retain(|b| b.place.google_place_id.as_deref() != Some(g));
                self.pending
                    .resolve(&BookmarkKey::GooglePlace(g.to_string()), now);
            }
            (None, None) => warn!("bookmark DELETE without identifier ignored"),
        }
        self.items.len() != before
    }

    fn resolve_keys(&mut self, echo: &Bookmark, now: Instant) {
        let mut keys = vec![BookmarkKey::for_place(&echo.place)];
        if let Some(id) = echo.bookmark_id {
            keys.push(BookmarkKey::Id(id));
        }
        for key in keys {
            if let Some(rtt) = self.pending.resolve(&key, now) {
                info!("bookmark echo {:?} after {}ms", key, rtt.as_millis());
            }
        }
    }

    /// Replace the list with a REST baseline, keeping in-flight local changes
    pub fn load_baseline(&mut self, plan_id: PlanId, baseline: Vec<Bookmark>) {
        self.set_plan(Some(plan_id));

        let mut merged: Vec<Bookmark> = baseline
            .into_iter()
            .filter(|b| match b.bookmark_id {
                // deletion still in flight
                Some(id) => !self.pending.is_pending(&BookmarkKey::Id(id)),
                None => true,
            })
            .collect();

        for local in self.items.iter().filter(|b| b.pending) {
            if identity::find_strong_match(&merged, &local.identity()).is_none() {
                merged.push(local.clone());
            }
        }

        debug!("bookmark baseline: {} entries", merged.len());
        self.items = merged;
    }

    /// Resend overdue operations; roll back those out of retries
    pub fn sweep(&mut self, now: Instant, policy: &PendingPolicy) -> Swept<BookmarkAction> {
        let mut swept = Swept::default();
        for outcome in self.pending.sweep(now, policy) {
            match outcome {
                SweepOutcome::Resend { key, op } => {
                    debug!("resending bookmark {:?}", key);
                    swept.resend.push(op.outbound);
                }
                SweepOutcome::Expired { key, op } => {
                    warn!("bookmark {:?} never confirmed, rolling back", key);
                    self.undo(&key, op.undo);
                    swept.expired.push(op.outbound);
                }
            }
        }
        swept
    }

    /// Queued edits were just written; their deadlines start now
    pub fn restart_pending(&mut self, now: Instant) {
        self.pending.restart(now);
    }

    /// The publish of `outbound` was refused: roll it back now
    pub fn reject(&mut self, outbound: &BookmarkAction) {
        let key = match outbound {
            BookmarkAction::Create(p) | BookmarkAction::Update(p) => {
                BookmarkKey::for_place(&p.place_info())
            }
            BookmarkAction::Delete(r) => match r.id() {
                Some(id) => BookmarkKey::Id(id),
                None => return,
            },
        };
        if let Some(op) = self.pending.cancel(&key) {
            warn!("bookmark {:?} not sent, rolling back", key);
            self.undo(&key, op.undo);
        }
    }

    fn undo(&mut self, key: &BookmarkKey, undo: Undo) {
        match undo {
            Undo::Remove => {
                let stale = self.items.iter().position(|b| {
                    b.pending && b.bookmark_id.is_none() && &BookmarkKey::for_place(&b.place) == key
                });
                if let Some(i) = stale {
                    self.items.remove(i);
                }
            }
            Undo::Restore(entry, index) => {
                let index = index.min(self.items.len());
                self.items.insert(index, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::protocol;
    use std::time::Duration;

    fn place(google: &str, name: &str) -> PlaceInfo {
        PlaceInfo {
            google_place_id: Some(google.to_string()),
            place_name: Some(name.to_string()),
            latitude: Some(33.5),
            longitude: Some(126.5),
            ..Default::default()
        }
    }

    fn echo_create(id: BookmarkId, google: &str, name: &str) -> BookmarkAction {
        BookmarkAction::Create(BookmarkPayload {
            bookmark_id: Some(id),
            details: place(google, name),
            ..Default::default()
        })
    }

    fn store() -> BookmarkStore {
        let mut store = BookmarkStore::new();
        store.set_plan(Some(5));
        store
    }

    #[test]
    fn test_toggle_adds_pending_then_echo_confirms() {
        let now = Instant::now();
        let mut store = store();

        let Toggle::Added(outbound) = store.toggle(None, &place("g-1", "Cafe"), now) else {
            panic!("expected add");
        };
        assert!(matches!(outbound, BookmarkAction::Create(_)));
        assert_eq!(store.len(), 1);
        assert!(store.items()[0].pending);
        assert_eq!(store.pending_count(), 1);

        // echo keyed by the new server id, same googlePlaceId: replace, not duplicate
        assert!(store.apply_remote(&echo_create(31, "g-1", "Cafe"), now));
        assert_eq!(store.len(), 1);
        assert_eq!(store.items()[0].bookmark_id, Some(31));
        assert!(!store.items()[0].pending);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_create_echo_is_idempotent() {
        let now = Instant::now();
        let mut store = store();
        let echo = echo_create(8, "g-8", "Museum");

        assert!(store.apply_remote(&echo, now));
        for _ in 0..3 {
            assert!(!store.apply_remote(&echo, now));
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_peer_create_appends() {
        let now = Instant::now();
        let mut store = store();
        store.apply_remote(&echo_create(1, "g-1", "A"), now);
        store.apply_remote(&echo_create(2, "g-2", "B"), now);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_echo_with_place_id_fallback() {
        let now = Instant::now();
        let mut store = store();
        store.add(place("g-4", "Beach"), now);

        let body = r#"{"action":"CREATE","placeId":44,"googlePlaceId":"g-4","placeName":"Beach"}"#;
        let action: BookmarkAction = protocol::decode(body).unwrap();
        store.apply_remote(&action, now);

        assert_eq!(store.len(), 1);
        assert_eq!(store.items()[0].bookmark_id, Some(44));
    }

    #[test]
    fn test_toggle_removes_by_google_id_and_sends_delete() {
        let now = Instant::now();
        let mut store = store();
        store.apply_remote(&echo_create(12, "g-12", "Temple"), now);

        // a search result only knows the google id
        let searched = PlaceInfo {
            google_place_id: Some("g-12".to_string()),
            ..Default::default()
        };
        assert!(store.is_bookmarked(None, &searched));

        let Toggle::Removed(Some(BookmarkAction::Delete(target))) =
            store.toggle(None, &searched, now)
        else {
            panic!("expected delete");
        };
        assert_eq!(target.bookmark_id, Some(12));
        assert!(store.is_empty());

        // DELETE echo confirms
        store.apply_remote(&BookmarkAction::Delete(target), now);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_remove_without_id_is_local_only() {
        let now = Instant::now();
        let mut store = store();
        store.add(place("g-2", "Market"), now);

        let result = store.toggle(None, &place("g-2", "Market"), now);
        assert_eq!(result, Toggle::Removed(None));
        assert!(store.is_empty());
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_is_bookmarked_by_proximity_and_name() {
        let now = Instant::now();
        let mut store = store();
        store.apply_remote(
            &BookmarkAction::Create(BookmarkPayload {
                bookmark_id: Some(3),
                details: PlaceInfo {
                    place_name: Some("Jeju Folk Village".to_string()),
                    latitude: Some(33.3222),
                    longitude: Some(126.8424),
                    ..Default::default()
                },
                ..Default::default()
            }),
            now,
        );

        let nearby = PlaceInfo {
            latitude: Some(33.32225),
            longitude: Some(126.84245),
            ..Default::default()
        };
        assert!(store.is_bookmarked(None, &nearby));

        let by_name = PlaceInfo {
            place_name: Some("jeju folk village".to_string()),
            ..Default::default()
        };
        assert!(store.is_bookmarked(None, &by_name));
    }

    #[test]
    fn test_delete_echo_removes_peer_entry() {
        let now = Instant::now();
        let mut store = store();
        store.apply_remote(&echo_create(6, "g-6", "Park"), now);
        let delete: BookmarkAction =
            protocol::decode(r#"{"action":"DELETE","placeId":6}"#).unwrap();
        assert!(store.apply_remote(&delete, now));
        assert!(store.is_empty());
        assert!(!store.apply_remote(&delete, now));
    }

    #[test]
    fn test_sweep_resends_then_rolls_back_add() {
        let start = Instant::now();
        let policy = PendingPolicy {
            timeout: Duration::from_secs(10),
            max_retries: 1,
        };
        let mut store = store();
        let outbound = store.add(place("g-1", "Cafe"), start);

        let swept = store.sweep(start + Duration::from_secs(10), &policy);
        assert_eq!(swept.resend, vec![outbound.clone()]);
        assert!(swept.expired.is_empty());
        assert_eq!(store.len(), 1);

        let swept = store.sweep(start + Duration::from_secs(20), &policy);
        assert!(swept.resend.is_empty());
        assert_eq!(swept.expired, vec![outbound]);
        assert!(store.is_empty());
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_rejected_delete_restores_entry() {
        let now = Instant::now();
        let mut store = store();
        store.apply_remote(&echo_create(1, "g-1", "A"), now);
        store.apply_remote(&echo_create(2, "g-2", "B"), now);

        let outbound = store.remove_at(0, now).unwrap();
        assert_eq!(store.len(), 1);

        store.reject(&outbound);
        assert_eq!(store.len(), 2);
        assert_eq!(store.items()[0].bookmark_id, Some(1));
    }

    #[test]
    fn test_baseline_keeps_pending_and_inflight_deletes() {
        let now = Instant::now();
        let mut store = store();
        store.apply_remote(&echo_create(1, "g-1", "A"), now);
        store.remove_at(0, now);
        store.add(place("g-9", "Local"), now);

        store.load_baseline(
            5,
            vec![
                Bookmark::confirmed(Some(1), place("g-1", "A")),
                Bookmark::confirmed(Some(2), place("g-2", "B")),
            ],
        );

        let ids: Vec<Option<BookmarkId>> = store.items().iter().map(|b| b.bookmark_id).collect();
        assert_eq!(ids, vec![Some(2), None]);
        assert!(store.items()[1].pending);
    }

    #[test]
    fn test_plan_switch_clears() {
        let now = Instant::now();
        let mut store = store();
        store.add(place("g-1", "Cafe"), now);
        store.set_plan(Some(7));
        assert!(store.is_empty());
        assert_eq!(store.pending_count(), 0);
    }
}
