//! Day schedule store: ordered days, each with an ordered list of places.
//!
//! Positions in the public API are 0-based list indices; on the wire and in
//! `day_order`/`index_order` they are 1-based. After every committed change
//! each list is renumbered so its orders read 1..=N.
//!
//! `MOVE` is a drag preview. It is kept apart from the durable order and is
//! cleared by the committing `UPDATE_*` (or a delete).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::identity::normalize_name;
use super::pending::{PendingLedger, PendingPolicy, SweepOutcome, Swept};
use super::{insertion_index, renumber};
use crate::sync::protocol::{
    DayPlaceAction, DayPlaceId, DayPlaceMemo, DayPlaceMove, DayPlaceRef, DayPlaceReorder,
    DayPlaceTransfer, DayRef, DayRename, DayReorder, DayScheduleAction, DayScheduleId, NewDay,
    NewDayPlace, PlaceInfo,
};
use crate::sync::{PlanId, SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayPlace {
    /// Assigned by the server; `None` until the CREATE echo arrives
    pub day_place_id: Option<DayPlaceId>,
    #[serde(default)]
    pub place_id: Option<i64>,
    #[serde(flatten)]
    pub place: PlaceInfo,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub index_order: u32,
    #[serde(default)]
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Day {
    pub day_schedule_id: Option<DayScheduleId>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub day_order: u32,
    #[serde(default, rename = "daySchedule")]
    pub places: Vec<DayPlace>,
    #[serde(default)]
    pub pending: bool,
}

impl Day {
    pub fn new(day_schedule_id: Option<DayScheduleId>, title: impl Into<String>) -> Self {
        Self {
            day_schedule_id,
            title: title.into(),
            day_order: 0,
            places: Vec::new(),
            pending: false,
        }
    }

    pub fn place_ids(&self) -> Vec<Option<DayPlaceId>> {
        self.places.iter().map(|p| p.day_place_id).collect()
    }

    pub fn index_orders(&self) -> Vec<u32> {
        self.places.iter().map(|p| p.index_order).collect()
    }
}

/// Where a peer is currently dragging a place
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacePreview {
    pub day_schedule_id: DayScheduleId,
    pub index_order: Option<u32>,
}

/// Envelope produced by a local schedule edit
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutbound {
    Day(DayScheduleAction),
    Place(DayPlaceAction),
}

/// Ledger key: one in-flight operation per entity and concern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScheduleKey {
    NewDay(String),
    DayTitle(DayScheduleId),
    DayOrder(DayScheduleId),
    DayDelete(DayScheduleId),
    NewPlace(DayScheduleId, String),
    PlaceMemo(DayPlaceId),
    PlaceOrder(DayPlaceId),
    PlaceDelete(DayPlaceId),
}

#[derive(Debug, Clone)]
pub enum Undo {
    RemoveNewDay(String),
    Retitle(DayScheduleId, String),
    MoveDay(DayScheduleId, usize),
    RestoreDay(Day, usize),
    RemoveNewPlace(DayScheduleId, String),
    Rememo(DayPlaceId, Option<String>),
    MovePlace(DayPlaceId, DayScheduleId, usize),
    RestorePlace(DayScheduleId, DayPlace, usize),
}

#[derive(Debug, Clone)]
pub struct PendingEdit {
    pub outbound: ScheduleOutbound,
    pub undo: Undo,
}

fn place_token(place_id: Option<i64>, place: &PlaceInfo) -> String {
    if let Some(id) = place_id {
        return format!("p:{}", id);
    }
    match place.google_place_id.as_deref() {
        Some(g) if !g.is_empty() => format!("g:{}", g),
        _ => format!("n:{}", normalize_name(place.place_name.as_deref().unwrap_or(""))),
    }
}

fn unknown_day(id: DayScheduleId) -> SyncError {
    SyncError::UnknownEntity(format!("day schedule {}", id))
}

fn unknown_place(id: DayPlaceId) -> SyncError {
    SyncError::UnknownEntity(format!("day place {}", id))
}

fn position(order: u32) -> usize {
    order.saturating_sub(1) as usize
}

#[derive(Debug, Default)]
pub struct ScheduleStore {
    plan_id: Option<PlanId>,
    days: Vec<Day>,
    day_previews: HashMap<DayScheduleId, u32>,
    place_previews: HashMap<DayPlaceId, PlacePreview>,
    pending: PendingLedger<ScheduleKey, PendingEdit>,
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan_id(&self) -> Option<PlanId> {
        self.plan_id
    }

    pub fn days(&self) -> &[Day] {
        &self.days
    }

    pub fn day(&self, id: DayScheduleId) -> Option<&Day> {
        self.days.iter().find(|d| d.day_schedule_id == Some(id))
    }

    /// Order a peer is dragging this day to
    pub fn day_preview(&self, id: DayScheduleId) -> Option<u32> {
        self.day_previews.get(&id).copied()
    }

    pub fn place_preview(&self, id: DayPlaceId) -> Option<PlacePreview> {
        self.place_previews.get(&id).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn set_plan(&mut self, plan_id: Option<PlanId>) {
        if self.plan_id != plan_id {
            self.plan_id = plan_id;
            self.days.clear();
            self.day_previews.clear();
            self.place_previews.clear();
            self.pending.clear();
        }
    }

    // ------------------------------------------------------------------------
    // Local edits
    // ------------------------------------------------------------------------

    /// Append a pending day
    pub fn create_day(&mut self, title: impl Into<String>, now: Instant) -> DayScheduleAction {
        let title = title.into();
        let mut day = Day::new(None, title.clone());
        day.pending = true;
        self.days.push(day);
        self.renumber_days();

        let outbound = DayScheduleAction::Create(NewDay {
            day_schedule_id: None,
            title: title.clone(),
            day_order: Some(self.days.len() as u32),
        });
        self.track(
            ScheduleKey::NewDay(title.clone()),
            ScheduleOutbound::Day(outbound.clone()),
            Undo::RemoveNewDay(title),
            now,
        );
        outbound
    }

    pub fn rename_day(
        &mut self,
        id: DayScheduleId,
        title: impl Into<String>,
        now: Instant,
    ) -> SyncResult<DayScheduleAction> {
        let title = title.into();
        let idx = self.day_index(id).ok_or_else(|| unknown_day(id))?;
        let old = std::mem::replace(&mut self.days[idx].title, title.clone());

        let outbound = DayScheduleAction::Rename(DayRename {
            day_schedule_id: id,
            title,
        });
        self.track(
            ScheduleKey::DayTitle(id),
            ScheduleOutbound::Day(outbound.clone()),
            Undo::Retitle(id, old),
            now,
        );
        Ok(outbound)
    }

    /// Drag preview for a day; nothing changes locally
    pub fn preview_day_move(&self, id: DayScheduleId, to: usize) -> SyncResult<DayScheduleAction> {
        let from = self.day_index(id).ok_or_else(|| unknown_day(id))?;
        let to = to.min(self.days.len().saturating_sub(1));
        Ok(DayScheduleAction::Move(DayReorder {
            day_schedule_id: id,
            day_order: from as u32 + 1,
            modified_day_order: to as u32 + 1,
        }))
    }

    /// Committed day reorder
    pub fn move_day(
        &mut self,
        id: DayScheduleId,
        to: usize,
        now: Instant,
    ) -> SyncResult<DayScheduleAction> {
        let (from, to) = self.reorder_day(id, to).ok_or_else(|| unknown_day(id))?;
        self.day_previews.remove(&id);

        let outbound = DayScheduleAction::UpdateSchedule(DayReorder {
            day_schedule_id: id,
            day_order: from as u32 + 1,
            modified_day_order: to as u32 + 1,
        });
        self.track(
            ScheduleKey::DayOrder(id),
            ScheduleOutbound::Day(outbound.clone()),
            Undo::MoveDay(id, from),
            now,
        );
        Ok(outbound)
    }

    pub fn delete_day(&mut self, id: DayScheduleId, now: Instant) -> SyncResult<DayScheduleAction> {
        let idx = self.day_index(id).ok_or_else(|| unknown_day(id))?;
        let day = self.days.remove(idx);
        self.renumber_days();
        self.forget_previews(&day);

        let outbound = DayScheduleAction::Delete(DayRef { day_schedule_id: id });
        self.track(
            ScheduleKey::DayDelete(id),
            ScheduleOutbound::Day(outbound.clone()),
            Undo::RestoreDay(day, idx),
            now,
        );
        Ok(outbound)
    }

    /// Insert a pending place into a day at `at` (end when `None`)
    pub fn add_place(
        &mut self,
        day_id: DayScheduleId,
        place_id: Option<i64>,
        place: PlaceInfo,
        at: Option<usize>,
        now: Instant,
    ) -> SyncResult<DayPlaceAction> {
        let day_idx = self.day_index(day_id).ok_or_else(|| unknown_day(day_id))?;
        let token = place_token(place_id, &place);
        let day = &mut self.days[day_idx];
        let at = at.unwrap_or(day.places.len()).min(day.places.len());

        day.places.insert(
            at,
            DayPlace {
                day_place_id: None,
                place_id,
                place: place.clone(),
                memo: None,
                index_order: 0,
                pending: true,
            },
        );
        renumber(&mut day.places, |p, n| p.index_order = n);

        let outbound = DayPlaceAction::Create(NewDayPlace {
            day_schedule_id: day_id,
            day_place_id: None,
            place_id,
            index_order: Some(at as u32 + 1),
            memo: None,
            place,
        });
        self.track(
            ScheduleKey::NewPlace(day_id, token.clone()),
            ScheduleOutbound::Place(outbound.clone()),
            Undo::RemoveNewPlace(day_id, token),
            now,
        );
        Ok(outbound)
    }

    pub fn set_memo(
        &mut self,
        day_id: DayScheduleId,
        id: DayPlaceId,
        memo: Option<String>,
        now: Instant,
    ) -> SyncResult<DayPlaceAction> {
        let (d, p) = self.locate_place(id).ok_or_else(|| unknown_place(id))?;
        let old = std::mem::replace(&mut self.days[d].places[p].memo, memo.clone());

        let outbound = DayPlaceAction::Rename(DayPlaceMemo {
            day_schedule_id: day_id,
            day_place_id: id,
            memo,
        });
        self.track(
            ScheduleKey::PlaceMemo(id),
            ScheduleOutbound::Place(outbound.clone()),
            Undo::Rememo(id, old),
            now,
        );
        Ok(outbound)
    }

    /// Drag preview for a place, possibly over another day
    pub fn preview_place_move(
        &self,
        id: DayPlaceId,
        to_day: DayScheduleId,
        to: usize,
    ) -> SyncResult<DayPlaceAction> {
        let (d, p) = self.locate_place(id).ok_or_else(|| unknown_place(id))?;
        let from_day = self.days[d].day_schedule_id.ok_or_else(|| unknown_place(id))?;
        Ok(DayPlaceAction::Move(DayPlaceMove {
            day_schedule_id: from_day,
            day_place_id: id,
            index_order: Some(p as u32 + 1),
            modified_day_schedule_id: Some(to_day),
            modified_index_order: Some(to as u32 + 1),
        }))
    }

    /// Committed reorder within the place's day
    pub fn move_place(
        &mut self,
        id: DayPlaceId,
        to: usize,
        now: Instant,
    ) -> SyncResult<DayPlaceAction> {
        let (d, _) = self.locate_place(id).ok_or_else(|| unknown_place(id))?;
        let day_id = self.days[d].day_schedule_id.ok_or_else(|| unknown_place(id))?;
        let moved = self
            .relocate_place(id, day_id, to)
            .ok_or_else(|| unknown_place(id))?;
        self.place_previews.remove(&id);

        let outbound = DayPlaceAction::UpdateInner(DayPlaceReorder {
            day_schedule_id: day_id,
            day_place_id: id,
            index_order: moved.from_index as u32 + 1,
            modified_index_order: moved.to_index as u32 + 1,
        });
        self.track(
            ScheduleKey::PlaceOrder(id),
            ScheduleOutbound::Place(outbound.clone()),
            Undo::MovePlace(id, day_id, moved.from_index),
            now,
        );
        Ok(outbound)
    }

    /// Committed move into another day; same-day targets become a reorder
    pub fn transfer_place(
        &mut self,
        id: DayPlaceId,
        to_day: DayScheduleId,
        to: usize,
        now: Instant,
    ) -> SyncResult<DayPlaceAction> {
        self.day_index(to_day).ok_or_else(|| unknown_day(to_day))?;
        let (d, _) = self.locate_place(id).ok_or_else(|| unknown_place(id))?;
        let from_day = self.days[d].day_schedule_id.ok_or_else(|| unknown_place(id))?;
        if from_day == to_day {
            return self.move_place(id, to, now);
        }

        let moved = self
            .relocate_place(id, to_day, to)
            .ok_or_else(|| unknown_place(id))?;
        self.place_previews.remove(&id);

        let outbound = DayPlaceAction::UpdateOuter(DayPlaceTransfer {
            day_schedule_id: from_day,
            day_place_id: id,
            modified_day_schedule_id: to_day,
            index_order: moved.from_index as u32 + 1,
            modified_index_order: moved.to_index as u32 + 1,
        });
        self.track(
            ScheduleKey::PlaceOrder(id),
            ScheduleOutbound::Place(outbound.clone()),
            Undo::MovePlace(id, from_day, moved.from_index),
            now,
        );
        Ok(outbound)
    }

    pub fn delete_place(&mut self, id: DayPlaceId, now: Instant) -> SyncResult<DayPlaceAction> {
        let (d, p) = self.locate_place(id).ok_or_else(|| unknown_place(id))?;
        let day_id = self.days[d].day_schedule_id.ok_or_else(|| unknown_place(id))?;
        let removed = self.days[d].places.remove(p);
        renumber(&mut self.days[d].places, |p, n| p.index_order = n);
        self.place_previews.remove(&id);

        let outbound = DayPlaceAction::Delete(DayPlaceRef {
            day_schedule_id: day_id,
            day_place_id: id,
        });
        self.track(
            ScheduleKey::PlaceDelete(id),
            ScheduleOutbound::Place(outbound.clone()),
            Undo::RestorePlace(day_id, removed, p),
            now,
        );
        Ok(outbound)
    }

    // ------------------------------------------------------------------------
    // Remote echoes
    // ------------------------------------------------------------------------

    /// Apply a day schedule echo. Returns whether anything visible changed.
    pub fn apply_day(&mut self, action: &DayScheduleAction, now: Instant) -> bool {
        match action {
            DayScheduleAction::Create(new) => self.remote_create_day(new, now),
            DayScheduleAction::Rename(r) => {
                self.resolve(&ScheduleKey::DayTitle(r.day_schedule_id), now);
                match self.day_index(r.day_schedule_id) {
                    Some(idx) if self.days[idx].title != r.title => {
                        self.days[idx].title = r.title.clone();
                        true
                    }
                    Some(_) => false,
                    None => {
                        warn!("RENAME for unknown day {}", r.day_schedule_id);
                        false
                    }
                }
            }
            DayScheduleAction::Move(r) => {
                self.day_previews
                    .insert(r.day_schedule_id, r.modified_day_order)
                    != Some(r.modified_day_order)
            }
            DayScheduleAction::UpdateSchedule(r) => {
                self.resolve(&ScheduleKey::DayOrder(r.day_schedule_id), now);
                let preview = self.day_previews.remove(&r.day_schedule_id).is_some();
                match self.reorder_day(r.day_schedule_id, position(r.modified_day_order)) {
                    Some((from, to)) => from != to || preview,
                    None => {
                        warn!("UPDATE_SCHEDULE for unknown day {}", r.day_schedule_id);
                        preview
                    }
                }
            }
            DayScheduleAction::Delete(r) => {
                self.resolve(&ScheduleKey::DayDelete(r.day_schedule_id), now);
                self.day_previews.remove(&r.day_schedule_id);
                match self.day_index(r.day_schedule_id) {
                    Some(idx) => {
                        let day = self.days.remove(idx);
                        self.forget_previews(&day);
                        self.renumber_days();
                        true
                    }
                    None => false,
                }
            }
        }
    }

    fn remote_create_day(&mut self, new: &NewDay, now: Instant) -> bool {
        let Some(id) = new.day_schedule_id else {
            warn!("day CREATE echo without dayScheduleId ignored");
            return false;
        };
        if let Some(rtt) = self.pending.resolve(&ScheduleKey::NewDay(new.title.clone()), now) {
            info!("day '{}' confirmed after {}ms", new.title, rtt.as_millis());
        }

        let existing = self.day_index(id).or_else(|| {
            self.days
                .iter()
                .position(|d| d.pending && d.day_schedule_id.is_none() && d.title == new.title)
        });

        let idx = match existing {
            Some(idx) => {
                let day = &mut self.days[idx];
                let before = (day.day_schedule_id, day.title.clone(), day.pending);
                day.day_schedule_id = Some(id);
                day.title = new.title.clone();
                day.pending = false;
                if before == (Some(id), new.title.clone(), false)
                    && new.day_order.map_or(true, |o| position(o) == idx)
                {
                    return false;
                }
                idx
            }
            None => {
                let idx = insertion_index(new.day_order, self.days.len());
                self.days.insert(idx, Day::new(Some(id), new.title.clone()));
                idx
            }
        };

        if let Some(order) = new.day_order {
            let day = self.days.remove(idx);
            let to = position(order).min(self.days.len());
            self.days.insert(to, day);
        }
        self.renumber_days();
        true
    }

    /// Apply a day place echo. Returns whether anything visible changed.
    pub fn apply_place(&mut self, action: &DayPlaceAction, now: Instant) -> bool {
        match action {
            DayPlaceAction::Create(new) => self.remote_create_place(new, now),
            DayPlaceAction::Rename(m) => {
                self.resolve(&ScheduleKey::PlaceMemo(m.day_place_id), now);
                match self.locate_place(m.day_place_id) {
                    Some((d, p)) if self.days[d].places[p].memo != m.memo => {
                        self.days[d].places[p].memo = m.memo.clone();
                        true
                    }
                    Some(_) => false,
                    None => {
                        warn!("RENAME for unknown day place {}", m.day_place_id);
                        false
                    }
                }
            }
            DayPlaceAction::Move(m) => {
                let preview = PlacePreview {
                    day_schedule_id: m.modified_day_schedule_id.unwrap_or(m.day_schedule_id),
                    index_order: m.modified_index_order,
                };
                self.place_previews.insert(m.day_place_id, preview) != Some(preview)
            }
            DayPlaceAction::UpdateInner(r) => self.remote_relocate(
                r.day_place_id,
                r.day_schedule_id,
                r.modified_index_order,
                now,
            ),
            DayPlaceAction::UpdateOuter(t) => self.remote_relocate(
                t.day_place_id,
                t.modified_day_schedule_id,
                t.modified_index_order,
                now,
            ),
            DayPlaceAction::Delete(r) => {
                self.resolve(&ScheduleKey::PlaceDelete(r.day_place_id), now);
                self.place_previews.remove(&r.day_place_id);
                match self.locate_place(r.day_place_id) {
                    Some((d, p)) => {
                        self.days[d].places.remove(p);
                        renumber(&mut self.days[d].places, |p, n| p.index_order = n);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    fn remote_create_place(&mut self, new: &NewDayPlace, now: Instant) -> bool {
        let Some(day_idx) = self.day_index(new.day_schedule_id) else {
            warn!("day place CREATE for unknown day {}", new.day_schedule_id);
            return false;
        };
        let Some(id) = new.day_place_id else {
            warn!("day place CREATE echo without dayPlaceId ignored");
            return false;
        };
        let token = place_token(new.place_id, &new.place);
        if let Some(rtt) = self
            .pending
            .resolve(&ScheduleKey::NewPlace(new.day_schedule_id, token.clone()), now)
        {
            info!("day place {} confirmed after {}ms", id, rtt.as_millis());
        }

        if self.locate_place(id).is_some() {
            if let Some(order) = new.index_order {
                self.relocate_place(id, new.day_schedule_id, position(order));
            }
            return false;
        }

        let day = &mut self.days[day_idx];
        let local = day.places.iter().position(|p| {
            p.pending && p.day_place_id.is_none() && place_token(p.place_id, &p.place) == token
        });

        match local {
            Some(p) => {
                let entry = &mut day.places[p];
                entry.day_place_id = Some(id);
                entry.pending = false;
                if !new.place.is_empty() {
                    entry.place = new.place.clone();
                }
                if new.memo.is_some() {
                    entry.memo = new.memo.clone();
                }
            }
            None => {
                let at = insertion_index(new.index_order, day.places.len());
                day.places.insert(
                    at,
                    DayPlace {
                        day_place_id: Some(id),
                        place_id: new.place_id,
                        place: new.place.clone(),
                        memo: new.memo.clone(),
                        index_order: 0,
                        pending: false,
                    },
                );
            }
        }
        renumber(&mut day.places, |p, n| p.index_order = n);
        true
    }

    fn remote_relocate(
        &mut self,
        id: DayPlaceId,
        to_day: DayScheduleId,
        order: u32,
        now: Instant,
    ) -> bool {
        self.resolve(&ScheduleKey::PlaceOrder(id), now);
        let preview = self.place_previews.remove(&id).is_some();
        match self.relocate_place(id, to_day, position(order)) {
            Some(moved) => moved.changed() || preview,
            None => {
                warn!("reorder for unknown day place {} (day {})", id, to_day);
                preview
            }
        }
    }

    // ------------------------------------------------------------------------
    // Baseline, sweep, rollback
    // ------------------------------------------------------------------------

    /// Replace the schedule with a REST baseline, keeping in-flight local edits
    pub fn load_baseline(&mut self, plan_id: PlanId, mut baseline: Vec<Day>) {
        self.set_plan(Some(plan_id));

        let mut deleted_days = HashSet::new();
        let mut deleted_places = HashSet::new();
        for (key, _) in self.pending.iter() {
            match key {
                ScheduleKey::DayDelete(id) => {
                    deleted_days.insert(*id);
                }
                ScheduleKey::PlaceDelete(id) => {
                    deleted_places.insert(*id);
                }
                _ => {}
            }
        }

        baseline.retain(|d| d.day_schedule_id.map_or(true, |id| !deleted_days.contains(&id)));
        baseline.sort_by_key(|d| d.day_order);
        for day in baseline.iter_mut() {
            day.pending = false;
            day.places
                .retain(|p| p.day_place_id.map_or(true, |id| !deleted_places.contains(&id)));
            day.places.sort_by_key(|p| p.index_order);
        }

        // unconfirmed local entries survive the reload
        for local in &self.days {
            if local.pending && local.day_schedule_id.is_none() {
                baseline.push(local.clone());
                continue;
            }
            let Some(target) = baseline
                .iter_mut()
                .find(|d| d.day_schedule_id.is_some() && d.day_schedule_id == local.day_schedule_id)
            else {
                continue;
            };
            if let Some(id) = local.day_schedule_id {
                if self.pending.is_pending(&ScheduleKey::DayTitle(id)) {
                    target.title = local.title.clone();
                }
            }
            for place in &local.places {
                match place.day_place_id {
                    None if place.pending => target.places.push(place.clone()),
                    Some(id) if self.pending.is_pending(&ScheduleKey::PlaceMemo(id)) => {
                        if let Some(remote) =
                            target.places.iter_mut().find(|p| p.day_place_id == Some(id))
                        {
                            remote.memo = place.memo.clone();
                        }
                    }
                    _ => {}
                }
            }
        }

        for day in baseline.iter_mut() {
            renumber(&mut day.places, |p, n| p.index_order = n);
        }
        self.days = baseline;
        self.renumber_days();
        self.day_previews.clear();
        self.place_previews.clear();
        debug!("schedule baseline: {} days", self.days.len());
    }

    /// Resend overdue edits; roll back those out of retries
    pub fn sweep(&mut self, now: Instant, policy: &PendingPolicy) -> Swept<ScheduleOutbound> {
        let mut swept = Swept::default();
        for outcome in self.pending.sweep(now, policy) {
            match outcome {
                SweepOutcome::Resend { key, op } => {
                    debug!("resending {:?}", key);
                    swept.resend.push(op.outbound);
                }
                SweepOutcome::Expired { key, op } => {
                    warn!("{:?} never confirmed, rolling back", key);
                    self.undo(op.undo);
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
    pub fn reject(&mut self, outbound: &ScheduleOutbound) {
        let Some(key) = key_of(outbound) else {
            return;
        };
        if let Some(op) = self.pending.cancel(&key) {
            warn!("{:?} not sent, rolling back", key);
            self.undo(op.undo);
        }
    }

    fn undo(&mut self, undo: Undo) {
        match undo {
            Undo::RemoveNewDay(title) => {
                self.days
                    .retain(|d| !(d.pending && d.day_schedule_id.is_none() && d.title == title));
                self.renumber_days();
            }
            Undo::Retitle(id, title) => {
                if let Some(idx) = self.day_index(id) {
                    self.days[idx].title = title;
                }
            }
            Undo::MoveDay(id, to) => {
                self.reorder_day(id, to);
            }
            Undo::RestoreDay(day, idx) => {
                let idx = idx.min(self.days.len());
                self.days.insert(idx, day);
                self.renumber_days();
            }
            Undo::RemoveNewPlace(day_id, token) => {
                if let Some(idx) = self.day_index(day_id) {
                    let day = &mut self.days[idx];
                    day.places.retain(|p| {
                        !(p.pending
                            && p.day_place_id.is_none()
                            && place_token(p.place_id, &p.place) == token)
                    });
                    renumber(&mut day.places, |p, n| p.index_order = n);
                }
            }
            Undo::Rememo(id, memo) => {
                if let Some((d, p)) = self.locate_place(id) {
                    self.days[d].places[p].memo = memo;
                }
            }
            Undo::MovePlace(id, day_id, to) => {
                self.relocate_place(id, day_id, to);
            }
            Undo::RestorePlace(day_id, place, idx) => {
                if let Some(d) = self.day_index(day_id) {
                    let day = &mut self.days[d];
                    let idx = idx.min(day.places.len());
                    day.places.insert(idx, place);
                    renumber(&mut day.places, |p, n| p.index_order = n);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// A superseding edit keeps the undo of the first one, which holds the
    /// last confirmed state.
    fn track(&mut self, key: ScheduleKey, outbound: ScheduleOutbound, undo: Undo, now: Instant) {
        let undo = match self.pending.get(&key) {
            Some(earlier) => earlier.op.undo.clone(),
            None => undo,
        };
        self.pending.track(key, PendingEdit { outbound, undo }, now);
    }

    fn resolve(&mut self, key: &ScheduleKey, now: Instant) {
        self.pending.resolve(key, now);
    }

    fn day_index(&self, id: DayScheduleId) -> Option<usize> {
        self.days.iter().position(|d| d.day_schedule_id == Some(id))
    }

    fn locate_place(&self, id: DayPlaceId) -> Option<(usize, usize)> {
        self.days.iter().enumerate().find_map(|(d, day)| {
            day.places
                .iter()
                .position(|p| p.day_place_id == Some(id))
                .map(|p| (d, p))
        })
    }

    fn renumber_days(&mut self) {
        renumber(&mut self.days, |d, n| d.day_order = n);
    }

    fn forget_previews(&mut self, day: &Day) {
        for id in day.places.iter().filter_map(|p| p.day_place_id) {
            self.place_previews.remove(&id);
        }
    }

    /// Move a day to index `to` (clamped). Returns (from, to).
    fn reorder_day(&mut self, id: DayScheduleId, to: usize) -> Option<(usize, usize)> {
        let from = self.day_index(id)?;
        let day = self.days.remove(from);
        let to = to.min(self.days.len());
        self.days.insert(to, day);
        self.renumber_days();
        Some((from, to))
    }

    /// Move a place to index `to` (clamped) of `to_day`, renumbering both days
    fn relocate_place(
        &mut self,
        id: DayPlaceId,
        to_day: DayScheduleId,
        to: usize,
    ) -> Option<Relocation> {
        let target = self.day_index(to_day)?;
        let (d, p) = self.locate_place(id)?;
        let from_day = self.days[d].day_schedule_id;

        let place = self.days[d].places.remove(p);
        renumber(&mut self.days[d].places, |p, n| p.index_order = n);

        let places = &mut self.days[target].places;
        let to = to.min(places.len());
        places.insert(to, place);
        renumber(places, |p, n| p.index_order = n);

        Some(Relocation {
            same_day: from_day == Some(to_day),
            from_index: p,
            to_index: to,
        })
    }
}

struct Relocation {
    same_day: bool,
    from_index: usize,
    to_index: usize,
}

impl Relocation {
    fn changed(&self) -> bool {
        !self.same_day || self.from_index != self.to_index
    }
}

fn key_of(outbound: &ScheduleOutbound) -> Option<ScheduleKey> {
    Some(match outbound {
        ScheduleOutbound::Day(action) => match action {
            DayScheduleAction::Create(n) => ScheduleKey::NewDay(n.title.clone()),
            DayScheduleAction::Rename(r) => ScheduleKey::DayTitle(r.day_schedule_id),
            DayScheduleAction::UpdateSchedule(r) => ScheduleKey::DayOrder(r.day_schedule_id),
            DayScheduleAction::Delete(r) => ScheduleKey::DayDelete(r.day_schedule_id),
            DayScheduleAction::Move(_) => return None,
        },
        ScheduleOutbound::Place(action) => match action {
            DayPlaceAction::Create(n) => {
                ScheduleKey::NewPlace(n.day_schedule_id, place_token(n.place_id, &n.place))
            }
            DayPlaceAction::Rename(m) => ScheduleKey::PlaceMemo(m.day_place_id),
            DayPlaceAction::UpdateInner(r) => ScheduleKey::PlaceOrder(r.day_place_id),
            DayPlaceAction::UpdateOuter(t) => ScheduleKey::PlaceOrder(t.day_place_id),
            DayPlaceAction::Delete(r) => ScheduleKey::PlaceDelete(r.day_place_id),
            DayPlaceAction::Move(_) => return None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::protocol;
    use std::time::Duration;

    fn named(name: &str) -> PlaceInfo {
        PlaceInfo {
            place_name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn confirmed_place(id: DayPlaceId, name: &str) -> DayPlace {
        DayPlace {
            day_place_id: Some(id),
            place_id: Some(id * 10),
            place: named(name),
            memo: None,
            index_order: 0,
            pending: false,
        }
    }

    /// Day A (1) = [P1, P2, P3], Day B (2) = [Q1]
    fn two_days() -> ScheduleStore {
        let mut a = Day::new(Some(1), "Day A");
        a.day_order = 1;
        a.places = vec![
            confirmed_place(11, "P1"),
            confirmed_place(12, "P2"),
            confirmed_place(13, "P3"),
        ];
        let mut b = Day::new(Some(2), "Day B");
        b.day_order = 2;
        b.places = vec![confirmed_place(21, "Q1")];

        let mut store = ScheduleStore::new();
        store.load_baseline(9, vec![a, b]);
        store
    }

    fn assert_contiguous(store: &ScheduleStore) {
        for (i, day) in store.days().iter().enumerate() {
            assert_eq!(day.day_order, i as u32 + 1);
            let expected: Vec<u32> = (1..=day.places.len() as u32).collect();
            assert_eq!(day.index_orders(), expected);
        }
    }

    #[test]
    fn test_cross_day_move() {
        let now = Instant::now();
        let mut store = two_days();

        let outbound = store.transfer_place(12, 2, 0, now).unwrap();
        assert_eq!(
            outbound,
            DayPlaceAction::UpdateOuter(DayPlaceTransfer {
                day_schedule_id: 1,
                day_place_id: 12,
                modified_day_schedule_id: 2,
                index_order: 2,
                modified_index_order: 1,
            })
        );

        let a = store.day(1).unwrap();
        assert_eq!(a.place_ids(), vec![Some(11), Some(13)]);
        assert_eq!(a.index_orders(), vec![1, 2]);
        let b = store.day(2).unwrap();
        assert_eq!(b.place_ids(), vec![Some(12), Some(21)]);
        assert_eq!(b.index_orders(), vec![1, 2]);

        // our own echo converges without further change
        assert!(!store.apply_place(&outbound, now));
        assert_eq!(store.pending_count(), 0);
        assert_contiguous(&store);
    }

    #[test]
    fn test_remote_update_outer_from_peer() {
        let now = Instant::now();
        let mut store = two_days();
        let body = r#"{"action":"UPDATE_OUTER","dayScheduleId":1,"dayPlaceId":11,"modifiedDayScheduleId":2,"indexOrder":1,"modifiedIndexOrder":2}"#;
        let action: DayPlaceAction = protocol::decode(body).unwrap();

        assert!(store.apply_place(&action, now));
        assert_eq!(store.day(1).unwrap().place_ids(), vec![Some(12), Some(13)]);
        assert_eq!(store.day(2).unwrap().place_ids(), vec![Some(21), Some(11)]);
        assert_contiguous(&store);
    }

    #[test]
    fn test_update_inner_renumbers() {
        let now = Instant::now();
        let mut store = two_days();
        let action = DayPlaceAction::UpdateInner(DayPlaceReorder {
            day_schedule_id: 1,
            day_place_id: 11,
            index_order: 1,
            modified_index_order: 3,
        });
        assert!(store.apply_place(&action, now));
        assert_eq!(
            store.day(1).unwrap().place_ids(),
            vec![Some(12), Some(13), Some(11)]
        );
        assert_contiguous(&store);

        // replay is a no-op
        assert!(!store.apply_place(&action, now));

        // out-of-range target clamps to the end
        let far = DayPlaceAction::UpdateInner(DayPlaceReorder {
            day_schedule_id: 1,
            day_place_id: 12,
            index_order: 1,
            modified_index_order: 40,
        });
        store.apply_place(&far, now);
        assert_eq!(
            store.day(1).unwrap().place_ids(),
            vec![Some(13), Some(11), Some(12)]
        );
        assert_contiguous(&store);
    }

    #[test]
    fn test_move_is_transient() {
        let now = Instant::now();
        let mut store = two_days();
        let preview = DayPlaceAction::Move(DayPlaceMove {
            day_schedule_id: 1,
            day_place_id: 11,
            index_order: Some(1),
            modified_day_schedule_id: Some(2),
            modified_index_order: Some(1),
        });

        assert!(store.apply_place(&preview, now));
        assert_eq!(
            store.day(1).unwrap().place_ids(),
            vec![Some(11), Some(12), Some(13)]
        );
        assert_eq!(
            store.place_preview(11),
            Some(PlacePreview {
                day_schedule_id: 2,
                index_order: Some(1)
            })
        );

        let commit = DayPlaceAction::UpdateOuter(DayPlaceTransfer {
            day_schedule_id: 1,
            day_place_id: 11,
            modified_day_schedule_id: 2,
            index_order: 1,
            modified_index_order: 1,
        });
        store.apply_place(&commit, now);
        assert_eq!(store.place_preview(11), None);
        assert_eq!(store.day(2).unwrap().place_ids(), vec![Some(11), Some(21)]);
    }

    #[test]
    fn test_day_move_preview_and_commit() {
        let now = Instant::now();
        let mut store = two_days();

        let preview = store.preview_day_move(2, 0).unwrap();
        assert!(store.apply_day(&preview, now));
        assert_eq!(store.day_preview(2), Some(1));
        assert_eq!(store.days()[0].day_schedule_id, Some(1));

        let commit = store.move_day(2, 0, now).unwrap();
        assert_eq!(
            commit,
            DayScheduleAction::UpdateSchedule(DayReorder {
                day_schedule_id: 2,
                day_order: 2,
                modified_day_order: 1,
            })
        );
        assert_eq!(store.days()[0].day_schedule_id, Some(2));
        assert_eq!(store.day_preview(2), None);
        assert!(!store.apply_day(&commit, now));
        assert_contiguous(&store);
    }

    #[test]
    fn test_create_day_echo_assigns_id() {
        let now = Instant::now();
        let mut store = two_days();
        let outbound = store.create_day("Day C", now);
        assert_eq!(
            outbound,
            DayScheduleAction::Create(NewDay {
                day_schedule_id: None,
                title: "Day C".to_string(),
                day_order: Some(3),
            })
        );
        assert!(store.days()[2].pending);

        let echo: DayScheduleAction =
            protocol::decode(r#"{"action":"CREATE","dayScheduleId":3,"title":"Day C","dayOrder":3}"#)
                .unwrap();
        assert!(store.apply_day(&echo, now));
        assert_eq!(store.days().len(), 3);
        assert_eq!(store.days()[2].day_schedule_id, Some(3));
        assert!(!store.days()[2].pending);
        assert_eq!(store.pending_count(), 0);

        assert!(!store.apply_day(&echo, now));
        assert_eq!(store.days().len(), 3);
    }

    #[test]
    fn test_add_place_echo_replaces_pending() {
        let now = Instant::now();
        let mut store = two_days();
        let outbound = store.add_place(2, Some(500), named("Cafe"), Some(0), now).unwrap();
        assert_eq!(store.day(2).unwrap().place_ids(), vec![None, Some(21)]);
        assert_contiguous(&store);

        let DayPlaceAction::Create(mut echo) = outbound else {
            panic!("expected CREATE");
        };
        echo.day_place_id = Some(22);
        let echo = DayPlaceAction::Create(echo);

        assert!(store.apply_place(&echo, now));
        assert_eq!(store.day(2).unwrap().place_ids(), vec![Some(22), Some(21)]);
        assert!(!store.apply_place(&echo, now));
        assert_eq!(store.day(2).unwrap().places.len(), 2);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_peer_place_create_inserts_at_index() {
        let now = Instant::now();
        let mut store = two_days();
        let echo: DayPlaceAction = protocol::decode(
            r#"{"action":"CREATE","dayScheduleId":1,"dayPlaceId":14,"placeId":140,"indexOrder":2,"placeName":"P4"}"#,
        )
        .unwrap();
        assert!(store.apply_place(&echo, now));
        assert_eq!(
            store.day(1).unwrap().place_ids(),
            vec![Some(11), Some(14), Some(12), Some(13)]
        );
        assert_contiguous(&store);
    }

    #[test]
    fn test_memo_rename_and_delete() {
        let now = Instant::now();
        let mut store = two_days();
        store.set_memo(1, 13, Some("sunset".to_string()), now).unwrap();
        assert_eq!(store.day(1).unwrap().places[2].memo.as_deref(), Some("sunset"));

        let delete = store.delete_place(12, now).unwrap();
        assert_eq!(store.day(1).unwrap().place_ids(), vec![Some(11), Some(13)]);
        assert!(!store.apply_place(&delete, now));
        assert_contiguous(&store);
    }

    #[test]
    fn test_unknown_entities_are_errors() {
        let now = Instant::now();
        let mut store = two_days();
        assert!(matches!(
            store.rename_day(99, "x", now),
            Err(SyncError::UnknownEntity(_))
        ));
        assert!(matches!(
            store.transfer_place(11, 99, 0, now),
            Err(SyncError::UnknownEntity(_))
        ));
        assert!(matches!(
            store.move_place(404, 0, now),
            Err(SyncError::UnknownEntity(_))
        ));
    }

    #[test]
    fn test_repeated_move_rolls_back_to_confirmed_order() {
        let start = Instant::now();
        let policy = PendingPolicy {
            timeout: Duration::from_secs(10),
            max_retries: 0,
        };
        let mut store = two_days();
        store.move_place(11, 2, start).unwrap();
        store.move_place(11, 1, start + Duration::from_secs(1)).unwrap();
        assert_eq!(
            store.day(1).unwrap().place_ids(),
            vec![Some(12), Some(11), Some(13)]
        );
        assert_eq!(store.pending_count(), 1);

        let swept = store.sweep(start + Duration::from_secs(11), &policy);
        assert_eq!(swept.expired.len(), 1);
        assert_eq!(
            store.day(1).unwrap().place_ids(),
            vec![Some(11), Some(12), Some(13)]
        );
        assert_contiguous(&store);
    }

    #[test]
    fn test_expired_transfer_rolls_back() {
        let start = Instant::now();
        let policy = PendingPolicy {
            timeout: Duration::from_secs(10),
            max_retries: 0,
        };
        let mut store = two_days();
        store.transfer_place(12, 2, 0, start).unwrap();

        let swept = store.sweep(start + Duration::from_secs(10), &policy);
        assert!(swept.resend.is_empty());
        assert_eq!(swept.expired.len(), 1);
        assert_eq!(
            store.day(1).unwrap().place_ids(),
            vec![Some(11), Some(12), Some(13)]
        );
        assert_eq!(store.day(2).unwrap().place_ids(), vec![Some(21)]);
        assert_contiguous(&store);
    }

    #[test]
    fn test_rejected_day_delete_restores() {
        let now = Instant::now();
        let mut store = two_days();
        let outbound = store.delete_day(1, now).unwrap();
        assert_eq!(store.days().len(), 1);

        store.reject(&ScheduleOutbound::Day(outbound));
        assert_eq!(store.days().len(), 2);
        assert_eq!(store.days()[0].day_schedule_id, Some(1));
        assert_eq!(store.day(1).unwrap().places.len(), 3);
        assert_contiguous(&store);
    }

    #[test]
    fn test_baseline_sorts_and_keeps_pending() {
        let now = Instant::now();
        let mut store = two_days();
        store.add_place(1, Some(700), named("New"), None, now).unwrap();
        store.delete_place(21, now).unwrap();

        let mut later = Day::new(Some(2), "Day B");
        later.day_order = 2;
        later.places = vec![confirmed_place(21, "Q1")];
        let mut first = Day::new(Some(1), "Day A");
        first.day_order = 1;
        let mut p2 = confirmed_place(12, "P2");
        p2.index_order = 2;
        let mut p1 = confirmed_place(11, "P1");
        p1.index_order = 1;
        first.places = vec![p2, p1];

        store.load_baseline(9, vec![later, first]);

        assert_eq!(store.days()[0].day_schedule_id, Some(1));
        assert_eq!(
            store.day(1).unwrap().place_ids(),
            vec![Some(11), Some(12), None]
        );
        // deletion still in flight
        assert!(store.day(2).unwrap().places.is_empty());
        assert_contiguous(&store);
    }

    #[test]
    fn test_baseline_parses_rest_shape() {
        let json = r#"[{"dayScheduleId":4,"title":"Day 1","dayOrder":1,"daySchedule":[
            {"dayPlaceId":40,"placeName":"Harbor","address":"1 Pier","latitude":35.1,"longitude":129.0,
             "rating":4.5,"ratingCount":120,"imageUrl":null,"memo":"lunch","placeId":400,
             "googlePlaceId":"g-40","indexOrder":1}]}]"#;
        let days: Vec<Day> = serde_json::from_str(json).unwrap();
        assert_eq!(days[0].places[0].memo.as_deref(), Some("lunch"));
        assert_eq!(days[0].places[0].place.google_place_id.as_deref(), Some("g-40"));
        assert_eq!(days[0].places[0].place.rating_count, Some(120));
    }
}
