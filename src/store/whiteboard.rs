//! Whiteboard store: board objects (pinned places and drawn shapes).
//!
//! Objects only exist once the server has assigned an id, so creation is not
//! optimistic. Committed edits (`MODIFY`) and deletions are.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, warn};

use super::pending::{PendingLedger, PendingPolicy, SweepOutcome, Swept};
use crate::sync::protocol::{
    ObjectAttrs, ObjectId, ObjectPosition, ObjectRef, PlaceInfo, PlaceObject, WhiteboardAction,
};
use crate::sync::{PlanId, SyncError, SyncResult};

/// What a board object shows
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BoardItem {
    Place {
        place_id: Option<i64>,
        place: PlaceInfo,
    },
    Shape {
        attrs: ObjectAttrs,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardObject {
    pub id: ObjectId,
    pub position: ObjectPosition,
    pub item: BoardItem,
}

impl BoardObject {
    pub fn from_place(obj: &PlaceObject) -> Option<Self> {
        Some(Self {
            id: obj.white_board_object_id?,
            position: obj.object_info,
            item: BoardItem::Place {
                place_id: obj.place_id,
                place: obj.white_board_place.clone(),
            },
        })
    }

    pub fn from_shape(attrs: &ObjectAttrs) -> Option<Self> {
        Some(Self {
            id: attrs.white_board_object_id?,
            position: attrs.position().unwrap_or_default(),
            item: BoardItem::Shape {
                attrs: attrs.clone(),
            },
        })
    }

    /// Merge a committed edit
    fn apply(&mut self, update: &ObjectAttrs) {
        if let Some(position) = update.position() {
            self.position = position;
        }
        if let BoardItem::Shape { attrs } = &mut self.item {
            merge_attrs(attrs, update);
        }
    }
}

fn merge_attrs(target: &mut ObjectAttrs, update: &ObjectAttrs) {
    macro_rules! take {
        ($($field:ident),*) => {
            $(if update.$field.is_some() {
                target.$field = update.$field.clone();
            })*
        };
    }
    take!(
        kind, object_info, x, y, scale_x, scale_y, rotation, stroke, fill, radius, width, height,
        points, text
    );
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BoardKey {
    Modify(ObjectId),
    Delete(ObjectId),
}

#[derive(Debug, Clone)]
pub struct PendingBoardEdit {
    pub outbound: WhiteboardAction,
    /// Object as it was before the edit
    pub before: BoardObject,
    pub index: usize,
}

#[derive(Debug, Default)]
pub struct WhiteboardStore {
    plan_id: Option<PlanId>,
    objects: Vec<BoardObject>,
    /// Peer drag previews, cleared by the commit
    previews: HashMap<ObjectId, ObjectAttrs>,
    /// Pen stroke a peer is drawing
    line_preview: Option<Vec<f64>>,
    pending: PendingLedger<BoardKey, PendingBoardEdit>,
}

impl WhiteboardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan_id(&self) -> Option<PlanId> {
        self.plan_id
    }

    pub fn objects(&self) -> &[BoardObject] {
        &self.objects
    }

    pub fn get(&self, id: ObjectId) -> Option<&BoardObject> {
        self.objects.iter().find(|o| o.id == id)
    }

    pub fn preview(&self, id: ObjectId) -> Option<&ObjectAttrs> {
        self.previews.get(&id)
    }

    pub fn line_preview(&self) -> Option<&[f64]> {
        self.line_preview.as_deref()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn set_plan(&mut self, plan_id: Option<PlanId>) {
        if self.plan_id != plan_id {
            self.plan_id = plan_id;
            self.objects.clear();
            self.previews.clear();
            self.line_preview = None;
            self.pending.clear();
        }
    }

    // ------------------------------------------------------------------------
    // Local edits
    // ------------------------------------------------------------------------

    /// Pin a place; it appears when the server echoes it with an id
    pub fn pin_place(
        &self,
        place_id: Option<i64>,
        place: PlaceInfo,
        at: ObjectPosition,
    ) -> WhiteboardAction {
        WhiteboardAction::CreatePlace(PlaceObject {
            white_board_object_id: None,
            place_id,
            object_info: at,
            white_board_place: place,
        })
    }

    /// Draw a shape; it appears when the server echoes it with an id
    pub fn draw(&self, mut attrs: ObjectAttrs) -> WhiteboardAction {
        attrs.white_board_object_id = None;
        WhiteboardAction::Create(attrs)
    }

    /// Drag preview; nothing changes locally
    pub fn preview_move(&self, id: ObjectId, at: ObjectPosition) -> SyncResult<WhiteboardAction> {
        self.index(id).ok_or_else(|| unknown(id))?;
        Ok(WhiteboardAction::Move(ObjectAttrs {
            white_board_object_id: Some(id),
            object_info: Some(at),
            x: Some(at.x),
            y: Some(at.y),
            ..Default::default()
        }))
    }

    /// Committed edit (position and/or drawing attributes)
    pub fn modify(
        &mut self,
        id: ObjectId,
        mut update: ObjectAttrs,
        now: Instant,
    ) -> SyncResult<WhiteboardAction> {
        let index = self.index(id).ok_or_else(|| unknown(id))?;
        // an unconfirmed earlier modify already holds the confirmed version
        let before = match self.pending.get(&BoardKey::Modify(id)) {
            Some(earlier) => earlier.op.before.clone(),
            None => self.objects[index].clone(),
        };
        update.white_board_object_id = Some(id);
        self.objects[index].apply(&update);
        self.previews.remove(&id);

        let outbound = WhiteboardAction::Modify(update);
        self.pending.track(
            BoardKey::Modify(id),
            PendingBoardEdit {
                outbound: outbound.clone(),
                before,
                index,
            },
            now,
        );
        Ok(outbound)
    }

    pub fn delete(&mut self, id: ObjectId, now: Instant) -> SyncResult<WhiteboardAction> {
        let index = self.index(id).ok_or_else(|| unknown(id))?;
        let before = self.objects.remove(index);
        self.previews.remove(&id);

        let outbound = WhiteboardAction::Delete(ObjectRef {
            white_board_object_id: id,
        });
        self.pending.track(
            BoardKey::Delete(id),
            PendingBoardEdit {
                outbound: outbound.clone(),
                before,
                index,
            },
            now,
        );
        Ok(outbound)
    }

    // ------------------------------------------------------------------------
    // Remote echoes
    // ------------------------------------------------------------------------

    /// Apply an echo. Returns whether anything visible changed.
    pub fn apply_remote(&mut self, action: &WhiteboardAction, now: Instant) -> bool {
        match action {
            WhiteboardAction::CreatePlace(obj) => match BoardObject::from_place(obj) {
                Some(object) => self.upsert(object),
                None => {
                    warn!("CREATE_PLACE without whiteBoardObjectId ignored");
                    false
                }
            },
            WhiteboardAction::Create(attrs) => match BoardObject::from_shape(attrs) {
                Some(object) => self.upsert(object),
                None => {
                    warn!("CREATE without whiteBoardObjectId ignored");
                    false
                }
            },
            WhiteboardAction::Move(attrs) => {
                match attrs.white_board_object_id {
                    Some(id) => {
                        let preview = self.previews.entry(id).or_default();
                        merge_attrs(preview, attrs);
                    }
                    // pen stroke in progress
                    None => match &attrs.points {
                        Some(points) => self.line_preview = Some(points.clone()),
                        None => return false,
                    },
                }
                true
            }
            WhiteboardAction::Modify(attrs) => {
                let Some(id) = attrs.white_board_object_id else {
                    warn!("MODIFY without whiteBoardObjectId ignored");
                    return false;
                };
                self.pending.resolve(&BoardKey::Modify(id), now);
                let had_preview = self.previews.remove(&id).is_some();
                if attrs.points.is_some() {
                    self.line_preview = None;
                }
                match self.index(id) {
                    Some(index) => {
                        let before = self.objects[index].clone();
                        self.objects[index].apply(attrs);
                        self.objects[index] != before || had_preview
                    }
                    None => {
                        debug!("MODIFY for unknown object {}", id);
                        had_preview
                    }
                }
            }
            WhiteboardAction::Delete(target) => {
                let id = target.white_board_object_id;
                self.pending.resolve(&BoardKey::Delete(id), now);
                self.previews.remove(&id);
                match self.index(id) {
                    Some(index) => {
                        self.objects.remove(index);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    fn upsert(&mut self, object: BoardObject) -> bool {
        match self.index(object.id) {
            Some(index) if self.objects[index] == object => false,
            Some(index) => {
                self.objects[index] = object;
                true
            }
            None => {
                if matches!(object.item, BoardItem::Shape { ref attrs } if attrs.points.is_some()) {
                    self.line_preview = None;
                }
                self.objects.push(object);
                true
            }
        }
    }

    // ------------------------------------------------------------------------
    // Baseline, sweep, rollback
    // ------------------------------------------------------------------------

    /// Replace the board with a REST baseline, keeping in-flight local edits
    pub fn load_baseline(&mut self, plan_id: PlanId, baseline: Vec<BoardObject>) {
        self.set_plan(Some(plan_id));

        let mut merged = Vec::with_capacity(baseline.len());
        for object in baseline {
            if self.pending.is_pending(&BoardKey::Delete(object.id)) {
                continue;
            }
            // local version wins while its edit is in flight
            let local = self
                .pending
                .is_pending(&BoardKey::Modify(object.id))
                .then(|| self.get(object.id).cloned())
                .flatten();
            merged.push(local.unwrap_or(object));
        }

        debug!("whiteboard baseline: {} objects", merged.len());
        self.objects = merged;
        self.previews.clear();
        self.line_preview = None;
    }

    pub fn sweep(&mut self, now: Instant, policy: &PendingPolicy) -> Swept<WhiteboardAction> {
        let mut swept = Swept::default();
        for outcome in self.pending.sweep(now, policy) {
            match outcome {
                SweepOutcome::Resend { key, op } => {
                    debug!("resending {:?}", key);
                    swept.resend.push(op.outbound);
                }
                SweepOutcome::Expired { key, op } => {
                    warn!("{:?} never confirmed, rolling back", key);
                    swept.expired.push(op.outbound.clone());
                    self.restore(op);
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
    pub fn reject(&mut self, outbound: &WhiteboardAction) {
        let key = match outbound {
            WhiteboardAction::Modify(attrs) => match attrs.white_board_object_id {
                Some(id) => BoardKey::Modify(id),
                None => return,
            },
            WhiteboardAction::Delete(target) => BoardKey::Delete(target.white_board_object_id),
            _ => return,
        };
        if let Some(op) = self.pending.cancel(&key) {
            warn!("{:?} not sent, rolling back", key);
            self.restore(op);
        }
    }

    fn restore(&mut self, op: PendingBoardEdit) {
        match self.index(op.before.id) {
            Some(index) => self.objects[index] = op.before,
            None => {
                let index = op.index.min(self.objects.len());
                self.objects.insert(index, op.before);
            }
        }
    }

    fn index(&self, id: ObjectId) -> Option<usize> {
        self.objects.iter().position(|o| o.id == id)
    }
}

fn unknown(id: ObjectId) -> SyncError {
    SyncError::UnknownEntity(format!("whiteboard object {}", id))
}
