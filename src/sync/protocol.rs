//! Wire envelopes for the realtime channels.
//!
//! Every domain channel carries JSON objects tagged by an `action` field:
//!
//! ```text
//! {"action":"UPDATE_INNER","dayScheduleId":3,"dayPlaceId":11,"indexOrder":1,"modifiedIndexOrder":3}
//! ```
//!
//! Older senders use `{"type": "...", "payload": {...}}`; `normalize` folds
//! that form into the flat one before typed decoding. The cursor channel has
//! no action tag and is decoded separately (`CursorPosition`).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Domain, UserName};

pub type ObjectId = i64;
pub type DayScheduleId = i64;
pub type DayPlaceId = i64;
pub type BookmarkId = i64;

/// Envelope decode/encode errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Envelope is not a JSON object")]
    NotAnObject,

    #[error("Envelope has no action")]
    MissingAction,

    #[error("Unknown {domain} action '{action}'")]
    UnknownAction { domain: Domain, action: String },

    #[error("Invalid {0} payload: {1}")]
    InvalidPayload(Domain, String),

    #[error("Encode failed: {0}")]
    Encode(String),
}

/// A closed set of actions for one domain channel
pub trait Envelope: Serialize + DeserializeOwned {
    const DOMAIN: Domain;
    const ACTIONS: &'static [&'static str];

    /// Wire name of this action
    fn action(&self) -> &'static str;
}

/// Flatten a body into `{action, ...fields}`.
///
/// Trailing NULs are stripped; `{type, payload}` becomes
/// `{action: TYPE, ...payload}`.
pub fn normalize(body: &str) -> Result<Map<String, Value>, ProtocolError> {
    let body = body.trim_end_matches('\0').trim();
    let value: Value =
        serde_json::from_str(body).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let Value::Object(mut map) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    if let Some(action) = map.get("action").and_then(Value::as_str) {
        let action = action.to_ascii_uppercase();
        map.insert("action".to_string(), Value::String(action));
        return Ok(map);
    }

    let legacy_type = map
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_ascii_uppercase);
    match (legacy_type, map.remove("payload")) {
        (Some(action), Some(Value::Object(mut payload))) => {
            payload.insert("action".to_string(), Value::String(action));
            Ok(payload)
        }
        _ => Err(ProtocolError::MissingAction),
    }
}

/// Decode one envelope of a domain
pub fn decode<T: Envelope>(body: &str) -> Result<T, ProtocolError> {
    let map = normalize(body)?;
    let action = map
        .get("action")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingAction)?;

    if !T::ACTIONS.contains(&action) {
        return Err(ProtocolError::UnknownAction {
            domain: T::DOMAIN,
            action: action.to_string(),
        });
    }

    serde_json::from_value(Value::Object(map))
        .map_err(|e| ProtocolError::InvalidPayload(T::DOMAIN, e.to_string()))
}

/// Encode an envelope as a JSON body
pub fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::Encode(e.to_string()))
}

// ============================================================================
// SHARED PLACE ATTRIBUTES
// ============================================================================

/// Place attributes as they travel between map search, bookmarks and days
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlaceInfo {
    pub google_place_id: Option<String>,
    #[serde(alias = "name")]
    pub place_name: Option<String>,
    #[serde(alias = "lat")]
    pub latitude: Option<f64>,
    #[serde(alias = "lng")]
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub rating: Option<f64>,
    pub rating_count: Option<u32>,
    pub phone_number: Option<String>,
    pub place_url: Option<String>,
    pub image_url: Option<String>,
    pub site_url: Option<String>,
    pub category: Option<String>,
}

impl PlaceInfo {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }

    pub fn is_empty(&self) -> bool {
        self == &PlaceInfo::default()
    }
}

// ============================================================================
// WHITEBOARD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectPosition {
    pub x: f64,
    pub y: f64,
}

/// A place pinned to the board (`CREATE_PLACE`)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlaceObject {
    #[serde(alias = "id")]
    pub white_board_object_id: Option<ObjectId>,
    pub place_id: Option<i64>,
    pub object_info: ObjectPosition,
    pub white_board_place: PlaceInfo,
}

/// Drawing attributes carried by `CREATE`, `MOVE` and `MODIFY`.
///
/// Every field is optional: a MOVE preview carries only what changed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectAttrs {
    #[serde(alias = "id")]
    pub white_board_object_id: Option<ObjectId>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub object_info: Option<ObjectPosition>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub scale_x: Option<f64>,
    pub scale_y: Option<f64>,
    pub rotation: Option<f64>,
    pub stroke: Option<String>,
    pub fill: Option<String>,
    pub radius: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub points: Option<Vec<f64>>,
    pub text: Option<String>,
}

impl ObjectAttrs {
    /// Position, preferring `objectInfo` over top-level `x`/`y`
    pub fn position(&self) -> Option<ObjectPosition> {
        self.object_info.or_else(|| {
            self.x
                .zip(self.y)
                .map(|(x, y)| ObjectPosition { x, y })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    #[serde(alias = "id")]
    pub white_board_object_id: ObjectId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WhiteboardAction {
    CreatePlace(PlaceObject),
    /// Diagram shape (rect, circle, arrow, text, pen)
    Create(ObjectAttrs),
    /// Transient drag preview
    Move(ObjectAttrs),
    /// Committed change
    Modify(ObjectAttrs),
    Delete(ObjectRef),
}

impl Envelope for WhiteboardAction {
    const DOMAIN: Domain = Domain::Whiteboard;
    const ACTIONS: &'static [&'static str] =
        &["CREATE_PLACE", "CREATE", "MOVE", "MODIFY", "DELETE"];

    fn action(&self) -> &'static str {
        match self {
            WhiteboardAction::CreatePlace(_) => "CREATE_PLACE",
            WhiteboardAction::Create(_) => "CREATE",
            WhiteboardAction::Move(_) => "MOVE",
            WhiteboardAction::Modify(_) => "MODIFY",
            WhiteboardAction::Delete(_) => "DELETE",
        }
    }
}

// ============================================================================
// DAY SCHEDULE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NewDay {
    /// Assigned by the server; absent on the outbound request
    pub day_schedule_id: Option<DayScheduleId>,
    pub title: String,
    pub day_order: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayRename {
    pub day_schedule_id: DayScheduleId,
    pub title: String,
}

/// Day reorder; orders are 1-based positions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayReorder {
    pub day_schedule_id: DayScheduleId,
    pub day_order: u32,
    pub modified_day_order: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayRef {
    pub day_schedule_id: DayScheduleId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DayScheduleAction {
    Create(NewDay),
    Rename(DayRename),
    /// Transient drag preview
    Move(DayReorder),
    UpdateSchedule(DayReorder),
    Delete(DayRef),
}

impl Envelope for DayScheduleAction {
    const DOMAIN: Domain = Domain::DaySchedule;
    const ACTIONS: &'static [&'static str] =
        &["CREATE", "RENAME", "MOVE", "UPDATE_SCHEDULE", "DELETE"];

    fn action(&self) -> &'static str {
        match self {
            DayScheduleAction::Create(_) => "CREATE",
            DayScheduleAction::Rename(_) => "RENAME",
            DayScheduleAction::Move(_) => "MOVE",
            DayScheduleAction::UpdateSchedule(_) => "UPDATE_SCHEDULE",
            DayScheduleAction::Delete(_) => "DELETE",
        }
    }
}

// ============================================================================
// DAY PLACE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NewDayPlace {
    pub day_schedule_id: DayScheduleId,
    /// Assigned by the server; absent on the outbound request
    pub day_place_id: Option<DayPlaceId>,
    /// Bookmark or board place the day entry was created from
    pub place_id: Option<i64>,
    pub index_order: Option<u32>,
    pub memo: Option<String>,
    #[serde(flatten)]
    pub place: PlaceInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayPlaceMemo {
    pub day_schedule_id: DayScheduleId,
    pub day_place_id: DayPlaceId,
    #[serde(default)]
    pub memo: Option<String>,
}

/// Drag preview, possibly across days
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayPlaceMove {
    pub day_schedule_id: DayScheduleId,
    pub day_place_id: DayPlaceId,
    #[serde(default)]
    pub index_order: Option<u32>,
    #[serde(default)]
    pub modified_day_schedule_id: Option<DayScheduleId>,
    #[serde(default)]
    pub modified_index_order: Option<u32>,
}

/// Reorder within one day (1-based positions)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayPlaceReorder {
    pub day_schedule_id: DayScheduleId,
    pub day_place_id: DayPlaceId,
    pub index_order: u32,
    pub modified_index_order: u32,
}

/// Move to another day (1-based positions)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayPlaceTransfer {
    pub day_schedule_id: DayScheduleId,
    pub day_place_id: DayPlaceId,
    pub modified_day_schedule_id: DayScheduleId,
    pub index_order: u32,
    pub modified_index_order: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayPlaceRef {
    pub day_schedule_id: DayScheduleId,
    pub day_place_id: DayPlaceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DayPlaceAction {
    Create(NewDayPlace),
    Rename(DayPlaceMemo),
    Move(DayPlaceMove),
    UpdateInner(DayPlaceReorder),
    UpdateOuter(DayPlaceTransfer),
    Delete(DayPlaceRef),
}

impl Envelope for DayPlaceAction {
    const DOMAIN: Domain = Domain::DayPlace;
    const ACTIONS: &'static [&'static str] = &[
        "CREATE",
        "RENAME",
        "MOVE",
        "UPDATE_INNER",
        "UPDATE_OUTER",
        "DELETE",
    ];

    fn action(&self) -> &'static str {
        match self {
            DayPlaceAction::Create(_) => "CREATE",
            DayPlaceAction::Rename(_) => "RENAME",
            DayPlaceAction::Move(_) => "MOVE",
            DayPlaceAction::UpdateInner(_) => "UPDATE_INNER",
            DayPlaceAction::UpdateOuter(_) => "UPDATE_OUTER",
            DayPlaceAction::Delete(_) => "DELETE",
        }
    }
}

// ============================================================================
// BOOKMARK
// ============================================================================

/// Bookmark body of `CREATE`/`UPDATE`.
///
/// Place attributes may arrive flat or nested under `place`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BookmarkPayload {
    pub bookmark_id: Option<BookmarkId>,
    /// Some servers echo the bookmark id as `placeId`
    pub place_id: Option<BookmarkId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub place: Option<PlaceInfo>,
    #[serde(flatten)]
    pub details: PlaceInfo,
}

impl BookmarkPayload {
    pub fn id(&self) -> Option<BookmarkId> {
        self.bookmark_id.or(self.place_id)
    }

    /// Place attributes, nested form first
    pub fn place_info(&self) -> PlaceInfo {
        match &self.place {
            Some(nested) if !nested.is_empty() => {
                let mut info = nested.clone();
                if info.google_place_id.is_none() {
                    info.google_place_id = self.details.google_place_id.clone();
                }
                info
            }
            _ => self.details.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BookmarkRef {
    pub bookmark_id: Option<BookmarkId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub place_id: Option<BookmarkId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_place_id: Option<String>,
}

impl BookmarkRef {
    pub fn id(&self) -> Option<BookmarkId> {
        self.bookmark_id.or(self.place_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookmarkAction {
    Create(BookmarkPayload),
    Update(BookmarkPayload),
    Delete(BookmarkRef),
}

impl Envelope for BookmarkAction {
    const DOMAIN: Domain = Domain::Bookmark;
    const ACTIONS: &'static [&'static str] = &["CREATE", "UPDATE", "DELETE"];

    fn action(&self) -> &'static str {
        match self {
            BookmarkAction::Create(_) => "CREATE",
            BookmarkAction::Update(_) => "UPDATE",
            BookmarkAction::Delete(_) => "DELETE",
        }
    }
}

// ============================================================================
// CURSOR
// ============================================================================

/// Pointer position broadcast on the mouse channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    #[serde(alias = "userId", alias = "username")]
    pub user_name: UserName,
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    pub fn decode(body: &str) -> Result<Self, ProtocolError> {
        let body = body.trim_end_matches('\0').trim();
        let position: CursorPosition = serde_json::from_str(body)
            .map_err(|e| ProtocolError::InvalidPayload(Domain::Cursor, e.to_string()))?;
        if !position.x.is_finite() || !position.y.is_finite() {
            return Err(ProtocolError::InvalidPayload(
                Domain::Cursor,
                "non-finite coordinates".to_string(),
            ));
        }
        Ok(position)
    }
}

// ============================================================================
// INBOUND DISPATCH
// ============================================================================

/// A decoded message from any channel
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Whiteboard(WhiteboardAction),
    DaySchedule(DayScheduleAction),
    DayPlace(DayPlaceAction),
    Bookmark(BookmarkAction),
    Cursor(CursorPosition),
}

impl Inbound {
    pub fn decode(domain: Domain, body: &str) -> Result<Self, ProtocolError> {
        Ok(match domain {
            Domain::Whiteboard => Inbound::Whiteboard(decode(body)?),
            Domain::DaySchedule => Inbound::DaySchedule(decode(body)?),
            Domain::DayPlace => Inbound::DayPlace(decode(body)?),
            Domain::Bookmark => Inbound::Bookmark(decode(body)?),
            Domain::Cursor => Inbound::Cursor(CursorPosition::decode(body)?),
        })
    }
}
