//! REST baselines for a plan.
//!
//! After every (re)subscribe the session reloads the authoritative state of
//! the affected domain and merges it under its pending local edits. The REST
//! API wraps payloads inconsistently, so every loader accepts the list bare,
//! under `body`, or under a named field of `body`.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::store::{BoardObject, Bookmark, Day};
use crate::sync::protocol::{ObjectAttrs, PlaceObject};
use crate::sync::{PlanId, SyncError, SyncResult};

/// Authoritative state of a plan, per domain
#[async_trait]
pub trait BaselineSource: Send + Sync {
    async fn bookmarks(&self, plan_id: PlanId, token: &str) -> SyncResult<Vec<Bookmark>>;

    async fn schedule(&self, plan_id: PlanId, token: &str) -> SyncResult<Vec<Day>>;

    async fn whiteboard(&self, plan_id: PlanId, token: &str) -> SyncResult<Vec<BoardObject>>;
}

/// Baselines fetched from the plan REST API
pub struct HttpBaseline {
    api_url: String,
    client: reqwest::Client,
}

impl HttpBaseline {
    pub fn new(api_url: impl Into<String>) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("plan-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Baseline(e.to_string()))?;

        Ok(Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get(&self, path: &str, token: &str) -> SyncResult<Value> {
        let url = format!("{}{}", self.api_url, path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SyncError::Baseline(format!("{}: {}", url, e)))?;

        response
            .json()
            .await
            .map_err(|e| SyncError::Baseline(format!("{}: {}", url, e)))
    }
}

#[async_trait]
impl BaselineSource for HttpBaseline {
    async fn bookmarks(&self, plan_id: PlanId, token: &str) -> SyncResult<Vec<Bookmark>> {
        let body = self.get(&format!("/plan/{}/bookmark", plan_id), token).await?;
        parse_bookmarks(body)
    }

    async fn schedule(&self, plan_id: PlanId, token: &str) -> SyncResult<Vec<Day>> {
        let body = self.get(&format!("/plan/{}/schedule", plan_id), token).await?;
        parse_schedule(body)
    }

    async fn whiteboard(&self, plan_id: PlanId, token: &str) -> SyncResult<Vec<BoardObject>> {
        let body = self
            .get(&format!("/plan/{}/whiteBoardObject", plan_id), token)
            .await?;
        parse_whiteboard(body)
    }
}

fn peel_body(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("body") => {
            map.remove("body").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Peel `{body: ...}` and then `{field: [...]}` off a response
fn unwrap_list(value: Value, field: &str) -> Value {
    let body = peel_body(value);
    match body {
        Value::Object(mut map) => map.remove(field).unwrap_or(Value::Null),
        other => other,
    }
}

/// Decode each element on its own; malformed entries are skipped
fn parse_list<T: DeserializeOwned>(value: Value, what: &str) -> SyncResult<Vec<T>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(SyncError::Baseline(format!(
                "expected a {} list, got {}",
                what,
                kind(&other)
            )))
        }
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Skipping malformed {} entry: {}", what, e);
                None
            }
        })
        .collect())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn parse_bookmarks(value: Value) -> SyncResult<Vec<Bookmark>> {
    parse_list(unwrap_list(value, "bookmarkList"), "bookmark")
}

pub fn parse_schedule(value: Value) -> SyncResult<Vec<Day>> {
    parse_list(unwrap_list(value, "planSchedule"), "day schedule")
}

pub fn parse_whiteboard(value: Value) -> SyncResult<Vec<BoardObject>> {
    let mut body = peel_body(value);

    let diagrams: Vec<ObjectAttrs> = parse_list(
        body.get_mut("whiteBoardDiagrams").map(Value::take).unwrap_or(Value::Null),
        "whiteboard diagram",
    )?;
    let places: Vec<PlaceObject> = parse_list(
        body.get_mut("whiteBoardPlaces").map(Value::take).unwrap_or(Value::Null),
        "whiteboard place",
    )?;

    let mut objects: Vec<BoardObject> = diagrams
        .iter()
        .filter_map(BoardObject::from_shape)
        .chain(places.iter().filter_map(BoardObject::from_place))
        .collect();
    objects.sort_by_key(|o| o.id);
    Ok(objects)
}

/// In-memory baselines, keyed by plan
#[derive(Default)]
pub struct StaticBaseline {
    bookmarks: RwLock<HashMap<PlanId, Vec<Bookmark>>>,
    schedules: RwLock<HashMap<PlanId, Vec<Day>>>,
    boards: RwLock<HashMap<PlanId, Vec<BoardObject>>>,
}

impl StaticBaseline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bookmarks(&self, plan_id: PlanId, items: Vec<Bookmark>) {
        self.bookmarks.write().insert(plan_id, items);
    }

    pub fn set_schedule(&self, plan_id: PlanId, days: Vec<Day>) {
        self.schedules.write().insert(plan_id, days);
    }

    pub fn set_whiteboard(&self, plan_id: PlanId, objects: Vec<BoardObject>) {
        self.boards.write().insert(plan_id, objects);
    }
}

#[async_trait]
impl BaselineSource for StaticBaseline {
    async fn bookmarks(&self, plan_id: PlanId, _token: &str) -> SyncResult<Vec<Bookmark>> {
        Ok(self.bookmarks.read().get(&plan_id).cloned().unwrap_or_default())
    }

    async fn schedule(&self, plan_id: PlanId, _token: &str) -> SyncResult<Vec<Day>> {
        Ok(self.schedules.read().get(&plan_id).cloned().unwrap_or_default())
    }

    async fn whiteboard(&self, plan_id: PlanId, _token: &str) -> SyncResult<Vec<BoardObject>> {
        Ok(self.boards.read().get(&plan_id).cloned().unwrap_or_default())
    }
}
