//! Place identity reconciliation.
//!
//! The same place reaches the client with different identifiers depending on
//! where it came from: a map search result has only a Google place id, a
//! stored bookmark has a server id, and a board pin may carry neither. Two
//! descriptions are considered the same place by the first rule that applies:
//!
//! 1. both carry a bookmark id: equal ids match, different ids never match
//! 2. both carry a Google place id: equal ids match, different ids never match
//! 3. coordinates within `COORDINATE_EPSILON` on both axes
//! 4. equal normalized names
//!
//! Rules 3 and 4 are fuzzy and only consulted when rule 2 could not decide.

use crate::sync::protocol::{BookmarkId, PlaceInfo};

/// Coordinate tolerance in degrees (about 11m of latitude)
pub const COORDINATE_EPSILON: f64 = 1e-4;

/// Which rule matched, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    BookmarkId,
    GooglePlaceId,
    Proximity,
    Name,
}

impl MatchKind {
    /// Matched on a server-issued identifier
    pub fn is_strong(&self) -> bool {
        matches!(self, MatchKind::BookmarkId | MatchKind::GooglePlaceId)
    }
}

/// The identifying parts of a place description
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaceIdentity<'a> {
    pub bookmark_id: Option<BookmarkId>,
    pub google_place_id: Option<&'a str>,
    pub name: Option<&'a str>,
    pub coordinates: Option<(f64, f64)>,
}

impl<'a> PlaceIdentity<'a> {
    pub fn of(bookmark_id: Option<BookmarkId>, place: &'a PlaceInfo) -> Self {
        Self {
            bookmark_id,
            google_place_id: place.google_place_id.as_deref().filter(|g| !g.is_empty()),
            name: place.place_name.as_deref(),
            coordinates: place.coordinates(),
        }
    }
}

/// Anything that can describe which place it is
pub trait Identified {
    fn identity(&self) -> PlaceIdentity<'_>;
}

impl Identified for PlaceInfo {
    fn identity(&self) -> PlaceIdentity<'_> {
        PlaceIdentity::of(None, self)
    }
}

/// Lowercase, alphanumerics only
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Decide whether two descriptions name the same place
pub fn same_place(a: &PlaceIdentity<'_>, b: &PlaceIdentity<'_>) -> Option<MatchKind> {
    if let (Some(x), Some(y)) = (a.bookmark_id, b.bookmark_id) {
        return (x == y).then_some(MatchKind::BookmarkId);
    }

    if let (Some(x), Some(y)) = (a.google_place_id, b.google_place_id) {
        return (x == y).then_some(MatchKind::GooglePlaceId);
    }

    if let (Some((lat_a, lng_a)), Some((lat_b, lng_b))) = (a.coordinates, b.coordinates) {
        if (lat_a - lat_b).abs() < COORDINATE_EPSILON
            && (lng_a - lng_b).abs() < COORDINATE_EPSILON
        {
            return Some(MatchKind::Proximity);
        }
    }

    if let (Some(x), Some(y)) = (a.name, b.name) {
        let x = normalize_name(x);
        if !x.is_empty() && x == normalize_name(y) {
            return Some(MatchKind::Name);
        }
    }

    None
}

/// Best match across the whole list (strongest rule, then first position)
pub fn find_match<T: Identified>(
    items: &[T],
    target: &PlaceIdentity<'_>,
) -> Option<(usize, MatchKind)> {
    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| same_place(&item.identity(), target).map(|kind| (i, kind)))
        .min_by_key(|(i, kind)| (*kind, *i))
}

/// Like `find_match`, restricted to server-issued identifiers
pub fn find_strong_match<T: Identified>(items: &[T], target: &PlaceIdentity<'_>) -> Option<usize> {
    find_match(items, target)
        .filter(|(_, kind)| kind.is_strong())
        .map(|(i, _)| i)
}
