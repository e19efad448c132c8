//! Optimistic state for the plan's shared collections.
//!
//! Each store applies local mutations immediately, returns the envelope to
//! publish, and later converges with the server echo of that envelope (or of
//! a peer's). Stores never talk to a channel themselves; the session wires
//! them up.

pub mod bookmark;
pub mod identity;
pub mod pending;
pub mod schedule;
pub mod whiteboard;

pub use bookmark::{Bookmark, BookmarkStore, Toggle};
pub use identity::{MatchKind, PlaceIdentity};
pub use pending::{PendingLedger, PendingPolicy, SweepOutcome, Swept};
pub use schedule::{Day, DayPlace, ScheduleStore};
pub use whiteboard::{BoardItem, BoardObject, WhiteboardStore};

/// Renumber a list so its 1-based order field reads 1..=N
pub(crate) fn renumber<T>(items: &mut [T], mut set: impl FnMut(&mut T, u32)) {
    for (i, item) in items.iter_mut().enumerate() {
        set(item, i as u32 + 1);
    }
}

/// Clamp a 1-based position into an insertion index for a list of `len`
pub(crate) fn insertion_index(order: Option<u32>, len: usize) -> usize {
    match order {
        Some(order) if order >= 1 => (order as usize - 1).min(len),
        _ => len,
    }
}
