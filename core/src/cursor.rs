//! Cursors: typed position markers over an ordered domain.
//!
//! A cursor remembers how far a consumer has read through a stream. Positions
//! are compared with the domain's natural ordering (`Ord`), flipped when the
//! cursor runs in descending order.
//!
//! # Example
//!
//! ```
//! use alluvial_core::cursor::Cursor;
//!
//! let mut cursor = Cursor::<i64>::new();
//! assert!(!cursor.has_reached(&1));
//!
//! cursor.advance_to(10).unwrap();
//! assert!(cursor.has_reached(&10));
//! assert!(!cursor.has_reached(&11));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised by cursor operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CursorError {
    /// The cursor is a read-only snapshot and cannot be advanced.
    #[error("Cursor is read-only")]
    ReadOnly,

    /// A position of one kind was compared against a cursor of another kind.
    #[error("Cannot use a {found} position with a {expected} cursor")]
    IncompatiblePosition {
        /// The position kind the cursor is bound to.
        expected: &'static str,
        /// The position kind that was supplied.
        found: &'static str,
    },

    /// A deferred cursor was bound a second time.
    #[error("Cursor has already been initialized")]
    AlreadyInitialized,
}

/// Marker for types usable as cursor positions.
///
/// Blanket-implemented for every totally ordered, cloneable, thread-safe type.
pub trait CursorPosition: Ord + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> CursorPosition for T where T: Ord + Clone + fmt::Debug + Send + Sync + 'static {}

/// Positions that support "add N" (sequence numbers, offsets).
///
/// Streams whose fetch function only reports items, not their positions, use
/// this to work out where each item leaves the cursor.
pub trait Incrementable: CursorPosition {
    /// The position of a cursor that has consumed nothing.
    fn origin() -> Self;

    /// The position `steps` items further along in ascending order.
    #[must_use]
    fn forward(&self, steps: usize) -> Self;

    /// The position `steps` items further along in descending order.
    #[must_use]
    fn backward(&self, steps: usize) -> Self;
}

macro_rules! impl_incrementable {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Incrementable for $ty {
                fn origin() -> Self {
                    0
                }

                fn forward(&self, steps: usize) -> Self {
                    self.saturating_add(<$ty>::try_from(steps).unwrap_or(<$ty>::MAX))
                }

                fn backward(&self, steps: usize) -> Self {
                    self.saturating_sub(<$ty>::try_from(steps).unwrap_or(<$ty>::MAX))
                }
            }
        )*
    };
}

impl_incrementable!(i32, i64, u32, u64, usize);

/// A mutable position marker.
///
/// A fresh cursor sits at the start of the stream (`position() == None`) and
/// has reached nothing. Advancing is monotonic: moving "behind" the current
/// position in the configured direction leaves the cursor where it is.
///
/// Read-only snapshots created with [`Cursor::read_only`] can be handed to
/// third parties (fetch functions, observers) without letting them move the
/// authoritative cursor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor<P> {
    position: Option<P>,
    ascending: bool,
    #[serde(skip)]
    read_only: bool,
}

impl<P: CursorPosition> Cursor<P> {
    /// Create an ascending cursor at the start of the stream.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            position: None,
            ascending: true,
            read_only: false,
        }
    }

    /// Create a descending cursor at the start of the stream.
    #[must_use]
    pub const fn new_descending() -> Self {
        Self {
            position: None,
            ascending: false,
            read_only: false,
        }
    }

    /// Create an ascending cursor at a known position.
    #[must_use]
    pub const fn at(position: P) -> Self {
        Self {
            position: Some(position),
            ascending: true,
            read_only: false,
        }
    }

    /// Flip this cursor to descending order.
    #[must_use]
    pub fn descending(mut self) -> Self {
        self.ascending = false;
        self
    }

    /// The last position successfully advanced to, or `None` at start of stream.
    #[must_use]
    pub const fn position(&self) -> Option<&P> {
        self.position.as_ref()
    }

    /// Whether positions grow as the cursor advances.
    #[must_use]
    pub const fn ascending(&self) -> bool {
        self.ascending
    }

    /// Whether this cursor is a read-only snapshot.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// A read-only copy of this cursor.
    #[must_use]
    pub fn read_only(&self) -> Self {
        Self {
            position: self.position.clone(),
            ascending: self.ascending,
            read_only: true,
        }
    }

    /// A writable copy of this cursor, even if it is a snapshot.
    #[must_use]
    pub fn writable(&self) -> Self {
        Self {
            position: self.position.clone(),
            ascending: self.ascending,
            read_only: false,
        }
    }

    /// Whether the cursor is at or past `point` in its configured direction.
    #[must_use]
    pub fn has_reached(&self, point: &P) -> bool {
        match &self.position {
            None => false,
            Some(position) if self.ascending => position >= point,
            Some(position) => position <= point,
        }
    }

    /// Move the cursor to `position`.
    ///
    /// Advancing to a point the cursor has already reached is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::ReadOnly`] for read-only snapshots.
    pub fn advance_to(&mut self, position: P) -> Result<(), CursorError> {
        if self.read_only {
            return Err(CursorError::ReadOnly);
        }
        if !self.has_reached(&position) {
            self.position = Some(position);
        }
        Ok(())
    }

    /// Whether `self` is further behind than `other` (needs older data).
    ///
    /// A cursor at the start of the stream is behind every positioned cursor.
    #[must_use]
    pub fn is_behind(&self, other: &Self) -> bool {
        match (&self.position, &other.position) {
            (None, None) => false,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (Some(mine), Some(theirs)) => {
                if self.ascending {
                    mine < theirs
                } else {
                    mine > theirs
                }
            }
        }
    }
}

impl<P: Incrementable> Cursor<P> {
    /// The position this cursor would reach after `steps` more items.
    #[must_use]
    pub fn position_after(&self, steps: usize) -> P {
        let base = self.position.clone().unwrap_or_else(P::origin);
        if self.ascending {
            base.forward(steps)
        } else {
            base.backward(steps)
        }
    }

    /// Advance by `steps` items.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::ReadOnly`] for read-only snapshots.
    pub fn advance_by(&mut self, steps: usize) -> Result<(), CursorError> {
        if self.read_only {
            return Err(CursorError::ReadOnly);
        }
        let next = self.position_after(steps);
        self.advance_to(next)
    }
}

impl<P: CursorPosition> Default for Cursor<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: CursorPosition> fmt::Display for Cursor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.ascending { "asc" } else { "desc" };
        match &self.position {
            Some(position) => write!(f, "{position:?} ({direction})"),
            None => write!(f, "start ({direction})"),
        }
    }
}

/// Cursor over integer sequence numbers.
pub type SequentialCursor = Cursor<i64>;

/// Cursor over timestamps.
pub type ChronologicalCursor = Cursor<DateTime<Utc>>;

/// Cursor over strings in lexical order.
pub type AlphabeticalCursor = Cursor<String>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn fresh_cursor_has_reached_nothing() {
        let cursor = SequentialCursor::new();
        assert!(!cursor.has_reached(&i64::MIN));
        assert!(cursor.position().is_none());
    }

    #[test]
    fn descending_cursor_flips_comparison() {
        let mut cursor = SequentialCursor::new_descending();
        cursor.advance_to(50).unwrap();

        assert!(cursor.has_reached(&50));
        assert!(cursor.has_reached(&51));
        assert!(!cursor.has_reached(&49));
    }

    #[test]
    fn advancing_backwards_is_ignored() {
        let mut cursor = SequentialCursor::at(10);
        cursor.advance_to(3).unwrap();
        assert_eq!(cursor.position(), Some(&10));

        let mut descending = SequentialCursor::at(10).descending();
        descending.advance_to(12).unwrap();
        assert_eq!(descending.position(), Some(&10));
        descending.advance_to(4).unwrap();
        assert_eq!(descending.position(), Some(&4));
    }

    #[test]
    fn read_only_cursor_refuses_to_advance() {
        let mut cursor = SequentialCursor::at(5);
        let mut snapshot = cursor.read_only();

        assert_eq!(snapshot.advance_to(6), Err(CursorError::ReadOnly));
        assert_eq!(snapshot.advance_by(1), Err(CursorError::ReadOnly));
        assert_eq!(
            snapshot.advance_to(6).unwrap_err().to_string(),
            "Cursor is read-only"
        );

        cursor.advance_to(6).unwrap();
        assert_eq!(snapshot.position(), Some(&5));
    }

    #[test]
    fn advance_by_counts_from_origin() {
        let mut cursor = Cursor::<u64>::new();
        cursor.advance_by(3).unwrap();
        assert_eq!(cursor.position(), Some(&3));
        assert_eq!(cursor.position_after(2), 5);
    }

    #[test]
    fn alphabetical_and_chronological_cursors_use_natural_order() {
        let mut names = AlphabeticalCursor::new();
        names.advance_to("m".to_string()).unwrap();
        assert!(names.has_reached(&"apple".to_string()));
        assert!(!names.has_reached(&"zebra".to_string()));

        let mut times = ChronologicalCursor::new();
        let noon = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        times.advance_to(noon).unwrap();
        assert!(times.has_reached(&Utc.with_ymd_and_hms(2025, 1, 1, 11, 0, 0).unwrap()));
        assert!(!times.has_reached(&Utc.with_ymd_and_hms(2025, 1, 1, 13, 0, 0).unwrap()));
    }

    #[test]
    fn is_behind_treats_start_as_oldest() {
        let start = SequentialCursor::new();
        let five = SequentialCursor::at(5);
        let nine = SequentialCursor::at(9);

        assert!(start.is_behind(&five));
        assert!(five.is_behind(&nine));
        assert!(!nine.is_behind(&five));
        assert!(!five.is_behind(&start));
    }

    #[test]
    fn serialization_drops_read_only_flag() {
        let snapshot = SequentialCursor::at(7).read_only();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: SequentialCursor = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.position(), Some(&7));
        assert!(!restored.is_read_only());
    }

    proptest! {
        #[test]
        fn ascending_cursor_is_monotonic(points in proptest::collection::vec(any::<i64>(), 1..50)) {
            let mut cursor = SequentialCursor::new();
            for point in &points {
                cursor.advance_to(*point).unwrap();
                prop_assert!(cursor.has_reached(point));
            }
            let furthest = *points.iter().max().unwrap();
            prop_assert_eq!(cursor.position(), Some(&furthest));
            if furthest < i64::MAX {
                prop_assert!(!cursor.has_reached(&(furthest + 1)));
            }
        }

        #[test]
        fn fresh_advance_reaches_exactly_the_point(p in any::<i64>(), q in any::<i64>()) {
            let mut cursor = SequentialCursor::new();
            cursor.advance_to(p).unwrap();
            prop_assert!(cursor.has_reached(&p));
            if q > p {
                prop_assert!(!cursor.has_reached(&q));
            }
        }
    }
}
