//! Type-erased positions and late-bound cursors.
//!
//! Generic code sometimes needs a cursor before it knows which position type
//! a stream uses (for example when restoring persisted cursors by name).
//! [`PositionValue`] is the closed set of supported position kinds and
//! [`DeferredCursor`] binds to one of them on first use.

use crate::cursor::{Cursor, CursorError};
use crate::guid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

/// A position of any supported kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionValue {
    /// Integer sequence number.
    Sequence(i64),
    /// Timestamp.
    Timestamp(DateTime<Utc>),
    /// String in lexical order.
    Text(String),
    /// GUID in database sort order.
    Guid(Uuid),
}

impl PositionValue {
    /// Human-readable name of this position's kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Sequence(_) => "sequence",
            Self::Timestamp(_) => "timestamp",
            Self::Text(_) => "text",
            Self::Guid(_) => "guid",
        }
    }

    const fn rank(&self) -> u8 {
        match self {
            Self::Sequence(_) => 0,
            Self::Timestamp(_) => 1,
            Self::Text(_) => 2,
            Self::Guid(_) => 3,
        }
    }

    /// Compare two positions of the same kind.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::IncompatiblePosition`] when the kinds differ.
    pub fn try_cmp(&self, other: &Self) -> Result<Ordering, CursorError> {
        match (self, other) {
            (Self::Sequence(a), Self::Sequence(b)) => Ok(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Ok(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Ok(a.cmp(b)),
            (Self::Guid(a), Self::Guid(b)) => Ok(guid::database_order(a, b)),
            _ => Err(CursorError::IncompatiblePosition {
                expected: self.kind(),
                found: other.kind(),
            }),
        }
    }
}

impl Ord for PositionValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.try_cmp(other)
            .unwrap_or_else(|_| self.rank().cmp(&other.rank()))
    }
}

impl PartialOrd for PositionValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<i64> for PositionValue {
    fn from(value: i64) -> Self {
        Self::Sequence(value)
    }
}

impl From<DateTime<Utc>> for PositionValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<String> for PositionValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for PositionValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Uuid> for PositionValue {
    fn from(value: Uuid) -> Self {
        Self::Guid(value)
    }
}

/// A cursor whose position kind is decided by its first use.
///
/// Until bound, the cursor sits at the start of the stream. The first call to
/// [`DeferredCursor::bind`] or [`DeferredCursor::advance_to`] fixes the kind;
/// afterwards every operation is delegated to the bound cursor and positions
/// of another kind are rejected.
#[derive(Clone, Debug, Default)]
pub struct DeferredCursor {
    descending: bool,
    bound: Option<Cursor<PositionValue>>,
}

impl DeferredCursor {
    /// An unbound ascending cursor.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            descending: false,
            bound: None,
        }
    }

    /// An unbound descending cursor.
    #[must_use]
    pub const fn new_descending() -> Self {
        Self {
            descending: true,
            bound: None,
        }
    }

    /// Bind to a concrete cursor, converting its position.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::AlreadyInitialized`] if the cursor is already bound.
    pub fn bind<P>(&mut self, cursor: &Cursor<P>) -> Result<(), CursorError>
    where
        P: crate::cursor::CursorPosition + Into<PositionValue>,
    {
        if self.bound.is_some() {
            return Err(CursorError::AlreadyInitialized);
        }
        let mut erased = match cursor.position() {
            Some(position) => Cursor::at(position.clone().into()),
            None => Cursor::new(),
        };
        if !cursor.ascending() {
            erased = erased.descending();
        }
        self.descending = !cursor.ascending();
        self.bound = Some(erased);
        Ok(())
    }

    /// Whether a position kind has been bound.
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    /// The bound position kind, if any.
    #[must_use]
    pub fn kind(&self) -> Option<&'static str> {
        self.position().map(PositionValue::kind)
    }

    /// Current position.
    #[must_use]
    pub fn position(&self) -> Option<&PositionValue> {
        self.bound.as_ref().and_then(Cursor::position)
    }

    /// Whether the cursor is ascending.
    #[must_use]
    pub const fn ascending(&self) -> bool {
        !self.descending
    }

    /// Advance, binding the position kind if this is the first use.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::IncompatiblePosition`] if `position` is of a
    /// different kind than the bound one.
    pub fn advance_to(&mut self, position: impl Into<PositionValue>) -> Result<(), CursorError> {
        let position = position.into();
        self.check_kind(&position)?;
        let descending = self.descending;
        let cursor = self.bound.get_or_insert_with(|| {
            if descending {
                Cursor::new_descending()
            } else {
                Cursor::new()
            }
        });
        cursor.advance_to(position)
    }

    /// Whether the cursor has reached `point`.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::IncompatiblePosition`] if `point` is of a
    /// different kind than the bound one.
    pub fn has_reached(&self, point: &PositionValue) -> Result<bool, CursorError> {
        self.check_kind(point)?;
        Ok(self
            .bound
            .as_ref()
            .is_some_and(|cursor| cursor.has_reached(point)))
    }

    fn check_kind(&self, candidate: &PositionValue) -> Result<(), CursorError> {
        match self.position() {
            Some(current) if current.kind() != candidate.kind() => {
                Err(CursorError::IncompatiblePosition {
                    expected: current.kind(),
                    found: candidate.kind(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn binds_on_first_advance() {
        let mut cursor = DeferredCursor::new();
        assert!(!cursor.is_bound());

        cursor.advance_to(5_i64).unwrap();
        assert_eq!(cursor.kind(), Some("sequence"));
        assert!(cursor.has_reached(&PositionValue::Sequence(4)).unwrap());
        assert!(!cursor.has_reached(&PositionValue::Sequence(6)).unwrap());
    }

    #[test]
    fn rejects_positions_of_another_kind() {
        let mut cursor = DeferredCursor::new();
        cursor.advance_to("m").unwrap();

        assert_eq!(
            cursor.advance_to(3_i64),
            Err(CursorError::IncompatiblePosition {
                expected: "text",
                found: "sequence",
            })
        );
        assert!(cursor.has_reached(&PositionValue::Sequence(1)).is_err());
    }

    #[test]
    fn rebinding_is_an_error() {
        let mut cursor = DeferredCursor::new();
        cursor.bind(&Cursor::at(10_i64).descending()).unwrap();

        assert!(!cursor.ascending());
        assert_eq!(cursor.position(), Some(&PositionValue::Sequence(10)));
        assert_eq!(
            cursor.bind(&Cursor::<i64>::new()),
            Err(CursorError::AlreadyInitialized)
        );
    }

    #[test]
    fn guid_positions_compare_in_database_order() {
        let low = Uuid::parse_str("ffffffff-ffff-ffff-ffff-000000000001").unwrap();
        let high = Uuid::parse_str("00000000-0000-0000-0000-000000000002").unwrap();

        assert_eq!(
            PositionValue::Guid(low).try_cmp(&PositionValue::Guid(high)),
            Ok(Ordering::Less)
        );
    }
}
