//! Order-preserving mapping between GUIDs and 128-bit integers.
//!
//! SQL Server sorts `uniqueidentifier` values by byte group, starting with the
//! trailing six "node" bytes and ending with the first group. To partition a
//! GUID key space so that partitions line up with index ranges in the
//! database, GUIDs are mapped onto integers in that same order.
//!
//! The signed mapping ([`to_big_integer`]) places GUIDs whose most significant
//! byte has the high bit set below zero. [`sortify`] shifts those values above
//! every non-negative one, producing an unsigned value whose natural order is
//! the database order; [`unsortify`] reverses it.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Indices into the RFC 4122 byte layout, from most to least significant in
/// database sort order.
const SIGNIFICANCE: [usize; 16] = [10, 11, 12, 13, 14, 15, 8, 9, 7, 6, 5, 4, 3, 2, 1, 0];

/// Map a GUID to a signed integer in database sort order.
#[must_use]
pub fn to_big_integer(guid: &Uuid) -> i128 {
    let bytes = guid.as_bytes();
    let mut ordered = [0_u8; 16];
    for (slot, index) in ordered.iter_mut().zip(SIGNIFICANCE) {
        *slot = bytes[index];
    }
    i128::from_be_bytes(ordered)
}

/// Inverse of [`to_big_integer`].
#[must_use]
pub fn to_guid(value: i128) -> Uuid {
    let ordered = value.to_be_bytes();
    let mut bytes = [0_u8; 16];
    for (byte, index) in ordered.iter().zip(SIGNIFICANCE) {
        bytes[index] = *byte;
    }
    Uuid::from_bytes(bytes)
}

/// Shift negative values above all non-negative ones (wraparound at 2^127).
#[must_use]
pub const fn sortify(value: i128) -> u128 {
    u128::from_be_bytes(value.to_be_bytes())
}

/// Inverse of [`sortify`].
#[must_use]
pub const fn unsortify(value: u128) -> i128 {
    i128::from_be_bytes(value.to_be_bytes())
}

/// Map a GUID to an unsigned integer whose natural order is database order.
#[must_use]
pub fn to_ordinal(guid: &Uuid) -> u128 {
    sortify(to_big_integer(guid))
}

/// Inverse of [`to_ordinal`].
#[must_use]
pub fn from_ordinal(ordinal: u128) -> Uuid {
    to_guid(unsortify(ordinal))
}

/// Compare two GUIDs the way the database orders them.
#[must_use]
pub fn database_order(a: &Uuid, b: &Uuid) -> Ordering {
    to_ordinal(a).cmp(&to_ordinal(b))
}

/// A GUID ordered the way the database orders it.
///
/// Use this as the bound type of GUID range partitions so that membership
/// tests agree with the database's index order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqlGuid(pub Uuid);

impl SqlGuid {
    /// The smallest GUID in database order.
    pub const MIN: Self = Self(Uuid::nil());

    /// The largest GUID in database order.
    pub const MAX: Self = Self(Uuid::from_u128(u128::MAX));

    /// The wrapped GUID.
    #[must_use]
    pub const fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Ord for SqlGuid {
    fn cmp(&self, other: &Self) -> Ordering {
        database_order(&self.0, &other.0)
    }
}

impl PartialOrd for SqlGuid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<Uuid> for SqlGuid {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for SqlGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
