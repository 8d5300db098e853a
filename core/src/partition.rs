//! Partitions: disjoint slices of a key domain used to split work.
//!
//! A [`RangePartition`] covers `(lower, upper]` (lower bound exclusive, upper
//! bound inclusive) so that adjacent ranges share a boundary value without
//! overlapping. A [`ValuePartition`] covers a single discrete value.
//!
//! # Example
//!
//! ```
//! use alluvial_core::partition;
//!
//! let whole = partition::by_range(0_i32, 100).unwrap();
//! let parts = whole.among(3).unwrap();
//!
//! assert_eq!(parts.len(), 3);
//! assert_eq!(parts[0].lower_bound_exclusive(), &0);
//! assert_eq!(parts[2].upper_bound_inclusive(), &100);
//! assert_eq!(parts[0].upper_bound_inclusive(), parts[1].lower_bound_exclusive());
//! ```

use crate::guid::{self, SqlGuid};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while building or splitting partitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    /// `by_range` was called with `lower >= upper`.
    #[error("The lower bound ({lower}) must be less than the upper bound ({upper}).")]
    InvalidBounds {
        /// Requested lower bound.
        lower: String,
        /// Requested upper bound.
        upper: String,
    },

    /// `among(0)` was requested.
    #[error("A partition cannot be split among zero partitions.")]
    ZeroPartitions,

    /// The range is too narrow to give every partition at least one value.
    #[error("The range ({lower}, {upper}] cannot be split among {count} non-empty partitions.")]
    TooManyPartitions {
        /// Lower bound of the range being split.
        lower: String,
        /// Upper bound of the range being split.
        upper: String,
        /// Requested number of partitions.
        count: usize,
    },
}

/// A named slice of work.
///
/// The name identifies the partition in lease pools, stream ids and cursor
/// stores, so it must be stable and unique among a pool's partitions.
pub trait Partition: fmt::Debug + Send + Sync {
    /// Stable name of this partition.
    fn name(&self) -> String;
}

/// Types that can bound a range partition.
pub trait PartitionBound: Ord + Clone + fmt::Display + fmt::Debug + Send + Sync + 'static {}

impl<T> PartitionBound for T where T: Ord + Clone + fmt::Display + fmt::Debug + Send + Sync + 'static {}

/// Domains that can be split into evenly sized ranges.
///
/// Values map onto `u128` ordinals preserving order, which lets one splitting
/// algorithm serve every integer width and GUIDs.
pub trait Splittable: PartitionBound {
    /// Order-preserving map into `u128`.
    fn to_ordinal(&self) -> u128;

    /// Inverse of [`Splittable::to_ordinal`].
    fn from_ordinal(ordinal: u128) -> Self;
}

const SIGN_BIT: u128 = 1 << 127;

macro_rules! impl_splittable_signed {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Splittable for $ty {
                fn to_ordinal(&self) -> u128 {
                    guid::sortify(i128::from(*self)) ^ SIGN_BIT
                }

                #[allow(clippy::cast_possible_truncation)]
                fn from_ordinal(ordinal: u128) -> Self {
                    guid::unsortify(ordinal ^ SIGN_BIT) as $ty
                }
            }
        )*
    };
}

macro_rules! impl_splittable_unsigned {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Splittable for $ty {
                fn to_ordinal(&self) -> u128 {
                    u128::from(*self)
                }

                #[allow(clippy::cast_possible_truncation)]
                fn from_ordinal(ordinal: u128) -> Self {
                    ordinal as $ty
                }
            }
        )*
    };
}

impl_splittable_signed!(i32, i64, i128);
impl_splittable_unsigned!(u32, u64, u128);

impl Splittable for SqlGuid {
    fn to_ordinal(&self) -> u128 {
        guid::to_ordinal(&self.0)
    }

    fn from_ordinal(ordinal: u128) -> Self {
        Self(guid::from_ordinal(ordinal))
    }
}

/// A partition covering `(lower_bound_exclusive, upper_bound_inclusive]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangePartition<T> {
    lower_bound_exclusive: T,
    upper_bound_inclusive: T,
}

impl<T: PartitionBound> RangePartition<T> {
    /// Lower bound; values equal to it fall outside the partition.
    #[must_use]
    pub const fn lower_bound_exclusive(&self) -> &T {
        &self.lower_bound_exclusive
    }

    /// Upper bound; values equal to it fall inside the partition.
    #[must_use]
    pub const fn upper_bound_inclusive(&self) -> &T {
        &self.upper_bound_inclusive
    }

    /// Whether `value` falls within this partition.
    #[must_use]
    pub fn contains(&self, value: &T) -> bool {
        value > &self.lower_bound_exclusive && value <= &self.upper_bound_inclusive
    }
}

impl<T: Splittable> RangePartition<T> {
    /// Split into `count` gapless, non-overlapping partitions.
    ///
    /// When the span does not divide evenly, the trailing partitions are one
    /// value wider than the leading ones. Adjacent partitions always share a
    /// boundary, the first starts at this partition's lower bound and the last
    /// ends at its upper bound.
    ///
    /// # Errors
    ///
    /// Returns [`PartitionError::ZeroPartitions`] for `count == 0` and
    /// [`PartitionError::TooManyPartitions`] when the span is smaller than
    /// `count`.
    pub fn among(&self, count: usize) -> Result<Vec<Self>, PartitionError> {
        if count == 0 {
            return Err(PartitionError::ZeroPartitions);
        }

        let lower = self.lower_bound_exclusive.to_ordinal();
        let upper = self.upper_bound_inclusive.to_ordinal();
        let span = upper - lower;
        let parts = count as u128;

        if parts > span {
            return Err(PartitionError::TooManyPartitions {
                lower: self.lower_bound_exclusive.to_string(),
                upper: self.upper_bound_inclusive.to_string(),
                count,
            });
        }

        let width = span / parts;
        let remainder = span % parts;
        let widened_from = parts - remainder;

        let mut partitions = Vec::with_capacity(count);
        let mut boundary = lower;
        for index in 0..parts {
            let size = if index >= widened_from { width + 1 } else { width };
            let next = boundary + size;
            partitions.push(Self {
                lower_bound_exclusive: T::from_ordinal(boundary),
                upper_bound_inclusive: T::from_ordinal(next),
            });
            boundary = next;
        }

        Ok(partitions)
    }
}

impl<T: PartitionBound> fmt::Display for RangePartition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}..{}]",
            self.lower_bound_exclusive, self.upper_bound_inclusive
        )
    }
}

impl<T: PartitionBound> Partition for RangePartition<T> {
    fn name(&self) -> String {
        self.to_string()
    }
}

/// A partition covering exactly one value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValuePartition<T> {
    value: T,
}

impl<T: PartitionBound> ValuePartition<T> {
    /// The value this partition covers.
    #[must_use]
    pub const fn value(&self) -> &T {
        &self.value
    }

    /// Whether `value` is this partition's value.
    #[must_use]
    pub fn contains(&self, value: &T) -> bool {
        &self.value == value
    }
}

impl<T: PartitionBound> fmt::Display for ValuePartition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

impl<T: PartitionBound> Partition for ValuePartition<T> {
    fn name(&self) -> String {
        self.to_string()
    }
}

/// Build a range partition covering `(lower, upper]`.
///
/// # Errors
///
/// Returns [`PartitionError::InvalidBounds`] if `lower >= upper`.
pub fn by_range<T: PartitionBound>(lower: T, upper: T) -> Result<RangePartition<T>, PartitionError> {
    if lower >= upper {
        return Err(PartitionError::InvalidBounds {
            lower: lower.to_string(),
            upper: upper.to_string(),
        });
    }
    Ok(RangePartition {
        lower_bound_exclusive: lower,
        upper_bound_inclusive: upper,
    })
}

/// Build a partition covering a single value.
#[must_use]
pub const fn by_value<T: PartitionBound>(value: T) -> ValuePartition<T> {
    ValuePartition { value }
}
