#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Microseconds since the Unix epoch.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TimestampMicros(pub i64);

/// A signed span of microseconds.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DurationMicros(pub i64);

/// Fixed-point decimal held as scaled `i64` units. The scale lives in the
/// surrounding schema; two decimals may only meet in an operation when the
/// planner has already given them the same scale.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Decimal64(pub i64);

impl fmt::Display for TimestampMicros {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

impl fmt::Display for DurationMicros {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Closed element-type enumeration. Every tag has exactly one representative
/// storage type; the cross-product of operators and tags is enumerated at
/// build time, never discovered at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    TimestampMicros,
    DurationMicros,
    Decimal64,
    Utf8,
}

impl DType {
    /// Fixed storage width of one element, `None` for variable-width strings.
    #[must_use]
    pub fn size_bytes(self) -> Option<usize> {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => Some(1),
            Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Float32 => Some(4),
            Self::Int64
            | Self::UInt64
            | Self::Float64
            | Self::TimestampMicros
            | Self::DurationMicros
            | Self::Decimal64 => Some(8),
            Self::Utf8 => None,
        }
    }

    #[must_use]
    pub fn is_integral(self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::Int16
                | Self::Int32
                | Self::Int64
                | Self::UInt8
                | Self::UInt16
                | Self::UInt32
                | Self::UInt64
        )
    }

    #[must_use]
    pub fn is_signed_integral(self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    #[must_use]
    pub fn is_floating(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    #[must_use]
    pub fn is_numeric(self) -> bool {
        self.is_integral() || self.is_floating()
    }

    /// Whether a value of this type fits an 8-byte intermediate slot.
    /// Strings never do; everything else in the closed set does.
    #[must_use]
    pub fn fits_intermediate(self) -> bool {
        matches!(self.size_bytes(), Some(size) if size <= 8)
    }
}

/// A boxed value for literal arrays and scalar results. A null still carries
/// its element type so the plan can type-check references to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Null(DType),
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    TimestampMicros(TimestampMicros),
    DurationMicros(DurationMicros),
    Decimal64(Decimal64),
    Utf8(String),
}

impl Scalar {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Null(dtype) => *dtype,
            Self::Bool(_) => DType::Bool,
            Self::Int8(_) => DType::Int8,
            Self::Int16(_) => DType::Int16,
            Self::Int32(_) => DType::Int32,
            Self::Int64(_) => DType::Int64,
            Self::UInt8(_) => DType::UInt8,
            Self::UInt16(_) => DType::UInt16,
            Self::UInt32(_) => DType::UInt32,
            Self::UInt64(_) => DType::UInt64,
            Self::Float32(_) => DType::Float32,
            Self::Float64(_) => DType::Float64,
            Self::TimestampMicros(_) => DType::TimestampMicros,
            Self::DurationMicros(_) => DType::DurationMicros,
            Self::Decimal64(_) => DType::Decimal64,
            Self::Utf8(_) => DType::Utf8,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("scalar of dtype {found:?} cannot populate a {expected:?} column")]
    ScalarDtypeMismatch { expected: DType, found: DType },
}
