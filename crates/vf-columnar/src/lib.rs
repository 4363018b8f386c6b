#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vf_types::{DType, Decimal64, DurationMicros, Scalar, TimestampMicros, TypeError};

/// Bit-packed per-row validity. A set bit means the row holds a real value;
/// a clear bit means the row is null and its storage slot is a sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidityMask {
    words: Vec<u64>,
    len: usize,
}

impl ValidityMask {
    #[must_use]
    pub fn all_valid(len: usize) -> Self {
        let word_count = len.div_ceil(64);
        let mut words = vec![u64::MAX; word_count];
        let remainder = len % 64;
        if remainder > 0 && !words.is_empty() {
            let last = words.len() - 1;
            words[last] = (1_u64 << remainder) - 1;
        }
        Self { words, len }
    }

    #[must_use]
    pub fn all_invalid(len: usize) -> Self {
        let word_count = len.div_ceil(64);
        Self {
            words: vec![0_u64; word_count],
            len,
        }
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        (self.words[idx / 64] >> (idx % 64)) & 1 == 1
    }

    pub fn set(&mut self, idx: usize, valid: bool) {
        if idx >= self.len {
            return;
        }
        if valid {
            self.words[idx / 64] |= 1_u64 << (idx % 64);
        } else {
            self.words[idx / 64] &= !(1_u64 << (idx % 64));
        }
    }

    #[must_use]
    pub fn count_valid(&self) -> usize {
        let full_words = self.len / 64;
        let mut count: u32 = self.words[..full_words]
            .iter()
            .map(|w| w.count_ones())
            .sum();
        let remainder = self.len % 64;
        if remainder > 0 && full_words < self.words.len() {
            let mask = (1_u64 << remainder) - 1;
            count += (self.words[full_words] & mask).count_ones();
        }
        count as usize
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bits(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(|idx| self.get(idx))
    }
}

impl Serialize for ValidityMask {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let bits: Vec<bool> = self.bits().collect();
        let mut state = serializer.serialize_struct("ValidityMask", 1)?;
        state.serialize_field("bits", &bits)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ValidityMask {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            bits: Vec<bool>,
        }
        let raw = Raw::deserialize(deserializer)?;
        let mut mask = Self::all_invalid(raw.bits.len());
        for (idx, &valid) in raw.bits.iter().enumerate() {
            if valid {
                mask.set(idx, true);
            }
        }
        Ok(mask)
    }
}

/// Typed contiguous storage, one variant per representative storage type.
/// Null rows hold sentinel values; the paired `ValidityMask` decides which
/// rows are real.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "snake_case")]
pub enum ColumnData {
    Bool(Vec<bool>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    TimestampMicros(Vec<TimestampMicros>),
    DurationMicros(Vec<DurationMicros>),
    Decimal64(Vec<Decimal64>),
    Utf8(Vec<String>),
}

macro_rules! data_dispatch {
    ($data:expr, $values:ident => $body:expr) => {
        match $data {
            ColumnData::Bool($values) => $body,
            ColumnData::Int8($values) => $body,
            ColumnData::Int16($values) => $body,
            ColumnData::Int32($values) => $body,
            ColumnData::Int64($values) => $body,
            ColumnData::UInt8($values) => $body,
            ColumnData::UInt16($values) => $body,
            ColumnData::UInt32($values) => $body,
            ColumnData::UInt64($values) => $body,
            ColumnData::Float32($values) => $body,
            ColumnData::Float64($values) => $body,
            ColumnData::TimestampMicros($values) => $body,
            ColumnData::DurationMicros($values) => $body,
            ColumnData::Decimal64($values) => $body,
            ColumnData::Utf8($values) => $body,
        }
    };
}

macro_rules! collect_scalars {
    ($values:expr, $dtype:expr, $variant:ident) => {{
        let mut out = Vec::with_capacity($values.len());
        for value in $values {
            match value {
                Scalar::$variant(v) => out.push(v.clone()),
                Scalar::Null(_) => out.push(Default::default()),
                other => {
                    return Err(TypeError::ScalarDtypeMismatch {
                        expected: $dtype,
                        found: other.dtype(),
                    })
                }
            }
        }
        ColumnData::$variant(out)
    }};
}

impl ColumnData {
    /// Allocate sentinel-filled storage for `len` rows of `dtype`.
    #[must_use]
    pub fn with_len(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::Bool => Self::Bool(vec![false; len]),
            DType::Int8 => Self::Int8(vec![0; len]),
            DType::Int16 => Self::Int16(vec![0; len]),
            DType::Int32 => Self::Int32(vec![0; len]),
            DType::Int64 => Self::Int64(vec![0; len]),
            DType::UInt8 => Self::UInt8(vec![0; len]),
            DType::UInt16 => Self::UInt16(vec![0; len]),
            DType::UInt32 => Self::UInt32(vec![0; len]),
            DType::UInt64 => Self::UInt64(vec![0; len]),
            DType::Float32 => Self::Float32(vec![0.0; len]),
            DType::Float64 => Self::Float64(vec![0.0; len]),
            DType::TimestampMicros => {
                Self::TimestampMicros(vec![TimestampMicros::default(); len])
            }
            DType::DurationMicros => Self::DurationMicros(vec![DurationMicros::default(); len]),
            DType::Decimal64 => Self::Decimal64(vec![Decimal64::default(); len]),
            DType::Utf8 => Self::Utf8(vec![String::new(); len]),
        }
    }

    /// Materialize typed storage from boxed scalars. Nulls become sentinels;
    /// a scalar whose dtype disagrees with the target is rejected.
    pub fn from_scalars(dtype: DType, values: &[Scalar]) -> Result<Self, TypeError> {
        let data = match dtype {
            DType::Bool => collect_scalars!(values, dtype, Bool),
            DType::Int8 => collect_scalars!(values, dtype, Int8),
            DType::Int16 => collect_scalars!(values, dtype, Int16),
            DType::Int32 => collect_scalars!(values, dtype, Int32),
            DType::Int64 => collect_scalars!(values, dtype, Int64),
            DType::UInt8 => collect_scalars!(values, dtype, UInt8),
            DType::UInt16 => collect_scalars!(values, dtype, UInt16),
            DType::UInt32 => collect_scalars!(values, dtype, UInt32),
            DType::UInt64 => collect_scalars!(values, dtype, UInt64),
            DType::Float32 => collect_scalars!(values, dtype, Float32),
            DType::Float64 => collect_scalars!(values, dtype, Float64),
            DType::TimestampMicros => collect_scalars!(values, dtype, TimestampMicros),
            DType::DurationMicros => collect_scalars!(values, dtype, DurationMicros),
            DType::Decimal64 => collect_scalars!(values, dtype, Decimal64),
            DType::Utf8 => collect_scalars!(values, dtype, Utf8),
        };
        Ok(data)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
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
    pub fn len(&self) -> usize {
        data_dispatch!(self, values => values.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn scalar_at(&self, row: usize) -> Scalar {
        match self {
            Self::Bool(values) => Scalar::Bool(values[row]),
            Self::Int8(values) => Scalar::Int8(values[row]),
            Self::Int16(values) => Scalar::Int16(values[row]),
            Self::Int32(values) => Scalar::Int32(values[row]),
            Self::Int64(values) => Scalar::Int64(values[row]),
            Self::UInt8(values) => Scalar::UInt8(values[row]),
            Self::UInt16(values) => Scalar::UInt16(values[row]),
            Self::UInt32(values) => Scalar::UInt32(values[row]),
            Self::UInt64(values) => Scalar::UInt64(values[row]),
            Self::Float32(values) => Scalar::Float32(values[row]),
            Self::Float64(values) => Scalar::Float64(values[row]),
            Self::TimestampMicros(values) => Scalar::TimestampMicros(values[row]),
            Self::DurationMicros(values) => Scalar::DurationMicros(values[row]),
            Self::Decimal64(values) => Scalar::Decimal64(values[row]),
            Self::Utf8(values) => Scalar::Utf8(values[row].clone()),
        }
    }
}

/// Ties a Rust storage type to its element-type tag. This is the
/// compile-time dispatch seam: the evaluator is only ever instantiated for
/// types implementing this trait, so unsupported element types cannot reach
/// the hot path.
pub trait ColumnElement: Clone {
    const DTYPE: DType;

    /// Typed read from column storage; `None` when the storage variant does
    /// not match `Self`.
    fn read(data: &ColumnData, row: usize) -> Option<Self>;

    /// Typed write into column storage; `false` when the storage variant
    /// does not match `Self`.
    fn write(data: &mut ColumnData, row: usize, value: Self) -> bool;

    fn from_scalar(scalar: &Scalar) -> Option<Self>;

    fn into_scalar(self) -> Scalar;
}

macro_rules! impl_column_element {
    ($ty:ty, $variant:ident) => {
        impl ColumnElement for $ty {
            const DTYPE: DType = DType::$variant;

            fn read(data: &ColumnData, row: usize) -> Option<Self> {
                match data {
                    ColumnData::$variant(values) => Some(values[row].clone()),
                    _ => None,
                }
            }

            fn write(data: &mut ColumnData, row: usize, value: Self) -> bool {
                match data {
                    ColumnData::$variant(values) => {
                        values[row] = value;
                        true
                    }
                    _ => false,
                }
            }

            fn from_scalar(scalar: &Scalar) -> Option<Self> {
                match scalar {
                    Scalar::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }

            fn into_scalar(self) -> Scalar {
                Scalar::$variant(self)
            }
        }
    };
}

impl_column_element!(bool, Bool);
impl_column_element!(i8, Int8);
impl_column_element!(i16, Int16);
impl_column_element!(i32, Int32);
impl_column_element!(i64, Int64);
impl_column_element!(u8, UInt8);
impl_column_element!(u16, UInt16);
impl_column_element!(u32, UInt32);
impl_column_element!(u64, UInt64);
impl_column_element!(f32, Float32);
impl_column_element!(f64, Float64);
impl_column_element!(TimestampMicros, TimestampMicros);
impl_column_element!(DurationMicros, DurationMicros);
impl_column_element!(Decimal64, Decimal64);
impl_column_element!(String, Utf8);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ColumnError {
    #[error("column length mismatch: expected {expected}, found {found}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("storage of dtype {found:?} cannot back a {expected:?} column")]
    StorageDtypeMismatch { expected: DType, found: DType },
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// A typed column: contiguous storage plus validity. The typed element
/// accessor is the read path the evaluator uses; the scalar accessors exist
/// for construction and assertions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    dtype: DType,
    data: ColumnData,
    validity: ValidityMask,
}

impl Column {
    pub fn from_parts(
        dtype: DType,
        data: ColumnData,
        validity: ValidityMask,
    ) -> Result<Self, ColumnError> {
        if data.dtype() != dtype {
            return Err(ColumnError::StorageDtypeMismatch {
                expected: dtype,
                found: data.dtype(),
            });
        }
        if data.len() != validity.len() {
            return Err(ColumnError::LengthMismatch {
                expected: data.len(),
                found: validity.len(),
            });
        }
        Ok(Self {
            dtype,
            data,
            validity,
        })
    }

    pub fn from_scalars(dtype: DType, values: &[Scalar]) -> Result<Self, ColumnError> {
        let data = ColumnData::from_scalars(dtype, values)?;
        let mut validity = ValidityMask::all_valid(values.len());
        for (row, value) in values.iter().enumerate() {
            if value.is_null() {
                validity.set(row, false);
            }
        }
        Self::from_parts(dtype, data, validity)
    }

    /// Typed fixture constructor; `None` entries become nulls.
    #[must_use]
    pub fn from_options<T: ColumnElement>(values: Vec<Option<T>>) -> Self {
        let mut data = ColumnData::with_len(T::DTYPE, values.len());
        let mut validity = ValidityMask::all_invalid(values.len());
        for (row, value) in values.into_iter().enumerate() {
            if let Some(v) = value {
                T::write(&mut data, row, v);
                validity.set(row, true);
            }
        }
        Self {
            dtype: T::DTYPE,
            data,
            validity,
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn is_valid(&self, row: usize) -> bool {
        self.validity.get(row)
    }

    #[must_use]
    pub fn validity(&self) -> &ValidityMask {
        &self.validity
    }

    #[must_use]
    pub fn null_count(&self) -> usize {
        self.len() - self.validity.count_valid()
    }

    /// Raw typed element read. Does not consult validity; the caller decides
    /// whether the mask matters. Requesting a type that disagrees with the
    /// storage is a programmer error and aborts.
    #[must_use]
    pub fn element<T: ColumnElement>(&self, row: usize) -> T {
        match T::read(&self.data, row) {
            Some(value) => value,
            None => panic!(
                "element type mismatch: requested {:?} from {:?} storage",
                T::DTYPE,
                self.dtype
            ),
        }
    }

    /// Validity-aware typed read: `None` for null rows.
    #[must_use]
    pub fn get<T: ColumnElement>(&self, row: usize) -> Option<T> {
        if !self.validity.get(row) {
            return None;
        }
        Some(self.element::<T>(row))
    }

    #[must_use]
    pub fn scalar_at(&self, row: usize) -> Scalar {
        if !self.validity.get(row) {
            return Scalar::Null(self.dtype);
        }
        self.data.scalar_at(row)
    }

    #[must_use]
    pub fn to_scalars(&self) -> Vec<Scalar> {
        (0..self.len()).map(|row| self.scalar_at(row)).collect()
    }
}

/// An ordered collection of equal-length columns. This is the table view the
/// evaluator reads: `column(i)` plus per-row validity, nothing more.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Result<Self, ColumnError> {
        if let Some(first) = columns.first() {
            for column in &columns[1..] {
                if column.len() != first.len() {
                    return Err(ColumnError::LengthMismatch {
                        expected: first.len(),
                        found: column.len(),
                    });
                }
            }
        }
        Ok(Self { columns })
    }

    #[must_use]
    pub fn column(&self, idx: usize) -> &Column {
        &self.columns[idx]
    }

    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }

    #[must_use]
    pub fn may_contain_nulls(&self) -> bool {
        self.columns.iter().any(|column| column.null_count() > 0)
    }
}

#[cfg(test)]
mod tests {
    use vf_types::{DType, Decimal64, Scalar, TimestampMicros};

    use super::{Column, ColumnData, ColumnError, Table, ValidityMask};

    #[test]
    fn validity_mask_all_valid_and_invalid() {
        let valid = ValidityMask::all_valid(100);
        assert_eq!(valid.count_valid(), 100);
        let invalid = ValidityMask::all_invalid(100);
        assert_eq!(invalid.count_valid(), 0);
    }

    #[test]
    fn validity_mask_set_and_get_across_word_boundary() {
        let mut mask = ValidityMask::all_invalid(130);
        mask.set(0, true);
        mask.set(63, true);
        mask.set(64, true);
        mask.set(129, true);
        assert!(mask.get(0));
        assert!(mask.get(63));
        assert!(mask.get(64));
        assert!(mask.get(129));
        assert!(!mask.get(1));
        assert_eq!(mask.count_valid(), 4);

        mask.set(64, false);
        assert!(!mask.get(64));
        assert_eq!(mask.count_valid(), 3);
    }

    #[test]
    fn validity_mask_out_of_range_reads_false() {
        let mask = ValidityMask::all_valid(3);
        assert!(!mask.get(3));
        assert!(!mask.get(100));
    }

    #[test]
    fn validity_mask_empty() {
        let mask = ValidityMask::all_invalid(0);
        assert!(mask.is_empty());
        assert_eq!(mask.bits().count(), 0);
    }

    #[test]
    fn validity_mask_serde_round_trip() {
        let mut mask = ValidityMask::all_valid(5);
        mask.set(2, false);
        let json = serde_json::to_string(&mask).expect("serialize");
        assert!(json.contains("\"bits\""));
        let back: ValidityMask = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(mask, back);
    }

    #[test]
    fn column_from_scalars_tracks_nulls() {
        let column = Column::from_scalars(
            DType::Int64,
            &[
                Scalar::Int64(1),
                Scalar::Null(DType::Int64),
                Scalar::Int64(3),
            ],
        )
        .expect("column");
        assert_eq!(column.len(), 3);
        assert_eq!(column.null_count(), 1);
        assert!(column.is_valid(0));
        assert!(!column.is_valid(1));
        assert_eq!(column.element::<i64>(0), 1);
        assert_eq!(column.get::<i64>(1), None);
        assert_eq!(column.get::<i64>(2), Some(3));
    }

    #[test]
    fn column_from_scalars_rejects_mismatched_dtype() {
        let err = Column::from_scalars(DType::Int64, &[Scalar::Float64(1.0)])
            .expect_err("must reject");
        assert!(matches!(err, ColumnError::Type(_)));
    }

    #[test]
    fn column_from_options_round_trips_through_scalars() {
        let column = Column::from_options(vec![Some(1.5_f64), None, Some(-2.0)]);
        assert_eq!(column.dtype(), DType::Float64);
        assert_eq!(
            column.to_scalars(),
            vec![
                Scalar::Float64(1.5),
                Scalar::Null(DType::Float64),
                Scalar::Float64(-2.0),
            ]
        );
    }

    #[test]
    fn column_supports_newtype_elements() {
        let column = Column::from_options(vec![
            Some(TimestampMicros(10)),
            Some(TimestampMicros(20)),
            None,
        ]);
        assert_eq!(column.dtype(), DType::TimestampMicros);
        assert_eq!(column.get::<TimestampMicros>(1), Some(TimestampMicros(20)));
        assert_eq!(column.get::<TimestampMicros>(2), None);
    }

    #[test]
    fn column_from_parts_rejects_storage_mismatch() {
        let data = ColumnData::with_len(DType::Int32, 2);
        let err = Column::from_parts(DType::Int64, data, ValidityMask::all_valid(2))
            .expect_err("must reject");
        assert!(matches!(err, ColumnError::StorageDtypeMismatch { .. }));
    }

    #[test]
    fn column_from_parts_rejects_length_mismatch() {
        let data = ColumnData::with_len(DType::Int64, 2);
        let err = Column::from_parts(DType::Int64, data, ValidityMask::all_valid(3))
            .expect_err("must reject");
        assert!(matches!(err, ColumnError::LengthMismatch { .. }));
    }

    #[test]
    #[should_panic(expected = "element type mismatch")]
    fn element_access_with_wrong_type_aborts() {
        let column = Column::from_options(vec![Some(1_i64)]);
        let _ = column.element::<f64>(0);
    }

    #[test]
    fn decimal_column_scalar_round_trip() {
        let column = Column::from_scalars(
            DType::Decimal64,
            &[Scalar::Decimal64(Decimal64(1099)), Scalar::Null(DType::Decimal64)],
        )
        .expect("column");
        assert_eq!(column.scalar_at(0), Scalar::Decimal64(Decimal64(1099)));
        assert_eq!(column.scalar_at(1), Scalar::Null(DType::Decimal64));
    }

    #[test]
    fn table_rejects_ragged_columns() {
        let a = Column::from_options(vec![Some(1_i64), Some(2)]);
        let b = Column::from_options(vec![Some(1.0_f64)]);
        let err = Table::new(vec![a, b]).expect_err("must reject");
        assert!(matches!(err, ColumnError::LengthMismatch { .. }));
    }

    #[test]
    fn table_reports_shape_and_nulls() {
        let a = Column::from_options(vec![Some(1_i64), Some(2)]);
        let b = Column::from_options(vec![Some(1.0_f64), None]);
        let table = Table::new(vec![a, b]).expect("table");
        assert_eq!(table.num_columns(), 2);
        assert_eq!(table.num_rows(), 2);
        assert!(table.may_contain_nulls());

        let all_valid = Table::new(vec![Column::from_options(vec![Some(true), Some(false)])])
            .expect("table");
        assert!(!all_valid.may_contain_nulls());
    }

    #[test]
    fn empty_table_has_zero_rows() {
        let table = Table::new(Vec::new()).expect("table");
        assert_eq!(table.num_rows(), 0);
        assert_eq!(table.num_columns(), 0);
        assert!(!table.may_contain_nulls());
    }

    #[test]
    fn column_serde_round_trip() {
        let column = Column::from_options(vec![Some(7_i32), None, Some(-1)]);
        let json = serde_json::to_string(&column).expect("serialize");
        let back: Column = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(column, back);
    }
}
