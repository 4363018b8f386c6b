//! Per-row execution of a flattened expression plan.
//!
//! One evaluation is a straight-line pass over the operator program: no
//! recursion, no allocation, no dynamic type checks. Nullability is a
//! compile-time parameter so all-valid data never pays for validity reads,
//! and every (operator, element type) path is monomorphized through
//! [`Element`]. Anything that could fail here has already been rejected by
//! plan validation; the remaining checks are aborts, not errors.

use vf_columnar::{Column, ColumnData, ColumnError, Table, ValidityMask};
use vf_types::{DType, Decimal64, DurationMicros, Scalar, TimestampMicros};

use crate::operators::{AstOperator, Element, NullEquality};
use crate::plan::{DataReference, DataReferenceKind, ExpressionPlan, PlanError, TableReference};

/// Layout compatibility with an 8-byte intermediate slot. Implemented for
/// exactly the dispatchable element types; strings have no slot
/// representation, which is what keeps them out of intermediate storage at
/// compile time.
pub trait SlotBits: Copy {
    fn to_slot_bits(self) -> u64;
    fn from_slot_bits(bits: u64) -> Self;
}

macro_rules! impl_slot_bits_int {
    ($ty:ty) => {
        impl SlotBits for $ty {
            fn to_slot_bits(self) -> u64 {
                self as u64
            }

            fn from_slot_bits(bits: u64) -> Self {
                bits as $ty
            }
        }
    };
}

impl_slot_bits_int!(i8);
impl_slot_bits_int!(i16);
impl_slot_bits_int!(i32);
impl_slot_bits_int!(i64);
impl_slot_bits_int!(u8);
impl_slot_bits_int!(u16);
impl_slot_bits_int!(u32);
impl_slot_bits_int!(u64);

impl SlotBits for f32 {
    fn to_slot_bits(self) -> u64 {
        u64::from(self.to_bits())
    }

    fn from_slot_bits(bits: u64) -> Self {
        Self::from_bits(bits as u32)
    }
}

impl SlotBits for f64 {
    fn to_slot_bits(self) -> u64 {
        self.to_bits()
    }

    fn from_slot_bits(bits: u64) -> Self {
        Self::from_bits(bits)
    }
}

impl SlotBits for bool {
    fn to_slot_bits(self) -> u64 {
        u64::from(self)
    }

    fn from_slot_bits(bits: u64) -> Self {
        bits != 0
    }
}

macro_rules! impl_slot_bits_newtype {
    ($ty:ty) => {
        impl SlotBits for $ty {
            fn to_slot_bits(self) -> u64 {
                self.0 as u64
            }

            fn from_slot_bits(bits: u64) -> Self {
                Self(bits as i64)
            }
        }
    };
}

impl_slot_bits_newtype!(TimestampMicros);
impl_slot_bits_newtype!(DurationMicros);
impl_slot_bits_newtype!(Decimal64);

/// One fixed-size scratch cell: an 8-byte payload plus a validity flag.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntermediateSlot {
    bits: u64,
    valid: bool,
}

/// A worker-private slice of scratch slots. The caller partitions a larger
/// region and hands each evaluator its own slice; contents are undefined at
/// row start and meaningless after row completion.
#[derive(Debug)]
pub struct IntermediateStorage<'a> {
    slots: &'a mut [IntermediateSlot],
}

impl<'a> IntermediateStorage<'a> {
    #[must_use]
    pub fn new(slots: &'a mut [IntermediateSlot]) -> Self {
        Self { slots }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn write<T: SlotBits>(&mut self, slot: usize, value: Option<T>) {
        self.slots[slot] = match value {
            Some(v) => IntermediateSlot {
                bits: v.to_slot_bits(),
                valid: true,
            },
            None => IntermediateSlot {
                bits: 0,
                valid: false,
            },
        };
    }

    #[must_use]
    pub fn read<T: SlotBits>(&self, slot: usize) -> Option<T> {
        let cell = self.slots[slot];
        if !cell.valid {
            return None;
        }
        Some(T::from_slot_bits(cell.bits))
    }
}

/// Monomorphic destination for evaluated results. The generic method keeps
/// dispatch static per call site; there is deliberately no object-safe form
/// of this trait.
pub trait ResultSink {
    fn set_value<T: Element>(&mut self, row: usize, value: Option<T>);
}

/// Owns a single optionally-null value of a fixed element type. The row
/// index handed to `set_value` is ignored; the planner arranges that only
/// one worker evaluates into a scalar sink.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarSink {
    dtype: DType,
    value: Option<Scalar>,
}

impl ScalarSink {
    #[must_use]
    pub fn new(dtype: DType) -> Self {
        Self { dtype, value: None }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }

    #[must_use]
    pub fn value(&self) -> Option<&Scalar> {
        self.value.as_ref()
    }
}

impl ResultSink for ScalarSink {
    fn set_value<T: Element>(&mut self, _row: usize, value: Option<T>) {
        if T::DTYPE != self.dtype {
            panic!(
                "sink dtype mismatch: {:?} result into a {:?} scalar",
                T::DTYPE,
                self.dtype
            );
        }
        self.value = value.map(T::into_scalar);
    }
}

/// Non-owning-style column destination: typed storage plus a validity mask,
/// written one disjoint row per worker, turned into a [`Column`] at the end.
#[derive(Debug)]
pub struct ColumnSink {
    dtype: DType,
    data: ColumnData,
    validity: ValidityMask,
}

impl ColumnSink {
    #[must_use]
    pub fn with_len(dtype: DType, len: usize) -> Self {
        Self {
            dtype,
            data: ColumnData::with_len(dtype, len),
            validity: ValidityMask::all_invalid(len),
        }
    }

    pub fn into_column(self) -> Result<Column, ColumnError> {
        Column::from_parts(self.dtype, self.data, self.validity)
    }
}

impl ResultSink for ColumnSink {
    fn set_value<T: Element>(&mut self, row: usize, value: Option<T>) {
        match value {
            Some(v) => {
                if !T::write(&mut self.data, row, v) {
                    panic!(
                        "sink element type mismatch: {:?} result into a {:?} column",
                        T::DTYPE,
                        self.dtype
                    );
                }
                self.validity.set(row, true);
            }
            None => self.validity.set(row, false),
        }
    }
}

/// Dispatch an element-type tag to its storage type and run `$body` with
/// that type bound to `$t`. Strings never reach this point in a validated
/// plan; hitting the arm is a programmer error.
macro_rules! with_element_type {
    ($dtype:expr, $t:ident => $body:block) => {
        match $dtype {
            DType::Bool => {
                type $t = bool;
                $body
            }
            DType::Int8 => {
                type $t = i8;
                $body
            }
            DType::Int16 => {
                type $t = i16;
                $body
            }
            DType::Int32 => {
                type $t = i32;
                $body
            }
            DType::Int64 => {
                type $t = i64;
                $body
            }
            DType::UInt8 => {
                type $t = u8;
                $body
            }
            DType::UInt16 => {
                type $t = u16;
                $body
            }
            DType::UInt32 => {
                type $t = u32;
                $body
            }
            DType::UInt64 => {
                type $t = u64;
                $body
            }
            DType::Float32 => {
                type $t = f32;
                $body
            }
            DType::Float64 => {
                type $t = f64;
                $body
            }
            DType::TimestampMicros => {
                type $t = TimestampMicros;
                $body
            }
            DType::DurationMicros => {
                type $t = DurationMicros;
                $body
            }
            DType::Decimal64 => {
                type $t = Decimal64;
                $body
            }
            DType::Utf8 => panic!("utf8 elements have no device dispatch path"),
        }
    };
}

fn zip_map<T, U>(lhs: Option<T>, rhs: Option<T>, kernel: impl FnOnce(T, T) -> U) -> Option<U> {
    match (lhs, rhs) {
        (Some(a), Some(b)) => Some(kernel(a, b)),
        _ => None,
    }
}

/// Drives one pass over the operator program per row triple. `HAS_NULLS`
/// selects between the null-aware and the branch-free all-valid
/// specialization at compile time; when it is false no validity bit of any
/// input is inspected.
#[derive(Debug)]
pub struct ExpressionEvaluator<'a, const HAS_NULLS: bool> {
    left: &'a Table,
    right: &'a Table,
    plan: &'a ExpressionPlan,
    storage: IntermediateStorage<'a>,
    null_equality: NullEquality,
}

impl<'a, const HAS_NULLS: bool> ExpressionEvaluator<'a, HAS_NULLS> {
    /// Two-table construction. The storage slice must cover the plan's
    /// intermediate count; undersized storage is a launch configuration
    /// error and aborts.
    #[must_use]
    pub fn new(
        left: &'a Table,
        right: &'a Table,
        plan: &'a ExpressionPlan,
        storage: IntermediateStorage<'a>,
        null_equality: NullEquality,
    ) -> Self {
        assert!(
            storage.len() >= plan.num_intermediates(),
            "intermediate storage holds {} slots but the plan needs {}",
            storage.len(),
            plan.num_intermediates()
        );
        Self {
            left,
            right,
            plan,
            storage,
            null_equality,
        }
    }

    /// Single-table construction: the table serves as both left and right.
    #[must_use]
    pub fn with_table(
        table: &'a Table,
        plan: &'a ExpressionPlan,
        storage: IntermediateStorage<'a>,
        null_equality: NullEquality,
    ) -> Self {
        Self::new(table, table, plan, storage, null_equality)
    }

    /// Evaluate with coinciding input and output alignment.
    pub fn evaluate<S: ResultSink>(&mut self, sink: &mut S, row: usize) {
        self.evaluate_at(sink, row, row, row);
    }

    /// Evaluate one row triple. Operators run in plan order; the
    /// operand-index stream is consumed strictly in order with no branching
    /// over the plan.
    pub fn evaluate_at<S: ResultSink>(
        &mut self,
        sink: &mut S,
        left_row: usize,
        right_row: usize,
        output_row: usize,
    ) {
        let plan = self.plan;
        let indices = plan.operand_indices();
        let mut cursor = 0;
        for position in 0..plan.num_operators() {
            let op = plan.operator(position);
            if op.arity() == 1 {
                let input = plan.data_reference(indices[cursor]);
                let output = plan.data_reference(indices[cursor + 1]);
                cursor += 2;
                with_element_type!(input.dtype, T => {
                    let value = self.resolve::<T>(input, left_row, right_row);
                    self.apply_unary::<S, T>(sink, op, value, output, output_row);
                });
            } else {
                let lhs_ref = plan.data_reference(indices[cursor]);
                let rhs_ref = plan.data_reference(indices[cursor + 1]);
                let output = plan.data_reference(indices[cursor + 2]);
                cursor += 3;
                with_element_type!(lhs_ref.dtype, T => {
                    let lhs = self.resolve::<T>(lhs_ref, left_row, right_row);
                    let rhs = self.resolve::<T>(rhs_ref, left_row, right_row);
                    self.apply_binary::<S, T>(sink, op, lhs, rhs, output, output_row);
                });
            }
        }
    }

    /// Resolve a data reference to a typed, possibly-null value.
    fn resolve<T: Element>(
        &self,
        reference: DataReference,
        left_row: usize,
        right_row: usize,
    ) -> Option<T> {
        match reference.kind {
            DataReferenceKind::Column => {
                let (table, row) = match reference.table {
                    TableReference::Left => (self.left, left_row),
                    TableReference::Right => (self.right, right_row),
                    TableReference::Output => {
                        panic!("output table resolved as an input reference")
                    }
                };
                let column = table.column(reference.index);
                if HAS_NULLS && !column.is_valid(row) {
                    return None;
                }
                Some(column.element::<T>(row))
            }
            DataReferenceKind::Literal => {
                let literal = self.plan.literal(reference.index);
                if HAS_NULLS && literal.is_null() {
                    return None;
                }
                match T::from_scalar(literal) {
                    Some(value) => Some(value),
                    None => panic!(
                        "literal {} does not hold a {:?} element",
                        reference.index,
                        T::DTYPE
                    ),
                }
            }
            DataReferenceKind::Intermediate => self.storage.read::<T>(reference.index),
        }
    }

    /// Hand a typed result to its destination: the sink for the terminal
    /// output, byte-copied scratch for an intermediate.
    fn emit<S: ResultSink, T: Element>(
        &mut self,
        sink: &mut S,
        output: DataReference,
        output_row: usize,
        value: Option<T>,
    ) {
        match output.kind {
            DataReferenceKind::Column => sink.set_value::<T>(output_row, value),
            DataReferenceKind::Intermediate => self.storage.write(output.index, value),
            DataReferenceKind::Literal => panic!("literal reference cannot receive a result"),
        }
    }

    fn apply_unary<S: ResultSink, T: Element>(
        &mut self,
        sink: &mut S,
        op: AstOperator,
        value: Option<T>,
        output: DataReference,
        output_row: usize,
    ) {
        use AstOperator::*;
        match op {
            Identity => self.emit(sink, output, output_row, value),
            Sin => self.emit(sink, output, output_row, value.map(T::sin)),
            Cos => self.emit(sink, output, output_row, value.map(T::cos)),
            Tan => self.emit(sink, output, output_row, value.map(T::tan)),
            ArcSin => self.emit(sink, output, output_row, value.map(T::arcsin)),
            ArcCos => self.emit(sink, output, output_row, value.map(T::arccos)),
            ArcTan => self.emit(sink, output, output_row, value.map(T::arctan)),
            Sinh => self.emit(sink, output, output_row, value.map(T::sinh)),
            Cosh => self.emit(sink, output, output_row, value.map(T::cosh)),
            Tanh => self.emit(sink, output, output_row, value.map(T::tanh)),
            Exp => self.emit(sink, output, output_row, value.map(T::exp)),
            Log => self.emit(sink, output, output_row, value.map(T::log)),
            Sqrt => self.emit(sink, output, output_row, value.map(T::sqrt)),
            Cbrt => self.emit(sink, output, output_row, value.map(T::cbrt)),
            Ceil => self.emit(sink, output, output_row, value.map(T::ceil)),
            Floor => self.emit(sink, output, output_row, value.map(T::floor)),
            Abs => self.emit(sink, output, output_row, value.map(T::abs)),
            Rint => self.emit(sink, output, output_row, value.map(T::rint)),
            BitInvert => self.emit(sink, output, output_row, value.map(T::bit_invert)),
            Not => self.emit(sink, output, output_row, value.map(|v| !v.as_bool())),
            CastToInt64 => self.emit(sink, output, output_row, value.map(T::cast_i64)),
            CastToUInt64 => self.emit(sink, output, output_row, value.map(T::cast_u64)),
            CastToFloat64 => self.emit(sink, output, output_row, value.map(T::cast_f64)),
            other => panic!("operator {other:?} is not unary"),
        }
    }

    fn apply_binary<S: ResultSink, T: Element>(
        &mut self,
        sink: &mut S,
        op: AstOperator,
        lhs: Option<T>,
        rhs: Option<T>,
        output: DataReference,
        output_row: usize,
    ) {
        use AstOperator::*;
        match op {
            Add => self.emit(sink, output, output_row, zip_map(lhs, rhs, T::add)),
            Sub => self.emit(sink, output, output_row, zip_map(lhs, rhs, T::sub)),
            Mul => self.emit(sink, output, output_row, zip_map(lhs, rhs, T::mul)),
            Div => self.emit(sink, output, output_row, zip_map(lhs, rhs, T::div)),
            Mod => self.emit(sink, output, output_row, zip_map(lhs, rhs, T::rem)),
            Pow => self.emit(sink, output, output_row, zip_map(lhs, rhs, T::pow)),
            Equal => {
                let result = self.equal_with_policy(lhs, rhs);
                self.emit(sink, output, output_row, result);
            }
            NullEquals => {
                let result = match (lhs, rhs) {
                    (Some(a), Some(b)) => a == b,
                    (None, None) => true,
                    _ => false,
                };
                self.emit(sink, output, output_row, Some(result));
            }
            NotEqual => self.emit(sink, output, output_row, zip_map(lhs, rhs, |a, b| a != b)),
            Less => self.emit(sink, output, output_row, zip_map(lhs, rhs, |a, b| a < b)),
            Greater => self.emit(sink, output, output_row, zip_map(lhs, rhs, |a, b| a > b)),
            LessEqual => self.emit(sink, output, output_row, zip_map(lhs, rhs, |a, b| a <= b)),
            GreaterEqual => self.emit(sink, output, output_row, zip_map(lhs, rhs, |a, b| a >= b)),
            BitwiseAnd => self.emit(sink, output, output_row, zip_map(lhs, rhs, T::bit_and)),
            BitwiseOr => self.emit(sink, output, output_row, zip_map(lhs, rhs, T::bit_or)),
            BitwiseXor => self.emit(sink, output, output_row, zip_map(lhs, rhs, T::bit_xor)),
            LogicalAnd => self.emit(
                sink,
                output,
                output_row,
                zip_map(lhs, rhs, |a, b| a.as_bool() && b.as_bool()),
            ),
            LogicalOr => self.emit(
                sink,
                output,
                output_row,
                zip_map(lhs, rhs, |a, b| a.as_bool() || b.as_bool()),
            ),
            NullLogicalAnd => {
                // Kleene conjunction: a known false wins over an unknown.
                let result = match (lhs.map(T::as_bool), rhs.map(T::as_bool)) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(a), Some(b)) => Some(a && b),
                    _ => None,
                };
                self.emit(sink, output, output_row, result);
            }
            NullLogicalOr => {
                // Kleene disjunction: a known true wins over an unknown.
                let result = match (lhs.map(T::as_bool), rhs.map(T::as_bool)) {
                    (Some(true), _) | (_, Some(true)) => Some(true),
                    (Some(a), Some(b)) => Some(a || b),
                    _ => None,
                };
                self.emit(sink, output, output_row, result);
            }
            other => panic!("operator {other:?} is not binary"),
        }
    }

    /// Equality under the constructed null-equality policy: two nulls
    /// compare to a present value, a lone null propagates.
    fn equal_with_policy<T: Element>(&self, lhs: Option<T>, rhs: Option<T>) -> Option<bool> {
        match (lhs, rhs) {
            (Some(a), Some(b)) => Some(a == b),
            (None, None) => Some(self.null_equality == NullEquality::Equal),
            _ => None,
        }
    }
}

/// Evaluate a plan over every row of one table, producing a column. The
/// null-aware specialization is selected only when the inputs can actually
/// hold nulls.
pub fn compute_column(
    table: &Table,
    plan: &ExpressionPlan,
    null_equality: NullEquality,
) -> Result<Column, PlanError> {
    plan.validate_for_tables(table, None)?;
    let num_rows = table.num_rows();
    let mut sink = ColumnSink::with_len(plan.output_dtype(), num_rows);
    let mut slots = vec![IntermediateSlot::default(); plan.num_intermediates()];
    if table.may_contain_nulls() || plan.has_null_literals() {
        let mut evaluator = ExpressionEvaluator::<true>::with_table(
            table,
            plan,
            IntermediateStorage::new(&mut slots),
            null_equality,
        );
        for row in 0..num_rows {
            evaluator.evaluate(&mut sink, row);
        }
    } else {
        let mut evaluator = ExpressionEvaluator::<false>::with_table(
            table,
            plan,
            IntermediateStorage::new(&mut slots),
            null_equality,
        );
        for row in 0..num_rows {
            evaluator.evaluate(&mut sink, row);
        }
    }
    Ok(sink.into_column()?)
}

/// Two-table evaluation over explicit `(left_row, right_row)` pairs, as a
/// join would drive it; output row `i` holds the result for pair `i`. Rows
/// must be in range for their tables.
pub fn compute_joined_rows(
    left: &Table,
    right: &Table,
    plan: &ExpressionPlan,
    null_equality: NullEquality,
    pairs: &[(usize, usize)],
) -> Result<Column, PlanError> {
    plan.validate_for_tables(left, Some(right))?;
    let mut sink = ColumnSink::with_len(plan.output_dtype(), pairs.len());
    let mut slots = vec![IntermediateSlot::default(); plan.num_intermediates()];
    if left.may_contain_nulls() || right.may_contain_nulls() || plan.has_null_literals() {
        let mut evaluator = ExpressionEvaluator::<true>::new(
            left,
            right,
            plan,
            IntermediateStorage::new(&mut slots),
            null_equality,
        );
        for (output_row, &(left_row, right_row)) in pairs.iter().enumerate() {
            evaluator.evaluate_at(&mut sink, left_row, right_row, output_row);
        }
    } else {
        let mut evaluator = ExpressionEvaluator::<false>::new(
            left,
            right,
            plan,
            IntermediateStorage::new(&mut slots),
            null_equality,
        );
        for (output_row, &(left_row, right_row)) in pairs.iter().enumerate() {
            evaluator.evaluate_at(&mut sink, left_row, right_row, output_row);
        }
    }
    Ok(sink.into_column()?)
}
