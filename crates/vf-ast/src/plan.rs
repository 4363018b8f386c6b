//! Flattened expression plans and the linearizer that builds them.
//!
//! The evaluator never sees a nested expression: nesting is flattened here
//! into an operator sequence plus an operand-index stream, with every
//! invariant checked up front so the per-row path carries no dynamic checks.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vf_columnar::{ColumnError, Table};
use vf_types::{DType, Scalar};

use crate::operators::AstOperator;

/// Which table a column reference reads from. `Output` only ever appears on
/// the terminal output reference; as an input it is a plan defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableReference {
    Left,
    Right,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataReferenceKind {
    Column,
    Literal,
    Intermediate,
}

/// Tagged descriptor naming the source (or destination) of one operand:
/// a table column, a plan literal, or an intermediate slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataReference {
    pub kind: DataReferenceKind,
    pub dtype: DType,
    pub index: usize,
    pub table: TableReference,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan holds no operators")]
    EmptyPlan,
    #[error("operand-index stream length {found} does not match the expected {expected}")]
    OperandStreamLength { expected: usize, found: usize },
    #[error("operand index {index} points past the data-reference table (len {count})")]
    DanglingReference { index: usize, count: usize },
    #[error("literal index {index} points past the literal array (len {count})")]
    LiteralOutOfRange { index: usize, count: usize },
    #[error("literal {index} has dtype {found:?} but is referenced as {expected:?}")]
    LiteralDtypeMismatch {
        index: usize,
        expected: DType,
        found: DType,
    },
    #[error("intermediate index {index} exceeds the slot count {count}")]
    IntermediateOutOfRange { index: usize, count: usize },
    #[error("intermediate slot {index} is read before any operator writes it")]
    IntermediateReadBeforeWrite { index: usize },
    #[error("dtype {dtype:?} does not fit an 8-byte intermediate slot")]
    OversizedIntermediate { dtype: DType },
    #[error("an input reference names the output table")]
    InputFromOutputTable,
    #[error("operator {op:?} received mismatched operand types {left:?} and {right:?}")]
    MismatchedOperandTypes {
        op: AstOperator,
        left: DType,
        right: DType,
    },
    #[error("unary operator {op:?} is not defined for {operand:?}")]
    InvalidUnaryOperation { op: AstOperator, operand: DType },
    #[error("binary operator {op:?} is not defined for {operand:?}")]
    InvalidBinaryOperation { op: AstOperator, operand: DType },
    #[error("operator {position} writes to the output column but is not the terminal operator")]
    NonTerminalColumnOutput { position: usize },
    #[error("the terminal operator must write to the output column")]
    MissingTerminalOutput,
    #[error("a column output reference must name the output table")]
    TerminalTableNotOutput,
    #[error("a literal reference cannot be an output")]
    LiteralAsOutput,
    #[error("operator result dtype {found:?} does not match its output reference {expected:?}")]
    OutputDtypeMismatch { expected: DType, found: DType },
    #[error("the plan references the right table but none was provided")]
    MissingRightTable,
    #[error("column {index} is out of range for the {table:?} table ({count} columns)")]
    ColumnOutOfRange {
        table: TableReference,
        index: usize,
        count: usize,
    },
    #[error("column {index} of the {table:?} table is {found:?} but referenced as {expected:?}")]
    ColumnDtypeMismatch {
        table: TableReference,
        index: usize,
        expected: DType,
        found: DType,
    },
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// The immutable flattened program the evaluator executes: literal array,
/// data-reference table, operator sequence, and the operand-index stream
/// supplying (arity) inputs plus one output per operator, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionPlan {
    literals: Vec<Scalar>,
    data_references: Vec<DataReference>,
    operators: Vec<AstOperator>,
    operand_indices: Vec<usize>,
    num_intermediates: usize,
    output_dtype: DType,
}

impl ExpressionPlan {
    /// Assemble a plan from raw parts and validate it. Intended for plans
    /// produced by external planners; [`linearize`] is the in-crate path.
    pub fn from_parts(
        literals: Vec<Scalar>,
        data_references: Vec<DataReference>,
        operators: Vec<AstOperator>,
        operand_indices: Vec<usize>,
        num_intermediates: usize,
        output_dtype: DType,
    ) -> Result<Self, PlanError> {
        let plan = Self {
            literals,
            data_references,
            operators,
            operand_indices,
            num_intermediates,
            output_dtype,
        };
        plan.validate()?;
        Ok(plan)
    }

    #[must_use]
    pub fn literals(&self) -> &[Scalar] {
        &self.literals
    }

    #[must_use]
    pub fn literal(&self, index: usize) -> &Scalar {
        &self.literals[index]
    }

    #[must_use]
    pub fn has_null_literals(&self) -> bool {
        self.literals.iter().any(Scalar::is_null)
    }

    #[must_use]
    pub fn data_references(&self) -> &[DataReference] {
        &self.data_references
    }

    #[must_use]
    pub fn data_reference(&self, index: usize) -> DataReference {
        self.data_references[index]
    }

    #[must_use]
    pub fn operators(&self) -> &[AstOperator] {
        &self.operators
    }

    #[must_use]
    pub fn num_operators(&self) -> usize {
        self.operators.len()
    }

    #[must_use]
    pub fn operator(&self, position: usize) -> AstOperator {
        self.operators[position]
    }

    #[must_use]
    pub fn operand_indices(&self) -> &[usize] {
        &self.operand_indices
    }

    #[must_use]
    pub fn num_intermediates(&self) -> usize {
        self.num_intermediates
    }

    #[must_use]
    pub fn output_dtype(&self) -> DType {
        self.output_dtype
    }

    /// Re-check every structural invariant of a well-formed plan. The
    /// evaluator relies on this having passed; it performs none of these
    /// checks per row.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.operators.is_empty() {
            return Err(PlanError::EmptyPlan);
        }
        let expected: usize = self.operators.iter().map(|op| op.arity() + 1).sum();
        if self.operand_indices.len() != expected {
            return Err(PlanError::OperandStreamLength {
                expected,
                found: self.operand_indices.len(),
            });
        }
        for &index in &self.operand_indices {
            if index >= self.data_references.len() {
                return Err(PlanError::DanglingReference {
                    index,
                    count: self.data_references.len(),
                });
            }
        }

        let terminal = self.operators.len() - 1;
        let mut written = vec![false; self.num_intermediates];
        let mut cursor = 0;
        for (position, &op) in self.operators.iter().enumerate() {
            let arity = op.arity();
            let inputs = &self.operand_indices[cursor..cursor + arity];
            let output = self.data_references[self.operand_indices[cursor + arity]];
            cursor += arity + 1;

            for &input_index in inputs {
                let input = self.data_references[input_index];
                match input.kind {
                    DataReferenceKind::Column => {
                        if input.table == TableReference::Output {
                            return Err(PlanError::InputFromOutputTable);
                        }
                    }
                    DataReferenceKind::Literal => {
                        if input.index >= self.literals.len() {
                            return Err(PlanError::LiteralOutOfRange {
                                index: input.index,
                                count: self.literals.len(),
                            });
                        }
                        let found = self.literals[input.index].dtype();
                        if found != input.dtype {
                            return Err(PlanError::LiteralDtypeMismatch {
                                index: input.index,
                                expected: input.dtype,
                                found,
                            });
                        }
                    }
                    DataReferenceKind::Intermediate => {
                        if input.index >= self.num_intermediates {
                            return Err(PlanError::IntermediateOutOfRange {
                                index: input.index,
                                count: self.num_intermediates,
                            });
                        }
                        if !input.dtype.fits_intermediate() {
                            return Err(PlanError::OversizedIntermediate { dtype: input.dtype });
                        }
                        if !written[input.index] {
                            return Err(PlanError::IntermediateReadBeforeWrite {
                                index: input.index,
                            });
                        }
                    }
                }
            }

            let operand = self.data_references[inputs[0]].dtype;
            let result = if arity == 1 {
                op.result_dtype(operand)
                    .ok_or(PlanError::InvalidUnaryOperation { op, operand })?
            } else {
                let right = self.data_references[inputs[1]].dtype;
                if operand != right {
                    return Err(PlanError::MismatchedOperandTypes {
                        op,
                        left: operand,
                        right,
                    });
                }
                op.result_dtype(operand)
                    .ok_or(PlanError::InvalidBinaryOperation { op, operand })?
            };

            match output.kind {
                DataReferenceKind::Column => {
                    if position != terminal {
                        return Err(PlanError::NonTerminalColumnOutput { position });
                    }
                    if output.table != TableReference::Output {
                        return Err(PlanError::TerminalTableNotOutput);
                    }
                    if output.dtype != result || output.dtype != self.output_dtype {
                        return Err(PlanError::OutputDtypeMismatch {
                            expected: output.dtype,
                            found: result,
                        });
                    }
                }
                DataReferenceKind::Intermediate => {
                    if position == terminal {
                        return Err(PlanError::MissingTerminalOutput);
                    }
                    if output.index >= self.num_intermediates {
                        return Err(PlanError::IntermediateOutOfRange {
                            index: output.index,
                            count: self.num_intermediates,
                        });
                    }
                    if !output.dtype.fits_intermediate() {
                        return Err(PlanError::OversizedIntermediate { dtype: output.dtype });
                    }
                    if output.dtype != result {
                        return Err(PlanError::OutputDtypeMismatch {
                            expected: output.dtype,
                            found: result,
                        });
                    }
                    written[output.index] = true;
                }
                DataReferenceKind::Literal => return Err(PlanError::LiteralAsOutput),
            }
        }
        Ok(())
    }

    /// Validate the plan against the concrete tables it will read: column
    /// ordinals in range and column dtypes matching their references.
    pub fn validate_for_tables(
        &self,
        left: &Table,
        right: Option<&Table>,
    ) -> Result<(), PlanError> {
        self.validate()?;
        for reference in &self.data_references {
            if reference.kind != DataReferenceKind::Column
                || reference.table == TableReference::Output
            {
                continue;
            }
            let table = match reference.table {
                TableReference::Left => left,
                TableReference::Right => right.ok_or(PlanError::MissingRightTable)?,
                TableReference::Output => unreachable!(),
            };
            if reference.index >= table.num_columns() {
                return Err(PlanError::ColumnOutOfRange {
                    table: reference.table,
                    index: reference.index,
                    count: table.num_columns(),
                });
            }
            let found = table.column(reference.index).dtype();
            if found != reference.dtype {
                return Err(PlanError::ColumnDtypeMismatch {
                    table: reference.table,
                    index: reference.index,
                    expected: reference.dtype,
                    found,
                });
            }
        }
        Ok(())
    }
}

/// A nested expression tree, the planner-facing input. [`linearize`]
/// flattens it; the evaluator never walks it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Expression {
    ColumnRef {
        table: TableReference,
        index: usize,
    },
    Literal {
        value: Scalar,
    },
    Unary {
        op: AstOperator,
        operand: Box<Expression>,
    },
    Binary {
        op: AstOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
}

impl Expression {
    #[must_use]
    pub fn column(table: TableReference, index: usize) -> Self {
        Self::ColumnRef { table, index }
    }

    #[must_use]
    pub fn literal(value: Scalar) -> Self {
        Self::Literal { value }
    }

    #[must_use]
    pub fn unary(op: AstOperator, operand: Self) -> Self {
        Self::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    #[must_use]
    pub fn binary(op: AstOperator, left: Self, right: Self) -> Self {
        Self::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn is_operation(&self) -> bool {
        matches!(self, Self::Unary { .. } | Self::Binary { .. })
    }
}

struct Linearizer<'a> {
    left: &'a [DType],
    right: Option<&'a [DType]>,
    literals: Vec<Scalar>,
    data_references: Vec<DataReference>,
    operators: Vec<AstOperator>,
    operand_indices: Vec<usize>,
    next_intermediate: usize,
}

impl Linearizer<'_> {
    fn add_reference(&mut self, reference: DataReference) -> usize {
        if let Some(position) = self
            .data_references
            .iter()
            .position(|existing| *existing == reference)
        {
            return position;
        }
        self.data_references.push(reference);
        self.data_references.len() - 1
    }

    fn output_reference(
        &mut self,
        dtype: DType,
        is_root: bool,
    ) -> Result<DataReference, PlanError> {
        if is_root {
            return Ok(DataReference {
                kind: DataReferenceKind::Column,
                dtype,
                index: 0,
                table: TableReference::Output,
            });
        }
        if !dtype.fits_intermediate() {
            return Err(PlanError::OversizedIntermediate { dtype });
        }
        let index = self.next_intermediate;
        self.next_intermediate += 1;
        Ok(DataReference {
            kind: DataReferenceKind::Intermediate,
            dtype,
            index,
            table: TableReference::Left,
        })
    }

    fn lower(&mut self, expr: &Expression, is_root: bool) -> Result<DataReference, PlanError> {
        match expr {
            Expression::ColumnRef { table, index } => {
                let schema = match table {
                    TableReference::Left => self.left,
                    TableReference::Right => self.right.ok_or(PlanError::MissingRightTable)?,
                    TableReference::Output => return Err(PlanError::InputFromOutputTable),
                };
                let dtype = *schema.get(*index).ok_or(PlanError::ColumnOutOfRange {
                    table: *table,
                    index: *index,
                    count: schema.len(),
                })?;
                Ok(DataReference {
                    kind: DataReferenceKind::Column,
                    dtype,
                    index: *index,
                    table: *table,
                })
            }
            Expression::Literal { value } => {
                let index = match self.literals.iter().position(|l| l == value) {
                    Some(position) => position,
                    None => {
                        self.literals.push(value.clone());
                        self.literals.len() - 1
                    }
                };
                Ok(DataReference {
                    kind: DataReferenceKind::Literal,
                    dtype: value.dtype(),
                    index,
                    table: TableReference::Left,
                })
            }
            Expression::Unary { op, operand } => {
                let input = self.lower(operand, false)?;
                let result = op
                    .result_dtype(input.dtype)
                    .ok_or(PlanError::InvalidUnaryOperation {
                        op: *op,
                        operand: input.dtype,
                    })?;
                let output = self.output_reference(result, is_root)?;
                let input_index = self.add_reference(input);
                let output_index = self.add_reference(output);
                self.operators.push(*op);
                self.operand_indices.extend([input_index, output_index]);
                Ok(output)
            }
            Expression::Binary { op, left, right } => {
                let lhs = self.lower(left, false)?;
                let rhs = self.lower(right, false)?;
                if lhs.dtype != rhs.dtype {
                    return Err(PlanError::MismatchedOperandTypes {
                        op: *op,
                        left: lhs.dtype,
                        right: rhs.dtype,
                    });
                }
                let result = op
                    .result_dtype(lhs.dtype)
                    .ok_or(PlanError::InvalidBinaryOperation {
                        op: *op,
                        operand: lhs.dtype,
                    })?;
                let output = self.output_reference(result, is_root)?;
                let lhs_index = self.add_reference(lhs);
                let rhs_index = self.add_reference(rhs);
                let output_index = self.add_reference(output);
                self.operators.push(*op);
                self.operand_indices
                    .extend([lhs_index, rhs_index, output_index]);
                Ok(output)
            }
        }
    }
}

/// Flatten a nested expression into an executable plan. Postorder over the
/// tree assigns intermediate slots so every slot is written before any
/// operator reads it; the terminal operator alone writes the output column.
/// Binary operands must already share one dtype (promotion is a planner
/// concern that happens before this point).
///
/// A bare column reference or literal is routed through `Identity` so the
/// plan always holds at least one operator.
pub fn linearize(
    expr: &Expression,
    left: &[DType],
    right: Option<&[DType]>,
) -> Result<ExpressionPlan, PlanError> {
    let mut linearizer = Linearizer {
        left,
        right,
        literals: Vec::new(),
        data_references: Vec::new(),
        operators: Vec::new(),
        operand_indices: Vec::new(),
        next_intermediate: 0,
    };

    let terminal = if expr.is_operation() {
        linearizer.lower(expr, true)?
    } else {
        let input = linearizer.lower(expr, false)?;
        let result = AstOperator::Identity.result_dtype(input.dtype).ok_or(
            PlanError::InvalidUnaryOperation {
                op: AstOperator::Identity,
                operand: input.dtype,
            },
        )?;
        let output = linearizer.output_reference(result, true)?;
        let input_index = linearizer.add_reference(input);
        let output_index = linearizer.add_reference(output);
        linearizer.operators.push(AstOperator::Identity);
        linearizer.operand_indices.extend([input_index, output_index]);
        output
    };

    let plan = ExpressionPlan {
        literals: linearizer.literals,
        data_references: linearizer.data_references,
        operators: linearizer.operators,
        operand_indices: linearizer.operand_indices,
        num_intermediates: linearizer.next_intermediate,
        output_dtype: terminal.dtype,
    };
    plan.validate()?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use vf_types::{DType, Scalar};

    use super::{
        linearize, DataReference, DataReferenceKind, Expression, ExpressionPlan, PlanError,
        TableReference,
    };
    use crate::operators::AstOperator;

    fn column(index: usize) -> Expression {
        Expression::column(TableReference::Left, index)
    }

    #[test]
    fn linearize_single_binary_operator() {
        let expr = Expression::binary(AstOperator::Add, column(0), column(0));
        let plan = linearize(&expr, &[DType::Int64], None).expect("plan");

        assert_eq!(plan.operators(), &[AstOperator::Add]);
        assert_eq!(plan.num_intermediates(), 0);
        assert_eq!(plan.output_dtype(), DType::Int64);
        // Both inputs collapse onto one deduplicated reference.
        assert_eq!(plan.data_references().len(), 2);
        assert_eq!(plan.operand_indices(), &[0, 0, 1]);
        let output = plan.data_reference(1);
        assert_eq!(output.kind, DataReferenceKind::Column);
        assert_eq!(output.table, TableReference::Output);
    }

    #[test]
    fn linearize_nested_expression_assigns_intermediates_in_order() {
        // (a + b) * c - d: two intermediates, three operators, terminal last.
        let expr = Expression::binary(
            AstOperator::Sub,
            Expression::binary(
                AstOperator::Mul,
                Expression::binary(AstOperator::Add, column(0), column(1)),
                column(2),
            ),
            column(3),
        );
        let schema = [DType::Int64; 4];
        let plan = linearize(&expr, &schema, None).expect("plan");

        assert_eq!(
            plan.operators(),
            &[AstOperator::Add, AstOperator::Mul, AstOperator::Sub]
        );
        assert_eq!(plan.num_intermediates(), 2);
        assert_eq!(plan.operand_indices().len(), 9);
        // The first operator writes slot 0, the second reads it.
        let first_output = plan.data_reference(plan.operand_indices()[2]);
        assert_eq!(first_output.kind, DataReferenceKind::Intermediate);
        assert_eq!(first_output.index, 0);
        let second_lhs = plan.data_reference(plan.operand_indices()[3]);
        assert_eq!(second_lhs, first_output);
    }

    #[test]
    fn linearize_wraps_bare_column_in_identity() {
        let plan = linearize(&column(0), &[DType::Float64], None).expect("plan");
        assert_eq!(plan.operators(), &[AstOperator::Identity]);
        assert_eq!(plan.output_dtype(), DType::Float64);
    }

    #[test]
    fn linearize_deduplicates_literals() {
        let expr = Expression::binary(
            AstOperator::Add,
            Expression::binary(
                AstOperator::Add,
                column(0),
                Expression::literal(Scalar::Int64(2)),
            ),
            Expression::literal(Scalar::Int64(2)),
        );
        let plan = linearize(&expr, &[DType::Int64], None).expect("plan");
        assert_eq!(plan.literals(), &[Scalar::Int64(2)]);
    }

    #[test]
    fn linearize_rejects_mismatched_binary_operands() {
        let expr = Expression::binary(AstOperator::Add, column(0), column(1));
        let err = linearize(&expr, &[DType::Int64, DType::Float64], None).expect_err("reject");
        assert_eq!(
            err,
            PlanError::MismatchedOperandTypes {
                op: AstOperator::Add,
                left: DType::Int64,
                right: DType::Float64,
            }
        );
    }

    #[test]
    fn linearize_rejects_invalid_operator_type_pairs() {
        let expr = Expression::unary(AstOperator::Sin, column(0));
        let err = linearize(&expr, &[DType::Int32], None).expect_err("reject");
        assert_eq!(
            err,
            PlanError::InvalidUnaryOperation {
                op: AstOperator::Sin,
                operand: DType::Int32,
            }
        );
    }

    #[test]
    fn linearize_rejects_string_columns() {
        let err = linearize(&column(0), &[DType::Utf8], None).expect_err("reject");
        assert!(matches!(err, PlanError::InvalidUnaryOperation { .. }));
    }

    #[test]
    fn linearize_rejects_right_reference_without_right_schema() {
        let expr = Expression::binary(
            AstOperator::Add,
            column(0),
            Expression::column(TableReference::Right, 0),
        );
        let err = linearize(&expr, &[DType::Int64], None).expect_err("reject");
        assert_eq!(err, PlanError::MissingRightTable);
    }

    #[test]
    fn linearize_rejects_output_table_input() {
        let expr = Expression::column(TableReference::Output, 0);
        let err = linearize(&expr, &[DType::Int64], None).expect_err("reject");
        assert_eq!(err, PlanError::InputFromOutputTable);
    }

    #[test]
    fn linearize_rejects_out_of_range_column() {
        let err = linearize(&column(3), &[DType::Int64], None).expect_err("reject");
        assert!(matches!(err, PlanError::ColumnOutOfRange { index: 3, .. }));
    }

    fn intermediate(dtype: DType, index: usize) -> DataReference {
        DataReference {
            kind: DataReferenceKind::Intermediate,
            dtype,
            index,
            table: TableReference::Left,
        }
    }

    fn terminal_output(dtype: DType) -> DataReference {
        DataReference {
            kind: DataReferenceKind::Column,
            dtype,
            index: 0,
            table: TableReference::Output,
        }
    }

    fn left_column(dtype: DType, index: usize) -> DataReference {
        DataReference {
            kind: DataReferenceKind::Column,
            dtype,
            index,
            table: TableReference::Left,
        }
    }

    #[test]
    fn validate_rejects_read_before_write() {
        // ADD reads slot 0 that nothing wrote.
        let err = ExpressionPlan::from_parts(
            Vec::new(),
            vec![
                intermediate(DType::Int64, 0),
                left_column(DType::Int64, 0),
                terminal_output(DType::Int64),
            ],
            vec![AstOperator::Add],
            vec![0, 1, 2],
            1,
            DType::Int64,
        )
        .expect_err("reject");
        assert_eq!(err, PlanError::IntermediateReadBeforeWrite { index: 0 });
    }

    #[test]
    fn validate_rejects_short_operand_stream() {
        let err = ExpressionPlan::from_parts(
            Vec::new(),
            vec![left_column(DType::Int64, 0), terminal_output(DType::Int64)],
            vec![AstOperator::Add],
            vec![0, 0],
            0,
            DType::Int64,
        )
        .expect_err("reject");
        assert_eq!(
            err,
            PlanError::OperandStreamLength {
                expected: 3,
                found: 2,
            }
        );
    }

    #[test]
    fn validate_rejects_dangling_operand_index() {
        let err = ExpressionPlan::from_parts(
            Vec::new(),
            vec![left_column(DType::Int64, 0), terminal_output(DType::Int64)],
            vec![AstOperator::Identity],
            vec![5, 1],
            0,
            DType::Int64,
        )
        .expect_err("reject");
        assert_eq!(err, PlanError::DanglingReference { index: 5, count: 2 });
    }

    #[test]
    fn validate_rejects_non_terminal_column_output() {
        let err = ExpressionPlan::from_parts(
            Vec::new(),
            vec![
                left_column(DType::Int64, 0),
                terminal_output(DType::Int64),
                intermediate(DType::Int64, 0),
            ],
            vec![AstOperator::Identity, AstOperator::Identity],
            vec![0, 1, 0, 2],
            1,
            DType::Int64,
        )
        .expect_err("reject");
        assert_eq!(err, PlanError::NonTerminalColumnOutput { position: 0 });
    }

    #[test]
    fn validate_rejects_terminal_intermediate() {
        let err = ExpressionPlan::from_parts(
            Vec::new(),
            vec![left_column(DType::Int64, 0), intermediate(DType::Int64, 0)],
            vec![AstOperator::Identity],
            vec![0, 1],
            1,
            DType::Int64,
        )
        .expect_err("reject");
        assert_eq!(err, PlanError::MissingTerminalOutput);
    }

    #[test]
    fn validate_rejects_literal_dtype_disagreement() {
        let literal_ref = DataReference {
            kind: DataReferenceKind::Literal,
            dtype: DType::Int64,
            index: 0,
            table: TableReference::Left,
        };
        let err = ExpressionPlan::from_parts(
            vec![Scalar::Float64(1.0)],
            vec![literal_ref, terminal_output(DType::Int64)],
            vec![AstOperator::Identity],
            vec![0, 1],
            0,
            DType::Int64,
        )
        .expect_err("reject");
        assert!(matches!(err, PlanError::LiteralDtypeMismatch { .. }));
    }

    #[test]
    fn null_literal_keeps_plan_well_typed() {
        let expr = Expression::binary(
            AstOperator::Add,
            column(0),
            Expression::literal(Scalar::Null(DType::Int64)),
        );
        let plan = linearize(&expr, &[DType::Int64], None).expect("plan");
        assert!(plan.has_null_literals());
    }

    #[test]
    fn plan_serde_round_trip() {
        let expr = Expression::binary(
            AstOperator::Mul,
            Expression::unary(AstOperator::Abs, column(0)),
            Expression::literal(Scalar::Int64(-3)),
        );
        let plan = linearize(&expr, &[DType::Int64], None).expect("plan");
        let json = serde_json::to_string(&plan).expect("serialize");
        let back: ExpressionPlan = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(plan, back);
        back.validate().expect("still valid");
    }
}
