#![forbid(unsafe_code)]

//! Flattened AST expression evaluation over columnar tables.
//!
//! An expression tree is linearized once into an [`ExpressionPlan`]: a
//! postfix-like operator program with an operand-index stream, a literal
//! array, and pre-assigned intermediate slots. The [`ExpressionEvaluator`]
//! then executes that program once per row triple with one pass, no
//! recursion, and fully monomorphized operator and type dispatch — the
//! shape a one-thread-per-row device kernel relies on, expressed as safe
//! host code.

pub mod evaluator;
pub mod operators;
pub mod plan;

pub use evaluator::{
    compute_column, compute_joined_rows, ColumnSink, ExpressionEvaluator, IntermediateSlot,
    IntermediateStorage, ResultSink, ScalarSink, SlotBits,
};
pub use operators::{is_valid_binary, is_valid_unary, AstOperator, Element, NullEquality};
pub use plan::{
    linearize, DataReference, DataReferenceKind, Expression, ExpressionPlan, PlanError,
    TableReference,
};
