//! The closed operator set and the per-element kernels behind it.
//!
//! Both enumerations here are fixed at build time. The evaluator
//! monomorphizes the (operator, element type) cross-product through the
//! [`Element`] trait; combinations outside the validity matrix fall through
//! to kernels that abort, and plan construction guarantees those kernels are
//! never reached.

use serde::{Deserialize, Serialize};
use vf_columnar::ColumnElement;
use vf_types::{DType, Decimal64, DurationMicros, TimestampMicros};

use crate::evaluator::SlotBits;

/// Operator codes. Arity is fixed per code: the `Identity`..`CastToFloat64`
/// range is unary, everything after is binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AstOperator {
    Identity,
    Sin,
    Cos,
    Tan,
    ArcSin,
    ArcCos,
    ArcTan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Log,
    Sqrt,
    Cbrt,
    Ceil,
    Floor,
    Abs,
    Rint,
    BitInvert,
    Not,
    CastToInt64,
    CastToUInt64,
    CastToFloat64,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Equal,
    NullEquals,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    LogicalAnd,
    LogicalOr,
    NullLogicalAnd,
    NullLogicalOr,
}

impl AstOperator {
    /// Number of operands the operator consumes: 1 or 2.
    #[must_use]
    pub fn arity(self) -> usize {
        use AstOperator::*;
        match self {
            Identity | Sin | Cos | Tan | ArcSin | ArcCos | ArcTan | Sinh | Cosh | Tanh | Exp
            | Log | Sqrt | Cbrt | Ceil | Floor | Abs | Rint | BitInvert | Not | CastToInt64
            | CastToUInt64 | CastToFloat64 => 1,
            _ => 2,
        }
    }

    /// Result element type of the operator applied at `operand`, or `None`
    /// when the (operator, type) pairing is outside the validity matrix.
    #[must_use]
    pub fn result_dtype(self, operand: DType) -> Option<DType> {
        use AstOperator::*;
        let valid = if self.arity() == 1 {
            is_valid_unary(self, operand)
        } else {
            is_valid_binary(self, operand)
        };
        if !valid {
            return None;
        }
        let out = match self {
            Identity | Sin | Cos | Tan | ArcSin | ArcCos | ArcTan | Sinh | Cosh | Tanh | Exp
            | Log | Sqrt | Cbrt | Ceil | Floor | Abs | Rint | BitInvert => operand,
            Not => DType::Bool,
            CastToInt64 => DType::Int64,
            CastToUInt64 => DType::UInt64,
            CastToFloat64 => DType::Float64,
            Add | Sub | Mul | Div | Mod | Pow | BitwiseAnd | BitwiseOr | BitwiseXor => operand,
            Equal | NullEquals | NotEqual | Less | Greater | LessEqual | GreaterEqual
            | LogicalAnd | LogicalOr | NullLogicalAnd | NullLogicalOr => DType::Bool,
        };
        Some(out)
    }
}

/// Validity trait for unary operators: which element types have a kernel.
#[must_use]
pub fn is_valid_unary(op: AstOperator, operand: DType) -> bool {
    use AstOperator::*;
    match op {
        Identity => operand.fits_intermediate(),
        Sin | Cos | Tan | ArcSin | ArcCos | ArcTan | Sinh | Cosh | Tanh | Exp | Log | Sqrt
        | Cbrt | Ceil | Floor | Rint => operand.is_floating(),
        Abs => operand.is_floating() || operand.is_signed_integral(),
        Not => operand == DType::Bool,
        BitInvert => operand.is_integral(),
        CastToInt64 | CastToUInt64 | CastToFloat64 => {
            operand == DType::Bool || operand.is_numeric()
        }
        _ => false,
    }
}

/// Validity trait for binary operators. The evaluator performs single-type
/// dispatch, so one operand type describes the pair.
#[must_use]
pub fn is_valid_binary(op: AstOperator, operand: DType) -> bool {
    use AstOperator::*;
    match op {
        Add | Sub => {
            operand.is_numeric()
                || matches!(operand, DType::DurationMicros | DType::Decimal64)
        }
        Mul | Div | Mod | Pow => operand.is_numeric(),
        Equal | NullEquals | NotEqual | Less | Greater | LessEqual | GreaterEqual => {
            operand.fits_intermediate()
        }
        BitwiseAnd | BitwiseOr | BitwiseXor => operand.is_integral(),
        LogicalAnd | LogicalOr | NullLogicalAnd | NullLogicalOr => operand == DType::Bool,
        _ => false,
    }
}

/// Caller-configured interpretation of `null == null` for the `Equal`
/// operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullEquality {
    Equal,
    Unequal,
}

fn no_kernel<C: ColumnElement, R>(op: &str) -> R {
    panic!("operator {op} has no kernel for {:?} elements", C::DTYPE)
}

/// A dispatchable element type: column-addressable, slot-representable, and
/// totally ordered enough for the comparison family. Kernel defaults abort;
/// each storage type overrides exactly the kernels its validity matrix row
/// allows, so a well-formed plan never reaches a default body.
pub trait Element: ColumnElement + SlotBits + Copy + PartialEq + PartialOrd {
    fn add(self, _rhs: Self) -> Self {
        no_kernel::<Self, Self>("ADD")
    }
    fn sub(self, _rhs: Self) -> Self {
        no_kernel::<Self, Self>("SUB")
    }
    fn mul(self, _rhs: Self) -> Self {
        no_kernel::<Self, Self>("MUL")
    }
    fn div(self, _rhs: Self) -> Self {
        no_kernel::<Self, Self>("DIV")
    }
    fn rem(self, _rhs: Self) -> Self {
        no_kernel::<Self, Self>("MOD")
    }
    fn pow(self, _rhs: Self) -> Self {
        no_kernel::<Self, Self>("POW")
    }
    fn sin(self) -> Self {
        no_kernel::<Self, Self>("SIN")
    }
    fn cos(self) -> Self {
        no_kernel::<Self, Self>("COS")
    }
    fn tan(self) -> Self {
        no_kernel::<Self, Self>("TAN")
    }
    fn arcsin(self) -> Self {
        no_kernel::<Self, Self>("ARCSIN")
    }
    fn arccos(self) -> Self {
        no_kernel::<Self, Self>("ARCCOS")
    }
    fn arctan(self) -> Self {
        no_kernel::<Self, Self>("ARCTAN")
    }
    fn sinh(self) -> Self {
        no_kernel::<Self, Self>("SINH")
    }
    fn cosh(self) -> Self {
        no_kernel::<Self, Self>("COSH")
    }
    fn tanh(self) -> Self {
        no_kernel::<Self, Self>("TANH")
    }
    fn exp(self) -> Self {
        no_kernel::<Self, Self>("EXP")
    }
    fn log(self) -> Self {
        no_kernel::<Self, Self>("LOG")
    }
    fn sqrt(self) -> Self {
        no_kernel::<Self, Self>("SQRT")
    }
    fn cbrt(self) -> Self {
        no_kernel::<Self, Self>("CBRT")
    }
    fn ceil(self) -> Self {
        no_kernel::<Self, Self>("CEIL")
    }
    fn floor(self) -> Self {
        no_kernel::<Self, Self>("FLOOR")
    }
    fn abs(self) -> Self {
        no_kernel::<Self, Self>("ABS")
    }
    fn rint(self) -> Self {
        no_kernel::<Self, Self>("RINT")
    }
    fn bit_invert(self) -> Self {
        no_kernel::<Self, Self>("BIT_INVERT")
    }
    fn bit_and(self, _rhs: Self) -> Self {
        no_kernel::<Self, Self>("BITWISE_AND")
    }
    fn bit_or(self, _rhs: Self) -> Self {
        no_kernel::<Self, Self>("BITWISE_OR")
    }
    fn bit_xor(self, _rhs: Self) -> Self {
        no_kernel::<Self, Self>("BITWISE_XOR")
    }
    fn as_bool(self) -> bool {
        no_kernel::<Self, bool>("NOT/LOGICAL")
    }
    fn cast_i64(self) -> i64 {
        no_kernel::<Self, i64>("CAST_TO_INT64")
    }
    fn cast_u64(self) -> u64 {
        no_kernel::<Self, u64>("CAST_TO_UINT64")
    }
    fn cast_f64(self) -> f64 {
        no_kernel::<Self, f64>("CAST_TO_FLOAT64")
    }
}

// Integer arithmetic wraps; division and remainder by zero (and the
// MIN / -1 overflow case) are value-defined as 0 rather than signaling.
macro_rules! integral_kernels {
    () => {
        fn add(self, rhs: Self) -> Self {
            self.wrapping_add(rhs)
        }
        fn sub(self, rhs: Self) -> Self {
            self.wrapping_sub(rhs)
        }
        fn mul(self, rhs: Self) -> Self {
            self.wrapping_mul(rhs)
        }
        fn div(self, rhs: Self) -> Self {
            self.checked_div(rhs).unwrap_or(0)
        }
        fn rem(self, rhs: Self) -> Self {
            self.checked_rem(rhs).unwrap_or(0)
        }
        fn pow(self, rhs: Self) -> Self {
            self.wrapping_pow(u32::try_from(rhs).unwrap_or(0))
        }
        fn bit_invert(self) -> Self {
            !self
        }
        fn bit_and(self, rhs: Self) -> Self {
            self & rhs
        }
        fn bit_or(self, rhs: Self) -> Self {
            self | rhs
        }
        fn bit_xor(self, rhs: Self) -> Self {
            self ^ rhs
        }
        fn cast_i64(self) -> i64 {
            self as i64
        }
        fn cast_u64(self) -> u64 {
            self as u64
        }
        fn cast_f64(self) -> f64 {
            self as f64
        }
    };
}

macro_rules! impl_signed_element {
    ($ty:ty) => {
        impl Element for $ty {
            integral_kernels!();

            fn abs(self) -> Self {
                self.wrapping_abs()
            }
        }
    };
}

macro_rules! impl_unsigned_element {
    ($ty:ty) => {
        impl Element for $ty {
            integral_kernels!();
        }
    };
}

macro_rules! impl_float_element {
    ($ty:ty) => {
        impl Element for $ty {
            fn add(self, rhs: Self) -> Self {
                self + rhs
            }
            fn sub(self, rhs: Self) -> Self {
                self - rhs
            }
            fn mul(self, rhs: Self) -> Self {
                self * rhs
            }
            fn div(self, rhs: Self) -> Self {
                self / rhs
            }
            fn rem(self, rhs: Self) -> Self {
                self % rhs
            }
            fn pow(self, rhs: Self) -> Self {
                self.powf(rhs)
            }
            fn sin(self) -> Self {
                self.sin()
            }
            fn cos(self) -> Self {
                self.cos()
            }
            fn tan(self) -> Self {
                self.tan()
            }
            fn arcsin(self) -> Self {
                self.asin()
            }
            fn arccos(self) -> Self {
                self.acos()
            }
            fn arctan(self) -> Self {
                self.atan()
            }
            fn sinh(self) -> Self {
                self.sinh()
            }
            fn cosh(self) -> Self {
                self.cosh()
            }
            fn tanh(self) -> Self {
                self.tanh()
            }
            fn exp(self) -> Self {
                self.exp()
            }
            fn log(self) -> Self {
                self.ln()
            }
            fn sqrt(self) -> Self {
                self.sqrt()
            }
            fn cbrt(self) -> Self {
                self.cbrt()
            }
            fn ceil(self) -> Self {
                self.ceil()
            }
            fn floor(self) -> Self {
                self.floor()
            }
            fn abs(self) -> Self {
                self.abs()
            }
            fn rint(self) -> Self {
                self.round_ties_even()
            }
            fn cast_i64(self) -> i64 {
                self as i64
            }
            fn cast_u64(self) -> u64 {
                self as u64
            }
            fn cast_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

impl_signed_element!(i8);
impl_signed_element!(i16);
impl_signed_element!(i32);
impl_signed_element!(i64);
impl_unsigned_element!(u8);
impl_unsigned_element!(u16);
impl_unsigned_element!(u32);
impl_unsigned_element!(u64);
impl_float_element!(f32);
impl_float_element!(f64);

impl Element for bool {
    fn as_bool(self) -> bool {
        self
    }

    fn cast_i64(self) -> i64 {
        i64::from(self)
    }

    fn cast_u64(self) -> u64 {
        u64::from(self)
    }

    fn cast_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }
}

// Timestamps only order and compare; arithmetic over them is a planner-level
// rewrite into durations, not an evaluator kernel.
impl Element for TimestampMicros {}

impl Element for DurationMicros {
    fn add(self, rhs: Self) -> Self {
        Self(self.0.wrapping_add(rhs.0))
    }

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.wrapping_sub(rhs.0))
    }
}

// Same-scale decimals add and subtract in scaled units.
impl Element for Decimal64 {
    fn add(self, rhs: Self) -> Self {
        Self(self.0.wrapping_add(rhs.0))
    }

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.wrapping_sub(rhs.0))
    }
}
