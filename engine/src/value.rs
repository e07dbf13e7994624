//! Scalar values and their arithmetic, matching the generated C code.
//!
//! Integer arithmetic wraps, shift counts are masked by the operand width, and
//! float to integer conversion truncates with a saturating boundary (NaN maps
//! to zero). These are the semantics of the emitted `-fwrapv` C source and of
//! Rust's `as`, so the interpreter and native kernels agree bit for bit.

use std::fmt;

use num_traits::AsPrimitive;
use veckern::DType;
use veckern::expr::{BinaryOp, UnaryOp};

/// A single typed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
}

/// Dispatch `$body` over the numeric payload, binding it as `$v`.
macro_rules! with_numeric {
    ($s:expr, $v:ident => $body:expr, bool $b:ident => $bool_body:expr) => {
        match $s {
            Scalar::Bool($b) => $bool_body,
            Scalar::I8($v) => $body,
            Scalar::I16($v) => $body,
            Scalar::I32($v) => $body,
            Scalar::I64($v) => $body,
            Scalar::U8($v) => $body,
            Scalar::U16($v) => $body,
            Scalar::U32($v) => $body,
            Scalar::U64($v) => $body,
            Scalar::F32($v) => $body,
            Scalar::F64($v) => $body,
        }
    };
}

fn convert<T>(s: Scalar) -> T
where
    T: Copy + 'static,
    i8: AsPrimitive<T>,
    i16: AsPrimitive<T>,
    i32: AsPrimitive<T>,
    i64: AsPrimitive<T>,
    u8: AsPrimitive<T>,
    u16: AsPrimitive<T>,
    u32: AsPrimitive<T>,
    u64: AsPrimitive<T>,
    f32: AsPrimitive<T>,
    f64: AsPrimitive<T>,
{
    with_numeric!(s, v => v.as_(), bool b => u8::from(b).as_())
}

impl Scalar {
    pub fn dtype(self) -> DType {
        match self {
            Scalar::Bool(_) => DType::Bool,
            Scalar::I8(_) => DType::I8,
            Scalar::I16(_) => DType::I16,
            Scalar::I32(_) => DType::I32,
            Scalar::I64(_) => DType::I64,
            Scalar::U8(_) => DType::U8,
            Scalar::U16(_) => DType::U16,
            Scalar::U32(_) => DType::U32,
            Scalar::U64(_) => DType::U64,
            Scalar::F32(_) => DType::F32,
            Scalar::F64(_) => DType::F64,
        }
    }

    pub fn zero(dtype: DType) -> Scalar {
        Scalar::I64(0).cast(dtype)
    }

    /// Integer literal `value` (as stored by the parser) in `dtype`.
    pub fn from_u64(value: u64, dtype: DType) -> Scalar {
        Scalar::U64(value).cast(dtype)
    }

    pub fn from_f64(value: f64, dtype: DType) -> Scalar {
        Scalar::F64(value).cast(dtype)
    }

    /// Convert to `dtype` with C cast semantics.
    pub fn cast(self, dtype: DType) -> Scalar {
        match dtype {
            DType::Bool => Scalar::Bool(self.truthy()),
            DType::I8 => Scalar::I8(convert(self)),
            DType::I16 => Scalar::I16(convert(self)),
            DType::I32 => Scalar::I32(convert(self)),
            DType::I64 => Scalar::I64(convert(self)),
            DType::U8 => Scalar::U8(convert(self)),
            DType::U16 => Scalar::U16(convert(self)),
            DType::U32 => Scalar::U32(convert(self)),
            DType::U64 => Scalar::U64(convert(self)),
            DType::F32 => Scalar::F32(convert(self)),
            DType::F64 => Scalar::F64(convert(self)),
        }
    }

    /// `value != 0`; NaN is truthy.
    pub fn truthy(self) -> bool {
        match self {
            Scalar::Bool(b) => b,
            Scalar::F32(v) => v != 0.0,
            Scalar::F64(v) => v != 0.0,
            other => other.as_i64() != 0,
        }
    }

    /// Integer value with `as` semantics.
    pub fn as_i64(self) -> i64 {
        convert(self)
    }

    pub fn as_f64(self) -> f64 {
        convert(self)
    }

    pub fn unary(self, op: UnaryOp) -> Result<Scalar, String> {
        macro_rules! int_unary {
            ($v:expr, $ctor:path) => {
                match op {
                    UnaryOp::Neg => Ok($ctor($v.wrapping_neg())),
                    UnaryOp::Pos => Ok($ctor($v)),
                    UnaryOp::BitNot => Ok($ctor(!$v)),
                    UnaryOp::Not => Ok(Scalar::Bool($v == 0)),
                }
            };
        }
        match self {
            Scalar::Bool(b) => match op {
                UnaryOp::Not | UnaryOp::BitNot => Ok(Scalar::Bool(!b)),
                UnaryOp::Pos => Ok(self),
                UnaryOp::Neg => Ok(Scalar::I64(-i64::from(b))),
            },
            Scalar::I8(v) => int_unary!(v, Scalar::I8),
            Scalar::I16(v) => int_unary!(v, Scalar::I16),
            Scalar::I32(v) => int_unary!(v, Scalar::I32),
            Scalar::I64(v) => int_unary!(v, Scalar::I64),
            Scalar::U8(v) => int_unary!(v, Scalar::U8),
            Scalar::U16(v) => int_unary!(v, Scalar::U16),
            Scalar::U32(v) => int_unary!(v, Scalar::U32),
            Scalar::U64(v) => int_unary!(v, Scalar::U64),
            Scalar::F32(v) => match op {
                UnaryOp::Neg => Ok(Scalar::F32(-v)),
                UnaryOp::Pos => Ok(self),
                UnaryOp::Not => Ok(Scalar::Bool(v == 0.0)),
                UnaryOp::BitNot => Err("bitwise '~' on float32".to_string()),
            },
            Scalar::F64(v) => match op {
                UnaryOp::Neg => Ok(Scalar::F64(-v)),
                UnaryOp::Pos => Ok(self),
                UnaryOp::Not => Ok(Scalar::Bool(v == 0.0)),
                UnaryOp::BitNot => Err("bitwise '~' on float64".to_string()),
            },
        }
    }

    /// Apply `op` to two operands of the same dtype.
    pub fn binary(self, op: BinaryOp, rhs: Scalar) -> Result<Scalar, String> {
        macro_rules! cmp {
            ($a:expr, $b:expr) => {
                match op {
                    BinaryOp::Eq => Some(Scalar::Bool($a == $b)),
                    BinaryOp::Ne => Some(Scalar::Bool($a != $b)),
                    BinaryOp::Lt => Some(Scalar::Bool($a < $b)),
                    BinaryOp::Le => Some(Scalar::Bool($a <= $b)),
                    BinaryOp::Gt => Some(Scalar::Bool($a > $b)),
                    BinaryOp::Ge => Some(Scalar::Bool($a >= $b)),
                    _ => None,
                }
            };
        }
        macro_rules! int_binary {
            ($a:expr, $b:expr, $ctor:path, $t:ty, $unsigned:ty) => {{
                if let Some(r) = cmp!($a, $b) {
                    return Ok(r);
                }
                let bits = <$t>::BITS;
                let (a, b): ($t, $t) = ($a, $b);
                let r = match op {
                    BinaryOp::Add => a.wrapping_add(b),
                    BinaryOp::Sub => a.wrapping_sub(b),
                    BinaryOp::Mul => a.wrapping_mul(b),
                    BinaryOp::BitAnd => a & b,
                    BinaryOp::BitOr => a | b,
                    BinaryOp::BitXor => a ^ b,
                    BinaryOp::Shl => a.wrapping_shl((b as $unsigned as u32) & (bits - 1)),
                    BinaryOp::Shr => a.wrapping_shr((b as $unsigned as u32) & (bits - 1)),
                    BinaryOp::FloorDiv => {
                        if b == 0 {
                            0
                        } else {
                            let q = a.wrapping_div(b);
                            #[allow(unused_comparisons)]
                            let adjust = (a.wrapping_rem(b) != 0) && ((a < 0) != (b < 0));
                            if adjust { q.wrapping_sub(1) } else { q }
                        }
                    }
                    BinaryOp::Mod => {
                        if b == 0 {
                            0
                        } else {
                            let r = a.wrapping_rem(b);
                            #[allow(unused_comparisons)]
                            let adjust = r != 0 && ((r < 0) != (b < 0));
                            if adjust { r.wrapping_add(b) } else { r }
                        }
                    }
                    BinaryOp::Pow => {
                        #[allow(unused_comparisons)]
                        let negative = b < 0;
                        if negative {
                            return Err("integers to negative integer powers are not allowed".into());
                        }
                        let exp = u32::try_from(b as u64).unwrap_or(u32::MAX);
                        a.wrapping_pow(exp)
                    }
                    BinaryOp::Div => {
                        return Err("true division on integer operands".into());
                    }
                    BinaryOp::And | BinaryOp::Or => {
                        return Err("logical operator on non-bool operands".into());
                    }
                    _ => return Err(format!("unexpected operator '{}'", op.symbol())),
                };
                Ok($ctor(r))
            }};
        }
        macro_rules! float_binary {
            ($a:expr, $b:expr, $ctor:path, $eval:path, $pow:expr) => {{
                if let Some(r) = cmp!($a, $b) {
                    return Ok(r);
                }
                let (a, b) = ($a, $b);
                let r = match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::FloorDiv => (a / b).floor(),
                    BinaryOp::Mod => {
                        let r = a % b;
                        if r != 0.0 && ((r < 0.0) != (b < 0.0)) { r + b } else { r }
                    }
                    BinaryOp::Pow => $eval($pow, a, b),
                    _ => return Err(format!("operator '{}' requires integer operands", op.symbol())),
                };
                Ok($ctor(r))
            }};
        }

        use crate::bridge::{eval_f32, eval_f64};
        use veckern::MathFunc;

        match (self, rhs) {
            (Scalar::Bool(a), Scalar::Bool(b)) => {
                if let Some(r) = cmp!(a, b) {
                    return Ok(r);
                }
                match op {
                    BinaryOp::And | BinaryOp::BitAnd => Ok(Scalar::Bool(a & b)),
                    BinaryOp::Or | BinaryOp::BitOr => Ok(Scalar::Bool(a | b)),
                    BinaryOp::BitXor => Ok(Scalar::Bool(a ^ b)),
                    _ => Scalar::I64(i64::from(a)).binary(op, Scalar::I64(i64::from(b))),
                }
            }
            (Scalar::I8(a), Scalar::I8(b)) => int_binary!(a, b, Scalar::I8, i8, u8),
            (Scalar::I16(a), Scalar::I16(b)) => int_binary!(a, b, Scalar::I16, i16, u16),
            (Scalar::I32(a), Scalar::I32(b)) => int_binary!(a, b, Scalar::I32, i32, u32),
            (Scalar::I64(a), Scalar::I64(b)) => int_binary!(a, b, Scalar::I64, i64, u64),
            (Scalar::U8(a), Scalar::U8(b)) => int_binary!(a, b, Scalar::U8, u8, u8),
            (Scalar::U16(a), Scalar::U16(b)) => int_binary!(a, b, Scalar::U16, u16, u16),
            (Scalar::U32(a), Scalar::U32(b)) => int_binary!(a, b, Scalar::U32, u32, u32),
            (Scalar::U64(a), Scalar::U64(b)) => int_binary!(a, b, Scalar::U64, u64, u64),
            (Scalar::F32(a), Scalar::F32(b)) => float_binary!(a, b, Scalar::F32, eval_f32, MathFunc::Pow),
            (Scalar::F64(a), Scalar::F64(b)) => float_binary!(a, b, Scalar::F64, eval_f64, MathFunc::Pow),
            (l, r) => Err(format!(
                "operand types differ: {} {} {}",
                l.dtype(),
                op.symbol(),
                r.dtype()
            )),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        with_numeric!(*self, v => write!(f, "{v}"), bool b => write!(f, "{}", if b { "True" } else { "False" }))
    }
}
