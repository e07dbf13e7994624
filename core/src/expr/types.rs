//! Type inference for kernel expressions.
//!
//! Inference produces a [`TypedExpr`] in which every implicit conversion is an
//! explicit [`TypedKind::Cast`] node and every operand already carries the type
//! its operator computes in. The interpreter and the C generator both walk this
//! tree, so they cannot disagree about promotion.

use std::collections::HashMap;
use std::hash::BuildHasher;

use crate::dtype::DType;
use crate::error::ExprError;
use crate::expr::func::{MathFunc, REDUCTIONS};
use crate::expr::{BinaryOp, Expr, Reserved, UnaryOp};

/// Read-only view of the names visible to an expression.
pub trait SymbolLookup {
    fn lookup(&self, name: &str) -> Option<DType>;
}

impl<S: BuildHasher> SymbolLookup for HashMap<String, DType, S> {
    fn lookup(&self, name: &str) -> Option<DType> {
        self.get(name).copied()
    }
}

impl SymbolLookup for Vec<(String, DType)> {
    fn lookup(&self, name: &str) -> Option<DType> {
        self.iter().find(|(n, _)| n == name).map(|(_, dt)| *dt)
    }
}

/// Literal payload; interpreted in the dtype of the node that holds it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Const {
    Bool(bool),
    Int(u64),
    Float(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedKind {
    Const(Const),
    Var(String),
    /// Convert the operand to this node's dtype.
    Cast(Box<TypedExpr>),
    Unary {
        op: UnaryOp,
        operand: Box<TypedExpr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<TypedExpr>,
        rhs: Box<TypedExpr>,
    },
    Call {
        func: MathFunc,
        args: Vec<TypedExpr>,
    },
    Where {
        cond: Box<TypedExpr>,
        then: Box<TypedExpr>,
        otherwise: Box<TypedExpr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedExpr {
    pub kind: TypedKind,
    pub dtype: DType,
    /// Untyped literal subtree whose type may still adapt to its context.
    weak: bool,
}

impl TypedExpr {
    fn new(kind: TypedKind, dtype: DType) -> Self {
        TypedExpr {
            kind,
            dtype,
            weak: false,
        }
    }

    /// Literal value if this node is a (possibly negated) constant.
    pub fn as_constant(&self) -> Option<f64> {
        match &self.kind {
            TypedKind::Const(Const::Int(v)) => Some(*v as f64),
            TypedKind::Const(Const::Float(v)) => Some(*v),
            TypedKind::Const(Const::Bool(b)) => Some(f64::from(u8::from(*b))),
            TypedKind::Unary {
                op: UnaryOp::Neg,
                operand,
            } => operand.as_constant().map(|v| -v),
            TypedKind::Unary {
                op: UnaryOp::Pos,
                operand,
            } => operand.as_constant(),
            _ => None,
        }
    }

    /// Variable name if this node is a plain variable reference.
    pub fn as_var(&self) -> Option<&str> {
        match &self.kind {
            TypedKind::Var(name) => Some(name),
            _ => None,
        }
    }

    /// Visit this node and all children, parents first.
    pub fn walk(&self, f: &mut impl FnMut(&TypedExpr)) {
        f(self);
        match &self.kind {
            TypedKind::Const(_) | TypedKind::Var(_) => {}
            TypedKind::Cast(inner) => inner.walk(f),
            TypedKind::Unary { operand, .. } => operand.walk(f),
            TypedKind::Binary { lhs, rhs, .. } => {
                lhs.walk(f);
                rhs.walk(f);
            }
            TypedKind::Call { args, .. } => {
                for a in args {
                    a.walk(f);
                }
            }
            TypedKind::Where {
                cond,
                then,
                otherwise,
            } => {
                cond.walk(f);
                then.walk(f);
                otherwise.walk(f);
            }
        }
    }
}

// ============================================================================
// Promotion Rules
// ============================================================================

/// Common type of two strongly typed operands.
pub fn promote(a: DType, b: DType) -> DType {
    use DType::*;

    if a == b {
        return a;
    }
    match (a, b) {
        (Bool, other) | (other, Bool) => other,
        (F64, _) | (_, F64) => F64,
        (F32, i) | (i, F32) => {
            if i.bits() <= 16 {
                F32
            } else {
                F64
            }
        }
        _ if a.is_signed_int() == b.is_signed_int() => {
            if a.bits() >= b.bits() {
                a
            } else {
                b
            }
        }
        _ => {
            let (s, u) = if a.is_signed_int() { (a, b) } else { (b, a) };
            if s.bits() > u.bits() {
                s
            } else if u.bits() < 64 {
                DType::signed_of_bits(u.bits() * 2)
            } else {
                F64
            }
        }
    }
}

/// Type a weak literal of `weak` kind takes next to a strong `strong` operand.
fn adopt(weak: DType, strong: DType) -> DType {
    if weak.is_float() {
        if strong.is_float() { strong } else { DType::F64 }
    } else if strong == DType::Bool {
        DType::I64
    } else {
        strong
    }
}

fn common(lhs: &TypedExpr, rhs: &TypedExpr) -> DType {
    match (lhs.weak, rhs.weak) {
        (true, false) => adopt(lhs.dtype, rhs.dtype),
        (false, true) => adopt(rhs.dtype, lhs.dtype),
        _ => promote(lhs.dtype, rhs.dtype),
    }
}

/// Float type math functions compute in for an argument of type `dt`.
fn float_for(dt: DType) -> DType {
    if dt == DType::F32 { DType::F32 } else { DType::F64 }
}

fn cast(expr: TypedExpr, target: DType) -> TypedExpr {
    TypedExpr::new(TypedKind::Cast(Box::new(expr)), target)
}

/// Bring `expr` to `target`, retyping weak literals in place.
fn coerce(mut expr: TypedExpr, target: DType) -> TypedExpr {
    if expr.dtype == target {
        expr.weak = false;
        return expr;
    }
    if !expr.weak {
        return cast(expr, target);
    }
    match expr.kind {
        TypedKind::Const(Const::Int(_)) if target != DType::Bool => {
            expr.dtype = target;
            expr.weak = false;
            expr
        }
        TypedKind::Const(Const::Float(_)) if target.is_float() => {
            expr.dtype = target;
            expr.weak = false;
            expr
        }
        TypedKind::Unary { op, operand } if op != UnaryOp::Not && !(op == UnaryOp::BitNot && target.is_float()) => {
            TypedExpr::new(
                TypedKind::Unary {
                    op,
                    operand: Box::new(coerce(*operand, target)),
                },
                target,
            )
        }
        TypedKind::Binary { op, lhs, rhs }
            if matches!(op, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul)
                || (op == BinaryOp::Div && target.is_float()) =>
        {
            TypedExpr::new(
                TypedKind::Binary {
                    op,
                    lhs: Box::new(coerce(*lhs, target)),
                    rhs: Box::new(coerce(*rhs, target)),
                },
                target,
            )
        }
        kind => {
            let inner = TypedExpr {
                kind,
                dtype: expr.dtype,
                weak: false,
            };
            cast(inner, target)
        }
    }
}

fn to_bool(expr: TypedExpr) -> TypedExpr {
    coerce(expr, DType::Bool)
}

// ============================================================================
// Inference
// ============================================================================

/// Infer the type of `expr` against `symbols`.
///
/// Reserved geometry names (`_i0`, `_n0`, `_ndim`, `_flat_idx`) that are not
/// otherwise declared type as `int64`.
pub fn infer(expr: &Expr, symbols: &dyn SymbolLookup) -> Result<TypedExpr, ExprError> {
    let typed = infer_node(expr, symbols)?;
    let typed = if typed.weak {
        coerce(typed.clone(), typed.dtype)
    } else {
        typed
    };
    check_literals(&typed)?;
    Ok(typed)
}

fn err(message: impl Into<String>) -> ExprError {
    ExprError::new(0, message)
}

fn check_literals(expr: &TypedExpr) -> Result<(), ExprError> {
    let mut result = Ok(());
    expr.walk(&mut |node| {
        if result.is_err() {
            return;
        }
        if let TypedKind::Const(Const::Int(v)) = node.kind {
            let max = match node.dtype {
                DType::I8 => i8::MAX as u64,
                DType::I16 => i16::MAX as u64,
                DType::I32 => i32::MAX as u64,
                DType::I64 => i64::MAX as u64,
                DType::U8 => u8::MAX as u64,
                DType::U16 => u16::MAX as u64,
                DType::U32 => u32::MAX as u64,
                _ => u64::MAX,
            };
            if v > max {
                result = Err(err(format!(
                    "integer literal {v} is out of range for {}",
                    node.dtype
                )));
            }
        }
    });
    result
}

fn infer_node(expr: &Expr, symbols: &dyn SymbolLookup) -> Result<TypedExpr, ExprError> {
    match expr {
        Expr::Int { value, .. } => Ok(TypedExpr {
            kind: TypedKind::Const(Const::Int(*value)),
            dtype: DType::I64,
            weak: true,
        }),
        Expr::Float { value, .. } => Ok(TypedExpr {
            kind: TypedKind::Const(Const::Float(*value)),
            dtype: DType::F64,
            weak: true,
        }),
        Expr::Bool(b) => Ok(TypedExpr::new(TypedKind::Const(Const::Bool(*b)), DType::Bool)),
        Expr::Str(_) => Err(err("string literals are not supported in numeric expressions")),
        Expr::Name(name) => {
            let dtype = symbols
                .lookup(name)
                .or_else(|| Reserved::parse(name).map(|_| DType::I64))
                .ok_or_else(|| err(format!("unknown variable '{name}'")))?;
            Ok(TypedExpr::new(TypedKind::Var(name.clone()), dtype))
        }
        Expr::Unary { op, operand } => infer_unary(*op, operand, symbols),
        Expr::Binary { op, lhs, rhs } => infer_binary(*op, lhs, rhs, symbols),
        Expr::Call { func, args } => infer_call(func, args, symbols),
    }
}

fn infer_unary(op: UnaryOp, operand: &Expr, symbols: &dyn SymbolLookup) -> Result<TypedExpr, ExprError> {
    let mut t = infer_node(operand, symbols)?;
    match op {
        UnaryOp::Not => {
            let t = to_bool(t);
            Ok(TypedExpr::new(
                TypedKind::Unary {
                    op,
                    operand: Box::new(t),
                },
                DType::Bool,
            ))
        }
        UnaryOp::BitNot if t.dtype == DType::Bool => Ok(TypedExpr::new(
            TypedKind::Unary {
                op: UnaryOp::Not,
                operand: Box::new(t),
            },
            DType::Bool,
        )),
        UnaryOp::BitNot if t.dtype.is_float() => {
            Err(err("bitwise operator '~' requires integer operands"))
        }
        UnaryOp::Neg | UnaryOp::Pos | UnaryOp::BitNot => {
            if t.dtype == DType::Bool {
                t = cast(t, DType::I64);
            }
            let dtype = t.dtype;
            let weak = t.weak;
            Ok(TypedExpr {
                kind: TypedKind::Unary {
                    op,
                    operand: Box::new(t),
                },
                dtype,
                weak,
            })
        }
    }
}

fn infer_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    symbols: &dyn SymbolLookup,
) -> Result<TypedExpr, ExprError> {
    let l = infer_node(lhs, symbols)?;
    let r = infer_node(rhs, symbols)?;

    let binary = |l: TypedExpr, r: TypedExpr, dtype: DType, weak: bool| TypedExpr {
        kind: TypedKind::Binary {
            op,
            lhs: Box::new(l),
            rhs: Box::new(r),
        },
        dtype,
        weak,
    };

    if op.is_logical() {
        return Ok(binary(to_bool(l), to_bool(r), DType::Bool, false));
    }

    let c = common(&l, &r);
    let weak = l.weak && r.weak;

    if op.is_comparison() {
        return Ok(binary(coerce(l, c), coerce(r, c), DType::Bool, false));
    }

    match op {
        BinaryOp::Div => {
            let f = float_for(c);
            Ok(binary(coerce(l, f), coerce(r, f), f, weak))
        }
        BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => {
            if c.is_float() {
                return Err(err(format!(
                    "bitwise operator '{}' requires integer operands",
                    op.symbol()
                )));
            }
            Ok(binary(coerce(l, c), coerce(r, c), c, weak))
        }
        BinaryOp::Shl | BinaryOp::Shr => {
            if c.is_float() {
                return Err(err(format!(
                    "shift operator '{}' requires integer operands",
                    op.symbol()
                )));
            }
            let c = if c == DType::Bool { DType::I64 } else { c };
            Ok(binary(coerce(l, c), coerce(r, c), c, weak))
        }
        _ => {
            let c = if c == DType::Bool { DType::I64 } else { c };
            Ok(binary(coerce(l, c), coerce(r, c), c, weak))
        }
    }
}

fn expect_args(name: &str, args: &[Expr], n: usize) -> Result<(), ExprError> {
    if args.len() != n {
        return Err(err(format!(
            "{name}() takes {n} argument{}, got {}",
            if n == 1 { "" } else { "s" },
            args.len()
        )));
    }
    Ok(())
}

fn infer_call(name: &str, args: &[Expr], symbols: &dyn SymbolLookup) -> Result<TypedExpr, ExprError> {
    match name {
        "int" | "float" | "bool" => {
            expect_args(name, args, 1)?;
            let t = infer_node(&args[0], symbols)?;
            let t = coerce(t.clone(), t.dtype);
            let target = match name {
                "int" => DType::I64,
                "float" => DType::F64,
                _ => DType::Bool,
            };
            return Ok(cast(t, target));
        }
        "where" => {
            expect_args(name, args, 3)?;
            let cond = to_bool(infer_node(&args[0], symbols)?);
            let a = infer_node(&args[1], symbols)?;
            let b = infer_node(&args[2], symbols)?;
            let c = common(&a, &b);
            return Ok(TypedExpr::new(
                TypedKind::Where {
                    cond: Box::new(cond),
                    then: Box::new(coerce(a, c)),
                    otherwise: Box::new(coerce(b, c)),
                },
                c,
            ));
        }
        _ => {}
    }

    if REDUCTIONS.contains(&name) {
        return Err(err(format!(
            "reduction '{name}' is not supported inside kernels"
        )));
    }
    let func = MathFunc::lookup(name).ok_or_else(|| err(format!("unknown function '{name}'")))?;
    expect_args(name, args, func.arity())?;

    if func == MathFunc::Abs {
        let mut t = infer_node(&args[0], symbols)?;
        if t.dtype == DType::Bool {
            t = cast(t, DType::I64);
        }
        let t = coerce(t.clone(), t.dtype);
        let dtype = t.dtype;
        return Ok(TypedExpr::new(TypedKind::Call { func, args: vec![t] }, dtype));
    }

    if func.is_binary() {
        let a = infer_node(&args[0], symbols)?;
        let b = infer_node(&args[1], symbols)?;
        let f = float_for(common(&a, &b));
        return Ok(TypedExpr::new(
            TypedKind::Call {
                func,
                args: vec![coerce(a, f), coerce(b, f)],
            },
            f,
        ));
    }

    let a = infer_node(&args[0], symbols)?;
    let f = float_for(if a.weak { DType::F64 } else { a.dtype });
    Ok(TypedExpr::new(
        TypedKind::Call {
            func,
            args: vec![coerce(a, f)],
        },
        f,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse_expr;
    use rustc_hash::FxHashMap;

    fn symbols() -> FxHashMap<String, DType> {
        let mut m = FxHashMap::default();
        m.insert("x".to_string(), DType::F64);
        m.insert("y".to_string(), DType::F32);
        m.insert("i".to_string(), DType::I64);
        m.insert("b".to_string(), DType::U8);
        m.insert("s".to_string(), DType::I32);
        m.insert("m".to_string(), DType::Bool);
        m
    }

    fn ty(text: &str) -> DType {
        infer(&parse_expr(text).unwrap(), &symbols()).unwrap().dtype
    }

    fn ty_err(text: &str) -> String {
        infer(&parse_expr(text).unwrap(), &symbols())
            .unwrap_err()
            .message
    }

    #[test]
    fn test_promote_table() {
        assert_eq!(promote(DType::I8, DType::U8), DType::I16);
        assert_eq!(promote(DType::I64, DType::U64), DType::F64);
        assert_eq!(promote(DType::U32, DType::I64), DType::I64);
        assert_eq!(promote(DType::F32, DType::I16), DType::F32);
        assert_eq!(promote(DType::F32, DType::I32), DType::F64);
        assert_eq!(promote(DType::Bool, DType::U16), DType::U16);
    }

    #[test]
    fn test_weak_literals() {
        assert_eq!(ty("x + 1"), DType::F64);
        assert_eq!(ty("y + 1"), DType::F32);
        assert_eq!(ty("y * 2.5"), DType::F32);
        assert_eq!(ty("b + 1"), DType::U8);
        assert_eq!(ty("s + 1.5"), DType::F64);
        assert_eq!(ty("1 + 2"), DType::I64);
        assert_eq!(ty("m + 1"), DType::I64);
    }

    #[test]
    fn test_literal_out_of_range() {
        assert!(ty_err("b + 300").contains("out of range"));
    }

    #[test]
    fn test_division_is_true_division() {
        assert_eq!(ty("i / 2"), DType::F64);
        assert_eq!(ty("y / y"), DType::F32);
        assert_eq!(ty("i // 2"), DType::I64);
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(ty("x > 1"), DType::Bool);
        assert_eq!(ty("x > 1 and i < 3"), DType::Bool);
        assert_eq!(ty("not i"), DType::Bool);
    }

    #[test]
    fn test_casts_and_functions() {
        assert_eq!(ty("float(int(x)) + bool(x)"), DType::F64);
        assert_eq!(ty("int(x)"), DType::I64);
        assert_eq!(ty("sin(y)"), DType::F32);
        assert_eq!(ty("sin(i)"), DType::F64);
        assert_eq!(ty("abs(s)"), DType::I32);
        assert_eq!(ty("arctan2(y, y)"), DType::F32);
        assert_eq!(ty("where(x > 0, i, s)"), DType::I64);
        assert_eq!(ty("exp(1)"), DType::F64);
    }

    #[test]
    fn test_bitwise_rules() {
        assert_eq!(ty("(x > 0) & (x < 5)"), DType::Bool);
        assert_eq!(ty("b | 1"), DType::U8);
        assert_eq!(ty("~m"), DType::Bool);
        assert!(ty_err("x & 1").contains("bitwise"));
        assert!(ty_err("x << 1").contains("shift"));
    }

    #[test]
    fn test_unknown_names() {
        assert!(ty_err("z + 1").contains("unknown variable"));
        assert!(ty_err("foo(x)").contains("unknown function"));
        assert!(ty_err("sum(x)").contains("reduction"));
        assert!(ty_err("sin(x, x)").contains("takes 1 argument"));
        assert!(ty_err("\"a\" + x").contains("string"));
    }

    #[test]
    fn test_reserved_symbols_type_as_int64() {
        assert_eq!(ty("_i0 * _n1 + _i1"), DType::I64);
        assert_eq!(ty("_flat_idx + x"), DType::F64);
    }

    #[test]
    fn test_implicit_casts_are_explicit_nodes() {
        let t = infer(&parse_expr("i + x").unwrap(), &symbols()).unwrap();
        match t.kind {
            TypedKind::Binary { lhs, rhs, .. } => {
                assert!(matches!(lhs.kind, TypedKind::Cast(_)));
                assert_eq!(lhs.dtype, DType::F64);
                assert_eq!(rhs.as_var(), Some("x"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_constant_detection() {
        let t = infer(&parse_expr("-1.5").unwrap(), &symbols()).unwrap();
        assert_eq!(t.as_constant(), Some(-1.5));
    }
}
