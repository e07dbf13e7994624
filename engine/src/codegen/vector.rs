//! Whole-array lowering of single math-call kernels onto vector bridge routines.

use std::fmt;

use veckern::expr::BinaryOp;
use veckern::{DType, IrProgram, IrStmtKind, MathFunc, TypedExpr, TypedKind};

use super::CodegenOptions;
use super::emit::{CodeBuf, ExprEmitter};
use crate::bridge::{SlotKind, symbol_name};

/// How the kernel body was lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoweringMode {
    /// Per-element loop.
    Scalar,
    /// `f(param)`: one vector call.
    VectorUnary,
    /// `f(param ± c)`: an offset pass then an in-place vector call.
    VectorUnaryOffset,
    /// `f(a, b)` over parameters and at most one constant.
    VectorBinary,
}

impl fmt::Display for LoweringMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            LoweringMode::Scalar => "scalar",
            LoweringMode::VectorUnary => "vector-unary",
            LoweringMode::VectorUnaryOffset => "vector-unary-offset",
            LoweringMode::VectorBinary => "vector-binary",
        })
    }
}

/// Outcome of vectorization matching, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweringTrace {
    pub mode: LoweringMode,
    /// Matched math function.
    pub op: Option<&'static str>,
    /// Why the scalar loop was used.
    pub reason: Option<&'static str>,
}

impl LoweringTrace {
    fn scalar(reason: &'static str) -> Self {
        LoweringTrace {
            mode: LoweringMode::Scalar,
            op: None,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Operand<'a> {
    Param(usize),
    Const(&'a TypedExpr),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum VectorPlan<'a> {
    Unary {
        func: MathFunc,
        input: usize,
    },
    UnaryOffset {
        func: MathFunc,
        input: usize,
        name: &'a str,
        arg: &'a TypedExpr,
    },
    Binary {
        func: MathFunc,
        lhs: Operand<'a>,
        rhs: Operand<'a>,
    },
}

/// The expression a single-return kernel computes.
fn returned_expr(ir: &IrProgram) -> Option<&TypedExpr> {
    match ir.block.as_slice() {
        [stmt] => match &stmt.kind {
            IrStmtKind::Return(value) if value.dtype == value.typed.dtype => Some(&value.typed),
            _ => None,
        },
        [first, second] => match (&first.kind, &second.kind) {
            (IrStmtKind::Assign { name, value }, IrStmtKind::Return(ret))
                if ret.typed.as_var() == Some(name.as_str())
                    && value.dtype == value.typed.dtype =>
            {
                Some(&value.typed)
            }
            _ => None,
        },
        _ => None,
    }
}

fn param_index(ir: &IrProgram, expr: &TypedExpr) -> Option<usize> {
    let name = expr.as_var()?;
    ir.params.iter().position(|(n, _)| n == name)
}

fn operand<'a>(ir: &IrProgram, expr: &'a TypedExpr) -> Option<Operand<'a>> {
    if let Some(i) = param_index(ir, expr) {
        return Some(Operand::Param(i));
    }
    expr.as_constant().map(|_| Operand::Const(expr))
}

/// Match the kernel against the vectorizable shapes.
pub(crate) fn plan<'a>(
    ir: &'a IrProgram,
    output: DType,
    options: &CodegenOptions,
) -> (Option<VectorPlan<'a>>, LoweringTrace) {
    if !options.math_bridge {
        return (None, LoweringTrace::scalar("math bridge disabled"));
    }
    if !options.vec_math {
        return (None, LoweringTrace::scalar("vector math disabled"));
    }
    if !output.is_float() {
        return (None, LoweringTrace::scalar("output is not floating point"));
    }
    if ir.params.iter().any(|(_, dt)| *dt != output) {
        return (None, LoweringTrace::scalar("parameter type differs from output"));
    }
    let Some(expr) = returned_expr(ir) else {
        return (None, LoweringTrace::scalar("body is not a single returned expression"));
    };
    let TypedKind::Call { func, args } = &expr.kind else {
        return (None, LoweringTrace::scalar("returned expression is not a math call"));
    };
    if expr.dtype != output {
        return (None, LoweringTrace::scalar("call type differs from output"));
    }
    let func = *func;

    let matched = if func.is_binary() {
        match (operand(ir, &args[0]), operand(ir, &args[1])) {
            (Some(Operand::Const(_)), Some(Operand::Const(_))) => None,
            (Some(lhs), Some(rhs)) => Some(VectorPlan::Binary { func, lhs, rhs }),
            _ => None,
        }
    } else if let Some(input) = param_index(ir, &args[0]) {
        Some(VectorPlan::Unary { func, input })
    } else {
        match_offset(ir, func, &args[0])
    };

    let Some(plan) = matched else {
        return (None, LoweringTrace::scalar("call arguments are not parameters or constants"));
    };
    let mode = match plan {
        VectorPlan::Unary { .. } => LoweringMode::VectorUnary,
        VectorPlan::UnaryOffset { .. } => LoweringMode::VectorUnaryOffset,
        VectorPlan::Binary { .. } => LoweringMode::VectorBinary,
    };
    let trace = LoweringTrace {
        mode,
        op: Some(func.name()),
        reason: None,
    };
    (Some(plan), trace)
}

/// `param + c`, `param - c` or `c + param`.
fn match_offset<'a>(ir: &'a IrProgram, func: MathFunc, arg: &'a TypedExpr) -> Option<VectorPlan<'a>> {
    let TypedKind::Binary { op, lhs, rhs } = &arg.kind else {
        return None;
    };
    let (param, constant) = match op {
        BinaryOp::Add | BinaryOp::Sub if param_index(ir, lhs).is_some() => (lhs, rhs),
        BinaryOp::Add if param_index(ir, rhs).is_some() => (rhs, lhs),
        _ => return None,
    };
    constant.as_constant()?;
    let input = param_index(ir, param)?;
    Some(VectorPlan::UnaryOffset {
        func,
        input,
        name: param.as_var()?,
        arg,
    })
}

/// Emit the whole-array body for `plan`.
pub(crate) fn write_body(
    buf: &mut CodeBuf,
    emitter: &mut ExprEmitter,
    plan: &VectorPlan,
    dtype: DType,
) -> Result<(), String> {
    let kind = if dtype == DType::F32 {
        SlotKind::VecF32
    } else {
        SlotKind::VecF64
    };
    let input = |i: usize| format!("__me_in{i}");
    match *plan {
        VectorPlan::Unary { func, input: i } => {
            emitter.math.add_bridge(func, kind);
            buf.line(format!(
                "{}({}, __me_dst, __me_nitems);",
                symbol_name(func, kind),
                input(i)
            ));
        }
        VectorPlan::UnaryOffset {
            func,
            input: i,
            name,
            arg,
        } => {
            emitter.substitute(name, format!("{}[__me_idx]", input(i)));
            let shifted = emitter.emit(arg)?;
            buf.open("for (int64_t __me_idx = 0; __me_idx < __me_nitems; __me_idx++) {");
            buf.line(format!("__me_dst[__me_idx] = {shifted};"));
            buf.close("}");
            emitter.math.add_bridge(func, kind);
            buf.line(format!(
                "{}(__me_dst, __me_dst, __me_nitems);",
                symbol_name(func, kind)
            ));
        }
        VectorPlan::Binary { func, lhs, rhs } => {
            let mut arg = |op: Operand| -> Result<String, String> {
                match op {
                    Operand::Param(i) => Ok(input(i)),
                    Operand::Const(expr) => {
                        let value = emitter.emit(expr)?;
                        buf.open("for (int64_t __me_idx = 0; __me_idx < __me_nitems; __me_idx++) {");
                        buf.line(format!("__me_dst[__me_idx] = {value};"));
                        buf.close("}");
                        Ok("__me_dst".to_string())
                    }
                }
            };
            let a = arg(lhs)?;
            let b = arg(rhs)?;
            emitter.math.add_bridge(func, kind);
            buf.line(format!(
                "{}({a}, {b}, __me_dst, __me_nitems);",
                symbol_name(func, kind)
            ));
        }
    }
    Ok(())
}
