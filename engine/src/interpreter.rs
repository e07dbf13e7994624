//! Reference interpreter for the full kernel language.
//!
//! A program is typed once, in textual order, into a flat slot table; every
//! expression is lowered to a small tree over slot indices. Evaluation then
//! runs the body once per element. Values keep their inferred dtypes and use
//! the same conversions as generated code, so results agree with compiled
//! kernels bit for bit on the compiled subset.

use thiserror::Error;
use veckern::ast::block_always_returns;
use veckern::expr::types::Const;
use veckern::expr::{BinaryOp, UnaryOp, parse_expr_list};
use veckern::{
    Block, DType, Expr, IrError, MathFunc, Program, Reserved, SourceExpr, StmtKind, TypedExpr,
    TypedKind, infer, parse_expr,
};

use crate::bridge::{eval_f32, eval_f64};
use crate::buffer::{ArrayMut, ArrayRef};
use crate::nd::NdContext;
use crate::value::Scalar;

/// Loop iterations allowed per element before evaluation is abandoned.
pub const DEFAULT_ITERATION_LIMIT: u64 = 10_000_000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("{line}:{column}: {message}")]
    Runtime {
        line: usize,
        column: usize,
        message: String,
    },
    #[error("loop iteration limit of {limit} exceeded at element {index}")]
    IterationLimit { limit: u64, index: usize },
    #[error("element {index} finished without returning a value")]
    NoReturn { index: usize },
    #[error("expected {expected} input arrays, got {got}")]
    InputCount { expected: usize, got: usize },
    #[error("input '{name}' must be {expected}, got {got}")]
    InputType {
        name: String,
        expected: DType,
        got: DType,
    },
    #[error("output dtype must be {expected}, got {got}")]
    OutputType { expected: DType, got: DType },
    #[error("array '{name}' has {got} elements, expected {expected}")]
    Length {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error(transparent)]
    Geometry(#[from] crate::nd::NdError),
}

/// Reserved geometry names referenced anywhere in `program`, in first-use order.
pub fn reserved_names(program: &Program) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut add = |name: &str| {
        if Reserved::parse(name).is_some() && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    };
    for p in &program.params {
        add(p);
    }
    program.for_each_expr(&mut |src| {
        let parsed = if src.text.contains(',') {
            parse_expr_list(&src.text).ok()
        } else {
            parse_expr(&src.text).ok().map(|e| vec![e])
        };
        for expr in parsed.into_iter().flatten() {
            for name in expr.names() {
                add(name);
            }
        }
    });
    names
}

// ============================================================================
// Lowered Program
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Code {
    Const(Scalar),
    Slot(usize),
    Cast(Box<Code>, DType),
    Unary(UnaryOp, Box<Code>),
    Binary(BinaryOp, Box<Code>, Box<Code>),
    Call(MathFunc, DType, Vec<Code>),
    Where(Box<Code>, Box<Code>, Box<Code>),
}

#[derive(Debug, Clone, PartialEq)]
enum PrintArg {
    Text(String),
    Value(Code),
}

#[derive(Debug, Clone, PartialEq)]
struct Node {
    kind: NodeKind,
    line: usize,
    column: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum NodeKind {
    Assign { slot: usize, value: Code },
    Expr(Code),
    Return(Code),
    Print(Vec<PrintArg>),
    If {
        branches: Vec<(Code, Vec<Node>)>,
        otherwise: Option<Vec<Node>>,
    },
    For {
        slot: usize,
        start: Code,
        stop: Code,
        step: Code,
        body: Vec<Node>,
    },
    While { cond: Code, body: Vec<Node> },
    Break(Option<Code>),
    Continue(Option<Code>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotRole {
    Input(usize),
    Reserved(Reserved),
    Local,
}

/// A kernel typed and lowered for interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedProgram {
    name: String,
    slots: Vec<(String, DType)>,
    roles: Vec<SlotRole>,
    inputs: Vec<(String, DType)>,
    body: Vec<Node>,
}

/// Control flow leaving a block.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Scalar),
}

impl TypedProgram {
    /// Type `program` against `params`.
    ///
    /// Every non-reserved `def` parameter needs an entry in `params`; reserved
    /// names are always `int64` and come from the [`NdContext`].
    pub fn new(program: &Program, params: &[(String, DType)]) -> Result<Self, IrError> {
        if !block_always_returns(&program.body) {
            return Err(IrError::type_error(
                program.line,
                program.column,
                "kernel does not return a value on every control path",
            ));
        }
        let mut typer = Typer::default();
        for name in &program.params {
            if let Some(reserved) = Reserved::parse(name) {
                typer.declare(name, DType::I64, SlotRole::Reserved(reserved));
                continue;
            }
            let dtype = params
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, dt)| *dt)
                .ok_or_else(|| {
                    IrError::type_error(
                        program.line,
                        program.column,
                        format!("no dtype supplied for parameter '{name}'"),
                    )
                })?;
            let index = typer.inputs.len();
            typer.inputs.push((name.clone(), dtype));
            typer.declare(name, dtype, SlotRole::Input(index));
        }
        for name in reserved_names(program) {
            if typer.slot(&name).is_none() {
                if let Some(reserved) = Reserved::parse(&name) {
                    typer.declare(&name, DType::I64, SlotRole::Reserved(reserved));
                }
            }
        }

        let body = typer.block(&program.body)?;
        Ok(TypedProgram {
            name: program.name.clone(),
            slots: typer.slots,
            roles: typer.roles,
            inputs: typer.inputs,
            body,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input arrays the program reads, in `def` order.
    pub fn inputs(&self) -> &[(String, DType)] {
        &self.inputs
    }

    /// Dtype of a parameter or local.
    pub fn dtype_of(&self, name: &str) -> Option<DType> {
        self.slots.iter().find(|(n, _)| n == name).map(|(_, dt)| *dt)
    }

    /// Evaluate every element of the block described by `nd`.
    pub fn run(
        &self,
        inputs: &[ArrayRef],
        output: &mut ArrayMut,
        nd: &NdContext,
        iteration_limit: u64,
        print: &mut dyn FnMut(&str),
    ) -> Result<(), EvalError> {
        if inputs.len() != self.inputs.len() {
            return Err(EvalError::InputCount {
                expected: self.inputs.len(),
                got: inputs.len(),
            });
        }
        let n = output.len();
        for (array, (name, dtype)) in inputs.iter().zip(&self.inputs) {
            if array.dtype() != *dtype {
                return Err(EvalError::InputType {
                    name: name.clone(),
                    expected: *dtype,
                    got: array.dtype(),
                });
            }
            if array.len() < n {
                return Err(EvalError::Length {
                    name: name.clone(),
                    expected: n,
                    got: array.len(),
                });
            }
        }

        let mut slots: Vec<Scalar> = self.slots.iter().map(|(_, dt)| Scalar::zero(*dt)).collect();
        for index in 0..n {
            for (slot, role) in self.roles.iter().enumerate() {
                slots[slot] = match role {
                    SlotRole::Input(i) => inputs[*i].get(index),
                    SlotRole::Reserved(r) => Scalar::I64(nd.reserved_value(*r, index)),
                    SlotRole::Local => Scalar::zero(self.slots[slot].1),
                };
            }
            let mut frame = Frame {
                slots: &mut slots,
                iterations: 0,
                limit: iteration_limit,
                index,
                print: &mut *print,
            };
            match exec_block(&self.body, &mut frame)? {
                Flow::Return(value) => output.set(index, value),
                _ => return Err(EvalError::NoReturn { index }),
            }
        }
        Ok(())
    }
}

// ============================================================================
// Typing
// ============================================================================

#[derive(Default)]
struct Typer {
    slots: Vec<(String, DType)>,
    roles: Vec<SlotRole>,
    inputs: Vec<(String, DType)>,
}

impl Typer {
    fn slot(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|(n, _)| n == name)
    }

    fn declare(&mut self, name: &str, dtype: DType, role: SlotRole) -> usize {
        self.slots.push((name.to_string(), dtype));
        self.roles.push(role);
        self.slots.len() - 1
    }

    fn parse(&self, src: &SourceExpr) -> Result<Expr, IrError> {
        parse_expr(&src.text).map_err(|e| {
            IrError::type_error(
                src.line,
                src.column + e.offset,
                format!("invalid expression: {}", e.message),
            )
        })
    }

    fn typed(&self, src: &SourceExpr, expr: &Expr) -> Result<(Code, DType), IrError> {
        let typed = infer(expr, &self.slots)
            .map_err(|e| IrError::type_error(src.line, src.column, e.message))?;
        let code = self
            .lower(&typed)
            .map_err(|msg| IrError::type_error(src.line, src.column, msg))?;
        Ok((code, typed.dtype))
    }

    fn expr(&self, src: &SourceExpr) -> Result<(Code, DType), IrError> {
        let parsed = self.parse(src)?;
        self.typed(src, &parsed)
    }

    fn lower(&self, expr: &TypedExpr) -> Result<Code, String> {
        let dtype = expr.dtype;
        Ok(match &expr.kind {
            TypedKind::Const(Const::Bool(b)) => Code::Const(Scalar::Bool(*b).cast(dtype)),
            TypedKind::Const(Const::Int(v)) => Code::Const(Scalar::from_u64(*v, dtype)),
            TypedKind::Const(Const::Float(v)) => Code::Const(Scalar::from_f64(*v, dtype)),
            TypedKind::Var(name) => {
                Code::Slot(self.slot(name).ok_or_else(|| format!("unknown variable '{name}'"))?)
            }
            TypedKind::Cast(inner) => Code::Cast(Box::new(self.lower(inner)?), dtype),
            TypedKind::Unary { op, operand } => Code::Unary(*op, Box::new(self.lower(operand)?)),
            TypedKind::Binary { op, lhs, rhs } => Code::Binary(
                *op,
                Box::new(self.lower(lhs)?),
                Box::new(self.lower(rhs)?),
            ),
            TypedKind::Call { func, args } => Code::Call(
                *func,
                dtype,
                args.iter().map(|a| self.lower(a)).collect::<Result<_, _>>()?,
            ),
            TypedKind::Where {
                cond,
                then,
                otherwise,
            } => Code::Where(
                Box::new(self.lower(cond)?),
                Box::new(self.lower(then)?),
                Box::new(self.lower(otherwise)?),
            ),
        })
    }

    /// Slot receiving an assignment to `name`, declaring it on first use.
    fn target(&mut self, name: &str, dtype: DType, line: usize, column: usize) -> Result<usize, IrError> {
        if Reserved::parse(name).is_some() {
            return Err(IrError::type_error(
                line,
                column,
                format!("'{name}' is a reserved name"),
            ));
        }
        Ok(match self.slot(name) {
            Some(slot) => slot,
            None => self.declare(name, dtype, SlotRole::Local),
        })
    }

    fn int_arg(&self, src: &SourceExpr) -> Result<Code, IrError> {
        let (code, dtype) = self.expr(src)?;
        if !dtype.is_integral() {
            return Err(IrError::type_error(
                src.line,
                src.column,
                format!("range() arguments must be integers, got {dtype}"),
            ));
        }
        Ok(Code::Cast(Box::new(code), DType::I64))
    }

    fn guard(&self, guard: &Option<SourceExpr>) -> Result<Option<Code>, IrError> {
        guard
            .as_ref()
            .map(|g| self.expr(g).map(|(code, _)| code))
            .transpose()
    }

    fn print_args(&self, src: &SourceExpr) -> Result<Vec<PrintArg>, IrError> {
        if src.text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let exprs = parse_expr_list(&src.text).map_err(|e| {
            IrError::type_error(src.line, src.column + e.offset, format!("invalid print arguments: {}", e.message))
        })?;
        let mut args = Vec::with_capacity(exprs.len());
        for expr in &exprs {
            args.push(match expr {
                Expr::Str(s) => PrintArg::Text(s.clone()),
                other => PrintArg::Value(self.typed(src, other)?.0),
            });
        }
        if let Some(PrintArg::Text(fmt)) = args.first() {
            let holes = fmt.matches("{}").count();
            if holes > 0 && holes != args.len() - 1 {
                return Err(IrError::type_error(
                    src.line,
                    src.column,
                    format!("print format has {holes} placeholders but {} values", args.len() - 1),
                ));
            }
        }
        Ok(args)
    }

    fn block(&mut self, block: &Block) -> Result<Vec<Node>, IrError> {
        let mut out = Vec::with_capacity(block.len());
        for stmt in block {
            let (line, column) = (stmt.line, stmt.column);
            let kind = match &stmt.kind {
                StmtKind::Assign { name, value } => {
                    let (code, dtype) = self.expr(value)?;
                    let slot = self.target(name, dtype, line, column)?;
                    let target = self.slots[slot].1;
                    let value = if target == dtype {
                        code
                    } else {
                        Code::Cast(Box::new(code), target)
                    };
                    NodeKind::Assign { slot, value }
                }
                StmtKind::Expr(e) => NodeKind::Expr(self.expr(e)?.0),
                StmtKind::Return(e) => NodeKind::Return(self.expr(e)?.0),
                StmtKind::Print(args) => NodeKind::Print(self.print_args(args)?),
                StmtKind::If {
                    cond,
                    then_block,
                    elifs,
                    else_block,
                } => {
                    let mut branches = Vec::with_capacity(1 + elifs.len());
                    let c = self.expr(cond)?.0;
                    branches.push((c, self.block(then_block)?));
                    for branch in elifs {
                        let c = self.expr(&branch.cond)?.0;
                        branches.push((c, self.block(&branch.block)?));
                    }
                    let otherwise = match else_block {
                        Some(b) => Some(self.block(b)?),
                        None => None,
                    };
                    NodeKind::If { branches, otherwise }
                }
                StmtKind::For { var, range, body } => {
                    let one = || Code::Const(Scalar::I64(1));
                    let (start, stop, step) = match range.as_slice() {
                        [stop] => (Code::Const(Scalar::I64(0)), self.int_arg(stop)?, one()),
                        [start, stop] => (self.int_arg(start)?, self.int_arg(stop)?, one()),
                        [start, stop, step] => {
                            (self.int_arg(start)?, self.int_arg(stop)?, self.int_arg(step)?)
                        }
                        _ => {
                            return Err(IrError::type_error(
                                line,
                                column,
                                "range() takes one to three arguments",
                            ));
                        }
                    };
                    let slot = self.target(var, DType::I64, line, column)?;
                    let body = self.block(body)?;
                    NodeKind::For {
                        slot,
                        start,
                        stop,
                        step,
                        body,
                    }
                }
                StmtKind::While { cond, body } => {
                    let cond = self.expr(cond)?.0;
                    NodeKind::While {
                        cond,
                        body: self.block(body)?,
                    }
                }
                StmtKind::Break { guard } => NodeKind::Break(self.guard(guard)?),
                StmtKind::Continue { guard } => NodeKind::Continue(self.guard(guard)?),
            };
            out.push(Node { kind, line, column });
        }
        Ok(out)
    }
}

// ============================================================================
// Evaluation
// ============================================================================

struct Frame<'a> {
    slots: &'a mut [Scalar],
    iterations: u64,
    limit: u64,
    index: usize,
    print: &'a mut dyn FnMut(&str),
}

impl Frame<'_> {
    fn tick(&mut self) -> Result<(), EvalError> {
        self.iterations += 1;
        if self.iterations > self.limit {
            return Err(EvalError::IterationLimit {
                limit: self.limit,
                index: self.index,
            });
        }
        Ok(())
    }
}

fn eval(code: &Code, slots: &[Scalar]) -> Result<Scalar, String> {
    match code {
        Code::Const(v) => Ok(*v),
        Code::Slot(i) => Ok(slots[*i]),
        Code::Cast(inner, dtype) => Ok(eval(inner, slots)?.cast(*dtype)),
        Code::Unary(op, operand) => eval(operand, slots)?.unary(*op),
        Code::Binary(BinaryOp::And, lhs, rhs) => {
            let l = eval(lhs, slots)?.truthy();
            Ok(Scalar::Bool(l && eval(rhs, slots)?.truthy()))
        }
        Code::Binary(BinaryOp::Or, lhs, rhs) => {
            let l = eval(lhs, slots)?.truthy();
            Ok(Scalar::Bool(l || eval(rhs, slots)?.truthy()))
        }
        Code::Binary(op, lhs, rhs) => eval(lhs, slots)?.binary(*op, eval(rhs, slots)?),
        Code::Call(func, dtype, args) => {
            let a = eval(&args[0], slots)?;
            let b = match args.get(1) {
                Some(arg) => Some(eval(arg, slots)?),
                None => None,
            };
            Ok(call(*func, *dtype, a, b))
        }
        Code::Where(cond, then, otherwise) => {
            if eval(cond, slots)?.truthy() {
                eval(then, slots)
            } else {
                eval(otherwise, slots)
            }
        }
    }
}

fn call(func: MathFunc, dtype: DType, a: Scalar, b: Option<Scalar>) -> Scalar {
    match (dtype, a) {
        (DType::F32, _) => {
            let x = a.cast(DType::F32);
            let y = b.map_or(Scalar::F32(0.0), |v| v.cast(DType::F32));
            match (x, y) {
                (Scalar::F32(x), Scalar::F32(y)) => Scalar::F32(eval_f32(func, x, y)),
                _ => Scalar::F32(f32::NAN),
            }
        }
        (DType::F64, _) => {
            let y = b.map_or(0.0, Scalar::as_f64);
            Scalar::F64(eval_f64(func, a.as_f64(), y))
        }
        // integer abs; the only math function that keeps an integer type
        (_, Scalar::I8(v)) => Scalar::I8(v.wrapping_abs()),
        (_, Scalar::I16(v)) => Scalar::I16(v.wrapping_abs()),
        (_, Scalar::I32(v)) => Scalar::I32(v.wrapping_abs()),
        (_, Scalar::I64(v)) => Scalar::I64(v.wrapping_abs()),
        (_, other) => other,
    }
}

fn runtime(node: &Node, message: String) -> EvalError {
    EvalError::Runtime {
        line: node.line,
        column: node.column,
        message,
    }
}

fn eval_at(node: &Node, code: &Code, frame: &Frame) -> Result<Scalar, EvalError> {
    eval(code, frame.slots).map_err(|msg| runtime(node, msg))
}

fn guard_holds(node: &Node, guard: &Option<Code>, frame: &Frame) -> Result<bool, EvalError> {
    match guard {
        Some(code) => Ok(eval_at(node, code, frame)?.truthy()),
        None => Ok(true),
    }
}

fn format_print(node: &Node, args: &[PrintArg], frame: &Frame) -> Result<String, EvalError> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(match arg {
            PrintArg::Text(s) => s.clone(),
            PrintArg::Value(code) => eval_at(node, code, frame)?.to_string(),
        });
    }
    if let Some(PrintArg::Text(fmt)) = args.first() {
        if fmt.contains("{}") {
            let mut out = String::new();
            let mut rest = fmt.as_str();
            let mut next = values.iter().skip(1);
            while let Some(pos) = rest.find("{}") {
                out.push_str(&rest[..pos]);
                out.push_str(next.next().map_or("", String::as_str));
                rest = &rest[pos + 2..];
            }
            out.push_str(rest);
            return Ok(out);
        }
    }
    Ok(values.join(" "))
}

fn exec_block(block: &[Node], frame: &mut Frame) -> Result<Flow, EvalError> {
    for node in block {
        match &node.kind {
            NodeKind::Assign { slot, value } => {
                frame.slots[*slot] = eval_at(node, value, frame)?;
            }
            NodeKind::Expr(code) => {
                eval_at(node, code, frame)?;
            }
            NodeKind::Return(code) => return Ok(Flow::Return(eval_at(node, code, frame)?)),
            NodeKind::Print(args) => {
                let text = format_print(node, args, frame)?;
                (frame.print)(&text);
            }
            NodeKind::If { branches, otherwise } => {
                let mut taken = None;
                for (cond, body) in branches {
                    if eval_at(node, cond, frame)?.truthy() {
                        taken = Some(body);
                        break;
                    }
                }
                let body = taken.or(otherwise.as_ref());
                if let Some(body) = body {
                    match exec_block(body, frame)? {
                        Flow::Normal => {}
                        flow => return Ok(flow),
                    }
                }
            }
            NodeKind::For {
                slot,
                start,
                stop,
                step,
                body,
            } => {
                let start = eval_at(node, start, frame)?.as_i64();
                let stop = eval_at(node, stop, frame)?.as_i64();
                let step = eval_at(node, step, frame)?.as_i64();
                if step == 0 {
                    continue;
                }
                let dtype = frame.slots[*slot].dtype();
                let mut i = start;
                while (step > 0 && i < stop) || (step < 0 && i > stop) {
                    frame.tick()?;
                    frame.slots[*slot] = Scalar::I64(i).cast(dtype);
                    match exec_block(body, frame)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    match i.checked_add(step) {
                        Some(next) => i = next,
                        None => break,
                    }
                }
            }
            NodeKind::While { cond, body } => {
                while eval_at(node, cond, frame)?.truthy() {
                    frame.tick()?;
                    match exec_block(body, frame)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            NodeKind::Break(guard) => {
                if guard_holds(node, guard, frame)? {
                    return Ok(Flow::Break);
                }
            }
            NodeKind::Continue(guard) => {
                if guard_holds(node, guard, frame)? {
                    return Ok(Flow::Continue);
                }
            }
        }
    }
    Ok(Flow::Normal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use veckern::parse;

    fn typed(src: &str, params: &[(&str, DType)]) -> TypedProgram {
        let params: Vec<(String, DType)> =
            params.iter().map(|(n, d)| (n.to_string(), *d)).collect();
        TypedProgram::new(&parse(src).unwrap(), &params).unwrap()
    }

    fn run_f64(src: &str, x: &[f64]) -> Vec<f64> {
        let program = typed(src, &[("x", DType::F64)]);
        let mut out = vec![0.0; x.len()];
        program
            .run(
                &[ArrayRef::from(x)],
                &mut ArrayMut::from(&mut out),
                &NdContext::linear(x.len()),
                DEFAULT_ITERATION_LIMIT,
                &mut |_: &str| {},
            )
            .unwrap();
        out
    }

    #[test]
    fn test_cast_chain() {
        let out = run_f64(
            "def k(x):\n    return float(int(x)) + bool(x)\n",
            &[0.0, 0.2, 1.0, 1.9, 2.0, 3.2],
        );
        assert_eq!(out, vec![0.0, 1.0, 2.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_bounded_loop_sum() {
        let src = "# me:dialect=element\ndef k(x):\n    acc = 0.0\n    for i in range(10):\n        if i >= x:\n            break\n        acc = acc + i\n    return acc\n";
        let out = run_f64(src, &[0.0, 2.0, 7.0, -1.0]);
        assert_eq!(out, vec![0.0, 1.0, 21.0, 0.0]);
    }

    #[test]
    fn test_loop_variable_survives_loop() {
        let src = "def k(x):\n    for i in range(3):\n        pass_ = i\n    return i + x\n";
        assert_eq!(run_f64(src, &[0.5]), vec![2.5]);
    }

    #[test]
    fn test_while_and_modulo() {
        let src = "def k(x):\n    n = int(x)\n    steps = 0\n    while n != 1:\n        if n % 2 == 0:\n            n = n // 2\n        else:\n            n = 3 * n + 1\n        steps = steps + 1\n    return steps\n";
        assert_eq!(run_f64(src, &[1.0, 6.0, 27.0]), vec![0.0, 8.0, 111.0]);
    }

    #[test]
    fn test_iteration_limit() {
        let program = typed("def k(x):\n    while True:\n        x = x + 1\n    return x\n", &[("x", DType::F64)]);
        let mut out = vec![0.0];
        let err = program
            .run(
                &[ArrayRef::from(&[1.0][..])],
                &mut ArrayMut::from(&mut out),
                &NdContext::linear(1),
                100,
                &mut |_: &str| {},
            )
            .unwrap_err();
        assert_eq!(err, EvalError::IterationLimit { limit: 100, index: 0 });
    }

    #[test]
    fn test_print_hook() {
        let program = typed("def k(x):\n    print(\"x is {}\", x)\n    print(x, x)\n    return x\n", &[("x", DType::I64)]);
        let mut out = vec![0i64; 2];
        let mut lines = Vec::new();
        program
            .run(
                &[ArrayRef::from(&[3i64, 4][..])],
                &mut ArrayMut::from(&mut out),
                &NdContext::linear(2),
                DEFAULT_ITERATION_LIMIT,
                &mut |s: &str| lines.push(s.to_string()),
            )
            .unwrap();
        assert_eq!(lines, vec!["x is 3", "3 3", "x is 4", "4 4"]);
    }

    #[test]
    fn test_reserved_names_from_geometry() {
        let program = typed("def k(x):\n    return x * 0 + _i1 + 10 * _i0\n", &[("x", DType::I64)]);
        let nd = NdContext::new(&[2, 3], &[0, 0], &[2, 3]).unwrap();
        let x = vec![0i64; 6];
        let mut out = vec![0i64; 6];
        program
            .run(&[ArrayRef::from(&x)], &mut ArrayMut::from(&mut out), &nd, 10, &mut |_: &str| {})
            .unwrap();
        assert_eq!(out, vec![0, 1, 2, 10, 11, 12]);
    }

    #[test]
    fn test_local_keeps_first_type() {
        let src = "def k(x):\n    y = 1\n    y = x\n    return y\n";
        assert_eq!(run_f64(src, &[2.7, -2.7]), vec![2.0, -2.0]);
    }

    #[test]
    fn test_missing_return_rejected() {
        let program = parse("def k(x):\n    if x > 0:\n        return x\n").unwrap();
        let err = TypedProgram::new(&program, &[("x".to_string(), DType::F64)]).unwrap_err();
        assert!(!err.is_unsupported());
    }

    #[test]
    fn test_input_validation() {
        let program = typed("def k(x):\n    return x\n", &[("x", DType::F64)]);
        let mut out = vec![0.0; 2];
        let err = program
            .run(
                &[ArrayRef::from(&[1.0f32, 2.0][..])],
                &mut ArrayMut::from(&mut out),
                &NdContext::linear(2),
                10,
                &mut |_: &str| {},
            )
            .unwrap_err();
        assert!(matches!(err, EvalError::InputType { .. }));
    }
}
