use tracing::debug;

use crate::ast::{Block, Program, SourceExpr, StmtKind, block_always_returns};
use crate::dtype::DType;
use crate::error::IrError;
use crate::expr::func::REDUCTIONS;
use crate::expr::{Expr, Reserved, infer, parse_expr};
use crate::ir::{IrBlock, IrBranch, IrExpr, IrProgram, IrStmt, IrStmtKind, SymbolKind, SymbolTable};

/// Supplies the scalar type of an expression span.
///
/// The resolver only sees the span and the names declared so far. Its verdict
/// declares locals and must match the type of the lowered expression tree;
/// a disagreement is a type error.
pub trait DtypeResolver {
    fn resolve(&mut self, expr: &SourceExpr, symbols: &SymbolTable) -> Result<DType, String>;
}

impl<F> DtypeResolver for F
where
    F: FnMut(&SourceExpr, &SymbolTable) -> Result<DType, String>,
{
    fn resolve(&mut self, expr: &SourceExpr, symbols: &SymbolTable) -> Result<DType, String> {
        self(expr, symbols)
    }
}

/// Resolver backed by the built-in expression type inference.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolver;

impl DtypeResolver for DefaultResolver {
    fn resolve(&mut self, expr: &SourceExpr, symbols: &SymbolTable) -> Result<DType, String> {
        let parsed = parse_expr(&expr.text).map_err(|e| e.to_string())?;
        infer(&parsed, symbols)
            .map(|t| t.dtype)
            .map_err(|e| e.message)
    }
}

/// Lower `program` to typed IR.
///
/// `params` supplies a dtype for every `def` parameter; reserved geometry names
/// in `params` that the signature does not list become trailing implicit
/// parameters.
pub fn build_ir(
    program: &Program,
    params: &[(String, DType)],
    resolver: &mut dyn DtypeResolver,
) -> Result<IrProgram, IrError> {
    if !block_always_returns(&program.body) {
        return Err(IrError::type_error(
            program.line,
            program.column,
            "kernel does not return a value on every control path",
        ));
    }

    let mut symbols = SymbolTable::new();
    let mut ir_params = Vec::new();
    for name in &program.params {
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
        symbols.declare(name, dtype, SymbolKind::Param);
        ir_params.push((name.clone(), dtype));
    }
    for (name, dtype) in params {
        if Reserved::parse(name).is_some() && symbols.get(name).is_none() {
            symbols.declare(name, *dtype, SymbolKind::Param);
            ir_params.push((name.clone(), *dtype));
        }
    }

    let mut builder = Builder {
        symbols,
        resolver,
        return_dtype: None,
    };
    let block = builder.build_block(&program.body, false)?;
    let return_dtype = builder.return_dtype.ok_or_else(|| {
        IrError::type_error(program.line, program.column, "kernel has no return statement")
    })?;

    let locals = builder
        .symbols
        .iter()
        .filter(|s| s.kind != SymbolKind::Param)
        .map(|s| (s.name.clone(), s.dtype))
        .collect();

    let ir = IrProgram {
        name: program.name.clone(),
        params: ir_params,
        locals,
        block,
        return_dtype,
        dialect: program.pragmas.dialect,
        fp_mode: program.pragmas.fp_mode,
    };
    debug!(
        kernel = %ir.name,
        params = ir.params.len(),
        locals = ir.locals.len(),
        return_dtype = %ir.return_dtype,
        "built jit ir"
    );
    Ok(ir)
}

// ============================================================================
// Builder
// ============================================================================

struct Builder<'r> {
    symbols: SymbolTable,
    resolver: &'r mut dyn DtypeResolver,
    return_dtype: Option<DType>,
}

impl Builder<'_> {
    fn build_block(&mut self, block: &Block, in_loop: bool) -> Result<IrBlock, IrError> {
        let mut out = Vec::with_capacity(block.len());
        for stmt in block {
            let (line, column) = (stmt.line, stmt.column);
            let unsupported = |what: &str| {
                IrError::unsupported(line, column, format!("{what} not supported by jit ir"))
            };

            let kind = match &stmt.kind {
                StmtKind::Assign { name, value } => self.build_assign(name, value, line, column)?,
                StmtKind::Expr(_) => return Err(unsupported("expression statements are")),
                StmtKind::Print(_) => return Err(unsupported("print is")),
                StmtKind::While { .. } => return Err(unsupported("while loops are")),
                StmtKind::Return(value) => {
                    let value = self.build_expr(value)?;
                    match self.return_dtype {
                        None => self.return_dtype = Some(value.dtype),
                        Some(dt) if dt != value.dtype => {
                            return Err(IrError::unsupported(
                                value.line,
                                value.column,
                                format!(
                                    "return type mismatch: {} here but {} earlier",
                                    value.dtype, dt
                                ),
                            ));
                        }
                        Some(_) => {}
                    }
                    IrStmtKind::Return(value)
                }
                StmtKind::If {
                    cond,
                    then_block,
                    elifs,
                    else_block,
                } => {
                    let cond = self.build_expr(cond)?;
                    let then_block = self.build_block(then_block, in_loop)?;
                    let mut ir_elifs = Vec::with_capacity(elifs.len());
                    for branch in elifs {
                        let cond = self.build_expr(&branch.cond)?;
                        let block = self.build_block(&branch.block, in_loop)?;
                        ir_elifs.push(IrBranch { cond, block });
                    }
                    let else_block = match else_block {
                        Some(b) => Some(self.build_block(b, in_loop)?),
                        None => None,
                    };
                    IrStmtKind::If {
                        cond,
                        then_block,
                        elifs: ir_elifs,
                        else_block,
                    }
                }
                StmtKind::For { var, range, body } => {
                    if range.len() != 1 {
                        return Err(unsupported("range() with more than one argument is"));
                    }
                    if self.symbols.get(var).is_some() {
                        return Err(IrError::unsupported(
                            line,
                            column,
                            format!("for-loop variable '{var}' must be a new temporary for jit ir"),
                        ));
                    }
                    let limit = self.build_expr(&range[0])?;
                    if !limit.dtype.is_integral() {
                        return Err(IrError::type_error(
                            limit.line,
                            limit.column,
                            format!("range() argument must be an integer, got {}", limit.dtype),
                        ));
                    }
                    self.symbols.declare(var, DType::I64, SymbolKind::LoopVar);
                    let body = self.build_block(body, true)?;
                    IrStmtKind::For {
                        var: var.clone(),
                        start: 0,
                        limit,
                        step: 1,
                        body,
                    }
                }
                StmtKind::Break { guard } | StmtKind::Continue { guard } => {
                    if guard.is_some() {
                        return Err(unsupported("guarded break/continue is"));
                    }
                    if !in_loop {
                        return Err(IrError::type_error(
                            line,
                            column,
                            format!("'{}' outside loop", stmt.kind.describe()),
                        ));
                    }
                    if matches!(stmt.kind, StmtKind::Break { .. }) {
                        IrStmtKind::Break
                    } else {
                        IrStmtKind::Continue
                    }
                }
            };
            out.push(IrStmt { kind, line, column });
        }
        Ok(out)
    }

    fn build_assign(
        &mut self,
        name: &str,
        value: &SourceExpr,
        line: usize,
        column: usize,
    ) -> Result<IrStmtKind, IrError> {
        match self.symbols.get(name).map(|s| s.kind) {
            Some(SymbolKind::Param) => {
                return Err(IrError::unsupported(
                    line,
                    column,
                    format!("cannot assign to parameter '{name}' in jit ir"),
                ));
            }
            Some(SymbolKind::LoopVar) => {
                return Err(IrError::unsupported(
                    line,
                    column,
                    format!("cannot assign to loop variable '{name}' in jit ir"),
                ));
            }
            _ => {}
        }
        if Reserved::parse(name).is_some() {
            return Err(IrError::type_error(
                line,
                column,
                format!("'{name}' is a reserved name"),
            ));
        }

        let value = self.build_expr(value)?;
        match self.symbols.get(name) {
            Some(existing) if existing.dtype != value.dtype => {
                return Err(IrError::type_error(
                    value.line,
                    value.column,
                    format!(
                        "local '{name}' is {} but is re-assigned a {} value",
                        existing.dtype, value.dtype
                    ),
                ));
            }
            Some(_) => {}
            None => {
                self.symbols.declare(name, value.dtype, SymbolKind::Local);
            }
        }
        Ok(IrStmtKind::Assign {
            name: name.to_string(),
            value,
        })
    }

    fn build_expr(&mut self, source: &SourceExpr) -> Result<IrExpr, IrError> {
        let (line, column) = (source.line, source.column);
        let parsed = parse_expr(&source.text).map_err(|e| {
            IrError::type_error(line, column + e.offset, format!("invalid expression: {}", e.message))
        })?;
        reject_reductions(&parsed, line, column)?;

        let dtype = self
            .resolver
            .resolve(source, &self.symbols)
            .map_err(|msg| IrError::type_error(line, column, msg))?;
        let typed = infer(&parsed, &self.symbols).map_err(|e| {
            IrError::type_error(line, column, format!("cannot lower '{}': {}", source.text, e.message))
        })?;
        if typed.dtype != dtype {
            return Err(IrError::type_error(
                line,
                column,
                format!(
                    "resolver assigned {} to '{}' but it evaluates as {}",
                    dtype.name(),
                    source.text,
                    typed.dtype.name()
                ),
            ));
        }

        Ok(IrExpr {
            text: source.text.clone(),
            dtype,
            typed,
            line,
            column,
        })
    }
}

fn reject_reductions(expr: &Expr, line: usize, column: usize) -> Result<(), IrError> {
    if let Some(name) = expr
        .called_functions()
        .into_iter()
        .find(|f| REDUCTIONS.contains(f))
    {
        return Err(IrError::unsupported(
            line,
            column,
            format!("reduction '{name}' is not supported by jit ir"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IrErrorKind;
    use crate::parser::parse;

    fn f64_params(names: &[&str]) -> Vec<(String, DType)> {
        names.iter().map(|n| (n.to_string(), DType::F64)).collect()
    }

    fn build(src: &str, params: &[(String, DType)]) -> Result<IrProgram, IrError> {
        let program = parse(src).unwrap();
        build_ir(&program, params, &mut DefaultResolver)
    }

    #[test]
    fn test_simple_kernel() {
        let ir = build("def k(x):\n    y = x * 2\n    return y + 1\n", &f64_params(&["x"])).unwrap();
        assert_eq!(ir.params, vec![("x".to_string(), DType::F64)]);
        assert_eq!(ir.locals, vec![("y".to_string(), DType::F64)]);
        assert_eq!(ir.return_dtype, DType::F64);
        assert_eq!(ir.block.len(), 2);
    }

    #[test]
    fn test_resolver_sees_declared_locals() {
        let program = parse("def k(x):\n    y = x\n    return y\n").unwrap();
        let mut seen = Vec::new();
        let mut resolver = |expr: &SourceExpr, symbols: &SymbolTable| {
            seen.push((expr.text.clone(), symbols.len()));
            Ok(DType::F64)
        };
        build_ir(&program, &f64_params(&["x"]), &mut resolver).unwrap();
        assert_eq!(seen, vec![("x".to_string(), 1), ("y".to_string(), 2)]);
    }

    #[test]
    fn test_resolver_failure_is_type_error() {
        let program = parse("def k(x):\n    return x\n").unwrap();
        let mut resolver =
            |_: &SourceExpr, _: &SymbolTable| -> Result<DType, String> { Err("complex128 unsupported".into()) };
        let err = build_ir(&program, &f64_params(&["x"]), &mut resolver).unwrap_err();
        assert_eq!(err.kind, IrErrorKind::Type);
        assert_eq!((err.line, err.column), (2, 12));
    }

    #[test]
    fn test_resolver_disagreeing_with_expression_is_type_error() {
        let program = parse("def k(x):\n    y = x + 0.5\n    return y\n").unwrap();
        let mut resolver = |_: &SourceExpr, _: &SymbolTable| -> Result<DType, String> { Ok(DType::I64) };
        let err = build_ir(&program, &f64_params(&["x"]), &mut resolver).unwrap_err();
        assert_eq!(err.kind, IrErrorKind::Type);
        assert_eq!((err.line, err.column), (2, 9));
        assert!(err.message.contains("int64"));
        assert!(err.message.contains("float64"));
    }

    #[test]
    fn test_agreeing_resolver_types_the_tree() {
        let program = parse("def k(x, n):\n    y = n * 2\n    return x + y\n").unwrap();
        let params = vec![("x".to_string(), DType::F64), ("n".to_string(), DType::I32)];
        let mut calls = 0;
        let mut resolver = |expr: &SourceExpr, symbols: &SymbolTable| {
            calls += 1;
            DefaultResolver.resolve(expr, symbols)
        };
        let ir = build_ir(&program, &params, &mut resolver).unwrap();
        assert_eq!(calls, 2);
        assert_eq!(ir.locals, vec![("y".to_string(), DType::I32)]);
        assert_eq!(ir.return_dtype, DType::F64);
        let IrStmtKind::Assign { value, .. } = &ir.block[0].kind else {
            panic!("expected assignment");
        };
        assert_eq!(value.typed.dtype, value.dtype);
    }

    #[test]
    fn test_unlowerable_expression_fails_even_if_resolver_accepts() {
        let program = parse("def k(x):\n    return mystery(x)\n").unwrap();
        let mut resolver = |_: &SourceExpr, _: &SymbolTable| -> Result<DType, String> { Ok(DType::F64) };
        let err = build_ir(&program, &f64_params(&["x"]), &mut resolver).unwrap_err();
        assert_eq!(err.kind, IrErrorKind::Type);
        assert!(err.message.contains("cannot lower 'mystery(x)'"));
    }

    #[test]
    fn test_rejects_print_and_expression_statements() {
        let err = build("def k(x):\n    print(x)\n    return x\n", &f64_params(&["x"])).unwrap_err();
        assert!(err.is_unsupported());
        assert!(err.message.contains("print"));
        let err = build("def k(x):\n    x + 1\n    return x\n", &f64_params(&["x"])).unwrap_err();
        assert!(err.message.contains("expression statements"));
    }

    #[test]
    fn test_rejects_while() {
        let src = "def k(x):\n    n = 0\n    while n < 3:\n        n = n + 1\n    return n\n";
        let err = build(src, &f64_params(&["x"])).unwrap_err();
        assert!(err.message.contains("while"));
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_rejects_multi_arg_range() {
        let src = "def k(x):\n    s = 0\n    for i in range(1, 4):\n        s = s + i\n    return s\n";
        let err = build(src, &f64_params(&["x"])).unwrap_err();
        assert!(err.message.contains("range()"));
    }

    #[test]
    fn test_rejects_guarded_break() {
        let src = "def k(x):\n    s = 0\n    for i in range(4):\n        break if i > 1\n    return s\n";
        let err = build(src, &f64_params(&["x"])).unwrap_err();
        assert!(err.message.contains("guarded"));
    }

    #[test]
    fn test_rejects_param_assignment() {
        let err = build("def k(x):\n    x = 1.0\n    return x\n", &f64_params(&["x"])).unwrap_err();
        assert!(err.message.contains("parameter"));
    }

    #[test]
    fn test_rejects_sequential_loop_var_reuse() {
        let src = "def k(x):\n    s = 0\n    for i in range(2):\n        s = s + i\n    for i in range(3):\n        s = s + i\n    return s\n";
        let err = build(src, &f64_params(&["x"])).unwrap_err();
        assert_eq!(err.line, 5);
        assert!(err.message.contains("new temporary"));
    }

    #[test]
    fn test_rejects_local_type_change() {
        let src = "def k(x):\n    y = 1\n    y = x\n    return y\n";
        let err = build(src, &f64_params(&["x"])).unwrap_err();
        assert_eq!(err.kind, IrErrorKind::Type);
        assert!(err.message.contains("re-assigned"));
    }

    #[test]
    fn test_rejects_return_mismatch() {
        let src = "def k(x):\n    if x > 0:\n        return 1\n    return x\n";
        let err = build(src, &f64_params(&["x"])).unwrap_err();
        assert!(err.message.contains("return type mismatch"));
        assert_eq!(err.line, 4);
    }

    #[test]
    fn test_rejects_reductions() {
        let err = build("def k(x):\n    return sum(x)\n", &f64_params(&["x"])).unwrap_err();
        assert!(err.is_unsupported());
        assert!(err.message.contains("reduction"));
    }

    #[test]
    fn test_missing_param_dtype() {
        let err = build("def k(x, y):\n    return x\n", &f64_params(&["x"])).unwrap_err();
        assert_eq!(err.kind, IrErrorKind::Type);
    }

    #[test]
    fn test_nested_control_flow() {
        let src = "# me:dialect=element\ndef k(x):\n    acc = 0\n    for i in range(6):\n        if x > i:\n            acc = acc + i\n        else:\n            break\n    return acc\n";
        let ir = build(src, &f64_params(&["x"])).unwrap();
        assert_eq!(ir.return_dtype, DType::I64);
        assert_eq!(
            ir.locals,
            vec![("acc".to_string(), DType::I64), ("i".to_string(), DType::I64)]
        );
        match &ir.block[1].kind {
            IrStmtKind::For { start, step, body, .. } => {
                assert_eq!((*start, *step), (0, 1));
                assert!(matches!(body[0].kind, IrStmtKind::If { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_implicit_reserved_params() {
        let params = vec![
            ("x".to_string(), DType::F32),
            ("_i0".to_string(), DType::I64),
            ("unused".to_string(), DType::F64),
        ];
        let ir = build("def k(x):\n    return x + _i0\n", &params).unwrap();
        assert_eq!(
            ir.params,
            vec![("x".to_string(), DType::F32), ("_i0".to_string(), DType::I64)]
        );
    }

    #[test]
    fn test_float_range_limit_rejected() {
        let src = "def k(x):\n    s = 0\n    for i in range(x):\n        s = s + i\n    return s\n";
        let err = build(src, &f64_params(&["x"])).unwrap_err();
        assert_eq!(err.kind, IrErrorKind::Type);
    }
}
