//! Kernel language definition for veckern
//!
//! This crate contains the scalar dtypes, the line-oriented kernel parser,
//! the expression language with its type rules, and the typed IR that the
//! code generator consumes. It does not compile or run kernels; that lives
//! in the `veckern-engine` crate.

pub mod ast;
pub mod dtype;
pub mod error;
pub mod expr;
pub mod ir;
pub mod lexer;
pub mod parser;
pub mod pragma;

// Re-export commonly used items for convenience
pub use ast::{Block, ElifBranch, Program, SourceExpr, Stmt, StmtKind};
pub use dtype::DType;
pub use error::{ExprError, IrError, IrErrorKind, ParseError};
pub use expr::{Expr, MathFunc, Reserved, TypedExpr, TypedKind, infer, parse_expr};
pub use ir::{
    DefaultResolver, DtypeResolver, IrBlock, IrExpr, IrProgram, IrStmt, IrStmtKind, SymbolTable,
    build_ir, fingerprint,
};
pub use parser::parse;
pub use pragma::{CompilerPref, Dialect, FpMode, Pragmas};
