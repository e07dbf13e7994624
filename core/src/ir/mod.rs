//! Typed intermediate representation of the compiled kernel subset.

mod builder;
mod fingerprint;

use rustc_hash::FxHashMap;

use crate::dtype::DType;
use crate::expr::{SymbolLookup, TypedExpr};
use crate::pragma::{Dialect, FpMode};

pub use builder::{DefaultResolver, DtypeResolver, build_ir};
pub use fingerprint::{Fnv1a, fingerprint};

// ============================================================================
// IR Types
// ============================================================================

/// An expression with its resolved type, source text and typed tree.
#[derive(Debug, Clone, PartialEq)]
pub struct IrExpr {
    pub text: String,
    pub dtype: DType,
    pub typed: TypedExpr,
    pub line: usize,
    pub column: usize,
}

pub type IrBlock = Vec<IrStmt>;

#[derive(Debug, Clone, PartialEq)]
pub struct IrStmt {
    pub kind: IrStmtKind,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrBranch {
    pub cond: IrExpr,
    pub block: IrBlock,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IrStmtKind {
    Assign {
        name: String,
        value: IrExpr,
    },
    Return(IrExpr),
    If {
        cond: IrExpr,
        then_block: IrBlock,
        elifs: Vec<IrBranch>,
        else_block: Option<IrBlock>,
    },
    /// Counting loop `for var in range(start, limit, step)`.
    For {
        var: String,
        start: i64,
        limit: IrExpr,
        step: i64,
        body: IrBlock,
    },
    Break,
    Continue,
}

/// How a name entered the symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Param,
    Local,
    LoopVar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub dtype: DType,
    pub kind: SymbolKind,
}

/// Names visible while building IR, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    index: FxHashMap<String, usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a symbol; returns false if the name already exists.
    pub fn declare(&mut self, name: &str, dtype: DType, kind: SymbolKind) -> bool {
        if self.index.contains_key(name) {
            return false;
        }
        self.index.insert(name.to_string(), self.symbols.len());
        self.symbols.push(Symbol {
            name: name.to_string(),
            dtype,
            kind,
        });
        true
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.index.get(name).map(|&i| &self.symbols[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl SymbolLookup for SymbolTable {
    fn lookup(&self, name: &str) -> Option<DType> {
        self.get(name).map(|s| s.dtype)
    }
}

/// A kernel lowered to the typed IR.
#[derive(Debug, Clone, PartialEq)]
pub struct IrProgram {
    pub name: String,
    pub params: Vec<(String, DType)>,
    /// Locals and loop variables discovered while building, in order.
    pub locals: Vec<(String, DType)>,
    pub block: IrBlock,
    pub return_dtype: DType,
    pub dialect: Dialect,
    pub fp_mode: FpMode,
}

impl IrProgram {
    pub fn param_dtypes(&self) -> Vec<DType> {
        self.params.iter().map(|(_, dt)| *dt).collect()
    }

    pub fn fingerprint(&self) -> u64 {
        fingerprint(self)
    }
}
