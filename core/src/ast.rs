use crate::pragma::Pragmas;

// ============================================================================
// Kernel Syntax Tree
// ============================================================================

/// An expression as written in the source: trimmed text plus its position.
///
/// Expressions are not parsed at statement level; see [`crate::expr`].
#[derive(Debug, Clone, PartialEq)]
pub struct SourceExpr {
    pub text: String,
    pub line: usize,
    pub column: usize,
}

impl SourceExpr {
    pub fn new(text: impl Into<String>, line: usize, column: usize) -> Self {
        SourceExpr {
            text: text.into(),
            line,
            column,
        }
    }
}

pub type Block = Vec<Stmt>;

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElifBranch {
    pub cond: SourceExpr,
    pub block: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `name = value`
    Assign { name: String, value: SourceExpr },
    /// A bare expression evaluated for its side effects.
    Expr(SourceExpr),
    Return(SourceExpr),
    /// `print(...)`; holds the argument list text.
    Print(SourceExpr),
    If {
        cond: SourceExpr,
        then_block: Block,
        elifs: Vec<ElifBranch>,
        else_block: Option<Block>,
    },
    /// `for var in range(args)` with one to three range arguments.
    For {
        var: String,
        range: Vec<SourceExpr>,
        body: Block,
    },
    While { cond: SourceExpr, body: Block },
    /// `break`, or the deprecated guarded form `break if cond`.
    Break { guard: Option<SourceExpr> },
    /// `continue`, or the deprecated guarded form `continue if cond`.
    Continue { guard: Option<SourceExpr> },
}

impl StmtKind {
    /// Short name used in diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            StmtKind::Assign { .. } => "assignment",
            StmtKind::Expr(_) => "expression statement",
            StmtKind::Return(_) => "return",
            StmtKind::Print(_) => "print",
            StmtKind::If { .. } => "if",
            StmtKind::For { .. } => "for",
            StmtKind::While { .. } => "while",
            StmtKind::Break { .. } => "break",
            StmtKind::Continue { .. } => "continue",
        }
    }
}

/// A parsed kernel: `def name(params):` and its body.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub name: String,
    pub params: Vec<String>,
    pub body: Block,
    pub pragmas: Pragmas,
    pub line: usize,
    pub column: usize,
}

impl Program {
    /// Visit every expression in source order.
    pub fn for_each_expr<'a>(&'a self, f: &mut impl FnMut(&'a SourceExpr)) {
        walk_block_exprs(&self.body, f);
    }
}

fn walk_block_exprs<'a>(block: &'a Block, f: &mut impl FnMut(&'a SourceExpr)) {
    for stmt in block {
        match &stmt.kind {
            StmtKind::Assign { value, .. } => f(value),
            StmtKind::Expr(e) | StmtKind::Return(e) | StmtKind::Print(e) => f(e),
            StmtKind::If {
                cond,
                then_block,
                elifs,
                else_block,
            } => {
                f(cond);
                walk_block_exprs(then_block, f);
                for branch in elifs {
                    f(&branch.cond);
                    walk_block_exprs(&branch.block, f);
                }
                if let Some(block) = else_block {
                    walk_block_exprs(block, f);
                }
            }
            StmtKind::For { range, body, .. } => {
                for arg in range {
                    f(arg);
                }
                walk_block_exprs(body, f);
            }
            StmtKind::While { cond, body } => {
                f(cond);
                walk_block_exprs(body, f);
            }
            StmtKind::Break { guard } | StmtKind::Continue { guard } => {
                if let Some(g) = guard {
                    f(g);
                }
            }
        }
    }
}

/// True if every control path through `block` ends in a `return`.
///
/// Loops never count: their body may run zero times.
pub fn block_always_returns(block: &Block) -> bool {
    block.iter().any(stmt_always_returns)
}

fn stmt_always_returns(stmt: &Stmt) -> bool {
    match &stmt.kind {
        StmtKind::Return(_) => true,
        StmtKind::If {
            then_block,
            elifs,
            else_block: Some(else_block),
            ..
        } => {
            block_always_returns(then_block)
                && elifs.iter().all(|b| block_always_returns(&b.block))
                && block_always_returns(else_block)
        }
        _ => false,
    }
}
