//! Expression syntax: tokenizer-driven recursive descent parser for the
//! Python-like expressions used inside kernel statements.

pub mod func;
pub mod types;

use std::fmt;

use crate::error::ExprError;
use crate::lexer::{Lexer, Token};

pub use func::MathFunc;
pub use types::{SymbolLookup, TypedExpr, TypedKind, infer};

/// Deepest allowed expression nesting.
pub const MAX_EXPR_DEPTH: usize = 64;

/// Maximum number of dimensions addressable through reserved index symbols.
pub const MAX_DIMS: usize = 8;

// ============================================================================
// Syntax Tree
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    BitOr,
    BitXor,
    BitAnd,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "or",
            BinaryOp::And => "and",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::BitAnd => "&",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::BitAnd | BinaryOp::Shl | BinaryOp::Shr
        )
    }

    fn from_comparison(token: &str) -> Option<BinaryOp> {
        Some(match token {
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int { value: u64, text: String },
    Float { value: f64, text: String },
    Bool(bool),
    Str(String),
    Name(String),
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Call { func: String, args: Vec<Expr> },
}

impl Expr {
    /// Every identifier referenced as a value, in first-use order.
    pub fn names(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_names(&mut out);
        out
    }

    fn collect_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Name(n) => {
                if !out.contains(&n.as_str()) {
                    out.push(n);
                }
            }
            Expr::Unary { operand, .. } => operand.collect_names(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_names(out);
                rhs.collect_names(out);
            }
            Expr::Call { args, .. } => {
                for a in args {
                    a.collect_names(out);
                }
            }
            _ => {}
        }
    }

    /// Every called function name.
    pub fn called_functions(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_calls(&mut out);
        out
    }

    fn collect_calls<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Call { func, args } => {
                out.push(func);
                for a in args {
                    a.collect_calls(out);
                }
            }
            Expr::Unary { operand, .. } => operand.collect_calls(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_calls(out);
                rhs.collect_calls(out);
            }
            _ => {}
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expr::Int { text, .. } | Expr::Float { text, .. } => write!(f, "{text}"),
            Expr::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Expr::Str(s) => write!(f, "{s:?}"),
            Expr::Name(n) => write!(f, "{n}"),
            Expr::Unary { op, operand } => match op {
                UnaryOp::Neg => write!(f, "(-{operand})"),
                UnaryOp::Pos => write!(f, "(+{operand})"),
                UnaryOp::Not => write!(f, "(not {operand})"),
                UnaryOp::BitNot => write!(f, "(~{operand})"),
            },
            Expr::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Expr::Call { func, args } => {
                write!(f, "{func}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

// ============================================================================
// Reserved Symbols
// ============================================================================

/// Names the engine materializes from array geometry instead of input buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reserved {
    /// `_i<d>`: index along dimension `d`.
    Index(usize),
    /// `_n<d>`: global extent of dimension `d`.
    Extent(usize),
    /// `_ndim`: number of dimensions.
    NDim,
    /// `_flat_idx`: C-order linear index into the global array.
    FlatIdx,
}

impl Reserved {
    pub fn parse(name: &str) -> Option<Reserved> {
        match name {
            "_ndim" => return Some(Reserved::NDim),
            "_flat_idx" => return Some(Reserved::FlatIdx),
            _ => {}
        }
        let (ctor, digits): (fn(usize) -> Reserved, &str) =
            if let Some(d) = name.strip_prefix("_i") {
                (Reserved::Index, d)
            } else if let Some(d) = name.strip_prefix("_n") {
                (Reserved::Extent, d)
            } else {
                return None;
            };
        if digits.len() != 1 {
            return None;
        }
        let dim = digits.parse::<usize>().ok()?;
        (dim < MAX_DIMS).then(|| ctor(dim))
    }

    /// Per-dimension symbols need full ND geometry.
    pub fn is_per_dimension(self) -> bool {
        matches!(self, Reserved::Index(_) | Reserved::Extent(_))
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Parse one expression.
pub fn parse_expr(text: &str) -> Result<Expr, ExprError> {
    let tokens = Lexer::tokenize(text)?;
    let mut parser = ExprParser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    let (token, offset) = parser.peek();
    if *token != Token::Eof {
        return Err(ExprError::new(offset, format!("unexpected {}", describe(token))));
    }
    Ok(expr)
}

/// Parse a comma-separated argument list (as found inside `print(...)`).
pub fn parse_expr_list(text: &str) -> Result<Vec<Expr>, ExprError> {
    let tokens = Lexer::tokenize(text)?;
    let mut parser = ExprParser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let mut items = Vec::new();
    if *parser.peek().0 == Token::Eof {
        return Ok(items);
    }
    loop {
        items.push(parser.parse_or()?);
        let (token, offset) = parser.peek();
        match token {
            Token::Eof => return Ok(items),
            Token::Punct(",") => parser.pos += 1,
            other => {
                return Err(ExprError::new(offset, format!("unexpected {}", describe(other))));
            }
        }
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Eof => "end of expression".to_string(),
        Token::Punct(p) => format!("'{p}'"),
        Token::Ident(n) => format!("'{n}'"),
        Token::Int { text, .. } | Token::Float { text, .. } => format!("'{text}'"),
        Token::Str(_) => "string literal".to_string(),
    }
}

struct ExprParser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl ExprParser {
    fn peek(&self) -> (&Token, usize) {
        let idx = self.pos.min(self.tokens.len() - 1);
        let (token, offset) = &self.tokens[idx];
        (token, *offset)
    }

    fn bump(&mut self) -> (Token, usize) {
        let idx = self.pos.min(self.tokens.len() - 1);
        self.pos += 1;
        self.tokens[idx].clone()
    }

    fn at_punct(&self, p: &str) -> bool {
        matches!(self.peek().0, Token::Punct(q) if *q == p)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek().0, Token::Ident(n) if n == kw)
    }

    fn enter(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_EXPR_DEPTH {
            return Err(ExprError::new(self.peek().1, "expression nested too deeply"));
        }
        Ok(())
    }

    fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        self.enter()?;
        let mut lhs = self.parse_and()?;
        while self.at_keyword("or") {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Self::binary(BinaryOp::Or, lhs, rhs);
        }
        self.depth -= 1;
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_not()?;
        while self.at_keyword("and") {
            self.bump();
            let rhs = self.parse_not()?;
            lhs = Self::binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if self.at_keyword("not") {
            self.bump();
            self.enter()?;
            let operand = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_bitor()?;
        let op = match self.peek().0 {
            Token::Punct(p) => BinaryOp::from_comparison(p),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(lhs);
        };
        self.bump();
        let rhs = self.parse_bitor()?;
        if let Token::Punct(p) = self.peek().0
            && BinaryOp::from_comparison(p).is_some()
        {
            return Err(ExprError::new(
                self.peek().1,
                "chained comparisons are not supported",
            ));
        }
        Ok(Self::binary(op, lhs, rhs))
    }

    fn parse_left_assoc(
        &mut self,
        ops: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, ExprError>,
    ) -> Result<Expr, ExprError> {
        let mut lhs = next(self)?;
        loop {
            let found = ops.iter().find(|(p, _)| self.at_punct(p)).map(|(_, op)| *op);
            let Some(op) = found else {
                return Ok(lhs);
            };
            self.bump();
            let rhs = next(self)?;
            lhs = Self::binary(op, lhs, rhs);
        }
    }

    fn parse_bitor(&mut self) -> Result<Expr, ExprError> {
        self.parse_left_assoc(&[("|", BinaryOp::BitOr)], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> Result<Expr, ExprError> {
        self.parse_left_assoc(&[("^", BinaryOp::BitXor)], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> Result<Expr, ExprError> {
        self.parse_left_assoc(&[("&", BinaryOp::BitAnd)], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> Result<Expr, ExprError> {
        self.parse_left_assoc(
            &[("<<", BinaryOp::Shl), (">>", BinaryOp::Shr)],
            Self::parse_arith,
        )
    }

    fn parse_arith(&mut self) -> Result<Expr, ExprError> {
        self.parse_left_assoc(
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            Self::parse_term,
        )
    }

    fn parse_term(&mut self) -> Result<Expr, ExprError> {
        self.parse_left_assoc(
            &[
                ("*", BinaryOp::Mul),
                ("/", BinaryOp::Div),
                ("//", BinaryOp::FloorDiv),
                ("%", BinaryOp::Mod),
            ],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        let op = if self.at_punct("-") {
            Some(UnaryOp::Neg)
        } else if self.at_punct("+") {
            Some(UnaryOp::Pos)
        } else if self.at_punct("~") {
            Some(UnaryOp::BitNot)
        } else {
            None
        };
        if let Some(op) = op {
            self.bump();
            self.enter()?;
            let operand = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr, ExprError> {
        let base = self.parse_atom()?;
        if self.at_punct("**") {
            self.bump();
            self.enter()?;
            let exponent = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Self::binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<Expr, ExprError> {
        let (token, offset) = self.bump();
        match token {
            Token::Int { value, text } => Ok(Expr::Int { value, text }),
            Token::Float { value, text } => Ok(Expr::Float { value, text }),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Ident(name) => match name.as_str() {
                "True" => Ok(Expr::Bool(true)),
                "False" => Ok(Expr::Bool(false)),
                "and" | "or" | "not" | "if" | "else" | "in" | "lambda" => Err(ExprError::new(
                    offset,
                    format!("unexpected keyword '{name}'"),
                )),
                _ if self.at_punct("(") => {
                    self.bump();
                    let args = self.parse_call_args()?;
                    Ok(Expr::Call { func: name, args })
                }
                _ => Ok(Expr::Name(name)),
            },
            Token::Punct("(") => {
                let inner = self.parse_or()?;
                if !self.at_punct(")") {
                    let (tok, off) = self.peek();
                    return Err(ExprError::new(off, format!("expected ')', found {}", describe(tok))));
                }
                self.bump();
                Ok(inner)
            }
            other => Err(ExprError::new(offset, format!("unexpected {}", describe(&other)))),
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        if self.at_punct(")") {
            self.bump();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            if self.at_punct(",") {
                self.bump();
                continue;
            }
            if self.at_punct(")") {
                self.bump();
                return Ok(args);
            }
            let (tok, off) = self.peek();
            return Err(ExprError::new(
                off,
                format!("expected ',' or ')' in call, found {}", describe(tok)),
            ));
        }
    }
}
