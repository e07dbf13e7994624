//! Stable structural hash of an [`IrProgram`].
//!
//! The hash keys both the in-process and on-disk kernel caches, so its
//! input encoding must not change between releases without bumping the
//! cache metadata version.

use crate::ir::{IrBlock, IrExpr, IrProgram, IrStmtKind};

const FNV_OFFSET: u64 = 1469598103934665603;
const FNV_PRIME: u64 = 1099511628211;

/// 64-bit FNV-1a hasher.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a(u64);

impl Default for Fnv1a {
    fn default() -> Self {
        Fnv1a(FNV_OFFSET)
    }
}

impl Fnv1a {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, byte: u8) {
        self.0 ^= u64::from(byte);
        self.0 = self.0.wrapping_mul(FNV_PRIME);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_u8(b);
        }
    }

    /// Little-endian, so the hash does not depend on host byte order.
    pub fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Strings are NUL terminated so adjacent strings cannot alias.
    pub fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
        self.write_u8(0);
    }

    pub fn finish(&self) -> u64 {
        self.0
    }
}

// Statement kind tags; part of the persisted key.
const TAG_ASSIGN: u8 = 1;
const TAG_RETURN: u8 = 2;
const TAG_IF: u8 = 3;
const TAG_FOR: u8 = 4;
const TAG_BREAK: u8 = 5;
const TAG_CONTINUE: u8 = 6;

/// Hash the kernel's name, dialect, fp mode, signature and statement tree.
///
/// Source positions are excluded: moving a kernel within a file or
/// re-indenting it does not change its key.
pub fn fingerprint(program: &IrProgram) -> u64 {
    let mut h = Fnv1a::new();
    h.write_str(&program.name);
    h.write_u8(program.dialect.code());
    h.write_u8(program.fp_mode.code());
    h.write_u64(program.params.len() as u64);
    for (name, dtype) in &program.params {
        h.write_str(name);
        h.write_u8(dtype.code());
    }
    h.write_u8(program.return_dtype.code());
    hash_block(&mut h, &program.block);
    h.finish()
}

fn hash_expr(h: &mut Fnv1a, expr: &IrExpr) {
    h.write_str(&expr.text);
    h.write_u8(expr.dtype.code());
}

fn hash_block(h: &mut Fnv1a, block: &IrBlock) {
    h.write_u64(block.len() as u64);
    for stmt in block {
        match &stmt.kind {
            IrStmtKind::Assign { name, value } => {
                h.write_u8(TAG_ASSIGN);
                h.write_str(name);
                hash_expr(h, value);
            }
            IrStmtKind::Return(value) => {
                h.write_u8(TAG_RETURN);
                hash_expr(h, value);
            }
            IrStmtKind::If {
                cond,
                then_block,
                elifs,
                else_block,
            } => {
                h.write_u8(TAG_IF);
                hash_expr(h, cond);
                hash_block(h, then_block);
                h.write_u64(elifs.len() as u64);
                for branch in elifs {
                    hash_expr(h, &branch.cond);
                    hash_block(h, &branch.block);
                }
                h.write_u8(u8::from(else_block.is_some()));
                if let Some(block) = else_block {
                    hash_block(h, block);
                }
            }
            IrStmtKind::For {
                var, limit, body, ..
            } => {
                h.write_u8(TAG_FOR);
                h.write_str(var);
                hash_expr(h, limit);
                hash_block(h, body);
            }
            IrStmtKind::Break => h.write_u8(TAG_BREAK),
            IrStmtKind::Continue => h.write_u8(TAG_CONTINUE),
        }
    }
}
