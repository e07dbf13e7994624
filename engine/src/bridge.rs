//! Runtime math bridge shared by generated kernels and the interpreter.
//!
//! Generated C calls math routines through a table of function pointers that
//! the loader binds once per library via the exported `me_jit_bridge_bind`
//! entry point. Every table entry forwards to [`eval_f64`] or [`eval_f32`],
//! which the interpreter calls directly, so both paths compute identical
//! results.
//!
//! Table layout (ABI v1): four slots per [`MathFunc`] in `MathFunc::ALL`
//! order (scalar f64, scalar f32, vector f64, vector f32), followed by one
//! `where` slot.

use std::f64::consts::PI;
use std::ffi::c_void;

use once_cell::sync::Lazy;
use veckern::MathFunc;

pub const BRIDGE_ABI_VERSION: i32 = 1;

/// Entry point every bridged library exports.
pub const BRIDGE_BIND_SYMBOL: &str = "me_jit_bridge_bind";

pub const SLOTS_PER_FUNC: usize = 4;
pub const WHERE_SLOT: usize = MathFunc::ALL.len() * SLOTS_PER_FUNC;
pub const BRIDGE_TABLE_LEN: usize = WHERE_SLOT + 1;

/// Which flavour of a math routine a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlotKind {
    ScalarF64 = 0,
    ScalarF32 = 1,
    VecF64 = 2,
    VecF32 = 3,
}

pub fn slot(func: MathFunc, kind: SlotKind) -> usize {
    func.index() * SLOTS_PER_FUNC + kind as usize
}

/// C-visible name of a bridge routine.
pub fn symbol_name(func: MathFunc, kind: SlotKind) -> String {
    match kind {
        SlotKind::ScalarF64 => format!("me_jit_{}", func.name()),
        SlotKind::ScalarF32 => format!("me_jit_{}f", func.name()),
        SlotKind::VecF64 => format!("me_jit_vec_{}_f64", func.name()),
        SlotKind::VecF32 => format!("me_jit_vec_{}_f32", func.name()),
    }
}

// ============================================================================
// Scalar Math
// ============================================================================

fn sinpi(x: f64) -> f64 {
    if !x.is_finite() {
        return f64::NAN;
    }
    let r = x % 2.0;
    if r == r.trunc() {
        return 0.0f64.copysign(x);
    }
    (PI * r).sin()
}

fn cospi(x: f64) -> f64 {
    if !x.is_finite() {
        return f64::NAN;
    }
    let r = (x % 2.0).abs();
    if r == 0.5 || r == 1.5 {
        return 0.0;
    }
    (PI * r).cos()
}

fn logaddexp(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == b {
        return a + std::f64::consts::LN_2;
    }
    let m = a.max(b);
    m + (-(a - b).abs()).exp().ln_1p()
}

/// Evaluate `func` in double precision; `b` is ignored for unary functions.
pub fn eval_f64(func: MathFunc, a: f64, b: f64) -> f64 {
    match func {
        MathFunc::Abs => a.abs(),
        MathFunc::Sin => a.sin(),
        MathFunc::Cos => a.cos(),
        MathFunc::Tan => a.tan(),
        MathFunc::Asin => a.asin(),
        MathFunc::Acos => a.acos(),
        MathFunc::Atan => a.atan(),
        MathFunc::Sinh => a.sinh(),
        MathFunc::Cosh => a.cosh(),
        MathFunc::Tanh => a.tanh(),
        MathFunc::Asinh => a.asinh(),
        MathFunc::Acosh => a.acosh(),
        MathFunc::Atanh => a.atanh(),
        MathFunc::Exp => a.exp(),
        MathFunc::Exp2 => a.exp2(),
        MathFunc::Exp10 => 10f64.powf(a),
        MathFunc::Expm1 => a.exp_m1(),
        MathFunc::Log => a.ln(),
        MathFunc::Log2 => a.log2(),
        MathFunc::Log10 => a.log10(),
        MathFunc::Log1p => a.ln_1p(),
        MathFunc::Sqrt => a.sqrt(),
        MathFunc::Cbrt => a.cbrt(),
        MathFunc::Floor => a.floor(),
        MathFunc::Ceil => a.ceil(),
        MathFunc::Round => a.round_ties_even(),
        MathFunc::Trunc => a.trunc(),
        MathFunc::Sinpi => sinpi(a),
        MathFunc::Cospi => cospi(a),
        MathFunc::Atan2 => a.atan2(b),
        MathFunc::Pow => a.powf(b),
        MathFunc::Hypot => a.hypot(b),
        MathFunc::Fmax => a.max(b),
        MathFunc::Fmin => a.min(b),
        MathFunc::Logaddexp => logaddexp(a, b),
        MathFunc::Copysign => a.copysign(b),
    }
}

/// Single-precision counterpart of [`eval_f64`].
pub fn eval_f32(func: MathFunc, a: f32, b: f32) -> f32 {
    match func {
        MathFunc::Abs => a.abs(),
        MathFunc::Sin => a.sin(),
        MathFunc::Cos => a.cos(),
        MathFunc::Tan => a.tan(),
        MathFunc::Asin => a.asin(),
        MathFunc::Acos => a.acos(),
        MathFunc::Atan => a.atan(),
        MathFunc::Sinh => a.sinh(),
        MathFunc::Cosh => a.cosh(),
        MathFunc::Tanh => a.tanh(),
        MathFunc::Asinh => a.asinh(),
        MathFunc::Acosh => a.acosh(),
        MathFunc::Atanh => a.atanh(),
        MathFunc::Exp => a.exp(),
        MathFunc::Exp2 => a.exp2(),
        MathFunc::Exp10 => 10f32.powf(a),
        MathFunc::Expm1 => a.exp_m1(),
        MathFunc::Log => a.ln(),
        MathFunc::Log2 => a.log2(),
        MathFunc::Log10 => a.log10(),
        MathFunc::Log1p => a.ln_1p(),
        MathFunc::Sqrt => a.sqrt(),
        MathFunc::Cbrt => a.cbrt(),
        MathFunc::Floor => a.floor(),
        MathFunc::Ceil => a.ceil(),
        MathFunc::Round => a.round_ties_even(),
        MathFunc::Trunc => a.trunc(),
        // No single-precision reduction helpers; round from double.
        MathFunc::Sinpi => sinpi(f64::from(a)) as f32,
        MathFunc::Cospi => cospi(f64::from(a)) as f32,
        MathFunc::Logaddexp => logaddexp(f64::from(a), f64::from(b)) as f32,
        MathFunc::Atan2 => a.atan2(b),
        MathFunc::Pow => a.powf(b),
        MathFunc::Hypot => a.hypot(b),
        MathFunc::Fmax => a.max(b),
        MathFunc::Fmin => a.min(b),
        MathFunc::Copysign => a.copysign(b),
    }
}

/// `where(c, a, b)` on doubles: `c != 0 ? a : b`.
pub fn select_f64(c: f64, a: f64, b: f64) -> f64 {
    if c != 0.0 { a } else { b }
}

// ============================================================================
// C Entry Points
// ============================================================================

extern "C" fn unary_f64<const F: usize>(a: f64) -> f64 {
    eval_f64(MathFunc::ALL[F], a, 0.0)
}

extern "C" fn binary_f64<const F: usize>(a: f64, b: f64) -> f64 {
    eval_f64(MathFunc::ALL[F], a, b)
}

extern "C" fn unary_f32<const F: usize>(a: f32) -> f32 {
    eval_f32(MathFunc::ALL[F], a, 0.0)
}

extern "C" fn binary_f32<const F: usize>(a: f32, b: f32) -> f32 {
    eval_f32(MathFunc::ALL[F], a, b)
}

// Element-wise loops; `out` may alias either input.

unsafe extern "C" fn vec_unary_f64<const F: usize>(a: *const f64, out: *mut f64, n: i64) {
    for i in 0..n.max(0) as usize {
        unsafe { *out.add(i) = eval_f64(MathFunc::ALL[F], *a.add(i), 0.0) };
    }
}

unsafe extern "C" fn vec_binary_f64<const F: usize>(
    a: *const f64,
    b: *const f64,
    out: *mut f64,
    n: i64,
) {
    for i in 0..n.max(0) as usize {
        unsafe { *out.add(i) = eval_f64(MathFunc::ALL[F], *a.add(i), *b.add(i)) };
    }
}

unsafe extern "C" fn vec_unary_f32<const F: usize>(a: *const f32, out: *mut f32, n: i64) {
    for i in 0..n.max(0) as usize {
        unsafe { *out.add(i) = eval_f32(MathFunc::ALL[F], *a.add(i), 0.0) };
    }
}

unsafe extern "C" fn vec_binary_f32<const F: usize>(
    a: *const f32,
    b: *const f32,
    out: *mut f32,
    n: i64,
) {
    for i in 0..n.max(0) as usize {
        unsafe { *out.add(i) = eval_f32(MathFunc::ALL[F], *a.add(i), *b.add(i)) };
    }
}

extern "C" fn where_f64(c: f64, a: f64, b: f64) -> f64 {
    select_f64(c, a, b)
}

/// Function pointer table handed to generated code.
#[repr(transparent)]
pub struct BridgeTable([*const c_void; BRIDGE_TABLE_LEN]);

// SAFETY: the table only holds addresses of immutable `extern "C"` functions.
unsafe impl Send for BridgeTable {}
unsafe impl Sync for BridgeTable {}

impl BridgeTable {
    pub fn as_ptr(&self) -> *const *const c_void {
        self.0.as_ptr()
    }

    pub fn get(&self, index: usize) -> Option<*const c_void> {
        self.0.get(index).copied()
    }

    /// Address of the routine in `func`'s `kind` slot.
    pub fn address(&self, func: MathFunc, kind: SlotKind) -> usize {
        self.0[slot(func, kind)] as usize
    }
}

macro_rules! fill_slots {
    ($table:ident; $($f:literal)*) => {
        $(
            let func = MathFunc::ALL[$f];
            let base = $f * SLOTS_PER_FUNC;
            if func.is_binary() {
                $table[base] = binary_f64::<$f> as *const c_void;
                $table[base + 1] = binary_f32::<$f> as *const c_void;
                $table[base + 2] = vec_binary_f64::<$f> as *const c_void;
                $table[base + 3] = vec_binary_f32::<$f> as *const c_void;
            } else {
                $table[base] = unary_f64::<$f> as *const c_void;
                $table[base + 1] = unary_f32::<$f> as *const c_void;
                $table[base + 2] = vec_unary_f64::<$f> as *const c_void;
                $table[base + 3] = vec_unary_f32::<$f> as *const c_void;
            }
        )*
    };
}

fn build_table() -> BridgeTable {
    let mut table = [std::ptr::null::<c_void>(); BRIDGE_TABLE_LEN];
    fill_slots!(table;
        0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17
        18 19 20 21 22 23 24 25 26 27 28 29 30 31 32 33 34 35);
    table[WHERE_SLOT] = where_f64 as *const c_void;
    BridgeTable(table)
}

/// Process-wide bridge table.
pub static BRIDGE: Lazy<BridgeTable> = Lazy::new(build_table);

/// Signature of the bind entry point exported by bridged libraries.
pub type BindFn = unsafe extern "C" fn(*const *const c_void, i32) -> i32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_fully_populated() {
        for i in 0..BRIDGE_TABLE_LEN {
            assert!(!BRIDGE.get(i).unwrap().is_null(), "slot {i} empty");
        }
    }

    #[test]
    fn test_slot_layout() {
        assert_eq!(slot(MathFunc::Abs, SlotKind::ScalarF64), 0);
        assert_eq!(slot(MathFunc::Sin, SlotKind::VecF32), 7);
        assert_eq!(BRIDGE_TABLE_LEN, 145);
    }

    #[test]
    fn test_symbol_names() {
        assert_eq!(symbol_name(MathFunc::Exp, SlotKind::ScalarF64), "me_jit_exp");
        assert_eq!(symbol_name(MathFunc::Exp, SlotKind::ScalarF32), "me_jit_expf");
        assert_eq!(symbol_name(MathFunc::Atan2, SlotKind::VecF64), "me_jit_vec_atan2_f64");
    }

    #[test]
    fn test_table_entries_call_through() {
        let f: extern "C" fn(f64) -> f64 =
            unsafe { std::mem::transmute(BRIDGE.address(MathFunc::Sqrt, SlotKind::ScalarF64)) };
        assert_eq!(f(9.0), 3.0);
        let g: extern "C" fn(f32, f32) -> f32 =
            unsafe { std::mem::transmute(BRIDGE.address(MathFunc::Hypot, SlotKind::ScalarF32)) };
        assert_eq!(g(3.0, 4.0), 5.0);
    }

    #[test]
    fn test_vector_entry_in_place() {
        let f: unsafe extern "C" fn(*const f64, *mut f64, i64) =
            unsafe { std::mem::transmute(BRIDGE.address(MathFunc::Exp, SlotKind::VecF64)) };
        let mut data = [0.0, 1.0];
        unsafe { f(data.as_ptr(), data.as_mut_ptr(), 2) };
        assert_eq!(data, [1.0, 1f64.exp()]);
    }

    #[test]
    fn test_special_functions() {
        assert_eq!(eval_f64(MathFunc::Sinpi, 1.0, 0.0), 0.0);
        assert_eq!(eval_f64(MathFunc::Cospi, 0.5, 0.0), 0.0);
        assert_eq!(eval_f64(MathFunc::Round, 2.5, 0.0), 2.0);
        assert_eq!(eval_f64(MathFunc::Exp10, 2.0, 0.0), 100.0);
        let l = eval_f64(MathFunc::Logaddexp, 0.0, 0.0);
        assert!((l - std::f64::consts::LN_2).abs() < 1e-15);
        assert_eq!(select_f64(0.0, 1.0, 2.0), 2.0);
    }
}
