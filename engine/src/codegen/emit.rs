//! C text emission: fixed preludes, literals, casts and typed expressions.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use veckern::expr::types::Const;
use veckern::expr::{BinaryOp, UnaryOp};
use veckern::{DType, MathFunc, TypedExpr, TypedKind};

use crate::bridge::{BRIDGE_ABI_VERSION, BRIDGE_BIND_SYMBOL, SlotKind, slot, symbol_name};

// ============================================================================
// Code Buffer
// ============================================================================

/// Line-oriented C writer with four-space indentation.
#[derive(Debug, Default)]
pub(crate) struct CodeBuf {
    out: String,
    indent: usize,
}

impl CodeBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    /// Write `text` and indent the following lines.
    pub fn open(&mut self, text: impl AsRef<str>) {
        self.line(text);
        self.indent += 1;
    }

    pub fn close(&mut self, text: impl AsRef<str>) {
        self.indent = self.indent.saturating_sub(1);
        self.line(text);
    }

    pub fn indent(&mut self) {
        self.indent += 1;
    }

    pub fn finish(self) -> String {
        self.out
    }
}

// ============================================================================
// Fixed Preludes
// ============================================================================

pub(crate) const TYPE_PRELUDE: &str = "\
typedef _Bool bool;
typedef signed char int8_t;
typedef short int16_t;
typedef int int32_t;
typedef long long int64_t;
typedef unsigned char uint8_t;
typedef unsigned short uint16_t;
typedef unsigned int uint32_t;
typedef unsigned long long uint64_t;
";

/// (C type, lower threshold, lower value, upper threshold, upper value)
const CAST_BOUNDS: [(&str, &str, &str, &str, &str); 8] = [
    ("int8_t", "-128.0", "-128", "127.0", "127"),
    ("int16_t", "-32768.0", "-32768", "32767.0", "32767"),
    ("int32_t", "-2147483648.0", "(-2147483647 - 1)", "2147483647.0", "2147483647"),
    (
        "int64_t",
        "-9223372036854775808.0",
        "(-9223372036854775807LL - 1)",
        "9223372036854775807.0",
        "9223372036854775807LL",
    ),
    ("uint8_t", "0.0", "0", "255.0", "255"),
    ("uint16_t", "0.0", "0", "65535.0", "65535"),
    ("uint32_t", "0.0", "0", "4294967295.0", "4294967295U"),
    ("uint64_t", "0.0", "0", "18446744073709551615.0", "18446744073709551615ULL"),
];

/// Saturating float to integer conversions and the cast macros built on them.
pub(crate) fn cast_prelude() -> String {
    let mut buf = CodeBuf::new();
    for (ty, lo, lo_val, hi, hi_val) in CAST_BOUNDS {
        buf.open(format!("static inline {ty} me_dsl_cast_{ty}(double v) {{"));
        buf.line("if (v != v) return 0;");
        buf.line(format!("if (v <= {lo}) return {lo_val};"));
        buf.line(format!("if (v >= {hi}) return {hi_val};"));
        buf.line(format!("return ({ty})v;"));
        buf.close("}");
    }
    buf.line("#define ME_DSL_CAST_INT(T, v) me_dsl_cast_##T((double)(v))");
    buf.line("#define ME_DSL_CAST_FLOAT(T, v) ((T)(v))");
    buf.line("#define ME_DSL_CAST_BOOL(v) ((bool)((v) != 0))");
    buf.finish()
}

/// Convert the C expression `inner` from `src` to `dst`.
pub(crate) fn cast_expr(src: DType, dst: DType, inner: &str) -> String {
    if src == dst {
        inner.to_string()
    } else if dst == DType::Bool {
        format!("ME_DSL_CAST_BOOL({inner})")
    } else if src.is_float() && dst.is_integral() {
        format!("ME_DSL_CAST_INT({}, {inner})", dst.c_type())
    } else {
        format!("ME_DSL_CAST_FLOAT({}, {inner})", dst.c_type())
    }
}

// ============================================================================
// Identifiers and Literals
// ============================================================================

const C_RESERVED: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else",
    "enum", "extern", "float", "for", "goto", "if", "inline", "int", "long", "register",
    "restrict", "return", "short", "signed", "sizeof", "static", "struct", "switch", "typedef",
    "union", "unsigned", "void", "volatile", "while", "_Bool", "_Complex", "_Imaginary", "bool",
    "int8_t", "int16_t", "int32_t", "int64_t", "uint8_t", "uint16_t", "uint32_t", "uint64_t",
    "fabs", "rint", "fmod",
];

/// Whether `name` can be used verbatim as a C identifier in generated code.
pub(crate) fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return false;
    }
    if name.starts_with("__me") || name.starts_with("me_") || name.starts_with("ME_") {
        return false;
    }
    // libm names, including the single-precision variants
    let stem = name.strip_suffix('f').unwrap_or(name);
    if C_RESERVED.contains(&name) || C_RESERVED.contains(&stem) {
        return false;
    }
    !MathFunc::ALL
        .iter()
        .any(|f| f.name() == name || f.name() == stem)
}

pub(crate) fn float_literal(value: f64, dtype: DType) -> String {
    let body = if value.is_nan() {
        "(0.0/0.0)".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "(1.0/0.0)" } else { "(-1.0/0.0)" }.to_string()
    } else {
        format!("{value:e}")
    };
    format!("(({})({body}))", dtype.c_type())
}

fn int_literal(value: u64, dtype: DType) -> String {
    match dtype {
        DType::Bool => format!("((bool){})", u8::from(value != 0)),
        dt if dt.is_float() => format!("(({})({value}ULL))", dt.c_type()),
        dt if dt.is_signed_int() && value <= i64::MAX as u64 => {
            format!("(({}){value}LL)", dt.c_type())
        }
        dt => format!("(({}){value}ULL)", dt.c_type()),
    }
}

// ============================================================================
// Math Routines
// ============================================================================

/// Helper routines emitted as C source in non-bridge mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Helper {
    Sinpi,
    Cospi,
    Logaddexp,
}

/// Math routines referenced by the emitted code.
#[derive(Debug, Default)]
pub(crate) struct MathUse {
    bridge: BTreeSet<(usize, SlotKind)>,
    libm: BTreeSet<(&'static str, bool, usize)>,
    helpers: BTreeSet<Helper>,
}

impl MathUse {
    pub fn uses_bridge(&self) -> bool {
        !self.bridge.is_empty()
    }

    pub fn add_bridge(&mut self, func: MathFunc, kind: SlotKind) {
        self.bridge.insert((func.index(), kind));
    }

    fn add_libm(&mut self, name: &'static str, single: bool, arity: usize) {
        self.libm.insert((name, single, arity));
    }

    fn add_helper(&mut self, helper: Helper) {
        self.helpers.insert(helper);
        match helper {
            Helper::Sinpi => {
                self.add_libm("fmod", false, 2);
                self.add_libm("trunc", false, 1);
                self.add_libm("copysign", false, 2);
                self.add_libm("sin", false, 1);
            }
            Helper::Cospi => {
                self.add_libm("fmod", false, 2);
                self.add_libm("fabs", false, 1);
                self.add_libm("cos", false, 1);
            }
            Helper::Logaddexp => {
                self.add_libm("fmax", false, 2);
                self.add_libm("fabs", false, 1);
                self.add_libm("exp", false, 1);
                self.add_libm("log1p", false, 1);
            }
        }
    }

    /// Declarations and helpers for every routine used, plus the bridge
    /// binding entry point when `bridge` is set.
    pub fn support_source(&self, bridge: bool) -> String {
        let mut buf = CodeBuf::new();
        for &(name, single, arity) in &self.libm {
            let (ty, suffix) = if single { ("float", "f") } else { ("double", "") };
            let args = vec![ty; arity].join(", ");
            buf.line(format!("{ty} {name}{suffix}({args});"));
        }
        for helper in &self.helpers {
            write_helper(&mut buf, *helper);
        }
        if bridge {
            buf.line("typedef void (*me_jit_fn)(void);");
            buf.line("static const me_jit_fn *me_jit_bridge = 0;");
            buf.open(format!(
                "int {BRIDGE_BIND_SYMBOL}(const me_jit_fn *table, int version) {{"
            ));
            buf.line(format!(
                "if (!table || version != {BRIDGE_ABI_VERSION}) return -1;"
            ));
            buf.line("me_jit_bridge = table;");
            buf.line("return 0;");
            buf.close("}");
            for &(index, kind) in &self.bridge {
                buf.line(bridge_macro(MathFunc::ALL[index], kind));
            }
        }
        buf.finish()
    }
}

fn write_helper(buf: &mut CodeBuf, helper: Helper) {
    let pi = format!("{:e}", std::f64::consts::PI);
    match helper {
        Helper::Sinpi => {
            buf.open("static double me_dsl_sinpi(double x) {");
            buf.line("double r;");
            buf.line("if (!(x - x == 0.0)) return (0.0/0.0);");
            buf.line("r = fmod(x, 2.0);");
            buf.line("if (r == trunc(r)) return copysign(0.0, x);");
            buf.line(format!("return sin({pi} * r);"));
            buf.close("}");
        }
        Helper::Cospi => {
            buf.open("static double me_dsl_cospi(double x) {");
            buf.line("double r;");
            buf.line("if (!(x - x == 0.0)) return (0.0/0.0);");
            buf.line("r = fabs(fmod(x, 2.0));");
            buf.line("if (r == 0.5 || r == 1.5) return 0.0;");
            buf.line(format!("return cos({pi} * r);"));
            buf.close("}");
        }
        Helper::Logaddexp => {
            buf.open("static double me_dsl_logaddexp(double a, double b) {");
            buf.line("if (a != a || b != b) return (0.0/0.0);");
            buf.line(format!(
                "if (a == b) return a + {:e};",
                std::f64::consts::LN_2
            ));
            buf.line("return fmax(a, b) + log1p(exp(-fabs(a - b)));");
            buf.close("}");
        }
    }
}

fn bridge_macro(func: MathFunc, kind: SlotKind) -> String {
    let name = symbol_name(func, kind);
    let index = slot(func, kind);
    let binary = func.is_binary();
    match kind {
        SlotKind::ScalarF64 | SlotKind::ScalarF32 => {
            let ty = if kind == SlotKind::ScalarF64 { "double" } else { "float" };
            if binary {
                format!(
                    "#define {name}(a, b) ((({ty} (*)({ty}, {ty}))me_jit_bridge[{index}])((a), (b)))"
                )
            } else {
                format!("#define {name}(a) ((({ty} (*)({ty}))me_jit_bridge[{index}])(a))")
            }
        }
        SlotKind::VecF64 | SlotKind::VecF32 => {
            let ty = if kind == SlotKind::VecF64 { "double" } else { "float" };
            if binary {
                format!(
                    "#define {name}(a, b, o, n) (((void (*)(const {ty} *, const {ty} *, {ty} *, int64_t))me_jit_bridge[{index}])((a), (b), (o), (n)))"
                )
            } else {
                format!(
                    "#define {name}(a, o, n) (((void (*)(const {ty} *, {ty} *, int64_t))me_jit_bridge[{index}])((a), (o), (n)))"
                )
            }
        }
    }
}

// ============================================================================
// Expression Emission
// ============================================================================

/// Lowers typed expressions to fully parenthesized, explicitly cast C.
#[derive(Debug, Default)]
pub(crate) struct ExprEmitter {
    bridge: bool,
    /// Replacement text for variable references.
    subst: FxHashMap<String, String>,
    pub math: MathUse,
}

impl ExprEmitter {
    pub fn new(bridge: bool) -> Self {
        ExprEmitter {
            bridge,
            ..Self::default()
        }
    }

    pub fn substitute(&mut self, name: &str, text: String) {
        self.subst.insert(name.to_string(), text);
    }

    pub fn emit(&mut self, expr: &TypedExpr) -> Result<String, String> {
        let ty = expr.dtype.c_type();
        let text = match &expr.kind {
            TypedKind::Const(Const::Bool(b)) => {
                let lit = format!("((bool){})", u8::from(*b));
                cast_expr(DType::Bool, expr.dtype, &lit)
            }
            TypedKind::Const(Const::Int(v)) => int_literal(*v, expr.dtype),
            TypedKind::Const(Const::Float(v)) => {
                if expr.dtype.is_float() {
                    float_literal(*v, expr.dtype)
                } else {
                    cast_expr(DType::F64, expr.dtype, &float_literal(*v, DType::F64))
                }
            }
            TypedKind::Var(name) => {
                let target = self.subst.get(name).map(String::as_str).unwrap_or(name);
                format!("(({ty})({target}))")
            }
            TypedKind::Cast(inner) => {
                let text = self.emit(inner)?;
                cast_expr(inner.dtype, expr.dtype, &text)
            }
            TypedKind::Unary { op, operand } => {
                let a = self.emit(operand)?;
                match op {
                    UnaryOp::Neg => format!("(({ty})(-{a}))"),
                    UnaryOp::Pos => format!("(({ty})(+{a}))"),
                    UnaryOp::Not => format!("((bool)(!{a}))"),
                    UnaryOp::BitNot => {
                        if !operand.dtype.is_integral() {
                            return Err("bitwise '~' requires an integer operand".into());
                        }
                        format!("(({ty})(~{a}))")
                    }
                }
            }
            TypedKind::Binary { op, lhs, rhs } => self.emit_binary(expr.dtype, *op, lhs, rhs)?,
            TypedKind::Call { func, args } => self.emit_call(expr.dtype, *func, args)?,
            TypedKind::Where {
                cond,
                then,
                otherwise,
            } => {
                let c = self.emit(cond)?;
                let a = self.emit(then)?;
                let b = self.emit(otherwise)?;
                format!("(({ty})({c} ? {a} : {b}))")
            }
        };
        Ok(text)
    }

    fn emit_binary(
        &mut self,
        dtype: DType,
        op: BinaryOp,
        lhs: &TypedExpr,
        rhs: &TypedExpr,
    ) -> Result<String, String> {
        if matches!(op, BinaryOp::Mod | BinaryOp::Pow | BinaryOp::FloorDiv) {
            return Err(format!(
                "operator '{}' is not supported by the compiled backend",
                op.symbol()
            ));
        }
        if op.is_bitwise() && !(lhs.dtype.is_integral() && rhs.dtype.is_integral()) {
            return Err(format!(
                "bitwise operator '{}' requires integer operands",
                op.symbol()
            ));
        }
        let ty = dtype.c_type();
        let a = self.emit(lhs)?;
        let b = self.emit(rhs)?;
        let text = match op {
            BinaryOp::Shl | BinaryOp::Shr => {
                let mask = lhs.dtype.bits() - 1;
                let count = format!("(((uint64_t){b}) & {mask})");
                if op == BinaryOp::Shl {
                    format!("(({ty})(((uint64_t){a}) << {count}))")
                } else {
                    format!("(({ty})({a} >> {count}))")
                }
            }
            BinaryOp::And => format!("((bool)({a} && {b}))"),
            BinaryOp::Or => format!("((bool)({a} || {b}))"),
            _ => format!("(({ty})({a} {} {b}))", op.symbol()),
        };
        Ok(text)
    }

    fn emit_call(
        &mut self,
        dtype: DType,
        func: MathFunc,
        args: &[TypedExpr],
    ) -> Result<String, String> {
        let ty = dtype.c_type();
        let mut texts = Vec::with_capacity(args.len());
        for a in args {
            texts.push(self.emit(a)?);
        }
        if func == MathFunc::Abs && !dtype.is_float() {
            let x = &texts[0];
            return Ok(format!("(({ty})({x} < 0 ? -{x} : {x}))"));
        }
        if !dtype.is_float() {
            return Err(format!("{}() on non-float type {dtype}", func.name()));
        }
        let single = dtype == DType::F32;
        let joined = texts.join(", ");

        if self.bridge {
            let kind = if single {
                SlotKind::ScalarF32
            } else {
                SlotKind::ScalarF64
            };
            self.math.add_bridge(func, kind);
            return Ok(format!("(({ty}){}({joined}))", symbol_name(func, kind)));
        }

        let suffix = if single { "f" } else { "" };
        let call = match func {
            MathFunc::Sinpi | MathFunc::Cospi | MathFunc::Logaddexp => {
                let (helper, name) = match func {
                    MathFunc::Sinpi => (Helper::Sinpi, "sinpi"),
                    MathFunc::Cospi => (Helper::Cospi, "cospi"),
                    _ => (Helper::Logaddexp, "logaddexp"),
                };
                self.math.add_helper(helper);
                let widened: Vec<String> = texts.iter().map(|t| format!("(double){t}")).collect();
                format!("me_dsl_{name}({})", widened.join(", "))
            }
            MathFunc::Exp10 => {
                self.math.add_libm("pow", single, 2);
                format!("pow{suffix}({}, {joined})", float_literal(10.0, dtype))
            }
            _ => {
                let name = match func {
                    MathFunc::Abs => "fabs",
                    MathFunc::Round => "rint",
                    other => other.name(),
                };
                self.math.add_libm(name, single, func.arity());
                format!("{name}{suffix}({joined})")
            }
        };
        Ok(format!("(({ty}){call})"))
    }
}
