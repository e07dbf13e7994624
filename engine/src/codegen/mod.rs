//! C code generation from typed kernel IR.
//!
//! The generated translation unit is self-contained: it declares its own
//! fixed-width types, cast helpers and math prototypes, so it builds with any
//! C99 compiler and no system headers. The entry point has the signature
//!
//! ```c
//! int sym(const void **inputs, void *output, int64_t nitems);
//! ```
//!
//! and returns 0 on success, nonzero when its arguments are invalid.

mod emit;
mod lower;
mod nd;
mod vector;

use thiserror::Error;
use tracing::debug;
use veckern::{DType, IrProgram};

pub use vector::{LoweringMode, LoweringTrace};

use emit::{TYPE_PRELUDE, cast_prelude, is_safe_identifier};
use lower::KernelWriter;

pub const DEFAULT_ENTRY_SYMBOL: &str = "me_dsl_jit_kernel";

/// Bumped whenever the emitted source changes shape; part of every cache key.
pub const CODEGEN_VERSION: u32 = 1;

/// Knobs that change the emitted source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodegenOptions {
    pub entry_symbol: String,
    /// Route math calls through the runtime bridge table instead of libm.
    pub math_bridge: bool,
    /// Allow whole-array lowering onto vector bridge routines.
    pub vec_math: bool,
    /// Synthesize `_ndim` and `_flat_idx`.
    pub index_vars_synth: bool,
    /// Synthesize `_i<d>` and `_n<d>`.
    pub nd_synth: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        CodegenOptions {
            entry_symbol: DEFAULT_ENTRY_SYMBOL.to_string(),
            math_bridge: true,
            vec_math: true,
            index_vars_synth: true,
            nd_synth: true,
        }
    }
}

/// A construct the C backend cannot express. Positions are 1-based, or
/// (0, 0) when no statement is involved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{line}:{column}: {message}")]
pub struct CodegenError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl CodegenError {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        CodegenError {
            line,
            column,
            message: message.into(),
        }
    }
}

/// Generated translation unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub source: String,
    pub trace: LoweringTrace,
    /// The unit exports the bridge binding entry point.
    pub bridge: bool,
    /// The entry point expects an ND descriptor at `inputs[nparams]`.
    pub nd_descriptor: bool,
}

/// Generate C source for `ir` writing `output` elements.
pub fn generate(
    ir: &IrProgram,
    output: DType,
    options: &CodegenOptions,
) -> Result<Generated, CodegenError> {
    let entry = &options.entry_symbol;
    let entry_ok = entry.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
        && entry.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !entry_ok {
        return Err(CodegenError::new(
            0,
            0,
            format!("invalid entry symbol '{}'", options.entry_symbol),
        ));
    }
    for (name, _) in ir.params.iter().chain(ir.locals.iter()) {
        if !is_safe_identifier(name) {
            return Err(CodegenError::new(
                0,
                0,
                format!("identifier '{name}' cannot be used in generated C"),
            ));
        }
    }

    let nd_use = nd::collect(ir.params.iter().map(|(n, _)| n.as_str()), options);
    let (plan, trace) = vector::plan(ir, output, options);
    debug!(
        target: "veckern::jit",
        kernel = %ir.name,
        mode = %trace.mode,
        op = trace.op.unwrap_or("-"),
        reason = trace.reason.unwrap_or("-"),
        "lowering"
    );

    let mut writer = KernelWriter::new(ir, output, options);
    let out_ty = output.c_type();
    writer.buf.open(format!(
        "int {}(const void **__me_inputs, void *__me_output, int64_t __me_nitems) {{",
        options.entry_symbol
    ));
    writer
        .buf
        .line("if (!__me_inputs || !__me_output || __me_nitems < 0) return -1;");
    writer
        .buf
        .line(format!("{out_ty} *__me_dst = ({out_ty} *)__me_output;"));
    for (i, (name, dtype)) in ir.params.iter().enumerate() {
        if nd::synthesized(name, options).is_some() {
            continue;
        }
        let ty = dtype.c_type();
        writer.buf.line(format!(
            "const {ty} *__me_in{i} = (const {ty} *)__me_inputs[{i}];"
        ));
        writer.buf.line(format!("if (!__me_in{i}) return -1;"));
    }
    if !nd_use.is_empty() {
        nd::write_setup(&mut writer.buf, &nd_use, ir.params.len());
    }

    match &plan {
        Some(plan) => vector::write_body(&mut writer.buf, &mut writer.emitter, plan, output)
            .map_err(|msg| CodegenError::new(0, 0, msg))?,
        None => writer.write_element_loop(&nd_use)?,
    }
    writer.buf.line("return 0;");
    writer.buf.close("}");

    let KernelWriter { buf, emitter, .. } = writer;
    let body = buf.finish();
    let math = &emitter.math;

    let mut out = format!("/* veckern kernel '{}' */\n", ir.name);
    out.push_str(TYPE_PRELUDE);
    out.push('\n');
    out.push_str(&cast_prelude());
    out.push('\n');
    let support = math.support_source(options.math_bridge);
    if !support.is_empty() {
        out.push_str(&support);
        out.push('\n');
    }
    if math.uses_bridge() {
        // Refuse to run before the table is bound.
        let guard_at = body.find('\n').map_or(body.len(), |i| i + 1);
        out.push_str(&body[..guard_at]);
        out.push_str("    if (!me_jit_bridge) return -2;\n");
        out.push_str(&body[guard_at..]);
    } else {
        out.push_str(&body);
    }

    Ok(Generated {
        source: out,
        trace,
        bridge: options.math_bridge,
        nd_descriptor: !nd_use.is_empty(),
    })
}

/// True when the reserved name `name` is produced by generated code.
pub fn is_synthesized(name: &str, options: &CodegenOptions) -> bool {
    nd::synthesized(name, options).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use veckern::{DefaultResolver, build_ir, parse};

    fn ir(src: &str, params: &[(&str, DType)]) -> IrProgram {
        let program = parse(src).unwrap();
        let params: Vec<(String, DType)> =
            params.iter().map(|(n, d)| (n.to_string(), *d)).collect();
        build_ir(&program, &params, &mut DefaultResolver).unwrap()
    }

    fn gen_with(src: &str, params: &[(&str, DType)], output: DType, opts: &CodegenOptions) -> Generated {
        generate(&ir(src, params), output, opts).unwrap()
    }

    fn generate_src(src: &str, params: &[(&str, DType)], output: DType) -> Generated {
        gen_with(src, params, output, &CodegenOptions::default())
    }

    #[test]
    fn test_entry_point_and_preludes() {
        let g = generate_src("def k(x):\n    return x + 1\n", &[("x", DType::F64)], DType::F64);
        assert!(g.source.contains(
            "int me_dsl_jit_kernel(const void **__me_inputs, void *__me_output, int64_t __me_nitems)"
        ));
        assert!(g.source.contains("typedef long long int64_t;"));
        assert!(g.source.contains("#define ME_DSL_CAST_INT"));
        assert!(g.source.contains("__me_return_idx:"));
        assert!(!g.source.contains("#include"));
        assert_eq!(g.trace.mode, LoweringMode::Scalar);
    }

    #[test]
    fn test_modulo_fails_codegen() {
        let err = generate(
            &ir("def k(x):\n    return x % 2\n", &[("x", DType::I64)]),
            DType::I64,
            &CodegenOptions::default(),
        )
        .unwrap_err();
        assert_eq!((err.line, err.column), (2, 12));
        assert!(err.message.contains('%'));
    }

    #[test]
    fn test_return_casts_to_output() {
        let g = generate_src("def k(x):\n    return x\n", &[("x", DType::F64)], DType::I32);
        assert!(g.source.contains("__me_ret = ME_DSL_CAST_INT(int32_t, "));
    }

    #[test]
    fn test_for_loop_shape() {
        let src = "# me:dialect=element\ndef k(x, n):\n    acc = 0.0\n    for i in range(n):\n        acc = acc + x\n    return acc\n";
        let g = generate_src(src, &[("x", DType::F64), ("n", DType::I64)], DType::F64);
        assert!(g.source.contains("if (__me_step0 != 0) {"));
        assert!(g.source.contains("i = (int64_t)__me_iv0;"));
        assert!(g.source.contains("double acc = (double)0;"));
    }

    #[test]
    fn test_vector_unary() {
        let g = generate_src("def k(x):\n    return exp(x)\n", &[("x", DType::F64)], DType::F64);
        assert_eq!(g.trace.mode, LoweringMode::VectorUnary);
        assert_eq!(g.trace.op, Some("exp"));
        assert!(g.source.contains("me_jit_vec_exp_f64(__me_in0, __me_dst, __me_nitems);"));
        assert!(g.source.contains("if (!me_jit_bridge) return -2;"));
    }

    #[test]
    fn test_vector_unary_offset() {
        let g = generate_src("def k(x):\n    return sin(x + 0.5)\n", &[("x", DType::F32)], DType::F32);
        assert_eq!(g.trace.mode, LoweringMode::VectorUnaryOffset);
        assert!(g.source.contains("__me_in0[__me_idx]"));
        assert!(g.source.contains("me_jit_vec_sin_f32(__me_dst, __me_dst, __me_nitems);"));
    }

    #[test]
    fn test_vector_binary_with_constant() {
        let g = generate_src(
            "def k(x):\n    y = pow(x, 2.0)\n    return y\n",
            &[("x", DType::F64)],
            DType::F64,
        );
        assert_eq!(g.trace.mode, LoweringMode::VectorBinary);
        assert!(g.source.contains("me_jit_vec_pow_f64(__me_in0, __me_dst, __me_dst, __me_nitems);"));
    }

    #[test]
    fn test_vector_binary_params() {
        let g = generate_src(
            "def k(a, b):\n    return atan2(a, b)\n",
            &[("a", DType::F64), ("b", DType::F64)],
            DType::F64,
        );
        assert!(g.source.contains("me_jit_vec_atan2_f64(__me_in0, __me_in1, __me_dst, __me_nitems);"));
    }

    #[test]
    fn test_vectorization_declined() {
        let g = generate_src("def k(x):\n    return exp(x)\n", &[("x", DType::F64)], DType::F32);
        assert_eq!(g.trace.mode, LoweringMode::Scalar);
        assert!(g.trace.reason.is_some());

        let opts = CodegenOptions {
            vec_math: false,
            ..CodegenOptions::default()
        };
        let g = gen_with("def k(x):\n    return exp(x)\n", &[("x", DType::F64)], DType::F64, &opts);
        assert_eq!(g.trace.reason, Some("vector math disabled"));
        assert!(g.source.contains("me_jit_exp("));
    }

    #[test]
    fn test_libm_mode() {
        let opts = CodegenOptions {
            math_bridge: false,
            ..CodegenOptions::default()
        };
        let g = gen_with("def k(x):\n    return sqrt(x)\n", &[("x", DType::F64)], DType::F64, &opts);
        assert!(g.source.contains("double sqrt(double);"));
        assert!(!g.source.contains("me_jit_bridge"));
        assert!(!g.bridge);
    }

    #[test]
    fn test_reserved_synthesis() {
        let g = generate_src(
            "def k(x):\n    return x + _i0 + _n1\n",
            &[("x", DType::F64), ("_i0", DType::I64), ("_n1", DType::I64)],
            DType::F64,
        );
        assert!(g.nd_descriptor);
        assert!(g.source.contains("__me_inputs[3]"));
        assert!(g.source.contains("int64_t _i0 = __me_coord[0];"));
        assert!(g.source.contains("const int64_t _n1 = 1 < __me_ndim ? __me_shape[1] : 1;"));
        assert!(!g.source.contains("__me_in1 ="));
    }

    #[test]
    fn test_reserved_loaded_without_synthesis() {
        let opts = CodegenOptions {
            nd_synth: false,
            ..CodegenOptions::default()
        };
        let g = gen_with(
            "def k(x):\n    return x + _i0\n",
            &[("x", DType::F64), ("_i0", DType::I64)],
            DType::F64,
            &opts,
        );
        assert!(!g.nd_descriptor);
        assert!(g.source.contains("int64_t _i0 = __me_in1[__me_idx];"));
    }

    #[test]
    fn test_keyword_identifier_rejected() {
        let err = generate(
            &ir("def k(x):\n    double = x\n    return double\n", &[("x", DType::F64)]),
            DType::F64,
            &CodegenOptions::default(),
        )
        .unwrap_err();
        assert!(err.message.contains("double"));
    }
}
