//! End-to-end tests of the native JIT path
//!
//! Every test here needs a C compiler on `PATH` and returns early, with a
//! note on stderr, when none is found.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use veckern::DType;
use veckern_engine::codegen::{self, CodegenOptions};
use veckern_engine::jit::{CcToolchain, Toolchain};
use veckern_engine::{
    ArrayMut, ArrayRef, Backend, Engine, ExecPath, JitCache, JitConfig, Kernel, LoweringMode,
    NdContext,
};

// ============================================================================
// Helpers
// ============================================================================

fn have_cc() -> bool {
    let found = CcToolchain::discover(None).available();
    if !found {
        eprintln!("no C compiler on PATH; skipping");
    }
    found
}

/// Native-only engine with its own cache and cache directory.
fn native_engine(dir: &Path) -> Engine {
    Engine::new(
        JitConfig::default()
            .with_embedded(false)
            .with_cache_dir(dir),
    )
    .with_cache(Arc::new(JitCache::new()))
}

fn interpreter_engine() -> Engine {
    Engine::new(JitConfig::default().with_enabled(false))
}

fn files_with_extension(dir: &Path, ext: &str) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|x| x == ext))
        .count()
}

fn run_f64(kernel: &Kernel, x: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; x.len()];
    kernel.eval(&[x.into()], (&mut out).into()).unwrap();
    out
}

/// Run `src` natively and on the interpreter, returning both outputs.
fn eval_both<T>(
    dir: &Path,
    src: &str,
    vars: &[(&str, DType)],
    output: DType,
    inputs: &[ArrayRef<'_>],
    len: usize,
) -> (Vec<T>, Vec<T>)
where
    T: Copy + Default,
    for<'a> &'a mut Vec<T>: Into<ArrayMut<'a>>,
{
    let jit = Kernel::compile(src, vars, output, &native_engine(dir)).unwrap();
    assert_eq!(jit.path(), ExecPath::Jit(Backend::Native), "{src}");
    let interp = Kernel::compile(src, vars, output, &interpreter_engine()).unwrap();

    let mut native = vec![T::default(); len];
    jit.eval(inputs, (&mut native).into()).unwrap();
    let mut interpreted = vec![T::default(); len];
    interp.eval(inputs, (&mut interpreted).into()).unwrap();
    (native, interpreted)
}

// ============================================================================
// Interpreter and JIT agree
// ============================================================================

#[test]
fn test_cast_chain_matches_interpreter() {
    if !have_cc() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let src = "def k(x):\n    return float(int(x)) + bool(x)\n";
    let vars = [("x", DType::F64)];
    let jit = Kernel::compile(src, &vars, DType::F64, &native_engine(dir.path())).unwrap();
    let interp = Kernel::compile(src, &vars, DType::F64, &interpreter_engine()).unwrap();
    assert_eq!(jit.path(), ExecPath::Jit(Backend::Native));
    assert_eq!(interp.path(), ExecPath::Interpreter);

    let x = [0.0, 0.2, 1.0, 1.9, 2.0, 3.2];
    let expected = vec![0.0, 1.0, 2.0, 2.0, 3.0, 4.0];
    assert_eq!(run_f64(&jit, &x), expected);
    assert_eq!(run_f64(&interp, &x), expected);
}

#[test]
fn test_element_loop_matches_interpreter() {
    if !have_cc() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let src = "# me:dialect=element\n\
               def k(x):\n\
               \x20   acc = 0\n\
               \x20   for i in range(5):\n\
               \x20       if i > x:\n\
               \x20           break\n\
               \x20       acc = acc + i\n\
               \x20   return acc\n";
    let vars = [("x", DType::F64)];
    let jit = Kernel::compile(src, &vars, DType::F64, &native_engine(dir.path())).unwrap();
    let interp = Kernel::compile(src, &vars, DType::F64, &interpreter_engine()).unwrap();
    assert_eq!(jit.path(), ExecPath::Jit(Backend::Native));

    let x = [0.0, 2.0, 7.0, -1.0];
    let expected = vec![0.0, 3.0, 10.0, 0.0];
    assert_eq!(run_f64(&jit, &x), expected);
    assert_eq!(run_f64(&interp, &x), expected);
}

#[test]
fn test_nd_block_matches_interpreter() {
    if !have_cc() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let src = "def k(x):\n    return x + _i0 * _n1 + _i1\n";
    let vars = [("x", DType::I64)];
    let jit = Kernel::compile(src, &vars, DType::I64, &native_engine(dir.path())).unwrap();
    let interp = Kernel::compile(src, &vars, DType::I64, &interpreter_engine()).unwrap();
    assert_eq!(jit.path(), ExecPath::Jit(Backend::Native));
    assert!(jit.native().unwrap().needs_nd_descriptor());

    // rows 1..3, columns 2..5 of a 4x6 array
    let nd = NdContext::new(&[4, 6], &[1, 2], &[2, 3]).unwrap();
    let x = [100i64; 6];
    let mut a = [0i64; 6];
    let mut b = [0i64; 6];
    jit.eval_nd(&[x.as_slice().into()], a.as_mut_slice().into(), &nd)
        .unwrap();
    interp
        .eval_nd(&[x.as_slice().into()], b.as_mut_slice().into(), &nd)
        .unwrap();
    assert_eq!(a, [108, 109, 110, 114, 115, 116]);
    assert_eq!(a, b);
}

#[test]
fn test_math_call_uses_vector_lowering() {
    if !have_cc() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let src = "def k(x):\n    return sin(x)\n";
    let vars = [("x", DType::F64)];
    let jit = Kernel::compile(src, &vars, DType::F64, &native_engine(dir.path())).unwrap();
    assert_eq!(jit.trace().unwrap().mode, LoweringMode::VectorUnary);
    let interp = Kernel::compile(src, &vars, DType::F64, &interpreter_engine()).unwrap();

    let x: Vec<f64> = (0..64).map(|i| i as f64 * 0.1).collect();
    assert_eq!(run_f64(&jit, &x), run_f64(&interp, &x));
}

#[test]
fn test_non_finite_to_int_saturates_like_interpreter() {
    if !have_cc() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let x = [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1e300, -1e300, 127.9, -1.5];
    let vars = [("x", DType::F64)];

    let (native, interp) =
        eval_both::<i8>(dir.path(), "def k(x):\n    return x\n", &vars, DType::I8, &[(&x[..]).into()], x.len());
    assert_eq!(native, interp);
    assert_eq!(native[6], -1);

    let (native, interp) = eval_both::<i64>(
        dir.path(),
        "def k(x):\n    return int(x)\n",
        &vars,
        DType::I64,
        &[(&x[..]).into()],
        x.len(),
    );
    assert_eq!(native, interp);
}

#[test]
fn test_integer_edge_cases_match_interpreter() {
    if !have_cc() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let x = [1i64, -1, 3, 255, 256, 257, 1000, i64::MAX, i64::MIN];
    let vars = [("x", DType::I64)];

    let shifts = "def k(x):\n    return (x << 65) ^ (x >> 66)\n";
    let (native, interp) = eval_both::<i64>(dir.path(), shifts, &vars, DType::I64, &[(&x[..]).into()], x.len());
    assert_eq!(native, interp);

    let abs = "def k(x):\n    return abs(x)\n";
    let (native, interp) = eval_both::<i64>(dir.path(), abs, &vars, DType::I64, &[(&x[..]).into()], x.len());
    assert_eq!(native, interp);
    assert_eq!(native[1], 1);
    assert_eq!(native[8], i64::MIN);

    let narrow = "def k(x):\n    return x\n";
    let (native, interp) = eval_both::<u8>(dir.path(), narrow, &vars, DType::U8, &[(&x[..]).into()], x.len());
    assert_eq!(native, interp);
}

#[test]
fn test_bridge_math_matches_interpreter() {
    if !have_cc() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let x = [0.0, 0.25, 0.5, 1.0, -2.25, 3.75, 1e3, -1e3];
    let y = [0.0, -0.5, 2.0, 1.0, 700.0, -700.0, 1e3, 0.1];
    let vars = [("x", DType::F64), ("y", DType::F64)];
    let inputs: [ArrayRef; 2] = [(&x[..]).into(), (&y[..]).into()];

    for src in [
        "def k(x, y):\n    return sinpi(x)\n",
        "def k(x, y):\n    return logaddexp(x, y)\n",
        "def k(x, y):\n    return sin(x) * y\n",
    ] {
        let (native, interp) = eval_both::<f64>(dir.path(), src, &vars, DType::F64, &inputs, x.len());
        let bits = |v: &[f64]| v.iter().map(|f| f.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&native), bits(&interp), "{src}");
    }
}

// ============================================================================
// Caching
// ============================================================================

#[test]
fn test_positive_cache_avoids_recompilation() {
    if !have_cc() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let engine = native_engine(dir.path());
    let src = "def k(x):\n    return x * 3 + 1\n";
    let a = Kernel::compile(src, &[("x", DType::I32)], DType::I32, &engine).unwrap();
    let b = Kernel::compile(src, &[("x", DType::I32)], DType::I32, &engine).unwrap();

    let stats = engine.cache().stats();
    assert_eq!(stats.compilations, 1);
    assert_eq!(stats.hits, 1);
    assert!(Arc::ptr_eq(a.native().unwrap(), b.native().unwrap()));
}

#[test]
fn test_disk_cache_reused_by_fresh_process_cache() {
    if !have_cc() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let src = "def k(x):\n    return x - 2\n";
    Kernel::compile(src, &[("x", DType::F32)], DType::F32, &native_engine(dir.path())).unwrap();

    let engine = native_engine(dir.path());
    let k = Kernel::compile(src, &[("x", DType::F32)], DType::F32, &engine).unwrap();
    let stats = engine.cache().stats();
    assert_eq!(stats.disk_hits, 1);
    assert_eq!(stats.compilations, 0);

    let x = [1.0f32, 5.0];
    let mut out = [0.0f32; 2];
    k.eval(&[x.as_slice().into()], out.as_mut_slice().into()).unwrap();
    assert_eq!(out, [-1.0, 3.0]);
}

#[test]
fn test_flipped_metadata_byte_forces_rebuild() {
    if !have_cc() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let src = "def k(x):\n    return x + 1.5\n";
    Kernel::compile(src, &[("x", DType::F64)], DType::F64, &native_engine(dir.path())).unwrap();

    let meta = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.path())
        .find(|p| p.extension().is_some_and(|x| x == "meta"))
        .unwrap();
    let mut bytes = fs::read(&meta).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&meta, &bytes).unwrap();

    let engine = native_engine(dir.path());
    let k = Kernel::compile(src, &[("x", DType::F64)], DType::F64, &engine).unwrap();
    let stats = engine.cache().stats();
    assert_eq!(stats.disk_hits, 0);
    assert_eq!(stats.compilations, 1);
    assert_ne!(fs::read(&meta).unwrap(), bytes);
    assert_eq!(run_f64(&k, &[1.0]), vec![2.5]);
}

#[test]
fn test_fp_mode_and_dialect_get_distinct_artifacts() {
    if !have_cc() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let engine = native_engine(dir.path());
    let body = "def k(x):\n    return x * x + 1.0\n";
    let sources = [
        body.to_string(),
        format!("# me:fp=fast\n{body}"),
        format!("# me:dialect=element\n{body}"),
    ];
    let keys: Vec<u64> = sources
        .iter()
        .map(|src| {
            Kernel::compile(src, &[("x", DType::F64)], DType::F64, &engine)
                .unwrap()
                .native()
                .unwrap()
                .key()
        })
        .collect();
    assert_ne!(keys[0], keys[1]);
    assert_ne!(keys[0], keys[2]);
    assert_ne!(keys[1], keys[2]);
    assert_eq!(files_with_extension(dir.path(), "c"), 3);
    assert_eq!(files_with_extension(dir.path(), "meta"), 3);
}

// ============================================================================
// Fallbacks
// ============================================================================

#[test]
fn test_modulo_fails_codegen_and_interprets() {
    let program = veckern::parse("def k(x):\n    return x % 2\n").unwrap();
    let ir = veckern::build_ir(
        &program,
        &[("x".to_string(), DType::I64)],
        &mut veckern::DefaultResolver,
    )
    .unwrap();
    let err = codegen::generate(&ir, DType::I64, &CodegenOptions::default()).unwrap_err();
    assert!(err.message.contains("'%'"));

    if !have_cc() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let engine = native_engine(dir.path());
    let k = Kernel::compile("def k(x):\n    return x % 2\n", &[("x", DType::I64)], DType::I64, &engine)
        .unwrap();
    assert_eq!(k.path(), ExecPath::Interpreter);
    assert_eq!(engine.cache().stats().failures, 0);

    let x = [4i64, 5, -3];
    let mut out = [0i64; 3];
    k.eval(&[x.as_slice().into()], out.as_mut_slice().into()).unwrap();
    assert_eq!(out, [0, 1, 1]);
}

#[test]
fn test_broken_compiler_falls_back_and_is_negative_cached() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(
        JitConfig::default()
            .with_embedded(false)
            .with_cache_dir(dir.path()),
    )
    .with_cache(Arc::new(JitCache::new()))
    .with_toolchain(Arc::new(CcToolchain::new("definitely-not-a-compiler-xyz")));

    let src = "def k(x):\n    return x + 1\n";
    let k = Kernel::compile(src, &[("x", DType::I64)], DType::I64, &engine).unwrap();
    assert_eq!(k.path(), ExecPath::Interpreter);
    assert!(k.fallback_reason().unwrap().contains("compile-failed"));

    Kernel::compile(src, &[("x", DType::I64)], DType::I64, &engine).unwrap();
    let stats = engine.cache().stats();
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.negative_hits, 1);

    let x = [1i64, 2];
    let mut out = [0i64; 2];
    k.eval(&[x.as_slice().into()], out.as_mut_slice().into()).unwrap();
    assert_eq!(out, [2, 3]);
}

#[test]
fn test_missing_return_rejected_in_both_dialects() {
    let engine = interpreter_engine();
    for pragma in ["", "# me:dialect=element\n"] {
        let src = format!("{pragma}def k(x):\n    if x > 0:\n        return x\n");
        let err = Kernel::compile(&src, &[("x", DType::F64)], DType::F64, &engine).unwrap_err();
        assert!(err.to_string().contains("every control path"), "{err}");
    }
}
