use criterion::{Criterion, black_box, criterion_group, criterion_main};
use veckern::DType;
use veckern_engine::codegen::{CodegenOptions, generate};
use veckern_engine::jit::{CcToolchain, Toolchain};
use veckern_engine::{Engine, ExecPath, JitConfig, Kernel};

const POLY: &str = "def poly(x, y):\n    return x * x * 0.5 + y * 3.0 - 1.0\n";

const LOOP: &str = "\
# me:dialect=element
def walk(x, y):
    acc = 0.0
    for i in range(16):
        if acc > x:
            break
        acc = acc + sqrt(y * y + i)
    return acc
";

const N: usize = 10_000;

fn inputs() -> (Vec<f64>, Vec<f64>) {
    let x = (0..N).map(|i| i as f64 * 0.01).collect();
    let y = (0..N).map(|i| (N - i) as f64 * 0.02).collect();
    (x, y)
}

fn vars() -> [(&'static str, DType); 2] {
    [("x", DType::F64), ("y", DType::F64)]
}

// ============================================================================
// Evaluation Benchmarks
// ============================================================================

fn bench_eval(c: &mut Criterion, label: &str, src: &str) {
    let (x, y) = inputs();
    let mut out = vec![0.0; N];

    let interp = Engine::new(JitConfig::default().with_enabled(false));
    let kernel = Kernel::compile(src, &vars(), DType::F64, &interp).unwrap();
    c.bench_function(&format!("{label} interpreter ({N} items)"), |b| {
        b.iter(|| {
            kernel
                .eval(&[(&x).into(), (&y).into()], (&mut out).into())
                .unwrap();
            black_box(out[N - 1])
        })
    });

    if !CcToolchain::discover(None).available() {
        return;
    }
    let native = Engine::new(JitConfig::default().with_embedded(false));
    let kernel = Kernel::compile(src, &vars(), DType::F64, &native).unwrap();
    if !matches!(kernel.path(), ExecPath::Jit(_)) {
        return;
    }
    c.bench_function(&format!("{label} native ({N} items)"), |b| {
        b.iter(|| {
            kernel
                .eval(&[(&x).into(), (&y).into()], (&mut out).into())
                .unwrap();
            black_box(out[N - 1])
        })
    });
}

fn bench_poly(c: &mut Criterion) {
    bench_eval(c, "poly", POLY);
}

fn bench_loop(c: &mut Criterion) {
    bench_eval(c, "loop", LOOP);
}

// ============================================================================
// Compilation Benchmarks
// ============================================================================

fn bench_generate(c: &mut Criterion) {
    let program = veckern::parse(LOOP).unwrap();
    let params: Vec<(String, DType)> = vars().iter().map(|(n, d)| (n.to_string(), *d)).collect();
    let ir = veckern::build_ir(&program, &params, &mut veckern::DefaultResolver).unwrap();
    let options = CodegenOptions::default();
    c.bench_function("generate C", |b| {
        b.iter(|| black_box(generate(&ir, DType::F64, &options).unwrap()))
    });
}

fn bench_cached_compile(c: &mut Criterion) {
    let engine = Engine::new(JitConfig::default().with_embedded(false));
    Kernel::compile(POLY, &vars(), DType::F64, &engine).unwrap();
    c.bench_function("compile (positive cache)", |b| {
        b.iter(|| black_box(Kernel::compile(POLY, &vars(), DType::F64, &engine).unwrap()))
    });
}

criterion_group!(benches, bench_poly, bench_loop, bench_generate, bench_cached_compile);
criterion_main!(benches);
