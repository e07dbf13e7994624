use criterion::{Criterion, black_box, criterion_group, criterion_main};
use veckern::{DType, DefaultResolver, build_ir, infer, parse, parse_expr};

const KERNEL: &str = "\
# me:dialect=element
def k(x, y):
    acc = 0.0
    for i in range(8):
        if x > i:
            acc = acc + sqrt(x * x + y * y) / (i + 1)
        elif y < 0:
            acc = acc - 1
        else:
            break
    return acc
";

fn params() -> Vec<(String, DType)> {
    vec![("x".to_string(), DType::F64), ("y".to_string(), DType::F64)]
}

// ============================================================================
// Parsing Benchmarks
// ============================================================================

fn bench_parse_kernel(c: &mut Criterion) {
    c.bench_function("parse kernel", |b| b.iter(|| black_box(parse(KERNEL).unwrap())));
}

fn bench_parse_deep_expr(c: &mut Criterion) {
    let mut expr = String::from("x");
    for _ in 0..50 {
        expr = format!("({expr} + 1)");
    }
    c.bench_function("parse deep expr (50 levels)", |b| {
        b.iter(|| black_box(parse_expr(&expr).unwrap()))
    });
}

// ============================================================================
// Typing and IR Benchmarks
// ============================================================================

fn bench_infer(c: &mut Criterion) {
    let expr = parse_expr("where(x > 0, sqrt(x) * 2.5, abs(y) + 1)").unwrap();
    let symbols = params();
    c.bench_function("infer call expr", |b| {
        b.iter(|| black_box(infer(&expr, &symbols).unwrap()))
    });
}

fn bench_build_ir(c: &mut Criterion) {
    let program = parse(KERNEL).unwrap();
    let params = params();
    c.bench_function("build ir", |b| {
        b.iter(|| black_box(build_ir(&program, &params, &mut DefaultResolver).unwrap()))
    });
}

fn bench_fingerprint(c: &mut Criterion) {
    let program = parse(KERNEL).unwrap();
    let ir = build_ir(&program, &params(), &mut DefaultResolver).unwrap();
    c.bench_function("fingerprint", |b| b.iter(|| black_box(ir.fingerprint())));
}

criterion_group!(
    benches,
    bench_parse_kernel,
    bench_parse_deep_expr,
    bench_infer,
    bench_build_ir,
    bench_fingerprint
);
criterion_main!(benches);
