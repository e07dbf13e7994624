use proptest::prelude::*;
use veckern::{DType, DefaultResolver, build_ir, parse, parse_expr};

// ============================================================================
// Strategies
// ============================================================================

/// Small arithmetic expressions over `x` and integer literals.
fn arith_expr() -> impl Strategy<Value = String> {
    let leaf = prop_oneof![Just("x".to_string()), (0u32..1000).prop_map(|n| n.to_string()),];
    leaf.prop_recursive(4, 32, 2, |inner| {
        (inner.clone(), prop_oneof![Just("+"), Just("-"), Just("*")], inner)
            .prop_map(|(a, op, b)| format!("({a} {op} {b})"))
    })
}

fn float_dtype() -> impl Strategy<Value = DType> {
    prop_oneof![Just(DType::F32), Just(DType::F64)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn parser_never_panics(src in "\\PC{0,80}") {
        let _ = parse(&src);
    }

    #[test]
    fn expr_parser_never_panics(src in "[-+*/()<>=!&|^~%. a-z0-9]{0,40}") {
        let _ = parse_expr(&src);
    }

    #[test]
    fn fingerprint_is_deterministic(expr in arith_expr(), dtype in float_dtype()) {
        let src = format!("def k(x):\n    return {expr}\n");
        let program = parse(&src).unwrap();
        let params = vec![("x".to_string(), dtype)];
        let a = build_ir(&program, &params, &mut DefaultResolver).unwrap();
        let b = build_ir(&program, &params, &mut DefaultResolver).unwrap();
        prop_assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn float_param_fixes_return_dtype(expr in arith_expr(), dtype in float_dtype()) {
        // Every generated expression mentions only x and weak integer literals.
        prop_assume!(expr.contains('x'));
        let src = format!("def k(x):\n    return {expr}\n");
        let program = parse(&src).unwrap();
        let ir = build_ir(&program, &[("x".to_string(), dtype)], &mut DefaultResolver).unwrap();
        prop_assert_eq!(ir.return_dtype, dtype);
    }
}
