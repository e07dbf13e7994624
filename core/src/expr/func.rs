/// Named math functions callable from kernel expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathFunc {
    // unary
    Abs,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Asinh,
    Acosh,
    Atanh,
    Exp,
    Exp2,
    Exp10,
    Expm1,
    Log,
    Log2,
    Log10,
    Log1p,
    Sqrt,
    Cbrt,
    Floor,
    Ceil,
    Round,
    Trunc,
    Sinpi,
    Cospi,
    // binary
    Atan2,
    Pow,
    Hypot,
    Fmax,
    Fmin,
    Logaddexp,
    Copysign,
}

impl MathFunc {
    pub const ALL: [MathFunc; 36] = [
        MathFunc::Abs,
        MathFunc::Sin,
        MathFunc::Cos,
        MathFunc::Tan,
        MathFunc::Asin,
        MathFunc::Acos,
        MathFunc::Atan,
        MathFunc::Sinh,
        MathFunc::Cosh,
        MathFunc::Tanh,
        MathFunc::Asinh,
        MathFunc::Acosh,
        MathFunc::Atanh,
        MathFunc::Exp,
        MathFunc::Exp2,
        MathFunc::Exp10,
        MathFunc::Expm1,
        MathFunc::Log,
        MathFunc::Log2,
        MathFunc::Log10,
        MathFunc::Log1p,
        MathFunc::Sqrt,
        MathFunc::Cbrt,
        MathFunc::Floor,
        MathFunc::Ceil,
        MathFunc::Round,
        MathFunc::Trunc,
        MathFunc::Sinpi,
        MathFunc::Cospi,
        MathFunc::Atan2,
        MathFunc::Pow,
        MathFunc::Hypot,
        MathFunc::Fmax,
        MathFunc::Fmin,
        MathFunc::Logaddexp,
        MathFunc::Copysign,
    ];

    /// Resolve a call name, accepting NumPy-style aliases.
    pub fn lookup(name: &str) -> Option<MathFunc> {
        let func = match name {
            "abs" | "absolute" | "fabs" => MathFunc::Abs,
            "sin" => MathFunc::Sin,
            "cos" => MathFunc::Cos,
            "tan" => MathFunc::Tan,
            "asin" | "arcsin" => MathFunc::Asin,
            "acos" | "arccos" => MathFunc::Acos,
            "atan" | "arctan" => MathFunc::Atan,
            "sinh" => MathFunc::Sinh,
            "cosh" => MathFunc::Cosh,
            "tanh" => MathFunc::Tanh,
            "asinh" | "arcsinh" => MathFunc::Asinh,
            "acosh" | "arccosh" => MathFunc::Acosh,
            "atanh" | "arctanh" => MathFunc::Atanh,
            "exp" => MathFunc::Exp,
            "exp2" => MathFunc::Exp2,
            "exp10" => MathFunc::Exp10,
            "expm1" => MathFunc::Expm1,
            "log" => MathFunc::Log,
            "log2" => MathFunc::Log2,
            "log10" => MathFunc::Log10,
            "log1p" => MathFunc::Log1p,
            "sqrt" => MathFunc::Sqrt,
            "cbrt" => MathFunc::Cbrt,
            "floor" => MathFunc::Floor,
            "ceil" => MathFunc::Ceil,
            "round" | "rint" => MathFunc::Round,
            "trunc" => MathFunc::Trunc,
            "sinpi" => MathFunc::Sinpi,
            "cospi" => MathFunc::Cospi,
            "atan2" | "arctan2" => MathFunc::Atan2,
            "pow" | "power" => MathFunc::Pow,
            "hypot" => MathFunc::Hypot,
            "fmax" => MathFunc::Fmax,
            "fmin" => MathFunc::Fmin,
            "logaddexp" => MathFunc::Logaddexp,
            "copysign" => MathFunc::Copysign,
            _ => return None,
        };
        Some(func)
    }

    /// Canonical name; also the stem of the bridge symbol names.
    pub fn name(self) -> &'static str {
        match self {
            MathFunc::Abs => "abs",
            MathFunc::Sin => "sin",
            MathFunc::Cos => "cos",
            MathFunc::Tan => "tan",
            MathFunc::Asin => "asin",
            MathFunc::Acos => "acos",
            MathFunc::Atan => "atan",
            MathFunc::Sinh => "sinh",
            MathFunc::Cosh => "cosh",
            MathFunc::Tanh => "tanh",
            MathFunc::Asinh => "asinh",
            MathFunc::Acosh => "acosh",
            MathFunc::Atanh => "atanh",
            MathFunc::Exp => "exp",
            MathFunc::Exp2 => "exp2",
            MathFunc::Exp10 => "exp10",
            MathFunc::Expm1 => "expm1",
            MathFunc::Log => "log",
            MathFunc::Log2 => "log2",
            MathFunc::Log10 => "log10",
            MathFunc::Log1p => "log1p",
            MathFunc::Sqrt => "sqrt",
            MathFunc::Cbrt => "cbrt",
            MathFunc::Floor => "floor",
            MathFunc::Ceil => "ceil",
            MathFunc::Round => "round",
            MathFunc::Trunc => "trunc",
            MathFunc::Sinpi => "sinpi",
            MathFunc::Cospi => "cospi",
            MathFunc::Atan2 => "atan2",
            MathFunc::Pow => "pow",
            MathFunc::Hypot => "hypot",
            MathFunc::Fmax => "fmax",
            MathFunc::Fmin => "fmin",
            MathFunc::Logaddexp => "logaddexp",
            MathFunc::Copysign => "copysign",
        }
    }

    pub fn arity(self) -> usize {
        if self.is_binary() { 2 } else { 1 }
    }

    pub fn is_binary(self) -> bool {
        matches!(
            self,
            MathFunc::Atan2
                | MathFunc::Pow
                | MathFunc::Hypot
                | MathFunc::Fmax
                | MathFunc::Fmin
                | MathFunc::Logaddexp
                | MathFunc::Copysign
        )
    }

    /// Stable index into the bridge table.
    pub fn index(self) -> usize {
        MathFunc::ALL
            .iter()
            .position(|f| *f == self)
            .unwrap_or_default()
    }
}

/// Reduction names recognised only to be rejected with a clear message.
pub const REDUCTIONS: &[&str] = &["any", "all", "sum", "mean", "min", "max", "prod"];
