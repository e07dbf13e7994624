//! The user-facing kernel API: compile once, evaluate over typed buffers.
//!
//! ```text
//! parse -> IR -> codegen + JIT build -> native entry point
//!                        \-> (unsupported or failed) -> interpreter
//! ```

use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::{debug, warn};
use veckern::{DType, DefaultResolver, IrError, IrProgram, ParseError, Reserved, build_ir, parse};

use crate::buffer::{ArrayMut, ArrayRef};
use crate::codegen::LoweringTrace;
use crate::interpreter::{DEFAULT_ITERATION_LIMIT, EvalError, TypedProgram, reserved_names};
use crate::jit::{Backend, JitCache, JitConfig, JitEngine, LoadedKernel, Toolchain};
use crate::nd::NdContext;

static GLOBAL_ENGINE: Lazy<Engine> = Lazy::new(Engine::from_env);

// ============================================================================
// Errors
// ============================================================================

/// Why a kernel could not be compiled at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Ir(#[from] IrError),
    #[error("variable '{0}' is not a parameter of the kernel")]
    UnknownVariable(String),
    #[error("parameter '{0}' has no dtype")]
    MissingVariable(String),
    #[error("variable '{0}' is listed more than once")]
    DuplicateVariable(String),
    #[error("'{0}' is a reserved name and is always synthesized")]
    ReservedVariable(String),
}

// ============================================================================
// Engine
// ============================================================================

/// JIT configuration, cache and toolchain shared by the kernels it compiles.
#[derive(Debug, Clone)]
pub struct Engine {
    jit: JitEngine,
    iteration_limit: u64,
}

impl Engine {
    pub fn new(config: JitConfig) -> Self {
        Engine {
            jit: JitEngine::new(config),
            iteration_limit: DEFAULT_ITERATION_LIMIT,
        }
    }

    /// An engine configured from `VECKERN_JIT*` environment variables.
    pub fn from_env() -> Self {
        Self::new(JitConfig::from_env())
    }

    /// The process-wide engine, configured from the environment on first use.
    pub fn global() -> &'static Engine {
        &GLOBAL_ENGINE
    }

    pub fn with_cache(mut self, cache: Arc<JitCache>) -> Self {
        self.jit = self.jit.with_cache(cache);
        self
    }

    pub fn with_toolchain(mut self, toolchain: Arc<dyn Toolchain>) -> Self {
        self.jit = self.jit.with_toolchain(toolchain);
        self
    }

    /// Per-element loop iteration cap for interpreted kernels.
    pub fn with_iteration_limit(mut self, limit: u64) -> Self {
        self.iteration_limit = limit;
        self
    }

    pub fn jit(&self) -> &JitEngine {
        &self.jit
    }

    pub fn config(&self) -> &JitConfig {
        self.jit.config()
    }

    pub fn cache(&self) -> &Arc<JitCache> {
        self.jit.cache()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(JitConfig::default())
    }
}

// ============================================================================
// Kernel
// ============================================================================

/// How a compiled kernel evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecPath {
    Jit(Backend),
    Interpreter,
}

impl fmt::Display for ExecPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecPath::Jit(backend) => write!(f, "jit ({backend})"),
            ExecPath::Interpreter => f.write_str("interpreter"),
        }
    }
}

/// A kernel ready to evaluate.
pub struct Kernel {
    output: DType,
    program: TypedProgram,
    ir: Option<IrProgram>,
    native: Option<Arc<LoadedKernel>>,
    fallback: Option<String>,
    iteration_limit: u64,
}

impl Kernel {
    /// Compile `source` with input dtypes `vars` producing `output` elements.
    ///
    /// Every non-reserved `def` parameter needs a dtype in `vars`. Constructs
    /// outside the compiled subset and JIT build failures are not errors: the
    /// kernel falls back to the interpreter and records why.
    pub fn compile<S: AsRef<str>>(
        source: &str,
        vars: &[(S, DType)],
        output: DType,
        engine: &Engine,
    ) -> Result<Self, CompileError> {
        let program = parse(source)?;

        for (i, (name, _)) in vars.iter().enumerate() {
            let name = name.as_ref();
            if Reserved::parse(name).is_some() {
                return Err(CompileError::ReservedVariable(name.to_string()));
            }
            if !program.params.iter().any(|p| p == name) {
                return Err(CompileError::UnknownVariable(name.to_string()));
            }
            if vars[..i].iter().any(|(n, _)| n.as_ref() == name) {
                return Err(CompileError::DuplicateVariable(name.to_string()));
            }
        }

        let mut params: Vec<(String, DType)> = Vec::with_capacity(program.params.len());
        for name in &program.params {
            let dtype = if Reserved::parse(name).is_some() {
                DType::I64
            } else {
                vars.iter()
                    .find(|(n, _)| n.as_ref() == name)
                    .map(|(_, dt)| *dt)
                    .ok_or_else(|| CompileError::MissingVariable(name.clone()))?
            };
            params.push((name.clone(), dtype));
        }
        for name in reserved_names(&program) {
            if !params.iter().any(|(n, _)| *n == name) {
                params.push((name, DType::I64));
            }
        }

        let (ir, mut fallback) = match build_ir(&program, &params, &mut DefaultResolver) {
            Ok(ir) => (Some(ir), None),
            Err(e) if e.is_unsupported() => {
                debug!(target: "veckern::jit", kernel = %program.name, reason = %e, "outside the compiled subset");
                (None, Some(e.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let typed = TypedProgram::new(&program, &params)?;

        let mut native = None;
        if let Some(ir) = &ir {
            match engine.jit.build(ir, output, program.pragmas.compiler) {
                Ok(kernel) => native = Some(kernel),
                Err(e) => {
                    debug!(target: "veckern::jit", kernel = %program.name, error = %e, "using the interpreter");
                    fallback = Some(e.to_string());
                }
            }
        }

        Ok(Kernel {
            output,
            program: typed,
            ir,
            native,
            fallback,
            iteration_limit: engine.iteration_limit,
        })
    }

    pub fn name(&self) -> &str {
        self.program.name()
    }

    pub fn output_dtype(&self) -> DType {
        self.output
    }

    /// Input arrays expected by [`Kernel::eval`], in `def` order.
    pub fn inputs(&self) -> &[(String, DType)] {
        self.program.inputs()
    }

    pub fn path(&self) -> ExecPath {
        match &self.native {
            Some(k) => ExecPath::Jit(k.backend()),
            None => ExecPath::Interpreter,
        }
    }

    /// Why the kernel is interpreted, if it is.
    pub fn fallback_reason(&self) -> Option<&str> {
        self.fallback.as_deref()
    }

    /// The typed IR, when the kernel is inside the compiled subset.
    pub fn ir(&self) -> Option<&IrProgram> {
        self.ir.as_ref()
    }

    pub fn trace(&self) -> Option<&LoweringTrace> {
        self.native.as_ref().map(|k| k.trace())
    }

    pub fn native(&self) -> Option<&Arc<LoadedKernel>> {
        self.native.as_ref()
    }

    /// Evaluate over whole 1-D arrays; `print` output goes to stdout.
    pub fn eval(&self, inputs: &[ArrayRef], output: ArrayMut) -> Result<(), EvalError> {
        let nd = NdContext::linear(output.len());
        self.eval_nd(inputs, output, &nd)
    }

    /// Evaluate one block of an N-dimensional array.
    pub fn eval_nd(
        &self,
        inputs: &[ArrayRef],
        output: ArrayMut,
        nd: &NdContext,
    ) -> Result<(), EvalError> {
        self.eval_with(inputs, output, nd, &mut |line: &str| println!("{line}"))
    }

    /// Like [`Kernel::eval_nd`], sending `print` output to `print`.
    pub fn eval_with(
        &self,
        inputs: &[ArrayRef],
        mut output: ArrayMut,
        nd: &NdContext,
        print: &mut dyn FnMut(&str),
    ) -> Result<(), EvalError> {
        self.validate(inputs, &output, nd)?;
        if let Some(kernel) = &self.native {
            let status = self.call_native(kernel, inputs, &mut output, nd);
            if status == 0 {
                return Ok(());
            }
            warn!(
                target: "veckern::jit",
                kernel = self.name(),
                status,
                "native kernel rejected its arguments; interpreting"
            );
        }
        self.program
            .run(inputs, &mut output, nd, self.iteration_limit, print)
    }

    fn validate(&self, inputs: &[ArrayRef], output: &ArrayMut, nd: &NdContext) -> Result<(), EvalError> {
        if output.dtype() != self.output {
            return Err(EvalError::OutputType {
                expected: self.output,
                got: output.dtype(),
            });
        }
        let n = output.len();
        if nd.block_len() != n {
            return Err(EvalError::Length {
                name: "output".to_string(),
                expected: nd.block_len(),
                got: n,
            });
        }
        let expected = self.program.inputs();
        if inputs.len() != expected.len() {
            return Err(EvalError::InputCount {
                expected: expected.len(),
                got: inputs.len(),
            });
        }
        for (array, (name, dtype)) in inputs.iter().zip(expected) {
            if array.dtype() != *dtype {
                return Err(EvalError::InputType {
                    name: name.clone(),
                    expected: *dtype,
                    got: array.dtype(),
                });
            }
            if array.len() < n {
                return Err(EvalError::Length {
                    name: name.clone(),
                    expected: n,
                    got: array.len(),
                });
            }
        }
        Ok(())
    }

    fn call_native(
        &self,
        kernel: &LoadedKernel,
        inputs: &[ArrayRef],
        output: &mut ArrayMut,
        nd: &NdContext,
    ) -> i32 {
        let Some(ir) = &self.ir else { return -1 };
        let expected = self.program.inputs();
        let mut pointers: Vec<*const c_void> = Vec::with_capacity(ir.params.len() + 1);
        for (name, _) in &ir.params {
            let ptr = expected
                .iter()
                .position(|(n, _)| n == name)
                .map_or(std::ptr::null(), |i| inputs[i].as_ptr());
            pointers.push(ptr);
        }
        let descriptor = nd.descriptor();
        if kernel.needs_nd_descriptor() {
            pointers.push(descriptor.as_ptr().cast());
        }
        let n = output.len() as i64;
        // SAFETY: pointers follow the IR parameter order, every input holds at
        // least `n` elements of its declared dtype, and the output has `n`
        // elements of the compiled output dtype.
        unsafe { kernel.call(&pointers, output.as_mut_ptr(), n) }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name())
            .field("output", &self.output)
            .field("path", &self.path())
            .field("fallback", &self.fallback)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interpreted() -> Engine {
        Engine::new(JitConfig::default().with_enabled(false))
    }

    #[test]
    fn test_disabled_jit_interprets() {
        let k = Kernel::compile(
            "def k(x):\n    return x * 2\n",
            &[("x", DType::I32)],
            DType::I32,
            &interpreted(),
        )
        .unwrap();
        assert_eq!(k.path(), ExecPath::Interpreter);
        assert!(k.fallback_reason().unwrap().contains("disabled"));
        let x = [1i32, 2, 3];
        let mut out = [0i32; 3];
        k.eval(&[x.as_slice().into()], out.as_mut_slice().into()).unwrap();
        assert_eq!(out, [2, 4, 6]);
    }

    #[test]
    fn test_unsupported_construct_falls_back() {
        let src = "def k(x):\n    y = 0\n    while y < x:\n        y = y + 1\n    return y\n";
        let k = Kernel::compile(src, &[("x", DType::I64)], DType::I64, &Engine::default()).unwrap();
        assert_eq!(k.path(), ExecPath::Interpreter);
        assert!(k.ir().is_none());
        assert!(k.fallback_reason().unwrap().contains("while"));
        let x = [0i64, 3, 5];
        let mut out = [0i64; 3];
        k.eval(&[x.as_slice().into()], out.as_mut_slice().into()).unwrap();
        assert_eq!(out, [0, 3, 5]);
    }

    #[test]
    fn test_variable_checks() {
        let src = "def k(x, y):\n    return x + y\n";
        let engine = interpreted();
        let err = Kernel::compile(src, &[("x", DType::F64), ("z", DType::F64)], DType::F64, &engine)
            .unwrap_err();
        assert_eq!(err, CompileError::UnknownVariable("z".into()));
        let err = Kernel::compile(src, &[("x", DType::F64)], DType::F64, &engine).unwrap_err();
        assert_eq!(err, CompileError::MissingVariable("y".into()));
        let err = Kernel::compile(src, &[("x", DType::F64), ("x", DType::F64)], DType::F64, &engine)
            .unwrap_err();
        assert_eq!(err, CompileError::DuplicateVariable("x".into()));
        let err = Kernel::compile(src, &[("_i0", DType::I64)], DType::F64, &engine).unwrap_err();
        assert_eq!(err, CompileError::ReservedVariable("_i0".into()));
    }

    #[test]
    fn test_missing_return_is_a_compile_error() {
        let src = "def k(x):\n    if x > 0:\n        return 1\n";
        let err = Kernel::compile(src, &[("x", DType::F64)], DType::I64, &interpreted()).unwrap_err();
        assert!(matches!(err, CompileError::Ir(_)));
    }

    #[test]
    fn test_eval_validation() {
        let k = Kernel::compile(
            "def k(x):\n    return x\n",
            &[("x", DType::F64)],
            DType::F64,
            &interpreted(),
        )
        .unwrap();
        let x = [1.0f64, 2.0];
        let mut out32 = [0f32; 2];
        let err = k
            .eval(&[x.as_slice().into()], out32.as_mut_slice().into())
            .unwrap_err();
        assert!(matches!(err, EvalError::OutputType { .. }));

        let mut out = [0f64; 3];
        let err = k.eval(&[x.as_slice().into()], out.as_mut_slice().into()).unwrap_err();
        assert!(matches!(err, EvalError::Length { .. }));

        let mut out = [0f64; 2];
        let err = k.eval(&[], out.as_mut_slice().into()).unwrap_err();
        assert_eq!(err, EvalError::InputCount { expected: 1, got: 0 });
    }

    #[test]
    fn test_implicit_reserved_params() {
        let k = Kernel::compile(
            "def k(x):\n    return x + _i0 * 10\n",
            &[("x", DType::I64)],
            DType::I64,
            &interpreted(),
        )
        .unwrap();
        assert_eq!(k.inputs().len(), 1);
        let x = [1i64; 4];
        let mut out = [0i64; 4];
        k.eval(&[x.as_slice().into()], out.as_mut_slice().into()).unwrap();
        assert_eq!(out, [1, 11, 21, 31]);
    }

    #[test]
    fn test_print_hook() {
        let src = "# me:dialect=element\ndef k(x):\n    print(\"x={}\", x)\n    return x\n";
        let k = Kernel::compile(src, &[("x", DType::I32)], DType::I32, &Engine::default()).unwrap();
        assert_eq!(k.path(), ExecPath::Interpreter);
        let x = [7i32, 8];
        let mut out = [0i32; 2];
        let mut lines = Vec::new();
        k.eval_with(
            &[x.as_slice().into()],
            out.as_mut_slice().into(),
            &NdContext::linear(2),
            &mut |s: &str| lines.push(s.to_string()),
        )
        .unwrap();
        assert_eq!(lines, ["x=7", "x=8"]);
    }
}
