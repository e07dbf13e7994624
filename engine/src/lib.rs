//! veckern runtime - code generation, JIT compilation and interpretation
//!
//! This crate turns kernels parsed by the `veckern` crate into something
//! that runs over arrays:
//! - C code generation with whole-array vector lowering
//! - A JIT cache that builds kernels with a native C compiler or an embedded
//!   LLVM backend and loads them into the process
//! - A per-element interpreter used whenever a kernel cannot be compiled
//! - The [`Kernel`] facade tying these together
//!
//! ```no_run
//! use veckern::DType;
//! use veckern_engine::{Engine, Kernel};
//!
//! let kernel = Kernel::compile(
//!     "def scale(x):\n    return x * 2.5\n",
//!     &[("x", DType::F64)],
//!     DType::F64,
//!     Engine::global(),
//! )?;
//! let x = vec![1.0, 2.0, 3.0];
//! let mut out = vec![0.0; 3];
//! kernel.eval(&[(&x).into()], (&mut out).into())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bridge;
pub mod buffer;
pub mod codegen;
pub mod interpreter;
pub mod jit;
pub mod kernel;
pub mod nd;
pub mod value;

// Re-export the facade and the types it hands out
pub use buffer::{ArrayMut, ArrayRef};
pub use codegen::{CodegenError, CodegenOptions, Generated, LoweringMode, LoweringTrace, generate};
pub use interpreter::{EvalError, TypedProgram};
pub use jit::{Backend, FailureClass, JitCache, JitConfig, JitEngine, JitError, JitErrorKind};
pub use kernel::{CompileError, Engine, ExecPath, Kernel};
pub use nd::NdContext;
pub use value::Scalar;
