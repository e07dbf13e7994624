//! Loaded kernel handles.

use std::ffi::c_void;
use std::fmt;

use crate::codegen::LoweringTrace;

/// Native entry point: `int sym(const void **inputs, void *output, int64_t nitems)`.
pub type KernelFn = unsafe extern "C" fn(*const *const c_void, *mut c_void, i64) -> i32;

/// Which compiler produced a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// System C compiler, shared library loaded from the disk cache
    Native,
    /// In-memory LLVM compilation
    Embedded,
}

impl Backend {
    pub fn code(self) -> u8 {
        match self {
            Backend::Native => 1,
            Backend::Embedded => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Native => "native",
            Backend::Embedded => "embedded",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keeps the code behind a [`KernelFn`] mapped.
pub(crate) enum CodeOwner {
    Library(#[allow(dead_code)] libloading::Library),
    /// Embedded code lives in an execution engine that is never torn down.
    #[cfg(feature = "llvm")]
    Leaked,
}

/// A compiled kernel ready to run.
///
/// The function pointer stays valid for as long as this value lives; the
/// shared library is closed exactly once, when the last `Arc` is dropped.
pub struct LoadedKernel {
    pub(crate) func: KernelFn,
    pub(crate) key: u64,
    pub(crate) backend: Backend,
    pub(crate) nd_descriptor: bool,
    pub(crate) trace: LoweringTrace,
    pub(crate) _owner: CodeOwner,
}

impl LoadedKernel {
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// The entry point reads an ND descriptor at `inputs[nparams]`.
    pub fn needs_nd_descriptor(&self) -> bool {
        self.nd_descriptor
    }

    pub fn trace(&self) -> &LoweringTrace {
        &self.trace
    }

    /// Run the kernel over `nitems` elements.
    ///
    /// # Safety
    /// `inputs` must hold one pointer per parameter, each valid for `nitems`
    /// elements of the parameter's dtype (null for synthesized parameters),
    /// followed by the ND descriptor when one is required. `output` must be
    /// valid for `nitems` writes of the output dtype.
    #[inline]
    pub unsafe fn call(&self, inputs: &[*const c_void], output: *mut c_void, nitems: i64) -> i32 {
        unsafe { (self.func)(inputs.as_ptr(), output, nitems) }
    }
}

impl fmt::Debug for LoadedKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedKernel")
            .field("key", &format_args!("{:016x}", self.key))
            .field("backend", &self.backend)
            .field("nd_descriptor", &self.nd_descriptor)
            .field("trace", &self.trace)
            .finish()
    }
}
