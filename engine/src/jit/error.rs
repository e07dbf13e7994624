//! JIT error types and handling.

use std::fmt;

/// Why a native build or load did not produce a kernel.
///
/// Every class is recorded in the negative cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// The cache directory could not be created or is not a directory
    CacheDirUnavailable,
    /// An artifact path exceeds the platform path limit
    PathTooLong,
    /// Writing the generated source failed
    WriteFailed,
    /// The compiler rejected the source or could not be run
    CompileFailed,
    /// The shared library could not be opened, bound or resolved
    LoadFailed,
    /// Writing the metadata descriptor failed
    MetadataWriteFailed,
    /// Neither the native nor the embedded backend is usable
    NoBackend,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::CacheDirUnavailable => "cache-dir-unavailable",
            FailureClass::PathTooLong => "path-too-long",
            FailureClass::WriteFailed => "write-failed",
            FailureClass::CompileFailed => "compile-failed",
            FailureClass::LoadFailed => "load-failed",
            FailureClass::MetadataWriteFailed => "metadata-write-failed",
            FailureClass::NoBackend => "no-backend",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categories of JIT errors.
#[derive(Debug, Clone, PartialEq)]
pub enum JitErrorKind {
    /// The kernel is outside what the JIT handles (by design, not a failure)
    Ineligible,
    /// The code generator rejected the IR
    Codegen,
    /// Building or loading native code failed
    Build(FailureClass),
}

/// A JIT error with context.
#[derive(Debug, Clone)]
pub struct JitError {
    /// The category of error
    pub kind: JitErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Where the error happened: a path, a kernel name, compiler output
    pub context: Option<String>,
    /// Suggestion for how to fix or work around the error
    pub suggestion: Option<String>,
}

impl JitError {
    /// Create a new JIT error.
    pub fn new(kind: JitErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
            suggestion: None,
        }
    }

    /// Add context to the error.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Add a suggestion for fixing the error.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn ineligible(what: impl Into<String>) -> Self {
        Self::new(JitErrorKind::Ineligible, what)
    }

    pub fn codegen(what: impl Into<String>) -> Self {
        Self::new(JitErrorKind::Codegen, what)
    }

    pub fn build(class: FailureClass, what: impl Into<String>) -> Self {
        Self::new(JitErrorKind::Build(class), what)
    }

    /// The negative-cache class, for build failures.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self.kind {
            JitErrorKind::Build(class) => Some(class),
            _ => None,
        }
    }
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let JitErrorKind::Build(class) = self.kind {
            write!(f, "[{class}] ")?;
        }
        write!(f, "{}", self.message)?;
        if let Some(ref context) = self.context {
            // Compiler diagnostics can run long
            let truncated = if context.chars().count() > 200 {
                let head: String = context.chars().take(197).collect();
                format!("{head}...")
            } else {
                context.clone()
            };
            write!(f, " in: {truncated}")?;
        }
        if let Some(ref suggestion) = self.suggestion {
            write!(f, " ({suggestion})")?;
        }
        Ok(())
    }
}

impl std::error::Error for JitError {}

impl From<JitError> for String {
    fn from(err: JitError) -> String {
        err.to_string()
    }
}
