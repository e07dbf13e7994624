//! Error types for the kernel front end.

use thiserror::Error;

/// Syntax error reported by the kernel parser.
///
/// Lines and columns are 1-based. A parse failure never yields a partial tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{line}:{column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        ParseError {
            line,
            column,
            message: message.into(),
        }
    }
}

/// Category of an IR build failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrErrorKind {
    /// The construct is valid kernel code but outside the compiled subset.
    Unsupported,
    /// The kernel does not type-check: unknown names, conflicting types, bad dtypes.
    Type,
}

/// Error raised while lowering a parsed kernel to typed IR.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{line}:{column}: {message}")]
pub struct IrError {
    pub kind: IrErrorKind,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl IrError {
    pub fn unsupported(line: usize, column: usize, message: impl Into<String>) -> Self {
        IrError {
            kind: IrErrorKind::Unsupported,
            line,
            column,
            message: message.into(),
        }
    }

    pub fn type_error(line: usize, column: usize, message: impl Into<String>) -> Self {
        IrError {
            kind: IrErrorKind::Type,
            line,
            column,
            message: message.into(),
        }
    }

    pub fn is_unsupported(&self) -> bool {
        self.kind == IrErrorKind::Unsupported
    }
}

/// Error raised by the expression parser or type checker.
///
/// `offset` is the 0-based character offset inside the expression text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (at offset {offset})")]
pub struct ExprError {
    pub offset: usize,
    pub message: String,
}

impl ExprError {
    pub fn new(offset: usize, message: impl Into<String>) -> Self {
        ExprError {
            offset,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new(3, 5, "expected ':'");
        assert_eq!(err.to_string(), "3:5: expected ':'");
    }

    #[test]
    fn test_ir_error_kinds() {
        assert!(IrError::unsupported(1, 1, "print").is_unsupported());
        assert!(!IrError::type_error(1, 1, "bad").is_unsupported());
    }
}
