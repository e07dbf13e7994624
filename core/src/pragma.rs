//! `# me:key=value` pragmas that select the dialect, fp mode and backend.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ParseError;

static PRAGMA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*me\s*:\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*([A-Za-z0-9_]+)\s*$")
        .expect("pragma regex is valid")
});

static PRAGMA_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*me\s*:").expect("pragma prefix regex is valid")
});

/// True if a comment (without the leading `#`) is written as a pragma.
pub(crate) fn is_pragma_comment(comment: &str) -> bool {
    PRAGMA_PREFIX_RE.is_match(comment)
}

/// Control-flow dialect of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dialect {
    /// Conditions inside loops must be uniform; `if` may only guard break/continue.
    #[default]
    Vector,
    /// Per-item control flow: arbitrary statements under `if` inside loops.
    Element,
}

/// Floating-point contract for generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FpMode {
    #[default]
    Strict,
    Contract,
    Fast,
}

/// Preferred compiler backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompilerPref {
    /// Native system compiler, falling back to the embedded one.
    #[default]
    Cc,
    /// Embedded in-memory compiler.
    Tcc,
}

macro_rules! keyword_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("unknown {} '{}'", $what, other)),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

keyword_enum!(Dialect, "dialect", { Vector => "vector", Element => "element" });
keyword_enum!(FpMode, "fp mode", { Strict => "strict", Contract => "contract", Fast => "fast" });
keyword_enum!(CompilerPref, "compiler", { Cc => "cc", Tcc => "tcc" });

impl Dialect {
    pub fn code(self) -> u8 {
        match self {
            Dialect::Vector => 0,
            Dialect::Element => 1,
        }
    }
}

impl FpMode {
    pub fn code(self) -> u8 {
        match self {
            FpMode::Strict => 0,
            FpMode::Contract => 1,
            FpMode::Fast => 2,
        }
    }
}

/// Settings collected from the pragma comments of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pragmas {
    pub dialect: Dialect,
    pub fp_mode: FpMode,
    pub compiler: CompilerPref,
}

#[derive(Default)]
pub(crate) struct PragmaCollector {
    pragmas: Pragmas,
    seen_dialect: bool,
    seen_fp: bool,
    seen_compiler: bool,
}

impl PragmaCollector {
    /// Feed the text of one comment (without the leading `#`).
    ///
    /// Comments that do not start with `me:` are ignored.
    pub(crate) fn feed(&mut self, comment: &str, line: usize, column: usize) -> Result<(), ParseError> {
        if !is_pragma_comment(comment) {
            return Ok(());
        }
        let caps = PRAGMA_RE.captures(comment).ok_or_else(|| {
            ParseError::new(line, column, "malformed pragma, expected '# me:key=value'")
        })?;
        let key = &caps[1];
        let value = &caps[2];
        let err = |msg: String| ParseError::new(line, column, msg);

        match key {
            "dialect" => {
                if self.seen_dialect {
                    return Err(err("duplicate 'dialect' pragma".to_string()));
                }
                self.seen_dialect = true;
                self.pragmas.dialect = value.parse().map_err(err)?;
            }
            "fp" => {
                if self.seen_fp {
                    return Err(err("duplicate 'fp' pragma".to_string()));
                }
                self.seen_fp = true;
                self.pragmas.fp_mode = value.parse().map_err(err)?;
            }
            "compiler" => {
                if self.seen_compiler {
                    return Err(err("duplicate 'compiler' pragma".to_string()));
                }
                self.seen_compiler = true;
                self.pragmas.compiler = value.parse().map_err(err)?;
            }
            other => return Err(err(format!("unknown pragma 'me:{other}'"))),
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> Pragmas {
        self.pragmas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(comments: &[&str]) -> Result<Pragmas, ParseError> {
        let mut collector = PragmaCollector::default();
        for (i, c) in comments.iter().enumerate() {
            collector.feed(c, i + 1, 1)?;
        }
        Ok(collector.finish())
    }

    #[test]
    fn test_defaults() {
        let p = collect(&[" plain comment"]).unwrap();
        assert_eq!(p, Pragmas::default());
    }

    #[test]
    fn test_all_keys() {
        let p = collect(&[" me:fp=fast", " me: dialect = element", "me:compiler=tcc"]).unwrap();
        assert_eq!(p.fp_mode, FpMode::Fast);
        assert_eq!(p.dialect, Dialect::Element);
        assert_eq!(p.compiler, CompilerPref::Tcc);
    }

    #[test]
    fn test_unknown_key() {
        let err = collect(&[" me:opt=3"]).unwrap_err();
        assert!(err.message.contains("unknown pragma"));
    }

    #[test]
    fn test_unknown_value() {
        let err = collect(&[" me:fp=loose"]).unwrap_err();
        assert!(err.message.contains("unknown fp mode"));
    }

    #[test]
    fn test_duplicate() {
        let err = collect(&[" me:fp=fast", " me:fp=strict"]).unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn test_malformed() {
        assert!(collect(&[" me:fp"]).is_err());
    }
}
