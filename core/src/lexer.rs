use crate::error::{ExprError, ParseError};

// ============================================================================
// Lexer
// ============================================================================

/// Character cursor shared by the line scanner and the expression tokenizer.
pub struct Lexer {
    input: Vec<char>,
    position: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn current_char(&self) -> char {
        if self.position < self.input.len() {
            self.input[self.position]
        } else {
            '\0'
        }
    }

    fn peek_ahead(&self, n: usize) -> char {
        if self.position + n < self.input.len() {
            self.input[self.position + n]
        } else {
            '\0'
        }
    }

    fn advance(&mut self) {
        if self.position < self.input.len() {
            self.position += 1;
        }
    }

    fn is_eof(&self) -> bool {
        self.position >= self.input.len()
    }

    fn skip_whitespace(&mut self) {
        while !self.is_eof() && self.current_char().is_whitespace() {
            self.advance();
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<(), String> {
        if self.current_char() == expected {
            self.advance();
            Ok(())
        } else {
            Err(format!(
                "expected '{}', found '{}'",
                expected,
                self.current_char()
            ))
        }
    }

    // ========================================================================
    // String Parsing
    // ========================================================================

    /// Read a single- or double-quoted string literal, decoding escapes.
    ///
    /// The cursor must sit on the opening quote.
    pub fn read_string(&mut self) -> Result<String, String> {
        let quote = self.current_char();
        if quote != '"' && quote != '\'' {
            return Err("not a string literal".to_string());
        }
        self.advance();
        let mut content = String::new();

        while self.current_char() != quote && !self.is_eof() {
            if self.current_char() == '\\' {
                self.advance();
                content.push(self.read_escape_sequence()?);
            } else {
                content.push(self.current_char());
                self.advance();
            }
        }

        if self.is_eof() {
            return Err("unterminated string literal".to_string());
        }

        self.expect_char(quote)?;
        Ok(content)
    }

    fn read_escape_sequence(&mut self) -> Result<char, String> {
        if self.is_eof() {
            return Err("unterminated escape sequence".to_string());
        }
        let c = self.current_char();
        self.advance();

        match c {
            'n' => Ok('\n'),
            't' => Ok('\t'),
            'r' => Ok('\r'),
            '\\' => Ok('\\'),
            '"' => Ok('"'),
            '\'' => Ok('\''),
            '0' => Ok('\0'),
            'u' => self.read_unicode_escape(4),
            'U' => self.read_unicode_escape(8),
            _ => Err(format!("unknown escape sequence: \\{c}")),
        }
    }

    /// Read `\uXXXX` (4 digits) or `\UXXXXXXXX` (8 digits).
    fn read_unicode_escape(&mut self, digits: usize) -> Result<char, String> {
        let mut hex = String::new();

        for _ in 0..digits {
            if !self.current_char().is_ascii_hexdigit() {
                return Err("invalid hex digit in unicode escape".to_string());
            }
            hex.push(self.current_char());
            self.advance();
        }

        let code_point = u32::from_str_radix(&hex, 16)
            .map_err(|e| format!("invalid unicode code point: {e}"))?;

        char::from_u32(code_point)
            .ok_or_else(|| format!("invalid unicode code point: {code_point:#x}"))
    }

    // ========================================================================
    // Number and Identifier Parsing
    // ========================================================================

    fn read_identifier(&mut self) -> String {
        let mut ident = String::new();
        while !self.is_eof() && is_ident_char(self.current_char()) {
            ident.push(self.current_char());
            self.advance();
        }
        ident
    }

    fn read_number(&mut self) -> Result<Token, String> {
        let mut text = String::new();
        let mut is_float = false;

        while self.current_char().is_ascii_digit() {
            text.push(self.current_char());
            self.advance();
        }

        if self.current_char() == '.' {
            is_float = true;
            text.push('.');
            self.advance();
            while self.current_char().is_ascii_digit() {
                text.push(self.current_char());
                self.advance();
            }
        }

        if matches!(self.current_char(), 'e' | 'E') {
            let sign = self.peek_ahead(1);
            let has_sign = sign == '+' || sign == '-';
            let first_digit = if has_sign {
                self.peek_ahead(2)
            } else {
                sign
            };
            if first_digit.is_ascii_digit() {
                is_float = true;
                text.push('e');
                self.advance();
                if has_sign {
                    text.push(sign);
                    self.advance();
                }
                while self.current_char().is_ascii_digit() {
                    text.push(self.current_char());
                    self.advance();
                }
            }
        }

        if is_ident_char(self.current_char()) {
            return Err(format!(
                "invalid numeric literal '{}{}'",
                text,
                self.current_char()
            ));
        }

        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|e| format!("invalid float literal '{text}': {e}"))?;
            Ok(Token::Float { value, text })
        } else {
            let value = text
                .parse::<u64>()
                .map_err(|_| format!("integer literal '{text}' is out of range"))?;
            Ok(Token::Int { value, text })
        }
    }

    // ========================================================================
    // Main Tokenization
    // ========================================================================

    /// Next expression token together with its character offset.
    pub fn next_token(&mut self) -> Result<(Token, usize), ExprError> {
        self.skip_whitespace();
        let start = self.position;

        if self.is_eof() {
            return Ok((Token::Eof, start));
        }

        let ch = self.current_char();
        let token = match ch {
            '"' | '\'' => Token::Str(self.read_string().map_err(|e| ExprError::new(start, e))?),
            c if c.is_ascii_digit() => self.read_number().map_err(|e| ExprError::new(start, e))?,
            '.' if self.peek_ahead(1).is_ascii_digit() => {
                self.read_number().map_err(|e| ExprError::new(start, e))?
            }
            c if is_ident_start(c) => Token::Ident(self.read_identifier()),
            _ => {
                let next = self.peek_ahead(1);
                let op = match (ch, next) {
                    ('*', '*') => "**",
                    ('/', '/') => "//",
                    ('=', '=') => "==",
                    ('!', '=') => "!=",
                    ('<', '=') => "<=",
                    ('>', '=') => ">=",
                    ('<', '<') => "<<",
                    ('>', '>') => ">>",
                    ('(', _) => "(",
                    (')', _) => ")",
                    (',', _) => ",",
                    ('+', _) => "+",
                    ('-', _) => "-",
                    ('*', _) => "*",
                    ('/', _) => "/",
                    ('%', _) => "%",
                    ('<', _) => "<",
                    ('>', _) => ">",
                    ('&', _) => "&",
                    ('|', _) => "|",
                    ('^', _) => "^",
                    ('~', _) => "~",
                    _ => {
                        return Err(ExprError::new(
                            start,
                            format!("unexpected character '{ch}'"),
                        ));
                    }
                };
                for _ in 0..op.len() {
                    self.advance();
                }
                Token::Punct(op)
            }
        };

        Ok((token, start))
    }

    /// Tokenize a whole expression.
    pub fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ExprError> {
        let mut lexer = Lexer::new(input);
        let mut tokens = Vec::new();
        loop {
            let (token, offset) = lexer.next_token()?;
            let done = token == Token::Eof;
            tokens.push((token, offset));
            if done {
                return Ok(tokens);
            }
        }
    }
}

pub fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

pub fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// True if `text` is a plain identifier.
pub fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if is_ident_start(c) => chars.all(is_ident_char),
        _ => false,
    }
}

// ============================================================================
// Token Types
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int { value: u64, text: String },
    Float { value: f64, text: String },
    Str(String),
    Ident(String),
    Punct(&'static str),
    Eof,
}

// ============================================================================
// Source Lines
// ============================================================================

/// One physical source line with its comment split off.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLine {
    /// 1-based line number.
    pub number: usize,
    /// Indentation width in columns; tabs count as four.
    pub indent: usize,
    /// Code with leading whitespace and trailing comment removed.
    pub code: String,
    /// 1-based column where `code` starts.
    pub column: usize,
    /// Text after `#`, if the line carries a comment.
    pub comment: Option<String>,
}

impl SourceLine {
    pub fn is_blank(&self) -> bool {
        self.code.is_empty()
    }
}

pub const TAB_WIDTH: usize = 4;

/// Split `raw` into indentation, code and comment.
///
/// String literals are scanned with full escape validation so that a `#`
/// inside a string does not start a comment.
pub fn scan_line(raw: &str, number: usize) -> Result<SourceLine, ParseError> {
    let mut lexer = Lexer::new(raw);
    let mut indent = 0;
    while !lexer.is_eof() {
        match lexer.current_char() {
            ' ' => indent += 1,
            '\t' => indent += TAB_WIDTH,
            _ => break,
        }
        lexer.advance();
    }
    let code_start = lexer.position();

    let mut comment = None;
    let mut code_end = lexer.input.len();
    while !lexer.is_eof() {
        match lexer.current_char() {
            '"' | '\'' => {
                let start = lexer.position();
                lexer
                    .read_string()
                    .map_err(|e| ParseError::new(number, start + 1, e))?;
            }
            '#' => {
                code_end = lexer.position();
                let text: String = lexer.input[code_end + 1..].iter().collect();
                comment = Some(text);
                break;
            }
            _ => lexer.advance(),
        }
    }

    let code: String = lexer.input[code_start..code_end].iter().collect();
    Ok(SourceLine {
        number,
        indent,
        code: code.trim_end().to_string(),
        column: code_start + 1,
        comment,
    })
}

/// Split `text` on top-level commas, skipping nested brackets and strings.
///
/// Returns `(offset, piece)` pairs with each piece trimmed; the offset points
/// at the first non-blank character of the piece.
pub fn split_top_level(text: &str) -> Vec<(usize, String)> {
    let chars: Vec<char> = text.chars().collect();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            q @ ('"' | '\'') => {
                i += 1;
                while i < chars.len() && chars[i] != q {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            ',' if depth == 0 => {
                parts.push(trimmed_piece(&chars[start..i], start));
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(trimmed_piece(&chars[start.min(chars.len())..], start));
    parts
}

fn trimmed_piece(chars: &[char], base: usize) -> (usize, String) {
    let lead = chars.iter().take_while(|c| c.is_whitespace()).count();
    let piece: String = chars[lead..].iter().collect();
    (base + lead, piece.trim_end().to_string())
}

/// Find the matching `)` for the `(` at char index `open`.
pub fn find_closing_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut i = open;
    while i < chars.len() {
        match chars[i] {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            q @ ('"' | '\'') => {
                i += 1;
                while i < chars.len() && chars[i] != q {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}
