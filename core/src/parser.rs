use rustc_hash::FxHashSet;

use crate::ast::{Block, ElifBranch, Program, SourceExpr, Stmt, StmtKind, block_always_returns};
use crate::error::ParseError;
use crate::lexer::{SourceLine, find_closing_paren, is_ident_char, is_identifier, scan_line, split_top_level};
use crate::pragma::{Dialect, PragmaCollector, is_pragma_comment};

/// Deepest allowed nesting of indented blocks.
pub const MAX_NESTING: usize = 32;

const KEYWORDS: &[&str] = &[
    "and", "or", "not", "if", "elif", "else", "for", "while", "in", "return", "def", "break",
    "continue", "True", "False", "pass", "lambda",
];

const AUGMENTED_OPS: &[&str] = &["**", "//", "<<", ">>", "+", "-", "*", "/", "%", "&", "|", "^"];

/// Parse kernel source into a [`Program`].
///
/// The source is one `def name(params):` with an indented body, optionally
/// preceded by `# me:` pragma comments. Any error abandons the whole parse.
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let mut lines = Vec::new();
    for (i, raw) in source.lines().enumerate() {
        lines.push(scan_line(raw, i + 1)?);
    }
    Parser::new(lines).parse_program()
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    lines: Vec<SourceLine>,
    pos: usize,
    dialect: Dialect,
    params: Vec<String>,
    locals: FxHashSet<String>,
    loop_vars: Vec<String>,
    loop_depth: usize,
    nesting: usize,
}

impl Parser {
    fn new(lines: Vec<SourceLine>) -> Self {
        Parser {
            lines,
            pos: 0,
            dialect: Dialect::default(),
            params: Vec::new(),
            locals: FxHashSet::default(),
            loop_vars: Vec::new(),
            loop_depth: 0,
            nesting: 0,
        }
    }

    fn parse_program(mut self) -> Result<Program, ParseError> {
        let mut pragmas = PragmaCollector::default();
        while self.pos < self.lines.len() && self.lines[self.pos].is_blank() {
            let line = &self.lines[self.pos];
            if let Some(comment) = &line.comment {
                pragmas.feed(comment, line.number, line.column)?;
            }
            self.pos += 1;
        }
        let pragmas = pragmas.finish();
        self.dialect = pragmas.dialect;

        if self.pos >= self.lines.len() {
            let line = self.lines.len().max(1);
            return Err(ParseError::new(line, 1, "expected 'def' kernel definition"));
        }

        for line in &self.lines[self.pos..] {
            if let Some(comment) = &line.comment
                && is_pragma_comment(comment)
            {
                return Err(ParseError::new(
                    line.number,
                    line.column,
                    "pragmas must appear before the kernel definition",
                ));
            }
        }

        let header = self.lines[self.pos].clone();
        self.pos += 1;
        let (name, params) = parse_def_header(&header)?;
        self.params = params.clone();

        let body = self.parse_block(header.indent)?;

        if let Some(i) = self.peek_code_line() {
            let line = &self.lines[i];
            return Err(ParseError::new(
                line.number,
                line.column,
                "unexpected statement after kernel body",
            ));
        }

        if !block_always_returns(&body) {
            return Err(ParseError::new(
                header.number,
                header.column,
                format!("kernel '{name}' does not return a value on every control path"),
            ));
        }

        Ok(Program {
            name,
            params,
            body,
            pragmas,
            line: header.number,
            column: header.column,
        })
    }

    // ========================================================================
    // Blocks
    // ========================================================================

    fn peek_code_line(&self) -> Option<usize> {
        (self.pos..self.lines.len()).find(|&i| !self.lines[i].is_blank())
    }

    fn end_position(&self) -> (usize, usize) {
        (self.lines.last().map_or(1, |l| l.number), 1)
    }

    /// Parse a block indented strictly deeper than `parent_indent`.
    fn parse_block(&mut self, parent_indent: usize) -> Result<Block, ParseError> {
        let Some(first) = self.peek_code_line() else {
            let (line, column) = self.end_position();
            return Err(ParseError::new(line, column, "expected an indented block"));
        };
        let indent = self.lines[first].indent;
        if indent <= parent_indent {
            let line = &self.lines[first];
            return Err(ParseError::new(
                line.number,
                line.column,
                "expected an indented block",
            ));
        }

        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            let line = &self.lines[first];
            return Err(ParseError::new(
                line.number,
                line.column,
                "too many nested blocks",
            ));
        }

        let mut block = Vec::new();
        while let Some(i) = self.peek_code_line() {
            let line = &self.lines[i];
            if line.indent < indent {
                if line.indent > parent_indent {
                    return Err(ParseError::new(
                        line.number,
                        line.column,
                        "unindent does not match any outer indentation level",
                    ));
                }
                break;
            }
            if line.indent > indent {
                return Err(ParseError::new(line.number, line.column, "unexpected indent"));
            }
            self.pos = i;
            block.push(self.parse_statement()?);
        }

        self.nesting -= 1;
        Ok(block)
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        let line = self.lines[self.pos].clone();
        self.pos += 1;
        let code = line.code.as_str();
        let keyword = leading_word(code);
        let rest = &code[keyword.len()..];
        let rest_column = line.column + keyword.chars().count();

        let kind = match keyword {
            "def" => {
                return Err(ParseError::new(
                    line.number,
                    line.column,
                    "nested function definitions are not supported",
                ));
            }
            "elif" | "else" => {
                return Err(ParseError::new(
                    line.number,
                    line.column,
                    format!("'{keyword}' without a matching 'if'"),
                ));
            }
            "return" if rest.is_empty() || is_block_keyword(rest) => {
                let (text, offset) = trim_with_offset(rest);
                if text.is_empty() {
                    return Err(ParseError::new(
                        line.number,
                        line.column,
                        "return requires a value",
                    ));
                }
                StmtKind::Return(SourceExpr::new(text, line.number, rest_column + offset))
            }
            "print" if rest.trim_start().starts_with('(') => self.parse_print(&line, rest, rest_column)?,
            "if" if is_block_keyword(rest) => return self.parse_if(&line, rest, rest_column),
            "for" if is_block_keyword(rest) => self.parse_for(&line, rest, rest_column)?,
            "while" if is_block_keyword(rest) => {
                let cond = block_header_expr(&line, rest, rest_column, "while")?;
                self.loop_depth += 1;
                let body = self.parse_block(line.indent);
                self.loop_depth -= 1;
                StmtKind::While { cond, body: body? }
            }
            "break" | "continue" if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
                self.parse_loop_control(&line, keyword, rest, rest_column)?
            }
            _ => self.parse_simple(&line)?,
        };

        Ok(Stmt {
            kind,
            line: line.number,
            column: line.column,
        })
    }

    fn parse_print(
        &mut self,
        line: &SourceLine,
        rest: &str,
        rest_column: usize,
    ) -> Result<StmtKind, ParseError> {
        let chars: Vec<char> = rest.chars().collect();
        let open = chars.iter().position(|&c| c == '(').unwrap_or(0);
        let close = find_closing_paren(&chars, open).ok_or_else(|| {
            ParseError::new(line.number, rest_column + open, "unbalanced parentheses in print()")
        })?;
        if close + 1 != chars.len() {
            return Err(ParseError::new(
                line.number,
                rest_column + close + 1,
                "unexpected text after print()",
            ));
        }
        let inner: String = chars[open + 1..close].iter().collect();
        let (text, offset) = trim_with_offset(&inner);
        Ok(StmtKind::Print(SourceExpr::new(
            text,
            line.number,
            rest_column + open + 1 + offset,
        )))
    }

    fn parse_if(&mut self, line: &SourceLine, rest: &str, rest_column: usize) -> Result<Stmt, ParseError> {
        let cond = block_header_expr(line, rest, rest_column, "if")?;
        let then_block = self.parse_block(line.indent)?;
        let mut elifs = Vec::new();
        let mut else_block = None;

        while let Some(i) = self.peek_code_line() {
            let next = self.lines[i].clone();
            if next.indent != line.indent {
                break;
            }
            let word = leading_word(&next.code);
            let next_rest = &next.code[word.len()..];
            let next_column = next.column + word.chars().count();
            match word {
                "elif" if is_block_keyword(next_rest) => {
                    self.pos = i + 1;
                    let cond = block_header_expr(&next, next_rest, next_column, "elif")?;
                    let block = self.parse_block(next.indent)?;
                    elifs.push(ElifBranch { cond, block });
                }
                "else" if next_rest.trim() == ":" => {
                    self.pos = i + 1;
                    else_block = Some(self.parse_block(next.indent)?);
                    break;
                }
                "else" => {
                    return Err(ParseError::new(next.number, next_column, "expected ':' after 'else'"));
                }
                _ => break,
            }
        }

        if self.loop_depth > 0 && self.dialect == Dialect::Vector {
            let guards_loop_control = elifs.is_empty()
                && else_block.is_none()
                && then_block.len() == 1
                && matches!(
                    then_block[0].kind,
                    StmtKind::Break { guard: None } | StmtKind::Continue { guard: None }
                );
            if !guards_loop_control {
                return Err(ParseError::new(
                    line.number,
                    line.column,
                    "inside a loop, 'if' may only guard a single break or continue \
                     (use '# me:dialect=element' for per-item control flow)",
                ));
            }
        }

        Ok(Stmt {
            kind: StmtKind::If {
                cond,
                then_block,
                elifs,
                else_block,
            },
            line: line.number,
            column: line.column,
        })
    }

    fn parse_for(&mut self, line: &SourceLine, rest: &str, rest_column: usize) -> Result<StmtKind, ParseError> {
        let err = |byte: usize, msg: &str| {
            ParseError::new(line.number, rest_column + rest[..byte].chars().count(), msg)
        };
        let skip_ws = |byte: usize| byte + (rest[byte..].len() - rest[byte..].trim_start().len());

        let var_start = skip_ws(0);
        let var = leading_word(&rest[var_start..]);
        if !is_identifier(var) || KEYWORDS.contains(&var) {
            return Err(err(var_start, "expected loop variable"));
        }

        let in_start = skip_ws(var_start + var.len());
        if leading_word(&rest[in_start..]) != "in" {
            return Err(err(in_start, "expected 'in' after loop variable"));
        }
        let range_start = skip_ws(in_start + "in".len());
        if leading_word(&rest[range_start..]) != "range" {
            return Err(err(range_start, "expected 'range' in loop"));
        }
        let open = skip_ws(range_start + "range".len());
        if !rest[open..].starts_with('(') {
            return Err(err(open, "expected '(' after range"));
        }

        let chars: Vec<char> = rest[open..].chars().collect();
        let close = find_closing_paren(&chars, 0)
            .ok_or_else(|| err(open, "unbalanced parentheses in range()"))?;
        let inner: String = chars[1..close].iter().collect();
        let trailing: String = chars[close + 1..].iter().collect();
        let args_column = rest_column + rest[..open].chars().count() + 1;
        if trailing.trim() != ":" {
            return Err(ParseError::new(
                line.number,
                args_column + close,
                "expected ':' after range()",
            ));
        }

        let pieces = split_top_level(&inner);
        if pieces.len() > 3 {
            return Err(ParseError::new(
                line.number,
                args_column,
                "range() expects 1 to 3 arguments",
            ));
        }
        let mut range = Vec::with_capacity(pieces.len());
        for (offset, text) in pieces {
            if text.is_empty() {
                return Err(ParseError::new(
                    line.number,
                    args_column + offset,
                    "empty range() argument",
                ));
            }
            range.push(SourceExpr::new(text, line.number, args_column + offset));
        }

        if self.params.iter().any(|p| p == var)
            || self.loop_vars.iter().any(|v| v == var)
            || self.locals.contains(var)
        {
            return Err(err(
                var_start,
                &format!("loop variable '{var}' reuses an existing name"),
            ));
        }

        let var = var.to_string();
        self.loop_vars.push(var.clone());
        self.loop_depth += 1;
        let body = self.parse_block(line.indent);
        self.loop_depth -= 1;
        self.loop_vars.pop();

        Ok(StmtKind::For {
            var,
            range,
            body: body?,
        })
    }

    fn parse_loop_control(
        &mut self,
        line: &SourceLine,
        keyword: &str,
        rest: &str,
        rest_column: usize,
    ) -> Result<StmtKind, ParseError> {
        if self.loop_depth == 0 {
            return Err(ParseError::new(
                line.number,
                line.column,
                format!("'{keyword}' outside loop"),
            ));
        }
        let (tail, offset) = trim_with_offset(rest);
        let guard = if tail.is_empty() {
            None
        } else if leading_word(tail) == "if" {
            let cond_text = &tail[2..];
            let (cond, cond_offset) = trim_with_offset(cond_text);
            if cond.is_empty() {
                return Err(ParseError::new(
                    line.number,
                    rest_column + offset,
                    format!("expected condition after '{keyword} if'"),
                ));
            }
            Some(SourceExpr::new(
                cond,
                line.number,
                rest_column + offset + 2 + cond_offset,
            ))
        } else {
            return Err(ParseError::new(
                line.number,
                rest_column + offset,
                format!("unexpected text after '{keyword}'"),
            ));
        };

        Ok(if keyword == "break" {
            StmtKind::Break { guard }
        } else {
            StmtKind::Continue { guard }
        })
    }

    /// Assignment, augmented assignment, or expression statement.
    fn parse_simple(&mut self, line: &SourceLine) -> Result<StmtKind, ParseError> {
        let code = line.code.as_str();
        let Some((eq, op)) = find_assignment(code) else {
            return Ok(StmtKind::Expr(SourceExpr::new(code, line.number, line.column)));
        };

        let chars: Vec<char> = code.chars().collect();
        let lhs_end = eq - op.map_or(0, str::len);
        let lhs: String = chars[..lhs_end].iter().collect();
        let name = lhs.trim();
        if !is_identifier(name) || KEYWORDS.contains(&name) {
            return Err(ParseError::new(
                line.number,
                line.column,
                format!("invalid assignment target '{name}'"),
            ));
        }

        let rhs: String = chars[eq + 1..].iter().collect();
        let (value, offset) = trim_with_offset(&rhs);
        let value_column = line.column + eq + 1 + offset;
        if value.is_empty() {
            return Err(ParseError::new(
                line.number,
                value_column,
                "expected expression after '='",
            ));
        }

        let text = match op {
            Some(op) => format!("{name} {op} ({value})"),
            None => value.to_string(),
        };
        self.locals.insert(name.to_string());
        Ok(StmtKind::Assign {
            name: name.to_string(),
            value: SourceExpr::new(text, line.number, value_column),
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_def_header(line: &SourceLine) -> Result<(String, Vec<String>), ParseError> {
    let err = |col: usize, msg: &str| ParseError::new(line.number, col, msg);
    let code = line.code.as_str();
    if leading_word(code) != "def" {
        return Err(err(line.column, "expected 'def' kernel definition"));
    }
    let chars: Vec<char> = code.chars().collect();
    let mut i = 3;
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    let name_start = i;
    while i < chars.len() && is_ident_char(chars[i]) {
        i += 1;
    }
    let name: String = chars[name_start..i].iter().collect();
    if !is_identifier(&name) {
        return Err(err(line.column + name_start, "expected kernel name after 'def'"));
    }
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    if chars.get(i) != Some(&'(') {
        return Err(err(line.column + i, "expected '(' after kernel name"));
    }
    let close = find_closing_paren(&chars, i)
        .ok_or_else(|| err(line.column + i, "unbalanced parentheses in parameter list"))?;
    let trailing: String = chars[close + 1..].iter().collect();
    if trailing.trim() != ":" {
        return Err(err(line.column + close + 1, "expected ':' after parameter list"));
    }

    let inner: String = chars[i + 1..close].iter().collect();
    let mut params: Vec<String> = Vec::new();
    if !inner.trim().is_empty() {
        for (offset, param) in split_top_level(&inner) {
            let col = line.column + i + 1 + offset;
            if !is_identifier(&param) || KEYWORDS.contains(&param.as_str()) {
                return Err(err(col, &format!("invalid parameter name '{param}'")));
            }
            if params.contains(&param) {
                return Err(err(col, &format!("duplicate parameter '{param}'")));
            }
            params.push(param);
        }
    }
    Ok((name, params))
}

/// Leading identifier-like word of `code`.
fn leading_word(code: &str) -> &str {
    let end = code
        .char_indices()
        .find(|&(_, c)| !is_ident_char(c))
        .map_or(code.len(), |(i, _)| i);
    &code[..end]
}

/// A block keyword must be followed by whitespace or `(`, not more identifier text.
fn is_block_keyword(rest: &str) -> bool {
    rest.starts_with(char::is_whitespace) || rest.starts_with('(')
}

/// Condition text of `kw cond:`.
fn block_header_expr(
    line: &SourceLine,
    rest: &str,
    rest_column: usize,
    keyword: &str,
) -> Result<SourceExpr, ParseError> {
    let Some(body) = rest.trim_end().strip_suffix(':') else {
        return Err(ParseError::new(
            line.number,
            rest_column + rest.chars().count(),
            format!("expected ':' after '{keyword}' condition"),
        ));
    };
    let (cond, offset) = trim_with_offset(body);
    if cond.is_empty() {
        return Err(ParseError::new(
            line.number,
            rest_column,
            format!("expected condition after '{keyword}'"),
        ));
    }
    Ok(SourceExpr::new(cond, line.number, rest_column + offset))
}

/// Trim both ends; also return the number of chars removed from the front.
fn trim_with_offset(text: &str) -> (&str, usize) {
    let (start_trimmed, offset) = trim_start_with_offset(text);
    (start_trimmed.trim_end(), offset)
}

fn trim_start_with_offset(text: &str) -> (&str, usize) {
    let trimmed = text.trim_start();
    let offset = text[..text.len() - trimmed.len()].chars().count();
    (trimmed, offset)
}

/// Locate a top-level assignment `=` (char index) and its augmented operator.
fn find_assignment(code: &str) -> Option<(usize, Option<&'static str>)> {
    let chars: Vec<char> = code.chars().collect();
    let mut depth = 0i32;
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
            '=' if depth == 0 => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    continue;
                }
                let prev = if i > 0 { chars[i - 1] } else { '\0' };
                let prev2 = if i > 1 { chars[i - 2] } else { '\0' };
                let shift_assign = (prev == '<' && prev2 == '<') || (prev == '>' && prev2 == '>');
                if matches!(prev, '!' | '<' | '>' | '=') && !shift_assign {
                    i += 1;
                    continue;
                }
                let before: String = chars[..i].iter().collect();
                let op = AUGMENTED_OPS.iter().copied().find(|op| before.ends_with(op));
                return Some((i, op));
            }
            _ => {}
        }
        i += 1;
    }
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pragma::FpMode;

    fn body(src: &str) -> Block {
        parse(src).unwrap().body
    }

    fn err(src: &str) -> ParseError {
        parse(src).unwrap_err()
    }

    #[test]
    fn test_minimal_kernel() {
        let program = parse("def k(x, y):\n    return x + y\n").unwrap();
        assert_eq!(program.name, "k");
        assert_eq!(program.params, vec!["x", "y"]);
        assert_eq!(program.body.len(), 1);
        match &program.body[0].kind {
            StmtKind::Return(e) => {
                assert_eq!(e.text, "x + y");
                assert_eq!((e.line, e.column), (2, 12));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_pragmas_before_def() {
        let program = parse("# me:fp=fast\n# hello\n\ndef k(x):\n    return x\n").unwrap();
        assert_eq!(program.pragmas.fp_mode, FpMode::Fast);
        assert_eq!(program.line, 4);
    }

    #[test]
    fn test_pragma_after_def_rejected() {
        let e = err("def k(x):\n    # me:fp=fast\n    return x\n");
        assert_eq!(e.line, 2);
    }

    #[test]
    fn test_assignment_and_augmented() {
        let b = body("def k(x):\n    acc = 0\n    acc += x * 2\n    return acc\n");
        match &b[1].kind {
            StmtKind::Assign { name, value } => {
                assert_eq!(name, "acc");
                assert_eq!(value.text, "acc + (x * 2)");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_comparison_is_not_assignment() {
        let b = body("def k(x):\n    x <= 1\n    return x\n");
        assert!(matches!(b[0].kind, StmtKind::Expr(_)));
        let b = body("def k(x):\n    y = x == 1\n    return y\n");
        match &b[0].kind {
            StmtKind::Assign { value, .. } => assert_eq!(value.text, "x == 1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_if_elif_else() {
        let src = "def k(x):\n    if x > 1:\n        return 1\n    elif x > 0:\n        return 2\n    else:\n        return 3\n";
        let b = body(src);
        match &b[0].kind {
            StmtKind::If {
                cond,
                elifs,
                else_block,
                ..
            } => {
                assert_eq!(cond.text, "x > 1");
                assert_eq!(elifs.len(), 1);
                assert_eq!(elifs[0].cond.text, "x > 0");
                assert!(else_block.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_for_range_args() {
        let b = body("def k(x):\n    s = 0\n    for i in range(1, 10, 2):\n        s = s + i\n    return s\n");
        match &b[1].kind {
            StmtKind::For { var, range, body } => {
                assert_eq!(var, "i");
                let texts: Vec<&str> = range.iter().map(|r| r.text.as_str()).collect();
                assert_eq!(texts, vec!["1", "10", "2"]);
                assert_eq!(body.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_range_arity() {
        let e = err("def k(x):\n    for i in range(1, 2, 3, 4):\n        x\n    return x\n");
        assert!(e.message.contains("1 to 3"));
        let e = err("def k(x):\n    for i in range():\n        x\n    return x\n");
        assert!(e.message.contains("empty"));
    }

    #[test]
    fn test_loop_var_reuse() {
        let e = err("def k(x):\n    for x in range(3):\n        break\n    return x\n");
        assert!(e.message.contains("reuses"));
        let e = err(
            "def k(x):\n    for i in range(3):\n        for i in range(2):\n            break\n    return x\n",
        );
        assert_eq!(e.line, 3);
    }

    #[test]
    fn test_tabs_expand_to_four() {
        let b = body("def k(x):\n\ty = x\n    return y\n");
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_blank_and_comment_lines_inside_block() {
        let src = "def k(x):\n    y = x\n\n        # indented comment\n    return y  # trailing\n";
        assert_eq!(body(src).len(), 2);
    }

    #[test]
    fn test_unexpected_indent() {
        let e = err("def k(x):\n    y = x\n      return y\n");
        assert_eq!(e.line, 3);
        assert!(e.message.contains("unexpected indent"));
    }

    #[test]
    fn test_bad_dedent() {
        let e = err("def k(x):\n    if x:\n        return 1\n  return 2\n");
        assert!(e.message.contains("unindent"));
    }

    #[test]
    fn test_missing_block() {
        let e = err("def k(x):\n    if x:\n    return 1\n");
        assert!(e.message.contains("indented block"));
    }

    #[test]
    fn test_vector_dialect_if_in_loop() {
        let ok = "def k(x):\n    s = 0\n    for i in range(4):\n        if i == 2:\n            break\n        s = s + x\n    return s\n";
        assert!(parse(ok).is_ok());
        let bad = "def k(x):\n    s = 0\n    for i in range(4):\n        if x > i:\n            s = s + i\n    return s\n";
        let e = err(bad);
        assert_eq!(e.line, 4);
        let element = format!("# me:dialect=element\n{bad}");
        assert!(parse(&element).is_ok());
    }

    #[test]
    fn test_break_outside_loop() {
        let e = err("def k(x):\n    break\n    return x\n");
        assert!(e.message.contains("outside loop"));
    }

    #[test]
    fn test_guarded_break() {
        let b = body("def k(x):\n    s = 0\n    for i in range(5):\n        break if i > 2\n    return s\n");
        match &b[1].kind {
            StmtKind::For { body, .. } => match &body[0].kind {
                StmtKind::Break { guard: Some(g) } => assert_eq!(g.text, "i > 2"),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_print_statement() {
        let b = body("def k(x):\n    print(\"x = {}\", x)\n    return x\n");
        match &b[0].kind {
            StmtKind::Print(args) => assert_eq!(args.text, "\"x = {}\", x"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_return_path() {
        let e = err("def k(x):\n    if x > 0:\n        return 1\n");
        assert_eq!(e.line, 1);
        let e = err("# me:dialect=element\ndef k(x):\n    for i in range(2):\n        return i\n");
        assert_eq!(e.line, 2);
    }

    #[test]
    fn test_content_after_body() {
        let e = err("def k(x):\n    return x\ndef j(y):\n    return y\n");
        assert_eq!(e.line, 3);
    }

    #[test]
    fn test_duplicate_param() {
        let e = err("def k(x, x):\n    return x\n");
        assert!(e.message.contains("duplicate"));
    }

    #[test]
    fn test_return_requires_value() {
        let e = err("def k(x):\n    return\n");
        assert!(e.message.contains("requires"));
    }

    #[test]
    fn test_keywords_followed_by_paren() {
        let b = body("def k(x):\n    print(x)\n    if(x > 0):\n        return(x)\n    return(-x)\n");
        match &b[0].kind {
            StmtKind::Print(args) => assert_eq!(args.text, "x"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(b[1].kind, StmtKind::If { .. }));
        match &b[2].kind {
            StmtKind::Return(value) => {
                assert_eq!(value.text, "(-x)");
                assert_eq!((value.line, value.column), (5, 11));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_while_loop() {
        let b = body("def k(x):\n    n = 0\n    while n < x:\n        n = n + 1\n    return n\n");
        assert!(matches!(b[1].kind, StmtKind::While { .. }));
    }

    #[test]
    fn test_keyword_prefix_identifiers() {
        let b = body("def k(x):\n    iffy = x\n    returned = iffy\n    return returned\n");
        assert!(matches!(b[0].kind, StmtKind::Assign { .. }));
        assert!(matches!(b[1].kind, StmtKind::Assign { .. }));
    }

    #[test]
    fn test_empty_source() {
        assert!(parse("").is_err());
        assert!(parse("# only a comment\n").is_err());
    }
}
