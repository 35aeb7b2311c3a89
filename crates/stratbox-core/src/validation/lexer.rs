//! Indentation-aware tokenizer for guest source.
//!
//! Produces the token stream the parser consumes: names, numbers, strings,
//! operators, and the synthetic `Newline` / `Indent` / `Dedent` tokens that
//! encode block structure. Newlines inside brackets and after a backslash
//! continuation are joined, as the language requires.

use regex::Regex;
use std::sync::LazyLock;

/// Pattern for numeric literals (int, float, imaginary; hex/octal/binary)
static NUMBER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:0[xX](?:_?[0-9a-fA-F])+|0[oO](?:_?[0-7])+|0[bB](?:_?[01])+|(?:(?:[0-9](?:_?[0-9])*)?\.[0-9](?:_?[0-9])*|[0-9](?:_?[0-9])*\.?)(?:[eE][+-]?[0-9](?:_?[0-9])*)?[jJ]?)$",
    )
    .unwrap()
});

/// Operators and delimiters, longest first so prefix matching is greedy
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "**", "//", ">>", "<<", "<=", ">=", "==", "!=", "->", "+=",
    "-=", "*=", "/=", "%=", "&=", "|=", "^=", "@=", ":=", "+", "-", "*", "/", "%", "@", "&", "|",
    "^", "~", "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "=",
];

/// Tokenizing or parsing failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct SyntaxError {
    /// 1-based line where the problem was detected
    pub line: usize,
    /// Description of the problem
    pub message: String,
}

impl SyntaxError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// A string literal after prefix handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringToken {
    /// Decoded value; raw and format strings keep their escapes verbatim
    pub value: String,
    pub is_bytes: bool,
    pub is_format: bool,
}

/// Kind of token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Name(String),
    Number(String),
    Str(StringToken),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    EndMarker,
}

/// Token with the line it starts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

/// Tokenize a complete source file
pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    Lexer::new(source, 1).run()
}

/// Tokenize a fragment whose first line is `first_line` in the enclosing file
pub(crate) fn tokenize_fragment(source: &str, first_line: usize) -> Result<Vec<Token>, SyntaxError> {
    Lexer::new(source, first_line).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    tokens: Vec<Token>,
    indents: Vec<usize>,
    brackets: Vec<(char, usize)>,
}

impl Lexer {
    fn new(source: &str, first_line: usize) -> Self {
        let source = source.strip_prefix('\u{feff}').unwrap_or(source);
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: first_line,
            tokens: Vec::new(),
            indents: vec![0],
            brackets: Vec::new(),
        }
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, kind: TokenKind) {
        self.tokens.push(Token {
            kind,
            line: self.line,
        });
    }

    fn push_at(&mut self, kind: TokenKind, line: usize) {
        self.tokens.push(Token { kind, line });
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(self.line, message)
    }

    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut at_line_start = true;

        while self.pos < self.chars.len() {
            if at_line_start && self.brackets.is_empty() {
                if self.handle_indentation()? {
                    continue;
                }
                at_line_start = false;
            }

            let c = self.chars[self.pos];
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.brackets.is_empty() {
                        self.push_newline();
                        at_line_start = true;
                    }
                    self.line += 1;
                }
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' => self.line_continuation()?,
                '"' | '\'' => self.lex_string("")?,
                '.' if self.peek_at(1).is_some_and(|n| n.is_ascii_digit()) => self.lex_number()?,
                c if c.is_ascii_digit() => self.lex_number()?,
                c if is_ident_start(c) => self.lex_name_or_prefixed_string()?,
                _ => self.lex_operator()?,
            }
        }

        if let Some(&(open, line)) = self.brackets.last() {
            return Err(SyntaxError::new(line, format!("'{}' was never closed", open)));
        }

        self.push_newline();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent);
        }
        self.push(TokenKind::EndMarker);
        Ok(self.tokens)
    }

    /// Measure indentation at the start of a logical line.
    ///
    /// Returns `true` when the line is blank or comment-only and was consumed.
    fn handle_indentation(&mut self) -> Result<bool, SyntaxError> {
        let mut width = 0usize;
        let mut p = self.pos;
        loop {
            match self.chars.get(p) {
                Some(' ') => width += 1,
                Some('\t') => width = (width / 8 + 1) * 8,
                Some('\x0c') => width = 0,
                _ => break,
            }
            p += 1;
        }

        match self.chars.get(p) {
            None => {
                self.pos = p;
                return Ok(true);
            }
            Some('\n') => {
                self.pos = p + 1;
                self.line += 1;
                return Ok(true);
            }
            Some('\r') if self.chars.get(p + 1) == Some(&'\n') => {
                self.pos = p + 2;
                self.line += 1;
                return Ok(true);
            }
            Some('#') => {
                self.pos = p;
                self.skip_comment();
                if self.peek_at(0) == Some('\n') {
                    self.pos += 1;
                    self.line += 1;
                }
                return Ok(true);
            }
            _ => {}
        }

        self.pos = p;
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(TokenKind::Indent);
        } else if width < current {
            while self.indents.last().is_some_and(|&top| top > width) {
                self.indents.pop();
                self.push(TokenKind::Dedent);
            }
            if self.indents.last() != Some(&width) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(false)
    }

    fn push_newline(&mut self) {
        let needs_newline = self.tokens.last().is_some_and(|t| {
            !matches!(
                t.kind,
                TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent
            )
        });
        if needs_newline {
            self.push(TokenKind::Newline);
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek_at(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn line_continuation(&mut self) -> Result<(), SyntaxError> {
        let mut p = self.pos + 1;
        if self.chars.get(p) == Some(&'\r') {
            p += 1;
        }
        if self.chars.get(p) == Some(&'\n') {
            self.pos = p + 1;
            self.line += 1;
            Ok(())
        } else {
            Err(self.error("unexpected character after line continuation character"))
        }
    }

    fn lex_name_or_prefixed_string(&mut self) -> Result<(), SyntaxError> {
        let start = self.pos;
        while self.peek_at(0).is_some_and(is_ident_continue) {
            self.pos += 1;
        }
        let ident: String = self.chars[start..self.pos].iter().collect();

        if matches!(self.peek_at(0), Some('"') | Some('\'')) && is_string_prefix(&ident) {
            return self.lex_string(&ident);
        }

        self.push(TokenKind::Name(ident));
        Ok(())
    }

    fn lex_number(&mut self) -> Result<(), SyntaxError> {
        let start = self.pos;
        let is_radix = self.chars[start] == '0'
            && matches!(self.peek_at(1), Some('x' | 'X' | 'o' | 'O' | 'b' | 'B'));
        let mut prev = '\0';
        while let Some(c) = self.peek_at(0) {
            let exponent_sign = (c == '+' || c == '-') && (prev == 'e' || prev == 'E') && !is_radix;
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || exponent_sign {
                self.pos += 1;
                prev = c;
            } else {
                break;
            }
        }

        let text: String = self.chars[start..self.pos].iter().collect();
        if !NUMBER_PATTERN.is_match(&text) {
            return Err(self.error(format!("invalid numeric literal '{}'", text)));
        }
        self.push(TokenKind::Number(text));
        Ok(())
    }

    fn lex_string(&mut self, prefix: &str) -> Result<(), SyntaxError> {
        let lower = prefix.to_ascii_lowercase();
        let raw = lower.contains('r');
        let is_bytes = lower.contains('b');
        let is_format = lower.contains('f');

        let start_line = self.line;
        let quote = self.chars[self.pos];
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let unterminated = || {
            SyntaxError::new(
                start_line,
                if triple {
                    "unterminated triple-quoted string literal"
                } else {
                    "unterminated string literal"
                },
            )
        };

        let mut value = String::new();
        loop {
            let Some(c) = self.peek_at(0) else {
                return Err(unterminated());
            };

            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
                value.push(c);
                self.pos += 1;
                continue;
            }

            if c == '\n' {
                if !triple {
                    return Err(unterminated());
                }
                self.line += 1;
                value.push(c);
                self.pos += 1;
                continue;
            }

            if c == '\\' {
                let Some(next) = self.peek_at(1) else {
                    return Err(unterminated());
                };
                self.pos += 2;
                if next == '\n' {
                    self.line += 1;
                }
                if raw || is_format {
                    value.push('\\');
                    value.push(next);
                    continue;
                }
                self.decode_escape(next, is_bytes, &mut value);
                continue;
            }

            value.push(c);
            self.pos += 1;
        }

        self.push_at(
            TokenKind::Str(StringToken {
                value,
                is_bytes,
                is_format,
            }),
            start_line,
        );
        Ok(())
    }

    fn decode_escape(&mut self, escaped: char, is_bytes: bool, out: &mut String) {
        match escaped {
            '\n' => {}
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0' => out.push('\0'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'v' => out.push('\x0b'),
            '\\' | '\'' | '"' => out.push(escaped),
            'x' => self.decode_hex(2, 'x', out),
            'u' if !is_bytes => self.decode_hex(4, 'u', out),
            'U' if !is_bytes => self.decode_hex(8, 'U', out),
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }

    fn decode_hex(&mut self, digits: usize, marker: char, out: &mut String) {
        let end = (self.pos + digits).min(self.chars.len());
        let hex: String = self.chars[self.pos..end].iter().collect();
        let decoded = (hex.len() == digits)
            .then(|| u32::from_str_radix(&hex, 16).ok())
            .flatten()
            .and_then(char::from_u32);
        match decoded {
            Some(ch) => {
                out.push(ch);
                self.pos = end;
            }
            None => {
                out.push('\\');
                out.push(marker);
            }
        }
    }

    fn lex_operator(&mut self) -> Result<(), SyntaxError> {
        let end = (self.pos + 3).min(self.chars.len());
        let window: String = self.chars[self.pos..end].iter().collect();
        let Some(op) = OPERATORS.iter().copied().find(|op| window.starts_with(op)) else {
            return Err(self.error(format!(
                "invalid character '{}'",
                self.chars[self.pos].escape_debug()
            )));
        };

        match op {
            "(" | "[" | "{" => {
                let open = op.chars().next().unwrap_or('(');
                self.brackets.push((open, self.line));
            }
            ")" | "]" | "}" => {
                let close = op.chars().next().unwrap_or(')');
                match self.brackets.pop() {
                    Some((open, _)) if matching_close(open) == close => {}
                    Some((open, _)) => {
                        return Err(self.error(format!(
                            "closing parenthesis '{}' does not match opening parenthesis '{}'",
                            close, open
                        )));
                    }
                    None => return Err(self.error(format!("unmatched '{}'", close))),
                }
            }
            _ => {}
        }

        self.pos += op.len();
        self.push(TokenKind::Op(op));
        Ok(())
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

fn is_string_prefix(ident: &str) -> bool {
    matches!(
        ident.to_ascii_lowercase().as_str(),
        "r" | "u" | "b" | "f" | "br" | "rb" | "fr" | "rf"
    )
}

fn matching_close(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}
