//! SEXP tokenizer.
//!
//! Turns source text into a flat, position-tagged token stream.  The lexer
//! never fails: malformed input (unterminated strings, malformed numbers,
//! oversized tokens) is recorded as a [`Diagnostic`] and skipped, and the
//! stream always ends in exactly one [`TokenKind::Eof`].
//!
//! | Input | Token |
//! |-------|-------|
//! | `(` `)` | `OpenParen` / `CloseParen` |
//! | `-12.5e3` | `Number` |
//! | `"a \"b\"\n"` | `Str` (value is unescaped) |
//! | `true` `false` `#t` `#f` | `Boolean` (value is `true`/`false`) |
//! | `@name` | `Variable` (value is `name`) |
//! | `; ...` | `Comment` (only with trivia enabled) |
//! | anything else | `Identifier` (`+`, `>=`, `is-destroyed`, …) |

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use super::value::{ErrorKind, Location, SexpError};

/// Default cap on the length of a single token, in characters.
pub const DEFAULT_MAX_TOKEN_LENGTH: usize = 1024;

// ── Token ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    OpenParen,
    CloseParen,
    Identifier,
    Number,
    Str,
    Boolean,
    Variable,
    Comment,
    Whitespace,
    Eof,
}

impl TokenKind {
    pub fn name(self) -> &'static str {
        match self {
            TokenKind::OpenParen  => "OPEN_PAREN",
            TokenKind::CloseParen => "CLOSE_PAREN",
            TokenKind::Identifier => "IDENTIFIER",
            TokenKind::Number     => "NUMBER",
            TokenKind::Str        => "STRING",
            TokenKind::Boolean    => "BOOLEAN",
            TokenKind::Variable   => "VARIABLE",
            TokenKind::Comment    => "COMMENT",
            TokenKind::Whitespace => "WHITESPACE",
            TokenKind::Eof        => "EOF",
        }
    }

    pub fn is_trivia(self) -> bool {
        matches!(self, TokenKind::Comment | TokenKind::Whitespace)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    /// 1-based.
    pub line: u32,
    /// 1-based, counted in characters.
    pub column: u32,
    /// Byte offset of the first character.
    pub position: usize,
}

impl Token {
    pub fn location(&self) -> Location {
        Location::new(self.position, self.line, self.column)
    }
}

// ── Diagnostic ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    /// Advisory only; does not make the input invalid.
    Warning,
}

/// A problem found while lexing, parsing or validating.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub location: Location,
    pub suggested_fix: String,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, location: Location) -> Self {
        Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            location,
            suggested_fix: String::new(),
        }
    }

    pub fn warning(message: impl Into<String>, location: Location) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            message: message.into(),
            location,
            suggested_fix: String::new(),
        }
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = fix.into();
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Convert to a contextual SYNTAX_ERROR, quoting the offending line.
    pub fn to_error(&self, src: &str) -> SexpError {
        let context = src
            .lines()
            .nth(self.location.line.saturating_sub(1) as usize)
            .unwrap_or("")
            .to_owned();
        SexpError::new(ErrorKind::SyntaxError, self.message.clone())
            .with_context(context)
            .at(self.location)
            .with_fix(self.suggested_fix.clone())
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(
            f,
            "{tag} at line {}, column {}: {}",
            self.location.line, self.location.column, self.message
        )?;
        if !self.suggested_fix.is_empty() {
            write!(f, " ({})", self.suggested_fix)?;
        }
        Ok(())
    }
}

// ── Character classes ─────────────────────────────────────────────────────────

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^-?[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?$").expect("number pattern compiles")
    })
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern compiles"))
}

/// `true` if `name` is a valid variable name (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_identifier(name: &str) -> bool {
    identifier_re().is_match(name)
}

/// `true` if `text` is spelled like a SEXP number literal.
pub fn is_number_literal(text: &str) -> bool {
    number_re().is_match(text)
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '"' | ';')
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

/// Output of [`Lexer::tokenize`].
#[derive(Debug, Clone, Default)]
pub struct Lexed {
    pub tokens: Vec<Token>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Lexed {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    column: u32,
    max_token_length: usize,
    keep_trivia: bool,
    out: Lexed,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            src,
            pos: 0,
            line: 1,
            column: 1,
            max_token_length: DEFAULT_MAX_TOKEN_LENGTH,
            keep_trivia: false,
            out: Lexed::default(),
        }
    }

    pub fn with_max_token_length(mut self, max: usize) -> Self {
        self.max_token_length = max.max(1);
        self
    }

    /// Emit `Comment` and `Whitespace` tokens instead of dropping them.
    pub fn with_trivia(mut self, keep: bool) -> Self {
        self.keep_trivia = keep;
        self
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn here(&self) -> Location {
        Location::new(self.pos, self.line, self.column)
    }

    fn push(&mut self, kind: TokenKind, value: String, at: Location) {
        self.out.tokens.push(Token {
            kind,
            value,
            line: at.line,
            column: at.column,
            position: at.position,
        });
    }

    fn too_long(&mut self, len: usize, at: Location) -> bool {
        if len <= self.max_token_length {
            return false;
        }
        self.out.diagnostics.push(
            Diagnostic::error(
                format!("token of {len} characters exceeds the maximum length of {}", self.max_token_length),
                at,
            )
            .with_fix("shorten the token or split it up"),
        );
        true
    }

    fn read_whitespace(&mut self, at: Location) {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.advance();
        }
        if self.keep_trivia {
            let text = self.src[start..self.pos].to_owned();
            self.push(TokenKind::Whitespace, text, at);
        }
    }

    fn read_comment(&mut self, at: Location) {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c != '\n') {
            self.advance();
        }
        if self.keep_trivia {
            let text = self.src[start..self.pos].to_owned();
            self.push(TokenKind::Comment, text, at);
        }
    }

    fn read_string(&mut self, at: Location) {
        self.advance(); // opening quote
        let mut s = String::new();
        let mut len = 0usize;
        loop {
            match self.advance() {
                None => {
                    self.out.diagnostics.push(
                        Diagnostic::error("unterminated string literal", at)
                            .with_fix("add a closing double quote"),
                    );
                    return;
                }
                Some('"') => break,
                Some('\\') => match self.advance() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some(c) => s.push(c),
                    None => {
                        self.out.diagnostics.push(
                            Diagnostic::error("unterminated string literal", at)
                                .with_fix("add a closing double quote"),
                        );
                        return;
                    }
                },
                Some(c) => s.push(c),
            }
            len += 1;
        }
        if !self.too_long(len, at) {
            self.push(TokenKind::Str, s, at);
        }
    }

    fn read_word(&mut self, at: Location) {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if !is_delimiter(c)) {
            self.advance();
        }
        let src = self.src;
        let word = &src[start..self.pos];
        if self.too_long(word.chars().count(), at) {
            return;
        }
        self.classify(word.to_owned(), at);
    }

    fn classify(&mut self, word: String, at: Location) {
        match word.as_str() {
            "true" | "#t" => return self.push(TokenKind::Boolean, "true".into(), at),
            "false" | "#f" => return self.push(TokenKind::Boolean, "false".into(), at),
            _ => {}
        }

        if let Some(name) = word.strip_prefix('@') {
            if is_identifier(name) {
                let name = name.to_owned();
                self.push(TokenKind::Variable, name, at);
            } else {
                self.out.diagnostics.push(
                    Diagnostic::error(format!("invalid variable reference '{word}'"), at)
                        .with_fix("variable names start with a letter or '_' followed by letters, digits or '_'"),
                );
            }
            return;
        }

        if is_number_literal(&word) {
            if word.parse::<f64>().map(f64::is_finite).unwrap_or(false) {
                self.push(TokenKind::Number, word, at);
            } else {
                self.out.diagnostics.push(
                    Diagnostic::error(format!("number '{word}' is out of range"), at),
                );
            }
            return;
        }

        let mut chars = word.chars();
        let first = chars.next();
        let looks_numeric = match first {
            Some(c) if c.is_ascii_digit() => true,
            Some('-') => matches!(chars.next(), Some(c) if c.is_ascii_digit()),
            _ => false,
        };
        if looks_numeric {
            self.out.diagnostics.push(
                Diagnostic::error(format!("malformed number '{word}'"), at)
                    .with_fix("numbers look like 12, -3.5 or 1e6"),
            );
            return;
        }

        self.push(TokenKind::Identifier, word, at);
    }

    pub fn tokenize(mut self) -> Lexed {
        while let Some(c) = self.peek() {
            let at = self.here();
            match c {
                c if c.is_whitespace() => self.read_whitespace(at),
                ';' => self.read_comment(at),
                '(' => {
                    self.advance();
                    self.push(TokenKind::OpenParen, "(".into(), at);
                }
                ')' => {
                    self.advance();
                    self.push(TokenKind::CloseParen, ")".into(), at);
                }
                '"' => self.read_string(at),
                _ => self.read_word(at),
            }
        }
        let at = self.here();
        self.push(TokenKind::Eof, String::new(), at);
        self.out
    }
}

/// Tokenize with default settings, dropping trivia and diagnostics.
pub fn tokenize(src: &str) -> Vec<Token> {
    Lexer::new(src).tokenize().tokens
}

// ── Tests ─────────────────────────────────────────────────────────────────────
