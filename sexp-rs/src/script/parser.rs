//! SEXP expression tree, parser, syntax validator and serializer.
//!
//! Grammar:
//!
//! ```text
//! expr := literal | variable | identifier | "(" identifier expr* ")"
//! ```
//!
//! A bare literal, variable or identifier is a complete expression; `()`
//! and a list whose head is not an identifier are rejected.  Parsing never
//! panics: failures come back as [`Diagnostic`]s.
//!
//! [`Expr::to_sexp_string`] is the exact inverse of parsing for any tree
//! the parser builds, so `parse(e.to_sexp_string()) == e`.

use std::fmt;

use super::lexer::{Diagnostic, Lexer, Token, TokenKind, DEFAULT_MAX_TOKEN_LENGTH};
use super::value::{format_number, Location, SexpError};

// ── Expr ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    LiteralNumber,
    LiteralString,
    LiteralBoolean,
    VariableReference,
    Identifier,
    FunctionCall,
}

/// One node of an expression tree.  Calls own their arguments; trees are
/// never shared or cyclic.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Boolean(bool),
    /// `@name`; holds the name without the sigil.
    Variable(String),
    Identifier(String),
    Call { name: String, args: Vec<Expr> },
}

impl Expr {
    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call { name: name.into(), args }
    }

    pub fn node_type(&self) -> NodeType {
        match self {
            Expr::Number(_)     => NodeType::LiteralNumber,
            Expr::Str(_)        => NodeType::LiteralString,
            Expr::Boolean(_)    => NodeType::LiteralBoolean,
            Expr::Variable(_)   => NodeType::VariableReference,
            Expr::Identifier(_) => NodeType::Identifier,
            Expr::Call { .. }   => NodeType::FunctionCall,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::Number(_) | Expr::Str(_) | Expr::Boolean(_))
    }

    /// Nesting depth: leaves are 0, `(f)` is 1.
    pub fn depth(&self) -> usize {
        match self {
            Expr::Call { args, .. } => 1 + args.iter().map(Expr::depth).max().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn node_count(&self) -> usize {
        match self {
            Expr::Call { args, .. } => 1 + args.iter().map(Expr::node_count).sum::<usize>(),
            _ => 1,
        }
    }

    /// `true` if any node below (or at) this one is a variable reference.
    pub fn references_variables(&self) -> bool {
        match self {
            Expr::Variable(_) => true,
            Expr::Call { args, .. } => args.iter().any(Expr::references_variables),
            _ => false,
        }
    }

    /// Every function name called in this tree, in pre-order.
    pub fn function_names(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_function_names(&mut out);
        out
    }

    fn collect_function_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        if let Expr::Call { name, args } = self {
            out.push(name);
            for a in args {
                a.collect_function_names(out);
            }
        }
    }

    /// Canonical source form.
    pub fn to_sexp_string(&self) -> String {
        let mut out = String::new();
        self.write_sexp(&mut out);
        out
    }

    pub fn write_sexp(&self, out: &mut String) {
        match self {
            Expr::Number(n) => out.push_str(&format_number(*n)),
            Expr::Str(s) => write_string_literal(s, out),
            Expr::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
            Expr::Variable(name) => {
                out.push('@');
                out.push_str(name);
            }
            Expr::Identifier(name) => out.push_str(name),
            Expr::Call { name, args } => {
                out.push('(');
                out.push_str(name);
                for a in args {
                    out.push(' ');
                    a.write_sexp(out);
                }
                out.push(')');
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sexp_string())
    }
}

fn write_string_literal(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
}

// ── Options & reports ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    pub max_token_length: usize,
    /// Hard limit; deeper nesting is a syntax error.
    pub max_depth: usize,
    /// Advisory limit; deeper nesting produces a warning.
    pub depth_warning: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            max_token_length: DEFAULT_MAX_TOKEN_LENGTH,
            max_depth: 256,
            depth_warning: 32,
        }
    }
}

/// Result of [`parse_with`]: the tree (if parsing succeeded) and every
/// diagnostic, errors and warnings alike.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub expr: Option<Expr>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ParseOutcome {
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }
}

/// Result of [`validate_syntax`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyntaxReport {
    pub is_valid: bool,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl SyntaxReport {
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

// ── Shared diagnostics ────────────────────────────────────────────────────────

fn empty_input(at: Location) -> Diagnostic {
    Diagnostic::error("empty expression", at).with_fix("write an expression such as (+ 1 2)")
}

fn empty_list(at: Location) -> Diagnostic {
    Diagnostic::error("empty expression '()'", at).with_fix("put a function name after '('")
}

fn unmatched_close(at: Location) -> Diagnostic {
    Diagnostic::error("unmatched closing parenthesis", at)
        .with_fix("remove the extra closing parenthesis")
}

fn missing_close(open: Location, count: usize) -> Diagnostic {
    let what = if count == 1 {
        "missing closing parenthesis".to_owned()
    } else {
        format!("missing {count} closing parentheses")
    };
    Diagnostic::error(
        format!("{what} for '(' opened at line {}, column {}", open.line, open.column),
        open,
    )
    .with_fix("add a closing parenthesis")
}

fn bad_head(tok: &Token) -> Diagnostic {
    Diagnostic::error(
        format!("expected a function name after '(' but found {}", describe(tok)),
        tok.location(),
    )
    .with_fix("the first element of a list must be a function name")
}

fn trailing(tok: &Token) -> Diagnostic {
    Diagnostic::error(
        format!("unexpected {} after the end of the expression", describe(tok)),
        tok.location(),
    )
    .with_fix("wrap multiple expressions in a function call such as (and ...)")
}

fn too_deep(at: Location, max: usize) -> Diagnostic {
    Diagnostic::error(format!("expression is nested deeper than {max} levels"), at)
        .with_fix("split the expression into smaller pieces")
}

fn deep_warning(at: Location, limit: usize) -> Diagnostic {
    Diagnostic::warning(format!("expression nesting exceeds {limit} levels"), at)
}

fn describe(tok: &Token) -> String {
    match tok.kind {
        TokenKind::Eof => "end of input".to_owned(),
        TokenKind::OpenParen => "'('".to_owned(),
        TokenKind::CloseParen => "')'".to_owned(),
        TokenKind::Str => format!("string \"{}\"", tok.value),
        TokenKind::Variable => format!("variable '@{}'", tok.value),
        kind => format!("{} '{}'", kind.name().to_lowercase(), tok.value),
    }
}

fn lex(src: &str, options: &ParseOptions) -> (Vec<Token>, Vec<Diagnostic>) {
    let lexed = Lexer::new(src)
        .with_max_token_length(options.max_token_length)
        .tokenize();
    (lexed.tokens, lexed.diagnostics)
}

// ── Parser ────────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    options: ParseOptions,
    warned_depth: bool,
    warnings: Vec<Diagnostic>,
}

impl Parser {
    fn new(tokens: Vec<Token>, options: ParseOptions) -> Self {
        Parser { tokens, pos: 0, options, warned_depth: false, warnings: Vec::new() }
    }

    fn peek(&self) -> &Token {
        // The lexer guarantees a trailing EOF, which is never consumed.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let t = self.peek().clone();
        if t.kind != TokenKind::Eof {
            self.pos += 1;
        }
        t
    }

    fn parse_document(&mut self) -> Result<Expr, Diagnostic> {
        if self.peek().kind == TokenKind::Eof {
            return Err(empty_input(self.peek().location()));
        }
        let expr = self.parse_expr(0)?;
        let next = self.peek();
        match next.kind {
            TokenKind::Eof => Ok(expr),
            TokenKind::CloseParen => Err(unmatched_close(next.location())),
            _ => Err(trailing(next)),
        }
    }

    fn parse_expr(&mut self, depth: usize) -> Result<Expr, Diagnostic> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::Number => tok
                .value
                .parse()
                .map(Expr::Number)
                .map_err(|_| Diagnostic::error(format!("malformed number '{}'", tok.value), tok.location())),
            TokenKind::Str => Ok(Expr::Str(tok.value)),
            TokenKind::Boolean => Ok(Expr::Boolean(tok.value == "true")),
            TokenKind::Variable => Ok(Expr::Variable(tok.value)),
            TokenKind::Identifier => Ok(Expr::Identifier(tok.value)),
            TokenKind::OpenParen => self.parse_call(&tok, depth + 1),
            TokenKind::CloseParen => Err(unmatched_close(tok.location())),
            TokenKind::Eof => Err(Diagnostic::error("unexpected end of input", tok.location())
                .with_fix("complete the expression")),
            TokenKind::Comment | TokenKind::Whitespace => {
                unreachable!("trivia is filtered before parsing")
            }
        }
    }

    fn parse_call(&mut self, open: &Token, depth: usize) -> Result<Expr, Diagnostic> {
        if depth > self.options.max_depth {
            return Err(too_deep(open.location(), self.options.max_depth));
        }
        if depth > self.options.depth_warning && !self.warned_depth {
            self.warned_depth = true;
            self.warnings.push(deep_warning(open.location(), self.options.depth_warning));
        }

        let head = self.advance();
        let name = match head.kind {
            TokenKind::Identifier => head.value,
            TokenKind::CloseParen => return Err(empty_list(open.location())),
            TokenKind::Eof => return Err(missing_close(open.location(), 1)),
            _ => return Err(bad_head(&head)),
        };

        let mut args = Vec::new();
        loop {
            match self.peek().kind {
                TokenKind::CloseParen => {
                    self.advance();
                    return Ok(Expr::Call { name, args });
                }
                TokenKind::Eof => return Err(missing_close(open.location(), 1)),
                _ => args.push(self.parse_expr(depth)?),
            }
        }
    }
}

/// Parse with explicit options, collecting every diagnostic.
pub fn parse_with(src: &str, options: &ParseOptions) -> ParseOutcome {
    let (tokens, mut diagnostics) = lex(src, options);
    let lex_failed = diagnostics.iter().any(Diagnostic::is_error);

    let mut parser = Parser::new(tokens, *options);
    let parsed = parser.parse_document();
    diagnostics.append(&mut parser.warnings);

    let expr = match parsed {
        Ok(expr) if !lex_failed => Some(expr),
        Ok(_) => None,
        Err(d) => {
            diagnostics.push(d);
            None
        }
    };
    ParseOutcome { expr, diagnostics }
}

/// Parse with default options; the first error becomes a contextual
/// SYNTAX_ERROR.
pub fn parse(src: &str) -> Result<Expr, SexpError> {
    let outcome = parse_with(src, &ParseOptions::default());
    match outcome.expr {
        Some(expr) => Ok(expr),
        None => {
            let first = outcome.errors().next().cloned().unwrap_or_else(|| {
                Diagnostic::error("invalid expression", Location::new(0, 1, 1))
            });
            Err(first.to_error(src))
        }
    }
}

/// Re-serialize `src` in canonical form, or `None` if it does not parse.
pub fn canonical_form(src: &str) -> Option<String> {
    parse(src).ok().map(|e| e.to_sexp_string())
}

// ── Validator ─────────────────────────────────────────────────────────────────

/// Check syntax without building a tree.
///
/// Walks the token stream with a stack of open-paren positions, so it can
/// keep going after the first problem and report several at once.
pub fn validate_syntax(src: &str, options: &ParseOptions) -> SyntaxReport {
    let (tokens, diagnostics) = lex(src, options);
    let (mut errors, mut warnings): (Vec<_>, Vec<_>) =
        diagnostics.into_iter().partition(Diagnostic::is_error);

    let mut opens: Vec<Location> = Vec::new();
    let mut expect_head = false;
    let mut complete = false;
    let mut too_deep_reported = false;
    let mut warned_depth = false;

    for tok in &tokens {
        if complete && tok.kind != TokenKind::Eof {
            errors.push(if tok.kind == TokenKind::CloseParen {
                unmatched_close(tok.location())
            } else {
                trailing(tok)
            });
            break;
        }
        match tok.kind {
            TokenKind::OpenParen => {
                if expect_head {
                    errors.push(bad_head(tok));
                }
                opens.push(tok.location());
                expect_head = true;
                let depth = opens.len();
                if depth > options.max_depth && !too_deep_reported {
                    too_deep_reported = true;
                    errors.push(too_deep(tok.location(), options.max_depth));
                } else if depth > options.depth_warning && !warned_depth {
                    warned_depth = true;
                    warnings.push(deep_warning(tok.location(), options.depth_warning));
                }
            }
            TokenKind::CloseParen => {
                let Some(open) = opens.pop() else {
                    errors.push(unmatched_close(tok.location()));
                    break;
                };
                if expect_head {
                    errors.push(empty_list(open));
                }
                expect_head = false;
                complete = opens.is_empty();
            }
            TokenKind::Identifier => {
                expect_head = false;
                complete = opens.is_empty();
            }
            TokenKind::Number | TokenKind::Str | TokenKind::Boolean | TokenKind::Variable => {
                if expect_head {
                    errors.push(bad_head(tok));
                }
                expect_head = false;
                complete = opens.is_empty();
            }
            TokenKind::Eof => {
                if let Some(outer) = opens.first() {
                    errors.push(missing_close(*outer, opens.len()));
                } else if !complete && errors.is_empty() {
                    errors.push(empty_input(tok.location()));
                }
            }
            TokenKind::Comment | TokenKind::Whitespace => {}
        }
    }

    SyntaxReport { is_valid: errors.is_empty(), errors, warnings }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::lexer::Severity;
    use crate::script::value::ErrorKind;

    fn p(src: &str) -> Expr {
        parse(src).expect("parse failed")
    }

    fn report(src: &str) -> SyntaxReport {
        validate_syntax(src, &ParseOptions::default())
    }

    #[test]
    fn literals_at_top_level() {
        assert_eq!(p("42"), Expr::Number(42.0));
        assert_eq!(p("\"hi\""), Expr::Str("hi".into()));
        assert_eq!(p("#t"), Expr::Boolean(true));
        assert_eq!(p("@x"), Expr::Variable("x".into()));
        assert_eq!(p("alpha"), Expr::Identifier("alpha".into()));
    }

    #[test]
    fn nested_call() {
        let e = p("(if (> 5 3) \"yes\" \"no\")");
        match &e {
            Expr::Call { name, args } => {
                assert_eq!(name, "if");
                assert_eq!(args.len(), 3);
                assert_eq!(args[0].node_type(), NodeType::FunctionCall);
            }
            other => panic!("expected call, got {other:?}"),
        }
        assert_eq!(e.depth(), 2);
        assert_eq!(e.node_count(), 6);
        assert_eq!(e.function_names(), vec!["if", ">"]);
    }

    #[test]
    fn zero_arg_call() {
        assert_eq!(p("(mission-time)"), Expr::call("mission-time", vec![]));
    }

    #[test]
    fn missing_paren() {
        let err = parse("(+ 1 2").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SyntaxError);
        assert!(err.message.contains("parenthesis"));
        assert_eq!(err.suggested_fix, "add a closing parenthesis");
        assert_eq!(err.context, "(+ 1 2");
    }

    #[test]
    fn empty_list_rejected() {
        let err = parse("()").unwrap_err();
        assert!(err.message.contains("()"));
    }

    #[test]
    fn literal_head_rejected() {
        assert!(parse("(1 2)").is_err());
        assert!(parse("((f) 2)").is_err());
    }

    #[test]
    fn trailing_tokens_rejected() {
        assert!(parse("(+ 1 2) 3").is_err());
        let err = parse("(+ 1 2))").unwrap_err();
        assert!(err.message.contains("unmatched"));
    }

    #[test]
    fn empty_input_rejected() {
        assert!(parse("").is_err());
        assert!(parse("  ; only a comment").is_err());
    }

    #[test]
    fn lex_errors_fail_parse() {
        let outcome = parse_with("(+ 1x 2)", &ParseOptions::default());
        assert!(outcome.expr.is_none());
        assert!(outcome.errors().count() >= 1);
    }

    #[test]
    fn canonical_serialization() {
        assert_eq!(canonical_form("( +   2.0   3 )").as_deref(), Some("(+ 2 3)"));
        assert_eq!(canonical_form("(f #t #f 1e3)").as_deref(), Some("(f true false 1000)"));
        assert_eq!(
            canonical_form(r#"(echo "a\"b\\c\nd")"#).as_deref(),
            Some(r#"(echo "a\"b\\c\nd")"#)
        );
    }

    #[test]
    fn round_trip() {
        for src in [
            "(+ 2 3)",
            "(if (> @x 3) \"yes\" (when true (set-variable \"local\" \"y\" -1.25)))",
            "(f)",
            "@ship",
            "\"tab\\there\"",
        ] {
            let tree = p(src);
            assert_eq!(p(&tree.to_sexp_string()), tree, "round trip of {src}");
        }
    }

    #[test]
    fn depth_limit_is_an_error() {
        let opts = ParseOptions { max_depth: 3, depth_warning: 2, ..ParseOptions::default() };
        let src = "(a (b (c (d))))";
        let outcome = parse_with(src, &opts);
        assert!(outcome.expr.is_none());
        assert!(!validate_syntax(src, &opts).is_valid);
    }

    #[test]
    fn depth_warning_is_advisory() {
        let opts = ParseOptions { depth_warning: 2, ..ParseOptions::default() };
        let src = "(a (b (c 1)))";
        let outcome = parse_with(src, &opts);
        assert!(outcome.expr.is_some());
        assert!(outcome.diagnostics.iter().any(|d| d.severity == Severity::Warning));

        let r = validate_syntax(src, &opts);
        assert!(r.is_valid);
        assert_eq!(r.warnings.len(), 1);
    }

    #[test]
    fn validator_reports_missing_parens() {
        let r = report("(+ 1 (* 2 3)");
        assert!(!r.is_valid);
        assert!(r.error_messages()[0].contains("parenthesis"));

        let r = report("(and (f");
        assert!(r.error_messages()[0].contains("2 closing parentheses"));
    }

    #[test]
    fn validator_agrees_with_parser() {
        for src in ["(+ 2 3)", "42", "()", "(1)", ")", "(a) b", "", "(f \"x", "(g (h) @v)"] {
            let parsed = parse(src).is_ok();
            assert_eq!(report(src).is_valid, parsed, "disagreement on {src:?}");
        }
    }
}
