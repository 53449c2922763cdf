//! Engine configuration and the `.sexprc` directive loader.
//!
//! A `.sexprc` file is a list of slash commands:
//!
//! | Directive | Action |
//! |-----------|--------|
//! | `/set <key>=<value>` or `/set <key> <value>` | set an engine tunable |
//! | `/var <scope> <name> <literal>` | seed a variable |
//! | Lines starting with `;` | comment, ignored |
//! | Any other `/command` | silently skipped |
//!
//! Booleans accept `on`, `off`, `true`, `false`, `1` and `0`.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::script::lexer::DEFAULT_MAX_TOKEN_LENGTH;
use crate::script::parser::{parse, Expr, ParseOptions};
use crate::script::value::SexpResult;
use crate::var::Scope;

// ── EngineConfig ──────────────────────────────────────────────────────────────

/// Every tunable of an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Whether function names are matched case-sensitively.
    pub case_sensitive: bool,
    pub max_token_length: usize,
    pub max_parse_depth: usize,
    /// Nesting depth past which the validator warns.
    pub depth_warning: usize,
    pub max_evaluation_depth: usize,
    pub cache_enabled: bool,
    pub cache_capacity: usize,
    pub registry_cache_capacity: usize,
    pub variable_cache_capacity: usize,
    pub max_context_variables: usize,
    pub max_scope_variables: usize,
    /// Where CAMPAIGN and GLOBAL variables are stored; `None` disables
    /// persistence.
    pub storage_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            case_sensitive: true,
            max_token_length: DEFAULT_MAX_TOKEN_LENGTH,
            max_parse_depth: 256,
            depth_warning: 32,
            max_evaluation_depth: 256,
            cache_enabled: true,
            cache_capacity: 1024,
            registry_cache_capacity: 128,
            variable_cache_capacity: 256,
            max_context_variables: 1024,
            max_scope_variables: 4096,
            storage_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            max_token_length: self.max_token_length,
            max_depth: self.max_parse_depth,
            depth_warning: self.depth_warning,
        }
    }

    /// Names accepted by [`EngineConfig::set`].
    pub const KEYS: &'static [&'static str] = &[
        "case_sensitive",
        "max_token_length",
        "max_parse_depth",
        "depth_warning",
        "max_evaluation_depth",
        "cache_enabled",
        "cache_capacity",
        "registry_cache_capacity",
        "variable_cache_capacity",
        "max_context_variables",
        "max_scope_variables",
        "storage_dir",
    ];

    /// Set one tunable from its textual form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        let value = value.trim();
        match key {
            "case_sensitive"          => self.case_sensitive = parse_bool(key, value)?,
            "cache_enabled"           => self.cache_enabled = parse_bool(key, value)?,
            "max_token_length"        => self.max_token_length = parse_count(key, value)?,
            "max_parse_depth"         => self.max_parse_depth = parse_count(key, value)?,
            "depth_warning"           => self.depth_warning = parse_count(key, value)?,
            "max_evaluation_depth"    => self.max_evaluation_depth = parse_count(key, value)?,
            "cache_capacity"          => self.cache_capacity = parse_count(key, value)?,
            "registry_cache_capacity" => self.registry_cache_capacity = parse_count(key, value)?,
            "variable_cache_capacity" => self.variable_cache_capacity = parse_count(key, value)?,
            "max_context_variables"   => self.max_context_variables = parse_count(key, value)?,
            "max_scope_variables"     => self.max_scope_variables = parse_count(key, value)?,
            "storage_dir" => {
                self.storage_dir = if value.is_empty() { None } else { Some(PathBuf::from(value)) };
            }
            _ => {
                let hint = crate::suggest::suggest_similar(key, Self::KEYS.iter().copied(), 1);
                return Err(match hint.first() {
                    Some(h) => format!("/set: unknown setting '{key}' (did you mean '{h}'?)"),
                    None => format!("/set: unknown setting '{key}'"),
                });
            }
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(format!("/set: '{key}' expects on/off, got '{value}'")),
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize, String> {
    value
        .parse()
        .map_err(|_| format!("/set: '{key}' expects a non-negative integer, got '{value}'"))
}

// ── Loader ────────────────────────────────────────────────────────────────────

/// A non-fatal error encountered while loading a config file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ConfigError {
    pub line: usize,
    pub message: String,
}

/// A variable seeded by a `/var` directive.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedVariable {
    pub scope: Scope,
    pub name: String,
    pub value: SexpResult,
}

/// A loaded `.sexprc`: tunables plus variables to seed.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub engine: EngineConfig,
    pub variables: Vec<SeedVariable>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `.sexprc` string.
    ///
    /// Unknown directives are skipped.  Returns the config and a list of
    /// errors on recognised lines.
    pub fn load_str(s: &str) -> (Self, Vec<ConfigError>) {
        let mut config = Config::new();
        let mut errors = Vec::new();

        for (i, raw) in s.lines().enumerate() {
            let lineno = i + 1;
            let line = raw.trim();

            if line.is_empty() || line.starts_with(';') {
                continue;
            }

            let Some(rest) = line.strip_prefix('/') else { continue };

            let (cmd, args_str) = rest
                .split_once(|c: char| c.is_ascii_whitespace())
                .unwrap_or((rest, ""));
            let args_str = args_str.trim();

            let outcome = match cmd {
                "set" => parse_set(args_str, &mut config.engine),
                "var" => parse_var(args_str).map(|seed| config.variables.push(seed)),
                _ => Ok(()),
            };
            if let Err(message) = outcome {
                errors.push(ConfigError { line: lineno, message });
            }
        }

        (config, errors)
    }

    /// Read and parse a `.sexprc` file from disk.
    pub fn load_file(path: &Path) -> std::io::Result<(Self, Vec<ConfigError>)> {
        let s = std::fs::read_to_string(path)?;
        Ok(Self::load_str(&s))
    }
}

// ── /set ──────────────────────────────────────────────────────────────────────

/// Parse `/set <key>=<value>` or `/set <key> <value>`.
fn parse_set(args: &str, engine: &mut EngineConfig) -> Result<(), String> {
    if args.is_empty() {
        return Err("/set: requires an argument".into());
    }

    let (key, value) = match args.split_once('=') {
        Some((k, v)) if !k.contains(char::is_whitespace) => (k, v),
        _ => match args.split_once(char::is_whitespace) {
            Some((k, v)) => (k, v),
            None => return Err(format!("/set: missing value for '{args}'")),
        },
    };

    if key.is_empty() {
        return Err("/set: setting name cannot be empty".into());
    }
    engine.set(key, value)
}

// ── /var ──────────────────────────────────────────────────────────────────────

/// Parse `/var <scope> <name> <literal>`.
fn parse_var(args: &str) -> Result<SeedVariable, String> {
    let mut parts = args.splitn(3, char::is_whitespace);
    let (Some(scope), Some(name), Some(literal)) = (parts.next(), parts.next(), parts.next()) else {
        return Err("/var: usage is /var <scope> <name> <literal>".into());
    };
    let scope: Scope = scope
        .parse()
        .map_err(|()| format!("/var: unknown scope '{scope}' (expected local, campaign or global)"))?;

    let value = match parse(literal.trim()) {
        Ok(Expr::Number(n)) => SexpResult::number(n),
        Ok(Expr::Str(s)) => SexpResult::string(s),
        Ok(Expr::Boolean(b)) => SexpResult::boolean(b),
        Ok(_) => return Err(format!("/var: '{}' is not a literal", literal.trim())),
        Err(e) => return Err(format!("/var: {}", e.message)),
    };

    Ok(SeedVariable { scope, name: name.to_owned(), value })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
