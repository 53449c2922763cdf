//! Command-line argument parsing.
//!
//! Usage:
//!   sexp [-e<expr>]... [-c[<file>]] [-s<dir>] [-ndhv] [<file>|-]...

use std::iter::Peekable;
use std::path::PathBuf;

use directories::BaseDirs;

use crate::script::lexer::{tokenize, TokenKind};

pub const USAGE: &str = "Usage: sexp [-e<expr>]... [-c[<file>]] [-s<dir>] [-ndhv] [<file>|-]...";

// ── Public types ──────────────────────────────────────────────────────────────

/// Parsed command-line arguments.
#[derive(Debug, Default)]
pub struct CliArgs {
    /// Expressions to evaluate, in order (`-e<expr>`).
    pub expressions: Vec<String>,
    /// Config-file specification.
    pub config: ConfigFile,
    /// Storage directory override (`-s<dir>`).
    pub storage_dir: Option<PathBuf>,
    /// Disable persistence (`-n`).
    pub no_persist: bool,
    /// Debug logging (`-d`).
    pub debug: bool,
    pub help: bool,
    pub version: bool,
    /// Script files to evaluate; `-` is stdin.
    pub inputs: Vec<Input>,
}

/// How to choose the `.sexprc`.
#[derive(Debug, Default, PartialEq, Eq)]
pub enum ConfigFile {
    /// Search `~/.sexprc` then `./.sexprc` (default).
    #[default]
    Search,
    /// `-c` with no file argument: skip the config.
    Skip,
    /// `-c<file>`: load this specific file.
    Explicit(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Stdin,
    File(PathBuf),
}

impl CliArgs {
    /// Read stdin when nothing else was asked for.
    pub fn reads_stdin(&self) -> bool {
        self.inputs.contains(&Input::Stdin) || (self.inputs.is_empty() && self.expressions.is_empty())
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse `std::env::args()` and return [`CliArgs`] or an error message.
pub fn parse_args() -> Result<CliArgs, String> {
    let raw: Vec<String> = std::env::args().collect();
    parse_argv(raw.get(1..).unwrap_or_default())
}

/// Parse a slice of argument strings (exposed for testing).
///
/// Flags cluster (`-nd`).  A flag taking a value swallows the rest of its
/// cluster, or the next argument when the cluster ends with it.
pub fn parse_argv(argv: &[String]) -> Result<CliArgs, String> {
    let mut args = CliArgs::default();
    let mut rest = argv.iter().peekable();

    while let Some(arg) = rest.next() {
        let cluster = match arg.strip_prefix('-') {
            Some("-") => {
                args.inputs.extend(rest.by_ref().map(|p| input(p)));
                break;
            }
            Some(cluster) if !cluster.is_empty() => cluster,
            _ => {
                args.inputs.push(input(arg));
                continue;
            }
        };

        for (at, flag) in cluster.char_indices() {
            let attached = &cluster[at + flag.len_utf8()..];
            match flag {
                'd' => args.debug = true,
                'n' => args.no_persist = true,
                'h' => args.help = true,
                'v' => args.version = true,
                'c' => {
                    let file = match attached {
                        "" => rest.next_if(|next| !next.starts_with('-')).map(PathBuf::from),
                        file => Some(PathBuf::from(file)),
                    };
                    args.config = file.map_or(ConfigFile::Skip, ConfigFile::Explicit);
                    break;
                }
                'e' => {
                    args.expressions.push(flag_value(flag, attached, &mut rest, "an expression")?);
                    break;
                }
                's' => {
                    args.storage_dir = Some(flag_value(flag, attached, &mut rest, "a directory")?.into());
                    break;
                }
                other => return Err(format!("unknown option: -{other}")),
            }
        }
    }

    if args.no_persist && args.storage_dir.is_some() {
        return Err("-n and -s cannot be combined".to_owned());
    }
    Ok(args)
}

fn input(arg: &str) -> Input {
    if arg == "-" { Input::Stdin } else { Input::File(PathBuf::from(arg)) }
}

fn flag_value<'a>(
    flag: char,
    attached: &str,
    rest: &mut Peekable<impl Iterator<Item = &'a String>>,
    what: &str,
) -> Result<String, String> {
    if !attached.is_empty() {
        return Ok(attached.to_owned());
    }
    rest.next().cloned().ok_or_else(|| format!("-{flag} requires {what} argument"))
}

// ── Path helpers ──────────────────────────────────────────────────────────────

/// Search for the user `.sexprc` in the standard locations.
/// Returns the first path that exists, or `None`.
pub fn find_user_config() -> Option<PathBuf> {
    let home = BaseDirs::new().map(|b| b.home_dir().join(".sexprc"));
    home.into_iter()
        .chain(std::iter::once(PathBuf::from("./.sexprc")))
        .find(|p| p.exists())
}

// ── Line accumulation ─────────────────────────────────────────────────────────

/// Gathers input lines until they hold a complete expression, i.e. until
/// every `(` has been closed.
#[derive(Debug, Default)]
pub struct LineBuffer {
    text: String,
    /// Line number (1-based) where the pending expression started.
    start: usize,
    lines: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a line.  Returns the accumulated text and its starting line once
    /// the parentheses balance; blank and comment-only input is dropped.
    pub fn push(&mut self, line: &str) -> Option<(usize, String)> {
        self.lines += 1;
        if self.text.is_empty() {
            self.start = self.lines;
        }
        self.text.push_str(line);
        self.text.push('\n');

        let tokens = tokenize(&self.text);
        if tokens.iter().all(|t| t.kind == TokenKind::Eof) {
            self.text.clear();
            return None;
        }
        let depth: i64 = tokens
            .iter()
            .map(|t| match t.kind {
                TokenKind::OpenParen => 1,
                TokenKind::CloseParen => -1,
                _ => 0,
            })
            .sum();
        if depth > 0 {
            return None;
        }
        Some((self.start, std::mem::take(&mut self.text)))
    }

    /// Whatever is left at end of input, if anything.
    pub fn finish(&mut self) -> Option<(usize, String)> {
        let rest = std::mem::take(&mut self.text);
        if rest.trim().is_empty() { None } else { Some((self.start, rest)) }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|&s| s.to_owned()).collect()
    }

    #[test]
    fn empty_args_read_stdin() {
        let a = parse_argv(&argv(&[])).unwrap();
        assert!(a.reads_stdin());
        assert_eq!(a.config, ConfigFile::Search);
        assert!(!a.no_persist);
    }

    #[test]
    fn expressions_embedded_and_separate() {
        let a = parse_argv(&argv(&["-e(+ 1 2)", "-e", "(* 3 4)"])).unwrap();
        assert_eq!(a.expressions, ["(+ 1 2)", "(* 3 4)"]);
        assert!(!a.reads_stdin());
    }

    #[test]
    fn expression_missing_argument() {
        assert!(parse_argv(&argv(&["-e"])).is_err());
    }

    #[test]
    fn bool_flags() {
        let a = parse_argv(&argv(&["-n", "-d", "-h", "-v"])).unwrap();
        assert!(a.no_persist && a.debug && a.help && a.version);
    }

    #[test]
    fn combined_bool_flags() {
        let a = parse_argv(&argv(&["-nd"])).unwrap();
        assert!(a.no_persist && a.debug);
    }

    #[test]
    fn storage_dir_embedded_and_separate() {
        let a = parse_argv(&argv(&["-s/var/sexp"])).unwrap();
        assert_eq!(a.storage_dir, Some(PathBuf::from("/var/sexp")));
        let a = parse_argv(&argv(&["-s", "/var/sexp"])).unwrap();
        assert_eq!(a.storage_dir, Some(PathBuf::from("/var/sexp")));
    }

    #[test]
    fn no_persist_conflicts_with_storage_dir() {
        assert!(parse_argv(&argv(&["-n", "-s/tmp"])).is_err());
    }

    #[test]
    fn config_forms() {
        let a = parse_argv(&argv(&["-c"])).unwrap();
        assert_eq!(a.config, ConfigFile::Skip);
        let a = parse_argv(&argv(&["-cmission.sexprc"])).unwrap();
        assert_eq!(a.config, ConfigFile::Explicit(PathBuf::from("mission.sexprc")));
        let a = parse_argv(&argv(&["-c", "mission.sexprc"])).unwrap();
        assert_eq!(a.config, ConfigFile::Explicit(PathBuf::from("mission.sexprc")));
    }

    #[test]
    fn files_and_stdin() {
        let a = parse_argv(&argv(&["a.sexp", "-", "--", "-odd.sexp"])).unwrap();
        assert_eq!(
            a.inputs,
            [
                Input::File(PathBuf::from("a.sexp")),
                Input::Stdin,
                Input::File(PathBuf::from("-odd.sexp")),
            ]
        );
        assert!(a.reads_stdin());
    }

    #[test]
    fn line_buffer_waits_for_balance() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push("; header"), None);
        assert_eq!(buf.push("(if (> 5 3)"), None);
        assert_eq!(buf.push("    \"yes\""), None);
        let (line, text) = buf.push("    \"no\")").unwrap();
        assert_eq!(line, 2);
        assert!(text.starts_with("(if"));
        assert_eq!(buf.push("(+ 1 2)").map(|(l, _)| l), Some(5));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn line_buffer_ignores_parens_in_strings() {
        let mut buf = LineBuffer::new();
        assert!(buf.push("(string-length \"(((\")").is_some());
        assert_eq!(buf.push("(+ 1"), None);
        assert_eq!(buf.finish().map(|(l, t)| (l, t.trim().to_owned())), Some((2, "(+ 1".to_owned())));
    }

    #[test]
    fn value_flags_end_their_cluster() {
        let a = parse_argv(&argv(&["-de(not 0)", "-ns"])).unwrap_err();
        assert!(a.contains("-s requires a directory"), "{a}");
        let a = parse_argv(&argv(&["-dc", "-e", "1"])).unwrap();
        assert!(a.debug);
        assert_eq!(a.config, ConfigFile::Skip);
        assert_eq!(a.expressions, ["1"]);
        let a = parse_argv(&argv(&["-ds", "/tmp/x", "-e(+ 1 2)"])).unwrap();
        assert_eq!(a.storage_dir, Some(PathBuf::from("/tmp/x")));
        assert_eq!(a.expressions, ["(+ 1 2)"]);
    }

    #[test]
    fn unknown_flag() {
        assert!(parse_argv(&argv(&["-z"])).is_err());
    }
}
