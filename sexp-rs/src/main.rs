use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::process::ExitCode;

use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use sexp::cli::{self, ConfigFile, Input, LineBuffer};
use sexp::config::Config;
use sexp::engine::Engine;
use sexp::store::VariableStore;

fn main() -> ExitCode {
    let args = match cli::parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("sexp: {e}");
            eprintln!("{}", cli::USAGE);
            return ExitCode::FAILURE;
        }
    };
    if args.help {
        println!("{}", cli::USAGE);
        return ExitCode::SUCCESS;
    }
    if args.version {
        println!("sexp {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    // `RUST_LOG` wins over `-d`.
    let default_level = if args.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(io::stderr)
        .init();

    // ── Load config ───────────────────────────────────────────────────────────
    let path = match &args.config {
        ConfigFile::Skip => None,
        ConfigFile::Explicit(p) => Some(p.clone()),
        ConfigFile::Search => cli::find_user_config(),
    };
    let mut config = Config::new();
    if let Some(path) = path {
        match Config::load_file(&path) {
            Ok((loaded, errors)) => {
                for e in errors {
                    eprintln!("sexp: {}: {e}", path.display());
                }
                debug!(path = %path.display(), "config loaded");
                config = loaded;
            }
            Err(e) if args.config == ConfigFile::Search => {
                warn!(path = %path.display(), error = %e, "config unreadable");
            }
            Err(e) => {
                eprintln!("sexp: {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        }
    }

    // ── Build the engine ──────────────────────────────────────────────────────
    if args.no_persist {
        config.engine.storage_dir = None;
    } else if let Some(dir) = &args.storage_dir {
        config.engine.storage_dir = Some(dir.clone());
    } else if config.engine.storage_dir.is_none() {
        config.engine.storage_dir = VariableStore::default_dir();
    }
    if let Some(dir) = &config.engine.storage_dir {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("sexp: {}: {e}", dir.display());
            return ExitCode::FAILURE;
        }
    }

    let mut engine = match Engine::new(&config.engine) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("sexp: {e}");
            return ExitCode::FAILURE;
        }
    };
    for (name, e) in engine.seed_variables(&config.variables) {
        eprintln!("sexp: /var {name}: {e}");
    }

    // ── Evaluate ──────────────────────────────────────────────────────────────
    let mut failed = false;
    for expr in &args.expressions {
        failed |= !run(&mut engine, "-e", 1, expr);
    }

    let mut inputs = args.inputs.clone();
    if inputs.is_empty() && args.reads_stdin() {
        inputs.push(Input::Stdin);
    }
    for input in &inputs {
        let outcome = match input {
            Input::Stdin => run_lines(&mut engine, "<stdin>", io::stdin().lock()),
            Input::File(path) => match File::open(path) {
                Ok(f) => run_lines(&mut engine, &path.display().to_string(), BufReader::new(f)),
                Err(e) => Err(e),
            },
        };
        match outcome {
            Ok(ok) => failed |= !ok,
            Err(e) => {
                eprintln!("sexp: {e}");
                failed = true;
            }
        }
    }

    // ── Save on exit ──────────────────────────────────────────────────────────
    if let Err(e) = engine.save() {
        eprintln!("sexp: could not save variables: {e}");
        failed = true;
    }

    if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

/// Evaluate each complete expression read from `reader`.  Returns whether
/// all of them succeeded.
fn run_lines(engine: &mut Engine, source: &str, reader: impl BufRead) -> io::Result<bool> {
    let mut buf = LineBuffer::new();
    let mut ok = true;
    for line in reader.lines() {
        if let Some((lineno, text)) = buf.push(&line?) {
            ok &= run(engine, source, lineno, &text);
        }
    }
    if let Some((lineno, text)) = buf.finish() {
        ok &= run(engine, source, lineno, &text);
    }
    Ok(ok)
}

fn run(engine: &mut Engine, source: &str, lineno: usize, text: &str) -> bool {
    let result = engine.evaluate_str(text, None);
    if result.is_error() {
        eprintln!("{source}:{lineno}: {result}");
        return false;
    }
    println!("{result}");
    true
}
