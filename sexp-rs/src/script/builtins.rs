//! The built-in function library.
//!
//! | Category     | Functions                                                    |
//! |--------------|--------------------------------------------------------------|
//! | arithmetic   | `+ - * / mod abs min max pow sqrt` (`%` = `mod`)            |
//! | comparison   | `= != < > <= >=` (`==` = `=`)                               |
//! | logic        | `and or not` (`and`/`or` short-circuit)                     |
//! | conditional  | `if when` (only the selected branch is evaluated)           |
//! | string       | `string-concat string-length string-equals substring`       |
//! |              | `to-upper to-lower string-contains`                         |
//! |              | `string-to-number number-to-string`                         |
//! | introspection| `type-of`                                                   |
//! | variables    | `get-variable set-variable has-variable remove-variable`    |
//!
//! Division and modulo by zero are DIVISION_BY_ZERO errors, never panics.
//! The variable functions read or write the attached variable manager and
//! are therefore never cached.

use super::cache::Dependency;
use super::function::{Args, NativeFunction};
use super::registry::FunctionRegistry;
use super::value::{format_number, ErrorKind, ResultType, SexpError, SexpResult, Value};
use crate::var::Scope;

const NUMERIC: &[ResultType] = &[ResultType::Number, ResultType::Boolean];
const SCALAR: &[ResultType] = &[ResultType::Number, ResultType::String, ResultType::Boolean];
const TEXT: &[ResultType] = &[ResultType::String];

/// Register every built-in.  Returns how many were registered.
pub fn register_builtins(registry: &mut FunctionRegistry) -> usize {
    let mut count = 0;
    let mut add = |f: NativeFunction, aliases: &[&str]| {
        if registry.register(Box::new(f), aliases) {
            count += 1;
        }
    };

    // ── Arithmetic ───────────────────────────────────────────────────────────
    add(
        arith("+", "sum of the arguments", 1, None, |args| {
            finite("+", numbers(args)?.into_iter().sum())
        }),
        &[],
    );
    add(
        arith("-", "first argument minus the rest; negation with one argument", 1, None, |args| {
            let ns = numbers(args)?;
            match ns.split_first() {
                Some((first, [])) => finite("-", -first),
                Some((first, rest)) => finite("-", rest.iter().fold(*first, |acc, n| acc - n)),
                None => Ok(SexpResult::number(0.0)),
            }
        }),
        &[],
    );
    add(
        arith("*", "product of the arguments", 1, None, |args| {
            finite("*", numbers(args)?.into_iter().product())
        }),
        &[],
    );
    add(
        arith("/", "first argument divided by the rest", 2, None, |args| {
            let ns = numbers(args)?;
            let mut acc = ns[0];
            for d in &ns[1..] {
                if *d == 0.0 {
                    return Err(SexpError::new(ErrorKind::DivisionByZero, "division by zero"));
                }
                acc /= d;
            }
            finite("/", acc)
        }),
        &[],
    );
    add(
        arith("mod", "remainder of the first argument divided by the second", 2, Some(2), |args| {
            let (a, b) = (args.number(0)?, args.number(1)?);
            if b == 0.0 {
                return Err(SexpError::new(ErrorKind::DivisionByZero, "modulo by zero"));
            }
            finite("mod", a % b)
        }),
        &["%"],
    );
    add(arith("abs", "absolute value", 1, Some(1), |args| Ok(SexpResult::number(args.number(0)?.abs()))), &[]);
    add(
        arith("min", "smallest argument", 1, None, |args| {
            Ok(SexpResult::number(numbers(args)?.into_iter().fold(f64::INFINITY, f64::min)))
        }),
        &[],
    );
    add(
        arith("max", "largest argument", 1, None, |args| {
            Ok(SexpResult::number(numbers(args)?.into_iter().fold(f64::NEG_INFINITY, f64::max)))
        }),
        &[],
    );
    add(
        arith("pow", "first argument raised to the second", 2, Some(2), |args| {
            finite("pow", args.number(0)?.powf(args.number(1)?))
        }),
        &[],
    );
    add(
        arith("sqrt", "square root", 1, Some(1), |args| {
            let n = args.number(0)?;
            if n < 0.0 {
                return Err(SexpError::new(ErrorKind::ValidationError, "square root of a negative number"));
            }
            Ok(SexpResult::number(n.sqrt()))
        }),
        &[],
    );

    // ── Comparison ───────────────────────────────────────────────────────────
    add(
        NativeFunction::new("=", |args| {
            let first = args.get(0)?;
            for i in 1..args.len() {
                if !equal(&first, &args.get(i)?) {
                    return Ok(SexpResult::boolean(false));
                }
            }
            Ok(SexpResult::boolean(true))
        })
        .with_category("comparison")
        .with_description("true when every argument equals the first")
        .with_signature("(= a b ...)")
        .with_arity(2, None)
        .with_argument_types(SCALAR),
        &["=="],
    );
    add(
        NativeFunction::new("!=", |args| Ok(SexpResult::boolean(!equal(&args.get(0)?, &args.get(1)?))))
            .with_category("comparison")
            .with_description("true when the arguments differ")
            .with_signature("(!= a b)")
            .with_arity(2, Some(2))
            .with_argument_types(SCALAR),
        &[],
    );
    add(ordering("<", |a, b| a < b), &[]);
    add(ordering(">", |a, b| a > b), &[]);
    add(ordering("<=", |a, b| a <= b), &[]);
    add(ordering(">=", |a, b| a >= b), &[]);

    // ── Logic ────────────────────────────────────────────────────────────────
    add(
        NativeFunction::new("and", |args| {
            for i in 0..args.len() {
                if !args.boolean(i)? {
                    return Ok(SexpResult::boolean(false));
                }
            }
            Ok(SexpResult::boolean(true))
        })
        .with_category("logic")
        .with_description("true when every argument is true; stops at the first false")
        .with_signature("(and a b ...)")
        .with_arity(1, None)
        .lazy(),
        &[],
    );
    add(
        NativeFunction::new("or", |args| {
            for i in 0..args.len() {
                if args.boolean(i)? {
                    return Ok(SexpResult::boolean(true));
                }
            }
            Ok(SexpResult::boolean(false))
        })
        .with_category("logic")
        .with_description("true when any argument is true; stops at the first true")
        .with_signature("(or a b ...)")
        .with_arity(1, None)
        .lazy(),
        &[],
    );
    add(
        NativeFunction::new("not", |args| Ok(SexpResult::boolean(!args.boolean(0)?)))
            .with_category("logic")
            .with_description("logical negation")
            .with_signature("(not a)")
            .with_arity(1, Some(1))
            .with_argument_types(SCALAR),
        &[],
    );

    // ── Conditionals ─────────────────────────────────────────────────────────
    add(
        NativeFunction::new("if", |args| {
            if args.boolean(0)? {
                Ok(args.result(1))
            } else if args.len() > 2 {
                Ok(args.result(2))
            } else {
                Ok(SexpResult::void())
            }
        })
        .with_category("conditional")
        .with_description("evaluate the second argument when the first is true, else the third")
        .with_signature("(if condition then [else])")
        .with_arity(2, Some(3))
        .lazy(),
        &[],
    );
    add(
        NativeFunction::new("when", |args| {
            if !args.boolean(0)? {
                return Ok(SexpResult::void());
            }
            let mut last = SexpResult::void();
            for i in 1..args.len() {
                last = args.result(i);
                if last.is_error() {
                    break;
                }
            }
            Ok(last)
        })
        .with_category("conditional")
        .with_description("evaluate the remaining arguments in order when the first is true")
        .with_signature("(when condition body ...)")
        .with_arity(1, None)
        .lazy(),
        &[],
    );

    // ── Strings ──────────────────────────────────────────────────────────────
    add(
        text("string-concat", "concatenation of the arguments", 1, None, |args| {
            let mut out = String::new();
            for i in 0..args.len() {
                out.push_str(&args.string(i)?);
            }
            Ok(SexpResult::string(out))
        })
        .with_argument_types(SCALAR),
        &[],
    );
    add(
        text("string-length", "number of characters", 1, Some(1), |args| {
            Ok(SexpResult::number(args.string(0)?.chars().count() as f64))
        }),
        &[],
    );
    add(
        text("string-equals", "exact string equality", 2, Some(2), |args| {
            Ok(SexpResult::boolean(args.string(0)? == args.string(1)?))
        }),
        &[],
    );
    add(
        text("substring", "characters [start, start + length) of a string", 2, Some(3), substring)
            .with_signature("(substring text start [length])")
            .with_argument_types(&[ResultType::String, ResultType::Number]),
        &[],
    );
    add(text("to-upper", "upper-case copy", 1, Some(1), |args| Ok(SexpResult::string(args.string(0)?.to_uppercase()))), &[]);
    add(text("to-lower", "lower-case copy", 1, Some(1), |args| Ok(SexpResult::string(args.string(0)?.to_lowercase()))), &[]);
    add(
        text("string-contains", "true when the first string contains the second", 2, Some(2), |args| {
            Ok(SexpResult::boolean(args.string(0)?.contains(&args.string(1)?)))
        }),
        &[],
    );
    add(
        text("string-to-number", "parse a string as a number", 1, Some(1), |args| {
            Ok(SexpResult::number(args.get(0)?.as_number()?))
        }),
        &[],
    );
    add(
        text("number-to-string", "format a number as a string", 1, Some(1), |args| {
            Ok(SexpResult::string(format_number(args.number(0)?)))
        })
        .with_argument_types(&[ResultType::Number]),
        &[],
    );

    // ── Introspection ────────────────────────────────────────────────────────
    add(
        NativeFunction::new("type-of", |args| Ok(SexpResult::string(args.get(0)?.result_type().name())))
            .with_category("introspection")
            .with_description("name of the argument's type")
            .with_signature("(type-of value)")
            .with_arity(1, Some(1)),
        &[],
    );

    // ── Variables ────────────────────────────────────────────────────────────
    add(
        variable_fn("get-variable", "value of a variable; scope auto searches local, campaign, global", 2, |args| {
            let (scope, name) = scope_and_name(args)?;
            args.depend_on(Dependency::Variable(name.clone()));
            args.with_variables(|vm| match scope {
                Some(s) => vm.get_variable(s, &name),
                None => vm.resolve(&name),
            })
        })
        .with_signature("(get-variable scope name)")
        .uncacheable(),
        &[],
    );
    add(
        variable_fn("set-variable", "create or update a variable", 3, |args| {
            let (scope, name) = scope_and_name(args)?;
            let value = args.get(2)?;
            args.with_variables(|vm| {
                let scope = scope.or_else(|| vm.find_variable(&name)).unwrap_or(Scope::Local);
                vm.set_variable(scope, &name, value)
            })??;
            Ok(SexpResult::boolean(true))
        })
        .with_signature("(set-variable scope name value)")
        .impure(),
        &[],
    );
    add(
        variable_fn("has-variable", "true when the variable exists", 2, |args| {
            let (scope, name) = scope_and_name(args)?;
            let found = args.with_variables(|vm| match scope {
                Some(s) => vm.has_variable(s, &name),
                None => vm.find_variable(&name).is_some(),
            })?;
            Ok(SexpResult::boolean(found))
        })
        .with_signature("(has-variable scope name)")
        .uncacheable(),
        &[],
    );
    add(
        variable_fn("remove-variable", "delete a variable; false when absent or read-only", 2, |args| {
            let (scope, name) = scope_and_name(args)?;
            let removed = args.with_variables(|vm| match scope.or_else(|| vm.find_variable(&name)) {
                Some(s) => vm.remove_variable(s, &name),
                None => false,
            })?;
            Ok(SexpResult::boolean(removed))
        })
        .with_signature("(remove-variable scope name)")
        .impure(),
        &[],
    );

    count
}

// ── Constructors ──────────────────────────────────────────────────────────────

type Body = fn(&mut Args<'_>) -> Result<SexpResult, SexpError>;

fn arith(name: &str, description: &str, min: usize, max: Option<usize>, body: Body) -> NativeFunction {
    NativeFunction::new(name, body)
        .with_category("arithmetic")
        .with_description(description)
        .with_arity(min, max)
        .with_argument_types(NUMERIC)
}

fn text(name: &str, description: &str, min: usize, max: Option<usize>, body: Body) -> NativeFunction {
    NativeFunction::new(name, body)
        .with_category("string")
        .with_description(description)
        .with_arity(min, max)
        .with_argument_types(TEXT)
}

fn variable_fn(name: &str, description: &str, arity: usize, body: Body) -> NativeFunction {
    NativeFunction::new(name, body)
        .with_category("variables")
        .with_description(description)
        .with_arity(arity, Some(arity))
}

fn ordering(name: &'static str, holds: fn(f64, f64) -> bool) -> NativeFunction {
    NativeFunction::new(name, move |args| {
        let ns = numbers(args)?;
        Ok(SexpResult::boolean(ns.windows(2).all(|w| holds(w[0], w[1]))))
    })
    .with_category("comparison")
    .with_description(format!("true when each argument is {name} the next"))
    .with_signature(format!("({name} a b ...)"))
    .with_arity(2, None)
    .with_argument_types(NUMERIC)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn numbers(args: &mut Args<'_>) -> Result<Vec<f64>, SexpError> {
    (0..args.len()).map(|i| args.number(i)).collect()
}

fn finite(name: &str, n: f64) -> Result<SexpResult, SexpError> {
    if n.is_finite() {
        Ok(SexpResult::number(n))
    } else {
        Err(SexpError::new(ErrorKind::RuntimeError, format!("'{name}' produced a non-finite number")))
    }
}

/// Mixed kinds compare numerically; a pair with no numeric reading is unequal.
fn equal(a: &SexpResult, b: &SexpResult) -> bool {
    match (a.value(), b.value()) {
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        _ => matches!((a.as_number(), b.as_number()), (Ok(x), Ok(y)) if x == y),
    }
}

fn substring(args: &mut Args<'_>) -> Result<SexpResult, SexpError> {
    let text = args.string(0)?;
    let chars: Vec<char> = text.chars().collect();
    let start = index_arg(args.number(1)?, "start")?;
    let len = match args.len() {
        3 => index_arg(args.number(2)?, "length")?,
        _ => chars.len().saturating_sub(start),
    };
    let end = start.checked_add(len).filter(|&end| end <= chars.len());
    let Some(end) = end else {
        return Err(SexpError::new(
            ErrorKind::IndexOutOfBounds,
            format!("substring of length {len} from {start} is outside a string of length {}", chars.len()),
        ));
    };
    Ok(SexpResult::string(chars[start..end].iter().collect::<String>()))
}

fn index_arg(n: f64, what: &str) -> Result<usize, SexpError> {
    if n < 0.0 || n.fract() != 0.0 {
        return Err(SexpError::new(
            ErrorKind::IndexOutOfBounds,
            format!("{what} must be a non-negative integer, got {}", format_number(n)),
        ));
    }
    if n >= usize::MAX as f64 {
        return Err(SexpError::new(ErrorKind::IndexOutOfBounds, format!("{what} {} is too large", format_number(n))));
    }
    Ok(n as usize)
}

/// `None` scope means auto.
fn scope_and_name(args: &mut Args<'_>) -> Result<(Option<Scope>, String), SexpError> {
    let scope_name = args.string(0)?;
    let scope = if scope_name.eq_ignore_ascii_case("auto") {
        None
    } else {
        let parsed = scope_name.parse::<Scope>().map_err(|()| {
            SexpError::new(ErrorKind::ValidationError, format!("unknown scope '{scope_name}'"))
                .with_fix("use local, campaign, global or auto")
        })?;
        Some(parsed)
    };
    Ok((scope, args.string(1)?))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
