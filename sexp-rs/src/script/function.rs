//! The contract every SEXP function implements, and the execution pipeline
//! that wraps it.
//!
//! A function is anything implementing [`SexpFunction`].  It never runs
//! directly: the registry stores it inside a [`FunctionEntry`], whose
//! [`execute`](FunctionEntry::execute) applies the same checks to every
//! call:
//!
//! 1. reject null (dead object reference) arguments as TYPE_MISMATCH;
//! 2. check the argument count against `[min_args, max_args]`;
//! 3. check each argument's type against the supported set;
//! 4. run the function's own [`validate`](SexpFunction::validate) hook;
//! 5. invoke the implementation;
//! 6. turn a panic inside the implementation into a RUNTIME_ERROR;
//! 7. record call count, time and error count, whatever happened.
//!
//! Lazy functions (`if`, `and`, …) skip the up-front evaluation of steps
//! 1, 3 and 4: their arguments are evaluated, and type-checked, one at a
//! time through [`Args::get`] when the implementation asks for them.

use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::warn;

use super::cache::Dependency;
use super::context::Context;
use super::evaluator::Evaluator;
use super::parser::Expr;
use super::value::{ErrorKind, ObjectRef, ResultType, SexpError, SexpResult, Value};
use crate::var::VariableManager;

// ── SexpFunction ──────────────────────────────────────────────────────────────

/// A callable SEXP function.
///
/// Functions that read mutable state (variables, live objects) must return
/// `false` from [`is_cacheable`](Self::is_cacheable).
pub trait SexpFunction {
    fn name(&self) -> &str;

    fn category(&self) -> &str {
        "general"
    }

    fn description(&self) -> &str {
        ""
    }

    fn signature(&self) -> String {
        format!("({} ...)", self.name())
    }

    fn min_args(&self) -> usize {
        0
    }

    /// `None` means variadic.
    fn max_args(&self) -> Option<usize> {
        None
    }

    /// Empty means any type is accepted.
    fn supported_argument_types(&self) -> &[ResultType] {
        &[]
    }

    fn is_pure(&self) -> bool {
        true
    }

    fn is_cacheable(&self) -> bool {
        true
    }

    /// Receive arguments unevaluated and evaluate them on demand.
    fn is_lazy(&self) -> bool {
        false
    }

    /// Custom validation over the evaluated arguments (eager functions only).
    fn validate(&self, _args: &[SexpResult]) -> Result<(), SexpError> {
        Ok(())
    }

    fn call(&self, args: &mut Args<'_>) -> Result<SexpResult, SexpError>;
}

// ── Args ──────────────────────────────────────────────────────────────────────

enum Source<'a> {
    /// Every argument was supplied up front.
    Values,
    /// Arguments are expression nodes evaluated on request.
    Lazy {
        eval: &'a mut Evaluator,
        exprs: &'a [Expr],
        ctx: &'a Context,
        depth: usize,
    },
}

/// A function's view of its arguments.
pub struct Args<'a> {
    function: &'a str,
    supported: &'a [ResultType],
    values: Vec<Option<SexpResult>>,
    source: Source<'a>,
}

impl<'a> Args<'a> {
    /// Arguments that are already values (direct calls, tests).
    pub fn from_values(function: &'a str, supported: &'a [ResultType], values: Vec<SexpResult>) -> Self {
        Args {
            function,
            supported,
            values: values.into_iter().map(Some).collect(),
            source: Source::Values,
        }
    }

    pub(crate) fn lazy(
        function: &'a str,
        supported: &'a [ResultType],
        exprs: &'a [Expr],
        eval: &'a mut Evaluator,
        ctx: &'a Context,
        depth: usize,
    ) -> Self {
        Args {
            function,
            supported,
            values: vec![None; exprs.len()],
            source: Source::Lazy { eval, exprs, ctx, depth },
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The unevaluated expression, when arguments are lazy.
    pub fn expr(&self, i: usize) -> Option<&Expr> {
        match &self.source {
            Source::Lazy { exprs, .. } => exprs.get(i),
            Source::Values => None,
        }
    }

    /// The evaluation context, when called from the evaluator.
    pub fn context(&self) -> Option<&Context> {
        match &self.source {
            Source::Lazy { ctx, .. } => Some(*ctx),
            Source::Values => None,
        }
    }

    /// Argument `i` exactly as evaluated (once), ERROR values included and
    /// metadata intact.  Out of range is ARGUMENT_COUNT_MISMATCH.
    pub fn result(&mut self, i: usize) -> SexpResult {
        let Some(slot) = self.values.get(i) else {
            return SexpResult::failure(
                ErrorKind::ArgumentCountMismatch,
                format!("'{}' has no argument {}", self.function, i + 1),
            );
        };
        if let Some(v) = slot {
            return v.clone();
        }
        let v = match &mut self.source {
            Source::Lazy { eval, exprs, ctx, depth } => eval.eval_node(&exprs[i], *ctx, *depth),
            Source::Values => SexpResult::void(),
        };
        self.values[i] = Some(v.clone());
        v
    }

    /// Evaluate argument `i` without type checking.  An ERROR value comes
    /// back as `Err`.
    pub fn evaluate(&mut self, i: usize) -> Result<SexpResult, SexpError> {
        self.result(i).into_result()
    }

    /// Evaluate argument `i` and check it against the supported types.
    pub fn get(&mut self, i: usize) -> Result<SexpResult, SexpError> {
        let v = self.evaluate(i)?;
        self.check_type(i, &v)?;
        Ok(v)
    }

    pub fn number(&mut self, i: usize) -> Result<f64, SexpError> {
        let v = self.get(i)?;
        v.as_number().map_err(|e| self.positional(i, e))
    }

    pub fn string(&mut self, i: usize) -> Result<String, SexpError> {
        let v = self.get(i)?;
        v.as_string().map_err(|e| self.positional(i, e))
    }

    pub fn boolean(&mut self, i: usize) -> Result<bool, SexpError> {
        let v = self.get(i)?;
        v.as_boolean().map_err(|e| self.positional(i, e))
    }

    /// Evaluate and type-check every argument, left to right.
    pub fn all(&mut self) -> Result<Vec<SexpResult>, SexpError> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }

    /// Record that the result depends on `dep`, so cached results are
    /// dropped when it changes.
    pub fn depend_on(&mut self, dep: Dependency) {
        if let Source::Lazy { eval, .. } = &mut self.source {
            eval.record_dependency(dep);
        }
    }

    /// Look up a bound object through the context chain, recording it as a
    /// dependency.
    pub fn object(&mut self, id: &str) -> Result<ObjectRef, SexpError> {
        self.depend_on(Dependency::Object(id.to_owned()));
        let ctx = self.context().ok_or_else(|| {
            SexpError::new(ErrorKind::ContextError, format!("no context to resolve object '{id}'"))
        })?;
        ctx.get_object_reference(id).as_object()
    }

    /// Run `f` against the attached variable manager.
    pub fn with_variables<R>(&mut self, f: impl FnOnce(&mut VariableManager) -> R) -> Result<R, SexpError> {
        let manager = match &self.source {
            Source::Lazy { eval, .. } => eval.variable_manager(),
            Source::Values => None,
        };
        let manager = manager.ok_or_else(|| {
            SexpError::new(ErrorKind::ContextError, "no variable manager is attached to the evaluator")
        })?;
        let mut guard = manager.try_borrow_mut().map_err(|_| {
            SexpError::new(ErrorKind::ContextError, "variable manager is already in use")
        })?;
        Ok(f(&mut guard))
    }

    fn check_type(&self, i: usize, v: &SexpResult) -> Result<(), SexpError> {
        let found = v.result_type();
        if self.supported.is_empty() || self.supported.contains(&found) {
            return Ok(());
        }
        let expected: Vec<&str> = self.supported.iter().map(|t| t.name()).collect();
        Err(SexpError::new(
            ErrorKind::TypeMismatch,
            format!(
                "argument {} of '{}' must be {}, found {}",
                i + 1,
                self.function,
                expected.join(" or "),
                found.name()
            ),
        ))
    }

    fn positional(&self, i: usize, mut e: SexpError) -> SexpError {
        if e.kind == ErrorKind::TypeMismatch {
            e.message = format!("argument {} of '{}': {}", i + 1, self.function, e.message);
        }
        e
    }
}

// ── FunctionEntry ─────────────────────────────────────────────────────────────

/// A registered function plus its call statistics.
pub struct FunctionEntry {
    function: Box<dyn SexpFunction>,
    calls: Cell<u64>,
    errors: Cell<u64>,
    total_time: Cell<Duration>,
}

impl fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("name", &self.function.name())
            .field("category", &self.function.category())
            .field("calls", &self.calls.get())
            .finish()
    }
}

impl FunctionEntry {
    pub fn new(function: Box<dyn SexpFunction>) -> Self {
        FunctionEntry {
            function,
            calls: Cell::new(0),
            errors: Cell::new(0),
            total_time: Cell::new(Duration::ZERO),
        }
    }

    pub fn function(&self) -> &dyn SexpFunction {
        self.function.as_ref()
    }

    pub fn name(&self) -> &str {
        self.function.name()
    }

    pub fn category(&self) -> &str {
        self.function.category()
    }

    /// Eligible for evaluator-level memoization.
    pub fn is_cacheable(&self) -> bool {
        self.function.is_pure() && self.function.is_cacheable()
    }

    pub fn call_count(&self) -> u64 {
        self.calls.get()
    }

    pub fn error_count(&self) -> u64 {
        self.errors.get()
    }

    pub fn total_time(&self) -> Duration {
        self.total_time.get()
    }

    pub fn average_time(&self) -> Duration {
        match self.calls.get() {
            0 => Duration::ZERO,
            n => self.total_time.get().div_f64(n as f64),
        }
    }

    /// Run the pipeline over already-evaluated arguments.
    pub fn execute_values(&self, values: Vec<SexpResult>) -> SexpResult {
        let mut args = Args::from_values(self.name(), self.function.supported_argument_types(), values);
        self.execute(&mut args)
    }

    /// Run the full pipeline.  Never panics; every failure is an ERROR
    /// result.
    pub fn execute(&self, args: &mut Args<'_>) -> SexpResult {
        let started = Instant::now();
        let result = self.run(args);
        self.calls.set(self.calls.get() + 1);
        self.total_time.set(self.total_time.get() + started.elapsed());
        if result.is_error() {
            self.errors.set(self.errors.get() + 1);
        }
        result
    }

    fn run(&self, args: &mut Args<'_>) -> SexpResult {
        let f = self.function.as_ref();
        let name = f.name();

        let mut values = Vec::new();
        if !f.is_lazy() {
            values.reserve(args.len());
            for i in 0..args.len() {
                let v = args.result(i);
                if v.is_error() {
                    return v;
                }
                values.push(v);
            }
            for (i, v) in values.iter().enumerate() {
                if let Value::Object(o) = v.value() {
                    if !o.is_alive() {
                        return SexpResult::failure(
                            ErrorKind::TypeMismatch,
                            format!("argument {} of '{name}' is null (object '{}' no longer exists)", i + 1, o.id()),
                        );
                    }
                }
            }
        }

        let n = args.len();
        let (min, max) = (f.min_args(), f.max_args());
        if n < min || max.is_some_and(|m| n > m) {
            return SexpResult::failure(
                ErrorKind::ArgumentCountMismatch,
                format!("'{name}' expects {}, got {n}", describe_arity(min, max)),
            );
        }

        if !f.is_lazy() {
            for (i, v) in values.iter().enumerate() {
                if let Err(e) = args.check_type(i, v) {
                    return e.into();
                }
            }
            if let Err(e) = f.validate(&values) {
                return e.into();
            }
        }

        match panic::catch_unwind(AssertUnwindSafe(|| f.call(args))) {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => e.into(),
            Err(payload) => {
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                warn!(function = name, %detail, "function implementation panicked");
                SexpResult::failure(ErrorKind::RuntimeError, format!("'{name}' failed: {detail}"))
            }
        }
    }
}

fn describe_arity(min: usize, max: Option<usize>) -> String {
    let plural = |n: usize| if n == 1 { "argument" } else { "arguments" };
    match max {
        Some(m) if m == min => format!("{min} {}", plural(min)),
        Some(m) => format!("{min} to {m} arguments"),
        None => format!("at least {min} {}", plural(min)),
    }
}

// ── NativeFunction ────────────────────────────────────────────────────────────

type Body = dyn Fn(&mut Args<'_>) -> Result<SexpResult, SexpError>;
type Validator = dyn Fn(&[SexpResult]) -> Result<(), SexpError>;

/// A [`SexpFunction`] built from a closure.
///
/// ```rust
/// use sexp::script::{NativeFunction, ResultType, SexpResult};
///
/// let double = NativeFunction::new("double", |args| Ok(SexpResult::number(args.number(0)? * 2.0)))
///     .with_category("arithmetic")
///     .with_arity(1, Some(1))
///     .with_argument_types(&[ResultType::Number]);
/// ```
pub struct NativeFunction {
    name: String,
    category: String,
    description: String,
    signature: String,
    min_args: usize,
    max_args: Option<usize>,
    arg_types: Vec<ResultType>,
    pure: bool,
    cacheable: bool,
    lazy: bool,
    validator: Option<Box<Validator>>,
    body: Box<Body>,
}

impl NativeFunction {
    pub fn new(
        name: impl Into<String>,
        body: impl Fn(&mut Args<'_>) -> Result<SexpResult, SexpError> + 'static,
    ) -> Self {
        NativeFunction {
            name: name.into(),
            category: "general".to_owned(),
            description: String::new(),
            signature: String::new(),
            min_args: 0,
            max_args: None,
            arg_types: Vec::new(),
            pure: true,
            cacheable: true,
            lazy: false,
            validator: None,
            body: Box::new(body),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn with_arity(mut self, min: usize, max: Option<usize>) -> Self {
        self.min_args = min;
        self.max_args = max;
        self
    }

    pub fn with_argument_types(mut self, types: &[ResultType]) -> Self {
        self.arg_types = types.to_vec();
        self
    }

    pub fn with_validator(
        mut self,
        validator: impl Fn(&[SexpResult]) -> Result<(), SexpError> + 'static,
    ) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Has side effects; implies not cacheable.
    pub fn impure(mut self) -> Self {
        self.pure = false;
        self.cacheable = false;
        self
    }

    /// Pure, but reads state that may change between calls.
    pub fn uncacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }
}

impl SexpFunction for NativeFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn signature(&self) -> String {
        if self.signature.is_empty() {
            format!("({} ...)", self.name)
        } else {
            self.signature.clone()
        }
    }

    fn min_args(&self) -> usize {
        self.min_args
    }

    fn max_args(&self) -> Option<usize> {
        self.max_args
    }

    fn supported_argument_types(&self) -> &[ResultType] {
        &self.arg_types
    }

    fn is_pure(&self) -> bool {
        self.pure
    }

    fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    fn is_lazy(&self) -> bool {
        self.lazy
    }

    fn validate(&self, args: &[SexpResult]) -> Result<(), SexpError> {
        match &self.validator {
            Some(v) => v(args),
            None => Ok(()),
        }
    }

    fn call(&self, args: &mut Args<'_>) -> Result<SexpResult, SexpError> {
        (self.body)(args)
    }
}

/// Shared handle to a registry entry.
pub type FunctionRef = Rc<FunctionEntry>;

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn add() -> FunctionEntry {
        FunctionEntry::new(Box::new(
            NativeFunction::new("add", |args| {
                let mut sum = 0.0;
                for i in 0..args.len() {
                    sum += args.number(i)?;
                }
                Ok(SexpResult::number(sum))
            })
            .with_arity(1, Some(3))
            .with_argument_types(&[ResultType::Number]),
        ))
    }

    #[test]
    fn executes_and_counts() {
        let f = add();
        let r = f.execute_values(vec![1.0.into(), 2.0.into()]);
        assert_eq!(r, SexpResult::number(3.0));
        assert_eq!(f.call_count(), 1);
        assert_eq!(f.error_count(), 0);
    }

    #[test]
    fn average_time_survives_huge_call_counts() {
        let f = add();
        f.calls.set(u64::from(u32::MAX) * 4);
        f.total_time.set(Duration::from_secs(u64::from(u32::MAX) * 8));
        assert_eq!(f.average_time(), Duration::from_secs(2));
    }

    #[test]
    fn argument_count_checked() {
        let f = add();
        let r = f.execute_values(vec![]);
        assert_eq!(r.error_kind(), Some(ErrorKind::ArgumentCountMismatch));
        assert!(r.error().unwrap().message.contains("1 to 3 arguments"));
        let r = f.execute_values(vec![1.0.into(); 4]);
        assert_eq!(r.error_kind(), Some(ErrorKind::ArgumentCountMismatch));
        assert_eq!(f.call_count(), 2);
        assert_eq!(f.error_count(), 2);
    }

    #[test]
    fn argument_types_checked_with_position() {
        let f = add();
        let r = f.execute_values(vec![1.0.into(), "two".into()]);
        let e = r.error().unwrap();
        assert_eq!(e.kind, ErrorKind::TypeMismatch);
        assert!(e.message.contains("argument 2"), "{}", e.message);
    }

    #[test]
    fn error_arguments_propagate_unchanged() {
        let f = add();
        let r = f.execute_values(vec![SexpResult::failure(ErrorKind::DivisionByZero, "boom")]);
        assert_eq!(r.error_kind(), Some(ErrorKind::DivisionByZero));
    }

    #[test]
    fn dead_objects_are_null_arguments() {
        let f = FunctionEntry::new(Box::new(NativeFunction::new("id", |args| args.get(0))));
        let obj = Rc::new(5u32);
        let handle = crate::script::value::ObjectRef::new("o", &obj);
        drop(obj);
        let r = f.execute_values(vec![SexpResult::object(handle)]);
        assert_eq!(r.error_kind(), Some(ErrorKind::TypeMismatch));
        assert!(r.error().unwrap().message.contains("null"));
    }

    #[test]
    fn validator_hook_runs() {
        let f = FunctionEntry::new(Box::new(
            NativeFunction::new("positive", |args| args.get(0)).with_validator(|vals| {
                match vals.first().map(SexpResult::as_number) {
                    Some(Ok(n)) if n > 0.0 => Ok(()),
                    _ => Err(SexpError::new(ErrorKind::ValidationError, "must be positive")),
                }
            }),
        ));
        assert!(f.execute_values(vec![1.0.into()]).is_success());
        assert_eq!(
            f.execute_values(vec![(-1.0).into()]).error_kind(),
            Some(ErrorKind::ValidationError)
        );
    }

    #[test]
    fn panics_become_runtime_errors() {
        let f = FunctionEntry::new(Box::new(NativeFunction::new("explode", |_| panic!("kaboom"))));
        let r = f.execute_values(vec![]);
        assert_eq!(r.error_kind(), Some(ErrorKind::RuntimeError));
        assert!(r.error().unwrap().message.contains("kaboom"));
        assert_eq!(f.error_count(), 1);
    }

    #[test]
    fn cacheability_flags() {
        let pure = FunctionEntry::new(Box::new(NativeFunction::new("p", |_| Ok(SexpResult::void()))));
        let reads = FunctionEntry::new(Box::new(NativeFunction::new("r", |_| Ok(SexpResult::void())).uncacheable()));
        let writes = FunctionEntry::new(Box::new(NativeFunction::new("w", |_| Ok(SexpResult::void())).impure()));
        assert!(pure.is_cacheable());
        assert!(!reads.is_cacheable());
        assert!(!writes.is_cacheable());
    }

    #[test]
    fn arity_descriptions() {
        assert_eq!(describe_arity(1, Some(1)), "1 argument");
        assert_eq!(describe_arity(2, None), "at least 2 arguments");
        assert_eq!(describe_arity(0, Some(2)), "0 to 2 arguments");
    }
}
