//! Tree-walking evaluator.
//!
//! | Node                 | Evaluates to                                      |
//! |----------------------|---------------------------------------------------|
//! | number/string/bool   | itself                                            |
//! | identifier           | a STRING holding its name (symbol atom)           |
//! | `@name`              | context chain, then the variable manager          |
//! | `(f a b …)`          | `f`'s execute pipeline over its arguments         |
//!
//! Calls to pure, cacheable functions whose whole argument subtree is
//! free of `@var` references and of non-cacheable calls are memoized.
//! While such a call runs, every variable or object read made through its
//! [`Args`] is recorded; the cache entry is dropped as soon as one of those
//! dependencies changes.  Changes reported by the variable manager are
//! drained before each call's cache lookup.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::mpsc::Receiver;
use std::time::Instant;

use tracing::{debug, trace};

use super::cache::{CacheListener, CacheStatistics, Dependency, ExpressionCache};
use super::context::Context;
use super::function::{Args, FunctionRef};
use super::parser::Expr;
use super::registry::FunctionRegistry;
use super::value::{ErrorKind, SexpError, SexpResult};
use crate::notify::VariableEvent;
use crate::var::VariableManager;

pub const DEFAULT_MAX_DEPTH: usize = 256;
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvaluatorStatistics {
    /// Top-level evaluations.
    pub evaluations: u64,
    /// Top-level evaluations that produced an ERROR.
    pub errors: u64,
    /// Function calls dispatched, cache hits excluded.
    pub calls: u64,
    pub total_time_ms: f64,
}

pub struct Evaluator {
    registry: Rc<RefCell<FunctionRegistry>>,
    variables: Option<Rc<RefCell<VariableManager>>>,
    changes: Option<Receiver<VariableEvent>>,
    cache: ExpressionCache,
    cache_enabled: bool,
    max_depth: usize,
    call_stack: Vec<String>,
    /// One dependency set per cacheable call in progress.
    deps: Vec<BTreeSet<Dependency>>,
    stats: EvaluatorStatistics,
}

impl Evaluator {
    pub fn new(registry: Rc<RefCell<FunctionRegistry>>) -> Self {
        Evaluator {
            registry,
            variables: None,
            changes: None,
            cache: ExpressionCache::new(DEFAULT_CACHE_CAPACITY),
            cache_enabled: true,
            max_depth: DEFAULT_MAX_DEPTH,
            call_stack: Vec::new(),
            deps: Vec::new(),
            stats: EvaluatorStatistics::default(),
        }
    }

    /// Attach a variable manager: `@name` falls back to it, and its change
    /// events invalidate cached results.
    pub fn with_variables(mut self, manager: Rc<RefCell<VariableManager>>) -> Self {
        self.changes = Some(manager.borrow_mut().subscribe());
        self.variables = Some(manager);
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache.set_capacity(capacity);
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn set_cache_enabled(&mut self, enabled: bool) {
        self.cache_enabled = enabled;
        if !enabled {
            self.cache.clear();
        }
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    pub fn registry(&self) -> &Rc<RefCell<FunctionRegistry>> {
        &self.registry
    }

    pub fn variable_manager(&self) -> Option<Rc<RefCell<VariableManager>>> {
        self.variables.clone()
    }

    pub fn on_cache_event(&mut self, listener: CacheListener) {
        self.cache.on_event(listener);
    }

    pub fn cache_statistics(&self) -> CacheStatistics {
        self.cache.statistics()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn statistics(&self) -> EvaluatorStatistics {
        self.stats
    }

    // ── Invalidation ──────────────────────────────────────────────────────────

    fn drain_changes(&mut self) {
        let Some(rx) = &self.changes else { return };
        let names: Vec<String> = rx.try_iter().map(|e| e.name).collect();
        for name in names {
            self.cache.invalidate(&Dependency::Variable(name));
        }
    }

    pub fn invalidate_variable(&mut self, name: &str) -> usize {
        self.cache.invalidate(&Dependency::Variable(name.to_owned()))
    }

    /// Report that a bound object changed state.
    pub fn notify_object_changed(&mut self, id: &str) -> usize {
        self.cache.invalidate(&Dependency::Object(id.to_owned()))
    }

    /// Report that a bound object no longer exists.
    pub fn notify_object_destroyed(&mut self, id: &str) -> usize {
        let dropped = self.cache.invalidate(&Dependency::Object(id.to_owned()));
        debug!(object = id, dropped, "object destroyed");
        dropped
    }

    pub(crate) fn record_dependency(&mut self, dep: Dependency) {
        if let Some(top) = self.deps.last_mut() {
            top.insert(dep);
        }
    }

    // ── Entry points ──────────────────────────────────────────────────────────

    /// Evaluate a whole expression.  `None` (a failed parse) is an error.
    pub fn evaluate(&mut self, expr: Option<&Expr>, ctx: &Context) -> SexpResult {
        let started = Instant::now();
        self.call_stack.clear();
        self.deps.clear();
        let result = match expr {
            Some(e) => self.eval_node(e, ctx, 0),
            None => SexpResult::failure(ErrorKind::ParseError, "no expression to evaluate"),
        };
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        self.stats.evaluations += 1;
        self.stats.total_time_ms += ms;
        if result.is_error() {
            self.stats.errors += 1;
        }
        result.with_evaluation_time(ms)
    }

    /// Evaluate each expression in order; one failure does not stop the rest.
    pub fn evaluate_batch(&mut self, exprs: &[Expr], ctx: &Context) -> Vec<SexpResult> {
        exprs.iter().map(|e| self.evaluate(Some(e), ctx)).collect()
    }

    /// Check that every function the tree calls exists and receives an
    /// acceptable number of arguments, without running anything.
    pub fn pre_validate(&self, expr: Option<&Expr>) -> SexpResult {
        let Some(expr) = expr else {
            return SexpResult::failure(ErrorKind::ParseError, "no expression to validate");
        };
        if expr.depth() > self.max_depth {
            return SexpResult::failure(
                ErrorKind::ResourceExhausted,
                format!("expression nests deeper than {} levels", self.max_depth),
            );
        }
        match self.check_calls(expr) {
            Ok(()) => SexpResult::void(),
            Err(e) => e.into(),
        }
    }

    fn check_calls(&self, expr: &Expr) -> Result<(), SexpError> {
        let Expr::Call { name, args } = expr else { return Ok(()) };
        let Some(entry) = self.registry.borrow().get(name) else {
            return Err(self.undefined_function(name));
        };
        let f = entry.function();
        let n = args.len();
        if n < f.min_args() || f.max_args().is_some_and(|m| n > m) {
            return Err(SexpError::new(
                ErrorKind::ArgumentCountMismatch,
                format!("'{name}' called with {n} arguments, signature is {}", f.signature()),
            ));
        }
        args.iter().try_for_each(|a| self.check_calls(a))
    }

    fn undefined_function(&self, name: &str) -> SexpError {
        let suggestions = self.registry.borrow().suggest(name, 3);
        let err = SexpError::new(ErrorKind::UndefinedFunction, format!("undefined function '{name}'"));
        match suggestions.as_slice() {
            [] => err,
            [only] => err.with_fix(format!("did you mean '{only}'?")),
            many => err.with_fix(format!("did you mean one of: {}?", many.join(", "))),
        }
    }

    // ── Tree walk ─────────────────────────────────────────────────────────────

    pub(crate) fn eval_node(&mut self, expr: &Expr, ctx: &Context, depth: usize) -> SexpResult {
        if depth > self.max_depth {
            return SexpResult::failure(
                ErrorKind::ResourceExhausted,
                format!("maximum evaluation depth of {} exceeded", self.max_depth),
            );
        }
        match expr {
            Expr::Number(n) => SexpResult::number(*n),
            Expr::Str(s) => SexpResult::string(s.clone()),
            Expr::Boolean(b) => SexpResult::boolean(*b),
            Expr::Identifier(name) => SexpResult::string(name.clone()),
            Expr::Variable(name) => self.resolve_variable(name, ctx),
            Expr::Call { name, args } => self.eval_call(expr, name, args, ctx, depth),
        }
    }

    fn resolve_variable(&mut self, name: &str, ctx: &Context) -> SexpResult {
        match ctx.lookup_variable(name) {
            Ok(Some(v)) => return v,
            Ok(None) => {}
            Err(e) => return e.into(),
        }
        let undefined = || SexpResult::failure(ErrorKind::UndefinedVariable, format!("undefined variable '@{name}'"));
        let Some(manager) = self.variables.clone() else { return undefined() };
        let Ok(mut vm) = manager.try_borrow_mut() else {
            return SexpResult::failure(ErrorKind::ContextError, "variable manager is already in use");
        };
        let found = vm.resolve(name);
        if found.error_kind() == Some(ErrorKind::VariableNotFound) {
            undefined()
        } else {
            found
        }
    }

    /// Memoizable: every call in the subtree is cacheable and no `@var`
    /// appears anywhere in it.
    fn is_cacheable_tree(&self, args: &[Expr]) -> bool {
        args.iter().all(|a| match a {
            Expr::Variable(_) => false,
            Expr::Call { name, args } => {
                let cacheable = self.registry.borrow().get(name).is_some_and(|f| f.is_cacheable());
                cacheable && self.is_cacheable_tree(args)
            }
            _ => true,
        })
    }

    fn eval_call(&mut self, expr: &Expr, name: &str, args: &[Expr], ctx: &Context, depth: usize) -> SexpResult {
        trace!(function = name, depth, "call");
        self.drain_changes();

        let found = self.registry.borrow().get(name);
        let Some(entry) = found else {
            return self.undefined_function(name).into();
        };

        // A subtree that could cross the depth limit from here always runs
        // uncached, so a hit never hides a RESOURCE_EXHAUSTED.
        let key = (self.cache_enabled
            && entry.is_cacheable()
            && self.is_cacheable_tree(args)
            && depth + reach(expr) <= self.max_depth)
            .then(|| format!("{}#{}", expr.to_sexp_string(), ctx.scope_key()));
        if let Some(k) = &key {
            if let Some(hit) = self.cache.lookup(k) {
                let inherited = self.cache.dependencies_of(k);
                if let Some(top) = self.deps.last_mut() {
                    top.extend(inherited);
                }
                return hit;
            }
            self.deps.push(BTreeSet::new());
        }

        let result = self.dispatch(&entry, args, ctx, depth);

        if let Some(k) = key {
            let deps = self.deps.pop().unwrap_or_default();
            if let Some(top) = self.deps.last_mut() {
                top.extend(deps.iter().cloned());
            }
            if !result.is_error() {
                self.cache.store(k, result.clone(), deps);
            }
        }
        result
    }

    fn dispatch(&mut self, entry: &FunctionRef, args: &[Expr], ctx: &Context, depth: usize) -> SexpResult {
        self.stats.calls += 1;
        self.call_stack.push(entry.name().to_owned());
        let result = {
            let supported = entry.function().supported_argument_types();
            let mut a = Args::lazy(entry.name(), supported, args, self, ctx, depth + 1);
            entry.execute(&mut a)
        };
        let result = if result.is_error() && result.metadata().stack_trace.is_empty() {
            result.with_stack_trace(self.call_stack.clone())
        } else {
            result
        };
        self.call_stack.pop();
        result
    }
}

/// How many levels below `expr` the walk descends: a call's arguments sit
/// one level down, and an argument-less call descends no further.
fn reach(expr: &Expr) -> usize {
    match expr {
        Expr::Call { args, .. } if !args.is_empty() => 1 + args.iter().map(reach).max().unwrap_or(0),
        _ => 0,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::builtins::register_builtins;
    use crate::script::function::NativeFunction;
    use crate::script::parser::parse;
    use crate::var::Scope;
    use std::cell::Cell;

    fn setup() -> (Evaluator, Context) {
        let registry = Rc::new(RefCell::new(FunctionRegistry::default()));
        register_builtins(&mut registry.borrow_mut());
        (Evaluator::new(registry), Context::new("test", "session"))
    }

    fn run(ev: &mut Evaluator, ctx: &Context, src: &str) -> SexpResult {
        let expr = parse(src).unwrap();
        ev.evaluate(Some(&expr), ctx)
    }

    #[test]
    fn literals() {
        let (mut ev, ctx) = setup();
        assert_eq!(run(&mut ev, &ctx, "42"), SexpResult::number(42.0));
        assert_eq!(run(&mut ev, &ctx, "\"hi\""), SexpResult::string("hi"));
        assert_eq!(run(&mut ev, &ctx, "#t"), SexpResult::boolean(true));
        assert_eq!(run(&mut ev, &ctx, "alpha"), SexpResult::string("alpha"));
    }

    #[test]
    fn nested_calls() {
        let (mut ev, ctx) = setup();
        assert_eq!(run(&mut ev, &ctx, "(+ 1 (* 2 3))"), SexpResult::number(7.0));
    }

    #[test]
    fn null_expression_is_an_error() {
        let (mut ev, ctx) = setup();
        assert_eq!(ev.evaluate(None, &ctx).error_kind(), Some(ErrorKind::ParseError));
        assert_eq!(ev.pre_validate(None).error_kind(), Some(ErrorKind::ParseError));
    }

    #[test]
    fn undefined_function_suggests() {
        let (mut ev, ctx) = setup();
        let r = run(&mut ev, &ctx, "(string-lenght \"abc\")");
        let e = r.error().unwrap();
        assert_eq!(e.kind, ErrorKind::UndefinedFunction);
        assert!(e.suggested_fix.contains("string-length"), "{}", e.suggested_fix);
    }

    #[test]
    fn pre_validate_finds_unknown_functions_without_running() {
        let (ev, _ctx) = setup();
        let ok = parse("(if (> 1 0) (+ 1 2) 0)").unwrap();
        assert_eq!(ev.pre_validate(Some(&ok)), SexpResult::void());
        let bad = parse("(if true (frobnicate 1) 0)").unwrap();
        assert_eq!(ev.pre_validate(Some(&bad)).error_kind(), Some(ErrorKind::UndefinedFunction));
        let arity = parse("(not 1 2)").unwrap();
        assert_eq!(ev.pre_validate(Some(&arity)).error_kind(), Some(ErrorKind::ArgumentCountMismatch));
    }

    #[test]
    fn variables_from_context_and_manager() {
        let registry = Rc::new(RefCell::new(FunctionRegistry::default()));
        register_builtins(&mut registry.borrow_mut());
        let vm = Rc::new(RefCell::new(VariableManager::default()));
        vm.borrow_mut().set_variable(Scope::Campaign, "kills", 4.0).unwrap();
        let mut ev = Evaluator::new(registry).with_variables(Rc::clone(&vm));
        let ctx = Context::new("m", "mission");
        ctx.set_variable("x", 10.0).unwrap();
        assert_eq!(run(&mut ev, &ctx, "(+ @x @kills)"), SexpResult::number(14.0));
        assert_eq!(run(&mut ev, &ctx, "@missing").error_kind(), Some(ErrorKind::UndefinedVariable));
    }

    #[test]
    fn depth_limit() {
        let (ev, ctx) = setup();
        let mut ev = ev.with_max_depth(3);
        assert!(run(&mut ev, &ctx, "(+ 1 (+ 1 1))").is_success());
        let deep = run(&mut ev, &ctx, "(+ 1 (+ 1 (+ 1 (+ 1 (+ 1 1)))))");
        assert_eq!(deep.error_kind(), Some(ErrorKind::ResourceExhausted));
    }

    #[test]
    fn depth_limit_holds_when_the_inner_call_is_cached() {
        let (ev, ctx) = setup();
        let mut ev = ev.with_max_depth(3);
        let deep = "(+ 1 (+ 1 (+ 1 (+ 1 (+ 1 1)))))";
        let fresh = run(&mut ev, &ctx, deep).error_kind();
        assert_eq!(fresh, Some(ErrorKind::ResourceExhausted));

        assert!(run(&mut ev, &ctx, "(+ 1 (+ 1 1))").is_success());
        assert!(run(&mut ev, &ctx, "(+ 1 1)").is_success());
        assert_eq!(run(&mut ev, &ctx, deep).error_kind(), fresh);
    }

    #[test]
    fn shallow_subtrees_still_hit_the_cache_near_the_limit() {
        let (ev, ctx) = setup();
        let mut ev = ev.with_max_depth(3);
        run(&mut ev, &ctx, "(+ 1 1)");
        let r = run(&mut ev, &ctx, "(* 2 (+ 1 1))");
        assert_eq!(r, SexpResult::number(4.0));
        assert_eq!(ev.cache_statistics().hits, 1);
    }

    #[test]
    fn errors_carry_stack_trace() {
        let (mut ev, ctx) = setup();
        let r = run(&mut ev, &ctx, "(+ 1 (/ 1 0))");
        assert_eq!(r.error_kind(), Some(ErrorKind::DivisionByZero));
        assert_eq!(r.metadata().stack_trace, vec!["+".to_owned(), "/".to_owned()]);
    }

    #[test]
    fn pure_calls_are_cached() {
        let (mut ev, ctx) = setup();
        let first = run(&mut ev, &ctx, "(+ 1 2)");
        assert!(!first.is_cache_hit());
        let second = run(&mut ev, &ctx, "(+ 1 2)");
        assert!(second.is_cache_hit());
        assert_eq!(second, SexpResult::number(3.0));
        let stats = ev.cache_statistics();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn variable_references_bypass_cache() {
        let (mut ev, ctx) = setup();
        ctx.set_variable("x", 1.0).unwrap();
        run(&mut ev, &ctx, "(+ @x 1)");
        ctx.set_variable("x", 5.0).unwrap();
        let r = run(&mut ev, &ctx, "(+ @x 1)");
        assert_eq!(r, SexpResult::number(6.0));
        assert!(!r.is_cache_hit());
        assert_eq!(ev.cache_len(), 0);
    }

    #[test]
    fn manager_backed_references_are_never_cached() {
        let registry = Rc::new(RefCell::new(FunctionRegistry::default()));
        register_builtins(&mut registry.borrow_mut());
        let vm = Rc::new(RefCell::new(VariableManager::default()));
        vm.borrow_mut().set_variable(Scope::Campaign, "kills", 4.0).unwrap();
        let mut ev = Evaluator::new(registry).with_variables(Rc::clone(&vm));
        let ctx = Context::new("m", "mission");

        assert_eq!(run(&mut ev, &ctx, "(+ @kills 1)"), SexpResult::number(5.0));
        assert_eq!(ev.cache_len(), 0);
        vm.borrow_mut().set_variable(Scope::Campaign, "kills", 9.0).unwrap();
        let r = run(&mut ev, &ctx, "(+ @kills 1)");
        assert_eq!(r, SexpResult::number(10.0));
        assert!(!r.is_cache_hit());
    }

    #[test]
    fn manager_reads_are_dependencies() {
        let registry = Rc::new(RefCell::new(FunctionRegistry::default()));
        register_builtins(&mut registry.borrow_mut());
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        registry.borrow_mut().register(
            Box::new(NativeFunction::new("difficulty-bonus", move |args| {
                counter.set(counter.get() + 1);
                args.depend_on(Dependency::Variable("difficulty".to_owned()));
                let level = args.with_variables(|vm| vm.resolve("difficulty"))?;
                Ok(SexpResult::number(level.as_number()? * 10.0))
            })),
            &[],
        );
        let vm = Rc::new(RefCell::new(VariableManager::default()));
        vm.borrow_mut().set_variable(Scope::Global, "difficulty", 2.0).unwrap();
        let mut ev = Evaluator::new(registry).with_variables(Rc::clone(&vm));
        let ctx = Context::new("m", "mission");

        assert_eq!(run(&mut ev, &ctx, "(+ 1 (difficulty-bonus))"), SexpResult::number(21.0));
        assert!(run(&mut ev, &ctx, "(+ 1 (difficulty-bonus))").is_cache_hit());
        assert_eq!(calls.get(), 1);

        vm.borrow_mut().set_variable(Scope::Global, "difficulty", 3.0).unwrap();
        let r = run(&mut ev, &ctx, "(+ 1 (difficulty-bonus))");
        assert_eq!(r, SexpResult::number(31.0));
        assert!(!r.is_cache_hit());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn object_notifications_invalidate() {
        let registry = Rc::new(RefCell::new(FunctionRegistry::default()));
        registry.borrow_mut().register(
            Box::new(NativeFunction::new("ship-alive", |args| {
                let ok = args.object("ship").is_ok();
                Ok(SexpResult::boolean(ok))
            })),
            &[],
        );
        let mut ev = Evaluator::new(registry);
        let ctx = Context::new("m", "mission");
        let ship = Rc::new(1u8);
        ctx.set_object_reference("ship", crate::script::value::ObjectRef::new("ship", &ship)).unwrap();

        assert_eq!(run(&mut ev, &ctx, "(ship-alive)"), SexpResult::boolean(true));
        assert!(run(&mut ev, &ctx, "(ship-alive)").is_cache_hit());
        drop(ship);
        assert_eq!(ev.notify_object_destroyed("ship"), 1);
        assert_eq!(run(&mut ev, &ctx, "(ship-alive)"), SexpResult::boolean(false));
    }

    #[test]
    fn cache_can_be_disabled() {
        let (mut ev, ctx) = setup();
        ev.set_cache_enabled(false);
        run(&mut ev, &ctx, "(+ 1 2)");
        assert!(!run(&mut ev, &ctx, "(+ 1 2)").is_cache_hit());
    }

    #[test]
    fn batch_continues_after_errors() {
        let (mut ev, ctx) = setup();
        let exprs = vec![parse("(+ 1 1)").unwrap(), parse("(/ 1 0)").unwrap(), parse("(* 2 2)").unwrap()];
        let out = ev.evaluate_batch(&exprs, &ctx);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], SexpResult::number(2.0));
        assert!(out[1].is_error());
        assert_eq!(out[2], SexpResult::number(4.0));
        let stats = ev.statistics();
        assert_eq!(stats.evaluations, 3);
        assert_eq!(stats.errors, 1);
    }
}
