//! The engine facade: one registry, one variable manager and one evaluator
//! wired together, behind the text-in / result-out surface callers use.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::config::{EngineConfig, SeedVariable};
use crate::script::builtins::register_builtins;
use crate::script::cache::{CacheStatistics, LruCache};
use crate::script::context::Context;
use crate::script::evaluator::Evaluator;
use crate::script::function::SexpFunction;
use crate::script::lexer::{Diagnostic, Lexer, Token};
use crate::script::parser::{self, parse_with, Expr, ParseOptions, SyntaxReport};
use crate::script::registry::FunctionRegistry;
use crate::script::value::{Location, SexpError, SexpResult};
use crate::store::{StoreError, VariableStore};
use crate::var::{Scope, VariableManager};

/// Parse trees kept by source text.
pub const PARSE_CACHE_CAPACITY: usize = 256;

pub struct Engine {
    config: EngineConfig,
    options: ParseOptions,
    registry: Rc<RefCell<FunctionRegistry>>,
    variables: Rc<RefCell<VariableManager>>,
    evaluator: Evaluator,
    parsed: LruCache<String, Option<Expr>>,
    global: Context,
}

impl Engine {
    /// Build an engine from `config`, loading persisted variables from
    /// `config.storage_dir` when one is set.
    pub fn new(config: &EngineConfig) -> Result<Self, StoreError> {
        let manager = match &config.storage_dir {
            Some(dir) => VariableManager::with_store(
                config.variable_cache_capacity,
                config.max_scope_variables,
                VariableStore::new(dir),
            )?,
            None => VariableManager::new(config.variable_cache_capacity, config.max_scope_variables),
        };
        Ok(Self::assemble(config, manager))
    }

    /// An engine without persistence, whatever `config.storage_dir` says.
    pub fn in_memory(config: &EngineConfig) -> Self {
        let manager = VariableManager::new(config.variable_cache_capacity, config.max_scope_variables);
        Self::assemble(config, manager)
    }

    fn assemble(config: &EngineConfig, manager: VariableManager) -> Self {
        let mut registry = FunctionRegistry::new(config.case_sensitive, config.registry_cache_capacity);
        let builtins = register_builtins(&mut registry);
        let registry = Rc::new(RefCell::new(registry));
        let variables = Rc::new(RefCell::new(manager));

        let mut evaluator = Evaluator::new(Rc::clone(&registry))
            .with_variables(Rc::clone(&variables))
            .with_cache_capacity(config.cache_capacity)
            .with_max_depth(config.max_evaluation_depth);
        evaluator.set_cache_enabled(config.cache_enabled);

        debug!(
            builtins,
            cache = config.cache_enabled,
            persistent = config.storage_dir.is_some(),
            "engine ready"
        );

        Engine {
            config: config.clone(),
            options: config.parse_options(),
            registry,
            variables,
            evaluator,
            parsed: LruCache::new(PARSE_CACHE_CAPACITY),
            global: Context::new("global", "global").with_max_variables(config.max_context_variables),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Rc<RefCell<FunctionRegistry>> {
        &self.registry
    }

    pub fn variables(&self) -> &Rc<RefCell<VariableManager>> {
        &self.variables
    }

    pub fn evaluator(&mut self) -> &mut Evaluator {
        &mut self.evaluator
    }

    /// The context used when a caller does not supply one.
    pub fn global_context(&self) -> &Context {
        &self.global
    }

    // ── Parse / validate ──────────────────────────────────────────────────────

    /// Parse `text`, reusing the tree from an earlier parse of the same text.
    pub fn parse_expression(&mut self, text: &str) -> Option<Expr> {
        if let Some(hit) = self.parsed.get(text) {
            return hit.clone();
        }
        let outcome = parse_with(text, &self.options);
        if outcome.expr.is_none() {
            debug!(text, errors = outcome.errors().count(), "parse failed");
        }
        self.parsed.insert(text.to_owned(), outcome.expr.clone());
        outcome.expr
    }

    pub fn validate_syntax(&self, text: &str) -> bool {
        self.syntax_report(text).is_valid
    }

    pub fn get_validation_errors(&self, text: &str) -> Vec<String> {
        self.syntax_report(text).error_messages()
    }

    pub fn syntax_report(&self, text: &str) -> SyntaxReport {
        parser::validate_syntax(text, &self.options)
    }

    pub fn tokenize_expression(&self, text: &str) -> Vec<Token> {
        Lexer::new(text).with_max_token_length(self.options.max_token_length).tokenize().tokens
    }

    // ── Evaluation ────────────────────────────────────────────────────────────

    /// Evaluate a parsed expression in `context`, or in the global context.
    pub fn evaluate_expression(&mut self, expr: Option<&Expr>, context: Option<&Context>) -> SexpResult {
        let ctx = context.unwrap_or(&self.global).clone();
        self.evaluator.evaluate(expr, &ctx)
    }

    /// Parse and evaluate `text`.  Syntax errors come back as a
    /// SYNTAX_ERROR result carrying the first diagnostic.
    pub fn evaluate_str(&mut self, text: &str, context: Option<&Context>) -> SexpResult {
        match self.parse_expression(text) {
            Some(expr) => self.evaluate_expression(Some(&expr), context),
            None => self.syntax_error(text).into(),
        }
    }

    /// Check the functions `text` calls without running anything.
    pub fn pre_validate(&mut self, text: &str) -> SexpResult {
        match self.parse_expression(text) {
            Some(expr) => self.evaluator.pre_validate(Some(&expr)),
            None => self.syntax_error(text).into(),
        }
    }

    fn syntax_error(&self, text: &str) -> SexpError {
        parse_with(text, &self.options)
            .errors()
            .next()
            .map(|d| d.to_error(text))
            .unwrap_or_else(|| {
                Diagnostic::error("invalid expression", Location::new(0, 1, 1)).to_error(text)
            })
    }

    /// A fresh root context sized by the configuration.
    pub fn create_context(&self, id: &str, kind: &str) -> Context {
        Context::new(id, kind).with_max_variables(self.config.max_context_variables)
    }

    pub fn get_cache_statistics(&self) -> CacheStatistics {
        self.evaluator.cache_statistics()
    }

    // ── Functions ─────────────────────────────────────────────────────────────

    /// Add (or replace) a function.  Drops every cached result.
    pub fn register_function(&mut self, function: Box<dyn SexpFunction>, aliases: &[&str]) -> bool {
        let added = self.registry.borrow_mut().register(function, aliases);
        if added {
            self.evaluator.clear_cache();
        }
        added
    }

    // ── Variables ─────────────────────────────────────────────────────────────

    pub fn set_variable(&mut self, scope: Scope, name: &str, value: impl Into<SexpResult>) -> Result<(), SexpError> {
        self.variables.borrow_mut().set_variable(scope, name, value)
    }

    pub fn get_variable(&mut self, scope: Scope, name: &str) -> SexpResult {
        self.variables.borrow_mut().get_variable(scope, name)
    }

    /// Apply `/var` lines from a `.sexprc`.  Returns the rejected ones.
    pub fn seed_variables(&mut self, seeds: &[SeedVariable]) -> Vec<(String, SexpError)> {
        let mut rejected = Vec::new();
        for seed in seeds {
            if let Err(e) = self.set_variable(seed.scope, &seed.name, seed.value.clone()) {
                rejected.push((seed.name.clone(), e));
            }
        }
        rejected
    }

    /// Write CAMPAIGN and GLOBAL variables to storage.
    pub fn save(&self) -> Result<usize, StoreError> {
        let written = self.variables.borrow().save()?;
        debug!(written, "variables saved");
        Ok(written)
    }

    /// Re-read CAMPAIGN and GLOBAL from storage.  Reloading fires no change
    /// events, so the expression cache is dropped wholesale.
    pub fn reload(&mut self) -> Result<usize, StoreError> {
        let loaded = self.variables.borrow_mut().reload()?;
        self.evaluator.clear_cache();
        Ok(loaded)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
