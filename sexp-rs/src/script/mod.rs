//! SEXP expression engine.
//!
//! The pipeline, front to back:
//!
//! - [`lexer`]: source text → tokens with line/column positions
//! - [`parser`]: tokens → [`Expr`] trees, plus a tree-less syntax validator
//! - [`evaluator`]: trees → [`SexpResult`]s, with an LRU [`cache`] of pure calls
//! - [`registry`] / [`function`]: the callable functions and their pipeline
//! - [`context`]: scoped variable and object bindings
//! - [`builtins`]: arithmetic, comparison, logic, conditionals, strings,
//!   variables
//!
//! # Quick start
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use sexp::script::{parse, register_builtins, Context, Evaluator, FunctionRegistry, SexpResult};
//!
//! let registry = Rc::new(RefCell::new(FunctionRegistry::default()));
//! register_builtins(&mut registry.borrow_mut());
//! let mut eval = Evaluator::new(registry);
//! let ctx = Context::new("mission", "mission");
//! let expr = parse("(+ 2 3)").unwrap();
//! assert_eq!(eval.evaluate(Some(&expr), &ctx), SexpResult::number(5.0));
//! ```

pub mod builtins;
pub mod cache;
pub mod context;
pub mod evaluator;
pub mod function;
pub mod lexer;
pub mod parser;
pub mod registry;
pub mod value;

pub use builtins::register_builtins;
pub use cache::{CacheEvent, CacheStatistics, Dependency};
pub use context::{Context, ContextSnapshot};
pub use evaluator::Evaluator;
pub use function::{Args, FunctionEntry, FunctionRef, NativeFunction, SexpFunction};
pub use lexer::{tokenize, Token, TokenKind};
pub use parser::{parse, validate_syntax, Expr, ParseOptions};
pub use registry::{FunctionRegistry, MatchKind, SearchKind, SearchMatch};
pub use value::{ErrorKind, ObjectRef, ResultType, SexpError, SexpResult, Value};
