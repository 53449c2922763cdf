//! SEXP: a Lisp-style expression engine for mission scripting.
//!
//! Mission designers write conditions and actions as S-expressions such as
//! `(if (> @kills 5) "win" "keep going")`.  The [`script`] module turns that
//! text into trees and evaluates them; the crate root adds scoped variables
//! with persistence ([`var`], [`store`]), configuration ([`config`]) and a
//! one-stop [`Engine`].

pub mod cli;
pub mod config;
pub mod engine;
pub mod notify;
pub mod script;
pub mod store;
pub mod suggest;
pub mod var;

pub use config::{Config, ConfigError, EngineConfig};
pub use engine::Engine;
pub use notify::{ChangeKind, VariableEvent};
pub use script::{Context, ErrorKind, Expr, SexpError, SexpFunction, SexpResult};
pub use store::{StoreError, VariableStore};
pub use var::{Constraints, Scope, VariableManager};
