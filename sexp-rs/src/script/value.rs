//! The SEXP result type.
//!
//! Every evaluation step produces a [`SexpResult`]: a tagged [`Value`] plus
//! diagnostic [`Metadata`].  Failures are values too: the
//! [`Value::Error`] variant carries a [`SexpError`] from a flat
//! [`ErrorKind`] taxonomy. Nothing in the engine unwinds on bad input.
//!
//! Conversions follow the mission-scripting conventions: numeric `0` is
//! false and anything else true, the empty string is false, and booleans
//! map to `1`/`0` and `"true"`/`"false"`.

use std::any::Any;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── ErrorKind ─────────────────────────────────────────────────────────────────

/// Error taxonomy.  Deliberately flat: callers match on the kind, never on
/// a hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    SyntaxError,
    TypeMismatch,
    UndefinedVariable,
    UndefinedFunction,
    ArgumentCountMismatch,
    RuntimeError,
    ObjectNotFound,
    ParseError,
    ValidationError,
    ContextError,
    DivisionByZero,
    IndexOutOfBounds,
    PermissionDenied,
    ResourceExhausted,
    VariableNotFound,
}

impl ErrorKind {
    /// The upper-case name used in diagnostics (e.g. `"TYPE_MISMATCH"`).
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::SyntaxError           => "SYNTAX_ERROR",
            ErrorKind::TypeMismatch          => "TYPE_MISMATCH",
            ErrorKind::UndefinedVariable     => "UNDEFINED_VARIABLE",
            ErrorKind::UndefinedFunction     => "UNDEFINED_FUNCTION",
            ErrorKind::ArgumentCountMismatch => "ARGUMENT_COUNT_MISMATCH",
            ErrorKind::RuntimeError          => "RUNTIME_ERROR",
            ErrorKind::ObjectNotFound        => "OBJECT_NOT_FOUND",
            ErrorKind::ParseError            => "PARSE_ERROR",
            ErrorKind::ValidationError       => "VALIDATION_ERROR",
            ErrorKind::ContextError          => "CONTEXT_ERROR",
            ErrorKind::DivisionByZero        => "DIVISION_BY_ZERO",
            ErrorKind::IndexOutOfBounds      => "INDEX_OUT_OF_BOUNDS",
            ErrorKind::PermissionDenied      => "PERMISSION_DENIED",
            ErrorKind::ResourceExhausted     => "RESOURCE_EXHAUSTED",
            ErrorKind::VariableNotFound      => "VARIABLE_NOT_FOUND",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── SexpError ─────────────────────────────────────────────────────────────────

/// Where in the source text an error was detected (1-based line/column).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Location {
    /// Byte offset into the source text.
    pub position: usize,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(position: usize, line: u32, column: u32) -> Self {
        Location { position, line, column }
    }
}

/// Payload of an ERROR result.
///
/// Plain errors only carry `kind` and `message`; contextual errors (syntax
/// errors, mostly) add the offending source fragment, a location, and a
/// suggested fix for tooling.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct SexpError {
    pub kind: ErrorKind,
    pub message: String,
    /// Source fragment or other free-form context; empty when unknown.
    pub context: String,
    pub location: Option<Location>,
    /// Human-readable fix hint; empty when none applies.
    pub suggested_fix: String,
}

impl SexpError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        SexpError {
            kind,
            message: message.into(),
            context: String::new(),
            location: None,
            suggested_fix: String::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = fix.into();
        self
    }

    /// A TYPE_MISMATCH naming what was expected and what was found.
    pub fn type_mismatch(expected: &str, found: ResultType) -> Self {
        SexpError::new(
            ErrorKind::TypeMismatch,
            format!("expected {expected}, found {}", found.name()),
        )
    }

    /// `true` if this error carries position information.
    pub fn is_contextual(&self) -> bool {
        self.location.is_some()
    }
}

// ── ResultType ────────────────────────────────────────────────────────────────

/// The variant tag of a [`Value`], used for signatures and constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    Number,
    String,
    Boolean,
    Void,
    Error,
    ObjectReference,
}

impl ResultType {
    pub fn name(self) -> &'static str {
        match self {
            ResultType::Number          => "number",
            ResultType::String          => "string",
            ResultType::Boolean         => "boolean",
            ResultType::Void            => "void",
            ResultType::Error           => "error",
            ResultType::ObjectReference => "object",
        }
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── ObjectRef ─────────────────────────────────────────────────────────────────

/// A weak handle to a live game object owned elsewhere.
///
/// The engine never keeps referenced objects alive: once the owner drops
/// the last `Rc`, the handle reports itself dead and lookups through it
/// fail with OBJECT_NOT_FOUND.
#[derive(Clone)]
pub struct ObjectRef {
    id: String,
    target: Weak<dyn Any>,
}

impl ObjectRef {
    pub fn new<T: Any>(id: impl Into<String>, target: &Rc<T>) -> Self {
        let weak: Weak<T> = Rc::downgrade(target);
        let target: Weak<dyn Any> = weak;
        ObjectRef { id: id.into(), target }
    }

    /// A handle with no target, e.g. restored from a snapshot before the
    /// host has re-bound the object.
    pub fn detached(id: impl Into<String>) -> Self {
        let target: Weak<dyn Any> = Weak::<()>::new();
        ObjectRef { id: id.into(), target }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }

    pub fn upgrade(&self) -> Option<Rc<dyn Any>> {
        self.target.upgrade()
    }

    /// Upgrade and downcast to the concrete object type.
    pub fn downcast<T: Any>(&self) -> Option<Rc<T>> {
        self.target.upgrade()?.downcast::<T>().ok()
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && std::ptr::addr_eq(self.target.as_ptr(), other.target.as_ptr())
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ── Value ─────────────────────────────────────────────────────────────────────

/// The tagged payload of a [`SexpResult`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Str(String),
    Boolean(bool),
    Void,
    Error(SexpError),
    Object(ObjectRef),
}

impl Value {
    pub fn result_type(&self) -> ResultType {
        match self {
            Value::Number(_)  => ResultType::Number,
            Value::Str(_)     => ResultType::String,
            Value::Boolean(_) => ResultType::Boolean,
            Value::Void       => ResultType::Void,
            Value::Error(_)   => ResultType::Error,
            Value::Object(_)  => ResultType::ObjectReference,
        }
    }
}

/// Format a number the way SEXP source spells it: integral values without
/// a fractional part, everything else in shortest round-trip form.
pub fn format_number(n: f64) -> String {
    format!("{n}")
}

// ── Metadata ──────────────────────────────────────────────────────────────────

/// Diagnostic data attached to a result.  Never part of result equality.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub evaluation_time_ms: f64,
    pub cache_hit: bool,
    /// Function names from the outermost call inwards.
    pub stack_trace: Vec<String>,
}

// ── SexpResult ────────────────────────────────────────────────────────────────

/// An immutable evaluation result.
///
/// New results are always constructed rather than mutated; the only
/// mutators are the `with_*` metadata setters, which exist purely for
/// diagnostics.  Equality compares the [`Value`] only.
#[derive(Debug, Clone)]
pub struct SexpResult {
    value: Value,
    meta: Metadata,
}

impl PartialEq for SexpResult {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl From<Value> for SexpResult {
    fn from(value: Value) -> Self {
        SexpResult { value, meta: Metadata::default() }
    }
}

impl From<SexpError> for SexpResult {
    fn from(err: SexpError) -> Self {
        Value::Error(err).into()
    }
}

impl From<f64> for SexpResult {
    fn from(n: f64) -> Self {
        SexpResult::number(n)
    }
}

impl From<bool> for SexpResult {
    fn from(b: bool) -> Self {
        SexpResult::boolean(b)
    }
}

impl From<&str> for SexpResult {
    fn from(s: &str) -> Self {
        SexpResult::string(s)
    }
}

impl From<String> for SexpResult {
    fn from(s: String) -> Self {
        SexpResult::string(s)
    }
}

impl SexpResult {
    // ── Factories ─────────────────────────────────────────────────────────────

    pub fn number(n: f64) -> Self {
        Value::Number(n).into()
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::Str(s.into()).into()
    }

    pub fn boolean(b: bool) -> Self {
        Value::Boolean(b).into()
    }

    pub fn void() -> Self {
        Value::Void.into()
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        SexpError::new(kind, message).into()
    }

    /// An error carrying source context, position and a fix hint.
    pub fn contextual_error(
        kind: ErrorKind,
        message: impl Into<String>,
        context: impl Into<String>,
        location: Location,
        suggested_fix: impl Into<String>,
    ) -> Self {
        SexpError::new(kind, message)
            .with_context(context)
            .at(location)
            .with_fix(suggested_fix)
            .into()
    }

    pub fn object(handle: ObjectRef) -> Self {
        Value::Object(handle).into()
    }

    // ── Inspection ────────────────────────────────────────────────────────────

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn result_type(&self) -> ResultType {
        self.value.result_type()
    }

    pub fn is_success(&self) -> bool {
        !self.is_error()
    }

    pub fn is_error(&self) -> bool {
        matches!(self.value, Value::Error(_))
    }

    pub fn error(&self) -> Option<&SexpError> {
        match &self.value {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error().map(|e| e.kind)
    }

    /// Split into `Ok(self)` or `Err(error)` so callers can use `?`.
    pub fn into_result(self) -> Result<SexpResult, SexpError> {
        match self.value {
            Value::Error(e) => Err(e),
            value => Ok(SexpResult { value, meta: self.meta }),
        }
    }

    // ── Coercing accessors ────────────────────────────────────────────────────

    /// Numeric view.  Booleans map to `1`/`0`; strings must parse as a
    /// finite number.
    pub fn as_number(&self) -> Result<f64, SexpError> {
        match &self.value {
            Value::Number(n) => Ok(*n),
            Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(n),
                _ => Err(SexpError::new(
                    ErrorKind::TypeMismatch,
                    format!("cannot convert string \"{s}\" to number"),
                )),
            },
            Value::Error(e) => Err(e.clone()),
            other => Err(SexpError::type_mismatch("number", other.result_type())),
        }
    }

    pub fn as_string(&self) -> Result<String, SexpError> {
        match &self.value {
            Value::Str(s) => Ok(s.clone()),
            Value::Number(n) => Ok(format_number(*n)),
            Value::Boolean(b) => Ok(if *b { "true" } else { "false" }.to_owned()),
            Value::Error(e) => Err(e.clone()),
            other => Err(SexpError::type_mismatch("string", other.result_type())),
        }
    }

    /// Truthiness: nonzero numbers and non-empty strings are true, VOID is
    /// false.
    pub fn as_boolean(&self) -> Result<bool, SexpError> {
        match &self.value {
            Value::Boolean(b) => Ok(*b),
            Value::Number(n) => Ok(*n != 0.0),
            Value::Str(s) => Ok(!s.is_empty()),
            Value::Void => Ok(false),
            Value::Error(e) => Err(e.clone()),
            Value::Object(_) => Err(SexpError::type_mismatch("boolean", ResultType::ObjectReference)),
        }
    }

    /// The object handle; a dead handle is OBJECT_NOT_FOUND.
    pub fn as_object(&self) -> Result<ObjectRef, SexpError> {
        match &self.value {
            Value::Object(o) if o.is_alive() => Ok(o.clone()),
            Value::Object(o) => Err(SexpError::new(
                ErrorKind::ObjectNotFound,
                format!("object '{}' no longer exists", o.id()),
            )),
            Value::Error(e) => Err(e.clone()),
            other => Err(SexpError::type_mismatch("object", other.result_type())),
        }
    }

    // ── Guards ────────────────────────────────────────────────────────────────
    //
    // Each guard passes errors through untouched, so they chain:
    // `r.validate_type(ResultType::Number).validate_number_range(0.0, 1.0)`.

    pub fn validate_type(self, expected: ResultType) -> Self {
        if self.is_error() || self.result_type() == expected {
            self
        } else {
            SexpError::type_mismatch(expected.name(), self.result_type()).into()
        }
    }

    pub fn validate_number_range(self, min: f64, max: f64) -> Self {
        if self.is_error() {
            return self;
        }
        match self.as_number() {
            Ok(n) if (min..=max).contains(&n) => self,
            Ok(n) => SexpResult::failure(
                ErrorKind::ValidationError,
                format!("{} is outside the range [{}, {}]", format_number(n), format_number(min), format_number(max)),
            ),
            Err(e) => e.into(),
        }
    }

    pub fn validate_not_null(self) -> Self {
        match &self.value {
            Value::Void => SexpResult::failure(ErrorKind::ValidationError, "value is void"),
            Value::Object(o) if !o.is_alive() => SexpResult::failure(
                ErrorKind::ObjectNotFound,
                format!("object '{}' no longer exists", o.id()),
            ),
            _ => self,
        }
    }

    // ── Metadata ──────────────────────────────────────────────────────────────

    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    pub fn is_cache_hit(&self) -> bool {
        self.meta.cache_hit
    }

    pub fn with_cache_hit(mut self, hit: bool) -> Self {
        self.meta.cache_hit = hit;
        self
    }

    pub fn with_evaluation_time(mut self, ms: f64) -> Self {
        self.meta.evaluation_time_ms = ms;
        self
    }

    pub fn with_stack_trace(mut self, trace: Vec<String>) -> Self {
        self.meta.stack_trace = trace;
        self
    }
}

impl fmt::Display for SexpResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::Str(s) => f.write_str(s),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Void => f.write_str("void"),
            Value::Error(e) => write!(f, "error: {e}"),
            Value::Object(o) => write!(f, "<object {}>", o.id()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(SexpResult::number(5.0).to_string(), "5");
        assert_eq!(SexpResult::number(2.5).to_string(), "2.5");
        assert_eq!(SexpResult::boolean(true).to_string(), "true");
        assert_eq!(SexpResult::string("hi").to_string(), "hi");
        assert_eq!(SexpResult::void().to_string(), "void");
    }

    #[test]
    fn truthiness() {
        assert!(!SexpResult::number(0.0).as_boolean().unwrap());
        assert!(SexpResult::number(-0.5).as_boolean().unwrap());
        assert!(!SexpResult::string("").as_boolean().unwrap());
        assert!(SexpResult::string("false").as_boolean().unwrap());
        assert!(!SexpResult::void().as_boolean().unwrap());
    }

    #[test]
    fn boolean_conversions() {
        assert_eq!(SexpResult::boolean(true).as_number().unwrap(), 1.0);
        assert_eq!(SexpResult::boolean(false).as_number().unwrap(), 0.0);
        assert_eq!(SexpResult::boolean(false).as_string().unwrap(), "false");
    }

    #[test]
    fn string_to_number() {
        assert_eq!(SexpResult::string(" 42 ").as_number().unwrap(), 42.0);
        let err = SexpResult::string("abc").as_number().unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
        assert!(SexpResult::string("NaN").as_number().is_err());
    }

    #[test]
    fn void_is_not_a_number() {
        let err = SexpResult::void().as_number().unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
    }

    #[test]
    fn error_accessors_propagate() {
        let r = SexpResult::failure(ErrorKind::DivisionByZero, "x");
        assert!(r.is_error());
        assert_eq!(r.as_number().unwrap_err().kind, ErrorKind::DivisionByZero);
        assert_eq!(r.error_kind(), Some(ErrorKind::DivisionByZero));
        assert_eq!(r.error().map(|e| e.message.as_str()), Some("x"));
        assert!(SexpResult::number(1.0).error().is_none());
    }

    #[test]
    fn contextual_errors_keep_their_fix() {
        let r = SexpResult::contextual_error(
            ErrorKind::SyntaxError,
            "unclosed call",
            "(+ 1 2",
            Location::default(),
            "add a closing parenthesis",
        );
        let e = r.error().unwrap();
        assert_eq!(e.kind, ErrorKind::SyntaxError);
        assert_eq!(e.suggested_fix, "add a closing parenthesis");
    }

    #[test]
    fn guards_chain() {
        let ok = SexpResult::number(0.5)
            .validate_type(ResultType::Number)
            .validate_number_range(0.0, 1.0);
        assert_eq!(ok, SexpResult::number(0.5));

        let out = SexpResult::number(3.0).validate_number_range(0.0, 1.0);
        assert_eq!(out.error_kind(), Some(ErrorKind::ValidationError));

        let wrong = SexpResult::string("x").validate_type(ResultType::Number);
        assert_eq!(wrong.error_kind(), Some(ErrorKind::TypeMismatch));

        // The first failure wins.
        let first = SexpResult::string("x")
            .validate_type(ResultType::Boolean)
            .validate_not_null();
        assert_eq!(first.error_kind(), Some(ErrorKind::TypeMismatch));
    }

    #[test]
    fn contextual_error_fields() {
        let r = SexpResult::contextual_error(
            ErrorKind::SyntaxError,
            "missing ')'",
            "(+ 1 2",
            Location::new(6, 1, 7),
            "add a closing parenthesis",
        );
        let e = r.error().unwrap();
        assert!(e.is_contextual());
        assert_eq!(e.location.unwrap().column, 7);
        assert_eq!(e.suggested_fix, "add a closing parenthesis");
        assert_eq!(e.to_string(), "SYNTAX_ERROR: missing ')'");
    }

    #[test]
    fn metadata_not_part_of_equality() {
        let a = SexpResult::number(1.0).with_cache_hit(true).with_evaluation_time(3.0);
        assert_eq!(a, SexpResult::number(1.0));
        assert!(a.is_cache_hit());
    }

    #[test]
    fn object_handles_are_weak() {
        let ship = Rc::new(String::from("GTC Aquitaine"));
        let handle = ObjectRef::new("aquitaine", &ship);
        let r = SexpResult::object(handle.clone());
        assert!(r.as_object().is_ok());
        assert_eq!(handle.downcast::<String>().unwrap().as_str(), "GTC Aquitaine");
        drop(ship);
        assert!(!handle.is_alive());
        assert_eq!(r.as_object().unwrap_err().kind, ErrorKind::ObjectNotFound);
        assert_eq!(r.validate_not_null().error_kind(), Some(ErrorKind::ObjectNotFound));
    }

    #[test]
    fn detached_handle_is_dead() {
        assert!(!ObjectRef::detached("x").is_alive());
    }
}
