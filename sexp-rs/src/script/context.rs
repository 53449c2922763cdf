//! Evaluation contexts.
//!
//! A [`Context`] is a cheap, clonable handle to one node of a scope tree.
//! Variable lookup walks from the node up through its ancestors; a
//! context's own bindings are never visible to its parent.  Children hold
//! their parent weakly, so a dropped parent surfaces as a CONTEXT_ERROR on
//! lookup instead of being kept alive.
//!
//! Object references are weak too: a context records *which* object a name
//! refers to but never keeps the object alive.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::lexer::is_identifier;
use super::value::{ErrorKind, ObjectRef, SexpError, SexpResult};
use crate::store::{StoreError, StoredValue};

pub const DEFAULT_MAX_VARIABLES: usize = 1024;

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

struct ContextData {
    id: String,
    kind: String,
    scope_key: u64,
    parent: Option<Weak<RefCell<ContextData>>>,
    variables: BTreeMap<String, SexpResult>,
    objects: BTreeMap<String, ObjectRef>,
    locked: bool,
    read_only: bool,
    max_variables: usize,
}

#[derive(Clone)]
pub struct Context(Rc<RefCell<ContextData>>);

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.0.borrow();
        f.debug_struct("Context")
            .field("id", &d.id)
            .field("kind", &d.kind)
            .field("variables", &d.variables.len())
            .field("objects", &d.objects.len())
            .field("locked", &d.locked)
            .field("read_only", &d.read_only)
            .finish()
    }
}

impl Context {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::build(id.into(), kind.into(), None, DEFAULT_MAX_VARIABLES)
    }

    fn build(id: String, kind: String, parent: Option<Weak<RefCell<ContextData>>>, max_variables: usize) -> Self {
        Context(Rc::new(RefCell::new(ContextData {
            id,
            kind,
            scope_key: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
            parent,
            variables: BTreeMap::new(),
            objects: BTreeMap::new(),
            locked: false,
            read_only: false,
            max_variables,
        })))
    }

    pub fn with_max_variables(self, max: usize) -> Self {
        self.0.borrow_mut().max_variables = max;
        self
    }

    /// A new scope whose lookups fall back to this one.
    pub fn create_child_context(&self, id: impl Into<String>, kind: impl Into<String>) -> Context {
        let max = self.0.borrow().max_variables;
        Self::build(id.into(), kind.into(), Some(Rc::downgrade(&self.0)), max)
    }

    pub fn id(&self) -> String {
        self.0.borrow().id.clone()
    }

    pub fn kind(&self) -> String {
        self.0.borrow().kind.clone()
    }

    /// Unique per context instance; distinguishes cache entries.
    pub fn scope_key(&self) -> u64 {
        self.0.borrow().scope_key
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// `Ok(None)` for a root; CONTEXT_ERROR when the parent was dropped.
    pub fn parent(&self) -> Result<Option<Context>, SexpError> {
        let d = self.0.borrow();
        match &d.parent {
            None => Ok(None),
            Some(weak) => weak.upgrade().map(|rc| Some(Context(rc))).ok_or_else(|| {
                SexpError::new(ErrorKind::ContextError, format!("parent of context '{}' no longer exists", d.id))
            }),
        }
    }

    /// Number of ancestors still reachable.
    pub fn depth(&self) -> usize {
        let mut n = 0;
        let mut cur = self.parent().ok().flatten();
        while let Some(c) = cur {
            n += 1;
            cur = c.parent().ok().flatten();
        }
        n
    }

    pub fn lock(&self) {
        self.0.borrow_mut().locked = true;
    }

    pub fn unlock(&self) {
        self.0.borrow_mut().locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.0.borrow().locked
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.0.borrow_mut().read_only = read_only;
    }

    pub fn is_read_only(&self) -> bool {
        self.0.borrow().read_only
    }

    fn check_writable(d: &ContextData) -> Result<(), SexpError> {
        if d.locked {
            Err(SexpError::new(ErrorKind::PermissionDenied, format!("context '{}' is locked", d.id)))
        } else if d.read_only {
            Err(SexpError::new(ErrorKind::PermissionDenied, format!("context '{}' is read-only", d.id)))
        } else {
            Ok(())
        }
    }

    // ── Variables ─────────────────────────────────────────────────────────────

    /// Bind `name` in this context.
    pub fn set_variable(&self, name: &str, value: impl Into<SexpResult>) -> Result<(), SexpError> {
        if !is_identifier(name) {
            return Err(SexpError::new(ErrorKind::ValidationError, format!("invalid variable name '{name}'")));
        }
        let mut d = self.0.borrow_mut();
        Self::check_writable(&d)?;
        if !d.variables.contains_key(name) && d.variables.len() >= d.max_variables {
            return Err(SexpError::new(
                ErrorKind::ResourceExhausted,
                format!("context '{}' holds the maximum of {} variables", d.id, d.max_variables),
            ));
        }
        d.variables.insert(name.to_owned(), value.into());
        Ok(())
    }

    /// Search this context then each ancestor.  `Ok(None)` when absent
    /// everywhere.
    pub fn lookup_variable(&self, name: &str) -> Result<Option<SexpResult>, SexpError> {
        let mut cur = Some(self.clone());
        while let Some(ctx) = cur {
            if let Some(v) = ctx.0.borrow().variables.get(name) {
                return Ok(Some(v.clone()));
            }
            cur = ctx.parent()?;
        }
        Ok(None)
    }

    /// UNDEFINED_VARIABLE when absent from the whole chain.
    pub fn get_variable(&self, name: &str) -> SexpResult {
        match self.lookup_variable(name) {
            Ok(Some(v)) => v,
            Ok(None) => SexpError::new(ErrorKind::UndefinedVariable, format!("undefined variable '@{name}'")).into(),
            Err(e) => e.into(),
        }
    }

    pub fn has_variable(&self, name: &str) -> bool {
        matches!(self.lookup_variable(name), Ok(Some(_)))
    }

    pub fn has_local_variable(&self, name: &str) -> bool {
        self.0.borrow().variables.contains_key(name)
    }

    /// Unbind `name` from this context only.
    pub fn remove_variable(&self, name: &str) -> Result<bool, SexpError> {
        let mut d = self.0.borrow_mut();
        Self::check_writable(&d)?;
        Ok(d.variables.remove(name).is_some())
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.0.borrow().variables.keys().cloned().collect()
    }

    pub fn variable_count(&self) -> usize {
        self.0.borrow().variables.len()
    }

    // ── Object references ─────────────────────────────────────────────────────

    pub fn set_object_reference(&self, id: &str, handle: ObjectRef) -> Result<(), SexpError> {
        if id.trim().is_empty() {
            return Err(SexpError::new(ErrorKind::ValidationError, "object reference id is empty"));
        }
        if !handle.is_alive() {
            return Err(SexpError::new(ErrorKind::ObjectNotFound, format!("object '{id}' is null")));
        }
        let mut d = self.0.borrow_mut();
        Self::check_writable(&d)?;
        if !d.objects.contains_key(id) && d.objects.len() >= d.max_variables {
            return Err(SexpError::new(
                ErrorKind::ResourceExhausted,
                format!("context '{}' holds the maximum of {} object references", d.id, d.max_variables),
            ));
        }
        d.objects.insert(id.to_owned(), handle);
        Ok(())
    }

    /// OBJECT_NOT_FOUND when unbound anywhere in the chain or destroyed.
    pub fn get_object_reference(&self, id: &str) -> SexpResult {
        let mut cur = Some(self.clone());
        while let Some(ctx) = cur {
            if let Some(handle) = ctx.0.borrow().objects.get(id) {
                return if handle.is_alive() {
                    SexpResult::object(handle.clone())
                } else {
                    SexpResult::failure(ErrorKind::ObjectNotFound, format!("object '{id}' has been destroyed"))
                };
            }
            cur = match ctx.parent() {
                Ok(p) => p,
                Err(e) => return e.into(),
            };
        }
        SexpResult::failure(ErrorKind::ObjectNotFound, format!("no object reference '{id}'"))
    }

    pub fn remove_object_reference(&self, id: &str) -> Result<bool, SexpError> {
        let mut d = self.0.borrow_mut();
        Self::check_writable(&d)?;
        Ok(d.objects.remove(id).is_some())
    }

    /// Ids of references in this context whose object no longer exists.
    pub fn validate_object_references(&self) -> Vec<String> {
        self.0
            .borrow()
            .objects
            .iter()
            .filter(|(_, h)| !h.is_alive())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop the references [`validate_object_references`](Self::validate_object_references)
    /// reports.  Ignores the lock.
    pub fn purge_invalid_references(&self) -> Vec<String> {
        let dead = self.validate_object_references();
        let mut d = self.0.borrow_mut();
        for id in &dead {
            d.objects.remove(id);
        }
        if !dead.is_empty() {
            debug!(context = %d.id, count = dead.len(), "purged dead object references");
        }
        dead
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> ContextSnapshot {
        let d = self.0.borrow();
        ContextSnapshot {
            id: d.id.clone(),
            kind: d.kind.clone(),
            locked: d.locked,
            read_only: d.read_only,
            max_variables: d.max_variables,
            variables: d.variables.iter().map(|(k, v)| (k.clone(), StoredValue::encode(v))).collect(),
            objects: d.objects.keys().cloned().collect(),
        }
    }

    /// Rebuild a root context.  Object ids are rebound through `resolve`;
    /// ids it cannot resolve are dropped.
    pub fn restore(
        snapshot: &ContextSnapshot,
        mut resolve: impl FnMut(&str) -> Option<ObjectRef>,
    ) -> Result<Context, StoreError> {
        let ctx = Self::build(snapshot.id.clone(), snapshot.kind.clone(), None, snapshot.max_variables);
        {
            let mut d = ctx.0.borrow_mut();
            for (name, stored) in &snapshot.variables {
                d.variables.insert(name.clone(), stored.decode()?);
            }
            for id in &snapshot.objects {
                match resolve(id) {
                    Some(handle) if handle.is_alive() => {
                        d.objects.insert(id.clone(), handle);
                    }
                    _ => debug!(context = %snapshot.id, object = %id, "object not restored"),
                }
            }
            d.locked = snapshot.locked;
            d.read_only = snapshot.read_only;
        }
        Ok(ctx)
    }
}

/// Plain structural form of a context, for save/restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub read_only: bool,
    pub max_variables: usize,
    #[serde(default)]
    pub variables: BTreeMap<String, StoredValue>,
    #[serde(default)]
    pub objects: Vec<String>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
