//! Scoped variable store.
//!
//! Three scopes, searched in this order by [`VariableManager::find_variable`]:
//!
//! | Scope      | Lifetime                       | Persisted |
//! |------------|--------------------------------|-----------|
//! | `LOCAL`    | one mission / session          | never     |
//! | `CAMPAIGN` | a campaign's run of missions   | yes       |
//! | `GLOBAL`   | the player profile             | yes       |
//!
//! Each variable may carry [`Constraints`] that every later write must
//! satisfy.  Every mutation fires a [`VariableEvent`] before the call
//! returns.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::mpsc::Receiver;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::notify::{ObserverId, Observers, VariableEvent};
use crate::script::cache::LruCache;
use crate::script::lexer::is_identifier;
use crate::script::value::{ErrorKind, ResultType, SexpError, SexpResult, Value};
use crate::store::{
    from_epoch_secs, to_epoch_secs, StoreError, StoredMetadata, StoredValue, StoredVariable, VariableStore,
};

pub const DEFAULT_LOOKUP_CACHE: usize = 256;
pub const DEFAULT_MAX_SCOPE_VARIABLES: usize = 4096;

// ── Scope ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Local,
    Campaign,
    Global,
}

impl Scope {
    /// Lookup priority order.
    pub const ALL: &'static [Scope] = &[Scope::Local, Scope::Campaign, Scope::Global];

    pub fn name(self) -> &'static str {
        match self {
            Scope::Local    => "local",
            Scope::Campaign => "campaign",
            Scope::Global   => "global",
        }
    }

    pub fn is_persistent(self) -> bool {
        !matches!(self, Scope::Local)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scope {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        Scope::ALL.iter().copied().find(|sc| sc.name().eq_ignore_ascii_case(s)).ok_or(())
    }
}

// ── Constraints ───────────────────────────────────────────────────────────────

/// Rules a variable's value must keep satisfying.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// The type may not change once set.
    #[serde(default, skip_serializing_if = "is_false")]
    pub type_locked: bool,
    /// Empty means any type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_types: Vec<ResultType>,
    /// Inclusive numeric bounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<(f64, f64)>,
    /// Empty means any string.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Constraints {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn type_locked(mut self) -> Self {
        self.type_locked = true;
        self
    }

    pub fn allow_types(mut self, types: &[ResultType]) -> Self {
        self.allowed_types = types.to_vec();
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.allowed_values = values.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Check a write of `new` over `current` (`None` when first defined).
    pub fn check(&self, name: &str, current: Option<&SexpResult>, new: &SexpResult) -> Result<(), SexpError> {
        let new_type = new.result_type();
        if let Some(cur) = current {
            if self.read_only {
                return Err(SexpError::new(ErrorKind::PermissionDenied, format!("variable '{name}' is read-only")));
            }
            if self.type_locked && cur.result_type() != new_type {
                return Err(SexpError::new(
                    ErrorKind::TypeMismatch,
                    format!("variable '{name}' is locked to {}, got {new_type}", cur.result_type()),
                ));
            }
        }
        if !self.allowed_types.is_empty() && !self.allowed_types.contains(&new_type) {
            let allowed: Vec<&str> = self.allowed_types.iter().map(|t| t.name()).collect();
            return Err(SexpError::new(
                ErrorKind::TypeMismatch,
                format!("variable '{name}' accepts {}, got {new_type}", allowed.join(" or ")),
            ));
        }
        if let Some((min, max)) = self.range {
            let Value::Number(n) = new.value() else {
                return Err(SexpError::type_mismatch("number", new_type).with_context(name.to_owned()));
            };
            if !(min..=max).contains(n) {
                return Err(SexpError::new(
                    ErrorKind::ValidationError,
                    format!("variable '{name}' must be within [{min}, {max}], got {n}"),
                ));
            }
        }
        if !self.allowed_values.is_empty() {
            let Value::Str(s) = new.value() else {
                return Err(SexpError::type_mismatch("string", new_type).with_context(name.to_owned()));
            };
            if !self.allowed_values.iter().any(|v| v == s) {
                return Err(SexpError::new(
                    ErrorKind::ValidationError,
                    format!("variable '{name}' must be one of {:?}, got {s:?}", self.allowed_values),
                ));
            }
        }
        Ok(())
    }
}

// ── Variable ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub scope: Scope,
    pub value: SexpResult,
    pub constraints: Constraints,
    pub access_count: u64,
    pub created: SystemTime,
    pub modified: SystemTime,
}

impl Variable {
    fn new(scope: Scope, name: &str, value: SexpResult, constraints: Constraints) -> Self {
        let now = SystemTime::now();
        Variable {
            name: name.to_owned(),
            scope,
            value,
            constraints,
            access_count: 0,
            created: now,
            modified: now,
        }
    }

    fn to_stored(&self) -> StoredVariable {
        StoredVariable {
            value: StoredValue::encode(&self.value),
            constraints: self.constraints.clone(),
            metadata: StoredMetadata {
                access_count: self.access_count,
                created: to_epoch_secs(self.created),
                modified: to_epoch_secs(self.modified),
            },
        }
    }

    fn from_stored(scope: Scope, name: &str, stored: &StoredVariable) -> Result<Self, StoreError> {
        Ok(Variable {
            name: name.to_owned(),
            scope,
            value: stored.value.decode()?,
            constraints: stored.constraints.clone(),
            access_count: stored.metadata.access_count,
            created: from_epoch_secs(stored.metadata.created),
            modified: from_epoch_secs(stored.metadata.modified),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariableStatistics {
    pub local: usize,
    pub campaign: usize,
    pub global: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate: f64,
}

// ── VariableManager ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct VariableManager {
    scopes: BTreeMap<Scope, HashMap<String, Variable>>,
    /// Name → scope that `find_variable` resolved it to.
    resolved: LruCache<String, Scope>,
    max_per_scope: usize,
    store: Option<VariableStore>,
    observers: Observers,
}

impl Default for VariableManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKUP_CACHE, DEFAULT_MAX_SCOPE_VARIABLES)
    }
}

impl VariableManager {
    pub fn new(cache_capacity: usize, max_per_scope: usize) -> Self {
        VariableManager {
            scopes: Scope::ALL.iter().map(|&s| (s, HashMap::new())).collect(),
            resolved: LruCache::new(cache_capacity),
            max_per_scope,
            store: None,
            observers: Observers::new(),
        }
    }

    /// A manager backed by `store`; persisted scopes are loaded now.
    pub fn with_store(cache_capacity: usize, max_per_scope: usize, store: VariableStore) -> Result<Self, StoreError> {
        let mut vm = Self::new(cache_capacity, max_per_scope);
        vm.store = Some(store);
        vm.reload()?;
        Ok(vm)
    }

    pub fn store(&self) -> Option<&VariableStore> {
        self.store.as_ref()
    }

    fn scope(&self, scope: Scope) -> &HashMap<String, Variable> {
        &self.scopes[&scope]
    }

    fn scope_mut(&mut self, scope: Scope) -> &mut HashMap<String, Variable> {
        self.scopes.entry(scope).or_default()
    }

    fn check_name(name: &str) -> Result<(), SexpError> {
        if is_identifier(name) {
            Ok(())
        } else {
            Err(SexpError::new(ErrorKind::ValidationError, format!("invalid variable name '{name}'")))
        }
    }

    fn check_storable(scope: Scope, name: &str, value: &SexpResult) -> Result<(), SexpError> {
        match value.value() {
            Value::Error(_) => Err(SexpError::new(
                ErrorKind::ValidationError,
                format!("cannot store an error in variable '{name}'"),
            )),
            Value::Object(_) if scope.is_persistent() => Err(SexpError::new(
                ErrorKind::ValidationError,
                format!("object references cannot be stored in {scope} variable '{name}'"),
            )),
            _ => Ok(()),
        }
    }

    // ── Writes ────────────────────────────────────────────────────────────────

    /// Create or update `name` in `scope`, honouring its constraints.
    pub fn set_variable(&mut self, scope: Scope, name: &str, value: impl Into<SexpResult>) -> Result<(), SexpError> {
        let value = value.into();
        Self::check_name(name)?;
        Self::check_storable(scope, name, &value)?;

        let max = self.max_per_scope;
        let vars = self.scope_mut(scope);
        let event = match vars.get_mut(name) {
            Some(var) => {
                var.constraints.check(name, Some(&var.value), &value).inspect_err(|e| {
                    warn!(%scope, name, error = %e, "rejected variable write");
                })?;
                let old = std::mem::replace(&mut var.value, value.clone());
                var.modified = SystemTime::now();
                VariableEvent::changed(scope, name, old, value)
            }
            None => {
                if vars.len() >= max {
                    return Err(SexpError::new(
                        ErrorKind::ResourceExhausted,
                        format!("{scope} scope is full ({max} variables)"),
                    ));
                }
                vars.insert(name.to_owned(), Variable::new(scope, name, value.clone(), Constraints::none()));
                self.resolved.remove(name);
                VariableEvent::added(scope, name, value)
            }
        };
        debug!(%scope, name, kind = %event.kind, "variable written");
        self.observers.notify(&event);
        Ok(())
    }

    /// Create `name` with `constraints`, replacing any existing variable
    /// unless it is read-only.
    pub fn define_variable(
        &mut self,
        scope: Scope,
        name: &str,
        value: impl Into<SexpResult>,
        constraints: Constraints,
    ) -> Result<(), SexpError> {
        let value = value.into();
        Self::check_name(name)?;
        Self::check_storable(scope, name, &value)?;
        constraints.check(name, None, &value)?;

        let max = self.max_per_scope;
        let vars = self.scope_mut(scope);
        let old = match vars.get(name) {
            Some(v) if v.constraints.read_only => {
                return Err(SexpError::new(ErrorKind::PermissionDenied, format!("variable '{name}' is read-only")));
            }
            Some(v) => Some(v.value.clone()),
            None if vars.len() >= max => {
                return Err(SexpError::new(
                    ErrorKind::ResourceExhausted,
                    format!("{scope} scope is full ({max} variables)"),
                ));
            }
            None => None,
        };
        vars.insert(name.to_owned(), Variable::new(scope, name, value.clone(), constraints));
        let event = match old {
            Some(old) => VariableEvent::changed(scope, name, old, value),
            None => {
                self.resolved.remove(name);
                VariableEvent::added(scope, name, value)
            }
        };
        self.observers.notify(&event);
        Ok(())
    }

    pub fn set_constraints(&mut self, scope: Scope, name: &str, constraints: Constraints) -> Result<(), SexpError> {
        let var = self.scope_mut(scope).get_mut(name).ok_or_else(|| not_found(scope, name))?;
        constraints.check(name, None, &var.value)?;
        var.constraints = constraints;
        Ok(())
    }

    /// Returns `false` when absent or read-only.
    pub fn remove_variable(&mut self, scope: Scope, name: &str) -> bool {
        let vars = self.scope_mut(scope);
        match vars.get(name) {
            None => return false,
            Some(v) if v.constraints.read_only => {
                warn!(%scope, name, "refusing to remove read-only variable");
                return false;
            }
            Some(_) => {}
        }
        let Some(var) = vars.remove(name) else { return false };
        self.resolved.remove(name);
        debug!(%scope, name, "variable removed");
        self.observers.notify(&VariableEvent::removed(scope, name, var.value));
        true
    }

    /// Remove every variable in `scope`, read-only ones included.
    pub fn clear_scope(&mut self, scope: Scope) -> usize {
        let drained: Vec<Variable> = self.scope_mut(scope).drain().map(|(_, v)| v).collect();
        self.resolved.clear();
        for var in &drained {
            self.observers.notify(&VariableEvent::removed(scope, var.name.clone(), var.value.clone()));
        }
        debug!(%scope, count = drained.len(), "scope cleared");
        drained.len()
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    /// VARIABLE_NOT_FOUND when absent.  Counts as an access.
    pub fn get_variable(&mut self, scope: Scope, name: &str) -> SexpResult {
        match self.scope_mut(scope).get_mut(name) {
            Some(var) => {
                var.access_count += 1;
                var.value.clone()
            }
            None => not_found(scope, name).into(),
        }
    }

    pub fn has_variable(&self, scope: Scope, name: &str) -> bool {
        self.scope(scope).contains_key(name)
    }

    pub fn variable(&self, scope: Scope, name: &str) -> Option<&Variable> {
        self.scope(scope).get(name)
    }

    /// The first scope holding `name`, in LOCAL → CAMPAIGN → GLOBAL order.
    pub fn find_variable(&mut self, name: &str) -> Option<Scope> {
        if let Some(&scope) = self.resolved.get(name) {
            return Some(scope);
        }
        let scope = Scope::ALL.iter().copied().find(|&s| self.scope(s).contains_key(name))?;
        self.resolved.insert(name.to_owned(), scope);
        Some(scope)
    }

    /// [`find_variable`](Self::find_variable) then
    /// [`get_variable`](Self::get_variable).
    pub fn resolve(&mut self, name: &str) -> SexpResult {
        match self.find_variable(name) {
            Some(scope) => self.get_variable(scope, name),
            None => SexpError::new(ErrorKind::VariableNotFound, format!("variable '{name}' not found in any scope")).into(),
        }
    }

    pub fn names(&self, scope: Scope) -> Vec<String> {
        let mut names: Vec<String> = self.scope(scope).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self, scope: Scope) -> usize {
        self.scope(scope).len()
    }

    pub fn statistics(&self) -> VariableStatistics {
        VariableStatistics {
            local: self.len(Scope::Local),
            campaign: self.len(Scope::Campaign),
            global: self.len(Scope::Global),
            cache_hits: self.resolved.hits(),
            cache_misses: self.resolved.misses(),
            hit_rate: self.resolved.hit_rate(),
        }
    }

    // ── Observers ─────────────────────────────────────────────────────────────

    pub fn on_change(&mut self, callback: impl FnMut(&VariableEvent) + 'static) -> ObserverId {
        self.observers.add(callback)
    }

    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    pub fn subscribe(&mut self) -> Receiver<VariableEvent> {
        self.observers.subscribe()
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Write CAMPAIGN and GLOBAL to the store.  Returns how many variables
    /// were written; `0` without a store.
    pub fn save(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.store else { return Ok(0) };
        let mut total = 0;
        for &scope in Scope::ALL.iter().filter(|s| s.is_persistent()) {
            let stored: BTreeMap<String, StoredVariable> =
                self.scope(scope).iter().map(|(n, v)| (n.clone(), v.to_stored())).collect();
            total += stored.len();
            store.save(scope, &stored)?;
        }
        Ok(total)
    }

    /// Replace CAMPAIGN and GLOBAL with the stored contents.  No events
    /// fire.
    pub fn reload(&mut self) -> Result<usize, StoreError> {
        let Some(store) = self.store.clone() else { return Ok(0) };
        let mut total = 0;
        for &scope in Scope::ALL.iter().filter(|s| s.is_persistent()) {
            let loaded = store.load(scope)?;
            let vars = self.scope_mut(scope);
            vars.clear();
            for (name, stored) in &loaded {
                if !is_identifier(name) {
                    warn!(%scope, %name, "skipping stored variable with invalid name");
                    continue;
                }
                let var = Variable::from_stored(scope, name, stored)?;
                if let Err(e) = Self::check_storable(scope, name, &var.value) {
                    warn!(%scope, %name, error = %e, "skipping stored variable");
                    continue;
                }
                vars.insert(name.clone(), var);
            }
            total += vars.len();
        }
        self.resolved.clear();
        Ok(total)
    }
}

fn not_found(scope: Scope, name: &str) -> SexpError {
    SexpError::new(ErrorKind::VariableNotFound, format!("variable '{name}' not found in {scope} scope"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChangeKind;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn set_and_get() {
        let mut vm = VariableManager::default();
        vm.set_variable(Scope::Local, "x", 5.0).unwrap();
        assert_eq!(vm.get_variable(Scope::Local, "x"), SexpResult::number(5.0));
        assert!(vm.has_variable(Scope::Local, "x"));
        assert!(!vm.has_variable(Scope::Global, "x"));
        assert_eq!(vm.variable(Scope::Local, "x").unwrap().access_count, 1);
    }

    #[test]
    fn missing_is_variable_not_found() {
        let mut vm = VariableManager::default();
        let r = vm.get_variable(Scope::Campaign, "nope");
        assert_eq!(r.error_kind(), Some(ErrorKind::VariableNotFound));
    }

    #[test]
    fn rejects_invalid_names() {
        let mut vm = VariableManager::default();
        for bad in ["", "1abc", "has space", "dash-ed"] {
            let e = vm.set_variable(Scope::Local, bad, 1.0).unwrap_err();
            assert_eq!(e.kind, ErrorKind::ValidationError, "{bad}");
        }
    }

    #[test]
    fn find_variable_priority() {
        let mut vm = VariableManager::default();
        vm.set_variable(Scope::Global, "n", 3.0).unwrap();
        assert_eq!(vm.find_variable("n"), Some(Scope::Global));
        vm.set_variable(Scope::Campaign, "n", 2.0).unwrap();
        assert_eq!(vm.find_variable("n"), Some(Scope::Campaign));
        vm.set_variable(Scope::Local, "n", 1.0).unwrap();
        assert_eq!(vm.find_variable("n"), Some(Scope::Local));
        assert_eq!(vm.resolve("n"), SexpResult::number(1.0));
        vm.remove_variable(Scope::Local, "n");
        assert_eq!(vm.resolve("n"), SexpResult::number(2.0));
        assert_eq!(vm.find_variable("zzz"), None);
    }

    #[test]
    fn resolution_cache_counts() {
        let mut vm = VariableManager::default();
        vm.set_variable(Scope::Global, "g", 1.0).unwrap();
        vm.find_variable("g");
        vm.find_variable("g");
        let stats = vm.statistics();
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.global, 1);
    }

    #[test]
    fn type_lock_and_ranges() {
        let mut vm = VariableManager::default();
        vm.define_variable(Scope::Local, "hp", 50.0, Constraints::none().type_locked().range(0.0, 100.0))
            .unwrap();
        assert_eq!(vm.set_variable(Scope::Local, "hp", "full").unwrap_err().kind, ErrorKind::TypeMismatch);
        assert_eq!(vm.set_variable(Scope::Local, "hp", 150.0).unwrap_err().kind, ErrorKind::ValidationError);
        vm.set_variable(Scope::Local, "hp", 75.0).unwrap();
        assert_eq!(vm.get_variable(Scope::Local, "hp"), SexpResult::number(75.0));
    }

    #[test]
    fn allowed_types_and_values() {
        let mut vm = VariableManager::default();
        vm.define_variable(
            Scope::Local,
            "mode",
            "easy",
            Constraints::none().allow_types(&[ResultType::String]).one_of(&["easy", "hard"]),
        )
        .unwrap();
        assert_eq!(vm.set_variable(Scope::Local, "mode", "medium").unwrap_err().kind, ErrorKind::ValidationError);
        assert_eq!(vm.set_variable(Scope::Local, "mode", 1.0).unwrap_err().kind, ErrorKind::TypeMismatch);
        vm.set_variable(Scope::Local, "mode", "hard").unwrap();
    }

    #[test]
    fn read_only_variables() {
        let mut vm = VariableManager::default();
        vm.define_variable(Scope::Global, "version", 2.0, Constraints::none().read_only()).unwrap();
        assert_eq!(vm.set_variable(Scope::Global, "version", 3.0).unwrap_err().kind, ErrorKind::PermissionDenied);
        assert!(!vm.remove_variable(Scope::Global, "version"));
        assert_eq!(vm.clear_scope(Scope::Global), 1);
    }

    #[test]
    fn rejects_errors_and_persisted_objects() {
        let mut vm = VariableManager::default();
        let err = SexpResult::failure(ErrorKind::RuntimeError, "x");
        assert_eq!(vm.set_variable(Scope::Local, "e", err).unwrap_err().kind, ErrorKind::ValidationError);
        let obj = SexpResult::object(crate::script::value::ObjectRef::detached("ship"));
        assert!(vm.set_variable(Scope::Local, "o", obj.clone()).is_ok());
        assert_eq!(vm.set_variable(Scope::Campaign, "o", obj).unwrap_err().kind, ErrorKind::ValidationError);
    }

    #[test]
    fn scope_capacity() {
        let mut vm = VariableManager::new(4, 2);
        vm.set_variable(Scope::Local, "a", 1.0).unwrap();
        vm.set_variable(Scope::Local, "b", 1.0).unwrap();
        assert_eq!(vm.set_variable(Scope::Local, "c", 1.0).unwrap_err().kind, ErrorKind::ResourceExhausted);
        vm.set_variable(Scope::Local, "a", 2.0).unwrap();
    }

    #[test]
    fn events_fire_for_each_mutation() {
        let mut vm = VariableManager::default();
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        vm.on_change(move |e| sink.borrow_mut().push((e.kind, e.name.clone())));
        vm.set_variable(Scope::Local, "x", 1.0).unwrap();
        vm.set_variable(Scope::Local, "x", 2.0).unwrap();
        vm.remove_variable(Scope::Local, "x");
        assert_eq!(
            *log.borrow(),
            vec![
                (ChangeKind::Added, "x".to_owned()),
                (ChangeKind::Changed, "x".to_owned()),
                (ChangeKind::Removed, "x".to_owned()),
            ]
        );
    }

    #[test]
    fn subscribers_receive_old_and_new() {
        let mut vm = VariableManager::default();
        let rx = vm.subscribe();
        vm.set_variable(Scope::Campaign, "n", 1.0).unwrap();
        vm.set_variable(Scope::Campaign, "n", 2.0).unwrap();
        let events: Vec<VariableEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].old, Some(SexpResult::number(1.0)));
        assert_eq!(events[1].new, Some(SexpResult::number(2.0)));
    }

    #[test]
    fn persists_campaign_and_global_only() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut vm = VariableManager::with_store(8, 64, VariableStore::new(dir.path())).unwrap();
            vm.set_variable(Scope::Local, "temp", 1.0).unwrap();
            vm.set_variable(Scope::Campaign, "kills", 7.0).unwrap();
            vm.define_variable(Scope::Global, "difficulty", "hard", Constraints::none().one_of(&["easy", "hard"]))
                .unwrap();
            assert_eq!(vm.save().unwrap(), 2);
        }
        let mut vm = VariableManager::with_store(8, 64, VariableStore::new(dir.path())).unwrap();
        assert!(!vm.has_variable(Scope::Local, "temp"));
        assert_eq!(vm.get_variable(Scope::Campaign, "kills"), SexpResult::number(7.0));
        assert_eq!(vm.get_variable(Scope::Global, "difficulty"), SexpResult::string("hard"));
        assert_eq!(
            vm.set_variable(Scope::Global, "difficulty", "silly").unwrap_err().kind,
            ErrorKind::ValidationError
        );
        assert!(!dir.path().join("local.json").exists());
    }

    #[test]
    fn save_without_store_is_a_no_op() {
        let mut vm = VariableManager::default();
        vm.set_variable(Scope::Global, "x", 1.0).unwrap();
        assert_eq!(vm.save().unwrap(), 0);
    }

    #[test]
    fn scope_names_parse() {
        assert_eq!("CAMPAIGN".parse::<Scope>(), Ok(Scope::Campaign));
        assert!("auto".parse::<Scope>().is_err());
        assert!(!Scope::Local.is_persistent());
    }
}
