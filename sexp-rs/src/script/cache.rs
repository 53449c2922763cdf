//! Least-recently-used caches.
//!
//! [`LruCache`] is the generic bounded map shared by the function registry,
//! the variable manager and the evaluator.  [`ExpressionCache`] layers the
//! evaluator's bookkeeping on top: dependency tracking for per-key
//! invalidation, memory estimates, and hit/miss/eviction events.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;
use std::mem;

use tracing::{debug, trace};

use super::value::{SexpResult, Value};

// ── LruCache ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Slot<V> {
    value: V,
    stamp: u64,
}

/// A bounded map evicting the least-recently-used entry when full.
///
/// Recency is a monotonically increasing stamp; `order` maps stamps back
/// to keys so the oldest entry is always `order`'s first element.  A
/// capacity of zero disables storage entirely.
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        LruCache {
            capacity,
            map: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Look up `key`, marking it most recently used.  Counts a hit or miss.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.tick += 1;
        let tick = self.tick;
        match self.map.get_mut(key) {
            Some(slot) => {
                let old = mem::replace(&mut slot.stamp, tick);
                if let Some(k) = self.order.remove(&old) {
                    self.order.insert(tick, k);
                }
                self.hits += 1;
                Some(&slot.value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Look up without touching recency or statistics.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get(key).map(|slot| &slot.value)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }

    /// Insert or replace `key`.  Returns whatever had to be evicted to make
    /// room.
    pub fn insert(&mut self, key: K, value: V) -> Vec<(K, V)> {
        if self.capacity == 0 {
            return Vec::new();
        }
        self.tick += 1;
        let tick = self.tick;

        if let Some(slot) = self.map.get_mut(&key) {
            self.order.remove(&slot.stamp);
            slot.stamp = tick;
            slot.value = value;
            self.order.insert(tick, key);
            return Vec::new();
        }

        let evicted = self.shrink_to(self.capacity - 1);
        self.map.insert(key.clone(), Slot { value, stamp: tick });
        self.order.insert(tick, key);
        evicted
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.map.remove(key)?;
        self.order.remove(&slot.stamp);
        Some(slot.value)
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    /// Change the capacity, evicting the oldest entries if it shrank.
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<(K, V)> {
        self.capacity = capacity;
        self.shrink_to(capacity)
    }

    fn shrink_to(&mut self, max_len: usize) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        while self.map.len() > max_len {
            let Some((_, oldest)) = self.order.pop_first() else { break };
            if let Some(slot) = self.map.remove(&oldest) {
                self.evictions += 1;
                evicted.push((oldest, slot.value));
            }
        }
        evicted
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Hits over lookups, `0.0` before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn reset_statistics(&mut self) {
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
    }
}

// ── ExpressionCache ───────────────────────────────────────────────────────────

/// Something a cached result was computed from.  When it changes, every
/// entry depending on it is dropped.
///
/// Variables are tracked by name alone, regardless of scope: a new
/// same-named variable in a higher-priority scope changes what auto-scope
/// lookups see.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dependency {
    Variable(String),
    Object(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Hit(String),
    Miss(String),
    Evicted(String),
    Invalidated(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub size: usize,
    pub capacity: usize,
    pub hit_rate: f64,
    pub memory_usage_bytes: usize,
    pub memory_usage_mb: f64,
}

#[derive(Debug)]
struct CacheEntry {
    result: SexpResult,
    dependencies: BTreeSet<Dependency>,
    size: usize,
}

pub type CacheListener = Box<dyn FnMut(&CacheEvent)>;

/// Memoized results of pure function calls, keyed by canonical text plus a
/// context discriminator.
pub struct ExpressionCache {
    entries: LruCache<String, CacheEntry>,
    by_dependency: HashMap<Dependency, HashSet<String>>,
    invalidations: u64,
    memory: usize,
    listeners: Vec<CacheListener>,
}

impl ExpressionCache {
    pub fn new(capacity: usize) -> Self {
        ExpressionCache {
            entries: LruCache::new(capacity),
            by_dependency: HashMap::new(),
            invalidations: 0,
            memory: 0,
            listeners: Vec::new(),
        }
    }

    /// Subscribe to hit/miss/eviction/invalidation events.
    pub fn on_event(&mut self, listener: CacheListener) {
        self.listeners.push(listener);
    }

    fn emit(&mut self, event: CacheEvent) {
        for l in &mut self.listeners {
            l(&event);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    /// What the entry under `key` was computed from (empty when absent).
    pub fn dependencies_of(&self, key: &str) -> BTreeSet<Dependency> {
        self.entries
            .peek(key)
            .map(|entry| entry.dependencies.clone())
            .unwrap_or_default()
    }

    /// Fetch a cached result, annotated as a cache hit.
    pub fn lookup(&mut self, key: &str) -> Option<SexpResult> {
        let found = self
            .entries
            .get(key)
            .map(|entry| entry.result.clone().with_cache_hit(true));
        if found.is_some() {
            trace!(key, "expression cache hit");
            self.emit(CacheEvent::Hit(key.to_owned()));
        } else {
            trace!(key, "expression cache miss");
            self.emit(CacheEvent::Miss(key.to_owned()));
        }
        found
    }

    pub fn store(&mut self, key: String, result: SexpResult, dependencies: BTreeSet<Dependency>) {
        if self.entries.capacity() == 0 {
            return;
        }
        self.forget(&key);

        let size = estimate_size(&key, &result, &dependencies);
        for dep in &dependencies {
            self.by_dependency.entry(dep.clone()).or_default().insert(key.clone());
        }
        self.memory += size;

        let entry = CacheEntry { result: result.with_cache_hit(false), dependencies, size };
        let evicted = self.entries.insert(key, entry);
        for (old_key, old) in evicted {
            self.unindex(&old_key, &old);
            debug!(key = %old_key, "expression cache eviction");
            self.emit(CacheEvent::Evicted(old_key));
        }
    }

    /// Drop every entry that depends on `dep`.  Returns how many went.
    pub fn invalidate(&mut self, dep: &Dependency) -> usize {
        let Some(keys) = self.by_dependency.remove(dep) else { return 0 };
        let mut dropped = 0;
        for key in keys {
            if self.forget(&key) {
                dropped += 1;
                self.invalidations += 1;
                self.emit(CacheEvent::Invalidated(key));
            }
        }
        if dropped > 0 {
            debug!(?dep, dropped, "invalidated cached expressions");
        }
        dropped
    }

    fn forget(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(old) => {
                self.unindex(key, &old);
                true
            }
            None => false,
        }
    }

    fn unindex(&mut self, key: &str, entry: &CacheEntry) {
        self.memory = self.memory.saturating_sub(entry.size);
        for dep in &entry.dependencies {
            if let Some(keys) = self.by_dependency.get_mut(dep) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_dependency.remove(dep);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_dependency.clear();
        self.memory = 0;
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        for (key, old) in self.entries.set_capacity(capacity) {
            self.unindex(&key, &old);
            self.emit(CacheEvent::Evicted(key));
        }
    }

    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            hits: self.entries.hits(),
            misses: self.entries.misses(),
            evictions: self.entries.evictions(),
            invalidations: self.invalidations,
            size: self.entries.len(),
            capacity: self.entries.capacity(),
            hit_rate: self.entries.hit_rate(),
            memory_usage_bytes: self.memory,
            memory_usage_mb: self.memory as f64 / (1024.0 * 1024.0),
        }
    }

    pub fn reset_statistics(&mut self) {
        self.entries.reset_statistics();
        self.invalidations = 0;
    }
}

fn estimate_size(key: &str, result: &SexpResult, deps: &BTreeSet<Dependency>) -> usize {
    let payload = match result.value() {
        Value::Str(s) => s.len(),
        Value::Error(e) => e.message.len() + e.context.len() + e.suggested_fix.len(),
        Value::Object(o) => o.id().len(),
        _ => 0,
    };
    let dep_bytes: usize = deps
        .iter()
        .map(|d| match d {
            Dependency::Variable(n) | Dependency::Object(n) => n.len() + mem::size_of::<Dependency>(),
        })
        .sum();
    key.len() + payload + dep_bytes + mem::size_of::<CacheEntry>() + mem::size_of::<String>()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn lru_evicts_least_recent() {
        let mut c = LruCache::new(2);
        c.insert("a", 1);
        c.insert("b", 2);
        assert_eq!(c.get(&"a"), Some(&1)); // "b" is now oldest
        let evicted = c.insert("c", 3);
        assert_eq!(evicted, vec![("b", 2)]);
        assert!(c.contains(&"a"));
        assert!(c.contains(&"c"));
        assert_eq!(c.evictions(), 1);
    }

    #[test]
    fn lru_replace_does_not_evict() {
        let mut c = LruCache::new(2);
        c.insert("a", 1);
        c.insert("b", 2);
        assert!(c.insert("a", 10).is_empty());
        assert_eq!(c.peek(&"a"), Some(&10));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn lru_statistics() {
        let mut c: LruCache<String, u32> = LruCache::new(4);
        c.insert("x".into(), 1);
        assert!(c.get("x").is_some());
        assert!(c.get("y").is_none());
        assert_eq!((c.hits(), c.misses()), (1, 1));
        assert_eq!(c.hit_rate(), 0.5);
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let mut c = LruCache::new(0);
        c.insert(1, 1);
        assert!(c.is_empty());
    }

    #[test]
    fn shrinking_capacity_evicts_oldest() {
        let mut c = LruCache::new(3);
        for i in 0..3 {
            c.insert(i, i);
        }
        let evicted = c.set_capacity(1);
        assert_eq!(evicted.len(), 2);
        assert!(c.contains(&2));
    }

    fn deps(vars: &[&str]) -> BTreeSet<Dependency> {
        vars.iter().map(|v| Dependency::Variable((*v).to_owned())).collect()
    }

    #[test]
    fn lookup_marks_cache_hit() {
        let mut cache = ExpressionCache::new(8);
        assert!(cache.lookup("(+ 1 2)").is_none());
        cache.store("(+ 1 2)".into(), SexpResult::number(3.0), BTreeSet::new());
        let hit = cache.lookup("(+ 1 2)").unwrap();
        assert!(hit.is_cache_hit());
        assert_eq!(hit, SexpResult::number(3.0));
        let stats = cache.statistics();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
        assert!(stats.memory_usage_bytes > 0);
    }

    #[test]
    fn invalidation_is_per_dependency() {
        let mut cache = ExpressionCache::new(8);
        cache.store("a".into(), SexpResult::number(1.0), deps(&["x"]));
        cache.store("b".into(), SexpResult::number(2.0), deps(&["y"]));
        cache.store("c".into(), SexpResult::number(3.0), deps(&["x", "y"]));

        assert_eq!(cache.invalidate(&Dependency::Variable("x".into())), 2);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(!cache.contains("c"));
        assert_eq!(cache.invalidate(&Dependency::Variable("x".into())), 0);
        assert_eq!(cache.statistics().invalidations, 2);
    }

    #[test]
    fn events_are_emitted() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut cache = ExpressionCache::new(1);
        cache.on_event(Box::new(move |e| sink.borrow_mut().push(e.clone())));

        cache.lookup("k1");
        cache.store("k1".into(), SexpResult::void(), BTreeSet::new());
        cache.store("k2".into(), SexpResult::void(), BTreeSet::new());
        cache.lookup("k2");

        assert_eq!(
            *RefCell::borrow(&seen),
            vec![
                CacheEvent::Miss("k1".into()),
                CacheEvent::Evicted("k1".into()),
                CacheEvent::Hit("k2".into()),
            ]
        );
    }

    #[test]
    fn memory_accounting_returns_to_zero() {
        let mut cache = ExpressionCache::new(4);
        cache.store("k".into(), SexpResult::string("payload"), deps(&["v"]));
        assert!(cache.statistics().memory_usage_bytes > 0);
        cache.invalidate(&Dependency::Variable("v".into()));
        assert_eq!(cache.statistics().memory_usage_bytes, 0);
        assert!(cache.is_empty());
    }
}
