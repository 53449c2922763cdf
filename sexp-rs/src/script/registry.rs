//! Name → function lookup.
//!
//! Every function lives under one canonical name and any number of
//! aliases; an alias resolves to the very same [`FunctionEntry`], so
//! statistics are shared.  Categories are a secondary index only.
//! Case sensitivity is fixed at construction and applied to registration
//! and lookup alike.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use tracing::debug;

use super::cache::LruCache;
use super::function::{FunctionEntry, FunctionRef, SexpFunction};
use crate::suggest::{edit_distance, suggest_similar, threshold};

pub const DEFAULT_LOOKUP_CACHE: usize = 128;

/// Which attribute [`FunctionRegistry::search`] matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Name,
    Category,
    Description,
    All,
}

/// How well a search hit matched.  Ordered best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    Exact,
    Prefix,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    /// Canonical function name.
    pub name: String,
    pub kind: MatchKind,
    /// Lower is better within a kind.
    pub score: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistryStatistics {
    pub functions: usize,
    pub aliases: usize,
    pub categories: usize,
    pub lookup_hits: u64,
    pub lookup_misses: u64,
    pub hit_rate: f64,
}

pub struct FunctionRegistry {
    case_sensitive: bool,
    /// Normalized canonical name → entry.
    functions: HashMap<String, FunctionRef>,
    /// Normalized alias → normalized canonical name.
    aliases: HashMap<String, String>,
    /// Category → canonical names.
    categories: BTreeMap<String, BTreeSet<String>>,
    lookups: RefCell<LruCache<String, FunctionRef>>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new(true, DEFAULT_LOOKUP_CACHE)
    }
}

impl FunctionRegistry {
    pub fn new(case_sensitive: bool, lookup_cache_capacity: usize) -> Self {
        FunctionRegistry {
            case_sensitive,
            functions: HashMap::new(),
            aliases: HashMap::new(),
            categories: BTreeMap::new(),
            lookups: RefCell::new(LruCache::new(lookup_cache_capacity)),
        }
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn key(&self, name: &str) -> String {
        if self.case_sensitive {
            name.to_owned()
        } else {
            name.to_lowercase()
        }
    }

    /// Register `function` under its own name plus `aliases`.  Returns
    /// `false` for an empty name.  A later registration of the same name
    /// replaces the earlier one together with its aliases.
    pub fn register(&mut self, function: Box<dyn SexpFunction>, aliases: &[&str]) -> bool {
        let name = function.name().trim().to_owned();
        if name.is_empty() {
            debug!("rejected function with empty name");
            return false;
        }
        let key = self.key(&name);
        if self.functions.contains_key(&key) {
            debug!(%name, "replacing function");
            self.remove_entry(&key);
        }
        // A canonical name shadows any alias of the same spelling.
        self.aliases.remove(&key);

        let entry = Rc::new(FunctionEntry::new(function));
        self.categories
            .entry(entry.category().to_owned())
            .or_default()
            .insert(name.clone());
        for alias in aliases.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
            let alias_key = self.key(alias);
            if alias_key != key && !self.functions.contains_key(&alias_key) {
                self.aliases.insert(alias_key, key.clone());
            }
        }
        self.functions.insert(key, entry);
        self.lookups.borrow_mut().clear();
        true
    }

    /// Remove a function by canonical name, with its aliases.
    pub fn unregister(&mut self, name: &str) -> bool {
        let key = self.key(name);
        let removed = self.remove_entry(&key);
        if removed {
            self.lookups.borrow_mut().clear();
        }
        removed
    }

    fn remove_entry(&mut self, key: &str) -> bool {
        let Some(entry) = self.functions.remove(key) else {
            return false;
        };
        self.aliases.retain(|_, target| target != key);
        if let Some(names) = self.categories.get_mut(entry.category()) {
            names.remove(entry.name().trim());
            if names.is_empty() {
                self.categories.remove(entry.category());
            }
        }
        true
    }

    /// Resolve a name or alias.
    pub fn get(&self, name: &str) -> Option<FunctionRef> {
        let key = self.key(name);
        let mut lookups = self.lookups.borrow_mut();
        if let Some(hit) = lookups.get(&key) {
            return Some(Rc::clone(hit));
        }
        let target = self.aliases.get(&key).unwrap_or(&key);
        let found = self.functions.get(target).cloned()?;
        lookups.insert(key, Rc::clone(&found));
        Some(found)
    }

    pub fn contains(&self, name: &str) -> bool {
        let key = self.key(name);
        self.functions.contains_key(&key) || self.aliases.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Canonical names, sorted.
    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.values().map(|f| f.name().to_owned()).collect();
        names.sort();
        names
    }

    /// Aliases of `name`, sorted.
    pub fn aliases_of(&self, name: &str) -> Vec<String> {
        let key = self.key(name);
        let mut out: Vec<String> = self
            .aliases
            .iter()
            .filter(|(_, target)| **target == key)
            .map(|(alias, _)| alias.clone())
            .collect();
        out.sort();
        out
    }

    pub fn categories(&self) -> Vec<String> {
        self.categories.keys().cloned().collect()
    }

    pub fn functions_in_category(&self, category: &str) -> Vec<String> {
        self.categories
            .get(category)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ── Search ────────────────────────────────────────────────────────────────

    /// Ranked matches for `query`: exact before prefix before fuzzy, then
    /// by distance, then by name.
    pub fn search(&self, query: &str, kind: SearchKind) -> Vec<SearchMatch> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        let mut best: HashMap<String, SearchMatch> = HashMap::new();
        let mut offer = |name: &str, m: Option<(MatchKind, usize)>| {
            let Some((kind, score)) = m else { return };
            let better = best
                .get(name)
                .map_or(true, |prev| (kind, score) < (prev.kind, prev.score));
            if better {
                best.insert(name.to_owned(), SearchMatch { name: name.to_owned(), kind, score });
            }
        };

        for entry in self.functions.values() {
            let f = entry.function();
            let name = f.name();
            if matches!(kind, SearchKind::Name | SearchKind::All) {
                offer(name, classify(&needle, name));
                for alias in self.aliases_of(name) {
                    offer(name, classify(&needle, &alias));
                }
            }
            if matches!(kind, SearchKind::Category | SearchKind::All) {
                offer(name, classify(&needle, f.category()));
            }
            if matches!(kind, SearchKind::Description | SearchKind::All) {
                offer(name, classify_text(&needle, f.description()));
            }
        }

        let mut out: Vec<SearchMatch> = best.into_values().collect();
        out.sort_by(|a, b| (a.kind, a.score, &a.name).cmp(&(b.kind, b.score, &b.name)));
        out
    }

    /// Up to `max` registered names (canonical or alias) close to `typo`.
    pub fn suggest(&self, typo: &str, max: usize) -> Vec<String> {
        let names: Vec<String> = self
            .functions
            .values()
            .map(|f| f.name().to_owned())
            .chain(self.aliases.keys().cloned())
            .collect();
        suggest_similar(typo, names.iter().map(String::as_str), max)
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let lookups = self.lookups.borrow();
        RegistryStatistics {
            functions: self.functions.len(),
            aliases: self.aliases.len(),
            categories: self.categories.len(),
            lookup_hits: lookups.hits(),
            lookup_misses: lookups.misses(),
            hit_rate: lookups.hit_rate(),
        }
    }
}

fn classify(needle: &str, candidate: &str) -> Option<(MatchKind, usize)> {
    let hay = candidate.to_lowercase();
    if hay == needle {
        Some((MatchKind::Exact, 0))
    } else if hay.starts_with(needle) {
        Some((MatchKind::Prefix, hay.len() - needle.len()))
    } else if hay.contains(needle) {
        Some((MatchKind::Fuzzy, hay.len() - needle.len()))
    } else {
        let d = edit_distance(needle, &hay);
        (d <= threshold(needle.chars().count())).then_some((MatchKind::Fuzzy, d))
    }
}

fn classify_text(needle: &str, text: &str) -> Option<(MatchKind, usize)> {
    let hay = text.to_lowercase();
    if hay.is_empty() {
        None
    } else if hay == needle {
        Some((MatchKind::Exact, 0))
    } else if hay.starts_with(needle) {
        Some((MatchKind::Prefix, 0))
    } else {
        hay.find(needle).map(|at| (MatchKind::Fuzzy, at))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::function::NativeFunction;
    use crate::script::value::SexpResult;

    fn konst(name: &str, category: &str, description: &str) -> Box<dyn SexpFunction> {
        Box::new(
            NativeFunction::new(name, |_| Ok(SexpResult::number(1.0)))
                .with_category(category)
                .with_description(description),
        )
    }

    #[test]
    fn register_and_get() {
        let mut r = FunctionRegistry::default();
        assert!(r.register(konst("+", "arithmetic", "add numbers"), &["add"]));
        assert!(r.get("+").is_some());
        assert!(r.get("missing").is_none());
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn rejects_empty_names() {
        let mut r = FunctionRegistry::default();
        assert!(!r.register(konst("", "x", ""), &[]));
        assert!(!r.register(konst("   ", "x", ""), &[]));
        assert!(r.is_empty());
    }

    #[test]
    fn aliases_resolve_to_same_entry() {
        let mut r = FunctionRegistry::default();
        r.register(konst("+", "arithmetic", ""), &["add", "plus"]);
        let a = r.get("+").unwrap();
        let b = r.get("add").unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(r.aliases_of("+"), vec!["add".to_owned(), "plus".to_owned()]);
    }

    #[test]
    fn later_registration_overwrites() {
        let mut r = FunctionRegistry::default();
        r.register(konst("f", "old", ""), &["g"]);
        let first = r.get("f").unwrap();
        r.register(konst("f", "new", ""), &[]);
        let second = r.get("f").unwrap();
        assert!(!Rc::ptr_eq(&first, &second));
        assert_eq!(second.category(), "new");
        assert!(r.get("g").is_none());
        assert_eq!(r.categories(), vec!["new".to_owned()]);
    }

    #[test]
    fn unregister_removes_aliases_and_category() {
        let mut r = FunctionRegistry::default();
        r.register(konst("f", "misc", ""), &["g"]);
        assert!(r.unregister("f"));
        assert!(!r.unregister("f"));
        assert!(r.get("g").is_none());
        assert!(r.categories().is_empty());
    }

    #[test]
    fn case_policy() {
        let mut sensitive = FunctionRegistry::new(true, 8);
        sensitive.register(konst("Max", "m", ""), &[]);
        assert!(sensitive.get("max").is_none());

        let mut insensitive = FunctionRegistry::new(false, 8);
        insensitive.register(konst("Max", "m", ""), &["BIGGEST"]);
        assert!(insensitive.get("MAX").is_some());
        assert!(insensitive.get("biggest").is_some());
    }

    #[test]
    fn lookup_cache_counts() {
        let mut r = FunctionRegistry::default();
        r.register(konst("f", "m", ""), &[]);
        r.get("f");
        r.get("f");
        r.get("f");
        let stats = r.statistics();
        assert_eq!(stats.lookup_misses, 1);
        assert_eq!(stats.lookup_hits, 2);
    }

    #[test]
    fn search_ranks_exact_prefix_fuzzy() {
        let mut r = FunctionRegistry::default();
        r.register(konst("string", "strings", ""), &[]);
        r.register(konst("string-length", "strings", ""), &[]);
        r.register(konst("substring", "strings", ""), &[]);
        r.register(konst("abs", "arithmetic", ""), &[]);
        let hits = r.search("string", SearchKind::Name);
        let names: Vec<&str> = hits.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["string", "string-length", "substring"]);
        assert_eq!(hits[0].kind, MatchKind::Exact);
        assert_eq!(hits[1].kind, MatchKind::Prefix);
        assert_eq!(hits[2].kind, MatchKind::Fuzzy);
    }

    #[test]
    fn search_by_category_and_description() {
        let mut r = FunctionRegistry::default();
        r.register(konst("abs", "arithmetic", "absolute value"), &[]);
        r.register(konst("not", "logic", "logical negation"), &[]);
        let cat = r.search("arithmetic", SearchKind::Category);
        assert_eq!(cat.len(), 1);
        assert_eq!(cat[0].name, "abs");
        let desc = r.search("negation", SearchKind::Description);
        assert_eq!(desc.len(), 1);
        assert_eq!(desc[0].name, "not");
        assert_eq!(r.search("logic", SearchKind::All)[0].name, "not");
    }

    #[test]
    fn suggestions_for_typos() {
        let mut r = FunctionRegistry::default();
        r.register(konst("string-length", "strings", ""), &[]);
        r.register(konst("max", "arithmetic", ""), &[]);
        assert_eq!(r.suggest("string-lenght", 3), vec!["string-length".to_owned()]);
        assert!(r.suggest("zzzzzzzz", 3).is_empty());
    }
}
