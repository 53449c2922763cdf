//! Durable storage for the CAMPAIGN and GLOBAL variable scopes.
//!
//! One JSON document per scope, named after it (`campaign.json`,
//! `global.json`):
//!
//! ```json
//! { "version": 1, "scope": "campaign",
//!   "variables": { "score": { "type": "number", "value": 12,
//!                             "constraints": {}, "metadata": { … } } } }
//! ```
//!
//! Saves go through a temporary file in the same directory that is then
//! renamed over the target, so a crash never leaves a half-written file.
//! On load, entries that fail to decode are skipped with a warning; the
//! rest of the scope still loads.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::script::value::{ErrorKind, ObjectRef, ResultType, SexpError, SexpResult, Value};
use crate::var::{Constraints, Scope};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not replace {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unsupported storage format version {0}")]
    UnsupportedVersion(u32),
    #[error("scope {0} is never persisted")]
    NotPersistent(Scope),
    #[error("cannot decode {kind} value: {reason}")]
    BadValue { kind: ResultType, reason: String },
}

// ── Encoded values ────────────────────────────────────────────────────────────

/// A result in its storable form: the type tag plus a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredValue {
    #[serde(rename = "type")]
    pub kind: ResultType,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorPayload {
    kind: ErrorKind,
    message: String,
}

impl StoredValue {
    /// Object references keep only their id; errors keep kind and message.
    pub fn encode(result: &SexpResult) -> Self {
        let value = match result.value() {
            Value::Number(n)  => json!(n),
            Value::Str(s)     => json!(s),
            Value::Boolean(b) => json!(b),
            Value::Void       => serde_json::Value::Null,
            Value::Error(e)   => json!({ "kind": e.kind, "message": e.message }),
            Value::Object(o)  => json!(o.id()),
        };
        StoredValue { kind: result.result_type(), value }
    }

    /// Object references come back detached: the id survives, the target
    /// does not.
    pub fn decode(&self) -> Result<SexpResult, StoreError> {
        let bad = |reason: &str| StoreError::BadValue { kind: self.kind, reason: reason.to_owned() };
        Ok(match self.kind {
            ResultType::Number => SexpResult::number(self.value.as_f64().ok_or_else(|| bad("not a number"))?),
            ResultType::String => SexpResult::string(self.value.as_str().ok_or_else(|| bad("not a string"))?),
            ResultType::Boolean => SexpResult::boolean(self.value.as_bool().ok_or_else(|| bad("not a boolean"))?),
            ResultType::Void => SexpResult::void(),
            ResultType::Error => {
                let p: ErrorPayload = serde_json::from_value(self.value.clone())?;
                SexpError::new(p.kind, p.message).into()
            }
            ResultType::ObjectReference => {
                let id = self.value.as_str().ok_or_else(|| bad("missing object id"))?;
                SexpResult::object(ObjectRef::detached(id))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMetadata {
    #[serde(default)]
    pub access_count: u64,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub modified: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredVariable {
    #[serde(flatten)]
    pub value: StoredValue,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub metadata: StoredMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScopeFile {
    version: u32,
    scope: Scope,
    #[serde(default)]
    variables: BTreeMap<String, serde_json::Value>,
}

pub fn to_epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

pub fn from_epoch_secs(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

// ── VariableStore ─────────────────────────────────────────────────────────────

/// A directory holding one file per persisted scope.
#[derive(Debug, Clone)]
pub struct VariableStore {
    dir: PathBuf,
}

impl VariableStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        VariableStore { dir: dir.into() }
    }

    /// The platform data directory (e.g. `~/.local/share/sexp`).
    pub fn default_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "sexp").map(|d| d.data_dir().to_path_buf())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, scope: Scope) -> PathBuf {
        self.dir.join(format!("{}.json", scope.name()))
    }

    pub fn save(&self, scope: Scope, variables: &BTreeMap<String, StoredVariable>) -> Result<(), StoreError> {
        if !scope.is_persistent() {
            return Err(StoreError::NotPersistent(scope));
        }
        let encoded = variables
            .iter()
            .map(|(name, v)| Ok((name.clone(), serde_json::to_value(v)?)))
            .collect::<Result<BTreeMap<_, _>, serde_json::Error>>()?;
        let file = ScopeFile { version: FORMAT_VERSION, scope, variables: encoded };

        fs::create_dir_all(&self.dir)?;
        let path = self.path(scope);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut tmp, &file)?;
        tmp.write_all(b"\n")?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| StoreError::Persist { path: path.clone(), source: e.error })?;
        debug!(path = %path.display(), count = variables.len(), "saved scope");
        Ok(())
    }

    /// A missing file is an empty scope.
    pub fn load(&self, scope: Scope) -> Result<BTreeMap<String, StoredVariable>, StoreError> {
        if !scope.is_persistent() {
            return Err(StoreError::NotPersistent(scope));
        }
        let path = self.path(scope);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let file: ScopeFile = serde_json::from_str(&text)?;
        if file.version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion(file.version));
        }
        if file.scope != scope {
            warn!(path = %path.display(), expected = %scope, found = %file.scope, "scope file names another scope");
        }

        let mut out = BTreeMap::new();
        for (name, raw) in file.variables {
            let decoded = serde_json::from_value::<StoredVariable>(raw)
                .map_err(StoreError::from)
                .and_then(|v| v.value.decode().map(|_| v));
            match decoded {
                Ok(v) => {
                    out.insert(name, v);
                }
                Err(e) => warn!(%name, %scope, error = %e, "skipping unreadable variable"),
            }
        }
        debug!(path = %path.display(), count = out.len(), "loaded scope");
        Ok(out)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn var(result: SexpResult) -> StoredVariable {
        StoredVariable {
            value: StoredValue::encode(&result),
            constraints: Constraints::default(),
            metadata: StoredMetadata { access_count: 3, created: 10, modified: 20 },
        }
    }

    #[test]
    fn encodes_values() {
        assert_eq!(StoredValue::encode(&SexpResult::number(2.5)).value, json!(2.5));
        assert_eq!(StoredValue::encode(&SexpResult::string("hi")).value, json!("hi"));
        assert_eq!(StoredValue::encode(&SexpResult::void()).value, serde_json::Value::Null);
        let e = StoredValue::encode(&SexpResult::failure(ErrorKind::DivisionByZero, "x"));
        assert_eq!(e.decode().unwrap().error_kind(), Some(ErrorKind::DivisionByZero));
    }

    #[test]
    fn decode_rejects_mismatched_payload() {
        let v = StoredValue { kind: ResultType::Number, value: json!("twelve") };
        assert!(matches!(v.decode(), Err(StoreError::BadValue { .. })));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = VariableStore::new(dir.path());
        let mut vars = BTreeMap::new();
        vars.insert("score".to_owned(), var(SexpResult::number(12.0)));
        vars.insert("name".to_owned(), var(SexpResult::string("alpha")));
        store.save(Scope::Campaign, &vars).unwrap();

        assert!(store.path(Scope::Campaign).exists());
        let loaded = store.load(Scope::Campaign).unwrap();
        assert_eq!(loaded, vars);
        assert!(store.load(Scope::Global).unwrap().is_empty());
    }

    #[test]
    fn local_scope_is_never_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = VariableStore::new(dir.path());
        let err = store.save(Scope::Local, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, StoreError::NotPersistent(Scope::Local)));
        assert!(!store.path(Scope::Local).exists());
    }

    #[test]
    fn bad_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = VariableStore::new(dir.path());
        let text = r#"{
            "version": 1,
            "scope": "global",
            "variables": {
                "good": { "type": "boolean", "value": true },
                "bad":  { "type": "number", "value": "oops" },
                "worse": 42
            }
        }"#;
        fs::write(store.path(Scope::Global), text).unwrap();
        let loaded = store.load(Scope::Global).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["good"].value.decode().unwrap(), SexpResult::boolean(true));
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = VariableStore::new(dir.path());
        fs::write(store.path(Scope::Global), r#"{"version": 9, "scope": "global"}"#).unwrap();
        assert!(matches!(store.load(Scope::Global), Err(StoreError::UnsupportedVersion(9))));
    }

    #[test]
    fn epoch_conversion() {
        let t = from_epoch_secs(1_700_000_000);
        assert_eq!(to_epoch_secs(t), 1_700_000_000);
    }
}
