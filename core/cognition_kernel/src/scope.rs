//! Lexical variable frames for LET, plus an optional durable side table.
//!
//! Frames form a parent chain walked innermost-first on lookup. A frame's
//! lifetime is exactly the dynamic extent of the LET that created it; the
//! evaluator drops its `Arc` on every exit path, so bindings cannot leak
//! into the parent scope.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use ail_types::{CognitionError, CognitionId};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

pub struct Frame {
    parent: Option<Arc<Frame>>,
    scope_level: usize,
    bindings: RwLock<HashMap<String, Value>>,
    /// Cognition ids whose results were bound in this frame.
    result_ids: RwLock<HashSet<CognitionId>>,
}

impl Frame {
    /// The root frame of one execute call. Level 0.
    pub fn root() -> Arc<Frame> {
        Arc::new(Frame {
            parent: None,
            scope_level: 0,
            bindings: RwLock::new(HashMap::new()),
            result_ids: RwLock::new(HashSet::new()),
        })
    }

    /// A child frame one level deeper, owned by the LET that created it.
    pub fn child(parent: &Arc<Frame>) -> Arc<Frame> {
        Arc::new(Frame {
            parent: Some(parent.clone()),
            scope_level: parent.scope_level + 1,
            bindings: RwLock::new(HashMap::new()),
            result_ids: RwLock::new(HashSet::new()),
        })
    }

    pub fn scope_level(&self) -> usize {
        self.scope_level
    }

    /// Install a binding in this frame.
    pub fn set(&self, name: &str, value: Value) {
        match self.bindings.write() {
            Ok(mut bindings) => {
                bindings.insert(name.to_string(), value);
            }
            Err(poisoned) => {
                warn!(name, "frame lock poisoned on set");
                poisoned.into_inner().insert(name.to_string(), value);
            }
        }
    }

    /// Look up a name, walking from this frame to the root.
    pub fn get(&self, name: &str) -> Option<Value> {
        let local = self
            .bindings
            .read()
            .map(|bindings| bindings.get(name).cloned())
            .unwrap_or(None);
        match local {
            Some(value) => Some(value),
            None => self.parent.as_deref().and_then(|parent| parent.get(name)),
        }
    }

    pub fn record_result(&self, cognition_id: CognitionId) {
        if let Ok(mut ids) = self.result_ids.write() {
            ids.insert(cognition_id);
        }
    }
}

/// One row of the durable variable side table.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredVariable {
    pub root_cognition_id: CognitionId,
    pub scope_level: usize,
    pub name: String,
    pub value: Value,
}

/// Durable variable-storage side table for debugging and inspection.
///
/// Keyed by `(root_cognition_id, scope_level, name)`. Contents are read-only
/// from outside the core and removed when the root execute call completes.
pub struct VariableStore {
    tree: sled::Tree,
    _db: sled::Db,
}

impl VariableStore {
    pub fn open(path: &str) -> Result<Self, CognitionError> {
        let db = sled::open(path)
            .map_err(|e| CognitionError::Internal(format!("variable store open failed: {e}")))?;
        let tree = db
            .open_tree("variables")
            .map_err(|e| CognitionError::Internal(format!("variable store tree failed: {e}")))?;
        Ok(VariableStore { tree, _db: db })
    }

    fn key(root: &Uuid, scope_level: usize, name: &str) -> String {
        format!("{root}/{scope_level:04}/{name}")
    }

    /// Persist one binding. Failures are logged and swallowed; the side
    /// table never changes execution results.
    pub fn persist(&self, root: &Uuid, scope_level: usize, name: &str, value: &Value) {
        let key = Self::key(root, scope_level, name);
        let encoded = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%root, name, "variable not serializable: {e}");
                return;
            }
        };
        if let Err(e) = self.tree.insert(key.as_bytes(), encoded) {
            warn!(%root, name, "variable store write failed: {e}");
        }
    }

    /// All bindings persisted for one execute call, ordered by scope level
    /// then name.
    pub fn snapshot(&self, root: &Uuid) -> Vec<StoredVariable> {
        let prefix = format!("{root}/");
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let Ok((key, raw)) = item else { continue };
            let Ok(key) = std::str::from_utf8(&key) else { continue };
            let mut parts = key.splitn(3, '/');
            let (Some(_), Some(level), Some(name)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Ok(scope_level) = level.parse::<usize>() else { continue };
            let Ok(value) = serde_json::from_slice(&raw) else { continue };
            out.push(StoredVariable {
                root_cognition_id: *root,
                scope_level,
                name: name.to_string(),
                value,
            });
        }
        out
    }

    /// Drop everything persisted for one execute call.
    pub fn clear_root(&self, root: &Uuid) {
        let prefix = format!("{root}/");
        let keys: Vec<sled::IVec> = self
            .tree
            .scan_prefix(prefix.as_bytes())
            .filter_map(|item| item.ok().map(|(key, _)| key))
            .collect();
        for key in keys {
            if let Err(e) = self.tree.remove(&key) {
                warn!(%root, "variable store cleanup failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_walks_parent_chain() {
        let root = Frame::root();
        root.set("outer", json!("o"));

        let child = Frame::child(&root);
        child.set("inner", json!("i"));

        assert_eq!(child.get("inner"), Some(json!("i")));
        assert_eq!(child.get("outer"), Some(json!("o")));
        assert_eq!(child.get("missing"), None);
        assert_eq!(child.scope_level(), 1);
    }

    #[test]
    fn inner_binding_shadows_outer() {
        let root = Frame::root();
        root.set("x", json!(1));
        let child = Frame::child(&root);
        child.set("x", json!(2));

        assert_eq!(child.get("x"), Some(json!(2)));
        assert_eq!(root.get("x"), Some(json!(1)));
    }

    #[test]
    fn bindings_do_not_leak_to_parent() {
        let root = Frame::root();
        {
            let child = Frame::child(&root);
            child.set("temp", json!("gone"));
        }
        assert_eq!(root.get("temp"), None);
    }

    #[test]
    fn side_table_round_trip_and_cleanup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            VariableStore::open(dir.path().to_str().expect("utf8 path")).expect("open store");

        let root = Uuid::new_v4();
        store.persist(&root, 1, "x", &json!("42"));
        store.persist(&root, 2, "y", &json!([1, 2]));

        let snapshot = store.snapshot(&root);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "x");
        assert_eq!(snapshot[0].scope_level, 1);
        assert_eq!(snapshot[1].value, json!([1, 2]));

        store.clear_root(&root);
        assert!(store.snapshot(&root).is_empty());
    }
}
