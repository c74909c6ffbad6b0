use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard};
use serde_json::{Map, Value};

use crate::errors::PolicyError;

/// Slash separated location inside the data document, e.g. `policies/allowed_tools`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct StorePath(Vec<String>);

impl StorePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let trimmed = raw.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(PolicyError::InvalidPath(raw.to_string()));
            }
            segments.push(segment.to_string());
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0.join("/"))
    }
}

#[derive(Clone, Debug)]
pub struct StoreSnapshot {
    pub revision: u64,
    pub data: Value,
}

/// In-memory JSON document behind the policy `data` namespace.
///
/// Readers always see the last committed snapshot. Writers are serialized
/// and stage their changes on a private copy until commit.
pub struct PolicyStore {
    committed: ArcSwap<StoreSnapshot>,
    writer: Mutex<()>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    pub fn new() -> Self {
        Self {
            committed: ArcSwap::from_pointee(StoreSnapshot {
                revision: 0,
                data: Value::Object(Map::new()),
            }),
            writer: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.committed.load_full()
    }

    pub fn revision(&self) -> u64 {
        self.committed.load().revision
    }

    pub fn get(&self, path: &StorePath) -> Option<Value> {
        let snapshot = self.committed.load();
        let mut cursor = &snapshot.data;
        for segment in path.segments() {
            cursor = cursor.as_object()?.get(segment)?;
        }
        Some(cursor.clone())
    }

    pub fn begin(&self) -> WriteTransaction<'_> {
        let guard = self.writer.lock();
        let base = self.committed.load_full();
        WriteTransaction {
            store: self,
            _writer: guard,
            revision: base.revision,
            staged: base.data.clone(),
            writes: 0,
        }
    }

    /// Single write committed on success, discarded on failure.
    pub fn write(&self, path: &StorePath, value: Value) -> Result<u64, PolicyError> {
        let mut txn = self.begin();
        txn.write(path, value)?;
        Ok(txn.commit())
    }
}

/// Exclusive write transaction. Dropping it without `commit` aborts.
pub struct WriteTransaction<'a> {
    store: &'a PolicyStore,
    _writer: MutexGuard<'a, ()>,
    revision: u64,
    staged: Value,
    writes: usize,
}

impl<'a> WriteTransaction<'a> {
    pub fn write(&mut self, path: &StorePath, value: Value) -> Result<(), PolicyError> {
        write_at(&mut self.staged, path, value)?;
        self.writes += 1;
        Ok(())
    }

    /// Document as it would look after commit.
    pub fn staged(&self) -> &Value {
        &self.staged
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn commit(self) -> u64 {
        if self.writes == 0 {
            return self.revision;
        }
        let revision = self.revision.saturating_add(1);
        self.store.committed.store(Arc::new(StoreSnapshot {
            revision,
            data: self.staged,
        }));
        revision
    }

    pub fn abort(self) {}
}

fn write_at(document: &mut Value, path: &StorePath, value: Value) -> Result<(), PolicyError> {
    let Some((last, parents)) = path.segments().split_last() else {
        if !value.is_object() {
            return Err(PolicyError::Store {
                path: path.to_string(),
                message: "root document must be an object".into(),
            });
        }
        *document = value;
        return Ok(());
    };

    let mut cursor = document;
    for (depth, segment) in parents.iter().enumerate() {
        let Value::Object(map) = cursor else {
            return Err(not_an_object(path, depth));
        };
        cursor = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let Value::Object(map) = cursor else {
        return Err(not_an_object(path, parents.len()));
    };
    map.insert(last.clone(), value);
    Ok(())
}

fn not_an_object(path: &StorePath, depth: usize) -> PolicyError {
    let prefix = &path.segments()[..depth];
    PolicyError::Store {
        path: path.to_string(),
        message: format!("/{} is not an object", prefix.join("/")),
    }
}
