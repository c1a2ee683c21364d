//! Storage Module
//!
//! A transactional, in-memory hierarchical document store. Base
//! documents live in one rooted tree of [`Value`]s; reads and writes go
//! through transactions.
//!
//! ## Transaction model
//!
//! - Read transactions are optimistic and lock-free: they pin the
//!   committed snapshot at creation and never block.
//! - Write transactions serialize with other writers (a writer lock is
//!   held from creation to commit/abort) and stage changes in a private
//!   copy. Commit publishes the staged tree atomically; concurrent
//!   readers see either the whole pre-commit state or the whole
//!   post-commit state, never a mix.
//! - Triggers registered on the store fire synchronously inside the
//!   commit critical section, in registration order, and observe the
//!   post-commit state.
//!
//! Write operations follow JSON-Patch semantics: `add` inserts into
//! arrays and upserts into objects, `replace` and `remove` require the
//! target to exist.

pub mod error;

pub use error::{StorageError, StorageResult};

use crate::value::Value;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// Write operation kinds, JSON-Patch style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

/// A path into the document tree. Segments address object keys; array
/// elements are addressed by decimal indices (or `-` for append).
pub type Path = Vec<String>;

/// Parse a `/`-separated path string. The empty string and `/` both
/// address the root.
pub fn parse_path(s: &str) -> Path {
    s.split('/')
        .filter(|seg| !seg.is_empty())
        .map(String::from)
        .collect()
}

/// Trigger callback invoked after each commit with the changed paths.
pub type Trigger = Box<dyn Fn(&TriggerEvent) + Send + Sync>;

/// Fired on commit; `changed` holds the set of written paths.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub changed: Vec<Path>,
}

struct StoreInner {
    /// Committed document tree, swapped atomically on commit.
    data: ArcSwap<Value>,
    /// Serializes writers; held by each write transaction.
    writer: Arc<Mutex<()>>,
    triggers: Mutex<Vec<Trigger>>,
    txn_counter: AtomicU64,
}

/// The document store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

impl Store {
    /// An empty store (root is an empty object).
    pub fn new() -> Self {
        Store::from_value(Value::empty_object())
    }

    /// A store seeded with an initial document tree.
    pub fn from_value(root: Value) -> Self {
        Store {
            inner: Arc::new(StoreInner {
                data: ArcSwap::from_pointee(root),
                writer: Arc::new(Mutex::new(())),
                triggers: Mutex::new(Vec::new()),
                txn_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Begin a transaction. A write transaction blocks until any other
    /// writer finishes.
    pub fn new_transaction(&self, mode: Mode) -> Transaction {
        let guard = match mode {
            Mode::Read => None,
            Mode::Write => Some(Mutex::lock_arc(&self.inner.writer)),
        };
        // Snapshot after acquiring the writer lock so a writer starts
        // from the latest committed state.
        let snapshot = self.inner.data.load_full();
        Transaction {
            id: self.inner.txn_counter.fetch_add(1, Ordering::Relaxed),
            mode,
            snapshot,
            staged: None,
            changed: BTreeSet::new(),
            _writer: guard,
        }
    }

    /// The committed root document (no transaction required).
    pub fn snapshot(&self) -> Arc<Value> {
        self.inner.data.load_full()
    }

    /// Read the sub-document at `path` within the transaction's view.
    pub fn read(&self, txn: &Transaction, path: &[String]) -> StorageResult<Value> {
        let root = txn.view();
        lookup(root, path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.join("/")))
    }

    /// Stage a write. Only valid in write mode.
    pub fn write(
        &self,
        txn: &mut Transaction,
        op: PatchOp,
        path: &[String],
        value: Value,
    ) -> StorageResult<()> {
        if txn.mode != Mode::Write {
            return Err(StorageError::ReadOnly);
        }
        let staged = txn.staged.get_or_insert_with(|| (*txn.snapshot).clone());
        patch(staged, op, path, value)?;
        txn.changed.insert(path.to_vec());
        Ok(())
    }

    /// Publish the transaction's writes and fire triggers. Read
    /// transactions commit trivially.
    pub fn commit(&self, txn: Transaction) -> StorageResult<()> {
        self.commit_with(txn, || {})
    }

    /// Commit, running `hook` inside the commit critical section right
    /// after the data swap. Bundle activation swaps the compiled policy
    /// here so data and policy change together or not at all.
    pub fn commit_with(&self, mut txn: Transaction, hook: impl FnOnce()) -> StorageResult<()> {
        if txn.mode == Mode::Read {
            return Ok(());
        }
        if let Some(staged) = txn.staged.take() {
            self.inner.data.store(Arc::new(staged));
            hook();
            let event = TriggerEvent {
                changed: txn.changed.iter().cloned().collect(),
            };
            let triggers = self.inner.triggers.lock();
            for trigger in triggers.iter() {
                trigger(&event);
            }
        } else {
            hook();
        }
        // Writer guard drops here, releasing the critical section.
        Ok(())
    }

    /// Discard the transaction's writes.
    pub fn abort(&self, txn: Transaction) {
        drop(txn);
    }

    /// Register a commit trigger. Triggers fire in registration order.
    pub fn register(&self, trigger: Trigger) {
        self.inner.triggers.lock().push(trigger);
    }

    /// Top-level keys of the committed root, used by the compiler's
    /// base/virtual overlap check.
    pub fn base_paths(&self) -> Vec<Path> {
        match &*self.snapshot() {
            Value::Object(map) => map
                .keys()
                .filter_map(|k| k.as_str().map(|s| vec![s.to_string()]))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A transaction handle. Dropping without commit aborts.
pub struct Transaction {
    pub id: u64,
    mode: Mode,
    snapshot: Arc<Value>,
    staged: Option<Value>,
    changed: BTreeSet<Path>,
    _writer: Option<parking_lot::ArcMutexGuard<parking_lot::RawMutex, ()>>,
}

impl Transaction {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The tree this transaction sees: staged changes if any, else the
    /// snapshot taken at creation.
    fn view(&self) -> &Value {
        self.staged.as_ref().unwrap_or(&self.snapshot)
    }
}

// ----------------------------------------------------------------------
// Tree operations
// ----------------------------------------------------------------------

fn lookup<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(&Value::String(segment.clone()))?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Apply one JSON-Patch operation to the tree in place.
fn patch(root: &mut Value, op: PatchOp, path: &[String], value: Value) -> StorageResult<()> {
    let Some((last, parents)) = path.split_last() else {
        // Operating on the root itself.
        return match op {
            PatchOp::Add | PatchOp::Replace => {
                if !matches!(value, Value::Object(_)) {
                    return Err(StorageError::Invariant(
                        "root document must be an object".to_string(),
                    ));
                }
                *root = value;
                Ok(())
            }
            PatchOp::Remove => {
                *root = Value::empty_object();
                Ok(())
            }
        };
    };

    let parent = lookup_mut(root, parents)
        .ok_or_else(|| StorageError::NotFound(parents.join("/")))?;

    match parent {
        Value::Object(map) => {
            let key = Value::String(last.clone());
            match op {
                PatchOp::Add => {
                    map.insert(key, value);
                }
                PatchOp::Replace => {
                    if !map.contains_key(&key) {
                        return Err(StorageError::NotFound(path.join("/")));
                    }
                    map.insert(key, value);
                }
                PatchOp::Remove => {
                    if map.remove(&key).is_none() {
                        return Err(StorageError::NotFound(path.join("/")));
                    }
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            match op {
                PatchOp::Add => {
                    if last == "-" {
                        items.push(value);
                        return Ok(());
                    }
                    let idx: usize = last
                        .parse()
                        .map_err(|_| StorageError::Invariant(format!("bad array index '{last}'")))?;
                    if idx > items.len() {
                        return Err(StorageError::NotFound(path.join("/")));
                    }
                    items.insert(idx, value);
                }
                PatchOp::Replace => {
                    let idx: usize = last
                        .parse()
                        .map_err(|_| StorageError::Invariant(format!("bad array index '{last}'")))?;
                    let slot = items
                        .get_mut(idx)
                        .ok_or_else(|| StorageError::NotFound(path.join("/")))?;
                    *slot = value;
                }
                PatchOp::Remove => {
                    let idx: usize = last
                        .parse()
                        .map_err(|_| StorageError::Invariant(format!("bad array index '{last}'")))?;
                    if idx >= items.len() {
                        return Err(StorageError::NotFound(path.join("/")));
                    }
                    items.remove(idx);
                }
            }
            Ok(())
        }
        other => Err(StorageError::Invariant(format!(
            "cannot write into {} at /{}",
            other.type_name(),
            parents.join("/")
        ))),
    }
}

fn lookup_mut<'a>(root: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get_mut(&Value::String(segment.clone()))?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get_mut(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn store_with(json: &str) -> Store {
        Store::from_value(Value::from_json_str(json).expect("json"))
    }

    #[test]
    fn test_read_committed() {
        let store = store_with(r#"{"a":{"b":1}}"#);
        let txn = store.new_transaction(Mode::Read);
        let v = store.read(&txn, &parse_path("/a/b")).unwrap();
        assert_eq!(v, Value::number(1));
    }

    #[test]
    fn test_read_missing_path() {
        let store = store_with(r#"{"a":1}"#);
        let txn = store.new_transaction(Mode::Read);
        assert!(matches!(
            store.read(&txn, &parse_path("/a/b")),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_write_not_visible_before_commit() {
        let store = store_with(r#"{"x":1}"#);
        let mut txn = store.new_transaction(Mode::Write);
        store
            .write(&mut txn, PatchOp::Replace, &parse_path("/x"), Value::number(2))
            .unwrap();

        let reader = store.new_transaction(Mode::Read);
        assert_eq!(
            store.read(&reader, &parse_path("/x")).unwrap(),
            Value::number(1)
        );

        store.commit(txn).unwrap();
        let reader = store.new_transaction(Mode::Read);
        assert_eq!(
            store.read(&reader, &parse_path("/x")).unwrap(),
            Value::number(2)
        );
    }

    #[test]
    fn test_abort_discards() {
        let store = store_with(r#"{"x":1}"#);
        let mut txn = store.new_transaction(Mode::Write);
        store
            .write(&mut txn, PatchOp::Replace, &parse_path("/x"), Value::number(9))
            .unwrap();
        store.abort(txn);

        let reader = store.new_transaction(Mode::Read);
        assert_eq!(
            store.read(&reader, &parse_path("/x")).unwrap(),
            Value::number(1)
        );
    }

    #[test]
    fn test_replace_requires_existence() {
        let store = store_with("{}");
        let mut txn = store.new_transaction(Mode::Write);
        let err = store
            .write(&mut txn, PatchOp::Replace, &parse_path("/nope"), Value::Null)
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_remove_requires_existence() {
        let store = store_with("{}");
        let mut txn = store.new_transaction(Mode::Write);
        let err = store
            .write(&mut txn, PatchOp::Remove, &parse_path("/nope"), Value::Null)
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_array_add_inserts() {
        let store = store_with(r#"{"xs":[1,3]}"#);
        let mut txn = store.new_transaction(Mode::Write);
        store
            .write(&mut txn, PatchOp::Add, &parse_path("/xs/1"), Value::number(2))
            .unwrap();
        store.commit(txn).unwrap();

        let reader = store.new_transaction(Mode::Read);
        let xs = store.read(&reader, &parse_path("/xs")).unwrap();
        assert_eq!(
            xs,
            Value::Array(vec![Value::number(1), Value::number(2), Value::number(3)])
        );
    }

    #[test]
    fn test_array_append() {
        let store = store_with(r#"{"xs":[]}"#);
        let mut txn = store.new_transaction(Mode::Write);
        store
            .write(&mut txn, PatchOp::Add, &parse_path("/xs/-"), Value::number(7))
            .unwrap();
        store.commit(txn).unwrap();

        let reader = store.new_transaction(Mode::Read);
        let xs = store.read(&reader, &parse_path("/xs")).unwrap();
        assert_eq!(xs, Value::Array(vec![Value::number(7)]));
    }

    #[test]
    fn test_write_in_read_txn_rejected() {
        let store = store_with("{}");
        let mut txn = store.new_transaction(Mode::Read);
        let err = store
            .write(&mut txn, PatchOp::Add, &parse_path("/x"), Value::Null)
            .unwrap_err();
        assert!(matches!(err, StorageError::ReadOnly));
    }

    #[test]
    fn test_triggers_fire_in_order_with_changed_paths() {
        let store = store_with("{}");
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c1 = Arc::clone(&calls);
        store.register(Box::new(move |event| {
            c1.lock().push(("first", event.changed.clone()));
        }));
        let c2 = Arc::clone(&calls);
        store.register(Box::new(move |event| {
            c2.lock().push(("second", event.changed.clone()));
        }));

        let mut txn = store.new_transaction(Mode::Write);
        store
            .write(&mut txn, PatchOp::Add, &parse_path("/a"), Value::number(1))
            .unwrap();
        store.commit(txn).unwrap();

        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "first");
        assert_eq!(calls[1].0, "second");
        assert_eq!(calls[0].1, vec![vec!["a".to_string()]]);
    }

    #[test]
    fn test_txn_ids_increase() {
        let store = store_with("{}");
        let t1 = store.new_transaction(Mode::Read);
        let t2 = store.new_transaction(Mode::Read);
        assert!(t2.id > t1.id);
    }

    #[test]
    fn test_reader_pins_snapshot() {
        let store = store_with(r#"{"x":1}"#);
        let reader = store.new_transaction(Mode::Read);

        let mut writer = store.new_transaction(Mode::Write);
        store
            .write(&mut writer, PatchOp::Replace, &parse_path("/x"), Value::number(2))
            .unwrap();
        store.commit(writer).unwrap();

        // The old reader still sees the state from its creation.
        assert_eq!(
            store.read(&reader, &parse_path("/x")).unwrap(),
            Value::number(1)
        );
    }

    #[test]
    fn test_writers_serialize() {
        let store = store_with(r#"{"n":0}"#);
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    let mut txn = store.new_transaction(Mode::Write);
                    let current = store.read(&txn, &parse_path("/n")).unwrap();
                    let n = current.as_number().unwrap().as_i64().unwrap();
                    store
                        .write(
                            &mut txn,
                            PatchOp::Replace,
                            &parse_path("/n"),
                            Value::number(n + 1),
                        )
                        .unwrap();
                    store.commit(txn).unwrap();
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let txn = store.new_transaction(Mode::Read);
        assert_eq!(
            store.read(&txn, &parse_path("/n")).unwrap(),
            Value::number(40)
        );
    }
}
