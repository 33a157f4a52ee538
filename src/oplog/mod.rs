//! Durable operation log.
//!
//! Operations are stored in a single RocksDB database as JSON records keyed by id, with
//! secondary index keys for plan, repo and snapshot id:
//!
//! ```text
//! meta/next_id                 -> u64 (big endian)
//! op/<id:be64>                 -> Operation (JSON)
//! idx/plan/<plan_id>\0<id>     -> ()
//! idx/repo/<repo_id>\0<id>     -> ()
//! idx/snap/<snapshot_id>\0<id> -> ()
//! ```
//!
//! Writes are serialized by an internal lock and synced before returning. Reads run
//! against RocksDB snapshots so scans never block, and never observe, a concurrent write
//! half-applied.

use crate::error::{BackrunError, Result};
use crate::types::{Operation, OperationId};
use parking_lot::Mutex;
use rocksdb::{IteratorMode, Options, SnapshotWithThreadMode, WriteBatch, WriteOptions, DB};
use std::path::Path;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const NEXT_ID_KEY: &[u8] = b"meta/next_id";
const OP_PREFIX: &[u8] = b"op/";
const PLAN_INDEX: &[u8] = b"idx/plan/";
const REPO_INDEX: &[u8] = b"idx/repo/";
const SNAPSHOT_INDEX: &[u8] = b"idx/snap/";

/// Change notification emitted after a write is durable.
#[derive(Debug, Clone)]
pub enum OperationEvent {
    Created(Operation),
    Updated(Operation),
}

impl OperationEvent {
    pub fn operation(&self) -> &Operation {
        match self {
            OperationEvent::Created(op) | OperationEvent::Updated(op) => op,
        }
    }
}

/// Durable, queryable store of operations.
pub struct OpLog {
    db: DB,
    /// Serializes writers so ids are never handed out twice.
    write_lock: Mutex<()>,
    events: broadcast::Sender<OperationEvent>,
    read_only: bool,
}

impl OpLog {
    /// Open or create an operation log at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened operation log");

        Ok(Self::with_db(db, false))
    }

    /// Open an existing operation log without taking its lock, so it can be inspected
    /// while a daemon holds it. Sees the operations durable at open time; writes fail.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = DB::open_for_read_only(&Options::default(), path.as_ref(), false)?;
        debug!(path = %path.as_ref().display(), "Opened operation log read-only");
        Ok(Self::with_db(db, true))
    }

    fn with_db(db: DB, read_only: bool) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            db,
            write_lock: Mutex::new(()),
            events,
            read_only,
        }
    }

    /// Subscribe to operation changes.
    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.events.subscribe()
    }

    fn sync_write(&self, batch: WriteBatch) -> Result<()> {
        if self.read_only {
            return Err(BackrunError::Storage(
                "operation log is open read-only".to_string(),
            ));
        }
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    fn op_key(id: OperationId) -> Vec<u8> {
        let mut key = Vec::with_capacity(OP_PREFIX.len() + 8);
        key.extend_from_slice(OP_PREFIX);
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    fn index_prefix(index: &[u8], value: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(index.len() + value.len() + 1);
        key.extend_from_slice(index);
        key.extend_from_slice(value.as_bytes());
        key.push(0);
        key
    }

    fn index_key(index: &[u8], value: &str, id: OperationId) -> Vec<u8> {
        let mut key = Self::index_prefix(index, value);
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    /// Index keys an operation should have.
    fn index_keys(op: &Operation) -> Vec<Vec<u8>> {
        let mut keys = Vec::with_capacity(3);
        if !op.plan_id.is_empty() {
            keys.push(Self::index_key(PLAN_INDEX, &op.plan_id, op.id));
        }
        if !op.repo_id.is_empty() {
            keys.push(Self::index_key(REPO_INDEX, &op.repo_id, op.id));
        }
        if let Some(snapshot_id) = op.snapshot_id.as_deref().filter(|s| !s.is_empty()) {
            keys.push(Self::index_key(SNAPSHOT_INDEX, snapshot_id, op.id));
        }
        keys
    }

    fn load_next_id(&self) -> Result<OperationId> {
        match self.db.get(NEXT_ID_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    BackrunError::Storage("corrupt id counter".to_string())
                })?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(1),
        }
    }

    /// Add a new operation, assigning its id.
    ///
    /// The operation must not already carry an id.
    pub fn add(&self, op: &mut Operation) -> Result<OperationId> {
        if op.id != 0 {
            return Err(BackrunError::InvalidState(format!(
                "operation already has id {}",
                op.id
            )));
        }

        let _guard = self.write_lock.lock();
        let id = self.load_next_id()?;
        op.id = id;

        let mut batch = WriteBatch::default();
        batch.put(NEXT_ID_KEY, (id + 1).to_be_bytes());
        batch.put(Self::op_key(id), serde_json::to_vec(&*op)?);
        for key in Self::index_keys(op) {
            batch.put(key, b"");
        }

        if let Err(e) = self.sync_write(batch) {
            op.id = 0;
            return Err(e);
        }

        debug!(op_id = id, kind = op.kind(), status = %op.status, "Added operation");
        let _ = self.events.send(OperationEvent::Created(op.clone()));
        Ok(id)
    }

    /// Replace a stored operation.
    ///
    /// Rejects unknown ids, transitions out of a terminal status, and rewriting an
    /// already-set snapshot id.
    pub fn update(&self, op: &Operation) -> Result<()> {
        let _guard = self.write_lock.lock();
        let existing = self
            .read_op(op.id)?
            .ok_or_else(|| BackrunError::NotFound(format!("operation {}", op.id)))?;

        if existing.status.is_terminal() && existing.status != op.status {
            return Err(BackrunError::InvalidState(format!(
                "operation {} is already {}",
                op.id, existing.status
            )));
        }
        if let Some(previous) = existing.snapshot_id.as_deref() {
            if op.snapshot_id.as_deref() != Some(previous) {
                return Err(BackrunError::InvalidState(format!(
                    "operation {} snapshot id is immutable",
                    op.id
                )));
            }
        }

        let mut batch = WriteBatch::default();
        for key in Self::index_keys(&existing) {
            batch.delete(key);
        }
        for key in Self::index_keys(op) {
            batch.put(key, b"");
        }
        batch.put(Self::op_key(op.id), serde_json::to_vec(op)?);
        self.sync_write(batch)?;

        debug!(op_id = op.id, kind = op.kind(), status = %op.status, "Updated operation");
        let _ = self.events.send(OperationEvent::Updated(op.clone()));
        Ok(())
    }

    fn read_op(&self, id: OperationId) -> Result<Option<Operation>> {
        match self.db.get(Self::op_key(id))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Get an operation by id.
    pub fn get(&self, id: OperationId) -> Result<Operation> {
        self.read_op(id)?
            .ok_or_else(|| BackrunError::NotFound(format!("operation {}", id)))
    }

    fn for_index(&self, index: &[u8], value: &str) -> Result<Vec<Operation>> {
        let snapshot = self.db.snapshot();
        let prefix = Self::index_prefix(index, value);
        let mut ops = Vec::new();

        let iter = snapshot.iterator(IteratorMode::From(&prefix, rocksdb::Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let raw: [u8; 8] = key[prefix.len()..].try_into().map_err(|_| {
                BackrunError::Storage("corrupt index key".to_string())
            })?;
            let id = u64::from_be_bytes(raw);
            match Self::read_in(&snapshot, id)? {
                Some(op) => ops.push(op),
                None => warn!(op_id = id, "Index refers to missing operation"),
            }
        }

        Ok(ops)
    }

    fn read_in(snapshot: &SnapshotWithThreadMode<'_, DB>, id: OperationId) -> Result<Option<Operation>> {
        match snapshot.get(Self::op_key(id))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Operations belonging to a plan, in id order.
    pub fn for_plan(&self, plan_id: &str) -> Result<Vec<Operation>> {
        self.for_index(PLAN_INDEX, plan_id)
    }

    /// Operations targeting a repo, in id order.
    pub fn for_repo(&self, repo_id: &str) -> Result<Vec<Operation>> {
        self.for_index(REPO_INDEX, repo_id)
    }

    /// Operations referring to a snapshot, in id order.
    pub fn for_snapshot(&self, snapshot_id: &str) -> Result<Vec<Operation>> {
        self.for_index(SNAPSHOT_INDEX, snapshot_id)
    }

    /// Visit every operation in id order.
    ///
    /// Each call scans a fresh point-in-time view. Returning an error from `visit` stops the
    /// scan and is passed through.
    pub fn for_all<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(Operation) -> Result<()>,
    {
        let snapshot = self.db.snapshot();
        let iter = snapshot.iterator(IteratorMode::From(OP_PREFIX, rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(OP_PREFIX) {
                break;
            }
            visit(serde_json::from_slice(&value)?)?;
        }
        Ok(())
    }

    /// Collect every operation in id order.
    pub fn all(&self) -> Result<Vec<Operation>> {
        let mut ops = Vec::new();
        self.for_all(|op| {
            ops.push(op);
            Ok(())
        })?;
        Ok(ops)
    }
}
