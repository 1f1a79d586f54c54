//! Versioned append-only key-value log.
//!
//! Every effective write occupies one sequence number. Seq 0 is the header
//! block, so a fresh log has version 1 and the n-th write gets seq n. The
//! state visible at version `v` contains exactly the writes with `seq < v`;
//! each version is kept as an `im::OrdMap`, so checkouts are O(1) clones
//! sharing structure with the head.

pub mod batch;
pub mod feed;
pub mod store;
pub mod view;

pub use batch::Batch;
pub use feed::{FeedHandle, FeedReadStream};
pub use store::LogStore;
pub use view::{KeyRange, LogView, ViewScan};

use crate::error::DbError;
use crate::lib_helpers::now_micros;
use crate::wal::file::WalFile;
use crate::wal::frame::{Frame, FrameKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, RwLockReadGuard, watch};
use tracing::debug;

pub(crate) type Tree = im::OrdMap<String, Arc<LogEntry>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub key: String,
    pub value: Value,
    pub seq: u64,
}

/// One key's before/after pair between two versions.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    pub left: Option<LogEntry>,
    pub right: Option<LogEntry>,
}

impl DiffEntry {
    pub fn key(&self) -> &str {
        self.right
            .as_ref()
            .or(self.left.as_ref())
            .map(|e| e.key.as_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    Put { key: String, value: Value },
    Del { key: String },
}

impl LogOp {
    pub fn key(&self) -> &str {
        match self {
            LogOp::Put { key, .. } | LogOp::Del { key } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LogHeader {
    pub key: String,
    pub owned: bool,
    pub created_at_micros: u64,
}

impl LogHeader {
    pub(crate) fn new(key: &str, owned: bool) -> Self {
        Self {
            key: key.to_string(),
            owned,
            created_at_micros: now_micros(),
        }
    }

    pub(crate) fn decode(frame: &Frame) -> Result<Self, DbError> {
        if frame.kind != FrameKind::Header {
            return Err(DbError::Corruption {
                message: "first frame is not a header".into(),
            });
        }
        Ok(rmp_serde::from_slice(&frame.payload)?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BatchRecord {
    pub first_seq: u64,
    pub ops: Vec<LogOp>,
}

pub(crate) struct LogState {
    /// Indexed by version.
    versions: Vec<Tree>,
    /// Key written at each seq; `None` for the header block.
    touched: Vec<Option<String>>,
    wal: Option<WalFile>,
}

impl LogState {
    fn new(wal: Option<WalFile>) -> Self {
        Self {
            versions: vec![Tree::new(), Tree::new()],
            touched: vec![None],
            wal,
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.touched.len() as u64
    }

    fn head(&self) -> &Tree {
        // versions always holds at least the pre-header and header states
        &self.versions[self.versions.len() - 1]
    }

    fn tree_at(&self, version: u64) -> Result<&Tree, DbError> {
        self.versions.get(version as usize).ok_or_else(|| {
            DbError::Validation(format!(
                "version {version} is not yet visible (latest version: {})",
                self.version()
            ))
        })
    }

    /// Drops ops that would not change the log (deletes of absent keys).
    fn effective_ops(&self, ops: Vec<LogOp>) -> Vec<LogOp> {
        let mut staged = self.head().clone();
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            match &op {
                LogOp::Put { key, value } => {
                    staged.insert(
                        key.clone(),
                        Arc::new(LogEntry {
                            key: key.clone(),
                            value: value.clone(),
                            seq: 0,
                        }),
                    );
                }
                LogOp::Del { key } => {
                    if staged.remove(key).is_none() {
                        continue;
                    }
                }
            }
            out.push(op);
        }
        out
    }

    fn apply(&mut self, ops: Vec<LogOp>) {
        let mut tree = self.head().clone();
        for op in ops {
            let seq = self.version();
            match op {
                LogOp::Put { key, value } => {
                    tree.insert(
                        key.clone(),
                        Arc::new(LogEntry {
                            key: key.clone(),
                            value,
                            seq,
                        }),
                    );
                    self.touched.push(Some(key));
                }
                LogOp::Del { key } => {
                    if tree.remove(&key).is_none() {
                        continue;
                    }
                    self.touched.push(Some(key));
                }
            }
            self.versions.push(tree.clone());
        }
    }

    fn diff(&self, since: u64, until: u64, prefix: &str) -> Result<Vec<DiffEntry>, DbError> {
        let until = until.min(self.version());
        let since = since.min(until);
        let left_tree = self.tree_at(since)?;
        let right_tree = self.tree_at(until)?;
        let keys: BTreeSet<&str> = self.touched[since as usize..until as usize]
            .iter()
            .flatten()
            .map(String::as_str)
            .filter(|k| k.starts_with(prefix))
            .collect();
        let mut out = Vec::new();
        for key in keys {
            let left = left_tree.get(key);
            let right = right_tree.get(key);
            let changed = match (left, right) {
                (Some(l), Some(r)) => l.seq != r.seq,
                (None, None) => false,
                _ => true,
            };
            if changed {
                out.push(DiffEntry {
                    left: left.map(|e| e.as_ref().clone()),
                    right: right.map(|e| e.as_ref().clone()),
                });
            }
        }
        Ok(out)
    }
}

pub(crate) struct LogCore {
    key: String,
    owned: bool,
    state: RwLock<LogState>,
    appended: watch::Sender<u64>,
}

impl LogCore {
    pub(crate) fn new(key: &str, owned: bool, wal: Option<WalFile>) -> Self {
        let state = LogState::new(wal);
        let (appended, _) = watch::channel(state.version());
        Self {
            key: key.to_string(),
            owned,
            state: RwLock::new(state),
            appended,
        }
    }

    /// Rebuilds the in-memory state from the frames following the header.
    pub(crate) fn recover(
        key: &str,
        owned: bool,
        frames: &[Frame],
        wal: Option<WalFile>,
    ) -> Result<Self, DbError> {
        let mut state = LogState::new(wal);
        for frame in frames {
            if frame.kind != FrameKind::Batch {
                continue;
            }
            let record: BatchRecord = rmp_serde::from_slice(&frame.payload)?;
            if record.first_seq != state.version() {
                return Err(DbError::Corruption {
                    message: format!(
                        "log {key}: batch starts at seq {} but log is at version {}",
                        record.first_seq,
                        state.version()
                    ),
                });
            }
            state.apply(record.ops);
        }
        debug!(log = %key, version = state.version(), "log recovered");
        let (appended, _) = watch::channel(state.version());
        Ok(Self {
            key: key.to_string(),
            owned,
            state: RwLock::new(state),
            appended,
        })
    }

    pub(crate) fn owned(&self) -> bool {
        self.owned
    }
}

/// Point-in-time view of a log.
#[derive(Clone)]
pub struct Snapshot {
    tree: Tree,
    version: u64,
}

impl Snapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, key: &str) -> Option<LogEntry> {
        self.tree.get(key).map(|e| e.as_ref().clone())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn scan(&self, lower: Bound<String>, upper: Bound<String>, reverse: bool) -> SnapshotScan {
        SnapshotScan {
            tree: self.tree.clone(),
            lower,
            upper,
            reverse,
        }
    }
}

/// Lazy ordered walk over a snapshot. Each step re-enters the tree at the
/// moving bound, so the iterator owns its data and holds no borrow.
pub struct SnapshotScan {
    tree: Tree,
    lower: Bound<String>,
    upper: Bound<String>,
    reverse: bool,
}

impl Iterator for SnapshotScan {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        if range_is_empty(&self.lower, &self.upper) {
            return None;
        }
        let entry = {
            let mut range = self.tree.range((self.lower.clone(), self.upper.clone()));
            let (_, entry) = if self.reverse {
                range.next_back()?
            } else {
                range.next()?
            };
            entry.as_ref().clone()
        };
        if self.reverse {
            self.upper = Bound::Excluded(entry.key.clone());
        } else {
            self.lower = Bound::Excluded(entry.key.clone());
        }
        Some(entry)
    }
}

fn range_is_empty(lower: &Bound<String>, upper: &Bound<String>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}

/// Shared handle onto one log. Clones share the closed flag.
#[derive(Clone)]
pub struct LogHandle {
    core: Arc<LogCore>,
    writable: bool,
    read_timeout: Duration,
    max_batch_bytes: usize,
    closed: Arc<AtomicBool>,
}

impl LogHandle {
    pub(crate) fn new(core: Arc<LogCore>, read_timeout: Duration, max_batch_bytes: usize) -> Self {
        let writable = core.owned();
        Self {
            core,
            writable,
            read_timeout,
            max_batch_bytes,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn key(&self) -> &str {
        &self.core.key
    }

    pub fn writable(&self) -> bool {
        self.writable && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A handle onto the same log that refuses writes.
    pub fn read_only(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            writable: false,
            read_timeout: self.read_timeout,
            max_batch_bytes: self.max_batch_bytes,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn sub(&self, name: &str) -> LogView {
        LogView::root(self.clone()).sub(name)
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.core.appended.subscribe()
    }

    pub fn batch(&self) -> Batch {
        Batch::new(self.clone())
    }

    pub(crate) async fn read_state(&self) -> Result<RwLockReadGuard<'_, LogState>, DbError> {
        self.ensure_open()?;
        tokio::time::timeout(self.read_timeout, self.core.state.read())
            .await
            .map_err(|_| DbError::Timeout)
    }

    pub async fn version(&self) -> Result<u64, DbError> {
        Ok(self.read_state().await?.version())
    }

    pub async fn get(&self, key: &str) -> Result<Option<LogEntry>, DbError> {
        let state = self.read_state().await?;
        Ok(state.head().get(key).map(|e| e.as_ref().clone()))
    }

    pub async fn put(&self, key: impl Into<String>, value: Value) -> Result<u64, DbError> {
        self.commit(vec![LogOp::Put {
            key: key.into(),
            value,
        }])
        .await
    }

    pub async fn del(&self, key: impl Into<String>) -> Result<u64, DbError> {
        self.commit(vec![LogOp::Del { key: key.into() }]).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot, DbError> {
        let state = self.read_state().await?;
        Ok(Snapshot {
            tree: state.head().clone(),
            version: state.version(),
        })
    }

    pub async fn checkout(&self, version: u64) -> Result<Snapshot, DbError> {
        let state = self.read_state().await?;
        Ok(Snapshot {
            tree: state.tree_at(version)?.clone(),
            version,
        })
    }

    /// Changed keys under `prefix` between `since` and `until` (latest when
    /// `None`), in key order.
    pub async fn diff(
        &self,
        since: u64,
        until: Option<u64>,
        prefix: &str,
    ) -> Result<Vec<DiffEntry>, DbError> {
        let state = self.read_state().await?;
        let until = until.unwrap_or(state.version());
        state.diff(since, until, prefix)
    }

    /// Best-effort catch-up for replicas; the local core is the freshest copy
    /// this process can see.
    pub async fn update(&self) -> Result<u64, DbError> {
        self.version().await
    }

    /// Appends `ops` atomically and returns the new version.
    pub(crate) async fn commit(&self, ops: Vec<LogOp>) -> Result<u64, DbError> {
        self.ensure_open()?;
        if !self.writable {
            return Err(DbError::NotWritable {
                database: self.core.key.clone(),
            });
        }
        let mut state = self.core.state.write().await;
        let ops = state.effective_ops(ops);
        if ops.is_empty() {
            return Ok(state.version());
        }
        let record = BatchRecord {
            first_seq: state.version(),
            ops,
        };
        let payload = rmp_serde::to_vec(&record)?;
        if payload.len() > self.max_batch_bytes {
            return Err(DbError::Validation(format!(
                "batch of {} bytes exceeds max_batch_bytes {}",
                payload.len(),
                self.max_batch_bytes
            )));
        }
        if let Some(wal) = state.wal.as_mut() {
            wal.append(record.first_seq, FrameKind::Batch, &payload)?;
        }
        state.apply(record.ops);
        let version = state.version();
        drop(state);
        self.core.appended.send_replace(version);
        Ok(version)
    }

    pub async fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.core.state.write().await;
        if let Some(wal) = state.wal.as_mut() {
            wal.sync()?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.is_closed() {
            return Err(DbError::Unavailable {
                message: format!("log {} is closed", self.core.key),
            });
        }
        Ok(())
    }
}
