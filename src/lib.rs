//! Schema-validated tables, cross-database incremental indexes, chunked blobs
//! and validated dbmethods over versioned append-only logs.
//!
//! A [`DbHost`] owns the log store and the process-wide lock registry and
//! opens [`Database`]s. Each database namespaces its log into [`Table`]s;
//! [`Indexer`]s consume ordered diffs of other databases' tables and apply
//! them, together with their cursor, in one batch.

pub mod api;
pub mod blobs;
pub mod config;
pub mod database;
pub mod dbmethod;
pub mod error;
pub mod host;
pub mod indexer;
pub mod issues;
mod lib_helpers;
#[cfg(test)]
mod lib_tests;
pub mod lock;
pub mod log;
pub mod offline;
pub mod schema;
pub mod table;
pub mod wal;

use std::future::Future;
use std::pin::Pin;

pub use api::{RpcError, TableApi};
pub use blobs::{Blob, BlobEncoding, BlobPointer, Blobs};
pub use config::{DbConfig, DurabilityMode, RecoveryMode};
pub use database::{Database, DatabaseOptions, DbDesc, WatchHandle};
pub use dbmethod::{DbMethod, DbMethodHandler, MethodContext};
pub use error::{DbError, ErrorCode, ResourceType};
pub use host::DbHost;
pub use indexer::{IndexContext, IndexDiff, IndexHandler, IndexState, IndexedEntry, Indexer};
pub use issues::{Issue, IssueTracker};
pub use lib_helpers::{database_url, entry_url};
pub use lock::{LockGuard, ResourceLocks};
pub use log::{Batch, DiffEntry, LogEntry, LogHandle, LogStore};
pub use schema::{
    FieldType, KeyStrategy, MethodSchema, RecordSchema, SchemaRegistry, SchemaViolation,
    TableSchema, Validator,
};
pub use table::{Entry, ListOptions, Table};

/// Cursor used when an indexer has never seen a source: the first seq
/// after the log header.
pub const FIRST_LOG_SEQ: u64 = 1;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
