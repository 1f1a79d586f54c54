//! Incremental materialized views over other databases' tables.
//!
//! An indexer owns one table in the indexing database and follows a set of
//! source schema ids. Progress per source database is a cursor (the source
//! version up to which every diff has been applied), stored in the reserved
//! index-state table in the same batch as the index writes it covers.

use crate::BoxFuture;
use crate::FIRST_LOG_SEQ;
use crate::database::Database;
use crate::error::DbError;
use crate::issues::{Issue, IssueTracker};
use crate::lib_helpers::{entry_url, now_micros};
use crate::log::{Batch, LogEntry};
use crate::table::{ListOptions, Table};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const MEMORY_PREFIX: &str = "memory:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSubject {
    pub db_url: String,
    pub last_indexed_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexState {
    pub schema_id: String,
    pub subject: IndexSubject,
    pub updated_at: u64,
}

/// One side of a diff, tagged with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedEntry {
    pub key: String,
    pub value: Value,
    pub seq: u64,
    pub schema_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexDiff {
    pub left: Option<IndexedEntry>,
    pub right: Option<IndexedEntry>,
}

impl IndexDiff {
    /// Ordering seq: the right side's, else the left side's.
    pub fn seq(&self) -> u64 {
        self.right
            .as_ref()
            .or(self.left.as_ref())
            .map_or(FIRST_LOG_SEQ, |e| e.seq)
    }

    pub fn key(&self) -> &str {
        self.right
            .as_ref()
            .or(self.left.as_ref())
            .map_or("", |e| e.key.as_str())
    }
}

pub struct IndexContext<'a> {
    /// The database that owns the index.
    pub db: &'a Database,
    /// The database whose change is being indexed.
    pub source: &'a Database,
    pub batch: &'a mut Batch,
    pub schema_id: &'a str,
}

impl IndexContext<'_> {
    /// The indexer's own table.
    pub fn table(&self) -> Result<Arc<Table>, DbError> {
        self.db.get_table(self.schema_id)
    }
}

/// Applies one diff entry to the index through `cx.batch`.
///
/// Must tolerate being re-run for entries whose batch never flushed.
pub trait IndexHandler: Send + Sync {
    fn index<'a>(
        &'a self,
        cx: IndexContext<'a>,
        diff: &'a IndexDiff,
    ) -> BoxFuture<'a, Result<(), DbError>>;
}

pub struct Indexer {
    schema_id: String,
    target_schema_ids: Vec<String>,
    handler: Arc<dyn IndexHandler>,
    cache: Mutex<HashMap<String, IndexState>>,
}

impl Indexer {
    pub(crate) fn new(
        schema_id: &str,
        target_schema_ids: &[&str],
        handler: Arc<dyn IndexHandler>,
    ) -> Self {
        Self {
            schema_id: schema_id.to_string(),
            target_schema_ids: target_schema_ids.iter().map(|s| s.to_string()).collect(),
            handler,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    pub fn target_schema_ids(&self) -> &[String] {
        &self.target_schema_ids
    }

    /// Memory-only indexers keep cursors in the cache and never persist.
    pub fn is_memory_only(&self) -> bool {
        self.schema_id.starts_with(MEMORY_PREFIX)
    }

    pub fn is_interested_in(&self, schema_id: &str) -> bool {
        self.target_schema_ids.iter().any(|s| s == schema_id)
    }

    fn state_key(&self, source_url: &str) -> String {
        format!("{}:{source_url}", self.schema_id)
    }

    pub async fn get_state(
        &self,
        state_table: &Table,
        source_url: &str,
    ) -> Result<Option<IndexState>, DbError> {
        if let Some(state) = self.cache.lock().get(source_url) {
            return Ok(Some(state.clone()));
        }
        if self.is_memory_only() {
            return Ok(None);
        }
        let Some(entry) = state_table.get(&self.state_key(source_url)).await? else {
            return Ok(None);
        };
        let state: IndexState = serde_json::from_value(entry.value)
            .map_err(|e| DbError::Decode(format!("index state: {e}")))?;
        self.cache
            .lock()
            .insert(source_url.to_string(), state.clone());
        Ok(Some(state))
    }

    /// Stages the new cursor in `batch`. The cache only learns about it
    /// through [`Indexer::remember`] once the batch is durable.
    pub fn update_state(
        &self,
        batch: &mut Batch,
        state_table: &Table,
        source_url: &str,
        last_indexed_seq: u64,
    ) -> Result<IndexState, DbError> {
        let state = IndexState {
            schema_id: self.schema_id.clone(),
            subject: IndexSubject {
                db_url: source_url.to_string(),
                last_indexed_seq,
            },
            updated_at: now_micros(),
        };
        if !self.is_memory_only() {
            let value =
                serde_json::to_value(&state).map_err(|e| DbError::Encode(e.to_string()))?;
            state_table.put_in(batch, &self.state_key(source_url), value)?;
        }
        Ok(state)
    }

    pub(crate) fn remember(&self, state: IndexState) {
        self.cache
            .lock()
            .insert(state.subject.db_url.clone(), state);
    }

    /// Stages deletion of every persisted cursor of this indexer.
    pub async fn clear_all_state(
        &self,
        batch: &mut Batch,
        state_table: &Table,
    ) -> Result<(), DbError> {
        self.cache.lock().clear();
        if self.is_memory_only() {
            return Ok(());
        }
        let range = ListOptions {
            gte: Some(format!("{}:", self.schema_id)),
            lt: Some(format!("{};", self.schema_id)),
            ..ListOptions::default()
        };
        for entry in state_table.list(&range).await? {
            state_table.del_in(batch, &entry.key)?;
        }
        Ok(())
    }

    /// Indexes everything `source` appended since this indexer's cursor.
    ///
    /// Returns the staged cursor, or `None` when there was nothing to do.
    /// A failing entry has its staged writes rolled back and is recorded as
    /// an issue; the pass and the cursor move on regardless.
    pub(crate) async fn index_source(
        &self,
        db: &Database,
        source: &Database,
        state_table: &Table,
        batch: &mut Batch,
        issues: &IssueTracker,
    ) -> Result<Option<IndexState>, DbError> {
        let source_url = source.url();
        let start = self
            .get_state(state_table, source_url)
            .await?
            .map_or(FIRST_LOG_SEQ, |s| s.subject.last_indexed_seq);
        let until = source.log().version().await?;
        if start >= until {
            return Ok(None);
        }

        let mut diffs = Vec::new();
        for schema_id in &self.target_schema_ids {
            let table = match source.get_table(schema_id) {
                Ok(table) => table,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let tag = |e: LogEntry| IndexedEntry {
                url: entry_url(source_url, schema_id, &e.key),
                key: e.key,
                value: e.value,
                seq: e.seq,
                schema_id: schema_id.clone(),
            };
            for d in table.list_diff_between(start, until).await? {
                diffs.push(IndexDiff {
                    left: d.left.map(tag),
                    right: d.right.map(tag),
                });
            }
        }
        if diffs.is_empty() {
            return Ok(None);
        }
        diffs.sort_by_key(IndexDiff::seq);

        let mut failed = 0usize;
        for diff in &diffs {
            let savepoint = batch.savepoint();
            let cx = IndexContext {
                db,
                source,
                batch: &mut *batch,
                schema_id: &self.schema_id,
            };
            if let Err(e) = self.handler.index(cx, diff).await {
                batch.rollback_to(savepoint);
                failed += 1;
                warn!(
                    indexer = %self.schema_id,
                    source = %source_url,
                    key = %diff.key(),
                    seq = diff.seq(),
                    error = %e,
                    "failed to index diff entry"
                );
                issues.add(Issue::indexing(
                    &self.schema_id,
                    source_url,
                    db.url(),
                    diff.key(),
                    diff.seq(),
                    e.to_string(),
                ));
            }
        }
        debug!(
            indexer = %self.schema_id,
            source = %source_url,
            from = start,
            to = until,
            applied = diffs.len() - failed,
            failed,
            "index pass staged"
        );
        self.update_state(batch, state_table, source_url, until)
            .map(Some)
    }
}
