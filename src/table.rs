use crate::error::DbError;
use crate::lib_helpers::entry_url;
use crate::lock::{LockGuard, ResourceLocks};
use crate::log::{Batch, DiffEntry, KeyRange, LogEntry, LogView, ViewScan};
use crate::schema::TableSchema;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const DEFAULT_PAGE_SIZE: usize = 100;

pub type PutObserver = Arc<dyn Fn(&str, &Value) + Send + Sync>;
pub type DelObserver = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Value,
    pub seq: u64,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListOptions {
    pub gt: Option<String>,
    pub gte: Option<String>,
    pub lt: Option<String>,
    pub lte: Option<String>,
    pub limit: Option<usize>,
    pub reverse: bool,
}

impl ListOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    fn key_range(&self) -> KeyRange {
        KeyRange {
            gt: self.gt.clone(),
            gte: self.gte.clone(),
            lt: self.lt.clone(),
            lte: self.lte.clone(),
            reverse: self.reverse,
        }
    }
}

/// Schema-bound namespace inside one database log.
pub struct Table {
    schema: Arc<TableSchema>,
    view: LogView,
    db_key: String,
    db_url: String,
    locks: Arc<ResourceLocks>,
    on_put: Mutex<Vec<PutObserver>>,
    on_del: Mutex<Vec<DelObserver>>,
}

impl Table {
    pub(crate) fn new(
        schema: Arc<TableSchema>,
        view: LogView,
        db_key: &str,
        db_url: &str,
        locks: Arc<ResourceLocks>,
    ) -> Self {
        Self {
            schema,
            view,
            db_key: db_key.to_string(),
            db_url: db_url.to_string(),
            locks,
            on_put: Mutex::new(Vec::new()),
            on_del: Mutex::new(Vec::new()),
        }
    }

    pub fn schema_id(&self) -> &str {
        &self.schema.id
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn db_url(&self) -> &str {
        &self.db_url
    }

    pub fn url(&self, key: &str) -> String {
        entry_url(&self.db_url, &self.schema.id, key)
    }

    pub fn view(&self) -> &LogView {
        &self.view
    }

    pub async fn version(&self) -> Result<u64, DbError> {
        self.view.log().version().await
    }

    /// Observers run synchronously, in registration order, after each
    /// successful put.
    pub fn on_put(&self, observer: impl Fn(&str, &Value) + Send + Sync + 'static) {
        self.on_put.lock().push(Arc::new(observer));
    }

    pub fn on_del(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        self.on_del.lock().push(Arc::new(observer));
    }

    fn to_entry(&self, entry: LogEntry) -> Entry {
        Entry {
            url: self.url(&entry.key),
            key: entry.key,
            value: entry.value,
            seq: entry.seq,
        }
    }

    /// Fails with a validation error when the stored value no longer
    /// matches the schema.
    pub async fn get(&self, key: &str) -> Result<Option<Entry>, DbError> {
        let started = Instant::now();
        let result = async {
            let Some(entry) = self.view.get(key).await? else {
                return Ok(None);
            };
            self.schema.assert_valid(&entry.value)?;
            Ok::<_, DbError>(Some(self.to_entry(entry)))
        }
        .await;
        self.record_latency("get", started, &result);
        result
    }

    pub async fn put(&self, key: &str, value: Value) -> Result<Entry, DbError> {
        let started = Instant::now();
        let result = async {
            self.schema.assert_valid(&value)?;
            let version = self.view.put(key, value.clone()).await?;
            let observers = self.on_put.lock().clone();
            for observer in observers {
                observer(key, &value);
            }
            Ok::<_, DbError>(Entry {
                key: key.to_string(),
                url: self.url(key),
                value,
                seq: version - 1,
            })
        }
        .await;
        self.record_latency("put", started, &result);
        result
    }

    pub async fn del(&self, key: &str) -> Result<(), DbError> {
        let started = Instant::now();
        let result = async {
            self.view.del(key).await?;
            let observers = self.on_del.lock().clone();
            for observer in observers {
                observer(key);
            }
            Ok::<_, DbError>(())
        }
        .await;
        self.record_latency("del", started, &result);
        result
    }

    fn record_latency<T>(&self, op: &'static str, started: Instant, result: &Result<T, DbError>) {
        debug!(
            table = %self.schema.id,
            db = %self.db_url,
            op,
            ok = result.is_ok(),
            latency_micros = started.elapsed().as_micros() as u64,
            "table op"
        );
    }

    /// Lazy scan over the table's current snapshot. Entries that fail the
    /// schema are skipped.
    pub async fn scan(&self, opts: &ListOptions) -> Result<TableScan, DbError> {
        Ok(TableScan {
            inner: self.view.scan(&opts.key_range()).await?,
            schema: Arc::clone(&self.schema),
            db_url: self.db_url.clone(),
            remaining: opts.limit,
        })
    }

    pub async fn list(&self, opts: &ListOptions) -> Result<Vec<Entry>, DbError> {
        let started = Instant::now();
        let result = self.scan(opts).await.map(Iterator::collect);
        self.record_latency("list", started, &result);
        result
    }

    /// First entry matching `predicate`, consuming the scan only as far as
    /// needed.
    pub async fn scan_find(
        &self,
        opts: &ListOptions,
        mut predicate: impl FnMut(&Entry) -> bool,
    ) -> Result<Option<Entry>, DbError> {
        Ok(self.scan(opts).await?.find(|e| predicate(e)))
    }

    pub fn cursor_read(&self, opts: ListOptions) -> TableCursor<'_> {
        TableCursor {
            table: self,
            start: opts.clone(),
            opts,
            done: false,
        }
    }

    /// Changes between `since` and the latest version, keys relative to the
    /// table.
    pub async fn list_diff(&self, since: u64) -> Result<Vec<DiffEntry>, DbError> {
        let started = Instant::now();
        let result = self.view.diff(since, None).await;
        self.record_latency("list_diff", started, &result);
        result
    }

    pub async fn list_diff_between(&self, since: u64, until: u64) -> Result<Vec<DiffEntry>, DbError> {
        let started = Instant::now();
        let result = self.view.diff(since, Some(until)).await;
        self.record_latency("list_diff", started, &result);
        result
    }

    /// Lock named after `(database, schema, suffix)`.
    pub async fn lock(&self, suffix: &str) -> LockGuard {
        self.locks.acquire(self.lock_name(suffix)).await
    }

    pub(crate) fn lock_name(&self, suffix: &str) -> String {
        format!("{}:{}:{suffix}", self.db_key, self.schema.id)
    }

    /// Read-modify-write of one key under its lock.
    pub async fn update_with<F>(&self, key: &str, f: F) -> Result<Entry, DbError>
    where
        F: FnOnce(Option<Entry>) -> Result<Value, DbError>,
    {
        let _guard = self.lock(key).await;
        let current = self.get(key).await?;
        let next = f(current)?;
        self.put(key, next).await
    }

    fn check_batch(&self, batch: &Batch) -> Result<(), DbError> {
        if batch.log_key() != self.view.log().key() {
            return Err(DbError::Validation(format!(
                "batch for log {} cannot write table {} of {}",
                batch.log_key(),
                self.schema.id,
                self.db_url
            )));
        }
        Ok(())
    }

    /// Stages a validated put in `batch`. Observers are not run.
    pub fn put_in(&self, batch: &mut Batch, key: &str, value: Value) -> Result<(), DbError> {
        self.check_batch(batch)?;
        self.schema.assert_valid(&value)?;
        batch.put(self.view.full_key(key), value);
        Ok(())
    }

    pub fn del_in(&self, batch: &mut Batch, key: &str) -> Result<(), DbError> {
        self.check_batch(batch)?;
        batch.del(self.view.full_key(key));
        Ok(())
    }

    /// Reads through `batch`, so staged writes are visible.
    pub async fn get_in(&self, batch: &Batch, key: &str) -> Result<Option<Value>, DbError> {
        self.check_batch(batch)?;
        match batch.pending(&self.view.full_key(key)) {
            Some(staged) => Ok(staged.cloned()),
            None => Ok(self.get(key).await?.map(|e| e.value)),
        }
    }

    /// Stages deletion of every stored key, valid or not.
    pub async fn clear_in(&self, batch: &mut Batch) -> Result<usize, DbError> {
        self.check_batch(batch)?;
        let mut cleared = 0;
        for entry in self.view.scan(&KeyRange::default()).await? {
            batch.del(self.view.full_key(&entry.key));
            cleared += 1;
        }
        Ok(cleared)
    }
}

pub struct TableScan {
    inner: ViewScan,
    schema: Arc<TableSchema>,
    db_url: String,
    remaining: Option<usize>,
}

impl Iterator for TableScan {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        if self.remaining == Some(0) {
            return None;
        }
        let entry = self.inner.find(|e| self.schema.validate(&e.value))?;
        if let Some(n) = self.remaining.as_mut() {
            *n -= 1;
        }
        Some(Entry {
            url: entry_url(&self.db_url, &self.schema.id, &entry.key),
            key: entry.key,
            value: entry.value,
            seq: entry.seq,
        })
    }
}

/// Page-at-a-time reader. Each page is a fresh `list` starting after the
/// last key returned, so no scan stays open between pages.
pub struct TableCursor<'a> {
    table: &'a Table,
    start: ListOptions,
    opts: ListOptions,
    done: bool,
}

impl TableCursor<'_> {
    /// Next page; empty once the range is exhausted.
    pub async fn next_page(&mut self) -> Result<Vec<Entry>, DbError> {
        if self.done {
            return Ok(Vec::new());
        }
        let page_size = self.opts.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let page = self
            .table
            .list(&self.opts.clone().with_limit(page_size))
            .await?;
        match page.last() {
            Some(last) if page.len() == page_size => {
                if self.opts.reverse {
                    self.opts.lt = Some(last.key.clone());
                    self.opts.lte = None;
                } else {
                    self.opts.gt = Some(last.key.clone());
                    self.opts.gte = None;
                }
            }
            _ => self.done = true,
        }
        Ok(page)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Starts over from the original bounds.
    pub fn restart(&mut self) {
        self.opts = self.start.clone();
        self.done = false;
    }
}
