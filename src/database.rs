use crate::blobs::Blobs;
use crate::dbmethod::{
    DbMethod, DbMethodCall, DbMethodHandler, DbMethodResult, DbMethodResultChronIdx,
    MethodResultCode, chron_key,
};
use crate::error::{DbError, ResourceType};
use crate::host::DbHost;
use crate::indexer::{IndexHandler, Indexer};
use crate::lib_helpers::{database_url, now_micros};
use crate::log::LogHandle;
use crate::schema::{
    DBMETHOD_CALL_SCHEMA, DBMETHOD_RESULT_CHRON_IDX_SCHEMA, DBMETHOD_RESULT_SCHEMA,
    INDEX_STATE_SCHEMA, TableSchema, blob_pointer_schema,
};
use crate::table::Table;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Reserved root key holding [`DbDesc`].
pub const DB_DESC_KEY: &str = "_db";
/// Sub-collection holding blob pointers.
pub const BLOBS_SUB: &str = "_blobs";

const RESERVED_TABLES: [&str; 4] = [
    INDEX_STATE_SCHEMA,
    DBMETHOD_CALL_SCHEMA,
    DBMETHOD_RESULT_SCHEMA,
    DBMETHOD_RESULT_CHRON_IDX_SCHEMA,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbDesc {
    pub db_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blobs_feed_key: Option<String>,
    /// Free-form descriptive fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DbDesc {
    fn new(db_type: &str) -> Self {
        Self {
            db_type: db_type.to_string(),
            blobs_feed_key: None,
            extra: Map::new(),
        }
    }
}

pub struct DatabaseOptions {
    pub db_type: String,
    /// Private databases are never announced to replication.
    pub is_private: bool,
    /// Open an owned log without write access.
    pub read_only: bool,
    /// Methods installed when the database is writable.
    pub methods: Vec<(String, Arc<dyn DbMethodHandler>)>,
}

impl DatabaseOptions {
    pub fn new(db_type: &str) -> Self {
        Self {
            db_type: db_type.to_string(),
            is_private: false,
            read_only: false,
            methods: Vec::new(),
        }
    }

    pub fn private(mut self) -> Self {
        self.is_private = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_method(mut self, method_id: &str, handler: Arc<dyn DbMethodHandler>) -> Self {
        self.methods.push((method_id.to_string(), handler));
        self
    }
}

/// A database: one versioned log plus the tables, indexers, methods and
/// blobs built on it.
pub struct Database {
    ident: String,
    key: String,
    url: String,
    db_type: String,
    is_private: bool,
    writable: bool,
    host: Arc<DbHost>,
    log: LogHandle,
    desc: RwLock<DbDesc>,
    blobs: Blobs,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    indexers: RwLock<Vec<Arc<Indexer>>>,
    dbmethods: RwLock<HashMap<String, Arc<DbMethod>>>,
    torn_down: AtomicBool,
}

impl Database {
    pub(crate) async fn open(
        host: &Arc<DbHost>,
        ident: &str,
        key: Option<&str>,
        opts: DatabaseOptions,
    ) -> Result<Arc<Self>, DbError> {
        let store = host.store();
        let (log, created) = match key {
            Some(key) => (store.open_log(key)?, false),
            None if opts.read_only => {
                return Err(DbError::Validation(
                    "a read-only database must be opened with an existing key".into(),
                ));
            }
            None => (store.create_log()?, true),
        };
        let log = if opts.read_only { log.read_only() } else { log };
        let writable = log.writable();
        let key = log.key().to_string();
        let url = database_url(&key);

        let (mut desc, mut desc_dirty) = match log.get(DB_DESC_KEY).await? {
            Some(entry) => (
                serde_json::from_value::<DbDesc>(entry.value)
                    .map_err(|e| DbError::Decode(format!("{url} desc: {e}")))?,
                false,
            ),
            None => (DbDesc::new(&opts.db_type), true),
        };
        if desc.db_type != opts.db_type {
            return Err(DbError::Validation(format!(
                "{url} is a {} database, not {}",
                desc.db_type, opts.db_type
            )));
        }
        let feed = match desc.blobs_feed_key.as_deref() {
            Some(feed_key) => Some(store.open_feed(feed_key)?),
            None if writable => {
                let feed = store.create_feed()?;
                desc.blobs_feed_key = Some(feed.key().to_string());
                desc_dirty = true;
                Some(feed)
            }
            None => None,
        };
        if desc_dirty && writable {
            log.put(DB_DESC_KEY, encode(&desc)?).await?;
        }

        let pointers = Table::new(
            Arc::new(blob_pointer_schema()),
            log.sub(BLOBS_SUB),
            &key,
            &url,
            Arc::clone(host.locks()),
        );
        let blobs = Blobs::new(feed, pointers, host.config().blob_chunk_size);
        let db = Arc::new(Self {
            ident: ident.to_string(),
            key: key.clone(),
            url,
            db_type: opts.db_type,
            is_private: opts.is_private,
            writable,
            host: Arc::clone(host),
            log,
            desc: RwLock::new(desc),
            blobs,
            tables: RwLock::new(HashMap::new()),
            indexers: RwLock::new(Vec::new()),
            dbmethods: RwLock::new(HashMap::new()),
            torn_down: AtomicBool::new(false),
        });
        for schema_id in RESERVED_TABLES {
            db.get_table(schema_id)?;
        }
        if writable {
            for (method_id, handler) in opts.methods {
                db.create_db_method(&method_id, handler)?;
            }
        }
        if !db.is_private {
            store.announce(&key);
        }
        host.register(&db);
        info!(
            db = %db.url,
            ident = %db.ident,
            db_type = %db.db_type,
            writable,
            created,
            "database opened"
        );
        Ok(db)
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn db_type(&self) -> &str {
        &self.db_type
    }

    pub fn writable(&self) -> bool {
        self.writable && !self.is_torn_down()
    }

    pub fn is_private(&self) -> bool {
        self.is_private
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub fn log(&self) -> &LogHandle {
        &self.log
    }

    pub fn host(&self) -> &Arc<DbHost> {
        &self.host
    }

    pub fn blobs(&self) -> &Blobs {
        &self.blobs
    }

    pub fn desc(&self) -> DbDesc {
        self.desc.read().clone()
    }

    /// Edits descriptive fields. The type and blob feed are fixed once set.
    pub async fn update_desc(&self, f: impl FnOnce(&mut DbDesc)) -> Result<DbDesc, DbError> {
        self.ensure_writable()?;
        let current = self.desc();
        let mut next = current.clone();
        f(&mut next);
        if next.db_type != current.db_type || next.blobs_feed_key != current.blobs_feed_key {
            return Err(DbError::Validation(format!(
                "{}: dbType and blobsFeedKey cannot be changed",
                self.url
            )));
        }
        self.log.put(DB_DESC_KEY, encode(&next)?).await?;
        *self.desc.write() = next.clone();
        Ok(next)
    }

    fn ensure_writable(&self) -> Result<(), DbError> {
        if !self.writable() {
            return Err(DbError::NotWritable {
                database: self.url.clone(),
            });
        }
        Ok(())
    }

    /// Table for `schema_id`, built from the schema registry on first use.
    pub fn get_table(&self, schema_id: &str) -> Result<Arc<Table>, DbError> {
        if let Some(table) = self.tables.read().get(schema_id) {
            return Ok(Arc::clone(table));
        }
        let schema = self.host.schemas().table(schema_id)?;
        let table = Arc::new(self.build_table(schema)?);
        let mut tables = self.tables.write();
        Ok(Arc::clone(
            tables.entry(schema_id.to_string()).or_insert(table),
        ))
    }

    pub fn existing_table(&self, schema_id: &str) -> Option<Arc<Table>> {
        self.tables.read().get(schema_id).cloned()
    }

    pub fn table_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tables.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn build_table(&self, schema: Arc<TableSchema>) -> Result<Table, DbError> {
        let view = {
            let (domain, name) = schema.namespace()?;
            self.log.sub(domain).sub(name)
        };
        Ok(Table::new(
            schema,
            view,
            &self.key,
            &self.url,
            Arc::clone(self.host.locks()),
        ))
    }

    /// Registers an indexer writing to `schema_id`. Read-only databases
    /// never index, so this returns `None` for them.
    pub fn create_indexer(
        &self,
        schema_id: &str,
        target_schema_ids: &[&str],
        handler: Arc<dyn IndexHandler>,
    ) -> Result<Option<Arc<Indexer>>, DbError> {
        if !self.writable() {
            return Ok(None);
        }
        let indexer = Arc::new(Indexer::new(schema_id, target_schema_ids, handler));
        if !indexer.is_memory_only() {
            self.get_table(schema_id)?;
        }
        let mut indexers = self.indexers.write();
        indexers.retain(|i| i.schema_id() != schema_id);
        indexers.push(Arc::clone(&indexer));
        debug!(db = %self.url, indexer = %schema_id, targets = ?target_schema_ids, "indexer created");
        Ok(Some(indexer))
    }

    pub fn indexers(&self) -> Vec<Arc<Indexer>> {
        self.indexers.read().clone()
    }

    pub fn create_db_method(
        &self,
        method_id: &str,
        handler: Arc<dyn DbMethodHandler>,
    ) -> Result<Arc<DbMethod>, DbError> {
        self.ensure_writable()?;
        let schema = self.host.schemas().method(method_id)?;
        let method = Arc::new(DbMethod::new(schema, handler, &self.url));
        self.dbmethods
            .write()
            .insert(method_id.to_string(), Arc::clone(&method));
        Ok(method)
    }

    pub fn get_db_method(&self, method_id: &str) -> Result<Arc<DbMethod>, DbError> {
        self.dbmethods
            .read()
            .get(method_id)
            .cloned()
            .ok_or_else(|| DbError::not_found(ResourceType::Method, method_id))
    }

    /// Runs a dbmethod and records the call, its outcome and a
    /// chronological index entry.
    pub async fn call_method(
        &self,
        method_id: &str,
        caller: Option<&str>,
        args: Value,
    ) -> Result<Value, DbError> {
        self.ensure_writable()?;
        let method = self.get_db_method(method_id)?;
        method.validate_call_args(&args)?;

        let calls = self.get_table(DBMETHOD_CALL_SCHEMA)?;
        let call = DbMethodCall {
            method: method_id.to_string(),
            args: args.clone(),
            caller: caller.map(str::to_string),
            created_at: now_micros(),
        };
        let call_value = encode(&call)?;
        let call_key = calls.schema().generate_key(&call_value)?;
        let call_entry = calls.put(&call_key, call_value).await?;

        let outcome = method
            .invoke(self, caller, &args, self.host.issues())
            .await;

        let (code, details) = match &outcome {
            Ok(value) => (MethodResultCode::Success, value.clone()),
            Err(e) => (
                MethodResultCode::Error,
                json!({"code": e.code_str(), "message": e.to_string()}),
            ),
        };
        let results = self.get_table(DBMETHOD_RESULT_SCHEMA)?;
        let chron = self.get_table(DBMETHOD_RESULT_CHRON_IDX_SCHEMA)?;
        let result = DbMethodResult {
            call_key: call_key.clone(),
            call_url: call_entry.url,
            method: method_id.to_string(),
            code,
            details,
            created_at: now_micros(),
        };
        let idx = DbMethodResultChronIdx {
            chron_key: chron_key(result.created_at, &call_key),
            result_url: results.url(&call_key),
        };
        let mut batch = self.log.batch();
        results.put_in(&mut batch, &call_key, encode(&result)?)?;
        chron.put_in(&mut batch, &idx.chron_key, encode(&idx)?)?;
        batch.flush().await?;
        outcome
    }

    fn index_lock_name(&self, source_url: &str) -> String {
        format!("{}:update-indexes:{source_url}", self.key)
    }

    /// Brings every indexer up to date with `changed`. All staged index
    /// writes and cursors commit in one batch.
    pub async fn update_indexes(&self, changed: &Database) -> Result<(), DbError> {
        if !self.writable() {
            return Ok(());
        }
        let indexers = self.indexers();
        if indexers.is_empty() {
            return Ok(());
        }
        let _guard = self
            .host
            .locks()
            .acquire(self.index_lock_name(changed.url()))
            .await;
        let state_table = self.get_table(INDEX_STATE_SCHEMA)?;
        let mut batch = self.log.batch();
        let mut staged = Vec::new();
        for indexer in indexers {
            if let Some(state) = indexer
                .index_source(self, changed, &state_table, &mut batch, self.host.issues())
                .await?
            {
                staged.push((indexer, state));
            }
        }
        if staged.is_empty() {
            return Ok(());
        }
        let version = batch.flush().await?;
        for (indexer, state) in staged {
            indexer.remember(state);
        }
        debug!(db = %self.url, source = %changed.url(), version, "indexes updated");
        Ok(())
    }

    /// Clears the selected (default: all) indexes and their cursors while
    /// holding every `update-indexes` lock of this database, then catches up
    /// from scratch.
    pub async fn rebuild_indexes(&self, ids: Option<&[&str]>) -> Result<(), DbError> {
        if !self.writable() {
            return Ok(());
        }
        let selected: Vec<Arc<Indexer>> = self
            .indexers()
            .into_iter()
            .filter(|i| ids.is_none_or(|ids| ids.contains(&i.schema_id())))
            .collect();
        let names: Vec<String> = self
            .host
            .databases()
            .iter()
            .map(|db| self.index_lock_name(db.url()))
            .collect();
        {
            let _guard = self.host.locks().acquire_all(&names).await;
            if let Err(e) = self.clear_indexes(&selected).await {
                error!(db = %self.url, error = %e, "failed to clear indexes for rebuild");
                return Err(e);
            }
        }
        info!(
            db = %self.url,
            indexers = selected.len(),
            "indexes cleared, catching up"
        );
        self.host.catchup_indexes(self).await;
        Ok(())
    }

    async fn clear_indexes(&self, indexers: &[Arc<Indexer>]) -> Result<(), DbError> {
        let state_table = self.get_table(INDEX_STATE_SCHEMA)?;
        let mut batch = self.log.batch();
        for indexer in indexers {
            if !indexer.is_memory_only() || self.host.schemas().has_table(indexer.schema_id()) {
                let table = self.get_table(indexer.schema_id())?;
                table.clear_in(&mut batch).await?;
            }
            indexer.clear_all_state(&mut batch, &state_table).await?;
        }
        batch.flush().await?;
        Ok(())
    }

    /// Replicas try to catch up without waiting past the read timeout.
    pub async fn when_synced(&self) {
        if self.writable() {
            return;
        }
        let timeout = self.host.config().read_timeout();
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.log.update()).await;
        let latency_micros = started.elapsed().as_micros() as u64;
        match outcome {
            Ok(Ok(version)) => debug!(db = %self.url, version, latency_micros, "replica synced"),
            Ok(Err(e)) => debug!(db = %self.url, error = %e, latency_micros, "replica sync failed"),
            Err(_) => debug!(db = %self.url, latency_micros, "replica sync timed out"),
        }
    }

    /// Calls `callback` once per burst of appends, after the log has been
    /// quiet for the configured debounce.
    pub fn watch<F, Fut>(self: &Arc<Self>, callback: F) -> WatchHandle
    where
        F: Fn(Arc<Database>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut appended = self.log.subscribe();
        let weak = Arc::downgrade(self);
        let debounce = self.host.config().indexing_debounce();
        let task = tokio::spawn(async move {
            loop {
                if appended.changed().await.is_err() {
                    return;
                }
                loop {
                    tokio::select! {
                        changed = appended.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(debounce) => break,
                    }
                }
                let Some(db) = weak.upgrade() else {
                    return;
                };
                if db.is_torn_down() {
                    return;
                }
                callback(db).await;
            }
        });
        WatchHandle { task }
    }

    /// Closes the blob feed and the log and leaves the host directory.
    pub async fn teardown(&self) -> Result<(), DbError> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.blobs.teardown().await?;
        if !self.is_private {
            self.host.store().withdraw(&self.key);
        }
        self.log.close().await?;
        // last: this drops the watch task, which may be the caller
        self.host.unregister(&self.url);
        info!(db = %self.url, ident = %self.ident, "database torn down");
        Ok(())
    }
}

/// Stops the watch task when dropped.
pub struct WatchHandle {
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn stop(self) {}

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, DbError> {
    serde_json::to_value(value).map_err(|e| DbError::Encode(e.to_string()))
}
