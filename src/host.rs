use crate::config::{DbConfig, validate_config};
use crate::database::{Database, DatabaseOptions, WatchHandle};
use crate::error::{DbError, ResourceType};
use crate::issues::IssueTracker;
use crate::lib_helpers::{database_url, key_from_url};
use crate::lock::ResourceLocks;
use crate::log::LogStore;
use crate::schema::SchemaRegistry;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Process-level owner of the log store, lock registry, schemas, issue
/// tracker and the directory of open databases.
pub struct DbHost {
    config: DbConfig,
    store: LogStore,
    locks: Arc<ResourceLocks>,
    schemas: SchemaRegistry,
    issues: IssueTracker,
    directory: RwLock<HashMap<String, Weak<Database>>>,
    watchers: Mutex<HashMap<String, WatchHandle>>,
}

impl DbHost {
    pub fn in_memory(config: DbConfig) -> Result<Arc<Self>, DbError> {
        validate_config(&config)?;
        Ok(Self::with_store(LogStore::in_memory(config.clone()), config))
    }

    pub fn open(dir: &Path, config: DbConfig) -> Result<Arc<Self>, DbError> {
        validate_config(&config)?;
        Ok(Self::with_store(LogStore::open(dir, config.clone())?, config))
    }

    fn with_store(store: LogStore, config: DbConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            locks: ResourceLocks::new(),
            schemas: SchemaRegistry::new(),
            issues: IssueTracker::default(),
            directory: RwLock::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    pub fn locks(&self) -> &Arc<ResourceLocks> {
        &self.locks
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn issues(&self) -> &IssueTracker {
        &self.issues
    }

    /// Opens `key`, or creates a new database when `key` is `None`. A key
    /// that is already open returns the existing instance.
    pub async fn open_database(
        self: &Arc<Self>,
        ident: &str,
        key: Option<&str>,
        opts: DatabaseOptions,
    ) -> Result<Arc<Database>, DbError> {
        if let Some(key) = key
            && let Some(db) = self.find(&database_url(key))
        {
            return Ok(db);
        }
        Database::open(self, ident, key, opts).await
    }

    pub(crate) fn register(&self, db: &Arc<Database>) {
        self.directory
            .write()
            .insert(db.url().to_string(), Arc::downgrade(db));
    }

    pub(crate) fn unregister(&self, url: &str) {
        self.directory.write().remove(url);
        self.watchers.lock().remove(url);
    }

    /// Looks a database up by URL, bare key or ident.
    pub fn find(&self, id: &str) -> Option<Arc<Database>> {
        let directory = self.directory.read();
        if let Some(key) = key_from_url(id)
            && let Some(db) = directory.get(&database_url(key)).and_then(Weak::upgrade)
        {
            return Some(db);
        }
        directory
            .values()
            .filter_map(Weak::upgrade)
            .find(|db| db.ident() == id)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Database>, DbError> {
        self.find(id)
            .ok_or_else(|| DbError::not_found(ResourceType::Database, id))
    }

    /// Open databases ordered by URL.
    pub fn databases(&self) -> Vec<Arc<Database>> {
        let mut dbs: Vec<Arc<Database>> = {
            let mut directory = self.directory.write();
            directory.retain(|_, db| db.strong_count() > 0);
            directory.values().filter_map(Weak::upgrade).collect()
        };
        dbs.sort_by(|a, b| a.url().cmp(b.url()));
        dbs
    }

    /// Lets every database index the changes of `changed`. A failing
    /// database is logged and skipped.
    pub async fn on_database_change(&self, changed: &Database) {
        for db in self.databases() {
            if let Err(e) = db.update_indexes(changed).await {
                warn!(db = %db.url(), source = %changed.url(), error = %e, "index update failed");
            }
        }
    }

    /// Brings `db`'s indexes up to date with every known database.
    pub async fn catchup_indexes(&self, db: &Database) {
        for source in self.databases() {
            if let Err(e) = db.update_indexes(&source).await {
                warn!(db = %db.url(), source = %source.url(), error = %e, "index catch-up failed");
            }
        }
    }

    /// Feeds `db`'s appends into [`DbHost::on_database_change`], debounced.
    pub fn watch_database(self: &Arc<Self>, db: &Arc<Database>) {
        let host = Arc::downgrade(self);
        let handle = db.watch(move |db| {
            let host = host.clone();
            async move {
                if let Some(host) = host.upgrade() {
                    debug!(db = %db.url(), "change detected");
                    host.on_database_change(&db).await;
                }
            }
        });
        self.watchers.lock().insert(db.url().to_string(), handle);
    }

    /// Tears down every open database.
    pub async fn close(&self) -> Result<(), DbError> {
        for db in self.databases() {
            db.teardown().await?;
        }
        Ok(())
    }
}
