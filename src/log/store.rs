use super::feed::FeedCore;
use super::{FeedHandle, LogCore, LogHandle, LogHeader};
use crate::config::DbConfig;
use crate::error::{DbError, ResourceType};
use crate::lib_helpers::{is_log_key, new_log_key};
use crate::wal::file::WalFile;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) const LOG_FILE_EXT: &str = "log";
pub(crate) const FEED_FILE_EXT: &str = "feed";

/// Opens and creates logs and feeds, either purely in memory or backed by
/// one WAL file per log in a directory.
pub struct LogStore {
    dir: Option<PathBuf>,
    config: DbConfig,
    logs: Mutex<HashMap<String, Arc<LogCore>>>,
    feeds: Mutex<HashMap<String, Arc<FeedCore>>>,
    announced: Mutex<BTreeSet<String>>,
}

impl LogStore {
    pub fn in_memory(config: DbConfig) -> Self {
        Self {
            dir: None,
            config,
            logs: Mutex::new(HashMap::new()),
            feeds: Mutex::new(HashMap::new()),
            announced: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn open(dir: &Path, config: DbConfig) -> Result<Self, DbError> {
        std::fs::create_dir_all(dir)?;
        info!(dir = %dir.display(), "log store opened");
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            ..Self::in_memory(config)
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    fn file_path(&self, key: &str, ext: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{key}.{ext}")))
    }

    fn log_handle(&self, core: Arc<LogCore>) -> LogHandle {
        LogHandle::new(core, self.config.read_timeout(), self.config.max_batch_bytes)
    }

    fn feed_handle(&self, core: Arc<FeedCore>) -> FeedHandle {
        FeedHandle::new(core, self.config.read_timeout())
    }

    /// Creates a new owned log under a fresh key.
    pub fn create_log(&self) -> Result<LogHandle, DbError> {
        let key = new_log_key();
        let core = Arc::new(LogCore::new(&key, true, self.create_wal(&key, LOG_FILE_EXT, true)?));
        self.logs.lock().insert(key.clone(), Arc::clone(&core));
        debug!(log = %key, "log created");
        Ok(self.log_handle(core))
    }

    /// Opens `key`, replaying its WAL when it is not loaded yet. A key with
    /// no local state becomes an empty replica.
    pub fn open_log(&self, key: &str) -> Result<LogHandle, DbError> {
        check_key(key)?;
        let mut logs = self.logs.lock();
        if let Some(core) = logs.get(key) {
            return Ok(self.log_handle(Arc::clone(core)));
        }
        let core = match self.file_path(key, LOG_FILE_EXT) {
            Some(path) if path.exists() => {
                let (wal, frames) = WalFile::open(
                    &path,
                    self.config.strict_recovery(),
                    self.config.sync_writes(),
                )?;
                let header = LogHeader::decode(&frames[0])?;
                if header.key != key {
                    return Err(DbError::Corruption {
                        message: format!("{} holds log {}", path.display(), header.key),
                    });
                }
                LogCore::recover(key, header.owned, &frames[1..], Some(wal))?
            }
            _ => LogCore::new(key, false, self.create_wal(key, LOG_FILE_EXT, false)?),
        };
        let core = Arc::new(core);
        logs.insert(key.to_string(), Arc::clone(&core));
        Ok(self.log_handle(core))
    }

    pub fn create_feed(&self) -> Result<FeedHandle, DbError> {
        let key = new_log_key();
        let core = Arc::new(FeedCore::new(&key, true, self.create_wal(&key, FEED_FILE_EXT, true)?));
        self.feeds.lock().insert(key.clone(), Arc::clone(&core));
        debug!(feed = %key, "feed created");
        Ok(self.feed_handle(core))
    }

    pub fn open_feed(&self, key: &str) -> Result<FeedHandle, DbError> {
        check_key(key)?;
        let mut feeds = self.feeds.lock();
        if let Some(core) = feeds.get(key) {
            return Ok(self.feed_handle(Arc::clone(core)));
        }
        let core = match self.file_path(key, FEED_FILE_EXT) {
            Some(path) if path.exists() => {
                let (wal, frames) = WalFile::open(
                    &path,
                    self.config.strict_recovery(),
                    self.config.sync_writes(),
                )?;
                let header = LogHeader::decode(&frames[0])?;
                FeedCore::recover(key, header.owned, &frames[1..], Some(wal))
            }
            _ => FeedCore::new(key, false, self.create_wal(key, FEED_FILE_EXT, false)?),
        };
        let core = Arc::new(core);
        feeds.insert(key.to_string(), Arc::clone(&core));
        Ok(self.feed_handle(core))
    }

    fn create_wal(&self, key: &str, ext: &str, owned: bool) -> Result<Option<WalFile>, DbError> {
        let Some(path) = self.file_path(key, ext) else {
            return Ok(None);
        };
        let header = rmp_serde::to_vec(&LogHeader::new(key, owned))?;
        Ok(Some(WalFile::create(&path, &header, self.config.sync_writes())?))
    }

    /// Offers `key` to replication peers.
    pub fn announce(&self, key: &str) {
        self.announced.lock().insert(key.to_string());
    }

    pub fn withdraw(&self, key: &str) {
        self.announced.lock().remove(key);
    }

    pub fn is_announced(&self, key: &str) -> bool {
        self.announced.lock().contains(key)
    }

    pub fn announced(&self) -> Vec<String> {
        self.announced.lock().iter().cloned().collect()
    }
}

fn check_key(key: &str) -> Result<(), DbError> {
    if !is_log_key(key) {
        return Err(DbError::not_found(ResourceType::Log, key));
    }
    Ok(())
}
