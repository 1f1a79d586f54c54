use crate::error::{DbError, ResourceType};
use crate::wal::file::WalFile;
use crate::wal::frame::{Frame, FrameKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

struct FeedState {
    blocks: Vec<Vec<u8>>,
    /// Byte offset where each block starts.
    offsets: Vec<u64>,
    byte_len: u64,
    wal: Option<WalFile>,
}

impl FeedState {
    fn push(&mut self, block: Vec<u8>) {
        self.offsets.push(self.byte_len);
        self.byte_len += block.len() as u64;
        self.blocks.push(block);
    }

    /// Index of the block holding byte `offset`.
    fn block_at(&self, offset: u64) -> usize {
        self.offsets.partition_point(|start| *start <= offset).saturating_sub(1)
    }
}

pub(crate) struct FeedCore {
    key: String,
    owned: bool,
    state: RwLock<FeedState>,
}

impl FeedCore {
    pub(crate) fn new(key: &str, owned: bool, wal: Option<WalFile>) -> Self {
        Self::recover(key, owned, &[], wal)
    }

    pub(crate) fn recover(key: &str, owned: bool, frames: &[Frame], wal: Option<WalFile>) -> Self {
        let mut state = FeedState {
            blocks: Vec::new(),
            offsets: Vec::new(),
            byte_len: 0,
            wal,
        };
        for frame in frames.iter().filter(|f| f.kind == FrameKind::Block) {
            state.push(frame.payload.clone());
        }
        Self {
            key: key.to_string(),
            owned,
            state: RwLock::new(state),
        }
    }
}

/// Append-only byte feed backing blob storage.
#[derive(Clone)]
pub struct FeedHandle {
    core: Arc<FeedCore>,
    read_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl FeedHandle {
    pub(crate) fn new(core: Arc<FeedCore>, read_timeout: Duration) -> Self {
        Self {
            core,
            read_timeout,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn key(&self) -> &str {
        &self.core.key
    }

    pub fn writable(&self) -> bool {
        self.core.owned && !self.closed.load(Ordering::Acquire)
    }

    /// Appends each chunk as its own block; returns the byte offset of the
    /// first appended byte.
    pub async fn append(&self, chunks: Vec<Vec<u8>>) -> Result<u64, DbError> {
        self.ensure_open()?;
        if !self.core.owned {
            return Err(DbError::NotWritable {
                database: self.core.key.clone(),
            });
        }
        let mut state = self.core.state.write().await;
        let start = state.byte_len;
        for chunk in chunks {
            let index = state.blocks.len() as u64;
            if let Some(wal) = state.wal.as_mut() {
                wal.append(index, FrameKind::Block, &chunk)?;
            }
            state.push(chunk);
        }
        Ok(start)
    }

    /// Number of blocks.
    pub async fn length(&self) -> Result<u64, DbError> {
        self.ensure_open()?;
        Ok(self.read_guard().await?.blocks.len() as u64)
    }

    pub async fn byte_length(&self) -> Result<u64, DbError> {
        self.ensure_open()?;
        Ok(self.read_guard().await?.byte_len)
    }

    /// Bytes from `offset` up to the end of its block, capped at `end`.
    pub async fn read_chunk(&self, offset: u64, end: u64) -> Result<Option<Vec<u8>>, DbError> {
        self.ensure_open()?;
        if offset >= end {
            return Ok(None);
        }
        let state = self.read_guard().await?;
        if end > state.byte_len {
            return Err(DbError::not_found(
                ResourceType::Blob,
                format!("{}[{offset}..{end}]", self.core.key),
            ));
        }
        let index = state.block_at(offset);
        let block_start = state.offsets[index];
        let block = &state.blocks[index];
        let from = (offset - block_start) as usize;
        let to = ((end - block_start) as usize).min(block.len());
        Ok(Some(block[from..to].to_vec()))
    }

    /// Whole byte range `[start, end)` in one buffer.
    pub async fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>, DbError> {
        self.read_stream(start, end).read_to_end().await
    }

    pub fn read_stream(&self, start: u64, end: u64) -> FeedReadStream {
        FeedReadStream {
            feed: self.clone(),
            pos: start,
            end,
        }
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

    async fn read_guard(&self) -> Result<tokio::sync::RwLockReadGuard<'_, FeedState>, DbError> {
        tokio::time::timeout(self.read_timeout, self.core.state.read())
            .await
            .map_err(|_| DbError::Timeout)
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Unavailable {
                message: format!("feed {} is closed", self.core.key),
            });
        }
        Ok(())
    }
}

/// Lazy pull-based reader over a byte range of a feed. Consumed once.
pub struct FeedReadStream {
    feed: FeedHandle,
    pos: u64,
    end: u64,
}

impl FeedReadStream {
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.pos)
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DbError> {
        let Some(chunk) = self.feed.read_chunk(self.pos, self.end).await? else {
            return Ok(None);
        };
        self.pos += chunk.len() as u64;
        Ok(Some(chunk))
    }

    pub async fn read_to_end(mut self) -> Result<Vec<u8>, DbError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}
