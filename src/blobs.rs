use crate::error::{DbError, ResourceType};
use crate::log::{FeedHandle, FeedReadStream};
use crate::table::Table;
use serde::{Deserialize, Serialize};

/// Half-open byte range `[start, end)` of the blob feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobPointer {
    pub start: u64,
    pub end: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl BlobPointer {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobEncoding {
    Utf8,
    Hex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

impl Blob {
    pub fn encode(&self, encoding: BlobEncoding) -> Result<String, DbError> {
        match encoding {
            BlobEncoding::Utf8 => String::from_utf8(self.bytes.clone())
                .map_err(|e| DbError::Decode(format!("blob is not utf-8: {e}"))),
            BlobEncoding::Hex => Ok(hex::encode(&self.bytes)),
        }
    }
}

/// Chunked blob store: bytes go to an append-only feed, a pointer record
/// goes to the `_blobs` table.
pub struct Blobs {
    feed: Option<FeedHandle>,
    pointers: Table,
    chunk_size: usize,
}

impl Blobs {
    pub(crate) fn new(feed: Option<FeedHandle>, pointers: Table, chunk_size: usize) -> Self {
        Self {
            feed,
            pointers,
            chunk_size,
        }
    }

    pub fn feed_key(&self) -> Option<&str> {
        self.feed.as_ref().map(FeedHandle::key)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn feed(&self) -> Result<&FeedHandle, DbError> {
        self.feed.as_ref().ok_or_else(|| DbError::Unavailable {
            message: format!("database {} has no blob feed", self.pointers.db_url()),
        })
    }

    /// Appends `bytes` in `chunk_size` pieces and points `key` at them.
    pub async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        mime_type: Option<&str>,
    ) -> Result<BlobPointer, DbError> {
        let feed = self.feed()?;
        if !feed.writable() {
            return Err(DbError::NotWritable {
                database: self.pointers.db_url().to_string(),
            });
        }
        let chunks: Vec<Vec<u8>> = bytes.chunks(self.chunk_size).map(<[u8]>::to_vec).collect();
        let start = feed.append(chunks).await?;
        let pointer = BlobPointer {
            start,
            end: start + bytes.len() as u64,
            mime_type: mime_type.map(str::to_string),
        };
        let value =
            serde_json::to_value(&pointer).map_err(|e| DbError::Encode(e.to_string()))?;
        self.pointers.put(key, value).await?;
        Ok(pointer)
    }

    pub async fn get_pointer(&self, key: &str) -> Result<Option<BlobPointer>, DbError> {
        let Some(entry) = self.pointers.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_value(entry.value)
            .map(Some)
            .map_err(|e| DbError::Decode(format!("blob pointer {key}: {e}")))
    }

    pub async fn get(&self, key: &str) -> Result<Blob, DbError> {
        let (pointer, stream) = self.open_stream(key).await?;
        Ok(Blob {
            bytes: stream.read_to_end().await?,
            mime_type: pointer.mime_type,
        })
    }

    pub async fn get_encoded(&self, key: &str, encoding: BlobEncoding) -> Result<String, DbError> {
        self.get(key).await?.encode(encoding)
    }

    /// Lazy chunk stream over the blob's byte range.
    pub async fn create_read_stream(&self, key: &str) -> Result<FeedReadStream, DbError> {
        Ok(self.open_stream(key).await?.1)
    }

    async fn open_stream(&self, key: &str) -> Result<(BlobPointer, FeedReadStream), DbError> {
        let pointer = self
            .get_pointer(key)
            .await?
            .ok_or_else(|| DbError::not_found(ResourceType::Blob, key))?;
        let feed = self.feed()?;
        // pointers replicate from the owner and may name bytes we do not have
        if pointer.start > pointer.end || pointer.end > feed.byte_length().await? {
            return Err(DbError::not_found(ResourceType::Blob, key));
        }
        let stream = feed.read_stream(pointer.start, pointer.end);
        Ok((pointer, stream))
    }

    pub(crate) async fn teardown(&self) -> Result<(), DbError> {
        match &self.feed {
            Some(feed) => feed.close().await,
            None => Ok(()),
        }
    }
}
