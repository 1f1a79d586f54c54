use serde_json::json;
use std::sync::Arc;
use tabledb::{BlobEncoding, DatabaseOptions, DbConfig, DbHost};

const DB_TYPE: &str = "example.com/files";

fn host(chunk_size: usize) -> Arc<DbHost> {
    DbHost::in_memory(DbConfig::testing().with_blob_chunk_size(chunk_size)).expect("host")
}

#[tokio::test]
async fn blob_is_split_into_chunk_sized_blocks() {
    let host = host(4);
    let db = host
        .open_database("files", None, DatabaseOptions::new(DB_TYPE))
        .await
        .expect("open");
    let data = b"0123456789";
    let pointer = db
        .blobs()
        .put("digits.txt", data, Some("text/plain"))
        .await
        .expect("put");
    assert_eq!(pointer.len(), 10);

    let mut stream = db
        .blobs()
        .create_read_stream("digits.txt")
        .await
        .expect("stream");
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next_chunk().await.expect("chunk") {
        chunks.push(chunk);
    }
    assert_eq!(
        chunks,
        vec![b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]
    );
}

#[tokio::test]
async fn blobs_round_trip_with_mime_type_and_encodings() {
    let host = host(3);
    let db = host
        .open_database("files", None, DatabaseOptions::new(DB_TYPE))
        .await
        .expect("open");
    let first = db
        .blobs()
        .put("a", b"hello", Some("text/plain"))
        .await
        .expect("put a");
    let second = db.blobs().put("b", &[0xde, 0xad, 0xbe, 0xef], None).await.expect("put b");
    assert_eq!(second.start, first.end);

    let a = db.blobs().get("a").await.expect("get a");
    assert_eq!(a.mime_type.as_deref(), Some("text/plain"));
    assert_eq!(a.encode(BlobEncoding::Utf8).expect("utf8"), "hello");
    let b = db.blobs().get("b").await.expect("get b");
    assert_eq!(b.mime_type, None);
    assert_eq!(b.encode(BlobEncoding::Hex).expect("hex"), "deadbeef");
    assert!(b.encode(BlobEncoding::Utf8).is_err());

    let pointer = db.blobs().get_pointer("a").await.expect("pointer").expect("some");
    assert_eq!(pointer, first);
}

#[tokio::test]
async fn overwriting_a_blob_repoints_the_key() {
    let host = host(8);
    let db = host
        .open_database("files", None, DatabaseOptions::new(DB_TYPE))
        .await
        .expect("open");
    db.blobs().put("k", b"old", None).await.expect("put");
    db.blobs().put("k", b"newer", None).await.expect("overwrite");
    assert_eq!(db.blobs().get("k").await.expect("get").bytes, b"newer".to_vec());
}

#[tokio::test]
async fn empty_and_missing_blobs() {
    let host = host(8);
    let db = host
        .open_database("files", None, DatabaseOptions::new(DB_TYPE))
        .await
        .expect("open");
    let pointer = db.blobs().put("empty", b"", None).await.expect("put");
    assert!(pointer.is_empty());
    assert!(db.blobs().get("empty").await.expect("get").bytes.is_empty());

    let err = db.blobs().get("missing").await.expect_err("missing");
    assert_eq!(err.code_str(), "blob_not_found");
    assert!(db.blobs().get_pointer("missing").await.expect("pointer").is_none());
}

#[tokio::test]
async fn replica_without_feed_cannot_store_blobs() {
    let owner_host = host(8);
    let owner = owner_host
        .open_database("files", None, DatabaseOptions::new(DB_TYPE))
        .await
        .expect("open");
    let replica_host = host(8);
    let replica = replica_host
        .open_database("mirror", Some(owner.key()), DatabaseOptions::new(DB_TYPE))
        .await
        .expect("replica");
    assert!(replica.blobs().feed_key().is_none());
    let err = replica
        .blobs()
        .put("x", b"data", None)
        .await
        .expect_err("no feed");
    assert_eq!(err.code_str(), "unavailable");
}

#[tokio::test]
async fn blobs_are_unavailable_after_teardown() {
    let host = host(8);
    let db = host
        .open_database("files", None, DatabaseOptions::new(DB_TYPE))
        .await
        .expect("open");
    db.blobs().put("k", b"bytes", None).await.expect("put");
    db.teardown().await.expect("teardown");
    assert_eq!(
        db.blobs().get("k").await.expect_err("closed").code_str(),
        "unavailable"
    );
}

#[tokio::test]
async fn stored_pointer_past_the_feed_is_an_error() {
    let host = host(8);
    let db = host
        .open_database("files", None, DatabaseOptions::new(DB_TYPE))
        .await
        .expect("open");
    db.blobs().put("k", b"bytes", None).await.expect("put");
    db.log()
        .sub("_blobs")
        .put("evil", json!({"start": 0, "end": u64::MAX}))
        .await
        .expect("raw pointer");
    let err = db.blobs().get("evil").await.expect_err("out of range");
    assert_eq!(err.code_str(), "blob_not_found");
    assert_eq!(db.blobs().get("k").await.expect("get").bytes, b"bytes".to_vec());
}
