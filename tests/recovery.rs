use serde_json::json;
use std::sync::Arc;
use tabledb::{
    DatabaseOptions, DbConfig, DbHost, FieldType, KeyStrategy, ListOptions, RecordSchema,
    RecoveryMode, TableSchema,
};
use tempfile::tempdir;

const DB_TYPE: &str = "example.com/profile";
const POST: &str = "example.com/post";

fn open_host(dir: &std::path::Path) -> Arc<DbHost> {
    open_host_with(dir, DbConfig::testing())
}

fn open_host_with(dir: &std::path::Path, config: DbConfig) -> Arc<DbHost> {
    let host = DbHost::open(dir, config).expect("host");
    host.schemas().register_table(TableSchema::new(
        POST,
        RecordSchema::new()
            .required("id", FieldType::string())
            .required("text", FieldType::string()),
        KeyStrategy::Field("/id".into()),
    ));
    host
}

async fn seed(dir: &std::path::Path) -> String {
    let host = open_host(dir);
    let db = host
        .open_database("me", None, DatabaseOptions::new(DB_TYPE))
        .await
        .expect("open");
    let posts = db.get_table(POST).expect("table");
    for (id, text) in [("a", "one"), ("b", "two"), ("c", "three")] {
        posts
            .put(id, json!({"id": id, "text": text}))
            .await
            .expect("put");
    }
    posts.del("b").await.expect("del");
    db.blobs()
        .put("avatar", b"png bytes", Some("image/png"))
        .await
        .expect("blob");
    db.update_desc(|d| {
        d.extra.insert("title".into(), json!("Me"));
    })
    .await
    .expect("desc");
    let key = db.key().to_string();
    host.close().await.expect("close");
    key
}

#[tokio::test]
async fn reopened_database_keeps_entries_blobs_and_desc() {
    let dir = tempdir().expect("temp");
    let key = seed(dir.path()).await;

    let host = open_host(dir.path());
    let db = host
        .open_database("me", Some(&key), DatabaseOptions::new(DB_TYPE))
        .await
        .expect("reopen");
    assert!(db.writable());
    assert_eq!(db.desc().extra["title"], json!("Me"));

    let posts = db.get_table(POST).expect("table");
    let keys: Vec<String> = posts
        .list(&ListOptions::default())
        .await
        .expect("list")
        .into_iter()
        .map(|e| e.key)
        .collect();
    assert_eq!(keys, vec!["a", "c"]);

    let blob = db.blobs().get("avatar").await.expect("blob");
    assert_eq!(blob.bytes, b"png bytes".to_vec());
    assert_eq!(blob.mime_type.as_deref(), Some("image/png"));

    let version = db.log().version().await.expect("version");
    posts
        .put("d", json!({"id": "d", "text": "four"}))
        .await
        .expect("append after reopen");
    assert_eq!(db.log().version().await.expect("version"), version + 1);
}

#[tokio::test]
async fn reopening_with_another_type_fails() {
    let dir = tempdir().expect("temp");
    let key = seed(dir.path()).await;

    let host = open_host(dir.path());
    let err = host
        .open_database("me", Some(&key), DatabaseOptions::new("example.com/other"))
        .await
        .err()
        .expect("type mismatch");
    assert_eq!(err.code_str(), "validation");
}

#[tokio::test]
async fn read_only_reopen_rejects_writes() {
    let dir = tempdir().expect("temp");
    let key = seed(dir.path()).await;

    let host = open_host(dir.path());
    let db = host
        .open_database("me", Some(&key), DatabaseOptions::new(DB_TYPE).read_only())
        .await
        .expect("reopen");
    assert!(!db.writable());
    let posts = db.get_table(POST).expect("table");
    assert!(posts.get("a").await.expect("get").is_some());
    let err = posts
        .put("z", json!({"id": "z", "text": "nope"}))
        .await
        .expect_err("read only");
    assert_eq!(err.code_str(), "not_writable");

    let err = host
        .open_database("fresh", None, DatabaseOptions::new(DB_TYPE).read_only())
        .await
        .err()
        .expect("read-only needs a key");
    assert_eq!(err.code_str(), "validation");
}

#[tokio::test]
async fn damaged_tail_fails_strict_open_and_is_cut_in_permissive_mode() {
    let dir = tempdir().expect("temp");
    let key = seed(dir.path()).await;
    let path = dir.path().join(format!("{key}.log"));
    let intact = std::fs::metadata(&path).expect("meta").len();
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open log");
        file.write_all(&[0x00, 0x00, 0x01]).expect("garbage");
    }

    let strict = open_host(dir.path());
    let err = strict
        .open_database("me", Some(&key), DatabaseOptions::new(DB_TYPE))
        .await
        .err()
        .expect("strict recovery");
    assert_eq!(err.code_str(), "corruption");
    assert_eq!(std::fs::metadata(&path).expect("meta").len(), intact + 3);

    let mut config = DbConfig::testing();
    config.recovery_mode = RecoveryMode::Permissive;
    let host = open_host_with(dir.path(), config);
    let db = host
        .open_database("me", Some(&key), DatabaseOptions::new(DB_TYPE))
        .await
        .expect("reopen");
    assert_eq!(std::fs::metadata(&path).expect("meta").len(), intact);
    let posts = db.get_table(POST).expect("table");
    assert_eq!(posts.list(&ListOptions::default()).await.expect("list").len(), 2);
}
