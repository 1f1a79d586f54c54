use crate::dbmethod::{DbMethodHandler, MethodContext};
use crate::schema::{
    DBMETHOD_CALL_SCHEMA, DBMETHOD_RESULT_CHRON_IDX_SCHEMA, DBMETHOD_RESULT_SCHEMA,
    INDEX_STATE_SCHEMA,
};
use crate::{
    BoxFuture, DatabaseOptions, DbConfig, DbError, DbHost, FieldType, Issue, KeyStrategy,
    ListOptions, MethodSchema, RecordSchema, TableSchema,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing_test::traced_test;

const DB_TYPE: &str = "example.com/profile";
const POST: &str = "example.com/post";

fn host() -> Arc<DbHost> {
    let host = DbHost::in_memory(DbConfig::testing()).expect("host");
    host.schemas().register_table(TableSchema::new(
        POST,
        RecordSchema::new()
            .required("id", FieldType::string())
            .required("text", FieldType::string()),
        KeyStrategy::Field("/id".into()),
    ));
    host.schemas().register_method(
        MethodSchema::new("example.com/echo")
            .with_params(RecordSchema::new().required("n", FieldType::Integer))
            .with_response(RecordSchema::new().required("n", FieldType::Integer)),
    );
    host
}

struct Echo;

impl DbMethodHandler for Echo {
    fn call<'a>(
        &'a self,
        _cx: MethodContext<'a>,
        args: &'a Value,
    ) -> BoxFuture<'a, Result<Value, DbError>> {
        Box::pin(async move {
            match args["n"].as_i64() {
                Some(13) => Err(DbError::Handler("unlucky".into())),
                Some(7) => Ok(json!({"wrong": true})),
                _ => Ok(args.clone()),
            }
        })
    }
}

#[tokio::test]
async fn new_database_writes_desc_and_reserved_tables() {
    let host = host();
    let db = host
        .open_database("me", None, DatabaseOptions::new(DB_TYPE))
        .await
        .expect("open");
    assert!(db.writable());

    let desc = db.desc();
    assert_eq!(desc.db_type, DB_TYPE);
    assert_eq!(desc.blobs_feed_key.as_deref(), db.blobs().feed_key());
    let stored = db.log().get("_db").await.expect("get").expect("desc");
    assert_eq!(stored.value["dbType"], json!(DB_TYPE));

    for id in [
        INDEX_STATE_SCHEMA,
        DBMETHOD_CALL_SCHEMA,
        DBMETHOD_RESULT_SCHEMA,
        DBMETHOD_RESULT_CHRON_IDX_SCHEMA,
    ] {
        assert!(db.existing_table(id).is_some(), "{id} missing");
    }
    assert!(host.store().is_announced(db.key()));
}

#[tokio::test]
async fn private_database_is_not_announced_and_teardown_closes_it() {
    let host = host();
    let db = host
        .open_database("private", None, DatabaseOptions::new(DB_TYPE).private())
        .await
        .expect("open");
    assert!(!host.store().is_announced(db.key()));

    let posts = db.get_table(POST).expect("table");
    posts
        .put("a", json!({"id": "a", "text": "hi"}))
        .await
        .expect("put");
    db.teardown().await.expect("teardown");
    assert!(!db.writable());
    assert_eq!(posts.get("a").await.expect_err("closed").code_str(), "unavailable");
    assert!(host.find(db.url()).is_none());
    db.teardown().await.expect("second teardown is a no-op");
}

#[tokio::test]
async fn update_desc_keeps_type_and_feed_fixed() {
    let host = host();
    let db = host
        .open_database("me", None, DatabaseOptions::new(DB_TYPE))
        .await
        .expect("open");
    let desc = db
        .update_desc(|d| {
            d.extra.insert("title".into(), json!("Home"));
        })
        .await
        .expect("update");
    assert_eq!(desc.extra["title"], json!("Home"));
    let stored = db.log().get("_db").await.expect("get").expect("desc");
    assert_eq!(stored.value["title"], json!("Home"));

    let err = db
        .update_desc(|d| d.db_type = "other/type".into())
        .await
        .expect_err("type is fixed");
    assert_eq!(err.code_str(), "validation");
}

#[tokio::test]
async fn unknown_or_malformed_schema_ids_are_rejected() {
    let host = host();
    let db = host
        .open_database("me", None, DatabaseOptions::new(DB_TYPE))
        .await
        .expect("open");
    assert_eq!(
        db.get_table("nope/nope").err().expect("unknown").code_str(),
        "schema_not_found"
    );
    assert_eq!(
        db.get_table("nope").err().expect("unknown").code_str(),
        "schema_not_found"
    );
}

#[tokio::test]
async fn call_method_records_call_result_and_chron_index() {
    let host = host();
    let db = host
        .open_database(
            "me",
            None,
            DatabaseOptions::new(DB_TYPE).with_method("example.com/echo", Arc::new(Echo)),
        )
        .await
        .expect("open");

    let out = db
        .call_method("example.com/echo", Some("tdb://caller/"), json!({"n": 1}))
        .await
        .expect("call");
    assert_eq!(out, json!({"n": 1}));

    let calls = db.get_table(DBMETHOD_CALL_SCHEMA).expect("calls");
    let results = db.get_table(DBMETHOD_RESULT_SCHEMA).expect("results");
    let chron = db.get_table(DBMETHOD_RESULT_CHRON_IDX_SCHEMA).expect("chron");
    let call = calls.list(&ListOptions::default()).await.expect("list");
    assert_eq!(call.len(), 1);
    assert_eq!(call[0].value["caller"], json!("tdb://caller/"));
    let result = results
        .get(&call[0].key)
        .await
        .expect("get")
        .expect("result");
    assert_eq!(result.value["code"], json!("success"));
    assert_eq!(result.value["callUrl"], json!(call[0].url));
    let idx = chron.list(&ListOptions::default()).await.expect("list");
    assert_eq!(idx.len(), 1);
    assert_eq!(idx[0].value["resultUrl"], json!(result.url));
}

#[tokio::test]
async fn invalid_args_fail_before_anything_is_written() {
    let host = host();
    let db = host
        .open_database(
            "me",
            None,
            DatabaseOptions::new(DB_TYPE).with_method("example.com/echo", Arc::new(Echo)),
        )
        .await
        .expect("open");
    let before = db.log().version().await.expect("version");
    let err = db
        .call_method("example.com/echo", None, json!({"n": "one"}))
        .await
        .expect_err("invalid args");
    assert_eq!(err.code_str(), "validation");
    assert!(err.to_string().contains("/n"));
    assert_eq!(db.log().version().await.expect("version"), before);
}

#[tokio::test]
async fn bad_response_is_an_issue_not_an_error() {
    let host = host();
    let db = host
        .open_database(
            "me",
            None,
            DatabaseOptions::new(DB_TYPE).with_method("example.com/echo", Arc::new(Echo)),
        )
        .await
        .expect("open");
    let out = db
        .call_method("example.com/echo", None, json!({"n": 7}))
        .await
        .expect("still returned");
    assert_eq!(out, json!({"wrong": true}));
    let issues = host.issues().list();
    assert_eq!(issues.len(), 1);
    assert!(matches!(&issues[0], Issue::DbMethodBadResponse { method, .. } if method == "example.com/echo"));
}

#[tokio::test]
async fn handler_errors_are_persisted_and_returned() {
    let host = host();
    let db = host
        .open_database(
            "me",
            None,
            DatabaseOptions::new(DB_TYPE).with_method("example.com/echo", Arc::new(Echo)),
        )
        .await
        .expect("open");
    let err = db
        .call_method("example.com/echo", None, json!({"n": 13}))
        .await
        .expect_err("handler error");
    assert_eq!(err.code_str(), "handler");
    let results = db
        .get_table(DBMETHOD_RESULT_SCHEMA)
        .expect("results")
        .list(&ListOptions::default())
        .await
        .expect("list");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].value["code"], json!("error"));
    assert_eq!(results[0].value["details"]["code"], json!("handler"));

    assert_eq!(
        db.call_method("example.com/missing", None, json!({}))
            .await
            .expect_err("no such method")
            .code_str(),
        "method_not_found"
    );
}

#[tokio::test(start_paused = true)]
async fn watch_coalesces_bursts_into_one_callback() {
    let host = host();
    let db = host
        .open_database("me", None, DatabaseOptions::new(DB_TYPE))
        .await
        .expect("open");
    let posts = db.get_table(POST).expect("table");
    let calls = Arc::new(AtomicUsize::new(0));
    let handle = {
        let calls = Arc::clone(&calls);
        db.watch(move |_db| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    let debounce = host.config().indexing_debounce();

    for i in 0..5 {
        let id = format!("p{i}");
        posts
            .put(&id, json!({"id": id, "text": "burst"}))
            .await
            .expect("put");
        tokio::time::sleep(debounce / 5).await;
    }
    tokio::time::sleep(debounce * 3).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    posts
        .put("late", json!({"id": "late", "text": "again"}))
        .await
        .expect("put");
    tokio::time::sleep(debounce * 3).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    handle.stop();
    posts
        .put("after", json!({"id": "after", "text": "stopped"}))
        .await
        .expect("put");
    tokio::time::sleep(debounce * 3).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
#[traced_test]
async fn when_synced_returns_for_writable_and_replica_databases() {
    let host = host();
    let db = host
        .open_database("me", None, DatabaseOptions::new(DB_TYPE))
        .await
        .expect("open");
    db.when_synced().await;

    let other = DbHost::in_memory(DbConfig::testing()).expect("other host");
    let replica = other
        .open_database("replica", Some(db.key()), DatabaseOptions::new(DB_TYPE))
        .await
        .expect("replica");
    assert!(!replica.writable());
    assert!(replica.blobs().feed_key().is_none());
    tokio::time::timeout(Duration::from_secs(5), replica.when_synced())
        .await
        .expect("bounded");
    assert!(logs_contain("replica synced"));
    assert!(logs_contain("latency_micros="));
}
