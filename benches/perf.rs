use criterion::{Criterion, black_box, criterion_group, criterion_main};
use serde_json::json;
use std::sync::Arc;
use tabledb::{
    BoxFuture, Database, DatabaseOptions, DbConfig, DbError, DbHost, FieldType, IndexContext,
    IndexDiff, IndexHandler, KeyStrategy, ListOptions, RecordSchema, TableSchema,
};
use tempfile::tempdir;
use tokio::runtime::Runtime;

const POST: &str = "bench.local/post";
const POST_IDX: &str = "bench.local/post-by-author";
const SEEDED_ROWS: usize = 10_000;

struct ByAuthor;

impl IndexHandler for ByAuthor {
    fn index<'a>(
        &'a self,
        mut cx: IndexContext<'a>,
        diff: &'a IndexDiff,
    ) -> BoxFuture<'a, Result<(), DbError>> {
        Box::pin(async move {
            let table = cx.table()?;
            let Some(entry) = &diff.right else {
                return table.del_in(&mut *cx.batch, diff.key());
            };
            let author = entry.value["author"].as_str().unwrap_or("anon");
            let key = format!("{author}:{}", entry.key);
            table.put_in(&mut *cx.batch, &key, json!({"author": author, "url": entry.url}))
        })
    }
}

fn host(config: DbConfig, dir: Option<&std::path::Path>) -> Arc<DbHost> {
    let host = match dir {
        Some(dir) => DbHost::open(dir, config).expect("host"),
        None => DbHost::in_memory(config).expect("host"),
    };
    host.schemas().register_table(TableSchema::new(
        POST,
        RecordSchema::new()
            .required("author", FieldType::string())
            .required("text", FieldType::string()),
        KeyStrategy::Auto,
    ));
    host.schemas().register_table(TableSchema::new(
        POST_IDX,
        RecordSchema::new()
            .required("author", FieldType::string())
            .required("url", FieldType::string()),
        KeyStrategy::Auto,
    ));
    host
}

async fn seeded(host: &Arc<DbHost>, rows: usize) -> Arc<Database> {
    let db = host
        .open_database("bench", None, DatabaseOptions::new("bench.local/db"))
        .await
        .expect("open");
    let posts = db.get_table(POST).expect("table");
    let mut batch = db.log().batch();
    for i in 0..rows {
        posts
            .put_in(
                &mut batch,
                &format!("{i:08}"),
                json!({"author": format!("user{}", i % 50), "text": "lorem ipsum"}),
            )
            .expect("stage");
    }
    batch.flush().await.expect("flush");
    db
}

fn bench_table(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let host = host(DbConfig::testing(), None);
    let db = rt.block_on(seeded(&host, SEEDED_ROWS));
    let posts = db.get_table(POST).expect("table");

    let mut n = 0u64;
    c.bench_function("table_put_in_memory", |b| {
        b.iter(|| {
            n += 1;
            rt.block_on(posts.put(
                &format!("new{n:012}"),
                json!({"author": "bench", "text": "x"}),
            ))
            .expect("put");
        })
    });

    c.bench_function("table_get", |b| {
        b.iter(|| {
            let entry = rt.block_on(posts.get("00004242")).expect("get");
            black_box(entry);
        })
    });

    c.bench_function("table_list_range_100", |b| {
        let opts = ListOptions {
            gte: Some("00005000".into()),
            ..ListOptions::default()
        }
        .with_limit(100);
        b.iter(|| {
            let entries = rt.block_on(posts.list(&opts)).expect("list");
            black_box(entries.len());
        })
    });
}

fn bench_durable_put(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let dir = tempdir().expect("temp");
    let host = host(DbConfig::development(), Some(dir.path()));
    let db = rt.block_on(seeded(&host, 0));
    let posts = db.get_table(POST).expect("table");
    let mut n = 0u64;
    c.bench_function("table_put_wal_os_buffered", |b| {
        b.iter(|| {
            n += 1;
            rt.block_on(posts.put(&format!("{n:012}"), json!({"author": "a", "text": "x"})))
                .expect("put");
        })
    });
}

fn bench_index_pass(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    c.bench_function("index_pass_1000_rows", |b| {
        b.iter(|| {
            rt.block_on(async {
                let host = host(DbConfig::testing(), None);
                let source = seeded(&host, 1_000).await;
                let index = host
                    .open_database("index", None, DatabaseOptions::new("bench.local/index"))
                    .await
                    .expect("index db");
                index
                    .create_indexer(POST_IDX, &[POST], Arc::new(ByAuthor))
                    .expect("indexer");
                index.update_indexes(&source).await.expect("index");
                host.close().await.expect("close");
            })
        })
    });
}

criterion_group!(benches, bench_table, bench_durable_put, bench_index_pass);
criterion_main!(benches);
