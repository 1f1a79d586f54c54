use super::{DiffEntry, LogEntry, LogHandle, Snapshot, SnapshotScan};
use crate::error::DbError;
use serde_json::Value;
use std::ops::Bound;

const SUB_SEPARATOR: char = '\0';

/// Optional key bounds for a range scan. `gt` wins over `gte` and `lt` over
/// `lte` when both are given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub gt: Option<String>,
    pub gte: Option<String>,
    pub lt: Option<String>,
    pub lte: Option<String>,
    pub reverse: bool,
}

/// Namespaced window onto a log. Keys are stored as
/// `<name>\0<nested>\0...<key>`; the view hides its prefix.
#[derive(Clone)]
pub struct LogView {
    log: LogHandle,
    prefix: String,
}

impl LogView {
    pub fn root(log: LogHandle) -> Self {
        Self {
            log,
            prefix: String::new(),
        }
    }

    pub fn sub(&self, name: &str) -> LogView {
        let mut prefix = self.prefix.clone();
        prefix.push_str(name);
        prefix.push(SUB_SEPARATOR);
        LogView {
            log: self.log.clone(),
            prefix,
        }
    }

    pub fn log(&self) -> &LogHandle {
        &self.log
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn strip(&self, entry: LogEntry) -> Option<LogEntry> {
        let key = entry.key.strip_prefix(&self.prefix)?.to_string();
        Some(LogEntry { key, ..entry })
    }

    pub async fn get(&self, key: &str) -> Result<Option<LogEntry>, DbError> {
        Ok(self
            .log
            .get(&self.full_key(key))
            .await?
            .and_then(|e| self.strip(e)))
    }

    pub async fn put(&self, key: &str, value: Value) -> Result<u64, DbError> {
        self.log.put(self.full_key(key), value).await
    }

    pub async fn del(&self, key: &str) -> Result<u64, DbError> {
        self.log.del(self.full_key(key)).await
    }

    pub async fn scan(&self, range: &KeyRange) -> Result<ViewScan, DbError> {
        Ok(self.scan_snapshot(&self.log.snapshot().await?, range))
    }

    pub fn scan_snapshot(&self, snapshot: &Snapshot, range: &KeyRange) -> ViewScan {
        let (lower, upper) = self.bounds(range);
        ViewScan {
            inner: snapshot.scan(lower, upper, range.reverse),
            prefix_len: self.prefix.len(),
        }
    }

    /// Diff restricted to this namespace, prefix stripped from keys.
    pub async fn diff(&self, since: u64, until: Option<u64>) -> Result<Vec<DiffEntry>, DbError> {
        let diff = self.log.diff(since, until, &self.prefix).await?;
        Ok(diff
            .into_iter()
            .map(|d| DiffEntry {
                left: d.left.and_then(|e| self.strip(e)),
                right: d.right.and_then(|e| self.strip(e)),
            })
            .collect())
    }

    fn bounds(&self, range: &KeyRange) -> (Bound<String>, Bound<String>) {
        let lower = match (&range.gt, &range.gte) {
            (Some(gt), _) => Bound::Excluded(self.full_key(gt)),
            (None, Some(gte)) => Bound::Included(self.full_key(gte)),
            (None, None) if self.prefix.is_empty() => Bound::Unbounded,
            (None, None) => Bound::Included(self.prefix.clone()),
        };
        let upper = match (&range.lt, &range.lte) {
            (Some(lt), _) => Bound::Excluded(self.full_key(lt)),
            (None, Some(lte)) => Bound::Included(self.full_key(lte)),
            (None, None) => match prefix_end(&self.prefix) {
                Some(end) => Bound::Excluded(end),
                None => Bound::Unbounded,
            },
        };
        (lower, upper)
    }
}

/// First key after every key starting with `prefix`.
fn prefix_end(prefix: &str) -> Option<String> {
    let stem = prefix.strip_suffix(SUB_SEPARATOR)?;
    Some(format!("{stem}\u{1}"))
}

/// Scan over a view; yields entries with the view prefix removed.
pub struct ViewScan {
    inner: SnapshotScan,
    prefix_len: usize,
}

impl Iterator for ViewScan {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        let mut entry = self.inner.next()?;
        entry.key = entry.key.split_off(self.prefix_len);
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::KeyRange;
    use crate::log::{LogCore, LogHandle};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn handle() -> LogHandle {
        LogHandle::new(
            Arc::new(LogCore::new(&"1".repeat(64), true, None)),
            Duration::from_secs(1),
            1024 * 1024,
        )
    }

    #[tokio::test]
    async fn nested_views_are_isolated_from_siblings() {
        let log = handle();
        let posts = log.sub("example.com").sub("post");
        let postx = log.sub("example.com").sub("postx");
        posts.put("a", json!(1)).await.expect("put");
        postx.put("a", json!(2)).await.expect("put");
        log.put("example.com", json!(3)).await.expect("root put");

        let keys: Vec<String> = posts
            .scan(&KeyRange::default())
            .await
            .expect("scan")
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["a"]);
        assert_eq!(posts.get("a").await.expect("get").expect("a").value, json!(1));
        assert_eq!(posts.full_key("a"), "example.com\0post\0a");
    }

    #[tokio::test]
    async fn range_bounds_are_relative_to_the_view() {
        let view = handle().sub("t");
        for key in ["a", "b", "c", "d"] {
            view.put(key, json!(key)).await.expect("put");
        }
        let range = KeyRange {
            gte: Some("b".into()),
            lt: Some("d".into()),
            reverse: true,
            ..KeyRange::default()
        };
        let keys: Vec<String> = view
            .scan(&range)
            .await
            .expect("scan")
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn view_diff_strips_prefix() {
        let log = handle();
        let view = log.sub("a").sub("b");
        let since = log.version().await.expect("version");
        view.put("k", json!(1)).await.expect("put");
        log.sub("a").sub("c").put("k", json!(1)).await.expect("put other");
        let diff = view.diff(since, None).await.expect("diff");
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].key(), "k");
    }
}
