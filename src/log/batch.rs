use super::{LogHandle, LogOp};
use crate::error::DbError;
use serde_json::Value;

/// Staged writes that commit together in one WAL frame.
pub struct Batch {
    log: LogHandle,
    ops: Vec<LogOp>,
}

impl Batch {
    pub(crate) fn new(log: LogHandle) -> Self {
        Self {
            log,
            ops: Vec::new(),
        }
    }

    pub fn log_key(&self) -> &str {
        self.log.key()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.ops.push(LogOp::Put {
            key: key.into(),
            value,
        });
    }

    pub fn del(&mut self, key: impl Into<String>) {
        self.ops.push(LogOp::Del { key: key.into() });
    }

    /// Latest staged state of `key`: `Some(Some(v))` for a pending put,
    /// `Some(None)` for a pending delete, `None` when untouched.
    pub fn pending(&self, key: &str) -> Option<Option<&Value>> {
        self.ops
            .iter()
            .rev()
            .find(|op| op.key() == key)
            .map(|op| match op {
                LogOp::Put { value, .. } => Some(value),
                LogOp::Del { .. } => None,
            })
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn savepoint(&self) -> usize {
        self.ops.len()
    }

    /// Discards everything staged after `savepoint`.
    pub fn rollback_to(&mut self, savepoint: usize) {
        self.ops.truncate(savepoint);
    }

    /// Commits the staged ops and returns the log version after the write.
    pub async fn flush(self) -> Result<u64, DbError> {
        if self.ops.is_empty() {
            return self.log.version().await;
        }
        self.log.commit(self.ops).await
    }
}

#[cfg(test)]
mod tests {
    use crate::log::{LogCore, LogHandle};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn handle() -> LogHandle {
        LogHandle::new(
            Arc::new(LogCore::new(&"2".repeat(64), true, None)),
            Duration::from_secs(1),
            1024 * 1024,
        )
    }

    #[tokio::test]
    async fn nothing_is_visible_before_flush() {
        let log = handle();
        let mut batch = log.batch();
        batch.put("a", json!(1));
        batch.put("b", json!(2));
        assert!(log.get("a").await.expect("get").is_none());
        assert_eq!(batch.pending("a"), Some(Some(&json!(1))));

        let version = batch.flush().await.expect("flush");
        assert_eq!(version, 3);
        assert_eq!(log.get("b").await.expect("get").expect("b").seq, 2);
    }

    #[tokio::test]
    async fn rollback_drops_ops_after_savepoint() {
        let log = handle();
        let mut batch = log.batch();
        batch.put("keep", json!(1));
        let mark = batch.savepoint();
        batch.put("drop", json!(2));
        batch.del("keep");
        assert_eq!(batch.pending("keep"), Some(None));
        batch.rollback_to(mark);
        assert_eq!(batch.len(), 1);
        batch.flush().await.expect("flush");
        assert!(log.get("keep").await.expect("get").is_some());
        assert!(log.get("drop").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn empty_flush_is_a_no_op() {
        let log = handle();
        assert_eq!(log.batch().flush().await.expect("flush"), 1);
        let replica = log.read_only();
        assert_eq!(replica.batch().flush().await.expect("empty flush"), 1);
        let mut batch = replica.batch();
        batch.put("a", json!(1));
        assert_eq!(
            batch.flush().await.expect_err("replica").code_str(),
            "not_writable"
        );
    }
}
