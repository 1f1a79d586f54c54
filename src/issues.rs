use crate::lib_helpers::now_micros;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// A failure that was isolated instead of aborting the surrounding work.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Issue {
    /// One diff entry could not be indexed.
    #[serde(rename_all = "camelCase")]
    DbIndexing {
        indexer: String,
        source_db_url: String,
        indexing_db_url: String,
        diff_key: String,
        diff_seq: u64,
        error: String,
        recorded_at: u64,
    },
    /// A dbmethod handler returned a value its own schema rejects.
    #[serde(rename_all = "camelCase")]
    DbMethodBadResponse {
        method: String,
        db_url: String,
        response: Value,
        error: String,
        recorded_at: u64,
    },
}

impl Issue {
    pub fn description(&self) -> String {
        match self {
            Issue::DbIndexing {
                indexer, diff_key, ..
            } => format!("indexer {indexer} failed to index {diff_key}"),
            Issue::DbMethodBadResponse { method, .. } => {
                format!("dbmethod {method} returned an invalid response")
            }
        }
    }

    pub(crate) fn indexing(
        indexer: &str,
        source_db_url: &str,
        indexing_db_url: &str,
        diff_key: &str,
        diff_seq: u64,
        error: String,
    ) -> Self {
        Issue::DbIndexing {
            indexer: indexer.to_string(),
            source_db_url: source_db_url.to_string(),
            indexing_db_url: indexing_db_url.to_string(),
            diff_key: diff_key.to_string(),
            diff_seq,
            error,
            recorded_at: now_micros(),
        }
    }
}

#[derive(Default)]
pub struct IssueTracker {
    issues: Mutex<Vec<Issue>>,
}

impl IssueTracker {
    pub fn add(&self, issue: Issue) {
        warn!(issue = %issue.description(), details = ?issue, "issue recorded");
        self.issues.lock().push(issue);
    }

    pub fn list(&self) -> Vec<Issue> {
        self.issues.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.issues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.lock().is_empty()
    }

    pub fn clear(&self) {
        self.issues.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{Issue, IssueTracker};
    use serde_json::json;

    #[test]
    fn issues_serialize_with_a_type_tag() {
        let issue = Issue::indexing("a/b", "tdb://src/", "tdb://idx/", "k", 7, "boom".into());
        let value = serde_json::to_value(&issue).expect("json");
        assert_eq!(value["type"], json!("dbIndexing"));
        assert_eq!(value["diffSeq"], json!(7));
        assert_eq!(issue.description(), "indexer a/b failed to index k");
    }

    #[test]
    fn tracker_collects_and_clears() {
        let tracker = IssueTracker::default();
        assert!(tracker.is_empty());
        tracker.add(Issue::indexing("x/y", "s", "i", "k", 1, "e".into()));
        assert_eq!(tracker.len(), 1);
        tracker.clear();
        assert!(tracker.list().is_empty());
    }
}
