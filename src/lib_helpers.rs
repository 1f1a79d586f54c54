use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) const URL_SCHEME: &str = "tdb://";

pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// 64 lowercase hex chars, the same shape as `DbDesc::blobs_feed_key`.
pub(crate) fn new_log_key() -> String {
    blake3::hash(uuid::Uuid::new_v4().as_bytes())
        .to_hex()
        .to_string()
}

pub(crate) fn is_log_key(value: &str) -> bool {
    value.len() == 64
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

pub fn database_url(key: &str) -> String {
    format!("{URL_SCHEME}{key}/")
}

/// Canonical entry URL: `<database-url>/<schemaId>/<key>`.
pub fn entry_url(database_url: &str, schema_id: &str, key: &str) -> String {
    format!("{}/{schema_id}/{key}", database_url.trim_end_matches('/'))
}

/// Extracts the log key from a database URL or returns the input when it
/// already is a bare key.
pub(crate) fn key_from_url(value: &str) -> Option<&str> {
    let stripped = value
        .strip_prefix(URL_SCHEME)
        .map(|rest| rest.trim_end_matches('/'))
        .unwrap_or(value);
    is_log_key(stripped).then_some(stripped)
}
