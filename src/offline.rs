//! Read-only inspection of a directory-backed store without opening a host.

use crate::error::DbError;
use crate::log::store::{FEED_FILE_EXT, LOG_FILE_EXT};
use crate::log::{BatchRecord, LogHeader, LogOp};
use crate::wal::file::scan_frames;
use crate::wal::frame::FrameKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpRow {
    pub key: String,
    pub value: Value,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogDump {
    pub key: String,
    pub owned: bool,
    pub version: u64,
    /// Latest value of every live key, in key order.
    pub rows: Vec<DumpRow>,
    /// Set when the file ends in a damaged frame; rows cover the intact
    /// prefix only.
    pub damage: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    pub file: String,
    pub kind: String,
    pub frames: u64,
    pub valid_len: u64,
    pub file_len: u64,
    pub header_ok: bool,
    pub damage: Option<String>,
}

impl FileReport {
    pub fn ok(&self) -> bool {
        self.header_ok && self.damage.is_none()
    }
}

/// Replays `<dir>/<key>.log` and returns its latest state.
pub fn dump_log(dir: &Path, key: &str) -> Result<LogDump, DbError> {
    let path = dir.join(format!("{key}.{LOG_FILE_EXT}"));
    let scanned = scan_frames(&path)?;
    let Some(first) = scanned.frames.first() else {
        return Err(DbError::Corruption {
            message: format!("{}: missing header frame", path.display()),
        });
    };
    let header = LogHeader::decode(first)?;
    let mut rows: BTreeMap<String, DumpRow> = BTreeMap::new();
    let mut version = 1u64;
    for frame in scanned.frames.iter().skip(1) {
        if frame.kind != FrameKind::Batch {
            continue;
        }
        let record: BatchRecord = rmp_serde::from_slice(&frame.payload)?;
        if record.first_seq != version {
            return Err(DbError::Corruption {
                message: format!(
                    "{}: batch at seq {} follows version {version}",
                    path.display(),
                    record.first_seq
                ),
            });
        }
        for op in record.ops {
            match op {
                LogOp::Put { key, value } => {
                    rows.insert(
                        key.clone(),
                        DumpRow {
                            key,
                            value,
                            seq: version,
                        },
                    );
                }
                LogOp::Del { key } => {
                    rows.remove(&key);
                }
            }
            version += 1;
        }
    }
    Ok(LogDump {
        key: header.key,
        owned: header.owned,
        version,
        rows: rows.into_values().collect(),
        damage: scanned.damage.map(|d| d.to_string()),
    })
}

/// Scans every log and feed file in `dir`, sorted by file name.
pub fn verify_dir(dir: &Path) -> Result<Vec<FileReport>, DbError> {
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == LOG_FILE_EXT || ext == FEED_FILE_EXT)
        })
        .collect();
    paths.sort();

    let mut reports = Vec::with_capacity(paths.len());
    for path in paths {
        let scanned = scan_frames(&path)?;
        let header_ok = scanned
            .frames
            .first()
            .is_some_and(|f| LogHeader::decode(f).is_ok());
        reports.push(FileReport {
            file: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            kind: path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default(),
            frames: scanned.frames.len() as u64,
            valid_len: scanned.valid_len,
            file_len: scanned.file_len,
            header_ok,
            damage: scanned.damage.map(|d| d.to_string()),
        });
    }
    Ok(reports)
}
