use crate::error::DbError;
use crate::lib_helpers::now_micros;
use crate::wal::frame::{Frame, FrameError, FrameKind, FrameReader, FrameWriter};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// Frames recovered from one WAL file.
#[derive(Debug)]
pub struct ScannedFrames {
    pub frames: Vec<Frame>,
    /// Byte length of the intact prefix.
    pub valid_len: u64,
    pub file_len: u64,
    pub damage: Option<FrameError>,
}

pub fn scan_frames(path: &Path) -> Result<ScannedFrames, DbError> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = FrameReader::new(BufReader::new(file));
    let mut frames = Vec::new();
    let mut valid_len = 0u64;
    let damage = loop {
        match reader.next_frame() {
            Ok(Some(frame)) => {
                valid_len += frame.encoded_len();
                frames.push(frame);
            }
            Ok(None) => break None,
            Err(FrameError::Io(message)) => return Err(DbError::Io(std::io::Error::other(message))),
            Err(e) => break Some(e),
        }
    };
    Ok(ScannedFrames {
        frames,
        valid_len,
        file_len,
        damage,
    })
}

/// Single append-only file backing one log or feed.
pub struct WalFile {
    file: File,
    path: PathBuf,
    sync: bool,
    size_bytes: u64,
}

impl WalFile {
    pub fn create(path: &Path, header: &[u8], sync: bool) -> Result<Self, DbError> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .read(true)
            .open(path)?;
        let mut wal = Self {
            file,
            path: path.to_path_buf(),
            sync,
            size_bytes: 0,
        };
        wal.append(0, FrameKind::Header, header)?;
        wal.file.sync_all()?;
        Ok(wal)
    }

    /// Opens an existing file and returns every intact frame, header first.
    ///
    /// A damaged tail fails the open when `strict`; otherwise the file is cut
    /// back to its intact prefix so later appends land on a clean boundary.
    pub fn open(path: &Path, strict: bool, sync: bool) -> Result<(Self, Vec<Frame>), DbError> {
        let scanned = scan_frames(path)?;
        if let Some(damage) = &scanned.damage {
            if strict {
                error!(
                    path = %path.display(),
                    valid_len = scanned.valid_len,
                    file_len = scanned.file_len,
                    %damage,
                    "wal tail damaged"
                );
                return Err(DbError::Corruption {
                    message: format!("{}: {damage} at byte {}", path.display(), scanned.valid_len),
                });
            }
            warn!(
                path = %path.display(),
                valid_len = scanned.valid_len,
                dropped_bytes = scanned.file_len - scanned.valid_len,
                %damage,
                "truncating damaged wal tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(scanned.valid_len)?;
            file.sync_all()?;
        }
        match scanned.frames.first() {
            Some(frame) if frame.kind == FrameKind::Header => {}
            _ => {
                return Err(DbError::Corruption {
                    message: format!("{}: missing header frame", path.display()),
                });
            }
        }
        let file = OpenOptions::new().append(true).read(true).open(path)?;
        Ok((
            Self {
                file,
                path: path.to_path_buf(),
                sync,
                size_bytes: scanned.valid_len,
            },
            scanned.frames,
        ))
    }

    pub fn append(&mut self, seq: u64, kind: FrameKind, payload: &[u8]) -> Result<(), DbError> {
        let mut writer = FrameWriter::new(Vec::<u8>::new());
        writer
            .append(seq, now_micros(), kind, payload)
            .map_err(|e| DbError::Encode(format!("frame: {e}")))?;
        let bytes = writer.into_inner();
        self.file.write_all(&bytes)?;
        if self.sync {
            self.file.flush()?;
            self.file.sync_data()?;
        }
        self.size_bytes = self.size_bytes.saturating_add(bytes.len() as u64);
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), DbError> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::{WalFile, scan_frames};
    use crate::wal::frame::FrameKind;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn reopen_returns_header_and_appended_frames() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("a.log");
        let mut wal = WalFile::create(&path, b"hdr", false).expect("create");
        wal.append(1, FrameKind::Batch, b"one").expect("append");
        wal.append(2, FrameKind::Batch, b"two").expect("append");
        drop(wal);

        let (_, frames) = WalFile::open(&path, true, false).expect("open");
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].kind, FrameKind::Header);
        assert_eq!(frames[0].payload, b"hdr");
        assert_eq!(frames[2].seq, 2);
    }

    #[test]
    fn torn_tail_fails_strict_and_is_trimmed_permissive() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("b.log");
        let mut wal = WalFile::create(&path, b"hdr", false).expect("create");
        wal.append(1, FrameKind::Batch, b"kept").expect("append");
        drop(wal);
        let intact_len = std::fs::metadata(&path).expect("meta").len();
        let mut file = OpenOptions::new().append(true).open(&path).expect("open raw");
        file.write_all(&[0, 0, 0, 40, 1, 2]).expect("torn write");
        drop(file);

        let err = WalFile::open(&path, true, false).err().expect("strict must fail");
        assert_eq!(err.code_str(), "corruption");

        let (mut wal, frames) = WalFile::open(&path, false, false).expect("permissive");
        assert_eq!(frames.len(), 2);
        assert_eq!(std::fs::metadata(&path).expect("meta").len(), intact_len);
        wal.append(2, FrameKind::Batch, b"after").expect("append after trim");
        drop(wal);

        let scanned = scan_frames(&path).expect("scan");
        assert!(scanned.damage.is_none());
        assert_eq!(scanned.frames.len(), 3);
    }
}
