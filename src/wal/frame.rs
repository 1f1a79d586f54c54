use crc32c::crc32c;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const MAX_FRAME_BODY_BYTES: usize = 64 * 1024 * 1024;

/// seq + written_at + kind + crc
const FRAME_OVERHEAD: usize = 8 + 8 + 1 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Header,
    Batch,
    Block,
}

impl FrameKind {
    pub fn as_byte(self) -> u8 {
        match self {
            FrameKind::Header => 0x01,
            FrameKind::Batch => 0x02,
            FrameKind::Block => 0x03,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameKind::Header),
            0x02 => Some(FrameKind::Batch),
            0x03 => Some(FrameKind::Block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u64,
    pub written_at_micros: u64,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Bytes this frame occupies on disk, length prefix included.
    pub fn encoded_len(&self) -> u64 {
        (4 + FRAME_OVERHEAD + self.payload.len()) as u64
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated frame")]
    Truncation,
    #[error("corrupt frame")]
    Corruption,
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for FrameError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn append(
        &mut self,
        seq: u64,
        written_at_micros: u64,
        kind: FrameKind,
        payload: &[u8],
    ) -> Result<(), FrameError> {
        let body_len = FRAME_OVERHEAD + payload.len();
        if body_len > MAX_FRAME_BODY_BYTES {
            return Err(FrameError::Corruption);
        }
        let frame_length = u32::try_from(body_len).map_err(|_| FrameError::Corruption)?;

        let mut bytes = Vec::with_capacity(4 + body_len);
        bytes.extend_from_slice(&frame_length.to_be_bytes());
        bytes.extend_from_slice(&seq.to_be_bytes());
        bytes.extend_from_slice(&written_at_micros.to_be_bytes());
        bytes.push(kind.as_byte());
        bytes.extend_from_slice(payload);
        let crc = crc32c(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());

        self.inner.write_all(&bytes)?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut len_buf = [0u8; 4];
        let first = self.inner.read(&mut len_buf[0..1])?;
        if first == 0 {
            return Ok(None);
        }
        match self.inner.read_exact(&mut len_buf[1..4]) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::Truncation);
            }
            Err(e) => return Err(FrameError::Io(e.to_string())),
        }
        let body_len = u32::from_be_bytes(len_buf) as usize;
        if !(FRAME_OVERHEAD..=MAX_FRAME_BODY_BYTES).contains(&body_len) {
            return Err(FrameError::Corruption);
        }

        let mut body = vec![0u8; body_len];
        match self.inner.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::Truncation);
            }
            Err(e) => return Err(FrameError::Io(e.to_string())),
        }

        let crc_offset = body_len - 4;
        let stored_crc = u32::from_be_bytes(
            body[crc_offset..]
                .try_into()
                .map_err(|_| FrameError::Corruption)?,
        );
        let mut crc_input = Vec::with_capacity(4 + crc_offset);
        crc_input.extend_from_slice(&len_buf);
        crc_input.extend_from_slice(&body[..crc_offset]);
        if crc32c(&crc_input) != stored_crc {
            return Err(FrameError::Corruption);
        }

        let seq = u64::from_be_bytes(body[0..8].try_into().map_err(|_| FrameError::Corruption)?);
        let written_at_micros =
            u64::from_be_bytes(body[8..16].try_into().map_err(|_| FrameError::Corruption)?);
        let kind = FrameKind::from_byte(body[16]).ok_or(FrameError::Corruption)?;
        body.truncate(crc_offset);
        let payload = body.split_off(17);

        Ok(Some(Frame {
            seq,
            written_at_micros,
            kind,
            payload,
        }))
    }
}
