//! Append-only changelog of store mutations.
//!
//! Each frame is a 4-byte little-endian payload length followed by the
//! payload: the 8-byte little-endian version, the 4-byte little-endian key
//! length, the key bytes, and the value bytes. A frame is written with a
//! single `write_all`, so a crash can only leave a partial frame at the
//! very end of the file.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{StateError, StateResult};

const LEN_BYTES: usize = 4;
const HEADER_BYTES: usize = 8 + 4;

/// One mutation: `key` now maps to `value` at `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: u64,
}

impl ChangelogRecord {
    fn encode_frame(&self) -> Vec<u8> {
        let payload_len = HEADER_BYTES + self.key.len() + self.value.len();
        let mut frame = Vec::with_capacity(LEN_BYTES + payload_len);
        frame.extend_from_slice(&(payload_len as u32).to_le_bytes());
        frame.extend_from_slice(&self.version.to_le_bytes());
        frame.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        frame.extend_from_slice(&self.key);
        frame.extend_from_slice(&self.value);
        frame
    }

    fn decode_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() < HEADER_BYTES {
            return None;
        }
        let version = u64::from_le_bytes(payload[..8].try_into().ok()?);
        let key_len = u32::from_le_bytes(payload[8..12].try_into().ok()?) as usize;
        let body = &payload[HEADER_BYTES..];
        if key_len > body.len() {
            return None;
        }
        let (key, value) = body.split_at(key_len);
        Some(Self {
            key: key.to_vec(),
            value: value.to_vec(),
            version,
        })
    }
}

/// Writer half of a changelog file.
pub struct Changelog {
    path: PathBuf,
    writer: BufWriter<File>,
    /// Byte length of the log including buffered, unflushed frames.
    position: u64,
}

impl Changelog {
    /// Open (or create) the changelog at `path` for appending.
    pub fn open(path: &Path) -> StateResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StateError::changelog(path, e))?;
        let position = file
            .metadata()
            .map_err(|e| StateError::changelog(path, e))?
            .len();
        debug!(path = %path.display(), position, "changelog opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            position,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Append a frame. Returns the byte position at which it starts.
    ///
    /// The frame is buffered; it is durable only after [`Changelog::sync`].
    pub fn append(&mut self, record: &ChangelogRecord) -> StateResult<u64> {
        let start = self.position;
        let frame = record.encode_frame();
        self.writer
            .write_all(&frame)
            .map_err(|e| StateError::changelog(&self.path, e))?;
        self.position += frame.len() as u64;
        Ok(start)
    }

    /// Push buffered frames to the OS without forcing them to disk.
    pub fn flush_buffer(&mut self) -> StateResult<()> {
        self.writer
            .flush()
            .map_err(|e| StateError::changelog(&self.path, e))
    }

    /// Flush buffered frames and fsync the file.
    pub fn sync(&mut self) -> StateResult<()> {
        self.flush_buffer()?;
        self.writer
            .get_ref()
            .sync_data()
            .map_err(|e| StateError::changelog(&self.path, e))
    }

    /// Cut the log at `position`, discarding every frame after it.
    pub fn truncate(&mut self, position: u64) -> StateResult<()> {
        self.flush_buffer()?;
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| StateError::changelog(&self.path, e))?;
        file.set_len(position)
            .map_err(|e| StateError::changelog(&self.path, e))?;
        file.sync_data()
            .map_err(|e| StateError::changelog(&self.path, e))?;

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| StateError::changelog(&self.path, e))?;
        self.writer = BufWriter::new(file);
        self.position = position;
        debug!(path = %self.path.display(), position, "changelog truncated");
        Ok(())
    }
}

/// Sequential reader over the frames of a changelog file.
///
/// Yields `(start position, record)`. When the file ends inside a frame the
/// reader yields [`StateError::CorruptChangelog`] and rewinds to the start
/// of that frame, so a reader tailing a live file can simply retry later.
pub struct ChangelogReader {
    path: PathBuf,
    reader: BufReader<File>,
    position: u64,
    frames: u64,
}

impl ChangelogReader {
    pub fn open(path: &Path) -> StateResult<Self> {
        let file = File::open(path).map_err(|e| StateError::changelog(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            position: 0,
            frames: 0,
        })
    }

    /// Position just past the last complete frame read.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of complete frames read so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn truncated(&mut self, start: u64) -> StateError {
        if let Err(e) = self.reader.seek(SeekFrom::Start(start)) {
            return StateError::changelog(&self.path, e);
        }
        StateError::CorruptChangelog {
            path: self.path.clone(),
            position: start,
            applied: self.frames,
        }
    }

    fn read_frame(&mut self) -> Option<StateResult<(u64, ChangelogRecord)>> {
        let start = self.position;

        let mut len_bytes = [0u8; LEN_BYTES];
        match read_full(&mut self.reader, &mut len_bytes) {
            Ok(0) => return None,
            Ok(n) if n < LEN_BYTES => return Some(Err(self.truncated(start))),
            Ok(_) => {}
            Err(e) => return Some(Err(StateError::changelog(&self.path, e))),
        }

        let len = u32::from_le_bytes(len_bytes) as usize;
        // A length running past the end of the file is a torn or damaged
        // prefix; never allocate for it.
        let file_len = match self.reader.get_ref().metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) => return Some(Err(StateError::changelog(&self.path, e))),
        };
        if start + (LEN_BYTES + len) as u64 > file_len {
            return Some(Err(self.truncated(start)));
        }
        let mut payload = vec![0u8; len];
        match read_full(&mut self.reader, &mut payload) {
            Ok(n) if n < len => return Some(Err(self.truncated(start))),
            Ok(_) => {}
            Err(e) => return Some(Err(StateError::changelog(&self.path, e))),
        }

        let Some(record) = ChangelogRecord::decode_payload(&payload) else {
            return Some(Err(self.truncated(start)));
        };

        self.position = start + (LEN_BYTES + len) as u64;
        self.frames += 1;
        Some(Ok((start, record)))
    }
}

impl Iterator for ChangelogReader {
    type Item = StateResult<(u64, ChangelogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_frame()
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
