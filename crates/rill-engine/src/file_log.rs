//! File-backed partitioned topic log.
//!
//! Layout under the log directory:
//!
//! ```text
//! <root>/<topic>/<partition>.log        changelog frames, one per record
//! <root>/<topic>/<group>.offsets         committed watermark (JSON)
//! ```
//!
//! Records use the state changelog frame format; the frame version holds
//! the producer timestamp in milliseconds. A record's offset is its frame
//! index inside the partition file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rill_core::{RawRecord, Watermark};
use rill_state::{Changelog, ChangelogReader, ChangelogRecord, StateError};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::source::{Backend, RecordSink, RecordSource, SinkError, partition_for};

const MAX_BATCH: usize = 500;

/// Topics stored as changelog files under one directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
    partitions: u32,
    group: String,
}

impl FileBackend {
    /// Backend rooted at `root`; sources commit their offsets under `group`.
    pub fn new(root: &Path, partitions: u32, group: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            partitions: partitions.max(1),
            group: group.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn topic_dir(&self, topic: &str) -> EngineResult<PathBuf> {
        if topic.is_empty() || topic.contains(['/', '\\']) || topic.starts_with('.') {
            return Err(EngineError::connector(topic, "invalid topic name"));
        }
        Ok(self.root.join(topic))
    }

    /// Watermark last committed by this backend's group on `topic`.
    pub fn committed(&self, topic: &str) -> EngineResult<Watermark> {
        let path = offsets_path(&self.topic_dir(topic)?, &self.group);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| EngineError::connector(topic, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Watermark::new()),
            Err(e) => Err(EngineError::connector(topic, e)),
        }
    }
}

impl Backend for FileBackend {
    type Source = FileSource;
    type Sink = FileSink;

    fn source(&self, topic: &str) -> EngineResult<FileSource> {
        let dir = self.topic_dir(topic)?;
        let partitions = (0..self.partitions)
            .map(|p| (p, PartitionCursor::new(partition_path(&dir, p))))
            .collect();
        Ok(FileSource {
            topic: topic.to_string(),
            offsets_path: offsets_path(&dir, &self.group),
            partitions,
        })
    }

    fn sink(&self, topic: &str) -> EngineResult<FileSink> {
        let dir = self.topic_dir(topic)?;
        std::fs::create_dir_all(&dir).map_err(|e| EngineError::connector(topic, e))?;
        Ok(FileSink {
            topic: topic.to_string(),
            dir,
            partitions: self.partitions,
            logs: BTreeMap::new(),
        })
    }
}

fn partition_path(dir: &Path, partition: u32) -> PathBuf {
    dir.join(format!("{partition}.log"))
}

fn offsets_path(dir: &Path, group: &str) -> PathBuf {
    dir.join(format!("{group}.offsets"))
}

/// Read position inside one partition file.
struct PartitionCursor {
    path: PathBuf,
    reader: Option<ChangelogReader>,
    /// Offset of the next frame the reader returns.
    offset: u64,
    /// Frames below this offset are skipped, not returned.
    resume_at: u64,
}

impl PartitionCursor {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            reader: None,
            offset: 0,
            resume_at: 0,
        }
    }

    fn seek(&mut self, offset: u64) {
        self.reader = None;
        self.offset = 0;
        self.resume_at = offset;
    }

    /// Read up to `max` complete frames that are already on disk.
    fn read_available(
        &mut self,
        topic: &str,
        partition: u32,
        max: usize,
        out: &mut Vec<RawRecord>,
    ) -> EngineResult<()> {
        if self.reader.is_none() {
            if !self.path.exists() {
                return Ok(());
            }
            self.reader = Some(ChangelogReader::open(&self.path).map_err(|e| transient(topic, e))?);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(());
        };

        let mut read = 0;
        while read < max {
            match reader.next() {
                None => break,
                // A producer is mid-write; the reader rewound to the frame start.
                Some(Err(StateError::CorruptChangelog { .. })) => break,
                Some(Err(e)) => return Err(transient(topic, e)),
                Some(Ok((_, frame))) => {
                    let offset = self.offset;
                    self.offset += 1;
                    if offset < self.resume_at {
                        continue;
                    }
                    out.push(RawRecord::new(frame.key, frame.value, partition, offset, frame.version));
                    read += 1;
                }
            }
        }
        Ok(())
    }
}

fn transient(topic: &str, error: StateError) -> EngineError {
    EngineError::Transient(format!("{topic}: {error}"))
}

/// Source over every partition file of a topic.
pub struct FileSource {
    topic: String,
    offsets_path: PathBuf,
    partitions: BTreeMap<u32, PartitionCursor>,
}

impl FileSource {
    fn read_batch(&mut self) -> EngineResult<Vec<RawRecord>> {
        let mut batch = Vec::new();
        for (partition, cursor) in self.partitions.iter_mut() {
            let room = MAX_BATCH.saturating_sub(batch.len());
            if room == 0 {
                break;
            }
            cursor.read_available(&self.topic, *partition, room, &mut batch)?;
        }
        Ok(batch)
    }
}

impl RecordSource for FileSource {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn pull(&mut self, timeout: Duration) -> EngineResult<Vec<RawRecord>> {
        let batch = self.read_batch()?;
        if !batch.is_empty() {
            return Ok(batch);
        }
        tokio::time::sleep(timeout).await;
        self.read_batch()
    }

    fn commit(&mut self, watermark: &Watermark) -> EngineResult<()> {
        let bytes = serde_json::to_vec(watermark).map_err(|e| EngineError::connector(&self.topic, e))?;
        if let Some(dir) = self.offsets_path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| EngineError::connector(&self.topic, e))?;
        }
        let tmp = self.offsets_path.with_extension("offsets.tmp");
        std::fs::write(&tmp, bytes).map_err(|e| EngineError::connector(&self.topic, e))?;
        std::fs::rename(&tmp, &self.offsets_path).map_err(|e| EngineError::connector(&self.topic, e))?;
        debug!(topic = %self.topic, ?watermark, "offsets committed");
        Ok(())
    }

    fn seek(&mut self, watermark: &Watermark) -> EngineResult<()> {
        for (partition, cursor) in self.partitions.iter_mut() {
            cursor.seek(watermark.next_offset(*partition));
        }
        for partition in watermark.partitions.keys() {
            if !self.partitions.contains_key(partition) {
                warn!(topic = %self.topic, partition, "watermark names an unknown partition");
            }
        }
        Ok(())
    }
}

/// Sink appending frames to the partition chosen by the record key.
pub struct FileSink {
    topic: String,
    dir: PathBuf,
    partitions: u32,
    logs: BTreeMap<u32, Changelog>,
}

impl FileSink {
    fn append(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        let partition = partition_for(key, self.partitions);
        let log = match self.logs.entry(partition) {
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(Changelog::open(&partition_path(&self.dir, partition))?)
            }
        };
        log.append(&ChangelogRecord {
            key: key.to_vec(),
            value: value.to_vec(),
            version: epoch_millis(),
        })?;
        log.flush_buffer()
    }
}

impl RecordSink for FileSink {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&mut self, key: &[u8], value: &[u8]) -> Result<(), SinkError> {
        self.append(key, value).map_err(|e| {
            // Drop the handle so the next attempt reopens the file.
            self.logs.clear();
            SinkError::Unavailable(e.to_string())
        })
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;

    #[tokio::test]
    async fn published_records_are_pulled_with_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), 1, "g");
        let mut sink = backend.sink("streams-input").unwrap();
        sink.publish(b"k1", b"good-7").await.unwrap();
        sink.publish(b"k1", b"good-9").await.unwrap();

        let mut source = backend.source("streams-input").unwrap();
        let batch = source.pull(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].value, b"good-7");
        assert_eq!(batch[1].offset, 1);
        assert!(batch[0].timestamp > 0);

        sink.publish(b"k1", b"good-11").await.unwrap();
        let batch = source.pull(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].offset, 2);
    }

    #[tokio::test]
    async fn missing_topic_is_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), 2, "g");
        let mut source = backend.source("nothing-yet").unwrap();
        assert!(source.pull(Duration::from_millis(5)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn seek_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), 1, "g");
        let mut sink = backend.sink("in").unwrap();
        for value in [b"a", b"b", b"c"] {
            sink.publish(b"k", value).await.unwrap();
        }

        let mut wm = Watermark::new();
        wm.advance(0, 1);
        let mut source = backend.source("in").unwrap();
        source.seek(&wm).unwrap();
        let batch = source.pull(Duration::from_millis(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, b"c");
        assert_eq!(batch[0].offset, 2);

        source.commit(&wm).unwrap();
        assert_eq!(backend.committed("in").unwrap(), wm);
        assert!(backend.committed("other").unwrap().is_empty());
    }

    #[tokio::test]
    async fn partial_tail_frame_is_read_once_complete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), 1, "g");
        let mut sink = backend.sink("in").unwrap();
        sink.publish(b"k", b"first").await.unwrap();

        // Half a length prefix: a producer caught mid-write.
        let path = dir.path().join("in").join("0.log");
        OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&[9, 0])
            .unwrap();

        let mut source = backend.source("in").unwrap();
        let batch = source.pull(Duration::from_millis(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(source.pull(Duration::from_millis(5)).await.unwrap().is_empty());
    }

    #[test]
    fn rejects_path_like_topics() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), 1, "g");
        assert!(backend.sink("../escape").is_err());
        assert!(backend.source("").is_err());
    }
}
