//! Channel output files and their partition index sidecar.
//!
//! A completed task leaves two files under `<data_dir>/<job_id>/`:
//!
//! ```text
//! <task_id>.chan   raw segment bytes, partitions interleaved in write order
//! <task_id>.idx    [i32 partition_count]
//!                  per partition: [i32 partition][i32 segment_count]
//!                  per segment:   [i64 offset][i64 compressed][i64 uncompressed]
//! ```
//!
//! All integers are little-endian. Segment bytes are opaque here; whatever
//! codec the producer used is carried through untouched.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::job::JobId;
use crate::task::validate_task_id;

/// Bytes of the per-segment `(compressed, uncompressed)` header on the wire.
pub const SEGMENT_HEADER_LEN: u64 = 16;

/// Bytes of the per-partition `(compressed, uncompressed, segment_count)`
/// header on the wire.
pub const PARTITION_HEADER_LEN: u64 = 8 + 8 + 4;

/// Bytes of the marker sent for a partition the task never wrote.
pub const ABSENT_PARTITION_LEN: u64 = 8;

const MAX_PARTITIONS: i32 = 1 << 20;
const MAX_SEGMENTS: i32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub compressed: u64,
    pub uncompressed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionEntry {
    pub segments: Vec<Segment>,
}

impl PartitionEntry {
    /// Size announced on the wire: every segment's bytes plus its header.
    pub fn compressed_size(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| SEGMENT_HEADER_LEN + s.compressed)
            .sum()
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.segments.iter().map(|s| s.uncompressed).sum()
    }

    /// Bytes this partition occupies in a shuffle response.
    pub fn response_len(&self) -> u64 {
        PARTITION_HEADER_LEN + self.compressed_size()
    }
}

/// Parsed index of one output file. Immutable once built.
#[derive(Debug, Clone)]
pub struct PartitionFileIndex {
    data_path: PathBuf,
    partitions: BTreeMap<i32, PartitionEntry>,
}

impl PartitionFileIndex {
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn partition(&self, partition: i32) -> Option<&PartitionEntry> {
        self.partitions
            .get(&partition)
            .filter(|p| !p.segments.is_empty())
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Total response bytes for `requested`, absent partitions included.
    pub fn response_len(&self, requested: &[i32]) -> u64 {
        requested
            .iter()
            .map(|p| match self.partition(*p) {
                Some(entry) => entry.response_len(),
                None => ABSENT_PARTITION_LEN,
            })
            .sum()
    }

    /// Parses `index_path`, checking every segment against the length of
    /// `data_path`.
    pub fn read_from(index_path: &Path, data_path: &Path) -> Result<Self> {
        let data_len = fs::metadata(data_path)?.len();
        let mut reader = BufReader::new(File::open(index_path)?);

        let count = read_i32(&mut reader)?;
        if !(0..=MAX_PARTITIONS).contains(&count) {
            return Err(corrupt(index_path, format!("partition count {count}")));
        }

        let mut partitions = BTreeMap::new();
        for _ in 0..count {
            let partition = read_i32(&mut reader)?;
            let seg_count = read_i32(&mut reader)?;
            if !(0..=MAX_SEGMENTS).contains(&seg_count) {
                return Err(corrupt(index_path, format!("segment count {seg_count}")));
            }

            let mut segments = Vec::with_capacity(seg_count as usize);
            for _ in 0..seg_count {
                let offset = read_u64(&mut reader)?;
                let compressed = read_u64(&mut reader)?;
                let uncompressed = read_u64(&mut reader)?;
                match offset.checked_add(compressed) {
                    Some(end) if end <= data_len => {}
                    _ => {
                        return Err(corrupt(
                            index_path,
                            format!("segment [{offset}, +{compressed}) past end of data ({data_len})"),
                        ))
                    }
                }
                segments.push(Segment {
                    offset,
                    compressed,
                    uncompressed,
                });
            }

            if partitions
                .insert(partition, PartitionEntry { segments })
                .is_some()
            {
                return Err(corrupt(index_path, format!("duplicate partition {partition}")));
            }
        }

        Ok(Self {
            data_path: data_path.to_path_buf(),
            partitions,
        })
    }
}

/// `(data, index)` paths of a task's channel output.
pub fn channel_paths(data_dir: &Path, job_id: &JobId, task_id: &str) -> Result<(PathBuf, PathBuf)> {
    validate_task_id(task_id)?;
    let job_dir = data_dir.join(job_id.to_string());
    Ok((
        job_dir.join(format!("{task_id}.chan")),
        job_dir.join(format!("{task_id}.idx")),
    ))
}

/// Writes a task's channel output. Nothing is visible under the final names
/// until [`PartitionFileWriter::finish`] renames both files into place.
pub struct PartitionFileWriter {
    data: BufWriter<File>,
    offset: u64,
    partitions: BTreeMap<i32, PartitionEntry>,
    data_tmp: PathBuf,
    data_path: PathBuf,
    index_path: PathBuf,
}

impl PartitionFileWriter {
    pub fn create(data_dir: &Path, job_id: &JobId, task_id: &str) -> Result<Self> {
        let (data_path, index_path) = channel_paths(data_dir, job_id, task_id)?;
        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data_tmp = data_path.with_extension("chan.tmp");
        Ok(Self {
            data: BufWriter::new(File::create(&data_tmp)?),
            offset: 0,
            partitions: BTreeMap::new(),
            data_tmp,
            data_path,
            index_path,
        })
    }

    /// Appends one segment to `partition`. `uncompressed` is the size the
    /// bytes expand to; for uncompressed data it equals `bytes.len()`.
    pub fn write_segment(&mut self, partition: i32, bytes: &[u8], uncompressed: u64) -> Result<()> {
        if partition < 0 {
            return Err(Error::InvalidArgument(format!(
                "negative partition number {partition}"
            )));
        }
        self.data.write_all(bytes)?;
        self.partitions
            .entry(partition)
            .or_default()
            .segments
            .push(Segment {
                offset: self.offset,
                compressed: bytes.len() as u64,
                uncompressed,
            });
        self.offset += bytes.len() as u64;
        Ok(())
    }

    pub fn finish(mut self) -> Result<PartitionFileIndex> {
        self.data.flush()?;
        self.data.get_ref().sync_all()?;

        let index_tmp = self.index_path.with_extension("idx.tmp");
        {
            let mut w = BufWriter::new(File::create(&index_tmp)?);
            w.write_all(&(self.partitions.len() as i32).to_le_bytes())?;
            for (partition, entry) in &self.partitions {
                w.write_all(&partition.to_le_bytes())?;
                w.write_all(&(entry.segments.len() as i32).to_le_bytes())?;
                for seg in &entry.segments {
                    w.write_all(&seg.offset.to_le_bytes())?;
                    w.write_all(&seg.compressed.to_le_bytes())?;
                    w.write_all(&seg.uncompressed.to_le_bytes())?;
                }
            }
            w.flush()?;
        }

        // data first: a visible index always points at a complete data file
        fs::rename(&self.data_tmp, &self.data_path)?;
        fs::rename(&index_tmp, &self.index_path)?;

        Ok(PartitionFileIndex {
            data_path: self.data_path,
            partitions: self.partitions,
        })
    }
}

fn corrupt(path: &Path, detail: String) -> Error {
    Error::Protocol(format!("corrupt partition index {}: {detail}", path.display()))
}

fn read_i32(r: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn writer_produces_readable_index() {
        let dir = tempfile::tempdir().unwrap();
        let job = Uuid::new_v4();

        let mut w = PartitionFileWriter::create(dir.path(), &job, "s0-t0").unwrap();
        w.write_segment(1, &[1u8; 10], 10).unwrap();
        w.write_segment(0, &[2u8; 4], 9).unwrap();
        w.write_segment(1, &[3u8; 20], 20).unwrap();
        let written = w.finish().unwrap();

        let (data, index) = channel_paths(dir.path(), &job, "s0-t0").unwrap();
        assert_eq!(fs::metadata(&data).unwrap().len(), 34);
        let read = PartitionFileIndex::read_from(&index, &data).unwrap();

        let p1 = read.partition(1).unwrap();
        assert_eq!(p1, written.partition(1).unwrap());
        assert_eq!(
            p1.segments,
            vec![
                Segment { offset: 0, compressed: 10, uncompressed: 10 },
                Segment { offset: 14, compressed: 20, uncompressed: 20 },
            ]
        );
        assert_eq!(p1.compressed_size(), 30 + 2 * SEGMENT_HEADER_LEN);
        assert_eq!(p1.uncompressed_size(), 30);

        let p0 = read.partition(0).unwrap();
        assert_eq!(p0.uncompressed_size(), 9);

        assert!(read.partition(7).is_none());
        assert_eq!(
            read.response_len(&[1, 7]),
            PARTITION_HEADER_LEN + p1.compressed_size() + ABSENT_PARTITION_LEN
        );
    }

    #[test]
    fn index_pointing_past_data_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let job = Uuid::new_v4();
        let mut w = PartitionFileWriter::create(dir.path(), &job, "s0-t1").unwrap();
        w.write_segment(0, b"abcdef", 6).unwrap();
        w.finish().unwrap();

        let (data, index) = channel_paths(dir.path(), &job, "s0-t1").unwrap();
        fs::write(&data, b"abc").unwrap();
        assert!(matches!(
            PartitionFileIndex::read_from(&index, &data),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn channel_paths_reject_unsafe_task_ids() {
        let dir = tempfile::tempdir().unwrap();
        let job = Uuid::new_v4();
        assert!(channel_paths(dir.path(), &job, "../x").is_err());
        assert!(PartitionFileWriter::create(dir.path(), &job, "").is_err());
    }
}
