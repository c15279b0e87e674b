//! Shuffle wire protocol: one request and one streamed response per TCP
//! connection. All integers little-endian; strings are an `i32` byte length
//! followed by UTF-8.
//!
//! Request:
//!
//! ```text
//! [16 bytes job uuid]
//! [i32 P] P x [i32 partition]
//! [i32 T] T x [string task_id]
//! ```
//!
//! Response, per task in request order:
//!
//! ```text
//! [i64 total bytes of the partition blocks below]
//! per partition in request order:
//!   absent:  [i64 0]
//!   present: [i64 compressed][i64 uncompressed][i32 segments]
//!            per segment: [i64 compressed][i64 uncompressed][bytes]
//! ```
//!
//! A `-1` where a task's total is expected means the server failed.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::job::JobId;
use crate::partition::{ABSENT_PARTITION_LEN, PARTITION_HEADER_LEN, SEGMENT_HEADER_LEN};
use crate::task::{validate_task_id, TaskId};

pub const FAILURE_SENTINEL: i64 = -1;
pub const ABSENT_PARTITION: i64 = 0;

const MAX_LIST_LEN: i32 = 1 << 16;
const MAX_STRING_LEN: i32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleRequest {
    pub job_id: JobId,
    pub partitions: Vec<i32>,
    pub task_ids: Vec<TaskId>,
}

impl ShuffleRequest {
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let mut id = [0u8; 16];
        r.read_exact(&mut id).await?;
        let job_id = Uuid::from_bytes(id);

        let p = read_len(r, "partition").await?;
        let mut partitions = Vec::with_capacity(p);
        for _ in 0..p {
            partitions.push(r.read_i32_le().await?);
        }

        let t = read_len(r, "task").await?;
        let mut task_ids = Vec::with_capacity(t);
        for _ in 0..t {
            let task_id = read_string(r).await?;
            validate_task_id(&task_id).map_err(|e| Error::Protocol(e.to_string()))?;
            task_ids.push(task_id);
        }

        Ok(Self {
            job_id,
            partitions,
            task_ids,
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        w.write_all(self.job_id.as_bytes()).await?;
        w.write_i32_le(self.partitions.len() as i32).await?;
        for p in &self.partitions {
            w.write_i32_le(*p).await?;
        }
        w.write_i32_le(self.task_ids.len() as i32).await?;
        for t in &self.task_ids {
            write_string(w, t).await?;
        }
        Ok(())
    }
}

pub async fn write_string<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> Result<()> {
    if s.len() > MAX_STRING_LEN as usize {
        return Err(Error::InvalidArgument(format!(
            "string of {} bytes exceeds {MAX_STRING_LEN}",
            s.len()
        )));
    }
    w.write_i32_le(s.len() as i32).await?;
    w.write_all(s.as_bytes()).await?;
    Ok(())
}

pub async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let len = r.read_i32_le().await?;
    if !(0..=MAX_STRING_LEN).contains(&len) {
        return Err(Error::Protocol(format!("string length {len}")));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| Error::Protocol(format!("string is not utf-8: {e}")))
}

async fn read_len<R: AsyncRead + Unpin>(r: &mut R, what: &str) -> Result<usize> {
    let n = r.read_i32_le().await?;
    if !(0..=MAX_LIST_LEN).contains(&n) {
        return Err(Error::Protocol(format!("{what} count {n}")));
    }
    Ok(n as usize)
}

/* --------- Decoded response --------- */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSegment {
    pub compressed: u64,
    pub uncompressed: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPartition {
    pub partition: i32,
    /// `None` when the producing task wrote nothing for this partition.
    pub segments: Option<Vec<FetchedSegment>>,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedTask {
    pub task_id: TaskId,
    pub total_bytes: u64,
    pub partitions: Vec<FetchedPartition>,
}

/// Reads one task block of a response, checking the announced sizes.
pub async fn read_task_response<R: AsyncRead + Unpin>(
    r: &mut R,
    task_id: &str,
    partitions: &[i32],
) -> Result<FetchedTask> {
    let total = r.read_i64_le().await?;
    if total == FAILURE_SENTINEL {
        return Err(Error::RemoteFailure);
    }
    if total < 0 {
        return Err(Error::Protocol(format!("negative task size {total}")));
    }

    let mut consumed = 0u64;
    let mut out = Vec::with_capacity(partitions.len());
    for &partition in partitions {
        let compressed = r.read_i64_le().await?;
        if compressed == ABSENT_PARTITION {
            consumed += ABSENT_PARTITION_LEN;
            out.push(FetchedPartition {
                partition,
                segments: None,
                compressed_size: 0,
                uncompressed_size: 0,
            });
            continue;
        }
        if compressed < 0 {
            return Err(Error::Protocol(format!(
                "negative partition size {compressed}"
            )));
        }
        if consumed.saturating_add(PARTITION_HEADER_LEN + compressed as u64) > total as u64 {
            return Err(Error::Protocol(format!(
                "partition {partition} of {compressed} bytes overruns task size {total}"
            )));
        }
        let uncompressed = r.read_i64_le().await?;
        let seg_count = r.read_i32_le().await?;
        if !(0..=MAX_LIST_LEN).contains(&seg_count) {
            return Err(Error::Protocol(format!("segment count {seg_count}")));
        }

        let mut segments = Vec::with_capacity(seg_count as usize);
        let mut seg_total = 0u64;
        for _ in 0..seg_count {
            let c = r.read_i64_le().await?;
            let u = r.read_i64_le().await?;
            if c < 0 || u < 0 {
                return Err(Error::Protocol(format!("negative segment size ({c}, {u})")));
            }
            // bounded by the announced partition size before allocating
            if (seg_total + SEGMENT_HEADER_LEN).saturating_add(c as u64) > compressed as u64 {
                return Err(Error::Protocol(format!(
                    "segment of {c} bytes overruns partition {partition} ({compressed} bytes)"
                )));
            }
            let mut data = vec![0u8; c as usize];
            r.read_exact(&mut data).await?;
            seg_total += SEGMENT_HEADER_LEN + c as u64;
            segments.push(FetchedSegment {
                compressed: c as u64,
                uncompressed: u as u64,
                data,
            });
        }
        if seg_total != compressed as u64 {
            return Err(Error::Protocol(format!(
                "partition {partition} announced {compressed} bytes but carried {seg_total}"
            )));
        }

        consumed += PARTITION_HEADER_LEN + seg_total;
        out.push(FetchedPartition {
            partition,
            segments: Some(segments),
            compressed_size: compressed as u64,
            uncompressed_size: uncompressed as u64,
        });
    }

    if consumed != total as u64 {
        return Err(Error::Protocol(format!(
            "task {task_id} announced {total} bytes but carried {consumed}"
        )));
    }

    Ok(FetchedTask {
        task_id: task_id.to_string(),
        total_bytes: total as u64,
        partitions: out,
    })
}

/// Pulls partitions from one task server's shuffle port.
pub struct ShuffleClient {
    addr: String,
}

impl ShuffleClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub async fn fetch(&self, request: &ShuffleRequest) -> Result<Vec<FetchedTask>> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (read_half, write_half) = stream.into_split();

        let mut writer = BufWriter::new(write_half);
        request.write_to(&mut writer).await?;
        writer.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut tasks = Vec::with_capacity(request.task_ids.len());
        for task_id in &request.task_ids {
            let task = read_task_response(&mut reader, task_id, &request.partitions).await?;
            debug!(
                "fetched {} bytes for task {} of job {} from {}",
                task.total_bytes, task_id, request.job_id, self.addr
            );
            tasks.push(task);
        }
        Ok(tasks)
    }
}
