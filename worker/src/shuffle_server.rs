// worker/src/shuffle_server.rs
//
// Serves finished channel output to downstream tasks. One request and one
// streamed response per connection; see `common::shuffle` for the layout.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use common::partition::{channel_paths, PartitionFileIndex};
use common::shuffle::{ShuffleRequest, ABSENT_PARTITION, FAILURE_SENTINEL};
use common::{Error, Result};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::index_cache::PartitionFileIndexCache;

pub struct ShuffleServer {
    data_dir: PathBuf,
    cache: Arc<PartitionFileIndexCache>,
    connections: Arc<Semaphore>,
}

impl ShuffleServer {
    pub fn new(data_dir: PathBuf, cache: Arc<PartitionFileIndexCache>, max_connections: usize) -> Self {
        Self {
            data_dir,
            cache,
            connections: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }

    /// Accepts connections until `shutdown` fires. A connection only gets
    /// accepted once a permit is free.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("shuffle server listening on {}", listener.local_addr()?);
        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.connections.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("shuffle accept failed: {}", e);
                        continue;
                    }
                },
            };

            let server = self.clone();
            tokio::spawn(async move {
                debug!("shuffle connection from {}", peer);
                server.handle_connection(stream).await;
                drop(permit);
            });
        }
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        let request = match ShuffleRequest::read_from(&mut reader).await {
            Ok(r) => r,
            Err(e) => {
                warn!("bad shuffle request: {}", e);
                send_failure(&mut writer).await;
                return;
            }
        };

        for task_id in &request.task_ids {
            if let Err(e) = self.send_task(&mut writer, &request, task_id).await {
                warn!(
                    "failed serving task {} of job {}: {}",
                    task_id, request.job_id, e
                );
                send_failure(&mut writer).await;
                return;
            }
        }
        if let Err(e) = writer.flush().await {
            debug!("shuffle client went away: {}", e);
        }
    }

    async fn send_task<W: AsyncWrite + Unpin>(
        &self,
        w: &mut W,
        request: &ShuffleRequest,
        task_id: &str,
    ) -> Result<()> {
        let (data_path, index_path) = channel_paths(&self.data_dir, &request.job_id, task_id)?;
        let index = self.cache.get(&index_path, &data_path).await?;
        let mut data = File::open(index.data_path()).await?;

        w.write_i64_le(index.response_len(&request.partitions) as i64).await?;

        for &partition in &request.partitions {
            let Some(entry) = index.partition(partition) else {
                w.write_i64_le(ABSENT_PARTITION).await?;
                continue;
            };
            w.write_i64_le(entry.compressed_size() as i64).await?;
            w.write_i64_le(entry.uncompressed_size() as i64).await?;
            w.write_i32_le(entry.segments.len() as i32).await?;

            for seg in &entry.segments {
                w.write_i64_le(seg.compressed as i64).await?;
                w.write_i64_le(seg.uncompressed as i64).await?;
                copy_segment(&mut data, w, &index, seg.offset, seg.compressed).await?;
            }
        }
        debug!(
            "served {} partitions of task {} for job {}",
            request.partitions.len(),
            task_id,
            request.job_id
        );
        Ok(())
    }
}

async fn copy_segment<W: AsyncWrite + Unpin>(
    file: &mut File,
    w: &mut W,
    index: &PartitionFileIndex,
    offset: u64,
    len: u64,
) -> Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    let copied = tokio::io::copy(&mut (&mut *file).take(len), w).await?;
    if copied != len {
        return Err(Error::Protocol(format!(
            "{} ended {} bytes into a {}-byte segment",
            index.data_path().display(),
            copied,
            len
        )));
    }
    Ok(())
}

// The connection is closed right after; a second error changes nothing.
async fn send_failure<W: AsyncWrite + Unpin>(w: &mut W) {
    let _ = w.write_i64_le(FAILURE_SENTINEL).await;
    let _ = w.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::partition::{PartitionFileWriter, SEGMENT_HEADER_LEN};
    use common::shuffle::{ShuffleClient, ShuffleRequest};
    use uuid::Uuid;

    async fn start(dir: &std::path::Path) -> (String, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = Arc::new(ShuffleServer::new(
            dir.to_path_buf(),
            Arc::new(PartitionFileIndexCache::new(8)),
            4,
        ));
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(listener, shutdown.clone()));
        (addr, shutdown)
    }

    #[tokio::test]
    async fn serves_segments_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        let job = Uuid::new_v4();
        let mut w = PartitionFileWriter::create(dir.path(), &job, "s0-t0").unwrap();
        w.write_segment(2, &[1u8; 10], 10).unwrap();
        w.write_segment(5, &[9u8; 3], 3).unwrap();
        w.write_segment(2, &[2u8; 20], 20).unwrap();
        w.finish().unwrap();

        let (addr, shutdown) = start(dir.path()).await;
        let fetched = ShuffleClient::new(addr)
            .fetch(&ShuffleRequest {
                job_id: job,
                partitions: vec![2, 4],
                task_ids: vec!["s0-t0".to_string()],
            })
            .await
            .unwrap();

        assert_eq!(fetched.len(), 1);
        let p2 = &fetched[0].partitions[0];
        assert_eq!(p2.compressed_size, 2 * SEGMENT_HEADER_LEN + 30);
        assert_eq!(p2.uncompressed_size, 30);
        let segs = p2.segments.as_ref().unwrap();
        assert_eq!(
            segs.iter().map(|s| (s.compressed, s.uncompressed)).collect::<Vec<_>>(),
            vec![(10, 10), (20, 20)]
        );
        assert_eq!(segs[0].data, vec![1u8; 10]);
        assert_eq!(segs[1].data, vec![2u8; 20]);

        // partition 4 was never written
        assert!(fetched[0].partitions[1].segments.is_none());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn several_tasks_in_one_request() {
        let dir = tempfile::tempdir().unwrap();
        let job = Uuid::new_v4();
        for (task, byte) in [("s0-t0", 1u8), ("s0-t1", 2u8)] {
            let mut w = PartitionFileWriter::create(dir.path(), &job, task).unwrap();
            w.write_segment(0, &[byte; 5], 5).unwrap();
            w.finish().unwrap();
        }

        let (addr, shutdown) = start(dir.path()).await;
        let fetched = ShuffleClient::new(addr)
            .fetch(&ShuffleRequest {
                job_id: job,
                partitions: vec![0],
                task_ids: vec!["s0-t1".to_string(), "s0-t0".to_string()],
            })
            .await
            .unwrap();

        assert_eq!(fetched[0].task_id, "s0-t1");
        assert_eq!(fetched[0].partitions[0].segments.as_ref().unwrap()[0].data, vec![2u8; 5]);
        assert_eq!(fetched[1].partitions[0].segments.as_ref().unwrap()[0].data, vec![1u8; 5]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn missing_output_sends_failure_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, shutdown) = start(dir.path()).await;

        let err = ShuffleClient::new(addr)
            .fetch(&ShuffleRequest {
                job_id: Uuid::new_v4(),
                partitions: vec![0],
                task_ids: vec!["s0-t9".to_string()],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteFailure));
        shutdown.cancel();
    }
}
