// worker/src/index_cache.rs
//
// Parsed partition indexes keyed by index file path. Hits never block;
// a miss loads the file once no matter how many connections ask for it.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::partition::PartitionFileIndex;
use common::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::debug;

type Slot = Arc<OnceCell<Arc<PartitionFileIndex>>>;

pub struct PartitionFileIndexCache {
    max_size: usize,
    entries: DashMap<PathBuf, Slot>,
    /// Loaded keys in insertion order; the front is evicted first.
    order: Mutex<VecDeque<PathBuf>>,
}

impl PartitionFileIndexCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.order.lock().len()
    }

    pub fn contains(&self, index_path: &Path) -> bool {
        self.entries
            .get(index_path)
            .map_or(false, |slot| slot.initialized())
    }

    pub async fn get(&self, index_path: &Path, data_path: &Path) -> Result<Arc<PartitionFileIndex>> {
        let cached = self.entries.get(index_path).map(|slot| slot.value().clone());
        let slot = match cached {
            Some(slot) => {
                if let Some(index) = slot.get() {
                    return Ok(index.clone());
                }
                slot
            }
            None => self
                .entries
                .entry(index_path.to_path_buf())
                .or_default()
                .value()
                .clone(),
        };

        let mut loaded_here = false;
        let loaded = slot
            .get_or_try_init(|| {
                loaded_here = true;
                load(index_path.to_path_buf(), data_path.to_path_buf())
            })
            .await;

        match loaded {
            Ok(index) => {
                let index = index.clone();
                if loaded_here {
                    self.record(index_path);
                }
                Ok(index)
            }
            Err(e) => {
                // failed loads are retried by the next caller
                self.entries
                    .remove_if(index_path, |_, current| Arc::ptr_eq(current, &slot));
                Err(e)
            }
        }
    }

    fn record(&self, index_path: &Path) {
        let mut order = self.order.lock();
        order.push_back(index_path.to_path_buf());
        while order.len() > self.max_size {
            if let Some(evicted) = order.pop_front() {
                self.entries.remove(&evicted);
                debug!("evicted partition index {}", evicted.display());
            }
        }
    }
}

async fn load(index_path: PathBuf, data_path: PathBuf) -> Result<Arc<PartitionFileIndex>> {
    debug!("loading partition index {}", index_path.display());
    tokio::task::spawn_blocking(move || PartitionFileIndex::read_from(&index_path, &data_path))
        .await
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?
        .map(Arc::new)
}
