// master/src/registry.rs
//
// Globally visible worker records. Heartbeat handlers update them with
// atomics and never take the scheduler lock.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{WorkerId, WorkerMetrics, WorkerRegisterRequest};
use dashmap::DashMap;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub host: String,
    pub rack: String,
    pub shuffle_addr: String,
    pub capacity: u32,
    /// Registration order, used as the final tie-break when ranking workers.
    pub seq: u64,

    last_contact_ms: AtomicI64,
    reported_running: AtomicU32,
    dead: AtomicBool,
}

impl WorkerInfo {
    pub fn new(id: WorkerId, seq: u64, req: WorkerRegisterRequest, now_ms: i64) -> Self {
        Self {
            id,
            host: req.hostname,
            rack: req.rack,
            shuffle_addr: req.shuffle_addr,
            capacity: req.max_concurrency,
            seq,
            last_contact_ms: AtomicI64::new(now_ms),
            reported_running: AtomicU32::new(0),
            dead: AtomicBool::new(false),
        }
    }

    pub fn touch(&self, now_ms: i64, running: u32) {
        self.last_contact_ms.fetch_max(now_ms, Ordering::Release);
        self.reported_running.store(running, Ordering::Relaxed);
    }

    pub fn last_contact_ms(&self) -> i64 {
        self.last_contact_ms.load(Ordering::Acquire)
    }

    pub fn reported_running(&self) -> u32 {
        self.reported_running.load(Ordering::Relaxed)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Returns `true` only for the call that flipped the flag.
    pub fn mark_dead(&self) -> bool {
        !self.dead.swap(true, Ordering::AcqRel)
    }

    pub fn is_active(&self, now_ms: i64, timeout: Duration) -> bool {
        !self.is_dead() && now_ms - self.last_contact_ms() <= timeout.as_millis() as i64
    }

    pub fn metrics(&self, now_ms: i64) -> WorkerMetrics {
        WorkerMetrics {
            worker_id: self.id.clone(),
            hostname: self.host.clone(),
            rack: self.rack.clone(),
            shuffle_addr: self.shuffle_addr.clone(),
            dead: self.is_dead(),
            max_concurrency: self.capacity,
            last_heartbeat_secs_ago: ((now_ms - self.last_contact_ms()).max(0) / 1000) as u64,
            reported_running: self.reported_running(),
        }
    }
}

pub struct WorkerRegistry {
    workers: DashMap<WorkerId, Arc<WorkerInfo>>,
    next_seq: AtomicU64,
    heartbeat_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            workers: DashMap::new(),
            next_seq: AtomicU64::new(0),
            heartbeat_timeout,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub fn register(&self, req: WorkerRegisterRequest) -> Arc<WorkerInfo> {
        let id = uuid::Uuid::new_v4().to_string();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(WorkerInfo::new(id.clone(), seq, req, now_ms()));
        self.workers.insert(id, info.clone());
        info
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkerInfo>> {
        self.workers.get(id).map(|w| w.value().clone())
    }

    /// `false` for unknown or dead workers; those must register again.
    pub fn heartbeat(&self, id: &str, running: u32) -> bool {
        match self.workers.get(id) {
            Some(w) if !w.is_dead() => {
                w.touch(now_ms(), running);
                true
            }
            _ => false,
        }
    }

    /// All workers in registration order.
    pub fn snapshot(&self) -> Vec<Arc<WorkerInfo>> {
        let mut all: Vec<_> = self.workers.iter().map(|w| w.value().clone()).collect();
        all.sort_by_key(|w| w.seq);
        all
    }

    pub fn active_workers(&self) -> Vec<Arc<WorkerInfo>> {
        let now = now_ms();
        self.snapshot()
            .into_iter()
            .filter(|w| w.is_active(now, self.heartbeat_timeout))
            .collect()
    }

    /// Rack of the first live worker on `host`, if any.
    pub fn rack_of_host(&self, host: &str) -> Option<String> {
        self.workers
            .iter()
            .filter(|w| !w.is_dead() && w.host == host)
            .min_by_key(|w| w.seq)
            .map(|w| w.rack.clone())
    }

    pub fn distinct_racks(workers: &[Arc<WorkerInfo>]) -> usize {
        workers.iter().map(|w| w.rack.as_str()).collect::<HashSet<_>>().len()
    }
}
