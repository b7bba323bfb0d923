//! Named buffer registry and fan-out routing
//!
//! The buffer manager owns every ring buffer in the pipeline by name and
//! routes producer writes to consumer callbacks. The name table lock is
//! never held across a callback invocation: routes fire after the write
//! completes, in registration order, with the written chunk copied out
//! first. A panicking callback is caught and logged; it never disturbs
//! the write path or the other consumers.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::ring::{BufferError, BufferStats, BufferStatus, RingBuffer};

/// How much health history `monitor_health` retains.
const HISTORY_WINDOW: Duration = Duration::from_secs(60);

/// Consumer callback attached to a named buffer.
pub type RouteCallback = Box<dyn Fn(&[f32]) + Send>;

/// Buffer manager errors
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("buffer already exists: {0}")]
    BufferExists(String),

    #[error("no such buffer: {0}")]
    NoSuchBuffer(String),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Overall health across every managed buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Aggregate statistics over all buffers
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub buffer_count: usize,
    pub buffers: HashMap<String, BufferStats>,
    pub total_overruns: u64,
    pub total_underruns: u64,
    pub mean_utilization: f64,
    pub health: ManagerHealth,
}

/// Timestamped aggregate snapshot kept by `monitor_health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub timestamp: SystemTime,
    #[serde(skip)]
    taken_at: Option<Instant>,
    pub stats: ManagerStats,
}

/// Registry of named ring buffers with write fan-out.
pub struct BufferManager {
    buffers: Mutex<HashMap<String, Arc<RingBuffer>>>,
    routes: Mutex<HashMap<String, Arc<Mutex<Vec<RouteCallback>>>>>,
    history: Mutex<VecDeque<HealthSnapshot>>,
}

impl BufferManager {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a named buffer. Fails if the name is taken.
    pub fn create_buffer(
        &self,
        name: &str,
        capacity: usize,
        sample_rate: u32,
    ) -> Result<Arc<RingBuffer>, ManagerError> {
        let mut buffers = self.buffers.lock();
        if buffers.contains_key(name) {
            return Err(ManagerError::BufferExists(name.to_string()));
        }
        let buffer = Arc::new(RingBuffer::new(capacity, sample_rate));
        buffers.insert(name.to_string(), Arc::clone(&buffer));
        log::debug!("created buffer '{}' ({} samples)", name, capacity);
        Ok(buffer)
    }

    pub fn get_buffer(&self, name: &str) -> Option<Arc<RingBuffer>> {
        self.buffers.lock().get(name).cloned()
    }

    /// Close and drop a named buffer along with its routes.
    pub fn remove_buffer(&self, name: &str) -> bool {
        let removed = self.buffers.lock().remove(name);
        self.routes.lock().remove(name);
        match removed {
            Some(buffer) => {
                buffer.close();
                true
            }
            None => false,
        }
    }

    pub fn buffer_names(&self) -> Vec<String> {
        self.buffers.lock().keys().cloned().collect()
    }

    /// Write to a named buffer, then fan the chunk out to every route.
    ///
    /// Routes see the samples only after the write succeeded, in
    /// registration order, from the writer's thread. The chunk handed to
    /// callbacks is a copy; `&[f32]` immutability guarantees one consumer
    /// cannot alter what another one sees.
    pub fn write(&self, name: &str, samples: &[f32]) -> Result<usize, ManagerError> {
        let buffer = self
            .get_buffer(name)
            .ok_or_else(|| ManagerError::NoSuchBuffer(name.to_string()))?;
        let written = buffer.write(samples)?;

        let routes = self.routes.lock().get(name).cloned();
        if let Some(routes) = routes {
            let chunk: Vec<f32> = samples.to_vec();
            let routes = routes.lock();
            for callback in routes.iter() {
                if catch_unwind(AssertUnwindSafe(|| callback(&chunk))).is_err() {
                    log::warn!("route callback for buffer '{}' panicked", name);
                }
            }
        }
        Ok(written)
    }

    /// Append a consumer callback to a named buffer's route list.
    pub fn route(&self, name: &str, callback: RouteCallback) {
        let mut routes = self.routes.lock();
        routes
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .lock()
            .push(callback);
    }

    /// Drop every route registered for a buffer.
    pub fn clear_routes(&self, name: &str) {
        if let Some(routes) = self.routes.lock().get(name) {
            routes.lock().clear();
        }
    }

    pub fn route_count(&self, name: &str) -> usize {
        self.routes
            .lock()
            .get(name)
            .map(|r| r.lock().len())
            .unwrap_or(0)
    }

    /// Aggregate statistics across every buffer.
    pub fn stats(&self) -> ManagerStats {
        let buffers = self.buffers.lock();
        let mut per_buffer = HashMap::with_capacity(buffers.len());
        let mut total_overruns = 0;
        let mut total_underruns = 0;
        let mut utilization_sum = 0.0;
        let mut unhealthy = 0usize;
        for (name, buffer) in buffers.iter() {
            let stats = buffer.stats();
            total_overruns += stats.overruns;
            total_underruns += stats.underruns;
            utilization_sum += stats.utilization;
            if stats.status != BufferStatus::Healthy {
                unhealthy += 1;
            }
            per_buffer.insert(name.clone(), stats);
        }
        let count = per_buffer.len();
        let health = if unhealthy == 0 {
            ManagerHealth::Healthy
        } else if unhealthy * 2 < count {
            ManagerHealth::Degraded
        } else {
            ManagerHealth::Unhealthy
        };
        ManagerStats {
            buffer_count: count,
            buffers: per_buffer,
            total_overruns,
            total_underruns,
            mean_utilization: if count == 0 {
                0.0
            } else {
                utilization_sum / count as f64
            },
            health,
        }
    }

    /// Take an aggregate snapshot and append it to the health history,
    /// pruning entries older than 60 seconds.
    pub fn monitor_health(&self) -> HealthSnapshot {
        let snapshot = HealthSnapshot {
            timestamp: SystemTime::now(),
            taken_at: Some(Instant::now()),
            stats: self.stats(),
        };
        let mut history = self.history.lock();
        let now = Instant::now();
        while let Some(front) = history.front() {
            let stale = front
                .taken_at
                .map(|at| now.duration_since(at) > HISTORY_WINDOW)
                .unwrap_or(true);
            if stale {
                history.pop_front();
            } else {
                break;
            }
        }
        history.push_back(snapshot.clone());
        snapshot
    }

    pub fn health_history(&self) -> Vec<HealthSnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    /// Producer-side handle bound to one named buffer.
    pub fn source(self: &Arc<Self>, name: &str) -> BufferedSource {
        BufferedSource {
            manager: Arc::clone(self),
            name: name.to_string(),
        }
    }

    /// Consumer-side handle bound to one named buffer.
    pub fn consumer(self: &Arc<Self>, name: &str) -> BufferedConsumer {
        BufferedConsumer {
            manager: Arc::clone(self),
            name: name.to_string(),
        }
    }

    /// Close every buffer and drop the registry.
    pub fn shutdown(&self) {
        let mut buffers = self.buffers.lock();
        for buffer in buffers.values() {
            buffer.close();
        }
        buffers.clear();
        self.routes.lock().clear();
    }
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Write-side convenience wrapper around a named buffer.
pub struct BufferedSource {
    manager: Arc<BufferManager>,
    name: String,
}

impl BufferedSource {
    pub fn write(&self, samples: &[f32]) -> Result<usize, ManagerError> {
        self.manager.write(&self.name, samples)
    }

    pub fn stats(&self) -> Option<BufferStats> {
        self.manager.get_buffer(&self.name).map(|b| b.stats())
    }

    pub fn healthy(&self) -> bool {
        self.stats()
            .map(|s| s.status == BufferStatus::Healthy)
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Some(buffer) = self.manager.get_buffer(&self.name) {
            buffer.clear();
        }
    }
}

/// Read-side convenience wrapper around a named buffer.
pub struct BufferedConsumer {
    manager: Arc<BufferManager>,
    name: String,
}

impl BufferedConsumer {
    pub fn read(&self, count: usize) -> Vec<f32> {
        self.manager
            .get_buffer(&self.name)
            .map(|b| b.read(count))
            .unwrap_or_default()
    }

    pub fn read_timeout(&self, count: usize, timeout: Duration) -> Vec<f32> {
        self.manager
            .get_buffer(&self.name)
            .map(|b| b.read_timeout(count, timeout))
            .unwrap_or_default()
    }

    pub fn peek(&self, count: usize) -> Vec<f32> {
        self.manager
            .get_buffer(&self.name)
            .map(|b| b.peek(count))
            .unwrap_or_default()
    }

    pub fn route_to(&self, callback: RouteCallback) {
        self.manager.route(&self.name, callback);
    }

    pub fn stats(&self) -> Option<BufferStats> {
        self.manager.get_buffer(&self.name).map(|b| b.stats())
    }

    pub fn healthy(&self) -> bool {
        self.stats()
            .map(|s| s.status == BufferStatus::Healthy)
            .unwrap_or(false)
    }

    /// Samples currently available to read.
    pub fn data_available(&self) -> usize {
        self.manager
            .get_buffer(&self.name)
            .map(|b| b.len())
            .unwrap_or(0)
    }
}
