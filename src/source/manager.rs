//! Source registry and switch-over
//!
//! Owns the `main_audio` buffer and decides which producer feeds it.
//! Switches are serialized: a switch in progress makes a concurrent call
//! fail instead of interleaving two handoffs. The old source is stopped
//! and unwired before the new one is wired, so no stale callback can
//! write into the cleared buffer.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::file::FilePlayer;
use super::system::{SystemCapture, SystemCaptureOptions};
use super::{AudioCallback, AudioFormat, AudioSource, SourceError, SourceState, SourceStatus};
use crate::manager::BufferManager;
use crate::ring::{size_for_latency, BufferStats, BufferStatus};

/// Name of the buffer every producer feeds.
pub const MAIN_BUFFER: &str = "main_audio";

/// Default main buffer depth.
pub const DEFAULT_LATENCY_MS: u64 = 50;

/// Bounded switch history length.
const HISTORY_LIMIT: usize = 100;

/// Fade ramps run in this many equal gain steps.
const FADE_STEPS: u32 = 16;

/// Registered source kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    System,
    File,
}

/// Options accepted by the source factory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceOptions {
    /// File to play (required for [`SourceType::File`])
    pub file_path: Option<PathBuf>,

    /// Capture device name override
    pub device: Option<String>,

    /// Per-source format override
    pub format: Option<AudioFormat>,
}

/// One completed or rejected switch
#[derive(Debug, Clone, Serialize)]
pub struct SwitchRecord {
    pub from: Option<String>,
    pub to: String,
    pub timestamp: SystemTime,
    pub success: bool,
    pub error: Option<String>,
}

/// Manager-level lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Stopped,
    Running,
    Paused,
    Switching,
}

/// Manager statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SourceManagerStats {
    pub uptime_seconds: f64,
    pub state: ManagerState,
    pub current_source: Option<String>,
    pub source_count: usize,
    pub switch_count: u64,
    pub main_buffer: Option<BufferStats>,
}

struct SourceEntry {
    kind: SourceType,
    source: Arc<Mutex<Box<dyn AudioSource>>>,
    options: SourceOptions,
    #[allow(dead_code)]
    created_at: SystemTime,
    switch_count: u64,
}

/// Gain applied on the way into the main buffer; ramped during fades.
struct FadeGain {
    bits: AtomicU32,
}

impl FadeGain {
    fn new() -> Self {
        Self {
            bits: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    fn set(&self, gain: f32) {
        self.bits.store(gain.to_bits(), Ordering::Relaxed);
    }
}

/// Registry of audio sources feeding the main buffer.
pub struct SourceManager {
    buffers: Arc<BufferManager>,
    format: AudioFormat,
    sources: Mutex<HashMap<String, SourceEntry>>,
    current: Mutex<Option<String>>,
    run_state: Mutex<ManagerState>,
    switching: AtomicBool,
    fade: Arc<FadeGain>,
    history: Mutex<VecDeque<SwitchRecord>>,
    switch_count: AtomicU64,
    started_at: Instant,
}

impl SourceManager {
    /// Create a manager owning a fresh `main_audio` buffer sized for the
    /// target latency (50 ms by default).
    pub fn new(
        buffers: Arc<BufferManager>,
        format: AudioFormat,
        latency_ms: Option<u64>,
    ) -> Result<Self, SourceError> {
        let latency = latency_ms.unwrap_or(DEFAULT_LATENCY_MS);
        let capacity = size_for_latency(latency, format.sample_rate, format.channels);
        buffers
            .create_buffer(MAIN_BUFFER, capacity, format.sample_rate)
            .map_err(|e| SourceError::SourceFailed(format!("main buffer: {}", e)))?;
        Ok(Self {
            buffers,
            format,
            sources: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            run_state: Mutex::new(ManagerState::Stopped),
            switching: AtomicBool::new(false),
            fade: Arc::new(FadeGain::new()),
            history: Mutex::new(VecDeque::new()),
            switch_count: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Construct and register a source. The id must be unused.
    pub fn create_source(
        &self,
        id: &str,
        kind: SourceType,
        options: SourceOptions,
    ) -> Result<String, SourceError> {
        let format = options.format.unwrap_or(self.format);
        let source: Box<dyn AudioSource> = match kind {
            SourceType::System => Box::new(SystemCapture::new(
                format,
                SystemCaptureOptions {
                    device: options.device.clone(),
                },
            )?),
            SourceType::File => {
                let path = options.file_path.clone().ok_or_else(|| {
                    SourceError::InvalidArgument("file source requires file_path".to_string())
                })?;
                Box::new(FilePlayer::new(path, format)?)
            }
        };
        self.add_source(id, kind, source, options)
    }

    /// Register an already-constructed source under an unused id.
    pub fn add_source(
        &self,
        id: &str,
        kind: SourceType,
        source: Box<dyn AudioSource>,
        options: SourceOptions,
    ) -> Result<String, SourceError> {
        let mut sources = self.sources.lock();
        if sources.contains_key(id) {
            return Err(SourceError::InvalidArgument(format!(
                "source id already registered: {}",
                id
            )));
        }
        sources.insert(
            id.to_string(),
            SourceEntry {
                kind,
                source: Arc::new(Mutex::new(source)),
                options,
                created_at: SystemTime::now(),
                switch_count: 0,
            },
        );
        log::info!("registered {:?} source '{}'", kind, id);
        Ok(id.to_string())
    }

    /// Unregister a source. Refused while it is the current source.
    pub fn remove_source(&self, id: &str) -> bool {
        if self.current.lock().as_deref() == Some(id) {
            log::warn!("refusing to remove current source '{}'", id);
            return false;
        }
        match self.sources.lock().remove(id) {
            Some(entry) => {
                entry.source.lock().stop();
                true
            }
            None => false,
        }
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources.lock().keys().cloned().collect()
    }

    pub fn current_source(&self) -> Option<String> {
        self.current.lock().clone()
    }

    pub fn current_status(&self) -> Option<SourceStatus> {
        let id = self.current.lock().clone()?;
        let entry = self.entry(&id)?;
        let status = entry.lock().status();
        Some(status)
    }

    fn entry(&self, id: &str) -> Option<Arc<Mutex<Box<dyn AudioSource>>>> {
        self.sources.lock().get(id).map(|e| Arc::clone(&e.source))
    }

    /// Atomically hand the main buffer over to another registered source.
    ///
    /// Serialized: returns `false` while another switch is in progress.
    /// With `fade_ms` the old source is faded out and the new one faded
    /// in by ramping the gain applied on the main buffer wiring.
    pub fn switch_to_source(&self, id: &str, fade_ms: Option<u64>) -> bool {
        if self.switching.swap(true, Ordering::SeqCst) {
            log::warn!("switch to '{}' rejected: switch already in progress", id);
            self.record_switch(self.current.lock().clone(), id, false, Some("switch already in progress"));
            return false;
        }
        let result = self.perform_switch(id, fade_ms);
        self.switching.store(false, Ordering::SeqCst);
        result
    }

    fn perform_switch(&self, id: &str, fade_ms: Option<u64>) -> bool {
        let from = self.current.lock().clone();
        let target = match self.entry(id) {
            Some(target) => target,
            None => {
                self.record_switch(from, id, false, Some("unknown source id"));
                return false;
            }
        };

        let running = *self.run_state.lock() == ManagerState::Running;

        if let Some(old_id) = &from {
            if let Some(old) = self.entry(old_id) {
                let was_active = matches!(
                    old.lock().status().state,
                    SourceState::Running | SourceState::Paused
                );
                if was_active {
                    if let Some(ms) = fade_ms {
                        self.ramp_fade(ms, true);
                    }
                    if !old.lock().stop() {
                        // Old producer would keep feeding the buffer; abort
                        self.fade.set(1.0);
                        self.record_switch(
                            from.clone(),
                            id,
                            false,
                            Some("failed to stop previous source"),
                        );
                        return false;
                    }
                }
                old.lock().clear_callbacks();
            }
        }

        // Old stream is gone; drop its tail so the two never mix
        if let Some(buffer) = self.buffers.get_buffer(MAIN_BUFFER) {
            buffer.clear();
        }

        self.wire_to_main(&target);

        let mut success = true;
        let mut error = None;
        if running {
            if fade_ms.is_some() {
                self.fade.set(0.0);
            }
            if !target.lock().start() {
                success = false;
                error = Some("failed to start new source".to_string());
            } else if let Some(ms) = fade_ms {
                self.ramp_fade(ms, false);
            }
        }
        self.fade.set(1.0);

        *self.current.lock() = Some(id.to_string());
        self.switch_count.fetch_add(1, Ordering::SeqCst);
        if let Some(entry) = self.sources.lock().get_mut(id) {
            entry.switch_count += 1;
        }
        self.record_switch(from, id, success, error.as_deref());
        if success {
            log::info!("switched to source '{}'", id);
        }
        success
    }

    fn record_switch(&self, from: Option<String>, to: &str, success: bool, error: Option<&str>) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(SwitchRecord {
            from,
            to: to.to_string(),
            timestamp: SystemTime::now(),
            success,
            error: error.map(str::to_string),
        });
    }

    /// Subscribe the current source's audio stream to the main buffer.
    fn wire_to_main(&self, source: &Arc<Mutex<Box<dyn AudioSource>>>) {
        let sink = self.buffers.source(MAIN_BUFFER);
        let fade = Arc::clone(&self.fade);
        let guard = source.lock();
        guard.clear_callbacks();
        guard.on_audio_data(Arc::new(move |samples: &[f32]| {
            let gain = fade.get();
            let result = if (gain - 1.0).abs() < f32::EPSILON {
                sink.write(samples)
            } else {
                let scaled: Vec<f32> = samples.iter().map(|s| s * gain).collect();
                sink.write(&scaled)
            };
            if let Err(e) = result {
                log::warn!("main buffer write failed: {}", e);
            }
        }));
    }

    fn ramp_fade(&self, fade_ms: u64, out: bool) {
        let step_sleep = Duration::from_millis(fade_ms.max(1) / FADE_STEPS as u64);
        for step in 1..=FADE_STEPS {
            let progress = step as f32 / FADE_STEPS as f32;
            self.fade.set(if out { 1.0 - progress } else { progress });
            thread::sleep(step_sleep);
        }
    }

    /// Install the downstream sink, fed once per chunk after the main
    /// buffer routing stage.
    pub fn on_audio_data(&self, callback: AudioCallback) {
        self.buffers
            .route(MAIN_BUFFER, Box::new(move |samples: &[f32]| callback(samples)));
    }

    /// Switch to a system capture source, reusing a registered one.
    pub fn switch_to_system_audio(&self, options: SourceOptions) -> Result<bool, SourceError> {
        let existing = self
            .sources
            .lock()
            .iter()
            .find(|(_, e)| e.kind == SourceType::System)
            .map(|(id, _)| id.clone());
        let id = match existing {
            Some(id) => id,
            None => self.create_source("system_audio", SourceType::System, options)?,
        };
        Ok(self.switch_to_source(&id, None))
    }

    /// Switch to a file source, reusing one registered for the same path.
    pub fn switch_to_file(&self, path: &Path, mut options: SourceOptions) -> Result<bool, SourceError> {
        let existing = self
            .sources
            .lock()
            .iter()
            .find(|(_, e)| {
                e.kind == SourceType::File && e.options.file_path.as_deref() == Some(path)
            })
            .map(|(id, _)| id.clone());
        let id = match existing {
            Some(id) => id,
            None => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "file".to_string());
                let id = format!("file:{}", stem);
                options.file_path = Some(path.to_path_buf());
                self.create_source(&id, SourceType::File, options)?
            }
        };
        Ok(self.switch_to_source(&id, None))
    }

    fn delegate<F>(&self, op: F, next: ManagerState) -> bool
    where
        F: FnOnce(&mut Box<dyn AudioSource>) -> bool,
    {
        if self.switching.load(Ordering::SeqCst) {
            return false;
        }
        let Some(id) = self.current.lock().clone() else {
            return false;
        };
        let Some(source) = self.entry(&id) else {
            return false;
        };
        let ok = op(&mut source.lock());
        if ok {
            *self.run_state.lock() = next;
        }
        ok
    }

    pub fn start(&self) -> bool {
        self.delegate(|s| s.start(), ManagerState::Running)
    }

    pub fn stop(&self) -> bool {
        self.delegate(|s| s.stop(), ManagerState::Stopped)
    }

    pub fn pause(&self) -> bool {
        self.delegate(|s| s.pause(), ManagerState::Paused)
    }

    pub fn resume(&self) -> bool {
        self.delegate(|s| s.resume(), ManagerState::Running)
    }

    pub fn state(&self) -> ManagerState {
        if self.switching.load(Ordering::SeqCst) {
            ManagerState::Switching
        } else {
            *self.run_state.lock()
        }
    }

    /// Healthy iff the current source (when present) is running and the
    /// main buffer reports healthy.
    pub fn healthy(&self) -> bool {
        let source_ok = match self.current_status() {
            Some(status) => status.state == SourceState::Running,
            None => true,
        };
        let buffer_ok = self
            .buffers
            .get_buffer(MAIN_BUFFER)
            .map(|b| b.stats().status == BufferStatus::Healthy)
            .unwrap_or(false);
        source_ok && buffer_ok
    }

    pub fn switch_history(&self) -> Vec<SwitchRecord> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn switch_count(&self) -> u64 {
        self.switch_count.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SourceManagerStats {
        SourceManagerStats {
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            state: self.state(),
            current_source: self.current.lock().clone(),
            source_count: self.sources.lock().len(),
            switch_count: self.switch_count(),
            main_buffer: self.buffers.get_buffer(MAIN_BUFFER).map(|b| b.stats()),
        }
    }

    /// Stop everything and drop the registry.
    pub fn shutdown(&self) {
        self.stop();
        let mut sources = self.sources.lock();
        for entry in sources.values() {
            entry.source.lock().stop();
        }
        sources.clear();
        *self.current.lock() = None;
    }
}

impl Drop for SourceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceCore;
    use std::collections::HashMap as StdHashMap;

    /// In-memory source: lifecycle plus a shared core for pushing samples.
    struct MockSource {
        core: Arc<SourceCore>,
    }

    impl MockSource {
        fn new() -> (Self, Arc<SourceCore>) {
            let core = Arc::new(SourceCore::new(AudioFormat::default()));
            (
                Self {
                    core: Arc::clone(&core),
                },
                core,
            )
        }
    }

    impl AudioSource for MockSource {
        fn start(&mut self) -> bool {
            if !self.core.transition(SourceState::Stopped, SourceState::Starting) {
                return false;
            }
            self.core.set_state(SourceState::Running);
            true
        }

        fn stop(&mut self) -> bool {
            if !matches!(
                self.core.state(),
                SourceState::Running | SourceState::Paused
            ) {
                return false;
            }
            self.core.set_state(SourceState::Stopped);
            true
        }

        fn pause(&mut self) -> bool {
            self.core.transition(SourceState::Running, SourceState::Paused)
        }

        fn resume(&mut self) -> bool {
            self.core.transition(SourceState::Paused, SourceState::Running)
        }

        fn on_audio_data(&self, callback: AudioCallback) {
            self.core.on_audio_data(callback);
        }

        fn clear_callbacks(&self) {
            self.core.clear_callbacks();
        }

        fn device_info(&self) -> StdHashMap<String, String> {
            StdHashMap::new()
        }

        fn status(&self) -> SourceStatus {
            self.core.status()
        }

        fn format(&self) -> AudioFormat {
            self.core.format()
        }

        fn reset(&mut self) -> bool {
            self.core.reset()
        }
    }

    fn manager_with_sources(ids: &[&str]) -> (Arc<SourceManager>, Vec<Arc<SourceCore>>) {
        let buffers = Arc::new(BufferManager::new());
        let manager = Arc::new(
            SourceManager::new(buffers, AudioFormat::default(), Some(50)).unwrap(),
        );
        let mut cores = Vec::new();
        for id in ids {
            let (source, core) = MockSource::new();
            manager
                .add_source(id, SourceType::File, Box::new(source), SourceOptions::default())
                .unwrap();
            cores.push(core);
        }
        (manager, cores)
    }

    #[test]
    fn switching_between_sources_updates_current_and_history() {
        let (manager, _cores) = manager_with_sources(&["a", "b"]);

        assert!(manager.switch_to_source("a", None));
        assert!(manager.switch_to_source("b", None));

        assert_eq!(manager.current_source().as_deref(), Some("b"));
        assert_eq!(manager.switch_count(), 2);
        let history = manager.switch_history();
        assert!(history.len() >= 2);
        assert!(history[history.len() - 2].success);
        assert!(history[history.len() - 1].success);
        assert_eq!(history[history.len() - 1].to, "b");
    }

    #[test]
    fn switch_to_unknown_source_fails_and_is_recorded() {
        let (manager, _) = manager_with_sources(&["a"]);
        assert!(!manager.switch_to_source("ghost", None));
        let history = manager.switch_history();
        assert!(!history.last().unwrap().success);
    }

    #[test]
    fn old_source_cannot_feed_the_buffer_after_switch() {
        let (manager, cores) = manager_with_sources(&["a", "b"]);
        assert!(manager.switch_to_source("a", None));
        assert!(manager.start());

        // Source A is wired and running; its samples land in main_audio
        cores[0].emit(&[0.5; 32]);
        let buffer = manager.buffers.get_buffer(MAIN_BUFFER).unwrap();
        assert_eq!(buffer.len(), 32);

        assert!(manager.switch_to_source("b", None));

        // A was stopped and unwired; even a rogue emit must go nowhere
        assert_eq!(cores[0].state(), SourceState::Stopped);
        assert_eq!(cores[0].callback_count(), 0);
        cores[0].emit(&[0.5; 32]);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn switch_while_running_starts_the_new_source() {
        let (manager, cores) = manager_with_sources(&["a", "b"]);
        assert!(manager.switch_to_source("a", None));
        assert!(manager.start());
        assert!(manager.switch_to_source("b", None));
        assert_eq!(cores[1].state(), SourceState::Running);
        assert_eq!(manager.state(), ManagerState::Running);
    }

    #[test]
    fn switch_clears_buffered_samples_from_old_stream() {
        let (manager, cores) = manager_with_sources(&["a", "b"]);
        manager.switch_to_source("a", None);
        manager.start();
        cores[0].emit(&[0.9; 64]);
        assert!(manager.buffers.get_buffer(MAIN_BUFFER).unwrap().len() > 0);

        manager.switch_to_source("b", None);
        assert_eq!(manager.buffers.get_buffer(MAIN_BUFFER).unwrap().len(), 0);
    }

    #[test]
    fn remove_source_refuses_current() {
        let (manager, _) = manager_with_sources(&["a", "b"]);
        manager.switch_to_source("a", None);
        assert!(!manager.remove_source("a"));
        assert!(manager.remove_source("b"));
        assert!(!manager.remove_source("b"));
    }

    #[test]
    fn duplicate_source_id_is_rejected() {
        let (manager, _) = manager_with_sources(&["a"]);
        let (source, _) = MockSource::new();
        let result = manager.add_source("a", SourceType::File, Box::new(source), SourceOptions::default());
        assert!(matches!(result, Err(SourceError::InvalidArgument(_))));
    }

    #[test]
    fn downstream_sink_sees_samples_after_routing() {
        let (manager, cores) = manager_with_sources(&["a"]);
        let received = Arc::new(Mutex::new(Vec::new()));
        {
            let received = Arc::clone(&received);
            manager.on_audio_data(Arc::new(move |samples: &[f32]| {
                received.lock().extend_from_slice(samples);
            }));
        }
        manager.switch_to_source("a", None);
        manager.start();
        cores[0].emit(&[0.25; 16]);
        assert_eq!(received.lock().len(), 16);
    }

    #[test]
    fn lifecycle_delegates_to_current_source() {
        let (manager, cores) = manager_with_sources(&["a"]);
        assert!(!manager.start()); // no current source yet
        manager.switch_to_source("a", None);
        assert!(manager.start());
        assert_eq!(manager.state(), ManagerState::Running);
        assert!(manager.pause());
        assert_eq!(cores[0].state(), SourceState::Paused);
        assert!(manager.resume());
        assert!(manager.stop());
        assert_eq!(manager.state(), ManagerState::Stopped);
    }

    #[test]
    fn health_requires_running_source_and_healthy_buffer() {
        let (manager, _) = manager_with_sources(&["a"]);
        assert!(manager.healthy()); // no current source, buffer healthy
        manager.switch_to_source("a", None);
        assert!(!manager.healthy()); // current source not running
        manager.start();
        assert!(manager.healthy());
    }

    #[test]
    fn faded_switch_lands_with_unity_gain() {
        let (manager, cores) = manager_with_sources(&["a", "b"]);
        manager.switch_to_source("a", None);
        manager.start();
        assert!(manager.switch_to_source("b", Some(16)));
        assert_eq!(manager.fade.get(), 1.0);
        // New source delivers at full scale after the fade
        cores[1].emit(&[0.5; 8]);
        let buffer = manager.buffers.get_buffer(MAIN_BUFFER).unwrap();
        assert_eq!(buffer.read(8), vec![0.5; 8]);
    }

    #[test]
    fn stats_report_registry_and_buffer() {
        let (manager, _) = manager_with_sources(&["a", "b"]);
        manager.switch_to_source("a", None);
        let stats = manager.stats();
        assert_eq!(stats.source_count, 2);
        assert_eq!(stats.current_source.as_deref(), Some("a"));
        assert_eq!(stats.switch_count, 1);
        assert!(stats.main_buffer.is_some());
    }
}
