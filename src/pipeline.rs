//! Pipeline controller
//!
//! Wires the components into the capture-to-visualization path:
//! source → main buffer → control chain → analyzer → downstream sinks.
//! Owns the analyzer thread that drains the main buffer in windows; the
//! producer threads belong to the sources and the downstream frequency
//! callbacks run inline on the analyzer thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::analyzer::{Analyzer, AnalyzerConfig, AnalyzerError, FrequencyCallback, Window};
use crate::controls::{Controls, Preset};
use crate::manager::BufferManager;
use crate::source::manager::{SourceManager, MAIN_BUFFER};
use crate::source::{AudioCallback, AudioFormat, SourceError, SourceState};

/// How long one timed read on the main buffer may block; bounds both
/// steady-state wakeup latency and shutdown time.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Pipeline construction errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Pipeline construction parameters
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub format: AudioFormat,
    pub fft_size: usize,
    pub overlap: f32,
    pub window: Window,
    /// Main buffer depth in milliseconds
    pub latency_ms: u64,
    /// Control preset applied at startup
    pub preset: Option<Preset>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            fft_size: 1024,
            overlap: 0.5,
            window: Window::Hanning,
            latency_ms: 50,
            preset: None,
        }
    }
}

/// Top-level controller owning the component graph and worker threads.
pub struct Pipeline {
    buffers: Arc<BufferManager>,
    sources: Arc<SourceManager>,
    controls: Arc<Controls>,
    analyzer: Arc<Mutex<Analyzer>>,
    audio_callbacks: Arc<Mutex<Vec<AudioCallback>>>,
    stop_flag: Arc<AtomicBool>,
    analyzer_thread: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let buffers = Arc::new(BufferManager::new());
        let sources = Arc::new(SourceManager::new(
            Arc::clone(&buffers),
            config.format,
            Some(config.latency_ms),
        )?);
        let controls = Arc::new(match config.preset {
            Some(preset) => Controls::with_params(preset.params()),
            None => Controls::new(),
        });
        let analyzer = Analyzer::new(AnalyzerConfig {
            sample_rate: config.format.sample_rate,
            fft_size: config.fft_size,
            overlap: config.overlap,
            window: config.window,
        })?;

        Ok(Self {
            buffers,
            sources,
            controls,
            analyzer: Arc::new(Mutex::new(analyzer)),
            audio_callbacks: Arc::new(Mutex::new(Vec::new())),
            stop_flag: Arc::new(AtomicBool::new(false)),
            analyzer_thread: None,
        })
    }

    pub fn buffers(&self) -> Arc<BufferManager> {
        Arc::clone(&self.buffers)
    }

    pub fn sources(&self) -> Arc<SourceManager> {
        Arc::clone(&self.sources)
    }

    pub fn controls(&self) -> Arc<Controls> {
        Arc::clone(&self.controls)
    }

    /// Sink for the control chain's output, fed on the analyzer thread.
    pub fn on_audio_data(&self, callback: AudioCallback) {
        self.audio_callbacks.lock().push(callback);
    }

    /// Sink for analyzed frequency frames.
    pub fn on_frequency_data(&self, callback: FrequencyCallback) {
        self.analyzer.lock().on_frequency_data(callback);
    }

    /// Start the analyzer thread and the current source.
    ///
    /// The analyzer keeps running even without a healthy source, so the
    /// downstream visualization ticks on silence.
    pub fn start(&mut self) -> bool {
        if self.analyzer_thread.is_none() {
            self.stop_flag.store(false, Ordering::SeqCst);
            self.spawn_analyzer_thread();
        }
        self.sources.start()
    }

    /// Stop the current source and the analyzer thread, then drop what
    /// is left in the main buffer.
    pub fn stop(&mut self) -> bool {
        let stopped = self.sources.stop();
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.analyzer_thread.take() {
            let _ = handle.join();
        }
        if let Some(buffer) = self.buffers.get_buffer(MAIN_BUFFER) {
            buffer.clear();
        }
        stopped
    }

    pub fn pause(&self) -> bool {
        self.sources.pause()
    }

    pub fn resume(&self) -> bool {
        self.sources.resume()
    }

    /// Hand the main buffer over to another registered source.
    pub fn switch(&self, source_id: &str, fade_ms: Option<u64>) -> bool {
        self.sources.switch_to_source(source_id, fade_ms)
    }

    fn spawn_analyzer_thread(&mut self) {
        let buffers = Arc::clone(&self.buffers);
        let consumer = self.buffers.consumer(MAIN_BUFFER);
        let sources = Arc::clone(&self.sources);
        let controls = Arc::clone(&self.controls);
        let analyzer = Arc::clone(&self.analyzer);
        let audio_callbacks = Arc::clone(&self.audio_callbacks);
        let stop_flag = Arc::clone(&self.stop_flag);
        let read_size = self.analyzer.lock().fft_size();

        let handle = thread::Builder::new()
            .name("analyzer".to_string())
            .spawn(move || {
                let mut stream_down = false;
                while !stop_flag.load(Ordering::SeqCst) {
                    // A source in error is a dropped stream: discard its
                    // tail once and keep ticking until someone recovers
                    match sources.current_status() {
                        Some(status) if status.state == SourceState::Error => {
                            if !stream_down {
                                log::warn!("audio stream dropped; awaiting recovery");
                                if let Some(buffer) = buffers.get_buffer(MAIN_BUFFER) {
                                    buffer.clear();
                                }
                                analyzer.lock().flush();
                                stream_down = true;
                            }
                        }
                        _ => stream_down = false,
                    }

                    let samples = consumer.read_timeout(read_size, READ_TIMEOUT);
                    if samples.is_empty() {
                        continue;
                    }

                    let processed = controls.process(&samples);

                    let callbacks: Vec<AudioCallback> = audio_callbacks.lock().clone();
                    for callback in &callbacks {
                        if catch_unwind(AssertUnwindSafe(|| callback(&processed))).is_err() {
                            log::warn!("audio data callback panicked");
                        }
                    }

                    analyzer.lock().process_samples(&processed);
                }
            });

        match handle {
            Ok(handle) => self.analyzer_thread = Some(handle),
            Err(e) => log::error!("failed to spawn analyzer thread: {}", e),
        }
    }

    /// Stop everything and tear the buffers down.
    pub fn shutdown(&mut self) {
        self.stop();
        self.sources.shutdown();
        self.buffers.shutdown();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.analyzer_thread.take() {
            let _ = handle.join();
        }
    }
}
