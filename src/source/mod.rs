//! Audio sources
//!
//! The source contract shared by every audio producer, the composed state
//! record backing the implementations, and device/application enumeration.
//! Concrete variants live in the submodules: system loopback/input capture
//! and file playback through a decoder subprocess.

pub mod file;
pub mod manager;
pub mod platform;
pub mod system;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on frames per callback payload, so downstream buffers see
/// bounded chunks even when a back-end delivers large batches.
pub const MAX_CHUNK_FRAMES: usize = 4096;

/// Interleaved float samples delivered from a running source.
pub type AudioCallback = Arc<dyn Fn(&[f32]) + Send + Sync>;

/// Audio source errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported environment: {0}")]
    UnsupportedEnvironment(String),

    #[error("source error: {0}")]
    SourceFailed(String),
}

/// Sample format fixed at source construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_width_bits: u8,
}

impl AudioFormat {
    pub const SAMPLE_RATES: [u32; 4] = [22_050, 44_100, 48_000, 96_000];
    pub const SAMPLE_WIDTHS: [u8; 4] = [8, 16, 24, 32];

    pub fn new(sample_rate: u32, channels: u16, sample_width_bits: u8) -> Result<Self, SourceError> {
        if !Self::SAMPLE_RATES.contains(&sample_rate) {
            return Err(SourceError::InvalidArgument(format!(
                "unsupported sample rate: {}",
                sample_rate
            )));
        }
        if !(1..=2).contains(&channels) {
            return Err(SourceError::InvalidArgument(format!(
                "unsupported channel count: {}",
                channels
            )));
        }
        if !Self::SAMPLE_WIDTHS.contains(&sample_width_bits) {
            return Err(SourceError::InvalidArgument(format!(
                "unsupported sample width: {}",
                sample_width_bits
            )));
        }
        Ok(Self {
            sample_rate,
            channels,
            sample_width_bits,
        })
    }

    /// Interleaved samples per second.
    pub fn samples_per_second(&self) -> u32 {
        self.sample_rate * self.channels as u32
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            sample_width_bits: 16,
        }
    }
}

/// Source lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
    /// Terminal until an explicit reset
    Error,
}

/// Lifecycle state plus the last failure message, if any.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub state: SourceState,
    pub error_message: Option<String>,
}

/// Common contract implemented by every audio producer.
///
/// Lifecycle operations return `false` instead of raising: a failure
/// transitions the source to [`SourceState::Error`] with a message, never
/// a panic across an OS callback frame. Repeated `start` on a running
/// source returns `false`.
pub trait AudioSource: Send {
    fn start(&mut self) -> bool;
    fn stop(&mut self) -> bool;
    fn pause(&mut self) -> bool;
    fn resume(&mut self) -> bool;

    /// Register a callback receiving interleaved float chunks while the
    /// source is running.
    fn on_audio_data(&self, callback: AudioCallback);
    fn clear_callbacks(&self);

    fn device_info(&self) -> HashMap<String, String>;
    fn status(&self) -> SourceStatus;
    fn format(&self) -> AudioFormat;

    /// Leave the terminal error state; returns `false` when not errored.
    fn reset(&mut self) -> bool;
}

/// Shared state composed into each source implementation: format,
/// lifecycle state, failure message and the callback list.
///
/// `emit` is the single delivery path. It refuses to fire outside
/// `Running`, splits payloads into bounded chunks, and invokes callbacks
/// outside any lock with panics caught and logged.
pub struct SourceCore {
    format: AudioFormat,
    state: Mutex<SourceState>,
    error_message: Mutex<Option<String>>,
    callbacks: Mutex<Vec<AudioCallback>>,
}

impl SourceCore {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            state: Mutex::new(SourceState::Stopped),
            error_message: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn state(&self) -> SourceState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: SourceState) {
        *self.state.lock() = state;
    }

    /// Compare-and-set on the lifecycle state.
    pub fn transition(&self, from: SourceState, to: SourceState) -> bool {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Enter the terminal error state with a message.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("audio source error: {}", message);
        *self.error_message.lock() = Some(message);
        *self.state.lock() = SourceState::Error;
    }

    pub fn reset(&self) -> bool {
        let mut state = self.state.lock();
        if *state != SourceState::Error {
            return false;
        }
        *state = SourceState::Stopped;
        *self.error_message.lock() = None;
        true
    }

    pub fn status(&self) -> SourceStatus {
        SourceStatus {
            state: *self.state.lock(),
            error_message: self.error_message.lock().clone(),
        }
    }

    pub fn on_audio_data(&self, callback: AudioCallback) {
        self.callbacks.lock().push(callback);
    }

    pub fn clear_callbacks(&self) {
        self.callbacks.lock().clear();
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Deliver interleaved samples to every registered callback.
    ///
    /// Silently drops the payload unless the source is `Running`.
    pub fn emit(&self, samples: &[f32]) {
        if samples.is_empty() || *self.state.lock() != SourceState::Running {
            return;
        }
        let callbacks: Vec<AudioCallback> = self.callbacks.lock().clone();
        if callbacks.is_empty() {
            return;
        }
        let max_chunk = MAX_CHUNK_FRAMES * self.format.channels as usize;
        for chunk in samples.chunks(max_chunk) {
            for callback in &callbacks {
                if catch_unwind(AssertUnwindSafe(|| callback(chunk))).is_err() {
                    log::warn!("audio data callback panicked");
                }
            }
        }
    }
}

/// Kind of enumerable audio source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// System-wide audio (monitor/loopback)
    SystemAudio,

    /// Input device (microphone)
    InputDevice,

    /// Per-application stream
    Application,
}

/// One enumerated source the downstream UI can offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Unique identifier for the source
    pub id: String,

    /// Display name
    pub name: String,

    pub kind: SourceKind,
}

/// List available capture sources: the system monitor, output devices
/// usable for loopback, input devices, and (where the platform supports
/// it) per-application streams.
pub fn list_sources() -> Result<Vec<SourceDescriptor>, SourceError> {
    let mut sources = Vec::new();
    let host = cpal::default_host();

    if let Some(device) = host.default_output_device() {
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        sources.push(SourceDescriptor {
            id: "system_audio".to_string(),
            name: format!("System Audio ({})", device_name),
            kind: SourceKind::SystemAudio,
        });
    }

    match platform::list_audio_applications() {
        Ok(apps) => sources.extend(apps),
        Err(e) => log::warn!("failed to enumerate audio applications: {}", e),
    }

    if let Ok(devices) = host.output_devices() {
        let default_name = host
            .default_output_device()
            .and_then(|d| d.name().ok());
        for device in devices {
            if let Ok(name) = device.name() {
                if default_name.as_deref() == Some(name.as_str()) {
                    continue;
                }
                sources.push(SourceDescriptor {
                    id: format!("output:{}", name),
                    name: format!("Loopback: {}", name),
                    kind: SourceKind::SystemAudio,
                });
            }
        }
    }

    if let Ok(devices) = host.input_devices() {
        for device in devices {
            if let Ok(name) = device.name() {
                sources.push(SourceDescriptor {
                    id: format!("input:{}", name),
                    name: format!("Input: {}", name),
                    kind: SourceKind::InputDevice,
                });
            }
        }
    }

    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn format_validation_rejects_out_of_range() {
        assert!(AudioFormat::new(44_100, 2, 16).is_ok());
        assert!(matches!(
            AudioFormat::new(11_025, 2, 16),
            Err(SourceError::InvalidArgument(_))
        ));
        assert!(AudioFormat::new(48_000, 3, 16).is_err());
        assert!(AudioFormat::new(48_000, 1, 12).is_err());
    }

    #[test]
    fn emit_only_fires_while_running() {
        let core = SourceCore::new(AudioFormat::default());
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = Arc::clone(&seen);
            core.on_audio_data(Arc::new(move |s: &[f32]| {
                seen.fetch_add(s.len(), Ordering::SeqCst);
            }));
        }

        core.emit(&[0.0; 8]);
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        core.set_state(SourceState::Running);
        core.emit(&[0.0; 8]);
        assert_eq!(seen.load(Ordering::SeqCst), 8);

        core.set_state(SourceState::Stopping);
        core.emit(&[0.0; 8]);
        assert_eq!(seen.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn emit_splits_large_payloads_into_bounded_chunks() {
        let format = AudioFormat {
            sample_rate: 48_000,
            channels: 1,
            sample_width_bits: 16,
        };
        let core = SourceCore::new(format);
        core.set_state(SourceState::Running);
        let chunks = Arc::new(Mutex::new(Vec::new()));
        {
            let chunks = Arc::clone(&chunks);
            core.on_audio_data(Arc::new(move |s: &[f32]| {
                chunks.lock().push(s.len());
            }));
        }
        core.emit(&vec![0.0; MAX_CHUNK_FRAMES * 2 + 5]);
        let sizes = chunks.lock().clone();
        assert_eq!(sizes, vec![MAX_CHUNK_FRAMES, MAX_CHUNK_FRAMES, 5]);
    }

    #[test]
    fn panicking_callback_does_not_stop_delivery() {
        let core = SourceCore::new(AudioFormat::default());
        core.set_state(SourceState::Running);
        core.on_audio_data(Arc::new(|_: &[f32]| panic!("boom")));
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = Arc::clone(&seen);
            core.on_audio_data(Arc::new(move |s: &[f32]| {
                seen.fetch_add(s.len(), Ordering::SeqCst);
            }));
        }
        core.emit(&[0.0; 4]);
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn error_state_is_terminal_until_reset() {
        let core = SourceCore::new(AudioFormat::default());
        core.fail("decoder died");
        assert_eq!(core.state(), SourceState::Error);
        assert!(!core.transition(SourceState::Stopped, SourceState::Starting));
        assert!(core.reset());
        assert_eq!(core.state(), SourceState::Stopped);
        assert!(core.status().error_message.is_none());
        assert!(!core.reset());
    }

    #[test]
    fn clear_callbacks_empties_the_list() {
        let core = SourceCore::new(AudioFormat::default());
        core.on_audio_data(Arc::new(|_: &[f32]| {}));
        core.on_audio_data(Arc::new(|_: &[f32]| {}));
        assert_eq!(core.callback_count(), 2);
        core.clear_callbacks();
        assert_eq!(core.callback_count(), 0);
    }
}
