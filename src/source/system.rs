//! System audio capture
//!
//! Captures the system's default input (on Linux, the PulseAudio monitor
//! source when one can be routed, so "system audio" means what is being
//! played) through cpal: CoreAudio on macOS, ALSA/PulseAudio on Linux.
//!
//! cpal streams are not `Send`, so the stream lives on a dedicated
//! capture thread driven over a command channel. The data callback
//! converts native integer PCM to float at the boundary and hands chunks
//! to the source core; nothing in the callback path can panic across the
//! OS frame.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SizedSample, StreamConfig};
use parking_lot::Mutex;

use super::platform;
use super::{
    AudioCallback, AudioFormat, AudioSource, SourceCore, SourceError, SourceState, SourceStatus,
};
use crate::pcm;

/// How long `start` waits for the capture thread to report readiness.
const START_TIMEOUT: Duration = Duration::from_secs(5);

/// System capture construction options
#[derive(Debug, Clone, Default)]
pub struct SystemCaptureOptions {
    /// Explicit input device name; `None` selects the default input.
    pub device: Option<String>,
}

enum CaptureCommand {
    Pause,
    Resume,
    Stop,
}

/// Audio source capturing from the operating system.
pub struct SystemCapture {
    core: Arc<SourceCore>,
    options: SystemCaptureOptions,
    command_tx: Option<mpsc::Sender<CaptureCommand>>,
    thread: Option<JoinHandle<()>>,
    device_name: Arc<Mutex<Option<String>>>,
}

impl SystemCapture {
    /// Create a capture source for the requested format.
    ///
    /// Fails with `unsupported_environment` when no native audio system
    /// offers an input device.
    pub fn new(format: AudioFormat, options: SystemCaptureOptions) -> Result<Self, SourceError> {
        let host = cpal::default_host();
        let has_input = match &options.device {
            Some(name) => host
                .input_devices()
                .map(|mut devices| {
                    devices.any(|d| d.name().map(|n| n == *name).unwrap_or(false))
                })
                .unwrap_or(false),
            None => host.default_input_device().is_some(),
        };
        if !has_input {
            return Err(SourceError::UnsupportedEnvironment(format!(
                "no usable audio input on the {} backend",
                platform::backend_name()
            )));
        }
        Ok(Self {
            core: Arc::new(SourceCore::new(format)),
            options,
            command_tx: None,
            thread: None,
            device_name: Arc::new(Mutex::new(None)),
        })
    }

    fn send(&self, command: CaptureCommand) -> bool {
        self.command_tx
            .as_ref()
            .map(|tx| tx.send(command).is_ok())
            .unwrap_or(false)
    }

    fn join_thread(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl AudioSource for SystemCapture {
    fn start(&mut self) -> bool {
        if !self.core.transition(SourceState::Stopped, SourceState::Starting) {
            return false;
        }

        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let core = Arc::clone(&self.core);
        let options = self.options.clone();
        let device_name = Arc::clone(&self.device_name);

        let spawned = thread::Builder::new()
            .name("system-capture".to_string())
            .spawn(move || run_capture_thread(options, core, command_rx, ready_tx, device_name));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.core.fail(format!("failed to spawn capture thread: {}", e));
                return false;
            }
        };

        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => {
                self.command_tx = Some(command_tx);
                self.thread = Some(handle);
                self.core.set_state(SourceState::Running);
                log::info!("system capture started");
                true
            }
            Ok(Err(message)) => {
                self.core.fail(message);
                let _ = handle.join();
                false
            }
            Err(_) => {
                self.core.fail("capture thread did not become ready in time");
                drop(command_tx);
                let _ = handle.join();
                false
            }
        }
    }

    fn stop(&mut self) -> bool {
        let state = self.core.state();
        if !matches!(state, SourceState::Running | SourceState::Paused) {
            return false;
        }
        self.core.set_state(SourceState::Stopping);
        self.send(CaptureCommand::Stop);
        self.command_tx = None;
        self.join_thread();
        self.core.set_state(SourceState::Stopped);
        log::info!("system capture stopped");
        true
    }

    fn pause(&mut self) -> bool {
        if !self.core.transition(SourceState::Running, SourceState::Paused) {
            return false;
        }
        self.send(CaptureCommand::Pause);
        true
    }

    fn resume(&mut self) -> bool {
        if !self.core.transition(SourceState::Paused, SourceState::Running) {
            return false;
        }
        self.send(CaptureCommand::Resume);
        true
    }

    fn on_audio_data(&self, callback: AudioCallback) {
        self.core.on_audio_data(callback);
    }

    fn clear_callbacks(&self) {
        self.core.clear_callbacks();
    }

    fn device_info(&self) -> HashMap<String, String> {
        let format = self.core.format();
        let mut info = HashMap::new();
        info.insert("type".to_string(), "system_capture".to_string());
        info.insert("backend".to_string(), platform::backend_name().to_string());
        info.insert(
            "device".to_string(),
            self.device_name
                .lock()
                .clone()
                .or_else(|| self.options.device.clone())
                .unwrap_or_else(|| "default".to_string()),
        );
        info.insert("sample_rate".to_string(), format.sample_rate.to_string());
        info.insert("channels".to_string(), format.channels.to_string());
        info.insert(
            "sample_width_bits".to_string(),
            format.sample_width_bits.to_string(),
        );
        info
    }

    fn status(&self) -> SourceStatus {
        self.core.status()
    }

    fn format(&self) -> AudioFormat {
        self.core.format()
    }

    fn reset(&mut self) -> bool {
        self.command_tx = None;
        self.join_thread();
        self.core.reset()
    }
}

impl Drop for SystemCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capture thread body: owns the cpal stream for its whole lifetime.
fn run_capture_thread(
    options: SystemCaptureOptions,
    core: Arc<SourceCore>,
    command_rx: mpsc::Receiver<CaptureCommand>,
    ready_tx: mpsc::Sender<Result<(), String>>,
    device_name: Arc<Mutex<Option<String>>>,
) {
    // PulseAudio first: route the default input at the monitor source for
    // the duration of the capture session, restored on all exit paths.
    // Without a sound server, cpal falls back to raw ALSA capture.
    #[cfg(target_os = "linux")]
    let _monitor_guard = if platform::linux::pulseaudio_available() {
        Some(platform::linux::MonitorSourceGuard::install())
    } else {
        log::info!("PulseAudio not available, capturing through raw ALSA");
        None
    };

    let host = cpal::default_host();
    let device = match resolve_device(&host, &options) {
        Ok(device) => device,
        Err(message) => {
            let _ = ready_tx.send(Err(message));
            return;
        }
    };

    if let Ok(name) = device.name() {
        log::info!("capturing from '{}'", name);
        *device_name.lock() = Some(name);
    }

    let native = match device.default_input_config() {
        Ok(config) => config,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("no supported input config: {}", e)));
            return;
        }
    };

    let format = core.format();
    let config = StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = {
        let core = Arc::clone(&core);
        let built = match native.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, core, |d| d.to_vec()),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, core, pcm::i16_slice_to_f32),
            SampleFormat::I32 => build_stream::<i32>(&device, &config, core, pcm::i32_slice_to_f32),
            SampleFormat::U8 => build_stream::<u8>(&device, &config, core, pcm::u8_slice_to_f32),
            other => {
                let _ = ready_tx.send(Err(format!("unsupported sample format: {:?}", other)));
                return;
            }
        };
        match built {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("failed to build input stream: {}", e)));
                return;
            }
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(format!("failed to start input stream: {}", e)));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    // The stream delivers data on the OS callback thread; this loop only
    // services lifecycle commands.
    loop {
        match command_rx.recv() {
            Ok(CaptureCommand::Pause) => {
                if let Err(e) = stream.pause() {
                    log::warn!("backend cannot pause stream: {}", e);
                }
            }
            Ok(CaptureCommand::Resume) => {
                if let Err(e) = stream.play() {
                    core.fail(format!("failed to resume input stream: {}", e));
                    break;
                }
            }
            Ok(CaptureCommand::Stop) | Err(_) => break,
        }
    }
}

fn resolve_device(host: &cpal::Host, options: &SystemCaptureOptions) -> Result<Device, String> {
    match &options.device {
        Some(name) => host
            .input_devices()
            .map_err(|e| format!("failed to enumerate input devices: {}", e))?
            .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
            .ok_or_else(|| format!("input device not found: {}", name)),
        None => host
            .default_input_device()
            .ok_or_else(|| "no audio input device available".to_string()),
    }
}

fn build_stream<T: SizedSample + Send + 'static>(
    device: &Device,
    config: &StreamConfig,
    core: Arc<SourceCore>,
    convert: fn(&[T]) -> Vec<f32>,
) -> Result<cpal::Stream, cpal::BuildStreamError> {
    let err_core = Arc::clone(&core);
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let samples = convert(data);
            core.emit(&samples);
        },
        move |err| {
            err_core.fail(format!("audio stream error: {}", err));
        },
        None,
    )
}
