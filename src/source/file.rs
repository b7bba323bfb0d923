//! File playback source
//!
//! Streams PCM out of a decoder subprocess instead of linking codec
//! libraries: ffmpeg (preferred) or sox decodes the file to raw signed
//! 16-bit little-endian interleaved samples on stdout, and a reader
//! thread converts and delivers them. Seeking relaunches the decoder
//! with a skip offset; pausing suspends reading without killing the
//! child (the pipe back-pressures the decoder).

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{
    AudioCallback, AudioFormat, AudioSource, SourceCore, SourceError, SourceState, SourceStatus,
};
use crate::pcm;

/// Frames pulled from the decoder per read.
const CHUNK_FRAMES: usize = 1024;

/// How long `stop` waits for the reader thread before killing the child.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A running decoder that has produced nothing for this long is stalled.
const READ_STALL_DEADLINE: Duration = Duration::from_secs(5);

/// File extensions the decoder adapters accept.
pub const SUPPORTED_EXTENSIONS: [&str; 6] = ["mp3", "wav", "flac", "m4a", "aac", "ogg"];

/// Decoder family behind the subprocess adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    Ffmpeg,
    Sox,
}

impl DecoderKind {
    fn name(self) -> &'static str {
        match self {
            DecoderKind::Ffmpeg => "ffmpeg",
            DecoderKind::Sox => "sox",
        }
    }
}

#[derive(Debug, Clone)]
struct Decoder {
    kind: DecoderKind,
    binary: PathBuf,
}

impl Decoder {
    /// Find a usable decoder: ffmpeg first, then sox.
    fn locate() -> Option<Self> {
        locate_binary("ffmpeg").map(|binary| Self {
            kind: DecoderKind::Ffmpeg,
            binary,
        })
        .or_else(|| {
            locate_binary("sox").map(|binary| Self {
                kind: DecoderKind::Sox,
                binary,
            })
        })
    }

    fn spawn(&self, path: &Path, format: AudioFormat, skip_seconds: f64) -> std::io::Result<Child> {
        Command::new(&self.binary)
            .args(decoder_args(self.kind, path, format, skip_seconds))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

/// Arguments instructing the decoder to emit s16le interleaved PCM at
/// the requested rate and channel count, skipping `skip_seconds`.
fn decoder_args(kind: DecoderKind, path: &Path, format: AudioFormat, skip_seconds: f64) -> Vec<String> {
    let path = path.to_string_lossy().to_string();
    let rate = format.sample_rate.to_string();
    let channels = format.channels.to_string();
    match kind {
        DecoderKind::Ffmpeg => {
            let mut args = vec!["-v".to_string(), "error".to_string()];
            if skip_seconds > 0.0 {
                args.push("-ss".to_string());
                args.push(format!("{:.3}", skip_seconds));
            }
            args.extend([
                "-i".to_string(),
                path,
                "-f".to_string(),
                "s16le".to_string(),
                "-acodec".to_string(),
                "pcm_s16le".to_string(),
                "-ac".to_string(),
                channels,
                "-ar".to_string(),
                rate,
                "-".to_string(),
            ]);
            args
        }
        DecoderKind::Sox => {
            let mut args = vec![
                path,
                "-t".to_string(),
                "raw".to_string(),
                "-b".to_string(),
                "16".to_string(),
                "-e".to_string(),
                "signed-integer".to_string(),
                "-L".to_string(),
                "-r".to_string(),
                rate,
                "-c".to_string(),
                channels,
                "-".to_string(),
            ];
            if skip_seconds > 0.0 {
                args.push("trim".to_string());
                args.push(format!("{:.3}", skip_seconds));
            }
            args
        }
    }
}

fn locate_binary(name: &str) -> Option<PathBuf> {
    if let Ok(path) = which::which(name) {
        return Some(path);
    }
    let common = ["/usr/bin", "/usr/local/bin", "/opt/homebrew/bin", "/opt/local/bin"];
    common
        .iter()
        .map(|dir| Path::new(dir).join(name))
        .find(|p| p.exists())
}

/// Probe a file's duration in seconds: ffprobe first, then soxi.
fn probe_duration(path: &Path) -> Option<f64> {
    if let Some(ffprobe) = locate_binary("ffprobe") {
        let output = Command::new(ffprobe)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
            ])
            .arg(path)
            .output();
        if let Ok(output) = output {
            if output.status.success() {
                if let Some(seconds) = parse_ffprobe_duration(&output.stdout) {
                    return Some(seconds);
                }
            }
        }
    }

    if let Some(soxi) = locate_binary("soxi") {
        let output = Command::new(soxi).arg("-D").arg(path).output();
        if let Ok(output) = output {
            if output.status.success() {
                if let Ok(seconds) = String::from_utf8_lossy(&output.stdout).trim().parse::<f64>() {
                    return Some(seconds);
                }
            }
        }
    }

    None
}

fn parse_ffprobe_duration(stdout: &[u8]) -> Option<f64> {
    let value: serde_json::Value = serde_json::from_slice(stdout).ok()?;
    value
        .get("format")?
        .get("duration")?
        .as_str()?
        .parse::<f64>()
        .ok()
}

/// Audio source decoding a file through a subprocess.
pub struct FilePlayer {
    core: Arc<SourceCore>,
    path: PathBuf,
    decoder: Decoder,
    duration: Option<f64>,
    position: Arc<Mutex<f64>>,
    paused: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    last_data: Arc<Mutex<Option<Instant>>>,
    child: Arc<Mutex<Option<Child>>>,
    reader: Option<JoinHandle<()>>,
    done_rx: Option<mpsc::Receiver<()>>,
}

impl FilePlayer {
    /// Create a player for an existing, supported audio file.
    ///
    /// Fails with `invalid_argument` for a missing file or unsupported
    /// extension, and `unsupported_environment` when neither decoder
    /// family is installed.
    pub fn new(path: impl Into<PathBuf>, format: AudioFormat) -> Result<Self, SourceError> {
        let path = path.into();
        if !path.is_file() {
            return Err(SourceError::InvalidArgument(format!(
                "file not found: {}",
                path.display()
            )));
        }
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(SourceError::InvalidArgument(format!(
                "unsupported file extension: {}",
                path.display()
            )));
        }
        let decoder = Decoder::locate().ok_or_else(|| {
            SourceError::UnsupportedEnvironment(
                "no audio decoder available (install ffmpeg or sox)".to_string(),
            )
        })?;
        let duration = probe_duration(&path);
        if let Some(seconds) = duration {
            log::debug!("{}: {:.1}s via {}", path.display(), seconds, decoder.kind.name());
        }

        Ok(Self {
            core: Arc::new(SourceCore::new(format)),
            path,
            decoder,
            duration,
            position: Arc::new(Mutex::new(0.0)),
            paused: Arc::new(AtomicBool::new(false)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            last_data: Arc::new(Mutex::new(None)),
            child: Arc::new(Mutex::new(None)),
            reader: None,
            done_rx: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total length in seconds, when a metadata probe succeeded.
    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    /// Current playback position in seconds.
    pub fn position(&self) -> f64 {
        *self.position.lock()
    }

    /// Jump to a position. A running decoder is relaunched with the new
    /// skip offset; a stopped player just starts from there later.
    pub fn seek(&mut self, seconds: f64) -> bool {
        let target = match self.duration {
            Some(total) => seconds.clamp(0.0, total),
            None => seconds.max(0.0),
        };
        let state = self.core.state();
        match state {
            SourceState::Running | SourceState::Paused => {
                self.shutdown_decoder();
                *self.position.lock() = target;
                match self.launch_decoder() {
                    Ok(()) => {
                        self.spawn_reader();
                        true
                    }
                    Err(message) => {
                        self.core.fail(message);
                        false
                    }
                }
            }
            SourceState::Stopped => {
                *self.position.lock() = target;
                true
            }
            _ => false,
        }
    }

    fn launch_decoder(&mut self) -> Result<(), String> {
        let skip = *self.position.lock();
        let child = self
            .decoder
            .spawn(&self.path, self.core.format(), skip)
            .map_err(|e| format!("failed to spawn {}: {}", self.decoder.kind.name(), e))?;
        *self.child.lock() = Some(child);
        self.stop_flag.store(false, Ordering::SeqCst);
        *self.last_data.lock() = Some(Instant::now());
        Ok(())
    }

    fn spawn_reader(&mut self) {
        let stdout = match self.child.lock().as_mut().and_then(|c| c.stdout.take()) {
            Some(stdout) => stdout,
            None => {
                self.core.fail("decoder produced no stdout pipe");
                return;
            }
        };

        let (done_tx, done_rx) = mpsc::channel();
        let core = Arc::clone(&self.core);
        let position = Arc::clone(&self.position);
        let paused = Arc::clone(&self.paused);
        let stop_flag = Arc::clone(&self.stop_flag);
        let last_data = Arc::clone(&self.last_data);
        let child = Arc::clone(&self.child);
        let format = self.core.format();

        let handle = thread::Builder::new()
            .name("file-player".to_string())
            .spawn(move || {
                run_reader(stdout, core, position, paused, stop_flag, last_data, child, format);
                let _ = done_tx.send(());
            });

        match handle {
            Ok(handle) => {
                self.reader = Some(handle);
                self.done_rx = Some(done_rx);
            }
            Err(e) => self.core.fail(format!("failed to spawn reader thread: {}", e)),
        }
    }

    /// Stop the reader and reap the child without touching lifecycle state.
    fn shutdown_decoder(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);

        let timed_out = match self.done_rx.take() {
            Some(done_rx) => done_rx.recv_timeout(STOP_JOIN_TIMEOUT).is_err(),
            None => false,
        };
        if timed_out {
            // Reader is blocked on the pipe; killing the child unblocks it
            if let Some(child) = self.child.lock().as_mut() {
                let _ = child.kill();
            }
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl AudioSource for FilePlayer {
    fn start(&mut self) -> bool {
        if !self.core.transition(SourceState::Stopped, SourceState::Starting) {
            return false;
        }
        self.paused.store(false, Ordering::SeqCst);
        if let Err(message) = self.launch_decoder() {
            self.core.fail(message);
            return false;
        }
        // Running before the reader spawns, so the first chunk is delivered
        self.core.set_state(SourceState::Running);
        self.spawn_reader();
        if self.core.state() != SourceState::Running {
            return false;
        }
        log::info!("playing {}", self.path.display());
        true
    }

    fn stop(&mut self) -> bool {
        let state = self.core.state();
        if !matches!(state, SourceState::Running | SourceState::Paused) {
            return false;
        }
        self.core.set_state(SourceState::Stopping);
        self.shutdown_decoder();
        self.paused.store(false, Ordering::SeqCst);
        *self.position.lock() = 0.0;
        self.core.set_state(SourceState::Stopped);
        log::info!("stopped {}", self.path.display());
        true
    }

    fn pause(&mut self) -> bool {
        if !self.core.transition(SourceState::Running, SourceState::Paused) {
            return false;
        }
        self.paused.store(true, Ordering::SeqCst);
        true
    }

    fn resume(&mut self) -> bool {
        if !self.core.transition(SourceState::Paused, SourceState::Running) {
            return false;
        }
        self.paused.store(false, Ordering::SeqCst);
        *self.last_data.lock() = Some(Instant::now());
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
        info.insert("type".to_string(), "file_player".to_string());
        info.insert("path".to_string(), self.path.display().to_string());
        info.insert("decoder".to_string(), self.decoder.kind.name().to_string());
        info.insert("position".to_string(), format!("{:.3}", self.position()));
        if let Some(duration) = self.duration {
            info.insert("duration".to_string(), format!("{:.3}", duration));
        }
        info.insert("sample_rate".to_string(), format.sample_rate.to_string());
        info.insert("channels".to_string(), format.channels.to_string());
        info
    }

    fn status(&self) -> SourceStatus {
        // Watchdog: a running decoder that stopped producing is dead weight
        if self.core.state() == SourceState::Running && !self.paused.load(Ordering::SeqCst) {
            let stalled = (*self.last_data.lock())
                .map(|at| at.elapsed() > READ_STALL_DEADLINE)
                .unwrap_or(false);
            if stalled {
                self.core.fail("decoder stopped producing data");
            }
        }
        self.core.status()
    }

    fn format(&self) -> AudioFormat {
        self.core.format()
    }

    fn reset(&mut self) -> bool {
        if self.core.state() != SourceState::Error {
            return false;
        }
        self.shutdown_decoder();
        self.paused.store(false, Ordering::SeqCst);
        *self.position.lock() = 0.0;
        self.core.reset()
    }
}

impl Drop for FilePlayer {
    fn drop(&mut self) {
        if matches!(self.core.state(), SourceState::Running | SourceState::Paused) {
            self.stop();
        } else {
            self.shutdown_decoder();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_reader(
    mut stdout: std::process::ChildStdout,
    core: Arc<SourceCore>,
    position: Arc<Mutex<f64>>,
    paused: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    last_data: Arc<Mutex<Option<Instant>>>,
    child: Arc<Mutex<Option<Child>>>,
    format: AudioFormat,
) {
    let chunk_bytes = CHUNK_FRAMES * format.channels as usize * 2;
    let mut buf = vec![0u8; chunk_bytes];

    loop {
        if stop_flag.load(Ordering::SeqCst) {
            return;
        }
        if paused.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(10));
            continue;
        }

        let filled = match fill_chunk(&mut stdout, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                if !stop_flag.load(Ordering::SeqCst) {
                    core.fail(format!("decoder read failed: {}", e));
                }
                return;
            }
        };
        if filled == 0 {
            break; // decoder drained
        }

        let samples = pcm::decode_s16le(&buf[..filled]);
        core.emit(&samples);

        let frames = samples.len() / format.channels as usize;
        *position.lock() += frames as f64 / format.sample_rate as f64;
        *last_data.lock() = Some(Instant::now());
    }

    // EOF caused by a stop/seek kill is not a decoder failure; the
    // shutdown path reaps the child itself
    if stop_flag.load(Ordering::SeqCst) {
        return;
    }

    // Natural end of stream: reap the child and report how it went
    let status = child.lock().take().map(|mut c| {
        let mut stderr_text = String::new();
        if let Some(mut stderr) = c.stderr.take() {
            let _ = stderr.read_to_string(&mut stderr_text);
        }
        (c.wait(), stderr_text)
    });
    match status {
        Some((Ok(exit), stderr_text)) if !exit.success() => {
            let detail = stderr_text.lines().next().unwrap_or("").trim().to_string();
            core.fail(format!(
                "decoder exited with {}{}",
                exit,
                if detail.is_empty() {
                    String::new()
                } else {
                    format!(": {}", detail)
                }
            ));
        }
        _ => {
            log::debug!("decoder finished");
            core.set_state(SourceState::Stopped);
        }
    }
}

/// Fill as much of `buf` as the pipe yields; 0 means end of stream.
fn fill_chunk(stdout: &mut std::process::ChildStdout, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stdout.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
