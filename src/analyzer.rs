//! Windowed FFT analysis
//!
//! Turns the control chain's float stream into overlapped frequency
//! frames: buffer samples, window, forward FFT, magnitude and phase per
//! bin. Frames advance by the hop size derived from the overlap factor,
//! and each one is handed to the registered frequency-data callbacks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::Serialize;
use thiserror::Error;

use crate::source::AudioFormat;

/// Analyzer errors
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Supported FFT sizes (powers of two).
pub const FFT_SIZES: [usize; 6] = [128, 256, 512, 1024, 2048, 4096];

/// Window function applied before the transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Hanning,
    Hamming,
    Blackman,
    Rectangular,
}

impl Window {
    pub fn name(self) -> &'static str {
        match self {
            Window::Hanning => "hanning",
            Window::Hamming => "hamming",
            Window::Blackman => "blackman",
            Window::Rectangular => "rectangular",
        }
    }

    /// Coefficient table for an `n`-point window.
    pub fn coefficients(self, n: usize) -> Vec<f32> {
        use std::f32::consts::PI;
        let denom = (n - 1).max(1) as f32;
        (0..n)
            .map(|i| {
                let x = i as f32 / denom;
                match self {
                    Window::Hanning => 0.5 * (1.0 - (2.0 * PI * x).cos()),
                    Window::Hamming => 0.54 - 0.46 * (2.0 * PI * x).cos(),
                    Window::Blackman => {
                        0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
                    }
                    Window::Rectangular => 1.0,
                }
            })
            .collect()
    }
}

impl std::str::FromStr for Window {
    type Err = AnalyzerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hanning" => Ok(Window::Hanning),
            "hamming" => Ok(Window::Hamming),
            "blackman" => Ok(Window::Blackman),
            "rectangular" => Ok(Window::Rectangular),
            other => Err(AnalyzerError::InvalidArgument(format!(
                "unknown window: {}",
                other
            ))),
        }
    }
}

/// Analyzer configuration
#[derive(Debug, Clone, Copy)]
pub struct AnalyzerConfig {
    pub sample_rate: u32,
    pub fft_size: usize,
    /// Fraction of each frame shared with the next, in [0, 1)
    pub overlap: f32,
    pub window: Window,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            fft_size: 1024,
            overlap: 0.5,
            window: Window::Hanning,
        }
    }
}

/// One analyzed frame: `N/2 + 1` bins of a real-input FFT.
#[derive(Debug, Clone, Serialize)]
pub struct FrequencyFrame {
    pub frequencies: Vec<f32>,
    pub magnitudes: Vec<f32>,
    pub phases: Vec<f32>,
    pub sample_rate: u32,
    pub fft_size: usize,
}

/// Callback receiving each analyzed frame.
pub type FrequencyCallback = Box<dyn Fn(&FrequencyFrame) + Send>;

/// Overlapped windowed FFT analyzer.
pub struct Analyzer {
    config: AnalyzerConfig,
    window_coeffs: Vec<f32>,
    hop: usize,
    fft: Arc<dyn Fft<f32>>,
    frequencies: Vec<f32>,
    pending: Vec<f32>,
    callbacks: Vec<FrequencyCallback>,
    frames_processed: u64,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Result<Self, AnalyzerError> {
        if !FFT_SIZES.contains(&config.fft_size) {
            return Err(AnalyzerError::InvalidArgument(format!(
                "unsupported FFT size: {}",
                config.fft_size
            )));
        }
        if !(0.0..1.0).contains(&config.overlap) {
            return Err(AnalyzerError::InvalidArgument(format!(
                "overlap must be in [0, 1): {}",
                config.overlap
            )));
        }
        if !AudioFormat::SAMPLE_RATES.contains(&config.sample_rate) {
            return Err(AnalyzerError::InvalidArgument(format!(
                "unsupported sample rate: {}",
                config.sample_rate
            )));
        }

        let hop = ((config.fft_size as f32 * (1.0 - config.overlap)) as usize).max(1);
        let frequencies = (0..=config.fft_size / 2)
            .map(|k| k as f32 * config.sample_rate as f32 / config.fft_size as f32)
            .collect();

        Ok(Self {
            config,
            window_coeffs: config.window.coefficients(config.fft_size),
            hop,
            fft: FftPlanner::new().plan_fft_forward(config.fft_size),
            frequencies,
            pending: Vec::with_capacity(config.fft_size * 2),
            callbacks: Vec::new(),
            frames_processed: 0,
        })
    }

    pub fn config(&self) -> AnalyzerConfig {
        self.config
    }

    pub fn fft_size(&self) -> usize {
        self.config.fft_size
    }

    /// Stride between successive frames.
    pub fn hop(&self) -> usize {
        self.hop
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn on_frequency_data(&mut self, callback: FrequencyCallback) {
        self.callbacks.push(callback);
    }

    pub fn clear_callbacks(&mut self) {
        self.callbacks.clear();
    }

    /// Center frequency of a bin.
    pub fn bin_to_frequency(&self, bin: usize) -> f32 {
        bin as f32 * self.config.sample_rate as f32 / self.config.fft_size as f32
    }

    /// Nearest bin for a frequency.
    pub fn frequency_to_bin(&self, frequency: f32) -> usize {
        (frequency * self.config.fft_size as f32 / self.config.sample_rate as f32).round() as usize
    }

    /// Buffer samples and analyze every complete frame.
    ///
    /// Frames are emitted while at least `fft_size` samples are pending;
    /// each emission consumes `hop` samples. A panicking callback is
    /// caught and logged; analysis continues.
    pub fn process_samples(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);

        while self.pending.len() >= self.config.fft_size {
            let frame = self.analyze_front();
            self.frames_processed += 1;
            for callback in &self.callbacks {
                if catch_unwind(AssertUnwindSafe(|| callback(&frame))).is_err() {
                    log::warn!("frequency data callback panicked");
                }
            }
            self.pending.drain(..self.hop);
        }
    }

    fn analyze_front(&mut self) -> FrequencyFrame {
        let n = self.config.fft_size;
        let mut buffer: Vec<Complex<f32>> = self.pending[..n]
            .iter()
            .zip(&self.window_coeffs)
            .map(|(&s, &w)| Complex::new(s * w, 0.0))
            .collect();
        self.fft.process(&mut buffer);

        let bins = n / 2 + 1;
        let mut magnitudes = Vec::with_capacity(bins);
        let mut phases = Vec::with_capacity(bins);
        for c in buffer.iter().take(bins) {
            magnitudes.push(c.norm());
            phases.push(c.im.atan2(c.re));
        }

        FrequencyFrame {
            frequencies: self.frequencies.clone(),
            magnitudes,
            phases,
            sample_rate: self.config.sample_rate,
            fft_size: n,
        }
    }

    /// Discard buffered samples without analyzing them.
    pub fn flush(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::f32::consts::PI;

    fn collect_frames(analyzer: &mut Analyzer) -> Arc<Mutex<Vec<FrequencyFrame>>> {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        analyzer.on_frequency_data(Box::new(move |frame: &FrequencyFrame| {
            sink.lock().push(frame.clone());
        }));
        frames
    }

    fn config(fft_size: usize, overlap: f32, window: Window) -> AnalyzerConfig {
        AnalyzerConfig {
            sample_rate: 44_100,
            fft_size,
            overlap,
            window,
        }
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(Analyzer::new(config(100, 0.5, Window::Hanning)).is_err());
        assert!(Analyzer::new(config(1024, 1.0, Window::Hanning)).is_err());
        assert!(Analyzer::new(config(1024, -0.1, Window::Hanning)).is_err());
        let bad_rate = AnalyzerConfig {
            sample_rate: 12_345,
            ..AnalyzerConfig::default()
        };
        assert!(Analyzer::new(bad_rate).is_err());
    }

    #[test]
    fn dc_input_concentrates_in_bin_zero() {
        let mut analyzer = Analyzer::new(config(128, 0.0, Window::Rectangular)).unwrap();
        let frames = collect_frames(&mut analyzer);
        analyzer.process_samples(&[1.0; 128]);

        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.magnitudes.len(), 65);
        assert_eq!(frame.phases.len(), 65);
        assert!((frame.magnitudes[0] - 128.0).abs() < 1e-3);
        for &mag in &frame.magnitudes[1..] {
            assert!(mag.abs() < 1e-3);
        }
    }

    #[test]
    fn sinusoid_peaks_at_its_bin() {
        let n = 256;
        let k = 8;
        let mut analyzer = Analyzer::new(config(n, 0.0, Window::Rectangular)).unwrap();
        let frames = collect_frames(&mut analyzer);

        let samples: Vec<f32> = (0..n)
            .map(|i| (2.0 * PI * k as f32 * i as f32 / n as f32).sin())
            .collect();
        analyzer.process_samples(&samples);

        let frames = frames.lock();
        let frame = &frames[0];
        let peak_bin = frame
            .magnitudes
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak_bin, k);
    }

    #[test]
    fn bin_frequency_mapping_round_trips() {
        let analyzer = Analyzer::new(AnalyzerConfig::default()).unwrap();
        assert_eq!(analyzer.bin_to_frequency(0), 0.0);
        let hz_per_bin = 44_100.0 / 1024.0;
        assert!((analyzer.bin_to_frequency(1) - hz_per_bin).abs() < 1e-3);
        for bin in [0, 1, 10, 100, 512] {
            let freq = analyzer.bin_to_frequency(bin);
            assert_eq!(analyzer.frequency_to_bin(freq), bin);
        }
        assert_eq!(frame_frequencies_len(&analyzer), 513);
    }

    fn frame_frequencies_len(analyzer: &Analyzer) -> usize {
        analyzer.frequencies.len()
    }

    #[test]
    fn overlap_emits_frames_per_hop() {
        let mut analyzer = Analyzer::new(config(128, 0.5, Window::Hanning)).unwrap();
        assert_eq!(analyzer.hop(), 64);
        let frames = collect_frames(&mut analyzer);

        // 256 samples = one full frame plus two hops
        analyzer.process_samples(&vec![0.5; 256]);
        assert_eq!(frames.lock().len(), 3);
        assert_eq!(analyzer.frames_processed(), 3);
    }

    #[test]
    fn incremental_feeding_matches_batch_feeding() {
        let mut analyzer = Analyzer::new(config(128, 0.0, Window::Hanning)).unwrap();
        let frames = collect_frames(&mut analyzer);
        for chunk in vec![0.3f32; 128].chunks(13) {
            analyzer.process_samples(chunk);
        }
        assert_eq!(frames.lock().len(), 1);
    }

    #[test]
    fn window_tables_match_their_formulas() {
        let n = 64;
        let hann = Window::Hanning.coefficients(n);
        assert!(hann[0].abs() < 1e-6);
        assert!((hann[n / 2] - 1.0).abs() < 1e-2);

        let hamming = Window::Hamming.coefficients(n);
        assert!((hamming[0] - 0.08).abs() < 1e-6);

        let blackman = Window::Blackman.coefficients(n);
        assert!(blackman[0].abs() < 1e-6);

        assert!(Window::Rectangular
            .coefficients(n)
            .iter()
            .all(|&w| w == 1.0));
    }

    #[test]
    fn window_names_parse() {
        assert_eq!("hanning".parse::<Window>().unwrap(), Window::Hanning);
        assert_eq!("blackman".parse::<Window>().unwrap(), Window::Blackman);
        assert!("kaiser".parse::<Window>().is_err());
    }

    #[test]
    fn panicking_callback_does_not_abort_analysis() {
        let mut analyzer = Analyzer::new(config(128, 0.0, Window::Rectangular)).unwrap();
        analyzer.on_frequency_data(Box::new(|_| panic!("boom")));
        let frames = collect_frames(&mut analyzer);
        analyzer.process_samples(&[1.0; 256]);
        assert_eq!(frames.lock().len(), 2);
    }
}
