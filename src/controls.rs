//! Audio control chain
//!
//! Batch DSP applied between the main buffer and the analyzer: manual
//! gain, noise gate, compressor, AGC, peak limiter, then sensitivity.
//! The stage order is fixed and significant. Each stage can be toggled;
//! with everything disabled and unity gain/sensitivity the chain is the
//! identity.
//!
//! Parameters live under one lock and are validated by their setters.
//! Envelope-follower state is only touched from the processing thread.

use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Control chain errors
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Peak/RMS meter reading delivered after each processed batch.
#[derive(Debug, Clone, Serialize)]
pub struct LevelUpdate {
    pub peak: f32,
    pub rms: f32,
    pub timestamp: SystemTime,
}

/// Tunable parameters for every stage of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlParams {
    /// Manual gain in [0, 10]
    pub gain: f32,

    /// Final output scale in [0.1, 5]
    pub sensitivity: f32,

    pub gate_enabled: bool,
    /// RMS below this closes the gate
    pub gate_threshold: f32,

    pub compressor_enabled: bool,
    pub compressor_threshold: f32,
    pub compressor_ratio: f32,

    pub agc_enabled: bool,
    /// Target RMS level the AGC steers toward
    pub agc_target: f32,
    pub agc_attack: f32,
    pub agc_release: f32,

    pub limiter_enabled: bool,
    /// Hard peak ceiling
    pub limiter_threshold: f32,
}

impl Default for ControlParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            sensitivity: 1.0,
            gate_enabled: false,
            gate_threshold: 0.01,
            compressor_enabled: false,
            compressor_threshold: 0.8,
            compressor_ratio: 4.0,
            agc_enabled: false,
            agc_target: 0.7,
            agc_attack: 0.05,
            agc_release: 0.2,
            limiter_enabled: false,
            limiter_threshold: 0.95,
        }
    }
}

/// Named parameter bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    LiveInput,
    MusicFile,
    QuietEnvironment,
    LoudEnvironment,
    Disabled,
}

impl Preset {
    pub const ALL: [Preset; 5] = [
        Preset::LiveInput,
        Preset::MusicFile,
        Preset::QuietEnvironment,
        Preset::LoudEnvironment,
        Preset::Disabled,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Preset::LiveInput => "live_input",
            Preset::MusicFile => "music_file",
            Preset::QuietEnvironment => "quiet_environment",
            Preset::LoudEnvironment => "loud_environment",
            Preset::Disabled => "disabled",
        }
    }

    pub fn params(self) -> ControlParams {
        let base = ControlParams::default();
        match self {
            Preset::LiveInput => ControlParams {
                gain: 1.2,
                sensitivity: 1.5,
                gate_enabled: true,
                gate_threshold: 0.005,
                compressor_enabled: true,
                compressor_threshold: 0.75,
                compressor_ratio: 3.0,
                agc_enabled: true,
                agc_target: 0.7,
                agc_attack: 0.05,
                agc_release: 0.2,
                limiter_enabled: true,
                limiter_threshold: 0.9,
            },
            Preset::MusicFile => ControlParams {
                gain: 1.0,
                sensitivity: 1.0,
                limiter_enabled: true,
                limiter_threshold: 0.95,
                ..base
            },
            Preset::QuietEnvironment => ControlParams {
                gain: 2.0,
                sensitivity: 2.0,
                gate_enabled: true,
                gate_threshold: 0.002,
                compressor_enabled: true,
                compressor_threshold: 0.6,
                compressor_ratio: 6.0,
                agc_enabled: true,
                agc_target: 0.8,
                agc_attack: 0.02,
                agc_release: 0.5,
                limiter_enabled: true,
                limiter_threshold: 0.85,
            },
            Preset::LoudEnvironment => ControlParams {
                gain: 0.7,
                sensitivity: 0.8,
                gate_enabled: false,
                compressor_enabled: true,
                compressor_threshold: 0.5,
                compressor_ratio: 8.0,
                agc_enabled: true,
                agc_target: 0.6,
                agc_attack: 0.1,
                agc_release: 0.1,
                limiter_enabled: true,
                limiter_threshold: 0.8,
                ..base
            },
            Preset::Disabled => base,
        }
    }
}

impl std::str::FromStr for Preset {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Preset::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| ControlError::InvalidArgument(format!("unknown preset: {}", s)))
    }
}

/// Envelope-follower and gate state carried across batches.
#[derive(Debug, Clone, Copy)]
struct DspState {
    agc_envelope: f32,
    agc_gain: f32,
    limiter_gain_reduction: f32,
    compressor_gain_reduction: f32,
    gate_open: bool,
}

impl Default for DspState {
    fn default() -> Self {
        Self {
            agc_envelope: 0.0,
            agc_gain: 1.0,
            limiter_gain_reduction: 0.0,
            compressor_gain_reduction: 0.0,
            gate_open: true,
        }
    }
}

/// Running meters and counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ControlStats {
    pub processed_samples: u64,
    /// Max-held output peak
    pub peak_level: f32,
    /// Exponential moving average of output RMS
    pub rms_level: f32,
    /// Batches the compressor acted on
    pub gain_reductions: u64,
    /// Samples seen above full scale at the limiter
    pub clipped_samples: u64,
}

/// EMA weight for the running RMS meter.
const RMS_EMA_ALPHA: f32 = 0.1;

/// The DSP control chain.
pub struct Controls {
    params: Mutex<ControlParams>,
    state: Mutex<DspState>,
    stats: Mutex<ControlStats>,
    level_callbacks: Mutex<Vec<Box<dyn Fn(&LevelUpdate) + Send>>>,
    gain_callbacks: Mutex<Vec<Box<dyn Fn(f32) + Send>>>,
}

impl Controls {
    pub fn new() -> Self {
        Self::with_params(ControlParams::default())
    }

    pub fn with_params(params: ControlParams) -> Self {
        Self {
            params: Mutex::new(params),
            state: Mutex::new(DspState::default()),
            stats: Mutex::new(ControlStats::default()),
            level_callbacks: Mutex::new(Vec::new()),
            gain_callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Run one batch through the chain, returning an equal-length slice.
    pub fn process(&self, input: &[f32]) -> Vec<f32> {
        if input.is_empty() {
            return Vec::new();
        }
        let params = *self.params.lock();
        let mut samples = input.to_vec();
        let mut state = self.state.lock();

        // 1. Manual gain
        if (params.gain - 1.0).abs() > f32::EPSILON {
            for s in &mut samples {
                *s *= params.gain;
            }
        }

        // 2. Noise gate: attenuate the whole batch when its RMS is
        //    below the floor
        if params.gate_enabled {
            if rms(&samples) < params.gate_threshold {
                for s in &mut samples {
                    *s *= 0.01;
                }
                state.gate_open = false;
            } else {
                state.gate_open = true;
            }
        }

        // 3. Compressor: hard-knee reduction above the threshold
        if params.compressor_enabled {
            let peak = peak(&samples);
            if peak > params.compressor_threshold {
                let reduction = (peak - params.compressor_threshold) / params.compressor_ratio;
                let factor = (1.0 - reduction).max(0.0);
                for s in &mut samples {
                    *s *= factor;
                }
                state.compressor_gain_reduction = reduction;
                self.stats.lock().gain_reductions += 1;
            } else {
                state.compressor_gain_reduction = 0.0;
            }
        }

        // 4. AGC: envelope-followed gain toward the target RMS
        if params.agc_enabled {
            let current_rms = rms(&samples);
            let coeff = if current_rms > state.agc_envelope {
                params.agc_attack
            } else {
                params.agc_release
            };
            state.agc_envelope += coeff * (current_rms - state.agc_envelope);
            if state.agc_envelope > 0.001 {
                let desired = params.agc_target / state.agc_envelope;
                state.agc_gain += 0.1 * (desired - state.agc_gain);
                state.agc_gain = state.agc_gain.clamp(0.1, 10.0);
            }
            for s in &mut samples {
                *s *= state.agc_gain;
            }
        }

        // 5. Limiter: cap peaks at the ceiling
        if params.limiter_enabled {
            let peak = peak(&samples);
            let clipped = samples.iter().filter(|s| s.abs() > 1.0).count() as u64;
            if clipped > 0 {
                self.stats.lock().clipped_samples += clipped;
            }
            if peak > params.limiter_threshold {
                let factor = params.limiter_threshold / peak;
                for s in &mut samples {
                    *s *= factor;
                }
                state.limiter_gain_reduction = 1.0 - factor;
            } else {
                state.limiter_gain_reduction = 0.0;
            }
        }

        // 6. Sensitivity
        if (params.sensitivity - 1.0).abs() > f32::EPSILON {
            for s in &mut samples {
                *s *= params.sensitivity;
            }
        }
        drop(state);

        let batch_peak = peak(&samples);
        let batch_rms = rms(&samples);
        {
            let mut stats = self.stats.lock();
            stats.processed_samples += samples.len() as u64;
            stats.peak_level = stats.peak_level.max(batch_peak);
            stats.rms_level += RMS_EMA_ALPHA * (batch_rms - stats.rms_level);
        }

        let update = LevelUpdate {
            peak: batch_peak,
            rms: batch_rms,
            timestamp: SystemTime::now(),
        };
        for callback in self.level_callbacks.lock().iter() {
            callback(&update);
        }

        samples
    }

    pub fn params(&self) -> ControlParams {
        *self.params.lock()
    }

    pub fn stats(&self) -> ControlStats {
        *self.stats.lock()
    }

    /// Whether the gate passed the most recent batch.
    pub fn gate_open(&self) -> bool {
        self.state.lock().gate_open
    }

    pub fn apply_preset(&self, preset: Preset) {
        *self.params.lock() = preset.params();
        log::info!("applied control preset '{}'", preset.name());
    }

    pub fn on_level_update(&self, callback: Box<dyn Fn(&LevelUpdate) + Send>) {
        self.level_callbacks.lock().push(callback);
    }

    pub fn on_gain_change(&self, callback: Box<dyn Fn(f32) + Send>) {
        self.gain_callbacks.lock().push(callback);
    }

    pub fn set_gain(&self, gain: f32) -> Result<(), ControlError> {
        validate_range("gain", gain, 0.0, 10.0)?;
        self.params.lock().gain = gain;
        for callback in self.gain_callbacks.lock().iter() {
            callback(gain);
        }
        Ok(())
    }

    pub fn set_sensitivity(&self, sensitivity: f32) -> Result<(), ControlError> {
        validate_range("sensitivity", sensitivity, 0.1, 5.0)?;
        self.params.lock().sensitivity = sensitivity;
        Ok(())
    }

    pub fn set_gate(&self, enabled: bool, threshold: f32) -> Result<(), ControlError> {
        validate_range("gate threshold", threshold, 0.0, 1.0)?;
        let mut params = self.params.lock();
        params.gate_enabled = enabled;
        params.gate_threshold = threshold;
        Ok(())
    }

    pub fn set_compressor(&self, enabled: bool, threshold: f32, ratio: f32) -> Result<(), ControlError> {
        validate_range("compressor threshold", threshold, 0.0, 1.0)?;
        validate_range("compressor ratio", ratio, 1.0, 100.0)?;
        let mut params = self.params.lock();
        params.compressor_enabled = enabled;
        params.compressor_threshold = threshold;
        params.compressor_ratio = ratio;
        Ok(())
    }

    pub fn set_agc(&self, enabled: bool, target: f32, attack: f32, release: f32) -> Result<(), ControlError> {
        validate_range("agc target", target, 0.0, 1.0)?;
        validate_range("agc attack", attack, 0.0, 1.0)?;
        validate_range("agc release", release, 0.0, 1.0)?;
        let mut params = self.params.lock();
        params.agc_enabled = enabled;
        params.agc_target = target;
        params.agc_attack = attack;
        params.agc_release = release;
        Ok(())
    }

    pub fn set_limiter(&self, enabled: bool, threshold: f32) -> Result<(), ControlError> {
        validate_range("limiter threshold", threshold, 0.0, 1.0)?;
        let mut params = self.params.lock();
        params.limiter_enabled = enabled;
        params.limiter_threshold = threshold;
        Ok(())
    }
}

impl Default for Controls {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_range(name: &str, value: f32, min: f32, max: f32) -> Result<(), ControlError> {
    if !value.is_finite() || value < min || value > max {
        return Err(ControlError::InvalidArgument(format!(
            "{} must be in [{}, {}], got {}",
            name, min, max, value
        )));
    }
    Ok(())
}

fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn disabled_chain_is_identity() {
        let controls = Controls::with_params(Preset::Disabled.params());
        let input = vec![0.1, -0.4, 0.9, -1.0, 0.0, 0.33];
        assert_eq!(controls.process(&input), input);
    }

    #[test]
    fn output_length_always_matches_input() {
        let controls = Controls::with_params(Preset::LiveInput.params());
        for len in [1, 7, 256, 1024] {
            let input = vec![0.5; len];
            assert_eq!(controls.process(&input).len(), len);
        }
    }

    #[test]
    fn limiter_caps_peaks_at_threshold() {
        let controls = Controls::new();
        controls.set_limiter(true, 0.5).unwrap();
        let output = controls.process(&[0.8, 0.9, 1.0, 0.7]);
        let max = output.iter().fold(0.0f32, |a, s| a.max(s.abs()));
        assert!(max <= 0.5 + 1e-6);
    }

    #[test]
    fn limiter_counts_clipped_samples() {
        let controls = Controls::new();
        controls.set_limiter(true, 0.9).unwrap();
        controls.process(&[1.5, -1.2, 0.5]);
        assert_eq!(controls.stats().clipped_samples, 2);
    }

    #[test]
    fn gate_attenuates_quiet_batches() {
        let controls = Controls::new();
        controls.set_gate(true, 0.1).unwrap();
        let input = vec![0.01, -0.02, 0.015, -0.01];
        let input_rms = rms(&input);
        let output = controls.process(&input);
        assert!(rms(&output) < input_rms);
        assert!(!controls.gate_open());

        // A loud batch passes untouched and reopens the gate
        let loud = vec![0.5, -0.6, 0.4, -0.5];
        assert_eq!(controls.process(&loud), loud);
        assert!(controls.gate_open());
    }

    #[test]
    fn compressor_reduces_peaks_above_threshold() {
        let controls = Controls::new();
        controls.set_compressor(true, 0.5, 2.0).unwrap();
        let output = controls.process(&[0.9, -0.9, 0.3]);
        // reduction = (0.9 - 0.5) / 2 = 0.2, factor 0.8
        assert!((output[0] - 0.72).abs() < 1e-6);
        assert_eq!(controls.stats().gain_reductions, 1);

        // Below threshold the signal passes unchanged
        let quiet = vec![0.2, -0.3];
        assert_eq!(controls.process(&quiet), quiet);
    }

    #[test]
    fn agc_pushes_quiet_signal_toward_target() {
        let controls = Controls::new();
        controls.set_agc(true, 0.5, 0.5, 0.5).unwrap();
        let input = vec![0.05; 512];
        let mut last_rms = rms(&input);
        let mut grew = false;
        for _ in 0..50 {
            let output = controls.process(&input);
            let out_rms = rms(&output);
            if out_rms > last_rms {
                grew = true;
            }
            last_rms = out_rms;
        }
        assert!(grew);
        assert!(last_rms > rms(&input));
    }

    #[test]
    fn gain_is_applied_and_validated() {
        let controls = Controls::new();
        controls.set_gain(2.0).unwrap();
        assert_eq!(controls.process(&[0.25]), vec![0.5]);
        assert!(controls.set_gain(10.5).is_err());
        assert!(controls.set_gain(-0.1).is_err());
        assert!(controls.set_gain(f32::NAN).is_err());
        // Failed set leaves the parameter untouched
        assert_eq!(controls.params().gain, 2.0);
    }

    #[test]
    fn sensitivity_scales_final_output() {
        let controls = Controls::new();
        controls.set_sensitivity(2.0).unwrap();
        assert_eq!(controls.process(&[0.2]), vec![0.4]);
        assert!(controls.set_sensitivity(0.05).is_err());
        assert!(controls.set_sensitivity(5.5).is_err());
    }

    #[test]
    fn gain_change_callbacks_fire() {
        let controls = Controls::new();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            controls.on_gain_change(Box::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }
        controls.set_gain(1.5).unwrap();
        let _ = controls.set_gain(42.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn level_callbacks_report_batch_meters() {
        let controls = Controls::new();
        let last = Arc::new(Mutex::new(None));
        {
            let last = Arc::clone(&last);
            controls.on_level_update(Box::new(move |update: &LevelUpdate| {
                *last.lock() = Some((update.peak, update.rms));
            }));
        }
        controls.process(&[0.5, -0.5, 0.5, -0.5]);
        let (peak, rms) = (*last.lock()).unwrap();
        assert!((peak - 0.5).abs() < 1e-6);
        assert!((rms - 0.5).abs() < 1e-6);
    }

    #[test]
    fn preset_swap_lands_on_music_file_settings() {
        let controls = Controls::new();
        controls.apply_preset(Preset::LiveInput);
        controls.apply_preset(Preset::MusicFile);
        let params = controls.params();
        assert_eq!(params.gain, 1.0);
        assert_eq!(params.sensitivity, 1.0);
        assert!(!params.agc_enabled);
        assert!(!params.compressor_enabled);
        assert!(!params.gate_enabled);
        assert!(params.limiter_enabled);
        assert_eq!(params.limiter_threshold, 0.95);
    }

    #[test]
    fn preset_names_round_trip() {
        for preset in Preset::ALL {
            assert_eq!(preset.name().parse::<Preset>().unwrap(), preset);
        }
        assert!("techno_bunker".parse::<Preset>().is_err());
    }

    #[test]
    fn stats_track_processed_samples_and_peak() {
        let controls = Controls::new();
        controls.process(&[0.3, -0.8]);
        controls.process(&[0.1, 0.2]);
        let stats = controls.stats();
        assert_eq!(stats.processed_samples, 4);
        assert!((stats.peak_level - 0.8).abs() < 1e-6);
        assert!(stats.rms_level > 0.0);
    }
}
