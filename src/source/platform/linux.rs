//! Linux audio plumbing
//!
//! Capture itself is handled by cpal, which reaches PulseAudio/PipeWire
//! through the ALSA `default` PCM when a sound server is running, or raw
//! ALSA otherwise. This module covers the PulseAudio-side routing that
//! cpal has no opinion on:
//!
//! - probing whether a PulseAudio-compatible server is up (`pactl info`),
//! - pointing the default input at the default sink's `.monitor` source
//!   so "system audio" capture sees what is being played,
//! - enumerating per-application streams (`pactl list sink-inputs`).
//!
//! `pactl` works against both PulseAudio and PipeWire (via the
//! pipewire-pulse compatibility layer). ALSA-only systems get no monitor
//! routing and no per-app enumeration.

use std::process::Command;

use crate::source::{SourceDescriptor, SourceKind};

/// True when a PulseAudio-compatible server answers. Checked before ALSA
/// is used directly, matching the probe order pulse-then-alsa.
pub fn pulseaudio_available() -> bool {
    Command::new("pactl")
        .arg("info")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Only shell-safe PulseAudio object names are accepted
/// (e.g. "alsa_output.pci-0000_03_00.1.hdmi-stereo.monitor", "@DEFAULT_SINK@").
fn is_valid_source_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '@'))
}

fn pactl_line(args: &[&str]) -> Option<String> {
    Command::new("pactl")
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| is_valid_source_name(s))
}

/// Find the default sink's monitor source and make it the default input
/// for the capture session.
///
/// Returns `(original_source, monitor_was_set)`; the original default
/// source is reported so it can be restored when capture ends.
pub fn detect_and_set_monitor_source() -> (Option<String>, bool) {
    let original_source = pactl_line(&["get-default-source"]);
    let default_sink = pactl_line(&["get-default-sink"]);

    let monitor = Command::new("pactl")
        .args(["list", "sources", "short"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|output| {
            let stdout = String::from_utf8_lossy(&output.stdout);
            pick_monitor_source(&stdout, default_sink.as_deref())
        });

    let monitor_set = match monitor {
        Some(name) => {
            log::info!("using monitor source '{}' for system audio", name);
            Command::new("pactl")
                .args(["set-default-source", &name])
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        }
        None => {
            log::info!("no PulseAudio monitor source found");
            false
        }
    };

    (original_source, monitor_set)
}

/// Choose a monitor source from `pactl list sources short` output,
/// preferring the monitor of the given sink.
fn pick_monitor_source(listing: &str, default_sink: Option<&str>) -> Option<String> {
    let names: Vec<&str> = listing
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .filter(|name| is_valid_source_name(name))
        .collect();

    if let Some(sink) = default_sink {
        let expected = format!("{}.monitor", sink);
        if let Some(name) = names.iter().find(|n| **n == expected) {
            return Some(name.to_string());
        }
    }
    names
        .iter()
        .find(|n| n.contains(".monitor"))
        .map(|n| n.to_string())
}

/// Restores the original PulseAudio default source on drop, covering
/// every exit path of a capture session.
pub struct MonitorSourceGuard {
    original_source: Option<String>,
    should_restore: bool,
}

impl MonitorSourceGuard {
    /// Detect and set a monitor source, remembering what to restore.
    pub fn install() -> Self {
        let (original_source, should_restore) = detect_and_set_monitor_source();
        Self {
            original_source,
            should_restore,
        }
    }
}

impl Drop for MonitorSourceGuard {
    fn drop(&mut self) {
        if !self.should_restore {
            return;
        }
        if let Some(ref original) = self.original_source {
            let _ = Command::new("pactl")
                .args(["set-default-source", original])
                .output();
        }
    }
}

/// List applications currently producing audio via
/// `pactl list sink-inputs`. Each sink-input is one application's stream
/// to an output device.
pub fn list_audio_applications() -> Result<Vec<SourceDescriptor>, String> {
    let output = match Command::new("pactl").args(["list", "sink-inputs"]).output() {
        Ok(output) if output.status.success() => output,
        Ok(_) | Err(_) => {
            log::info!("pactl not available, per-app audio enumeration disabled");
            return Ok(Vec::new());
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut sources = parse_sink_inputs(&stdout);
    sources.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(sources)
}

fn property_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix(key)
        .and_then(|rest| rest.strip_prefix(" = "))
        .map(|v| v.trim_matches('"'))
}

fn parse_sink_inputs(listing: &str) -> Vec<SourceDescriptor> {
    let mut sources = Vec::new();
    let mut seen_pids = std::collections::HashSet::new();
    let mut name: Option<String> = None;
    let mut pid: Option<String> = None;
    let mut binary: Option<String> = None;

    let mut flush = |name: &mut Option<String>, pid: &mut Option<String>, binary: &mut Option<String>| {
        if let (Some(n), Some(p)) = (name.take(), pid.take()) {
            if seen_pids.insert(p.clone()) {
                let bin = binary.take().unwrap_or_else(|| "unknown".to_string());
                sources.push(SourceDescriptor {
                    id: format!("app:{}:{}", p, bin),
                    name: n,
                    kind: SourceKind::Application,
                });
            }
        }
        *name = None;
        *pid = None;
        *binary = None;
    };

    for raw in listing.lines() {
        let line = raw.trim();
        if line.starts_with("Sink Input #") {
            flush(&mut name, &mut pid, &mut binary);
        } else if let Some(v) = property_value(line, "application.name") {
            name = Some(v.to_string());
        } else if let Some(v) = property_value(line, "application.process.id") {
            pid = Some(v.to_string());
        } else if let Some(v) = property_value(line, "application.process.binary") {
            binary = Some(v.to_string());
        }
    }
    flush(&mut name, &mut pid, &mut binary);

    sources
}
