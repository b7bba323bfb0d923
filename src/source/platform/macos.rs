//! macOS audio plumbing
//!
//! Capture goes through cpal's CoreAudio backend, which binds the input
//! bus of the default device. macOS has no per-application capture
//! without a virtual audio driver (BlackHole and friends), so this module
//! only enumerates applications that currently hold CoreAudio resources,
//! letting the UI show what is playing.

use std::collections::HashSet;
use std::process::Command;

use crate::source::{SourceDescriptor, SourceKind};

/// List applications with CoreAudio activity, best effort via `lsof`.
pub fn list_audio_applications() -> Result<Vec<SourceDescriptor>, String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg("lsof -c '' 2>/dev/null | grep -i 'coreaudio\\|audioqueue\\|auhal' | awk '{print $1, $2}' | sort -u")
        .output()
        .map_err(|e| format!("lsof failed: {}", e))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut sources = parse_lsof_listing(&stdout);
    sources.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(sources)
}

fn parse_lsof_listing(listing: &str) -> Vec<SourceDescriptor> {
    let mut sources = Vec::new();
    let mut seen = HashSet::new();

    for line in listing.lines() {
        let mut parts = line.split_whitespace();
        let (Some(process), Some(pid)) = (parts.next(), parts.next()) else {
            continue;
        };
        // System daemons are not useful capture targets
        if process == "coreaudiod" || process == "kernel_task" || !seen.insert(process.to_string()) {
            continue;
        }
        sources.push(SourceDescriptor {
            id: format!("app:{}:{}", pid, process),
            name: display_name(process),
            kind: SourceKind::Application,
        });
    }
    sources
}

fn display_name(process: &str) -> String {
    let trimmed = process.trim_end_matches(".app");
    let mut chars = trimmed.chars();
    match chars.next() {
        None => trimmed.to_string(),
        Some(first) => first.to_uppercase().to_string() + chars.as_str(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_filters_lsof_output() {
        let listing = "coreaudiod 101\nspotify 2345\nspotify 2345\nmusic.app 678\n";
        let sources = parse_lsof_listing(listing);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].id, "app:2345:spotify");
        assert_eq!(sources[0].name, "Spotify");
        assert_eq!(sources[1].name, "Music");
    }
}
