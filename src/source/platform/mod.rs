//! Platform-specific audio plumbing
//!
//! System capture itself goes through cpal (CoreAudio on macOS, ALSA or
//! PulseAudio on Linux); these modules cover what cpal does not: routing
//! the default input to a monitor source on Linux and best-effort
//! per-application stream enumeration.

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod macos;

use super::SourceDescriptor;

/// Name of the native audio back-end cpal resolves to on this platform.
pub fn backend_name() -> &'static str {
    if cfg!(target_os = "macos") {
        "coreaudio"
    } else if cfg!(target_os = "linux") {
        "alsa/pulseaudio"
    } else {
        "unsupported"
    }
}

/// List applications currently producing audio, where the platform can
/// tell. Platforms without per-app enumeration return an empty list.
pub fn list_audio_applications() -> Result<Vec<SourceDescriptor>, String> {
    #[cfg(target_os = "linux")]
    {
        linux::list_audio_applications()
    }
    #[cfg(target_os = "macos")]
    {
        macos::list_audio_applications()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Ok(Vec::new())
    }
}
