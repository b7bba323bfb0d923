//! termviz — real-time audio visualization core
//!
//! Captures PCM audio from the operating system or a decoded file,
//! runs it through a DSP control chain and a windowed FFT, and hands
//! float samples and frequency frames to the downstream terminal
//! renderer.
//!
//! The pieces compose as a pipeline:
//!
//! ```text
//! SystemCapture | FilePlayer → BufferManager("main_audio")
//!     → Controls → Analyzer → on_audio_data / on_frequency_data
//! ```
//!
//! [`pipeline::Pipeline`] wires them up and owns the worker threads;
//! every component is also usable on its own.

pub mod analyzer;
pub mod controls;
pub mod manager;
pub mod pcm;
pub mod pipeline;
pub mod ring;
pub mod source;

pub use analyzer::{Analyzer, AnalyzerConfig, FrequencyFrame, Window};
pub use controls::{ControlParams, Controls, LevelUpdate, Preset};
pub use manager::{BufferManager, BufferedConsumer, BufferedSource};
pub use pipeline::{Pipeline, PipelineConfig, PipelineError};
pub use ring::{BufferStats, BufferStatus, RingBuffer};
pub use source::manager::{SourceManager, SourceOptions, SourceType};
pub use source::{
    list_sources, AudioFormat, AudioSource, SourceDescriptor, SourceError, SourceState,
};
