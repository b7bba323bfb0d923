//! Command-line entry point
//!
//! Exposes the interop surface for the terminal renderer: version/usage,
//! source selection and pipeline tuning flags. The renderer itself is a
//! separate collaborator; run headless, this binary logs levels and
//! frame rates instead of drawing.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use termviz::source::manager::SourceOptions;
use termviz::{AudioFormat, Pipeline, PipelineConfig, Preset, SourceError, SourceState, Window};

const EXIT_INVALID_ARGS: u8 = 2;
const EXIT_NO_AUDIO: u8 = 3;
const EXIT_NO_DECODER: u8 = 4;
const EXIT_RUNTIME: u8 = 5;

const USAGE: &str = "\
termviz - real-time terminal audio visualizer

USAGE:
    termviz [OPTIONS]

OPTIONS:
    -v, --version            Print version and exit
    -h, --help               Print this help and exit
        --source <SRC>       Audio source: system | file:<path>
        --mode <MODE>        Visualization mode: spectrum | waveform | abstract
        --sample-rate <HZ>   Sample rate (22050, 44100, 48000, 96000)
        --channels <N>       Channel count (1 or 2)
        --fft-size <N>       FFT size (128..4096, power of two)
        --preset <NAME>      Control preset (live_input, music_file,
                             quiet_environment, loud_environment, disabled)
";

#[derive(Debug, Clone, PartialEq)]
enum SourceArg {
    System,
    File(PathBuf),
}

#[derive(Debug, Default)]
struct CliArgs {
    show_version: bool,
    show_help: bool,
    source: Option<SourceArg>,
    mode: Option<String>,
    sample_rate: Option<u32>,
    channels: Option<u16>,
    fft_size: Option<usize>,
    preset: Option<Preset>,
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut parsed = CliArgs::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let mut value_for = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{} requires a value", flag))
        };
        match arg.as_str() {
            "--version" | "-v" => parsed.show_version = true,
            "--help" | "-h" => parsed.show_help = true,
            "--source" => {
                let value = value_for("--source")?;
                parsed.source = Some(match value.as_str() {
                    "system" => SourceArg::System,
                    other => match other.strip_prefix("file:") {
                        Some(path) if !path.is_empty() => SourceArg::File(PathBuf::from(path)),
                        _ => return Err(format!("invalid source: {}", value)),
                    },
                });
            }
            "--mode" => {
                let value = value_for("--mode")?;
                if !["spectrum", "waveform", "abstract"].contains(&value.as_str()) {
                    return Err(format!("invalid mode: {}", value));
                }
                parsed.mode = Some(value);
            }
            "--sample-rate" => {
                let value = value_for("--sample-rate")?;
                parsed.sample_rate =
                    Some(value.parse().map_err(|_| format!("invalid sample rate: {}", value))?);
            }
            "--channels" => {
                let value = value_for("--channels")?;
                parsed.channels =
                    Some(value.parse().map_err(|_| format!("invalid channel count: {}", value))?);
            }
            "--fft-size" => {
                let value = value_for("--fft-size")?;
                parsed.fft_size =
                    Some(value.parse().map_err(|_| format!("invalid FFT size: {}", value))?);
            }
            "--preset" => {
                let value = value_for("--preset")?;
                parsed.preset = Some(value.parse().map_err(|e| format!("{}", e))?);
            }
            other => return Err(format!("unknown option: {}", other)),
        }
    }
    Ok(parsed)
}

fn main() -> ExitCode {
    env_logger::init();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    if raw.is_empty() {
        print!("{}", USAGE);
        return ExitCode::SUCCESS;
    }

    let args = match parse_args(&raw) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("error: {}", message);
            eprintln!("try 'termviz --help'");
            return ExitCode::from(EXIT_INVALID_ARGS);
        }
    };

    if args.show_version {
        println!("termviz {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }
    if args.show_help {
        print!("{}", USAGE);
        return ExitCode::SUCCESS;
    }

    let format = match AudioFormat::new(
        args.sample_rate.unwrap_or(44_100),
        args.channels.unwrap_or(2),
        16,
    ) {
        Ok(format) => format,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_INVALID_ARGS);
        }
    };

    let config = PipelineConfig {
        format,
        fft_size: args.fft_size.unwrap_or(1024),
        window: Window::Hanning,
        preset: args.preset,
        ..PipelineConfig::default()
    };

    let mut pipeline = match Pipeline::new(config) {
        Ok(pipeline) => pipeline,
        Err(termviz::PipelineError::Analyzer(e)) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_INVALID_ARGS);
        }
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    if let Some(mode) = &args.mode {
        log::info!("visualization mode '{}' requested", mode);
    }

    let sources = pipeline.sources();
    let selected = args.source.clone().unwrap_or(SourceArg::System);
    let switched = match &selected {
        SourceArg::System => sources.switch_to_system_audio(SourceOptions::default()),
        SourceArg::File(path) => sources.switch_to_file(path, SourceOptions::default()),
    };
    match switched {
        Ok(true) => {}
        Ok(false) => {
            eprintln!("error: could not activate the requested source");
            return ExitCode::from(EXIT_RUNTIME);
        }
        Err(SourceError::UnsupportedEnvironment(message)) => {
            eprintln!("error: {}", message);
            let code = match selected {
                SourceArg::System => EXIT_NO_AUDIO,
                SourceArg::File(_) => EXIT_NO_DECODER,
            };
            return ExitCode::from(code);
        }
        Err(SourceError::InvalidArgument(message)) => {
            eprintln!("error: {}", message);
            return ExitCode::from(EXIT_INVALID_ARGS);
        }
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_RUNTIME);
        }
    }

    let frames = Arc::new(AtomicU64::new(0));
    {
        let frames = Arc::clone(&frames);
        pipeline.on_frequency_data(Box::new(move |_| {
            frames.fetch_add(1, Ordering::Relaxed);
        }));
    }

    if !pipeline.start() {
        eprintln!("error: failed to start the audio source");
        return ExitCode::from(EXIT_RUNTIME);
    }
    log::info!("pipeline running; frames are logged once per second");

    let mut last_frames = 0;
    loop {
        std::thread::sleep(Duration::from_secs(1));
        let total = frames.load(Ordering::Relaxed);
        log::debug!("{} frequency frames/s", total - last_frames);
        last_frames = total;

        match sources.current_status() {
            Some(status) if status.state == SourceState::Error => {
                eprintln!(
                    "error: {}",
                    status
                        .error_message
                        .unwrap_or_else(|| "audio source failed".to_string())
                );
                pipeline.shutdown();
                return ExitCode::from(EXIT_RUNTIME);
            }
            // A file source stopping on its own means playback finished
            Some(status) if status.state == SourceState::Stopped => {
                log::info!("source finished");
                pipeline.shutdown();
                return ExitCode::SUCCESS;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_version_and_help_flags() {
        assert!(parse_args(&args(&["--version"])).unwrap().show_version);
        assert!(parse_args(&args(&["-v"])).unwrap().show_version);
        assert!(parse_args(&args(&["-h"])).unwrap().show_help);
    }

    #[test]
    fn parses_source_values() {
        let parsed = parse_args(&args(&["--source", "system"])).unwrap();
        assert_eq!(parsed.source, Some(SourceArg::System));

        let parsed = parse_args(&args(&["--source", "file:/tmp/a.mp3"])).unwrap();
        assert_eq!(
            parsed.source,
            Some(SourceArg::File(PathBuf::from("/tmp/a.mp3")))
        );

        assert!(parse_args(&args(&["--source", "radio"])).is_err());
        assert!(parse_args(&args(&["--source", "file:"])).is_err());
        assert!(parse_args(&args(&["--source"])).is_err());
    }

    #[test]
    fn parses_numeric_and_preset_flags() {
        let parsed = parse_args(&args(&[
            "--sample-rate",
            "48000",
            "--channels",
            "1",
            "--fft-size",
            "2048",
            "--preset",
            "music_file",
        ]))
        .unwrap();
        assert_eq!(parsed.sample_rate, Some(48_000));
        assert_eq!(parsed.channels, Some(1));
        assert_eq!(parsed.fft_size, Some(2048));
        assert_eq!(parsed.preset, Some(Preset::MusicFile));

        assert!(parse_args(&args(&["--sample-rate", "fast"])).is_err());
        assert!(parse_args(&args(&["--preset", "nightcore"])).is_err());
    }

    #[test]
    fn rejects_unknown_flags_and_bad_modes() {
        assert!(parse_args(&args(&["--loudness"])).is_err());
        assert!(parse_args(&args(&["--mode", "hologram"])).is_err());
        assert!(parse_args(&args(&["--mode", "spectrum"])).is_ok());
    }
}
