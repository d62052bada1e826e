//! framegate - Command Line Entry Point
//!
//! Loads a gateway configuration, replays a capture through the pipeline and
//! prints every sink batch to stdout as one JSON line. Logs go to stderr and
//! optionally to a daily rolling file.

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use clap::Parser;
use framegate::{
    config::{GatewayConfig, LoggingConfig, SourceMode},
    pipeline::{PipelineBuilder, SinkReceiver, SourceHandle},
    types::Point,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "framegate", version, about = "Decode binary frames and route points to sinks")]
struct Args {
    /// Gateway configuration (.toml or .json)
    #[arg(short, long, value_name = "PATH", required_unless_present = "sample_config")]
    config: Option<PathBuf>,

    /// Hex capture, one frame per line; stdin when neither input is given
    #[arg(short, long, value_name = "PATH", conflicts_with = "stream")]
    input: Option<PathBuf>,

    /// Raw byte stream fed to a stream source
    #[arg(short, long, value_name = "PATH")]
    stream: Option<PathBuf>,

    /// Source to feed; defaults to the first source of the matching mode
    #[arg(long, value_name = "NAME")]
    source: Option<String>,

    /// Log filter directive, overrides the config file
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Write a sample configuration to PATH and exit
    #[arg(long, value_name = "PATH")]
    sample_config: Option<PathBuf>,
}

/// One line of sink output
#[derive(Serialize)]
struct SinkLine<'a> {
    sink: &'a str,
    frame_id: &'a str,
    timestamp: DateTime<Utc>,
    points: Vec<&'a Point>,
}

fn init_logging(config: &LoggingConfig, level: Option<&str>) -> anyhow::Result<Option<WorkerGuard>> {
    let level = level.unwrap_or(&config.level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{}'", level))?;
    let stderr = fmt::layer().with_writer(io::stderr);

    let Some(path) = &config.file else {
        tracing_subscriber::registry().with(filter).with(stderr).try_init()?;
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_name()
        .ok_or_else(|| anyhow!("Log file path {:?} has no file name", path))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, prefix));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()?;
    Ok(Some(guard))
}

fn parse_hex(line: &str) -> anyhow::Result<Vec<u8>> {
    let digits: String = line
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(&digits);

    if let Some(bad) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
        bail!("invalid hex digit {:?}", bad);
    }
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }

    // ASCII only from here, so byte offsets are char boundaries
    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| -> anyhow::Result<u8> {
            let pair = std::str::from_utf8(pair)?;
            u8::from_str_radix(pair, 16).with_context(|| format!("invalid hex byte '{}'", pair))
        })
        .collect()
}

fn pick_source<'a>(
    sources: &'a HashMap<String, SourceHandle>,
    name: Option<&str>,
    mode: SourceMode,
) -> anyhow::Result<&'a SourceHandle> {
    let handle = match name {
        Some(name) => sources
            .get(name)
            .ok_or_else(|| anyhow!("No source named '{}'", name))?,
        None => {
            let mut names: Vec<_> = sources
                .iter()
                .filter(|(_, h)| h.mode() == mode)
                .map(|(n, _)| n)
                .collect();
            names.sort();
            let first = names
                .first()
                .ok_or_else(|| anyhow!("No {:?} source configured", mode))?;
            &sources[*first]
        }
    };

    if handle.mode() != mode {
        bail!("Source is {:?}, input needs {:?}", handle.mode(), mode);
    }
    Ok(handle)
}

/// Feed hex frames, one per line; blank lines and `#` comments are skipped
fn replay_frames(handle: &SourceHandle, input: impl BufRead) -> anyhow::Result<usize> {
    let mut sent = 0;
    for (lineno, line) in input.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_hex(line) {
            Ok(frame) => {
                handle.send_frame(&frame)?;
                sent += 1;
            }
            Err(e) => tracing::warn!(line = lineno + 1, "Skipping capture line: {}", e),
        }
    }
    Ok(sent)
}

fn print_sink(receiver: SinkReceiver) {
    let name = receiver.name().to_string();
    for batch in receiver.iter() {
        let line = SinkLine {
            sink: &batch.sink,
            frame_id: &batch.frame_id,
            timestamp: batch.timestamp,
            points: batch.points.iter().map(|p| p.as_ref()).collect(),
        };

        let mut out = io::stdout().lock();
        let written = serde_json::to_writer(&mut out, &line)
            .map_err(io::Error::from)
            .and_then(|_| writeln!(out));
        if let Err(e) = written {
            tracing::warn!(sink = %name, "Stopping sink output: {}", e);
            break;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.sample_config {
        GatewayConfig::sample().save(path)?;
        println!("Sample configuration written to {}", path.display());
        return Ok(());
    }

    let config_path = args.config.as_ref().context("--config is required")?;
    let config = GatewayConfig::load(config_path)?;
    let _guard = init_logging(&config.logging, args.log_level.as_deref())?;

    tracing::info!("Starting framegate with {}", config_path.display());

    let (pipeline, handles) = PipelineBuilder::new(config).build()?;
    let (sources, sinks) = handles.split();

    let printers: Vec<_> = sinks
        .into_values()
        .map(|receiver| std::thread::spawn(move || print_sink(receiver)))
        .collect();

    match &args.stream {
        Some(path) => {
            let handle = pick_source(&sources, args.source.as_deref(), SourceMode::Stream)?;
            let mut writer = handle
                .stream_writer()
                .context("Stream source has no writer")?;
            let mut file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
            let bytes = io::copy(&mut file, &mut writer)?;
            tracing::info!(bytes, "Stream replayed");
        }
        None => {
            let handle = pick_source(&sources, args.source.as_deref(), SourceMode::Frames)?;
            let sent = match &args.input {
                Some(path) => {
                    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
                    replay_frames(handle, BufReader::new(file))?
                }
                None => replay_frames(handle, io::stdin().lock())?,
            };
            tracing::info!(frames = sent, "Capture replayed");
        }
    }

    // Dropping every source handle lets the workers drain and stop
    drop(sources);
    let stats = pipeline.join();
    for printer in printers {
        let _ = printer.join();
    }

    tracing::info!(
        received = stats.frames_received,
        decoded = stats.frames_decoded,
        errors = stats.frames_errored,
        dropped = stats.frames_dropped,
        success_rate = format!("{:.1}%", stats.success_rate()),
        "Finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("01 02 aa FF").unwrap(), vec![0x01, 0x02, 0xAA, 0xFF]);
        assert_eq!(parse_hex("0x0102").unwrap(), vec![1, 2]);
        assert_eq!(parse_hex("de:ad").unwrap(), vec![0xDE, 0xAD]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_parse_hex_non_ascii() {
        let err = parse_hex("a\u{e9}b").unwrap_err();
        assert!(err.to_string().contains('\u{e9}'));
        assert!(parse_hex("\u{e9}\u{e9}").is_err());
        assert!(parse_hex("0１").is_err());
    }

    #[test]
    fn test_args_require_config() {
        assert!(Args::try_parse_from(["framegate"]).is_err());
        assert!(Args::try_parse_from(["framegate", "--sample-config", "out.toml"]).is_ok());
        assert!(Args::try_parse_from(["framegate", "-c", "g.toml", "-i", "a.hex", "-s", "b.bin"]).is_err());
    }
}
