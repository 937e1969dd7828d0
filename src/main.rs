use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use autocut::batch::{self, BatchOptions};
use autocut::Engine;

/// Cut intro/outro regions out of broadcast MP3 recordings by locating
/// marker clips in the audio.
#[derive(Parser, Debug)]
#[command(name = "autocut", version, about)]
struct Cli {
    /// MP3 files to process
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Directory holding marker clips (<key>start.mp3, <key>end.mp3) and
    /// their compiled .pattern caches
    #[arg(short, long, default_value = "markers")]
    markers: PathBuf,

    /// Write the kept region of each file here; without it, cut points are
    /// only reported
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Cap the worker thread count
    #[arg(long)]
    max_threads: Option<usize>,

    /// Print stream structure (bitrate, VBR data, duration) instead of
    /// searching for cut points
    #[arg(long)]
    info: bool,

    /// Emit reports as JSON lines
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(failed) if failed == 0 => ExitCode::SUCCESS,
        Ok(failed) => {
            eprintln!("{failed} file(s) failed");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<usize> {
    let engine = Arc::new(Engine::new(&cli.markers));

    if cli.info {
        let mut failed = 0;
        for path in &cli.files {
            let data = std::fs::read(path)
                .with_context(|| format!("reading {}", path.display()))?;
            match engine.stream_info(&data) {
                Ok(info) => println!("{}: {info}", path.display()),
                Err(err) => {
                    eprintln!("{}: {err}", path.display());
                    failed += 1;
                }
            }
        }
        return Ok(failed);
    }

    let options = BatchOptions {
        max_threads: cli.max_threads,
    };
    let outcomes = batch::run(engine, cli.files, cli.output_dir, &options)?;

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.report {
            Ok(report) if cli.json => {
                println!("{}", serde_json::to_string(report)?);
            }
            Ok(report) => {
                let start = report.start_s.map_or_else(|| "-".into(), fmt_secs);
                let end = report.end_s.map_or_else(|| "-".into(), fmt_secs);
                println!(
                    "{} {start} {end} bytes {}..{}{}",
                    report.file.display(),
                    report.start_byte,
                    report.end_byte,
                    if report.found { "" } else { " (no cut points)" }
                );
            }
            Err(err) => {
                eprintln!("{}: {err}", outcome.path.display());
                failed += 1;
            }
        }
    }
    Ok(failed)
}

fn fmt_secs(secs: f64) -> String {
    let minutes = (secs / 60.0) as u64;
    format!("{minutes}:{:04.1}", secs - minutes as f64 * 60.0)
}
