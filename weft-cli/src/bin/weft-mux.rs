//! Weft Mux - source files to interleaves
//!
//! Matches each input path against the configured patterns and writes one
//! interleave file per capture-group key, reading the inputs at a live-like
//! pace so timestamps and padding behave as they would on a real encoder.

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use crossbeam::channel;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use weft_cli::{display_registry_stats, init_logging, Config, MuxConfig};
use weft_io::{Clock, RateLimiter, SystemClock};
use weft_server::{FileSink, InterleaveRegistry, SourceEvent};

#[derive(Parser, Debug)]
#[command(name = "weft-mux")]
#[command(about = "Interleave source files into Weft segments", long_about = None)]
struct Args {
    /// Source files
    inputs: Vec<PathBuf>,

    /// Configuration file with a [mux] section
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source pattern, one per stream index (overrides the config file)
    #[arg(short, long)]
    pattern: Vec<String>,

    /// Output directory
    #[arg(short, long)]
    output_dir: Option<String>,

    /// Pace each source to this many bytes per second
    #[arg(long)]
    pace: Option<u64>,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

struct Input {
    path: String,
    reader: BufReader<File>,
    limiter: Option<RateLimiter>,
    done: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.example_config {
        print!("{}", toml::to_string_pretty(&Config::example_mux())?);
        return Ok(());
    }

    init_logging(args.verbose);

    let mut mux = match &args.config {
        Some(path) => Config::from_file(path)?
            .mux
            .with_context(|| format!("{} has no [mux] section", path.display()))?,
        None => MuxConfig::default(),
    };
    if !args.pattern.is_empty() {
        mux.patterns = args.pattern.clone();
    }
    if let Some(dir) = args.output_dir {
        mux.output_dir = dir;
    }
    if args.pace.is_some() {
        mux.pace_bytes_per_sec = args.pace;
    }
    if args.inputs.is_empty() {
        anyhow::bail!("No input files given");
    }

    std::fs::create_dir_all(&mux.output_dir)
        .with_context(|| format!("Failed to create {}", mux.output_dir))?;
    let factory = FileSink::factory(mux.output_dir.clone(), mux.prefix.clone());
    let mut registry = InterleaveRegistry::new(mux.registry_config()?, factory)?;

    let clock = SystemClock::new();
    let (tx, rx) = channel::bounded(1024);
    let registry_thread = thread::spawn(move || {
        registry.run(rx, &clock);
        registry
    });

    let clock = SystemClock::new();
    let mut inputs = Vec::new();
    for path in &args.inputs {
        let file = File::open(path)
            .with_context(|| format!("Failed to open input '{}'", path.display()))?;
        let path = path.display().to_string();
        tracing::info!("Reading {}", path);
        tx.send(SourceEvent::Added { path: path.clone() })?;
        inputs.push(Input {
            path,
            reader: BufReader::new(file),
            limiter: mux
                .pace_bytes_per_sec
                .map(|rate| RateLimiter::new(rate, mux.read_size as u64 * 4, clock.now())),
            done: false,
        });
    }

    let mut buffer = vec![0u8; mux.read_size];
    while inputs.iter().any(|i| !i.done) {
        let mut wait = Duration::from_millis(50);
        let mut progressed = false;

        for input in inputs.iter_mut().filter(|i| !i.done) {
            if let Some(limiter) = input.limiter.as_mut() {
                let until = limiter.time_to_available(buffer.len(), clock.now());
                if !until.is_zero() {
                    wait = wait.min(until);
                    continue;
                }
            }

            let n = input.reader.read(&mut buffer)?;
            progressed = true;
            if n == 0 {
                tracing::info!("Finished {}", input.path);
                input.done = true;
                tx.send(SourceEvent::Finished {
                    path: input.path.clone(),
                })?;
                continue;
            }

            if let Some(limiter) = input.limiter.as_mut() {
                limiter.consume(n, clock.now());
            }
            tx.send(SourceEvent::Data {
                path: input.path.clone(),
                data: Bytes::copy_from_slice(&buffer[..n]),
            })?;
        }

        if !progressed {
            thread::sleep(wait);
        }
    }

    drop(tx);
    let registry = registry_thread
        .join()
        .map_err(|_| anyhow::anyhow!("Registry thread panicked"))?;

    let instances: Vec<_> = registry
        .keys()
        .iter()
        .filter_map(|key| registry.instance_stats(key))
        .collect();
    display_registry_stats(&registry.stats(), &instances);

    Ok(())
}
