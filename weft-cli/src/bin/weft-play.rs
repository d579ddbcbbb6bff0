//! Weft Play - headless live player
//!
//! Follows a live stream over HTTP, writes each received stream to a file
//! and runs buffer control against a simulated playback clock, printing the
//! controller's view of the buffer as it goes.

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use weft_cli::{
    display_network_stats, format_bandwidth, format_bytes, format_tick, init_logging,
    ClientConfig, Config, FileAppendBuffer, SimulatedPlayer,
};
use weft_client::{shared_queue, Session, SessionEvent};
use weft_io::{Clock, HttpClient, Net, NetOptions, TokioClock};
use weft_protocol::BufferParams;

#[derive(Parser, Debug)]
#[command(name = "weft-play")]
#[command(about = "Headless Weft live player", long_about = None)]
struct Args {
    /// Configuration file with a [client] section
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory URL holding the stream files
    #[arg(short, long)]
    base_url: Option<String>,

    /// Stream number in file names
    #[arg(short, long, default_value = "0")]
    stream: u32,

    /// Fetch interleaved segments
    #[arg(short, long)]
    interleaved: bool,

    /// Streams carried by the interleave
    #[arg(long, default_value = "1")]
    streams: usize,

    /// Output directory for received media
    #[arg(short, long)]
    output_dir: Option<String>,

    /// URL of the buffer parameters JSON
    #[arg(long)]
    params_url: Option<String>,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn client_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?
            .client
            .with_context(|| format!("{} has no [client] section", path.display()))?,
        None => {
            let base_url = args
                .base_url
                .clone()
                .context("Either --config or --base-url is required")?;
            let mut config = Config::example_client()
                .client
                .context("example client configuration")?;
            config.base_url = base_url;
            config.stream = args.stream;
            config.interleaved = args.interleaved;
            config.streams = args.streams;
            config.output_dir = ".".to_string();
            config
        }
    };

    if args.config.is_some() {
        if let Some(base_url) = &args.base_url {
            config.base_url = base_url.clone();
        }
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if args.params_url.is_some() {
        config.params_url = args.params_url.clone();
    }
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.example_config {
        print!("{}", toml::to_string_pretty(&Config::example_client())?);
        return Ok(());
    }

    init_logging(args.verbose);

    let client = client_config(&args)?;
    let mut session_config = client.session_config()?;
    tracing::info!("Playing {}", session_config.scheduler.base_url);

    let net: Arc<dyn Net> = Arc::new(HttpClient::new(NetOptions::default())?);

    if let Some(params_url) = &client.params_url {
        let url = url::Url::parse(params_url)?;
        let body = net
            .get_bytes(url)
            .await
            .with_context(|| format!("Failed to fetch buffer parameters from {}", params_url))?;
        session_config.params = BufferParams::from_json(&body)?;
        tracing::info!("Buffer parameters: {:?}", session_config.params);
    }

    let dir = Path::new(&client.output_dir);
    std::fs::create_dir_all(dir)?;
    let mut queues = Vec::with_capacity(client.streams);
    for stream in 0..client.streams {
        let path = dir.join(format!("received{}.bin", stream));
        let buffer = FileAppendBuffer::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        queues.push(shared_queue(buffer, client.segment_duration()));
    }

    let player = SimulatedPlayer::new(TokioClock::new(), client.segment_duration());
    let (mut session, mut events) =
        Session::new(net, session_config, queues, player.clone())?;

    if let Some(secs) = args.duration {
        let cancel = session.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            cancel.cancel();
        });
    }

    let started = Instant::now();
    let stats_interval = client.stats_interval();
    let mut last_stats = Instant::now();
    let mut received = 0u64;
    let mut downgrades = 0u64;

    let result = {
        let run = session.run();
        tokio::pin!(run);
        loop {
            tokio::select! {
                result = &mut run => break result,
                Some(event) = events.recv() => match event {
                    SessionEvent::SegmentApplied { stream, applied } => {
                        tracing::debug!("Stream {}: segment {} applied", stream, applied.index);
                        received += 1;
                        if stream == 0 {
                            player.segment_applied();
                        }
                    }
                    SessionEvent::Tick(report) => {
                        if last_stats.elapsed() >= stats_interval {
                            last_stats = Instant::now();
                            println!("{}", format_tick(&report));
                        }
                    }
                    SessionEvent::Downgrade(reason) => {
                        downgrades += 1;
                        tracing::warn!("Downgrade recommended: {:?}", reason);
                    }
                    SessionEvent::SegmentFailed { index, error } => {
                        tracing::warn!("Segment {} failed: {}", index, error);
                    }
                    SessionEvent::Control(message) => {
                        tracing::info!("Control: {:?}", message);
                    }
                },
            }
        }
    };

    match result {
        Ok(()) | Err(weft_client::ClientError::Cancelled) => {}
        Err(e) => return Err(e.into()),
    }

    let control = session.control();
    let network = control.network_stats();
    let target = control.target();
    let catch_ups = control.catch_up_stats(session.clock().now());
    // Flushes the received media files
    drop(session);

    println!(
        "\n{} segments applied, {} seeks, {} stalls, {} downgrades",
        received,
        player.seeks(),
        player.stalls(),
        downgrades
    );
    let mut total = 0u64;
    for stream in 0..client.streams {
        let path = dir.join(format!("received{}.bin", stream));
        if let Ok(meta) = std::fs::metadata(&path) {
            total += meta.len();
            println!("  {}: {}", path.display(), format_bytes(meta.len()));
        }
    }
    let elapsed = started.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        println!(
            "  average {}",
            format_bandwidth((total as f64 * 8.0 / elapsed) as u64)
        );
    }
    display_network_stats(&network, target, &catch_ups);

    Ok(())
}
