//! Weft Demux - split an interleave file into its streams
//!
//! Writes every data stream to `stream{N}.bin` in the output directory and
//! logs the timestamps and control messages found along the way.

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::time::Instant;
use weft_cli::{display_decoder_stats, format_bytes, init_logging};
use weft_protocol::{
    ControlMessage, DEFAULT_MAX_CONTROL_LEN, InterleaveDecoder, InterleaveHandler, StreamIndex, TimestampInfo,
};

#[derive(Parser, Debug)]
#[command(name = "weft-demux")]
#[command(about = "Split a Weft interleave into its streams", long_about = None)]
struct Args {
    /// Interleave file
    input: PathBuf,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Print a checksum of the input
    #[arg(long)]
    checksum: bool,

    /// Bytes fed to the decoder at a time
    #[arg(long, default_value = "65536")]
    read_size: usize,

    /// Skip control chunks larger than this many bytes
    #[arg(long, default_value_t = DEFAULT_MAX_CONTROL_LEN)]
    max_control_len: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

struct StreamWriter {
    writer: BufWriter<File>,
    bytes: u64,
    ended: bool,
}

struct Demux {
    dir: PathBuf,
    streams: HashMap<StreamIndex, StreamWriter>,
    /// First write failure; decoding continues but the run fails
    error: Option<io::Error>,
}

impl Demux {
    fn stream(&mut self, stream: StreamIndex) -> io::Result<&mut StreamWriter> {
        if !self.streams.contains_key(&stream) {
            let path = self.dir.join(format!("stream{}.bin", stream.as_u8()));
            tracing::info!("Stream {} -> {}", stream, path.display());
            let writer = BufWriter::new(File::create(path)?);
            self.streams.insert(
                stream,
                StreamWriter {
                    writer,
                    bytes: 0,
                    ended: false,
                },
            );
        }
        self.streams
            .get_mut(&stream)
            .ok_or_else(|| io::Error::other("stream writer missing"))
    }

    fn fail(&mut self, e: io::Error) {
        if self.error.is_none() {
            tracing::error!("Write failed: {}", e);
            self.error = Some(e);
        }
    }

    fn finish(mut self) -> anyhow::Result<Vec<(StreamIndex, u64, bool)>> {
        if let Some(e) = self.error.take() {
            return Err(e.into());
        }
        let mut summary = Vec::new();
        for (stream, mut writer) in self.streams {
            writer.writer.flush()?;
            summary.push((stream, writer.bytes, writer.ended));
        }
        summary.sort();
        Ok(summary)
    }
}

impl InterleaveHandler for Demux {
    fn on_data(&mut self, stream: StreamIndex, data: Bytes) {
        let result = self.stream(stream).and_then(|w| {
            w.bytes += data.len() as u64;
            w.writer.write_all(&data)
        });
        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn on_end_of_stream(&mut self, stream: StreamIndex) {
        tracing::info!("Stream {} ended", stream);
        match self.stream(stream) {
            Ok(w) => w.ended = true,
            Err(e) => self.fail(e),
        }
    }

    fn on_timestamp(&mut self, info: TimestampInfo) {
        tracing::debug!(
            "Timestamp sent={}ms delay={}ms{}",
            info.sent_ms,
            info.delay_ms(),
            if info.first_for_interleave { " (first)" } else { "" }
        );
    }

    fn on_control(&mut self, message: ControlMessage) {
        tracing::info!("Control {:?}: {:?}", message.control_type(), message);
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.read_size == 0 {
        anyhow::bail!("read-size must be positive");
    }

    let mut input = File::open(&args.input)
        .with_context(|| format!("Failed to open input '{}'", args.input.display()))?;
    std::fs::create_dir_all(&args.output_dir)?;

    let mut decoder = InterleaveDecoder::new().with_max_control_len(args.max_control_len);
    if args.checksum {
        decoder = decoder.with_checksum();
    }
    let mut demux = Demux {
        dir: args.output_dir.clone(),
        streams: HashMap::new(),
        error: None,
    };

    // Arrival times are relative to the start of the run
    let start = Instant::now();
    let mut buffer = vec![0u8; args.read_size];
    loop {
        let n = input.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        decoder.feed(
            Bytes::copy_from_slice(&buffer[..n]),
            start.elapsed(),
            &mut demux,
        );
    }

    if !decoder.is_at_boundary() {
        tracing::warn!("Input ends inside a chunk");
    }

    for (stream, bytes, ended) in demux.finish()? {
        println!(
            "stream {:2}: {}{}",
            stream.as_u8(),
            format_bytes(bytes),
            if ended { " (ended)" } else { "" }
        );
    }
    display_decoder_stats(&decoder.stats(), decoder.checksum());

    Ok(())
}
