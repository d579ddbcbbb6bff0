//! Statistics display and formatting

use std::time::Duration;
use weft_protocol::{CatchUpStats, DecoderStats, NetworkStats, TickReport};
use weft_server::{InstanceStats, RegistryStats};

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format bandwidth in human-readable form
pub fn format_bandwidth(bps: u64) -> String {
    const KBPS: u64 = 1000;
    const MBPS: u64 = KBPS * 1000;
    const GBPS: u64 = MBPS * 1000;

    if bps >= GBPS {
        format!("{:.2} Gbps", bps as f64 / GBPS as f64)
    } else if bps >= MBPS {
        format!("{:.2} Mbps", bps as f64 / MBPS as f64)
    } else if bps >= KBPS {
        format!("{:.2} Kbps", bps as f64 / KBPS as f64)
    } else {
        format!("{} bps", bps)
    }
}

/// Format a delay in milliseconds
pub fn format_ms(ms: f64) -> String {
    if ms.abs() >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else {
        format!("{:.0}ms", ms)
    }
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Display registry statistics
pub fn display_registry_stats(stats: &RegistryStats, instances: &[InstanceStats]) {
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ INTERLEAVE STATISTICS                                       │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ Interleaves: {} created / {} destroyed",
        stats.instances_created, stats.instances_destroyed
    );
    println!("│ Ignored sources: {}", stats.ignored_sources);
    println!(
        "│ Written: {} ({} padding)",
        format_bytes(stats.bytes_written),
        format_bytes(stats.padding_bytes)
    );
    println!("└─────────────────────────────────────────────────────────────┘");

    for instance in instances {
        println!(
            "  [{}] {} chunks, {} timestamps, {} written",
            instance.key,
            instance.encoder.chunks,
            instance.encoder.timestamps,
            format_bytes(instance.bytes_written)
        );
        if let Some(checksum) = instance.checksum {
            println!("    checksum {:08x}", checksum);
        }
        for source in &instance.sources {
            println!(
                "    stream {:2}: {} in {} reads{} ({})",
                source.stream,
                format_bytes(source.bytes),
                source.chunks,
                if source.finished { ", finished" } else { "" },
                source.path
            );
        }
    }
}

/// Display decoder statistics
pub fn display_decoder_stats(stats: &DecoderStats, checksum: Option<u32>) {
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ DECODER STATISTICS                                          │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ Input:      {}", format_bytes(stats.bytes));
    println!("│ Chunks:     {}", stats.chunks);
    println!("│ Timestamps: {}", stats.timestamps);
    println!("│ Control:    {} ({} discarded)", stats.control_messages, stats.discarded);
    if stats.oversized_control > 0 {
        println!("│ Oversized:  {} control chunks skipped", stats.oversized_control);
    }
    if let Some(checksum) = checksum {
        println!("│ Checksum:   {:08x}", checksum);
    }
    println!("└─────────────────────────────────────────────────────────────┘");
}

/// Display delay statistics and catch-up counts
pub fn display_network_stats(stats: &NetworkStats, target: Duration, catch_ups: &CatchUpStats) {
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ NETWORK STATISTICS                                          │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ Samples: {} over {}",
        stats.count,
        format_duration(stats.span)
    );
    println!(
        "│ Delay:   min {} / median {} / max {}",
        format_ms(stats.min),
        format_ms(stats.median),
        format_ms(stats.max)
    );
    println!(
        "│ Spread:  p10 {} / p90 {} / σ {}",
        format_ms(stats.p10),
        format_ms(stats.p90),
        format_ms(stats.std_dev)
    );
    println!("│ Target buffer: {}", format_ms(target.as_secs_f64() * 1000.0));
    println!(
        "│ Catch-ups: {} ({:.2}/min)",
        catch_ups.count, catch_ups.per_minute
    );
    println!("└─────────────────────────────────────────────────────────────┘");
}

/// One-line tick summary (for continuous updates)
pub fn format_tick(report: &TickReport) -> String {
    format!(
        "[{:>8}] buffer {:.2}s / target {} | {} samples | {:?}",
        format_duration(report.now),
        report.buffer_length,
        format_ms(report.target.as_secs_f64() * 1000.0),
        report.samples,
        report.action
    )
}
