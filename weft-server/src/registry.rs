//! Interleave Registry
//!
//! Maps source files onto interleave instances. Every source path is
//! matched against an ordered list of regular expressions: the index of the
//! first matching pattern is the source's stream index, and the pattern's
//! capture groups form the key of the interleave instance it feeds. An
//! instance is created on the first matching source and destroyed once all
//! of its sources have been removed.

use crate::sink::{InterleaveSink, SinkFactory};
use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use weft_io::{Clock, Timer};
use weft_protocol::{
    ControlMessage, EncoderConfig, EncoderStats, InterleaveEncoder, StreamIndex, MAX_DATA_STREAMS,
};

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid source pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("At least one source pattern is required")]
    NoPatterns,

    #[error("Too many source patterns (max {max}, got {actual})")]
    TooManyPatterns { max: usize, actual: usize },

    #[error("Source already registered: {0}")]
    DuplicateSource(String),

    #[error("Stream {stream} of interleave {key:?} already has an active source")]
    StreamBusy { key: String, stream: usize },

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Unknown interleave: {0:?}")]
    UnknownInterleave(String),

    #[error("Sink error: {0}")]
    Sink(#[from] std::io::Error),
}

/// Change notification for one source path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A new source file appeared
    Added { path: String },
    /// Bytes were appended to a source
    Data { path: String, data: Bytes },
    /// A source will not grow any further
    Finished { path: String },
    /// A source was deleted
    Removed { path: String },
}

/// Registry settings
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// One pattern per stream index, in order
    pub patterns: Vec<String>,
    pub encoder: EncoderConfig,
}

/// Statistics for one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStats {
    pub path: String,
    pub stream: usize,
    /// Payload bytes taken from the source
    pub bytes: u64,
    pub chunks: u64,
    pub finished: bool,
}

/// Statistics for one interleave instance
#[derive(Debug, Clone)]
pub struct InstanceStats {
    pub key: String,
    pub sources: Vec<SourceStats>,
    pub encoder: EncoderStats,
    /// Debug checksum, when enabled in the encoder config
    pub checksum: Option<u32>,
    /// Bytes handed to the sink
    pub bytes_written: u64,
    pub created_at: Duration,
}

/// Registry-wide statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub instances_created: u64,
    pub instances_destroyed: u64,
    /// Paths that matched no pattern
    pub ignored_sources: u64,
    pub bytes_written: u64,
    pub padding_bytes: u64,
}

struct Source {
    key: String,
    stream: StreamIndex,
    stats: SourceStats,
}

struct Instance {
    encoder: InterleaveEncoder,
    sink: Box<dyn InterleaveSink>,
    /// Registered paths by stream index
    sources: BTreeMap<usize, String>,
    bytes_written: u64,
    created_at: Duration,
    finished: bool,
}

impl Instance {
    fn write(&mut self, chunk: Bytes) -> Result<(), RegistryError> {
        self.bytes_written += chunk.len() as u64;
        self.sink.write(&chunk)?;
        Ok(())
    }
}

/// Encoder-side interleave registry
pub struct InterleaveRegistry<F: SinkFactory> {
    patterns: Vec<Regex>,
    encoder_config: EncoderConfig,
    factory: F,
    sources: HashMap<String, Source>,
    /// Paths that matched no pattern; their events are dropped
    ignored: HashSet<String>,
    instances: HashMap<String, Instance>,
    stats: RegistryStats,
}

impl<F: SinkFactory> InterleaveRegistry<F> {
    /// Compile `config.patterns` and create an empty registry
    pub fn new(config: RegistryConfig, factory: F) -> Result<Self, RegistryError> {
        if config.patterns.is_empty() {
            return Err(RegistryError::NoPatterns);
        }
        if config.patterns.len() > MAX_DATA_STREAMS {
            return Err(RegistryError::TooManyPatterns {
                max: MAX_DATA_STREAMS,
                actual: config.patterns.len(),
            });
        }

        let patterns = config
            .patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| RegistryError::Pattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(InterleaveRegistry {
            patterns,
            encoder_config: config.encoder,
            factory,
            sources: HashMap::new(),
            ignored: HashSet::new(),
            instances: HashMap::new(),
            stats: RegistryStats::default(),
        })
    }

    /// Stream index and instance key for `path`, if any pattern matches
    pub fn classify(&self, path: &str) -> Option<(usize, String)> {
        self.patterns.iter().enumerate().find_map(|(stream, re)| {
            let caps = re.captures(path)?;
            let key = caps
                .iter()
                .skip(1)
                .flatten()
                .map(|m| m.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            Some((stream, key))
        })
    }

    /// Apply one source event
    pub fn handle(&mut self, event: SourceEvent, now: Duration) -> Result<(), RegistryError> {
        match event {
            SourceEvent::Added { path } => self.add_source(path, now),
            SourceEvent::Data { path, data } => self.source_data(&path, data, now),
            SourceEvent::Finished { path } => self.finish_source(&path, now),
            SourceEvent::Removed { path } => self.remove_source(&path, now),
        }
    }

    fn add_source(&mut self, path: String, now: Duration) -> Result<(), RegistryError> {
        if self.sources.contains_key(&path) {
            return Err(RegistryError::DuplicateSource(path));
        }
        let Some((stream, key)) = self.classify(&path) else {
            tracing::debug!("Ignoring {}: no pattern matches", path);
            self.stats.ignored_sources += 1;
            self.ignored.insert(path);
            return Ok(());
        };

        if !self.instances.contains_key(&key) {
            let sink = self.factory.create(&key)?;
            tracing::info!("Created interleave {:?}", key);
            self.stats.instances_created += 1;
            self.instances.insert(
                key.clone(),
                Instance {
                    encoder: InterleaveEncoder::new(self.encoder_config),
                    sink,
                    sources: BTreeMap::new(),
                    bytes_written: 0,
                    created_at: now,
                    finished: false,
                },
            );
        }

        let instance = self
            .instances
            .get_mut(&key)
            .ok_or_else(|| RegistryError::UnknownInterleave(key.clone()))?;
        if let Some(busy) = instance.sources.get(&stream) {
            if self.sources.get(busy).is_some_and(|s| !s.stats.finished) {
                return Err(RegistryError::StreamBusy { key, stream });
            }
        }
        instance.sources.insert(stream, path.clone());
        if instance.finished {
            tracing::info!("Interleave {:?} resumed by {}", key, path);
            instance.finished = false;
            instance.encoder.resume();
        }

        tracing::debug!("Source {} -> interleave {:?} stream {}", path, key, stream);
        let stream_index = StreamIndex::data(stream)
            .map_err(|_| RegistryError::TooManyPatterns {
                max: MAX_DATA_STREAMS,
                actual: stream + 1,
            })?;
        self.sources.insert(
            path.clone(),
            Source {
                key,
                stream: stream_index,
                stats: SourceStats {
                    path,
                    stream,
                    bytes: 0,
                    chunks: 0,
                    finished: false,
                },
            },
        );
        Ok(())
    }

    fn source_data(&mut self, path: &str, data: Bytes, now: Duration) -> Result<(), RegistryError> {
        if data.is_empty() || self.ignored.contains(path) {
            return Ok(());
        }
        let source = self
            .sources
            .get_mut(path)
            .ok_or_else(|| RegistryError::UnknownSource(path.to_string()))?;
        if source.stats.finished {
            tracing::warn!("Dropping {} bytes written to finished source {}", data.len(), path);
            return Ok(());
        }
        let instance = self
            .instances
            .get_mut(&source.key)
            .ok_or_else(|| RegistryError::UnknownInterleave(source.key.clone()))?;

        source.stats.bytes += data.len() as u64;
        source.stats.chunks += 1;
        let chunk = instance.encoder.encode_data(source.stream, &data, now);
        self.stats.bytes_written += chunk.len() as u64;
        instance.write(chunk)
    }

    fn finish_source(&mut self, path: &str, now: Duration) -> Result<(), RegistryError> {
        if self.ignored.contains(path) {
            return Ok(());
        }
        let source = self
            .sources
            .get_mut(path)
            .ok_or_else(|| RegistryError::UnknownSource(path.to_string()))?;
        if source.stats.finished {
            return Ok(());
        }
        source.stats.finished = true;
        let key = source.key.clone();
        let stream = source.stream;

        let instance = self
            .instances
            .get_mut(&key)
            .ok_or_else(|| RegistryError::UnknownInterleave(key.clone()))?;
        let chunk = instance.encoder.encode_end_of_stream(stream, now);
        self.stats.bytes_written += chunk.len() as u64;
        instance.write(chunk)?;
        tracing::debug!("Source {} finished", path);

        let all_finished = instance
            .sources
            .values()
            .all(|p| self.sources.get(p).map_or(true, |s| s.stats.finished));
        if all_finished && !instance.finished {
            tracing::info!("Interleave {:?} drained", key);
            instance.finished = true;
            instance.encoder.finish();
            instance.sink.flush()?;
        }
        Ok(())
    }

    fn remove_source(&mut self, path: &str, now: Duration) -> Result<(), RegistryError> {
        if self.ignored.remove(path) {
            return Ok(());
        }
        if self.sources.get(path).is_some_and(|s| !s.stats.finished) {
            tracing::warn!("Source {} removed before finishing", path);
            self.finish_source(path, now)?;
        }
        let source = self
            .sources
            .remove(path)
            .ok_or_else(|| RegistryError::UnknownSource(path.to_string()))?;

        let Some(instance) = self.instances.get_mut(&source.key) else {
            return Ok(());
        };
        if instance.sources.get(&source.stats.stream).map(String::as_str) == Some(path) {
            instance.sources.remove(&source.stats.stream);
        }

        if instance.sources.is_empty() {
            if let Some(mut instance) = self.instances.remove(&source.key) {
                instance.sink.close()?;
                self.stats.instances_destroyed += 1;
                tracing::info!(
                    "Destroyed interleave {:?} after {} bytes",
                    source.key,
                    instance.bytes_written
                );
            }
        }
        Ok(())
    }

    /// Send a control message on the live interleave `key`
    pub fn send_control(
        &mut self,
        key: &str,
        message: &ControlMessage,
        now: Duration,
    ) -> Result<(), RegistryError> {
        let instance = self
            .instances
            .get_mut(key)
            .ok_or_else(|| RegistryError::UnknownInterleave(key.to_string()))?;
        let chunk = instance.encoder.encode_control(message, now);
        self.stats.bytes_written += chunk.len() as u64;
        instance.write(chunk)
    }

    /// Emit minimum-rate padding where needed
    pub fn tick(&mut self, now: Duration) -> Result<(), RegistryError> {
        for (key, instance) in self.instances.iter_mut() {
            if let Some(chunk) = instance.encoder.encode_padding(now) {
                tracing::trace!("Interleave {:?}: {} bytes of padding", key, chunk.len());
                self.stats.bytes_written += chunk.len() as u64;
                self.stats.padding_bytes += chunk.len() as u64;
                instance.write(chunk)?;
            }
        }
        Ok(())
    }

    /// Padding poll period, if padding is configured
    pub fn tick_period(&self) -> Option<Duration> {
        self.encoder_config
            .min_rate
            .map(|c| c.evaluation_period())
    }

    /// Process events until every sender is dropped
    ///
    /// Event errors are logged and do not stop the loop.
    pub fn run<C: Clock + ?Sized>(&mut self, events: Receiver<SourceEvent>, clock: &C) {
        // Without padding, wake rarely just to notice shutdown
        let period = self.tick_period().unwrap_or(Duration::from_secs(1));
        let mut timer = Timer::new(period, clock.now());

        loop {
            match events.recv_timeout(timer.time_until_expiration(clock.now())) {
                Ok(event) => {
                    if let Err(e) = self.handle(event, clock.now()) {
                        tracing::warn!("Source event failed: {}", e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = clock.now();
            if timer.try_fire(now) {
                if let Err(e) = self.tick(now) {
                    tracing::warn!("Padding failed: {}", e);
                }
            }
        }

        tracing::info!("Registry stopped with {} live interleaves", self.instances.len());
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn instance_stats(&self, key: &str) -> Option<InstanceStats> {
        let instance = self.instances.get(key)?;
        let sources = instance
            .sources
            .values()
            .filter_map(|p| self.sources.get(p))
            .map(|s| s.stats.clone())
            .collect();
        Some(InstanceStats {
            key: key.to_string(),
            sources,
            encoder: instance.encoder.stats(),
            checksum: instance.encoder.checksum(),
            bytes_written: instance.bytes_written,
            created_at: instance.created_at,
        })
    }

    /// Keys of live interleaves, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.instances.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> RegistryStats {
        self.stats.clone()
    }
}
