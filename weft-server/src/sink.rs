//! Interleave outputs
//!
//! Each interleave instance writes its framed bytes to an
//! [`InterleaveSink`] obtained from a [`SinkFactory`] when the instance is
//! created.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Appendable, finishable byte sink for one interleave
pub trait InterleaveSink: Send {
    fn write(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Push buffered bytes to the underlying storage
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// No more bytes will be written
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Creates the sink for a newly created interleave
pub trait SinkFactory {
    fn create(&mut self, key: &str) -> io::Result<Box<dyn InterleaveSink>>;
}

impl<F> SinkFactory for F
where
    F: FnMut(&str) -> io::Result<Box<dyn InterleaveSink>>,
{
    fn create(&mut self, key: &str) -> io::Result<Box<dyn InterleaveSink>> {
        self(key)
    }
}

/// Sink writing to a local file
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = BufWriter::new(File::create(&path)?);
        Ok(FileSink { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Factory writing `{dir}/{prefix}{key}`, with whitespace in keys
    /// replaced by `_`
    pub fn factory(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
    ) -> impl FnMut(&str) -> io::Result<Box<dyn InterleaveSink>> {
        let dir = dir.into();
        let prefix = prefix.into();
        move |key: &str| {
            let name: String = key
                .chars()
                .map(|c| if c.is_whitespace() { '_' } else { c })
                .collect();
            let path = dir.join(format!("{}{}", prefix, name));
            tracing::debug!("Writing interleave {:?} to {}", key, path.display());
            Ok(Box::new(FileSink::create(path)?) as Box<dyn InterleaveSink>)
        }
    }
}

impl InterleaveSink for FileSink {
    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.writer.write_all(chunk)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[derive(Debug, Default)]
struct MemoryOutput {
    bytes: Vec<u8>,
    closed: bool,
}

/// Shared view of everything written to memory sinks, by key
#[derive(Debug, Clone, Default)]
pub struct MemoryOutputs {
    inner: Arc<Mutex<HashMap<String, MemoryOutput>>>,
}

impl MemoryOutputs {
    /// Bytes written for `key` so far
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().get(key).map(|o| o.bytes.clone())
    }

    pub fn is_closed(&self, key: &str) -> bool {
        self.inner.lock().get(key).is_some_and(|o| o.closed)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.inner.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// In-memory sink, for tests and tools
pub struct MemorySink {
    key: String,
    outputs: MemoryOutputs,
}

impl MemorySink {
    pub fn factory() -> MemorySinkFactory {
        MemorySinkFactory::default()
    }
}

impl InterleaveSink for MemorySink {
    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        let mut outputs = self.outputs.inner.lock();
        outputs
            .entry(self.key.clone())
            .or_default()
            .bytes
            .extend_from_slice(chunk);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.outputs
            .inner
            .lock()
            .entry(self.key.clone())
            .or_default()
            .closed = true;
        Ok(())
    }
}

/// Factory for [`MemorySink`]s sharing one [`MemoryOutputs`]
#[derive(Debug, Clone, Default)]
pub struct MemorySinkFactory {
    outputs: MemoryOutputs,
}

impl MemorySinkFactory {
    pub fn outputs(&self) -> MemoryOutputs {
        self.outputs.clone()
    }
}

impl SinkFactory for MemorySinkFactory {
    fn create(&mut self, key: &str) -> io::Result<Box<dyn InterleaveSink>> {
        let mut outputs = self.outputs.inner.lock();
        // A re-created key starts over
        outputs.insert(key.to_string(), MemoryOutput::default());
        Ok(Box::new(MemorySink {
            key: key.to_string(),
            outputs: self.outputs.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink() {
        let mut factory = MemorySink::factory();
        let outputs = factory.outputs();

        let mut sink = factory.create("a").unwrap();
        sink.write(b"12").unwrap();
        sink.write(b"3").unwrap();
        assert_eq!(outputs.get("a"), Some(b"123".to_vec()));
        assert!(!outputs.is_closed("a"));

        sink.close().unwrap();
        assert!(outputs.is_closed("a"));
        assert_eq!(outputs.get("b"), None);
    }

    #[test]
    fn test_file_sink_factory() {
        let dir = std::env::temp_dir().join(format!("weft-sink-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut factory = FileSink::factory(&dir, "interleaved");
        let mut sink = factory.create("angle 2").unwrap();
        sink.write(b"chunk").unwrap();
        sink.close().unwrap();

        let written = std::fs::read(dir.join("interleavedangle_2")).unwrap();
        assert_eq!(written, b"chunk");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
