//! In-memory origin, append buffer and player for client tests

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use weft_io::{ByteStream, Net, NetError};
use weft_protocol::{AppendBuffer, AppendError, PlaybackClock, TimeRange};

/// One canned response
#[derive(Clone, Default)]
pub struct Canned {
    pub parts: Vec<Bytes>,
    /// Delay before response headers
    pub header_delay: Duration,
    /// Delay before each body part
    pub part_delay: Duration,
}

impl Canned {
    pub fn body(data: impl Into<Bytes>) -> Self {
        Canned {
            parts: vec![data.into()],
            ..Default::default()
        }
    }
}

/// Origin serving canned bodies by URL path; anything else is a 404
#[derive(Clone, Default)]
pub struct FakeNet {
    routes: Arc<Mutex<HashMap<String, Canned>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeNet {
    pub fn serve(&self, path: &str, response: Canned) {
        self.routes.lock().insert(path.to_string(), response);
    }

    pub fn descriptor(&self, path: &str, index: u64, age_ms: f64) {
        let json = format!("{{\"index\":{},\"age\":{}}}", index, age_ms);
        self.serve(path, Canned::body(json));
    }

    /// Paths requested so far
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self, path: &str) -> usize {
        self.requests.lock().iter().filter(|p| *p == path).count()
    }
}

#[async_trait]
impl Net for FakeNet {
    async fn stream(&self, url: Url) -> Result<ByteStream, NetError> {
        let path = url.path().to_string();
        self.requests.lock().push(path.clone());

        let canned = self.routes.lock().get(&path).cloned();
        let Some(canned) = canned else {
            return Err(NetError::HttpStatus {
                status: 404,
                url: url.to_string(),
            });
        };

        tokio::time::sleep(canned.header_delay).await;
        let part_delay = canned.part_delay;
        let body = stream::unfold(canned.parts.into_iter(), move |mut parts| async move {
            let part = parts.next()?;
            tokio::time::sleep(part_delay).await;
            Some((Ok::<_, NetError>(part), parts))
        });
        Ok(Box::pin(body))
    }
}

/// Append buffer that records appends and reports one second per segment
#[derive(Clone, Default)]
pub struct RecordingBuffer {
    pub appended: Arc<Mutex<Vec<Bytes>>>,
}

impl RecordingBuffer {
    pub fn bytes(&self) -> Vec<u8> {
        self.appended.lock().iter().flat_map(|b| b.to_vec()).collect()
    }
}

impl AppendBuffer for RecordingBuffer {
    fn is_updating(&self) -> bool {
        false
    }

    fn append(&mut self, data: Bytes) -> Result<(), AppendError> {
        self.appended.lock().push(data);
        Ok(())
    }

    fn buffered(&self) -> Option<TimeRange> {
        None
    }

    fn remove(&mut self, _start: f64, _end: f64) -> Result<(), AppendError> {
        Ok(())
    }
}

/// Player with a fixed playhead and no media
#[derive(Debug, Default)]
pub struct IdlePlayer {
    pub seeks: Vec<f64>,
}

impl PlaybackClock for IdlePlayer {
    fn current_time(&self) -> f64 {
        0.0
    }

    fn buffered(&self) -> Option<TimeRange> {
        None
    }

    fn seekable(&self) -> Option<TimeRange> {
        None
    }

    fn seek(&mut self, to: f64) {
        self.seeks.push(to);
    }
}
