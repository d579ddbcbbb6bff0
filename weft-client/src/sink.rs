//! Routing decoded interleave events into segment queues

use crate::scheduler::SchedulerEvent;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use weft_protocol::{
    AppendBuffer, ControlMessage, InterleaveHandler, SegmentBufferQueue, StreamIndex,
    TimestampInfo,
};

/// Append buffer as stored in a shared queue
pub type BoxedAppendBuffer = Box<dyn AppendBuffer + Send>;

/// Queue shared between the scheduler's fetch tasks and the session
pub type SharedQueue = Arc<Mutex<SegmentBufferQueue<BoxedAppendBuffer>>>;

/// Wrap an append buffer in a shared queue
pub fn shared_queue<B>(buffer: B, segment_duration: std::time::Duration) -> SharedQueue
where
    B: AppendBuffer + Send + 'static,
{
    Arc::new(Mutex::new(SegmentBufferQueue::new(
        Box::new(buffer) as BoxedAppendBuffer,
        segment_duration,
    )))
}

/// Interleave handler for one segment
///
/// Sub-stream `i` of the interleave feeds `queues[i]`; timing and control
/// events go upward to the scheduler's consumer.
pub struct SegmentSink<'a> {
    index: u64,
    queues: &'a [SharedQueue],
    events: &'a mpsc::UnboundedSender<SchedulerEvent>,
    /// Streams with no queue, already warned about
    unrouted: u32,
}

impl<'a> SegmentSink<'a> {
    pub fn new(
        index: u64,
        queues: &'a [SharedQueue],
        events: &'a mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        SegmentSink {
            index,
            queues,
            events,
            unrouted: 0,
        }
    }

    fn queue(&mut self, stream: StreamIndex) -> Option<&'a SharedQueue> {
        let queues: &'a [SharedQueue] = self.queues;
        let queue = queues.get(stream.as_usize());
        if queue.is_none() && self.unrouted & (1 << stream.as_u8()) == 0 {
            self.unrouted |= 1 << stream.as_u8();
            tracing::warn!(
                "Segment {}: no queue for sub-stream {}, dropping its data",
                self.index,
                stream
            );
        }
        queue
    }
}

impl InterleaveHandler for SegmentSink<'_> {
    fn on_data(&mut self, stream: StreamIndex, data: Bytes) {
        let index = self.index;
        if let Some(queue) = self.queue(stream) {
            queue.lock().accept_data(data, index);
        }
    }

    fn on_end_of_stream(&mut self, stream: StreamIndex) {
        let index = self.index;
        if let Some(queue) = self.queue(stream) {
            queue.lock().end_segment(index);
        }
    }

    fn on_timestamp(&mut self, info: TimestampInfo) {
        let _ = self.events.send(SchedulerEvent::Timestamp(info));
    }

    fn on_control(&mut self, message: ControlMessage) {
        let _ = self.events.send(SchedulerEvent::Control(message));
    }
}

/// Feed every queue's append buffer, reporting applied segments
pub fn drain_all(queues: &[SharedQueue], events: &mpsc::UnboundedSender<SchedulerEvent>) {
    for (stream, queue) in queues.iter().enumerate() {
        let result = queue.lock().drain();
        match result {
            Ok(applied) => {
                for applied in applied {
                    let _ = events.send(SchedulerEvent::SegmentApplied { stream, applied });
                }
            }
            Err(e) => tracing::warn!("Queue {}: append failed: {}", stream, e),
        }
    }
}
