//! Deferred-flush writer for the READY handshake.
//!
//! Child output produced between PTY spawn and the controller's READY signal
//! must not be dropped, but must also not race ahead of the controller's
//! terminal initialization. The writer accumulates everything until it is
//! marked ready, flushes the backlog as one write, and is a plain
//! pass-through from then on.

use std::io;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::transport::OutputSink;

pub struct DeferredWriter<S> {
    sink: tokio::sync::Mutex<S>,
    /// `Some` while buffering; swapped to `None` exactly once at ready time.
    buffer: Mutex<Option<Vec<u8>>>,
    ready_at: Mutex<Option<Instant>>,
}

impl<S: OutputSink> DeferredWriter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
            buffer: Mutex::new(Some(Vec::new())),
            ready_at: Mutex::new(None),
        }
    }

    /// Appends to the backlog while buffering, otherwise forwards straight
    /// to the sink. Returns the number of bytes accepted.
    pub async fn write(&self, data: &[u8]) -> io::Result<usize> {
        {
            let mut buffer = self.buffer.lock();
            if let Some(buf) = buffer.as_mut() {
                buf.extend_from_slice(data);
                debug!(length = data.len(), buffered = buf.len(), "buffering write");
                return Ok(data.len());
            }
        }
        let mut sink = self.sink.lock().await;
        sink.send(data.to_vec()).await?;
        Ok(data.len())
    }

    /// Releases buffering and flushes the backlog as a single write.
    /// Idempotent: only the first call stamps the ready time and flushes;
    /// later calls write nothing and return 0.
    ///
    /// The sink lock is taken before the buffer is swapped out, so a
    /// concurrent `write` that observes the released state still queues
    /// behind the flush and cannot overtake it.
    pub async fn mark_ready(&self) -> io::Result<usize> {
        let mut sink = self.sink.lock().await;
        let taken = {
            let mut ready_at = self.ready_at.lock();
            if ready_at.is_none() {
                *ready_at = Some(Instant::now());
            }
            self.buffer.lock().take()
        };
        match taken {
            Some(buf) if !buf.is_empty() => {
                let flushed = buf.len();
                sink.send(buf).await?;
                Ok(flushed)
            }
            _ => Ok(0),
        }
    }

    /// Time since the first `mark_ready`, if it happened.
    pub fn ready_elapsed(&self) -> Option<Duration> {
        self.ready_at.lock().map(|at| at.elapsed())
    }
}
