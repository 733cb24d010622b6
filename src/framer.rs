//! Newline framing for inbound byte streams.
//!
//! `LineFramer` turns arbitrarily chunked bytes into a FIFO of completed
//! lines. It performs no I/O: whatever reads the socket hands each chunk to
//! [`LineFramer::feed`] and the framer only tracks state.
//!
//! The newline byte terminates a line and is never part of it. Bytes after
//! the last newline stay pending until the next one arrives; if the stream
//! ends first they are discarded along with the framer.

use bytes::BytesMut;
use std::collections::VecDeque;

/// Initial capacity for the pending-line accumulator
const PENDING_CAPACITY: usize = 256;

/// Stateful byte-stream splitter.
#[derive(Debug)]
pub struct LineFramer {
    /// Bytes received since the last newline.
    pending: BytesMut,
    /// Lines terminated but not yet taken.
    completed: VecDeque<String>,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self {
            pending: BytesMut::with_capacity(PENDING_CAPACITY),
            completed: VecDeque::new(),
        }
    }

    /// Consume a chunk of inbound bytes.
    ///
    /// Splitting is identical no matter how the stream is chunked. Pending
    /// content is held as raw bytes, so a UTF-8 sequence split across two
    /// chunks decodes correctly once its line completes.
    pub fn feed(&mut self, chunk: &[u8]) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            let line = self.pending.split();
            self.completed
                .push_back(String::from_utf8_lossy(&line).into_owned());
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
    }

    /// Take the oldest completed line.
    pub fn next_line(&mut self) -> Option<String> {
        self.completed.pop_front()
    }

    /// Put a line back at the head of the queue.
    ///
    /// Used when the consumer a line was popped for has gone away, so the
    /// next consumer still sees lines in arrival order.
    pub fn requeue_front(&mut self, line: String) {
        self.completed.push_front(line);
    }

    /// Number of completed lines waiting to be taken.
    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Number of bytes accumulated for the unfinished line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop all buffered state.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.completed.clear();
    }
}
