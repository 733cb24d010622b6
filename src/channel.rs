//! Request/response coordination for one connection.
//!
//! A `RequestChannel` owns the write side of a transport and the line queue
//! of its read side. Inbound bytes arrive through an [`Inbound`] handle,
//! usually driven by [`Inbound::pump`] on a dedicated task, and completed
//! lines are handed to `read_line` callers strictly in the order those
//! callers registered.
//!
//! The channel does not correlate commands with responses. Pairing is
//! correct only because the server answers one line per command, in the
//! order the commands were received.

use crate::error::{HarnessError, Result};
use crate::framer::LineFramer;
use bytes::{BufMut, BytesMut};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Read buffer size for the inbound pump
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Line queue and waiter queue, always mutated together.
#[derive(Debug, Default)]
struct State {
    framer: LineFramer,
    /// Suspended `read_line` callers, oldest first.
    waiters: VecDeque<oneshot::Sender<String>>,
    closed: bool,
}

impl State {
    /// Hand buffered lines to waiters until one side runs out.
    ///
    /// A waiter whose receiver was dropped is skipped and its line offered
    /// to the next one; if none is left the line returns to the queue head.
    fn dispatch(&mut self) -> usize {
        let mut delivered = 0;
        while !self.waiters.is_empty() {
            let Some(mut line) = self.framer.next_line() else {
                break;
            };
            loop {
                match self.waiters.pop_front() {
                    Some(waiter) => match waiter.send(line) {
                        Ok(()) => {
                            delivered += 1;
                            break;
                        }
                        Err(returned) => line = returned,
                    },
                    None => {
                        self.framer.requeue_front(line);
                        return delivered;
                    }
                }
            }
        }
        delivered
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registered `read_line` waiting on its waiter slot.
///
/// If the read is abandoned after a line was already sent to it, the line
/// goes back to the head of the queue and is offered to the next waiter.
struct PendingRead {
    receiver: oneshot::Receiver<String>,
    shared: Arc<Shared>,
    done: bool,
}

impl Drop for PendingRead {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Lock first so dispatch cannot send between close and try_recv.
        let mut state = self.shared.lock();
        self.receiver.close();
        if let Ok(line) = self.receiver.try_recv() {
            trace!("Abandoned read returned its line");
            state.framer.requeue_front(line);
            state.dispatch();
        }
    }
}

/// Write-then-read channel over a line protocol.
pub struct RequestChannel<W> {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<W>,
}

impl<W> RequestChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Create a channel writing to `writer`.
    ///
    /// Inbound data must be supplied through [`RequestChannel::inbound`].
    pub fn new(writer: W) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    /// Handle for delivering inbound bytes and transport failures.
    pub fn inbound(&self) -> Inbound {
        Inbound {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Send `text` followed by a newline.
    ///
    /// Completes once the transport accepted the bytes, not when the
    /// response arrives. A write failure closes the channel.
    pub async fn write_line(&self, text: &str) -> Result<()> {
        if self.is_closed() {
            return Err(HarnessError::Disconnected);
        }

        let mut buf = BytesMut::with_capacity(text.len() + 1);
        buf.extend_from_slice(text.as_bytes());
        buf.put_u8(b'\n');

        let mut writer = self.writer.lock().await;
        let result = match writer.write_all(&buf).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            debug!(error = %e, "Write failed, closing channel");
            self.inbound().disconnect();
            return Err(HarnessError::Transport(e));
        }

        trace!(line = text, "Line written");
        Ok(())
    }

    /// Receive the next line not yet delivered to another caller.
    ///
    /// Returns immediately when a line is buffered. Otherwise the caller is
    /// queued behind earlier callers until a line arrives or the channel
    /// closes.
    pub async fn read_line(&self) -> Result<String> {
        let receiver = {
            let mut state = self.shared.lock();
            if let Some(line) = state.framer.next_line() {
                return Ok(line);
            }
            if state.closed {
                return Err(HarnessError::Disconnected);
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };

        let mut pending = PendingRead {
            receiver,
            shared: Arc::clone(&self.shared),
            done: false,
        };
        let result = (&mut pending.receiver).await;
        pending.done = true;
        result.map_err(|_| HarnessError::Disconnected)
    }

    /// Write a command line and wait for the next response line.
    pub async fn request(&self, text: &str) -> Result<String> {
        self.write_line(text).await?;
        self.read_line().await
    }

    /// Shut down the write side of the transport.
    pub async fn shutdown(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    /// Whether the inbound side has closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of `read_line` callers currently suspended.
    pub fn pending_waiters(&self) -> usize {
        self.shared.lock().waiters.len()
    }

    /// Number of completed lines buffered and not yet read.
    pub fn buffered_lines(&self) -> usize {
        self.shared.lock().framer.completed_len()
    }
}

/// Inbound half of a [`RequestChannel`].
#[derive(Debug, Clone)]
pub struct Inbound {
    shared: Arc<Shared>,
}

impl Inbound {
    /// Feed received bytes into the channel's framer.
    ///
    /// Every line completed by this chunk is offered to waiters in order.
    /// Returns how many waiters were resolved. Bytes arriving after the
    /// channel closed are discarded.
    pub fn feed(&self, chunk: &[u8]) -> usize {
        let mut state = self.shared.lock();
        if state.closed {
            return 0;
        }
        state.framer.feed(chunk);
        state.dispatch()
    }

    /// Mark the channel closed and fail every pending waiter.
    ///
    /// Lines already completed remain readable. Returns the number of
    /// waiters that were failed.
    pub fn disconnect(&self) -> usize {
        let mut state = self.shared.lock();
        state.closed = true;
        let failed = state.waiters.len();
        // Dropping the senders resolves every receiver with an error.
        state.waiters.clear();
        failed
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Read from `reader` until EOF or error, feeding every chunk.
    ///
    /// The channel is disconnected when the pump returns, whatever the
    /// reason, so no waiter is left suspended.
    pub async fn pump<R>(self, mut reader: R) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

        let result = loop {
            match reader.read_buf(&mut buffer).await {
                Ok(0) => {
                    trace!("Peer closed connection");
                    break Ok(());
                }
                Ok(n) => {
                    let resolved = self.feed(&buffer[..n]);
                    trace!(bytes = n, resolved, "Inbound chunk");
                    buffer.clear();
                }
                Err(e) => break Err(e),
            }
        };

        let failed = self.disconnect();
        if failed > 0 {
            debug!(failed, "Failed pending readers on disconnect");
        }
        result
    }
}
