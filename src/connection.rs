//! Connection state machine for harness client sessions.
//!
//! A `Connection` owns one TCP socket, split into a reader task that pumps
//! bytes into the connection's [`RequestChannel`] and a write half owned by
//! the channel itself.
//!
//! Lifecycle: `Connecting -> Open -> Closing -> Closed`, with
//! `Connecting -> Closed` on connect failure. Nothing leaves `Closed`.

use crate::channel::RequestChannel;
use crate::error::{HarnessError, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Transport connect in progress.
    Connecting,
    /// Connected, reads and writes allowed.
    Open,
    /// Close requested or transport failed; teardown in progress.
    Closing,
    /// Terminal.
    Closed,
}

impl ConnState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Connecting, Closed) | (Open, Closing) | (Closing, Closed)
        )
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Connecting => "connecting",
            ConnState::Open => "open",
            ConnState::Closing => "closing",
            ConnState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Shared, transition-checked connection state.
#[derive(Debug, Clone)]
pub struct StateCell {
    inner: Arc<Mutex<ConnState>>,
}

impl StateCell {
    pub fn new(initial: ConnState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn get(&self) -> ConnState {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `next` if legal from the current state.
    ///
    /// Returns `false` and leaves the state untouched otherwise.
    pub fn advance(&self, next: ConnState) -> bool {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if state.can_transition(next) {
            *state = next;
            true
        } else {
            false
        }
    }
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct Target {
    /// `host:port` of the key-value server.
    pub address: String,
    /// Upper bound on a single connect attempt.
    pub connect_timeout: Option<Duration>,
}

impl Target {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// A single harness client session.
pub struct Connection {
    id: usize,
    peer: SocketAddr,
    state: StateCell,
    channel: Arc<RequestChannel<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connect to `target` and start the inbound pump.
    ///
    /// Failure is terminal for this connection; nothing is retried.
    pub async fn open(id: usize, target: &Target) -> Result<Self> {
        let state = StateCell::new(ConnState::Connecting);
        trace!(conn = id, addr = %target, "Connecting");

        let connected = match connect(target).await {
            Ok(stream) => stream.peer_addr().map(|peer| (stream, peer)),
            Err(e) => Err(e),
        };
        let (stream, peer) = match connected {
            Ok(connected) => connected,
            Err(source) => return Err(connect_failed(id, &state, target, source)),
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(conn = id, error = %e, "Failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let channel = Arc::new(RequestChannel::new(write_half));
        let inbound = channel.inbound();
        state.advance(ConnState::Open);

        let reader_state = state.clone();
        let reader_channel = Arc::clone(&channel);
        let reader = tokio::spawn(async move {
            match inbound.pump(read_half).await {
                Ok(()) => trace!(conn = id, "Inbound stream ended"),
                Err(e) => debug!(conn = id, error = %e, "Transport read error"),
            }
            // Peer went away: release the write half before reporting Closed
            if reader_state.advance(ConnState::Closing) {
                if let Err(e) = reader_channel.shutdown().await {
                    trace!(conn = id, error = %e, "Shutdown error");
                }
                reader_state.advance(ConnState::Closed);
                debug!(conn = id, "Connection closed by peer");
            }
        });
        debug!(conn = id, peer = %peer, "Connection open");

        Ok(Self {
            id,
            peer,
            state,
            channel,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Index of this connection within its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    /// The request channel backing this connection.
    pub fn channel(&self) -> &RequestChannel<OwnedWriteHalf> {
        &self.channel
    }

    /// Send one command line.
    pub async fn write_line(&self, text: &str) -> Result<()> {
        let result = self.channel.write_line(text).await;
        if result.is_err() && self.state.advance(ConnState::Closing) {
            self.teardown().await;
        }
        result
    }

    /// Wait for the next response line.
    pub async fn read_line(&self) -> Result<String> {
        self.channel.read_line().await
    }

    /// Send one command and wait for its response line.
    pub async fn request(&self, text: &str) -> Result<String> {
        self.write_line(text).await?;
        self.read_line().await
    }

    /// Close the connection.
    ///
    /// Pending readers fail with [`HarnessError::Disconnected`] immediately.
    /// Closing an already closed connection is a no-op.
    pub async fn close(&self) {
        if self.state.advance(ConnState::Closing) {
            self.teardown().await;
        }
    }

    async fn teardown(&self) {
        let failed = self.channel.inbound().disconnect();
        if let Err(e) = self.channel.shutdown().await {
            trace!(conn = self.id, error = %e, "Shutdown error");
        }
        self.abort_reader();
        self.state.advance(ConnState::Closed);
        debug!(conn = self.id, failed, "Connection closed");
    }

    fn abort_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.channel.inbound().disconnect();
        self.abort_reader();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Record a failed connect attempt; `Connecting -> Closed` is terminal.
fn connect_failed(
    id: usize,
    state: &StateCell,
    target: &Target,
    source: std::io::Error,
) -> HarnessError {
    state.advance(ConnState::Closed);
    debug!(conn = id, addr = %target, error = %source, "Connect failed");
    HarnessError::Connect {
        target: target.address.clone(),
        source,
    }
}

async fn connect(target: &Target) -> std::io::Result<TcpStream> {
    match target.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, TcpStream::connect(&target.address))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
            })?,
        None => TcpStream::connect(&target.address).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_connection_state_transitions() {
        let state = StateCell::new(ConnState::Connecting);
        assert!(state.advance(ConnState::Open));
        assert!(!state.advance(ConnState::Connecting));
        assert!(!state.advance(ConnState::Closed));
        assert!(state.advance(ConnState::Closing));
        assert!(state.advance(ConnState::Closed));

        // Terminal
        for next in [
            ConnState::Connecting,
            ConnState::Open,
            ConnState::Closing,
            ConnState::Closed,
        ] {
            assert!(!state.advance(next));
        }
        assert_eq!(state.get(), ConnState::Closed);
    }

    #[test]
    fn test_connect_failure_is_terminal() {
        let state = StateCell::new(ConnState::Connecting);
        assert!(state.advance(ConnState::Closed));
        assert!(!state.advance(ConnState::Open));
    }

    #[test]
    fn test_post_connect_error_is_a_connect_failure() {
        // e.g. peer_addr failing on a socket reset right after connect
        let state = StateCell::new(ConnState::Connecting);
        let target = Target::new("127.0.0.1:1");
        let source = std::io::Error::from(std::io::ErrorKind::NotConnected);

        let err = connect_failed(4, &state, &target, source);
        match err {
            HarnessError::Connect { target, source } => {
                assert_eq!(target, "127.0.0.1:1");
                assert_eq!(source.kind(), std::io::ErrorKind::NotConnected);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(state.get(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_open_request_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"GET k\n");
            // Split the response across two writes
            socket.write_all(b"No").await.unwrap();
            socket.flush().await.unwrap();
            socket.write_all(b"ne\n").await.unwrap();
            // Wait for the client to hang up
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(n, 0);
        });

        let conn = Connection::open(0, &Target::new(addr.to_string()))
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnState::Open);
        assert_eq!(conn.peer(), addr);

        assert_eq!(conn.request("GET k").await.unwrap(), "None");

        conn.close().await;
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(matches!(
            conn.read_line().await,
            Err(HarnessError::Disconnected)
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_pending_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16];
            let _ = socket.read(&mut buf).await;
        });

        let conn = Arc::new(
            Connection::open(1, &Target::new(addr.to_string()))
                .await
                .unwrap(),
        );
        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.read_line().await })
        };
        tokio::task::yield_now().await;

        conn.close().await;
        assert!(matches!(
            reader.await.unwrap(),
            Err(HarnessError::Disconnected)
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_moves_to_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Half-close: the client sees EOF while we can still read
            socket.shutdown().await.unwrap();
            let mut buf = vec![0u8; 16];
            socket.read(&mut buf).await.unwrap()
        });

        let conn = Connection::open(2, &Target::new(addr.to_string()))
            .await
            .unwrap();

        assert!(matches!(
            conn.read_line().await,
            Err(HarnessError::Disconnected)
        ));
        // The reader task finishes its transition shortly after failing waiters
        for _ in 0..100 {
            if conn.state() == ConnState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(conn.state(), ConnState::Closed);

        // Closed means our write half was shut down too, without close()
        let n = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        drop(conn);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Connection::open(3, &Target::new(addr.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Connect { .. }));
    }
}
