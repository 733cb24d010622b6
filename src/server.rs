//! Reference key-value server.
//!
//! A small TCP server speaking the SET/GET/DEL line protocol, used by the
//! integration tests and the `serve` subcommand. Each connection frames
//! its input with [`LineFramer`] and answers every line with exactly one
//! response line, in order. A NUL byte ends the session.

use crate::command::{Command, Response};
use crate::framer::LineFramer;
use crate::storage::Store;
use bytes::BytesMut;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace};

/// Maximum number of concurrent connections
const MAX_CONNECTIONS: usize = 10000;

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Longest unterminated line kept before the session is dropped
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Server instance
pub struct Server {
    listener: TcpListener,
    store: Arc<Store>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Bind to `addr` with an empty store.
    ///
    /// Binding port 0 picks a free port; see [`Server::local_addr`].
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Server {
            listener,
            store: Store::new(),
            connection_limit: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The store shared by all connections.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run_until<S>(self, shutdown: S) -> std::io::Result<()>
    where
        S: Future<Output = ()>,
    {
        info!(address = %self.local_addr()?, "Server listening");
        tokio::select! {
            result = self.accept_loop() => result,
            _ = shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
        }
    }

    /// Accept connections forever.
    pub async fn run(self) -> std::io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    async fn accept_loop(&self) -> std::io::Result<()> {
        loop {
            // Wait for a connection slot
            let permit = self
                .connection_limit
                .clone()
                .acquire_owned()
                .await
                .map_err(std::io::Error::other)?;

            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");
                    let store = Arc::clone(&self.store);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, store).await {
                            debug!(error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(mut stream: TcpStream, store: Arc<Store>) -> std::io::Result<()> {
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut framer = LineFramer::new();
    let mut output = BytesMut::new();

    loop {
        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            trace!("Connection closed by client");
            return Ok(());
        }

        let (data, terminated) = match buffer.iter().position(|&b| b == 0) {
            Some(pos) => (&buffer[..pos], true),
            None => (&buffer[..], false),
        };
        framer.feed(data);

        while let Some(line) = framer.next_line() {
            execute_line(&line, &store, &mut output);
        }
        if !output.is_empty() {
            stream.write_all(&output).await?;
            output.clear();
        }

        if terminated {
            trace!("NUL received, closing connection");
            return Ok(());
        }
        if framer.pending_len() > MAX_LINE_LENGTH {
            debug!(
                pending = framer.pending_len(),
                limit = MAX_LINE_LENGTH,
                "Line too long, closing connection"
            );
            stream
                .write_all(Response::line_too_long(MAX_LINE_LENGTH).as_bytes())
                .await?;
            return Ok(());
        }
        buffer.clear();
    }
}

/// Execute one command line, appending its response to `output`
fn execute_line(line: &str, store: &Store, output: &mut BytesMut) {
    match Command::parse(line) {
        Ok(command) => {
            trace!(%command, "Processing command");
            match command {
                Command::Get { key } => {
                    let value = store.get(&key);
                    output.extend_from_slice(Response::value(value.as_deref()).as_bytes());
                }
                Command::Set { key, value } => {
                    store.set(&key, &value);
                    output.extend_from_slice(Response::stored().as_bytes());
                }
                Command::Del { key } => {
                    let existed = store.delete(&key);
                    output.extend_from_slice(Response::deleted(existed).as_bytes());
                }
            }
        }
        Err(e) => {
            debug!(error = %e, "Parse error");
            output.extend_from_slice(Response::error(&e).as_bytes());
        }
    }
}
