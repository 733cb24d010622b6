//! kv-harness: a test and load harness for a line-based key-value protocol.
//!
//! The protocol is plaintext over TCP: each command is one line
//! (`SET key value`, `GET key`, `DEL key`) and the server answers each
//! with exactly one line, in order.
//!
//! Layers, leaves first:
//! - [`framer::LineFramer`]: splits an inbound byte stream into lines
//! - [`channel::RequestChannel`]: pairs writes with FIFO line reads
//! - [`connection::Connection`]: one TCP session and its state machine
//! - [`pool::ConnectionPool`]: many connections driven concurrently
//! - [`scenario`]: protocol test cases and load runs
//!
//! A reference server ([`server::Server`]) speaks the same protocol for
//! local runs and tests.

pub mod channel;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod framer;
pub mod pool;
pub mod scenario;
pub mod server;
pub mod storage;

pub use channel::{Inbound, RequestChannel};
pub use connection::{ConnState, Connection, Target};
pub use error::{HarnessError, Result};
pub use framer::LineFramer;
pub use pool::{ConnectionPool, RunReport};
pub use scenario::{Scenario, ScenarioError};
