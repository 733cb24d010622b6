//! Concurrent orchestration of many connections against one server.
//!
//! `ConnectionPool` opens N connections at once and runs a per-connection
//! routine on all of them concurrently. Errors are reported only after
//! every sibling operation has settled, so a failed run never leaves
//! half-initialized connections behind.

use crate::connection::{Connection, Target};
use crate::error::{HarnessError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Summary of one `run_per_connection` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Routines started.
    pub total: usize,
    /// Routines that returned `Ok`.
    pub succeeded: usize,
    /// Routines that failed or panicked.
    pub failed: usize,
    /// Wall time from first spawn to last completion.
    pub elapsed: Duration,
}

/// A fixed set of open connections to one target.
#[derive(Debug)]
pub struct ConnectionPool {
    target: Target,
    connections: Vec<Arc<Connection>>,
}

impl ConnectionPool {
    /// Open `count` connections to `target` concurrently.
    ///
    /// Completes once every attempt has resolved. If any attempt failed,
    /// the connections that did open are closed and the first failure is
    /// returned.
    pub async fn open(count: usize, target: &Target) -> Result<Self> {
        let started = Instant::now();
        let mut attempts = JoinSet::new();
        for id in 0..count {
            let target = target.clone();
            attempts.spawn(async move { (id, Connection::open(id, &target).await) });
        }

        let mut slots: Vec<Option<Connection>> = (0..count).map(|_| None).collect();
        let mut first_error = None;
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((id, Ok(conn))) => slots[id] = Some(conn),
                Ok((id, Err(e))) => {
                    debug!(conn = id, error = %e, "Connection attempt failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(HarnessError::Task(e));
                }
            }
        }

        if let Some(err) = first_error {
            let opened: Vec<Connection> = slots.into_iter().flatten().collect();
            warn!(
                addr = %target,
                opened = opened.len(),
                requested = count,
                error = %err,
                "Pool open failed, closing opened connections"
            );
            for conn in &opened {
                conn.close().await;
            }
            return Err(err);
        }

        let connections: Vec<Arc<Connection>> =
            slots.into_iter().flatten().map(Arc::new).collect();
        info!(
            addr = %target,
            count = connections.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Connections open"
        );

        Ok(Self {
            target: target.clone(),
            connections,
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connection by pool index.
    pub fn get(&self, id: usize) -> Option<&Arc<Connection>> {
        self.connections.get(id)
    }

    /// Iterate over all connections in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.connections.iter()
    }

    /// Run `routine` against every connection concurrently.
    ///
    /// Waits for all routines to settle, then returns the first failure in
    /// completion order, if any. The completion counter belongs to this
    /// call, so separate runs never share progress state.
    pub async fn run_per_connection<F, Fut, E>(
        &self,
        routine: F,
    ) -> std::result::Result<RunReport, E>
    where
        F: Fn(Arc<Connection>) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: From<HarnessError> + std::fmt::Display + Send + 'static,
    {
        let total = self.connections.len();
        let completed = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let mut tasks = JoinSet::new();
        for conn in &self.connections {
            let id = conn.id();
            let fut = routine(Arc::clone(conn));
            let completed = Arc::clone(&completed);
            tasks.spawn(async move {
                let result = fut.await;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(conn = id, done, total, "Connection routine complete");
                (id, result)
            });
        }

        let mut succeeded = 0;
        let mut failed = 0;
        let mut first_error: Option<E> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => succeeded += 1,
                Ok((id, Err(e))) => {
                    failed += 1;
                    debug!(conn = id, error = %e, "Connection routine failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    failed += 1;
                    first_error.get_or_insert(E::from(HarnessError::Task(e)));
                }
            }
        }

        let report = RunReport {
            total,
            succeeded,
            failed,
            elapsed: started.elapsed(),
        };
        info!(
            total,
            succeeded,
            failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "All connection routines settled"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Close every connection.
    pub async fn close(&self) {
        for conn in &self.connections {
            conn.close().await;
        }
        debug!(count = self.connections.len(), "Pool closed");
    }
}
