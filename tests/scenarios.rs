//! End-to-end runs against the reference server on a random port.

use kv_harness::command::{normalize, Command};
use kv_harness::scenario::{self, Scenario, ScenarioError};
use kv_harness::server::Server;
use kv_harness::{ConnState, Connection, ConnectionPool, HarnessError, Target};
use std::sync::Arc;
use std::time::Duration;

/// A reference server bound to an OS-assigned port.
struct TestServer {
    target: Target,
    store: Arc<kv_harness::storage::Store>,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let store = Arc::clone(server.store());
        let handle = tokio::spawn(server.run());
        Self {
            target: Target::new(addr.to_string()).with_connect_timeout(Duration::from_secs(5)),
            store,
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn set_then_get_returns_value() {
    let server = TestServer::start().await;
    Scenario::SetThenGet.run(&server.target, 0).await.unwrap();
    assert_eq!(server.store.get("k").as_deref(), Some("v"));
}

#[tokio::test]
async fn get_missing_returns_none() {
    let server = TestServer::start().await;
    Scenario::GetMissing.run(&server.target, 0).await.unwrap();
}

#[tokio::test]
async fn del_then_get_returns_none() {
    let server = TestServer::start().await;
    Scenario::DelThenGet.run(&server.target, 0).await.unwrap();
    assert!(server.store.is_empty());
}

#[tokio::test]
async fn cross_connection_visibility() {
    let server = TestServer::start().await;
    Scenario::CrossConnection.run(&server.target, 0).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_out_250_connections_without_cross_talk() {
    let server = TestServer::start().await;
    Scenario::FanOut.run(&server.target, 250).await.unwrap();
    assert_eq!(server.store.len(), 250);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_suite_passes() {
    let server = TestServer::start().await;
    let outcomes = scenario::run_suite(&Scenario::ALL, &server.target, 50).await;
    assert_eq!(outcomes.len(), Scenario::ALL.len());
    for outcome in &outcomes {
        assert!(outcome.passed(), "{} failed: {:?}", outcome.scenario, outcome.result);
    }
}

#[tokio::test]
async fn mismatch_is_reported() {
    let server = TestServer::start().await;
    server.store.set("k", "stale");

    let conn = Connection::open(0, &server.target).await.unwrap();
    let err = scenario::expect(&conn, &Command::get("k"), "fresh")
        .await
        .unwrap_err();
    match err {
        ScenarioError::Mismatch {
            command, actual, ..
        } => {
            assert_eq!(command, "GET k");
            assert_eq!(actual, "stale");
        }
        other => panic!("unexpected: {:?}", other),
    }
    conn.close().await;
}

#[tokio::test]
async fn pipelined_writes_pair_in_order() {
    let server = TestServer::start().await;
    let conn = Connection::open(0, &server.target).await.unwrap();

    conn.write_line("SET a 1").await.unwrap();
    conn.write_line("GET a").await.unwrap();
    conn.write_line("DEL a").await.unwrap();
    conn.write_line("GET a").await.unwrap();

    let mut responses = Vec::new();
    for _ in 0..4 {
        responses.push(normalize(&conn.read_line().await.unwrap()).to_string());
    }
    assert_eq!(responses, vec!["1", "1", "1", "None"]);
    conn.close().await;
}

#[tokio::test]
async fn malformed_command_gets_one_line() {
    let server = TestServer::start().await;
    let conn = Connection::open(0, &server.target).await.unwrap();

    let response = conn.request("FETCH k").await.unwrap();
    assert_eq!(normalize(&response), "Invalid command `FETCH`");
    // The session stays usable
    assert_eq!(normalize(&conn.request("GET k").await.unwrap()), "None");
    conn.close().await;
}

#[tokio::test]
async fn server_hangup_fails_pending_reads() {
    let server = TestServer::start().await;
    let conn = Arc::new(Connection::open(0, &server.target).await.unwrap());

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.read_line().await })
        })
        .collect();

    // NUL makes the server drop the session
    conn.write_line("\0").await.unwrap();

    for reader in readers {
        assert!(matches!(
            reader.await.unwrap(),
            Err(HarnessError::Disconnected)
        ));
    }
    assert!(conn.channel().is_closed());
    conn.close().await;
    assert_eq!(conn.state(), ConnState::Closed);
}

#[tokio::test]
async fn load_run_counts_every_request() {
    let server = TestServer::start().await;
    let report = scenario::load(&server.target, 100, 3).await.unwrap();
    assert_eq!(report.run.total, 100);
    assert_eq!(report.run.succeeded, 100);
    assert_eq!(report.requests, 300);
    assert_eq!(server.store.get("KEY-42-2").as_deref(), Some("VAL-42-2"));
}

#[tokio::test]
async fn pool_open_against_closed_port_fails() {
    // Bind then drop to get a port with nothing listening
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = ConnectionPool::open(10, &Target::new(addr)).await.unwrap_err();
    assert!(matches!(err, HarnessError::Connect { .. }));
}
