//! Protocol scenarios and load runs.
//!
//! Each scenario opens its own connections, drives a short command script
//! and checks every response line. A response that does not match is a
//! [`ScenarioError::Mismatch`]; transport problems surface as
//! [`ScenarioError::Harness`].

use crate::command::{normalize, Command, MISSING, STORED};
use crate::connection::{Connection, Target};
use crate::error::HarnessError;
use crate::pool::{ConnectionPool, RunReport};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Connections used by the fan-out scenario unless configured otherwise
pub const DEFAULT_FAN_OUT: usize = 250;

/// Scenario failures
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// Connection-level failure
    #[error(transparent)]
    Harness(#[from] HarnessError),

    /// The server answered with an unexpected line
    #[error("connection {conn}: `{command}` expected `{expected}`, got `{actual}`")]
    Mismatch {
        conn: usize,
        command: String,
        expected: String,
        actual: String,
    },
}

/// Send `command` and require the trimmed response to equal `expected`.
pub async fn expect(
    conn: &Connection,
    command: &Command,
    expected: &str,
) -> Result<(), ScenarioError> {
    let line = command.to_string();
    let response = conn.request(&line).await?;
    let actual = normalize(&response);
    debug!(conn = conn.id(), command = %line, response = actual, "Response");

    if actual == expected {
        Ok(())
    } else {
        Err(ScenarioError::Mismatch {
            conn: conn.id(),
            command: line,
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// Named protocol test case
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// `SET k v` then `GET k` returns `v`
    SetThenGet,
    /// `GET` of a never-set key returns `None`
    GetMissing,
    /// `SET`, `DEL`, then `GET` returns `None`
    DelThenGet,
    /// A value set on one connection is visible from another
    CrossConnection,
    /// Many connections each set and read back a distinct key
    FanOut,
}

impl Scenario {
    pub const ALL: [Scenario; 5] = [
        Scenario::SetThenGet,
        Scenario::GetMissing,
        Scenario::DelThenGet,
        Scenario::CrossConnection,
        Scenario::FanOut,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::SetThenGet => "set-then-get",
            Scenario::GetMissing => "get-missing",
            Scenario::DelThenGet => "del-then-get",
            Scenario::CrossConnection => "cross-connection",
            Scenario::FanOut => "fan-out",
        }
    }

    /// Run this scenario against `target`.
    ///
    /// `fan_out` is the connection count for [`Scenario::FanOut`] and is
    /// ignored by the others.
    pub async fn run(&self, target: &Target, fan_out: usize) -> Result<(), ScenarioError> {
        match self {
            Scenario::SetThenGet => {
                let conn = Connection::open(0, target).await?;
                let result = async {
                    expect(&conn, &Command::set("k", "v"), STORED).await?;
                    expect(&conn, &Command::get("k"), "v").await
                }
                .await;
                conn.close().await;
                result
            }

            Scenario::GetMissing => {
                let conn = Connection::open(0, target).await?;
                let result = expect(&conn, &Command::get("nosuchkey"), MISSING).await;
                conn.close().await;
                result
            }

            Scenario::DelThenGet => {
                let conn = Connection::open(0, target).await?;
                let result = async {
                    expect(&conn, &Command::set("k", "v1"), STORED).await?;
                    expect(&conn, &Command::del("k"), "1").await?;
                    expect(&conn, &Command::get("k"), MISSING).await
                }
                .await;
                conn.close().await;
                result
            }

            Scenario::CrossConnection => {
                let pool = ConnectionPool::open(2, target).await?;
                let result = async {
                    let (a, b) = match (pool.get(0), pool.get(1)) {
                        (Some(a), Some(b)) => (a, b),
                        _ => return Err(ScenarioError::from(HarnessError::Disconnected)),
                    };
                    expect(b, &Command::set("firstKey", "firstValue"), STORED).await?;
                    expect(a, &Command::get("firstKey"), "firstValue").await
                }
                .await;
                pool.close().await;
                result
            }

            Scenario::FanOut => {
                let pool = ConnectionPool::open(fan_out, target).await?;
                let result = pool
                    .run_per_connection(|conn| async move {
                        let key = format!("fan-key-{}", conn.id());
                        let value = format!("fan-value-{}", conn.id());
                        expect(&conn, &Command::set(&key, &value), STORED).await?;
                        expect(&conn, &Command::get(&key), &value).await
                    })
                    .await;
                pool.close().await;
                result.map(|_| ())
            }
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Scenario::ALL.iter().map(|known| known.name()).collect();
                format!("unknown scenario `{}` (expected one of: {})", s, names.join(", "))
            })
    }
}

/// Outcome of one scenario in a suite run
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub scenario: Scenario,
    pub elapsed: Duration,
    pub result: Result<(), ScenarioError>,
}

impl ScenarioOutcome {
    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run `scenarios` one after another, collecting every outcome.
pub async fn run_suite(
    scenarios: &[Scenario],
    target: &Target,
    fan_out: usize,
) -> Vec<ScenarioOutcome> {
    let mut outcomes = Vec::with_capacity(scenarios.len());
    for &scenario in scenarios {
        let started = Instant::now();
        let result = scenario.run(target, fan_out).await;
        let elapsed = started.elapsed();
        match &result {
            Ok(()) => info!(
                scenario = scenario.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Scenario passed"
            ),
            Err(e) => warn!(scenario = scenario.name(), error = %e, "Scenario failed"),
        }
        outcomes.push(ScenarioOutcome {
            scenario,
            elapsed,
            result,
        });
    }
    outcomes
}

/// Summary of a load run
#[derive(Debug, Clone, Copy)]
pub struct LoadReport {
    pub run: RunReport,
    /// SET commands acknowledged across all connections
    pub requests: usize,
}

impl LoadReport {
    /// Acknowledged requests per second of wall time.
    pub fn throughput(&self) -> f64 {
        let secs = self.run.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.requests as f64 / secs
        } else {
            0.0
        }
    }
}

/// Open `connections` sockets and have each issue `requests` SETs.
///
/// Connection `i` writes `SET KEY-i-r VAL-i-r` for each request `r` and
/// waits for the acknowledgement before sending the next one.
pub async fn load(
    target: &Target,
    connections: usize,
    requests: usize,
) -> Result<LoadReport, ScenarioError> {
    let pool = ConnectionPool::open(connections, target).await?;
    let result = pool
        .run_per_connection(|conn| async move {
            for r in 0..requests {
                let command = Command::set(
                    format!("KEY-{}-{}", conn.id(), r),
                    format!("VAL-{}-{}", conn.id(), r),
                );
                expect(&conn, &command, STORED).await?;
            }
            Ok::<(), ScenarioError>(())
        })
        .await;
    pool.close().await;

    let run = result?;
    Ok(LoadReport {
        run,
        requests: run.succeeded * requests,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_names_round_trip() {
        for scenario in Scenario::ALL {
            assert_eq!(scenario.name().parse::<Scenario>(), Ok(scenario));
        }
        let err = "nope".parse::<Scenario>().unwrap_err();
        assert!(err.contains("fan-out"));
    }

    #[test]
    fn test_mismatch_display() {
        let err = ScenarioError::Mismatch {
            conn: 3,
            command: "GET k".to_string(),
            expected: "v".to_string(),
            actual: "None".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "connection 3: `GET k` expected `v`, got `None`"
        );
    }

    #[test]
    fn test_throughput() {
        let report = LoadReport {
            run: RunReport {
                total: 10,
                succeeded: 10,
                failed: 0,
                elapsed: Duration::from_millis(500),
            },
            requests: 100,
        };
        assert_eq!(report.throughput(), 200.0);
    }
}
