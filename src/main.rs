//! kv-harness: exercise a line-based key-value server
//!
//! Subcommands:
//! - `scenarios`: protocol test cases (SET/GET, DEL, cross-connection
//!   visibility, concurrent fan-out)
//! - `load`: open many connections and issue SET commands on each
//! - `serve`: run the reference server
//!
//! Configuration via CLI arguments or TOML file.

use kv_harness::config::{Config, Mode};
use kv_harness::scenario::{self, Scenario};
use kv_harness::server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        target_addr = %config.target,
        connect_timeout_ms = config.connect_timeout.map(|t| t.as_millis() as u64),
        mode = ?config.mode,
        "Starting kv-harness"
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let target = config.target();

    match config.mode {
        Mode::Scenarios { only, fan_out } => {
            let selected: Vec<Scenario> = match only {
                Some(scenario) => vec![scenario],
                None => Scenario::ALL.to_vec(),
            };

            let outcomes = scenario::run_suite(&selected, &target, fan_out).await;
            let failed = outcomes.iter().filter(|o| !o.passed()).count();
            info!(
                passed = outcomes.len() - failed,
                failed,
                "Scenario run complete"
            );
            if failed > 0 {
                return Err(format!("{} of {} scenarios failed", failed, outcomes.len()).into());
            }
        }

        Mode::Load {
            connections,
            requests,
        } => {
            let report = scenario::load(&target, connections, requests).await?;
            info!(
                connections = report.run.total,
                requests = report.requests,
                elapsed_ms = report.run.elapsed.as_millis() as u64,
                throughput = report.throughput(),
                "All sockets are completed"
            );
        }

        Mode::Serve { listen } => {
            let server = Server::bind(&listen).await?;
            server
                .run_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!(error = %e, "Failed to listen for shutdown signal");
                        std::future::pending::<()>().await;
                    }
                })
                .await?;
            info!("Server stopped");
        }
    }

    Ok(())
}
