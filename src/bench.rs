//! Load generator for the file server.
//!
//! Drives many concurrent simulated clients, each performing one
//! operation on a `<size>mb.bin` payload, and aggregates per-client
//! timings into a summary.

use crate::client::{Client, ClientError};
use crate::status::StatusSnapshot;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{info, warn};

const MIB: usize = 1024 * 1024;

/// Operations exercised in matrix mode.
pub const MATRIX_OPERATIONS: [Operation; 3] = [Operation::List, Operation::Get, Operation::Post];
pub const MATRIX_SIZES_MB: [usize; 3] = [10, 50, 100];
pub const MATRIX_CLIENTS: [usize; 3] = [1, 5, 50];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Operation {
    List,
    Get,
    Post,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::List => write!(f, "list"),
            Operation::Get => write!(f, "get"),
            Operation::Post => write!(f, "post"),
        }
    }
}

/// One benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchConfig {
    pub operation: Operation,
    pub size_mb: usize,
    pub clients: usize,
}

impl BenchConfig {
    pub fn file_name(&self) -> String {
        format!("{}mb.bin", self.size_mb)
    }

    pub fn payload_len(&self) -> usize {
        self.size_mb * MIB
    }
}

/// Every combination run by matrix mode, in execution order.
pub fn matrix() -> Vec<BenchConfig> {
    let mut runs = Vec::new();
    for operation in MATRIX_OPERATIONS {
        for size_mb in MATRIX_SIZES_MB {
            for clients in MATRIX_CLIENTS {
                runs.push(BenchConfig {
                    operation,
                    size_mb,
                    clients,
                });
            }
        }
    }
    runs
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Result of one simulated client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientReport {
    pub client_id: usize,
    pub ok: bool,
    pub duration: Duration,
    /// Bytes per second; absent for LIST and for failed clients.
    pub throughput: Option<f64>,
}

impl fmt::Display for ClientReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let throughput = self
            .throughput
            .map_or_else(|| "-".to_string(), |t| format!("{t:.4}"));
        write!(
            f,
            "Client-{:<4} {:<10} {:<15.4} {:<20}",
            self.client_id,
            self.ok,
            self.duration.as_secs_f64(),
            throughput
        )
    }
}

/// Aggregate of one run.
#[derive(Debug, Clone)]
pub struct BenchSummary {
    pub config: BenchConfig,
    pub started_at: DateTime<Utc>,
    pub server_workers: u32,
    pub successes: usize,
    pub failures: usize,
    pub mean_duration: Option<Duration>,
    pub mean_throughput: Option<f64>,
    /// Change in the server's counters across the run, when STATUS answered.
    pub server_delta: Option<StatusSnapshot>,
}

impl BenchSummary {
    /// Fold per-client reports into a summary.
    pub fn from_reports(
        config: BenchConfig,
        started_at: DateTime<Utc>,
        server_workers: u32,
        reports: &[ClientReport],
    ) -> Self {
        let ok: Vec<&ClientReport> = reports.iter().filter(|r| r.ok).collect();
        let successes = ok.len();

        let mean_duration = (successes > 0)
            .then(|| ok.iter().map(|r| r.duration).sum::<Duration>() / successes as u32);

        let throughputs: Vec<f64> = ok.iter().filter_map(|r| r.throughput).collect();
        let mean_throughput = (!throughputs.is_empty())
            .then(|| throughputs.iter().sum::<f64>() / throughputs.len() as f64);

        Self {
            config,
            started_at,
            server_workers,
            successes,
            failures: reports.len() - successes,
            mean_duration,
            mean_throughput,
            server_delta: None,
        }
    }
}

impl fmt::Display for BenchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Run started {}: operation={} file={} clients={} server_workers={}",
            self.started_at.to_rfc3339(),
            self.config.operation,
            self.config.file_name(),
            self.config.clients,
            self.server_workers
        )?;
        writeln!(
            f,
            "  clients: {} succeeded, {} failed",
            self.successes, self.failures
        )?;
        match self.mean_duration {
            Some(d) => writeln!(f, "  mean time: {:.4} s", d.as_secs_f64())?,
            None => writeln!(f, "  mean time: -")?,
        }
        match self.mean_throughput {
            Some(t) => writeln!(f, "  mean throughput: {t:.4} bytes/s")?,
            None => writeln!(f, "  mean throughput: -")?,
        }
        match self.server_delta {
            Some(delta) => write!(
                f,
                "  server workers: {} succeeded, {} failed",
                delta.success, delta.fail
            ),
            None => write!(f, "  server workers: unavailable"),
        }
    }
}

/// Header line matching [`ClientReport`]'s row format.
pub fn report_header() -> String {
    format!(
        "{:<11} {:<10} {:<15} {:<20}",
        "Client", "Status", "Duration (s)", "Throughput (B/s)"
    )
}

async fn perform(
    client: &Client,
    config: BenchConfig,
    data: &[u8],
) -> Result<(), ClientError> {
    match config.operation {
        Operation::List => client.list().await.map(|_| ()),
        Operation::Get => {
            let bytes = client.get(&config.file_name()).await?;
            if bytes.len() == config.payload_len() {
                Ok(())
            } else {
                Err(ClientError::Server(format!(
                    "expected {} bytes, got {}",
                    config.payload_len(),
                    bytes.len()
                )))
            }
        }
        Operation::Post => client.post(&config.file_name(), data).await,
    }
}

/// Run one simulated client.
pub async fn run_client(
    client: Client,
    client_id: usize,
    config: BenchConfig,
    data: Arc<Vec<u8>>,
) -> ClientReport {
    let start = Instant::now();
    let result = perform(&client, config, &data).await;
    let duration = start.elapsed();

    if let Err(ref e) = result {
        warn!(client = client_id, error = %e, "Client failed");
    }

    let ok = result.is_ok();
    let throughput = match config.operation {
        Operation::List => None,
        _ if ok && !duration.is_zero() => {
            Some(config.payload_len() as f64 / duration.as_secs_f64())
        }
        _ => None,
    };

    ClientReport {
        client_id,
        ok,
        duration,
        throughput,
    }
}

/// Make sure the file a GET run downloads exists on the server.
async fn seed_for_get(client: &Client, config: BenchConfig, data: &[u8]) -> Result<(), ClientError> {
    let name = config.file_name();
    if !client.list().await?.contains(&name) {
        info!(file = %name, "Seeding file for GET run");
        client.post(&name, data).await?;
    }
    Ok(())
}

/// Execute a run and return the per-client reports with their summary.
pub async fn run(
    client: &Client,
    server_workers: u32,
    config: BenchConfig,
) -> (Vec<ClientReport>, BenchSummary) {
    let data = match config.operation {
        Operation::List => Arc::new(Vec::new()),
        _ => Arc::new(payload(config.payload_len())),
    };

    if config.operation == Operation::Get {
        if let Err(e) = seed_for_get(client, config, &data).await {
            warn!(error = %e, "Failed to seed file for GET run");
        }
    }

    info!(
        operation = %config.operation,
        file = %config.file_name(),
        clients = config.clients,
        server_workers,
        "Starting benchmark run"
    );

    let before = client.status().await.ok();
    let started_at = Utc::now();

    let mut tasks = JoinSet::new();
    for client_id in 0..config.clients {
        tasks.spawn(run_client(client.clone(), client_id, config, Arc::clone(&data)));
    }

    let mut reports = Vec::with_capacity(config.clients);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => warn!(error = %e, "Client task aborted"),
        }
    }
    reports.sort_by_key(|r| r.client_id);

    let after = client.status().await.ok();
    let mut summary = BenchSummary::from_reports(config, started_at, server_workers, &reports);
    summary.server_delta = before.zip(after).map(|(before, after)| StatusSnapshot {
        // Includes the STATUS request that took the first snapshot
        success: after.success.saturating_sub(before.success),
        fail: after.fail.saturating_sub(before.fail),
    });

    (reports, summary)
}
