//! Load generator for a running filepool server.
//!
//! Queries the capacity channel, then runs one benchmark (or the full
//! operation x size x clients matrix) and prints per-client rows followed
//! by a summary for each run.

use clap::Parser;
use filepool::bench::{self, BenchConfig, Operation};
use filepool::client::{fetch_capacity, Client};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the benchmark harness
#[derive(Parser, Debug)]
#[command(name = "filepool-bench")]
#[command(version = "0.1.0")]
#[command(about = "Concurrent load generator for filepool", long_about = None)]
struct BenchArgs {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server operation port
    #[arg(short, long, default_value_t = 6667)]
    port: u16,

    /// Server capacity channel port
    #[arg(long, default_value_t = 6668)]
    control_port: u16,

    /// Operation every client performs
    #[arg(short, long, value_enum, default_value_t = Operation::List)]
    operation: Operation,

    /// Payload size in MiB; files are named `<size>mb.bin`
    #[arg(short, long, default_value_t = 10)]
    size_mb: usize,

    /// Number of concurrent clients
    #[arg(short, long, default_value_t = 1)]
    clients: usize,

    /// Run every operation/size/client combination instead of a single run
    #[arg(long)]
    matrix: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = BenchArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let control_addr = format!("{}:{}", args.host, args.control_port);
    let server_workers = match fetch_capacity(&control_addr).await {
        Ok(capacity) => capacity,
        Err(e) => {
            warn!(address = %control_addr, error = %e, "Failed to query server capacity");
            0
        }
    };
    info!(server_workers, "Server capacity");

    let runs = if args.matrix {
        bench::matrix()
    } else {
        vec![BenchConfig {
            operation: args.operation,
            size_mb: args.size_mb,
            clients: args.clients,
        }]
    };

    let client = Client::new(format!("{}:{}", args.host, args.port));
    for config in runs {
        let (reports, summary) = bench::run(&client, server_workers, config).await;
        println!("{}", bench::report_header());
        for report in &reports {
            println!("{report}");
        }
        println!("{summary}");
        println!();
    }

    Ok(())
}
