//! Bounded worker pools with interchangeable backends.
//!
//! - `ThreadPool`: `capacity` long-lived OS threads pulling from a queue
//! - `ProcessPool`: one forked OS process per connection, at most
//!   `capacity` alive at once
//!
//! Both accept submissions without blocking. Connections beyond capacity
//! wait in an unbounded queue; nothing pushes back on the acceptor.

mod process;
mod thread;

pub use process::ProcessPool;
pub use thread::ThreadPool;

use crate::config::{BackendKind, WorkerPoolConfig};
use crate::status::{LockedCounters, SharedCounters, StatusCounters};
use crate::worker::{Connection, WorkerContext};
use std::io;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    Closed,
    #[error("failed to start worker: {0}")]
    Spawn(#[from] io::Error),
}

pub trait WorkerPool: Send + Sync {
    /// Hand over a connection. Returns once it is queued.
    fn submit(&self, conn: Connection) -> Result<(), PoolError>;

    /// Configured number of concurrent workers.
    fn capacity(&self) -> u32;

    fn backend(&self) -> BackendKind;

    /// Connections waiting for a free worker.
    fn queued(&self) -> usize;
}

/// Counters with the sharing discipline the backend needs.
pub fn counters_for(backend: BackendKind) -> io::Result<Arc<dyn StatusCounters>> {
    Ok(match backend {
        BackendKind::Thread => Arc::new(LockedCounters::new()),
        BackendKind::Process => Arc::new(SharedCounters::new()?),
    })
}

/// Start the pool described by `config`.
///
/// `ctx` must carry counters from [`counters_for`] for the same backend.
pub fn start(config: WorkerPoolConfig, ctx: WorkerContext) -> Result<Box<dyn WorkerPool>, PoolError> {
    Ok(match config.backend() {
        BackendKind::Thread => Box::new(ThreadPool::new(config.capacity(), ctx)?),
        BackendKind::Process => Box::new(ProcessPool::new(config.capacity(), ctx)?),
    })
}
