//! Per-connection request handling shared by every pool backend.
//!
//! A connection is driven exactly once: read request, dispatch, write
//! response, close, then record the outcome. Panics are caught here so a
//! fault never escapes into the pool.

use crate::dispatch;
use crate::protocol::{read_request, write_response};
use crate::status::{Outcome, StatusCounters};
use crate::store::FileStore;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// An accepted connection, owned by exactly one worker.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }
}

/// Everything a worker needs to handle a connection.
#[derive(Clone)]
pub struct WorkerContext {
    store: Arc<dyn FileStore>,
    counters: Arc<dyn StatusCounters>,
    read_buffer: usize,
}

impl WorkerContext {
    pub fn new(
        store: Arc<dyn FileStore>,
        counters: Arc<dyn StatusCounters>,
        read_buffer: usize,
    ) -> Self {
        Self {
            store,
            counters,
            read_buffer,
        }
    }

    pub fn counters(&self) -> &Arc<dyn StatusCounters> {
        &self.counters
    }
}

/// Handle a connection to completion and record its outcome.
pub fn serve(conn: Connection, ctx: &WorkerContext) -> Outcome {
    let Connection { mut stream, peer } = conn;

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
        handle_connection(&mut stream, ctx)
    })) {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(peer = %peer, "Worker panicked while handling connection");
            Outcome::Failure
        }
    };

    // Shut down rather than rely on drop alone: a forked sibling may
    // still hold a duplicate of this descriptor.
    let _ = stream.shutdown(Shutdown::Both);
    drop(stream);

    ctx.counters.record(outcome);
    debug!(peer = %peer, ?outcome, "Connection finished");
    outcome
}

/// Run one request/response cycle without touching the counters.
pub fn handle_connection<S: Read + Write>(stream: &mut S, ctx: &WorkerContext) -> Outcome {
    let request = match read_request(stream, ctx.read_buffer) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Failed to read request");
            return Outcome::Failure;
        }
    };

    let result = dispatch::execute(&request, ctx.store.as_ref(), ctx.counters.as_ref());
    let outcome = dispatch::outcome_of(&result);
    let response = dispatch::to_response(result);

    match write_response(stream, &response) {
        Ok(()) => outcome,
        Err(e) => {
            warn!(error = %e, "Failed to write response");
            Outcome::Failure
        }
    }
}
