//! Thread backend: a fixed set of OS threads sharing process memory.

use super::{PoolError, WorkerPool};
use crate::config::BackendKind;
use crate::worker::{self, Connection, WorkerContext};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

pub struct ThreadPool {
    sender: Option<Sender<Connection>>,
    workers: Vec<JoinHandle<()>>,
    capacity: u32,
}

impl ThreadPool {
    /// Spawn `capacity` worker threads.
    pub fn new(capacity: u32, ctx: WorkerContext) -> Result<Self, PoolError> {
        let (sender, receiver) = unbounded();
        let mut workers = Vec::with_capacity(capacity as usize);

        for worker_id in 0..capacity {
            let receiver = receiver.clone();
            let ctx = ctx.clone();

            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, receiver, ctx))?;

            workers.push(handle);
        }

        info!(workers = capacity, "Thread pool started");

        Ok(Self {
            sender: Some(sender),
            workers,
            capacity,
        })
    }

    /// Stop accepting work, let queued connections drain, and join workers.
    pub fn shutdown(mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(worker_id: u32, receiver: Receiver<Connection>, ctx: WorkerContext) {
    debug!(worker = worker_id, "Worker started");

    // `serve` contains panics, so one bad connection never ends the loop
    for conn in receiver.iter() {
        worker::serve(conn, &ctx);
    }

    debug!(worker = worker_id, "Worker stopped");
}

impl WorkerPool for ThreadPool {
    fn submit(&self, conn: Connection) -> Result<(), PoolError> {
        let sender = self.sender.as_ref().ok_or(PoolError::Closed)?;
        sender.send(conn).map_err(|_| PoolError::Closed)
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Thread
    }

    fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, |s| s.len())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Workers exit once the queue drains; they are not joined here
        self.sender.take();
    }
}
