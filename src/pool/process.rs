//! Process backend: each connection is handled in a forked child.
//!
//! A supervisor thread owns the queue. It forks a child per connection
//! while fewer than `capacity` children are alive, and reaps finished
//! children by polling their pids. A child records its own outcome in the
//! shared counters and exits with status 0; any other exit means it died
//! before recording, and the supervisor records a failure on its behalf.
//!
//! The counters in the worker context must be process-shared.
//!
//! A child starts with only the forking thread, so locks held by other
//! threads at fork time stay held forever in the child. Children therefore
//! log through a no-op subscriber, close every descriptor they inherited
//! except their own connection, and are killed if the supervisor dies.

use super::{PoolError, WorkerPool};
use crate::config::BackendKind;
use crate::worker::{self, Connection, WorkerContext};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashSet;
use std::io;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::subscriber::NoSubscriber;
use tracing::{debug, error, info, warn};

/// How long the supervisor waits for work before reaping idle children.
const IDLE_REAP_INTERVAL: Duration = Duration::from_millis(50);

/// Back-off between reap polls while every slot is busy.
const FULL_REAP_INTERVAL: Duration = Duration::from_millis(2);

/// Exit status of a child whose outcome is already recorded.
const EXIT_RECORDED: libc::c_int = 0;

/// Exit status of a child that faulted outside the connection handler.
const EXIT_FAULT: libc::c_int = 101;

pub struct ProcessPool {
    sender: Option<Sender<Connection>>,
    supervisor: Option<JoinHandle<()>>,
    capacity: u32,
}

impl ProcessPool {
    pub fn new(capacity: u32, ctx: WorkerContext) -> Result<Self, PoolError> {
        let (sender, receiver) = unbounded();
        let supervisor = Supervisor {
            receiver,
            ctx,
            capacity: capacity as usize,
            children: HashSet::new(),
        };

        let handle = thread::Builder::new()
            .name("process-supervisor".to_string())
            .spawn(move || supervisor.run())?;

        info!(workers = capacity, "Process pool started");

        Ok(Self {
            sender: Some(sender),
            supervisor: Some(handle),
            capacity,
        })
    }

    /// Stop accepting work and wait for queued and running children.
    pub fn shutdown(mut self) {
        self.sender.take();
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
    }
}

impl WorkerPool for ProcessPool {
    fn submit(&self, conn: Connection) -> Result<(), PoolError> {
        let sender = self.sender.as_ref().ok_or(PoolError::Closed)?;
        sender.send(conn).map_err(|_| PoolError::Closed)
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Process
    }

    fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, |s| s.len())
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        self.sender.take();
    }
}

struct Supervisor {
    receiver: Receiver<Connection>,
    ctx: WorkerContext,
    capacity: usize,
    children: HashSet<libc::pid_t>,
}

impl Supervisor {
    fn run(mut self) {
        loop {
            match self.receiver.recv_timeout(IDLE_REAP_INTERVAL) {
                Ok(conn) => {
                    self.reap();
                    while self.children.len() >= self.capacity {
                        thread::sleep(FULL_REAP_INTERVAL);
                        self.reap();
                    }
                    self.spawn(conn);
                }
                Err(RecvTimeoutError::Timeout) => self.reap(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        while !self.children.is_empty() {
            thread::sleep(FULL_REAP_INTERVAL);
            self.reap();
        }
        debug!("Process supervisor stopped");
    }

    fn spawn(&mut self, conn: Connection) {
        let peer = conn.peer;
        // SAFETY: getpid has no preconditions.
        let parent = unsafe { libc::getpid() };

        // SAFETY: the child runs only the connection handler on this
        // thread's state and leaves through `_exit`, never returning into
        // the parent's call stack.
        match unsafe { libc::fork() } {
            -1 => {
                let err = io::Error::last_os_error();
                error!(peer = %peer, error = %err, "Failed to fork worker");
                let _ = conn.stream.shutdown(Shutdown::Both);
                drop(conn);
                self.ctx.counters().record_failure();
            }
            0 => {
                prepare_child(parent, conn.stream.as_raw_fd());
                let _quiet = tracing::subscriber::set_default(NoSubscriber::default());

                let code = match panic::catch_unwind(AssertUnwindSafe(|| {
                    worker::serve(conn, &self.ctx)
                })) {
                    Ok(_) => EXIT_RECORDED,
                    Err(_) => EXIT_FAULT,
                };
                // SAFETY: terminates the child without running the
                // parent's destructors or atexit handlers.
                unsafe { libc::_exit(code) }
            }
            pid => {
                // The child owns the connection now; release our copy
                drop(conn);
                self.children.insert(pid);
                debug!(pid, peer = %peer, live = self.children.len(), "Forked worker");
            }
        }
    }

    /// Collect every child that has exited, without blocking.
    fn reap(&mut self) {
        let mut finished = Vec::new();

        for &pid in &self.children {
            let mut status: libc::c_int = 0;
            // SAFETY: `pid` is a child of this process and `status` is a
            // valid out-pointer.
            let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if rc == pid {
                finished.push((pid, Some(status)));
            } else if rc == -1 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    warn!(pid, error = %err, "Lost track of worker");
                    finished.push((pid, None));
                }
            }
        }

        for (pid, status) in finished {
            self.children.remove(&pid);
            if !status.is_some_and(exited_after_recording) {
                warn!(pid, status = ?status, "Worker died before recording an outcome");
                self.ctx.counters().record_failure();
            }
        }
    }
}

fn exited_after_recording(status: libc::c_int) -> bool {
    libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == EXIT_RECORDED
}

/// Bind a freshly forked child to the supervisor's lifetime and close the
/// listeners and queued connections it inherited.
///
/// The death signal follows the forking thread, which outlives every
/// child it spawned because `Supervisor::run` reaps them all before
/// returning.
fn prepare_child(parent: libc::pid_t, keep: RawFd) {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: prctl and getppid take plain integer arguments.
        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
            // The parent may have exited before the signal was armed
            if libc::getppid() != parent {
                libc::_exit(EXIT_FAULT);
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = parent;

    for fd in inherited_fds(keep) {
        // SAFETY: the descriptor belongs to this process only; the parent's
        // copy is unaffected.
        unsafe { libc::close(fd) };
    }
}

/// Open descriptors above stderr, other than `keep`.
#[cfg(target_os = "linux")]
fn inherited_fds(keep: RawFd) -> Vec<RawFd> {
    let Ok(entries) = std::fs::read_dir("/proc/self/fd") else {
        return Vec::new();
    };
    // Includes the directory's own descriptor, which is closed again by
    // the time the caller gets to it
    entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<RawFd>().ok())
        .filter(|&fd| fd > libc::STDERR_FILENO && fd != keep)
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn inherited_fds(_keep: RawFd) -> Vec<RawFd> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::testing::{drive, settle};
    use crate::protocol::{Data, Status};
    use crate::status::{SharedCounters, StatusCounters, StatusSnapshot};
    use crate::store::{DirStore, FileStore, StoreError};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    fn pool_with_store(
        store: Arc<dyn FileStore>,
        capacity: u32,
    ) -> (ProcessPool, Arc<dyn StatusCounters>) {
        let counters: Arc<dyn StatusCounters> = Arc::new(SharedCounters::new().unwrap());
        let ctx = WorkerContext::new(store, Arc::clone(&counters), 1024);
        (ProcessPool::new(capacity, ctx).unwrap(), counters)
    }

    fn pool_in(
        dir: &std::path::Path,
        capacity: u32,
    ) -> (ProcessPool, Arc<dyn StatusCounters>) {
        pool_with_store(Arc::new(DirStore::open(dir).unwrap()), capacity)
    }

    /// Send one request through `pool` and return whatever came back.
    fn exchange(pool: &dyn WorkerPool, request: &'static [u8]) -> Vec<u8> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(request).unwrap();
            let mut reply = Vec::new();
            let _ = stream.read_to_end(&mut reply);
            reply
        });

        let (stream, peer) = listener.accept().unwrap();
        pool.submit(Connection::new(stream, peer)).unwrap();
        client.join().unwrap()
    }

    /// Store that kills the calling process outright.
    struct AbortingStore;

    impl FileStore for AbortingStore {
        fn list(&self) -> Result<Vec<String>, StoreError> {
            std::process::abort()
        }
        fn read(&self, _: &str) -> Result<Vec<u8>, StoreError> {
            std::process::abort()
        }
        fn write(&self, _: &str, _: &[u8]) -> Result<(), StoreError> {
            std::process::abort()
        }
        fn remove(&self, _: &str) -> Result<(), StoreError> {
            std::process::abort()
        }
    }

    /// Store whose every operation panics.
    struct PanickingStore;

    impl FileStore for PanickingStore {
        fn list(&self) -> Result<Vec<String>, StoreError> {
            panic!("list exploded")
        }
        fn read(&self, _: &str) -> Result<Vec<u8>, StoreError> {
            panic!("read exploded")
        }
        fn write(&self, _: &str, _: &[u8]) -> Result<(), StoreError> {
            panic!("write exploded")
        }
        fn remove(&self, _: &str) -> Result<(), StoreError> {
            panic!("remove exploded")
        }
    }

    #[test]
    fn test_round_trip_through_children() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, counters) = pool_in(dir.path(), 2);
        assert_eq!(pool.backend(), BackendKind::Process);

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let encoded = STANDARD.encode(&payload);
        let posted = drive(&pool, vec![format!("POST data.bin {encoded}\r\n\r\n")]);
        assert_eq!(posted[0].status, Status::Ok);

        let fetched = drive(&pool, vec!["GET data.bin\r\n\r\n".to_string()]);
        let body = fetched[0].data_file.as_ref().unwrap();
        assert_eq!(STANDARD.decode(body).unwrap(), payload);

        assert_eq!(
            settle(counters.as_ref(), 2),
            StatusSnapshot { success: 2, fail: 0 }
        );
        pool.shutdown();
    }

    #[test]
    fn test_children_share_counters() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, counters) = pool_in(dir.path(), 3);

        let mut requests: Vec<String> = (0..6)
            .map(|i| format!("POST p{i}.bin aGk=\r\n\r\n"))
            .collect();
        requests.push("DELETE never.bin\r\n\r\n".to_string());
        drive(&pool, requests);
        settle(counters.as_ref(), 7);

        let status = drive(&pool, vec!["STATUS\r\n\r\n".to_string()]);
        assert_eq!(status[0].success_worker, Some(6));
        assert_eq!(status[0].fail_worker, Some(1));

        let listed = drive(&pool, vec!["LIST\r\n\r\n".to_string()]);
        let expected: Vec<String> = (0..6).map(|i| format!("p{i}.bin")).collect();
        assert_eq!(listed[0].data, Some(Data::Names(expected)));

        assert_eq!(settle(counters.as_ref(), 9).total(), 9);
        pool.shutdown();
    }

    #[test]
    fn test_aborted_child_recorded_once_by_supervisor() {
        let (pool, counters) = pool_with_store(Arc::new(AbortingStore), 1);

        let reply = exchange(&pool, b"LIST\r\n\r\n");
        assert!(reply.is_empty());
        assert_eq!(
            settle(counters.as_ref(), 1),
            StatusSnapshot { success: 0, fail: 1 }
        );

        // Further reaps must not count the same child again
        thread::sleep(IDLE_REAP_INTERVAL * 4);
        assert_eq!(counters.snapshot().total(), 1);
        pool.shutdown();
        assert_eq!(counters.snapshot().total(), 1);
    }

    #[test]
    fn test_panicking_child_recorded_once() {
        let (pool, counters) = pool_with_store(Arc::new(PanickingStore), 1);

        let reply = exchange(&pool, b"GET a.bin\r\n\r\n");
        assert!(reply.is_empty());
        assert_eq!(
            settle(counters.as_ref(), 1),
            StatusSnapshot { success: 0, fail: 1 }
        );

        thread::sleep(IDLE_REAP_INTERVAL * 4);
        pool.shutdown();
        assert_eq!(counters.snapshot().total(), 1);
    }

    #[test]
    fn test_children_survive_concurrent_logging() {
        // Another thread holds the writer lock most of the time while
        // the supervisor forks
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(Mutex::new(std::io::sink()))
            .try_init();

        let stop = Arc::new(AtomicBool::new(false));
        let chatter = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    debug!(busy = true, "Background chatter");
                }
            })
        };

        let dir = tempfile::tempdir().unwrap();
        let (pool, counters) = pool_in(dir.path(), 4);
        let requests: Vec<String> = (0..200)
            .map(|_| "GET missing.bin\r\n\r\n".to_string())
            .collect();

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let responses = drive(&pool, requests);
            let _ = done_tx.send(responses.len());
            pool.shutdown();
        });

        let answered = done_rx.recv_timeout(Duration::from_secs(60));
        stop.store(true, Ordering::Relaxed);
        chatter.join().unwrap();

        assert_eq!(answered, Ok(200));
        assert_eq!(
            settle(counters.as_ref(), 200),
            StatusSnapshot { success: 0, fail: 200 }
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_prepare_child_closes_inherited_fds() {
        let inherited = TcpListener::bind("127.0.0.1:0").unwrap();
        let own = TcpListener::bind("127.0.0.1:0").unwrap();
        let inherited_fd = inherited.as_raw_fd();
        let own_fd = own.as_raw_fd();

        // SAFETY: getpid has no preconditions.
        let parent = unsafe { libc::getpid() };
        // SAFETY: the child only inspects descriptors and exits.
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            prepare_child(parent, own_fd);
            let mut signal: libc::c_int = 0;
            let ok = unsafe {
                libc::prctl(libc::PR_GET_PDEATHSIG, &mut signal as *mut libc::c_int);
                libc::fcntl(inherited_fd, libc::F_GETFD) == -1
                    && libc::fcntl(own_fd, libc::F_GETFD) != -1
                    && libc::fcntl(libc::STDERR_FILENO, libc::F_GETFD) != -1
            };
            let code = if ok && signal == libc::SIGKILL { 0 } else { 1 };
            unsafe { libc::_exit(code) };
        }

        let mut status = 0;
        let reaped = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(reaped, pid);
        assert!(exited_after_recording(status));

        // The parent's copies are untouched
        assert!(inherited.local_addr().is_ok());
    }
}
