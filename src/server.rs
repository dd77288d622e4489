//! TCP server for file transfer connections.
//!
//! A single blocking accept loop hands every connection to the worker pool
//! and immediately returns to accept. The capacity channel runs alongside
//! on its own thread.

use crate::config::Config;
use crate::control::CapacityChannel;
use crate::pool::{self, PoolError, WorkerPool};
use crate::status::StatusCounters;
use crate::store::FileStore;
use crate::worker::{Connection, WorkerContext};
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};

/// Listen backlog for the operation port; overflow is left to the OS.
const LISTEN_BACKLOG: i32 = 10;

/// Listen backlog for the capacity channel.
const CONTROL_BACKLOG: i32 = 128;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    control: CapacityChannel,
    pool: Box<dyn WorkerPool>,
    counters: Arc<dyn StatusCounters>,
}

impl Server {
    /// Bind both listeners and start the worker pool.
    pub fn bind(config: &Config, store: Arc<dyn FileStore>) -> Result<Self, ServerError> {
        let listener = bind_listener(&config.operation_addr(), LISTEN_BACKLOG)?;
        let control_listener = bind_listener(&config.control_addr(), CONTROL_BACKLOG)?;

        let counters = pool::counters_for(config.pool.backend())?;
        let ctx = WorkerContext::new(store, Arc::clone(&counters), config.read_buffer);
        let pool = pool::start(config.pool, ctx)?;

        Ok(Server {
            listener,
            control: CapacityChannel::new(control_listener, config.pool.capacity()),
            pool,
            counters,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn control_addr(&self) -> io::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn counters(&self) -> Arc<dyn StatusCounters> {
        Arc::clone(&self.counters)
    }

    /// Start the capacity channel and accept connections forever.
    pub fn run(self) -> Result<(), ServerError> {
        let Server {
            listener,
            control,
            pool,
            counters,
        } = self;

        thread::Builder::new()
            .name("capacity-channel".to_string())
            .spawn(move || control.run())?;

        info!(
            address = ?listener.local_addr().ok(),
            workers = pool.capacity(),
            backend = %pool.backend(),
            "Server listening"
        );

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, queued = pool.queued(), "Accepted connection");
                    if let Err(e) = pool.submit(Connection::new(stream, peer)) {
                        // The connection was dropped unanswered
                        error!(peer = %peer, error = %e, "Failed to submit connection");
                        counters.record_failure();
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Create a blocking listener with `SO_REUSEADDR` and the given backlog.
fn bind_listener(addr: &str, backlog: i32) -> Result<TcpListener, ServerError> {
    let bind_error = |source: io::Error| ServerError::Bind {
        addr: addr.to_string(),
        source,
    };

    let socket_addr = addr
        .to_socket_addrs()
        .map_err(bind_error)?
        .next()
        .ok_or_else(|| {
            bind_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "address resolved to nothing",
            ))
        })?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(socket_addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(bind_error)?;

    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.bind(&socket_addr.into()).map_err(bind_error)?;
    socket.listen(backlog).map_err(bind_error)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, WorkerPoolConfig};
    use crate::pool::testing::settle;
    use crate::protocol::framing::decode_response;
    use crate::protocol::{Data, Response, Status};
    use crate::status::StatusSnapshot;
    use crate::store::DirStore;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::path::Path;

    fn test_config(root: &Path, workers: usize, backend: BackendKind) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            control_port: 0,
            pool: WorkerPoolConfig::new(workers, backend).unwrap(),
            read_buffer: 1024,
            root: root.to_path_buf(),
            log_level: "info".to_string(),
        }
    }

    /// Start a server in the background, returning its addresses.
    fn start(
        root: &Path,
        workers: usize,
        backend: BackendKind,
    ) -> (SocketAddr, SocketAddr, Arc<dyn StatusCounters>) {
        let config = test_config(root, workers, backend);
        let store = Arc::new(DirStore::open(&config.root).unwrap());
        let server = Server::bind(&config, store).unwrap();
        let addr = server.local_addr().unwrap();
        let control = server.control_addr().unwrap();
        let counters = server.counters();
        thread::spawn(move || server.run());
        (addr, control, counters)
    }

    fn raw(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(request).unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).unwrap();
        reply
    }

    fn send(addr: SocketAddr, request: &str) -> Response {
        decode_response(&raw(addr, request.as_bytes())).unwrap()
    }

    fn query_capacity(control: SocketAddr) -> u32 {
        let mut stream = TcpStream::connect(control).unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        u32::from_be_bytes(buf)
    }

    #[test]
    fn test_example_session() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _, _) = start(dir.path(), 2, BackendKind::Thread);

        assert_eq!(raw(addr, b"LIST\r\n\r\n"), b"{\"status\":\"OK\",\"data\":[]}\r\n\r\n");
        let posted =
            b"{\"status\":\"OK\",\"data_namafile\":\"a.bin\",\"data_file\":\"SGVsbG8=\"}\r\n\r\n";
        assert_eq!(raw(addr, b"POST a.bin SGVsbG8=\r\n\r\n"), posted);
        assert_eq!(raw(addr, b"GET a.bin\r\n\r\n"), posted);
        assert_eq!(
            raw(addr, b"DELETE a.bin\r\n\r\n"),
            b"{\"status\":\"OK\",\"data_filename\":\"a.bin\"}\r\n\r\n"
        );

        let missing = send(addr, "GET a.bin\r\n\r\n");
        assert_eq!(missing.status, Status::Error);
        assert!(!missing.message().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_verb_then_normal_service() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _, _) = start(dir.path(), 1, BackendKind::Thread);

        let rejected = send(addr, "EXPLODE now\r\n\r\n");
        assert_eq!(rejected.message(), Some("request not recognized"));
        assert!(send(addr, "LIST\r\n\r\n").is_ok());
    }

    #[test]
    fn test_abandoned_connection_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _, counters) = start(dir.path(), 1, BackendKind::Thread);

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"LIST\r\n").unwrap();
        drop(stream);

        assert_eq!(
            settle(counters.as_ref(), 1),
            StatusSnapshot { success: 0, fail: 1 }
        );
        assert!(send(addr, "LIST\r\n\r\n").is_ok());
    }

    #[test]
    fn test_capacity_stable_under_load() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, control, counters) = start(dir.path(), 3, BackendKind::Thread);

        let load: Vec<_> = (0..16)
            .map(|i| {
                thread::spawn(move || send(addr, &format!("POST c{i}.bin aGk=\r\n\r\n")))
            })
            .collect();
        for _ in 0..8 {
            assert_eq!(query_capacity(control), 3);
        }
        for handle in load {
            assert!(handle.join().unwrap().is_ok());
        }
        assert_eq!(settle(counters.as_ref(), 16).total(), 16);
    }

    #[test]
    fn test_process_backend_session() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, control, counters) = start(dir.path(), 2, BackendKind::Process);
        assert_eq!(query_capacity(control), 2);

        let posts: Vec<_> = (0..8)
            .map(|i| thread::spawn(move || send(addr, &format!("POST m{i}.bin aGk=\r\n\r\n"))))
            .collect();
        for handle in posts {
            assert!(handle.join().unwrap().is_ok());
        }
        settle(counters.as_ref(), 8);

        let listed = send(addr, "LIST\r\n\r\n");
        let expected: Vec<String> = (0..8).map(|i| format!("m{i}.bin")).collect();
        assert_eq!(listed.data, Some(Data::Names(expected)));
        settle(counters.as_ref(), 9);

        let status = send(addr, "STATUS\r\n\r\n");
        assert_eq!(status.success_worker, Some(9));
        assert_eq!(status.fail_worker, Some(0));
    }

    #[test]
    fn test_bind_error_names_address() {
        let err = bind_listener("definitely-not-a-host.invalid:1", LISTEN_BACKLOG).unwrap_err();
        assert!(err.to_string().contains("definitely-not-a-host.invalid:1"));
    }
}
