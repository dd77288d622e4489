//! Capacity channel.
//!
//! A second listener that answers every accepted connection with the
//! pool's configured capacity as a 4-byte big-endian unsigned integer,
//! then closes it. Benchmark clients use it to discover server-side
//! parallelism before generating load.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener};
use tracing::{debug, error, info};

/// Wire form of the capacity.
pub fn encode_capacity(capacity: u32) -> [u8; 4] {
    capacity.to_be_bytes()
}

pub struct CapacityChannel {
    listener: TcpListener,
    capacity: u32,
}

impl CapacityChannel {
    pub fn new(listener: TcpListener, capacity: u32) -> Self {
        Self { listener, capacity }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve forever. Failures on one connection never stop the loop.
    pub fn run(self) {
        info!(
            address = ?self.listener.local_addr().ok(),
            capacity = self.capacity,
            "Capacity channel listening"
        );

        let reply = encode_capacity(self.capacity);
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    debug!(peer = %peer, "Sending capacity");
                    if let Err(e) = stream.write_all(&reply) {
                        debug!(peer = %peer, error = %e, "Failed to send capacity");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept control connection");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpStream;
    use std::thread;

    #[test]
    fn test_encode_capacity() {
        assert_eq!(encode_capacity(10), [0, 0, 0, 10]);
        assert_eq!(encode_capacity(0x0102_0304), [1, 2, 3, 4]);
    }

    #[test]
    fn test_repeated_queries_return_same_value() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let channel = CapacityChannel::new(listener, 42);
        let addr = channel.local_addr().unwrap();
        thread::spawn(move || channel.run());

        for _ in 0..5 {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).unwrap();
            assert_eq!(reply, [0, 0, 0, 42]);
        }
    }
}
