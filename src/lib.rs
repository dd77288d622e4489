//! filepool: a pooled file-transfer server
//!
//! Clients send one framed text request per connection (`LIST`, `GET`,
//! `POST`, `DELETE`, `STATUS`) and receive one JSON response. Each accepted
//! connection is handed to a fixed-capacity worker pool backed either by
//! threads or by forked processes.
//!
//! Features:
//! - File storage in a flat directory with base64 transport encoding
//! - Shared success/fail counters across all workers
//! - A capacity channel that reports the pool size
//! - An async client and a load-generating benchmark
//! - Configuration via CLI arguments or TOML file

pub mod bench;
pub mod client;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod status;
pub mod store;
pub mod worker;
