//! Async client for the file transfer protocol.
//!
//! Each call opens a fresh connection, sends one request frame, and reads
//! until the response delimiter or EOF.

use crate::protocol::framing::decode_response;
use crate::protocol::parser::find_delimiter;
use crate::protocol::{Data, FrameError, Request, Response, Verb, DELIMITER};
use crate::status::StatusSnapshot;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Read buffer growth step.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("server closed the connection without a response")]
    NoResponse,
    /// The server answered with an ERROR response.
    #[error("server error: {0}")]
    Server(String),
    #[error("response is missing {0}")]
    MissingField(&'static str),
    #[error("invalid file encoding in response: {0}")]
    Decode(#[from] base64::DecodeError),
}

#[derive(Debug, Clone)]
pub struct Client {
    addr: String,
}

impl Client {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn send(&self, request: &Request) -> Result<Response, ClientError> {
        self.send_raw(&request.encode()).await
    }

    /// Send pre-encoded bytes and decode whatever comes back.
    pub async fn send_raw(&self, frame: &[u8]) -> Result<Response, ClientError> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        stream.write_all(frame).await?;

        let mut buffer = BytesMut::with_capacity(READ_CHUNK);
        loop {
            let scan_from = buffer.len().saturating_sub(DELIMITER.len() - 1);
            buffer.reserve(READ_CHUNK);
            let n = stream.read_buf(&mut buffer).await?;
            if n == 0 || find_delimiter(&buffer, scan_from).is_some() {
                break;
            }
        }

        if buffer.is_empty() {
            return Err(ClientError::NoResponse);
        }
        Ok(decode_response(&buffer)?)
    }

    async fn call(&self, verb: Verb, args: &[&str]) -> Result<Response, ClientError> {
        let request = Request::new(verb, args.iter().map(|a| a.to_string()).collect());
        let response = self.send(&request).await?;
        if response.is_ok() {
            Ok(response)
        } else {
            let message = response.message().unwrap_or("unknown error").to_string();
            Err(ClientError::Server(message))
        }
    }

    pub async fn list(&self) -> Result<Vec<String>, ClientError> {
        match self.call(Verb::List, &[]).await?.data {
            Some(Data::Names(names)) => Ok(names),
            _ => Err(ClientError::MissingField("data")),
        }
    }

    pub async fn get(&self, name: &str) -> Result<Vec<u8>, ClientError> {
        let response = self.call(Verb::Get, &[name]).await?;
        let encoded = response
            .data_file
            .ok_or(ClientError::MissingField("data_file"))?;
        Ok(STANDARD.decode(encoded)?)
    }

    pub async fn post(&self, name: &str, data: &[u8]) -> Result<(), ClientError> {
        let encoded = STANDARD.encode(data);
        self.call(Verb::Post, &[name, &encoded]).await?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<(), ClientError> {
        self.call(Verb::Delete, &[name]).await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<StatusSnapshot, ClientError> {
        let response = self.call(Verb::Status, &[]).await?;
        Ok(StatusSnapshot {
            success: response
                .success_worker
                .ok_or(ClientError::MissingField("success_worker"))?,
            fail: response
                .fail_worker
                .ok_or(ClientError::MissingField("fail_worker"))?,
        })
    }
}

/// Ask the capacity channel for the server's worker count.
pub async fn fetch_capacity(addr: &str) -> Result<u32, ClientError> {
    let mut stream = TcpStream::connect(addr).await?;
    Ok(stream.read_u32().await?)
}
