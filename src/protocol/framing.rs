//! Frame reassembly and response writing over blocking streams.
//!
//! Bytes arrive in arbitrary chunks. The reader accumulates them and only
//! yields a [`Request`] once the delimiter has been observed; a peer that
//! closes first produces [`FrameError::Incomplete`].

use super::parser::{find_delimiter, parse_frame, Request};
use super::response::Response;
use bytes::{BufMut, BytesMut};
use std::io::{self, Read, Write};

/// Frame terminator for requests and responses.
pub const DELIMITER: &[u8] = b"\r\n\r\n";

/// Initial accumulation buffer size; grows with the request.
const INITIAL_BUFFER_SIZE: usize = 4 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Peer closed before the delimiter arrived.
    #[error("connection closed after {received} bytes without a complete frame")]
    Incomplete { received: usize },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed response body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read one request frame, reading at most `chunk_size` bytes per call.
pub fn read_request<R: Read>(reader: &mut R, chunk_size: usize) -> Result<Request, FrameError> {
    let mut buffer = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
    let mut chunk = vec![0u8; chunk_size.max(1)];

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => {
                return Err(FrameError::Incomplete {
                    received: buffer.len(),
                })
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        // The delimiter may straddle the previous chunk boundary
        let scan_from = buffer.len().saturating_sub(DELIMITER.len() - 1);
        buffer.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_delimiter(&buffer, scan_from) {
            return Ok(parse_frame(&buffer[..end]));
        }
    }
}

/// Serialize a response into a complete frame.
pub fn encode_response(response: &Response) -> Result<BytesMut, FrameError> {
    let mut writer = BytesMut::with_capacity(128).writer();
    serde_json::to_writer(&mut writer, response)?;
    let mut frame = writer.into_inner();
    frame.extend_from_slice(DELIMITER);
    Ok(frame)
}

/// Decode a response frame; the trailing delimiter is optional.
pub fn decode_response(frame: &[u8]) -> Result<Response, FrameError> {
    let body = match find_delimiter(frame, 0) {
        Some(end) => &frame[..end],
        None => frame,
    };
    Ok(serde_json::from_slice(body)?)
}

/// Write a complete response frame.
///
/// The frame is fully encoded before the first byte is written, so an
/// encoding failure never leaves a partial frame on the wire.
pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<(), FrameError> {
    let frame = encode_response(response)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}
