//! File transfer wire protocol.
//!
//! One request and one response per connection, both terminated by the
//! frame delimiter `\r\n\r\n`:
//!
//! ```text
//! Request:  LIST\r\n\r\n
//! Response: {"status":"OK","data":["a.bin"]}\r\n\r\n
//!
//! Request:  POST a.bin SGVsbG8=\r\n\r\n
//! Response: {"status":"OK","data_namafile":"a.bin","data_file":"SGVsbG8="}\r\n\r\n
//! ```
//!
//! - `parser`: pure byte-buffer to [`Request`] parsing
//! - `response`: the JSON response object and its payload shapes
//! - `framing`: blocking stream reassembly and response writing

pub mod framing;
pub mod parser;
pub mod response;

pub use framing::{read_request, write_response, FrameError, DELIMITER};
pub use parser::{ParseResult, Request, Verb};
pub use response::{Data, Payload, Response, Status};
