//! Response object sent back to clients.
//!
//! Every response carries `status`; the remaining fields depend on the
//! verb and are omitted when absent, so the same type serves both the
//! server encoder and the client decoder.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Error,
}

/// Contents of the `data` field: a name list on LIST, a message on error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Data {
    Names(Vec<String>),
    Message(String),
}

/// Successful command output, before it is given a wire shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Stored names.
    Names(Vec<String>),
    /// A file name with its transport-encoded contents.
    File { name: String, encoded: String },
    /// Name that was removed.
    Deleted(String),
    /// Counter snapshot.
    Status { success: u64, fail: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Data>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_namafile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_worker: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_worker: Option<u64>,
}

impl Response {
    fn empty(status: Status) -> Self {
        Self {
            status,
            data: None,
            data_namafile: None,
            data_file: None,
            data_filename: None,
            success_worker: None,
            fail_worker: None,
        }
    }

    /// Wire shape of a successful payload.
    pub fn ok(payload: Payload) -> Self {
        let mut response = Self::empty(Status::Ok);
        match payload {
            Payload::Names(names) => response.data = Some(Data::Names(names)),
            Payload::File { name, encoded } => {
                response.data_namafile = Some(name);
                response.data_file = Some(encoded);
            }
            Payload::Deleted(name) => response.data_filename = Some(name),
            Payload::Status { success, fail } => {
                response.success_worker = Some(success);
                response.fail_worker = Some(fail);
            }
        }
        response
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut response = Self::empty(Status::Error);
        response.data = Some(Data::Message(message.into()));
        response
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Error message, if this is an error response.
    pub fn message(&self) -> Option<&str> {
        match (&self.status, &self.data) {
            (Status::Error, Some(Data::Message(message))) => Some(message.as_str()),
            _ => None,
        }
    }
}
