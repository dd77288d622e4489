//! Command dispatcher.
//!
//! Maps a parsed [`Request`] to a store operation or a counter snapshot.
//! Every verb has an explicit handler and an exact argument count; anything
//! else fails closed with "request not recognized".

use crate::protocol::{Payload, Request, Response, Verb};
use crate::status::{Outcome, StatusCounters};
use crate::store::{FileStore, StoreError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, warn};

/// Message sent for unknown verbs and wrong argument counts.
pub const NOT_RECOGNIZED: &str = "request not recognized";

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Unknown verb or wrong argument count.
    #[error("{}", NOT_RECOGNIZED)]
    Unrecognized,
    #[error("invalid file encoding: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CommandError {
    /// Counter outcome for a connection that delivered this error.
    ///
    /// An unrecognized request still got a well-formed answer and counts
    /// as handled; store and decode failures count as failed.
    pub fn outcome(&self) -> Outcome {
        match self {
            CommandError::Unrecognized => Outcome::Success,
            CommandError::Decode(_) | CommandError::Store(_) => Outcome::Failure,
        }
    }
}

pub type CommandResult = Result<Payload, CommandError>;

/// Counter outcome for a connection whose response was written.
pub fn outcome_of(result: &CommandResult) -> Outcome {
    match result {
        Ok(_) => Outcome::Success,
        Err(e) => e.outcome(),
    }
}

/// Wire form of a command result.
pub fn to_response(result: CommandResult) -> Response {
    match result {
        Ok(payload) => Response::ok(payload),
        Err(e) => Response::error(e.to_string()),
    }
}

/// Execute a request. Never panics on malformed input.
pub fn execute(
    request: &Request,
    store: &dyn FileStore,
    counters: &dyn StatusCounters,
) -> CommandResult {
    debug!(verb = request.verb().as_str(), args = request.args().len(), "Dispatching");

    let result = match (request.verb(), request.args()) {
        (Verb::List, []) => list(store),
        (Verb::Get, [name]) => get(store, name),
        (Verb::Post, [name, encoded]) => post(store, name, encoded),
        (Verb::Delete, [name]) => delete(store, name),
        (Verb::Status, []) => Ok(status(counters)),
        _ => Err(CommandError::Unrecognized),
    };

    if let Err(ref e) = result {
        warn!(verb = request.verb().as_str(), error = %e, "Command failed");
    }
    result
}

fn list(store: &dyn FileStore) -> CommandResult {
    Ok(Payload::Names(store.list()?))
}

fn get(store: &dyn FileStore, name: &str) -> CommandResult {
    let bytes = store.read(name)?;
    Ok(Payload::File {
        name: name.to_string(),
        encoded: STANDARD.encode(bytes),
    })
}

fn post(store: &dyn FileStore, name: &str, encoded: &str) -> CommandResult {
    let bytes = STANDARD.decode(encoded)?;
    store.write(name, &bytes)?;
    Ok(Payload::File {
        name: name.to_string(),
        encoded: encoded.to_string(),
    })
}

fn delete(store: &dyn FileStore, name: &str) -> CommandResult {
    store.remove(name)?;
    Ok(Payload::Deleted(name.to_string()))
}

fn status(counters: &dyn StatusCounters) -> Payload {
    let snapshot = counters.snapshot();
    Payload::Status {
        success: snapshot.success,
        fail: snapshot.fail,
    }
}
