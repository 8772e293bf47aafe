use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Report error: {0}")]
    Report(#[from] csv::Error),
}

/// Enumeration failed for a reason other than "no devices attached".
#[derive(Error, Debug)]
#[error("Device enumeration failed: {source}")]
pub struct DiscoveryError {
    #[from]
    pub source: TransportError,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Address {address} is no longer present: {source}")]
    AddressResolution {
        address: String,
        #[source]
        source: TransportError,
    },

    #[error("Could not bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to initialize {name} at {address}: {source}")]
    Init {
        name: String,
        address: String,
        #[source]
        source: TransportError,
    },
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Capture did not complete within {0:?}")]
    TimedOut(Duration),

    #[error("Round cancelled before the gate opened")]
    Cancelled,

    #[error("Worker exited without reporting a result")]
    WorkerLost,
}

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Nothing to retrieve: capture did not succeed")]
    NothingCaptured,

    #[error("Fetch failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Could not write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Retrieval did not complete within {0:?}")]
    TimedOut(Duration),

    #[error("Worker exited without reporting a result")]
    WorkerLost,
}

#[derive(Error, Debug)]
#[error("Failed to close session {session_id}: {source}")]
pub struct CloseError {
    pub session_id: usize,
    #[source]
    pub source: TransportError,
}
