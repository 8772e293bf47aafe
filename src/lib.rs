pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod gate;
pub mod model;
pub mod progress;
pub mod report;
pub mod retrieval;
pub mod session;
pub mod teardown;
pub mod transport;
pub mod trigger;

pub use config::AppConfig;
pub use engine::CaptureEngine;
pub use error::Error;
pub use model::{CaptureResult, DeviceDescriptor, RetrievedFile, UNKNOWN_SERIAL};
pub use progress::{RigReporter, SilentReporter};
pub use report::{RunOutcome, RunReport};
pub use session::DeviceSession;
pub use transport::{RemotePath, Transport, TransportError};
pub use trigger::{ArmedRound, RoundOutcome, TriggerCoordinator};
