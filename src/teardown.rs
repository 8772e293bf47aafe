use rayon::prelude::*;
use tracing::{error, info};

use crate::error::CloseError;
use crate::session::DeviceSession;
use crate::transport::Transport;

/// Closes every session exactly once, in parallel. The result is aligned with
/// `sessions`; failures are for reporting only.
pub fn close_all<T: Transport>(sessions: Vec<DeviceSession<T>>) -> Vec<Result<(), CloseError>> {
    info!("Exiting {} camera(s)...", sessions.len());
    sessions
        .into_par_iter()
        .map(|session| {
            let session_id = session.session_id();
            let result = session.close();
            match &result {
                Ok(()) => info!("Exited and freed cam {}", session_id),
                Err(err) => error!("Error exiting cam {}: {}", session_id, err.source),
            }
            result
        })
        .collect()
}
