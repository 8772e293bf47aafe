use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{debug, error, info};

use crate::error::RetrievalError;
use crate::model::{CaptureResult, RetrievedFile, UNKNOWN_SERIAL};
use crate::session::DeviceSession;
use crate::transport::{RemotePath, Transport};

/// Shared identifier for one run, used to namespace downloaded files.
pub fn global_timestamp() -> String {
    Local::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Where downloaded files land:
/// `<root>/<identity>/<global_timestamp>_<remote name>`.
///
/// Devices without a serial number use `cam<session id>` as their directory so
/// they can't overwrite each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationLayout {
    root: PathBuf,
    global_timestamp: String,
}

impl DestinationLayout {
    pub fn new(root: impl Into<PathBuf>, global_timestamp: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            global_timestamp: global_timestamp.into(),
        }
    }

    pub fn directory_for(&self, session_id: usize, identity: &str) -> PathBuf {
        let identity = identity.trim();
        if identity.is_empty() || identity == UNKNOWN_SERIAL {
            self.root.join(format!("cam{}", session_id))
        } else {
            self.root.join(sanitize_component(identity))
        }
    }

    pub fn path_for(&self, session_id: usize, identity: &str, remote: &RemotePath) -> PathBuf {
        let base_name = Path::new(&remote.name)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| sanitize_component(&remote.name));
        self.directory_for(session_id, identity)
            .join(format!("{}_{}", self.global_timestamp, base_name))
    }
}

/// Device-reported strings end up in paths; keep them to one plain component.
fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// Downloads the file a successful capture left on the device.
///
/// Failures are recorded in the returned [`RetrievedFile`]; nothing here
/// touches any other device.
pub fn retrieve<T: Transport>(
    session: &mut DeviceSession<T>,
    capture: &CaptureResult,
    layout: &DestinationLayout,
) -> RetrievedFile {
    match capture.remote_path() {
        Some(remote) => retrieve_remote(session, remote, layout),
        None => RetrievedFile {
            session_id: session.session_id(),
            local_path: layout.directory_for(session.session_id(), session.identity()),
            elapsed: Duration::ZERO,
            outcome: Err(RetrievalError::NothingCaptured),
        },
    }
}

/// Downloads `remote` from the session's device into `layout`.
pub fn retrieve_remote<T: Transport>(
    session: &mut DeviceSession<T>,
    remote: &RemotePath,
    layout: &DestinationLayout,
) -> RetrievedFile {
    let session_id = session.session_id();
    let started = Instant::now();
    let local_path = layout.path_for(session_id, session.identity(), remote);
    info!(
        "Cam {} downloading {} to {}",
        session_id,
        remote,
        local_path.display()
    );

    let outcome = fetch_to(session, remote, &local_path);
    let elapsed = started.elapsed();
    match &outcome {
        Ok(bytes) => info!(
            "Cam {} downloaded {} bytes in {:.2}s",
            session_id,
            bytes,
            elapsed.as_secs_f64()
        ),
        Err(err) => error!("Cam {} download failed: {}", session_id, err),
    }

    RetrievedFile {
        session_id,
        local_path,
        elapsed,
        outcome,
    }
}

fn fetch_to<T: Transport>(
    session: &mut DeviceSession<T>,
    remote: &RemotePath,
    local_path: &Path,
) -> Result<u64, RetrievalError> {
    if let Some(dir) = local_path.parent() {
        fs::create_dir_all(dir).map_err(|source| RetrievalError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let data = session.call(|t, h| t.fetch_file(h, remote))?;

    // Write beside the target and rename so a failed write never leaves a
    // truncated file under the final name.
    let partial = partial_path(local_path);
    fs::write(&partial, &data).map_err(|source| RetrievalError::Io {
        path: partial.clone(),
        source,
    })?;
    fs::rename(&partial, local_path).map_err(|source| RetrievalError::Io {
        path: local_path.to_path_buf(),
        source,
    })?;
    debug!("Wrote {}", local_path.display());

    Ok(data.len() as u64)
}

/// `IMG_0001.JPG` -> `IMG_0001.JPG.part`, so same-stem files never share one.
fn partial_path(local_path: &Path) -> PathBuf {
    let mut name = local_path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
