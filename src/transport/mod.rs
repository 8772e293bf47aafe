pub mod simulated;

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

pub use simulated::{FailStage, SimulatedDeviceConfig, SimulatedTransport};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No supported device found")]
    ModelNotFound,

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Session handle already released")]
    Released,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// One reachable device as reported by the driver's auto-detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEntry {
    pub name: String,
    pub address: String,
}

/// Port and abilities info resolved for an address, ready to bind to a new handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub address: String,
    pub port_index: usize,
}

/// Location of a captured file on the device's storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemotePath {
    pub folder: String,
    pub name: String,
}

impl RemotePath {
    pub fn new(folder: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.folder.trim_end_matches('/'), self.name)
    }
}

/// Flattened snapshot of a device's configuration widgets, keyed by widget name.
///
/// Lookups never fail: a key the device doesn't expose and a key it exposes
/// without a readable value both come back as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigTree {
    values: BTreeMap<String, String>,
}

impl ConfigTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn try_read_value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Capability surface the core needs from a camera driver.
///
/// Implementations must tolerate calls on different handles from different
/// threads at the same time. A single handle is only ever used by one thread
/// at a time.
pub trait Transport: Send + Sync + 'static {
    type Handle: Send + 'static;

    /// Lists reachable devices. Returns `TransportError::ModelNotFound` when
    /// nothing is attached.
    fn enumerate(&self) -> Result<Vec<PortEntry>, TransportError>;

    /// Resolves an enumerated address to port/abilities info.
    fn lookup(&self, address: &str) -> Result<PortBinding, TransportError>;

    /// Creates an uninitialized handle bound to the resolved port.
    fn bind(&self, binding: &PortBinding) -> Result<Self::Handle, TransportError>;

    fn init(&self, handle: &mut Self::Handle) -> Result<(), TransportError>;

    fn read_config(&self, handle: &mut Self::Handle) -> Result<ConfigTree, TransportError>;

    /// Free-text summary as printed by the driver.
    fn read_summary(&self, handle: &mut Self::Handle) -> Result<String, TransportError>;

    fn write_value(
        &self,
        handle: &mut Self::Handle,
        key: &str,
        value: &str,
    ) -> Result<(), TransportError>;

    /// Fires the shutter, leaving the image on the device's storage.
    fn capture(&self, handle: &mut Self::Handle) -> Result<RemotePath, TransportError>;

    fn fetch_file(
        &self,
        handle: &mut Self::Handle,
        remote: &RemotePath,
    ) -> Result<Vec<u8>, TransportError>;

    /// Exits the session and frees the handle.
    fn close(&self, handle: Self::Handle) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_read_value_absent_key() {
        let tree = ConfigTree::new().with_value("serialnumber", "123");
        assert_eq!(tree.try_read_value("serialnumber"), Some("123"));
        assert_eq!(tree.try_read_value("datetime"), None);
    }

    #[test]
    fn test_remote_path_display_trims_trailing_slash() {
        let remote = RemotePath::new("/store_00010001/DCIM/", "IMG_0001.JPG");
        assert_eq!(remote.to_string(), "/store_00010001/DCIM/IMG_0001.JPG");
    }
}
