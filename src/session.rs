use std::fmt;
use std::sync::Arc;

use chrono::{Local, TimeZone, Utc};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{CloseError, SessionError};
use crate::model::{DeviceDescriptor, UNKNOWN_SERIAL};
use crate::transport::{ConfigTree, Transport, TransportError};

const SUMMARY_SERIAL_LABEL: &str = "Serial Number:";

/// Owns one transport handle and releases it exactly once, either through
/// [`SessionHandle::release`] or on drop.
struct SessionHandle<T: Transport> {
    transport: Arc<T>,
    handle: Option<T::Handle>,
    label: String,
}

impl<T: Transport> SessionHandle<T> {
    fn new(transport: Arc<T>, handle: T::Handle, label: String) -> Self {
        Self {
            transport,
            handle: Some(handle),
            label,
        }
    }

    fn call<R>(
        &mut self,
        f: impl FnOnce(&T, &mut T::Handle) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        match self.handle.as_mut() {
            Some(handle) => f(&self.transport, handle),
            None => Err(TransportError::Released),
        }
    }

    fn release(&mut self) -> Result<(), TransportError> {
        match self.handle.take() {
            Some(handle) => self.transport.close(handle),
            None => Ok(()),
        }
    }
}

impl<T: Transport> Drop for SessionHandle<T> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            debug!("Releasing {} on drop", self.label);
            if let Err(err) = self.release() {
                warn!("Error releasing {}: {}", self.label, err);
            }
        }
    }
}

/// A live, initialized session with one device.
///
/// Only one thread uses a session at a time; it moves into a trigger worker and
/// comes back for teardown. A session that is never explicitly closed is closed
/// when dropped.
pub struct DeviceSession<T: Transport> {
    session_id: usize,
    descriptor: DeviceDescriptor,
    identity: String,
    handle: SessionHandle<T>,
}

impl<T: Transport> fmt::Debug for DeviceSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("session_id", &self.session_id)
            .field("descriptor", &self.descriptor)
            .field("identity", &self.identity)
            .field("open", &self.handle.handle.is_some())
            .finish()
    }
}

impl<T: Transport> DeviceSession<T> {
    pub fn session_id(&self) -> usize {
        self.session_id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Serial number, or [`UNKNOWN_SERIAL`].
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn has_known_identity(&self) -> bool {
        self.identity != UNKNOWN_SERIAL
    }

    /// Runs one driver call against this session's handle.
    pub fn call<R>(
        &mut self,
        f: impl FnOnce(&T, &mut T::Handle) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        self.handle.call(f)
    }

    pub fn close(mut self) -> Result<(), CloseError> {
        let session_id = self.session_id;
        self.handle
            .release()
            .map_err(|source| CloseError { session_id, source })
    }
}

/// Opens a session for one descriptor: resolve, bind, init, identify and
/// optionally set the device clock.
pub fn open<T: Transport>(
    transport: &Arc<T>,
    descriptor: &DeviceDescriptor,
    config: &AppConfig,
) -> Result<DeviceSession<T>, SessionError> {
    let session_id = descriptor.session_id();

    let binding = transport
        .lookup(&descriptor.address)
        .map_err(|source| SessionError::AddressResolution {
            address: descriptor.address.clone(),
            source,
        })?;

    let raw = transport
        .bind(&binding)
        .map_err(|source| SessionError::Bind {
            address: descriptor.address.clone(),
            source,
        })?;
    let mut handle = SessionHandle::new(
        Arc::clone(transport),
        raw,
        format!("cam {} ({})", session_id, descriptor.address),
    );

    info!(
        "Initializing camera: {} at {} (ID: {})",
        descriptor.name, descriptor.address, session_id
    );
    if let Err(source) = handle.call(|t, h| t.init(h)) {
        error!("Failed to initialize camera {}: {}", descriptor.name, source);
        if let Err(err) = handle.release() {
            warn!("Error exiting cam {} after failed init: {}", session_id, err);
        }
        return Err(SessionError::Init {
            name: descriptor.name.clone(),
            address: descriptor.address.clone(),
            source,
        });
    }

    let identity = extract_identity(&mut handle, &config.serial_keys);
    info!("Cam {}: serial number {}", session_id, identity);

    if config.sync_device_clock {
        set_device_clock(&mut handle, session_id, &config.clock_key);
    }

    Ok(DeviceSession {
        session_id,
        descriptor: descriptor.clone(),
        identity,
        handle,
    })
}

/// Opens every descriptor, isolating failures. The result is aligned 1:1 with
/// `descriptors`.
pub fn open_all<T: Transport>(
    transport: &Arc<T>,
    descriptors: &[DeviceDescriptor],
    config: &AppConfig,
) -> Vec<Result<DeviceSession<T>, SessionError>> {
    if config.parallel_open {
        descriptors
            .par_iter()
            .map(|descriptor| open(transport, descriptor, config))
            .collect()
    } else {
        descriptors
            .iter()
            .map(|descriptor| open(transport, descriptor, config))
            .collect()
    }
}

fn extract_identity<T: Transport>(handle: &mut SessionHandle<T>, serial_keys: &[String]) -> String {
    match handle.call(|t, h| t.read_config(h)) {
        Ok(tree) => {
            if let Some(serial) = serial_from_config(&tree, serial_keys) {
                return serial;
            }
            debug!("{}: no serial number widget, trying summary", handle.label);
        }
        Err(err) => debug!("{}: could not read config: {}", handle.label, err),
    }

    let from_summary = match handle.call(|t, h| t.read_summary(h)) {
        Ok(summary) => serial_from_summary(&summary),
        Err(err) => {
            debug!("{}: could not read summary: {}", handle.label, err);
            None
        }
    };
    from_summary.unwrap_or_else(|| UNKNOWN_SERIAL.to_string())
}

/// First non-empty value among `keys`.
pub fn serial_from_config(tree: &ConfigTree, keys: &[String]) -> Option<String> {
    keys.iter()
        .filter_map(|key| tree.try_read_value(key))
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

/// Pulls the value of the `Serial Number:` line out of a driver summary. The
/// summary layout varies with firmware, so this is only a fallback.
pub fn serial_from_summary(summary: &str) -> Option<String> {
    summary
        .lines()
        .find_map(|line| line.split_once(SUMMARY_SERIAL_LABEL))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn set_device_clock<T: Transport>(handle: &mut SessionHandle<T>, session_id: usize, clock_key: &str) {
    let now_epoch = Utc::now().timestamp();
    match handle.call(|t, h| t.write_value(h, clock_key, &now_epoch.to_string())) {
        Ok(()) => {
            let local = Local
                .timestamp_opt(now_epoch, 0)
                .single()
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| now_epoch.to_string());
            info!("Cam {}: time set to {}", session_id, local);
        }
        Err(TransportError::NotSupported(what)) => {
            warn!(
                "Cam {}: setting time not supported ({})",
                session_id, what
            );
        }
        Err(err) => error!("Cam {}: error setting time: {}", session_id, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_from_summary() {
        let summary = "Manufacturer: Canon Inc.\nModel: Canon EOS 80D\n  Version: 3-1.0.1\n  Serial Number: 0123456789ab\nVendor Extension ID: 0xb (1.0)\n";
        assert_eq!(serial_from_summary(summary).as_deref(), Some("0123456789ab"));
    }

    #[test]
    fn test_serial_from_summary_missing_or_blank() {
        assert_eq!(serial_from_summary("Model: Nikon D750\n"), None);
        assert_eq!(serial_from_summary("Serial Number:   \n"), None);
    }

    #[test]
    fn test_serial_from_config_tries_keys_in_order() {
        let keys = vec!["serialnumber".to_string(), "eosserialnumber".to_string()];
        let tree = ConfigTree::new()
            .with_value("serialnumber", "  ")
            .with_value("eosserialnumber", "A1B2");
        assert_eq!(serial_from_config(&tree, &keys).as_deref(), Some("A1B2"));
        assert_eq!(serial_from_config(&ConfigTree::new(), &keys), None);
    }
}
