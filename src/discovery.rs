use tracing::{debug, info};

use crate::error::DiscoveryError;
use crate::model::DeviceDescriptor;
use crate::transport::{Transport, TransportError};

/// Lists the devices the driver can currently reach, in enumeration order.
///
/// "No devices attached" is an empty list, not an error. Addresses are only
/// meaningful within this run; the driver may hand them out again later.
pub fn discover<T: Transport>(transport: &T) -> Result<Vec<DeviceDescriptor>, DiscoveryError> {
    let entries = match transport.enumerate() {
        Ok(entries) => entries,
        Err(TransportError::ModelNotFound) => {
            info!("No cameras found.");
            return Ok(Vec::new());
        }
        Err(source) => return Err(DiscoveryError { source }),
    };

    let descriptors: Vec<DeviceDescriptor> = entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| DeviceDescriptor {
            index,
            name: entry.name,
            address: entry.address,
        })
        .collect();

    for descriptor in &descriptors {
        debug!(
            "Found camera: {} on port {}",
            descriptor.name, descriptor.address
        );
    }
    info!("Detected {} camera(s)", descriptors.len());

    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SimulatedDeviceConfig, SimulatedTransport};

    #[test]
    fn test_discover_preserves_enumeration_order() {
        let transport = SimulatedTransport::new(vec![
            SimulatedDeviceConfig::new("Canon EOS 80D", "usb:001,007"),
            SimulatedDeviceConfig::new("Nikon D750", "usb:001,003"),
        ]);
        let descriptors = discover(&transport).unwrap();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].index, 0);
        assert_eq!(descriptors[0].address, "usb:001,007");
        assert_eq!(descriptors[1].name, "Nikon D750");
        assert_eq!(descriptors[1].session_id(), 2);
    }

    #[test]
    fn test_no_devices_is_empty_not_error() {
        let transport = SimulatedTransport::new(vec![]);
        assert!(discover(&transport).unwrap().is_empty());
    }

    #[test]
    fn test_enumeration_failure_is_fatal() {
        let transport = SimulatedTransport::failing_enumeration("usb bus unavailable");
        let err = discover(&transport).unwrap_err();
        assert!(err.to_string().contains("usb bus unavailable"));
    }
}
