use crate::error::{HubError, HubResult};
use crate::hub::{DeviceCredential, DeviceRegistry};
use tracing::info;

/// Create-or-get of a device identity.
///
/// Relies on the registry rejecting duplicate names atomically: a caller that
/// loses a creation race gets `AlreadyExists` and falls back to the fetch.
pub struct IdentityProvisioner<R> {
    registry: R,
}

impl<R: DeviceRegistry> IdentityProvisioner<R> {
    pub fn new(registry: R) -> Self {
        Self { registry }
    }

    pub async fn ensure_device(&self, name: &str) -> HubResult<DeviceCredential> {
        match self.registry.add_device(name).await {
            Ok(credential) => {
                info!("Created device identity {}", credential.device_id);
                Ok(credential)
            }
            Err(HubError::AlreadyExists(_)) => {
                info!("Device {} already exists, fetching its identity", name);
                self.registry.get_device(name).await
            }
            Err(e) => Err(e),
        }
    }
}
