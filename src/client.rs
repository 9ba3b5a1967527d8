use tokio::sync::broadcast;

use crate::registration::{Authentication, OperationStatus, RegistrationRequest, RegistrationResult};
use crate::state_machine::{RegistrationState, RegistrationStateMachine};
use crate::transport::ProvisioningTransport;

/// Client for registering one device with the provisioning service
///
/// # Example
/// ```no_run
/// use azure_iot_provisioning::ProvisioningDeviceClient;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = ProvisioningDeviceClient::builder()
///         .registration("0ne000EEBBD", "my-device")
///         .symmetric_key("O+H9VTcdJP0Tqkl7bh4nVG0OJNrAataMpuWB54D0VEc=")?
///         .build_http()?;
///
///     let result = client.register().await?;
///     if let Some(device) = result.assigned() {
///         println!("assigned to {:?}", device.assigned_hub);
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct ProvisioningDeviceClient<T> {
    machine: RegistrationStateMachine<T>,
    request: RegistrationRequest,
    auth: Authentication,
}

impl<T> ProvisioningDeviceClient<T>
where
    T: ProvisioningTransport,
{
    /// Create a client from its parts
    pub fn new(
        machine: RegistrationStateMachine<T>,
        request: RegistrationRequest,
        auth: Authentication,
    ) -> Self {
        Self {
            machine,
            request,
            auth,
        }
    }

    /// Register the device and wait for the service to assign it (or refuse to)
    pub async fn register(&self) -> crate::Result<RegistrationResult> {
        self.machine.register(&self.request, &self.auth).await
    }

    /// Stop a running registration
    pub async fn cancel(&self) -> crate::Result<()> {
        self.machine.cancel().await
    }

    /// Stop a running registration and close the transport's connection
    pub async fn disconnect(&self) -> crate::Result<()> {
        self.machine.disconnect().await
    }

    /// Progress notifications for registrations started after this call
    pub fn status_updates(&self) -> broadcast::Receiver<OperationStatus> {
        self.machine.status_updates()
    }

    /// Where the current registration is in the protocol
    pub fn state(&self) -> RegistrationState {
        self.machine.state()
    }

    /// The request this client registers with
    pub fn request(&self) -> &RegistrationRequest {
        &self.request
    }
}
