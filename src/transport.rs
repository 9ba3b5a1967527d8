use async_trait::async_trait;

use crate::registration::{Authentication, RegistrationRequest, RegistrationResult};

/// A way of talking to the device provisioning service
///
/// Implementations translate responses into [`RegistrationResult`]s: `Assigning` for anything
/// that needs another round trip, errors for everything terminal that is not a result.
#[async_trait]
pub trait ProvisioningTransport: Send + Sync {
    /// Submit a registration
    async fn registration_request(
        &self,
        request: &RegistrationRequest,
        auth: &Authentication,
    ) -> crate::Result<RegistrationResult>;

    /// Ask for the status of a registration the service is still assigning
    async fn query_operation_status(
        &self,
        request: &RegistrationRequest,
        operation_id: &str,
        auth: &Authentication,
    ) -> crate::Result<RegistrationResult>;

    /// Complete every outstanding call with a cancellation error
    async fn cancel(&self) -> crate::Result<()>;

    /// Cancel outstanding calls and release any connection
    async fn disconnect(&self) -> crate::Result<()>;
}

#[async_trait]
impl<T> ProvisioningTransport for std::sync::Arc<T>
where
    T: ProvisioningTransport + ?Sized,
{
    async fn registration_request(
        &self,
        request: &RegistrationRequest,
        auth: &Authentication,
    ) -> crate::Result<RegistrationResult> {
        (**self).registration_request(request, auth).await
    }

    async fn query_operation_status(
        &self,
        request: &RegistrationRequest,
        operation_id: &str,
        auth: &Authentication,
    ) -> crate::Result<RegistrationResult> {
        (**self)
            .query_operation_status(request, operation_id, auth)
            .await
    }

    async fn cancel(&self) -> crate::Result<()> {
        (**self).cancel().await
    }

    async fn disconnect(&self) -> crate::Result<()> {
        (**self).disconnect().await
    }
}
