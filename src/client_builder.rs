use std::marker::PhantomData;

use thiserror::Error;

use crate::config::ProvisioningConfig;
#[cfg(feature = "http-transport")]
use crate::http_transport::HttpTransport;
#[cfg(feature = "mqtt-transport")]
use crate::mqtt_transport::MqttTransport;
use crate::registration::{Authentication, RegistrationRequest, TpmCredentials, X509Identity};
use crate::state_machine::RegistrationStateMachine;
use crate::transport::ProvisioningTransport;
use crate::{ProvisioningDeviceClient, ProvisioningError};

impl ProvisioningDeviceClient<()> {
    /// Get a builder for the provisioning client
    pub fn builder() -> ProvisioningClientBuilder<ProvisioningClientBuilderUninitialized> {
        ProvisioningClientBuilder::default()
    }
}

/// Error related to building the client
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientBuilderError {
    /// Uninitialized field
    #[error("{0} must be initialized")]
    UninitializedField(&'static str),
    /// The supplied credentials cannot be used
    #[error("invalid credentials: {0}")]
    InvalidCredentials(#[from] ProvisioningError),
}

/// The client builder has no initialized fields and requires the scope and registration id
#[derive(Debug)]
pub struct ProvisioningClientBuilderUninitialized;
/// The client builder has registration details and can have credentials initialized
#[derive(Debug)]
pub struct ProvisioningClientBuilderInitializedRegistration;
/// The client builder has all fields required to be built
#[derive(Debug)]
pub struct ProvisioningClientBuilderInitializedCredentials;

/// Builder object for the provisioning client
#[derive(Debug)]
pub struct ProvisioningClientBuilder<T> {
    request: Option<RegistrationRequest>,
    auth: Option<Authentication>,
    config: ProvisioningConfig,
    _phantom: PhantomData<T>,
}

impl Default for ProvisioningClientBuilder<ProvisioningClientBuilderUninitialized> {
    fn default() -> ProvisioningClientBuilder<ProvisioningClientBuilderUninitialized> {
        Self {
            request: None,
            auth: None,
            config: ProvisioningConfig::default(),
            _phantom: Default::default(),
        }
    }
}

impl<T> ProvisioningClientBuilder<T> {
    fn into_state<U>(self) -> ProvisioningClientBuilder<U> {
        ProvisioningClientBuilder {
            request: self.request,
            auth: self.auth,
            config: self.config,
            _phantom: Default::default(),
        }
    }

    /// Use `config` for timeouts, polling and the service endpoint
    pub fn config(mut self, config: ProvisioningConfig) -> Self {
        if let Some(request) = self.request.as_mut() {
            request.provisioning_host = config.provisioning_host.clone();
        }
        self.config = config;
        self
    }
}

impl ProvisioningClientBuilder<ProvisioningClientBuilderUninitialized> {
    /// Set the scope of the provisioning service and the device's registration id
    pub fn registration<S>(
        self,
        id_scope: S,
        registration_id: S,
    ) -> ProvisioningClientBuilder<ProvisioningClientBuilderInitializedRegistration>
    where
        S: ToString,
    {
        let request = RegistrationRequest::new(registration_id.to_string(), id_scope.to_string())
            .with_provisioning_host(self.config.provisioning_host.clone());
        ProvisioningClientBuilder {
            request: Some(request),
            ..self
        }
        .into_state()
    }
}

impl ProvisioningClientBuilder<ProvisioningClientBuilderInitializedRegistration> {
    fn with_auth(
        self,
        auth: Authentication,
    ) -> ProvisioningClientBuilder<ProvisioningClientBuilderInitializedCredentials> {
        ProvisioningClientBuilder {
            auth: Some(auth),
            ..self
        }
        .into_state()
    }

    /// Authenticate with a token signed by the enrollment's symmetric key, valid for a day
    pub fn symmetric_key<K>(
        self,
        key: K,
    ) -> Result<ProvisioningClientBuilder<ProvisioningClientBuilderInitializedCredentials>, ClientBuilderError>
    where
        K: AsRef<str>,
    {
        let Some(request) = self.request.as_ref() else {
            return Err(ClientBuilderError::UninitializedField("registration"));
        };
        let auth = Authentication::symmetric_key(
            &request.id_scope,
            &request.registration_id,
            key.as_ref(),
            chrono::Duration::days(1),
        )?;
        Ok(self.with_auth(auth))
    }

    /// Authenticate with a pre-generated shared access signature
    pub fn shared_access_signature<S>(
        self,
        sas: S,
    ) -> ProvisioningClientBuilder<ProvisioningClientBuilderInitializedCredentials>
    where
        S: ToString,
    {
        self.with_auth(Authentication::SharedAccessSignature(sas.to_string()))
    }

    /// Authenticate with a client certificate
    pub fn x509(
        self,
        identity: X509Identity,
    ) -> ProvisioningClientBuilder<ProvisioningClientBuilderInitializedCredentials> {
        self.with_auth(Authentication::X509(identity))
    }

    /// Authenticate with TPM attestation (HTTP only)
    pub fn tpm(
        self,
        credentials: TpmCredentials,
    ) -> ProvisioningClientBuilder<ProvisioningClientBuilderInitializedCredentials> {
        self.with_auth(Authentication::Tpm(credentials))
    }
}

impl ProvisioningClientBuilder<ProvisioningClientBuilderInitializedCredentials> {
    /// Re-run allocation even if the device is already assigned
    pub fn force_registration(mut self, force: bool) -> Self {
        if let Some(request) = self.request.as_mut() {
            request.force_registration = force;
        }
        self
    }

    /// Custom data for the allocation policy
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        if let Some(request) = self.request.as_mut() {
            request.payload = Some(payload);
        }
        self
    }

    /// Build the client over a caller supplied transport
    pub fn build_with_transport<T>(
        self,
        transport: T,
    ) -> Result<ProvisioningDeviceClient<T>, ClientBuilderError>
    where
        T: ProvisioningTransport,
    {
        let Some(request) = self.request else {
            return Err(ClientBuilderError::UninitializedField("registration"));
        };

        let Some(auth) = self.auth else {
            return Err(ClientBuilderError::UninitializedField("credentials"));
        };

        let machine = RegistrationStateMachine::new(transport, self.config);
        Ok(ProvisioningDeviceClient::new(machine, request, auth))
    }

    /// Build the client over HTTPS
    #[cfg(feature = "http-transport")]
    pub fn build_http(self) -> Result<ProvisioningDeviceClient<HttpTransport>, ClientBuilderError> {
        let transport = HttpTransport::new(self.config.clone());
        self.build_with_transport(transport)
    }

    /// Build the client over MQTT
    ///
    /// Must be called within a tokio runtime.
    #[cfg(feature = "mqtt-transport")]
    pub fn build_mqtt(self) -> Result<ProvisioningDeviceClient<MqttTransport>, ClientBuilderError> {
        let transport = MqttTransport::new(self.config.clone());
        self.build_with_transport(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::RegistrationResult;
    use async_trait::async_trait;

    struct NeverCalled;

    #[async_trait]
    impl ProvisioningTransport for NeverCalled {
        async fn registration_request(
            &self,
            _request: &RegistrationRequest,
            _auth: &Authentication,
        ) -> crate::Result<RegistrationResult> {
            unreachable!()
        }

        async fn query_operation_status(
            &self,
            _request: &RegistrationRequest,
            _operation_id: &str,
            _auth: &Authentication,
        ) -> crate::Result<RegistrationResult> {
            unreachable!()
        }

        async fn cancel(&self) -> crate::Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> crate::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn builds_request_from_parts() {
        let client = ProvisioningDeviceClient::builder()
            .config(ProvisioningConfig::default().with_provisioning_host("dps.example.net"))
            .registration("0ne000", "dev1")
            .shared_access_signature("SharedAccessSignature sr=x")
            .force_registration(true)
            .payload(serde_json::json!({"a": 1}))
            .build_with_transport(NeverCalled)
            .unwrap();

        let request = client.request();
        assert_eq!(request.id_scope, "0ne000");
        assert_eq!(request.registration_id, "dev1");
        assert_eq!(request.provisioning_host, "dps.example.net");
        assert!(request.force_registration);
        assert_eq!(request.payload, Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn config_after_registration_moves_host() {
        let client = ProvisioningDeviceClient::builder()
            .registration("0ne000", "dev1")
            .config(ProvisioningConfig::default().with_provisioning_host("other.example.net"))
            .shared_access_signature("sas")
            .build_with_transport(NeverCalled)
            .unwrap();
        assert_eq!(client.request().provisioning_host, "other.example.net");
    }

    #[test]
    fn invalid_symmetric_key_is_reported() {
        let err = ProvisioningDeviceClient::builder()
            .registration("0ne000", "dev1")
            .symmetric_key("%%%")
            .unwrap_err();
        assert!(matches!(err, ClientBuilderError::InvalidCredentials(_)));
    }
}
