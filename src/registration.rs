use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::DEFAULT_PROVISIONING_HOST;
use crate::token::{SymmetricKeyTokenSource, TokenSource};

/// Everything the service needs to identify a registration attempt
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRequest {
    /// Logical identifier chosen by the device
    pub registration_id: String,
    /// Scope of the provisioning service instance
    pub id_scope: String,
    /// Host name of the provisioning service
    pub provisioning_host: String,
    /// Re-run allocation even if the device is already assigned
    pub force_registration: bool,
    /// Custom data forwarded to allocation policies
    pub payload: Option<serde_json::Value>,
}

impl RegistrationRequest {
    /// A request against the global provisioning endpoint
    pub fn new(registration_id: impl Into<String>, id_scope: impl Into<String>) -> Self {
        Self {
            registration_id: registration_id.into(),
            id_scope: id_scope.into(),
            provisioning_host: DEFAULT_PROVISIONING_HOST.to_string(),
            force_registration: false,
            payload: None,
        }
    }

    ///
    pub fn with_provisioning_host(mut self, host: impl Into<String>) -> Self {
        self.provisioning_host = host.into();
        self
    }

    ///
    pub fn with_force_registration(mut self, force: bool) -> Self {
        self.force_registration = force;
        self
    }

    ///
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// PEM encoded client certificate chain and PKCS#8 private key
#[derive(Clone)]
pub struct X509Identity {
    certificate_pem: Vec<u8>,
    private_key_pem: Vec<u8>,
}

impl X509Identity {
    ///
    pub fn new(certificate_pem: impl Into<Vec<u8>>, private_key_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            certificate_pem: certificate_pem.into(),
            private_key_pem: private_key_pem.into(),
        }
    }

    pub(crate) fn tls_identity(&self) -> crate::Result<native_tls::Identity> {
        Ok(native_tls::Identity::from_pkcs8(
            &self.certificate_pem,
            &self.private_key_pem,
        )?)
    }
}

impl std::fmt::Debug for X509Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X509Identity")
            .field("certificate_pem", &format!("{} bytes", self.certificate_pem.len()))
            .finish()
    }
}

/// Answers the TPM activation challenge
///
/// The service encrypts an authentication key to the device's endorsement key. Implementations
/// import that key into the TPM and return a shared access signature signed with it.
pub trait TpmChallenge: Send + Sync {
    /// Turn the service supplied `authenticationKey` into a shared access signature
    fn activate(&self, id_scope: &str, registration_id: &str, authentication_key: &str)
        -> crate::Result<String>;
}

/// TPM key material and the challenge handler for it
#[derive(Clone)]
pub struct TpmCredentials {
    pub(crate) endorsement_key: String,
    pub(crate) storage_root_key: Option<String>,
    pub(crate) challenge: Arc<dyn TpmChallenge>,
}

impl TpmCredentials {
    ///
    pub fn new(
        endorsement_key: impl Into<String>,
        storage_root_key: Option<String>,
        challenge: Arc<dyn TpmChallenge>,
    ) -> Self {
        Self {
            endorsement_key: endorsement_key.into(),
            storage_root_key,
            challenge,
        }
    }
}

impl std::fmt::Debug for TpmCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpmCredentials")
            .field("endorsement_key", &self.endorsement_key)
            .field("storage_root_key", &self.storage_root_key)
            .finish()
    }
}

/// Attestation presented to the provisioning service
#[derive(Clone)]
pub enum Authentication {
    /// Client certificate authentication at the TLS layer
    X509(X509Identity),
    /// A `SharedAccessSignature sr=...` token
    SharedAccessSignature(String),
    /// TPM endorsement key attestation
    Tpm(TpmCredentials),
}

impl Authentication {
    /// Sign a registration token from a symmetric key, valid for `ttl`
    pub fn symmetric_key(
        id_scope: &str,
        registration_id: &str,
        key: &str,
        ttl: chrono::Duration,
    ) -> crate::Result<Authentication> {
        let source = SymmetricKeyTokenSource::new(id_scope, registration_id, key)?;
        Authentication::from_token_source(&source, ttl)
    }

    /// Take a token from `source`, valid for `ttl`
    pub fn from_token_source<TS>(source: &TS, ttl: chrono::Duration) -> crate::Result<Authentication>
    where
        TS: TokenSource,
    {
        let expiry = Utc::now() + ttl;
        trace!("Generating registration token that will expire at {}", expiry);
        Ok(Authentication::SharedAccessSignature(source.get(&expiry)?))
    }
}

impl std::fmt::Debug for Authentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Authentication::X509(identity) => f.debug_tuple("X509").field(identity).finish(),
            Authentication::SharedAccessSignature(_) => {
                f.debug_tuple("SharedAccessSignature").field(&"<redacted>").finish()
            }
            Authentication::Tpm(tpm) => f.debug_tuple("Tpm").field(tpm).finish(),
        }
    }
}

/// Which call an in-progress response belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLabel {
    /// The registration request itself has not been accepted yet
    Registering,
    /// The service accepted the registration and is allocating a hub
    Assigning,
}

impl StatusLabel {
    ///
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusLabel::Registering => "registering",
            StatusLabel::Assigning => "assigning",
        }
    }
}

/// A non-terminal response
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStatus {
    /// `Registering` when the registration call must be repeated
    pub label: StatusLabel,
    /// Handle for status queries, absent until the service accepts the registration
    pub operation_id: Option<String>,
    /// Service supplied delay before the next attempt
    pub retry_after: Option<Duration>,
}

/// A device the service assigned to a hub
#[derive(Debug, Clone, PartialEq)]
pub struct AssignedDevice {
    ///
    pub registration_id: Option<String>,
    ///
    pub device_id: Option<String>,
    /// Host name of the IoT Hub the device should connect to
    pub assigned_hub: Option<String>,
    ///
    pub substatus: Option<String>,
    /// Client certificate issued by the service, if any
    pub issued_certificate: Option<String>,
    /// Custom allocation payload
    pub payload: Option<serde_json::Value>,
    /// The full response body
    pub body: serde_json::Value,
}

/// The service finished the registration without assigning the device
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationFailure {
    /// Body status such as `failed` or `disabled`
    pub status: String,
    /// Status code of the response that carried the failure
    pub http_status: u16,
    ///
    pub error_code: Option<i64>,
    ///
    pub error_message: Option<String>,
}

/// Outcome of a registration or status query
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationResult {
    /// Terminal: the device has a hub
    Assigned(AssignedDevice),
    /// Intermediate: query again later
    Assigning(PendingStatus),
    /// Terminal: the service refused to assign the device
    Failed(RegistrationFailure),
}

impl RegistrationResult {
    ///
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RegistrationResult::Assigning(_))
    }

    /// The assigned device, if this result is `Assigned`
    pub fn assigned(&self) -> Option<&AssignedDevice> {
        match self {
            RegistrationResult::Assigned(device) => Some(device),
            _ => None,
        }
    }
}

/// Intermediate progress published while a registration is running
#[derive(Debug, Clone, PartialEq)]
pub struct OperationStatus {
    ///
    pub registration_id: String,
    ///
    pub label: StatusLabel,
    ///
    pub operation_id: Option<String>,
    /// Delay before the next query
    pub next_poll: Duration,
}
