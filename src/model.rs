//! JSON bodies exchanged with the device provisioning service

use serde::{Deserialize, Serialize};

/// Body of a registration request
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeviceRegistration {
    #[serde(rename = "registrationId")]
    pub registration_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tpm: Option<TpmAttestation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// TPM public key material sent with a registration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TpmAttestation {
    #[serde(rename = "endorsementKey")]
    pub endorsement_key: String,
    #[serde(rename = "storageRootKey", skip_serializing_if = "Option::is_none")]
    pub storage_root_key: Option<String>,
}

/// Response to a registration or operation status request
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegistrationOperationStatus {
    /// Operation ID.
    #[serde(rename = "operationId", skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    /// Device enrollment status.
    #[serde(rename = "status", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Device registration status.
    #[serde(rename = "registrationState", skip_serializing_if = "Option::is_none")]
    pub registration_state: Option<DeviceRegistrationResult>,
}

/// Registration state reported by the service
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct DeviceRegistrationResult {
    /// The registration ID is alphanumeric, lowercase, and may contain hyphens.
    #[serde(rename = "registrationId", skip_serializing_if = "Option::is_none")]
    pub registration_id: Option<String>,
    /// Assigned Azure IoT Hub.
    #[serde(rename = "assignedHub", skip_serializing_if = "Option::is_none")]
    pub assigned_hub: Option<String>,
    /// Device ID.
    #[serde(rename = "deviceId", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Enrollment status.
    #[serde(rename = "status", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Substatus for 'Assigned' devices, e.g. `initialAssignment`, `deviceDataMigrated`,
    /// `deviceDataReset`.
    #[serde(rename = "substatus", skip_serializing_if = "Option::is_none")]
    pub substatus: Option<String>,
    /// Error code.
    #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    /// Error message.
    #[serde(rename = "errorMessage", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Certificate issued to the device, if the enrollment requested one
    #[serde(rename = "issuedClientCertificate", skip_serializing_if = "Option::is_none")]
    pub issued_client_certificate: Option<String>,
    /// Custom allocation payload returned by the service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// The entity tag associated with the resource.
    #[serde(rename = "etag", skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Error body returned with non-success status codes
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceErrorBody {
    #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(rename = "trackingId", skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of a 401 response to a TPM registration
#[derive(Debug, Deserialize, Clone)]
pub struct TpmChallengeBody {
    #[serde(rename = "authenticationKey")]
    pub authentication_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_body_omits_missing_fields() {
        let body = DeviceRegistration {
            registration_id: "dev1".into(),
            tpm: None,
            payload: None,
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"registrationId":"dev1"}"#
        );
    }

    #[test]
    fn decodes_operation_status() {
        let status: RegistrationOperationStatus = serde_json::from_str(
            r#"{
                "operationId": "4.0a",
                "status": "assigned",
                "registrationState": {
                    "registrationId": "dev1",
                    "assignedHub": "hub.azure-devices.net",
                    "deviceId": "dev1",
                    "status": "assigned",
                    "substatus": "initialAssignment"
                }
            }"#,
        )
        .unwrap();
        let state = status.registration_state.unwrap();
        assert_eq!(state.assigned_hub.as_deref(), Some("hub.azure-devices.net"));
        assert_eq!(state.substatus.as_deref(), Some("initialAssignment"));
    }
}
