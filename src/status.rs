//! Interpretation of provisioning service responses, shared by every transport

use std::time::Duration;

use crate::model::{RegistrationOperationStatus, ServiceErrorBody};
use crate::registration::{
    AssignedDevice, PendingStatus, RegistrationFailure, RegistrationResult, StatusLabel,
};
use crate::ProvisioningError;

/// Responses at or above this status mean "still working, ask again"
pub(crate) const THROTTLED_STATUS: u16 = 429;

/// Parse a `retry-after` value in whole seconds
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(seconds) => Some(Duration::from_secs(seconds)),
        Err(_) => {
            debug!("Ignoring unparseable retry-after value {:?}", value);
            None
        }
    }
}

/// Translate a status code and body into a registration result
///
/// * `label` - which call produced the response
/// * `operation_id` - the operation being queried, carried through on throttled responses
pub(crate) fn translate_response(
    label: StatusLabel,
    status: u16,
    retry_after: Option<Duration>,
    body: &[u8],
    operation_id: Option<&str>,
) -> crate::Result<RegistrationResult> {
    if status < 300 {
        return translate_success(status, retry_after, body, operation_id);
    }

    if status >= THROTTLED_STATUS {
        debug!(
            "Status {} while {}, retrying after {:?}",
            status,
            label.as_str(),
            retry_after
        );
        return Ok(RegistrationResult::Assigning(PendingStatus {
            label,
            operation_id: operation_id.map(str::to_string),
            retry_after,
        }));
    }

    Err(service_error(status, body))
}

fn translate_success(
    status: u16,
    retry_after: Option<Duration>,
    body: &[u8],
    operation_id: Option<&str>,
) -> crate::Result<RegistrationResult> {
    let value: serde_json::Value = serde_json::from_slice(body)?;
    let reply: RegistrationOperationStatus = serde_json::from_value(value.clone())?;

    let body_status = reply
        .status
        .as_deref()
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match body_status.as_str() {
        "assigned" => {
            let state = reply.registration_state.unwrap_or_default();
            Ok(RegistrationResult::Assigned(AssignedDevice {
                registration_id: state.registration_id,
                device_id: state.device_id,
                assigned_hub: state.assigned_hub,
                substatus: state.substatus,
                issued_certificate: state.issued_client_certificate,
                payload: state.payload,
                body: value,
            }))
        }
        "assigning" => {
            let operation_id = reply
                .operation_id
                .or_else(|| operation_id.map(str::to_string))
                .ok_or(ProvisioningError::MissingOperationId)?;
            Ok(RegistrationResult::Assigning(PendingStatus {
                label: StatusLabel::Assigning,
                operation_id: Some(operation_id),
                retry_after,
            }))
        }
        "failed" | "disabled" => {
            let state = reply.registration_state.unwrap_or_default();
            Ok(RegistrationResult::Failed(RegistrationFailure {
                status: body_status,
                http_status: status,
                error_code: state.error_code,
                error_message: state.error_message,
            }))
        }
        "" => Err(ProvisioningError::UnexpectedStatus("<missing>".to_string())),
        other => Err(ProvisioningError::UnexpectedStatus(other.to_string())),
    }
}

/// Build the error for a terminal non-success response
pub(crate) fn service_error(status: u16, body: &[u8]) -> ProvisioningError {
    match serde_json::from_slice::<ServiceErrorBody>(body) {
        Ok(parsed) => ProvisioningError::Service {
            status,
            error_code: parsed.error_code,
            message: parsed
                .message
                .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned()),
            tracking_id: parsed.tracking_id,
        },
        Err(_) => ProvisioningError::Service {
            status,
            error_code: None,
            message: String::from_utf8_lossy(body).into_owned(),
            tracking_id: None,
        },
    }
}
