use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac, NewMac};
use sha2::Sha256;

use crate::ProvisioningError;

/// Source of shared access signatures presented to the provisioning service
pub trait TokenSource {
    /// Produce a token valid until `expiry`
    fn get(&self, expiry: &DateTime<Utc>) -> crate::Result<String>;
}

/// Hands out a pre-generated shared access signature
#[derive(Debug, Clone)]
pub struct SasTokenSource {
    sas: String,
}

impl SasTokenSource {
    ///
    pub fn new(sas: impl Into<String>) -> SasTokenSource {
        SasTokenSource { sas: sas.into() }
    }
}

impl TokenSource for SasTokenSource {
    fn get(&self, _: &DateTime<Utc>) -> crate::Result<String> {
        Ok(self.sas.clone())
    }
}

/// Signs registration tokens with an individual enrollment (or derived group) symmetric key
#[derive(Clone)]
pub struct SymmetricKeyTokenSource {
    id_scope: String,
    registration_id: String,
    key: Vec<u8>,
}

impl std::fmt::Debug for SymmetricKeyTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKeyTokenSource")
            .field("id_scope", &self.id_scope)
            .field("registration_id", &self.registration_id)
            .finish()
    }
}

impl SymmetricKeyTokenSource {
    /// Create a token source from the base64 encoded key
    pub fn new(
        id_scope: &str,
        registration_id: &str,
        key: &str,
    ) -> crate::Result<SymmetricKeyTokenSource> {
        let key = base64::decode(key).map_err(|e| ProvisioningError::InvalidKey(e.to_string()))?;
        Ok(SymmetricKeyTokenSource {
            id_scope: id_scope.to_string(),
            registration_id: registration_id.to_string(),
            key,
        })
    }

    fn resource_uri(&self) -> String {
        format!("{}%2fregistrations%2f{}", self.id_scope, self.registration_id)
    }
}

impl TokenSource for SymmetricKeyTokenSource {
    fn get(&self, expiry: &DateTime<Utc>) -> crate::Result<String> {
        let expiry_timestamp = expiry.timestamp();
        let resource_uri = self.resource_uri();
        let to_sign = format!("{}\n{}", resource_uri, expiry_timestamp);

        let token = generate_token(&self.key, &to_sign)?;

        Ok(format!(
            "SharedAccessSignature sr={}&{}&se={}",
            resource_uri, token, expiry_timestamp
        ))
    }
}

/// Derive the per-device key for a group enrollment from the group key
pub fn derive_device_key(group_key: &str, registration_id: &str) -> crate::Result<String> {
    let key =
        base64::decode(group_key).map_err(|e| ProvisioningError::InvalidKey(e.to_string()))?;
    Ok(base64::encode(sign(&key, registration_id)?))
}

fn sign(key: &[u8], message: &str) -> crate::Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_varkey(key)
        .map_err(|e| ProvisioningError::InvalidKey(format!("{:?}", e)))?;
    mac.update(message.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn generate_token(key: &[u8], message: &str) -> crate::Result<String> {
    let signature = base64::encode(sign(key, message)?);

    let pairs = &[("sig", signature)];
    serde_urlencoded::to_string(pairs).map_err(|e| ProvisioningError::InvalidKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_provision_sas() {
        let source = SymmetricKeyTokenSource::new(
            "0ne000EEBBD",
            "FirstDevice",
            "O+H9VTcdJP0Tqkl7bh4nVG0OJNrAataMpuWB54D0VEc=",
        )
        .unwrap();
        let expiry = Utc.timestamp(1_591_921_306, 0);
        assert_eq!(source.get(&expiry).unwrap(), "SharedAccessSignature sr=0ne000EEBBD%2fregistrations%2fFirstDevice&sig=hwgBlMB6G2Zg5ZcYtwmtLVKRbifiSCPfUMyscbVWa8o%3D&se=1591921306".to_string());
    }

    #[test]
    fn rejects_non_base64_key() {
        let err = SymmetricKeyTokenSource::new("scope", "device", "not base64!").unwrap_err();
        assert!(matches!(err, ProvisioningError::InvalidKey(_)));
    }

    #[test]
    fn sas_source_is_passed_through() {
        let source = SasTokenSource::new("SharedAccessSignature sr=x&sig=y&se=1");
        assert_eq!(
            source.get(&Utc::now()).unwrap(),
            "SharedAccessSignature sr=x&sig=y&se=1"
        );
    }

    #[test]
    fn derived_keys_differ_per_registration() {
        let group = "O+H9VTcdJP0Tqkl7bh4nVG0OJNrAataMpuWB54D0VEc=";
        let a = derive_device_key(group, "device-a").unwrap();
        let b = derive_device_key(group, "device-b").unwrap();
        assert_ne!(a, b);
        assert!(base64::decode(&a).is_ok());
    }
}
