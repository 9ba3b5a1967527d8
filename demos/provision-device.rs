use azure_iot_provisioning::{ProvisioningConfig, ProvisioningDeviceClient, RegistrationResult};
use log::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let scope_id = std::env::var("DPS_SCOPE_ID").expect(
        "Set the device provisioning service scope id in the DPS_SCOPE_ID environment variable",
    );
    let registration_id = std::env::var("DPS_REGISTRATION_ID").expect("Set the device provisioning service registration id in the DPS_REGISTRATION_ID environment variable");
    let device_key = std::env::var("DPS_DEVICE_KEY").expect(
        "Set the device provisioning service device key in the DPS_DEVICE_KEY environment variable",
    );

    let mut config = ProvisioningConfig::default();
    if let Ok(host) = std::env::var("DPS_HOST") {
        config = config.with_provisioning_host(host);
    }

    let builder = ProvisioningDeviceClient::builder()
        .config(config)
        .registration(scope_id, registration_id)
        .symmetric_key(device_key)?;

    let result = match std::env::var("DPS_TRANSPORT").as_deref() {
        Ok("http") => {
            let client = builder.build_http()?;
            client.register().await?
        }
        _ => {
            let client = builder.build_mqtt()?;
            let result = client.register().await;
            client.disconnect().await?;
            result?
        }
    };

    match result {
        RegistrationResult::Assigned(device) => info!(
            "Device {:?} assigned to {:?}",
            device.device_id, device.assigned_hub
        ),
        other => warn!("Device was not assigned: {:?}", other),
    }

    Ok(())
}
