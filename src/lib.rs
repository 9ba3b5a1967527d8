//! Device registration with the Azure IoT Hub Device Provisioning Service (DPS)
//!
//! A device registers with DPS to find out which IoT Hub it belongs to. Registration is a
//! long-running operation: the service accepts the request, hands back an operation id and the
//! client polls until the device is assigned or the service gives up.
//!
//! ## Feature flags
//!
//! Both transports are enabled by default.
//!
//! - `http-transport`: registration over HTTPS (hyper)
//! - `mqtt-transport`: registration over MQTT 3.1.1 on port 8883
//!
//! ```toml
//! azure_iot_provisioning = { version = "0.1.0", features = ["mqtt-transport"], default-features = false }
//! ```
//!
//! # Examples
//!
//! Register with a symmetric key enrollment
//! ```no_run
//! use azure_iot_provisioning::{ProvisioningDeviceClient, RegistrationResult};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ProvisioningDeviceClient::builder()
//!         .registration("0ne000EEBBD", "my-device")
//!         .symmetric_key("O+H9VTcdJP0Tqkl7bh4nVG0OJNrAataMpuWB54D0VEc=")?
//!         .build_mqtt()?;
//!
//!     match client.register().await? {
//!         RegistrationResult::Assigned(device) => {
//!             println!("{:?} is on {:?}", device.registration_id, device.assigned_hub)
//!         }
//!         other => println!("not assigned: {:?}", other),
//!     }
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms, missing_docs)]

#[macro_use]
extern crate log;

/// Provisioning SDK package version
pub const SDK_VERSION: &str = std::env!("CARGO_PKG_VERSION");

/// The provisioning device client
pub mod client;
/// Builder for the provisioning device client
pub mod client_builder;
/// Client configuration
pub mod config;
mod correlation;
/// Errors
pub mod error;
/// Registration over HTTPS
#[cfg(feature = "http-transport")]
pub mod http_transport;
/// Wire models of the provisioning service REST and MQTT APIs
pub mod model;
/// MQTT session handling
#[cfg(feature = "mqtt-transport")]
pub mod mqtt_connection;
/// Registration over MQTT
#[cfg(feature = "mqtt-transport")]
pub mod mqtt_transport;
/// Registration requests, credentials and outcomes
pub mod registration;
/// The transport independent registration protocol
pub mod state_machine;
mod status;
/// Shared access signature generation
pub mod token;
/// The transport abstraction used by the state machine
pub mod transport;

pub use client::ProvisioningDeviceClient;
pub use client_builder::{ClientBuilderError, ProvisioningClientBuilder};
pub use config::ProvisioningConfig;
pub use error::{ErrorKind, ProvisioningError};
#[cfg(feature = "http-transport")]
pub use http_transport::{HttpSender, HttpTransport, HyperSender};
#[cfg(feature = "mqtt-transport")]
pub use mqtt_connection::{ConnectOptions, ConnectionEvent, MqttConnection, TlsMqttConnection};
#[cfg(feature = "mqtt-transport")]
pub use mqtt_transport::{MqttState, MqttTransport};
pub use registration::{
    AssignedDevice, Authentication, OperationStatus, PendingStatus, RegistrationFailure,
    RegistrationRequest, RegistrationResult, StatusLabel, TpmChallenge, TpmCredentials,
    X509Identity,
};
pub use state_machine::{RegistrationState, RegistrationStateMachine};
pub use token::{SasTokenSource, SymmetricKeyTokenSource, TokenSource};
pub use transport::ProvisioningTransport;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, ProvisioningError>;
