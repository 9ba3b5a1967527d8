#![cfg(feature = "http-transport")]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use azure_iot_provisioning::{
    Authentication, ErrorKind, HttpSender, HttpTransport, ProvisioningConfig, ProvisioningDeviceClient,
    ProvisioningError, RegistrationResult, RegistrationState, X509Identity,
};
use hyper::{Body, Request, Response};
use tokio::time::Instant;

const SAS: &str = "SharedAccessSignature sr=0ne000%2fregistrations%2fdev1&sig=abc&se=1";

#[derive(Debug, Clone)]
struct Sent {
    method: String,
    uri: String,
    authorization: Option<String>,
    user_agent: Option<String>,
    body: Vec<u8>,
}

/// Replies with canned responses in order and records what was sent
#[derive(Debug, Clone)]
struct ScriptedService {
    replies: Arc<Mutex<VecDeque<(u16, Option<&'static str>, &'static str)>>>,
    sent: Arc<Mutex<Vec<Sent>>>,
}

impl ScriptedService {
    fn new(replies: Vec<(u16, Option<&'static str>, &'static str)>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpSender for ScriptedService {
    async fn send(
        &self,
        request: Request<Body>,
        _identity: Option<&X509Identity>,
    ) -> azure_iot_provisioning::Result<Response<Body>> {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .map(|value| value.to_str().unwrap().to_string())
        };
        let authorization = header("authorization");
        let user_agent = header("user-agent");
        let method = request.method().to_string();
        let uri = request.uri().to_string();
        let body = hyper::body::to_bytes(request.into_body()).await.unwrap().to_vec();
        self.sent.lock().unwrap().push(Sent {
            method,
            uri,
            authorization,
            user_agent,
            body,
        });

        let (status, retry_after, body) = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected request");
        let mut response = Response::builder().status(status);
        if let Some(retry_after) = retry_after {
            response = response.header("retry-after", retry_after);
        }
        Ok(response.body(Body::from(body)).unwrap())
    }
}

const ASSIGNED: &str = r#"{
    "operationId": "op1",
    "status": "assigned",
    "registrationState": {
        "registrationId": "dev1",
        "assignedHub": "hub1.azure-devices.net",
        "deviceId": "dev1",
        "status": "assigned",
        "substatus": "initialAssignment",
        "payload": {"value": 10}
    }
}"#;

const ASSIGNING: &str = r#"{"operationId": "op1", "status": "assigning"}"#;

fn client(service: &ScriptedService) -> ProvisioningDeviceClient<HttpTransport<ScriptedService>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = ProvisioningConfig {
        user_agent: "test-agent/1.0".to_string(),
        ..Default::default()
    };
    let transport = HttpTransport::with_sender(config.clone(), service.clone());
    ProvisioningDeviceClient::builder()
        .config(config)
        .registration("0ne000", "dev1")
        .shared_access_signature(SAS)
        .build_with_transport(transport)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn assigned_on_first_request() {
    let service = ScriptedService::new(vec![(200, None, ASSIGNED)]);
    let client = client(&service);

    let result = client.register().await.unwrap();
    let device = result.assigned().unwrap();
    assert_eq!(device.assigned_hub.as_deref(), Some("hub1.azure-devices.net"));
    assert_eq!(device.device_id.as_deref(), Some("dev1"));
    assert_eq!(device.substatus.as_deref(), Some("initialAssignment"));
    assert_eq!(client.state(), RegistrationState::Idle);

    let sent = service.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, "PUT");
    assert_eq!(
        sent[0].uri,
        "https://global.azure-devices-provisioning.net/0ne000/registrations/dev1/register?api-version=2019-03-31"
    );
    assert_eq!(sent[0].authorization.as_deref(), Some(SAS));
    assert_eq!(sent[0].user_agent.as_deref(), Some("test-agent/1.0"));
    let body: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
    assert_eq!(body, serde_json::json!({"registrationId": "dev1"}));
}

#[tokio::test(start_paused = true)]
async fn polls_operation_until_assigned() {
    let service = ScriptedService::new(vec![(202, None, ASSIGNING), (200, None, ASSIGNED)]);
    let client = client(&service);
    let mut updates = client.status_updates();

    let started = Instant::now();
    let result = client.register().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(2000));
    assert_eq!(result.assigned().unwrap().body["registrationState"]["payload"]["value"], 10);

    let sent = service.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].method, "GET");
    assert_eq!(
        sent[1].uri,
        "https://global.azure-devices-provisioning.net/0ne000/registrations/dev1/operations/op1?api-version=2019-03-31"
    );
    assert_eq!(sent[1].authorization.as_deref(), Some(SAS));

    let update = updates.recv().await.unwrap();
    assert_eq!(update.operation_id.as_deref(), Some("op1"));
    assert_eq!(update.next_poll, Duration::from_millis(2000));
}

#[tokio::test(start_paused = true)]
async fn throttled_registration_is_retried_after_delay() {
    let service = ScriptedService::new(vec![(429, Some("3"), ""), (200, None, ASSIGNED)]);
    let client = client(&service);

    let started = Instant::now();
    let result = client.register().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(result.assigned().is_some());

    let sent = service.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|sent| sent.method == "PUT"));
}

#[tokio::test(start_paused = true)]
async fn failed_enrollment_is_terminal() {
    let service = ScriptedService::new(vec![(
        200,
        None,
        r#"{"status":"failed","registrationState":{"errorCode":400209,"errorMessage":"Device disabled"}}"#,
    )]);
    let client = client(&service);

    match client.register().await.unwrap() {
        RegistrationResult::Failed(failure) => {
            assert_eq!(failure.status, "failed");
            assert_eq!(failure.http_status, 200);
            assert_eq!(failure.error_code, Some(400209));
            assert_eq!(failure.error_message.as_deref(), Some("Device disabled"));
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(service.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_is_not_retried() {
    let service = ScriptedService::new(vec![(
        401,
        None,
        r#"{"errorCode":401002,"trackingId":"t-1","message":"Unauthorized"}"#,
    )]);
    let client = client(&service);

    let err = client.register().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Service);
    match err {
        ProvisioningError::Service {
            status,
            error_code,
            tracking_id,
            ..
        } => {
            assert_eq!(status, 401);
            assert_eq!(error_code, Some(401002));
            assert_eq!(tracking_id.as_deref(), Some("t-1"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(service.sent().len(), 1);
    assert_eq!(client.state(), RegistrationState::Idle);
}

#[tokio::test(start_paused = true)]
async fn malformed_success_body_is_an_error() {
    let service = ScriptedService::new(vec![(200, None, "not json")]);
    let client = client(&service);

    let err = client.register().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedResponse);
}

#[tokio::test(start_paused = true)]
async fn force_registration_is_sent_in_query() {
    let service = ScriptedService::new(vec![(200, None, ASSIGNED)]);
    let transport = HttpTransport::with_sender(ProvisioningConfig::default(), service.clone());
    let client = ProvisioningDeviceClient::builder()
        .registration("0ne000", "dev1")
        .shared_access_signature(SAS)
        .force_registration(true)
        .payload(serde_json::json!({"model": "m1"}))
        .build_with_transport(transport)
        .unwrap();

    client.register().await.unwrap();

    let sent = service.sent();
    assert!(sent[0].uri.ends_with("register?api-version=2019-03-31&forceRegistration=true"));
    let body: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
    assert_eq!(body["payload"]["model"], "m1");
}

#[tokio::test(start_paused = true)]
async fn cancel_while_waiting_to_poll() {
    let service = ScriptedService::new(vec![(202, Some("60"), ASSIGNING)]);
    let client = Arc::new(client(&service));

    let running = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.register().await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(client.state(), RegistrationState::Waiting);
    client.cancel().await.unwrap();

    let err = running.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(service.sent().len(), 1);
    assert_eq!(client.state(), RegistrationState::Idle);
}

#[test]
fn sas_authentication_can_be_built_from_key() {
    let auth = Authentication::symmetric_key(
        "0ne000",
        "dev1",
        "O+H9VTcdJP0Tqkl7bh4nVG0OJNrAataMpuWB54D0VEc=",
        chrono::Duration::hours(1),
    )
    .unwrap();
    match auth {
        Authentication::SharedAccessSignature(sas) => {
            assert!(sas.starts_with("SharedAccessSignature sr=0ne000%2fregistrations%2fdev1&sig="))
        }
        other => panic!("unexpected authentication {:?}", other),
    }
}
