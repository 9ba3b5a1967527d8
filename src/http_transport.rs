use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use hyper::{client::HttpConnector, header, Body, Client, Method, Request, Response};
use hyper_tls::HttpsConnector;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ProvisioningConfig;
use crate::correlation::CorrelationTable;
use crate::model::{DeviceRegistration, TpmAttestation, TpmChallengeBody};
use crate::registration::{
    Authentication, RegistrationRequest, RegistrationResult, StatusLabel, X509Identity,
};
use crate::status::{parse_retry_after, translate_response};
use crate::transport::ProvisioningTransport;
use crate::ProvisioningError;

const RETRY_AFTER_HEADER: &str = "retry-after";
const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const UNAUTHORIZED: u16 = 401;

/// Everything but RFC 3986 unreserved characters is escaped in a path segment
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Sends one HTTP request
///
/// [`HyperSender`] is the network implementation; the seam exists so the registration protocol can
/// be driven against a scripted service.
#[async_trait]
pub trait HttpSender: Send + Sync + 'static {
    /// Send `request`, presenting `identity` as the TLS client certificate when given
    async fn send(
        &self,
        request: Request<Body>,
        identity: Option<&X509Identity>,
    ) -> crate::Result<Response<Body>>;
}

/// HTTPS over hyper and native-tls
#[derive(Debug, Clone)]
pub struct HyperSender {
    client: Client<HttpsConnector<HttpConnector>>,
}

impl HyperSender {
    ///
    pub fn new() -> Self {
        let https = HttpsConnector::new();
        Self {
            client: Client::builder().build::<_, Body>(https),
        }
    }
}

impl Default for HyperSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpSender for HyperSender {
    async fn send(
        &self,
        request: Request<Body>,
        identity: Option<&X509Identity>,
    ) -> crate::Result<Response<Body>> {
        match identity {
            None => Ok(self.client.request(request).await?),
            Some(identity) => {
                let tls = native_tls::TlsConnector::builder()
                    .identity(identity.tls_identity()?)
                    .min_protocol_version(Some(native_tls::Protocol::Tlsv12))
                    .build()?;
                let mut http = HttpConnector::new();
                http.enforce_http(false);
                let https = HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls)));
                let client = Client::builder().build::<_, Body>(https);
                Ok(client.request(request).await?)
            }
        }
    }
}

/// What came back for one HTTP request
#[derive(Debug)]
pub(crate) struct HttpReply {
    status: u16,
    retry_after: Option<Duration>,
    body: Vec<u8>,
}

type PendingTable = Arc<Mutex<CorrelationTable<HttpReply>>>;

fn lock(pending: &PendingTable) -> MutexGuard<'_, CorrelationTable<HttpReply>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Aborts the request task and forgets its correlation entry when the caller stops waiting
struct InFlight {
    pending: PendingTable,
    request_id: String,
    task: JoinHandle<()>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.task.abort();
        lock(&self.pending).take(&self.request_id);
    }
}

/// Registration over HTTP: a PUT followed by operation status GETs
///
/// No connection outlives a call, so cancelling only completes the outstanding calls and forgets
/// any TPM session token.
#[derive(Debug)]
pub struct HttpTransport<S = HyperSender> {
    config: ProvisioningConfig,
    sender: Arc<S>,
    pending: PendingTable,
    tpm_token: Mutex<Option<String>>,
}

impl HttpTransport<HyperSender> {
    /// Transport using the hyper HTTPS client
    pub fn new(config: ProvisioningConfig) -> Self {
        Self::with_sender(config, HyperSender::new())
    }
}

impl<S> HttpTransport<S>
where
    S: HttpSender,
{
    /// Transport sending through `sender`
    pub fn with_sender(config: ProvisioningConfig, sender: S) -> Self {
        Self {
            config,
            sender: Arc::new(sender),
            pending: Arc::new(Mutex::new(CorrelationTable::new())),
            tpm_token: Mutex::new(None),
        }
    }

    /// Number of requests currently awaiting a response
    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }

    fn base_uri(&self, request: &RegistrationRequest) -> String {
        format!(
            "https://{host}/{scope}/registrations/{registration_id}",
            host = request.provisioning_host,
            scope = utf8_percent_encode(&request.id_scope, PATH_SEGMENT),
            registration_id = utf8_percent_encode(&request.registration_id, PATH_SEGMENT),
        )
    }

    fn register_uri(&self, request: &RegistrationRequest) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("api-version", &self.config.api_version);
        if request.force_registration {
            query.append_pair("forceRegistration", "true");
        }
        format!("{}/register?{}", self.base_uri(request), query.finish())
    }

    fn operation_uri(&self, request: &RegistrationRequest, operation_id: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("api-version", &self.config.api_version)
            .finish();
        format!(
            "{}/operations/{}?{}",
            self.base_uri(request),
            utf8_percent_encode(operation_id, PATH_SEGMENT),
            query
        )
    }

    fn authorization(&self, auth: &Authentication) -> Option<String> {
        match auth {
            Authentication::SharedAccessSignature(sas) => Some(sas.clone()),
            Authentication::Tpm(_) => self
                .tpm_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            Authentication::X509(_) => None,
        }
    }

    fn build_request(
        &self,
        method: Method,
        uri: String,
        authorization: Option<String>,
        body: Body,
    ) -> crate::Result<Request<Body>> {
        trace!("{} {}", method, uri);
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::ACCEPT, "application/json")
            .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(header::USER_AGENT, self.config.user_agent.as_str());
        if let Some(authorization) = authorization {
            builder = builder.header(header::AUTHORIZATION, authorization);
        }
        Ok(builder.body(body)?)
    }

    fn registration_put(
        &self,
        request: &RegistrationRequest,
        body: &DeviceRegistration,
        authorization: Option<String>,
    ) -> crate::Result<Request<Body>> {
        let body = serde_json::to_vec(body)?;
        self.build_request(
            Method::PUT,
            self.register_uri(request),
            authorization,
            Body::from(body),
        )
    }

    /// Send `request` as a tracked operation
    ///
    /// The network call runs on its own task and resolves the correlation entry when it finishes;
    /// `cancel` resolves it first if it gets there earlier.
    async fn exchange(
        &self,
        label: StatusLabel,
        operation_id: Option<&str>,
        request: Request<Body>,
        identity: Option<X509Identity>,
    ) -> crate::Result<HttpReply> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).register(
            request_id.clone(),
            tx,
            label,
            operation_id.map(str::to_string),
        )?;

        let sender = Arc::clone(&self.sender);
        let pending = Arc::clone(&self.pending);
        let timeout = self.config.timeout;
        let task_request_id = request_id.clone();
        let task = tokio::spawn(async move {
            let outcome =
                match tokio::time::timeout(timeout, round_trip(&*sender, request, identity)).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ProvisioningError::Timeout(timeout)),
                };
            if !lock(&pending).resolve(&task_request_id, outcome) {
                warn!(
                    "Response for request {} arrived after it was cancelled",
                    task_request_id
                );
            }
        });

        let _in_flight = InFlight {
            pending: Arc::clone(&self.pending),
            request_id,
            task,
        };

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProvisioningError::TransportClosed),
        }
    }

    /// Answer a TPM challenge and repeat the registration with the resulting token
    async fn complete_tpm_challenge(
        &self,
        request: &RegistrationRequest,
        body: &DeviceRegistration,
        auth: &Authentication,
        reply: HttpReply,
    ) -> crate::Result<HttpReply> {
        let tpm = match auth {
            Authentication::Tpm(tpm) if reply.status == UNAUTHORIZED => tpm,
            _ => return Ok(reply),
        };
        let challenge = match serde_json::from_slice::<TpmChallengeBody>(&reply.body) {
            Ok(challenge) => challenge,
            Err(_) => return Ok(reply),
        };

        debug!(
            "Answering TPM challenge for registration {}",
            request.registration_id
        );
        let sas = tpm.challenge.activate(
            &request.id_scope,
            &request.registration_id,
            &challenge.authentication_key,
        )?;
        *self
            .tpm_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sas.clone());

        let put = self.registration_put(request, body, Some(sas))?;
        self.exchange(StatusLabel::Registering, None, put, None)
            .await
    }

    fn forget(&self) -> usize {
        lock(&self.pending).cancel_all(|| ProvisioningError::Cancelled)
    }
}

async fn round_trip<S>(
    sender: &S,
    request: Request<Body>,
    identity: Option<X509Identity>,
) -> crate::Result<HttpReply>
where
    S: HttpSender,
{
    let response = sender.send(request, identity.as_ref()).await?;
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_retry_after);
    let body = hyper::body::to_bytes(response.into_body()).await?;
    trace!("Response {} ({} bytes)", status, body.len());
    Ok(HttpReply {
        status,
        retry_after,
        body: body.to_vec(),
    })
}

fn identity(auth: &Authentication) -> Option<X509Identity> {
    match auth {
        Authentication::X509(identity) => Some(identity.clone()),
        _ => None,
    }
}

#[async_trait]
impl<S> ProvisioningTransport for HttpTransport<S>
where
    S: HttpSender,
{
    async fn registration_request(
        &self,
        request: &RegistrationRequest,
        auth: &Authentication,
    ) -> crate::Result<RegistrationResult> {
        let body = DeviceRegistration {
            registration_id: request.registration_id.clone(),
            tpm: match auth {
                Authentication::Tpm(tpm) => Some(TpmAttestation {
                    endorsement_key: tpm.endorsement_key.clone(),
                    storage_root_key: tpm.storage_root_key.clone(),
                }),
                _ => None,
            },
            payload: request.payload.clone(),
        };

        let put = self.registration_put(request, &body, self.authorization(auth))?;
        let reply = self
            .exchange(StatusLabel::Registering, None, put, identity(auth))
            .await?;
        let reply = self
            .complete_tpm_challenge(request, &body, auth, reply)
            .await?;

        translate_response(
            StatusLabel::Registering,
            reply.status,
            reply.retry_after,
            &reply.body,
            None,
        )
    }

    async fn query_operation_status(
        &self,
        request: &RegistrationRequest,
        operation_id: &str,
        auth: &Authentication,
    ) -> crate::Result<RegistrationResult> {
        let get = self.build_request(
            Method::GET,
            self.operation_uri(request, operation_id),
            self.authorization(auth),
            Body::empty(),
        )?;
        let reply = self
            .exchange(
                StatusLabel::Assigning,
                Some(operation_id),
                get,
                identity(auth),
            )
            .await?;

        translate_response(
            StatusLabel::Assigning,
            reply.status,
            reply.retry_after,
            &reply.body,
            Some(operation_id),
        )
    }

    async fn cancel(&self) -> crate::Result<()> {
        let cancelled = self.forget();
        debug!("Cancelled {} pending http request(s)", cancelled);
        Ok(())
    }

    async fn disconnect(&self) -> crate::Result<()> {
        let cancelled = self.forget();
        *self
            .tpm_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        debug!("Disconnected, cancelled {} pending http request(s)", cancelled);
        Ok(())
    }
}
