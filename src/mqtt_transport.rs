use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::sync::mpsc::{self, Receiver};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::ProvisioningConfig;
use crate::correlation::{CorrelationTable, ResultHandler};
use crate::model::DeviceRegistration;
use crate::mqtt_connection::{ConnectOptions, ConnectionEvent, MqttConnection, TlsMqttConnection};
use crate::registration::{Authentication, RegistrationRequest, RegistrationResult, StatusLabel};
use crate::status::{parse_retry_after, translate_response};
use crate::transport::ProvisioningTransport;
use crate::ProvisioningError;

const MQTT_PORT: u16 = 8883;
const COMMAND_BUFFER: usize = 16;

// Incoming topic names
const RESPONSE_TOPIC_FILTER: &str = "$dps/registrations/res/#";
const RESPONSE_TOPIC_PREFIX: &str = "$dps/registrations/res/";
const REQUEST_ID_PARAM: &str = "$rid";
const RETRY_AFTER_PARAM: &str = "retry-after";

/// Characters left alone when encoding the client version, as URI components are encoded
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

// Outgoing topic names
fn register_topic(request_id: &str) -> String {
    format!("$dps/registrations/PUT/iotdps-register/?$rid={}", request_id)
}

fn operation_status_topic(request_id: &str, operation_id: &str) -> String {
    format!(
        "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={}&operationId={}",
        request_id, operation_id
    )
}

fn username(config: &ProvisioningConfig, request: &RegistrationRequest) -> String {
    let agent = utf8_percent_encode(&config.user_agent, URI_COMPONENT);
    format!(
        "{}/registrations/{}/api-version={}&ClientVersion={}",
        request.id_scope, request.registration_id, config.api_version, agent
    )
}

/// Status code and query parameters carried in a response topic
#[derive(Debug, PartialEq)]
struct ResponseTopic {
    status: u16,
    request_id: Option<String>,
    retry_after: Option<Duration>,
}

/// Parse `$dps/registrations/res/{status}/?$rid={rid}&retry-after={seconds}`
fn parse_response_topic(topic: &str) -> crate::Result<ResponseTopic> {
    let details = topic
        .strip_prefix(RESPONSE_TOPIC_PREFIX)
        .ok_or_else(|| ProvisioningError::MalformedTopic(topic.to_string()))?;

    let (status, query) = match details.find('/') {
        Some(index) => (&details[..index], details[index + 1..].trim_start_matches('?')),
        None => (details, ""),
    };
    let status = status
        .parse::<u16>()
        .map_err(|_| ProvisioningError::MalformedTopic(topic.to_string()))?;

    let params = serde_urlencoded::from_str::<Vec<(String, String)>>(query)
        .map_err(|_| ProvisioningError::MalformedTopic(topic.to_string()))?;

    let mut response = ResponseTopic {
        status,
        request_id: None,
        retry_after: None,
    };
    for (key, value) in params {
        match key.as_str() {
            REQUEST_ID_PARAM => response.request_id = Some(value),
            RETRY_AFTER_PARAM => response.retry_after = parse_retry_after(&value),
            _ => {}
        }
    }
    Ok(response)
}

/// States of the MQTT session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttState {
    ///
    Disconnected,
    /// Connecting and subscribing to the response topic
    Connecting,
    /// Subscribed and ready to publish
    Connected,
    /// Unsubscribing and closing the connection
    Disconnecting,
}

#[derive(Debug)]
enum OperationKind {
    Register,
    QueryStatus(String),
}

/// A request on its way to the broker
struct Operation {
    request_id: String,
    kind: OperationKind,
    request: RegistrationRequest,
    auth: Authentication,
    reply: ResultHandler<RegistrationResult>,
}

impl Operation {
    fn fail(self, error: ProvisioningError) {
        if self.reply.send(Err(error)).is_err() {
            debug!("Caller for request {} went away", self.request_id);
        }
    }
}

enum Command {
    Submit(Operation),
    Cancel(oneshot::Sender<crate::Result<()>>),
    Disconnect(oneshot::Sender<crate::Result<()>>),
    Inspect(oneshot::Sender<(MqttState, usize)>),
}

/// Completion of a long running connection step
enum Step<C> {
    Connected(C, crate::Result<Receiver<ConnectionEvent>>),
    Disconnected(C, crate::Result<()>),
}

async fn with_timeout<T, F>(limit: Duration, future: F) -> crate::Result<T>
where
    F: Future<Output = crate::Result<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(ProvisioningError::Timeout(limit)),
    }
}

/// Connect, then subscribe to the response topic
async fn establish<C: MqttConnection>(
    connection: &mut C,
    options: &ConnectOptions,
    limit: Duration,
) -> crate::Result<Receiver<ConnectionEvent>> {
    debug!("Connecting to {} as {}", options.host, options.client_id);
    let inbound = with_timeout(limit, connection.connect(options)).await?;
    with_timeout(limit, connection.subscribe(RESPONSE_TOPIC_FILTER)).await?;
    Ok(inbound)
}

/// Unsubscribe (if subscribed), then disconnect
///
/// Both errors are logged; a disconnect error is reported in preference to an unsubscribe error.
async fn teardown<C: MqttConnection>(
    connection: &mut C,
    subscribed: bool,
    limit: Duration,
) -> crate::Result<()> {
    let unsubscribed = if subscribed {
        with_timeout(limit, connection.unsubscribe(RESPONSE_TOPIC_FILTER)).await
    } else {
        Ok(())
    };
    if let Err(err) = &unsubscribed {
        warn!("Failed to unsubscribe from {}: {}", RESPONSE_TOPIC_FILTER, err);
    }

    let disconnected = with_timeout(limit, connection.disconnect()).await;
    if let Err(err) = &disconnected {
        warn!("Failed to disconnect: {}", err);
    }

    disconnected.and(unsubscribed)
}

async fn next_step<C>(step: &mut Option<BoxFuture<'static, Step<C>>>) -> Step<C> {
    match step {
        Some(future) => {
            let outcome = future.await;
            *step = None;
            outcome
        }
        None => std::future::pending().await,
    }
}

async fn next_event(inbound: &mut Option<Receiver<ConnectionEvent>>) -> Option<ConnectionEvent> {
    match inbound {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_deadline(deadlines: &HashMap<String, Instant>) {
    match deadlines.values().min() {
        Some(deadline) => tokio::time::sleep_until(*deadline).await,
        None => std::future::pending().await,
    }
}

/// Owns the connection, the session state and the correlation table
///
/// Every state change happens on this task, in the order commands and broker events arrive.
struct Actor<C> {
    config: ProvisioningConfig,
    state: MqttState,
    /// `None` while a connection step owns it
    connection: Option<C>,
    subscribed: bool,
    step: Option<BoxFuture<'static, Step<C>>>,
    inbound: Option<Receiver<ConnectionEvent>>,
    table: CorrelationTable<RegistrationResult>,
    deadlines: HashMap<String, Instant>,
    /// Operations waiting for the connection to come up
    deferred: Vec<Operation>,
    teardown_requested: bool,
    disconnect_waiters: Vec<oneshot::Sender<crate::Result<()>>>,
}

impl<C: MqttConnection> Actor<C> {
    fn new(config: ProvisioningConfig, connection: C) -> Self {
        Self {
            config,
            state: MqttState::Disconnected,
            connection: Some(connection),
            subscribed: false,
            step: None,
            inbound: None,
            table: CorrelationTable::new(),
            deadlines: HashMap::new(),
            deferred: Vec::new(),
            teardown_requested: false,
            disconnect_waiters: Vec::new(),
        }
    }

    async fn run(mut self, mut commands: Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                outcome = next_step(&mut self.step) => self.handle_step(outcome).await,
                event = next_event(&mut self.inbound) => self.handle_event(event),
                _ = next_deadline(&self.deadlines) => self.expire(),
            }
        }

        trace!("All transport handles dropped, shutting down");
        self.cancel_pending(|| ProvisioningError::TransportClosed);
        if let Some(step) = self.step.take() {
            let (mut connection, subscribed) = match step.await {
                Step::Connected(connection, result) => (connection, result.is_ok()),
                Step::Disconnected(..) => return,
            };
            let _ = teardown(&mut connection, subscribed, self.config.timeout).await;
        } else if self.state == MqttState::Connected {
            if let Some(connection) = self.connection.as_mut() {
                let _ = teardown(connection, self.subscribed, self.config.timeout).await;
            }
        }
    }

    fn transition(&mut self, state: MqttState) {
        debug!("MQTT transport {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit(operation) => self.submit(operation).await,
            Command::Cancel(reply) => {
                self.cancel_pending(|| ProvisioningError::Cancelled);
                if self.state == MqttState::Connecting {
                    self.teardown_requested = true;
                }
                let _ = reply.send(Ok(()));
            }
            Command::Disconnect(reply) => match self.state {
                MqttState::Disconnected => {
                    let _ = reply.send(Ok(()));
                }
                MqttState::Connecting => {
                    self.cancel_pending(|| ProvisioningError::Cancelled);
                    self.teardown_requested = true;
                    self.disconnect_waiters.push(reply);
                }
                MqttState::Connected => {
                    self.cancel_pending(|| ProvisioningError::Cancelled);
                    self.disconnect_waiters.push(reply);
                    self.start_disconnect();
                }
                MqttState::Disconnecting => {
                    self.cancel_pending(|| ProvisioningError::Cancelled);
                    self.disconnect_waiters.push(reply);
                }
            },
            Command::Inspect(reply) => {
                let _ = reply.send((self.state, self.table.len()));
            }
        }
    }

    async fn submit(&mut self, operation: Operation) {
        if let Authentication::Tpm(_) = operation.auth {
            operation.fail(ProvisioningError::UnsupportedAuthentication(
                "TPM attestation requires the HTTP transport",
            ));
            return;
        }

        match self.state {
            MqttState::Disconnected => {
                let options = self.connect_options(&operation.request, &operation.auth);
                self.deferred.push(operation);
                self.start_connect(options);
            }
            MqttState::Connecting | MqttState::Disconnecting => {
                trace!("Deferring request {} until connected", operation.request_id);
                self.deferred.push(operation);
            }
            MqttState::Connected => self.publish(operation).await,
        }
    }

    fn connect_options(&self, request: &RegistrationRequest, auth: &Authentication) -> ConnectOptions {
        let (password, identity) = match auth {
            Authentication::SharedAccessSignature(sas) => (Some(sas.clone()), None),
            Authentication::X509(identity) => (None, Some(identity.clone())),
            Authentication::Tpm(_) => (None, None),
        };
        ConnectOptions {
            host: request.provisioning_host.clone(),
            port: MQTT_PORT,
            client_id: request.registration_id.clone(),
            username: username(&self.config, request),
            password,
            identity,
            clean_session: true,
            keep_alive: self.config.keep_alive,
        }
    }

    fn start_connect(&mut self, options: ConnectOptions) {
        let mut connection = match self.connection.take() {
            Some(connection) => connection,
            None => {
                self.fail_deferred(ProvisioningError::TransportClosed);
                return;
            }
        };
        self.transition(MqttState::Connecting);
        let limit = self.config.timeout;
        self.step = Some(Box::pin(async move {
            let result = establish(&mut connection, &options, limit).await;
            Step::Connected(connection, result)
        }));
    }

    fn start_disconnect(&mut self) {
        let mut connection = match self.connection.take() {
            Some(connection) => connection,
            None => return,
        };
        self.transition(MqttState::Disconnecting);
        self.inbound = None;
        let subscribed = std::mem::replace(&mut self.subscribed, false);
        let limit = self.config.timeout;
        self.step = Some(Box::pin(async move {
            let result = teardown(&mut connection, subscribed, limit).await;
            Step::Disconnected(connection, result)
        }));
    }

    async fn handle_step(&mut self, outcome: Step<C>) {
        match outcome {
            Step::Connected(connection, Ok(inbound)) => {
                self.connection = Some(connection);
                self.inbound = Some(inbound);
                self.subscribed = true;
                self.transition(MqttState::Connected);

                if std::mem::replace(&mut self.teardown_requested, false) {
                    self.start_disconnect();
                    return;
                }
                for operation in std::mem::take(&mut self.deferred) {
                    self.publish(operation).await;
                }
            }
            Step::Connected(connection, Err(err)) => {
                warn!("Failed to connect: {}", err);
                self.connection = Some(connection);
                self.subscribed = false;
                self.teardown_requested = false;
                self.fail_deferred(err);
                self.start_disconnect();
            }
            Step::Disconnected(connection, result) => {
                self.connection = Some(connection);
                self.inbound = None;
                self.transition(MqttState::Disconnected);

                let mut waiters = std::mem::take(&mut self.disconnect_waiters).into_iter();
                if let Some(first) = waiters.next() {
                    for waiter in waiters {
                        let _ = waiter.send(result.as_ref().map(|_| ()).map_err(|e| e.duplicate()));
                    }
                    let _ = first.send(result);
                }

                if !self.deferred.is_empty() {
                    let operation = &self.deferred[0];
                    let options = self.connect_options(&operation.request, &operation.auth);
                    self.start_connect(options);
                }
            }
        }
    }

    async fn publish(&mut self, operation: Operation) {
        let Operation {
            request_id,
            kind,
            request,
            reply,
            ..
        } = operation;

        let (label, topic, operation_id, payload) = match kind {
            OperationKind::Register => {
                let body = DeviceRegistration {
                    registration_id: request.registration_id.clone(),
                    tpm: None,
                    payload: request.payload.clone(),
                };
                let payload = match serde_json::to_vec(&body) {
                    Ok(payload) => payload,
                    Err(err) => {
                        let _ = reply.send(Err(err.into()));
                        return;
                    }
                };
                (
                    StatusLabel::Registering,
                    register_topic(&request_id),
                    None,
                    payload,
                )
            }
            OperationKind::QueryStatus(operation_id) => (
                StatusLabel::Assigning,
                operation_status_topic(&request_id, &operation_id),
                Some(operation_id),
                Vec::new(),
            ),
        };

        if let Err(err) = self
            .table
            .register(request_id.clone(), reply, label, operation_id)
        {
            error!("Not publishing request: {}", err);
            return;
        }

        let limit = self.config.timeout;
        let published = match self.connection.as_mut() {
            Some(connection) => with_timeout(limit, connection.publish(&topic, payload)).await,
            None => Err(ProvisioningError::TransportClosed),
        };
        match published {
            Ok(()) => {
                trace!("Published {}", topic);
                self.deadlines.insert(request_id, Instant::now() + limit);
            }
            Err(err) => {
                self.table.resolve(&request_id, Err(err));
            }
        }
    }

    fn handle_event(&mut self, event: Option<ConnectionEvent>) {
        match event {
            Some(ConnectionEvent::Message { topic, payload }) => {
                self.handle_response(&topic, &payload)
            }
            Some(ConnectionEvent::Closed(reason)) => self.connection_lost(reason),
            None => self.connection_lost("event stream ended".to_string()),
        }
    }

    fn handle_response(&mut self, topic: &str, payload: &[u8]) {
        if !topic.starts_with(RESPONSE_TOPIC_PREFIX) {
            debug!("Ignoring message on {}", topic);
            return;
        }
        let response = match parse_response_topic(topic) {
            Ok(response) => response,
            Err(err) => {
                warn!("Dropping response: {}", err);
                return;
            }
        };
        let request_id = match response.request_id {
            Some(request_id) => request_id,
            None => {
                debug!("Dropping response without request id on {}", topic);
                return;
            }
        };
        self.deadlines.remove(&request_id);

        match self.table.take(&request_id) {
            Some(operation) => {
                let outcome = translate_response(
                    operation.label,
                    response.status,
                    response.retry_after,
                    payload,
                    operation.operation_id.as_deref(),
                );
                operation.complete(outcome);
            }
            None => debug!("Dropping response for unknown request id {}", request_id),
        }
    }

    fn connection_lost(&mut self, reason: String) {
        warn!("Connection lost: {}", reason);
        self.inbound = None;
        self.deadlines.clear();
        self.table
            .cancel_all(|| ProvisioningError::ConnectionLost(reason.clone()));
        if self.state == MqttState::Connected {
            self.subscribed = false;
            self.start_disconnect();
        }
    }

    fn expire(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(request_id, _)| request_id.clone())
            .collect();
        let limit = self.config.timeout;
        for request_id in expired {
            self.deadlines.remove(&request_id);
            if self.table.resolve(&request_id, Err(ProvisioningError::Timeout(limit))) {
                debug!("Request {} timed out", request_id);
            }
        }
    }

    fn cancel_pending<F>(&mut self, reason: F)
    where
        F: Fn() -> ProvisioningError,
    {
        for operation in self.deferred.drain(..) {
            operation.fail(reason());
        }
        self.deadlines.clear();
        let cancelled = self.table.cancel_all(&reason);
        if cancelled > 0 {
            debug!("Cancelled {} pending operation(s)", cancelled);
        }
    }

    fn fail_deferred(&mut self, err: ProvisioningError) {
        let mut deferred = std::mem::take(&mut self.deferred).into_iter();
        if let Some(first) = deferred.next() {
            for operation in deferred {
                operation.fail(err.duplicate());
            }
            first.fail(err);
        }
    }
}

/// Registration over a persistent MQTT session
///
/// Responses arrive on a shared topic and are matched to requests by `$rid`. The session is opened
/// by the first request and kept until [`ProvisioningTransport::disconnect`].
#[derive(Debug, Clone)]
pub struct MqttTransport {
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Submit(operation) => f
                .debug_struct("Submit")
                .field("request_id", &operation.request_id)
                .field("kind", &operation.kind)
                .finish(),
            Command::Cancel(_) => f.write_str("Cancel"),
            Command::Disconnect(_) => f.write_str("Disconnect"),
            Command::Inspect(_) => f.write_str("Inspect"),
        }
    }
}

impl MqttTransport {
    /// Transport over MQTT/TLS
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: ProvisioningConfig) -> Self {
        Self::with_connection(config, TlsMqttConnection::new())
    }

    /// Transport over `connection`
    ///
    /// Must be called within a tokio runtime.
    pub fn with_connection<C: MqttConnection>(config: ProvisioningConfig, connection: C) -> Self {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(Actor::new(config, connection).run(receiver));
        Self { commands }
    }

    /// Current session state
    pub async fn state(&self) -> crate::Result<MqttState> {
        Ok(self.inspect().await?.0)
    }

    /// Number of published requests still waiting for a response
    pub async fn pending_operations(&self) -> crate::Result<usize> {
        Ok(self.inspect().await?.1)
    }

    async fn inspect(&self) -> crate::Result<(MqttState, usize)> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Inspect(tx)).await?;
        rx.await.map_err(|_| ProvisioningError::TransportClosed)
    }

    async fn send(&self, command: Command) -> crate::Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ProvisioningError::TransportClosed)
    }

    async fn submit(
        &self,
        kind: OperationKind,
        request: &RegistrationRequest,
        auth: &Authentication,
    ) -> crate::Result<RegistrationResult> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Submit(Operation {
            request_id: Uuid::new_v4().to_string(),
            kind,
            request: request.clone(),
            auth: auth.clone(),
            reply: tx,
        }))
        .await?;
        rx.await.map_err(|_| ProvisioningError::TransportClosed)?
    }

    async fn control<F>(&self, command: F) -> crate::Result<()>
    where
        F: FnOnce(oneshot::Sender<crate::Result<()>>) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.map_err(|_| ProvisioningError::TransportClosed)?
    }
}

#[async_trait]
impl ProvisioningTransport for MqttTransport {
    async fn registration_request(
        &self,
        request: &RegistrationRequest,
        auth: &Authentication,
    ) -> crate::Result<RegistrationResult> {
        self.submit(OperationKind::Register, request, auth).await
    }

    async fn query_operation_status(
        &self,
        request: &RegistrationRequest,
        operation_id: &str,
        auth: &Authentication,
    ) -> crate::Result<RegistrationResult> {
        self.submit(
            OperationKind::QueryStatus(operation_id.to_string()),
            request,
            auth,
        )
        .await
    }

    async fn cancel(&self) -> crate::Result<()> {
        self.control(Command::Cancel).await
    }

    async fn disconnect(&self) -> crate::Result<()> {
        self.control(Command::Disconnect).await
    }
}
