use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};

use crate::config::ProvisioningConfig;
use crate::registration::{
    Authentication, OperationStatus, PendingStatus, RegistrationRequest, RegistrationResult,
};
use crate::transport::ProvisioningTransport;
use crate::ProvisioningError;

const STATUS_BUFFER: usize = 16;

/// Where a registration attempt currently is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    /// No registration running
    Idle,
    /// Waiting for the service to accept the registration request
    Registering,
    /// Waiting before the next registration or status request
    Waiting,
    /// Waiting for the status of an accepted registration
    Polling {
        ///
        operation_id: String,
    },
}

#[derive(Debug)]
struct Attempt {
    id: u64,
    cancel: watch::Sender<bool>,
}

#[derive(Debug)]
struct Inner {
    state: RegistrationState,
    active: Option<Attempt>,
    next_attempt: u64,
    /// `cancel`/`disconnect` calls still waiting on the transport
    stopping: usize,
}

/// Drives a registration to a terminal result over any [`ProvisioningTransport`]
///
/// Only one registration may run at a time. "Still assigning" responses are polled for, honoring
/// the service's `retry-after`; every other failure ends the attempt and is returned to the caller
/// without retrying.
#[derive(Debug)]
pub struct RegistrationStateMachine<T> {
    transport: T,
    config: ProvisioningConfig,
    inner: Mutex<Inner>,
    status: broadcast::Sender<OperationStatus>,
}

/// Returns the machine to idle when an attempt finishes, however it finishes
struct AttemptGuard<'a, T> {
    machine: &'a RegistrationStateMachine<T>,
    id: u64,
}

impl<T> Drop for AttemptGuard<'_, T> {
    fn drop(&mut self) {
        let mut inner = self.machine.lock();
        if inner.active.as_ref().map(|a| a.id) == Some(self.id) {
            inner.active = None;
            inner.state = RegistrationState::Idle;
        }
    }
}

/// Holds off new registrations until a `cancel`/`disconnect` has reached the transport
struct StopGuard<'a, T> {
    machine: &'a RegistrationStateMachine<T>,
    cancelled: Option<u64>,
}

impl<T> Drop for StopGuard<'_, T> {
    fn drop(&mut self) {
        let mut inner = self.machine.lock();
        inner.stopping -= 1;
        if self.cancelled.is_some() && inner.active.as_ref().map(|a| a.id) == self.cancelled {
            inner.active = None;
        }
        if inner.active.is_none() {
            inner.state = RegistrationState::Idle;
        }
    }
}

async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    loop {
        if *cancelled.borrow() {
            return;
        }
        if cancelled.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl<T> RegistrationStateMachine<T> {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> RegistrationStateMachine<T>
where
    T: ProvisioningTransport,
{
    ///
    pub fn new(transport: T, config: ProvisioningConfig) -> Self {
        let (status, _) = broadcast::channel(STATUS_BUFFER);
        Self {
            transport,
            config,
            inner: Mutex::new(Inner {
                state: RegistrationState::Idle,
                active: None,
                next_attempt: 0,
                stopping: 0,
            }),
            status,
        }
    }

    /// The transport registrations run over
    pub fn transport(&self) -> &T {
        &self.transport
    }

    ///
    pub fn state(&self) -> RegistrationState {
        self.lock().state.clone()
    }

    /// Intermediate progress of registrations started after this call
    pub fn status_updates(&self) -> broadcast::Receiver<OperationStatus> {
        self.status.subscribe()
    }

    /// Register the device and wait for a terminal result
    ///
    /// Fails immediately with [`ProvisioningError::InvalidOperation`] if another registration is
    /// still running.
    pub async fn register(
        &self,
        request: &RegistrationRequest,
        auth: &Authentication,
    ) -> crate::Result<RegistrationResult> {
        let (id, mut cancelled) = self.begin()?;
        let _guard = AttemptGuard { machine: self, id };

        info!(
            "Registering {} in scope {}",
            request.registration_id, request.id_scope
        );
        let result = self.drive(id, request, auth, &mut cancelled).await;
        match &result {
            Ok(RegistrationResult::Assigned(device)) => info!(
                "Registration {} assigned to {:?}",
                request.registration_id, device.assigned_hub
            ),
            Ok(other) => info!("Registration {} finished: {:?}", request.registration_id, other),
            Err(err) => info!("Registration {} failed: {}", request.registration_id, err),
        }
        result
    }

    /// Stop the running registration, which completes with [`ProvisioningError::Cancelled`]
    ///
    /// Safe to call when nothing is running. A `register` made before this returns is rejected.
    pub async fn cancel(&self) -> crate::Result<()> {
        let _stopping = self.abandon();
        self.transport.cancel().await
    }

    /// Stop the running registration and release the transport's connection
    pub async fn disconnect(&self) -> crate::Result<()> {
        let _stopping = self.abandon();
        self.transport.disconnect().await
    }

    fn begin(&self) -> crate::Result<(u64, watch::Receiver<bool>)> {
        let mut inner = self.lock();
        if inner.active.is_some() {
            return Err(ProvisioningError::InvalidOperation(
                "a registration is already in progress",
            ));
        }
        if inner.stopping > 0 {
            return Err(ProvisioningError::InvalidOperation(
                "a registration is still being cancelled",
            ));
        }
        let id = inner.next_attempt;
        inner.next_attempt += 1;
        let (cancel, cancelled) = watch::channel(false);
        inner.active = Some(Attempt { id, cancel });
        inner.state = RegistrationState::Registering;
        Ok((id, cancelled))
    }

    /// Signal the running attempt and keep the machine busy until the returned guard drops
    fn abandon(&self) -> StopGuard<'_, T> {
        let mut inner = self.lock();
        inner.stopping += 1;
        let cancelled = inner.active.as_ref().map(|attempt| {
            debug!("Cancelling registration attempt {}", attempt.id);
            let _ = attempt.cancel.send(true);
            attempt.id
        });
        StopGuard {
            machine: self,
            cancelled,
        }
    }

    fn set_state(&self, id: u64, state: RegistrationState) {
        let mut inner = self.lock();
        if inner.active.as_ref().map(|a| a.id) == Some(id) {
            trace!("Registration state {:?} -> {:?}", inner.state, state);
            inner.state = state;
        }
    }

    /// Run `future` unless the attempt is cancelled first
    async fn guarded<F, R>(&self, cancelled: &mut watch::Receiver<bool>, future: F) -> crate::Result<R>
    where
        F: Future<Output = crate::Result<R>>,
    {
        if *cancelled.borrow() {
            return Err(ProvisioningError::Cancelled);
        }
        tokio::select! {
            result = future => result,
            _ = wait_cancelled(cancelled) => Err(ProvisioningError::Cancelled),
        }
    }

    async fn drive(
        &self,
        id: u64,
        request: &RegistrationRequest,
        auth: &Authentication,
        cancelled: &mut watch::Receiver<bool>,
    ) -> crate::Result<RegistrationResult> {
        let mut outcome = self
            .guarded(cancelled, self.transport.registration_request(request, auth))
            .await?;
        let mut operation_id: Option<String> = None;

        loop {
            let pending = match outcome {
                RegistrationResult::Assigning(pending) => pending,
                terminal => return Ok(terminal),
            };
            if pending.operation_id.is_some() {
                operation_id = pending.operation_id.clone();
            }

            let delay = self.next_poll(&pending);
            let _ = self.status.send(OperationStatus {
                registration_id: request.registration_id.clone(),
                label: pending.label,
                operation_id: operation_id.clone(),
                next_poll: delay,
            });

            self.set_state(id, RegistrationState::Waiting);
            self.guarded(cancelled, async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;

            outcome = match &operation_id {
                Some(operation_id) => {
                    self.set_state(
                        id,
                        RegistrationState::Polling {
                            operation_id: operation_id.clone(),
                        },
                    );
                    self.guarded(
                        cancelled,
                        self.transport
                            .query_operation_status(request, operation_id, auth),
                    )
                    .await?
                }
                None => {
                    self.set_state(id, RegistrationState::Registering);
                    self.guarded(cancelled, self.transport.registration_request(request, auth))
                        .await?
                }
            };
        }
    }

    fn next_poll(&self, pending: &PendingStatus) -> std::time::Duration {
        pending.retry_after.unwrap_or(self.config.polling_interval)
    }
}
