//! Matches asynchronous responses with the request that caused them

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::registration::{RegistrationResult, StatusLabel};
use crate::ProvisioningError;

/// Receives the outcome of one pending operation
pub(crate) type ResultHandler<T> = oneshot::Sender<crate::Result<T>>;

/// A request that has been sent and not yet answered
#[derive(Debug)]
pub(crate) struct PendingOperation<T> {
    pub(crate) request_id: String,
    pub(crate) label: StatusLabel,
    pub(crate) operation_id: Option<String>,
    handler: ResultHandler<T>,
}

impl<T> PendingOperation<T> {
    /// Deliver `outcome` to whoever is waiting on this operation
    pub(crate) fn complete(self, outcome: crate::Result<T>) {
        if self.handler.send(outcome).is_err() {
            debug!(
                "Caller for request {} went away before the result arrived",
                self.request_id
            );
        }
    }
}

/// Outstanding operations keyed by client generated request id
///
/// `T` is what a transport hands back for one request: a translated [`RegistrationResult`] for
/// MQTT, the raw reply for HTTP.
#[derive(Debug)]
pub(crate) struct CorrelationTable<T = RegistrationResult> {
    pending: HashMap<String, PendingOperation<T>>,
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<T> CorrelationTable<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Track a new request
    ///
    /// Request ids are fresh UUIDs, a collision is a programming error.
    pub(crate) fn register(
        &mut self,
        request_id: String,
        handler: ResultHandler<T>,
        label: StatusLabel,
        operation_id: Option<String>,
    ) -> crate::Result<()> {
        if self.pending.contains_key(&request_id) {
            return Err(ProvisioningError::DuplicateRequestId(request_id));
        }
        trace!("Tracking request {} ({})", request_id, label.as_str());
        self.pending.insert(
            request_id.clone(),
            PendingOperation {
                request_id,
                label,
                operation_id,
                handler,
            },
        );
        Ok(())
    }

    /// Remove an operation without completing it
    pub(crate) fn take(&mut self, request_id: &str) -> Option<PendingOperation<T>> {
        self.pending.remove(request_id)
    }

    /// Complete and remove the operation for `request_id`
    ///
    /// Unknown ids are late or duplicate responses and are dropped. Returns whether an operation
    /// was completed.
    pub(crate) fn resolve(
        &mut self,
        request_id: &str,
        outcome: crate::Result<T>,
    ) -> bool {
        match self.pending.remove(request_id) {
            Some(operation) => {
                operation.complete(outcome);
                true
            }
            None => {
                debug!("Dropping response for unknown request id {}", request_id);
                false
            }
        }
    }

    /// Complete every pending operation with an error built by `reason`
    pub(crate) fn cancel_all<F>(&mut self, reason: F) -> usize
    where
        F: Fn() -> ProvisioningError,
    {
        let count = self.pending.len();
        for (_, operation) in self.pending.drain() {
            trace!("Cancelling request {}", operation.request_id);
            operation.complete(Err(reason()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::{AssignedDevice, PendingStatus};

    fn assigned() -> RegistrationResult {
        RegistrationResult::Assigned(AssignedDevice {
            registration_id: None,
            device_id: Some("dev".into()),
            assigned_hub: Some("hub".into()),
            substatus: None,
            issued_certificate: None,
            payload: None,
            body: serde_json::json!({}),
        })
    }

    #[test]
    fn duplicate_request_id_is_rejected() {
        let mut table: CorrelationTable = CorrelationTable::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        table
            .register("r1".into(), tx1, StatusLabel::Registering, None)
            .unwrap();
        let err = table
            .register("r1".into(), tx2, StatusLabel::Registering, None)
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::DuplicateRequestId(id) if id == "r1"));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn resolve_delivers_and_removes() {
        let mut table = CorrelationTable::new();
        let (tx, rx) = oneshot::channel();
        table
            .register("r1".into(), tx, StatusLabel::Registering, None)
            .unwrap();
        assert!(table.resolve("r1", Ok(assigned())));
        assert!(table.is_empty());
        assert!(rx.await.unwrap().unwrap().assigned().is_some());
    }

    #[tokio::test]
    async fn unknown_request_id_leaves_others_untouched() {
        let mut table = CorrelationTable::new();
        let (tx, mut rx) = oneshot::channel();
        table
            .register("r1".into(), tx, StatusLabel::Assigning, Some("op".into()))
            .unwrap();

        assert!(!table.resolve("nope", Ok(assigned())));
        assert!(!table.resolve("nope", Err(ProvisioningError::Cancelled)));

        assert_eq!(table.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_all_completes_every_handler_once() {
        let mut table: CorrelationTable = CorrelationTable::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        table
            .register("r1".into(), tx1, StatusLabel::Registering, None)
            .unwrap();
        table
            .register("r2".into(), tx2, StatusLabel::Assigning, Some("op".into()))
            .unwrap();

        assert_eq!(table.cancel_all(|| ProvisioningError::Cancelled), 2);
        assert!(table.is_empty());
        assert!(rx1.await.unwrap().unwrap_err().is_cancelled());
        assert!(rx2.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(table.cancel_all(|| ProvisioningError::Cancelled), 0);
    }

    #[test]
    fn resolving_after_caller_dropped_is_harmless() {
        let mut table = CorrelationTable::new();
        let (tx, rx) = oneshot::channel();
        drop(rx);
        table
            .register("r1".into(), tx, StatusLabel::Registering, None)
            .unwrap();
        let pending = RegistrationResult::Assigning(PendingStatus {
            label: StatusLabel::Registering,
            operation_id: None,
            retry_after: None,
        });
        assert!(table.resolve("r1", Ok(pending)));
        assert!(table.is_empty());
    }
}
