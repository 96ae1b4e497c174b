use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{clients::database::AuditStore, models::audit::CreateAuditLog};

/// Hands audit records to a background task so request handlers never wait
/// on the audit store.
///
/// The queue is bounded; when it is full the record is dropped and logged.
#[derive(Clone)]
pub struct AuditWriter {
    sender: mpsc::Sender<CreateAuditLog>,
}

impl AuditWriter {
    /// Starts the writer task. The task exits once every `AuditWriter` clone
    /// is dropped and the queue has drained.
    pub fn spawn(
        store: Arc<dyn AuditStore>,
        capacity: usize,
        write_timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let handle = tokio::spawn(run_writer(store, receiver, write_timeout));

        (Self { sender }, handle)
    }

    /// Queues `log` without waiting. Returns false when it was dropped.
    pub fn submit(&self, log: CreateAuditLog) -> bool {
        match self.sender.try_send(log) {
            Ok(()) => true,
            Err(TrySendError::Full(log)) => {
                warn!(
                    user_id = %log.user_id,
                    application = %log.application,
                    success = log.success,
                    "Audit queue full, dropping audit log"
                );
                false
            }
            Err(TrySendError::Closed(log)) => {
                warn!(
                    user_id = %log.user_id,
                    application = %log.application,
                    "Audit writer stopped, dropping audit log"
                );
                false
            }
        }
    }
}

async fn run_writer(
    store: Arc<dyn AuditStore>,
    mut receiver: mpsc::Receiver<CreateAuditLog>,
    write_timeout: Duration,
) {
    let write_timeout_ms = write_timeout.as_millis() as u64;

    while let Some(log) = receiver.recv().await {
        match timeout(write_timeout, store.insert(log)).await {
            Ok(Ok(saved)) => debug!(id = %saved.id, "Audit log saved"),
            Ok(Err(e)) => warn!(error = %e, "Failed to save audit log"),
            Err(_) => warn!(write_timeout_ms, "Timed out saving audit log"),
        }
    }

    info!("Audit writer stopped");
}
