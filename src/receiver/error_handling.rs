//! Moving failed messages to error storage and retrying them from there.

use std::sync::Arc;
use tracing::{error, info, warn};

use super::processing::MessageIdentity;
use super::{ProcessOutcome, Receiver, ResolvedSettings};
use crate::error::{ReceiverError, Result};
use crate::listener::RawPayload;
use crate::message::{Message, MessageWrapper, ReceivedMessage};
use crate::state_machine::ProcessState;
use crate::storage::{MessageStore, StorageEntry, StoredMessage};
use crate::transaction::{TransactionDefinition, TransactionHandle};

impl<M: RawPayload> Receiver<M> {
    /// Take a message out of processing: move it to the ERROR process state
    /// (DONE when the listener has no ERROR state) and store it in the error
    /// storage, in a transaction obtained with `definition`.
    ///
    /// Failures are logged and swallowed.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn move_in_process_to_error(
        &self,
        received: &ReceivedMessage<M>,
        message: &Message,
        identity: &MessageIdentity<'_>,
        comments: &str,
        definition: &TransactionDefinition,
        current: Option<&TransactionHandle>,
        settings: &ResolvedSettings<M>,
    ) {
        let tx = match self
            .transaction_manager
            .get_transaction(definition, current)
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                error!(
                    receiver = %self.name,
                    message_id = %identity.message_id,
                    error = %e,
                    "Could not obtain a transaction to move message to error"
                );
                return;
            }
        };

        if let Some(listener) = &settings.capabilities.process_state {
            let target = if settings.capabilities.supports_process_state(ProcessState::Error) {
                ProcessState::Error
            } else {
                ProcessState::Done
            };
            if let Err(e) = listener
                .change_process_state(&tx, received, target, comments)
                .await
            {
                warn!(receiver = %self.name, message_id = %identity.message_id, error = %e, "Could not change process state");
            }
        }

        if let Some(storage) = &self.error_storage {
            let wrapper = match received {
                ReceivedMessage::Stored(wrapper) => wrapper.clone(),
                ReceivedMessage::Raw(raw) => MessageWrapper::from_raw(raw, message.clone()),
            };
            let wrapper = match &settings.masker {
                Some(masker) => wrapper.with_message(masker.mask_message(wrapper.message())),
                None => wrapper,
            };
            let entry = StorageEntry {
                message_id: identity.message_id.to_string(),
                correlation_id: identity.correlation_id.to_string(),
                received: identity.received_at,
                comments: comments.to_string(),
                message: wrapper,
            };
            match storage.store_message(&tx, entry).await {
                Ok(storage_key) => {
                    info!(
                        receiver = %self.name,
                        message_id = %identity.message_id,
                        storage = %storage.name(),
                        storage_key = %storage_key,
                        "Message moved to error storage"
                    );
                }
                Err(e) => {
                    error!(
                        receiver = %self.name,
                        message_id = %identity.message_id,
                        error = %e,
                        "Could not store message in error storage"
                    );
                    self.rollback_quietly(&tx).await;
                    return;
                }
            }
        }

        if let Err(e) = self.transaction_manager.commit(&tx).await {
            error!(
                receiver = %self.name,
                message_id = %identity.message_id,
                error = %e,
                "Could not commit move to error"
            );
        }
    }

    /// Reprocess a message from the error storage.
    ///
    /// The message is taken out of the error storage and processed in one
    /// transaction. On failure that transaction rolls back, so the message
    /// stays in error storage, and the failure is appended to its comments.
    pub async fn retry_message(&self, storage_key: &str) -> Result<ProcessOutcome> {
        let settings = self.settings()?;
        let storage = self.error_storage.clone().ok_or_else(|| {
            ReceiverError::InvalidState(format!("receiver '{}' has no error storage", self.name))
        })?;

        let definition = TransactionDefinition::required().with_timeout(self.config.transaction_timeout());
        let tx = self
            .transaction_manager
            .get_transaction(&definition, None)
            .await?;

        let stored = match self.take_from_error_storage(&storage, storage_key, &tx, &settings).await {
            Ok(stored) => stored,
            Err(e) => {
                self.rollback_quietly(&tx).await;
                return Err(ReceiverError::RetryFailed {
                    storage_key: storage_key.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        self.statistics.record_retried();
        info!(
            receiver = %self.name,
            storage_key = %storage_key,
            message_id = %stored.entry.message_id,
            "Retrying message from error storage"
        );

        let message = stored.entry.message.message().clone();
        let received = ReceivedMessage::Stored(stored.entry.message.clone());
        let report = self
            .process_message_in_adapter(received, Ok(message), &tx, true, &settings)
            .await;

        let failure = match &report {
            Ok(report) if !report.outcome.is_error() && !tx.is_rollback_only() => None,
            Ok(report) => Some(match (&report.pipeline_error, report.outcome.result()) {
                (Some(e), _) => e.to_string(),
                (None, Some(result)) => result.result.to_string(),
                (None, None) => format!("message ended in {}", report.outcome.exit_state()),
            }),
            Err(e) => Some(e.to_string()),
        };

        match (failure, report) {
            (None, Ok(report)) => {
                self.transaction_manager.commit(&tx).await?;
                info!(receiver = %self.name, storage_key = %storage_key, "Retried message processed");
                Ok(report.outcome)
            }
            (failure, _) => {
                let reason = failure.unwrap_or_else(|| "retry failed".to_string());
                warn!(receiver = %self.name, storage_key = %storage_key, reason = %reason, "Retry failed");
                self.rollback_quietly(&tx).await;
                self.append_retry_comment(&storage, storage_key, &stored.entry.comments, &reason)
                    .await;
                Err(ReceiverError::RetryFailed {
                    storage_key: storage_key.to_string(),
                    reason,
                })
            }
        }
    }

    async fn take_from_error_storage(
        &self,
        storage: &Arc<dyn MessageStore>,
        storage_key: &str,
        tx: &TransactionHandle,
        settings: &ResolvedSettings<M>,
    ) -> Result<StoredMessage> {
        let stored = storage.browse_message(tx, storage_key).await?;
        if let Some(listener) = &settings.capabilities.process_state {
            if settings.capabilities.supports_process_state(ProcessState::InProcess) {
                let received = ReceivedMessage::Stored(stored.entry.message.clone());
                listener
                    .change_process_state(tx, &received, ProcessState::InProcess, "manual retry")
                    .await?;
            }
        }
        storage.delete_message(tx, storage_key).await?;
        Ok(stored)
    }

    /// Record a failed retry in a transaction of its own, so the note survives
    /// the rollback of the retry
    async fn append_retry_comment(
        &self,
        storage: &Arc<dyn MessageStore>,
        storage_key: &str,
        previous: &str,
        reason: &str,
    ) {
        let comments = if previous.is_empty() {
            format!("retry failed: {reason}")
        } else {
            format!("{previous}; retry failed: {reason}")
        };
        let tx = match self
            .transaction_manager
            .get_transaction(&TransactionDefinition::requires_new(), None)
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                warn!(receiver = %self.name, error = %e, "Could not obtain a transaction for the retry comment");
                return;
            }
        };
        match storage.update_comment(&tx, storage_key, &comments).await {
            Ok(()) => {
                if let Err(e) = self.transaction_manager.commit(&tx).await {
                    warn!(receiver = %self.name, storage_key = %storage_key, error = %e, "Could not commit retry comment");
                }
            }
            Err(e) => {
                warn!(receiver = %self.name, storage_key = %storage_key, error = %e, "Could not update retry comment");
                self.rollback_quietly(&tx).await;
            }
        }
    }

    pub(crate) async fn rollback_quietly(&self, tx: &TransactionHandle) {
        if let Err(e) = self.transaction_manager.rollback(tx).await {
            warn!(receiver = %self.name, error = %e, "Rollback failed");
        }
    }
}
