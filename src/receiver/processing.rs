//! Per-message processing: history check, duplicate check, pipeline call,
//! post-processing and backoff.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ProcessOutcome, Receiver, ResolvedSettings};
use crate::adapter::PipeLineResult;
use crate::config::DuplicateCheckMethod;
use crate::constants::receiver::{
    EXIT_CODE_DUPLICATE, EXIT_CODE_REJECTED, RESULT_ON_TIMEOUT, SLEEP_TICK,
    TOO_MANY_RETRIES_COMMENT,
};
use crate::error::{ListenerError, PipelineError, ReceiverError, Result};
use crate::events::MonitorEvent;
use crate::listener::{MessageHandler, RawPayload};
use crate::log_receiver;
use crate::message::{Message, MessageWrapper, PipeLineSession, RawMessageWrapper, ReceivedMessage};
use crate::state_machine::{ExitState, ProcessState, RunState};
use crate::storage::StorageEntry;
use crate::transaction::{TransactionDefinition, TransactionHandle, TransactionOutcome};

/// Outcome of one pass through the receiver, with the pipeline exception if one was raised
#[derive(Debug)]
pub(crate) struct ProcessingReport {
    pub(crate) message_id: String,
    pub(crate) outcome: ProcessOutcome,
    pub(crate) pipeline_error: Option<PipelineError>,
}

enum History {
    Proceed { delivery_count: i32 },
    Rejected { delivery_count: i32 },
    Duplicate,
}

/// What the pipeline stage produced
struct PipelineRun {
    result: PipeLineResult,
    pipeline_error: Option<PipelineError>,
    comments: Option<String>,
}

impl PipelineRun {
    fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            result: PipeLineResult::error(reason.as_str()),
            pipeline_error: None,
            comments: Some(reason),
        }
    }
}

/// Identity of the message being processed
pub(crate) struct MessageIdentity<'a> {
    pub(crate) message_id: &'a str,
    pub(crate) correlation_id: &'a str,
    pub(crate) received_at: DateTime<Utc>,
}

impl<M: RawPayload> Receiver<M> {
    /// Process a message retrieved by the listener, inside `tx`.
    ///
    /// The caller owns `tx`: the receiver only marks it rollback-only when the
    /// message ended in error.
    pub async fn process_raw_message(
        &self,
        raw: RawMessageWrapper<M>,
        tx: &TransactionHandle,
    ) -> Result<ProcessOutcome> {
        let settings = self.settings()?;
        self.reset_exception_counter();
        let message = self.listener.extract_message(&raw);
        let report = self
            .process_message_in_adapter(ReceivedMessage::Raw(raw), message, tx, false, &settings)
            .await?;
        Ok(report.outcome)
    }

    /// Request/reply processing for pushing listeners and the in-process registry.
    ///
    /// Runs in a transaction of its own; a pipeline exception is returned as
    /// [`ReceiverError::Pipeline`] and a rejected message as [`ReceiverError::Rejected`].
    pub async fn process_request(
        &self,
        message_id: Option<String>,
        correlation_id: Option<String>,
        raw_message: M,
        context: IndexMap<String, Value>,
    ) -> Result<Message> {
        let raw = RawMessageWrapper::with_context(raw_message, message_id, correlation_id, context);
        self.process_request_raw(raw).await
    }

    pub(crate) async fn process_request_raw(&self, raw: RawMessageWrapper<M>) -> Result<Message> {
        let settings = self.settings()?;
        if !self.run_state.is_in_state(RunState::Started) {
            return Err(ReceiverError::InvalidState(format!(
                "receiver '{}' is {}, requests are only accepted when started",
                self.name,
                self.run_state.get()
            )));
        }
        self.reset_exception_counter();

        let tx = self
            .transaction_manager
            .get_transaction(&settings.transaction_definition, None)
            .await?;
        let message = self.listener.extract_message(&raw);
        let report = match self
            .process_message_in_adapter(ReceivedMessage::Raw(raw), message, &tx, false, &settings)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                self.rollback_quietly(&tx).await;
                return Err(e);
            }
        };

        if tx.is_rollback_only() {
            self.rollback_quietly(&tx).await;
        } else {
            self.transaction_manager.commit(&tx).await?;
        }

        if let Some(e) = report.pipeline_error {
            return Err(e.into());
        }
        match report.outcome {
            ProcessOutcome::Accepted(result) | ProcessOutcome::Retry { result, .. } => {
                Ok(result.result)
            }
            ProcessOutcome::Duplicate => Ok(Message::null()),
            ProcessOutcome::Rejected { reason } => Err(ReceiverError::Rejected {
                message_id: report.message_id,
                reason,
            }),
        }
    }

    /// The processing algorithm shared by pulled, pushed and manually retried messages
    pub(crate) async fn process_message_in_adapter(
        &self,
        mut received: ReceivedMessage<M>,
        message: std::result::Result<Message, ListenerError>,
        tx: &TransactionHandle,
        manual_retry: bool,
        settings: &ResolvedSettings<M>,
    ) -> Result<ProcessingReport> {
        let started = Instant::now();
        let received_at = Utc::now();
        let message_id = received.ensure_id();

        let correlation_id = message
            .as_ref()
            .ok()
            .and_then(|m| {
                settings
                    .correlation_extractor
                    .as_ref()
                    .and_then(|extractor| extractor.extract(m))
            })
            .or_else(|| received.correlation_id().map(str::to_string))
            .unwrap_or_else(|| message_id.clone());

        let mut session = PipeLineSession::from_context(received.context());
        session.populate(&message_id, &correlation_id, received_at, manual_retry);
        self.statistics.record_received();

        let identity = MessageIdentity {
            message_id: &message_id,
            correlation_id: &correlation_id,
            received_at,
        };

        let mut delivery_count = 1;
        if !manual_retry {
            match self
                .check_message_history(&received, &identity, tx, settings)
                .await?
            {
                History::Proceed { delivery_count: count } => delivery_count = count,
                History::Rejected { delivery_count } => {
                    return Ok(self
                        .reject(&received, &message, &identity, delivery_count, &mut session, tx, settings)
                        .await);
                }
                History::Duplicate => {
                    return Ok(self
                        .skip_duplicate(&received, &identity, &mut session, tx, settings)
                        .await);
                }
            }
        }

        session.record_delivery_count(delivery_count);

        let original = message.as_ref().ok().cloned();
        let run = match message {
            Ok(message) => {
                self.run_pipeline(&identity, message, &mut session, tx, settings)
                    .await
            }
            Err(e) => {
                warn!(receiver = %self.name, message_id = %message_id, error = %e, "Could not extract message");
                PipelineRun::failed(e.to_string())
            }
        };
        let PipelineRun {
            result,
            pipeline_error,
            comments,
        } = run;

        let in_error = !result.is_successful() || tx.is_rollback_only();
        if in_error {
            tx.set_rollback_only();
        }
        let exit_state = if in_error {
            ExitState::Error
        } else {
            ExitState::Success
        };

        if !manual_retry {
            self.cache.update(&message_id, exit_state, comments.clone());
            if !in_error && tx.is_active() {
                let cache = Arc::clone(&self.cache);
                let id = message_id.clone();
                tx.register_synchronization(Box::new(move |outcome| {
                    if outcome == TransactionOutcome::RolledBack {
                        cache.flip_success_to_error(&id, "transaction rolled back after processing");
                    }
                }));
            }
        }

        let error_comments = comments
            .clone()
            .unwrap_or_else(|| "message processed in error".to_string());
        let mut moved_to_error = false;
        if in_error && !manual_retry && !self.is_transacted() && !settings.capabilities.redelivering {
            let message = original.clone().unwrap_or_else(Message::null);
            self.move_in_process_to_error(
                &received,
                &message,
                &identity,
                &error_comments,
                &TransactionDefinition::requires_new(),
                Some(tx),
                settings,
            )
            .await;
            moved_to_error = true;
        }

        if let Some(listener) = &settings.capabilities.process_state {
            if !moved_to_error && !tx.is_rollback_only() {
                let (target, reason) = if in_error {
                    let target = if settings.capabilities.supports_process_state(ProcessState::Error) {
                        ProcessState::Error
                    } else {
                        ProcessState::Done
                    };
                    (target, error_comments.as_str())
                } else {
                    (ProcessState::Done, "processed")
                };
                if let Err(e) = listener
                    .change_process_state(tx, &received, target, reason)
                    .await
                {
                    warn!(receiver = %self.name, message_id = %message_id, error = %e, "Could not change process state");
                }
            }
        }

        self.notify_listener(&result, &received, &mut session).await;
        self.statistics.record_processed(started.elapsed(), in_error);

        log_receiver!(
            debug,
            "PROCESSED",
            receiver: self.name,
            message_id: message_id,
            correlation_id: correlation_id,
            exit_state: exit_state,
            delivery_count: delivery_count,
            manual_retry: manual_retry,
        );

        let outcome = if in_error {
            let delay = if !manual_retry
                && !retry_limit_reached(settings.max_retries, delivery_count)
            {
                self.increase_backoff_interval_and_wait().await
            } else {
                Duration::ZERO
            };
            ProcessOutcome::Retry { result, delay }
        } else {
            self.reset_backoff().await;
            ProcessOutcome::Accepted(result)
        };

        Ok(ProcessingReport {
            message_id,
            outcome,
            pipeline_error,
        })
    }

    async fn check_message_history(
        &self,
        received: &ReceivedMessage<M>,
        identity: &MessageIdentity<'_>,
        tx: &TransactionHandle,
        settings: &ResolvedSettings<M>,
    ) -> Result<History> {
        let cached = self
            .cache
            .record_delivery(identity.message_id, identity.received_at);
        let delivery_count = match (&settings.capabilities.delivery_count, received.as_raw()) {
            (Some(counter), Some(raw)) => counter.get_delivery_count(raw),
            _ => cached.receive_count,
        };

        if settings.max_retries >= 0 && delivery_count > settings.max_retries + 1 {
            return Ok(History::Rejected { delivery_count });
        }
        if delivery_count > 1 {
            debug!(
                receiver = %self.name,
                message_id = %identity.message_id,
                delivery_count,
                "Message is being redelivered"
            );
        }

        if self.config.check_for_duplicates {
            if let Some(log) = &self.message_log {
                let seen = match self.config.check_for_duplicates_method {
                    DuplicateCheckMethod::MessageId => {
                        log.contains_message_id(tx, identity.message_id).await?
                    }
                    DuplicateCheckMethod::CorrelationId => {
                        log.contains_correlation_id(tx, identity.correlation_id)
                            .await?
                    }
                };
                if seen {
                    return Ok(History::Duplicate);
                }
            }
        }

        Ok(History::Proceed { delivery_count })
    }

    #[allow(clippy::too_many_arguments)]
    async fn reject(
        &self,
        received: &ReceivedMessage<M>,
        message: &std::result::Result<Message, ListenerError>,
        identity: &MessageIdentity<'_>,
        delivery_count: i32,
        session: &mut PipeLineSession,
        tx: &TransactionHandle,
        settings: &ResolvedSettings<M>,
    ) -> ProcessingReport {
        session.record_delivery_count(delivery_count);
        warn!(
            receiver = %self.name,
            message_id = %identity.message_id,
            delivery_count,
            max_retries = settings.max_retries,
            "Message exceeded the retry limit and is moved to error storage"
        );

        let message = message.as_ref().ok().cloned().unwrap_or_else(Message::null);
        self.move_in_process_to_error(
            received,
            &message,
            identity,
            TOO_MANY_RETRIES_COMMENT,
            &TransactionDefinition::required(),
            Some(tx),
            settings,
        )
        .await;

        self.cache.update(
            identity.message_id,
            ExitState::Rejected,
            Some(TOO_MANY_RETRIES_COMMENT.to_string()),
        );
        self.statistics.record_rejected();

        let result = PipeLineResult::new(Message::from(TOO_MANY_RETRIES_COMMENT), ExitState::Rejected)
            .with_exit_code(EXIT_CODE_REJECTED);
        self.notify_listener(&result, received, session).await;

        ProcessingReport {
            message_id: identity.message_id.to_string(),
            outcome: ProcessOutcome::Rejected {
                reason: TOO_MANY_RETRIES_COMMENT.to_string(),
            },
            pipeline_error: None,
        }
    }

    async fn skip_duplicate(
        &self,
        received: &ReceivedMessage<M>,
        identity: &MessageIdentity<'_>,
        session: &mut PipeLineSession,
        tx: &TransactionHandle,
        settings: &ResolvedSettings<M>,
    ) -> ProcessingReport {
        info!(
            receiver = %self.name,
            message_id = %identity.message_id,
            correlation_id = %identity.correlation_id,
            "Duplicate message skipped"
        );
        self.cache.update(
            identity.message_id,
            ExitState::Success,
            Some("duplicate".to_string()),
        );
        self.statistics.record_duplicate();

        if let Some(listener) = &settings.capabilities.process_state {
            if !tx.is_rollback_only()
                && settings.capabilities.supports_process_state(ProcessState::Done)
            {
                if let Err(e) = listener
                    .change_process_state(tx, received, ProcessState::Done, "duplicate")
                    .await
                {
                    warn!(receiver = %self.name, message_id = %identity.message_id, error = %e, "Could not mark duplicate as done");
                }
            }
        }

        let result =
            PipeLineResult::new(Message::null(), ExitState::Success).with_exit_code(EXIT_CODE_DUPLICATE);
        self.notify_listener(&result, received, session).await;

        ProcessingReport {
            message_id: identity.message_id.to_string(),
            outcome: ProcessOutcome::Duplicate,
            pipeline_error: None,
        }
    }

    /// Compaction, message log, adapter call and result sender
    async fn run_pipeline(
        &self,
        identity: &MessageIdentity<'_>,
        message: Message,
        session: &mut PipeLineSession,
        tx: &TransactionHandle,
        settings: &ResolvedSettings<M>,
    ) -> PipelineRun {
        let message = match &settings.compactor {
            Some(compactor) => compactor.compact(&message, session),
            None => message,
        };

        if let Some(log) = &self.message_log {
            let logged = match &settings.masker {
                Some(masker) => masker.mask_message(&message),
                None => message.clone(),
            };
            let entry = StorageEntry {
                message_id: identity.message_id.to_string(),
                correlation_id: identity.correlation_id.to_string(),
                received: identity.received_at,
                comments: String::new(),
                message: MessageWrapper::new(
                    logged,
                    Some(identity.message_id.to_string()),
                    Some(identity.correlation_id.to_string()),
                ),
            };
            if let Err(e) = log.store_message(tx, entry).await {
                return PipelineRun::failed(format!(
                    "could not store message in message log '{}': {e}",
                    log.name()
                ));
            }
        }

        let invocation =
            self.adapter
                .process_message_with_exceptions(identity.message_id, message, session);
        let completed = match self.config.transaction_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, invocation)
                .await
                .map_err(|_| timeout),
            None => Ok(invocation.await),
        };

        let result = match completed {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.exception_thrown("Exception while processing message", &e)
                    .await;
                return PipelineRun {
                    result: PipeLineResult::error(e.to_string()),
                    comments: Some(e.to_string()),
                    pipeline_error: Some(e),
                };
            }
            Err(timeout) => {
                let error = ReceiverError::Timeout(format!(
                    "pipeline of adapter '{}' exceeded the transaction timeout of {}s",
                    self.adapter.name(),
                    timeout.as_secs()
                ));
                self.exception_thrown("Timeout while processing message", &error)
                    .await;
                return PipelineRun {
                    result: PipeLineResult::error(RESULT_ON_TIMEOUT),
                    pipeline_error: None,
                    comments: Some(error.to_string()),
                };
            }
        };

        if !result.is_successful() {
            let comments = format!(
                "pipeline ended in {}: {}",
                result.state,
                result.result
            );
            return PipelineRun {
                result,
                pipeline_error: None,
                comments: Some(comments),
            };
        }

        if let Some(sender) = &self.sender {
            if let Err(e) = sender.send_result(identity.message_id, &result, session).await {
                warn!(receiver = %self.name, message_id = %identity.message_id, error = %e, "Could not send result");
                return PipelineRun {
                    result: PipeLineResult {
                        state: ExitState::Error,
                        ..result
                    },
                    pipeline_error: None,
                    comments: Some(e.to_string()),
                };
            }
        }

        PipelineRun {
            result,
            pipeline_error: None,
            comments: None,
        }
    }

    async fn notify_listener(
        &self,
        result: &PipeLineResult,
        received: &ReceivedMessage<M>,
        session: &mut PipeLineSession,
    ) {
        session.record_exit(result.state, result.exit_code);
        if let Err(e) = self
            .listener
            .after_message_processed(result, received, session)
            .await
        {
            warn!(receiver = %self.name, error = %e, "Listener failed after processing message");
        }
    }

    /// Wait the current backoff delay, then double it for the next failure
    async fn increase_backoff_interval_and_wait(&self) -> Duration {
        let step = self.backoff.lock().next_step();
        if step.suspended {
            warn!(
                receiver = %self.name,
                backoff_delay_secs = step.delay.as_secs(),
                "Receiver suspended by repeated failures"
            );
            self.publish(MonitorEvent::ReceiverSuspended {
                receiver: self.name.clone(),
                backoff_delay_secs: step.delay.as_secs(),
            })
            .await;
        }
        debug!(receiver = %self.name, delay_secs = step.delay.as_secs(), "Backing off after failure");
        self.run_state
            .sleep_while_in(RunState::Started, step.delay, SLEEP_TICK)
            .await;
        step.delay
    }

    async fn reset_backoff(&self) {
        let was_suspended = self.backoff.lock().reset();
        if was_suspended {
            info!(receiver = %self.name, "Receiver resumed after suspension");
            self.publish(MonitorEvent::ReceiverResumed {
                receiver: self.name.clone(),
            })
            .await;
        }
    }
}

/// Whether this attempt was the last one the retry limit allows; no backoff
/// is waited after it
fn retry_limit_reached(max_retries: i32, delivery_count: i32) -> bool {
    max_retries >= 0 && delivery_count > max_retries
}

#[async_trait]
impl<M: RawPayload> MessageHandler<M> for Receiver<M> {
    async fn process_raw_message(
        &self,
        raw: RawMessageWrapper<M>,
        tx: &TransactionHandle,
    ) -> Result<ProcessOutcome> {
        Receiver::process_raw_message(self, raw, tx).await
    }

    async fn process_request(&self, raw: RawMessageWrapper<M>) -> Result<Message> {
        self.process_request_raw(raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_allowed_attempt_does_not_wait() {
        // max_retries = 2 allows deliveries 1..=3; the third is the last one
        assert!(!retry_limit_reached(2, 1));
        assert!(!retry_limit_reached(2, 2));
        assert!(retry_limit_reached(2, 3));
        assert!(!retry_limit_reached(-1, 1000));
    }
}
