//! Optional forwarding of pipeline results.

use async_trait::async_trait;
use thiserror::Error;

use crate::adapter::PipeLineResult;
use crate::message::PipeLineSession;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SenderError {
    #[error("Sender {sender} failed to send result of {message_id}: {reason}")]
    SendFailed {
        sender: String,
        message_id: String,
        reason: String,
    },
    #[error("Sender {0} could not be opened: {1}")]
    OpenFailed(String, String),
}

/// Destination for successful pipeline results
#[async_trait]
pub trait ResultSender: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self) -> Result<(), SenderError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SenderError> {
        Ok(())
    }

    async fn send_result(
        &self,
        message_id: &str,
        result: &PipeLineResult,
        session: &PipeLineSession,
    ) -> Result<(), SenderError>;
}
