//! Pipeline executor contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::message::{Message, PipeLineSession};
use crate::state_machine::{ExitState, RunState};

/// Result of running a message through a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeLineResult {
    pub result: Message,
    pub state: ExitState,
    pub exit_code: Option<i32>,
}

impl PipeLineResult {
    pub fn new(result: Message, state: ExitState) -> Self {
        Self {
            result,
            state,
            exit_code: None,
        }
    }

    pub fn success(result: impl Into<Message>) -> Self {
        Self::new(result.into(), ExitState::Success)
    }

    pub fn error(result: impl Into<Message>) -> Self {
        Self::new(result.into(), ExitState::Error)
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn is_successful(&self) -> bool {
        self.state.is_success()
    }
}

/// Executes the business pipeline for received messages
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    fn run_state(&self) -> RunState;

    /// Run `message` through the pipeline. An `Err` means the pipeline raised
    /// an exception; an unsuccessful [`PipeLineResult`] means it completed in error.
    async fn process_message_with_exceptions(
        &self,
        message_id: &str,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeLineResult, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_constructors() {
        let ok = PipeLineResult::success("<ok/>");
        assert!(ok.is_successful());
        assert_eq!(ok.exit_code, None);

        let failed = PipeLineResult::error("boom").with_exit_code(500);
        assert!(!failed.is_successful());
        assert_eq!(failed.exit_code, Some(500));
        assert_eq!(failed.result.as_str(), Some("boom"));
    }
}
