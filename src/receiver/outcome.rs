use std::time::Duration;

use crate::adapter::PipeLineResult;
use crate::state_machine::ExitState;

/// What became of a message handed to the receiver
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The pipeline ran and completed successfully
    Accepted(PipeLineResult),
    /// Already present in the message log; the pipeline was skipped
    Duplicate,
    /// Refused before processing because the retry limit was exceeded
    Rejected { reason: String },
    /// The pipeline ran and failed; `delay` is the backoff waited before returning
    Retry {
        result: PipeLineResult,
        delay: Duration,
    },
}

impl ProcessOutcome {
    pub fn exit_state(&self) -> ExitState {
        match self {
            Self::Accepted(_) | Self::Duplicate => ExitState::Success,
            Self::Rejected { .. } => ExitState::Rejected,
            Self::Retry { .. } => ExitState::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        !self.exit_state().is_success()
    }

    pub fn result(&self) -> Option<&PipeLineResult> {
        match self {
            Self::Accepted(result) | Self::Retry { result, .. } => Some(result),
            Self::Duplicate | Self::Rejected { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_states() {
        assert_eq!(ProcessOutcome::Duplicate.exit_state(), ExitState::Success);
        assert!(!ProcessOutcome::Duplicate.is_error());

        let rejected = ProcessOutcome::Rejected {
            reason: "too many".to_string(),
        };
        assert_eq!(rejected.exit_state(), ExitState::Rejected);
        assert!(rejected.result().is_none());

        let retry = ProcessOutcome::Retry {
            result: PipeLineResult::error("boom"),
            delay: Duration::from_secs(2),
        };
        assert!(retry.is_error());
        assert_eq!(retry.result().map(|r| r.state), Some(ExitState::Error));
    }
}
