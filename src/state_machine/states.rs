use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Initial state, and the state after a clean stop
    #[default]
    Stopped,
    /// Opening listener, stores and the poll loop
    Starting,
    /// Receiving messages
    Started,
    /// Closing down
    Stopping,
    /// Start-up failed
    ExceptionStarting,
    /// Shutdown failed
    ExceptionStopping,
    /// Unrecoverable error; the receiver stops itself
    Error,
}

impl RunState {
    /// Whether the receiver is starting or started
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Started)
    }

    /// Whether the receiver is stopping or stopped
    pub fn is_stopped_or_stopping(&self) -> bool {
        matches!(self, Self::Stopped | Self::Stopping)
    }

    /// Check if this is one of the exception side states
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::ExceptionStarting | Self::ExceptionStopping | Self::Error
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Started => write!(f, "started"),
            Self::Stopping => write!(f, "stopping"),
            Self::ExceptionStarting => write!(f, "exception_starting"),
            Self::ExceptionStopping => write!(f, "exception_stopping"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "starting" => Ok(Self::Starting),
            "started" => Ok(Self::Started),
            "stopping" => Ok(Self::Stopping),
            "exception_starting" => Ok(Self::ExceptionStarting),
            "exception_stopping" => Ok(Self::ExceptionStopping),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid run state: {s}")),
        }
    }
}

/// Processing state of a message held by a listener that tracks states itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Eligible for retrieval
    Available,
    /// Retrieved and being processed
    InProcess,
    /// Processed successfully
    Done,
    /// Processing failed
    Error,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::InProcess => write!(f, "in_process"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Outcome of processing a single message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitState {
    #[default]
    Success,
    Error,
    /// Refused before the pipeline ran
    Rejected,
}

impl ExitState {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}
