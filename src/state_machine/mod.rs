// State machine module for receivers and the messages they process
//
// RunState drives the receiver lifecycle and the poll loop; ProcessState and
// ExitState describe individual messages.

pub mod run_state;
pub mod states;

pub use run_state::RunStateManager;
pub use states::{ExitState, ProcessState, RunState};
