//! Use cases: the engine's lifecycle, strategies, queue and scheduler.

pub mod broadcaster;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod state_machine;
pub mod strategies;

#[cfg(test)]
pub(crate) mod test_support;

pub use broadcaster::StatusBroadcaster;
pub use orchestrator::{ExecutionResult, Orchestrator, RunOutcome, RunRequest};
pub use queue::{JobHandler, JobQueue};
pub use scheduler::Scheduler;
pub use service::AppService;
pub use state_machine::FlowStateMachine;
