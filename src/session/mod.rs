//! Hot-reload session: processes, their agents, and the updates sent to them.
//!
//! Each launched process hosts an agent that connects back to a private
//! endpoint, declares its capabilities, and applies the updates it is sent.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              SessionCoordinator               │
//! ├──────────────────────────────────────────────┤
//! │  backlog  │  running processes  │  restarts   │
//! ├──────────────────────────────────────────────┤
//! │ UpdateClient ── endpoint ── agent (process)  │
//! └──────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod coordinator;
pub mod endpoint;
pub mod launcher;
pub mod log_buffer;
pub mod protocol;
pub mod reporter;
pub mod restart;
pub mod running;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ApplyStatus, HostedUpdateClient, PipeUpdateClient, UpdateClient};
pub use coordinator::{
    ChangeOutcome, DistributionReport, ProcessOutcome, RootDecision, SessionCoordinator,
};
pub use endpoint::AgentEndpoint;
pub use launcher::{LaunchSpec, ProcessHandle, ProcessLauncher};
pub use log_buffer::LogBuffer;
pub use reporter::ProcessReporter;
pub use restart::{RestartAnswer, RestartPrompt};
pub use running::{CancelScope, ProcessOptions, ProcessState, RunningProcess};
