//! The Foreman orchestration kernel.
//!
//! Turns channel messages and scheduled tasks into streamed, tool-using,
//! possibly-delegated turns. The kernel owns the supervisor/worker
//! hierarchy, the per-turn tool loop, the structured message-event
//! pipeline, and the scheduler; it consumes a model client, a tool runner,
//! a conversation store, and channel sinks through the traits in
//! [`ports`].

pub mod agent;
pub mod dedup;
pub mod delegation;
pub mod events;
pub mod ports;
pub mod prompts;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod testing;
pub mod trace;

pub use agent::supervisor::SupervisorAgent;
pub use agent::worker::WorkerAgent;
pub use events::MessageEventService;
pub use registry::AgentRegistry;
pub use router::MessageRouter;
pub use scheduler::Scheduler;
