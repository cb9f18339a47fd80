//! Out-of-process agent worker.
//!
//! One worker runs per agent id: it subscribes to its task topic over the
//! broker's WebSocket gateway, catches up pending work from the shared
//! store, and executes one task at a time through an [`behavior::AgentBehavior`].

pub mod behavior;
pub mod connection;
pub mod runner;
