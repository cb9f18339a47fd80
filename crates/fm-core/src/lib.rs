//! Core domain model and storage for the foreman broker and its workers.
//!
//! This crate owns the SQLite-backed store shared by the broker, the agent
//! workers, and the indexing worker, plus the durable task queue and the
//! indexing-job queue layered on top of it.

pub mod config;
pub mod index_queue;
pub mod mentions;
pub mod shutdown;
pub mod store;
pub mod task_queue;
pub mod types;
