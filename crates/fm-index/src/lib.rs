//! Indexing job engine: drains the job queue with bounded parallelism and
//! keeps the semantic-search corpus (tickets, documents, code chunks) in
//! sync with the relational store.

pub mod chunker;
pub mod embedder;
pub mod worker;
