//! GraphRAG service: graph ingestion and retrieval engine with a batch
//! index orchestrator.
//!
//! The crate ingests documents into an entity-relationship knowledge graph
//! with chunk-level provenance, serves hybrid retrieval, mode-aware query,
//! answering, pathfinding, clustering and snapshots over HTTP, and runs
//! lock-guarded batch index runs producing importable artifact directories.

pub mod ai;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod state;
pub mod store;
