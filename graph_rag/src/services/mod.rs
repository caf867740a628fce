pub mod answer;
pub mod chunker;
pub mod cluster;
pub mod extraction;
pub mod ingest;
pub mod layout;
pub mod pathfind;
pub mod query_adapter;
pub mod retrieval;
pub mod snapshot;
pub mod vector_store;
