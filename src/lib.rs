//! Embedded, file-backed knowledge graph memory with incremental BM25 search.

pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
pub mod manager;
pub mod search;
pub mod store;

pub use config::Config;
pub use error::{KgError, Result};
pub use graph::{
    Entity, KnowledgeGraph, ObservationDeletion, ObservationInput, ObservationResult, Relation,
};
pub use manager::{GraphStats, KnowledgeGraphManager, ManagerRegistry};
pub use search::{ScoredName, SearchIndex};
