//! Ranked entity search.
//!
//! - `tokenize`: shared lowercase/stop-word tokenizer
//! - `bm25`: in-memory BM25 model
//! - `index`: incrementally maintained per-namespace index with snapshots

pub mod bm25;
pub mod index;
pub mod tokenize;

use serde::Serialize;

pub use bm25::Bm25Params;
pub use index::{fingerprint, IndexSettings, SearchIndex, RANKING_AVAILABLE};
pub use tokenize::tokenize;

/// An entity name with its relevance score. Higher is better.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredName {
    pub name: String,
    pub score: f64,
}
