//! Single-slot cache of the most recently loaded graph.
//!
//! An entry is valid while the store file's modification time matches the one
//! recorded when the entry was filled. Two writes inside one filesystem
//! timestamp tick look identical, so an external writer can produce a stale
//! hit; writes made through the manager clear the slot instead of relying on
//! the timestamp.

use std::sync::Arc;
use std::time::SystemTime;

use crate::graph::KnowledgeGraph;

struct CachedGraph {
    namespace: String,
    graph: Arc<KnowledgeGraph>,
    /// `None` when the graph was loaded from an absent file
    modified: Option<SystemTime>,
}

/// Holds at most one namespace's graph. Filling another namespace evicts it.
#[derive(Default)]
pub struct GraphCache {
    slot: Option<CachedGraph>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self { slot: None }
    }

    /// Cached graph for `namespace` if the file still has modification time
    /// `modified` (or is still absent).
    pub fn get(&self, namespace: &str, modified: Option<SystemTime>) -> Option<Arc<KnowledgeGraph>> {
        match &self.slot {
            Some(entry) if entry.namespace == namespace && entry.modified == modified => {
                Some(Arc::clone(&entry.graph))
            }
            _ => None,
        }
    }

    pub fn fill(&mut self, namespace: &str, graph: Arc<KnowledgeGraph>, modified: Option<SystemTime>) {
        self.slot = Some(CachedGraph {
            namespace: namespace.to_string(),
            graph,
            modified,
        });
    }

    pub fn invalidate(&mut self) {
        self.slot = None;
    }

    pub fn cached_namespace(&self) -> Option<&str> {
        self.slot.as_ref().map(|entry| entry.namespace.as_str())
    }
}
