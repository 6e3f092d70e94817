//! Incrementally maintained entity search index.
//!
//! Each entity is one document (name, type and observations). Documents live
//! in a slot arena: removing an entity frees its slot for reuse and the single
//! name -> slot map stays the only lookup, so nothing needs renumbering.
//!
//! After every add/remove/update the BM25 model is rebuilt from all live
//! token arrays, unless the corpus has reached `deferred_rebuild_min_docs`;
//! then the index is only marked dirty and the next search rebuilds it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use super::bm25::{Bm25Model, Bm25Params};
use super::tokenize::tokenize;
use super::ScoredName;
use crate::config::Config;
use crate::error::{KgError, Result};
use crate::graph::Entity;

/// Whether ranked search is compiled in. Without it, search is a
/// case-insensitive substring match over document text.
pub const RANKING_AVAILABLE: bool = cfg!(feature = "bm25");

/// Weight applied to the token-overlap ratio when a small corpus gives a
/// document a zero BM25 score.
pub const SMALL_CORPUS_OVERLAP_WEIGHT: f64 = 0.1;

/// Names sampled from each end of the entity list by [`fingerprint`].
const FINGERPRINT_SAMPLE: usize = 10;

const SNAPSHOT_VERSION: u32 = 1;

/// Approximate identity of an entity list: its length plus a hash of a sorted
/// sample of names (the first and last 10 when there are more than 20,
/// otherwise all of them).
///
/// Cheap on large graphs, and blind to changes confined to unsampled
/// positions: renaming one entity in the middle of a big graph keeps the same
/// fingerprint.
pub fn fingerprint(entities: &[Entity]) -> String {
    let mut sample: Vec<&str> = if entities.len() > FINGERPRINT_SAMPLE * 2 {
        entities[..FINGERPRINT_SAMPLE]
            .iter()
            .chain(&entities[entities.len() - FINGERPRINT_SAMPLE..])
            .map(|e| e.name.as_str())
            .collect()
    } else {
        entities.iter().map(|e| e.name.as_str()).collect()
    };
    sample.sort_unstable();

    let mut hasher = Sha256::new();
    for name in &sample {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
    }
    format!("{}:{:x}", entities.len(), hasher.finalize())
}

/// Index tuning, usually derived from [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSettings {
    pub params: Bm25Params,
    pub small_corpus_max_docs: usize,
    pub persist_min_docs: usize,
    pub deferred_rebuild_min_docs: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for IndexSettings {
    fn from(config: &Config) -> Self {
        Self {
            params: Bm25Params {
                k1: config.search.k1,
                b: config.search.b,
            },
            small_corpus_max_docs: config.index.small_corpus_max_docs,
            persist_min_docs: config.index.persist_min_docs,
            deferred_rebuild_min_docs: config.index.deferred_rebuild_min_docs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    name: String,
    text: String,
    tokens: Vec<String>,
}

impl Document {
    fn from_entity(entity: &Entity) -> Self {
        let text = entity.document_text();
        let tokens = tokenize(&text);
        Self {
            name: entity.name.clone(),
            text,
            tokens,
        }
    }
}

/// On-disk form of a [`SearchIndex`].
#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    version: u32,
    ranking_available: bool,
    fingerprint: String,
    saved_at: DateTime<Utc>,
    slots: Vec<Option<Document>>,
    model: Option<Bm25Model>,
}

pub struct SearchIndex {
    settings: IndexSettings,
    slots: Vec<Option<Document>>,
    free: Vec<usize>,
    by_name: HashMap<String, usize>,
    model: Option<Bm25Model>,
    dirty: bool,
    fingerprint: String,
}

impl SearchIndex {
    pub fn new(settings: IndexSettings) -> Self {
        Self {
            settings,
            slots: Vec::new(),
            free: Vec::new(),
            by_name: HashMap::new(),
            model: None,
            dirty: false,
            fingerprint: fingerprint(&[]),
        }
    }

    /// Full build from an entity list. Always builds the model, whatever the size.
    pub fn build(entities: &[Entity], settings: IndexSettings) -> Self {
        let mut index = Self::new(settings);
        for entity in entities {
            index.insert_document(entity);
        }
        index.fingerprint = fingerprint(entities);
        index.rebuild_model();
        log::info!("Built search index over {} entities", index.len());
        index
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// True if the index was last synchronized with an entity list that has
    /// the same [`fingerprint`] as `entities`.
    pub fn is_valid_for(&self, entities: &[Entity]) -> bool {
        self.fingerprint == fingerprint(entities)
    }

    /// Index `new_entities`; names already indexed are replaced.
    /// `all_entities` is the graph's full entity list after the change.
    pub fn add(&mut self, new_entities: &[Entity], all_entities: &[Entity]) {
        for entity in new_entities {
            self.insert_document(entity);
        }
        self.refresh(all_entities);
    }

    /// Drop the documents of `names`. Unknown names are ignored.
    pub fn remove(&mut self, names: &[String], all_entities: &[Entity]) {
        for name in names {
            self.remove_document(name);
        }
        self.refresh(all_entities);
    }

    /// Replace the document indexed under `name` with `entity`, which may
    /// carry a different name.
    pub fn update(&mut self, name: &str, entity: &Entity, all_entities: &[Entity]) {
        if name != entity.name {
            self.remove_document(name);
        }
        self.insert_document(entity);
        self.refresh(all_entities);
    }

    /// Rank entity names for `query`, best first, at most `top_k`.
    ///
    /// Performs a deferred rebuild first if the index is dirty.
    pub fn search(&mut self, query: &str, top_k: usize) -> Vec<ScoredName> {
        if top_k == 0 || query.trim().is_empty() {
            return Vec::new();
        }
        if !RANKING_AVAILABLE {
            return self.substring_search(query, top_k);
        }
        if self.dirty || self.model.is_none() {
            log::debug!("Rebuilding dirty search index ({} documents)", self.len());
            self.rebuild_model();
        }

        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        self.rank(&query_tokens, top_k)
    }

    /// Write a snapshot to `path` if the index is large enough to be worth it.
    ///
    /// Returns `Ok(false)` when skipped by the size gate.
    pub fn save(&self, path: &Path) -> Result<bool> {
        if self.len() < self.settings.persist_min_docs {
            return Ok(false);
        }

        let snapshot = IndexSnapshot {
            version: SNAPSHOT_VERSION,
            ranking_available: RANKING_AVAILABLE,
            fingerprint: self.fingerprint.clone(),
            saved_at: Utc::now(),
            slots: self.slots.clone(),
            model: if self.dirty { None } else { self.model.clone() },
        };

        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| KgError::IndexPersistence(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| KgError::IndexPersistence(e.to_string()))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, bytes)
            .and_then(|_| fs::rename(&tmp_path, path))
            .map_err(|e| {
                KgError::IndexPersistence(format!("failed to write {}: {}", path.display(), e))
            })?;

        log::debug!("Saved search index snapshot ({} documents)", self.len());
        Ok(true)
    }

    /// Load a snapshot from `path` and check it against `entities`.
    ///
    /// `Ok(None)` if there is no snapshot or it was written by a build with a
    /// different ranking capability. `Err(KgError::StaleIndex)` if it was
    /// built for a different entity list.
    pub fn load(path: &Path, entities: &[Entity], settings: IndexSettings) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: IndexSnapshot = serde_json::from_slice(&bytes)?;

        if snapshot.ranking_available != RANKING_AVAILABLE {
            log::warn!(
                "Ignoring index snapshot {}: saved with ranking_available={}, running with {}",
                path.display(),
                snapshot.ranking_available,
                RANKING_AVAILABLE
            );
            return Ok(None);
        }
        if snapshot.version != SNAPSHOT_VERSION {
            log::warn!(
                "Ignoring index snapshot {}: format version {}",
                path.display(),
                snapshot.version
            );
            return Ok(None);
        }

        let expected = fingerprint(entities);
        if snapshot.fingerprint != expected {
            return Err(KgError::StaleIndex {
                expected,
                found: snapshot.fingerprint,
            });
        }

        let mut by_name = HashMap::new();
        let mut free = Vec::new();
        for (slot, doc) in snapshot.slots.iter().enumerate() {
            match doc {
                Some(doc) => {
                    by_name.insert(doc.name.clone(), slot);
                }
                None => free.push(slot),
            }
        }

        // A model built with other parameters is rebuilt on first search
        let model = snapshot
            .model
            .filter(|model| model.params() == settings.params);
        let dirty = RANKING_AVAILABLE && model.is_none();

        log::debug!(
            "Loaded search index snapshot {} ({} documents, saved {})",
            path.display(),
            by_name.len(),
            snapshot.saved_at
        );

        Ok(Some(Self {
            settings,
            slots: snapshot.slots,
            free,
            by_name,
            model,
            dirty,
            fingerprint: snapshot.fingerprint,
        }))
    }

    fn insert_document(&mut self, entity: &Entity) {
        let doc = Document::from_entity(entity);
        if let Some(&slot) = self.by_name.get(&entity.name) {
            self.slots[slot] = Some(doc);
            return;
        }
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(doc);
                slot
            }
            None => {
                self.slots.push(Some(doc));
                self.slots.len() - 1
            }
        };
        self.by_name.insert(entity.name.clone(), slot);
    }

    fn remove_document(&mut self, name: &str) -> bool {
        match self.by_name.remove(name) {
            Some(slot) => {
                self.slots[slot] = None;
                self.free.push(slot);
                true
            }
            None => false,
        }
    }

    fn refresh(&mut self, all_entities: &[Entity]) {
        self.fingerprint = fingerprint(all_entities);
        if self.len() >= self.settings.deferred_rebuild_min_docs {
            self.model = None;
            self.dirty = true;
        } else {
            self.rebuild_model();
        }
    }

    fn rebuild_model(&mut self) {
        self.model = if RANKING_AVAILABLE {
            let docs = self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(slot, doc)| doc.as_ref().map(|d| (slot, d.tokens.as_slice())));
            Some(Bm25Model::build(self.settings.params, docs))
        } else {
            None
        };
        self.dirty = false;
    }

    fn live_documents(&self) -> impl Iterator<Item = (usize, &Document)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, doc)| doc.as_ref().map(|d| (slot, d)))
    }

    fn rank(&self, query_tokens: &[String], top_k: usize) -> Vec<ScoredName> {
        let Some(model) = &self.model else {
            return Vec::new();
        };
        let mut scores = model.score(query_tokens);
        let query_set: HashSet<&str> = query_tokens.iter().map(String::as_str).collect();

        if self.len() < self.settings.small_corpus_max_docs {
            for (slot, doc) in self.live_documents() {
                let primary = scores.get(&slot).copied().unwrap_or(0.0);
                if primary <= 0.0 {
                    let overlap = token_overlap(&query_set, &doc.tokens);
                    if overlap > 0.0 {
                        scores.insert(slot, overlap * SMALL_CORPUS_OVERLAP_WEIGHT);
                    }
                }
            }
        }

        let mut hits: Vec<(f64, f64, &str)> = scores
            .into_iter()
            .filter(|&(_, score)| score > 0.0)
            .filter_map(|(slot, score)| {
                let doc = self.slots.get(slot)?.as_ref()?;
                Some((score, query_density(&query_set, &doc.tokens), doc.name.as_str()))
            })
            .collect();

        // Score, then share of the document made of query terms, then name
        hits.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| b.1.total_cmp(&a.1))
                .then_with(|| a.2.cmp(b.2))
        });
        hits.truncate(top_k);

        hits.into_iter()
            .map(|(score, _, name)| ScoredName {
                name: name.to_string(),
                score,
            })
            .collect()
    }

    fn substring_search(&self, query: &str, top_k: usize) -> Vec<ScoredName> {
        let needle = query.trim().to_lowercase();
        self.live_documents()
            .filter(|(_, doc)| doc.text.to_lowercase().contains(&needle))
            .take(top_k)
            .map(|(_, doc)| ScoredName {
                name: doc.name.clone(),
                score: 1.0,
            })
            .collect()
    }
}

/// Fraction of distinct query tokens that occur in the document.
fn token_overlap(query: &HashSet<&str>, doc_tokens: &[String]) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    let doc: HashSet<&str> = doc_tokens.iter().map(String::as_str).collect();
    query.iter().filter(|t| doc.contains(*t)).count() as f64 / query.len() as f64
}

/// Fraction of the document's tokens that are query tokens.
fn query_density(query: &HashSet<&str>, doc_tokens: &[String]) -> f64 {
    if doc_tokens.is_empty() {
        return 0.0;
    }
    doc_tokens.iter().filter(|t| query.contains(t.as_str())).count() as f64
        / doc_tokens.len() as f64
}
