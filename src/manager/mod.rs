//! The caller-facing knowledge graph API.
//!
//! [`KnowledgeGraphManager`] sequences the store, the graph cache and one
//! search index per namespace. Every mutation loads (or reuses) the graph,
//! applies the change, writes the store, clears the cache and then brings the
//! namespace's index up to date before persisting it.

mod registry;

pub use registry::ManagerRegistry;

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::cache::GraphCache;
use crate::config::Config;
use crate::error::{KgError, Result};
use crate::graph::{
    Entity, KnowledgeGraph, ObservationDeletion, ObservationInput, ObservationResult, Relation,
    AUTO_CREATED_TYPE, AUTO_GENERATED_TYPE,
};
use crate::search::{IndexSettings, SearchIndex, RANKING_AVAILABLE};
use crate::store::{validate_namespace, GraphStore};

/// Summary of one namespace, as reported by [`KnowledgeGraphManager::graph_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphStats {
    pub namespace: String,
    pub store_exists: bool,
    pub entity_count: usize,
    pub relation_count: usize,
    /// Relation endpoints with no entity record
    pub implicit_entities: Vec<String>,
    pub entity_types: BTreeMap<String, usize>,
    /// Documents in the in-memory index, if one is loaded
    pub indexed_documents: Option<usize>,
}

pub struct KnowledgeGraphManager {
    store: GraphStore,
    cache: GraphCache,
    indexes: HashMap<String, SearchIndex>,
    settings: IndexSettings,
    default_namespace: String,
    default_top_k: usize,
    streaming_batch_limit: usize,
}

impl KnowledgeGraphManager {
    pub fn new(config: &Config) -> Self {
        Self {
            store: GraphStore::new(config.base_dir()),
            cache: GraphCache::new(),
            indexes: HashMap::new(),
            settings: IndexSettings::from(config),
            default_namespace: config.store.default_namespace.clone(),
            default_top_k: config.search.default_top_k,
            streaming_batch_limit: config.manager.streaming_batch_limit,
        }
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Create entities whose names are not taken yet. Returns the created ones.
    ///
    /// Small batches check existence by streaming the store and append the new
    /// records; larger ones load the graph and rewrite it.
    pub fn create_entities(
        &mut self,
        entities: Vec<Entity>,
        namespace: Option<&str>,
    ) -> Result<Vec<Entity>> {
        let namespace = self.resolve_namespace(namespace)?;

        let mut batch_names = HashSet::new();
        let mut batch = Vec::with_capacity(entities.len());
        for entity in entities {
            if entity.name.trim().is_empty() {
                return Err(KgError::InvalidInput("entity name cannot be empty".to_string()));
            }
            if batch_names.insert(entity.name.clone()) {
                batch.push(entity);
            }
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        if batch.len() <= self.streaming_batch_limit {
            self.create_entities_streaming(&namespace, batch, batch_names)
        } else {
            self.create_entities_full(&namespace, batch)
        }
    }

    fn create_entities_streaming(
        &mut self,
        namespace: &str,
        batch: Vec<Entity>,
        mut pending: HashSet<String>,
    ) -> Result<Vec<Entity>> {
        let mut existing = HashSet::new();
        for entity in self.store.stream_entities(namespace)? {
            let entity = entity?;
            if pending.remove(&entity.name) {
                existing.insert(entity.name);
                if pending.is_empty() {
                    break;
                }
            }
        }

        let created: Vec<Entity> = batch
            .into_iter()
            .filter(|e| !existing.contains(&e.name))
            .collect();
        if created.is_empty() {
            return Ok(created);
        }

        let appended = self.store.append_entities(namespace, &created);
        self.cache.invalidate();
        appended?;

        // The index rebuild needs the whole corpus
        let graph = self.load_graph(namespace)?;
        let split = graph.entities.len().saturating_sub(created.len());
        self.update_index(namespace, &graph.entities[..split], &graph.entities, |index, all| {
            index.add(&created, all)
        });

        log::debug!("Created {} entities in '{}' (append)", created.len(), namespace);
        Ok(created)
    }

    fn create_entities_full(&mut self, namespace: &str, batch: Vec<Entity>) -> Result<Vec<Entity>> {
        let current = self.load_graph(namespace)?;
        let by_name: HashMap<&str, &Entity> = current
            .entities
            .iter()
            .map(|e| (e.name.as_str(), e))
            .collect();

        let created: Vec<Entity> = batch
            .into_iter()
            .filter(|e| !by_name.contains_key(e.name.as_str()))
            .collect();
        if created.is_empty() {
            return Ok(created);
        }

        let mut graph = KnowledgeGraph::clone(&current);
        graph.entities.extend(created.iter().cloned());
        self.save_graph(namespace, &graph)?;
        self.update_index(namespace, &current.entities, &graph.entities, |index, all| {
            index.add(&created, all)
        });

        log::debug!("Created {} entities in '{}' (rewrite)", created.len(), namespace);
        Ok(created)
    }

    /// Create relations not already present, auto-creating unknown endpoints.
    /// Returns the relations that are new.
    pub fn create_relations(
        &mut self,
        relations: Vec<Relation>,
        namespace: Option<&str>,
    ) -> Result<Vec<Relation>> {
        let namespace = self.resolve_namespace(namespace)?;
        let blank = relations.iter().any(|r| {
            r.from_entity.trim().is_empty()
                || r.to_entity.trim().is_empty()
                || r.relation_type.trim().is_empty()
        });
        if blank {
            return Err(KgError::InvalidInput(
                "relation fields cannot be empty".to_string(),
            ));
        }
        let current = self.load_graph(&namespace)?;
        let mut graph = KnowledgeGraph::clone(&current);

        let mut known: HashSet<String> = graph.entities.iter().map(|e| e.name.clone()).collect();
        let mut auto_created = Vec::new();
        let stamp = Utc::now().format("%Y-%m-%d");
        for relation in &relations {
            for endpoint in [&relation.from_entity, &relation.to_entity] {
                if known.insert(endpoint.clone()) {
                    auto_created.push(Entity::new(
                        endpoint.as_str(),
                        AUTO_CREATED_TYPE,
                        vec![format!("Auto-created from a relation on {}", stamp)],
                    ));
                }
            }
        }

        let mut triples: HashSet<Relation> = graph.relations.iter().cloned().collect();
        let mut created = Vec::new();
        for relation in relations {
            if triples.insert(relation.clone()) {
                created.push(relation);
            }
        }

        if created.is_empty() && auto_created.is_empty() {
            return Ok(created);
        }

        graph.entities.extend(auto_created.iter().cloned());
        graph.relations.extend(created.iter().cloned());
        self.save_graph(&namespace, &graph)?;

        if !auto_created.is_empty() {
            log::info!(
                "Auto-created {} relation endpoints in '{}'",
                auto_created.len(),
                namespace
            );
            self.update_index(&namespace, &current.entities, &graph.entities, |index, all| {
                index.add(&auto_created, all)
            });
        }

        Ok(created)
    }

    /// Append observations, creating missing entities as `auto_generated`.
    pub fn add_observations(
        &mut self,
        updates: Vec<ObservationInput>,
        namespace: Option<&str>,
    ) -> Result<Vec<ObservationResult>> {
        let namespace = self.resolve_namespace(namespace)?;
        let current = self.load_graph(&namespace)?;
        let mut graph = KnowledgeGraph::clone(&current);

        let mut positions: Option<HashMap<String, usize>> = None;
        let mut touched = Vec::new();
        let mut results = Vec::with_capacity(updates.len());

        for update in updates {
            let positions = positions.get_or_insert_with(|| {
                graph
                    .entities
                    .iter()
                    .enumerate()
                    .map(|(i, e)| (e.name.clone(), i))
                    .collect()
            });

            let result = match positions.get(&update.entity_name) {
                Some(&pos) => {
                    let added = graph.entities[pos].add_observations(&update.contents);
                    if !added.is_empty() {
                        touched.push(pos);
                    }
                    ObservationResult {
                        entity_name: update.entity_name,
                        added_observations: added,
                        created: false,
                    }
                }
                None => {
                    let mut entity =
                        Entity::new(update.entity_name.as_str(), AUTO_GENERATED_TYPE, Vec::new());
                    let added = entity.add_observations(&update.contents);
                    positions.insert(update.entity_name.clone(), graph.entities.len());
                    touched.push(graph.entities.len());
                    graph.entities.push(entity);
                    ObservationResult {
                        entity_name: update.entity_name,
                        added_observations: added,
                        created: true,
                    }
                }
            };
            results.push(result);
        }

        if touched.is_empty() {
            return Ok(results);
        }

        touched.sort_unstable();
        touched.dedup();
        self.save_graph(&namespace, &graph)?;

        let changed: Vec<Entity> = touched.iter().map(|&i| graph.entities[i].clone()).collect();
        self.update_index(&namespace, &current.entities, &graph.entities, |index, all| {
            index.add(&changed, all)
        });

        Ok(results)
    }

    /// Delete entities and every relation touching them.
    pub fn delete_entities(&mut self, names: &[String], namespace: Option<&str>) -> Result<()> {
        let namespace = self.resolve_namespace(namespace)?;
        let current = self.load_graph(&namespace)?;
        let doomed: HashSet<&str> = names.iter().map(String::as_str).collect();

        let mut graph = KnowledgeGraph::clone(&current);
        graph.entities.retain(|e| !doomed.contains(e.name.as_str()));
        graph.relations.retain(|r| {
            !doomed.contains(r.from_entity.as_str()) && !doomed.contains(r.to_entity.as_str())
        });
        if graph == *current {
            return Ok(());
        }

        self.save_graph(&namespace, &graph)?;
        self.update_index(&namespace, &current.entities, &graph.entities, |index, all| {
            index.remove(names, all)
        });

        log::debug!(
            "Deleted {} entities and {} relations from '{}'",
            current.entities.len() - graph.entities.len(),
            current.relations.len() - graph.relations.len(),
            namespace
        );
        Ok(())
    }

    /// Remove specific observations. Writes only if something was removed.
    pub fn delete_observations(
        &mut self,
        deletions: &[ObservationDeletion],
        namespace: Option<&str>,
    ) -> Result<()> {
        let namespace = self.resolve_namespace(namespace)?;
        let current = self.load_graph(&namespace)?;
        let mut graph = KnowledgeGraph::clone(&current);

        let mut changed = Vec::new();
        for deletion in deletions {
            if let Some(entity) = graph
                .entities
                .iter_mut()
                .find(|e| e.name == deletion.entity_name)
            {
                if entity.remove_observations(&deletion.observations) {
                    changed.push(entity.name.clone());
                }
            }
        }
        if changed.is_empty() {
            return Ok(());
        }

        self.save_graph(&namespace, &graph)?;
        let changed: HashSet<String> = changed.into_iter().collect();
        let entities: Vec<Entity> = graph
            .entities
            .iter()
            .filter(|e| changed.contains(&e.name))
            .cloned()
            .collect();
        self.update_index(&namespace, &current.entities, &graph.entities, |index, all| {
            index.add(&entities, all)
        });
        Ok(())
    }

    /// Remove relations by exact triple. Writes only if something was removed.
    pub fn delete_relations(&mut self, relations: &[Relation], namespace: Option<&str>) -> Result<()> {
        let namespace = self.resolve_namespace(namespace)?;
        let current = self.load_graph(&namespace)?;
        let doomed: HashSet<&Relation> = relations.iter().collect();

        let before = current.relations.len();
        let mut graph = KnowledgeGraph::clone(&current);
        graph.relations.retain(|r| !doomed.contains(r));
        if graph.relations.len() == before {
            return Ok(());
        }

        // Relations are not indexed, so only the store changes
        self.save_graph(&namespace, &graph)
    }

    /// Entities ranked against `query`, best first, with the relations
    /// between them.
    pub fn search_nodes(
        &mut self,
        query: &str,
        namespace: Option<&str>,
        top_k: Option<usize>,
    ) -> Result<KnowledgeGraph> {
        let namespace = self.resolve_namespace(namespace)?;
        let top_k = top_k.unwrap_or(self.default_top_k);
        if !RANKING_AVAILABLE {
            log::debug!("{}; using substring matching", KgError::IndexUnavailable);
        }

        let graph = self.load_graph(&namespace)?;
        let index = self.ensure_index(&namespace, &graph.entities);
        let was_dirty = index.is_dirty();
        let hits = index.search(query, top_k);
        let rebuilt = was_dirty && !index.is_dirty();
        if let Some(index) = self.indexes.get(&namespace).filter(|_| rebuilt) {
            persist_index(&self.store, &namespace, index);
        }
        log::debug!("Search '{}' in '{}': {} hits", query, namespace, hits.len());

        let names: Vec<String> = hits.into_iter().map(|hit| hit.name).collect();
        let graph = self.load_graph(&namespace)?;
        Ok(graph.project(&names))
    }

    /// The named entities (unknown names ignored) and the relations between them.
    pub fn open_nodes(&mut self, names: &[String], namespace: Option<&str>) -> Result<KnowledgeGraph> {
        let namespace = self.resolve_namespace(namespace)?;
        Ok(self.load_graph(&namespace)?.project(names))
    }

    pub fn read_graph(&mut self, namespace: Option<&str>) -> Result<KnowledgeGraph> {
        let namespace = self.resolve_namespace(namespace)?;
        Ok(KnowledgeGraph::clone(&*self.load_graph(&namespace)?))
    }

    /// Empty a namespace and drop its index.
    pub fn clear_graph(&mut self, namespace: Option<&str>) -> Result<()> {
        let namespace = self.resolve_namespace(namespace)?;
        self.save_graph(&namespace, &KnowledgeGraph::new())?;
        self.indexes.remove(&namespace);
        self.store.remove_index_file(&namespace)?;
        log::info!("Cleared namespace '{}'", namespace);
        Ok(())
    }

    /// Rebuild the namespace's index from scratch. Returns the document count.
    pub fn rebuild_search_index(&mut self, namespace: Option<&str>) -> Result<usize> {
        let namespace = self.resolve_namespace(namespace)?;
        let graph = self.load_graph(&namespace)?;
        let index = SearchIndex::build(&graph.entities, self.settings.clone());
        persist_index(&self.store, &namespace, &index);
        let documents = index.len();
        self.indexes.insert(namespace, index);
        Ok(documents)
    }

    pub fn list_namespaces(&self) -> Result<Vec<String>> {
        self.store.list_namespaces()
    }

    pub fn graph_stats(&mut self, namespace: Option<&str>) -> Result<GraphStats> {
        let namespace = self.resolve_namespace(namespace)?;
        let graph = self.load_graph(&namespace)?;
        Ok(GraphStats {
            store_exists: self.store.exists(&namespace)?,
            entity_count: graph.entities.len(),
            relation_count: graph.relations.len(),
            implicit_entities: graph.implicit_entities(),
            entity_types: graph.entity_type_counts(),
            indexed_documents: self.indexes.get(&namespace).map(SearchIndex::len),
            namespace,
        })
    }

    fn resolve_namespace(&self, namespace: Option<&str>) -> Result<String> {
        let namespace = namespace.unwrap_or(&self.default_namespace);
        validate_namespace(namespace)?;
        Ok(namespace.to_string())
    }

    /// The namespace's graph, from the cache while the file is unchanged.
    fn load_graph(&mut self, namespace: &str) -> Result<Arc<KnowledgeGraph>> {
        let modified = self.store.modified(namespace)?;
        if let Some(graph) = self.cache.get(namespace, modified) {
            log::debug!("Graph cache hit for '{}'", namespace);
            return Ok(graph);
        }

        log::debug!("Graph cache miss for '{}', loading from disk", namespace);
        let graph = Arc::new(self.store.load(namespace)?);
        self.cache.fill(namespace, Arc::clone(&graph), modified);
        Ok(graph)
    }

    fn save_graph(&mut self, namespace: &str, graph: &KnowledgeGraph) -> Result<()> {
        let saved = self.store.save(namespace, graph);
        self.cache.invalidate();
        saved
    }

    /// An index valid for `entities`: the in-memory one, else the on-disk
    /// snapshot, else a fresh build.
    fn ensure_index(&mut self, namespace: &str, entities: &[Entity]) -> &mut SearchIndex {
        let reusable = self
            .indexes
            .get(namespace)
            .is_some_and(|index| index.is_valid_for(entities));

        if reusable {
            log::debug!("Reusing in-memory index for '{}'", namespace);
        } else {
            self.indexes.remove(namespace);
            if !self.load_index_snapshot(namespace, entities) {
                let index = SearchIndex::build(entities, self.settings.clone());
                persist_index(&self.store, namespace, &index);
                self.indexes.insert(namespace.to_string(), index);
            }
        }

        let settings = &self.settings;
        self.indexes
            .entry(namespace.to_string())
            .or_insert_with(|| SearchIndex::build(entities, settings.clone()))
    }

    /// Try the on-disk snapshot. Any failure is logged and reported as `false`.
    fn load_index_snapshot(&mut self, namespace: &str, entities: &[Entity]) -> bool {
        let loaded = self
            .store
            .index_path(namespace)
            .and_then(|path| SearchIndex::load(&path, entities, self.settings.clone()));

        match loaded {
            Ok(Some(index)) => {
                log::debug!("Loaded index snapshot for '{}'", namespace);
                self.indexes.insert(namespace.to_string(), index);
                true
            }
            Ok(None) => false,
            Err(err @ KgError::StaleIndex { .. }) => {
                log::warn!("Discarding index snapshot for '{}': {}", namespace, err);
                false
            }
            Err(err) => {
                log::warn!("Unreadable index snapshot for '{}': {}", namespace, err);
                false
            }
        }
    }

    /// Apply an incremental change to the namespace's index and persist it.
    ///
    /// `before` is the entity list the index should currently match. If no
    /// matching index is in memory or on disk, the index is dropped instead
    /// and the next search builds it from the graph.
    fn update_index<F>(&mut self, namespace: &str, before: &[Entity], after: &[Entity], apply: F)
    where
        F: FnOnce(&mut SearchIndex, &[Entity]),
    {
        let available = match self.indexes.get(namespace) {
            Some(index) => index.is_valid_for(before),
            None => self.load_index_snapshot(namespace, before),
        };

        if available {
            if let Some(index) = self.indexes.get_mut(namespace) {
                apply(index, after);
                persist_index(&self.store, namespace, index);
                return;
            }
        }

        log::debug!("No current index for '{}', deferring to next search", namespace);
        self.indexes.remove(namespace);
        if let Err(err) = self.store.remove_index_file(namespace) {
            log::warn!("Failed to remove index snapshot for '{}': {}", namespace, err);
        }
    }
}

/// Best-effort snapshot write. Below the persistence threshold any older
/// snapshot is removed so it cannot be mistaken for the current index.
fn persist_index(store: &GraphStore, namespace: &str, index: &SearchIndex) {
    let saved = store.index_path(namespace).and_then(|path| index.save(&path));
    let outcome = match saved {
        Ok(true) => Ok(()),
        Ok(false) => store.remove_index_file(namespace),
        Err(err) => Err(err),
    };
    if let Err(err) = outcome {
        log::warn!("Failed to persist search index for '{}': {}", namespace, err);
    }
}
