//! Knowledge graph data model: entities, relations and the graph container.
//!
//! These are plain records. Field names serialize in camelCase so the same
//! types round-trip through the store file and through agent-facing JSON.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Entity type given to entities created because a relation referenced them.
pub const AUTO_CREATED_TYPE: &str = "auto_created";

/// Entity type given to entities created by an observation add.
pub const AUTO_GENERATED_TYPE: &str = "auto_generated";

/// A named node with a type tag and ordered free-text observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub observations: Vec<String>,
}

impl Entity {
    pub fn new(
        name: impl Into<String>,
        entity_type: impl Into<String>,
        observations: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            observations,
        }
    }

    /// Text indexed for search: name, type and every observation.
    pub fn document_text(&self) -> String {
        let mut parts = Vec::with_capacity(self.observations.len() + 2);
        parts.push(self.name.as_str());
        parts.push(self.entity_type.as_str());
        parts.extend(self.observations.iter().map(String::as_str));
        parts.join(" ")
    }

    /// Append observations not already present. Returns the ones added, in order.
    pub fn add_observations(&mut self, contents: &[String]) -> Vec<String> {
        let mut added = Vec::new();
        for content in contents {
            if !self.observations.contains(content) {
                self.observations.push(content.clone());
                added.push(content.clone());
            }
        }
        added
    }

    /// Drop every observation listed. Returns true if anything was removed.
    pub fn remove_observations(&mut self, observations: &[String]) -> bool {
        let before = self.observations.len();
        self.observations.retain(|o| !observations.contains(o));
        self.observations.len() != before
    }
}

/// A directed, typed edge. Identity is the whole triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    #[serde(rename = "from")]
    pub from_entity: String,
    #[serde(rename = "to")]
    pub to_entity: String,
    #[serde(rename = "relationType")]
    pub relation_type: String,
}

impl Relation {
    pub fn new(
        from_entity: impl Into<String>,
        to_entity: impl Into<String>,
        relation_type: impl Into<String>,
    ) -> Self {
        Self {
            from_entity: from_entity.into(),
            to_entity: to_entity.into(),
            relation_type: relation_type.into(),
        }
    }
}

/// Knowledge graph containing entities and relations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Names referenced by a relation endpoint that have no entity record.
    /// Sorted and deduplicated.
    pub fn implicit_entities(&self) -> Vec<String> {
        let known: HashSet<&str> = self.entities.iter().map(|e| e.name.as_str()).collect();
        let mut implicit: Vec<String> = self
            .relations
            .iter()
            .flat_map(|r| [r.from_entity.as_str(), r.to_entity.as_str()])
            .filter(|name| !known.contains(name))
            .map(str::to_string)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        implicit.sort();
        implicit
    }

    /// Number of entities per type tag.
    pub fn entity_type_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entity in &self.entities {
            *counts.entry(entity.entity_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Sub-graph of the named entities, in the order `names` lists them, with
    /// the relations whose endpoints are both in the selection.
    pub fn project(&self, names: &[String]) -> KnowledgeGraph {
        let mut seen = HashSet::new();
        let entities: Vec<Entity> = names
            .iter()
            .filter(|name| seen.insert(name.as_str()))
            .filter_map(|name| self.entity(name).cloned())
            .collect();

        let selected: HashSet<&str> = entities.iter().map(|e| e.name.as_str()).collect();
        let relations = self
            .relations
            .iter()
            .filter(|r| {
                selected.contains(r.from_entity.as_str()) && selected.contains(r.to_entity.as_str())
            })
            .cloned()
            .collect();

        KnowledgeGraph {
            entities,
            relations,
        }
    }
}

/// Observations to add to one entity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationInput {
    pub entity_name: String,
    pub contents: Vec<String>,
}

/// Outcome of an observation add for one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationResult {
    pub entity_name: String,
    pub added_observations: Vec<String>,
    /// True when the entity did not exist and was created by this call.
    pub created: bool,
}

/// Observations to remove from one entity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationDeletion {
    pub entity_name: String,
    pub observations: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> KnowledgeGraph {
        KnowledgeGraph {
            entities: vec![
                Entity::new("A", "person", vec!["leads project X".to_string()]),
                Entity::new("B", "project", vec!["funded".to_string()]),
                Entity::new("C", "org", vec![]),
            ],
            relations: vec![
                Relation::new("A", "B", "leads"),
                Relation::new("C", "B", "sponsors"),
                Relation::new("A", "Ghost", "knows"),
            ],
        }
    }

    #[test]
    fn test_entity_json_field_names() {
        let entity = Entity::new("A", "person", vec!["x".to_string()]);
        let json = serde_json::to_value(&entity).unwrap();
        assert_eq!(json["entityType"], "person");
        assert_eq!(json["observations"][0], "x");

        let relation = Relation::new("A", "B", "leads");
        let json = serde_json::to_value(&relation).unwrap();
        assert_eq!(json["from"], "A");
        assert_eq!(json["to"], "B");
        assert_eq!(json["relationType"], "leads");
    }

    #[test]
    fn test_document_text_joins_all_fields() {
        let entity = Entity::new(
            "A",
            "person",
            vec!["leads project X".to_string(), "likes tea".to_string()],
        );
        assert_eq!(entity.document_text(), "A person leads project X likes tea");
    }

    #[test]
    fn test_add_observations_is_idempotent() {
        let mut entity = Entity::new("A", "person", vec!["one".to_string()]);
        let added = entity.add_observations(&["one".to_string(), "two".to_string()]);
        assert_eq!(added, vec!["two".to_string()]);
        assert_eq!(entity.observations, vec!["one", "two"]);

        let added = entity.add_observations(&["two".to_string(), "one".to_string()]);
        assert!(added.is_empty());
        assert_eq!(entity.observations, vec!["one", "two"], "order must be unchanged");
    }

    #[test]
    fn test_remove_observations_reports_change() {
        let mut entity = Entity::new("A", "person", vec!["one".to_string(), "two".to_string()]);
        assert!(!entity.remove_observations(&["three".to_string()]));
        assert!(entity.remove_observations(&["one".to_string()]));
        assert_eq!(entity.observations, vec!["two"]);
    }

    #[test]
    fn test_implicit_entities() {
        let graph = sample_graph();
        assert_eq!(graph.implicit_entities(), vec!["Ghost".to_string()]);
    }

    #[test]
    fn test_project_keeps_requested_order_and_internal_relations() {
        let graph = sample_graph();
        let projected = graph.project(&["B".to_string(), "A".to_string(), "Missing".to_string()]);
        let names: Vec<_> = projected.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["B", "A"]);
        assert_eq!(projected.relations, vec![Relation::new("A", "B", "leads")]);
    }

    #[test]
    fn test_entity_type_counts() {
        let graph = sample_graph();
        let counts = graph.entity_type_counts();
        assert_eq!(counts.get("person"), Some(&1));
        assert_eq!(counts.get("project"), Some(&1));
        assert_eq!(counts.len(), 3);
    }
}
