//! Line-delimited graph store: one `<namespace>.jsonl` file per namespace.
//!
//! Full loads and saves go through [`GraphStore::load`] / [`GraphStore::save`].
//! Small create batches use [`GraphStore::stream_entities`] for existence
//! checks and [`GraphStore::append_entities`] to avoid a full rewrite.

mod record;

pub use record::{is_marker_line, parse_record, RecordReader, StoreRecord, MARKER_SOURCE, MARKER_TYPE};

use record::{write_record, RecordRef};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use crate::error::{KgError, Result};
use crate::graph::{Entity, KnowledgeGraph};

const STORE_EXTENSION: &str = "jsonl";
const INDEX_SUFFIX: &str = ".index.json";

/// Check that a namespace can be used as a file stem inside the base directory.
///
/// Allowed: ASCII alphanumerics, `-`, `_` and `.`, not starting with `.`.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() {
        return Err(KgError::InvalidNamespace("namespace cannot be empty".to_string()));
    }
    if namespace.starts_with('.') {
        return Err(KgError::InvalidNamespace(format!(
            "'{}' must not start with '.'",
            namespace
        )));
    }
    if !namespace
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(KgError::InvalidNamespace(format!(
            "'{}' contains invalid characters (only alphanumeric, -, _, . allowed)",
            namespace
        )));
    }
    Ok(())
}

/// File-backed store for every namespace under one base directory.
pub struct GraphStore {
    base_dir: PathBuf,
    full_loads: AtomicUsize,
}

impl GraphStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            full_loads: AtomicUsize::new(0),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Number of full-file loads performed so far.
    pub fn full_loads(&self) -> usize {
        self.full_loads.load(Ordering::Relaxed)
    }

    pub fn store_path(&self, namespace: &str) -> Result<PathBuf> {
        validate_namespace(namespace)?;
        Ok(self
            .base_dir
            .join(format!("{}.{}", namespace, STORE_EXTENSION)))
    }

    pub fn index_path(&self, namespace: &str) -> Result<PathBuf> {
        validate_namespace(namespace)?;
        Ok(self.base_dir.join(format!("{}{}", namespace, INDEX_SUFFIX)))
    }

    /// Modification time of the store file, `None` if it does not exist.
    pub fn modified(&self, namespace: &str) -> Result<Option<SystemTime>> {
        let path = self.store_path(namespace)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, namespace: &str) -> Result<bool> {
        Ok(self.store_path(namespace)?.exists())
    }

    /// Read the whole graph. A missing file is an empty graph.
    ///
    /// Corrupt lines are logged and skipped. Duplicate entity names keep the
    /// first occurrence; duplicate relation triples are collapsed.
    pub fn load(&self, namespace: &str) -> Result<KnowledgeGraph> {
        let path = self.store_path(namespace)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(KnowledgeGraph::new());
            }
            Err(e) => return Err(e.into()),
        };
        self.full_loads.fetch_add(1, Ordering::Relaxed);

        let mut graph = KnowledgeGraph::new();
        let mut names = HashSet::new();
        let mut triples = HashSet::new();

        for record in RecordReader::new(BufReader::new(file), &path) {
            match record {
                Ok(StoreRecord::Entity(entity)) => {
                    if names.insert(entity.name.clone()) {
                        graph.entities.push(entity);
                    } else {
                        log::warn!(
                            "Dropping duplicate entity '{}' in {}",
                            entity.name,
                            path.display()
                        );
                    }
                }
                Ok(StoreRecord::Relation(relation)) => {
                    if triples.insert(relation.clone()) {
                        graph.relations.push(relation);
                    }
                }
                Ok(StoreRecord::Marker { .. }) => {}
                Err(err @ KgError::CorruptRecord { .. }) => {
                    log::warn!("Skipping line in {}: {}", path.display(), err);
                }
                Err(err) => return Err(err),
            }
        }

        log::debug!(
            "Loaded namespace '{}': {} entities, {} relations",
            namespace,
            graph.entities.len(),
            graph.relations.len()
        );
        Ok(graph)
    }

    /// Rewrite the whole file: marker, entities, relations.
    ///
    /// Writes a sibling temp file and renames it over the store so readers
    /// never see a half-written graph.
    pub fn save(&self, namespace: &str, graph: &KnowledgeGraph) -> Result<()> {
        let path = self.store_path(namespace)?;
        fs::create_dir_all(&self.base_dir)?;

        let tmp_path = path.with_extension(format!("{}.tmp", STORE_EXTENSION));
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            write_record(&mut writer, &RecordRef::marker())?;
            for entity in &graph.entities {
                write_record(&mut writer, &RecordRef::Entity(entity))?;
            }
            for relation in &graph.relations {
                write_record(&mut writer, &RecordRef::Relation(relation))?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp_path, &path)?;

        log::debug!(
            "Saved namespace '{}': {} entities, {} relations",
            namespace,
            graph.entities.len(),
            graph.relations.len()
        );
        Ok(())
    }

    /// Lazily iterate the entities of a namespace without building the graph.
    ///
    /// Call again to start over. A missing file yields nothing.
    pub fn stream_entities(&self, namespace: &str) -> Result<EntityStream> {
        let path = self.store_path(namespace)?;
        let records = match File::open(&path) {
            Ok(file) => Some(RecordReader::new(BufReader::new(file), &path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(EntityStream { records, path })
    }

    /// Append entity records, writing the marker first if the file is new.
    pub fn append_entities(&self, namespace: &str, entities: &[Entity]) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let path = self.store_path(namespace)?;
        fs::create_dir_all(&self.base_dir)?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let mut writer = Vec::new();
        if len == 0 {
            write_record(&mut writer, &RecordRef::marker())?;
        } else {
            ensure_marker(&path)?;
            // A torn last line would otherwise swallow the first new record
            file.seek(SeekFrom::End(-1))?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                writer.push(b'\n');
            }
        }
        for entity in entities {
            write_record(&mut writer, &RecordRef::Entity(entity))?;
        }
        file.write_all(&writer)?;
        file.flush()?;

        log::debug!(
            "Appended {} entities to namespace '{}'",
            entities.len(),
            namespace
        );
        Ok(())
    }

    /// Delete the index snapshot of a namespace, if any.
    pub fn remove_index_file(&self, namespace: &str) -> Result<()> {
        match fs::remove_file(self.index_path(namespace)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Namespaces with a store file in the base directory, sorted.
    pub fn list_namespaces(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let suffix = format!(".{}", STORE_EXTENSION);
        let mut namespaces = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(&suffix) {
                if validate_namespace(stem).is_ok() {
                    namespaces.push(stem.to_string());
                }
            }
        }
        namespaces.sort();
        Ok(namespaces)
    }
}

/// Refuse to touch a non-empty file whose first line is not our marker.
fn ensure_marker(path: &Path) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = Vec::new();
    while reader.read_until(b'\n', &mut buf)? > 0 {
        let Ok(line) = std::str::from_utf8(&buf) else {
            break;
        };
        let trimmed = line.trim();
        if is_marker_line(trimmed) {
            return Ok(());
        }
        if !trimmed.is_empty() {
            break;
        }
        buf.clear();
    }
    Err(KgError::UnsafeStoreFile {
        path: path.to_path_buf(),
    })
}

/// Forward-only entity iterator returned by [`GraphStore::stream_entities`].
///
/// Corrupt lines are logged and skipped; relations are ignored.
pub struct EntityStream {
    records: Option<RecordReader<BufReader<File>>>,
    path: PathBuf,
}

impl Iterator for EntityStream {
    type Item = Result<Entity>;

    fn next(&mut self) -> Option<Self::Item> {
        let records = self.records.as_mut()?;
        loop {
            match records.next()? {
                Ok(StoreRecord::Entity(entity)) => return Some(Ok(entity)),
                Ok(_) => continue,
                Err(err @ KgError::CorruptRecord { .. }) => {
                    log::warn!("Skipping line in {}: {}", self.path.display(), err);
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Relation;
    use tempfile::TempDir;

    fn sample_graph() -> KnowledgeGraph {
        KnowledgeGraph {
            entities: vec![
                Entity::new(
                    "A",
                    "person",
                    vec!["leads project X".to_string(), "drinks tea".to_string()],
                ),
                Entity::new("B", "project", vec!["funded".to_string()]),
            ],
            relations: vec![
                Relation::new("A", "B", "leads"),
                Relation::new("A", "B", "funds"),
            ],
        }
    }

    #[test]
    fn test_validate_namespace() {
        assert!(validate_namespace("default").is_ok());
        assert!(validate_namespace("agent-1_notes.v2").is_ok());
        assert!(validate_namespace("").is_err());
        assert!(validate_namespace("../etc").is_err());
        assert!(validate_namespace(".hidden").is_err());
        assert!(validate_namespace("a/b").is_err());
        assert!(validate_namespace("with space").is_err());
    }

    #[test]
    fn test_missing_file_is_empty_graph() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::new(temp_dir.path());
        let graph = store.load("nothing").unwrap();
        assert!(graph.is_empty());
        assert_eq!(store.modified("nothing").unwrap(), None);
        assert_eq!(store.stream_entities("nothing").unwrap().count(), 0);
    }

    #[test]
    fn test_save_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::new(temp_dir.path());
        let graph = sample_graph();

        store.save("default", &graph).unwrap();
        let loaded = store.load("default").unwrap();
        assert_eq!(loaded, graph);
        assert_eq!(store.full_loads(), 1);

        let content = fs::read_to_string(store.store_path("default").unwrap()).unwrap();
        let first = content.lines().next().unwrap();
        assert!(is_marker_line(first), "first line must be the marker: {}", first);
        assert_eq!(content.lines().count(), 5);
    }

    #[test]
    fn test_save_creates_base_dir_and_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("nested").join("dir");
        let store = GraphStore::new(&base);
        store.save("default", &sample_graph()).unwrap();

        let files: Vec<String> = fs::read_dir(&base)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(files, vec!["default.jsonl".to_string()]);
    }

    #[test]
    fn test_load_rejects_foreign_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::new(temp_dir.path());
        let path = store.store_path("default").unwrap();
        fs::write(&path, "{\"some\":\"other tool\"}\n").unwrap();

        let err = store.load("default").unwrap_err();
        assert!(matches!(err, KgError::UnsafeStoreFile { .. }));

        let mut stream = store.stream_entities("default").unwrap();
        assert!(matches!(stream.next(), Some(Err(KgError::UnsafeStoreFile { .. }))));

        let err = store
            .append_entities("default", &[Entity::new("A", "t", vec![])])
            .unwrap_err();
        assert!(matches!(err, KgError::UnsafeStoreFile { .. }));
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"some\":\"other tool\"}\n", "foreign file must be untouched");
    }

    #[test]
    fn test_load_skips_corrupt_lines() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::new(temp_dir.path());
        let path = store.store_path("default").unwrap();
        fs::write(
            &path,
            concat!(
                r#"{"type":"_kgmem","source":"kgmem-rs"}"#,
                "\n",
                r#"{"type":"entity","name":"A","entityType":"person","observations":[]}"#,
                "\n",
                "garbage line\n",
                r#"{"type":"entity","name":"A","entityType":"duplicate","observations":[]}"#,
                "\n",
                r#"{"type":"relation","from":"A","to":"B","relationType":"knows"}"#,
                "\n",
            ),
        )
        .unwrap();

        let graph = store.load("default").unwrap();
        assert_eq!(graph.entities.len(), 1);
        assert_eq!(graph.entities[0].entity_type, "person", "first occurrence wins");
        assert_eq!(graph.relations.len(), 1);
    }

    #[test]
    fn test_load_skips_non_utf8_line() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::new(temp_dir.path());
        let path = store.store_path("default").unwrap();
        let mut content = Vec::new();
        content.extend_from_slice(br#"{"type":"_kgmem","source":"kgmem-rs"}"#);
        content.push(b'\n');
        content.extend_from_slice(br#"{"type":"entity","name":"A","entityType":"t","observations":[]}"#);
        content.extend_from_slice(b"\n\xff\xfe garbage\n");
        content.extend_from_slice(br#"{"type":"entity","name":"B","entityType":"t","observations":[]}"#);
        content.push(b'\n');
        fs::write(&path, content).unwrap();

        let graph = store.load("default").unwrap();
        let names: Vec<_> = graph.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(store.stream_entities("default").unwrap().count(), 2);

        store
            .append_entities("default", &[Entity::new("C", "t", vec![])])
            .unwrap();
        assert_eq!(store.load("default").unwrap().entities.len(), 3);
    }

    #[test]
    fn test_append_writes_marker_on_new_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::new(temp_dir.path());
        store
            .append_entities("default", &[Entity::new("A", "person", vec![])])
            .unwrap();
        store
            .append_entities("default", &[Entity::new("B", "project", vec![])])
            .unwrap();

        let graph = store.load("default").unwrap();
        let names: Vec<_> = graph.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);

        let content = fs::read_to_string(store.store_path("default").unwrap()).unwrap();
        assert_eq!(content.lines().filter(|l| is_marker_line(l)).count(), 1);
    }

    #[test]
    fn test_append_repairs_torn_last_line() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::new(temp_dir.path());
        let path = store.store_path("default").unwrap();
        fs::write(
            &path,
            concat!(r#"{"type":"_kgmem","source":"kgmem-rs"}"#, "\n", r#"{"type":"enti"#),
        )
        .unwrap();

        store
            .append_entities("default", &[Entity::new("A", "person", vec![])])
            .unwrap();
        let graph = store.load("default").unwrap();
        assert_eq!(graph.entities.len(), 1);
        assert_eq!(graph.entities[0].name, "A");
    }

    #[test]
    fn test_stream_entities_is_restartable() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::new(temp_dir.path());
        store.save("default", &sample_graph()).unwrap();

        let first: Vec<String> = store
            .stream_entities("default")
            .unwrap()
            .map(|e| e.unwrap().name)
            .collect();
        let second: Vec<String> = store
            .stream_entities("default")
            .unwrap()
            .map(|e| e.unwrap().name)
            .collect();
        assert_eq!(first, vec!["A", "B"]);
        assert_eq!(first, second);
        assert_eq!(store.full_loads(), 0, "streaming is not a full load");
    }

    #[test]
    fn test_list_namespaces() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::new(temp_dir.path());
        assert!(store.list_namespaces().unwrap().is_empty());

        store.save("beta", &KnowledgeGraph::new()).unwrap();
        store.save("alpha", &sample_graph()).unwrap();
        fs::write(temp_dir.path().join("alpha.index.json"), "{}").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "hello").unwrap();

        assert_eq!(store.list_namespaces().unwrap(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_modified_changes_after_save() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::new(temp_dir.path());
        store.save("default", &KnowledgeGraph::new()).unwrap();
        assert!(store.modified("default").unwrap().is_some());
        assert!(store.exists("default").unwrap());
    }
}
