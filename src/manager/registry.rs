//! One shared manager per base directory.
//!
//! Owned by the process entry point and passed to whatever needs a manager.
//! Handing out the same instance for a directory keeps its graph cache and
//! indexes warm across callers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use super::KnowledgeGraphManager;
use crate::config::Config;

pub struct ManagerRegistry {
    config: Config,
    managers: Mutex<HashMap<PathBuf, Arc<Mutex<KnowledgeGraphManager>>>>,
}

impl ManagerRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            managers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Manager for the configured base directory.
    pub fn default_manager(&self) -> Arc<Mutex<KnowledgeGraphManager>> {
        self.manager_for(self.config.base_dir())
    }

    /// Manager for `base_dir`, created on first request. Other settings come
    /// from the registry's config.
    pub fn manager_for(&self, base_dir: &Path) -> Arc<Mutex<KnowledgeGraphManager>> {
        let mut managers = self.managers.lock().unwrap_or_else(PoisonError::into_inner);
        let manager = managers.entry(base_dir.to_path_buf()).or_insert_with(|| {
            log::debug!("Creating manager for {}", base_dir.display());
            let mut config = self.config.clone();
            config.store.base_dir = base_dir.to_path_buf();
            Arc::new(Mutex::new(KnowledgeGraphManager::new(&config)))
        });
        Arc::clone(manager)
    }

    pub fn len(&self) -> usize {
        self.managers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Entity;
    use tempfile::TempDir;

    #[test]
    fn test_same_directory_shares_manager() {
        let temp_dir = TempDir::new().unwrap();
        let registry = ManagerRegistry::new(Config::with_base_dir(temp_dir.path()));

        let first = registry.default_manager();
        let second = registry.manager_for(temp_dir.path());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        first
            .lock()
            .unwrap()
            .create_entities(vec![Entity::new("A", "t", vec![])], None)
            .unwrap();
        let graph = second.lock().unwrap().read_graph(None).unwrap();
        assert_eq!(graph.entities.len(), 1);
    }

    #[test]
    fn test_directories_get_separate_managers() {
        let one = TempDir::new().unwrap();
        let two = TempDir::new().unwrap();
        let registry = ManagerRegistry::new(Config::with_base_dir(one.path()));
        assert!(registry.is_empty());

        let a = registry.manager_for(one.path());
        let b = registry.manager_for(two.path());
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.lock().unwrap().store().base_dir(), two.path());
        assert_eq!(registry.len(), 2);
    }
}
