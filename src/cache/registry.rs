//! Lazily populated map of branch managers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::bus::{RefListener, RefsChanged};
use crate::cache::manager::RefCacheManager;
use crate::storage::{GitRepository, RefName, StorageResult};

/// One [`RefCacheManager`] per ref, created on first use.
///
/// Managers are never replaced once created, so everybody asking for the
/// same branch shares the same locks.
pub struct LockRegistry {
    repo: GitRepository,
    managers: RwLock<HashMap<RefName, Arc<RefCacheManager>>>,
}

impl LockRegistry {
    pub fn new(repo: GitRepository) -> Self {
        Self {
            repo,
            managers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the manager for a ref, creating it if needed.
    pub fn manager(&self, name: &RefName) -> Arc<RefCacheManager> {
        if let Some(manager) = self.managers.read().get(name) {
            return manager.clone();
        }

        self.managers
            .write()
            .entry(name.clone())
            .or_insert_with(|| Arc::new(RefCacheManager::new(self.repo.clone(), name.clone())))
            .clone()
    }

    /// the manager for a ref, only if one was created already
    pub fn existing(&self, name: &RefName) -> Option<Arc<RefCacheManager>> {
        self.managers.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.managers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RefListener for LockRegistry {
    /// Refreshes the caches of refs the pipeline just moved.
    ///
    /// Runs while the pipeline still holds the branch locks.
    fn refs_changed(&self, event: &RefsChanged) -> StorageResult<()> {
        for change in &event.changes {
            if let Some(manager) = self.existing(&change.name) {
                manager.refresh_changed(change.old, change.new)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRegistry")
            .field("managers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use crate::testing::{init_repo, main_ref};

    #[test]
    fn test_same_manager_per_branch() {
        let (_dir, repo, _) = init_repo();
        let registry = Arc::new(LockRegistry::new(repo));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.manager(&main_ref()))
            })
            .collect();
        let managers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(managers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);

        let other = registry.manager(&RefName::branch("dev").unwrap());
        assert!(!Arc::ptr_eq(&other, &managers[0]));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_existing_does_not_create() {
        let (_dir, repo, _) = init_repo();
        let registry = LockRegistry::new(repo);
        assert!(registry.existing(&main_ref()).is_none());
        assert!(registry.is_empty());
    }
}
