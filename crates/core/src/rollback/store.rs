//! In-memory registry of rollback points.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::snapshot::RollbackPoint;
use crate::clock::{Clock, SystemClock};

/// Registry of rollback points keyed by ID, with its own lock and clock.
pub struct RollbackStore {
    points: Mutex<HashMap<String, RollbackPoint>>,
    clock: Arc<dyn Clock>,
}

impl Default for RollbackStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl RollbackStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            points: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RollbackPoint>> {
        self.points.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, point: RollbackPoint) {
        self.lock().insert(point.id.clone(), point);
    }

    /// Insert unless the ID is already registered. Returns whether it was
    /// inserted.
    pub fn insert_if_absent(&self, point: RollbackPoint) -> bool {
        let mut points = self.lock();
        if points.contains_key(&point.id) {
            return false;
        }
        points.insert(point.id.clone(), point);
        true
    }

    pub fn get(&self, id: &str) -> Option<RollbackPoint> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<RollbackPoint> {
        self.lock().remove(id)
    }

    /// All points, oldest first.
    pub fn list(&self) -> Vec<RollbackPoint> {
        let mut points: Vec<RollbackPoint> = self.lock().values().cloned().collect();
        points.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        points
    }

    /// IDs of points created strictly before `cutoff`.
    pub fn ids_older_than(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .values()
            .filter(|p| p.created_at < cutoff)
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use std::path::PathBuf;

    fn point(id: &str, at: DateTime<Utc>) -> RollbackPoint {
        RollbackPoint {
            id: id.into(),
            repo_path: PathBuf::from("/repo"),
            branch: "main".into(),
            revision: None,
            dirty: false,
            created_at: at,
            backup_dir: PathBuf::from("/repo/.snapshot_backups").join(id),
            files: Vec::new(),
        }
    }

    #[test]
    fn test_list_is_ordered_by_creation() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = RollbackStore::new(clock.clone());
        let t0 = store.now();
        store.insert(point("b", t0 + Duration::minutes(1)));
        store.insert(point("a", t0));
        let ids: Vec<String> = store.list().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_ids_older_than() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = RollbackStore::new(clock.clone());
        store.insert(point("old", store.now()));
        clock.advance(Duration::hours(48));
        store.insert(point("new", store.now()));
        let cutoff = store.now() - Duration::hours(24);
        assert_eq!(store.ids_older_than(cutoff), vec!["old"]);
    }

    #[test]
    fn test_insert_if_absent() {
        let store = RollbackStore::default();
        assert!(store.insert_if_absent(point("x", Utc::now())));
        assert!(!store.insert_if_absent(point("x", Utc::now())));
        assert_eq!(store.len(), 1);
        assert!(store.remove("x").is_some());
        assert!(store.is_empty());
    }
}
