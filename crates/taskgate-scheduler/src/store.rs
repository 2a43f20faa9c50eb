//! File-based task store — in-memory cache backed by one JSON file.
//!
//! The cache is the source of truth while the process runs. Writes go to a
//! sibling temp file which is then renamed over the real one, so a crash
//! mid-write leaves the previous copy intact. A file that fails to parse is
//! renamed aside as `<file>.corrupt.<millis>` and the store starts empty.

use std::io::Write;
use std::path::{Path, PathBuf};

use taskgate_core::error::{Result, TaskGateError};

use crate::tasks::Task;

/// Serialized state ready to be written, tagged with its generation.
#[derive(Debug)]
pub struct Snapshot {
    pub generation: u64,
    pub json: String,
}

/// Priority-ordered task cache with JSON persistence.
pub struct TaskStore {
    path: PathBuf,
    /// Sorted by descending priority; equal priorities keep insertion order.
    tasks: Vec<Task>,
    dirty: bool,
    generation: u64,
}

impl TaskStore {
    /// Open the store at `path`, loading (or quarantining) any existing file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut tasks = Self::load(path)?;
        tasks.sort_by_key(|t| std::cmp::Reverse(t.priority));
        Ok(Self {
            path: path.to_path_buf(),
            tasks,
            dirty: false,
            generation: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<Vec<Task>> {
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if json.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Vec<Task>>(&json) {
            Ok(tasks) => {
                tracing::info!("📂 Loaded {} tasks from {}", tasks.len(), path.display());
                Ok(tasks)
            }
            Err(e) => {
                let quarantine = quarantine_path(path);
                std::fs::rename(path, &quarantine).map_err(|re| {
                    TaskGateError::Persistence(format!(
                        "store {} is corrupt ({e}) and could not be moved aside: {re}",
                        path.display()
                    ))
                })?;
                tracing::error!(
                    "🚨 Corrupt task store {} ({e}), moved to {} and starting empty",
                    path.display(),
                    quarantine.display()
                );
                Ok(Vec::new())
            }
        }
    }

    /// Insert keeping the priority order stable.
    pub fn insert(&mut self, task: Task) {
        let pos = self.tasks.partition_point(|t| t.priority >= task.priority);
        self.tasks.insert(pos, task);
        self.dirty = true;
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Mutable access marks the store dirty.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        let task = self.tasks.iter_mut().find(|t| t.id == id)?;
        self.dirty = true;
        Some(task)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Mutable access to every task. Marks the store dirty.
    pub fn tasks_mut(&mut self) -> &mut [Task] {
        self.dirty = true;
        &mut self.tasks
    }

    /// Remove tasks matching `remove` and return them.
    pub fn remove_where<F>(&mut self, mut remove: F) -> Vec<Task>
    where
        F: FnMut(&Task) -> bool,
    {
        let (removed, kept): (Vec<Task>, Vec<Task>) =
            std::mem::take(&mut self.tasks).into_iter().partition(|t| remove(t));
        self.tasks = kept;
        if !removed.is_empty() {
            self.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Serialize pending changes. Returns `None` when nothing changed.
    pub fn snapshot(&mut self) -> Result<Option<Snapshot>> {
        if !self.dirty {
            return Ok(None);
        }
        let json = serde_json::to_string_pretty(&self.tasks)?;
        self.dirty = false;
        self.generation += 1;
        Ok(Some(Snapshot {
            generation: self.generation,
            json,
        }))
    }

    /// Snapshot and write synchronously.
    pub fn save(&mut self) -> Result<()> {
        if let Some(snapshot) = self.snapshot()? {
            if let Err(e) = write_atomic(&self.path, snapshot.json.as_bytes()) {
                self.dirty = true;
                return Err(e);
            }
            tracing::debug!("💾 Saved {} tasks to {}", self.tasks.len(), self.path.display());
        }
        Ok(())
    }
}

/// Write `bytes` to `<path>.tmp`, fsync, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        TaskGateError::Persistence(format!("rename {} failed: {e}", tmp.display()))
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".corrupt.{}", chrono::Utc::now().timestamp_millis()));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::Lane;

    #[test]
    fn test_insert_orders_by_priority_then_insertion() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = TaskStore::open(&dir.path().join("tasks.json")).unwrap();
        store.insert(Task::new("a", Lane::User).priority(1));
        store.insert(Task::new("b", Lane::User).priority(5));
        store.insert(Task::new("c", Lane::User).priority(1));
        store.insert(Task::new("d", Lane::User).priority(5));

        let order: Vec<_> = store
            .tasks()
            .iter()
            .map(|t| t.payload.description.as_str())
            .collect();
        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_save_and_reload_preserves_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        let mut store = TaskStore::open(&path).unwrap();
        store.insert(Task::new("low", Lane::Autonomy).priority(-3));
        store.insert(Task::new("high", Lane::User).priority(9));
        store.insert(Task::new("high-2", Lane::User).priority(9));
        store.save().unwrap();
        assert!(!store.is_dirty());
        assert!(!tmp_path(&path).exists());

        let reloaded = TaskStore::open(&path).unwrap();
        assert_eq!(reloaded.tasks(), store.tasks());
    }

    #[test]
    fn test_corrupt_file_is_quarantined() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, "[{\"id\": ").unwrap();

        let store = TaskStore::open(&path).unwrap();
        assert!(store.is_empty());
        assert!(!path.exists());

        let quarantined: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("tasks.json.corrupt."))
            .collect();
        assert_eq!(quarantined.len(), 1);
        let kept = std::fs::read_to_string(dir.path().join(&quarantined[0])).unwrap();
        assert_eq!(kept, "[{\"id\": ");
    }

    #[test]
    fn test_snapshot_only_when_dirty() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = TaskStore::open(&dir.path().join("tasks.json")).unwrap();
        assert!(store.snapshot().unwrap().is_none());

        store.insert(Task::new("x", Lane::User));
        let first = store.snapshot().unwrap().unwrap();
        assert!(store.snapshot().unwrap().is_none());

        store.mark_dirty();
        let second = store.snapshot().unwrap().unwrap();
        assert!(second.generation > first.generation);
    }

    #[test]
    fn test_remove_where() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = TaskStore::open(&dir.path().join("tasks.json")).unwrap();
        store.insert(Task::new("keep", Lane::User).priority(2));
        store.insert(Task::new("drop", Lane::User).priority(1));
        store.save().unwrap();

        let removed = store.remove_where(|t| t.payload.description == "drop");
        assert_eq!(removed.len(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.is_dirty());
    }
}
