//! Advisory path locks: one lock file per locked path, used to keep two
//! tasks from touching overlapping filesystem subtrees concurrently.
//!
//! Grounded in `coworker/locks.py`.

use std::collections::HashSet;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::LockError;

/// A set of path locks held by one task; releases on `release`.
pub struct LockHandle {
    held: Vec<PathBuf>,
}

impl LockHandle {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn release(&mut self) {
        for lock_file in self.held.drain(..) {
            let _ = std::fs::remove_file(&lock_file);
        }
    }

    /// Consume the handle without releasing its locks — used when a task
    /// pauses at a checkpoint and the worker keeps its path locks through
    /// approval rather than releasing them.
    pub fn retain(mut self) {
        self.held.clear();
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

struct ExistingLock {
    path: PathBuf,
    task_id: String,
}

/// Acquire locks on `paths` for `task_id`/`owner`. Returns an empty handle
/// (`is_empty() == true`) if any requested path conflicts with a lock held by
/// a different task; any locks this call itself created are released first.
pub fn acquire_locks(paths: &[PathBuf], locks_dir: &Path, task_id: &str, owner: &str) -> Result<LockHandle, LockError> {
    std::fs::create_dir_all(locks_dir)?;

    let mut normalized: Vec<PathBuf> = paths
        .iter()
        .filter_map(|p| std::fs::canonicalize(p).ok().or_else(|| Some(p.clone())))
        .collect();
    normalized.sort();
    normalized.dedup();
    let pruned = prune_descendants(normalized);

    let existing = read_existing_locks(locks_dir)?;

    for path in &pruned {
        if has_conflict(path, task_id, &existing) {
            return Ok(LockHandle { held: Vec::new() });
        }
    }

    let mut created = Vec::new();
    for path in &pruned {
        match create_lock_file(locks_dir, path, task_id, owner) {
            Ok(Some(lock_path)) => created.push(lock_path),
            Ok(None) => {
                // Lock file exists; re-read to confirm it's ours.
                let lock_path = lock_file_path(locks_dir, path);
                match read_lock_file(&lock_path) {
                    Some(existing) if existing.task_id == task_id => created.push(lock_path),
                    _ => {
                        for lock_path in &created {
                            let _ = std::fs::remove_file(lock_path);
                        }
                        return Ok(LockHandle { held: Vec::new() });
                    }
                }
            }
            Err(err) => {
                for lock_path in &created {
                    let _ = std::fs::remove_file(lock_path);
                }
                return Err(err);
            }
        }
    }

    Ok(LockHandle { held: created })
}

/// Release only the lock files in `locks_dir` owned by `task_id` for `paths`.
pub fn release_task_locks(paths: &[PathBuf], locks_dir: &Path, task_id: &str) {
    for path in paths {
        let lock_path = lock_file_path(locks_dir, path);
        if let Some(lock) = read_lock_file(&lock_path) {
            if lock.task_id == task_id {
                let _ = std::fs::remove_file(&lock_path);
            }
        }
    }
}

fn prune_descendants(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut by_depth = paths;
    by_depth.sort_by_key(|p| p.components().count());
    let mut kept: Vec<PathBuf> = Vec::new();
    for path in by_depth {
        if !kept.iter().any(|k| path.starts_with(k)) {
            kept.push(path);
        }
    }
    kept
}

fn has_conflict(path: &Path, task_id: &str, existing: &[ExistingLock]) -> bool {
    existing
        .iter()
        .any(|lock| lock.task_id != task_id && (path.starts_with(&lock.path) || lock.path.starts_with(path)))
}

fn read_existing_locks(locks_dir: &Path) -> Result<Vec<ExistingLock>, LockError> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(locks_dir) else {
        return Ok(out);
    };
    for entry in entries.filter_map(Result::ok) {
        if let Some(lock) = read_lock_file(&entry.path()) {
            out.push(lock);
        }
    }
    Ok(out)
}

fn read_lock_file(path: &Path) -> Option<ExistingLock> {
    let mut file = std::fs::File::open(path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    let mut path_value = None;
    let mut task_id = None;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("path=") {
            path_value = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("task_id=") {
            task_id = Some(rest.to_string());
        }
    }
    Some(ExistingLock { path: path_value?, task_id: task_id? })
}

fn create_lock_file(locks_dir: &Path, path: &Path, task_id: &str, owner: &str) -> Result<Option<PathBuf>, LockError> {
    use std::fs::OpenOptions;

    let lock_path = lock_file_path(locks_dir, path);
    let mut opts = OpenOptions::new();
    opts.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.custom_flags(libc::O_EXCL);
    }

    match opts.open(&lock_path) {
        Ok(mut file) => {
            let created_at = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
            let contents = format!(
                "path={}\ntask_id={task_id}\nowner={owner}\ncreated_at={created_at}\n",
                path.display()
            );
            file.write_all(contents.as_bytes())?;
            Ok(Some(lock_path))
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(LockError::from(err)),
    }
}

fn lock_file_path(locks_dir: &Path, path: &Path) -> PathBuf {
    locks_dir.join(lock_name(path))
}

/// `lock-<safe_basename>-<sha256(abs_path)[:16]>.lock`.
fn lock_name(path: &Path) -> String {
    let basename = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let safe: String = basename
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
        .collect();
    let truncated: String = safe.chars().take(64).collect();
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    let hash_suffix: String = format!("{digest:x}").chars().take(16).collect();
    format!("lock-{truncated}-{hash_suffix}.lock")
}

#[must_use]
pub fn dedupe_paths(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    paths.into_iter().filter(|p| seen.insert(p.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquires_and_releases_locks() {
        let dir = tempdir().unwrap();
        let locks_dir = dir.path().join("locks");
        let target = dir.path().join("file.txt");
        std::fs::write(&target, "x").unwrap();

        let mut handle = acquire_locks(&[target.clone()], &locks_dir, "task-1", "worker-1").unwrap();
        assert!(!handle.is_empty());
        assert_eq!(std::fs::read_dir(&locks_dir).unwrap().count(), 1);

        handle.release();
        assert_eq!(std::fs::read_dir(&locks_dir).unwrap().count(), 0);
    }

    #[test]
    fn conflicting_task_gets_empty_handle() {
        let dir = tempdir().unwrap();
        let locks_dir = dir.path().join("locks");
        let target = dir.path().join("file.txt");
        std::fs::write(&target, "x").unwrap();

        let _first = acquire_locks(&[target.clone()], &locks_dir, "task-1", "worker-1").unwrap();
        let second = acquire_locks(&[target.clone()], &locks_dir, "task-2", "worker-2").unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn same_task_reacquires_idempotently() {
        let dir = tempdir().unwrap();
        let locks_dir = dir.path().join("locks");
        let target = dir.path().join("file.txt");
        std::fs::write(&target, "x").unwrap();

        let _first = acquire_locks(&[target.clone()], &locks_dir, "task-1", "worker-1").unwrap();
        let second = acquire_locks(&[target.clone()], &locks_dir, "task-1", "worker-1").unwrap();
        assert!(!second.is_empty());
    }

    #[test]
    fn descendant_paths_are_pruned_to_ancestor() {
        let dir = tempdir().unwrap();
        let parent = dir.path().join("parent");
        std::fs::create_dir_all(&parent).unwrap();
        let child = parent.join("child.txt");
        std::fs::write(&child, "x").unwrap();

        let kept = prune_descendants(vec![child.clone(), parent.clone()]);
        assert_eq!(kept, vec![parent]);
    }

    #[test]
    fn lock_name_truncates_long_basenames() {
        let long_name = "a".repeat(200);
        let path = PathBuf::from(format!("/tmp/{long_name}"));
        let name = lock_name(&path);
        assert!(name.len() < 64 + 16 + "lock-.lock".len() + 2);
        assert!(name.starts_with("lock-"));
        assert!(name.ends_with(".lock"));
    }
}
