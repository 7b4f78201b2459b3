//! Filesystem tool primitives: `fs.read_text`, `fs.list_dir`,
//! `fs.propose_write_file`, `fs.apply_write_file`, `fs.move`/`fs.rename`.
//!
//! Grounded in `coworker/tools/fs_tools.py`. Policy has already confirmed
//! paths sit within allowed roots by the time these run; each primitive still
//! re-checks the existence preconditions the policy checked, since a plan can
//! be validated well before it executes.

use std::io::Read as _;
use std::path::{Path, PathBuf};

use coworker_utils::{AtomicWriteOptions, PersistMode, atomic_write_new_with_options, format_unified_diff};

use crate::error::ToolError;

const DEFAULT_MAX_LIST_ENTRIES: usize = 200;

/// Read up to `max_bytes` of `path` as UTF-8, replacing invalid sequences.
pub fn read_text(path: &Path, max_bytes: u64) -> Result<String, ToolError> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; max_bytes as usize];
    let n = file.read(&mut buf)?;
    buf.truncate(n);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// List a directory's entry names, sorted, capped at `max_entries`.
pub fn list_dir(path: &Path, max_entries: Option<usize>) -> Result<Vec<String>, ToolError> {
    let max_entries = max_entries.unwrap_or(DEFAULT_MAX_LIST_ENTRIES);
    let mut names: Vec<String> = std::fs::read_dir(path)?
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names.truncate(max_entries);
    Ok(names)
}

/// Produce a unified diff between the file's current content (if any, capped
/// at `max_bytes_for_existing_read`) and `content`. Never writes anything.
pub fn propose_write_file(
    path: &Path,
    content: &str,
    max_bytes_for_existing_read: u64,
) -> Result<String, ToolError> {
    let existing = match read_text(path, max_bytes_for_existing_read) {
        Ok(text) => text,
        Err(ToolError::NotFound(_)) => String::new(),
        Err(err) => return Err(err),
    };
    let label = path.to_string_lossy();
    Ok(format_unified_diff(&existing, content, &label, &label))
}

/// Write `content` to `path`, failing if the destination already exists.
///
/// Writes through a sibling temp file in the same directory, then renames.
/// If the target already exists by the time the rename happens (a TOCTOU race
/// against the policy check), the error is `ToolError::AlreadyExists`, not a
/// torn write.
pub fn apply_write_file(path: &Path, content: &str) -> Result<(), ToolError> {
    if let Some(parent) = path.parent() {
        if !parent.is_dir() {
            return Err(ToolError::InvalidArgs(format!(
                "parent directory does not exist: {}",
                parent.display()
            )));
        }
    }
    let options = AtomicWriteOptions {
        mode: PersistMode::Default,
        ..AtomicWriteOptions::default()
    };
    atomic_write_new_with_options(path, content.as_bytes(), options)
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                ToolError::AlreadyExists(path.display().to_string())
            } else {
                ToolError::from(err)
            }
        })
}

/// Move/rename `src` to `dst`. `dst` must not already exist; `dst`'s parent
/// must exist. Uses `rename` when possible, falling back to a temp-file copy
/// in `dst`'s parent directory (then remove `src`) across filesystems, so a
/// failed cross-filesystem copy never leaves a partial destination.
pub fn move_path(src: &Path, dst: &Path) -> Result<(), ToolError> {
    if dst.exists() {
        return Err(ToolError::AlreadyExists(dst.display().to_string()));
    }
    let parent = dst
        .parent()
        .ok_or_else(|| ToolError::InvalidArgs("destination has no parent".to_string()))?;
    std::fs::create_dir_all(parent)?;

    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device(&err) => copy_then_remove(src, dst),
        Err(err) => Err(ToolError::from(err)),
    }
}

#[cfg(unix)]
fn is_cross_device(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(not(unix))]
fn is_cross_device(_err: &std::io::Error) -> bool {
    false
}

fn copy_then_remove(src: &Path, dst: &Path) -> Result<(), ToolError> {
    let bytes = std::fs::read(src)?;
    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    let tmp = PathBuf::from(parent).join(format!(
        ".{}.tmp",
        dst.file_name().and_then(|n| n.to_str()).unwrap_or("coworker")
    ));
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, dst).map_err(|err| {
        let _ = std::fs::remove_file(&tmp);
        ToolError::from(err)
    })?;
    std::fs::remove_file(src)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn read_text_truncates_to_max_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hello world").unwrap();
        assert_eq!(read_text(&path, 5).unwrap(), "hello");
    }

    #[test]
    fn list_dir_is_sorted_and_capped() {
        let dir = tempdir().unwrap();
        for name in ["b", "a", "c"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        let names = list_dir(dir.path(), Some(2)).unwrap();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn propose_write_file_diffs_missing_file_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("new.txt");
        let diff = propose_write_file(&path, "line one\n", 1000).unwrap();
        assert!(diff.contains("line one"));
    }

    #[test]
    fn apply_write_file_refuses_existing_destination() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "existing").unwrap();
        let err = apply_write_file(&path, "new").unwrap_err();
        assert!(matches!(err, ToolError::AlreadyExists(_)));
    }

    #[test]
    fn move_path_refuses_existing_destination() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        std::fs::write(&src, "a").unwrap();
        std::fs::write(&dst, "b").unwrap();
        let err = move_path(&src, &dst).unwrap_err();
        assert!(matches!(err, ToolError::AlreadyExists(_)));
    }

    #[test]
    fn move_path_renames_within_same_filesystem() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        std::fs::write(&src, "content").unwrap();
        move_path(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "content");
    }
}
