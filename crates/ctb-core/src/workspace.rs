//! Workspace snapshots used to find files a Claude run created or changed.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::SystemTime,
};

use walkdir::WalkDir;

use crate::Result;

/// Directories never scanned for artifacts.
pub const SKIP_DIRS: &[&str] = &[".git", "node_modules", "__pycache__", ".venv", ".claude"];

/// File suffixes never reported as artifacts.
pub const SKIP_SUFFIXES: &[&str] = &[".log", ".tmp"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

/// Regular files under a workspace root, keyed by path relative to the root.
#[derive(Clone, Debug)]
pub struct WorkspaceSnapshot {
    root: PathBuf,
    files: BTreeMap<PathBuf, FileStamp>,
}

/// A file created or modified between two snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub relative: PathBuf,
    pub path: PathBuf,
    pub len: u64,
}

impl Artifact {
    pub fn display_name(&self) -> String {
        self.relative.to_string_lossy().to_string()
    }
}

impl WorkspaceSnapshot {
    /// Walk `root` without following symlinks. A missing root is an empty
    /// snapshot; unreadable entries are skipped.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        if !root.exists() {
            return Ok(Self {
                root: root.to_path_buf(),
                files,
            });
        }

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped_dir(e));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unreadable workspace entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || has_skipped_suffix(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let Ok(md) = entry.metadata() else {
                continue;
            };
            files.insert(
                relative.to_path_buf(),
                FileStamp {
                    modified: md.modified().ok(),
                    len: md.len(),
                },
            );
        }

        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files in `self` that are new or differ (mtime or size) from `before`,
    /// sorted by relative path.
    pub fn changed_since(&self, before: &WorkspaceSnapshot) -> Vec<Artifact> {
        self.files
            .iter()
            .filter(|(rel, stamp)| before.files.get(*rel) != Some(*stamp))
            .map(|(rel, stamp)| Artifact {
                relative: rel.clone(),
                path: self.root.join(rel),
                len: stamp.len,
            })
            .collect()
    }
}

fn is_skipped_dir(e: &walkdir::DirEntry) -> bool {
    e.file_type().is_dir()
        && e
            .file_name()
            .to_str()
            .map(|n| SKIP_DIRS.contains(&n))
            .unwrap_or(false)
}

fn has_skipped_suffix(p: &Path) -> bool {
    let name = p
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    SKIP_SUFFIXES.iter().any(|s| name.ends_with(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn names(artifacts: &[Artifact]) -> Vec<String> {
        artifacts.iter().map(|a| a.display_name()).collect()
    }

    #[test]
    fn missing_root_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let snap = WorkspaceSnapshot::capture(&tmp.path().join("nope")).unwrap();
        assert!(snap.is_empty());
    }

    #[test]
    fn new_files_appear_once_and_untouched_files_do_not() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::write(root.join("old.txt"), "keep").unwrap();

        let before = WorkspaceSnapshot::capture(root).unwrap();
        fs::write(root.join("hello.py"), "print('hi')\n").unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/lib.rs"), "pub fn f() {}\n").unwrap();
        let after = WorkspaceSnapshot::capture(root).unwrap();

        let changed = after.changed_since(&before);
        assert_eq!(names(&changed), vec!["hello.py", "src/lib.rs"]);
        assert_eq!(changed[0].path, root.join("hello.py"));
        assert_eq!(changed[0].len, 12);
    }

    #[test]
    fn modified_files_are_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::write(root.join("notes.md"), "v1").unwrap();
        let before = WorkspaceSnapshot::capture(root).unwrap();
        fs::write(root.join("notes.md"), "version two").unwrap();
        let after = WorkspaceSnapshot::capture(root).unwrap();
        assert_eq!(names(&after.changed_since(&before)), vec!["notes.md"]);
    }

    #[test]
    fn deleted_files_are_not_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::write(root.join("gone.txt"), "x").unwrap();
        let before = WorkspaceSnapshot::capture(root).unwrap();
        fs::remove_file(root.join("gone.txt")).unwrap();
        let after = WorkspaceSnapshot::capture(root).unwrap();
        assert!(after.changed_since(&before).is_empty());
    }

    #[test]
    fn skip_rules_apply() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let before = WorkspaceSnapshot::capture(root).unwrap();
        for dir in SKIP_DIRS {
            fs::create_dir_all(root.join(dir)).unwrap();
            fs::write(root.join(dir).join("inner.txt"), "x").unwrap();
        }
        fs::write(root.join("run.log"), "x").unwrap();
        fs::write(root.join("scratch.tmp"), "x").unwrap();
        fs::write(root.join("result.csv"), "a,b\n").unwrap();
        let after = WorkspaceSnapshot::capture(root).unwrap();
        assert_eq!(names(&after.changed_since(&before)), vec!["result.csv"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_followed() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "x").unwrap();

        let root = tmp.path();
        let before = WorkspaceSnapshot::capture(root).unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            root.join("secret-link.txt"),
        )
        .unwrap();
        let after = WorkspaceSnapshot::capture(root).unwrap();
        assert!(after.changed_since(&before).is_empty());
    }
}
