//! Temporary storage for inbound photos and documents.
//!
//! Files land in `<media_dir>/user_<id>/`, get copied into the user's workspace
//! for the CLI, and are evicted once older than the retention window.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use crate::{config::user_dir_name, domain::UserId, errors::Error, Result};

#[derive(Clone, Debug)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn user_dir(&self, user_id: UserId) -> PathBuf {
        self.root.join(user_dir_name(user_id))
    }

    /// A fresh path for an incoming file; never overwrites an earlier download.
    pub fn allocate(&self, user_id: UserId, file_name: &str) -> Result<PathBuf> {
        let dir = self.user_dir(user_id);
        fs::create_dir_all(&dir)?;
        Ok(unused_path(&dir, &sanitize_filename(file_name)))
    }

    /// Copy a downloaded file into `workspace` and return the workspace path.
    /// Existing workspace files are never replaced; a clash gets `name_1.ext`.
    pub fn copy_into_workspace(&self, src: &Path, workspace: &Path) -> Result<PathBuf> {
        let name = src
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::InvalidPath {
                path: src.to_path_buf(),
                reason: "media file has no file name".to_string(),
            })?;
        fs::create_dir_all(workspace)?;
        let dst = unused_path(workspace, &name);
        fs::copy(src, &dst)?;
        Ok(dst)
    }

    /// Delete files older than `max_age` for one user (or everyone), returning
    /// how many were removed. Empty per-user directories are left in place.
    pub fn evict_older_than(
        &self,
        user_id: Option<UserId>,
        max_age: Duration,
        now: SystemTime,
    ) -> Result<usize> {
        let dirs = match user_id {
            Some(u) => vec![self.user_dir(u)],
            None => match fs::read_dir(&self.root) {
                Ok(rd) => rd
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_dir())
                    .collect(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                Err(e) => return Err(e.into()),
            },
        };

        let mut removed = 0;
        for dir in dirs {
            let Ok(rd) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in rd.filter_map(|e| e.ok()) {
                let path = entry.path();
                let Ok(md) = entry.metadata() else {
                    continue;
                };
                if !md.is_file() {
                    continue;
                }
                let age = md
                    .modified()
                    .ok()
                    .and_then(|m| now.duration_since(m).ok())
                    .unwrap_or_default();
                if age > max_age {
                    match fs::remove_file(&path) {
                        Ok(()) => removed += 1,
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "failed to evict media file")
                        }
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// Keep only the final path component and characters safe on any filesystem.
pub fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name.trim())
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut out = String::with_capacity(base.len());
    for ch in base.chars() {
        if ch.is_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let out = out.trim_start_matches('.').to_string();
    if out.is_empty() {
        "file".to_string()
    } else {
        out
    }
}

/// `dir/name`, or the first free `dir/name_<n>.ext`.
fn unused_path(dir: &Path, name: &str) -> PathBuf {
    let mut candidate = dir.join(name);
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(numbered(name, n));
        n += 1;
    }
    candidate
}

fn numbered(name: &str, n: usize) -> String {
    if let Some((stem, ext)) = name.rsplit_once('.') {
        if !stem.is_empty() && !ext.is_empty() {
            return format!("{stem}_{n}.{ext}");
        }
    }
    format!("{name}_{n}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directories_and_odd_characters() {
        assert_eq!(sanitize_filename("report final.pdf"), "report_final.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename(".bashrc"), "bashrc");
        assert_eq!(sanitize_filename(".."), "file");
        assert_eq!(sanitize_filename(""), "file");
        assert_eq!(sanitize_filename("отчёт.txt"), "отчёт.txt");
    }

    #[test]
    fn allocate_never_reuses_a_path() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MediaStore::new(tmp.path());
        let user = UserId(5);

        let a = store.allocate(user, "photo.jpg").unwrap();
        assert_eq!(a, tmp.path().join("user_5/photo.jpg"));
        fs::write(&a, "x").unwrap();
        let b = store.allocate(user, "photo.jpg").unwrap();
        assert_eq!(b, tmp.path().join("user_5/photo_1.jpg"));
        fs::write(&b, "x").unwrap();
        let c = store.allocate(user, "photo.jpg").unwrap();
        assert_eq!(c, tmp.path().join("user_5/photo_2.jpg"));
    }

    #[test]
    fn copy_into_workspace_uses_the_file_name() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MediaStore::new(tmp.path().join("media"));
        let src = store.allocate(UserId(1), "data.csv").unwrap();
        fs::write(&src, "a,b\n").unwrap();

        let ws = tmp.path().join("ws/user_1");
        let dst = store.copy_into_workspace(&src, &ws).unwrap();
        assert_eq!(dst, ws.join("data.csv"));
        assert_eq!(fs::read_to_string(dst).unwrap(), "a,b\n");
    }

    #[test]
    fn copy_into_workspace_keeps_existing_workspace_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MediaStore::new(tmp.path().join("media"));
        let ws = tmp.path().join("ws/user_1");
        fs::create_dir_all(&ws).unwrap();
        fs::write(ws.join("data.csv"), "made by claude\n").unwrap();

        let src = store.allocate(UserId(1), "data.csv").unwrap();
        fs::write(&src, "uploaded\n").unwrap();
        let dst = store.copy_into_workspace(&src, &ws).unwrap();

        assert_eq!(dst, ws.join("data_1.csv"));
        assert_eq!(fs::read_to_string(&dst).unwrap(), "uploaded\n");
        assert_eq!(
            fs::read_to_string(ws.join("data.csv")).unwrap(),
            "made by claude\n"
        );
    }

    #[test]
    fn eviction_removes_only_old_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MediaStore::new(tmp.path());
        let a = store.allocate(UserId(1), "a.jpg").unwrap();
        fs::write(&a, "x").unwrap();
        let b = store.allocate(UserId(2), "b.jpg").unwrap();
        fs::write(&b, "x").unwrap();

        let hour = Duration::from_secs(3600);
        let now = SystemTime::now();
        assert_eq!(store.evict_older_than(None, hour, now).unwrap(), 0);

        // Two hours from now both files are stale; evict just user 1 first.
        let later = now + 2 * hour;
        assert_eq!(store.evict_older_than(Some(UserId(1)), hour, later).unwrap(), 1);
        assert!(!a.exists());
        assert!(b.exists());
        assert_eq!(store.evict_older_than(None, hour, later).unwrap(), 1);
        assert!(!b.exists());
    }

    #[test]
    fn eviction_of_missing_root_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MediaStore::new(tmp.path().join("missing"));
        let n = store
            .evict_older_than(None, Duration::from_secs(1), SystemTime::now())
            .unwrap();
        assert_eq!(n, 0);
    }
}
