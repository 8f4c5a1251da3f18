//! Scoped, per-execution working directories.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::obs;

const PREFIX: &str = "bert-sandbox-";

/// A private directory a worker runs in.
///
/// Removed by [`WorkDir::release`], or on drop if the owner bails out early.
#[derive(Debug)]
pub struct WorkDir {
    dir: TempDir,
}

impl WorkDir {
    /// Create a fresh directory under `root`, or under the system temp
    /// directory when `root` is `None`.
    pub fn acquire(root: Option<&Path>) -> std::io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(PREFIX);
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the directory now, logging (not failing) if removal fails.
    pub fn release(self) -> PathBuf {
        let path = self.dir.path().to_path_buf();
        if let Err(err) = self.dir.close() {
            obs::emit_workdir_cleanup_failed(&path, &err);
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_under_root_and_release() {
        let root = tempfile::tempdir().unwrap();
        let workdir = WorkDir::acquire(Some(root.path())).unwrap();
        let path = workdir.path().to_path_buf();

        assert!(path.is_dir());
        assert!(path.starts_with(root.path()));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(PREFIX));

        std::fs::write(path.join("scratch.txt"), b"data").unwrap();
        let released = workdir.release();
        assert_eq!(released, path);
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let workdir = WorkDir::acquire(Some(root.path())).unwrap();
            workdir.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_root_is_created() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        let workdir = WorkDir::acquire(Some(&nested)).unwrap();
        assert!(workdir.path().starts_with(&nested));
        workdir.release();
    }

    #[test]
    fn test_directories_are_distinct() {
        let root = tempfile::tempdir().unwrap();
        let a = WorkDir::acquire(Some(root.path())).unwrap();
        let b = WorkDir::acquire(Some(root.path())).unwrap();
        assert_ne!(a.path(), b.path());
    }
}
