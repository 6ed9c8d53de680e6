//! Naming of the database files inside the data directory

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// The data directory holding every inventory
///
/// - `<folder>-<storage>-filelist.db` per folder
/// - `<storage>-duplicates.db` per storage
/// - `differences.db` for all targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the directory if it does not exist yet.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    pub fn filelist_path(&self, folder_name: &str, storage_name: &str) -> PathBuf {
        self.root
            .join(format!("{folder_name}-{storage_name}-filelist.db"))
    }

    pub fn duplist_path(&self, storage_name: &str) -> PathBuf {
        self.root.join(format!("{storage_name}-duplicates.db"))
    }

    pub fn difflist_path(&self) -> PathBuf {
        self.root.join("differences.db")
    }

    /// A fresh, unused file name for a duplist snapshot.
    pub fn snapshot_path(&self, storage_name: &str) -> PathBuf {
        self.root
            .join(format!("{storage_name}-duplicates-{}.snapshot.db", Uuid::new_v4()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names() {
        let dir = DataDir::new("/data");
        assert_eq!(
            dir.filelist_path("photos", "local"),
            PathBuf::from("/data/photos-local-filelist.db")
        );
        assert_eq!(
            dir.duplist_path("drive"),
            PathBuf::from("/data/drive-duplicates.db")
        );
        assert_eq!(dir.difflist_path(), PathBuf::from("/data/differences.db"));
        assert_ne!(dir.snapshot_path("drive"), dir.snapshot_path("drive"));
    }
}
