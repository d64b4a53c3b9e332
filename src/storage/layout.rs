use crate::storage::error::StorageError;
use std::fs;
use std::path::{Path, PathBuf};

pub const DATA_DB_DIR: &str = "data";
pub const COMMIT_DB_DIR: &str = "commit";

/// Directory layout of one replica's store. The choice between one combined
/// store and two separate stores is made on first open and is enforced on
/// every later open by inspecting the directory contents.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    separate: bool,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>, separate: bool) -> Self {
        Self {
            root: root.into(),
            separate,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_separate(&self) -> bool {
        self.separate
    }

    pub fn data_path(&self) -> PathBuf {
        if self.separate {
            self.root.join(DATA_DB_DIR)
        } else {
            self.root.clone()
        }
    }

    pub fn commit_path(&self) -> PathBuf {
        if self.separate {
            self.root.join(COMMIT_DB_DIR)
        } else {
            self.root.clone()
        }
    }

    /// Creates the root if needed and rejects a directory laid out for the
    /// other mode.
    pub fn ensure(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)?;
        if self.separate {
            for entry in fs::read_dir(&self.root)? {
                let entry = entry?;
                let name = entry.file_name();
                if name != DATA_DB_DIR && name != COMMIT_DB_DIR {
                    return Err(self.invalid(format!(
                        "forbidden entry {} in separated layout",
                        name.to_string_lossy()
                    )));
                }
            }
        } else {
            for dir in [DATA_DB_DIR, COMMIT_DB_DIR] {
                if self.root.join(dir).exists() {
                    return Err(
                        self.invalid(format!("combined layout but {dir} directory exists"))
                    );
                }
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> StorageError {
        StorageError::InvalidLayout {
            path: self.root.clone(),
            reason,
        }
    }
}
