//! Node-local model storage
//!
//! The model root holds one folder per model. A folder's presence is the
//! only signal that model bytes are (at least partially) on the node.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use lattice_common::ReconcileError;

/// Access to the node's model root folder
#[async_trait]
pub trait ModelFilesystem: Send + Sync {
    /// Create the model root if it does not exist
    async fn ensure_root_folder(&self) -> Result<(), ReconcileError>;

    /// Whether the folder for a model exists
    async fn has_model_folder(&self, folder: &str) -> Result<bool, ReconcileError>;

    /// Names of every folder directly under the model root
    async fn model_folders(&self) -> Result<Vec<String>, ReconcileError>;

    /// Recursively delete a model folder (absent is fine)
    async fn remove_model(&self, folder: &str) -> Result<(), ReconcileError>;
}

/// Model storage backed by a real directory
pub struct LocalFilesystem {
    root: PathBuf,
}

impl LocalFilesystem {
    /// Use `root` as the model root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The model root
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn folder_path(&self, folder: &str) -> Result<PathBuf, ReconcileError> {
        if folder.is_empty()
            || folder == "."
            || folder == ".."
            || folder.contains(['/', '\\'])
        {
            return Err(ReconcileError::Filesystem(format!(
                "invalid model folder name '{}'",
                folder
            )));
        }
        Ok(self.root.join(folder))
    }
}

fn fs_error(action: &str, path: &Path, e: std::io::Error) -> ReconcileError {
    ReconcileError::Filesystem(format!("failed to {} {}: {}", action, path.display(), e))
}

#[async_trait]
impl ModelFilesystem for LocalFilesystem {
    async fn ensure_root_folder(&self) -> Result<(), ReconcileError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| fs_error("create", &self.root, e))
    }

    async fn has_model_folder(&self, folder: &str) -> Result<bool, ReconcileError> {
        let path = self.folder_path(folder)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(fs_error("inspect", &path, e)),
        }
    }

    async fn model_folders(&self) -> Result<Vec<String>, ReconcileError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| fs_error("read", &self.root, e))?;
        let mut folders = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| fs_error("read", &self.root, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if is_dir {
                folders.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        folders.sort();
        Ok(folders)
    }

    async fn remove_model(&self, folder: &str) -> Result<(), ReconcileError> {
        let path = self.folder_path(folder)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "Removed model folder");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(fs_error("remove", &path, e)),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn root_is_created_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFilesystem::new(dir.path().join("models"));
        fs.ensure_root_folder().await.unwrap();
        assert!(fs.root().is_dir());
        assert!(fs.model_folders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lists_only_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("iris")).unwrap();
        std::fs::create_dir(dir.path().join("team-a_bert")).unwrap();
        std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        let fs = LocalFilesystem::new(dir.path());
        assert_eq!(
            fs.model_folders().await.unwrap(),
            vec!["iris".to_string(), "team-a_bert".to_string()]
        );
        assert!(fs.has_model_folder("iris").await.unwrap());
        assert!(!fs.has_model_folder("stray.txt").await.unwrap());
        assert!(!fs.has_model_folder("missing").await.unwrap());
    }

    #[tokio::test]
    async fn remove_deletes_folder_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("iris/1")).unwrap();
        std::fs::write(dir.path().join("iris/1/model.bin"), b"weights").unwrap();

        let fs = LocalFilesystem::new(dir.path());
        fs.remove_model("iris").await.unwrap();
        assert!(!dir.path().join("iris").exists());

        // Already gone
        fs.remove_model("iris").await.unwrap();
    }

    #[tokio::test]
    async fn folder_names_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFilesystem::new(dir.path());
        for bad in ["", "..", "a/b", "../etc"] {
            let err = fs.remove_model(bad).await.unwrap_err();
            assert!(matches!(err, ReconcileError::Filesystem(_)), "{bad}");
        }
    }
}
