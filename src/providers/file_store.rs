use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Result, StationLinkError};
use crate::interfaces::storage::DeliveryStore;

const FILE_PREFIX: &str = "SyncMessage.";
const FILE_SUFFIX: &str = ".smsg";

/// One directory per owner, one file per pending envelope:
/// `<root>/<owner>/SyncMessage.<id>.smsg`.
pub struct FileDeliveryStore {
    root: PathBuf,
}

impl FileDeliveryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn owner_dir(&self, owner: &str) -> Result<PathBuf> {
        check_component(owner)?;
        Ok(self.root.join(owner))
    }

    fn message_path(&self, owner: &str, id: &str) -> Result<PathBuf> {
        check_component(id)?;
        Ok(self
            .owner_dir(owner)?
            .join(format!("{FILE_PREFIX}{id}{FILE_SUFFIX}")))
    }
}

fn check_component(value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
        return Err(StationLinkError::Storage(format!(
            "invalid storage key: {value:?}"
        )));
    }
    Ok(())
}

#[async_trait]
impl DeliveryStore for FileDeliveryStore {
    async fn save(&self, owner: &str, id: &str, encoded: &str) -> Result<()> {
        let dir = self.owner_dir(owner)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StationLinkError::Storage(e.to_string()))?;
        let path = self.message_path(owner, id)?;
        tokio::fs::write(&path, encoded)
            .await
            .map_err(|e| StationLinkError::Storage(e.to_string()))
    }

    async fn remove(&self, owner: &str, id: &str) -> Result<()> {
        let path = self.message_path(owner, id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StationLinkError::Storage(err.to_string())),
        }
    }

    async fn list(&self, owner: &str) -> Result<Vec<(String, String)>> {
        let dir = self.owner_dir(owner)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StationLinkError::Storage(err.to_string())),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StationLinkError::Storage(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            else {
                continue;
            };
            let content = tokio::fs::read_to_string(entry.path())
                .await
                .map_err(|e| StationLinkError::Storage(e.to_string()))?;
            found.push((id.to_string(), content.trim().to_string()));
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saves_lists_and_removes_per_owner() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDeliveryStore::new(dir.path());

        store.save("station-1", "abc", "ZW5jb2RlZA==").await.unwrap();
        store.save("station-2", "def", "b3RoZXI=").await.unwrap();
        assert!(dir
            .path()
            .join("station-1")
            .join("SyncMessage.abc.smsg")
            .exists());

        let listed = store.list("station-1").await.unwrap();
        assert_eq!(listed, vec![("abc".to_string(), "ZW5jb2RlZA==".to_string())]);

        store.remove("station-1", "abc").await.unwrap();
        store.remove("station-1", "abc").await.unwrap();
        assert!(store.list("station-1").await.unwrap().is_empty());
        assert_eq!(store.list("station-2").await.unwrap().len(), 1);
        assert!(store.list("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_path_components() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDeliveryStore::new(dir.path());
        assert!(store.save("../escape", "x", "y").await.is_err());
        assert!(store.save("owner", "a/b", "y").await.is_err());
    }
}
