//! Session persistence
//!
//! Stores pairing credentials and the logged-in account for each instance
//! so a restarted gateway can reconnect without a new pairing code.
//!
//! Layout of [`FileSessionStore`]:
//!
//! ```text
//! <sessions_dir>/
//!   <instance_id>/
//!     credentials.json
//!     account.json
//! ```

use crate::core::errors::PersistenceError;
use crate::core::types::InstanceId;
use crate::transport::{Credentials, UserInfo};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CREDENTIALS_FILE: &str = "credentials.json";
const ACCOUNT_FILE: &str = "account.json";

#[async_trait]
pub trait PersistenceSink: Send + Sync + 'static {
    async fn load_credentials(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<Credentials>, PersistenceError>;

    async fn save_credentials(
        &self,
        instance_id: &InstanceId,
        credentials: &Credentials,
    ) -> Result<(), PersistenceError>;

    async fn save_account(
        &self,
        instance_id: &InstanceId,
        user: &UserInfo,
    ) -> Result<(), PersistenceError>;

    /// Remove everything stored for the instance. Missing data is not an error.
    async fn delete_session(&self, instance_id: &InstanceId) -> Result<(), PersistenceError>;
}

/// JSON files on local disk, one directory per instance
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn instance_dir(&self, instance_id: &InstanceId) -> Result<PathBuf, PersistenceError> {
        let id = instance_id.as_str();
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(PersistenceError::InvalidInstanceId(id.to_string()));
        }
        Ok(self.root.join(id))
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistenceError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write via a temp file and rename so readers never see a partial file
    async fn write_json<T: Serialize + ?Sized>(
        dir: &Path,
        file: &str,
        value: &T,
    ) -> Result<(), PersistenceError> {
        tokio::fs::create_dir_all(dir).await?;
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = dir.join(format!("{}.tmp", file));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, dir.join(file)).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceSink for FileSessionStore {
    async fn load_credentials(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<Credentials>, PersistenceError> {
        let path = self.instance_dir(instance_id)?.join(CREDENTIALS_FILE);
        Self::read_json(&path).await
    }

    async fn save_credentials(
        &self,
        instance_id: &InstanceId,
        credentials: &Credentials,
    ) -> Result<(), PersistenceError> {
        let dir = self.instance_dir(instance_id)?;
        Self::write_json(&dir, CREDENTIALS_FILE, credentials).await?;
        debug!(instance = %instance_id, "Saved credentials");
        Ok(())
    }

    async fn save_account(
        &self,
        instance_id: &InstanceId,
        user: &UserInfo,
    ) -> Result<(), PersistenceError> {
        let dir = self.instance_dir(instance_id)?;
        Self::write_json(&dir, ACCOUNT_FILE, user).await?;
        debug!(instance = %instance_id, user = %user.id, "Saved account");
        Ok(())
    }

    async fn delete_session(&self, instance_id: &InstanceId) -> Result<(), PersistenceError> {
        let dir = self.instance_dir(instance_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(instance = %instance_id, "Deleted stored session");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_credentials_round_trip_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        let id = InstanceId::from("shop-01");

        assert!(store.load_credentials(&id).await.unwrap().is_none());

        let creds = Credentials(serde_json::json!({ "key": "abc" }));
        store.save_credentials(&id, &creds).await.unwrap();
        assert_eq!(store.load_credentials(&id).await.unwrap(), Some(creds));
        assert!(dir.path().join("shop-01").join(CREDENTIALS_FILE).exists());
    }

    #[tokio::test]
    async fn test_delete_session_removes_directory() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        let id = InstanceId::from("shop-01");

        let user = UserInfo {
            id: "1555@net".to_string(),
            name: None,
        };
        store.save_account(&id, &user).await.unwrap();
        store.delete_session(&id).await.unwrap();
        assert!(!dir.path().join("shop-01").exists());

        // Deleting twice is fine
        store.delete_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());

        for bad in ["..", "a/b", "", "../etc"] {
            let result = store.load_credentials(&InstanceId::from(bad)).await;
            assert!(
                matches!(result, Err(PersistenceError::InvalidInstanceId(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_corrupt_credentials_surface_error() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        let id = InstanceId::from("a");

        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a").join(CREDENTIALS_FILE), b"{not json").unwrap();

        assert!(matches!(
            store.load_credentials(&id).await,
            Err(PersistenceError::Serde(_))
        ));
    }
}
