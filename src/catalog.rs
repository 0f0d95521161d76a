//! Filesystem-backed endpoint catalogs.
//!
//! The broker persists each shard's declared endpoint names under
//! `<root>/<bot_id>/<identifier>.json` so that a shard reconnecting after a
//! broker restart can recover its catalog by initializing with an empty
//! endpoint list. Entries are overwritten on every non-empty declaration and
//! deleted on explicit disconnect.
//!
//! Concurrent writes to the same file never occur because the broker admits
//! at most one registration per identity.

use crate::model::ShardId;
use serde::{Deserialize, Serialize};
use std::{
    io::{Error as IoError, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::fs;

#[derive(Debug, Deserialize, Serialize)]
struct StoredEndpoints {
    endpoints: Vec<String>,
}

/// Store of persisted endpoint declarations, rooted at a directory.
#[derive(Clone, Debug)]
pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    /// Create a catalog rooted at the given directory.
    ///
    /// The directory is created lazily on the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Return the catalog's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, id: &ShardId) -> PathBuf {
        self.root
            .join(&id.bot_id)
            .join(format!("{}.json", id.identifier))
    }

    /// Load the persisted endpoint names for a shard identity.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when no entry is persisted for the
    /// identity, or an [`ErrorKind::InvalidData`] error when the entry can't
    /// be parsed.
    pub async fn load(&self, id: &ShardId) -> Result<Vec<String>, IoError> {
        let bytes = fs::read(self.entry_path(id)).await?;
        let stored: StoredEndpoints = serde_json::from_slice(&bytes)
            .map_err(|source| IoError::new(ErrorKind::InvalidData, source))?;

        Ok(stored.endpoints)
    }

    /// Persist the endpoint names for a shard identity, replacing any
    /// previous entry.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the entry's directory can't be
    /// created or the file can't be written.
    pub async fn store(&self, id: &ShardId, endpoints: &[String]) -> Result<(), IoError> {
        fs::create_dir_all(self.root.join(&id.bot_id)).await?;

        let stored = StoredEndpoints {
            endpoints: endpoints.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&stored)
            .map_err(|source| IoError::new(ErrorKind::InvalidData, source))?;

        fs::write(self.entry_path(id), bytes).await
    }

    /// Delete the persisted entry for a shard identity.
    ///
    /// Best-effort: a missing entry is not an error, and other failures are
    /// logged rather than surfaced.
    pub async fn remove(&self, id: &ShardId) {
        if let Err(source) = fs::remove_file(self.entry_path(id)).await {
            if source.kind() != ErrorKind::NotFound {
                tracing::warn!("failed to remove catalog entry for {id}: {source}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Catalog;
    use crate::model::ShardId;
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(Catalog: Clone, Debug, Send, Sync);

    #[tokio::test]
    async fn store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path());
        let id = ShardId::new("42", "1");

        let endpoints = vec!["ping".to_owned(), "stats".to_owned()];
        catalog.store(&id, &endpoints).await.unwrap();

        assert_eq!(catalog.load(&id).await.unwrap(), endpoints);
    }

    #[tokio::test]
    async fn last_declaration_wins() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path());
        let id = ShardId::new("42", "1");

        catalog.store(&id, &["ping".to_owned()]).await.unwrap();
        catalog.store(&id, &["stats".to_owned()]).await.unwrap();

        assert_eq!(catalog.load(&id).await.unwrap(), ["stats".to_owned()]);
    }

    #[tokio::test]
    async fn load_without_entry_fails() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path());

        assert!(catalog.load(&ShardId::new("42", "9")).await.is_err());
    }

    #[tokio::test]
    async fn remove_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path());
        let id = ShardId::new("42", "1");

        // Removing an entry that was never stored must not panic or log an
        // error-level event.
        catalog.remove(&id).await;

        catalog.store(&id, &["ping".to_owned()]).await.unwrap();
        catalog.remove(&id).await;

        assert!(catalog.load(&id).await.is_err());
    }

    #[tokio::test]
    async fn identities_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path());

        catalog
            .store(&ShardId::new("42", "1"), &["ping".to_owned()])
            .await
            .unwrap();
        catalog
            .store(&ShardId::new("42", "2"), &["stats".to_owned()])
            .await
            .unwrap();

        assert_eq!(
            catalog.load(&ShardId::new("42", "1")).await.unwrap(),
            ["ping".to_owned()]
        );
        assert_eq!(
            catalog.load(&ShardId::new("42", "2")).await.unwrap(),
            ["stats".to_owned()]
        );
    }
}
