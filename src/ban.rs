// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Ban registry and its persistence.
//!
//! The registry is authoritative in memory. Every change rewrites the full
//! list through a [`BanStore`]; a failed write is logged and the in-memory
//! ban stays in force.

use crate::error::BanStoreError;
use crate::store::WebhookId;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// External persistence for the ban list.
#[async_trait]
pub trait BanStore: Send + Sync {
    /// Load the persisted list; a missing list is empty.
    async fn load(&self) -> Result<Vec<WebhookId>, BanStoreError>;

    /// Replace the persisted list.
    async fn save(&self, ids: &[WebhookId]) -> Result<(), BanStoreError>;
}

/// Ban list kept as a JSON array in a file.
#[derive(Debug, Clone)]
pub struct JsonFileBanStore {
    path: PathBuf,
}

impl JsonFileBanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> BanStoreError {
        BanStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl BanStore for JsonFileBanStore {
    async fn load(&self) -> Result<Vec<WebhookId>, BanStoreError> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No ban list on disk");
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        serde_json::from_slice(&contents).map_err(|source| BanStoreError::Format {
            path: self.path.clone(),
            source,
        })
    }

    async fn save(&self, ids: &[WebhookId]) -> Result<(), BanStoreError> {
        let json = serde_json::to_vec_pretty(ids).map_err(|source| BanStoreError::Format {
            path: self.path.clone(),
            source,
        })?;

        // write then rename so a crash never leaves a truncated list
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }
}

/// In-memory ban store, for running without a ban file and for tests.
#[derive(Debug, Default)]
pub struct MemoryBanStore {
    saved: Mutex<Vec<WebhookId>>,
}

impl MemoryBanStore {
    pub fn new(initial: Vec<WebhookId>) -> Self {
        Self {
            saved: Mutex::new(initial),
        }
    }

    /// The last list written.
    pub async fn saved(&self) -> Vec<WebhookId> {
        self.saved.lock().await.clone()
    }
}

#[async_trait]
impl BanStore for MemoryBanStore {
    async fn load(&self) -> Result<Vec<WebhookId>, BanStoreError> {
        Ok(self.saved.lock().await.clone())
    }

    async fn save(&self, ids: &[WebhookId]) -> Result<(), BanStoreError> {
        *self.saved.lock().await = ids.to_vec();
        Ok(())
    }
}

/// Set of banned webhooks.
pub struct BanRegistry {
    banned: RwLock<BTreeSet<WebhookId>>,
    store: Arc<dyn BanStore>,
    // serialises writes so the last save always carries the latest set
    persist: Mutex<()>,
}

impl BanRegistry {
    /// Load the registry from its store.
    pub async fn load(store: Arc<dyn BanStore>) -> Result<Self, BanStoreError> {
        let ids = store.load().await?;
        info!(count = ids.len(), "Loaded ban list");
        Ok(Self {
            banned: RwLock::new(ids.into_iter().collect()),
            store,
            persist: Mutex::new(()),
        })
    }

    /// An empty registry that persists nowhere.
    pub fn in_memory() -> Self {
        Self {
            banned: RwLock::new(BTreeSet::new()),
            store: Arc::new(MemoryBanStore::default()),
            persist: Mutex::new(()),
        }
    }

    pub async fn contains(&self, id: &WebhookId) -> bool {
        self.banned.read().await.contains(id)
    }

    /// Banned ids in order.
    pub async fn list(&self) -> Vec<WebhookId> {
        self.banned.read().await.iter().cloned().collect()
    }

    /// Add a webhook and persist the list.
    ///
    /// Returns `false` if it was already banned. Persistence failures are
    /// logged only.
    pub async fn insert(&self, id: &WebhookId) -> bool {
        if !self.banned.write().await.insert(id.clone()) {
            return false;
        }

        let _guard = self.persist.lock().await;
        let snapshot = self.list().await;
        if let Err(e) = self.store.save(&snapshot).await {
            warn!(webhook_id = %id, error = %e, "Failed to persist ban list");
        }
        true
    }
}
