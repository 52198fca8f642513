//! Wiring of the whole sync core.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use courier_store::{Database, LocalCache};

use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::offline_first::OfflineFirstRepository;
use crate::remote::RemoteStore;
use crate::repository::RealtimeChatRepository;
use crate::source::{LocalChatSource, RemoteChatSource};
use crate::sync_manager::SyncManager;

/// Everything an application needs, built from one configuration.
///
/// Dropping the runtime stops the replay worker.
pub struct ChatRuntime {
    cache: LocalCache,
    connectivity: Connectivity,
    sync: SyncManager,
    offline_first: OfflineFirstRepository,
    chats: RealtimeChatRepository,
    worker: Option<JoinHandle<()>>,
}

impl ChatRuntime {
    /// Open the database named by `config` and start the replay worker.
    /// Must be called from within a tokio runtime.
    pub fn open(
        config: &SyncConfig,
        remote: Arc<dyn RemoteStore>,
        connectivity: Connectivity,
    ) -> Result<Self> {
        let db = match &config.database_path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        let mut runtime = Self::with_cache(config, LocalCache::new(db), remote, connectivity);
        runtime.start();
        Ok(runtime)
    }

    /// Build on an existing cache without starting the replay worker.
    pub fn with_cache(
        config: &SyncConfig,
        cache: LocalCache,
        remote: Arc<dyn RemoteStore>,
        connectivity: Connectivity,
    ) -> Self {
        let remote_source = RemoteChatSource::new(remote, config.typing_ttl);
        let local_source = LocalChatSource::new(cache.clone(), config.typing_ttl);

        let sync = SyncManager::new(
            cache.clone(),
            Arc::new(remote_source.clone()),
            connectivity.clone(),
            config.retry.clone(),
            config.network_timeout,
        );
        let offline_first = OfflineFirstRepository::new(
            cache.clone(),
            connectivity.clone(),
            sync.clone(),
            config.network_timeout,
        );
        let chats = RealtimeChatRepository::new(local_source, remote_source, offline_first.clone());

        Self {
            cache,
            connectivity,
            sync,
            offline_first,
            chats,
            worker: None,
        }
    }

    /// Start the replay worker.  It drains a queue left from a previous
    /// session right away when online.  Calling this twice has no effect.
    pub fn start(&mut self) {
        if self.worker.is_none() {
            info!(online = self.connectivity.is_online(), "starting replay worker");
            self.worker = Some(self.sync.start());
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn sync_manager(&self) -> &SyncManager {
        &self.sync
    }

    pub fn offline_first(&self) -> &OfflineFirstRepository {
        &self.offline_first
    }

    pub fn chats(&self) -> &RealtimeChatRepository {
        &self.chats
    }
}

impl Drop for ChatRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
