//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::{Config, HookConfig, MountConfig, StorageProvider};
use crate::error::Result;
use crate::storage::S3Client;
use crate::upload::{
    EngineConfig, LocalStorageAdapter, MemorySessionStore, PassthroughHooks, ProtocolEngine,
    RoutedNamespaceHooks, S3StorageAdapter, SessionStore, SqliteSessionStore, StorageAdapter,
    UploadHooks,
};

/// One mounted instance of the upload protocol
#[derive(Clone)]
pub struct Mount {
    pub name: String,
    /// Base path, e.g. `/files`
    pub path: String,
    /// Externally visible origin used in `Location` headers
    pub public_url: Option<String>,
    pub engine: ProtocolEngine,
}

impl Mount {
    /// Wire the storage adapter, session store and hooks for one mount
    pub async fn build(config: &Config, mount: &MountConfig, pool: Option<&SqlitePool>) -> Result<Self> {
        let adapter: Arc<dyn StorageAdapter> = match config.storage.provider {
            StorageProvider::Local => Arc::new(LocalStorageAdapter::new(
                config.storage.local_root.join(&mount.bucket),
            )),
            _ => {
                let client = S3Client::new(&config.storage, &mount.bucket).await?;
                Arc::new(S3StorageAdapter::new(client))
            }
        };

        let store: Arc<dyn SessionStore> = match pool {
            Some(pool) => Arc::new(SqliteSessionStore::new(pool.clone(), &mount.name)),
            None => Arc::new(MemorySessionStore::new()),
        };

        let hooks: Arc<dyn UploadHooks> = match &mount.hooks {
            HookConfig::Passthrough => Arc::new(PassthroughHooks),
            HookConfig::RoutedNamespace {
                routing_key,
                namespace_root,
            } => Arc::new(RoutedNamespaceHooks::new(
                adapter.clone(),
                routing_key,
                namespace_root,
            )),
        };

        let engine = ProtocolEngine::new(EngineConfig {
            mount: mount.name.clone(),
            adapter,
            store,
            hooks,
            schema: mount.metadata.clone(),
            max_size: config.uploads.max_size,
            session_ttl: config.session_ttl(),
            completed_retention: config.completed_retention(),
        });

        tracing::info!(
            mount = %mount.name,
            path = %mount.path,
            bucket = %mount.bucket,
            durable = pool.is_some(),
            "Mounted upload endpoint"
        );

        Ok(Self {
            name: mount.name.clone(),
            path: mount.path.clone(),
            public_url: config.server.public_url.clone(),
            engine,
        })
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    mounts: Vec<Mount>,
}

impl AppState {
    pub fn new(config: Config, mounts: Vec<Mount>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, mounts }),
        }
    }

    /// Build every configured mount
    pub async fn from_config(config: Config, pool: Option<SqlitePool>) -> Result<Self> {
        let mut mounts = Vec::with_capacity(config.mounts.len());
        for mount in &config.mounts {
            mounts.push(Mount::build(&config, mount, pool.as_ref()).await?);
        }
        Ok(Self::new(config, mounts))
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.inner.mounts
    }
}
