//
// engine.rs
//
// Connected analysis engine seam: storage status, server endpoint, factory and validator
//

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::binding::ProjectBinding;
use crate::settings::ServerConnectionSettings;

/// Local storage state reported by an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStatus {
    pub stale: bool,
}

impl StorageStatus {
    pub fn fresh() -> Self {
        Self { stale: false }
    }

    pub fn stale() -> Self {
        Self { stale: true }
    }
}

/// Whether storage must be refreshed: missing or stale.
pub fn needs_update(status: Option<StorageStatus>) -> bool {
    status.map_or(true, |s| s.stale)
}

/// Parameters for reaching a server.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub base_url: String,
    pub organization: Option<String>,
    pub is_cloud: bool,
    pub token: String,
}

impl fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("base_url", &self.base_url)
            .field("organization", &self.organization)
            .field("is_cloud", &self.is_cloud)
            .field("token", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProject {
    pub key: String,
    pub name: String,
}

/// An issue known by the server for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIssue {
    pub key: String,
    pub rule_key: String,
    pub message: String,
    pub server_path: String,
    pub line: Option<u32>,
    pub resolved: bool,
}

/// One running engine, serving every project of one connection.
#[async_trait]
pub trait ConnectedEngine: Send + Sync {
    fn global_storage_status(&self) -> Option<StorageStatus>;

    fn project_storage_status(&self, project_key: &str) -> Option<StorageStatus>;

    async fn update(&self, endpoint: &ServerEndpoint) -> anyhow::Result<StorageStatus>;

    async fn update_project(&self, endpoint: &ServerEndpoint, project_key: &str) -> anyhow::Result<()>;

    /// Synchronize every listed project in one round-trip.
    async fn sync(&self, endpoint: &ServerEndpoint, project_keys: &BTreeSet<String>) -> anyhow::Result<()>;

    async fn subscribe_for_events(
        &self,
        endpoint: &ServerEndpoint,
        project_keys: &BTreeSet<String>,
    ) -> anyhow::Result<()>;

    /// Compute the mapping between local relative paths and server paths.
    fn calculate_path_prefixes(&self, project_key: &str, ide_file_paths: &[String]) -> ProjectBinding;

    async fn download_all_projects(&self, endpoint: &ServerEndpoint) -> anyhow::Result<Vec<ServerProject>>;

    async fn server_issues(
        &self,
        endpoint: &ServerEndpoint,
        project_key: &str,
        server_path: &str,
    ) -> anyhow::Result<Vec<ServerIssue>>;

    /// Stop the engine. Storage is deleted only when `delete_storage` is set.
    async fn stop(&self, delete_storage: bool) -> anyhow::Result<()>;
}

/// Creates engines for a connection id.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create_connected_engine(&self, connection_id: &str) -> anyhow::Result<Arc<dyn ConnectedEngine>>;
}

/// Checks that a connection is reachable with its credentials.
#[async_trait]
pub trait ConnectionValidator: Send + Sync {
    async fn validate(&self, settings: &ServerConnectionSettings) -> anyhow::Result<()>;
}
