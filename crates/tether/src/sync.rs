//
// sync.rs
//
// Storage synchronization: on-demand refresh and bulk update across connections
//

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::client::{EditorClient, ProgressReporter};
use crate::engine::{needs_update, ConnectedEngine, ServerEndpoint};
use crate::engine_cache::EngineCache;
use crate::error::{BindingError, Result};
use crate::folders::WorkspaceFolder;
use crate::settings::{ServerConnectionSettings, WorkspaceSettings};

/// One bound folder (or the default binding when `folder` is `None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub folder: Option<WorkspaceFolder>,
    pub connection_id: String,
    pub project_key: String,
}

/// Outcome of a bulk synchronization.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Targets whose connection was fully synchronized.
    pub refreshed: Vec<SyncTarget>,
    /// Connection ids that failed, in processing order.
    pub failed: Vec<String>,
    /// Whether processing stopped early on cancellation.
    pub cancelled: bool,
}

/// Endpoint for `connection`, asking the editor for a token when none is configured.
pub(crate) async fn resolve_endpoint(
    client: &dyn EditorClient,
    connection: &ServerConnectionSettings,
) -> ServerEndpoint {
    let mut endpoint = connection.endpoint();
    if endpoint.token.is_empty() {
        match client.get_token(&connection.connection_id).await {
            Ok(token) => endpoint.token = token,
            Err(e) => log::warn!(
                "Unable to retrieve token for connection '{}': {:#}",
                connection.connection_id,
                e
            ),
        }
    }
    endpoint
}

pub struct SyncCoordinator {
    engines: Arc<EngineCache>,
    client: Arc<dyn EditorClient>,
    /// Serializes storage updates per connection.
    update_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SyncCoordinator {
    pub fn new(engines: Arc<EngineCache>, client: Arc<dyn EditorClient>) -> Self {
        Self {
            engines,
            client,
            update_locks: DashMap::new(),
        }
    }

    fn update_lock(&self, connection_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.update_locks
            .entry(connection_id.to_string())
            .or_default()
            .clone()
    }

    /// Update global storage if missing or stale, then the project's storage
    /// if missing or stale. Each check is independent.
    pub async fn refresh_if_stale(
        &self,
        connection_id: &str,
        engine: &dyn ConnectedEngine,
        endpoint: &ServerEndpoint,
        project_key: &str,
    ) -> Result<()> {
        let lock = self.update_lock(connection_id);
        let _guard = lock.lock().await;
        let wrap = |reason: anyhow::Error| BindingError::StorageUpdate {
            connection_id: connection_id.to_string(),
            reason,
        };

        if needs_update(engine.global_storage_status()) {
            log::info!("Updating global storage for connection '{}'", connection_id);
            engine.update(endpoint).await.map_err(wrap)?;
        }
        if needs_update(engine.project_storage_status(project_key)) {
            log::info!(
                "Updating storage of project '{}' for connection '{}'",
                project_key,
                connection_id
            );
            engine.update_project(endpoint, project_key).await.map_err(wrap)?;
        }
        Ok(())
    }

    /// Unconditionally update global and project storage for one binding.
    pub async fn update_binding(&self, connection: &ServerConnectionSettings, project_key: &str) -> Result<()> {
        let connection_id = connection.connection_id.as_str();
        let started = self.engines.get_or_start(connection_id).await?;
        let endpoint = resolve_endpoint(self.client.as_ref(), connection).await;

        let lock = self.update_lock(connection_id);
        let _guard = lock.lock().await;
        let wrap = |reason: anyhow::Error| BindingError::StorageUpdate {
            connection_id: connection_id.to_string(),
            reason,
        };
        started.engine.update(&endpoint).await.map_err(wrap)?;
        started
            .engine
            .update_project(&endpoint, project_key)
            .await
            .map_err(wrap)?;
        Ok(())
    }

    /// Synchronize every connection referenced by `targets`.
    ///
    /// Per connection: one global update, one project update per distinct
    /// project key, one sync with the full key set. A failing connection is
    /// recorded and the others continue; failures are reported to the user
    /// in a single message. Cancellation is checked between connections.
    pub async fn sync_all(
        &self,
        settings: &WorkspaceSettings,
        targets: Vec<SyncTarget>,
        cancel: &CancellationToken,
        progress: Option<&dyn ProgressReporter>,
    ) -> SyncReport {
        let mut by_connection: IndexMap<String, Vec<SyncTarget>> = IndexMap::new();
        for target in targets {
            by_connection
                .entry(target.connection_id.clone())
                .or_default()
                .push(target);
        }

        let mut report = SyncReport::default();
        let total = by_connection.len();
        for (index, (connection_id, targets)) in by_connection.into_iter().enumerate() {
            if cancel.is_cancelled() {
                log::info!("Binding update cancelled");
                report.cancelled = true;
                break;
            }

            let Some(connection) = settings.connection(&connection_id) else {
                log::error!("{}", BindingError::UnknownConnection(connection_id.clone()));
                continue;
            };

            if let Some(progress) = progress {
                let percentage = (index * 100 / total.max(1)) as u32;
                progress.report(
                    &format!("Updating binding for connection '{}'", connection_id),
                    Some(percentage),
                );
            }

            let project_keys: BTreeSet<String> =
                targets.iter().map(|t| t.project_key.clone()).collect();
            match self.sync_connection(connection, &project_keys).await {
                Ok(()) => report.refreshed.extend(targets),
                Err(e) => {
                    log::error!("{}", e);
                    if let Some(reason) = std::error::Error::source(&e) {
                        log::debug!("Cause: {}", reason);
                    }
                    report.failed.push(connection_id);
                }
            }
        }

        if let Some(progress) = progress {
            progress.report("Binding update finished", Some(100));
        }

        if !report.failed.is_empty() {
            self.client
                .show_error(&format!(
                    "Binding update failed for the following connection(s): {}. Look at the output for details.",
                    report.failed.join(", ")
                ))
                .await;
        }

        report
    }

    async fn sync_connection(
        &self,
        connection: &ServerConnectionSettings,
        project_keys: &BTreeSet<String>,
    ) -> Result<()> {
        let connection_id = connection.connection_id.as_str();
        let started = self.engines.get_or_start(connection_id).await?;
        let endpoint = resolve_endpoint(self.client.as_ref(), connection).await;

        let lock = self.update_lock(connection_id);
        let _guard = lock.lock().await;
        let wrap = |reason: anyhow::Error| BindingError::StorageUpdate {
            connection_id: connection_id.to_string(),
            reason,
        };

        started.engine.update(&endpoint).await.map_err(wrap)?;
        for project_key in project_keys {
            started
                .engine
                .update_project(&endpoint, project_key)
                .await
                .map_err(wrap)?;
        }
        started.engine.sync(&endpoint, project_keys).await.map_err(wrap)?;
        Ok(())
    }
}
