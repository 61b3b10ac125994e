//
// resolver.rs
//
// Binding resolution: file -> (connection, project, engine), and reaction to settings changes
//

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashSet;
use indexmap::IndexSet;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::{Url, WorkspaceFoldersChangeEvent};

use crate::binding::{relative_path, BindingScope, ProjectBindingWrapper, ServerIssueTracker};
use crate::client::{AnalysisTrigger, EditorClient, ProgressReporter};
use crate::config::BindingConfig;
use crate::engine::{ConnectionValidator, EngineFactory, ServerIssue};
use crate::engine_cache::EngineCache;
use crate::error::{BindingError, Result};
use crate::file_scan;
use crate::folders::{FolderChanges, WorkspaceFolder, WorkspaceFolderRegistry};
use crate::result_cache::{Outcome, ResultCache};
use crate::settings::{
    connection_id_or_default, FolderSettings, ServerConnectionSettings, SettingsProvider,
    WorkspaceSettings,
};
use crate::sync::{resolve_endpoint, SyncCoordinator, SyncReport, SyncTarget};

/// External services the resolver talks to.
pub struct Collaborators {
    pub settings: Arc<dyn SettingsProvider>,
    pub engine_factory: Arc<dyn EngineFactory>,
    pub validator: Arc<dyn ConnectionValidator>,
    pub client: Arc<dyn EditorClient>,
    pub analysis: Arc<dyn AnalysisTrigger>,
}

/// Resolves files to bindings and keeps bindings and engines consistent with
/// the current settings.
///
/// Bindings are cached per [`BindingScope`]. Each scope moves through
/// unbound -> resolving -> bound or invalid, and back to resolving once
/// invalidated. Concurrent resolutions of the same scope share one
/// computation; distinct scopes resolve in parallel.
pub struct BindingResolver {
    config: BindingConfig,
    folders: Arc<WorkspaceFolderRegistry>,
    settings: Arc<dyn SettingsProvider>,
    engines: Arc<EngineCache>,
    sync: SyncCoordinator,
    validator: Arc<dyn ConnectionValidator>,
    client: Arc<dyn EditorClient>,
    analysis: Arc<dyn AnalysisTrigger>,
    bindings: ResultCache<BindingScope, Arc<ProjectBindingWrapper>>,
    /// Connections already notified about a resolution failure.
    notified: DashSet<String>,
}

impl BindingResolver {
    pub fn new(
        config: BindingConfig,
        folders: Arc<WorkspaceFolderRegistry>,
        collaborators: Collaborators,
    ) -> Self {
        let engines = Arc::new(EngineCache::new(collaborators.engine_factory));
        let sync = SyncCoordinator::new(engines.clone(), collaborators.client.clone());
        Self {
            config,
            folders,
            settings: collaborators.settings,
            engines,
            sync,
            validator: collaborators.validator,
            client: collaborators.client,
            analysis: collaborators.analysis,
            bindings: ResultCache::new(),
            notified: DashSet::new(),
        }
    }

    pub fn folders(&self) -> &Arc<WorkspaceFolderRegistry> {
        &self.folders
    }

    pub fn engines(&self) -> &Arc<EngineCache> {
        &self.engines
    }

    /// Binding of the folder owning `file`, or of the default settings for
    /// files outside every folder. `None` when unbound or unresolvable.
    pub async fn get_binding(&self, file: &Url) -> Option<Arc<ProjectBindingWrapper>> {
        let folder = self.folders.find_folder_for_file(file);
        let scope = BindingScope::for_file(file, folder.as_ref());
        self.binding_for_scope(&scope, folder.as_ref()).await
    }

    async fn binding_for_scope(
        &self,
        scope: &BindingScope,
        folder: Option<&WorkspaceFolder>,
    ) -> Option<Arc<ProjectBindingWrapper>> {
        let this = self;
        self.bindings
            .get_or_compute(scope, move || this.compute_binding(scope, folder))
            .await
    }

    async fn compute_binding(
        &self,
        scope: &BindingScope,
        folder: Option<&WorkspaceFolder>,
    ) -> Outcome<Arc<ProjectBindingWrapper>> {
        let folder_settings = self.settings.folder_settings(folder);
        let Some((connection_id, project_key)) = folder_settings.binding() else {
            log::debug!("No binding configured for '{}'", scope.display_path());
            return Outcome::Cached(None);
        };

        let snapshot = self.settings.current_settings();
        let Some(connection) = snapshot.connection(connection_id) else {
            log::error!("{}", BindingError::UnknownConnection(connection_id.to_string()));
            log::error!("Invalid binding for '{}'", scope.display_path());
            return Outcome::Cached(None);
        };

        let started = match self.engines.get_or_start(connection_id).await {
            Ok(started) => started,
            Err(BindingError::StartAborted(_)) => return Outcome::Transient(None),
            Err(_) => {
                self.notify_once(
                    connection_id,
                    format!(
                        "Unable to start the connected engine for '{}'. Look at the output for details.",
                        connection_id
                    ),
                )
                .await;
                return Outcome::Cached(None);
            }
        };

        let endpoint = resolve_endpoint(self.client.as_ref(), connection).await;
        if let Err(e) = self
            .sync
            .refresh_if_stale(connection_id, started.engine.as_ref(), &endpoint, project_key)
            .await
        {
            log::error!("{}", e);
            if let Some(reason) = std::error::Error::source(&e) {
                log::debug!("Cause: {}", reason);
            }
            self.notify_once(
                connection_id,
                format!(
                    "Binding update failed for the server: {}. Look at the output for details.",
                    connection_id
                ),
            )
            .await;
            return Outcome::Cached(None);
        }

        let max_depth = if scope.is_folder() {
            self.config.path_scan_max_depth
        } else {
            1
        };
        let ide_paths =
            file_scan::scan_ide_paths(scope.base_uri(), max_depth, self.config.path_scan_max_files).await;
        let binding = started.engine.calculate_path_prefixes(project_key, &ide_paths);
        log::debug!("Resolved binding {} for folder {}", binding, scope.display_path());

        if started.fresh {
            let mut project_keys = self.project_keys_for_connection(connection_id);
            project_keys.insert(project_key.to_string());
            if let Err(e) = started.engine.subscribe_for_events(&endpoint, &project_keys).await {
                log::warn!(
                    "Unable to subscribe for server events of '{}': {:#}",
                    connection_id,
                    e
                );
            }
        }

        // The connection may have been retired while this resolution was waiting
        let still_current = self
            .engines
            .get_running(connection_id)
            .map_or(false, |running| Arc::ptr_eq(&running, &started.engine))
            && self.settings.current_settings().connection(connection_id).is_some();
        if !still_current {
            log::debug!(
                "Connection '{}' was retired while resolving '{}'",
                connection_id,
                scope.display_path()
            );
            return Outcome::Transient(None);
        }

        self.notified.remove(connection_id);
        let issue_tracker = ServerIssueTracker::new(started.engine.clone(), endpoint, binding.clone());
        Outcome::Cached(Some(Arc::new(ProjectBindingWrapper {
            connection_id: connection_id.to_string(),
            binding,
            engine: started.engine,
            issue_tracker,
        })))
    }

    async fn notify_once(&self, connection_id: &str, message: String) {
        if !self.config.notify_binding_failures {
            return;
        }
        if self.notified.insert(connection_id.to_string()) {
            self.client.show_error(&message).await;
        }
    }

    /// Project keys bound to `connection_id` by any registered folder or the default settings.
    fn project_keys_for_connection(&self, connection_id: &str) -> BTreeSet<String> {
        self.bound_targets()
            .into_iter()
            .filter(|t| t.connection_id == connection_id)
            .map(|t| t.project_key)
            .collect()
    }

    /// Every bound folder, then the default binding.
    fn bound_targets(&self) -> Vec<SyncTarget> {
        let folders = self.folders.all();
        folders
            .iter()
            .map(Some)
            .chain(std::iter::once(None))
            .filter_map(|folder| {
                let settings = self.settings.folder_settings(folder);
                let (connection_id, project_key) = settings.binding()?;
                Some(SyncTarget {
                    folder: folder.cloned(),
                    connection_id: connection_id.to_string(),
                    project_key: project_key.to_string(),
                })
            })
            .collect()
    }

    fn has_cached_binding_for(&self, connection_id: &str) -> bool {
        self.bindings
            .ready_entries()
            .iter()
            .any(|(_, wrapper)| wrapper.as_ref().map_or(false, |w| w.connection_id == connection_id))
    }

    /// Connection the current settings bind `scope` to.
    fn scope_connection(&self, scope: &BindingScope) -> Option<String> {
        let settings = match scope {
            BindingScope::Folder(uri) => {
                let folder = self
                    .folders
                    .get(uri)
                    .unwrap_or_else(|| WorkspaceFolder::new(uri.clone()));
                self.settings.folder_settings(Some(&folder))
            }
            BindingScope::OutsideWorkspace(_) => self.settings.folder_settings(None),
        };
        settings.binding().map(|(connection_id, _)| connection_id.to_string())
    }

    /// Whether a cached binding, or a resolution in progress, uses `connection_id`.
    fn connection_in_use(&self, connection_id: &str) -> bool {
        self.has_cached_binding_for(connection_id)
            || self
                .bindings
                .pending_keys()
                .iter()
                .any(|scope| self.scope_connection(scope).as_deref() == Some(connection_id))
    }

    /// Drop the engine of `connection_id` and every binding using it, then
    /// stop the engine. Resolutions in progress for scopes bound to that
    /// connection are detached. Returns the scopes whose binding was dropped.
    async fn retire_connection(&self, connection_id: &str) -> Vec<BindingScope> {
        let mut purged = Vec::new();
        let detach = || {
            purged = self
                .bindings
                .ready_entries()
                .into_iter()
                .filter(|(_, w)| w.as_ref().map_or(false, |w| w.connection_id == connection_id))
                .map(|(scope, _)| scope)
                .collect();
            self.bindings.retain(|scope, outcome| match outcome {
                Some(wrapper) => wrapper
                    .as_ref()
                    .map_or(true, |w| w.connection_id != connection_id),
                None => self.scope_connection(scope).as_deref() != Some(connection_id),
            });
        };
        // Failures are logged by the engine cache
        let _ = self.engines.retire(connection_id, detach).await;
        purged
    }

    async fn reanalyze(&self, scopes: impl IntoIterator<Item = BindingScope>) {
        let mut seen = HashSet::new();
        let mut outside_done = false;
        for scope in scopes {
            match scope {
                BindingScope::Folder(uri) => {
                    if !seen.insert(uri.clone()) {
                        continue;
                    }
                    let folder = self
                        .folders
                        .get(&uri)
                        .unwrap_or_else(|| WorkspaceFolder::new(uri));
                    self.analysis.analyze_all_open_files_in_folder(Some(&folder)).await;
                }
                BindingScope::OutsideWorkspace(_) => {
                    if !outside_done {
                        outside_done = true;
                        self.analysis.analyze_all_open_files_in_folder(None).await;
                    }
                }
            }
        }
    }

    /// React to a change of one folder's binding settings (`folder` is `None`
    /// for the default settings). The first event (`old` is `None`) and
    /// unchanged settings are ignored, as are scopes with nothing cached.
    pub async fn on_folder_settings_changed(
        &self,
        folder: Option<&WorkspaceFolder>,
        old: Option<&FolderSettings>,
        new: &FolderSettings,
    ) {
        let Some(old) = old else {
            return;
        };
        if old == new {
            return;
        }

        match folder {
            Some(folder) => {
                if self
                    .bindings
                    .invalidate(&BindingScope::Folder(folder.uri.clone()))
                    .is_none()
                {
                    return;
                }
                log::info!("Workspace '{}' unbound", folder);
            }
            None => {
                if self
                    .bindings
                    .invalidate_where(BindingScope::is_outside_workspace)
                    .is_empty()
                {
                    return;
                }
                log::info!("All files outside workspace are now unbound");
            }
        }

        if let Some((old_connection_id, _)) = old.binding() {
            let kept_by_new = new.binding().map_or(false, |(id, _)| id == old_connection_id);
            if !kept_by_new && !self.connection_in_use(old_connection_id) {
                self.retire_connection(old_connection_id).await;
            }
        }
        if let Some(connection_id) = new.connection_id.as_deref() {
            self.notified.remove(connection_id);
        }

        self.analysis.analyze_all_open_files_in_folder(folder).await;
    }

    /// React to a new connection settings snapshot.
    ///
    /// Connections that disappeared or now point at a different server drop
    /// their bindings and engine. New or modified connections are validated
    /// once each; a failed validation drops them too and is reported to the
    /// user in a single message.
    pub async fn on_workspace_settings_changed(
        &self,
        old: Option<&WorkspaceSettings>,
        new: &WorkspaceSettings,
    ) {
        let Some(old) = old else {
            return;
        };
        if old == new {
            return;
        }

        let mut affected: IndexSet<String> = IndexSet::new();
        for (connection_id, previous) in &old.connections {
            match new.connection(connection_id) {
                None => {
                    log::info!("Connection '{}' was removed", connection_id);
                    affected.insert(connection_id.clone());
                }
                Some(current) if !current.same_server(previous) => {
                    log::info!("Connection '{}' now targets another server", connection_id);
                    affected.insert(connection_id.clone());
                }
                Some(_) => {}
            }
        }

        let mut failed = Vec::new();
        for (connection_id, current) in &new.connections {
            if old.connection(connection_id) == Some(current) {
                continue;
            }
            self.notified.remove(connection_id.as_str());
            if let Err(reason) = self.validator.validate(current).await {
                let e = BindingError::ConnectionValidation {
                    connection_id: connection_id.clone(),
                    reason,
                };
                log::error!("{}", e);
                if let Some(reason) = std::error::Error::source(&e) {
                    log::debug!("Cause: {}", reason);
                }
                failed.push(connection_id.clone());
                affected.insert(connection_id.clone());
            }
        }

        let mut purged = Vec::new();
        for connection_id in &affected {
            if self.engines.is_running(connection_id) || self.has_cached_binding_for(connection_id) {
                purged.extend(self.retire_connection(connection_id).await);
            }
        }
        self.reanalyze(purged).await;

        if !failed.is_empty() && self.config.notify_binding_failures {
            self.client
                .show_error(&format!(
                    "Connection test failed for the following connection(s): {}. Look at the output for details.",
                    failed.join(", ")
                ))
                .await;
        }
    }

    /// Synchronize storage of every bound connection, then refresh the
    /// bindings and diagnostics of the folders that were synchronized.
    pub async fn update_all_bindings(
        &self,
        cancel: &CancellationToken,
        progress: Option<&dyn ProgressReporter>,
    ) -> SyncReport {
        let snapshot = self.settings.current_settings();
        let targets = self.bound_targets();
        let report = self.sync.sync_all(&snapshot, targets, cancel, progress).await;

        for target in &report.refreshed {
            match &target.folder {
                Some(folder) => {
                    self.bindings.invalidate(&BindingScope::Folder(folder.uri.clone()));
                }
                None => {
                    self.bindings.invalidate_where(BindingScope::is_outside_workspace);
                }
            }
            self.analysis
                .analyze_all_open_files_in_folder(target.folder.as_ref())
                .await;
        }
        report
    }

    /// Force an update of one project's storage.
    pub async fn update_binding(&self, connection_id: &str, project_key: &str) -> Result<()> {
        let snapshot = self.settings.current_settings();
        let connection = snapshot
            .connection(connection_id)
            .ok_or_else(|| BindingError::UnknownConnection(connection_id.to_string()))?;
        self.sync.update_binding(connection, project_key).await
    }

    /// Stop every engine and forget every binding.
    pub async fn shutdown(&self) -> Vec<BindingError> {
        self.bindings.drain();
        self.engines.stop_all().await
    }

    /// Apply a folder change event and keep server-event subscriptions in sync.
    ///
    /// Engines left without any binding by removed folders are stopped.
    pub async fn did_change_workspace_folders(&self, event: WorkspaceFoldersChangeEvent) -> FolderChanges {
        let changes = self.folders.on_folders_changed(event);
        let mut released: IndexSet<String> = IndexSet::new();
        for folder in &changes.removed {
            if let Some(Some(wrapper)) = self
                .bindings
                .invalidate(&BindingScope::Folder(folder.uri.clone()))
            {
                released.insert(wrapper.connection_id.clone());
            }
        }
        for connection_id in &released {
            if !self.connection_in_use(connection_id) {
                self.retire_connection(connection_id).await;
            }
        }
        self.subscribe_for_server_events(&changes.added, &changes.removed)
            .await;
        changes
    }

    /// Re-subscribe running engines of the connections used by the given
    /// folders with their complete current project set.
    pub async fn subscribe_for_server_events(&self, added: &[WorkspaceFolder], removed: &[WorkspaceFolder]) {
        let mut connections: IndexSet<String> = IndexSet::new();
        for folder in added.iter().chain(removed) {
            if let Some((connection_id, _)) = self.settings.folder_settings(Some(folder)).binding() {
                connections.insert(connection_id.to_string());
            }
        }

        let snapshot = self.settings.current_settings();
        for connection_id in connections {
            let Some(engine) = self.engines.get_running(&connection_id) else {
                continue;
            };
            let Some(connection) = snapshot.connection(&connection_id) else {
                continue;
            };
            let endpoint = resolve_endpoint(self.client.as_ref(), connection).await;
            let project_keys = self.project_keys_for_connection(&connection_id);
            if let Err(e) = engine.subscribe_for_events(&endpoint, &project_keys).await {
                log::warn!(
                    "Unable to subscribe for server events of '{}': {:#}",
                    connection_id,
                    e
                );
            }
        }
    }

    /// Map a server path to an existing local file through the cached bindings.
    pub fn server_path_to_file_uri(&self, server_path: &str) -> Option<Url> {
        self.bindings
            .ready_entries()
            .into_iter()
            .filter_map(|(scope, wrapper)| {
                let ide_path = wrapper?.binding.server_path_to_ide_path(server_path)?;
                scope.resolve(&ide_path)
            })
            .find(|uri| match uri.to_file_path() {
                Ok(path) => path.exists(),
                Err(_) => true,
            })
    }

    /// `{project key -> project name}` of a connection (`None` for the default connection).
    pub async fn get_remote_projects(&self, connection_id: Option<&str>) -> Result<BTreeMap<String, String>> {
        let connection_id = connection_id_or_default(connection_id);
        let snapshot = self.settings.current_settings();
        let connection = snapshot
            .connection(connection_id)
            .ok_or_else(|| BindingError::ConnectionNotFound(connection_id.to_string()))?;

        let started = self.engines.get_or_start(connection_id).await?;
        let endpoint = resolve_endpoint(self.client.as_ref(), connection).await;
        let projects = started
            .engine
            .download_all_projects(&endpoint)
            .await
            .map_err(|reason| BindingError::RemoteList {
                connection_id: connection_id.to_string(),
                reason,
            })?;
        Ok(projects.into_iter().map(|p| (p.key, p.name)).collect())
    }

    pub fn get_server_connection_settings_for_url(&self, url: &str) -> Option<ServerConnectionSettings> {
        self.settings.current_settings().connection_for_url(url).cloned()
    }

    /// Whether some cached binding resolved.
    pub fn uses_connected_mode(&self) -> bool {
        self.bindings
            .ready_entries()
            .iter()
            .any(|(_, wrapper)| wrapper.is_some())
    }

    /// Whether some cached binding uses the cloud server.
    pub fn uses_cloud(&self) -> bool {
        let snapshot = self.settings.current_settings();
        self.bindings.ready_entries().iter().any(|(_, wrapper)| {
            wrapper
                .as_ref()
                .and_then(|w| snapshot.connection(&w.connection_id))
                .map_or(false, |c| c.is_cloud())
        })
    }

    /// Server issues of `file`; empty when the file is unbound.
    pub async fn server_issues_for_file(&self, file: &Url) -> anyhow::Result<Vec<ServerIssue>> {
        let folder = self.folders.find_folder_for_file(file);
        let scope = BindingScope::for_file(file, folder.as_ref());
        let Some(wrapper) = self.binding_for_scope(&scope, folder.as_ref()).await else {
            return Ok(Vec::new());
        };
        let Some(ide_path) = relative_path(scope.base_uri(), file) else {
            return Ok(Vec::new());
        };
        wrapper.issue_tracker.server_issues(&ide_path).await
    }

    /// Cached binding of a scope, without resolving.
    pub fn cached_binding(&self, scope: &BindingScope) -> Option<Option<Arc<ProjectBindingWrapper>>> {
        self.bindings.cached(scope)
    }
}

#[cfg(test)]
#[path = "resolver_tests.rs"]
mod tests;
