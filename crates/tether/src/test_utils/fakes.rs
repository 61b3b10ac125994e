//! Recording fakes for every collaborator of the binding layer.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::Notify;
use tower_lsp::lsp_types::Url;

use crate::binding::ProjectBinding;
use crate::client::{AnalysisTrigger, EditorClient, ProgressReporter};
use crate::engine::{
    ConnectedEngine, ConnectionValidator, EngineFactory, ServerEndpoint, ServerIssue,
    ServerProject, StorageStatus,
};
use crate::folders::WorkspaceFolder;
use crate::settings::{FolderSettings, ServerConnectionSettings, SettingsProvider, WorkspaceSettings};

/// A call received by [`FakeEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Update,
    UpdateProject(String),
    Sync(BTreeSet<String>),
    SubscribeForEvents(BTreeSet<String>),
    CalculatePathPrefixes(String, Vec<String>),
    DownloadAllProjects,
    ServerIssues(String, String),
    Stop(bool),
}

/// Engine with configurable storage state and failures.
///
/// Storage starts fresh. Successful updates mark the updated storage fresh.
#[derive(Debug)]
pub struct FakeEngine {
    pub connection_id: String,
    global_status: Mutex<Option<StorageStatus>>,
    project_status: Mutex<HashMap<String, Option<StorageStatus>>>,
    path_prefixes: Mutex<HashMap<String, ProjectBinding>>,
    projects: Mutex<Vec<ServerProject>>,
    issues: Mutex<Vec<ServerIssue>>,
    calls: Mutex<Vec<EngineCall>>,
    update_hold: Mutex<Option<Arc<Notify>>>,
    fail_update: AtomicBool,
    fail_update_project: AtomicBool,
    fail_sync: AtomicBool,
    fail_download: AtomicBool,
    fail_stop: AtomicBool,
}

impl FakeEngine {
    pub fn new(connection_id: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            global_status: Mutex::new(Some(StorageStatus::fresh())),
            project_status: Mutex::new(HashMap::new()),
            path_prefixes: Mutex::new(HashMap::new()),
            projects: Mutex::new(Vec::new()),
            issues: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            update_hold: Mutex::new(None),
            fail_update: AtomicBool::new(false),
            fail_update_project: AtomicBool::new(false),
            fail_sync: AtomicBool::new(false),
            fail_download: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
        }
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn updated_projects(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::UpdateProject(key) => Some(key),
                _ => None,
            })
            .collect()
    }

    pub fn sync_calls(&self) -> Vec<BTreeSet<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Sync(keys) => Some(keys),
                _ => None,
            })
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<BTreeSet<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::SubscribeForEvents(keys) => Some(keys),
                _ => None,
            })
            .collect()
    }

    /// `(project_key, ide_file_paths)` of each path-prefix computation.
    pub fn path_prefix_requests(&self) -> Vec<(String, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::CalculatePathPrefixes(key, paths) => Some((key, paths)),
                _ => None,
            })
            .collect()
    }

    pub fn stop_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::Stop(_)))
    }

    pub fn set_global_status(&self, status: Option<StorageStatus>) {
        *self.global_status.lock().unwrap() = status;
    }

    pub fn set_project_status(&self, project_key: &str, status: Option<StorageStatus>) {
        self.project_status
            .lock()
            .unwrap()
            .insert(project_key.to_string(), status);
    }

    pub fn set_path_prefixes(&self, project_key: &str, server_prefix: &str, ide_prefix: &str) {
        self.path_prefixes.lock().unwrap().insert(
            project_key.to_string(),
            ProjectBinding::new(project_key, server_prefix, ide_prefix),
        );
    }

    pub fn set_projects(&self, projects: Vec<ServerProject>) {
        *self.projects.lock().unwrap() = projects;
    }

    pub fn set_issues(&self, issues: Vec<ServerIssue>) {
        *self.issues.lock().unwrap() = issues;
    }

    /// Make the next `update` wait until the returned handle is notified.
    /// The call is recorded before it waits.
    pub fn hold_next_update(&self) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        *self.update_hold.lock().unwrap() = Some(release.clone());
        release
    }

    pub fn set_fail_update(&self, fail: bool) {
        self.fail_update.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_update_project(&self, fail: bool) {
        self.fail_update_project.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_download(&self, fail: bool) {
        self.fail_download.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectedEngine for FakeEngine {
    fn global_storage_status(&self) -> Option<StorageStatus> {
        *self.global_status.lock().unwrap()
    }

    fn project_storage_status(&self, project_key: &str) -> Option<StorageStatus> {
        self.project_status
            .lock()
            .unwrap()
            .get(project_key)
            .copied()
            .unwrap_or(Some(StorageStatus::fresh()))
    }

    async fn update(&self, _endpoint: &ServerEndpoint) -> anyhow::Result<StorageStatus> {
        self.record(EngineCall::Update);
        let hold = self.update_hold.lock().unwrap().take();
        if let Some(release) = hold {
            release.notified().await;
        }
        tokio::task::yield_now().await;
        if self.fail_update.load(Ordering::SeqCst) {
            anyhow::bail!("Boom");
        }
        self.set_global_status(Some(StorageStatus::fresh()));
        Ok(StorageStatus::fresh())
    }

    async fn update_project(&self, _endpoint: &ServerEndpoint, project_key: &str) -> anyhow::Result<()> {
        self.record(EngineCall::UpdateProject(project_key.to_string()));
        if self.fail_update_project.load(Ordering::SeqCst) {
            anyhow::bail!("Boom at project update");
        }
        self.set_project_status(project_key, Some(StorageStatus::fresh()));
        Ok(())
    }

    async fn sync(&self, _endpoint: &ServerEndpoint, project_keys: &BTreeSet<String>) -> anyhow::Result<()> {
        self.record(EngineCall::Sync(project_keys.clone()));
        if self.fail_sync.load(Ordering::SeqCst) {
            anyhow::bail!("Boom at sync");
        }
        Ok(())
    }

    async fn subscribe_for_events(
        &self,
        _endpoint: &ServerEndpoint,
        project_keys: &BTreeSet<String>,
    ) -> anyhow::Result<()> {
        self.record(EngineCall::SubscribeForEvents(project_keys.clone()));
        Ok(())
    }

    fn calculate_path_prefixes(&self, project_key: &str, ide_file_paths: &[String]) -> ProjectBinding {
        self.record(EngineCall::CalculatePathPrefixes(
            project_key.to_string(),
            ide_file_paths.to_vec(),
        ));
        self.path_prefixes
            .lock()
            .unwrap()
            .get(project_key)
            .cloned()
            .unwrap_or_else(|| ProjectBinding::new(project_key, "", ""))
    }

    async fn download_all_projects(&self, _endpoint: &ServerEndpoint) -> anyhow::Result<Vec<ServerProject>> {
        self.record(EngineCall::DownloadAllProjects);
        if self.fail_download.load(Ordering::SeqCst) {
            anyhow::bail!("Failed to download");
        }
        Ok(self.projects.lock().unwrap().clone())
    }

    async fn server_issues(
        &self,
        _endpoint: &ServerEndpoint,
        project_key: &str,
        server_path: &str,
    ) -> anyhow::Result<Vec<ServerIssue>> {
        self.record(EngineCall::ServerIssues(
            project_key.to_string(),
            server_path.to_string(),
        ));
        Ok(self
            .issues
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.server_path == server_path)
            .cloned()
            .collect())
    }

    async fn stop(&self, delete_storage: bool) -> anyhow::Result<()> {
        self.record(EngineCall::Stop(delete_storage));
        if self.fail_stop.load(Ordering::SeqCst) {
            anyhow::bail!("Boom at stop");
        }
        Ok(())
    }
}

/// Hands out [`FakeEngine`]s, prepared in advance or created on demand.
#[derive(Debug, Default)]
pub struct FakeEngineFactory {
    prepared: Mutex<HashMap<String, VecDeque<Arc<FakeEngine>>>>,
    created: Mutex<Vec<(String, Arc<FakeEngine>)>>,
    attempts: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    start_hold: Mutex<Option<Arc<Notify>>>,
}

impl FakeEngineFactory {
    /// Queue an engine to be returned by the next start of `connection_id`.
    pub fn prepare(&self, connection_id: &str) -> Arc<FakeEngine> {
        let engine = Arc::new(FakeEngine::new(connection_id));
        self.prepared
            .lock()
            .unwrap()
            .entry(connection_id.to_string())
            .or_default()
            .push_back(engine.clone());
        engine
    }

    /// Make the next start wait until the returned handle is notified.
    /// The attempt is recorded before it waits.
    pub fn hold_next_start(&self) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        *self.start_hold.lock().unwrap() = Some(release.clone());
        release
    }

    pub fn fail_for(&self, connection_id: &str) {
        self.failing.lock().unwrap().insert(connection_id.to_string());
    }

    pub fn succeed_for(&self, connection_id: &str) {
        self.failing.lock().unwrap().remove(connection_id);
    }

    /// Most recently created engine for `connection_id`.
    pub fn engine(&self, connection_id: &str) -> Option<Arc<FakeEngine>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == connection_id)
            .map(|(_, engine)| engine.clone())
    }

    pub fn created(&self, connection_id: &str) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == connection_id)
            .count()
    }

    pub fn total_created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn attempts(&self, connection_id: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == connection_id)
            .count()
    }
}

#[async_trait]
impl EngineFactory for FakeEngineFactory {
    async fn create_connected_engine(&self, connection_id: &str) -> anyhow::Result<Arc<dyn ConnectedEngine>> {
        self.attempts.lock().unwrap().push(connection_id.to_string());
        let hold = self.start_hold.lock().unwrap().take();
        if let Some(release) = hold {
            release.notified().await;
        }
        tokio::task::yield_now().await;
        if self.failing.lock().unwrap().contains(connection_id) {
            anyhow::bail!("Unable to start engine for '{}'", connection_id);
        }
        let prepared = self
            .prepared
            .lock()
            .unwrap()
            .get_mut(connection_id)
            .and_then(|queue| queue.pop_front());
        let engine = prepared.unwrap_or_else(|| Arc::new(FakeEngine::new(connection_id)));
        self.created
            .lock()
            .unwrap()
            .push((connection_id.to_string(), engine.clone()));
        Ok(engine)
    }
}

/// In-memory settings with a read counter on folder settings.
#[derive(Debug, Default)]
pub struct FakeSettings {
    workspace: RwLock<Arc<WorkspaceSettings>>,
    folders: RwLock<HashMap<Url, FolderSettings>>,
    default_folder: RwLock<FolderSettings>,
    folder_reads: AtomicUsize,
}

impl FakeSettings {
    pub fn set_workspace(&self, settings: WorkspaceSettings) {
        *self.workspace.write().unwrap() = Arc::new(settings);
    }

    pub fn add_connection(&self, connection: ServerConnectionSettings) {
        let mut settings = (**self.workspace.read().unwrap()).clone();
        settings
            .connections
            .insert(connection.connection_id.clone(), connection);
        self.set_workspace(settings);
    }

    pub fn set_folder(&self, folder: &Url, settings: FolderSettings) {
        self.folders.write().unwrap().insert(folder.clone(), settings);
    }

    pub fn set_default(&self, settings: FolderSettings) {
        *self.default_folder.write().unwrap() = settings;
    }

    pub fn folder_reads(&self) -> usize {
        self.folder_reads.load(Ordering::SeqCst)
    }
}

impl SettingsProvider for FakeSettings {
    fn current_settings(&self) -> Arc<WorkspaceSettings> {
        self.workspace.read().unwrap().clone()
    }

    fn folder_settings(&self, folder: Option<&WorkspaceFolder>) -> FolderSettings {
        self.folder_reads.fetch_add(1, Ordering::SeqCst);
        match folder {
            Some(folder) => self
                .folders
                .read()
                .unwrap()
                .get(&folder.uri)
                .cloned()
                .unwrap_or_default(),
            None => self.default_folder.read().unwrap().clone(),
        }
    }
}

/// How [`RecordingClient`] answers an SCM-ignore query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScmAnswer {
    Ignored(bool),
    Unknown,
    Fail,
    /// Never answers.
    Never,
}

#[derive(Debug, Default)]
pub struct RecordingClient {
    messages: Mutex<Vec<String>>,
    tokens: Mutex<HashMap<String, String>>,
    scm_answers: Mutex<HashMap<Url, ScmAnswer>>,
    scm_calls: AtomicUsize,
}

impl RecordingClient {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn set_token(&self, connection_id: &str, token: &str) {
        self.tokens
            .lock()
            .unwrap()
            .insert(connection_id.to_string(), token.to_string());
    }

    pub fn set_scm_answer(&self, file: &Url, answer: ScmAnswer) {
        self.scm_answers.lock().unwrap().insert(file.clone(), answer);
    }

    pub fn scm_calls(&self) -> usize {
        self.scm_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EditorClient for RecordingClient {
    async fn show_error(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }

    async fn get_token(&self, connection_id: &str) -> anyhow::Result<String> {
        self.tokens
            .lock()
            .unwrap()
            .get(connection_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no token for '{}'", connection_id))
    }

    async fn is_ignored_by_scm(&self, file: &Url) -> anyhow::Result<Option<bool>> {
        self.scm_calls.fetch_add(1, Ordering::SeqCst);
        let answer = self
            .scm_answers
            .lock()
            .unwrap()
            .get(file)
            .copied()
            .unwrap_or(ScmAnswer::Unknown);
        tokio::task::yield_now().await;
        match answer {
            ScmAnswer::Ignored(ignored) => Ok(Some(ignored)),
            ScmAnswer::Unknown => Ok(None),
            ScmAnswer::Fail => anyhow::bail!("SCM query failed"),
            ScmAnswer::Never => std::future::pending().await,
        }
    }
}

/// Records folders handed to the analysis trigger (`None` for outside the workspace).
#[derive(Debug, Default)]
pub struct RecordingAnalysis {
    calls: Mutex<Vec<Option<Url>>>,
}

impl RecordingAnalysis {
    pub fn calls(&self) -> Vec<Option<Url>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_for(&self, folder: Option<&Url>) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_ref() == folder)
            .count()
    }
}

#[async_trait]
impl AnalysisTrigger for RecordingAnalysis {
    async fn analyze_all_open_files_in_folder(&self, folder: Option<&WorkspaceFolder>) {
        self.calls
            .lock()
            .unwrap()
            .push(folder.map(|f| f.uri.clone()));
    }
}

#[derive(Debug, Default)]
pub struct RecordingProgress {
    reports: Mutex<Vec<(String, Option<u32>)>>,
}

impl RecordingProgress {
    pub fn reports(&self) -> Vec<(String, Option<u32>)> {
        self.reports.lock().unwrap().clone()
    }
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, message: &str, percentage: Option<u32>) {
        self.reports
            .lock()
            .unwrap()
            .push((message.to_string(), percentage));
    }
}

#[derive(Debug, Default)]
pub struct FakeValidator {
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    start_hold: Mutex<Option<Arc<Notify>>>,
}

impl FakeValidator {
    /// Make the next start wait until the returned handle is notified.
    /// The attempt is recorded before it waits.
    pub fn hold_next_start(&self) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        *self.start_hold.lock().unwrap() = Some(release.clone());
        release
    }

    pub fn fail_for(&self, connection_id: &str) {
        self.failing.lock().unwrap().insert(connection_id.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionValidator for FakeValidator {
    async fn validate(&self, settings: &ServerConnectionSettings) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(settings.connection_id.clone());
        if self.failing.lock().unwrap().contains(&settings.connection_id) {
            anyhow::bail!("Connection test failed");
        }
        Ok(())
    }
}
