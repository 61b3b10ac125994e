//
// binding.rs
//
// Resolved bindings: path-prefix mapping, issue tracker, binding scope
//

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use url::Url;

use crate::engine::{ConnectedEngine, ServerEndpoint, ServerIssue};
use crate::folders::WorkspaceFolder;

/// Key of the binding cache: a workspace folder, or the directory of a file
/// that lives outside every folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindingScope {
    Folder(Url),
    OutsideWorkspace(Url),
}

impl BindingScope {
    pub fn for_file(file: &Url, folder: Option<&WorkspaceFolder>) -> Self {
        match folder {
            Some(folder) => BindingScope::Folder(folder.uri.clone()),
            None => BindingScope::OutsideWorkspace(file.join(".").unwrap_or_else(|_| file.clone())),
        }
    }

    /// Directory the binding's local paths are relative to.
    pub fn base_uri(&self) -> &Url {
        match self {
            BindingScope::Folder(uri) | BindingScope::OutsideWorkspace(uri) => uri,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, BindingScope::Folder(_))
    }

    pub fn is_outside_workspace(&self) -> bool {
        matches!(self, BindingScope::OutsideWorkspace(_))
    }

    /// Local path for log messages, falling back to the URI.
    pub fn display_path(&self) -> String {
        let uri = self.base_uri();
        uri.to_file_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| uri.to_string())
    }

    /// Resolve a relative local path against the scope directory.
    pub fn resolve(&self, ide_relative_path: &str) -> Option<Url> {
        let base = self.base_uri();
        if base.path().ends_with('/') {
            base.join(ide_relative_path).ok()
        } else {
            let mut dir = base.clone();
            dir.set_path(&format!("{}/", base.path()));
            dir.join(ide_relative_path).ok()
        }
    }
}

/// Mapping between local relative paths and server paths for one project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectBinding {
    pub project_key: String,
    pub server_path_prefix: String,
    pub ide_path_prefix: String,
}

fn trim_slashes(s: &str) -> String {
    s.trim_matches('/').to_string()
}

fn replace_prefix(path: &str, from: &str, to: &str) -> Option<String> {
    let path = path.trim_start_matches('/');
    let rest = if from.is_empty() {
        path
    } else {
        let rest = path.strip_prefix(from)?;
        if rest.is_empty() {
            rest
        } else {
            rest.strip_prefix('/')?
        }
    };
    Some(match (to.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (false, true) => to.to_string(),
        (false, false) => format!("{}/{}", to, rest),
    })
}

impl ProjectBinding {
    pub fn new(
        project_key: impl Into<String>,
        server_path_prefix: &str,
        ide_path_prefix: &str,
    ) -> Self {
        Self {
            project_key: project_key.into(),
            server_path_prefix: trim_slashes(server_path_prefix),
            ide_path_prefix: trim_slashes(ide_path_prefix),
        }
    }

    /// Translate a server path into a path relative to the local base directory.
    pub fn server_path_to_ide_path(&self, server_path: &str) -> Option<String> {
        replace_prefix(server_path, &self.server_path_prefix, &self.ide_path_prefix)
    }

    /// Translate a local relative path into the server's path.
    pub fn ide_path_to_server_path(&self, ide_path: &str) -> Option<String> {
        replace_prefix(ide_path, &self.ide_path_prefix, &self.server_path_prefix)
    }
}

impl fmt::Display for ProjectBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ProjectBinding[idePathPrefix={},projectKey={},serverPathPrefix={}]",
            self.ide_path_prefix, self.project_key, self.server_path_prefix
        )
    }
}

/// Answers server-side issue queries for files of one binding.
#[derive(Clone)]
pub struct ServerIssueTracker {
    engine: Arc<dyn ConnectedEngine>,
    endpoint: ServerEndpoint,
    binding: ProjectBinding,
}

impl fmt::Debug for ServerIssueTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIssueTracker")
            .field("endpoint", &self.endpoint)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl ServerIssueTracker {
    pub fn new(engine: Arc<dyn ConnectedEngine>, endpoint: ServerEndpoint, binding: ProjectBinding) -> Self {
        Self {
            engine,
            endpoint,
            binding,
        }
    }

    /// Issues for a file given by its path relative to the binding's base directory.
    /// Files outside the mapped prefix have no server issues.
    pub async fn server_issues(&self, ide_relative_path: &str) -> anyhow::Result<Vec<ServerIssue>> {
        let Some(server_path) = self.binding.ide_path_to_server_path(ide_relative_path) else {
            return Ok(Vec::new());
        };
        self.engine
            .server_issues(&self.endpoint, &self.binding.project_key, &server_path)
            .await
    }
}

/// A resolved binding: connection, project mapping, engine and issue tracker.
#[derive(Clone)]
pub struct ProjectBindingWrapper {
    pub connection_id: String,
    pub binding: ProjectBinding,
    pub engine: Arc<dyn ConnectedEngine>,
    pub issue_tracker: ServerIssueTracker,
}

impl fmt::Debug for ProjectBindingWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectBindingWrapper")
            .field("connection_id", &self.connection_id)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl ProjectBindingWrapper {
    pub fn project_key(&self) -> &str {
        &self.binding.project_key
    }
}

/// Path of `file` relative to `base`, with `/` separators.
pub fn relative_path(base: &Url, file: &Url) -> Option<String> {
    let base: PathBuf = base.to_file_path().ok()?;
    let file: PathBuf = file.to_file_path().ok()?;
    let rel = file.strip_prefix(&base).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}
