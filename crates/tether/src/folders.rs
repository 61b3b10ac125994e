//
// folders.rs
//
// Workspace folder registry and URI ancestry
//

use std::fmt;
use std::sync::RwLock;

use indexmap::IndexMap;
use tower_lsp::lsp_types::{self, Url};

use crate::error::{BindingError, Result};

/// A workspace folder known to the editor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceFolder {
    pub uri: Url,
    pub name: Option<String>,
}

impl WorkspaceFolder {
    pub fn new(uri: Url) -> Self {
        Self { uri, name: None }
    }

    pub fn named(uri: Url, name: impl Into<String>) -> Self {
        Self {
            uri,
            name: Some(name.into()),
        }
    }
}

impl From<lsp_types::WorkspaceFolder> for WorkspaceFolder {
    fn from(folder: lsp_types::WorkspaceFolder) -> Self {
        let name = Some(folder.name).filter(|n| !n.is_empty());
        Self {
            uri: folder.uri,
            name,
        }
    }
}

impl fmt::Display for WorkspaceFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.uri),
            None => write!(f, "{}", self.uri),
        }
    }
}

/// Folders effectively added and removed by one change event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderChanges {
    pub added: Vec<WorkspaceFolder>,
    pub removed: Vec<WorkspaceFolder>,
}

/// Non-empty path segments of a hierarchical URI.
fn path_segments(uri: &Url) -> Result<Vec<&str>> {
    let segments = uri
        .path_segments()
        .ok_or_else(|| BindingError::OpaqueUri(uri.clone()))?;
    Ok(segments.filter(|s| !s.is_empty()).collect())
}

/// Whether `ancestor` contains `uri` under path-segment semantics.
///
/// A URI is its own ancestor. Scheme, host and port must match; comparing
/// against an opaque URI (e.g. `mailto:`) is an error.
pub fn is_ancestor(ancestor: &Url, uri: &Url) -> Result<bool> {
    let ancestor_segments = path_segments(ancestor)?;
    let uri_segments = path_segments(uri)?;

    if ancestor.scheme() != uri.scheme()
        || ancestor.host_str() != uri.host_str()
        || ancestor.port_or_known_default() != uri.port_or_known_default()
    {
        return Ok(false);
    }

    Ok(uri_segments.len() >= ancestor_segments.len()
        && ancestor_segments
            .iter()
            .zip(&uri_segments)
            .all(|(a, b)| a == b))
}

/// Known workspace folders, in registration order.
#[derive(Debug, Default)]
pub struct WorkspaceFolderRegistry {
    folders: RwLock<IndexMap<Url, WorkspaceFolder>>,
}

impl WorkspaceFolderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registry content with the folders sent at initialization.
    pub fn initialize(&self, folders: Option<Vec<lsp_types::WorkspaceFolder>>) {
        let Ok(mut guard) = self.folders.write() else {
            return;
        };
        guard.clear();
        for folder in folders.unwrap_or_default() {
            let folder = WorkspaceFolder::from(folder);
            log::info!("Folder {} added", folder);
            guard.insert(folder.uri.clone(), folder);
        }
    }

    /// Apply a `workspace/didChangeWorkspaceFolders` event.
    pub fn on_folders_changed(
        &self,
        event: lsp_types::WorkspaceFoldersChangeEvent,
    ) -> FolderChanges {
        log::info!("Processing didChangeWorkspaceFolders event");
        let mut changes = FolderChanges::default();
        let Ok(mut guard) = self.folders.write() else {
            return changes;
        };

        for folder in event.added {
            let folder = WorkspaceFolder::from(folder);
            if guard.contains_key(&folder.uri) {
                log::warn!("Registered workspace folder {} was already added", folder);
            } else {
                log::info!("Folder {} added", folder);
                guard.insert(folder.uri.clone(), folder.clone());
                changes.added.push(folder);
            }
        }

        for folder in event.removed {
            match guard.shift_remove(&folder.uri) {
                Some(removed) => {
                    log::info!("Folder {} removed", removed);
                    changes.removed.push(removed);
                }
                None => log::warn!("Unregistered workspace folder was missing: {}", folder.uri),
            }
        }

        changes
    }

    /// Most deeply nested folder containing `uri`.
    pub fn find_folder_for_file(&self, uri: &Url) -> Option<WorkspaceFolder> {
        let guard = self.folders.read().ok()?;
        let mut best: Option<(usize, &WorkspaceFolder)> = None;
        for folder in guard.values() {
            match is_ancestor(&folder.uri, uri) {
                Ok(true) => {
                    let depth = path_segments(&folder.uri).map_or(0, |s| s.len());
                    if best.map_or(true, |(d, _)| depth > d) {
                        best = Some((depth, folder));
                    }
                }
                Ok(false) => {}
                Err(e) => log::debug!("Skipping folder {} for {}: {}", folder, uri, e),
            }
        }
        best.map(|(_, folder)| folder.clone())
    }

    pub fn all(&self) -> Vec<WorkspaceFolder> {
        self.folders
            .read()
            .map(|guard| guard.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, uri: &Url) -> Option<WorkspaceFolder> {
        self.folders.read().ok()?.get(uri).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::log_capture;
    use lsp_types::WorkspaceFoldersChangeEvent;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn lsp_folder(uri: &str) -> lsp_types::WorkspaceFolder {
        lsp_types::WorkspaceFolder {
            uri: url(uri),
            name: String::new(),
        }
    }

    #[test]
    fn test_is_ancestor_segments() {
        assert!(is_ancestor(&url("file:///foo"), &url("file:///foo")).unwrap());
        assert!(is_ancestor(&url("file:///foo"), &url("file:///foo/bar.txt")).unwrap());
        assert!(is_ancestor(&url("file:///foo/"), &url("file:///foo/bar.txt")).unwrap());
        assert!(!is_ancestor(&url("file:///foo/bar"), &url("file:///foo/bar.txt")).unwrap());
        assert!(!is_ancestor(&url("file:///foo/bar"), &url("file:///foo/bar2")).unwrap());
        assert!(!is_ancestor(&url("file:///foo/bar"), &url("file:///foo")).unwrap());
    }

    #[test]
    fn test_is_ancestor_other_schemes() {
        let a = url("ftp://ftp.example.com/foo");
        assert!(is_ancestor(&a, &url("ftp://ftp.example.com/foo/bar.txt")).unwrap());
        assert!(!is_ancestor(&url("ftp://ftp.example.com/foo/bar"), &url("ftp://ftp.example.com/bar.txt")).unwrap());
        assert!(is_ancestor(
            &url("file:///C:/Documents%20and%20Settings/davris"),
            &url("file:///C:/Documents%20and%20Settings/davris/FileSchemeURIs.doc")
        )
        .unwrap());
    }

    #[test]
    fn test_is_ancestor_authority_mismatch() {
        assert!(!is_ancestor(&url("ftp:///foo"), &url("file:///foo")).unwrap());
        assert!(!is_ancestor(
            &url("file://laptop/My%20Documents"),
            &url("file://laptop2/My%20Documents/FileSchemeURIs.doc")
        )
        .unwrap());
        assert!(is_ancestor(
            &url("file://laptop/My%20Documents"),
            &url("file://laptop/My%20Documents/FileSchemeURIs.doc")
        )
        .unwrap());
        assert!(!is_ancestor(
            &url("http://laptop:8080/docs"),
            &url("http://laptop:8081/docs/a.txt")
        )
        .unwrap());
        assert!(is_ancestor(&url("http://laptop:80/docs"), &url("http://laptop/docs/a.txt")).unwrap());
    }

    #[test]
    fn test_is_ancestor_opaque_is_error() {
        let email = url("mailto:john@example.com");
        let file = url("file:///foo");
        assert!(matches!(is_ancestor(&email, &file), Err(BindingError::OpaqueUri(_))));
        assert!(matches!(is_ancestor(&file, &email), Err(BindingError::OpaqueUri(_))));
    }

    #[test]
    fn test_find_folder_prefers_deepest() {
        let registry = WorkspaceFolderRegistry::new();
        registry.initialize(Some(vec![
            lsp_folder("file:///ws"),
            lsp_folder("file:///ws/nested/inner"),
            lsp_folder("file:///ws/nested"),
        ]));

        let found = registry.find_folder_for_file(&url("file:///ws/nested/inner/a.java")).unwrap();
        assert_eq!(found.uri, url("file:///ws/nested/inner"));

        let found = registry.find_folder_for_file(&url("file:///ws/nested/b.java")).unwrap();
        assert_eq!(found.uri, url("file:///ws/nested"));

        assert!(registry.find_folder_for_file(&url("file:///elsewhere/c.java")).is_none());
        assert!(registry.find_folder_for_file(&url("file:///wsx/c.java")).is_none());
    }

    #[test]
    fn test_initialize_without_folders() {
        let registry = WorkspaceFolderRegistry::new();
        registry.initialize(None);
        assert!(registry.all().is_empty());
    }

    #[test]
    fn test_register_folder_logs() {
        let logs = log_capture::start();
        let registry = WorkspaceFolderRegistry::new();
        registry.initialize(Some(Vec::new()));
        logs.clear();

        let event = || WorkspaceFoldersChangeEvent {
            added: vec![lsp_folder("file:///path/to/base")],
            removed: Vec::new(),
        };

        let changes = registry.on_folders_changed(event());
        assert_eq!(changes.added.len(), 1);
        assert_eq!(
            logs.messages(),
            vec![
                "Processing didChangeWorkspaceFolders event".to_string(),
                "Folder file:///path/to/base added".to_string(),
            ]
        );

        logs.clear();
        let changes = registry.on_folders_changed(event());
        assert!(changes.added.is_empty());
        assert_eq!(registry.all().len(), 1);
        assert_eq!(
            logs.messages(),
            vec![
                "Processing didChangeWorkspaceFolders event".to_string(),
                "Registered workspace folder file:///path/to/base was already added".to_string(),
            ]
        );
    }

    #[test]
    fn test_unregister_folder_logs() {
        let logs = log_capture::start();
        let registry = WorkspaceFolderRegistry::new();
        registry.initialize(Some(vec![lsp_folder("file:///path/to/base")]));
        logs.clear();

        let event = || WorkspaceFoldersChangeEvent {
            added: Vec::new(),
            removed: vec![lsp_folder("file:///path/to/base")],
        };

        let changes = registry.on_folders_changed(event());
        assert_eq!(changes.removed.len(), 1);
        assert!(registry.all().is_empty());
        assert_eq!(
            logs.messages(),
            vec![
                "Processing didChangeWorkspaceFolders event".to_string(),
                "Folder file:///path/to/base removed".to_string(),
            ]
        );

        logs.clear();
        registry.on_folders_changed(event());
        assert_eq!(
            logs.messages(),
            vec![
                "Processing didChangeWorkspaceFolders event".to_string(),
                "Unregistered workspace folder was missing: file:///path/to/base".to_string(),
            ]
        );
    }

    #[test]
    fn test_display_includes_name() {
        let folder = WorkspaceFolder::named(url("file:///ws"), "ws");
        assert_eq!(folder.to_string(), "ws (file:///ws)");
    }
}
