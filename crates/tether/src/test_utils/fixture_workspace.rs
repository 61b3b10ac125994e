//! Deterministic multi-folder workspace generator for benchmarks and tests.
//!
//! Generates a temporary directory holding several workspace folders, each
//! with a fixed tree of source files, so path-prefix scans and folder lookups
//! run against real paths.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tower_lsp::lsp_types::{self, Url};

/// Configuration for generating a fixture workspace.
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    pub folder_count: usize,
    pub files_per_folder: usize,
    /// Files are spread over this many nested directories per folder.
    pub nesting_depth: usize,
}

impl FixtureConfig {
    /// Small workspace: 2 folders, 5 files each.
    pub fn small() -> Self {
        Self {
            folder_count: 2,
            files_per_folder: 5,
            nesting_depth: 2,
        }
    }

    /// Medium workspace: 10 folders, 50 files each.
    pub fn medium() -> Self {
        Self {
            folder_count: 10,
            files_per_folder: 50,
            nesting_depth: 4,
        }
    }
}

/// A generated workspace. Files are removed when dropped.
pub struct FixtureWorkspace {
    dir: TempDir,
    folders: Vec<PathBuf>,
}

impl FixtureWorkspace {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn folder_paths(&self) -> &[PathBuf] {
        &self.folders
    }

    pub fn folder_uris(&self) -> Vec<Url> {
        self.folders
            .iter()
            .map(|p| Url::from_file_path(p).unwrap())
            .collect()
    }

    /// Folders in the shape sent by the editor at initialization.
    pub fn lsp_folders(&self) -> Vec<lsp_types::WorkspaceFolder> {
        self.folder_uris()
            .into_iter()
            .enumerate()
            .map(|(i, uri)| lsp_types::WorkspaceFolder {
                uri,
                name: format!("folder_{}", i),
            })
            .collect()
    }

    /// URI of file `file` in folder `folder`, matching the generated layout.
    pub fn file_uri(&self, folder: usize, file: usize, config: &FixtureConfig) -> Url {
        Url::from_file_path(self.folders[folder].join(relative_file_path(file, config))).unwrap()
    }
}

fn relative_file_path(index: usize, config: &FixtureConfig) -> PathBuf {
    let mut path = PathBuf::new();
    for level in 0..(index % (config.nesting_depth + 1)) {
        path.push(format!("dir_{}", level));
    }
    path.push(format!("File{}.java", index));
    path
}

/// Create a temporary fixture workspace from the given configuration.
pub fn create_fixture_workspace(config: &FixtureConfig) -> FixtureWorkspace {
    let dir = TempDir::new().expect("Failed to create temp directory for fixture workspace");
    let mut folders = Vec::new();
    for f in 0..config.folder_count {
        let folder = dir.path().join(format!("folder_{}", f));
        for i in 0..config.files_per_folder {
            let path = folder.join(relative_file_path(i, config));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, format!("class File{} {{}}\n", i))
                .unwrap_or_else(|e| panic!("Failed to write fixture file {}: {}", path.display(), e));
        }
        folders.push(folder);
    }
    FixtureWorkspace { dir, folders }
}
