//
// file_scan.rs
//
// Enumerate local files under a binding's base directory
//

use std::path::Path;

use url::Url;
use walkdir::{DirEntry, WalkDir};

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map_or(false, |name| name.starts_with('.'))
}

/// Relative paths (with `/` separators) of regular files under `root`.
///
/// Hidden entries are skipped. Stops after `max_files` files.
pub fn collect_relative_paths(root: &Path, max_depth: usize, max_files: usize) -> Vec<String> {
    let mut paths = Vec::new();
    let walker = WalkDir::new(root)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e));

    for entry in walker.filter_map(|e| e.ok()) {
        if paths.len() >= max_files {
            log::trace!("File scan of {} truncated at {} files", root.display(), max_files);
            break;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            let parts: Vec<_> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            paths.push(parts.join("/"));
        }
    }
    paths
}

/// Scan the directory behind `base` off the async runtime.
/// Non-file URIs yield no paths.
pub async fn scan_ide_paths(base: &Url, max_depth: usize, max_files: usize) -> Vec<String> {
    let Ok(root) = base.to_file_path() else {
        return Vec::new();
    };
    match tokio::task::spawn_blocking(move || collect_relative_paths(&root, max_depth, max_files)).await {
        Ok(paths) => paths,
        Err(e) => {
            log::error!("File scan of {} failed: {}", base, e);
            Vec::new()
        }
    }
}
