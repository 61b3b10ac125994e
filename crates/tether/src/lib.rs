//
// lib.rs
//
// Binding resolution and connected engine lifecycle for editor integrations
//

pub mod binding;
pub mod client;
pub mod config;
pub mod engine;
pub mod engine_cache;
pub mod error;
pub mod file_scan;
pub mod folders;
pub mod resolver;
pub mod result_cache;
pub mod scm_ignored;
pub mod settings;
pub mod sync;
// test_utils is available in test builds and when the `test-support` feature is enabled.
#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;


pub use binding::{BindingScope, ProjectBinding, ProjectBindingWrapper, ServerIssueTracker};
pub use client::{AnalysisTrigger, EditorClient, LspEditorClient, ProgressReporter};
pub use config::{parse_binding_config, BindingConfig};
pub use engine::{
    ConnectedEngine, ConnectionValidator, EngineFactory, ServerEndpoint, ServerIssue,
    ServerProject, StorageStatus,
};
pub use engine_cache::{EngineCache, StartedEngine};
pub use error::{BindingError, Result};
pub use folders::{FolderChanges, WorkspaceFolder, WorkspaceFolderRegistry};
pub use resolver::{BindingResolver, Collaborators};
pub use result_cache::{Outcome, ResultCache};
pub use scm_ignored::ScmIgnoredCache;
pub use settings::{
    FolderSettings, ServerConnectionSettings, SettingsProvider, WorkspaceSettings,
};
pub use sync::{SyncCoordinator, SyncReport, SyncTarget};

/// Install the `RUST_LOG`-driven logger. Hosts that already installed a
/// logger keep theirs.
pub fn init_logging() {
    if env_logger::try_init().is_err() {
        log::debug!("Logger already installed");
    }
}
