//
// error.rs
//
// Error taxonomy for binding resolution and engine lifecycle
//

use url::Url;

/// Failures surfaced by the binding layer.
///
/// Collaborators report `anyhow::Error`; those causes are wrapped here at the
/// component boundary so callers can tell the categories apart.
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    /// A folder references a connection id that is not configured.
    #[error("The specified connection id '{0}' doesn't exist.")]
    UnknownConnection(String),

    #[error("Error starting connected engine for '{connection_id}'")]
    EngineStart {
        connection_id: String,
        #[source]
        reason: anyhow::Error,
    },

    #[error("Binding update failed for the server: {connection_id}")]
    StorageUpdate {
        connection_id: String,
        #[source]
        reason: anyhow::Error,
    },

    /// The engine finished starting after a shutdown began and was stopped again.
    #[error("Start of connected engine for '{0}' was aborted by shutdown")]
    StartAborted(String),

    #[error("Unable to stop engine '{connection_id}'")]
    EngineStop {
        connection_id: String,
        #[source]
        reason: anyhow::Error,
    },

    #[error("Failed to fetch list of projects from '{connection_id}'")]
    RemoteList {
        connection_id: String,
        #[source]
        reason: anyhow::Error,
    },

    #[error("No server configuration found with ID '{0}'")]
    ConnectionNotFound(String),

    #[error("Connection test failed for '{connection_id}'")]
    ConnectionValidation {
        connection_id: String,
        #[source]
        reason: anyhow::Error,
    },

    /// Ancestor checks are undefined for URIs without a hierarchical path.
    #[error("URI '{0}' is opaque and has no path hierarchy")]
    OpaqueUri(Url),
}

impl BindingError {
    /// Connection id the failure is scoped to, if any.
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            BindingError::UnknownConnection(id)
            | BindingError::ConnectionNotFound(id)
            | BindingError::StartAborted(id) => Some(id.as_str()),
            BindingError::EngineStart { connection_id, .. }
            | BindingError::StorageUpdate { connection_id, .. }
            | BindingError::EngineStop { connection_id, .. }
            | BindingError::RemoteList { connection_id, .. }
            | BindingError::ConnectionValidation { connection_id, .. } => Some(connection_id.as_str()),
            BindingError::OpaqueUri(_) => None,
        }
    }
}

pub type Result<T, E = BindingError> = std::result::Result<T, E>;
