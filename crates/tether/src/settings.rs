//
// settings.rs
//
// Connection and folder binding settings, and the provider seam that yields them
//

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::engine::ServerEndpoint;
use crate::folders::WorkspaceFolder;

/// Connection id used when a connection entry does not name itself.
pub const DEFAULT_CONNECTION_ID: &str = "<default>";

/// Base URL of the hosted (cloud) server variant.
pub const CLOUD_SERVER_URL: &str = "https://sonarcloud.io";

pub fn connection_id_or_default(connection_id: Option<&str>) -> &str {
    connection_id.unwrap_or(DEFAULT_CONNECTION_ID)
}

fn default_connection_id() -> String {
    DEFAULT_CONNECTION_ID.to_string()
}

fn default_server_url() -> String {
    CLOUD_SERVER_URL.to_string()
}

/// One configured remote connection.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConnectionSettings {
    #[serde(default = "default_connection_id")]
    pub connection_id: String,
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub organization_key: Option<String>,
    #[serde(default)]
    pub disable_notifications: bool,
}

impl fmt::Debug for ServerConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnectionSettings")
            .field("connection_id", &self.connection_id)
            .field("server_url", &self.server_url)
            .field("organization_key", &self.organization_key)
            .field("disable_notifications", &self.disable_notifications)
            .finish_non_exhaustive()
    }
}

impl ServerConnectionSettings {
    pub fn new(
        connection_id: impl Into<String>,
        server_url: impl Into<String>,
        token: impl Into<String>,
        organization_key: Option<String>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            server_url: server_url.into(),
            token: token.into(),
            organization_key,
            disable_notifications: false,
        }
    }

    /// Server URL without trailing slashes.
    pub fn normalized_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    pub fn is_cloud(&self) -> bool {
        self.normalized_url() == CLOUD_SERVER_URL
    }

    /// Whether both settings point at the same server identity (URL and organization).
    pub fn same_server(&self, other: &Self) -> bool {
        self.normalized_url() == other.normalized_url()
            && self.organization_key == other.organization_key
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint {
            base_url: self.normalized_url().to_string(),
            organization: self.organization_key.clone(),
            is_cloud: self.is_cloud(),
            token: self.token.clone(),
        }
    }
}

/// Binding settings of one folder, or of files outside every folder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderSettings {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub project_key: Option<String>,
}

impl FolderSettings {
    pub fn bound(connection_id: impl Into<String>, project_key: impl Into<String>) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            project_key: Some(project_key.into()),
        }
    }

    pub fn unbound() -> Self {
        Self::default()
    }

    pub fn has_binding(&self) -> bool {
        self.binding().is_some()
    }

    /// `(connection_id, project_key)` when both are present.
    pub fn binding(&self) -> Option<(&str, &str)> {
        match (&self.connection_id, &self.project_key) {
            (Some(connection_id), Some(project_key)) => {
                Some((connection_id.as_str(), project_key.as_str()))
            }
            _ => None,
        }
    }
}

/// Snapshot of all configured connections for one settings generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceSettings {
    pub connections: BTreeMap<String, ServerConnectionSettings>,
}

#[derive(Deserialize)]
struct RawWorkspaceSettings {
    #[serde(default)]
    connections: Vec<ServerConnectionSettings>,
}

impl WorkspaceSettings {
    pub fn with_connections(connections: impl IntoIterator<Item = ServerConnectionSettings>) -> Self {
        Self {
            connections: connections
                .into_iter()
                .map(|c| (c.connection_id.clone(), c))
                .collect(),
        }
    }

    /// Parse `{"connections": [...]}`. Later entries win on duplicate ids.
    pub fn from_json(value: &serde_json::Value) -> anyhow::Result<Self> {
        let raw = RawWorkspaceSettings::deserialize(value)?;
        Ok(Self::with_connections(raw.connections))
    }

    pub fn connection(&self, connection_id: &str) -> Option<&ServerConnectionSettings> {
        self.connections.get(connection_id)
    }

    /// Connection whose base URL matches `url`, ignoring trailing slashes.
    pub fn connection_for_url(&self, url: &str) -> Option<&ServerConnectionSettings> {
        let url = url.trim_end_matches('/');
        self.connections
            .values()
            .find(|c| c.normalized_url() == url)
    }
}

/// Source of current settings.
///
/// Parsing and persistence live outside this crate; the resolver only reads
/// snapshots through this seam.
pub trait SettingsProvider: Send + Sync {
    fn current_settings(&self) -> Arc<WorkspaceSettings>;

    /// Settings of `folder`, or the default settings when `folder` is `None`.
    fn folder_settings(&self, folder: Option<&WorkspaceFolder>) -> FolderSettings;
}
