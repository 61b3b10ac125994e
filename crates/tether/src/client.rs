//
// client.rs
//
// Outbound collaborators: editor client, analysis trigger, progress reporting
//

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tower_lsp::lsp_types::request::Request;
use tower_lsp::lsp_types::{MessageType, Url};
use tower_lsp::Client;

use crate::folders::WorkspaceFolder;

/// Requests sent to the editor.
#[async_trait]
pub trait EditorClient: Send + Sync {
    /// Show an error notification to the user.
    async fn show_error(&self, message: &str);

    async fn get_token(&self, connection_id: &str) -> anyhow::Result<String>;

    /// `None` when the editor cannot tell (no SCM, unknown file).
    async fn is_ignored_by_scm(&self, file: &Url) -> anyhow::Result<Option<bool>>;
}

/// Re-analysis hook, invoked after a binding changes.
#[async_trait]
pub trait AnalysisTrigger: Send + Sync {
    /// `None` targets files outside every workspace folder.
    async fn analyze_all_open_files_in_folder(&self, folder: Option<&WorkspaceFolder>);
}

/// Receives human-readable progress of long-running operations.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, message: &str, percentage: Option<u32>);
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTokenParams {
    pub connection_id: String,
}

pub enum GetToken {}

impl Request for GetToken {
    type Params = GetTokenParams;
    type Result = String;
    const METHOD: &'static str = "tether/getToken";
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsIgnoredByScmParams {
    pub file_uri: Url,
}

pub enum IsIgnoredByScm {}

impl Request for IsIgnoredByScm {
    type Params = IsIgnoredByScmParams;
    type Result = Option<bool>;
    const METHOD: &'static str = "tether/isIgnoredByScm";
}

/// `EditorClient` backed by a tower-lsp client connection.
#[derive(Debug, Clone)]
pub struct LspEditorClient {
    client: Client,
}

impl LspEditorClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EditorClient for LspEditorClient {
    async fn show_error(&self, message: &str) {
        self.client.show_message(MessageType::ERROR, message).await;
    }

    async fn get_token(&self, connection_id: &str) -> anyhow::Result<String> {
        self.client
            .send_request::<GetToken>(GetTokenParams {
                connection_id: connection_id.to_string(),
            })
            .await
            .map_err(|e| anyhow::anyhow!("{} failed: {}", GetToken::METHOD, e.message))
    }

    async fn is_ignored_by_scm(&self, file: &Url) -> anyhow::Result<Option<bool>> {
        self.client
            .send_request::<IsIgnoredByScm>(IsIgnoredByScmParams {
                file_uri: file.clone(),
            })
            .await
            .map_err(|e| anyhow::anyhow!("{} failed: {}", IsIgnoredByScm::METHOD, e.message))
    }
}
