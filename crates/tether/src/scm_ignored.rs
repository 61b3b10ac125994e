//
// scm_ignored.rs
//
// Per-file cache of "ignored by version control" answers
//

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::client::EditorClient;
use crate::result_cache::{Outcome, ResultCache};

/// Caches the editor's SCM-ignore answer per open file until the file is closed.
pub struct ScmIgnoredCache {
    client: Arc<dyn EditorClient>,
    entries: ResultCache<Url, bool>,
    timeout: Duration,
}

impl ScmIgnoredCache {
    pub fn new(client: Arc<dyn EditorClient>, timeout: Duration) -> Self {
        Self {
            client,
            entries: ResultCache::new(),
            timeout,
        }
    }

    /// Whether `file` is ignored by SCM; `None` when unknown.
    ///
    /// Concurrent queries for the same file share one editor request. A query
    /// that does not complete within the timeout yields `None` and is retried
    /// by the next caller.
    pub async fn is_ignored(&self, file: &Url) -> Option<bool> {
        let client = &self.client;
        let fetch = self.entries.get_or_compute(file, move || async move {
            let ignored = match client.is_ignored_by_scm(file).await {
                Ok(ignored) => ignored,
                Err(e) => {
                    log::error!("Unable to check if file {} is SCM ignored", file);
                    log::debug!("Cause: {:#}", e);
                    None
                }
            };
            let status = match ignored {
                Some(true) => "Ignored",
                Some(false) => "Not ignored",
                None => "Unknown",
            };
            log::debug!("Cached SCM ignore status for file '{}': {}", file, status);
            Outcome::Cached(ignored)
        });

        match tokio::time::timeout(self.timeout, fetch).await {
            Ok(ignored) => ignored,
            Err(_) => {
                log::warn!(
                    "Timed out after {:?} waiting for SCM ignore status of {}",
                    self.timeout,
                    file
                );
                None
            }
        }
    }

    /// Forget the answer for a closed file.
    pub fn did_close(&self, file: &Url) {
        self.entries.invalidate(file);
    }

    pub fn is_cached(&self, file: &Url) -> bool {
        self.entries.cached(file).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fakes::{RecordingClient, ScmAnswer};
    use crate::test_utils::log_capture;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_answer_is_cached_until_close() {
        let client = Arc::new(RecordingClient::default());
        let file = url("file:///ws/a.java");
        client.set_scm_answer(&file, ScmAnswer::Ignored(true));
        let cache = ScmIgnoredCache::new(client.clone(), Duration::from_secs(60));

        assert_eq!(cache.is_ignored(&file).await, Some(true));
        assert_eq!(cache.is_ignored(&file).await, Some(true));
        assert_eq!(client.scm_calls(), 1);

        cache.did_close(&file);
        assert!(!cache.is_cached(&file));
        assert_eq!(cache.is_ignored(&file).await, Some(true));
        assert_eq!(client.scm_calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_queries_share_request() {
        let client = Arc::new(RecordingClient::default());
        let file = url("file:///ws/a.java");
        client.set_scm_answer(&file, ScmAnswer::Ignored(false));
        let cache = ScmIgnoredCache::new(client.clone(), Duration::from_secs(60));

        let (a, b) = tokio::join!(cache.is_ignored(&file), cache.is_ignored(&file));
        assert_eq!((a, b), (Some(false), Some(false)));
        assert_eq!(client.scm_calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_cached_as_unknown() {
        let logs = log_capture::start();
        let client = Arc::new(RecordingClient::default());
        let file = url("file:///ws/a.java");
        client.set_scm_answer(&file, ScmAnswer::Fail);
        let cache = ScmIgnoredCache::new(client.clone(), Duration::from_secs(60));

        assert_eq!(cache.is_ignored(&file).await, None);
        assert_eq!(cache.is_ignored(&file).await, None);
        assert_eq!(client.scm_calls(), 1);
        assert!(logs.contains("Unable to check if file file:///ws/a.java is SCM ignored"));
        assert!(logs.contains("Cached SCM ignore status for file 'file:///ws/a.java': Unknown"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_cached() {
        let client = Arc::new(RecordingClient::default());
        let file = url("file:///ws/slow.java");
        client.set_scm_answer(&file, ScmAnswer::Never);
        let cache = ScmIgnoredCache::new(client.clone(), Duration::from_secs(60));

        assert_eq!(cache.is_ignored(&file).await, None);
        assert!(!cache.is_cached(&file));

        client.set_scm_answer(&file, ScmAnswer::Ignored(true));
        assert_eq!(cache.is_ignored(&file).await, Some(true));
        assert_eq!(client.scm_calls(), 2);
    }
}
