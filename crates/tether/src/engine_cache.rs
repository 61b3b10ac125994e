//
// engine_cache.rs
//
// One running connected engine per connection id
//

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::engine::{ConnectedEngine, EngineFactory};
use crate::error::{BindingError, Result};
use crate::result_cache::{Outcome, ResultCache};

/// An engine handed out by the cache.
#[derive(Clone)]
pub struct StartedEngine {
    pub engine: Arc<dyn ConnectedEngine>,
    /// Whether this call started the engine.
    pub fresh: bool,
}

impl std::fmt::Debug for StartedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartedEngine")
            .field("fresh", &self.fresh)
            .finish_non_exhaustive()
    }
}

/// Live engines keyed by connection id.
///
/// Starting and stopping the engine of one connection id are serialized by a
/// per-id lifecycle gate, so a new instance is never created while the
/// previous one is still stopping. Distinct ids never contend.
///
/// A start that overlaps [`EngineCache::stop_all`] is undone: the engine it
/// produced is stopped and never handed out.
pub struct EngineCache {
    factory: Arc<dyn EngineFactory>,
    engines: ResultCache<String, Arc<dyn ConnectedEngine>>,
    lifecycle: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Bumped by every `stop_all`.
    shutdowns: AtomicU64,
}

impl std::fmt::Debug for EngineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCache")
            .field("engines", &self.engines)
            .finish_non_exhaustive()
    }
}

impl EngineCache {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            engines: ResultCache::new(),
            lifecycle: DashMap::new(),
            shutdowns: AtomicU64::new(0),
        }
    }

    fn gate(&self, connection_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.lifecycle
            .entry(connection_id.to_string())
            .or_default()
            .clone()
    }

    /// Running engine for `connection_id`, starting it if needed.
    ///
    /// Concurrent callers share one start. A failed start is logged and not
    /// cached, so a later call tries again. A start overlapping `stop_all`
    /// fails with [`BindingError::StartAborted`].
    pub async fn get_or_start(&self, connection_id: &str) -> Result<StartedEngine> {
        let key = connection_id.to_string();
        let epoch = self.shutdowns.load(Ordering::SeqCst);
        let gate = self.gate(connection_id);
        let factory = &self.factory;
        let shutdowns = &self.shutdowns;
        let fresh = AtomicBool::new(false);
        let aborted = AtomicBool::new(false);
        let failure: Mutex<Option<anyhow::Error>> = Mutex::new(None);
        let (fresh_ref, aborted_ref, failure_ref) = (&fresh, &aborted, &failure);

        let engine = self
            .engines
            .get_or_compute(&key, move || async move {
                let _gate = gate.lock().await;
                log::info!("Starting connected engine for '{}'...", connection_id);
                match factory.create_connected_engine(connection_id).await {
                    Ok(engine) if shutdowns.load(Ordering::SeqCst) != epoch => {
                        log::info!(
                            "Stopping connected engine for '{}' started during shutdown",
                            connection_id
                        );
                        if let Err(e) = engine.stop(false).await {
                            log::error!("Unable to stop engine '{}'", connection_id);
                            log::debug!("Cause: {:#}", e);
                        }
                        aborted_ref.store(true, Ordering::Relaxed);
                        Outcome::Transient(None)
                    }
                    Ok(engine) => {
                        fresh_ref.store(true, Ordering::Relaxed);
                        Outcome::Cached(Some(engine))
                    }
                    Err(e) => {
                        log::error!("Error starting connected engine for '{}'", connection_id);
                        log::debug!("Cause: {:#}", e);
                        if let Ok(mut slot) = failure_ref.lock() {
                            *slot = Some(e);
                        }
                        Outcome::Transient(None)
                    }
                }
            })
            .await;

        let overlapped = self.shutdowns.load(Ordering::SeqCst) != epoch;
        match engine {
            Some(engine) if overlapped => {
                self.discard(connection_id, &engine).await;
                Err(BindingError::StartAborted(key))
            }
            Some(engine) => Ok(StartedEngine {
                engine,
                fresh: fresh.load(Ordering::Relaxed),
            }),
            None if overlapped || aborted.load(Ordering::Relaxed) => {
                Err(BindingError::StartAborted(key))
            }
            None => {
                let reason = failure
                    .lock()
                    .ok()
                    .and_then(|mut slot| slot.take())
                    .unwrap_or_else(|| anyhow::anyhow!("concurrent engine start failed"));
                Err(BindingError::EngineStart {
                    connection_id: key,
                    reason,
                })
            }
        }
    }

    /// Stop `engine` if it is still the cached instance of `connection_id`.
    async fn discard(&self, connection_id: &str, engine: &Arc<dyn ConnectedEngine>) {
        let gate = self.gate(connection_id);
        let _gate = gate.lock().await;
        let taken = self.engines.take_ready_if(&connection_id.to_string(), |cached| {
            cached.as_ref().map_or(false, |cached| Arc::ptr_eq(cached, engine))
        });
        if taken.is_none() {
            return;
        }
        log::info!("Stopping connected engine for '{}' started during shutdown", connection_id);
        if let Err(e) = engine.stop(false).await {
            log::error!("Unable to stop engine '{}'", connection_id);
            log::debug!("Cause: {:#}", e);
        }
    }

    pub fn get_running(&self, connection_id: &str) -> Option<Arc<dyn ConnectedEngine>> {
        self.engines.cached(&connection_id.to_string()).flatten()
    }

    pub fn is_running(&self, connection_id: &str) -> bool {
        self.get_running(connection_id).is_some()
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.engines
            .ready_entries()
            .into_iter()
            .filter(|(_, engine)| engine.is_some())
            .map(|(id, _)| id)
            .collect()
    }

    /// Stop the engine of `connection_id`, if one is running.
    pub async fn stop(&self, connection_id: &str) -> Result<bool> {
        self.retire(connection_id, || {}).await
    }

    /// Remove the engine of `connection_id` from the cache, run `detach` while
    /// the id is still gated, then stop the engine.
    ///
    /// `detach` drops whatever still points at the engine, so no reader can
    /// obtain it once it is stopping. A start already waiting on the gate
    /// proceeds afterwards. Returns whether an engine was stopped.
    pub async fn retire(&self, connection_id: &str, detach: impl FnOnce()) -> Result<bool> {
        let gate = self.gate(connection_id);
        let _gate = gate.lock().await;

        let engine = self.engines.take_ready(&connection_id.to_string()).flatten();
        detach();

        let Some(engine) = engine else {
            return Ok(false);
        };
        engine.stop(false).await.map_err(|reason| {
            log::error!("Unable to stop engine '{}'", connection_id);
            log::debug!("Cause: {:#}", reason);
            BindingError::EngineStop {
                connection_id: connection_id.to_string(),
                reason,
            }
        })?;
        log::debug!("Stopped connected engine for '{}'", connection_id);
        Ok(true)
    }

    /// Stop every running engine. A failure stopping one engine does not
    /// prevent the others from being stopped; failures are returned.
    ///
    /// Starts still in progress are undone when they complete.
    pub async fn stop_all(&self) -> Vec<BindingError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        let mut failures = Vec::new();
        for connection_id in self.running_ids() {
            if let Err(e) = self.stop(&connection_id).await {
                failures.push(e);
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fakes::{EngineCall, FakeEngineFactory};
    use crate::test_utils::log_capture;

    #[tokio::test]
    async fn test_concurrent_starts_create_one_engine() {
        let factory = Arc::new(FakeEngineFactory::default());
        let cache = EngineCache::new(factory.clone());

        let (a, b) = tokio::join!(cache.get_or_start("myServer"), cache.get_or_start("myServer"));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a.engine, &b.engine));
        assert!(a.fresh ^ b.fresh);
        assert_eq!(factory.created("myServer"), 1);

        let again = cache.get_or_start("myServer").await.unwrap();
        assert!(!again.fresh);
        assert_eq!(factory.created("myServer"), 1);
    }

    #[tokio::test]
    async fn test_start_failure_is_logged_and_retried() {
        let logs = log_capture::start();
        let factory = Arc::new(FakeEngineFactory::default());
        factory.fail_for("broken");
        let cache = EngineCache::new(factory.clone());

        let err = cache.get_or_start("broken").await.unwrap_err();
        assert!(matches!(err, BindingError::EngineStart { .. }));
        assert!(logs.contains("Starting connected engine for 'broken'..."));
        assert!(logs.contains("Error starting connected engine for 'broken'"));
        assert!(!cache.is_running("broken"));

        assert!(cache.get_or_start("broken").await.is_err());
        assert_eq!(factory.attempts("broken"), 2);
    }

    #[tokio::test]
    async fn test_stop_removes_engine() {
        let factory = Arc::new(FakeEngineFactory::default());
        let cache = EngineCache::new(factory.clone());
        cache.get_or_start("a").await.unwrap();

        assert!(cache.stop("a").await.unwrap());
        assert!(!cache.is_running("a"));
        assert!(!cache.stop("a").await.unwrap());

        let engine = factory.engine("a").unwrap();
        assert_eq!(engine.count(|c| matches!(c, EngineCall::Stop(false))), 1);

        // A later start creates a new instance
        cache.get_or_start("a").await.unwrap();
        assert_eq!(factory.created("a"), 2);
    }

    #[tokio::test]
    async fn test_stop_all_isolates_failures() {
        let logs = log_capture::start();
        let factory = Arc::new(FakeEngineFactory::default());
        let cache = EngineCache::new(factory.clone());
        cache.get_or_start("myServer").await.unwrap();
        cache.get_or_start("myServer2").await.unwrap();
        factory.engine("myServer").unwrap().set_fail_stop(true);

        let failures = cache.stop_all().await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].connection_id(), Some("myServer"));
        for id in ["myServer", "myServer2"] {
            let engine = factory.engine(id).unwrap();
            assert_eq!(engine.count(|c| matches!(c, EngineCall::Stop(false))), 1);
        }
        assert!(cache.running_ids().is_empty());
        assert!(logs.contains("Unable to stop engine 'myServer'"));
        assert!(!logs.contains("Unable to stop engine 'myServer2'"));
    }

    #[tokio::test]
    async fn test_start_overlapping_stop_all_is_undone() {
        let logs = log_capture::start();
        let factory = Arc::new(FakeEngineFactory::default());
        let release = factory.hold_next_start();
        let cache = EngineCache::new(factory.clone());

        let (started, failures) = tokio::join!(cache.get_or_start("a"), async {
            while factory.attempts("a") == 0 {
                tokio::task::yield_now().await;
            }
            let failures = cache.stop_all().await;
            release.notify_one();
            failures
        });

        assert!(failures.is_empty());
        assert!(matches!(started, Err(BindingError::StartAborted(ref id)) if id == "a"));
        assert_eq!(factory.engine("a").unwrap().stop_count(), 1);
        assert!(!cache.is_running("a"));
        assert!(logs.contains("Stopping connected engine for 'a' started during shutdown"));

        // Starts after the shutdown are not affected
        let started = cache.get_or_start("a").await.unwrap();
        assert!(started.fresh);
        assert_eq!(factory.created("a"), 2);
    }

    #[tokio::test]
    async fn test_retire_detaches_before_stop() {
        let factory = Arc::new(FakeEngineFactory::default());
        let cache = EngineCache::new(factory.clone());
        cache.get_or_start("a").await.unwrap();

        let detached = AtomicBool::new(false);
        let stopped = cache
            .retire("a", || detached.store(true, Ordering::SeqCst))
            .await
            .unwrap();
        assert!(stopped);
        assert!(detached.load(Ordering::SeqCst));
    }
}
