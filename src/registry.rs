//! Project name → [`BotInstance`] map.
//!
//! The registry discovers projects in durable storage and keeps exactly one
//! live bot per project. Its lock guards the map only; cold starts and
//! storage calls happen outside it, and a project that loses a concurrent
//! registration race has its freshly built instance shut down again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bot::{self, BotInstance};
use crate::config::{BotSettings, ProjectConfig};
use crate::error::{Error, Result};
use crate::matcher::Match;
use crate::models::{CorpusEntry, CorpusFilter, Project};
use crate::storage::Storage;

pub struct BotRegistry {
    storage: Arc<dyn Storage>,
    settings: BotSettings,
    bots: Mutex<HashMap<String, Arc<BotInstance>>>,
    refreshing: AtomicBool,
}

/// Clears the in-flight refresh flag, also when the refresh panics.
struct RefreshFlag<'a>(&'a AtomicBool);

impl Drop for RefreshFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BotRegistry {
    pub fn new(storage: Arc<dyn Storage>, settings: BotSettings) -> Self {
        Self {
            storage,
            settings,
            bots: Mutex::new(HashMap::new()),
            refreshing: AtomicBool::new(false),
        }
    }

    fn bots(&self) -> MutexGuard<'_, HashMap<String, Arc<BotInstance>>> {
        self.bots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn settings(&self) -> &BotSettings {
        &self.settings
    }

    /// Starts a bot for every stored project that does not have one yet.
    ///
    /// Projects with an empty name are skipped. A project whose config is
    /// invalid or whose cold start fails is logged and left unregistered, so
    /// the next call retries it. Returns the number of bots registered.
    pub async fn initialize(&self) -> Result<usize> {
        let projects = self.storage.list_projects().await?;

        let mut registered = 0;
        for project in projects {
            let name = project.name.trim();
            if name.is_empty() || self.get(name).is_some() {
                continue;
            }

            let config = match ProjectConfig::parse(name, &project.config) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(project = %name, error = %e, "skipping project");
                    continue;
                }
            };

            let bot = Arc::new(BotInstance::new(
                name,
                config,
                self.storage.clone(),
                &self.settings,
            ));
            bot.warm_start();
            if let Err(e) = bot.cold_start().await {
                tracing::error!(project = %name, error = %e, "cold start failed");
                continue;
            }

            let live = self.register(name, bot.clone());
            if Arc::ptr_eq(&live, &bot) {
                registered += 1;
            } else {
                tracing::debug!(project = %name, "already registered, discarding duplicate");
                bot.shutdown().await;
            }
        }

        if registered > 0 {
            tracing::info!(registered, total = self.len(), "projects registered");
        }
        Ok(registered)
    }

    /// Picks up projects added since the last [`initialize`](Self::initialize).
    /// Existing bots are left alone.
    pub async fn refresh(&self) -> Result<usize> {
        self.initialize().await
    }

    /// Spawns a [`refresh`](Self::refresh) unless one is already running.
    /// Returns `false` when a refresh was already in flight.
    pub fn refresh_in_background(self: &Arc<Self>) -> bool {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let registry = self.clone();
        tokio::spawn(async move {
            let _flag = RefreshFlag(&registry.refreshing);
            if let Err(e) = registry.refresh().await {
                tracing::warn!(error = %e, "background refresh failed");
            }
        });
        true
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    pub fn get(&self, project: &str) -> Option<Arc<BotInstance>> {
        self.bots().get(project).cloned()
    }

    /// Inserts `bot` unless the project already has one, and returns the
    /// bot that is registered afterwards.
    pub fn register(&self, project: &str, bot: Arc<BotInstance>) -> Arc<BotInstance> {
        self.bots()
            .entry(project.to_string())
            .or_insert(bot)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.bots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots().is_empty()
    }

    /// Registered project names, sorted.
    pub fn project_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bots().keys().cloned().collect();
        names.sort();
        names
    }

    /// The bot for `project`, or `NotFound`.
    pub fn bot(&self, project: &str) -> Result<Arc<BotInstance>> {
        self.get(project)
            .ok_or_else(|| Error::not_found("project", project))
    }

    pub async fn query(&self, project: &str, text: &str) -> Result<Vec<Match>> {
        self.bot(project)?.query(text).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.storage.list_projects().await?)
    }

    pub async fn list_corpus(
        &self,
        filter: &CorpusFilter,
        offset: i64,
        limit: Option<i64>,
    ) -> Result<Vec<CorpusEntry>> {
        Ok(self.storage.find_corpus_rows(filter, offset, limit).await?)
    }

    pub async fn record_feedback(&self, cid: i64, accepted: bool) -> Result<()> {
        bot::record_feedback(self.storage.as_ref(), cid, accepted).await
    }

    /// Stops every bot's resync loop.
    pub async fn shutdown_all(&self) {
        let bots: Vec<Arc<BotInstance>> = self.bots().values().cloned().collect();
        for bot in bots {
            bot.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn registry(storage: Arc<InMemoryStorage>) -> Arc<BotRegistry> {
        Arc::new(BotRegistry::new(storage, BotSettings::default()))
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.add_project("DMS", "");
        storage.add_project("", "");
        let registry = registry(storage.clone());

        assert_eq!(registry.initialize().await.unwrap(), 1);
        let first = registry.get("DMS").unwrap();

        storage.add_project("OPS", r#"{"driver":"sqlite3"}"#);
        assert_eq!(registry.refresh().await.unwrap(), 1);
        assert_eq!(registry.project_names(), vec!["DMS", "OPS"]);
        assert!(Arc::ptr_eq(&first, &registry.get("DMS").unwrap()));

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_invalid_project_config_is_skipped() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.add_project("BAD", r#"{"driver":"oracle"}"#);
        storage.add_project("DMS", "");
        let registry = registry(storage.clone());

        assert_eq!(registry.initialize().await.unwrap(), 1);
        assert!(registry.get("BAD").is_none());

        storage.add_project("BAD", "");
        assert_eq!(registry.refresh().await.unwrap(), 1);
        assert!(registry.get("BAD").is_some());
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_background_refresh_runs_one_at_a_time() {
        let storage = Arc::new(InMemoryStorage::new());
        let registry = registry(storage.clone());
        storage.add_project("LATE", "");

        assert!(registry.refresh_in_background());
        assert!(!registry.refresh_in_background());
        assert!(!registry.refresh_in_background());

        for _ in 0..50 {
            if !registry.is_refreshing() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!registry.is_refreshing());
        assert_eq!(registry.project_names(), vec!["LATE"]);

        assert!(registry.refresh_in_background());
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_register_twice_keeps_first() {
        let storage = Arc::new(InMemoryStorage::new());
        let registry = registry(storage.clone());
        let make = || {
            Arc::new(BotInstance::new(
                "DMS",
                ProjectConfig::default(),
                storage.clone(),
                &BotSettings::default(),
            ))
        };

        let a = make();
        let b = make();
        assert!(Arc::ptr_eq(&registry.register("DMS", a.clone()), &a));
        assert!(Arc::ptr_eq(&registry.register("DMS", b), &a));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_initialize_leaves_one_instance() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.add_project("DMS", "");
        let registry = registry(storage);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.initialize().await.unwrap() })
            })
            .collect();
        let mut registered = 0;
        for handle in handles {
            registered += handle.await.unwrap();
        }

        assert_eq!(registered, 1);
        assert_eq!(registry.len(), 1);
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_query_unknown_project() {
        let registry = registry(Arc::new(InMemoryStorage::new()));
        assert!(matches!(
            registry.query("NOPE", "hello").await,
            Err(Error::NotFound { kind: "project", .. })
        ));
    }
}
