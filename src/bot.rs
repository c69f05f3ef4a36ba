//! Per-project bot instance.
//!
//! A [`BotInstance`] owns one project's [`CorpusStore`], the [`MatchEngine`]
//! reading it and the [`Trainer`] writing it, and drives their lifecycle:
//!
//! 1. **Cold start:** import corpus files into durable storage, run one full
//!    resync, start the background loop.
//! 2. **Resync:** reload every indexable row and re-index from scratch.
//! 3. **Background loop:** resync every `resync_interval`; a failed or
//!    panicked iteration is logged and the loop keeps going.
//! 4. **Mutations:** add/remove/modify write durable storage first and then
//!    apply a targeted update to the live index.
//!
//! Every writer of the staged index (resync and the mutations) holds the
//! instance's `index_writer` mutex, so an incremental update can never be
//! wiped out by a resync that read storage before the update landed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{BotSettings, ProjectConfig};
use crate::corpus_files::{find_corpus_files, load_corpora};
use crate::corpus_store::CorpusStore;
use crate::error::{Error, Result};
use crate::matcher::{Match, MatchEngine};
use crate::models::{CorpusEntry, CorpusFilter, CorpusKind, Counter, Feedback, WorkflowState};
use crate::question::{ensure_question_mark, phrase_group, validate_question, IndexedQuestion};
use crate::storage::Storage;
use crate::trainer::{PhraseCorpus, Trainer};

pub struct BotInstance {
    project: String,
    config: ProjectConfig,
    storage: Arc<dyn Storage>,
    store: Arc<CorpusStore>,
    engine: MatchEngine,
    trainer: Trainer,
    index_writer: tokio::sync::Mutex<()>,
    resync_interval: Duration,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BotInstance {
    pub fn new(
        project: impl Into<String>,
        config: ProjectConfig,
        storage: Arc<dyn Storage>,
        settings: &BotSettings,
    ) -> Self {
        let project = project.into();
        let snapshot = config.snapshot_path(&project, settings.snapshot_dir.as_deref());
        let store = Arc::new(CorpusStore::new(project.clone(), snapshot));
        let engine = MatchEngine::new(store.clone(), settings.top_k)
            .with_min_confidence(settings.min_confidence);
        let trainer = Trainer::new(store.clone());

        Self {
            project,
            config,
            storage,
            store,
            engine,
            trainer,
            index_writer: tokio::sync::Mutex::new(()),
            resync_interval: settings.resync_interval,
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CorpusStore> {
        &self.store
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Publishes the snapshot, if there is one, so the instance can answer
    /// before its first resync. Failures are logged and ignored.
    pub fn warm_start(&self) -> usize {
        match self.store.load_snapshot() {
            Ok(0) => 0,
            Ok(n) => {
                tracing::info!(project = %self.project, questions = n, "warm start from snapshot");
                n
            }
            Err(e) => {
                tracing::warn!(project = %self.project, error = %e, "ignoring unreadable snapshot");
                0
            }
        }
    }

    /// Imports corpus files, runs a full resync and starts the resync loop.
    ///
    /// A resync failure is returned and the loop is not started; the caller
    /// must not register the instance.
    pub async fn cold_start(self: &Arc<Self>) -> Result<usize> {
        let imported = self.import_corpus_files().await?;
        let indexed = self.resync().await?;
        self.start_resync_loop();
        tracing::info!(
            project = %self.project,
            imported,
            indexed,
            "bot instance started"
        );
        Ok(indexed)
    }

    /// Upserts every pair from the configured corpus directory. Unreadable
    /// files count as no files.
    pub async fn import_corpus_files(&self) -> Result<usize> {
        let Some(dir) = &self.config.dir_corpus else {
            return Ok(0);
        };

        let data = match find_corpus_files(dir) {
            Ok(files) => load_corpora(&files),
            Err(e) => {
                tracing::warn!(
                    project = %self.project,
                    dir = %dir.display(),
                    error = %e,
                    "skipping corpus files"
                );
                return Ok(0);
            }
        };

        let mut imported = 0;
        for (class, pairs) in &data {
            for (question, answer) in pairs {
                let row = CorpusEntry {
                    creator: "corpus".to_string(),
                    ..CorpusEntry::qa(&self.project, class, question, answer)
                };
                if self.storage.upsert_corpus_row(&row).await?.is_some() {
                    imported += 1;
                }
            }
        }
        Ok(imported)
    }

    /// Reloads every indexable row and rebuilds the index from scratch.
    ///
    /// The previously published index keeps serving until the rebuild is
    /// done; on a storage failure it stays in place untouched.
    pub async fn resync(&self) -> Result<usize> {
        let _writer = self.index_writer.lock().await;

        let rows = self
            .storage
            .find_corpus_rows(&CorpusFilter::indexable(&self.project), 0, None)
            .await?;

        let mut corpus = PhraseCorpus::new();
        let groups = corpus.entry(self.project.clone()).or_default();
        for row in &rows {
            let derived = IndexedQuestion::from_entry(row);
            if !derived.is_empty() {
                groups.push(phrase_group(&derived));
            }
        }

        self.store.reset();
        let indexed = self.trainer.train_with_corpus(&corpus)?;
        if let Err(e) = self.store.sync() {
            tracing::warn!(project = %self.project, error = %e, "failed to write snapshot");
        }

        tracing::debug!(project = %self.project, rows = rows.len(), indexed, "resync done");
        Ok(indexed)
    }

    /// Spawns the periodic resync task. Calling it again is a no-op.
    ///
    /// The task only holds a weak reference, so it also ends once the
    /// instance is dropped.
    pub fn start_resync_loop(self: &Arc<Self>) {
        let mut task = lock(&self.task);
        if task.is_some() {
            return;
        }

        let bot = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.resync_interval;
        let project = self.project.clone();

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.notified() => break,
                    _ = ticker.tick() => {}
                }

                let Some(bot) = bot.upgrade() else {
                    break;
                };

                // Own task per iteration: a panic comes back as a JoinError.
                let iteration = tokio::spawn(async move { bot.resync().await });
                match iteration.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(project = %project, error = %e, "resync failed, keeping last index");
                    }
                    Err(e) => {
                        tracing::error!(project = %project, error = %e, "resync panicked, keeping last index");
                    }
                }
            }

            tracing::info!(project = %project, "resync loop stopped");
        }));
    }

    pub fn is_resyncing(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the resync loop and waits for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(project = %self.project, error = %e, "resync loop ended abnormally");
            }
        }
    }

    /// Ranks stored answers for `text`.
    ///
    /// An empty result means "no confident answer". Feedback is not
    /// recorded here.
    pub async fn query(&self, text: &str) -> Result<Vec<Match>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::invalid("query must not be empty"));
        }

        let text = ensure_question_mark(text);
        if !self.engine.can_process(&text) {
            return Ok(Vec::new());
        }
        self.engine.process(&text)
    }

    /// Inserts or updates a corpus row and makes it searchable right away.
    ///
    /// Rows are keyed by `id` when it is set, else by `(class, question)`.
    /// Requirements without a workflow state start out as `received`.
    /// Returns the row as stored.
    pub async fn add_corpus(&self, mut entry: CorpusEntry) -> Result<CorpusEntry> {
        self.claim(&mut entry.project)?;
        entry.question = entry.question.trim().to_string();
        if entry.question.is_empty() {
            return Err(Error::invalid("question must not be empty"));
        }
        validate_question(&entry.question)?;
        if entry.id < 0 {
            return Err(Error::invalid("id must not be negative"));
        }
        if entry.kind == CorpusKind::Requirement && entry.state == WorkflowState::Custom {
            entry.state = WorkflowState::Received;
        }

        let _writer = self.index_writer.lock().await;

        let previous = if entry.id > 0 {
            self.storage.get_corpus_row(entry.id).await?
        } else {
            let filter = CorpusFilter {
                class: Some(entry.class.clone()),
                question: Some(entry.question.clone()),
                ..CorpusFilter::project(&self.project)
            };
            self.storage.find_corpus_rows(&filter, 0, Some(1)).await?.pop()
        };
        if let Some(previous) = &previous {
            if previous.project != self.project {
                return Err(Error::not_found("corpus", entry.id));
            }
        }

        let id = self
            .storage
            .upsert_corpus_row(&entry)
            .await?
            .ok_or_else(|| Error::not_found("corpus", entry.id))?;
        let stored = self
            .storage
            .get_corpus_row(id)
            .await?
            .ok_or_else(|| Error::not_found("corpus", id))?;

        self.reindex(previous.as_ref(), Some(&stored));
        tracing::debug!(project = %self.project, id, "corpus row added");
        Ok(stored)
    }

    /// Deletes the row named by `id`, or every row of this project whose
    /// question is exactly `question`. Exactly one must be supplied.
    ///
    /// Returns the removed rows.
    pub async fn remove_corpus(
        &self,
        id: Option<i64>,
        question: Option<&str>,
    ) -> Result<Vec<CorpusEntry>> {
        let question = question.map(str::trim).filter(|q| !q.is_empty());

        let _writer = self.index_writer.lock().await;

        let rows: Vec<CorpusEntry> = match (id, question) {
            (Some(id), None) => {
                if id <= 0 {
                    return Err(Error::invalid("id must be positive"));
                }
                self.storage
                    .get_corpus_row(id)
                    .await?
                    .filter(|row| row.project == self.project)
                    .into_iter()
                    .collect()
            }
            (None, Some(question)) => {
                let filter = CorpusFilter {
                    question: Some(question.to_string()),
                    ..CorpusFilter::project(&self.project)
                };
                self.storage.find_corpus_rows(&filter, 0, None).await?
            }
            (Some(_), Some(_)) => {
                return Err(Error::invalid("give either an id or a question, not both"));
            }
            (None, None) => return Err(Error::invalid("an id or a question is required")),
        };

        if rows.is_empty() {
            let name = match (id, question) {
                (Some(id), _) => id.to_string(),
                (_, Some(q)) => q.to_string(),
                _ => String::new(),
            };
            return Err(Error::not_found("corpus", name));
        }

        // Rows deleted before a failure still leave the index.
        let mut removed = Vec::with_capacity(rows.len());
        let mut failure = None;
        for row in rows {
            match self.storage.delete_corpus_row(row.id).await {
                Ok(true) => removed.push(row),
                Ok(false) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut touched = false;
        for row in removed.iter().filter(|r| r.is_indexable()) {
            for q in IndexedQuestion::from_entry(row) {
                touched |= self.store.remove_answer(&q.question, &q.token);
            }
        }
        if touched {
            self.store.build_index();
        }

        tracing::debug!(project = %self.project, removed = removed.len(), "corpus rows removed");
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(removed),
        }
    }

    /// Rewrites a row's question and answer and swaps its phrasings in the
    /// live index.
    pub async fn modify_corpus(&self, id: i64, question: &str, answer: &str) -> Result<CorpusEntry> {
        if id <= 0 {
            return Err(Error::invalid("id must be positive"));
        }
        let question = question.trim();
        if question.is_empty() {
            return Err(Error::invalid("question must not be empty"));
        }
        validate_question(question)?;

        let _writer = self.index_writer.lock().await;

        let previous = self
            .storage
            .get_corpus_row(id)
            .await?
            .filter(|row| row.project == self.project)
            .ok_or_else(|| Error::not_found("corpus", id))?;

        if !self.storage.modify_corpus_row(id, question, answer).await? {
            return Err(Error::not_found("corpus", id));
        }

        let modified = CorpusEntry {
            question: question.to_string(),
            answer: answer.to_string(),
            ..previous.clone()
        };
        self.reindex(Some(&previous), Some(&modified));
        Ok(modified)
    }

    /// Bumps the accept or reject counter of a corpus row.
    pub async fn record_feedback(&self, cid: i64, accepted: bool) -> Result<()> {
        record_feedback(self.storage.as_ref(), cid, accepted).await
    }

    /// Stores what a user asked and was shown. The project is always this
    /// instance's; the class is copied from the referenced row when unset.
    pub async fn add_feedback(&self, mut feedback: Feedback) -> Result<i64> {
        feedback.project = self.project.clone();
        if feedback.class.is_empty() && feedback.cid > 0 {
            if let Some(row) = self.storage.get_corpus_row(feedback.cid).await? {
                feedback.class = row.class;
            }
        }
        Ok(self.storage.insert_feedback(&feedback).await?)
    }

    /// Lists this project's corpus rows.
    pub async fn list_corpus(
        &self,
        mut filter: CorpusFilter,
        offset: i64,
        limit: Option<i64>,
    ) -> Result<Vec<CorpusEntry>> {
        filter.project = Some(self.project.clone());
        Ok(self.storage.find_corpus_rows(&filter, offset, limit).await?)
    }

    /// Fills in an empty project name, and rejects a foreign one.
    fn claim(&self, project: &mut String) -> Result<()> {
        if project.is_empty() {
            *project = self.project.clone();
            Ok(())
        } else if *project == self.project {
            Ok(())
        } else {
            Err(Error::invalid(format!(
                "row belongs to project '{}', not '{}'",
                project, self.project
            )))
        }
    }

    /// Replaces `old`'s tokens with `new`'s. Caller holds `index_writer`.
    fn reindex(&self, old: Option<&CorpusEntry>, new: Option<&CorpusEntry>) {
        let mut touched = false;
        if let Some(old) = old.filter(|r| r.is_indexable()) {
            for q in IndexedQuestion::from_entry(old) {
                touched |= self.store.remove_answer(&q.question, &q.token);
            }
        }
        if let Some(new) = new.filter(|r| r.is_indexable()) {
            for q in IndexedQuestion::from_entry(new) {
                self.store.update(&q.question, [q.token]);
                touched = true;
            }
        }
        if touched {
            self.store.build_index();
        }
    }
}

/// Bumps a row's accept or reject counter.
pub async fn record_feedback(storage: &dyn Storage, cid: i64, accepted: bool) -> Result<()> {
    if cid <= 0 {
        return Err(Error::invalid("corpus id must be positive"));
    }
    if storage
        .increment_counter(cid, Counter::from_accepted(accepted))
        .await?
    {
        Ok(())
    } else {
        Err(Error::not_found("corpus", cid))
    }
}
