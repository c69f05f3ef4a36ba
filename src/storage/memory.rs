//! In-memory [`Storage`] implementation for tests and fakes.
//!
//! Everything sits behind one `std::sync::Mutex`, which makes every
//! operation (including the question/class upsert) atomic.
//! [`InMemoryStorage::set_unavailable`] makes every call fail until cleared.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Storage, StorageResult};
use crate::error::StorageError;
use crate::models::{CorpusEntry, CorpusFilter, Counter, Feedback, Project};

#[derive(Default)]
struct State {
    projects: Vec<Project>,
    corpus: BTreeMap<i64, CorpusEntry>,
    feedback: Vec<Feedback>,
    next_corpus_id: i64,
    next_feedback_id: i64,
    unavailable: Option<String>,
}

impl State {
    fn check(&self) -> StorageResult<()> {
        match &self.unavailable {
            Some(reason) => Err(StorageError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct InMemoryStorage {
    state: Mutex<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds (or reconfigures) a project and returns its id.
    pub fn add_project(&self, name: &str, config: &str) -> i64 {
        let mut state = self.state();
        if let Some(p) = state.projects.iter_mut().find(|p| p.name == name) {
            p.config = config.to_string();
            return p.id;
        }
        let id = state.projects.len() as i64 + 1;
        state.projects.push(Project {
            id,
            name: name.to_string(),
            config: config.to_string(),
        });
        id
    }

    /// Makes every subsequent call fail with [`StorageError::Unavailable`]
    /// (`None` restores normal operation).
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.state().unavailable = reason.map(str::to_string);
    }

    pub fn corpus_len(&self) -> usize {
        self.state().corpus.len()
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Copies the upsertable columns, leaving id, counters and created_at alone.
fn apply_row(target: &mut CorpusEntry, row: &CorpusEntry) {
    target.project = row.project.clone();
    target.class = row.class.clone();
    target.question = row.question.clone();
    target.answer = row.answer.clone();
    target.sample = row.sample.clone();
    target.creator = row.creator.clone();
    target.principal = row.principal.clone();
    target.reviser = row.reviser.clone();
    target.kind = row.kind;
    target.state = row.state;
    target.updated_at = now();
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn list_projects(&self) -> StorageResult<Vec<Project>> {
        let state = self.state();
        state.check()?;
        Ok(state.projects.clone())
    }

    async fn find_corpus_rows(
        &self,
        filter: &CorpusFilter,
        offset: i64,
        limit: Option<i64>,
    ) -> StorageResult<Vec<CorpusEntry>> {
        let state = self.state();
        state.check()?;
        let rows = state
            .corpus
            .values()
            .filter(|row| filter.matches(row))
            .skip(offset.max(0) as usize)
            .take(limit.map_or(usize::MAX, |l| l.max(0) as usize))
            .cloned()
            .collect();
        Ok(rows)
    }

    async fn upsert_corpus_row(&self, row: &CorpusEntry) -> StorageResult<Option<i64>> {
        let mut state = self.state();
        state.check()?;

        if row.id > 0 {
            return Ok(state.corpus.get_mut(&row.id).map(|existing| {
                apply_row(existing, row);
                existing.id
            }));
        }

        let existing = state.corpus.values_mut().find(|r| {
            r.project == row.project && r.class == row.class && r.question == row.question
        });
        if let Some(existing) = existing {
            apply_row(existing, row);
            return Ok(Some(existing.id));
        }

        state.next_corpus_id += 1;
        let id = state.next_corpus_id;
        let mut inserted = CorpusEntry {
            id,
            accept_count: 0,
            reject_count: 0,
            created_at: now(),
            ..Default::default()
        };
        apply_row(&mut inserted, row);
        state.corpus.insert(id, inserted);
        Ok(Some(id))
    }

    async fn modify_corpus_row(
        &self,
        id: i64,
        question: &str,
        answer: &str,
    ) -> StorageResult<bool> {
        let mut state = self.state();
        state.check()?;
        Ok(match state.corpus.get_mut(&id) {
            Some(row) => {
                row.question = question.to_string();
                row.answer = answer.to_string();
                row.updated_at = now();
                true
            }
            None => false,
        })
    }

    async fn delete_corpus_row(&self, id: i64) -> StorageResult<bool> {
        let mut state = self.state();
        state.check()?;
        Ok(state.corpus.remove(&id).is_some())
    }

    async fn insert_feedback(&self, row: &Feedback) -> StorageResult<i64> {
        let mut state = self.state();
        state.check()?;
        state.next_feedback_id += 1;
        let id = state.next_feedback_id;
        state.feedback.push(Feedback {
            id,
            created_at: now(),
            ..row.clone()
        });
        Ok(id)
    }

    async fn list_feedback(&self, project: Option<&str>) -> StorageResult<Vec<Feedback>> {
        let state = self.state();
        state.check()?;
        Ok(state
            .feedback
            .iter()
            .filter(|f| project.map_or(true, |p| f.project == p))
            .cloned()
            .collect())
    }

    async fn increment_counter(&self, id: i64, counter: Counter) -> StorageResult<bool> {
        let mut state = self.state();
        state.check()?;
        Ok(match state.corpus.get_mut(&id) {
            Some(row) => {
                match counter {
                    Counter::Accept => row.accept_count += 1,
                    Counter::Reject => row.reject_count += 1,
                }
                true
            }
            None => false,
        })
    }
}
