//! Durable storage abstraction.
//!
//! The [`Storage`] trait is everything the matching core needs from the
//! relational store: the project list, corpus rows, feedback rows and the
//! accept/reject counters. The core never retries; any failure is handed
//! back to the caller unchanged.
//!
//! Implementations must be `Send + Sync`; a single instance is shared by the
//! registry and every bot instance.
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`SqliteStorage`] | production, sqlx over a WAL-mode SQLite file |
//! | [`InMemoryStorage`] | tests and fakes, with fault injection |

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::models::{CorpusEntry, CorpusFilter, Counter, Feedback, Project};

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait Storage: Send + Sync {
    /// All projects, in id order.
    async fn list_projects(&self) -> StorageResult<Vec<Project>>;

    /// Corpus rows matching `filter`, in id order. `limit = None` returns
    /// everything after `offset`.
    async fn find_corpus_rows(
        &self,
        filter: &CorpusFilter,
        offset: i64,
        limit: Option<i64>,
    ) -> StorageResult<Vec<CorpusEntry>>;

    /// Inserts or updates a corpus row atomically and returns its id.
    ///
    /// With `row.id > 0` the row with that id is updated (`None` if it does
    /// not exist). Otherwise the row keyed by `(project, class, question)` is
    /// updated, or inserted when absent. Accept/reject counters are never
    /// written by an upsert.
    async fn upsert_corpus_row(&self, row: &CorpusEntry) -> StorageResult<Option<i64>>;

    /// Rewrites a row's question and answer. Returns `false` if absent.
    async fn modify_corpus_row(&self, id: i64, question: &str, answer: &str)
        -> StorageResult<bool>;

    /// Returns `false` if the row did not exist.
    async fn delete_corpus_row(&self, id: i64) -> StorageResult<bool>;

    /// Returns the new feedback id.
    async fn insert_feedback(&self, row: &Feedback) -> StorageResult<i64>;

    /// Feedback rows, optionally restricted to one project, in id order.
    async fn list_feedback(&self, project: Option<&str>) -> StorageResult<Vec<Feedback>>;

    /// Adds one to a row's accept or reject counter. Returns `false` if absent.
    async fn increment_counter(&self, id: i64, counter: Counter) -> StorageResult<bool>;

    async fn get_corpus_row(&self, id: i64) -> StorageResult<Option<CorpusEntry>> {
        let filter = CorpusFilter {
            id: Some(id),
            ..Default::default()
        };
        Ok(self.find_corpus_rows(&filter, 0, Some(1)).await?.pop())
    }
}
