//! SQLite-backed [`Storage`] implementation.
//!
//! Wraps a [`SqlitePool`] and maps every `Storage` operation onto the
//! `projects`, `corpus` and `feedback` tables created by
//! [`run_migrations`](crate::migrate::run_migrations).

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::{Storage, StorageResult};
use crate::config::Config;
use crate::db;
use crate::error::StorageError;
use crate::migrate;
use crate::models::{CorpusEntry, CorpusFilter, Counter, Feedback, Project};

const CORPUS_COLUMNS: &str = "id, project, class, question, answer, sample, creator, principal, \
     reviser, accept_count, reject_count, kind, state, created_at, updated_at";

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connects to the configured database and ensures the schema exists.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates a project, or replaces the config of an existing one.
    pub async fn add_project(&self, name: &str, config: &str) -> StorageResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO projects (name, config) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET config = excluded.config
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(config)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn corpus_from_row(row: &SqliteRow) -> StorageResult<CorpusEntry> {
    let kind: String = row.try_get("kind")?;
    let state: String = row.try_get("state")?;
    Ok(CorpusEntry {
        id: row.try_get("id")?,
        project: row.try_get("project")?,
        class: row.try_get("class")?,
        question: row.try_get("question")?,
        answer: row.try_get("answer")?,
        sample: row.try_get("sample")?,
        creator: row.try_get("creator")?,
        principal: row.try_get("principal")?,
        reviser: row.try_get("reviser")?,
        accept_count: row.try_get("accept_count")?,
        reject_count: row.try_get("reject_count")?,
        kind: kind.parse().map_err(StorageError::Malformed)?,
        state: state.parse().map_err(StorageError::Malformed)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &CorpusFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(id) = filter.id {
        qb.push(" AND id = ").push_bind(id);
    }
    if let Some(project) = &filter.project {
        qb.push(" AND project = ").push_bind(project.clone());
    }
    if let Some(class) = &filter.class {
        qb.push(" AND class = ").push_bind(class.clone());
    }
    if let Some(question) = &filter.question {
        qb.push(" AND question = ").push_bind(question.clone());
    }
    if let Some(search) = &filter.search {
        qb.push(" AND instr(question, ")
            .push_bind(search.clone())
            .push(") > 0");
    }
    if let Some(kind) = filter.kind {
        qb.push(" AND kind = ").push_bind(kind.as_str());
    }
    if let Some(state) = filter.state {
        qb.push(" AND state = ").push_bind(state.as_str());
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn list_projects(&self) -> StorageResult<Vec<Project>> {
        let rows = sqlx::query("SELECT id, name, config FROM projects ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> StorageResult<Project> {
                Ok(Project {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    config: row.try_get("config")?,
                })
            })
            .collect()
    }

    async fn find_corpus_rows(
        &self,
        filter: &CorpusFilter,
        offset: i64,
        limit: Option<i64>,
    ) -> StorageResult<Vec<CorpusEntry>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM corpus", CORPUS_COLUMNS));
        push_filter(&mut qb, filter);
        // SQLite treats a negative LIMIT as "no limit"
        qb.push(" ORDER BY id ASC LIMIT ")
            .push_bind(limit.unwrap_or(-1))
            .push(" OFFSET ")
            .push_bind(offset.max(0));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(corpus_from_row).collect()
    }

    async fn upsert_corpus_row(&self, row: &CorpusEntry) -> StorageResult<Option<i64>> {
        let now = now();

        if row.id > 0 {
            let result = sqlx::query(
                r#"
                UPDATE corpus SET
                    project = ?, class = ?, question = ?, answer = ?, sample = ?,
                    creator = ?, principal = ?, reviser = ?, kind = ?, state = ?,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&row.project)
            .bind(&row.class)
            .bind(&row.question)
            .bind(&row.answer)
            .bind(&row.sample)
            .bind(&row.creator)
            .bind(&row.principal)
            .bind(&row.reviser)
            .bind(row.kind.as_str())
            .bind(row.state.as_str())
            .bind(now)
            .bind(row.id)
            .execute(&self.pool)
            .await?;
            return Ok((result.rows_affected() > 0).then_some(row.id));
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO corpus (project, class, question, answer, sample, creator,
                                principal, reviser, kind, state, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(project, class, question) DO UPDATE SET
                answer = excluded.answer,
                sample = excluded.sample,
                creator = excluded.creator,
                principal = excluded.principal,
                reviser = excluded.reviser,
                kind = excluded.kind,
                state = excluded.state,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(&row.project)
        .bind(&row.class)
        .bind(&row.question)
        .bind(&row.answer)
        .bind(&row.sample)
        .bind(&row.creator)
        .bind(&row.principal)
        .bind(&row.reviser)
        .bind(row.kind.as_str())
        .bind(row.state.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(id))
    }

    async fn modify_corpus_row(
        &self,
        id: i64,
        question: &str,
        answer: &str,
    ) -> StorageResult<bool> {
        let result =
            sqlx::query("UPDATE corpus SET question = ?, answer = ?, updated_at = ? WHERE id = ?")
                .bind(question)
                .bind(answer)
                .bind(now())
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_corpus_row(&self, id: i64) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM corpus WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_feedback(&self, row: &Feedback) -> StorageResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO feedback (cid, project, class, question, answer, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(row.cid)
        .bind(&row.project)
        .bind(&row.class)
        .bind(&row.question)
        .bind(&row.answer)
        .bind(now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_feedback(&self, project: Option<&str>) -> StorageResult<Vec<Feedback>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, cid, project, class, question, answer, created_at FROM feedback",
        );
        if let Some(project) = project {
            qb.push(" WHERE project = ").push_bind(project.to_string());
        }
        qb.push(" ORDER BY id ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> StorageResult<Feedback> {
                Ok(Feedback {
                    id: row.try_get("id")?,
                    cid: row.try_get("cid")?,
                    project: row.try_get("project")?,
                    class: row.try_get("class")?,
                    question: row.try_get("question")?,
                    answer: row.try_get("answer")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn increment_counter(&self, id: i64, counter: Counter) -> StorageResult<bool> {
        let column = counter.column();
        let sql = format!(
            "UPDATE corpus SET {col} = {col} + 1, updated_at = ? WHERE id = ?",
            col = column
        );
        let result = sqlx::query(&sql)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CorpusKind, WorkflowState};
    use tempfile::TempDir;

    async fn open_temp(tmp: &TempDir) -> SqliteStorage {
        let config: Config = toml::from_str(&format!(
            "[db]\npath = \"{}\"\n[server]\nbind = \"127.0.0.1:0\"\n",
            tmp.path().join("bot.sqlite").display()
        ))
        .unwrap();
        SqliteStorage::open(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_projects_round_trip() {
        let tmp = TempDir::new().unwrap();
        let storage = open_temp(&tmp).await;

        let id = storage.add_project("DMS", r#"{"driver":"sqlite3"}"#).await.unwrap();
        let again = storage.add_project("DMS", "").await.unwrap();
        assert_eq!(id, again);

        let projects = storage.list_projects().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "DMS");
        assert_eq!(projects[0].config, "");
    }

    #[tokio::test]
    async fn test_upsert_find_and_counters() {
        let tmp = TempDir::new().unwrap();
        let storage = open_temp(&tmp).await;

        let id = storage
            .upsert_corpus_row(&CorpusEntry::qa("DMS", "ops", "slow deploy？", "check logs"))
            .await
            .unwrap()
            .unwrap();
        let same = storage
            .upsert_corpus_row(&CorpusEntry::qa("DMS", "ops", "slow deploy？", "read the logs"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, same);

        assert!(storage.increment_counter(id, Counter::Accept).await.unwrap());
        assert!(storage.increment_counter(id, Counter::Accept).await.unwrap());
        assert!(storage.increment_counter(id, Counter::Reject).await.unwrap());
        assert!(!storage.increment_counter(999, Counter::Accept).await.unwrap());

        let row = storage.get_corpus_row(id).await.unwrap().unwrap();
        assert_eq!(row.answer, "read the logs");
        assert_eq!(row.accept_count, 2);
        assert_eq!(row.reject_count, 1);
        assert_eq!(row.kind, CorpusKind::Qa);
        assert_eq!(row.state, WorkflowState::Custom);
    }

    #[tokio::test]
    async fn test_filters() {
        let tmp = TempDir::new().unwrap();
        let storage = open_temp(&tmp).await;

        storage
            .upsert_corpus_row(&CorpusEntry::qa("DMS", "ops", "slow deploy?", "a"))
            .await
            .unwrap();
        let mut req = CorpusEntry::qa("DMS", "ops", "add dark mode?", "");
        req.kind = CorpusKind::Requirement;
        req.state = WorkflowState::Received;
        storage.upsert_corpus_row(&req).await.unwrap();
        storage
            .upsert_corpus_row(&CorpusEntry::qa("OTHER", "ops", "slow deploy?", "b"))
            .await
            .unwrap();

        let indexable = storage
            .find_corpus_rows(&CorpusFilter::indexable("DMS"), 0, None)
            .await
            .unwrap();
        assert_eq!(indexable.len(), 1);
        assert_eq!(indexable[0].question, "slow deploy?");

        let search = CorpusFilter {
            search: Some("deploy".into()),
            ..Default::default()
        };
        assert_eq!(storage.find_corpus_rows(&search, 0, None).await.unwrap().len(), 2);
        assert_eq!(storage.find_corpus_rows(&search, 1, Some(5)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_modify_delete_and_feedback() {
        let tmp = TempDir::new().unwrap();
        let storage = open_temp(&tmp).await;

        let id = storage
            .upsert_corpus_row(&CorpusEntry::qa("DMS", "ops", "old?", "old"))
            .await
            .unwrap()
            .unwrap();
        assert!(storage.modify_corpus_row(id, "new?", "new").await.unwrap());
        assert!(!storage.modify_corpus_row(id + 1, "x", "y").await.unwrap());
        assert_eq!(storage.get_corpus_row(id).await.unwrap().unwrap().question, "new?");

        let mut unknown = CorpusEntry::qa("DMS", "ops", "q?", "a");
        unknown.id = id + 100;
        assert_eq!(storage.upsert_corpus_row(&unknown).await.unwrap(), None);

        assert!(storage.delete_corpus_row(id).await.unwrap());
        assert!(!storage.delete_corpus_row(id).await.unwrap());

        let fid = storage
            .insert_feedback(&Feedback {
                question: "anything?".into(),
                project: "DMS".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let feedback = storage.list_feedback(Some("DMS")).await.unwrap();
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].id, fid);
        assert_eq!(feedback[0].cid, 0);
        assert!(storage.list_feedback(Some("OTHER")).await.unwrap().is_empty());
    }
}
