use anyhow::Result;
use sqlx::SqlitePool;

/// Creates the projects, corpus and feedback tables. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            config TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    // (project, class, question) is the upsert key for rows without an id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS corpus (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project TEXT NOT NULL,
            class TEXT NOT NULL DEFAULT '',
            question TEXT NOT NULL,
            answer TEXT NOT NULL DEFAULT '',
            sample TEXT NOT NULL DEFAULT '',
            creator TEXT NOT NULL DEFAULT '',
            principal TEXT NOT NULL DEFAULT '',
            reviser TEXT NOT NULL DEFAULT '',
            accept_count INTEGER NOT NULL DEFAULT 0,
            reject_count INTEGER NOT NULL DEFAULT 0,
            kind TEXT NOT NULL DEFAULT 'qa',
            state TEXT NOT NULL DEFAULT 'custom',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(project, class, question)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feedback (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cid INTEGER NOT NULL DEFAULT 0,
            project TEXT NOT NULL DEFAULT '',
            class TEXT NOT NULL DEFAULT '',
            question TEXT NOT NULL,
            answer TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_corpus_project_kind ON corpus(project, kind, state)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_feedback_project ON feedback(project)")
        .execute(pool)
        .await?;

    Ok(())
}
