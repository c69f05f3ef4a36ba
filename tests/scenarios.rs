//! End-to-end behaviour of the matching core against both storage backends.

use std::sync::Arc;
use std::time::Duration;

use corpus_bot::config::{BotSettings, Config};
use corpus_bot::error::Error;
use corpus_bot::models::{CorpusEntry, CorpusFilter};
use corpus_bot::question::split_phrasings;
use corpus_bot::registry::BotRegistry;
use corpus_bot::server::answer_query;
use corpus_bot::storage::{InMemoryStorage, SqliteStorage, Storage};
use tempfile::TempDir;

async fn memory_registry(projects: &[&str]) -> (Arc<InMemoryStorage>, Arc<BotRegistry>) {
    let storage = Arc::new(InMemoryStorage::new());
    for p in projects {
        storage.add_project(p, "");
    }
    let registry = Arc::new(BotRegistry::new(storage.clone(), BotSettings::default()));
    registry.initialize().await.unwrap();
    (storage, registry)
}

#[tokio::test]
async fn test_dms_scenario() {
    let storage = Arc::new(InMemoryStorage::new());
    storage.add_project("DMS", "");
    let id = storage
        .upsert_corpus_row(&CorpusEntry::qa("DMS", "ops", "slow deploy？", "check logs"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, 1);

    let registry = Arc::new(BotRegistry::new(storage, BotSettings::default()));
    registry.initialize().await.unwrap();

    let matches = registry.query("DMS", "slow deploy").await.unwrap();
    assert_eq!(matches.len(), 1);
    let token = matches[0].decode().unwrap();
    assert_eq!(
        (token.question.as_str(), token.answer.as_str(), token.id),
        ("slow deploy？", "check logs", 1)
    );
    assert!(matches[0].confidence >= 0.9);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_empty_index_records_unanswered_query() {
    let (storage, registry) = memory_registry(&["DMS"]).await;

    assert!(registry.query("DMS", "anything?").await.unwrap().is_empty());

    let shown = answer_query(&registry, "DMS", "anything?", 0).await.unwrap();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].id, 0);

    let feedback = storage.list_feedback(Some("DMS")).await.unwrap();
    assert_eq!(feedback.len(), 1);
    assert_eq!(feedback[0].cid, 0);
    assert_eq!(feedback[0].question, "anything?");

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_concurrent_add_corpus_creates_one_row() {
    let (storage, registry) = memory_registry(&["DMS"]).await;
    let bot = registry.bot("DMS").unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let bot = bot.clone();
            tokio::spawn(async move {
                bot.add_corpus(CorpusEntry::qa(
                    "DMS",
                    "ops",
                    "slow deploy?",
                    format!("answer {}", i),
                ))
                .await
                .unwrap()
                .id
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(storage.corpus_len(), 1);

    let matches = registry.query("DMS", "slow deploy").await.unwrap();
    assert_eq!(matches.len(), 1, "stale answers left in the index");

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_feedback_is_monotonic() {
    let (storage, registry) = memory_registry(&["DMS"]).await;
    let row = registry
        .bot("DMS")
        .unwrap()
        .add_corpus(CorpusEntry::qa("DMS", "ops", "q?", "a"))
        .await
        .unwrap();

    for _ in 0..5 {
        registry.record_feedback(row.id, true).await.unwrap();
    }
    let stored = storage.get_corpus_row(row.id).await.unwrap().unwrap();
    assert_eq!(stored.accept_count, 5);
    assert_eq!(stored.reject_count, 0);

    assert!(matches!(
        registry.record_feedback(-3, true).await,
        Err(Error::InvalidArgument(_))
    ));

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_removed_question_is_never_returned() {
    let (_storage, registry) = memory_registry(&["DMS"]).await;
    let bot = registry.bot("DMS").unwrap();

    let row = bot
        .add_corpus(CorpusEntry::qa("DMS", "ops", "how to rollback|回滚", "press it"))
        .await
        .unwrap();
    let token_id = row.id;
    bot.remove_corpus(Some(row.id), None).await.unwrap();

    for q in ["how to rollback", "回滚"] {
        let matches = registry.query("DMS", q).await.unwrap();
        assert!(matches.iter().all(|m| m.decode().unwrap().id != token_id));
    }

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_projects_are_isolated() {
    let (_storage, registry) = memory_registry(&["DMS", "OPS"]).await;

    registry
        .bot("DMS")
        .unwrap()
        .add_corpus(CorpusEntry::qa("DMS", "ops", "slow deploy?", "check logs"))
        .await
        .unwrap();

    assert_eq!(registry.query("DMS", "slow deploy").await.unwrap().len(), 1);
    assert!(registry.query("OPS", "slow deploy").await.unwrap().is_empty());

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_resync_loop_keeps_last_index_while_storage_is_down() {
    let storage = Arc::new(InMemoryStorage::new());
    storage.add_project("DMS", "");
    storage
        .upsert_corpus_row(&CorpusEntry::qa("DMS", "ops", "slow deploy?", "check logs"))
        .await
        .unwrap();

    let settings = BotSettings {
        resync_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let registry = Arc::new(BotRegistry::new(storage.clone(), settings));
    registry.initialize().await.unwrap();

    storage.set_unavailable(Some("maintenance"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let matches = registry.query("DMS", "slow deploy").await.unwrap();
    assert_eq!(matches.len(), 1);
    assert!(registry.bot("DMS").unwrap().is_resyncing());

    storage.set_unavailable(None);
    registry.shutdown_all().await;
}

#[test]
fn test_every_phrasing_ends_with_a_question_mark() {
    for raw in ["a|b", "x｜y？", "line one\nline two\r\n", "  |  |done"] {
        for phrasing in split_phrasings(raw) {
            assert!(
                phrasing.ends_with('?') || phrasing.ends_with('？'),
                "{:?} from {:?}",
                phrasing,
                raw
            );
        }
    }
}

#[tokio::test]
async fn test_sqlite_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let config: Config = toml::from_str(&format!(
        "[db]\npath = \"{}\"\n[server]\nbind = \"127.0.0.1:0\"\n",
        tmp.path().join("bot.sqlite").display()
    ))
    .unwrap();

    let sqlite = SqliteStorage::open(&config).await.unwrap();
    sqlite.add_project("DMS", r#"{"driver":"sqlite3"}"#).await.unwrap();
    let storage: Arc<dyn Storage> = Arc::new(sqlite);

    let registry = Arc::new(BotRegistry::new(storage.clone(), config.bot_settings()));
    assert_eq!(registry.initialize().await.unwrap(), 1);
    let bot = registry.bot("DMS").unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let bot = bot.clone();
            tokio::spawn(async move {
                bot.add_corpus(CorpusEntry::qa("DMS", "ops", "slow deploy？", "check logs"))
                    .await
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
    let rows = registry
        .list_corpus(&CorpusFilter::project("DMS"), 0, None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    let shown = answer_query(&registry, "DMS", "slow deploy", 0).await.unwrap();
    assert_eq!(shown[0].answer, "check logs");
    assert_eq!(shown[0].id, rows[0].id);

    let modified = bot
        .modify_corpus(rows[0].id, "deploy stuck", "restart the runner")
        .await
        .unwrap();
    assert_eq!(modified.question, "deploy stuck");
    let shown = answer_query(&registry, "DMS", "deploy stuck", 0).await.unwrap();
    assert_eq!(shown[0].answer, "restart the runner");

    registry.record_feedback(rows[0].id, true).await.unwrap();
    let stored = storage.get_corpus_row(rows[0].id).await.unwrap().unwrap();
    assert_eq!(stored.accept_count, 1);

    bot.remove_corpus(None, Some("deploy stuck")).await.unwrap();
    assert!(registry.query("DMS", "deploy stuck").await.unwrap().is_empty());

    let feedback = storage.list_feedback(Some("DMS")).await.unwrap();
    assert_eq!(feedback.len(), 2);
    assert_eq!(feedback[0].class, "ops");

    registry.shutdown_all().await;
}
