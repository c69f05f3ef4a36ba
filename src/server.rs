//! JSON HTTP boundary.
//!
//! A thin axum layer over [`BotRegistry`]. Handlers parse the request, call
//! one core operation and map its [`Error`] to a status code; the only logic
//! that lives here is [`answer_query`], which decides what a user sees on a
//! miss and records feedback for every search.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/v1/search?p=&q=` | Ranked answers for `q` in project `p` |
//! | `POST` | `/v1/add` | Add or update a Q&A row |
//! | `POST` | `/v1/add/requirement` | File an open requirement |
//! | `POST` | `/v1/remove` | Delete rows by id or by question |
//! | `POST` | `/v1/modify` | Rewrite a row's question and answer |
//! | `POST` | `/v1/feedback` | Accept or reject a shown answer |
//! | `GET`  | `/v1/list/project` | All projects |
//! | `POST` | `/v1/list/corpus` | Filtered, paginated corpus rows |
//!
//! When `p` or `project` is omitted, `[server].default_project` is used.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::Error;
use crate::models::{CorpusEntry, CorpusFilter, CorpusKind, Feedback, Project};
use crate::question::ensure_question_mark;
use crate::registry::BotRegistry;

/// Shown when nothing matched and the query was too short to be recorded.
pub const NO_ANSWER_MESSAGE: &str = "Sorry, no answer was found. Please describe your question \
     in more detail so it can be collected for review.";

/// Shown when nothing matched and the query was recorded.
pub const RECORDED_MESSAGE: &str =
    "Sorry, no answer was found. Your question has been recorded for review, no need to resubmit.";

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    registry: Arc<BotRegistry>,
}

/// One answer as returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Qa {
    pub question: String,
    pub answer: String,
    pub score: f32,
    /// Corpus row id; 0 for the no-answer placeholder.
    pub id: i64,
}

/// Runs a search the way the `/v1/search` endpoint does.
///
/// The query gets a trailing `?` if it has none. On a hit, feedback is
/// recorded for the top answer. On a miss, a single placeholder answer is
/// returned and, if the query is at least `min_unanswered_len` bytes long,
/// the unanswered question is recorded with `cid = 0`. An unknown project
/// schedules a background refresh (at most one in flight) and fails with
/// `NotFound`.
pub async fn answer_query(
    registry: &Arc<BotRegistry>,
    project: &str,
    text: &str,
    min_unanswered_len: usize,
) -> Result<Vec<Qa>, Error> {
    let Some(bot) = registry.get(project) else {
        registry.refresh_in_background();
        return Err(Error::not_found("project", project));
    };

    let text = text.trim();
    if text.is_empty() {
        return Err(Error::invalid("query must not be empty"));
    }
    let question = ensure_question_mark(text);

    let mut answers = Vec::new();
    for m in bot.query(&question).await? {
        match m.decode() {
            Ok(token) => answers.push(Qa {
                question: token.question,
                answer: token.answer,
                score: m.confidence,
                id: token.id,
            }),
            Err(e) => tracing::warn!(project, error = %e, "skipping malformed answer"),
        }
    }

    let feedback = match answers.first() {
        Some(top) => Some(Feedback {
            cid: top.id,
            question: question.clone(),
            answer: top.answer.clone(),
            ..Default::default()
        }),
        None if question.len() >= min_unanswered_len => Some(Feedback {
            question: question.clone(),
            ..Default::default()
        }),
        None => None,
    };

    if answers.is_empty() {
        let message = if feedback.is_some() {
            RECORDED_MESSAGE
        } else {
            NO_ANSWER_MESSAGE
        };
        answers.push(Qa {
            question: question.clone(),
            answer: message.to_string(),
            score: 0.0,
            id: 0,
        });
    }

    if let Some(feedback) = feedback {
        if let Err(e) = bot.add_feedback(feedback).await {
            tracing::warn!(project, error = %e, "failed to record feedback");
        }
    }

    Ok(answers)
}

/// Builds the router. Exposed so tests can serve it on an ephemeral port.
pub fn router(config: Arc<Config>, registry: Arc<BotRegistry>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/search", get(handle_search))
        .route("/v1/add", post(handle_add))
        .route("/v1/add/requirement", post(handle_add_requirement))
        .route("/v1/remove", post(handle_remove))
        .route("/v1/modify", post(handle_modify))
        .route("/v1/feedback", post(handle_feedback))
        .route("/v1/list/project", get(handle_list_projects))
        .route("/v1/list/corpus", post(handle_list_corpus))
        .layer(cors)
        .with_state(AppState { config, registry })
}

/// Serves the API on `[server].bind` until Ctrl-C.
pub async fn run_server(config: &Config, registry: Arc<BotRegistry>) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(Arc::new(config.clone()), registry);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let (status, code) = match &err {
            Error::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Error::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            _ => {
                tracing::error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

impl AppState {
    fn project<'a>(&'a self, requested: &'a Option<String>) -> &'a str {
        match requested.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p,
            _ => &self.config.server.default_project,
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    projects: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        projects: state.registry.len(),
    })
}

// ============ GET /v1/search ============

#[derive(Deserialize)]
struct SearchParams {
    p: Option<String>,
    #[serde(default)]
    q: String,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<Qa>,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<SearchResponse> {
    let project = state.project(&params.p);
    let results = answer_query(
        &state.registry,
        project,
        &params.q,
        state.config.feedback.min_unanswered_len,
    )
    .await?;
    Ok(Json(SearchResponse { results }))
}

// ============ POST /v1/add ============

async fn handle_add(
    State(state): State<AppState>,
    Json(entry): Json<CorpusEntry>,
) -> ApiResult<CorpusEntry> {
    add(&state, entry).await
}

async fn handle_add_requirement(
    State(state): State<AppState>,
    Json(mut entry): Json<CorpusEntry>,
) -> ApiResult<CorpusEntry> {
    entry.kind = CorpusKind::Requirement;
    add(&state, entry).await
}

async fn add(state: &AppState, mut entry: CorpusEntry) -> ApiResult<CorpusEntry> {
    let requested = (!entry.project.is_empty()).then(|| entry.project.clone());
    let project = state.project(&requested).to_string();
    entry.project = project.clone();
    let stored = state.registry.bot(&project)?.add_corpus(entry).await?;
    Ok(Json(stored))
}

// ============ POST /v1/remove ============

#[derive(Deserialize)]
struct RemoveRequest {
    project: Option<String>,
    /// 0 is treated as absent.
    #[serde(default)]
    id: i64,
    #[serde(default)]
    question: String,
}

#[derive(Serialize)]
struct RemoveResponse {
    removed: Vec<CorpusEntry>,
}

async fn handle_remove(
    State(state): State<AppState>,
    Json(req): Json<RemoveRequest>,
) -> ApiResult<RemoveResponse> {
    let bot = state.registry.bot(state.project(&req.project))?;
    let id = (req.id != 0).then_some(req.id);
    let question = (!req.question.trim().is_empty()).then_some(req.question.as_str());
    let removed = bot.remove_corpus(id, question).await?;
    Ok(Json(RemoveResponse { removed }))
}

// ============ POST /v1/modify ============

#[derive(Deserialize)]
struct ModifyRequest {
    project: Option<String>,
    id: i64,
    question: String,
    #[serde(default)]
    answer: String,
}

async fn handle_modify(
    State(state): State<AppState>,
    Json(req): Json<ModifyRequest>,
) -> ApiResult<CorpusEntry> {
    let bot = state.registry.bot(state.project(&req.project))?;
    let modified = bot.modify_corpus(req.id, &req.question, &req.answer).await?;
    Ok(Json(modified))
}

// ============ POST /v1/feedback ============

#[derive(Deserialize)]
struct FeedbackRequest {
    cid: i64,
    accepted: bool,
}

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

async fn handle_feedback(
    State(state): State<AppState>,
    Json(req): Json<FeedbackRequest>,
) -> ApiResult<OkResponse> {
    state.registry.record_feedback(req.cid, req.accepted).await?;
    Ok(Json(OkResponse { ok: true }))
}

// ============ GET /v1/list/project ============

#[derive(Serialize)]
struct ProjectListResponse {
    projects: Vec<Project>,
}

async fn handle_list_projects(State(state): State<AppState>) -> ApiResult<ProjectListResponse> {
    let projects = state.registry.list_projects().await?;
    Ok(Json(ProjectListResponse { projects }))
}

// ============ POST /v1/list/corpus ============

#[derive(Deserialize)]
struct ListCorpusRequest {
    #[serde(flatten)]
    filter: CorpusFilter,
    #[serde(default)]
    offset: i64,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct CorpusListResponse {
    corpus: Vec<CorpusEntry>,
}

async fn handle_list_corpus(
    State(state): State<AppState>,
    Json(req): Json<ListCorpusRequest>,
) -> ApiResult<CorpusListResponse> {
    if req.offset < 0 || req.limit.is_some_and(|l| l < 0) {
        return Err(Error::invalid("offset and limit must not be negative").into());
    }
    let corpus = state
        .registry
        .list_corpus(&req.filter, req.offset, req.limit)
        .await?;
    Ok(Json(CorpusListResponse { corpus }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotSettings;
    use crate::storage::{InMemoryStorage, Storage};

    async fn setup() -> (Arc<InMemoryStorage>, Arc<BotRegistry>) {
        let storage = Arc::new(InMemoryStorage::new());
        storage.add_project("DMS", "");
        let registry = Arc::new(BotRegistry::new(storage.clone(), BotSettings::default()));
        registry.initialize().await.unwrap();
        (storage, registry)
    }

    #[tokio::test]
    async fn test_hit_records_feedback_for_top_answer() {
        let (storage, registry) = setup().await;
        let row = registry
            .bot("DMS")
            .unwrap()
            .add_corpus(CorpusEntry::qa("DMS", "ops", "slow deploy？", "check logs"))
            .await
            .unwrap();

        let answers = answer_query(&registry, "DMS", "slow deploy", 0).await.unwrap();
        assert_eq!(answers[0].id, row.id);
        assert_eq!(answers[0].answer, "check logs");

        let feedback = storage.list_feedback(Some("DMS")).await.unwrap();
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].cid, row.id);
        assert_eq!(feedback[0].question, "slow deploy?");
        assert_eq!(feedback[0].class, "ops");
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_miss_returns_placeholder() {
        let (storage, registry) = setup().await;

        let answers = answer_query(&registry, "DMS", "anything?", 0).await.unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].id, 0);
        assert_eq!(answers[0].answer, RECORDED_MESSAGE);

        let feedback = storage.list_feedback(Some("DMS")).await.unwrap();
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].cid, 0);
        assert_eq!(feedback[0].answer, "");

        let short = answer_query(&registry, "DMS", "hm", 45).await.unwrap();
        assert_eq!(short[0].answer, NO_ANSWER_MESSAGE);
        assert_eq!(storage.list_feedback(Some("DMS")).await.unwrap().len(), 1);
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_unknown_project_triggers_refresh() {
        let (storage, registry) = setup().await;
        storage.add_project("LATE", "");

        assert!(matches!(
            answer_query(&registry, "LATE", "hello", 0).await,
            Err(Error::NotFound { .. })
        ));
        assert!(registry.is_refreshing());
        assert!(matches!(
            answer_query(&registry, "LATE", "hello again", 0).await,
            Err(Error::NotFound { .. })
        ));
        assert!(!registry.refresh_in_background());

        let mut found = false;
        for _ in 0..50 {
            if registry.get("LATE").is_some() {
                found = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(found);
        registry.shutdown_all().await;
    }

    #[test]
    fn test_error_mapping() {
        let bad: AppError = Error::invalid("x").into();
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);
        let missing: AppError = Error::not_found("project", "X").into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        assert_eq!(missing.code, "not_found");
        let internal: AppError = Error::Indexing("boom".into()).into();
        assert_eq!(internal.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
