//! # Corpus Bot
//!
//! Answers free-text questions by fuzzy-matching them against a curated,
//! per-project corpus of question/answer pairs.
//!
//! Each project gets its own bot: an in-memory index built from the rows in
//! durable storage, kept current by a periodic resync and by targeted
//! updates whenever a row is added, removed or modified.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  resync   ┌─────────┐  build   ┌─────────────┐
//! │   Storage    │──────────▶│ Trainer │────────▶│ CorpusStore │
//! │ SQLite / mem │           └─────────┘          └──────┬──────┘
//! └──────▲───────┘                                       │ Arc<CorpusIndex>
//!        │ add/remove/modify                             ▼
//! ┌──────┴───────┐  get     ┌─────────────┐   query ┌─────────────┐
//! │ BotRegistry  │────────▶│ BotInstance │────────▶│ MatchEngine │
//! └──────▲───────┘          └─────────────┘         └─────────────┘
//!        │
//!   CLI / HTTP
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and typed per-project config |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`question`] | Phrasing split and the composite answer token |
//! | [`corpus_store`] | Per-project staged and published index |
//! | [`matcher`] | Similarity scoring and top-k ranking |
//! | [`trainer`] | Bulk loading into a store |
//! | [`corpus_files`] | Corpus file discovery and parsing |
//! | [`storage`] | Durable storage trait and backends |
//! | [`bot`] | Per-project lifecycle |
//! | [`registry`] | Project → bot map |
//! | [`server`] | JSON HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod bot;
pub mod config;
pub mod corpus_files;
pub mod corpus_store;
pub mod db;
pub mod error;
pub mod matcher;
pub mod migrate;
pub mod models;
pub mod question;
pub mod registry;
pub mod server;
pub mod storage;
pub mod trainer;
