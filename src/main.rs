//! # Corpus Bot CLI (`corpusbot`)
//!
//! ## Usage
//!
//! ```bash
//! corpusbot --config ./config/corpusbot.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `corpusbot init` | Create the SQLite database and run schema migrations |
//! | `corpusbot project add <name>` | Register (or reconfigure) a project |
//! | `corpusbot project list` | List projects and their configs |
//! | `corpusbot search "<query>"` | Ask one project a question |
//! | `corpusbot train --dir D --out F` | Build a snapshot straight from corpus files |
//! | `corpusbot serve` | Start every project's bot and the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! corpusbot init
//! corpusbot project add DMS --config '{"dir_corpus":"./corpus/dms"}'
//! corpusbot search -p DMS "why is the deploy slow"
//! corpusbot serve
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use corpus_bot::bot::BotInstance;
use corpus_bot::config::{self, ProjectConfig};
use corpus_bot::corpus_files::{find_corpus_files, load_corpora};
use corpus_bot::corpus_store::CorpusStore;
use corpus_bot::registry::BotRegistry;
use corpus_bot::server;
use corpus_bot::storage::{SqliteStorage, Storage};
use corpus_bot::trainer::Trainer;

/// Corpus Bot: answers questions from a curated, per-project Q&A corpus.
#[derive(Parser)]
#[command(name = "corpusbot", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/corpusbot.toml")]
    config: PathBuf,

    /// More logging (-v debug, -vv trace). `CORPUSBOT_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Ask a project a question and print the ranked answers.
    ///
    /// Answers from the project's snapshot when one exists, otherwise
    /// imports the project's corpus files and indexes its rows first.
    Search {
        query: String,

        /// Project to ask. Defaults to `[server].default_project`.
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Build an index snapshot from a directory of corpus files, without
    /// touching the database.
    Train {
        /// Directory holding `*.json`, `*.yml` or `*.yaml` corpus files.
        #[arg(long)]
        dir: PathBuf,

        /// Snapshot file to write.
        #[arg(long)]
        out: PathBuf,
    },

    /// Start every project's bot and serve the HTTP API.
    Serve,
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Add a project, or replace the config of an existing one.
    Add {
        name: String,

        /// Project config as JSON, e.g. `{"dir_corpus":"./corpus"}`.
        #[arg(long, default_value = "")]
        config: String,
    },
    /// List all projects.
    List,
}

fn init_tracing(verbose: u8) {
    let filter = if let Ok(env) = std::env::var("CORPUSBOT_LOG") {
        EnvFilter::new(env)
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Offline training needs no config or database
    if let Commands::Train { dir, out } = &cli.command {
        return run_train(dir, out);
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            SqliteStorage::open(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Project { action } => {
            let storage = SqliteStorage::open(&cfg).await?;
            match action {
                ProjectAction::Add { name, config } => {
                    ProjectConfig::parse(&name, &config)?;
                    let id = storage.add_project(&name, &config).await?;
                    println!("Project '{}' saved (id {}).", name, id);
                }
                ProjectAction::List => {
                    let projects = storage.list_projects().await?;
                    if projects.is_empty() {
                        println!("No projects.");
                    }
                    for p in projects {
                        let config = if p.config.is_empty() { "{}" } else { p.config.as_str() };
                        println!("{:>4}  {:<20} {}", p.id, p.name, config);
                    }
                }
            }
        }
        Commands::Search { query, project } => {
            let project = project.unwrap_or_else(|| cfg.server.default_project.clone());
            run_search(&cfg, &project, &query).await?;
        }
        Commands::Serve => {
            let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(&cfg).await?);
            let registry = Arc::new(BotRegistry::new(storage, cfg.bot_settings()));
            let started = registry.initialize().await?;
            tracing::info!(projects = started, "bots started");

            server::run_server(&cfg, registry.clone()).await?;
            registry.shutdown_all().await;
        }
        Commands::Train { .. } => unreachable!("handled before config loading"),
    }

    Ok(())
}

async fn run_search(cfg: &config::Config, project: &str, query: &str) -> anyhow::Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(cfg).await?);
    let row = storage
        .list_projects()
        .await?
        .into_iter()
        .find(|p| p.name == project)
        .with_context(|| format!("project not found: {}", project))?;
    let project_config = ProjectConfig::parse(project, &row.config)?;

    let bot = BotInstance::new(project, project_config, storage, &cfg.bot_settings());
    if bot.warm_start() == 0 {
        bot.import_corpus_files().await?;
        bot.resync().await?;
    }

    let matches = bot.query(query).await?;
    if matches.is_empty() {
        println!("No answer found.");
        return Ok(());
    }

    for (i, m) in matches.iter().enumerate() {
        let token = m.decode()?;
        println!(
            "{}. [{:.3}] #{} {}\n   {}",
            i + 1,
            m.confidence,
            token.id,
            token.question,
            token.answer
        );
    }
    Ok(())
}

fn run_train(dir: &std::path::Path, out: &std::path::Path) -> anyhow::Result<()> {
    let files = find_corpus_files(dir)?;
    if files.is_empty() {
        anyhow::bail!("no corpus files found in {}", dir.display());
    }
    let data = load_corpora(&files);

    let project = out
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let store = Arc::new(CorpusStore::new(project, Some(out.to_path_buf())));
    let indexed = Trainer::new(store).train(&data)?;

    println!(
        "Indexed {} questions from {} files into {}",
        indexed,
        files.len(),
        out.display()
    );
    Ok(())
}
