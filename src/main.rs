//! `tqa` — ThreadQA command-line interface.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use threadqa::config::{load_config, Config};
use threadqa::embedding::create_embedder;
use threadqa::extract;
use threadqa::index::SessionIndex;
use threadqa::llm::create_llm;
use threadqa::models::{NewChatRow, SourceKind};
use threadqa::rag::{self, AnswerEvent};
use threadqa::server::run_server;
use threadqa::session::SessionRegistry;
use threadqa::store;

const URL_FETCH_TIMEOUT_SECS: u64 = 30;

#[derive(Parser)]
#[command(name = "tqa", version, about = "Session-scoped document Q&A")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = "./config/tqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the chat store schema
    Init,
    /// Run the HTTP server
    Serve,
    /// Build (or rebuild) a session's index from a file or URL
    Build {
        #[arg(long)]
        session: String,
        /// Label stored with this session's rows (defaults to the source name)
        #[arg(long)]
        label: Option<String>,
        #[arg(long, conflicts_with = "url")]
        file: Option<PathBuf>,
        #[arg(long)]
        url: Option<String>,
    },
    /// Ask a question against a session's index, streaming the answer
    Ask {
        #[arg(long)]
        session: String,
        question: String,
        /// Re-answer an earlier turn; the new turn supersedes it
        #[arg(long)]
        edit_of: Option<i64>,
    },
    /// Print a session's stored Q&A history
    History {
        #[arg(long)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Init => cmd_init(&config).await,
        Commands::Serve => cmd_serve(&config).await,
        Commands::Build {
            session,
            label,
            file,
            url,
        } => cmd_build(&config, &session, label, file, url).await,
        Commands::Ask {
            session,
            question,
            edit_of,
        } => cmd_ask(&config, &session, &question, edit_of).await,
        Commands::History { session } => cmd_history(&config, &session).await,
    }
}

async fn cmd_init(config: &Config) -> Result<()> {
    let pool = store::connect(&config.chat_db.path).await?;
    store::run_migrations(&pool).await?;
    println!("Database initialized at {}", config.chat_db.path.display());
    Ok(())
}

async fn cmd_serve(config: &Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let embedder = create_embedder(&config.embedding)?;
    let llm = create_llm(&config.llm)?;
    run_server(config, embedder, llm).await
}

async fn cmd_build(
    config: &Config,
    session: &str,
    label: Option<String>,
    file: Option<PathBuf>,
    url: Option<String>,
) -> Result<()> {
    let embedder = create_embedder(&config.embedding)?;

    let (text, kind, source_name) = match (file, url) {
        (Some(path), None) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            let file_kind = extract::kind_for_path(&name)?;
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            (
                extract::extract_file(&bytes, file_kind)?,
                SourceKind::File,
                name,
            )
        }
        (None, Some(url)) => (
            extract::extract_url(&url, Duration::from_secs(URL_FETCH_TIMEOUT_SECS)).await?,
            SourceKind::Url,
            url,
        ),
        _ => bail!("Exactly one of --file or --url is required"),
    };

    let (_index, summary) =
        SessionIndex::build(config, embedder.as_ref(), session, kind, &text).await?;

    let label = label.unwrap_or(source_name);
    println!(
        "Indexed {} chunks (dims {}) for session '{}' [{}]",
        summary.chunks, summary.dims, session, label
    );
    println!("  {}", summary.storage_path.display());
    Ok(())
}

async fn cmd_ask(
    config: &Config,
    session_id: &str,
    question: &str,
    edit_of: Option<i64>,
) -> Result<()> {
    let embedder = create_embedder(&config.embedding)?;
    let llm = create_llm(&config.llm)?;

    let pool = store::connect(&config.chat_db.path).await?;
    store::run_migrations(&pool).await?;

    // Rehydrate the session from stored history.
    let rows = store::list_by_session(&pool, session_id).await?;
    let label = rows
        .first()
        .map(|r| r.label.clone())
        .unwrap_or_else(|| "cli".to_string());

    let registry = SessionRegistry::new();
    let session = registry
        .create_with_id(session_id.to_string(), label.clone())
        .await;
    for row in &rows {
        session
            .attach_turn(
                row.question.clone(),
                row.answer.clone().unwrap_or_default(),
                row.original_msg_id.is_some(),
                row.original_msg_id,
            )
            .await;
    }

    // Reopen whichever persisted index this session has.
    let index = match SessionIndex::open(config, session_id, SourceKind::File).await? {
        Some(index) => index,
        None => match SessionIndex::open(config, session_id, SourceKind::Url).await? {
            Some(index) => index,
            None => bail!(
                "No index found for session '{}'. Run `tqa build` first.",
                session_id
            ),
        },
    };
    session.attach_index(Arc::new(index)).await;

    let mut events = match edit_of {
        Some(seq) => {
            rag::regenerate(session.clone(), embedder, llm, config, seq, question).await?
        }
        None => rag::answer(session.clone(), embedder, llm, config, question).await?,
    };

    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event {
            AnswerEvent::Token(token) => {
                print!("{}", token);
                stdout.flush().ok();
            }
            AnswerEvent::Done(turn) => {
                println!();
                let new_row = NewChatRow {
                    session_id: session_id.to_string(),
                    label: label.clone(),
                    question: turn.question,
                    answer: Some(turn.answer),
                    original_msg_id: turn.supersedes,
                };
                store::insert_turn(&pool, &new_row).await?;
            }
        }
    }

    Ok(())
}

async fn cmd_history(config: &Config, session_id: &str) -> Result<()> {
    let pool = store::connect(&config.chat_db.path).await?;
    store::run_migrations(&pool).await?;

    let rows = store::list_by_session(&pool, session_id).await?;
    if rows.is_empty() {
        println!("No history for session '{}'", session_id);
        return Ok(());
    }

    for row in rows {
        let edit_tag = match row.original_msg_id {
            Some(orig) => format!(" (edit of {})", orig),
            None => String::new(),
        };
        println!("[{}]{} Q: {}", row.id, edit_tag, row.question);
        println!("     A: {}", row.answer.as_deref().unwrap_or("(pending)"));
    }
    Ok(())
}
