use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use docrag::api;
use docrag::config::AppConfig;
use docrag::database::{DocumentRepository, InMemoryDocumentRepository, SqliteDocumentRepository};
use docrag::document::Chunker;
use docrag::llm::{ChatService, RagService};
use docrag::providers::traits::{ChatProvider, EmbeddingProvider};
use docrag::providers::OpenAIProvider;
use log::{info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "8787")]
    port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Overrides DATABASE_PATH
    #[arg(long)]
    database: Option<PathBuf>,

    /// Keep documents in process memory instead of SQLite
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = AppConfig::from_env().context("Invalid configuration")?;
    if let Some(path) = &args.database {
        config.database_path = path.clone();
    }

    let chunker = Chunker::new(config.chunk_size, config.chunk_overlap)
        .context("Invalid chunking configuration")?;

    let repository: Arc<dyn DocumentRepository> = if args.in_memory {
        if config.production {
            warn!("Running in production with an in-memory store; documents will not persist");
        }
        info!("Using in-memory document store");
        Arc::new(InMemoryDocumentRepository::new())
    } else {
        info!("Opening document database at {}", config.database_path.display());
        Arc::new(
            SqliteDocumentRepository::open(&config.database_path)
                .await
                .context("Failed to open document database")?,
        )
    };

    let provider = Arc::new(OpenAIProvider::new(&config.openai));
    let embedder: Arc<dyn EmbeddingProvider> = provider.clone();
    let chat_provider: Arc<dyn ChatProvider> = provider;
    info!(
        "Using embedding model {} ({} dimensions) and chat model {}",
        embedder.model(),
        config.embedding_dimensions,
        chat_provider.model()
    );

    let rag = Arc::new(RagService::new(
        repository,
        embedder,
        chunker,
        config.embedding_dimensions,
        config.top_k,
    ));
    let chat = Arc::new(ChatService::new(
        rag.clone(),
        chat_provider,
        config.system_prompt.clone(),
    ));

    let app = api::create_api(rag, chat, config.basic_auth.as_ref());

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", args.host, args.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Server listening on {}", addr);
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
