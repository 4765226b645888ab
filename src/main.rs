use std::sync::Arc;

use anyhow::Context;
use mail_rag::config::{EmbeddingConfig, MailConfig, RetrievalConfig, ServerConfig};
use mail_rag::embedding::create_embedder;
use mail_rag::http::{AppState, SessionTable, api_routes};
use mail_rag::index::{IndexStore, Indexer, SearchEngine};
use mail_rag::llm::LlmConfig;
use mail_rag::mail::{ImapSource, MailSource};
use mail_rag::session::SessionManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let server_config = ServerConfig::from_env();

    // Initialize tracing; optional rolling file output next to stderr.
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match &server_config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-rag.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    eprintln!("📬 mail-rag v{}", env!("CARGO_PKG_VERSION"));

    let llm_config = LlmConfig::from_env().context("LLM configuration")?;
    let llm = mail_rag::llm::create_provider(&llm_config)?;
    eprintln!("   Model: {}", llm_config.model);

    let embedding_config = EmbeddingConfig::from_env().context("Embedding configuration")?;
    let embedder = create_embedder(&embedding_config);
    eprintln!(
        "   Embeddings: {} ({} dims)",
        embedder.model_id(),
        embedder.dimension()
    );

    let store = Arc::new(
        IndexStore::new_local(&server_config.db_path)
            .await
            .with_context(|| {
                format!("Opening database at {}", server_config.db_path.display())
            })?,
    );
    eprintln!("   Database: {}", server_config.db_path.display());

    let retrieval = RetrievalConfig::from_env();
    let search = Arc::new(SearchEngine::new(Arc::clone(&store), Arc::clone(&embedder)));
    let manager = Arc::new(SessionManager::new(
        Arc::clone(&search),
        llm,
        retrieval.clone(),
    ));

    // Mailbox is optional; without it the server still answers searches
    // and chat over whatever is already indexed.
    let mail_config = MailConfig::from_env();
    let indexer = mail_config.as_ref().map(|cfg| {
        eprintln!(
            "   Mailbox: {}:{} ({})",
            cfg.imap_host, cfg.imap_port, cfg.folder
        );
        let source: Arc<dyn MailSource> = Arc::new(ImapSource::new(cfg.clone()));
        Arc::new(Indexer::new(
            source,
            Arc::clone(&embedder),
            Arc::clone(&store),
            cfg.fetch_mode,
        ))
    });
    if indexer.is_none() {
        eprintln!("   Mailbox: not configured (set MAILRAG_IMAP_HOST to enable ingestion)");
    }

    // Periodic ingestion, if enabled. Overlapping ticks are rejected by
    // the indexer's single-flight lock and simply logged.
    if server_config.ingest_interval_secs > 0 {
        if let Some(indexer) = indexer.clone() {
            let period = std::time::Duration::from_secs(server_config.ingest_interval_secs);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match indexer.load_emails().await {
                        Ok(report) => tracing::info!(
                            indexed = report.indexed,
                            total = report.total,
                            "Scheduled ingestion finished"
                        ),
                        Err(e) => tracing::warn!(error = %e, "Scheduled ingestion failed"),
                    }
                }
            });
            eprintln!(
                "   Scheduler: every {}s",
                server_config.ingest_interval_secs
            );
        }
    }

    let state = AppState {
        sessions: Arc::new(SessionTable::new(server_config.session_capacity)),
        manager,
        search,
        store,
        indexer,
        retrieval,
        llm_model: llm_config.model.clone(),
        embed_model: embedder.model_id().to_string(),
        mail_configured: mail_config.is_some(),
    };

    let app = api_routes(state);
    let addr = format!("127.0.0.1:{}", server_config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Binding {addr}"))?;
    eprintln!("   API: http://{addr}/api\n");
    tracing::info!(%addr, "HTTP server started");

    axum::serve(listener, app).await?;

    Ok(())
}
