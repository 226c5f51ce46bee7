use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use facegate::common::Config;
use facegate::core::{OnnxInference, RecognitionEngine};
use facegate::gallery::Gallery;
use facegate::service::{EnrollmentController, Reconciler, Router, Server, SessionRegistry};
use facegate::store::{MemoryRepository, Repository, SqlRepository};

#[derive(Parser, Debug)]
#[command(name = "facegate")]
#[command(about = "On-premise biometric access-control server")]
struct Args {
    /// Listen port; overrides the config file
    port: Option<u16>,

    /// Path to the configuration file
    #[arg(long, default_value = "facegate.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args).await {
        tracing::error!("fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = Config::load_from_path(&args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.resolve_model_paths()?;

    serve(config).await
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(port = config.server.port, "starting facegate");

    let repo: Arc<dyn Repository> = if config.store.connection_string == "memory" {
        tracing::warn!("using the in-memory store; data will not survive a restart");
        Arc::new(MemoryRepository::new())
    } else {
        Arc::new(SqlRepository::connect(&config.store.connection_string).await?)
    };

    let inference = OnnxInference::load(&config.ai)?;
    let engine = Arc::new(RecognitionEngine::new(
        Box::new(inference),
        config.recognition.clone(),
    ));

    let gallery = Arc::new(Gallery::new());
    gallery.load_all(repo.as_ref(), engine.as_ref()).await?;

    let registry = Arc::new(SessionRegistry::new());
    let enroll = Arc::new(EnrollmentController::new(&config.enrollment));
    let router = Arc::new(Router::new(
        repo.clone(),
        gallery.clone(),
        engine.clone(),
        registry,
        enroll,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let reconciler = Arc::new(Reconciler::new(
        repo,
        gallery,
        engine,
        &config.reconcile,
    ));
    let reconciler_task = tokio::spawn(reconciler.run(shutdown_rx.clone()));

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received");
            let _ = signal_tx.send(true);
        }
    });

    let server = Server::new(router);
    server.run(config.server.port, shutdown_rx).await?;

    // The reconciler is part of the server lifecycle; wait for it
    let _ = shutdown_tx.send(true);
    if let Err(e) = reconciler_task.await {
        tracing::warn!("reconciler task failed to join: {}", e);
    }

    tracing::info!("facegate stopped");
    Ok(())
}
