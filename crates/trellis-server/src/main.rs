use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use trellis_server::http;
use trellis_server::loopback::{LoopbackAgent, UnconfiguredImages};
use trellis_server::AppState;
use trellis_stream::{AgentRunner, TurnOrchestrator};
use trellis_tree_store::{MemoryStore, SqliteStore, TreeStore};

#[derive(Debug, Parser)]
#[command(name = "trellis-server")]
struct Args {
    #[arg(long, env = "TRELLIS_HTTP_ADDR", default_value = "127.0.0.1:8080")]
    http_addr: String,

    /// SQLite database URL (e.g. sqlite://trellis.db). Runs on the
    /// in-memory store when unset.
    #[arg(long, env = "TRELLIS_DATABASE_URL")]
    database_url: Option<String>,
}

fn app_state<S>(store: Arc<S>, runner: Arc<dyn AgentRunner>) -> AppState
where
    S: TreeStore + 'static,
{
    AppState {
        orchestrator: TurnOrchestrator::new(store.clone(), runner),
        store,
        images: Arc::new(UnconfiguredImages),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let runner: Arc<dyn AgentRunner> = Arc::new(LoopbackAgent);
    let state = match &args.database_url {
        Some(url) => {
            let store = SqliteStore::connect(url)
                .await
                .expect("failed to open database");
            app_state(Arc::new(store), runner)
        }
        None => {
            tracing::warn!("no database configured, conversations will not survive a restart");
            app_state(Arc::new(MemoryStore::new()), runner)
        }
    };

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(&args.http_addr)
        .await
        .expect("failed to bind http listener");
    tracing::info!(addr = %args.http_addr, "trellis-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .expect("http server crashed");
}
