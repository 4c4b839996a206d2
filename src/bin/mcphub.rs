//! Process entry point: wires the settings store, connector pool,
//! dispatcher, and ingress router together and serves them over HTTP (§6).

use std::{sync::Arc, time::Duration};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcphub::{
    dispatcher::Dispatcher,
    ingress::{self, AppState},
    metrics::HubMetrics,
    pool::ConnectorPool,
    registry::ToolRegistry,
    session::SessionRegistry,
    settings::SettingsStore,
    smart_index::SmartIndex,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "MCP aggregation and routing hub")]
struct Args {
    /// HTTP listen port.
    #[arg(long, default_value = "3000", env = "PORT")]
    port: u16,

    /// Base path every ingress route is mounted under (e.g. `/mcphub`).
    #[arg(long, default_value = "", env = "BASE_PATH")]
    base_path: String,

    /// Seconds to wait for the connector pool's first reconcile pass before
    /// serving traffic regardless (§4.3).
    #[arg(long, default_value = "300", env = "INIT_TIMEOUT")]
    init_timeout: u64,

    /// Only GET requests and tool-call paths are allowed (§4.8).
    #[arg(long, env = "READONLY")]
    readonly: bool,

    /// Secret used to sign and verify downstream JWTs.
    #[arg(long, env = "JWT_SECRET", default_value = "change-me-in-production")]
    jwt_secret: String,

    /// `json` for machine-parseable logs, anything else for human-readable.
    #[arg(long, env = "MCPHUB_LOG_FORMAT", default_value = "text")]
    log_format: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "starting mcphub");

    let store = Arc::new(SettingsStore::from_env());
    let document = store.load().await;

    let pool = ConnectorPool::new(Duration::from_secs(args.init_timeout));
    pool.boot(&document).await;
    let _watcher = pool.spawn_watcher(Arc::clone(&store));
    let _file_watcher = match store.spawn_file_watcher() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "settings file watcher unavailable, external edits require a restart");
            None
        }
    };

    let smart_index = if document.system_config.smart_routing.enabled {
        match SmartIndex::open(&document.system_config.smart_routing) {
            Ok(index) => Some(Arc::new(index)),
            Err(e) => {
                warn!(error = %e, "smart routing failed to initialize, continuing without it");
                None
            }
        }
    } else {
        None
    };

    if let Some(index) = smart_index.clone() {
        spawn_smart_index_refresh(Arc::clone(&pool), Arc::clone(&store), index);
    }

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&pool), smart_index));
    let sessions = Arc::new(SessionRegistry::new());
    let metrics = Arc::new(HubMetrics::new());

    let state = AppState {
        store: Arc::clone(&store),
        pool: Arc::clone(&pool),
        dispatcher,
        sessions,
        metrics,
        jwt_secret: args.jwt_secret,
        readonly: args.readonly,
    };

    let app = ingress::router(state, &args.base_path);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(address = %addr, error = %e, "failed to bind listen socket");
            std::process::exit(1);
        }
    };
    info!(address = %addr, base_path = %args.base_path, "mcphub listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server exited with an error");
        std::process::exit(1);
    }

    info!("mcphub shut down cleanly");
}

/// Periodically re-embeds the global tool catalog so the smart index tracks
/// connector reconnects and settings reloads (§4.5).
fn spawn_smart_index_refresh(
    pool: Arc<ConnectorPool>,
    store: Arc<SettingsStore>,
    index: Arc<SmartIndex>,
) -> tokio::task::JoinHandle<()> {
    let registry = ToolRegistry::new(Arc::clone(&pool));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let document = store.load().await;
            let tools = registry
                .view(
                    &mcphub::registry::Scope::Global,
                    &mcphub::registry::AuthContext::Unrestricted,
                    &document,
                )
                .await;
            if let Err(e) = index.index_tools(&tools).await {
                warn!(error = %e, "smart index refresh failed");
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining connections");
}

fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcphub=info,warn"));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if result.is_err() {
        // Already initialized (e.g. under a test harness); not fatal.
    }
}
