//! Gateway entry point.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use portico::config::{load_config, watcher, ConfigStore};
use portico::lifecycle::{self, Shutdown};
use portico::observability::{self, MetricsRecorder, NullRecorder, PrometheusMetrics};
use portico::plugin::{PluginContext, PluginRegistry};
use portico::proxy::BufferPool;
use portico::router::AppState;
use portico::server::{GatewayApp, Server};
use portico::transport::TransportCache;

#[derive(Parser, Debug)]
#[command(name = "portico", about = "Layer-7 reverse proxy with signed middleware plugins")]
struct Args {
    /// Path to the configuration file.
    #[arg(short = 'f', long = "config", default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let snapshot = match load_config(&args.config) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("Failed to load configuration {}: {}", args.config.display(), e);
            process::exit(1);
        }
    };

    observability::logging::init(&snapshot.config.logging.level);
    tracing::info!(
        listen_port = %snapshot.config.listen_port,
        routes = snapshot.routes.len(),
        hot_reload = snapshot.config.hot_reload,
        "Configuration loaded"
    );

    let (metrics, exposition): (Arc<dyn MetricsRecorder>, _) = if snapshot.config.metrics.enabled {
        match PrometheusMetrics::install() {
            Ok(prometheus) => {
                let handle = prometheus.handle();
                (Arc::new(prometheus), Some(handle))
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install metrics recorder");
                process::exit(1);
            }
        }
    } else {
        (Arc::new(NullRecorder), None)
    };

    let listen_port = snapshot.config.listen_port.clone();
    let hot_reload = snapshot.config.hot_reload;

    let transports = Arc::new(TransportCache::new());
    let store = Arc::new(ConfigStore::new(snapshot, transports));
    let shutdown = Arc::new(Shutdown::new());

    let app = GatewayApp {
        store: Arc::clone(&store),
        metrics: Arc::clone(&metrics),
    };
    let plugin_ctx = PluginContext::new(Arc::clone(&shutdown));
    let plugins = match PluginRegistry::load(&store.current().config.plugins, &app, &plugin_ctx) {
        Ok(plugins) => Arc::new(plugins),
        Err(e) => {
            tracing::error!(error = %e, "Plugin loading failed");
            process::exit(1);
        }
    };
    if !plugins.is_empty() {
        tracing::info!(plugins = ?plugins.names(), "Plugins ready");
    }

    if hot_reload {
        tokio::spawn(watcher::watch_config(args.config.clone(), Arc::clone(&store)));
    }

    let state = Arc::new(AppState {
        store,
        plugins,
        metrics,
        buffers: Arc::new(BufferPool::new()),
        exposition,
    });

    let listener = match TcpListener::bind(format!("0.0.0.0:{}", listen_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(port = %listen_port, error = %e, "Failed to bind listener");
            process::exit(1);
        }
    };

    tokio::spawn(lifecycle::wait_for_signal(Arc::clone(&shutdown)));

    if let Err(e) = Server::new(state).run(listener, shutdown).await {
        tracing::error!(error = %e, "Server failed");
        process::exit(1);
    }

    tracing::info!("Shutdown complete");
}
