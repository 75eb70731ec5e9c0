// shepherd: Supervises simulation agents and bridges the message bus to
// Lens websocket clients.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use shepherd::broker::{KafkaConsumer, KafkaProducer, MemoryBroker, MessageConsumer, MessageProducer};
use shepherd::config::{self, BrokerMode};
use shepherd::{gateway, supervisor, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "shepherd starting");

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SHEPHERD_CONFIG").ok())
        .unwrap_or_else(|| "shepherd.toml".to_owned());
    let config = match config::load_config_from_path(Path::new(&config_path)) {
        Ok(config) => {
            info!(
                path = %config_path,
                broker = %config.broker.host,
                subscribe = ?config.broker.subscribe,
                "config loaded"
            );
            Arc::new(config)
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config '{config_path}': {e}");
            std::process::exit(1);
        }
    };

    let (producer, consumer): (Arc<dyn MessageProducer>, Box<dyn MessageConsumer>) =
        match config.broker.mode {
            BrokerMode::Kafka => {
                let producer = KafkaProducer::connect(&config.broker.host)
                    .unwrap_or_else(|e| fatal(&format!("kafka producer: {e}")));
                let consumer = KafkaConsumer::connect(
                    &config.broker.host,
                    &config.broker.group,
                    &config.broker.subscribe,
                )
                .unwrap_or_else(|e| fatal(&format!("kafka consumer: {e}")));
                (Arc::new(producer), Box::new(consumer))
            }
            BrokerMode::Memory => {
                info!("running against the in-process broker (no Kafka)");
                let hub = MemoryBroker::new();
                let consumer = hub.consumer(&config.broker.subscribe).await;
                (Arc::new(hub.producer()), Box::new(consumer))
            }
        };

    let state = AppState::new(Arc::clone(&config), producer);

    // The poll loop owns the consumer; its death folds into shutdown.
    let (fatal_tx, fatal_rx) = watch::channel(false);
    tokio::spawn(gateway::run_poll_loop(consumer, state.clone(), fatal_tx));

    let router = shepherd::build_router(state.clone());
    let bind_addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "shepherd listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(fatal_rx))
        .await
        .expect("server error");

    // No orphan simulators after a clean exit.
    supervisor::shutdown_all(&state).await;
    info!("shepherd shut down gracefully");
}

fn fatal(message: &str) -> ! {
    eprintln!("FATAL: {message}");
    std::process::exit(1);
}

/// Resolves on SIGTERM, Ctrl-C, or a fatal gateway error.
async fn shutdown_signal(mut fatal_rx: watch::Receiver<bool>) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
        _ = fatal_rx.changed() => { info!("gateway poll loop ended, shutting down"); },
    }
}
