mod transport;

use lom_engine_core::config;
use lom_engine_core::engine::{Engine, LoopControl};
use lom_engine_core::manager::ActionManager;
use lom_engine_core::publish::TracingPublisher;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let dir = config::config_dir();
    tracing::info!(dir = %dir.display(), "loading configuration");
    let configuration = config::load(&dir)?;

    let manager = ActionManager::new(configuration);
    let transport = transport::FifoTransport::new();
    let publisher = TracingPublisher;
    let mut engine = Engine::new(manager, transport, publisher);

    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let shutdown = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let reload = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        let reload = reload.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sighup.recv() => {
                        tracing::info!("SIGHUP received, reloading configuration on next iteration");
                        reload.store(true, std::sync::atomic::Ordering::SeqCst);
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("SIGTERM received, shutting down after this iteration");
                        shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
                        break;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("SIGINT received, shutting down after this iteration");
                        shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
                        break;
                    }
                }
            }
        });
    }

    let result = engine
        .run(
            || LoopControl {
                reload_requested: reload.swap(false, std::sync::atomic::Ordering::SeqCst),
                shutdown_requested: shutdown.load(std::sync::atomic::Ordering::SeqCst),
            },
            || Ok(config::load(&config::config_dir())?),
        )
        .await;

    result.map_err(anyhow::Error::from)
}
