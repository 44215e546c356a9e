use std::env;
use std::path::PathBuf;

use tokio::sync::mpsc;

use urlscope::config::Config;
use urlscope::input::IngestListener;
use urlscope::recorder::Recorder;
use urlscope::shutdown::Shutdown;

/// Recorder daemon: ingest -> recorder -> real-time feed
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Starting urlscope daemon...");

    // Load configuration
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        Config::from_file(&config_path)?
    } else {
        log::warn!("Config file not found, using defaults");
        Config::default()
    };

    // Setup graceful shutdown signal handling
    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, gracefully stopping...");
        signal.trigger();
    })?;

    let (tx, mut rx) = mpsc::channel(config.ingest.channel_capacity.max(1));

    let ingest_task = match config.ingest.listen_addr.as_deref() {
        Some(addr) => {
            let listener = IngestListener::bind(addr).await?;
            log::info!("Accepting access events on udp://{}", addr);
            let shutdown = shutdown.clone();
            Some(tokio::spawn(async move { listener.run(tx, shutdown).await }))
        }
        None => {
            log::warn!("No ingest address configured, no events will be received");
            drop(tx);
            None
        }
    };

    let mut recorder = Recorder::new(config.recorder.clone());
    recorder.start().await?;

    log::info!("Daemon running. Press Ctrl+C to stop.");

    // Main event loop
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            next = rx.recv() => match next {
                Some(event) => recorder.log_url(event),
                None => {
                    shutdown.triggered().await;
                    break;
                }
            },
        }
    }

    if let Some(task) = ingest_task {
        if let Err(e) = task.await {
            log::warn!("Ingest listener ended abnormally: {}", e);
        }
    }
    // Record whatever was already received before shutting down
    while let Ok(event) = rx.try_recv() {
        recorder.log_url(event);
    }

    recorder.stop().await;
    log::info!("urlscope daemon stopped");
    Ok(())
}
