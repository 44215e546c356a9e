//! URL access recorder
//!
//! Accepts access events from the proxy, buffers them in memory and
//! periodically appends them to a rotating JSON lines log. Every accepted
//! event is also handed to the real-time broadcaster, whether or not a log
//! file is configured.

pub mod sink;

pub use sink::{backup_path, LogSink};

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use crate::config::RecorderConfig;
use crate::models::{AccessEvent, REQUEST_TIME_FORMAT};
use crate::realtime::{Broadcaster, RealtimeError};
use crate::shutdown::Shutdown;

/// Errors that can occur while starting the recorder
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Failed to open URL access log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Real-time server error: {0}")]
    Realtime(#[from] RealtimeError),
}

/// State shared with the flush worker
struct Shared {
    buffer: Mutex<Vec<AccessEvent>>,
    sink: Mutex<Option<LogSink>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    /// Write out everything buffered so far. Returns the records written.
    fn flush(&self) -> usize {
        // The sink lock is taken first so concurrent flushes keep batch order;
        // producers only ever touch the buffer lock.
        let mut sink = lock(&self.sink);
        let batch = std::mem::take(&mut *lock(&self.buffer));
        if batch.is_empty() {
            return 0;
        }

        match sink.as_mut() {
            Some(sink) => sink.write_batch(&batch),
            None => {
                log::debug!("No URL access log open, discarding {} records", batch.len());
                0
            }
        }
    }

    fn rotate_if_needed(&self) -> bool {
        let mut sink = lock(&self.sink);
        match sink.as_mut() {
            Some(sink) if sink.needs_rotation() => sink.rotate(),
            _ => false,
        }
    }

    /// One timer tick: flush first so nothing buffered is lost to rotation
    fn flush_cycle(&self) {
        self.flush();
        self.rotate_if_needed();
    }

    /// Final flush, then sync and drop the file handle
    fn close(&self) -> usize {
        let flushed = self.flush();
        let sink = lock(&self.sink).take();
        if let Some(mut sink) = sink {
            sink.close();
        }
        flushed
    }
}

pub struct Recorder {
    config: RecorderConfig,
    shared: Arc<Shared>,
    broadcaster: Broadcaster,
    shutdown: Shutdown,
    flush_task: Option<JoinHandle<()>>,
    running: bool,
    persisting: bool,
}

impl Recorder {
    pub fn new(config: RecorderConfig) -> Self {
        let broadcaster = Broadcaster::new(config.realtime.clone());
        Recorder {
            config,
            shared: Arc::new(Shared {
                buffer: Mutex::new(Vec::new()),
                sink: Mutex::new(None),
            }),
            broadcaster,
            shutdown: Shutdown::new(),
            flush_task: None,
            running: false,
            persisting: false,
        }
    }

    /// Open the log file, start the real-time server and the flush worker.
    ///
    /// Without a configured log path the recorder only feeds the real-time
    /// server. A disabled or already running recorder is left untouched.
    pub async fn start(&mut self) -> Result<(), RecorderError> {
        if !self.config.enable {
            log::info!("URL recorder disabled");
            return Ok(());
        }
        if self.running {
            return Ok(());
        }

        if let Some(path) = self.config.log_file() {
            let sink = LogSink::open(path, self.config.max_file_size, self.config.max_file_count)
                .map_err(|source| RecorderError::Open {
                    path: path.to_path_buf(),
                    source,
                })?;
            *lock(&self.shared.sink) = Some(sink);
            self.persisting = true;
        } else {
            log::info!("URL recorder running in real-time only mode, nothing is persisted");
        }

        if let Err(e) = self.broadcaster.start().await {
            self.close_sink();
            return Err(e.into());
        }

        self.shutdown = Shutdown::new();
        if self.persisting {
            self.flush_task = Some(tokio::spawn(flush_loop(
                Arc::clone(&self.shared),
                self.config.flush_interval(),
                self.shutdown.clone(),
            )));
        }
        self.running = true;

        log::info!(
            "URL recorder started (path: {:?}, flush every {}s, realtime: {})",
            self.config.log_file(),
            self.config.flush_interval().as_secs(),
            self.broadcaster.is_enabled()
        );
        Ok(())
    }

    /// Stop the flush worker, write out the buffer, close the file and stop
    /// the real-time server. Does nothing if the recorder is not running.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        self.shutdown.trigger();
        if let Some(task) = self.flush_task.take() {
            if let Err(e) = task.await {
                log::warn!("Flush worker ended abnormally: {}", e);
            }
        }

        let shared = Arc::clone(&self.shared);
        match tokio::task::spawn_blocking(move || shared.close()).await {
            Ok(flushed) => log::debug!("Final flush wrote {} records", flushed),
            Err(e) => log::error!("Final flush failed: {}", e),
        }
        self.persisting = false;

        self.broadcaster.stop().await;
        log::info!("URL recorder stopped");
    }

    /// Record one access event.
    ///
    /// Only takes the buffer lock and enqueues onto the real-time queue;
    /// file and network I/O happen on the background workers.
    pub fn log_url(&self, mut event: AccessEvent) {
        if !self.config.enable {
            return;
        }
        if event.domain.trim().is_empty() {
            log::debug!("Ignoring access event without a domain");
            return;
        }
        if self.config.is_excluded(&event.domain) {
            return;
        }
        if event.request_time.is_empty() {
            event.request_time = event.timestamp.format(REQUEST_TIME_FORMAT).to_string();
        }

        if self.persisting {
            let mut persisted = event.clone();
            if !self.config.enable_full_url {
                persisted.full_url = None;
            }
            lock(&self.shared.buffer).push(persisted);
        }

        self.broadcaster.push_record(&event);
    }

    /// Write out buffered records now. Returns the number written.
    pub fn flush(&self) -> usize {
        self.shared.flush()
    }

    /// Rotate the active file if it has grown past the size bound.
    /// Returns whether a rotation happened.
    pub fn rotate_if_needed(&self) -> bool {
        self.shared.rotate_if_needed()
    }

    /// Flush followed by a rotation check, as the timer does
    pub fn flush_cycle(&self) {
        self.shared.flush_cycle();
    }

    pub fn buffered_len(&self) -> usize {
        lock(&self.shared.buffer).len()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Path of the active log file while one is open
    pub fn active_path(&self) -> Option<PathBuf> {
        lock(&self.shared.sink).as_ref().map(|s| s.path().to_path_buf())
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    fn close_sink(&mut self) {
        self.shared.close();
        self.persisting = false;
    }
}

async fn flush_loop(shared: Arc<Shared>, every: Duration, shutdown: Shutdown) {
    let mut ticker = interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = ticker.tick() => {
                // File writes and fsync stay off the async workers
                let shared = Arc::clone(&shared);
                if let Err(e) = tokio::task::spawn_blocking(move || shared.flush_cycle()).await {
                    log::error!("Flush cycle failed: {}", e);
                }
            }
        }
    }
    log::debug!("Flush worker stopped");
}
