//! # Config Source
//!
//! Reads the routing config file and delivers a fresh [`RoutingConfig`] every time its
//! content changes.
//!
//! Two reload modes are supported and deliver the same contract downstream:
//!
//! - **Watch**: file system notifications via `notify`. The parent directory is watched
//!   rather than the file itself, and any change inside it triggers a re-read. Editors that
//!   save through a temporary file and Kubernetes ConfigMap volumes (which swap a `..data`
//!   symlink) both change the content without an event naming the config file.
//! - **Poll**: the file is re-read on a fixed interval.
//!
//! Either way a delivery only happens when the raw bytes differ from the last content
//! delivered, so touching the file, unrelated files in the directory, or a burst of
//! notifications for one save produce at most one snapshot. Content that is not UTF-8 is
//! a parse failure like any other malformed file.
//!
//! ## Rust Concepts Used
//!
//! - `tokio::sync::mpsc` to hand snapshots to the reconciler task
//! - `tokio::select!` to race file events against the shutdown token
//! - `CancellationToken` from `tokio-util` for cooperative shutdown

use notify::event::{AccessKind, AccessMode};
use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::{ConfigFormat, ReloadMode, RoutingConfig};
use crate::core::error::{GatewayError, GatewayResult};

/// Capacity of the snapshot channel
const UPDATE_CHANNEL_CAPACITY: usize = 16;

/// Delay between a file event and the re-read, so a write in progress can finish
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// A parsed snapshot, or the reason the latest content could not be used
pub type ConfigUpdate = GatewayResult<RoutingConfig>;

/// Handle to a running config watch
pub struct ConfigWatch {
    pub updates: mpsc::Receiver<ConfigUpdate>,
    pub task: JoinHandle<()>,
}

pub struct ConfigSource {
    path: PathBuf,
    format: ConfigFormat,
    mode: ReloadMode,
    settle_delay: Duration,
    last_content: Mutex<Option<Vec<u8>>>,
}

impl ConfigSource {
    pub fn new<P: Into<PathBuf>>(path: P, mode: ReloadMode) -> Self {
        let path = path.into();
        Self {
            format: ConfigFormat::from_path(&path),
            path,
            mode,
            settle_delay: DEFAULT_SETTLE_DELAY,
            last_content: Mutex::new(None),
        }
    }

    /// Override the delay between a file event and the re-read
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> ReloadMode {
        self.mode
    }

    /// Read and parse the file once.
    ///
    /// The content is remembered so that a later watch does not redeliver it.
    pub async fn load(&self) -> GatewayResult<RoutingConfig> {
        let content = tokio::fs::read(&self.path)
            .await
            .map_err(|e| GatewayError::Io {
                message: format!("Failed to read config file {}: {}", self.path.display(), e),
            })?;
        let config = parse_content(&self.path, &content, self.format)?;
        *self.last_content.lock() = Some(content);
        Ok(config)
    }

    /// Start delivering snapshots on every content change until `shutdown` is cancelled
    pub fn watch(&self, shutdown: CancellationToken) -> GatewayResult<ConfigWatch> {
        let (tx, updates) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let reader = SnapshotReader {
            path: self.path.clone(),
            format: self.format,
            last_content: self.last_content.lock().clone(),
            updates: tx,
        };

        let task = match self.mode {
            ReloadMode::Watch => self.spawn_notify_watch(reader, shutdown)?,
            ReloadMode::Poll(interval) => spawn_poll_watch(reader, interval, shutdown),
        };

        Ok(ConfigWatch { updates, task })
    }

    fn spawn_notify_watch(
        &self,
        mut reader: SnapshotReader,
        shutdown: CancellationToken,
    ) -> GatewayResult<JoinHandle<()>> {
        if self.path.file_name().is_none() {
            return Err(GatewayError::config("Invalid config file path"));
        }
        let watch_dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let _ = fs_tx.send(event);
            }
            Err(e) => warn!(error = %e, "File watcher error"),
        })
        .map_err(|e| GatewayError::config(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::config(format!("Failed to watch config directory: {}", e)))?;

        let settle_delay = self.settle_delay;
        info!(path = %self.path.display(), "Watching config file for changes");

        Ok(tokio::spawn(async move {
            // Dropping the watcher stops notifications, so it lives as long as the task
            let _watcher = watcher;

            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = fs_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                if !may_change_content(&event.kind) {
                    continue;
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(settle_delay) => {}
                }
                // One save usually fires several events; a single re-read covers them all
                while fs_rx.try_recv().is_ok() {}

                if !reader.reload().await {
                    break;
                }
            }

            debug!("Config watcher stopped");
        }))
    }
}

/// Everything except plain reads may have changed what the config path resolves to
fn may_change_content(kind: &EventKind) -> bool {
    match kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        EventKind::Access(_) => false,
        _ => true,
    }
}

fn parse_content(path: &Path, content: &[u8], format: ConfigFormat) -> GatewayResult<RoutingConfig> {
    let text = std::str::from_utf8(content).map_err(|e| {
        GatewayError::config_parse(format!("Config file {} is not valid UTF-8: {}", path.display(), e))
    })?;
    RoutingConfig::parse(text, format)
}

fn spawn_poll_watch(
    mut reader: SnapshotReader,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    info!(
        path = %reader.path.display(),
        interval = %humantime::format_duration(interval),
        "Polling config file for changes"
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and the initial load already happened
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if !reader.reload().await {
                        break;
                    }
                }
            }
        }

        debug!("Config poller stopped");
    })
}

/// Re-reads the file and forwards changed content
struct SnapshotReader {
    path: PathBuf,
    format: ConfigFormat,
    last_content: Option<Vec<u8>>,
    updates: mpsc::Sender<ConfigUpdate>,
}

impl SnapshotReader {
    /// Returns `false` once nobody is listening any more
    async fn reload(&mut self) -> bool {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Mid rename-replace; the event for the new file follows
                warn!(path = %self.path.display(), "Config file is missing, keeping current routes");
                return true;
            }
            Err(e) => {
                let err = GatewayError::Io {
                    message: format!("Failed to read config file {}: {}", self.path.display(), e),
                };
                return self.updates.send(Err(err)).await.is_ok();
            }
        };

        if self.last_content.as_deref() == Some(content.as_slice()) {
            debug!(path = %self.path.display(), "Config content unchanged, skipping reload");
            return true;
        }

        info!(path = %self.path.display(), "Configuration file changed, reloading");
        let update = parse_content(&self.path, &content, self.format);
        self.last_content = Some(content);
        self.updates.send(update).await.is_ok()
    }
}
