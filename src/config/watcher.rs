//! Configuration file watcher for hot-reload support

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::AppConfig;

/// Editors often write a file twice in a row; later events inside this window are dropped
const RELOAD_COOLDOWN: Duration = Duration::from_millis(500);

/// Let the editor finish flushing before reading the file back
const FLUSH_DELAY: Duration = Duration::from_millis(50);

/// Config watcher that monitors file changes and sends reloaded configs
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<AppConfig>,
}

impl ConfigWatcher {
    /// Create a new config watcher for the specified file
    pub async fn new(config_path: String) -> Result<(Self, Arc<AppConfig>)> {
        let (tx, rx) = mpsc::channel(10);

        let initial_config = AppConfig::load(&config_path)
            .await
            .context("Failed to load initial config")?;
        let initial_config = Arc::new(initial_config);

        let config_path_clone = config_path.clone();
        let last_attempt: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

        // notify callbacks run on their own OS thread, not in Tokio context
        let runtime_handle = tokio::runtime::Handle::current();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_)) {
                        return;
                    }

                    {
                        let now = Instant::now();
                        let mut last = last_attempt.lock();
                        if last.is_some_and(|at| now.duration_since(at) < RELOAD_COOLDOWN) {
                            debug!("Ignoring duplicate config write: {:?}", event.paths);
                            return;
                        }
                        *last = Some(now);
                    }

                    debug!("Config file modified, attempting reload: {:?}", event.paths);

                    let config_path = config_path_clone.clone();
                    let tx = tx.clone();

                    runtime_handle.spawn(async move {
                        tokio::time::sleep(FLUSH_DELAY).await;

                        match AppConfig::load(&config_path).await {
                            Ok(new_config) => {
                                info!("Configuration reloaded successfully");
                                if let Err(e) = tx.send(new_config).await {
                                    error!("Failed to send config update: {}", e);
                                }
                            },
                            Err(e) => {
                                warn!("Failed to reload config (keeping old config): {:#}", e);
                            },
                        }
                    });
                },
                Err(e) => {
                    error!("Watch error: {}", e);
                },
            }
        })?;

        watcher
            .watch(Path::new(&config_path), RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch config file: {}", config_path))?;

        info!("Config file watcher started for: {}", config_path);

        Ok((
            Self {
                _watcher: watcher,
                rx,
            },
            initial_config,
        ))
    }

    /// Wait for the next successfully reloaded config
    /// Returns None if the watcher has been closed
    pub async fn next_config(&mut self) -> Option<AppConfig> {
        self.rx.recv().await
    }
}
