//! Gateway wiring
//!
//! Owns the session map on the dispatch task and starts the background tasks
//! around it: the link supervisor and reader, the master volume monitor and
//! the audio health check. Everything stops on one cancellation token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::SessionFinder;
use crate::config::{AppConfig, ConfigWatcher};
use crate::error::LinkError;
use crate::link::{DeviceLink, LinkGreeting, LinkStatus};
use crate::monitor::{MasterVolumeMonitor, SharedMasterState};
use crate::protocol::{DeviceMessage, SliderMoveEvent};
use crate::router::SessionMap;

/// Wait after a config reload before asking the link for a full slider resync
const RESYNC_DELAY: Duration = Duration::from_millis(50);

/// What the device hears first on every link-up
struct Greeting {
    config: Mutex<Arc<AppConfig>>,
    master: SharedMasterState,
}

impl LinkGreeting for Greeting {
    fn greeting(&self) -> Vec<DeviceMessage> {
        let mut messages = vec![DeviceMessage::SliderNames(self.config.lock().slider_names_list())];
        if let Some(state) = *self.master.lock() {
            messages.push(state.message());
        }
        messages
    }
}

/// The running gateway
pub struct Gateway {
    link: DeviceLink,
    finder: Arc<SessionFinder>,
    map: SessionMap,
    greeting: Arc<Greeting>,
    monitor: Option<MasterVolumeMonitor>,
    events: Option<mpsc::Receiver<SliderMoveEvent>>,
    status: Option<broadcast::Receiver<LinkStatus>>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    pub fn new(config: Arc<AppConfig>, finder: Arc<SessionFinder>, link: DeviceLink) -> Self {
        let sink = Arc::new(link.clone());
        let monitor = MasterVolumeMonitor::new(Arc::clone(&finder), sink.clone());
        let greeting = Arc::new(Greeting {
            config: Mutex::new(Arc::clone(&config)),
            master: monitor.shared_state(),
        });

        link.set_greeting(greeting.clone());
        link.set_options(config.decoder_options());

        // subscribe before the first connect so the initial sync line is not lost
        let events = link.subscribe();
        let status = link.status();

        Self {
            map: SessionMap::new(Arc::clone(&finder), sink, config),
            link,
            finder,
            greeting,
            monitor: Some(monitor),
            events: Some(events),
            status: Some(status),
            token: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    pub fn session_map(&self) -> &SessionMap {
        &self.map
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.link.set_verbose(verbose);
    }

    /// Acquire sessions, start background tasks, then connect to the device
    ///
    /// Returns the first connection error; the link keeps retrying on its own.
    pub async fn start(&mut self) -> Result<(), LinkError> {
        info!("Initializing");
        self.map.initialize();

        if let Some(monitor) = self.monitor.take() {
            self.tasks.push(monitor.spawn(self.token.child_token()));
        }
        self.tasks.push(self.finder.spawn_health_check(self.token.child_token()));

        self.link.start().await
    }

    /// Apply a reloaded config
    pub async fn apply_config(&mut self, config: Arc<AppConfig>) {
        *self.greeting.config.lock() = Arc::clone(&config);
        self.map.set_config(Arc::clone(&config));
        self.link.set_options(config.decoder_options());

        let link = self.link.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESYNC_DELAY).await;
            link.request_resync();
        });

        match self.link.renew(config.port_settings()).await {
            // the greeting already carried the new names
            Ok(true) => {},
            Ok(false) => self.map.announce_names(),
            Err(e) => warn!(error = %e, "Failed to renew serial connection after config reload"),
        }
    }

    pub fn handle_event(&mut self, event: &SliderMoveEvent) {
        self.map.handle_event(event);
    }

    /// Dispatch loop; returns after `shutdown` resolves and everything is released
    pub async fn run(
        mut self,
        mut watcher: Option<ConfigWatcher>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let mut events = self.events.take().context("Gateway is already running")?;
        let mut status = self.status.take().context("Gateway is already running")?;
        let finder = Arc::clone(&self.finder);

        info!("Run loop starting");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(&event),

                _ = finder.device_changed() => {
                    info!("Audio devices changed, re-acquiring sessions");
                    self.map.refresh();
                }

                Some(new_config) = next_config(&mut watcher) => {
                    info!("Configuration file changed, applying");
                    self.apply_config(Arc::new(new_config)).await;
                }

                Ok(link_status) = status.recv() => match link_status {
                    LinkStatus::Connected => info!(port = %self.link.settings().port, "Connected to device"),
                    LinkStatus::Lost => warn!("Lost connection to device, will keep retrying"),
                },

                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping event loop");
                    break;
                }
            }
        }

        // a full event queue would block the reader thread we are about to join
        drop(events);
        self.shutdown().await;
        Ok(())
    }

    /// Stop every task and release all native handles
    pub async fn shutdown(mut self) {
        info!("Stopping");
        self.events.take();
        self.token.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Background task failed");
            }
        }

        self.link.stop().await;
        self.map.release();
        self.finder.release();
        debug!("Gateway stopped");
    }
}

async fn next_config(watcher: &mut Option<ConfigWatcher>) -> Option<AppConfig> {
    match watcher {
        Some(watcher) => watcher.next_config().await,
        None => std::future::pending().await,
    }
}

/// Turn a first-connect error into a fatal, actionable one where it makes sense
///
/// A busy or missing port will not fix itself; anything else is left to the
/// background reconnect.
pub fn first_start_failure(err: &LinkError, port: &str) -> Option<anyhow::Error> {
    if err.is_port_busy() {
        return Some(anyhow::anyhow!(
            "Can't connect to {}: the serial port is busy. Close any serial monitor or other deej instance.",
            port
        ));
    }
    if err.is_port_not_found() {
        return Some(anyhow::anyhow!(
            "Can't connect to {}: the serial port doesn't exist. Check com_port in your configuration.",
            port
        ));
    }
    None
}
