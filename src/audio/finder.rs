//! Session finder
//!
//! Turns the backend's endpoints and sessions into `AudioSession`s. One
//! enumeration runs at a time (the backend sits behind a mutex); a pass that
//! fails drops everything it opened, so no handle outlives a failed pass.
//!
//! Default-device changes arrive once per media role, so changes closer than
//! the debounce window to the previous one are ignored. A change marks every
//! master session handed out so far stale and wakes whoever waits on
//! `device_changed`; repeated wake-ups before the waiter runs coalesce.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Notify;
use tokio::task::{block_in_place, JoinHandle};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{AudioBackend, DeviceNotificationSink, EndpointInfo};
use crate::error::AudioError;
use crate::session::{AudioSession, Direction, SessionKind};

/// Finder timing constants
#[derive(Debug, Clone)]
pub struct FinderTimings {
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub health_interval: Duration,
    pub change_debounce: Duration,
}

impl Default for FinderTimings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            health_interval: Duration::from_secs(5),
            change_debounce: Duration::from_millis(100),
        }
    }
}

/// Run `op` up to `attempts` times, sleeping `delay` after each failure
fn with_retry<T>(
    attempts: u32,
    delay: Duration,
    mut op: impl FnMut() -> Result<T, AudioError>,
) -> Result<T, AudioError> {
    let attempts = attempts.max(1);
    let mut last = AudioError::NotInitialized;

    for attempt in 1..=attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                trace!(attempt, error = %e, "Audio operation failed");
                last = e;
                if attempt < attempts {
                    thread::sleep(delay);
                }
            },
        }
    }

    Err(AudioError::RetriesExhausted {
        attempts,
        delay,
        last: Box::new(last),
    })
}

/// Run a blocking backend pass without stalling the tasks queued on this worker
///
/// A current-thread runtime has no other worker to hand them to, so there
/// (and outside any runtime) `op` just runs inline.
fn off_worker<T>(op: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => block_in_place(op),
        _ => op(),
    }
}

/// Tracks default-device changes and the master sessions they invalidate
struct DeviceChangeTracker {
    debounce: Duration,
    last_change: Mutex<Option<Instant>>,
    masters: Mutex<Vec<Weak<AtomicBool>>>,
    changed: Notify,
}

impl DeviceChangeTracker {
    fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            last_change: Mutex::new(None),
            masters: Mutex::new(Vec::new()),
            changed: Notify::new(),
        }
    }

    /// New stale flag for a master session
    fn track(&self) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        let mut masters = self.masters.lock();
        masters.retain(|weak| weak.strong_count() > 0);
        masters.push(Arc::downgrade(&flag));
        flag
    }

    fn mark_masters_stale(&self) {
        let masters = std::mem::take(&mut *self.masters.lock());
        let mut marked = 0;
        for flag in masters.iter().filter_map(Weak::upgrade) {
            flag.store(true, Ordering::Release);
            marked += 1;
        }
        debug!(sessions = marked, "Marked master sessions stale");
    }
}

impl DeviceNotificationSink for DeviceChangeTracker {
    fn default_device_changed(&self, direction: Direction) {
        let now = Instant::now();
        {
            let mut last = self.last_change.lock();
            if let Some(previous) = *last {
                if now.duration_since(previous) < self.debounce {
                    return;
                }
            }
            *last = Some(now);
        }

        info!(%direction, "Default audio device changed, marking master sessions as stale");
        self.mark_masters_stale();
        self.changed.notify_one();
    }
}

/// Discovers live sessions from the platform audio subsystem
pub struct SessionFinder {
    backend: Mutex<Box<dyn AudioBackend>>,
    tracker: Arc<DeviceChangeTracker>,
    timings: FinderTimings,
}

impl SessionFinder {
    pub fn new(backend: Box<dyn AudioBackend>) -> Self {
        Self::with_timings(backend, FinderTimings::default())
    }

    pub fn with_timings(backend: Box<dyn AudioBackend>, timings: FinderTimings) -> Self {
        debug!("Created session finder instance");
        Self {
            backend: Mutex::new(backend),
            tracker: Arc::new(DeviceChangeTracker::new(timings.change_debounce)),
            timings,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.backend.lock().is_connected()
    }

    /// Full enumeration pass: masters, process sessions, device sessions
    pub fn get_all_sessions(&self) -> Result<Vec<AudioSession>, AudioError> {
        off_worker(|| self.enumerate())
    }

    fn enumerate(&self) -> Result<Vec<AudioSession>, AudioError> {
        let mut backend = self.backend.lock();
        self.connect_backend(&mut **backend)?;

        let mut sessions = self.master_sessions(&mut **backend)?;

        let endpoint_sessions = with_retry(self.timings.retry_attempts, self.timings.retry_delay, || {
            self.endpoint_sessions(&mut **backend)
        })
        .map_err(|e| {
            warn!(error = %e, "Failed to enumerate device sessions");
            e
        })?;
        sessions.extend(endpoint_sessions);

        debug!(count = sessions.len(), "Got all audio sessions successfully");
        Ok(sessions)
    }

    /// Fresh session for the default endpoint of one direction
    pub fn acquire_master(&self, direction: Direction) -> Result<Option<AudioSession>, AudioError> {
        off_worker(|| {
            let mut backend = self.backend.lock();
            self.connect_backend(&mut **backend)?;

            match backend.default_endpoint(direction)? {
                Some(endpoint) => Ok(Some(self.master_session(&mut **backend, &endpoint)?)),
                None => Ok(None),
            }
        })
    }

    /// Executable name of the foreground process
    pub fn foreground_process_name(&self) -> Option<String> {
        let backend = self.backend.lock();
        let pid = backend.foreground_pid()?;
        match backend.process_name(pid) {
            Ok(name) => Some(name),
            Err(e) => {
                trace!(pid, error = %e, "Foreground process not resolvable");
                None
            },
        }
    }

    /// Resolves after a default-device change or a subsystem reconnect
    pub async fn device_changed(&self) {
        self.tracker.changed.notified().await;
    }

    /// Drop the subsystem connection and invalidate every master session
    pub fn release(&self) {
        self.backend.lock().disconnect();
        self.tracker.mark_masters_stale();
        debug!("Released session finder instance");
    }

    /// Reconnect to the audio subsystem on an interval while it is down
    pub fn spawn_health_check(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let finder = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = interval(finder.timings.health_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let finder = Arc::clone(&finder);
                        if let Err(e) = tokio::task::spawn_blocking(move || finder.check_health()).await {
                            error!(error = %e, "Audio health check panicked");
                        }
                    },
                }
            }

            debug!("Audio health check stopped");
        })
    }

    fn check_health(&self) {
        // an enumeration in progress is proof of life
        let Some(mut backend) = self.backend.try_lock() else {
            trace!("Enumeration in progress, skipping health check");
            return;
        };

        if backend.is_connected() {
            return;
        }

        warn!("Audio subsystem connection lost, attempting to reconnect...");
        match self.connect_backend(&mut **backend) {
            Ok(()) => {
                info!("Reconnected to audio subsystem");
                drop(backend);
                self.tracker.mark_masters_stale();
                self.tracker.changed.notify_one();
            },
            Err(e) => error!(error = %e, "Failed to reconnect to audio subsystem"),
        }
    }

    fn connect_backend(&self, backend: &mut dyn AudioBackend) -> Result<(), AudioError> {
        if backend.is_connected() {
            return Ok(());
        }

        let sink: Arc<dyn DeviceNotificationSink> = self.tracker.clone();
        with_retry(self.timings.retry_attempts, self.timings.retry_delay, || {
            backend.connect(sink.clone())
        })
    }

    fn master_session(
        &self,
        backend: &mut dyn AudioBackend,
        endpoint: &EndpointInfo,
    ) -> Result<AudioSession, AudioError> {
        let control = backend.endpoint_control(endpoint)?;
        Ok(AudioSession::new(SessionKind::Master(endpoint.direction), control)
            .with_stale_flag(self.tracker.track()))
    }

    fn master_sessions(&self, backend: &mut dyn AudioBackend) -> Result<Vec<AudioSession>, AudioError> {
        let output = backend
            .default_endpoint(Direction::Output)?
            .ok_or(AudioError::NoDefaultDevice("output"))?;

        let mut sessions = vec![self.master_session(backend, &output).map_err(|e| {
            warn!(error = %e, "Failed to get master audio output session");
            e
        })?];

        match backend.default_endpoint(Direction::Input) {
            Ok(Some(input)) => sessions.push(self.master_session(backend, &input).map_err(|e| {
                warn!(error = %e, "Failed to get master audio input session");
                e
            })?),
            Ok(None) | Err(_) => {
                warn!("No default input device detected, proceeding without it (\"mic\" will not work)")
            },
        }

        Ok(sessions)
    }

    fn endpoint_sessions(&self, backend: &mut dyn AudioBackend) -> Result<Vec<AudioSession>, AudioError> {
        let mut sessions = Vec::new();

        for endpoint in backend.active_endpoints()? {
            debug!(
                device = %endpoint.friendly_name,
                direction = %endpoint.direction,
                "Enumerated device info"
            );

            if endpoint.direction == Direction::Output {
                for raw in backend.process_sessions(&endpoint)? {
                    if raw.system_sounds {
                        sessions.push(AudioSession::new(SessionKind::SystemSounds, raw.control));
                        continue;
                    }

                    match backend.process_name(raw.pid) {
                        Ok(process_name) => sessions.push(AudioSession::new(
                            SessionKind::Process {
                                pid: raw.pid,
                                process_name,
                            },
                            raw.control,
                        )),
                        Err(AudioError::ProcessExited(pid)) => {
                            debug!(pid, "Process already exited, skipping session and releasing handles")
                        },
                        Err(e) => return Err(e),
                    }
                }
            }

            let control = backend.endpoint_control(&endpoint)?;
            sessions.push(AudioSession::new(
                SessionKind::Device {
                    friendly_name: endpoint.friendly_name.clone(),
                },
                control,
            ));
        }

        Ok(sessions)
    }
}
