//! Platform audio subsystem seam
//!
//! `AudioBackend` is the narrow surface the session finder needs from the OS:
//! endpoints, per-process sessions on an endpoint, endpoint volume, process
//! names and the foreground process. Device notifications come back through
//! `DeviceNotificationSink`, one method per notification kind.

pub mod finder;
pub mod virtual_backend;
#[cfg(windows)]
pub mod wasapi;

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::AudioError;
use crate::session::{Direction, SessionControl};

pub use finder::{FinderTimings, SessionFinder};
pub use virtual_backend::VirtualMixer;

/// One active audio endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub id: String,
    pub friendly_name: String,
    pub direction: Direction,
}

/// A per-process session as enumerated, before its process is resolved
pub struct RawSession {
    pub pid: u32,
    pub system_sounds: bool,
    pub control: Box<dyn SessionControl>,
}

/// Receives endpoint notifications from the platform
///
/// Called on platform threads; implementations must not block.
pub trait DeviceNotificationSink: Send + Sync {
    fn default_device_changed(&self, direction: Direction);

    fn device_added(&self, device_id: &str) {
        info!(device = device_id, "Audio device added");
    }

    fn device_removed(&self, device_id: &str) {
        info!(device = device_id, "Audio device removed");
    }

    fn device_state_changed(&self, device_id: &str, state: u32) {
        debug!(device = device_id, state, "Audio device state changed");
    }
}

/// Platform audio subsystem
pub trait AudioBackend: Send {
    /// Initialize and register for notifications; a no-op when connected
    fn connect(&mut self, sink: Arc<dyn DeviceNotificationSink>) -> Result<(), AudioError>;

    fn is_connected(&self) -> bool;

    /// Unregister notifications and drop the subsystem connection
    fn disconnect(&mut self);

    /// Default endpoint for a direction, `None` if there is none
    fn default_endpoint(&mut self, direction: Direction) -> Result<Option<EndpointInfo>, AudioError>;

    /// All active endpoints, both directions
    fn active_endpoints(&mut self) -> Result<Vec<EndpointInfo>, AudioError>;

    /// Volume control for a whole endpoint
    fn endpoint_control(&mut self, endpoint: &EndpointInfo) -> Result<Box<dyn SessionControl>, AudioError>;

    /// Per-process sessions on a render endpoint
    fn process_sessions(&mut self, endpoint: &EndpointInfo) -> Result<Vec<RawSession>, AudioError>;

    /// Executable name for a pid; `ProcessExited` if it is gone
    fn process_name(&self, pid: u32) -> Result<String, AudioError>;

    /// Process owning the foreground window, if any
    fn foreground_pid(&self) -> Option<u32>;
}

/// Backend for the current platform
#[cfg(windows)]
pub fn platform_backend() -> Box<dyn AudioBackend> {
    Box::new(wasapi::WasapiBackend::new())
}

/// Backend for the current platform
#[cfg(not(windows))]
pub fn platform_backend() -> Box<dyn AudioBackend> {
    tracing::warn!("No native audio backend on this platform, using a virtual mixer");
    VirtualMixer::with_default_devices().backend()
}
