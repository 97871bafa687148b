//! Audio session handles
//!
//! An `AudioSession` owns one native volume control. Dropping it (or calling
//! `release`) frees the native handle; any later call fails with
//! `SessionError::Released` instead of touching freed memory. Master sessions
//! also share a stale flag with the finder, set when the OS default device
//! changes, after which the session refuses Get/Set until re-acquired.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{AudioError, SessionError};

/// Reserved target name for the default output device
pub const MASTER_TARGET: &str = "master";
/// Reserved target name for the default input device
pub const MIC_TARGET: &str = "mic";
/// Reserved target name for the system sounds session
pub const SYSTEM_TARGET: &str = "system";
/// Every live process session not bound anywhere else
pub const UNMAPPED_TARGET: &str = "deej.unmapped";
/// Process owning the foreground window at apply time
pub const CURRENT_TARGET: &str = "deej.current";

/// Endpoint data flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Output,
    Input,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Output => write!(f, "output"),
            Direction::Input => write!(f, "input"),
        }
    }
}

/// Native volume control behind a session
///
/// Implementations release their native resources on drop.
pub trait SessionControl: Send {
    fn volume(&self) -> Result<f32, AudioError>;
    fn set_volume(&self, volume: f32) -> Result<(), AudioError>;
    fn mute(&self) -> Result<bool, AudioError>;
    fn set_mute(&self, muted: bool) -> Result<(), AudioError>;
}

/// What a session controls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    Process { pid: u32, process_name: String },
    Master(Direction),
    Device { friendly_name: String },
    SystemSounds,
}

/// Owned handle to one controllable volume target
pub struct AudioSession {
    kind: SessionKind,
    key: String,
    control: Option<Box<dyn SessionControl>>,
    stale: Option<Arc<AtomicBool>>,
}

impl AudioSession {
    pub fn new(kind: SessionKind, control: Box<dyn SessionControl>) -> Self {
        let key = match &kind {
            SessionKind::Process { process_name, .. } => process_name.to_lowercase(),
            SessionKind::Master(Direction::Output) => MASTER_TARGET.to_string(),
            SessionKind::Master(Direction::Input) => MIC_TARGET.to_string(),
            SessionKind::Device { friendly_name } => friendly_name.to_lowercase(),
            SessionKind::SystemSounds => SYSTEM_TARGET.to_string(),
        };

        Self {
            kind,
            key,
            control: Some(control),
            stale: None,
        }
    }

    /// Attach a stale flag shared with whoever tracks default-device changes
    pub fn with_stale_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stale = Some(flag);
        self
    }

    pub fn kind(&self) -> &SessionKind {
        &self.kind
    }

    /// Lowercase identity used for target matching
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pid(&self) -> Option<u32> {
        match self.kind {
            SessionKind::Process { pid, .. } => Some(pid),
            _ => None,
        }
    }

    pub fn is_process(&self) -> bool {
        matches!(self.kind, SessionKind::Process { .. })
    }

    pub fn is_released(&self) -> bool {
        self.control.is_none()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
            .as_ref()
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Case-insensitive match against a configured target name
    pub fn matches_target(&self, target: &str) -> bool {
        self.key == target.to_lowercase()
    }

    fn control(&self) -> Result<&dyn SessionControl, SessionError> {
        let control = self
            .control
            .as_deref()
            .ok_or_else(|| SessionError::Released(self.key.clone()))?;
        if self.is_stale() {
            return Err(SessionError::Stale(self.key.clone()));
        }
        Ok(control)
    }

    pub fn volume(&self) -> Result<f32, SessionError> {
        Ok(self.control()?.volume()?)
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), SessionError> {
        let volume = volume.clamp(0.0, 1.0);
        self.control()?.set_volume(volume)?;
        trace!(session = %self, volume, "Set volume");
        Ok(())
    }

    pub fn mute(&self) -> Result<bool, SessionError> {
        Ok(self.control()?.mute()?)
    }

    pub fn set_mute(&self, muted: bool) -> Result<(), SessionError> {
        self.control()?.set_mute(muted)?;
        trace!(session = %self, muted, "Set mute");
        Ok(())
    }

    /// Free the native handle; further calls fail with `Released`
    pub fn release(&mut self) {
        if self.control.take().is_some() {
            debug!(session = %self, "Released session");
        }
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Display for AudioSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SessionKind::Process { pid, process_name } => write!(f, "{} ({})", process_name, pid),
            SessionKind::Master(direction) => write!(f, "master {}", direction),
            SessionKind::Device { friendly_name } => write!(f, "device {}", friendly_name),
            SessionKind::SystemSounds => write!(f, "system sounds"),
        }
    }
}

impl fmt::Debug for AudioSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioSession")
            .field("kind", &self.kind)
            .field("released", &self.is_released())
            .field("stale", &self.is_stale())
            .finish()
    }
}
