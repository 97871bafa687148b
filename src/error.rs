//! Error types for the gateway core
//!
//! Transient failures are logged and retried by the component that owns them.
//! The link error is the one place callers match on the variant: a busy port
//! and a missing port need different messages for the user.

use std::time::Duration;
use thiserror::Error;

/// Device link errors
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("serial connection already active")]
    AlreadyConnected,

    #[error("serial link not connected")]
    NotConnected,

    #[error("serial port {port} is busy")]
    PortBusy { port: String },

    #[error("serial port {port} does not exist")]
    PortNotFound { port: String },

    #[error("failed to open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("max retries reached after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<LinkError>,
    },
}

impl LinkError {
    /// Innermost error, looking through retry exhaustion
    pub fn root(&self) -> &LinkError {
        match self {
            LinkError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    pub fn is_port_busy(&self) -> bool {
        matches!(self.root(), LinkError::PortBusy { .. })
    }

    pub fn is_port_not_found(&self) -> bool {
        matches!(self.root(), LinkError::PortNotFound { .. })
    }

    /// Whether another open attempt could succeed without user action
    pub fn is_transient(&self) -> bool {
        matches!(self.root(), LinkError::Open { .. } | LinkError::Io(_))
    }
}

/// Platform audio subsystem errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    #[error("audio subsystem not initialized")]
    NotInitialized,

    #[error("no default {0} device")]
    NoDefaultDevice(&'static str),

    #[error("process {0} has exited")]
    ProcessExited(u32),

    #[error("audio backend call failed: {0}")]
    Backend(String),

    #[error("operation failed after {attempts} attempts ({delay:?} apart): {last}")]
    RetriesExhausted {
        attempts: u32,
        delay: Duration,
        last: Box<AudioError>,
    },
}

/// Errors from a single session handle
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("session {0} already released")]
    Released(String),

    #[error("session {0} is stale and must be re-acquired")]
    Stale(String),

    #[error(transparent)]
    Audio(#[from] AudioError),
}

impl SessionError {
    /// Whether the owning generation should be re-enumerated
    pub fn needs_refresh(&self) -> bool {
        matches!(
            self,
            SessionError::Released(_)
                | SessionError::Stale(_)
                | SessionError::Audio(AudioError::ProcessExited(_))
        )
    }
}
