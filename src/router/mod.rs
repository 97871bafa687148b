//! Session map - routes slider moves to live audio sessions
//!
//! The map owns one generation of sessions from the finder and the bindings
//! resolved over it. A refresh enumerates a fresh generation, swaps it in and
//! releases the previous one. All calls come from the dispatch task, so at
//! most one volume call is in flight per session.

mod targets;

#[cfg(test)]
mod tests;

pub use targets::{claimed_names, Bindings, Target};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::audio::SessionFinder;
use crate::config::AppConfig;
use crate::error::SessionError;
use crate::link::DeviceSink;
use crate::protocol::{
    significantly_different, DeviceMessage, NoiseReduction, SliderCommand, SliderMoveEvent,
};
use crate::session::AudioSession;

/// Refresh pacing
#[derive(Debug, Clone)]
pub struct RefreshTimings {
    /// Minimum gap between refreshes triggered by a failing session
    pub lazy_min_interval: Duration,
    /// Refresh at least this often, checked on each move
    pub forced_interval: Duration,
}

impl Default for RefreshTimings {
    fn default() -> Self {
        Self {
            lazy_min_interval: Duration::from_secs(5),
            forced_interval: Duration::from_secs(45),
        }
    }
}

/// Slider to session routing table
pub struct SessionMap {
    finder: Arc<SessionFinder>,
    sink: Arc<dyn DeviceSink>,
    config: Arc<AppConfig>,
    sessions: Vec<AudioSession>,
    bindings: Bindings,
    timings: RefreshTimings,
    last_refresh: Option<Instant>,
}

impl SessionMap {
    pub fn new(finder: Arc<SessionFinder>, sink: Arc<dyn DeviceSink>, config: Arc<AppConfig>) -> Self {
        Self::with_timings(finder, sink, config, RefreshTimings::default())
    }

    pub fn with_timings(
        finder: Arc<SessionFinder>,
        sink: Arc<dyn DeviceSink>,
        config: Arc<AppConfig>,
        timings: RefreshTimings,
    ) -> Self {
        Self {
            finder,
            sink,
            config,
            sessions: Vec::new(),
            bindings: Bindings::default(),
            timings,
            last_refresh: None,
        }
    }

    /// First enumeration; failures are logged and retried on later triggers
    pub fn initialize(&mut self) {
        debug!("Initializing session map");
        self.refresh();
        info!(
            sessions = self.sessions.len(),
            bound_sliders = self.bindings.by_slider.len(),
            "Session map initialized"
        );
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    /// Swap in a reloaded config and rebuild against fresh sessions
    pub fn set_config(&mut self, config: Arc<AppConfig>) {
        self.config = config;
        self.refresh();
    }

    pub fn sessions(&self) -> &[AudioSession] {
        &self.sessions
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// Sessions currently bound to a slider, excluding `deej.current`
    pub fn sessions_for(&self, slider: usize) -> Vec<&AudioSession> {
        self.bindings
            .sessions_for(slider)
            .iter()
            .filter_map(|&i| self.sessions.get(i))
            .collect()
    }

    /// Keys of the sessions in the unmapped bucket
    pub fn unmapped_keys(&self) -> Vec<&str> {
        self.bindings
            .unmapped
            .iter()
            .filter_map(|&i| self.sessions.get(i))
            .map(AudioSession::key)
            .collect()
    }

    /// Enumerate a fresh generation and release the previous one
    ///
    /// On failure the current generation is kept.
    pub fn refresh(&mut self) {
        self.last_refresh = Some(Instant::now());

        let fresh = match self.finder.get_all_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Failed to get sessions, keeping previous set");
                // the config may have changed under the kept generation
                self.bindings = targets::resolve(&self.config, &self.sessions);
                return;
            },
        };

        let previous = std::mem::replace(&mut self.sessions, fresh);
        release_all(previous);

        self.bindings = targets::resolve(&self.config, &self.sessions);
        debug!(
            sessions = self.sessions.len(),
            unmapped = self.bindings.unmapped.len(),
            "Re-acquired sessions"
        );
    }

    /// Release every session held by the map
    pub fn release(&mut self) {
        release_all(std::mem::take(&mut self.sessions));
        self.bindings = Bindings::default();
        debug!("Released all sessions in session map");
    }

    /// Act on one decoded slider event
    pub fn handle_event(&mut self, event: &SliderMoveEvent) {
        match event.command {
            SliderCommand::Set => self.apply_volume(event.slider, event.value),
            SliderCommand::Increment | SliderCommand::Decrement | SliderCommand::RequestNames => {
                debug!(slider = event.slider, command = ?event.command, "Device requested slider names");
                self.announce_names();
            },
        }
    }

    /// Send the configured slider labels to the device
    pub fn announce_names(&self) {
        let names = self.config.slider_names_list();
        if let Err(e) = self.sink.send(&DeviceMessage::SliderNames(names)) {
            debug!(error = %e, "Could not send slider names");
        }
    }

    fn apply_volume(&mut self, slider: usize, value: f32) {
        if self.refresh_due() {
            debug!("Session set is old, refreshing before apply");
            self.refresh();
        }

        let ceiling = f32::from(self.config.max_volume(slider));
        let effective = (value * (ceiling / 100.0)).clamp(0.0, 1.0);
        let level = self.config.noise_reduction;

        let mut targets: BTreeSet<usize> = self.bindings.sessions_for(slider).iter().copied().collect();
        if self.bindings.follows_foreground(slider) {
            targets.extend(self.foreground_sessions());
        }

        if targets.is_empty() {
            trace!(slider, "No sessions bound to slider");
            return;
        }

        let mut needs_refresh = false;
        for index in targets {
            let Some(session) = self.sessions.get(index) else {
                continue;
            };

            match apply_to(session, effective, level) {
                Ok(true) => trace!(slider, session = %session, volume = effective, "Applied slider move"),
                Ok(false) => {},
                Err(e) if e.needs_refresh() => {
                    debug!(session = %session, error = %e, "Session no longer usable");
                    needs_refresh = true;
                },
                Err(e) => warn!(session = %session, error = %e, "Failed to set session volume"),
            }
        }

        if needs_refresh && self.lazy_refresh_allowed() {
            debug!("Stale session seen, refreshing");
            self.refresh();
        }
    }

    /// Process sessions for the foreground window's executable
    fn foreground_sessions(&self) -> Vec<usize> {
        let Some(name) = self.finder.foreground_process_name() else {
            return Vec::new();
        };
        let name = name.to_lowercase();

        self.sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_process() && s.key() == name)
            .map(|(i, _)| i)
            .collect()
    }

    fn refresh_due(&self) -> bool {
        self.last_refresh
            .map_or(true, |at| at.elapsed() >= self.timings.forced_interval)
    }

    fn lazy_refresh_allowed(&self) -> bool {
        self.last_refresh
            .map_or(true, |at| at.elapsed() >= self.timings.lazy_min_interval)
    }
}

impl Drop for SessionMap {
    fn drop(&mut self) {
        self.release();
    }
}

/// Set `volume` if it is far enough from the current one; true if written
fn apply_to(
    session: &AudioSession,
    volume: f32,
    level: NoiseReduction,
) -> Result<bool, SessionError> {
    let current = session.volume()?;
    if !significantly_different(current, volume, level) {
        return Ok(false);
    }
    session.set_volume(volume)?;
    Ok(true)
}

fn release_all(sessions: Vec<AudioSession>) {
    for mut session in sessions {
        session.release();
    }
}
