//! Master volume monitor
//!
//! Polls the default output's volume and mute and mirrors every change to the
//! device. Polling is slow while nothing moves and fast for a while after a
//! change, so OS volume keys show up on the device display within one fast tick.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::audio::SessionFinder;
use crate::link::DeviceSink;
use crate::protocol::DeviceMessage;
use crate::session::{AudioSession, Direction};

/// Monitor timing constants
#[derive(Debug, Clone)]
pub struct MonitorTimings {
    pub low_rate: Duration,
    pub high_rate: Duration,
    /// Unchanged polls before dropping back to the low rate
    pub stable_threshold: u32,
}

impl Default for MonitorTimings {
    fn default() -> Self {
        Self {
            low_rate: Duration::from_millis(200),
            high_rate: Duration::from_millis(10),
            stable_threshold: 100,
        }
    }
}

/// Master output state as the device displays it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterState {
    pub muted: bool,
    pub volume_percent: u8,
}

impl MasterState {
    pub fn from_scalar(volume: f32, muted: bool) -> Self {
        Self {
            muted,
            volume_percent: (volume.clamp(0.0, 1.0) * 100.0).round() as u8,
        }
    }

    pub fn message(&self) -> DeviceMessage {
        DeviceMessage::MasterState {
            muted: self.muted,
            volume_percent: self.volume_percent,
        }
    }
}

/// Last state sent to the device, shared with the link greeting
pub type SharedMasterState = Arc<Mutex<Option<MasterState>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollRate {
    Low,
    High,
}

/// Two-speed polling decision
#[derive(Debug)]
pub struct RateController {
    timings: MonitorTimings,
    rate: PollRate,
    stable: u32,
    last: Option<MasterState>,
}

impl RateController {
    pub fn new(timings: MonitorTimings) -> Self {
        Self {
            timings,
            rate: PollRate::Low,
            stable: 0,
            last: None,
        }
    }

    pub fn rate(&self) -> PollRate {
        self.rate
    }

    pub fn interval(&self) -> Duration {
        match self.rate {
            PollRate::Low => self.timings.low_rate,
            PollRate::High => self.timings.high_rate,
        }
    }

    /// Record one poll; true when the state changed and must be sent
    pub fn observe(&mut self, state: MasterState) -> bool {
        if self.last == Some(state) {
            self.stable = self.stable.saturating_add(1);
            if self.stable >= self.timings.stable_threshold && self.rate != PollRate::Low {
                debug!("Switching to low-frequency polling");
                self.rate = PollRate::Low;
            }
            return false;
        }

        self.last = Some(state);
        self.stable = 0;
        if self.rate != PollRate::High {
            debug!("Switching to high-frequency polling");
            self.rate = PollRate::High;
        }
        true
    }

    /// Forget the last state so the next poll is sent unconditionally
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Polls the master output session and reports changes to the device
pub struct MasterVolumeMonitor {
    finder: Arc<SessionFinder>,
    sink: Arc<dyn DeviceSink>,
    shared: SharedMasterState,
    controller: RateController,
    session: Option<AudioSession>,
}

impl MasterVolumeMonitor {
    pub fn new(finder: Arc<SessionFinder>, sink: Arc<dyn DeviceSink>) -> Self {
        Self::with_timings(finder, sink, MonitorTimings::default())
    }

    pub fn with_timings(finder: Arc<SessionFinder>, sink: Arc<dyn DeviceSink>, timings: MonitorTimings) -> Self {
        Self {
            finder,
            sink,
            shared: Arc::new(Mutex::new(None)),
            controller: RateController::new(timings),
            session: None,
        }
    }

    /// Handle to the last state sent
    pub fn shared_state(&self) -> SharedMasterState {
        Arc::clone(&self.shared)
    }

    pub fn spawn(mut self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Master volume monitor started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.controller.interval()) => self.poll(),
                }
            }

            if let Some(mut session) = self.session.take() {
                session.release();
            }
            debug!("Stopping master volume monitor");
        })
    }

    fn poll(&mut self) {
        let Some(session) = self.master_session() else {
            return;
        };

        let reading = session.volume().and_then(|volume| Ok((volume, session.mute()?)));
        let (volume, muted) = match reading {
            Ok(reading) => reading,
            Err(e) => {
                if e.needs_refresh() {
                    debug!(error = %e, "Master session invalidated, re-acquiring");
                } else {
                    warn!(error = %e, "Failed to read master volume");
                }
                self.drop_session();
                return;
            },
        };

        let state = MasterState::from_scalar(volume, muted);
        if !self.controller.observe(state) {
            return;
        }

        *self.shared.lock() = Some(state);
        trace!(volume = state.volume_percent, muted = state.muted, "Master state changed");
        if let Err(e) = self.sink.send(&state.message()) {
            trace!(error = %e, "Master state not sent");
        }
    }

    fn master_session(&mut self) -> Option<&AudioSession> {
        if self.session.as_ref().is_some_and(|s| s.is_stale() || s.is_released()) {
            self.drop_session();
        }

        if self.session.is_none() {
            match self.finder.acquire_master(Direction::Output) {
                Ok(Some(session)) => {
                    debug!(session = %session, "Acquired master session for monitoring");
                    self.session = Some(session);
                },
                Ok(None) => trace!("No default output device to monitor"),
                Err(e) => trace!(error = %e, "Failed to acquire master session"),
            }
        }

        self.session.as_ref()
    }

    fn drop_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.release();
        }
        // a new device may sit at the same level; send it anyway
        self.controller.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{FinderTimings, VirtualMixer};
    use crate::error::LinkError;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<DeviceMessage>>,
    }

    impl DeviceSink for RecordingSink {
        fn send(&self, message: &DeviceMessage) -> Result<(), LinkError> {
            self.sent.lock().push(message.clone());
            Ok(())
        }
    }

    fn state(volume_percent: u8, muted: bool) -> MasterState {
        MasterState {
            muted,
            volume_percent,
        }
    }

    #[test]
    fn test_first_observation_is_sent() {
        let mut controller = RateController::new(MonitorTimings::default());
        assert_eq!(controller.rate(), PollRate::Low);

        assert!(controller.observe(state(50, false)));
        assert_eq!(controller.rate(), PollRate::High);
        assert_eq!(controller.interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_returns_to_low_rate_after_stable_streak() {
        let mut controller = RateController::new(MonitorTimings::default());
        controller.observe(state(50, false));

        for _ in 0..99 {
            assert!(!controller.observe(state(50, false)));
        }
        assert_eq!(controller.rate(), PollRate::High);

        assert!(!controller.observe(state(50, false)));
        assert_eq!(controller.rate(), PollRate::Low);
        assert_eq!(controller.interval(), Duration::from_millis(200));
    }

    #[test]
    fn test_change_ends_stable_streak() {
        let mut controller = RateController::new(MonitorTimings::default());
        controller.observe(state(50, false));
        for _ in 0..60 {
            controller.observe(state(50, false));
        }

        assert!(controller.observe(state(50, true)));
        for _ in 0..60 {
            controller.observe(state(50, true));
        }
        // streak restarted at the mute change
        assert_eq!(controller.rate(), PollRate::High);
    }

    #[test]
    fn test_master_state_rounding() {
        assert_eq!(MasterState::from_scalar(0.456, false).volume_percent, 46);
        assert_eq!(MasterState::from_scalar(1.2, true), state(100, true));
        assert_eq!(
            state(40, true).message(),
            DeviceMessage::MasterState {
                muted: true,
                volume_percent: 40
            }
        );
    }

    fn sent_states(sink: &RecordingSink) -> Vec<DeviceMessage> {
        sink.sent.lock().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reports_changes() {
        let mixer = VirtualMixer::with_default_devices();
        let finder = Arc::new(SessionFinder::with_timings(mixer.backend(), FinderTimings::default()));
        let sink = Arc::new(RecordingSink::default());

        let monitor = MasterVolumeMonitor::new(finder, sink.clone());
        let shared = monitor.shared_state();
        let token = CancellationToken::new();
        let handle = monitor.spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(sent_states(&sink), vec![state(100, false).message()]);
        assert_eq!(*shared.lock(), Some(state(100, false)));

        mixer.set_endpoint_volume("speakers", 0.4);
        tokio::time::sleep(Duration::from_millis(25)).await;
        mixer.set_endpoint_mute("speakers", true);
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert_eq!(
            sent_states(&sink),
            vec![
                state(100, false).message(),
                state(40, false).message(),
                state(40, true).message(),
            ]
        );

        token.cancel();
        handle.await.unwrap();
        assert_eq!(mixer.live_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_follows_default_device_change() {
        let mixer = VirtualMixer::with_default_devices();
        mixer.add_endpoint("headphones", "Headphones", Direction::Output);
        mixer.set_endpoint_volume("headphones", 0.25);

        let finder = Arc::new(SessionFinder::with_timings(mixer.backend(), FinderTimings::default()));
        let sink = Arc::new(RecordingSink::default());
        let token = CancellationToken::new();
        let handle = MasterVolumeMonitor::new(finder, sink.clone()).spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(250)).await;
        mixer.set_default(Direction::Output, "headphones");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sent_states(&sink).last(), Some(&state(25, false).message()));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_waits_for_output_device() {
        let mixer = VirtualMixer::new();
        let finder = Arc::new(SessionFinder::with_timings(mixer.backend(), FinderTimings::default()));
        let sink = Arc::new(RecordingSink::default());
        let token = CancellationToken::new();
        let handle = MasterVolumeMonitor::new(finder, sink.clone()).spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(sent_states(&sink).is_empty());

        mixer.add_endpoint("speakers", "Speakers", Direction::Output);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(sent_states(&sink), vec![state(100, false).message()]);

        token.cancel();
        handle.await.unwrap();
    }
}
