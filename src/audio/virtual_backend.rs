//! In-memory audio subsystem
//!
//! Used where no native backend exists and as the test double for everything
//! above the backend seam. The mixer handle is shared: tests keep one clone to
//! script the "OS" (spawn and kill processes, switch default devices, move
//! volumes) while the finder drives the backend built from another.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{AudioBackend, DeviceNotificationSink, EndpointInfo, RawSession};
use crate::error::AudioError;
use crate::session::{Direction, SessionControl};

#[derive(Debug, Clone)]
struct VirtualEndpoint {
    info: EndpointInfo,
    volume: f32,
    muted: bool,
    system_volume: f32,
}

#[derive(Debug, Clone)]
struct VirtualProcess {
    pid: u32,
    name: String,
    endpoint_id: String,
    volume: f32,
    muted: bool,
    alive: bool,
}

#[derive(Default)]
struct MixerState {
    connected: bool,
    connect_failures: u32,
    endpoints: Vec<VirtualEndpoint>,
    default_output: Option<String>,
    default_input: Option<String>,
    processes: Vec<VirtualProcess>,
    foreground: Option<u32>,
    live_handles: usize,
    volume_writes: usize,
    sink: Option<Arc<dyn DeviceNotificationSink>>,
}

impl MixerState {
    fn endpoint_mut(&mut self, id: &str) -> Option<&mut VirtualEndpoint> {
        self.endpoints.iter_mut().find(|e| e.info.id == id)
    }

    fn process_mut(&mut self, pid: u32) -> Option<&mut VirtualProcess> {
        self.processes.iter_mut().find(|p| p.pid == pid)
    }
}

/// Scriptable in-memory mixer
#[derive(Clone, Default)]
pub struct VirtualMixer {
    state: Arc<Mutex<MixerState>>,
}

impl VirtualMixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mixer with one default speaker and one default microphone
    pub fn with_default_devices() -> Self {
        let mixer = Self::new();
        mixer.add_endpoint("speakers", "Speakers", Direction::Output);
        mixer.add_endpoint("microphone", "Microphone", Direction::Input);
        mixer
    }

    pub fn backend(&self) -> Box<dyn AudioBackend> {
        Box::new(VirtualBackend {
            mixer: self.clone(),
        })
    }

    /// Add an endpoint; the first one per direction becomes the default
    pub fn add_endpoint(&self, id: &str, friendly_name: &str, direction: Direction) {
        let mut state = self.state.lock();
        state.endpoints.push(VirtualEndpoint {
            info: EndpointInfo {
                id: id.to_string(),
                friendly_name: friendly_name.to_string(),
                direction,
            },
            volume: 1.0,
            muted: false,
            system_volume: 1.0,
        });

        let default = match direction {
            Direction::Output => &mut state.default_output,
            Direction::Input => &mut state.default_input,
        };
        if default.is_none() {
            *default = Some(id.to_string());
        }
    }

    /// Switch the default endpoint and notify like the OS would
    pub fn set_default(&self, direction: Direction, id: &str) {
        let sink = {
            let mut state = self.state.lock();
            match direction {
                Direction::Output => state.default_output = Some(id.to_string()),
                Direction::Input => state.default_input = Some(id.to_string()),
            }
            state.sink.clone()
        };

        if let Some(sink) = sink {
            sink.default_device_changed(direction);
        }
    }

    /// Start a process playing on the default output
    pub fn spawn_process(&self, pid: u32, name: &str) {
        let endpoint = self.state.lock().default_output.clone().unwrap_or_default();
        self.spawn_process_on(pid, name, &endpoint);
    }

    pub fn spawn_process_on(&self, pid: u32, name: &str, endpoint_id: &str) {
        self.state.lock().processes.push(VirtualProcess {
            pid,
            name: name.to_string(),
            endpoint_id: endpoint_id.to_string(),
            volume: 1.0,
            muted: false,
            alive: true,
        });
    }

    /// Kill a process; its session lingers until the next enumeration skips it
    pub fn exit_process(&self, pid: u32) {
        if let Some(process) = self.state.lock().process_mut(pid) {
            process.alive = false;
        }
    }

    pub fn set_foreground(&self, pid: Option<u32>) {
        self.state.lock().foreground = pid;
    }

    pub fn process_volume(&self, pid: u32) -> Option<f32> {
        self.state
            .lock()
            .processes
            .iter()
            .find(|p| p.pid == pid)
            .map(|p| p.volume)
    }

    pub fn set_process_volume(&self, pid: u32, volume: f32) {
        if let Some(process) = self.state.lock().process_mut(pid) {
            process.volume = volume;
        }
    }

    pub fn endpoint_volume(&self, id: &str) -> Option<f32> {
        self.state.lock().endpoint_mut(id).map(|e| e.volume)
    }

    pub fn set_endpoint_volume(&self, id: &str, volume: f32) {
        if let Some(endpoint) = self.state.lock().endpoint_mut(id) {
            endpoint.volume = volume;
        }
    }

    pub fn set_endpoint_mute(&self, id: &str, muted: bool) {
        if let Some(endpoint) = self.state.lock().endpoint_mut(id) {
            endpoint.muted = muted;
        }
    }

    pub fn system_volume(&self, endpoint_id: &str) -> Option<f32> {
        self.state.lock().endpoint_mut(endpoint_id).map(|e| e.system_volume)
    }

    /// Native handles currently held by sessions
    pub fn live_handles(&self) -> usize {
        self.state.lock().live_handles
    }

    /// Number of volume writes made through session handles
    pub fn volume_writes(&self) -> usize {
        self.state.lock().volume_writes
    }

    /// Simulate the audio service going away
    pub fn drop_connection(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.sink = None;
    }

    /// Make the next `n` connect calls fail
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().connect_failures = n;
    }

    fn control(&self, state: &mut MixerState, target: ControlTarget) -> Box<dyn SessionControl> {
        state.live_handles += 1;
        Box::new(VirtualControl {
            mixer: self.clone(),
            target,
        })
    }
}

struct VirtualBackend {
    mixer: VirtualMixer,
}

impl VirtualBackend {
    fn connected_state(&self) -> Result<parking_lot::MutexGuard<'_, MixerState>, AudioError> {
        let state = self.mixer.state.lock();
        if !state.connected {
            return Err(AudioError::NotInitialized);
        }
        Ok(state)
    }
}

impl AudioBackend for VirtualBackend {
    fn connect(&mut self, sink: Arc<dyn DeviceNotificationSink>) -> Result<(), AudioError> {
        let mut state = self.mixer.state.lock();
        if state.connected {
            return Ok(());
        }
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(AudioError::Backend("audio service unavailable".into()));
        }
        state.connected = true;
        state.sink = Some(sink);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.mixer.state.lock().connected
    }

    fn disconnect(&mut self) {
        self.mixer.drop_connection();
    }

    fn default_endpoint(&mut self, direction: Direction) -> Result<Option<EndpointInfo>, AudioError> {
        let mut state = self.connected_state()?;
        let id = match direction {
            Direction::Output => state.default_output.clone(),
            Direction::Input => state.default_input.clone(),
        };
        Ok(id.and_then(|id| state.endpoint_mut(&id).map(|e| e.info.clone())))
    }

    fn active_endpoints(&mut self) -> Result<Vec<EndpointInfo>, AudioError> {
        let state = self.connected_state()?;
        Ok(state.endpoints.iter().map(|e| e.info.clone()).collect())
    }

    fn endpoint_control(&mut self, endpoint: &EndpointInfo) -> Result<Box<dyn SessionControl>, AudioError> {
        let mut state = self.connected_state()?;
        if state.endpoint_mut(&endpoint.id).is_none() {
            return Err(AudioError::Backend(format!("endpoint {} not found", endpoint.id)));
        }
        Ok(self
            .mixer
            .control(&mut state, ControlTarget::Endpoint(endpoint.id.clone())))
    }

    fn process_sessions(&mut self, endpoint: &EndpointInfo) -> Result<Vec<RawSession>, AudioError> {
        let mut state = self.connected_state()?;
        let pids: Vec<u32> = state
            .processes
            .iter()
            .filter(|p| p.endpoint_id == endpoint.id)
            .map(|p| p.pid)
            .collect();

        let mut sessions = Vec::with_capacity(pids.len() + 1);
        sessions.push(RawSession {
            pid: 0,
            system_sounds: true,
            control: self
                .mixer
                .control(&mut state, ControlTarget::SystemSounds(endpoint.id.clone())),
        });
        for pid in pids {
            sessions.push(RawSession {
                pid,
                system_sounds: false,
                control: self.mixer.control(&mut state, ControlTarget::Process(pid)),
            });
        }
        Ok(sessions)
    }

    fn process_name(&self, pid: u32) -> Result<String, AudioError> {
        let state = self.mixer.state.lock();
        state
            .processes
            .iter()
            .find(|p| p.pid == pid && p.alive)
            .map(|p| p.name.clone())
            .ok_or(AudioError::ProcessExited(pid))
    }

    fn foreground_pid(&self) -> Option<u32> {
        self.mixer.state.lock().foreground
    }
}

#[derive(Debug, Clone)]
enum ControlTarget {
    Process(u32),
    Endpoint(String),
    SystemSounds(String),
}

struct VirtualControl {
    mixer: VirtualMixer,
    target: ControlTarget,
}

impl VirtualControl {
    fn with_target<T>(
        &self,
        read: impl FnOnce(&mut MixerState, &ControlTarget) -> Option<T>,
    ) -> Result<T, AudioError> {
        let mut state = self.mixer.state.lock();
        read(&mut state, &self.target).ok_or_else(|| match &self.target {
            ControlTarget::Process(pid) => AudioError::ProcessExited(*pid),
            ControlTarget::Endpoint(id) | ControlTarget::SystemSounds(id) => {
                AudioError::Backend(format!("endpoint {} invalidated", id))
            },
        })
    }
}

impl SessionControl for VirtualControl {
    fn volume(&self) -> Result<f32, AudioError> {
        self.with_target(|state, target| match target {
            ControlTarget::Process(pid) => state
                .process_mut(*pid)
                .filter(|p| p.alive)
                .map(|p| p.volume),
            ControlTarget::Endpoint(id) => state.endpoint_mut(id).map(|e| e.volume),
            ControlTarget::SystemSounds(id) => state.endpoint_mut(id).map(|e| e.system_volume),
        })
    }

    fn set_volume(&self, volume: f32) -> Result<(), AudioError> {
        self.with_target(|state, target| {
            state.volume_writes += 1;
            match target {
                ControlTarget::Process(pid) => state
                    .process_mut(*pid)
                    .filter(|p| p.alive)
                    .map(|p| p.volume = volume),
                ControlTarget::Endpoint(id) => state.endpoint_mut(id).map(|e| e.volume = volume),
                ControlTarget::SystemSounds(id) => {
                    state.endpoint_mut(id).map(|e| e.system_volume = volume)
                },
            }
        })
    }

    fn mute(&self) -> Result<bool, AudioError> {
        self.with_target(|state, target| match target {
            ControlTarget::Process(pid) => state
                .process_mut(*pid)
                .filter(|p| p.alive)
                .map(|p| p.muted),
            ControlTarget::Endpoint(id) | ControlTarget::SystemSounds(id) => {
                state.endpoint_mut(id).map(|e| e.muted)
            },
        })
    }

    fn set_mute(&self, muted: bool) -> Result<(), AudioError> {
        self.with_target(|state, target| match target {
            ControlTarget::Process(pid) => state
                .process_mut(*pid)
                .filter(|p| p.alive)
                .map(|p| p.muted = muted),
            ControlTarget::Endpoint(id) | ControlTarget::SystemSounds(id) => {
                state.endpoint_mut(id).map(|e| e.muted = muted)
            },
        })
    }
}

impl Drop for VirtualControl {
    fn drop(&mut self) {
        let mut state = self.mixer.state.lock();
        state.live_handles = state.live_handles.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    impl DeviceNotificationSink for NullSink {
        fn default_device_changed(&self, _direction: Direction) {}
    }

    #[test]
    fn test_calls_require_connection() {
        let mixer = VirtualMixer::with_default_devices();
        let mut backend = mixer.backend();
        assert_eq!(
            backend.default_endpoint(Direction::Output),
            Err(AudioError::NotInitialized)
        );

        backend.connect(Arc::new(NullSink)).unwrap();
        let output = backend.default_endpoint(Direction::Output).unwrap().unwrap();
        assert_eq!(output.friendly_name, "Speakers");
    }

    #[test]
    fn test_handles_are_counted() {
        let mixer = VirtualMixer::with_default_devices();
        mixer.spawn_process(10, "spotify.exe");
        let mut backend = mixer.backend();
        backend.connect(Arc::new(NullSink)).unwrap();

        let output = backend.default_endpoint(Direction::Output).unwrap().unwrap();
        let sessions = backend.process_sessions(&output).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(mixer.live_handles(), 2);

        drop(sessions);
        assert_eq!(mixer.live_handles(), 0);
    }

    #[test]
    fn test_exited_process() {
        let mixer = VirtualMixer::with_default_devices();
        mixer.spawn_process(10, "spotify.exe");
        let mut backend = mixer.backend();
        backend.connect(Arc::new(NullSink)).unwrap();

        let output = backend.default_endpoint(Direction::Output).unwrap().unwrap();
        let sessions = backend.process_sessions(&output).unwrap();
        mixer.exit_process(10);

        assert_eq!(backend.process_name(10), Err(AudioError::ProcessExited(10)));
        assert_eq!(
            sessions[1].control.set_volume(0.5),
            Err(AudioError::ProcessExited(10))
        );
    }
}
