//! WASAPI backend (Windows Core Audio)
//!
//! All COM objects live in the multithreaded apartment; every entry point
//! joins it first on the calling thread. Volume and mute writes carry a fixed
//! event context so other audio clients can tell our changes apart.

use std::cell::Cell;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace, warn};
use windows::core::{implement, Interface, GUID, PCWSTR, PWSTR};
use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;
use windows::Win32::Foundation::{CloseHandle, BOOL, FALSE, HWND, RPC_E_CHANGED_MODE, S_OK};
use windows::Win32::Media::Audio::Endpoints::IAudioEndpointVolume;
use windows::Win32::Media::Audio::{
    eAll, eCapture, eConsole, eRender, AudioSessionStateExpired, AUDCLNT_E_DEVICE_INVALIDATED, EDataFlow, ERole,
    IAudioSessionControl2, IAudioSessionManager2, IMMDevice, IMMDeviceEnumerator, IMMEndpoint,
    IMMNotificationClient, IMMNotificationClient_Impl, ISimpleAudioVolume, MMDeviceEnumerator,
    DEVICE_STATE, DEVICE_STATE_ACTIVE,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CLSCTX_ALL, COINIT_MULTITHREADED, STGM_READ,
};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32,
    PROCESS_QUERY_LIMITED_INFORMATION,
};
use windows::Win32::UI::Shell::PropertiesSystem::{PropVariantToStringAlloc, PROPERTYKEY};
use windows::Win32::UI::WindowsAndMessaging::{GetForegroundWindow, GetWindowThreadProcessId};

use super::{AudioBackend, DeviceNotificationSink, EndpointInfo, RawSession};
use crate::error::AudioError;
use crate::session::{Direction, SessionControl};

/// Event context attached to every volume/mute write
const EVENT_CONTEXT: GUID = GUID::from_u128(0x1ec920a1_7db8_44ba_9779_e5d28ed9f330);

const STILL_ACTIVE: u32 = 259;

thread_local! {
    static COM_JOINED: Cell<bool> = const { Cell::new(false) };
}

fn backend_error(context: &str, err: windows::core::Error) -> AudioError {
    AudioError::Backend(format!("{}: {}", context, err))
}

/// Join the multithreaded apartment on this thread, once
fn ensure_com() -> Result<(), AudioError> {
    if COM_JOINED.with(Cell::get) {
        return Ok(());
    }

    let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
    if hr.is_err() && hr != RPC_E_CHANGED_MODE {
        return Err(AudioError::Backend(format!("CoInitializeEx failed: {}", hr.message())));
    }
    if hr == RPC_E_CHANGED_MODE {
        debug!("COM already initialized in another apartment on this thread");
    }

    COM_JOINED.with(|joined| joined.set(true));
    Ok(())
}

fn data_flow(direction: Direction) -> EDataFlow {
    match direction {
        Direction::Output => eRender,
        Direction::Input => eCapture,
    }
}

fn take_pwstr(value: PWSTR) -> Result<String, AudioError> {
    let text = unsafe { value.to_string() };
    unsafe { CoTaskMemFree(Some(value.0 as *const _)) };
    text.map_err(|e| AudioError::Backend(format!("invalid UTF-16 from audio API: {}", e)))
}

/// Forwards endpoint notifications to the finder
#[implement(IMMNotificationClient)]
struct NotificationClient {
    sink: Arc<dyn DeviceNotificationSink>,
}

fn pcwstr_lossy(value: &PCWSTR) -> String {
    if value.is_null() {
        return String::new();
    }
    unsafe { value.to_string() }.unwrap_or_default()
}

impl IMMNotificationClient_Impl for NotificationClient {
    fn OnDeviceStateChanged(&self, device_id: &PCWSTR, new_state: DEVICE_STATE) -> windows::core::Result<()> {
        self.sink.device_state_changed(&pcwstr_lossy(device_id), new_state.0);
        Ok(())
    }

    fn OnDeviceAdded(&self, device_id: &PCWSTR) -> windows::core::Result<()> {
        self.sink.device_added(&pcwstr_lossy(device_id));
        Ok(())
    }

    fn OnDeviceRemoved(&self, device_id: &PCWSTR) -> windows::core::Result<()> {
        self.sink.device_removed(&pcwstr_lossy(device_id));
        Ok(())
    }

    fn OnDefaultDeviceChanged(
        &self,
        flow: EDataFlow,
        _role: ERole,
        _default_device_id: &PCWSTR,
    ) -> windows::core::Result<()> {
        let direction = if flow == eCapture {
            Direction::Input
        } else {
            Direction::Output
        };
        self.sink.default_device_changed(direction);
        Ok(())
    }

    fn OnPropertyValueChanged(&self, _device_id: &PCWSTR, _key: &PROPERTYKEY) -> windows::core::Result<()> {
        Ok(())
    }
}

struct Connection {
    enumerator: IMMDeviceEnumerator,
    client: IMMNotificationClient,
}

/// Core Audio through `IMMDeviceEnumerator`
pub struct WasapiBackend {
    connection: Option<Connection>,
}

// COM objects here are created in the multithreaded apartment and may be used
// from any thread that joined it (see ensure_com)
unsafe impl Send for WasapiBackend {}

impl WasapiBackend {
    pub fn new() -> Self {
        Self { connection: None }
    }

    fn enumerator(&self) -> Result<&IMMDeviceEnumerator, AudioError> {
        ensure_com()?;
        self.connection
            .as_ref()
            .map(|c| &c.enumerator)
            .ok_or(AudioError::NotInitialized)
    }

    fn find_device(&self, endpoint: &EndpointInfo) -> Result<IMMDevice, AudioError> {
        let enumerator = self.enumerator()?;
        let id: Vec<u16> = endpoint.id.encode_utf16().chain(std::iter::once(0)).collect();
        unsafe { enumerator.GetDevice(PCWSTR(id.as_ptr())) }
            .map_err(|e| backend_error("get device", e))
    }

    fn describe(device: &IMMDevice) -> Result<EndpointInfo, AudioError> {
        unsafe {
            let id = take_pwstr(device.GetId().map_err(|e| backend_error("get device id", e))?)?;

            let store = device
                .OpenPropertyStore(STGM_READ)
                .map_err(|e| backend_error("open endpoint property store", e))?;
            let value = store
                .GetValue(&PKEY_Device_FriendlyName)
                .map_err(|e| backend_error("get device friendly name", e))?;
            let friendly_name = take_pwstr(
                PropVariantToStringAlloc(&value).map_err(|e| backend_error("read friendly name", e))?,
            )?;

            let flow = device
                .cast::<IMMEndpoint>()
                .and_then(|endpoint| endpoint.GetDataFlow())
                .map_err(|e| backend_error("get data flow", e))?;
            let direction = if flow == eCapture {
                Direction::Input
            } else {
                Direction::Output
            };

            Ok(EndpointInfo {
                id,
                friendly_name,
                direction,
            })
        }
    }
}

impl Default for WasapiBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for WasapiBackend {
    fn connect(&mut self, sink: Arc<dyn DeviceNotificationSink>) -> Result<(), AudioError> {
        if self.connection.is_some() {
            return Ok(());
        }
        ensure_com()?;

        let enumerator: IMMDeviceEnumerator =
            unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) }
                .map_err(|e| backend_error("create device enumerator", e))?;

        let client: IMMNotificationClient = NotificationClient { sink }.into();
        unsafe { enumerator.RegisterEndpointNotificationCallback(&client) }
            .map_err(|e| backend_error("register device notifications", e))?;

        debug!("Connected to Windows Core Audio");
        self.connection = Some(Connection { enumerator, client });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            if ensure_com().is_ok() {
                if let Err(e) = unsafe {
                    connection
                        .enumerator
                        .UnregisterEndpointNotificationCallback(&connection.client)
                } {
                    warn!(error = %e, "Failed to unregister device notifications");
                }
            }
            debug!("Disconnected from Windows Core Audio");
        }
    }

    fn default_endpoint(&mut self, direction: Direction) -> Result<Option<EndpointInfo>, AudioError> {
        let enumerator = self.enumerator()?;
        match unsafe { enumerator.GetDefaultAudioEndpoint(data_flow(direction), eConsole) } {
            Ok(device) => Ok(Some(Self::describe(&device)?)),
            Err(e) => {
                trace!(%direction, error = %e, "No default endpoint");
                Ok(None)
            },
        }
    }

    fn active_endpoints(&mut self) -> Result<Vec<EndpointInfo>, AudioError> {
        let enumerator = self.enumerator()?;
        unsafe {
            let collection = enumerator
                .EnumAudioEndpoints(eAll, DEVICE_STATE_ACTIVE)
                .map_err(|e| backend_error("enumerate active audio endpoints", e))?;
            let count = collection
                .GetCount()
                .map_err(|e| backend_error("get device count", e))?;

            let mut endpoints = Vec::with_capacity(count as usize);
            for index in 0..count {
                let device = collection
                    .Item(index)
                    .map_err(|e| backend_error("get device from collection", e))?;
                endpoints.push(Self::describe(&device)?);
            }
            Ok(endpoints)
        }
    }

    fn endpoint_control(&mut self, endpoint: &EndpointInfo) -> Result<Box<dyn SessionControl>, AudioError> {
        let device = self.find_device(endpoint)?;
        let volume: IAudioEndpointVolume = unsafe { device.Activate(CLSCTX_ALL, None) }
            .map_err(|e| backend_error("activate endpoint volume", e))?;
        Ok(Box::new(EndpointVolumeControl { volume }))
    }

    fn process_sessions(&mut self, endpoint: &EndpointInfo) -> Result<Vec<RawSession>, AudioError> {
        let device = self.find_device(endpoint)?;
        debug!(device = %endpoint.friendly_name, "Enumerating process sessions for audio output device");

        unsafe {
            let manager: IAudioSessionManager2 = device
                .Activate(CLSCTX_ALL, None)
                .map_err(|e| backend_error("activate session manager", e))?;
            let sessions = manager
                .GetSessionEnumerator()
                .map_err(|e| backend_error("get session enumerator", e))?;
            let count = sessions
                .GetCount()
                .map_err(|e| backend_error("get session count", e))?;

            let mut raw = Vec::with_capacity(count.max(0) as usize);
            for index in 0..count {
                let control: IAudioSessionControl2 = sessions
                    .GetSession(index)
                    .and_then(|s| s.cast())
                    .map_err(|e| backend_error("get session", e))?;
                let volume: ISimpleAudioVolume = control
                    .cast()
                    .map_err(|e| backend_error("query ISimpleAudioVolume", e))?;

                let system_sounds = control.IsSystemSoundsSession() == S_OK;
                let pid = match control.GetProcessId() {
                    Ok(pid) => pid,
                    Err(_) if system_sounds => 0,
                    Err(e) => return Err(backend_error("query session pid", e)),
                };

                raw.push(RawSession {
                    pid,
                    system_sounds,
                    control: Box::new(ProcessSessionControl {
                        pid,
                        control,
                        volume,
                    }),
                });
            }
            Ok(raw)
        }
    }

    fn process_name(&self, pid: u32) -> Result<String, AudioError> {
        ensure_com()?;
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, FALSE, pid)
                .map_err(|_| AudioError::ProcessExited(pid))?;

            let mut exit_code = 0u32;
            let alive = GetExitCodeProcess(handle, &mut exit_code).is_ok() && exit_code == STILL_ACTIVE;

            let mut buf = [0u16; 1024];
            let mut len = buf.len() as u32;
            let queried =
                QueryFullProcessImageNameW(handle, PROCESS_NAME_WIN32, PWSTR(buf.as_mut_ptr()), &mut len);
            let _ = CloseHandle(handle);

            if !alive {
                return Err(AudioError::ProcessExited(pid));
            }
            queried.map_err(|e| backend_error("query process image name", e))?;

            let path = String::from_utf16_lossy(&buf[..len as usize]);
            Ok(Path::new(&path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or(path))
        }
    }

    fn foreground_pid(&self) -> Option<u32> {
        unsafe {
            let window = GetForegroundWindow();
            if window == HWND::default() {
                return None;
            }
            let mut pid = 0u32;
            GetWindowThreadProcessId(window, Some(&mut pid));
            (pid != 0).then_some(pid)
        }
    }
}

impl Drop for WasapiBackend {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Whole-endpoint volume (master and device sessions)
struct EndpointVolumeControl {
    volume: IAudioEndpointVolume,
}

// see WasapiBackend
unsafe impl Send for EndpointVolumeControl {}

impl SessionControl for EndpointVolumeControl {
    fn volume(&self) -> Result<f32, AudioError> {
        ensure_com()?;
        unsafe { self.volume.GetMasterVolumeLevelScalar() }
            .map_err(|e| backend_error("get master volume", e))
    }

    fn set_volume(&self, volume: f32) -> Result<(), AudioError> {
        ensure_com()?;
        unsafe { self.volume.SetMasterVolumeLevelScalar(volume, &EVENT_CONTEXT) }
            .map_err(|e| backend_error("set master volume", e))
    }

    fn mute(&self) -> Result<bool, AudioError> {
        ensure_com()?;
        unsafe { self.volume.GetMute() }
            .map(BOOL::as_bool)
            .map_err(|e| backend_error("get master mute", e))
    }

    fn set_mute(&self, muted: bool) -> Result<(), AudioError> {
        ensure_com()?;
        unsafe { self.volume.SetMute(BOOL::from(muted), &EVENT_CONTEXT) }
            .map_err(|e| backend_error("set master mute", e))
    }
}

/// One process's session on a render endpoint
struct ProcessSessionControl {
    pid: u32,
    control: IAudioSessionControl2,
    volume: ISimpleAudioVolume,
}

// see WasapiBackend
unsafe impl Send for ProcessSessionControl {}

impl ProcessSessionControl {
    fn check_alive(&self) -> Result<(), AudioError> {
        ensure_com()?;
        let state = unsafe { self.control.GetState() }.map_err(|e| backend_error("get session state", e))?;
        if state == AudioSessionStateExpired {
            return Err(AudioError::ProcessExited(self.pid));
        }
        Ok(())
    }

    fn classify(&self, context: &str, err: windows::core::Error) -> AudioError {
        // the endpoint went away under the session
        if err.code() == AUDCLNT_E_DEVICE_INVALIDATED {
            return AudioError::ProcessExited(self.pid);
        }
        backend_error(context, err)
    }
}

impl SessionControl for ProcessSessionControl {
    fn volume(&self) -> Result<f32, AudioError> {
        self.check_alive()?;
        unsafe { self.volume.GetMasterVolume() }.map_err(|e| self.classify("get session volume", e))
    }

    fn set_volume(&self, volume: f32) -> Result<(), AudioError> {
        self.check_alive()?;
        unsafe { self.volume.SetMasterVolume(volume, &EVENT_CONTEXT) }
            .map_err(|e| self.classify("set session volume", e))
    }

    fn mute(&self) -> Result<bool, AudioError> {
        self.check_alive()?;
        unsafe { self.volume.GetMute() }
            .map(BOOL::as_bool)
            .map_err(|e| self.classify("get session mute", e))
    }

    fn set_mute(&self, muted: bool) -> Result<(), AudioError> {
        self.check_alive()?;
        unsafe { self.volume.SetMute(BOOL::from(muted), &EVENT_CONTEXT) }
            .map_err(|e| self.classify("set session mute", e))
    }
}
