//! Device link: serial connection lifecycle
//!
//! `Disconnected -> Connecting -> Connected -> Disconnected`. A dedicated
//! reader thread owns the read half of the port and the line decoder; every
//! new connection gets a fresh decoder, so the first line after a reconnect
//! emits every slider. Before reading anything the reader writes a keep-alive
//! and the greeting (slider names, master state).
//!
//! A supervisor task retries the connection on a fixed interval while
//! disconnected and sends keep-alives while connected. The reader never
//! retries by itself: on a read error it closes the port, marks the link
//! disconnected and publishes `LinkStatus::Lost`.

pub mod transport;

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::LinkError;
use crate::protocol::{DecoderOptions, DeviceMessage, LineDecoder, SliderMoveEvent};
pub use transport::{list_ports, PortOpener, PortSettings, SerialStream, SystemPorts};

/// Capacity of each slider-move subscription
pub const EVENT_QUEUE_CAPACITY: usize = 32;

/// Wait before offering an event to a full queue again
const DELIVERY_RETRY: Duration = Duration::from_millis(2);

/// Lines longer than this without a newline are garbage
const MAX_LINE_LEN: usize = 1024;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Published on every link-up and link-loss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Lost,
}

/// Messages written right after a connection opens
pub trait LinkGreeting: Send + Sync {
    fn greeting(&self) -> Vec<DeviceMessage>;
}

/// Anything host messages can be written to
pub trait DeviceSink: Send + Sync {
    fn send(&self, message: &DeviceMessage) -> Result<(), LinkError>;
}

/// Link timing constants
#[derive(Debug, Clone)]
pub struct LinkTimings {
    /// Background reconnect attempt while disconnected
    pub reconnect_interval: Duration,
    /// Keep-alive period while connected
    pub keep_alive_interval: Duration,
    /// Port read timeout; also the stop-signal latency of the reader
    pub read_poll: Duration,
    /// Silence after which the device is considered gone
    pub silence_timeout: Duration,
    /// Wait between opening the port and writing the greeting
    pub settle_delay: Duration,
    /// Backoff per failed attempt (attempt n waits n units)
    pub retry_unit: Duration,
    /// Open attempts per connect
    pub max_attempts: u32,
    /// Wait between stop and start when port settings change
    pub restart_delay: Duration,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(5),
            read_poll: Duration::from_millis(100),
            silence_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(1500),
            retry_unit: Duration::from_secs(1),
            max_attempts: 5,
            restart_delay: Duration::from_millis(50),
        }
    }
}

struct Connection {
    writer: Box<dyn SerialStream>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    generation: u64,
}

struct LinkInner {
    opener: Box<dyn PortOpener>,
    timings: LinkTimings,
    settings: RwLock<PortSettings>,
    options: RwLock<DecoderOptions>,
    verbose: AtomicBool,
    state: Mutex<LinkState>,
    connection: Mutex<Option<Connection>>,
    consumers: Mutex<Vec<mpsc::Sender<SliderMoveEvent>>>,
    status_tx: broadcast::Sender<LinkStatus>,
    greeting: RwLock<Option<Arc<dyn LinkGreeting>>>,
    resync: AtomicBool,
    generation: AtomicU64,
    lifecycle: Mutex<Option<CancellationToken>>,
}

/// Handle to the device link; cheap to clone
#[derive(Clone)]
pub struct DeviceLink {
    inner: Arc<LinkInner>,
}

impl DeviceLink {
    pub fn new(opener: Box<dyn PortOpener>, settings: PortSettings, timings: LinkTimings) -> Self {
        let (status_tx, _) = broadcast::channel(16);

        Self {
            inner: Arc::new(LinkInner {
                opener,
                timings,
                settings: RwLock::new(settings),
                options: RwLock::new(DecoderOptions::default()),
                verbose: AtomicBool::new(false),
                state: Mutex::new(LinkState::Disconnected),
                connection: Mutex::new(None),
                consumers: Mutex::new(Vec::new()),
                status_tx,
                greeting: RwLock::new(None),
                resync: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    /// Link backed by real serial ports
    pub fn system(settings: PortSettings) -> Self {
        Self::new(Box::new(SystemPorts), settings, LinkTimings::default())
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn settings(&self) -> PortSettings {
        self.inner.settings.read().clone()
    }

    /// Subscribe to decoded slider events, in line and field order
    pub fn subscribe(&self) -> mpsc::Receiver<SliderMoveEvent> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        self.inner.consumers.lock().push(tx);
        rx
    }

    /// Subscribe to link-up / link-lost notifications
    pub fn status(&self) -> broadcast::Receiver<LinkStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn set_greeting(&self, greeting: Arc<dyn LinkGreeting>) {
        *self.inner.greeting.write() = Some(greeting);
    }

    pub fn set_options(&self, options: DecoderOptions) {
        *self.inner.options.write() = options;
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.inner.verbose.store(verbose, Ordering::Relaxed);
    }

    /// Forget the slider history so the next line emits every slider
    pub fn request_resync(&self) {
        self.inner.resync.store(true, Ordering::Release);
    }

    /// Connect and start the background supervisor
    ///
    /// The error of the first connection attempt is returned; the supervisor
    /// keeps retrying on its interval either way.
    pub async fn start(&self) -> Result<(), LinkError> {
        if self.state() != LinkState::Disconnected {
            warn!("Already connected, can't start another without closing first");
            return Err(LinkError::AlreadyConnected);
        }

        let token = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match lifecycle.as_ref() {
                Some(token) if !token.is_cancelled() => token.clone(),
                _ => {
                    let token = CancellationToken::new();
                    *lifecycle = Some(token.clone());
                    self.spawn_supervisor(token.clone());
                    token
                },
            }
        };

        self.connect(&token).await
    }

    /// Stop the supervisor and close the port
    pub async fn stop(&self) {
        if let Some(token) = self.inner.lifecycle.lock().take() {
            token.cancel();
        }

        let connection = self.inner.connection.lock().take();
        *self.inner.state.lock() = LinkState::Disconnected;

        match connection {
            Some(connection) => {
                debug!("Shutting down serial connection");
                close_connection(connection).await;
            },
            None => debug!("Not currently connected, nothing to stop"),
        }
    }

    /// Apply new port settings, restarting the link if they changed
    ///
    /// Returns whether a restart happened.
    pub async fn renew(&self, settings: PortSettings) -> Result<bool, LinkError> {
        if *self.inner.settings.read() == settings {
            return Ok(false);
        }

        info!(
            port = %settings.port,
            baud = settings.baud_rate,
            "Detected change in connection parameters, attempting to renew connection"
        );
        *self.inner.settings.write() = settings;

        self.stop().await;
        sleep(self.inner.timings.restart_delay).await;
        self.start().await?;

        debug!("Renewed connection successfully");
        Ok(true)
    }

    /// Write one message to the device
    ///
    /// Fails with `NotConnected` while disconnected; nothing is queued.
    pub fn send(&self, message: &DeviceMessage) -> Result<(), LinkError> {
        self.inner.send(message)
    }

    async fn connect(&self, token: &CancellationToken) -> Result<(), LinkError> {
        {
            let mut state = self.inner.state.lock();
            if *state != LinkState::Disconnected {
                return Ok(());
            }
            *state = LinkState::Connecting;
        }

        let max_attempts = self.inner.timings.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.open_once(token) {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if !err.is_transient() {
                self.set_disconnected();
                return Err(err);
            }

            if attempt >= max_attempts {
                error!(attempts = attempt, error = %err, "Max connection retries reached");
                self.set_disconnected();
                return Err(LinkError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let backoff = self.inner.timings.retry_unit * attempt;
            warn!(attempt, ?backoff, error = %err, "Connection failed, will retry");

            tokio::select! {
                _ = sleep(backoff) => {},
                _ = token.cancelled() => {
                    self.set_disconnected();
                    return Err(LinkError::NotConnected);
                },
            }
        }
    }

    fn open_once(&self, token: &CancellationToken) -> Result<(), LinkError> {
        if token.is_cancelled() {
            return Err(LinkError::NotConnected);
        }

        let settings = self.settings();
        let stream = self.inner.opener.open(&settings, self.inner.timings.read_poll)?;
        let writer = stream.try_clone_stream()?;

        let stop = Arc::new(AtomicBool::new(false));
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;

        {
            // stop() cancels before it takes the connection
            let mut connection = self.inner.connection.lock();
            if token.is_cancelled() {
                debug!(port = %settings.port, "Link stopped while opening, closing port");
                return Err(LinkError::NotConnected);
            }
            *connection = Some(Connection {
                writer,
                stop: stop.clone(),
                reader: None,
                generation,
            });
            *self.inner.state.lock() = LinkState::Connected;
        }

        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name("deej-serial-reader".into())
            .spawn(move || inner.read_loop(stream, stop, generation));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.connection.lock().take();
                self.set_disconnected();
                return Err(LinkError::Io(e));
            },
        };

        if let Some(connection) = self.inner.connection.lock().as_mut() {
            if connection.generation == generation {
                connection.reader = Some(handle);
            }
        }

        info!(port = %settings.port, baud = settings.baud_rate, "Connected to serial port");
        let _ = self.inner.status_tx.send(LinkStatus::Connected);
        Ok(())
    }

    fn set_disconnected(&self) {
        *self.inner.state.lock() = LinkState::Disconnected;
    }

    fn spawn_supervisor(&self, token: CancellationToken) {
        let link = self.clone();
        let timings = self.inner.timings.clone();

        tokio::spawn(async move {
            let mut reconnect = interval(timings.reconnect_interval);
            reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);
            reconnect.tick().await;

            let mut keep_alive = interval(timings.keep_alive_interval);
            keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
            keep_alive.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = reconnect.tick() => {
                        if link.state() == LinkState::Disconnected {
                            debug!("Attempting to reconnect...");
                            if let Err(e) = link.connect(&token).await {
                                warn!(error = %e, "Failed to reconnect");
                            }
                        }
                    },
                    _ = keep_alive.tick() => {
                        if link.is_connected() {
                            if let Err(e) = link.send(&DeviceMessage::KeepAlive) {
                                debug!(error = %e, "Keep-alive not sent");
                            }
                        }
                    },
                }
            }

            debug!("Link supervisor stopped");
        });
    }
}

impl DeviceSink for DeviceLink {
    fn send(&self, message: &DeviceMessage) -> Result<(), LinkError> {
        self.inner.send(message)
    }
}

impl LinkInner {
    fn send(&self, message: &DeviceMessage) -> Result<(), LinkError> {
        let mut connection = self.connection.lock();
        let connection = connection.as_mut().ok_or(LinkError::NotConnected)?;

        let encoded = message.encode();
        connection.writer.write_all(encoded.as_bytes())?;
        connection.writer.flush()?;

        trace!(message = %encoded, "Sent to device");
        Ok(())
    }

    fn write_greeting(&self) {
        let mut messages = vec![DeviceMessage::KeepAlive];
        if let Some(greeting) = self.greeting.read().as_ref() {
            messages.extend(greeting.greeting());
        }

        for message in &messages {
            if let Err(e) = self.send(message) {
                warn!(error = %e, message = %message, "Failed to send greeting");
                return;
            }
        }
        debug!(messages = messages.len(), "Greeting sent");
    }

    fn read_loop(self: Arc<Self>, stream: Box<dyn SerialStream>, stop: Arc<AtomicBool>, generation: u64) {
        if !pause_unless_stopped(self.timings.settle_delay, self.timings.read_poll, &stop) {
            return;
        }
        self.write_greeting();

        let mut decoder = LineDecoder::new();
        let mut lines = LineReader::new(stream, self.timings.read_poll, self.timings.silence_timeout);

        let result = loop {
            match lines.next_line(&stop) {
                Ok(Some(line)) => {
                    if self.resync.swap(false, Ordering::AcqRel) {
                        decoder.reset();
                    }
                    let options = *self.options.read();
                    let events = decoder.decode(&line, &options);
                    self.deliver(events, &stop);
                },
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(()) => debug!("Serial reader stopped"),
            Err(e) => self.connection_lost(generation, &e),
        }
    }

    /// Queue events for every consumer, waiting while a queue is full
    ///
    /// Gives up once `stop` is set so closing the port never waits on a
    /// consumer; the remaining events are dropped.
    fn deliver(&self, events: Vec<SliderMoveEvent>, stop: &AtomicBool) {
        if events.is_empty() {
            return;
        }

        let verbose = self.verbose.load(Ordering::Relaxed);
        let consumers: Vec<_> = self.consumers.lock().clone();
        let mut closed = false;

        'events: for event in events {
            if verbose {
                debug!(slider = event.slider, command = ?event.command, value = event.value, "Slider moved");
            }
            for consumer in &consumers {
                loop {
                    match consumer.try_send(event) {
                        Ok(()) => break,
                        Err(TrySendError::Closed(_)) => {
                            closed = true;
                            break;
                        },
                        Err(TrySendError::Full(_)) => {
                            if stop.load(Ordering::Acquire) {
                                trace!("Link stopping, dropping queued slider events");
                                break 'events;
                            }
                            thread::sleep(DELIVERY_RETRY);
                        },
                    }
                }
            }
        }

        if closed {
            self.consumers.lock().retain(|c| !c.is_closed());
        }
    }

    fn connection_lost(&self, generation: u64, err: &io::Error) {
        let mut connection = self.connection.lock();
        if connection.as_ref().map(|c| c.generation) != Some(generation) {
            return;
        }
        // dropping the writer closes the port
        connection.take();
        drop(connection);

        *self.state.lock() = LinkState::Disconnected;

        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::TimedOut => {
                info!(reason = %err, "Serial connection lost")
            },
            _ => warn!(error = %err, "Failed to read line, serial connection lost"),
        }
        let _ = self.status_tx.send(LinkStatus::Lost);
    }
}

async fn close_connection(mut connection: Connection) {
    connection.stop.store(true, Ordering::Release);
    let reader = connection.reader.take();
    drop(connection);

    if let Some(reader) = reader {
        match tokio::task::spawn_blocking(move || reader.join()).await {
            Ok(Ok(())) => debug!("Serial connection closed"),
            _ => warn!("Serial reader did not shut down cleanly"),
        }
    }
}

/// Sleep in poll-sized steps; false if stopped meanwhile
fn pause_unless_stopped(total: Duration, step: Duration, stop: &AtomicBool) -> bool {
    let mut waited = Duration::ZERO;
    while waited < total {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let chunk = step.min(total - waited);
        thread::sleep(chunk);
        waited += chunk;
    }
    !stop.load(Ordering::Acquire)
}

/// Newline splitter over a timed-out serial stream
struct LineReader {
    stream: Box<dyn SerialStream>,
    buf: Vec<u8>,
    idle: Duration,
    poll: Duration,
    silence_timeout: Duration,
}

impl LineReader {
    fn new(stream: Box<dyn SerialStream>, poll: Duration, silence_timeout: Duration) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(64),
            idle: Duration::ZERO,
            poll,
            silence_timeout,
        }
    }

    /// Next complete line including its terminator, `None` once stopped
    fn next_line(&mut self, stop: &AtomicBool) -> io::Result<Option<String>> {
        let mut chunk = [0u8; 256];

        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            if stop.load(Ordering::Acquire) {
                return Ok(None);
            }

            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial stream closed",
                    ))
                },
                Ok(n) => {
                    self.idle = Duration::ZERO;
                    self.buf.extend_from_slice(&chunk[..n]);
                    if self.buf.len() > MAX_LINE_LEN && !self.buf.contains(&b'\n') {
                        trace!(bytes = self.buf.len(), "Discarding unterminated input");
                        self.buf.clear();
                    }
                },
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                    self.idle += self.poll;
                    if self.idle >= self.silence_timeout {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("no data for {:?}", self.silence_timeout),
                        ));
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e),
            }
        }
    }
}
