//! Serial sniffer for debugging and development
//!
//! Prints every line the device sends, colour-coded by whether it passes the
//! line grammar, with the slider events it decodes to. Keep-alives are sent so
//! the device display stays on while sniffing.

use anyhow::{Context, Result};
use colored::*;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::link::{list_ports, PortOpener, PortSettings, SerialStream, SystemPorts};
use crate::protocol::{is_valid_line, DecoderOptions, DeviceMessage, LineDecoder, SliderCommand, SliderMoveEvent};

const READ_POLL: Duration = Duration::from_millis(100);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// One line seen on the wire
#[derive(Debug, Clone)]
pub struct SnifferEvent {
    pub timestamp_ms: u64,
    pub line: String,
    pub valid: bool,
    pub events: Vec<SliderMoveEvent>,
}

impl SnifferEvent {
    fn decode(timestamp_ms: u64, line: &str, decoder: &mut LineDecoder, options: &DecoderOptions) -> Self {
        let line = line.trim_end().to_string();
        Self {
            timestamp_ms,
            valid: is_valid_line(&line),
            events: decoder.decode(&line, options),
            line,
        }
    }
}

/// Print the available serial ports
pub fn list_ports_formatted() {
    println!("{}", "=== Serial Ports ===".bold().cyan());
    match list_ports() {
        Ok(ports) if ports.is_empty() => println!("  {}", "(none found)".dimmed()),
        Ok(ports) => {
            for (index, port) in ports.iter().enumerate() {
                println!("  [{}] {}", index, port.green());
            }
        },
        Err(e) => println!("  {}", format!("Failed to list ports: {}", e).red()),
    }
}

/// CLI serial sniffer
pub async fn run_cli_sniffer(settings: PortSettings, options: DecoderOptions) -> Result<()> {
    println!("{}", "=== Serial Sniffer ===".bold().cyan());
    println!("Port {} @ {} baud", settings.port.bright_white(), settings.baud_rate);
    println!("Press Ctrl+C to exit\n");

    let stream = SystemPorts
        .open(&settings, READ_POLL)
        .with_context(|| format!("Failed to open {}", settings.port))?;

    let (event_tx, mut event_rx) = mpsc::channel(1000);
    let running = Arc::new(AtomicBool::new(true));

    let reader_running = running.clone();
    let reader = thread::Builder::new()
        .name("deej-sniffer".to_string())
        .spawn(move || {
            if let Err(e) = sniff(stream, options, event_tx, reader_running) {
                eprintln!("{}", format!("Read error: {}", e).red());
            }
        })
        .context("Failed to spawn sniffer thread")?;

    println!("{}", "Format: [timestamp] LINE => EVENTS".dimmed());
    println!("{}\n", "─".repeat(80).dimmed());

    let ctrl_c_running = running.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl_c_running.store(false, Ordering::Relaxed);
    });

    while running.load(Ordering::Relaxed) {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(event) => println!("{}", format_event(&event)),
                None => break,
            },
            _ = tokio::time::sleep(READ_POLL) => {},
        }
    }

    running.store(false, Ordering::Relaxed);
    let _ = tokio::task::spawn_blocking(move || reader.join()).await;

    println!("\n{}", "Sniffer stopped".yellow());
    Ok(())
}

fn sniff(
    mut stream: Box<dyn SerialStream>,
    options: DecoderOptions,
    event_tx: mpsc::Sender<SnifferEvent>,
    running: Arc<AtomicBool>,
) -> io::Result<()> {
    let start = Instant::now();
    let mut writer = stream.try_clone_stream()?;
    let mut decoder = LineDecoder::new();
    let mut pending = Vec::new();
    let mut buf = [0u8; 256];
    let mut last_keep_alive: Option<Instant> = None;

    info!("Sniffer reading");

    while running.load(Ordering::Relaxed) {
        if last_keep_alive.map_or(true, |at| at.elapsed() >= KEEP_ALIVE_INTERVAL) {
            writer.write_all(DeviceMessage::KeepAlive.encode().as_bytes())?;
            last_keep_alive = Some(Instant::now());
        }

        let n = match stream.read(&mut buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "port closed")),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        pending.extend_from_slice(&buf[..n]);
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let event = SnifferEvent::decode(start.elapsed().as_millis() as u64, &line, &mut decoder, &options);
            if event_tx.blocking_send(event).is_err() {
                debug!("Sniffer output closed");
                return Ok(());
            }
        }
    }

    Ok(())
}

fn format_event(event: &SnifferEvent) -> String {
    let timestamp = format!("[{:08}]", event.timestamp_ms).dimmed();

    let line = if event.valid {
        event.line.bright_green()
    } else {
        event.line.bright_red()
    };

    let decoded = if !event.valid {
        " => invalid".red().to_string()
    } else if event.events.is_empty() {
        " => (no change)".dimmed().to_string()
    } else {
        let parts: Vec<String> = event.events.iter().map(describe).collect();
        format!(" => {}", parts.join(", ").bright_blue())
    };

    format!("{} {}{}", timestamp, line, decoded)
}

fn describe(event: &SliderMoveEvent) -> String {
    match event.command {
        SliderCommand::Set => format!("#{}={:.2}", event.slider, event.value),
        SliderCommand::Increment => format!("#{} +", event.slider),
        SliderCommand::Decrement => format!("#{} -", event.slider),
        SliderCommand::RequestNames => format!("#{} names?", event.slider),
    }
}
