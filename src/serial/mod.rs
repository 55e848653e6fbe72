//! # Serial Communication Module
//!
//! Owns the connection to one radio receiver.
//!
//! This module handles:
//! - Opening the radio's serial port
//! - Framing incoming bytes into newline-delimited messages
//! - Queueing out-of-band configuration commands without blocking callers
//! - Reopening the port after a fixed delay when it closes or errors
//!
//! A radio cycles `Closed -> Opening -> Open -> Closed -> Opening ...` for as
//! long as the process runs. Callers learn about transitions through
//! [`RadioEvent`]s, never through return values.

pub mod port_trait;

pub use port_trait::{PortConnector, SerialIo, TokioSerialConnector};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{RadioConfig, SerialConfig};
use crate::error::{Result, StationError};

/// Default radio baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default delay before a closed radio is reopened
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(15);

/// Radios expect CRLF after every command
const COMMAND_TERMINATOR: &str = "\r\n";

/// Commands a radio holds while its port is closed
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Connection state of a radio channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
}

/// One line of text received from a radio
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Channel number the line arrived on
    pub channel: u8,
    /// Line contents without the line terminator
    pub line: String,
    /// Wall clock at receipt
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    /// Tag a line with its channel and the current time
    pub fn now(channel: u8, line: impl Into<String>) -> Self {
        Self {
            channel,
            line: line.into(),
            received_at: Utc::now(),
        }
    }
}

/// Events emitted by a radio channel
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// Port opened
    Opened { channel: u8, path: String },
    /// Port closed by the device or by an I/O error
    Closed { channel: u8, path: String, reason: String },
    /// Port could not be opened
    OpenFailed { channel: u8, path: String, error: String },
    /// Structured (JSON) line
    Message(RawMessage),
    /// Line that is not structured; kept for field diagnosis
    Raw(RawMessage),
}

/// Settings for one radio channel
#[derive(Debug, Clone)]
pub struct RadioOptions {
    pub channel: u8,
    pub path: String,
    pub baud_rate: u32,
    pub restart_delay: Duration,
    pub restart_on_close: bool,
    /// Delay before the first open attempt
    pub start_delay: Duration,
}

impl RadioOptions {
    /// Build options from radio and serial configuration sections
    pub fn from_config(radio: &RadioConfig, serial: &SerialConfig) -> Self {
        Self {
            channel: radio.channel,
            path: radio.path.clone(),
            baud_rate: radio.baud_rate,
            restart_delay: serial.restart_delay(),
            restart_on_close: serial.restart_on_close,
            start_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct ChannelStatus {
    state: ConnectionState,
    last_opened: Option<DateTime<Utc>>,
}

/// Handle to a running radio channel
///
/// Dropping the handle stops the channel task.
pub struct RadioChannel {
    channel: u8,
    path: String,
    status: Arc<Mutex<ChannelStatus>>,
    commands: mpsc::Sender<String>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for RadioChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioChannel")
            .field("channel", &self.channel)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RadioChannel {
    /// Start a radio channel
    ///
    /// Spawns the connection task on the current Tokio runtime. The task
    /// opens the port after `start_delay` and keeps it open, sending every
    /// transition and received line to `events`. The event receiver is the
    /// channel's message stream; it stays live across reconnects.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use std::time::Duration;
    /// use station_core::serial::{RadioChannel, RadioOptions, TokioSerialConnector};
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    ///     let options = RadioOptions {
    ///         channel: 1,
    ///         path: "/dev/ttyACM0".to_string(),
    ///         baud_rate: 115_200,
    ///         restart_delay: Duration::from_secs(15),
    ///         restart_on_close: true,
    ///         start_delay: Duration::ZERO,
    ///     };
    ///     let radio = RadioChannel::open(options, Arc::new(TokioSerialConnector), tx);
    ///     radio.write("preset:fsktag").unwrap();
    ///     while let Some(event) = rx.recv().await {
    ///         println!("{:?}", event);
    ///     }
    /// }
    /// ```
    pub fn open(
        options: RadioOptions,
        connector: Arc<dyn PortConnector>,
        events: mpsc::UnboundedSender<RadioEvent>,
    ) -> Self {
        let status = Arc::new(Mutex::new(ChannelStatus {
            state: ConnectionState::Closed,
            last_opened: None,
        }));
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let channel = options.channel;
        let path = options.path.clone();
        let task = tokio::spawn(
            ChannelTask {
                options,
                connector,
                events,
                commands: command_rx,
                unsent: None,
                shutdown: shutdown_rx,
                status: status.clone(),
            }
            .run(),
        );

        Self {
            channel,
            path,
            status,
            commands,
            shutdown,
            task,
        }
    }

    /// Queue a command for the radio
    ///
    /// Never blocks. Commands queued while the port is closed are written
    /// once it reopens, up to [`COMMAND_QUEUE_CAPACITY`] of them.
    ///
    /// # Errors
    ///
    /// Returns `Serial` if the queue is full or the channel task has stopped.
    pub fn write(&self, command: &str) -> Result<()> {
        let command = command.trim();
        debug!("Queueing command for radio {}: {}", self.channel, command);
        self.commands.try_send(command.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                StationError::Serial(format!("radio {} command queue is full", self.channel))
            }
            mpsc::error::TrySendError::Closed(_) => {
                StationError::Serial(format!("radio {} is not running", self.channel))
            }
        })
    }

    /// Stop the channel and wait for its task to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    /// Channel number (1-5)
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Serial device path
    pub fn device_path(&self) -> &str {
        &self.path
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.status.lock().map(|s| s.state).unwrap_or(ConnectionState::Closed)
    }

    /// When the port was last opened
    pub fn last_opened(&self) -> Option<DateTime<Utc>> {
        self.status.lock().ok().and_then(|s| s.last_opened)
    }
}

/// How a session with an open port ended
enum SessionEnd {
    Closed(String),
    Shutdown,
}

struct ChannelTask {
    options: RadioOptions,
    connector: Arc<dyn PortConnector>,
    events: mpsc::UnboundedSender<RadioEvent>,
    commands: mpsc::Receiver<String>,
    /// Taken from the queue but not yet fully written
    unsent: Option<String>,
    shutdown: watch::Receiver<bool>,
    status: Arc<Mutex<ChannelStatus>>,
}

impl ChannelTask {
    async fn run(mut self) {
        let channel = self.options.channel;
        let path = self.options.path.clone();

        if !self.options.start_delay.is_zero() && self.wait(self.options.start_delay).await {
            return;
        }

        loop {
            self.set_state(ConnectionState::Opening);
            debug!("Opening radio {} at {}", channel, path);

            match self.connector.connect(&path, self.options.baud_rate).await {
                Ok(port) => {
                    if let Ok(mut status) = self.status.lock() {
                        status.state = ConnectionState::Open;
                        status.last_opened = Some(Utc::now());
                    }
                    info!("Opened radio {} on port {}", channel, path);
                    self.emit(RadioEvent::Opened { channel, path: path.clone() });

                    let end = self.session(port).await;
                    self.set_state(ConnectionState::Closed);

                    match end {
                        SessionEnd::Shutdown => {
                            info!("Radio {} stopped", channel);
                            return;
                        }
                        SessionEnd::Closed(reason) => {
                            warn!("Radio {} on port {} closed: {}", channel, path, reason);
                            self.emit(RadioEvent::Closed {
                                channel,
                                path: path.clone(),
                                reason,
                            });
                        }
                    }
                }
                Err(e) => {
                    self.set_state(ConnectionState::Closed);
                    warn!("Failed to open radio {}: {}", channel, e);
                    self.emit(RadioEvent::OpenFailed {
                        channel,
                        path: path.clone(),
                        error: e.to_string(),
                    });
                }
            }

            if !self.options.restart_on_close {
                debug!("Radio {} not restarting", channel);
                return;
            }
            if self.wait(self.options.restart_delay).await {
                return;
            }
        }
    }

    /// Sleep for `delay`; returns true if shutdown was requested meanwhile
    async fn wait(&mut self, delay: Duration) -> bool {
        if *self.shutdown.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown.changed() => true,
        }
    }

    async fn session(&mut self, port: Box<dyn SerialIo>) -> SessionEnd {
        let (reader, writer) = tokio::io::split(port);
        let channel = self.options.channel;

        tokio::select! {
            reason = read_lines(channel, reader, &self.events) => SessionEnd::Closed(reason),
            reason = write_commands(channel, writer, &mut self.commands, &mut self.unsent) => SessionEnd::Closed(reason),
            _ = self.shutdown.changed() => SessionEnd::Shutdown,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut status) = self.status.lock() {
            status.state = state;
        }
    }

    fn emit(&self, event: RadioEvent) {
        // Nobody listening is not an error for the radio
        let _ = self.events.send(event);
    }
}

/// Frame the port's byte stream into lines until it ends or errors
async fn read_lines(
    channel: u8,
    reader: ReadHalf<Box<dyn SerialIo>>,
    events: &mpsc::UnboundedSender<RadioEvent>,
) -> String {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return "device closed the port".to_string(),
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim();
                if line.is_empty() {
                    continue;
                }
                let message = RawMessage::now(channel, line);
                let event = if is_structured(line) {
                    RadioEvent::Message(message)
                } else {
                    debug!("Radio {} unstructured line: {}", channel, line);
                    RadioEvent::Raw(message)
                };
                let _ = events.send(event);
            }
            Err(e) => return format!("read error: {}", e),
        }
    }
}

/// Drain the command queue onto the port; only returns on a write error
///
/// The command being written stays in `unsent` until the write and flush
/// succeed, so a failed or interrupted write is retried on the next session.
async fn write_commands(
    channel: u8,
    mut writer: WriteHalf<Box<dyn SerialIo>>,
    commands: &mut mpsc::Receiver<String>,
    unsent: &mut Option<String>,
) -> String {
    loop {
        if unsent.is_none() {
            match commands.recv().await {
                Some(command) => *unsent = Some(command),
                // Handle dropped; reads continue until shutdown
                None => return std::future::pending().await,
            }
        }
        let Some(command) = unsent.clone() else {
            continue;
        };

        info!("Writing to radio {}: {}", channel, command);
        let framed = format!("{}{}", command, COMMAND_TERMINATOR);
        if let Err(e) = writer.write_all(framed.as_bytes()).await {
            return format!("error writing '{}': {}", command, e);
        }
        if let Err(e) = writer.flush().await {
            return format!("error flushing '{}': {}", command, e);
        }
        *unsent = None;
    }
}

/// Lines that parse as JSON are structured radio output
fn is_structured(line: &str) -> bool {
    serde_json::from_str::<serde::de::IgnoredAny>(line).is_ok()
}
