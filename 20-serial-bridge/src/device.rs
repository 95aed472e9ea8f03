//! Serial device channel.
//!
//! Serial I/O is blocking, so the device side runs on two dedicated OS
//! threads: the reader pushes every chunk into the hub, the writer drains
//! the queue fed by session receive loops. Either side failing is fatal
//! for the bridge and is reported to the hub as a lost device.

use std::{
    io::{self, ErrorKind, Read, Write},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{config::DeviceConfig, hub::HubHandle};

/// Largest chunk read from the device in one call.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Poll interval handed to the serial driver when reads should block
/// until data arrives. Timeouts are retried, never surfaced.
const BLOCKING_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// An opened device, split into independent read and write handles.
pub struct DevicePort {
    name: String,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

/// Opens the serial port described by `config`.
pub fn open(config: &DeviceConfig) -> Result<DevicePort> {
    let poll_interval = if config.blocks_until_data() {
        BLOCKING_POLL_INTERVAL
    } else {
        config.read_timeout
    };

    let port = serialport::new(&config.path, config.baud_rate)
        .timeout(poll_interval)
        .open()
        .with_context(|| format!("failed to open serial device {}", config.path))?;
    let reader = port
        .try_clone()
        .with_context(|| format!("failed to clone serial handle for {}", config.path))?;

    info!(device = %config.path, baud = config.baud_rate, "serial device opened");
    Ok(DevicePort::new(
        config.path.clone(),
        Box::new(reader),
        Box::new(port),
    ))
}

impl DevicePort {
    /// Wraps any byte transport as a device. Used for serial ports and for
    /// in-memory stand-ins.
    pub fn new(
        name: impl Into<String>,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            name: name.into(),
            reader,
            writer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts the reader and writer threads. Called once per bridge.
    ///
    /// The threads are detached; they end by reporting a lost device to the
    /// hub or by finding the hub or the device queue gone.
    pub fn start(self, inbound: mpsc::Receiver<Bytes>, hub: HubHandle) -> io::Result<()> {
        let DevicePort {
            name,
            reader,
            writer,
        } = self;

        spawn_reader(name.clone(), reader, hub.clone())?;
        spawn_writer(name, writer, inbound, hub)?;
        Ok(())
    }
}

fn spawn_reader(
    name: String,
    reader: Box<dyn Read + Send>,
    hub: HubHandle,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("device-reader".into())
        .spawn(move || read_loop(&name, reader, &hub))
}

fn spawn_writer(
    name: String,
    writer: Box<dyn Write + Send>,
    inbound: mpsc::Receiver<Bytes>,
    hub: HubHandle,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("device-writer".into())
        .spawn(move || write_loop(&name, writer, inbound, &hub))
}

fn read_loop(name: &str, mut reader: Box<dyn Read + Send>, hub: &HubHandle) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    let reason = loop {
        match reader.read(&mut buffer) {
            Ok(0) => break "device reached end of stream".to_string(),
            Ok(length) => {
                debug!(device = name, bytes = length, "device -> hub");
                let chunk = Bytes::copy_from_slice(&buffer[..length]);
                if hub.blocking_broadcast(chunk).is_err() {
                    debug!(device = name, "hub stopped, device reader exiting");
                    return;
                }
            }
            Err(err) if is_transient(&err) => continue,
            Err(err) => break format!("read failed: {err}"),
        }
    };

    report_lost(name, hub, reason);
}

fn write_loop(
    name: &str,
    mut writer: Box<dyn Write + Send>,
    mut inbound: mpsc::Receiver<Bytes>,
    hub: &HubHandle,
) {
    while let Some(chunk) = inbound.blocking_recv() {
        if let Err(err) = write_chunk(writer.as_mut(), &chunk) {
            report_lost(name, hub, format!("write failed: {err}"));
            return;
        }
        debug!(device = name, bytes = chunk.len(), "session -> device");
    }
    debug!(device = name, "device queue closed, writer exiting");
}

/// `write_all` that rides out driver timeouts on slow links.
fn write_chunk(writer: &mut (dyn Write + Send), chunk: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < chunk.len() {
        match writer.write(&chunk[written..]) {
            Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
            Ok(count) => written += count,
            Err(err) if is_transient(&err) => continue,
            Err(err) => return Err(err),
        }
    }

    loop {
        match writer.flush() {
            Err(err) if is_transient(&err) => continue,
            other => return other,
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock
    )
}

fn report_lost(name: &str, hub: &HubHandle, reason: String) {
    warn!(device = name, %reason, "serial device failed");
    if hub.blocking_device_lost(reason).is_err() {
        debug!(device = name, "hub already stopped");
    }
}
