//! Serial device link.
//!
//! Line protocol, one request per line terminated by `\n`:
//!
//! ```text
//! > CMD 12;3,5;1        < 200
//!                       < 503 stage driver busy
//!                       < 400 target out of range
//! > STATUS              < 12;1;2811
//! ```
//!
//! Acknowledgements use HTTP-style codes: `2xx` accepted, `4xx` rejected (not
//! retried), `5xx` server failure (retried). Write errors and read timeouts are
//! reported as server failures as well, since the command may simply not have
//! arrived.

use super::{Command, DeviceLink, LinkError, Snapshot};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

#[cfg(feature = "instrument_serial")]
const LINE_TERMINATOR: &str = "\n";
#[cfg(feature = "instrument_serial")]
const RESPONSE_DELIMITER: char = '\n';

/// Serial link to the plate reader controller.
///
/// Wraps the serialport crate and runs the blocking I/O on Tokio's blocking
/// executor. Requests are serialized by the port mutex, so a command and a
/// status poll never interleave on the wire.
pub struct SerialLink {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,

    /// Reply timeout
    timeout: Duration,

    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialLink {
    /// Create an unopened link.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_secs(1),
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Set the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Port this link talks to.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Open the serial port.
    ///
    /// # Errors
    /// `ServerFailure` if the port cannot be opened, `FeatureDisabled` without
    /// the `instrument_serial` feature.
    pub fn connect(&mut self) -> Result<(), LinkError> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(Duration::from_millis(100)) // Internal read timeout
                .open()
                .map_err(|e| {
                    LinkError::ServerFailure(format!(
                        "Failed to open serial port '{}' at {} baud: {}",
                        self.port_name, self.baud_rate, e
                    ))
                })?;

            self.port = Some(Arc::new(Mutex::new(port)));
            debug!(
                "Serial port '{}' opened at {} baud",
                self.port_name, self.baud_rate
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(LinkError::FeatureDisabled("instrument_serial".to_string()))
        }
    }

    /// Close the serial port.
    pub fn disconnect(&mut self) {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!("Serial port '{}' closed", self.port_name);
            }
        }
    }

    /// Write one request line and read one reply line.
    async fn query(&self, request: &str) -> Result<String, LinkError> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port.as_ref().ok_or(LinkError::NotConnected)?.clone();
            let line = format!("{}{}", request, LINE_TERMINATOR);
            let request = request.to_string();
            let timeout = self.timeout;

            // Execute blocking serial I/O on dedicated thread
            tokio::task::spawn_blocking(move || -> Result<String, LinkError> {
                use std::io::{Read, Write};

                let mut port_guard = port.blocking_lock();

                port_guard
                    .write_all(line.as_bytes())
                    .and_then(|_| port_guard.flush())
                    .map_err(|e| LinkError::ServerFailure(format!("Serial write failed: {}", e)))?;

                debug!("Sent serial request: {}", request);

                let mut response = String::new();
                let mut buffer = [0u8; 1];
                let start = std::time::Instant::now();

                loop {
                    if start.elapsed() > timeout {
                        return Err(LinkError::ServerFailure(format!(
                            "Serial read timeout after {:?}",
                            timeout
                        )));
                    }

                    match port_guard.read(&mut buffer) {
                        Ok(1) => {
                            let ch = char::from(buffer[0]);
                            if ch == RESPONSE_DELIMITER {
                                break;
                            }
                            response.push(ch);
                        }
                        Ok(_) => {
                            return Err(LinkError::ServerFailure(
                                "Unexpected EOF from serial port".to_string(),
                            ));
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                            // Port timeout is shorter than our overall timeout
                            continue;
                        }
                        Err(e) => {
                            return Err(LinkError::ServerFailure(format!(
                                "Serial read error: {}",
                                e
                            )));
                        }
                    }
                }

                let response = response.trim().to_string();
                debug!("Received serial response: {}", response);
                Ok(response)
            })
            .await
            .map_err(|e| LinkError::ServerFailure(format!("Serial I/O task failed: {}", e)))?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = request;
            Err(LinkError::FeatureDisabled("instrument_serial".to_string()))
        }
    }
}

/// Interpret a command acknowledgement line.
fn parse_ack(line: &str) -> Result<(), LinkError> {
    let line = line.trim();
    let (code, reason) = line.split_once(' ').unwrap_or((line, ""));
    let code: u16 = code
        .parse()
        .map_err(|_| LinkError::Protocol(format!("Unexpected acknowledgement: '{}'", line)))?;
    let reason = if reason.is_empty() {
        format!("status {}", code)
    } else {
        reason.to_string()
    };

    match code {
        200..=299 => Ok(()),
        400..=499 => Err(LinkError::Rejected(reason)),
        500..=599 => Err(LinkError::ServerFailure(reason)),
        _ => Err(LinkError::Protocol(format!(
            "Unexpected acknowledgement: '{}'",
            line
        ))),
    }
}

#[async_trait]
impl DeviceLink for SerialLink {
    fn name(&self) -> &str {
        "serial"
    }

    async fn send_command(&self, command: &Command) -> Result<(), LinkError> {
        let reply = self.query(&format!("CMD {}", command.to_wire())).await?;
        parse_ack(&reply)
    }

    async fn poll_status(&self) -> Result<Snapshot, LinkError> {
        let reply = self.query("STATUS").await?;
        Snapshot::parse_wire(&reply)
    }
}
