//! # GSM Modem Driver
//!
//! Drives one physically attached GSM modem over an AT command channel and turns a
//! `(number, text)` pair into the command sequence the modem understands.
//!
//! ## Submission paths
//!
//! - **Text mode** (`AT+CMGF=1`): bodies that are plain ASCII, any length the modem accepts.
//! - **PDU mode, single part** (`AT+CMGF=0`): UCS2 bodies of at most 70 characters.
//! - **PDU mode, concatenated**: longer UCS2 bodies, split into 67-character segments that
//!   carry a concatenation header and are sent one round trip at a time, in index order.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use smsgate::config::DeviceConfig;
//! use smsgate::modem::{GsmModem, Modem, MessageReference, TransmitOutcome};
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut modem = GsmModem::new(&DeviceConfig::default(), Arc::new(MessageReference::new()));
//!     modem.connect()?;
//!     let response = modem.transmit("+15551234567", "hello from the gateway")?;
//!     println!("{:?}", TransmitOutcome::classify(&response));
//!     Ok(())
//! }
//! ```
//!
//! Other transports (network attached gateways, test doubles) plug in either as a
//! [`SerialLink`] under [`GsmModem`] or as their own [`Modem`] implementation.

pub mod link;
pub mod pdu;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use thiserror::Error;

use crate::config::DeviceConfig;
use crate::logutil::escape_log;

pub use link::SerialLink;
#[cfg(feature = "serial")]
pub use link::SerialPortLink;
pub use pdu::MessageReference;

/// End of message marker for `AT+CMGS` bodies (CTRL-Z).
pub const CTRL_Z: char = '\u{1A}';

/// Read attempts for a command whose final result code we wait for.
const FINAL_RESPONSE_ATTEMPTS: usize = 10;
const READ_CHUNK: usize = 256;

#[derive(Debug, Error)]
pub enum ModemError {
    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("modem {0} is not connected")]
    NotConnected(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial support not compiled in")]
    SerialUnavailable,

    /// Body needs more concatenated segments than the header can number.
    #[error("message of {chars} characters needs {segments} segments (max {max})", max = pdu::MAX_SEGMENTS)]
    TooManySegments { chars: usize, segments: usize },
}

/// How a transmit attempt ended, judged from the modem's raw response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitOutcome {
    /// Response carried `OK`.
    Sent,
    /// Response carried `ERROR`.
    DeviceError,
    /// Neither marker seen; the modem may still have taken the message.
    Indeterminate,
}

impl TransmitOutcome {
    pub fn classify(response: &str) -> Self {
        if response.contains("OK") {
            TransmitOutcome::Sent
        } else if response.contains("ERROR") {
            TransmitOutcome::DeviceError
        } else {
            TransmitOutcome::Indeterminate
        }
    }
}

/// True once `response` holds a final result code.
fn has_final_result(response: &str) -> bool {
    response.contains("OK\r\n") || response.contains("ERROR\r\n")
}

/// Capability set every transmitter exposes to the worker pool.
pub trait Modem: Send {
    fn device_id(&self) -> &str;

    /// Open the underlying connection. A failure keeps the modem out of the pool.
    fn connect(&mut self) -> Result<(), ModemError>;

    /// Write `command` and collect the reply. With `expect_final` the read loop keeps
    /// polling (bounded) until `OK`/`ERROR` arrives; otherwise a single read is made.
    fn send_command(&mut self, command: &str, expect_final: bool) -> Result<String, ModemError>;

    /// TP-MR source shared with every other modem in the process.
    fn message_reference(&self) -> &MessageReference;

    /// Submit one SMS, choosing text or PDU mode from the body. Returns the raw final
    /// response (the last segment's for concatenated messages).
    fn transmit(&mut self, number: &str, text: &str) -> Result<String, ModemError> {
        debug!(
            "{}: transmit to {} ({} chars): {}",
            self.device_id(),
            number,
            text.chars().count(),
            escape_log(text)
        );
        let number = number.trim_start_matches('+');
        if !pdu::needs_ucs2(text) {
            return send_text_mode(self, number, text);
        }
        if text.chars().count() > pdu::SINGLE_PART_CHARS {
            debug!("{}: long UCS2 body, splitting", self.device_id());
            return send_multipart(self, number, text);
        }
        let tpdu = pdu::build_single_part_pdu(number, text);
        submit_pdu(self, &tpdu)
    }
}

fn send_text_mode<M: Modem + ?Sized>(
    modem: &mut M,
    number: &str,
    text: &str,
) -> Result<String, ModemError> {
    modem.send_command("AT+CMGF=1\r", false)?;
    modem.send_command(&format!("AT+CMGS=\"{}\"\r", number), false)?;
    modem.send_command(&format!("{}{}", text, CTRL_Z), true)
}

fn submit_pdu<M: Modem + ?Sized>(modem: &mut M, tpdu: &str) -> Result<String, ModemError> {
    modem.send_command("AT+CMGF=0\r", false)?;
    modem.send_command(
        &format!("AT+CMGS={}\r", pdu::hex_length_in_bytes(tpdu)),
        false,
    )?;
    modem.send_command(&format!("{}{}", pdu::with_default_smsc(tpdu), CTRL_Z), true)
}

fn send_multipart<M: Modem + ?Sized>(
    modem: &mut M,
    number: &str,
    text: &str,
) -> Result<String, ModemError> {
    let concat_ref: u8 = rand::random();
    let pdus = pdu::build_multipart_pdus(number, text, concat_ref, modem.message_reference())
        .ok_or_else(|| ModemError::TooManySegments {
            chars: text.chars().count(),
            segments: pdu::segment_count(text),
        })?;
    let total = pdus.len();
    let mut status = String::new();
    for (i, tpdu) in pdus.iter().enumerate() {
        status = submit_pdu(modem, tpdu)?;
        debug!(
            "{}: segment {}/{} -> {}",
            modem.device_id(),
            i + 1,
            total,
            escape_log(status.trim())
        );
        if TransmitOutcome::classify(&status) == TransmitOutcome::DeviceError {
            // The handset cannot reassemble without this segment.
            break;
        }
    }
    Ok(status)
}

/// Hayes/AT modem behind a [`SerialLink`].
pub struct GsmModem {
    device_id: String,
    port: String,
    baud_rate: u32,
    read_timeout: Duration,
    link: Option<Box<dyn SerialLink>>,
    references: Arc<MessageReference>,
}

impl GsmModem {
    /// Unconnected modem for a configured device; call [`Modem::connect`] before use.
    pub fn new(config: &DeviceConfig, references: Arc<MessageReference>) -> Self {
        Self {
            device_id: config.device_id.clone(),
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            link: None,
            references,
        }
    }

    /// Modem over an already open link. `connect` is a no-op for it.
    pub fn with_link(
        device_id: impl Into<String>,
        link: Box<dyn SerialLink>,
        references: Arc<MessageReference>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            port: String::new(),
            baud_rate: 0,
            read_timeout: Duration::ZERO,
            link: Some(link),
            references,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }
}

impl Modem for GsmModem {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn connect(&mut self) -> Result<(), ModemError> {
        if self.is_connected() {
            return Ok(());
        }
        #[cfg(feature = "serial")]
        {
            let link = SerialPortLink::open(&self.port, self.baud_rate, self.read_timeout)
                .map_err(|e| ModemError::Open {
                    port: self.port.clone(),
                    reason: e.to_string(),
                })?;
            self.link = Some(Box::new(link));
            log::info!(
                "{}: connected on {} at {} baud",
                self.device_id,
                self.port,
                self.baud_rate
            );
            Ok(())
        }
        #[cfg(not(feature = "serial"))]
        {
            log::warn!("{}: serial support not compiled in", self.device_id);
            Err(ModemError::SerialUnavailable)
        }
    }

    fn send_command(&mut self, command: &str, expect_final: bool) -> Result<String, ModemError> {
        let device_id = &self.device_id;
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| ModemError::NotConnected(device_id.clone()))?;
        debug!("{}: >> {}", device_id, escape_log(command));
        link.clear_input()?;
        link.write_all(command.as_bytes())?;

        let attempts = if expect_final {
            FINAL_RESPONSE_ATTEMPTS
        } else {
            1
        };
        let mut received: Vec<u8> = Vec::new();
        let mut buf = [0u8; READ_CHUNK];
        for _ in 0..attempts {
            let n = link.read(&mut buf)?;
            if n == 0 {
                continue;
            }
            received.extend_from_slice(&buf[..n]);
            trace!("{}: rcvd {} bytes", device_id, n);
            if has_final_result(&String::from_utf8_lossy(&received)) {
                break;
            }
        }
        let response = String::from_utf8_lossy(&received).into_owned();
        debug!("{}: << {}", device_id, escape_log(&response));
        Ok(response)
    }

    fn message_reference(&self) -> &MessageReference {
        &self.references
    }
}

/// One unconnected [`GsmModem`] per configured device, all sharing one TP-MR counter.
pub fn modems_from_config(devices: &[DeviceConfig]) -> Vec<Box<dyn Modem>> {
    let references = Arc::new(MessageReference::new());
    devices
        .iter()
        .map(|device| Box::new(GsmModem::new(device, references.clone())) as Box<dyn Modem>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleet_shares_one_reference_counter() {
        let devices = vec![
            DeviceConfig::default(),
            DeviceConfig {
                device_id: "modem1".to_string(),
                port: "/dev/ttyUSB1".to_string(),
                ..DeviceConfig::default()
            },
        ];
        let fleet = modems_from_config(&devices);
        assert_eq!(fleet.len(), 2);
        assert_eq!(fleet[0].message_reference().next(), 1);
        assert_eq!(fleet[1].message_reference().next(), 2);
        assert_eq!(fleet[1].device_id(), "modem1");
    }

    #[test]
    fn classify_ok_error_and_garbage() {
        assert_eq!(TransmitOutcome::classify("\r\n+CMGS: 12\r\n\r\nOK\r\n"), TransmitOutcome::Sent);
        assert_eq!(TransmitOutcome::classify("ERROR\r\n"), TransmitOutcome::DeviceError);
        assert_eq!(TransmitOutcome::classify("+CMS ERROR: 500\r\n"), TransmitOutcome::DeviceError);
        assert_eq!(TransmitOutcome::classify(""), TransmitOutcome::Indeterminate);
        assert_eq!(TransmitOutcome::classify("> "), TransmitOutcome::Indeterminate);
    }

    #[test]
    fn final_result_needs_line_end() {
        assert!(has_final_result("\r\nOK\r\n"));
        assert!(has_final_result("ERROR\r\n"));
        assert!(!has_final_result("\r\nOK"));
        assert!(!has_final_result("> "));
    }

    #[test]
    fn unconnected_modem_refuses_commands() {
        let mut modem = GsmModem::new(&DeviceConfig::default(), Arc::new(MessageReference::new()));
        assert!(!modem.is_connected());
        let err = modem.send_command("AT\r", true).unwrap_err();
        assert!(matches!(err, ModemError::NotConnected(_)));
    }
}
