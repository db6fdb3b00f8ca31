//! Minimal K-Line (ISO 14230 / KWP2000) client
//!
//! Kept small on purpose: message framing, response parsing and the few
//! requests the tool needs when an ECU is only reachable over K-Line.
//! The CAN/UDS path in [`crate::uds`] is the primary transport.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::dtc::{parse_dtc_response, Dtc, DtcDatabase};
use crate::error::{FlashError, Result};

/// Default tester address on K-Line.
pub const TESTER_ADDRESS: u8 = 0xF1;

/// DME/DDE K-Line address.
pub const DME_ADDRESS: u8 = 0x12;

/// KWP2000 request message.
///
/// Wire format: `FMT TGT SRC [LEN] DATA... CHK` where the format byte
/// carries the length for payloads up to 63 bytes and the checksum is the
/// sum of all preceding bytes.
#[derive(Debug, Clone)]
pub struct KwpMessage {
    pub source: u8,
    pub target: u8,
    pub data: Vec<u8>,
}

impl KwpMessage {
    pub fn new(source: u8, target: u8, data: Vec<u8>) -> Self {
        Self {
            source,
            target,
            data,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let len = self.data.len().min(255);
        let mut bytes = Vec::with_capacity(len + 5);

        if len <= 63 {
            bytes.push(0x80 | len as u8);
            bytes.push(self.target);
            bytes.push(self.source);
        } else {
            // Length in a separate byte
            bytes.push(0xC0);
            bytes.push(self.target);
            bytes.push(self.source);
            bytes.push(len as u8);
        }
        bytes.extend_from_slice(&self.data[..len]);

        let checksum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        bytes.push(checksum);
        bytes
    }
}

/// Parsed KWP2000 response.
#[derive(Debug, Clone)]
pub struct KwpResponse {
    pub source: u8,
    pub target: u8,
    pub service: u8,
    pub data: Vec<u8>,
}

impl KwpResponse {
    /// Parse a response, verifying framing and checksum. Returns `None`
    /// for anything malformed.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }

        let fmt = data[0];
        let target = data[1];
        let source = data[2];

        let (payload_len, payload_start) = if fmt >= 0xC0 {
            if data.len() < 5 {
                return None;
            }
            (data[3] as usize, 4)
        } else if fmt >= 0x80 {
            ((fmt & 0x3F) as usize, 3)
        } else {
            debug!("unsupported KWP format byte 0x{fmt:02X}");
            return None;
        };

        let total = payload_start + payload_len + 1;
        if data.len() < total || payload_len == 0 {
            return None;
        }

        let checksum = data[..total - 1]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b));
        if checksum != data[total - 1] {
            debug!(
                "KWP checksum mismatch: calculated 0x{checksum:02X}, received 0x{:02X}",
                data[total - 1]
            );
            return None;
        }

        let payload = &data[payload_start..payload_start + payload_len];
        Some(Self {
            source,
            target,
            service: payload[0],
            data: payload[1..].to_vec(),
        })
    }

    pub fn is_negative(&self) -> bool {
        self.service == 0x7F
    }

    pub fn nrc(&self) -> Option<u8> {
        if self.is_negative() {
            self.data.get(1).copied()
        } else {
            None
        }
    }
}

/// Minimal K-Line client over a serial port at 10400 baud.
pub struct KLineClient {
    port: Box<dyn serialport::SerialPort>,
    pub ecu_address: u8,
    pub tester_address: u8,
    /// Minimum time between end of a response and the next request.
    pub p3_min: Duration,
    last_exchange: Option<Instant>,
}

impl KLineClient {
    pub fn open(channel: &str, ecu_address: u8) -> Result<Self> {
        let port = serialport::new(channel, 10_400)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| FlashError::BusOpen {
                interface: "kline".to_string(),
                channel: channel.to_string(),
                detail: e.to_string(),
            })?;
        Ok(Self {
            port,
            ecu_address,
            tester_address: TESTER_ADDRESS,
            p3_min: Duration::from_millis(55),
            last_exchange: None,
        })
    }

    /// Send one request and read the response, honoring P3min and the
    /// half-duplex echo.
    pub fn send_request(&mut self, service: u8, data: &[u8]) -> Result<KwpResponse> {
        if let Some(last) = self.last_exchange {
            let elapsed = last.elapsed();
            if elapsed < self.p3_min {
                std::thread::sleep(self.p3_min - elapsed);
            }
        }

        let mut payload = vec![service];
        payload.extend_from_slice(data);
        let request = KwpMessage::new(self.tester_address, self.ecu_address, payload);
        let bytes = request.to_bytes();
        debug!("K-Line TX: {bytes:02X?}");

        self.port.write_all(&bytes).map_err(FlashError::BusIo)?;

        // K-Line is half-duplex: our own transmission echoes back first.
        let mut echo = vec![0u8; bytes.len()];
        if let Ok(n) = self.port.read(&mut echo) {
            if n > 0 && echo[..n] != bytes[..n.min(bytes.len())] {
                warn!("K-Line echo mismatch");
            }
        }

        let mut buf = [0u8; 260];
        let mut response = Vec::new();
        let deadline = Instant::now() + Duration::from_millis(500);
        let parsed = loop {
            match self.port.read(&mut buf) {
                Ok(n) if n > 0 => {
                    response.extend_from_slice(&buf[..n]);
                    if let Some(parsed) = KwpResponse::parse(&response) {
                        break Some(parsed);
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(FlashError::BusIo(e)),
            }
            if Instant::now() >= deadline {
                break None;
            }
        };
        self.last_exchange = Some(Instant::now());

        let response = parsed.ok_or(FlashError::UdsTimeout { service })?;
        debug!(
            "K-Line RX: service 0x{:02X} {:02X?}",
            response.service, response.data
        );
        if response.is_negative() {
            return Err(FlashError::NegativeResponse {
                service,
                nrc: response.nrc().unwrap_or(0),
            });
        }
        Ok(response)
    }

    /// TesterPresent (0x3E) keep-alive.
    pub fn tester_present(&mut self) -> Result<bool> {
        let response = self.send_request(0x3E, &[])?;
        Ok(response.service == 0x7E)
    }

    /// ClearDiagnosticInformation (KWP 0x14).
    pub fn clear_dtcs(&mut self) -> Result<bool> {
        let response = self.send_request(0x14, &[0xFF, 0x00])?;
        Ok(response.service == 0x54)
    }

    /// ReadDTCByStatus (KWP 0x18) with an all-set status mask, parsed
    /// into the same records the UDS path produces.
    pub fn read_dtcs(&mut self, db: Option<&dyn DtcDatabase>) -> Result<Vec<Dtc>> {
        let response = self.send_request(0x18, &[0x00, 0xFF])?;
        if response.service != 0x58 {
            return Err(FlashError::WriteFailure(format!(
                "unexpected response service 0x{:02X} to ReadDTCByStatus",
                response.service
            )));
        }
        // Response payload: [count] [triplets...]; rebuild the header so
        // the shared parser can skip header + count uniformly.
        let mut full = vec![0x58];
        full.extend_from_slice(&response.data);
        Ok(parse_dtc_response(&full, Some(0x58), db))
    }
}
