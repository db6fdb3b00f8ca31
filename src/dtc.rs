//! Diagnostic Trouble Code (DTC) parsing
//!
//! Transport-independent parsing of DTC response bytes into structured
//! records, shared by the UDS (CAN) and KWP (K-Line) clients.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Full status byte breakdown (ISO 14229 DTC status mask).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtcStatus {
    pub test_failed: bool,
    pub test_failed_this_cycle: bool,
    pub pending: bool,
    pub confirmed: bool,
    pub test_not_completed_since_clear: bool,
    pub test_failed_since_clear: bool,
    pub test_not_completed_this_cycle: bool,
    pub warning_indicator_requested: bool,
    pub raw: u8,
}

impl DtcStatus {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            test_failed: (byte & 0x01) != 0,
            test_failed_this_cycle: (byte & 0x02) != 0,
            pending: (byte & 0x04) != 0,
            confirmed: (byte & 0x08) != 0,
            test_not_completed_since_clear: (byte & 0x10) != 0,
            test_failed_since_clear: (byte & 0x20) != 0,
            test_not_completed_this_cycle: (byte & 0x40) != 0,
            warning_indicator_requested: (byte & 0x80) != 0,
            raw: byte,
        }
    }
}

/// One decoded trouble code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dtc {
    /// Standard format code, e.g. "P0300".
    pub code: String,
    /// Raw status byte.
    pub status: u8,
    pub pending: bool,
    pub confirmed: bool,
    pub active: bool,
    pub description: String,
    pub severity: String,
}

/// Description/severity for a known code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtcInfo {
    pub description: String,
    pub severity: String,
}

/// External lookup table for code descriptions. The core ships no static
/// registry; callers supply one or accept the "Unknown DTC" fallback.
pub trait DtcDatabase {
    fn lookup(&self, code: &str) -> Option<DtcInfo>;
}

/// Derive the standard code string from the two DTC bytes.
///
/// The top two bits of the high byte select the letter (P/C/B/U); the
/// remaining 14 bits are the number. Certain U-codes are reported with a
/// 0x1000 offset by older DMEs and are normalized back.
pub fn code_from_bytes(high: u8, low: u8) -> String {
    let prefix = match (high >> 6) & 0x03 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    let mut number = (((high & 0x3F) as u16) << 8) | low as u16;
    if prefix == 'U' && (0x1000..0x2000).contains(&number) {
        number -= 0x1000;
    }
    format!("{prefix}{number:04X}")
}

/// Parse a DTC response into structured records.
///
/// If `positive_header` is provided, the first byte must match it and the
/// first two bytes (header + subfunction) are skipped. The rest is parsed
/// as (high, low, status) triplets; a trailing partial triplet is ignored.
pub fn parse_dtc_response(
    data: &[u8],
    positive_header: Option<u8>,
    db: Option<&dyn DtcDatabase>,
) -> Vec<Dtc> {
    let mut dtcs = Vec::new();
    if data.len() < 3 {
        return dtcs;
    }

    let mut offset = 0;
    if let Some(header) = positive_header {
        if data[0] != header {
            warn!("invalid DTC response header: 0x{:02X}", data[0]);
            return dtcs;
        }
        offset = 2;
    }

    while offset + 3 <= data.len() {
        let high = data[offset];
        let low = data[offset + 1];
        let status = data[offset + 2];
        offset += 3;

        let code = code_from_bytes(high, low);
        let info = db.and_then(|db| db.lookup(&code));
        let (description, severity) = match info {
            Some(info) => (info.description, info.severity),
            None => ("Unknown DTC".to_string(), "Unknown".to_string()),
        };

        let confirmed = status & 0x08 != 0;
        dtcs.push(Dtc {
            code,
            status,
            pending: status & 0x01 != 0,
            confirmed,
            active: status & 0x80 != 0 || confirmed,
            description,
            severity,
        });
    }

    dtcs
}
