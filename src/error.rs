//! Error types for CAN, ISO-TP, UDS and flash operations.
//!
//! Every failure surfaces as a [`FlashError`] with a stable kind and a
//! remediation hint. Errors are never swallowed: a write that cannot be
//! verified is a `ChecksumMismatch`, not a success.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FlashError>;

/// Structured error carrying kind, detail and remediation.
#[derive(Debug, Error)]
pub enum FlashError {
    /// CAN bus could not be opened. There is no stub fallback: operations
    /// fail closed when hardware is absent.
    #[error("failed to open CAN bus ({interface} {channel}): {detail}")]
    BusOpen {
        interface: String,
        channel: String,
        detail: String,
    },

    /// I/O error on an already-open bus.
    #[error("CAN bus I/O error: {0}")]
    BusIo(#[source] std::io::Error),

    /// ISO-TP transfer timed out (N_Bs or N_Cr expiry, or no response).
    #[error("ISO-TP timeout waiting for {0}")]
    IsoTpTimeout(&'static str),

    /// Receiver signaled Flow Control overflow; the transfer was aborted.
    #[error("ISO-TP receiver signaled buffer overflow")]
    IsoTpOverflow,

    /// No UDS response within the deadline after exhausting retries.
    #[error("UDS request 0x{service:02X} timed out")]
    UdsTimeout { service: u8 },

    /// ECU answered `7F <sid> <nrc>` with a non-recoverable NRC.
    #[error("negative response to service 0x{service:02X}: NRC 0x{nrc:02X} ({})", nrc_name(*nrc))]
    NegativeResponse { service: u8, nrc: u8 },

    /// Session-related NRCs persisted beyond the recovery budget.
    #[error("diagnostic session lost during service 0x{service:02X} (recovery exhausted)")]
    SessionLost { service: u8 },

    /// All security levels and algorithms were rejected.
    #[error("security access denied: all levels and algorithms failed")]
    SecurityAccessDenied,

    /// ECU rejected a computed key (NRC 0x35).
    #[error("security key rejected by ECU")]
    InvalidKey,

    /// CRC zone, trailing CRC-32, ECU-side routine, or read-back mismatch.
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// Requested write range overlaps a region that must never be modified.
    #[error("write of {len} bytes at 0x{address:06X} overlaps forbidden region {region}")]
    ForbiddenRegion {
        address: u32,
        len: usize,
        region: &'static str,
    },

    /// Input binary failed size / ROM-ID / integrity validation.
    #[error("binary validation failed: {}", .0.join("; "))]
    BinaryValidation(Vec<String>),

    /// A hard pre-flight gate failed.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Measured battery voltage below the hard 12.0 V floor.
    #[error("battery voltage too low: {voltage:.1} V (minimum 12.0 V)")]
    BatteryTooLow { voltage: f32 },

    /// Operation cancelled via the cancel token.
    #[error("operation cancelled")]
    Cancelled,

    /// Transfer-phase failure that is not a plain negative response.
    #[error("write failure: {0}")]
    WriteFailure(String),

    /// Transfer aborted mid-way; the target region is in an unknown state.
    #[error("partial write: {written} of {total} bytes transferred")]
    PartialWrite { written: usize, total: usize },
}

impl FlashError {
    /// Stable identifier for the error kind, independent of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            FlashError::BusOpen { .. } => "BusOpenError",
            FlashError::BusIo(_) => "BusIoError",
            FlashError::IsoTpTimeout(_) => "IsoTpTimeout",
            FlashError::IsoTpOverflow => "IsoTpOverflow",
            FlashError::UdsTimeout { .. } => "UdsTimeout",
            FlashError::NegativeResponse { .. } => "NegativeResponse",
            FlashError::SessionLost { .. } => "SessionLost",
            FlashError::SecurityAccessDenied => "SecurityAccessDenied",
            FlashError::InvalidKey => "InvalidKey",
            FlashError::ChecksumMismatch(_) => "ChecksumMismatch",
            FlashError::ForbiddenRegion { .. } => "ForbiddenRegion",
            FlashError::BinaryValidation(_) => "BinaryValidation",
            FlashError::PreconditionFailed(_) => "PreconditionFailed",
            FlashError::BatteryTooLow { .. } => "BatteryTooLow",
            FlashError::Cancelled => "Cancelled",
            FlashError::WriteFailure(_) => "WriteFailure",
            FlashError::PartialWrite { .. } => "PartialWrite",
        }
    }

    /// Remediation hint keyed to the error kind.
    pub fn remediation(&self) -> &'static str {
        match self {
            FlashError::BusOpen { .. } => {
                "Check that the CAN adapter is connected, drivers are installed, \
                 and the interface/channel names are correct"
            }
            FlashError::BusIo(_) => {
                "Check cabling and adapter state; reopen the bus before retrying"
            }
            FlashError::IsoTpTimeout(_) | FlashError::UdsTimeout { .. } => {
                "Verify the ECU is powered and on the bus; check TX/RX CAN ids; \
                 retry after a few seconds"
            }
            FlashError::IsoTpOverflow => {
                "The ECU cannot buffer a message this large; reduce the transfer size"
            }
            FlashError::NegativeResponse { nrc, .. } => nrc_remediation(*nrc),
            FlashError::SessionLost { .. } => {
                "Ensure TesterPresent is active and battery voltage is stable, \
                 then re-enter the programming session manually"
            }
            FlashError::SecurityAccessDenied => {
                "Verify the ECU variant matches the selected algorithms; wait 10 s \
                 between attempts and never brute force"
            }
            FlashError::InvalidKey => {
                "The seed-to-key algorithm does not match this ECU variant; \
                 try the remaining algorithms before concluding the ECU is locked"
            }
            FlashError::ChecksumMismatch(_) => {
                "Do NOT power cycle. Retry the flash with stable power and a \
                 binary whose CRC zones have been recalculated"
            }
            FlashError::ForbiddenRegion { .. } => {
                "This address range would brick the ECU; writes there are \
                 rejected client-side and no CAN traffic was sent"
            }
            FlashError::BinaryValidation(_) => {
                "Correct the reported binary errors (size, ROM-ID, content) \
                 before flashing"
            }
            FlashError::PreconditionFailed(_) => {
                "Resolve the reported precondition (session, voltage, ECU state) \
                 and retry"
            }
            FlashError::BatteryTooLow { .. } => {
                "Connect a battery charger and retry once voltage is above 12.5 V"
            }
            FlashError::Cancelled => {
                "Operation stopped at a safe point; the ECU may still be in \
                 programming mode. Consider a transfer exit followed by soft reset"
            }
            FlashError::WriteFailure(_) => {
                "Flash state is uncertain. Do not power cycle; verify ECU status \
                 with read operations before retrying"
            }
            FlashError::PartialWrite { .. } => {
                "The region is partially written. Do not power cycle; re-run the \
                 full write for this region with stable power"
            }
        }
    }
}

/// Short name for a UDS negative response code.
pub fn nrc_name(nrc: u8) -> &'static str {
    match nrc {
        0x10 => "general reject",
        0x11 => "service not supported",
        0x12 => "sub-function not supported",
        0x13 => "incorrect message length",
        0x14 => "response too long",
        0x21 => "busy - repeat request",
        0x22 => "conditions not correct",
        0x24 => "request sequence error",
        0x25 => "no response from subnet",
        0x26 => "failure prevents execution",
        0x31 => "request out of range",
        0x33 => "security access denied",
        0x35 => "invalid key",
        0x36 => "exceeded number of attempts",
        0x37 => "required time delay not expired",
        0x70 => "upload/download not accepted",
        0x71 => "transfer data suspended",
        0x72 => "general programming failure",
        0x73 => "wrong block sequence counter",
        0x78 => "response pending",
        0x7E => "sub-function not supported in active session",
        0x7F => "service not supported in active session",
        _ => "unknown NRC",
    }
}

/// Remediation hint for a UDS negative response code.
pub fn nrc_remediation(nrc: u8) -> &'static str {
    match nrc {
        0x11 | 0x7F => {
            "Enter the programming session (0x10 0x02) first; this service is \
             not available in the current session"
        }
        0x12 | 0x7E => {
            "This sub-function requires a different diagnostic session; enter \
             programming (0x10 0x02) or extended (0x10 0x03) and retry"
        }
        0x13 => "Check request payload length and field formatting (endianness, padding)",
        0x22 => {
            "Check programming preconditions: battery voltage, engine off, \
             security access granted, active diagnostic session"
        }
        0x24 => {
            "Operations out of order; follow session -> security -> download -> \
             transfer -> exit and check the previous step completed"
        }
        0x31 => {
            "Address or size exceeds ECU limits; keep transfers within the \
             writable region and at most 512 bytes per block"
        }
        0x33 => {
            "Wait 10 seconds before retrying security access; do NOT brute \
             force or the ECU will lock out"
        }
        0x35 => "Calculated key is wrong; try the remaining seed-to-key algorithms",
        0x36 => {
            "ECU locked out after repeated failures; wait at least 10 seconds, \
             cycle ignition, and do not retry in a loop"
        }
        0x37 => "Required delay not expired; wait ~10 seconds between security attempts",
        0x70 => "ECU rejected the transfer request; verify address, size and session state",
        0x71 => {
            "Transfer suspended by the ECU; keep TesterPresent alive, check \
             battery voltage, then retry or abort cleanly"
        }
        0x72 => {
            "STOP, do not retry. The ECU reported a programming failure; verify \
             ECU state with reads and consider bench recovery"
        }
        0x73 => "Block sequence mismatch; abort the transfer and restart it from the beginning",
        0x78 => "Not an error: the ECU is processing; wait for the final response",
        _ => "Consult ISO 14229 for this NRC before retrying",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        let err = FlashError::ForbiddenRegion {
            address: 0x054A90,
            len: 16,
            region: "WGDC checksum block",
        };
        assert_eq!(err.kind(), "ForbiddenRegion");

        let err = FlashError::NegativeResponse {
            service: 0x34,
            nrc: 0x31,
        };
        assert_eq!(err.kind(), "NegativeResponse");
    }

    #[test]
    fn test_nrc_remediation_keys() {
        assert!(nrc_remediation(0x33).contains("10 seconds"));
        assert!(nrc_remediation(0x72).starts_with("STOP"));
        assert!(nrc_remediation(0x78).contains("Not an error"));
    }

    #[test]
    fn test_display_includes_nrc_name() {
        let err = FlashError::NegativeResponse {
            service: 0x27,
            nrc: 0x35,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x27"));
        assert!(msg.contains("invalid key"));
    }
}
