//! Centralized constants for BMW N54 ECU communication
//!
//! This module contains the CAN addressing, UDS protocol constants, timing
//! parameters and memory maps used throughout the crate.

use serde::{Deserialize, Serialize};

// ============================================================================
// CAN ADDRESSING
// ============================================================================

pub mod can {
    /// Tester -> ECU arbitration id (BMW diagnostic CAN)
    pub const ECU_TX_ID: u32 = 0x6F1;

    /// ECU -> Tester arbitration id (DME on D-CAN)
    pub const ECU_RX_ID: u32 = 0x6F9;

    /// Standard BMW PT-CAN bitrate (500 kbit/s)
    pub const BITRATE: u32 = 500_000;

    /// Classical CAN frames are padded to this length on transmit
    pub const FRAME_LEN: usize = 8;

    /// Padding byte for short frames
    pub const PADDING: u8 = 0x00;
}

// ============================================================================
// UDS SERVICES (ISO 14229)
// ============================================================================

pub mod uds {
    // Diagnostic and Communication Management
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0x14;
    pub const READ_DTC_INFO: u8 = 0x19;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    pub const TESTER_PRESENT: u8 = 0x3E;

    // Data Transmission
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const WRITE_MEMORY_BY_ADDRESS: u8 = 0x3D;

    // Input/Output Control
    pub const IO_CONTROL_BY_ID: u8 = 0x30;
    pub const ROUTINE_CONTROL: u8 = 0x31;

    // Upload/Download
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;

    // Response framing
    pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    /// Diagnostic session types (UDS 0x10)
    pub mod session {
        pub const DEFAULT: u8 = 0x01;
        pub const PROGRAMMING: u8 = 0x02;
        pub const EXTENDED: u8 = 0x03;

        /// BMW-specific programming session (0x80 | 0x05)
        pub const BMW_PROGRAMMING: u8 = 0x85;

        /// BMW extended diagnostic session
        pub const BMW_EXTENDED: u8 = 0x87;
    }

    /// ECU reset types (UDS 0x11)
    pub mod reset {
        pub const HARD: u8 = 0x01;
        pub const KEY_OFF_ON: u8 = 0x02;
        pub const SOFT: u8 = 0x03;
    }

    /// Routine control sub-functions (UDS 0x31)
    pub mod routine {
        pub const START: u8 = 0x01;
        pub const STOP: u8 = 0x02;
        pub const REQUEST_RESULTS: u8 = 0x03;
    }

    /// TesterPresent sub-functions (UDS 0x3E)
    pub mod tester_present {
        pub const RESPOND: u8 = 0x00;
        pub const SUPPRESS_RESPONSE: u8 = 0x80;
    }

    /// Negative response codes that matter to control flow
    pub mod nrc {
        pub const CONDITIONS_NOT_CORRECT: u8 = 0x22;
        pub const REQUEST_OUT_OF_RANGE: u8 = 0x31;
        pub const SECURITY_ACCESS_DENIED: u8 = 0x33;
        pub const INVALID_KEY: u8 = 0x35;
        pub const GENERAL_PROGRAMMING_FAILURE: u8 = 0x72;
        pub const RESPONSE_PENDING: u8 = 0x78;
        pub const SUB_FUNCTION_NOT_SUPPORTED_IN_ACTIVE_SESSION: u8 = 0x7E;
        pub const SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION: u8 = 0x7F;
    }
}

// ============================================================================
// DATA IDENTIFIERS
// ============================================================================

pub mod dids {
    /// Vehicle identification number (ASCII)
    pub const VIN: u16 = 0xF190;

    /// Battery voltage, big-endian u16 in 0.1 V units
    pub const BATTERY_VOLTAGE: u16 = 0xF405;
}

// ============================================================================
// ECU ROUTINES
// ============================================================================

/// Default routine ids; these vary by ECU variant and are overridable in
/// `FlashSettings`.
pub mod routines {
    /// Flash erase routine
    pub const ERASE: u16 = 0xFF00;

    /// Checksum verification / programming precondition routine
    pub const CHECKSUM: u16 = 0xFF01;
}

// ============================================================================
// TIMING (ISO 15765-2 / ISO 14229)
// ============================================================================

pub mod timing {
    use std::time::Duration;

    /// P2: single-transaction response timeout
    pub const P2: Duration = Duration::from_millis(150);

    /// P2*: long routine response timeout
    pub const P2_STAR: Duration = Duration::from_millis(2000);

    /// N_Bs: sender wait for Flow Control
    pub const N_BS: Duration = Duration::from_millis(1000);

    /// N_Cr: receiver wait for next Consecutive Frame
    pub const N_CR: Duration = Duration::from_millis(1000);

    /// TesterPresent keep-alive interval
    pub const TESTER_PRESENT_INTERVAL: Duration = Duration::from_millis(2000);

    /// Wait between consecutive 0x78 responsePending responses
    pub const RESPONSE_PENDING_WAIT: Duration = Duration::from_millis(2000);

    /// Default delay between consecutive frames when STmin is zero
    pub const CF_DELAY: Duration = Duration::from_millis(1);

    /// Maximum consecutive responsePending responses per request
    pub const MAX_PENDING_RETRIES: u32 = 10;

    /// Maximum session recovery attempts per transaction
    pub const MAX_SESSION_RECOVERIES: u32 = 3;
}

// ============================================================================
// MEMORY MAP
// ============================================================================

/// Supported ECU variants of the N54 family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcuVariant {
    Msd80,
    Msd81,
}

impl EcuVariant {
    pub fn name(self) -> &'static str {
        match self {
            EcuVariant::Msd80 => "MSD80",
            EcuVariant::Msd81 => "MSD81",
        }
    }

    /// Memory layout for this variant. MSD81 doubles the calibration region.
    pub fn memory_map(self) -> MemoryMap {
        match self {
            EcuVariant::Msd80 => MemoryMap {
                boot_start: 0x800000,
                boot_size: 0x10000,
                calibration_start: 0x810000,
                calibration_size: 0x40000,
                program_start: 0x850000,
                program_size: 0xB0000,
                nvram_start: 0x1F0000,
                nvram_size: 0x10000,
            },
            EcuVariant::Msd81 => MemoryMap {
                boot_start: 0x800000,
                boot_size: 0x10000,
                calibration_start: 0x810000,
                calibration_size: 0x80000,
                program_start: 0x890000,
                program_size: 0xB0000,
                nvram_start: 0x1F0000,
                nvram_size: 0x10000,
            },
        }
    }

    /// Full image size for this variant.
    pub fn full_image_size(self) -> usize {
        0x200000
    }
}

/// Flash layout of one ECU variant. Addresses are absolute ECU addresses;
/// the NVRAM region is addressed by its offset within the 2 MiB image.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMap {
    pub boot_start: u32,
    pub boot_size: u32,
    pub calibration_start: u32,
    pub calibration_size: u32,
    pub program_start: u32,
    pub program_size: u32,
    pub nvram_start: u32,
    pub nvram_size: u32,
}

// ============================================================================
// TRANSFER LIMITS
// ============================================================================

pub mod limits {
    /// Maximum TransferData block for MSD80/MSD81 (512 bytes)
    pub const MAX_TRANSFER_SIZE: usize = 0x200;

    /// Block size used for NVRAM region writes (2048 bytes)
    pub const NVRAM_BLOCK_SIZE: usize = 0x800;

    /// Battery voltage is re-checked every this many transferred blocks
    pub const BATTERY_CHECK_BLOCKS: usize = 20;

    /// Hard lower battery limit for any flash operation
    pub const BATTERY_MIN_VOLTS: f32 = 12.0;

    /// Below this the operation proceeds with a warning
    pub const BATTERY_WARN_VOLTS: f32 = 12.5;
}
