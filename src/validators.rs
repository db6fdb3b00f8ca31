//! Pre-flash validation
//!
//! Centralized safety checks that run before any CAN traffic: forbidden
//! region policy, data integrity, and binary size / ROM-ID validation.
//! A write that fails any of these must never reach the transport.

use tracing::{info, warn};

use crate::constants::EcuVariant;
use crate::error::{FlashError, Result};

// ============================================================================
// FORBIDDEN REGIONS
// ============================================================================

/// An address range whose modification will brick the ECU. Offsets are
/// absolute within the 2 MiB image.
#[derive(Debug, Clone, Copy)]
pub struct ForbiddenRegion {
    pub name: &'static str,
    pub start: u32,
    pub end: u32,
}

pub const FORBIDDEN_REGIONS: [ForbiddenRegion; 4] = [
    ForbiddenRegion {
        name: "boot code",
        start: 0x000000,
        end: 0x008000,
    },
    ForbiddenRegion {
        name: "WGDC checksum block",
        start: 0x054A90,
        end: 0x054B50,
    },
    ForbiddenRegion {
        name: "WGDC checksum block",
        start: 0x05AD20,
        end: 0x05AD80,
    },
    ForbiddenRegion {
        name: "flash counter/config",
        start: 0x1F0000,
        end: 0x200000,
    },
];

/// Ok iff `[addr, addr+len)` is disjoint from every forbidden region.
pub fn check_forbidden(addr: u32, len: usize) -> Result<()> {
    let end = addr as u64 + len as u64;
    for region in FORBIDDEN_REGIONS {
        if (addr as u64) < region.end as u64 && end > region.start as u64 {
            return Err(FlashError::ForbiddenRegion {
                address: addr,
                len,
                region: region.name,
            });
        }
    }
    Ok(())
}

// ============================================================================
// DATA INTEGRITY
// ============================================================================

/// Basic sanity checks on data about to be flashed: non-empty, 4-byte
/// aligned, not all-0x00 (corrupted), not all-0xFF (erased state).
pub fn check_data_integrity(data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Err(FlashError::BinaryValidation(vec!["data is empty".into()]));
    }
    if data.len() % 4 != 0 {
        return Err(FlashError::BinaryValidation(vec![format!(
            "data length {} is not 4-byte aligned",
            data.len()
        )]));
    }
    if data.iter().all(|&b| b == 0x00) {
        return Err(FlashError::BinaryValidation(vec![
            "data is all zeros (corrupted)".into(),
        ]));
    }
    if data.iter().all(|&b| b == 0xFF) {
        return Err(FlashError::BinaryValidation(vec![
            "data is all 0xFF (erased state)".into(),
        ]));
    }
    Ok(())
}

// ============================================================================
// BINARY VALIDATION
// ============================================================================

/// Offset of the ROM-ID ASCII signature in a full image.
pub const ROM_ID_OFFSET: usize = 0x8000;

/// Known ROM-ID signatures per ECU variant.
pub fn known_rom_ids(ecu: EcuVariant) -> &'static [&'static [u8; 5]] {
    match ecu {
        EcuVariant::Msd80 => &[b"I8A0S", b"I8A0P", b"I850S"],
        EcuVariant::Msd81 => &[b"I9A0S", b"I9A0P"],
    }
}

/// Valid binary sizes for an ECU variant: the full image plus the
/// calibration-only windows.
pub fn valid_binary_sizes(ecu: EcuVariant) -> Vec<usize> {
    vec![ecu.full_image_size(), 0x40000, 0x80000]
}

/// Validate a binary against the size whitelist and, for images of at
/// least 1 MiB, the ROM-ID signature at 0x8000. Returns all errors found.
pub fn validate_binary(data: &[u8], ecu: EcuVariant) -> (bool, Vec<String>) {
    let mut errors = Vec::new();

    if data.is_empty() {
        return (false, vec!["binary data is empty".into()]);
    }

    let sizes = valid_binary_sizes(ecu);
    if !sizes.contains(&data.len()) {
        let expected: Vec<String> = sizes.iter().map(|s| format!("0x{s:X}")).collect();
        errors.push(format!(
            "invalid binary size 0x{:X}; expected one of: {}",
            data.len(),
            expected.join(", ")
        ));
    }

    // Full images must carry a known ROM-ID; calibration windows have no
    // signature and are skipped.
    if data.len() >= 0x100000 {
        let matched = known_rom_ids(ecu).iter().find(|sig| {
            data.len() >= ROM_ID_OFFSET + sig.len()
                && &data[ROM_ID_OFFSET..ROM_ID_OFFSET + sig.len()] == sig.as_slice()
        });
        match matched {
            Some(sig) => {
                info!(
                    "ROM-ID validated: {} at offset 0x{ROM_ID_OFFSET:X}",
                    String::from_utf8_lossy(*sig)
                );
            }
            None => {
                errors.push(format!(
                    "ROM-ID validation failed for {}: no known signature at offset 0x{ROM_ID_OFFSET:X}",
                    ecu.name()
                ));
            }
        }
    } else {
        warn!(
            "cannot validate ROM-ID for partial binary ({} bytes); \
             ensure this is a valid {} calibration region",
            data.len(),
            ecu.name()
        );
    }

    (errors.is_empty(), errors)
}

/// NVRAM patches are 4096..=65536 bytes and must pass integrity checks.
pub fn validate_nvram_patch(data: &[u8]) -> (bool, Vec<String>) {
    let mut errors = Vec::new();
    if data.len() < 0x1000 || data.len() > 0x10000 {
        errors.push(format!(
            "invalid NVRAM patch size {} (expected 4096..=65536 bytes)",
            data.len()
        ));
    }
    if let Err(e) = check_data_integrity(data) {
        errors.push(e.to_string());
    }
    (errors.is_empty(), errors)
}
