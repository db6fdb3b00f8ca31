//! Security access seed-to-key algorithms
//!
//! Registry of the known MSD80/MSD81 seed-to-key variants, tried in a
//! fixed order against a fixed list of security levels. Seeds and keys
//! are masked in logs unless explicitly revealed.

use tracing::warn;

use crate::error::{FlashError, Result};

/// Security levels tried during unlock, in order. 0x11 is the
/// programming level required for flash operations.
pub const SECURITY_LEVELS: [u8; 3] = [0x01, 0x03, 0x11];

/// Seed-to-key algorithm variants, in the order they are tried. The
/// standard algorithm is the field-proven one and goes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// XOR 0x5A3C then ADD 0x7F1B on a 2-byte seed.
    Standard,
    /// XOR with 'MH' constant plus cross-XOR, 4-byte seed.
    V1,
    /// Byte-pair swap then XOR with repeating 'MH', 4-byte seed.
    V2,
    /// XOR with repeating 'BM', 4-byte seed.
    V3,
}

/// Fixed selection order for the unlock sequence.
pub const ALGORITHM_ORDER: [Algorithm; 4] = [
    Algorithm::Standard,
    Algorithm::V1,
    Algorithm::V2,
    Algorithm::V3,
];

impl Algorithm {
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Standard => "standard",
            Algorithm::V1 => "v1",
            Algorithm::V2 => "v2",
            Algorithm::V3 => "v3",
        }
    }

    /// Look an algorithm up by its registry name.
    pub fn by_name(name: &str) -> Option<Self> {
        ALGORITHM_ORDER.into_iter().find(|a| a.name() == name)
    }

    /// Compute the key for a seed. Fails when the seed length does not
    /// fit the algorithm, in which case the unlock sequence moves on.
    pub fn compute_key(self, seed: &[u8]) -> Result<Vec<u8>> {
        match self {
            Algorithm::Standard => compute_standard(seed),
            Algorithm::V1 => compute_v1(seed),
            Algorithm::V2 => compute_v2(seed),
            Algorithm::V3 => compute_v3(seed),
        }
    }
}

/// key = ((seed ^ 0x5A3C) + 0x7F1B) & 0xFFFF, big-endian in and out.
fn compute_standard(seed: &[u8]) -> Result<Vec<u8>> {
    let seed_int = match seed.len() {
        2 => u16::from_be_bytes([seed[0], seed[1]]),
        4 => {
            // MSD80/MSD81 only use the first two bytes of a 4-byte seed.
            warn!("standard algorithm got a 4-byte seed, using the first 2 bytes");
            u16::from_be_bytes([seed[0], seed[1]])
        }
        n => {
            return Err(FlashError::PreconditionFailed(format!(
                "standard algorithm expects a 2- or 4-byte seed, got {n}"
            )))
        }
    };
    let key = (seed_int ^ 0x5A3C).wrapping_add(0x7F1B);
    Ok(key.to_be_bytes().to_vec())
}

fn require_four_bytes(seed: &[u8], algo: &str) -> Result<()> {
    if seed.len() != 4 {
        return Err(FlashError::PreconditionFailed(format!(
            "{algo} algorithm expects a 4-byte seed, got {}",
            seed.len()
        )));
    }
    Ok(())
}

fn compute_v1(seed: &[u8]) -> Result<Vec<u8>> {
    require_four_bytes(seed, "v1")?;
    Ok(vec![
        seed[0] ^ 0x48,
        seed[1] ^ 0x4D,
        seed[2] ^ seed[0],
        seed[3] ^ seed[1],
    ])
}

fn compute_v2(seed: &[u8]) -> Result<Vec<u8>> {
    require_four_bytes(seed, "v2")?;
    let rotated = [seed[1], seed[0], seed[3], seed[2]];
    Ok(vec![
        rotated[0] ^ 0x4D,
        rotated[1] ^ 0x48,
        rotated[2] ^ 0x4D,
        rotated[3] ^ 0x48,
    ])
}

fn compute_v3(seed: &[u8]) -> Result<Vec<u8>> {
    require_four_bytes(seed, "v3")?;
    Ok(vec![
        seed[0] ^ 0x42,
        seed[1] ^ 0x4D,
        seed[2] ^ 0x42,
        seed[3] ^ 0x4D,
    ])
}

// ============================================================================
// SECRET MASKING
// ============================================================================

/// Mask a seed or key for logging: first byte visible, remainder starred.
pub fn mask_secret(data: &[u8]) -> String {
    match data.split_first() {
        Some((first, rest)) => format!("{first:02X}{}", "**".repeat(rest.len())),
        None => String::new(),
    }
}

/// Render a secret for logs, honoring the reveal opt-in.
pub fn format_secret(data: &[u8], reveal: bool) -> String {
    if reveal {
        data.iter().map(|b| format!("{b:02X}")).collect()
    } else {
        mask_secret(data)
    }
}
