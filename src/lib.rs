//! BMW N54 MSD80/MSD81 ECU diagnostic and flashing core
//!
//! Layered protocol stack for talking to the N54-family DME over CAN:
//! frame I/O, ISO-TP segmentation, a UDS client with session recovery and
//! security access, image validation with BMW CRC zones, and the flash
//! orchestrator with its safety gates. A minimal K-Line client covers
//! ECUs that are not reachable over D-CAN.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod can;
pub mod checksum;
pub mod constants;
pub mod dtc;
pub mod error;
pub mod flasher;
pub mod isotp;
pub mod kline;
pub mod security;
pub mod session;
pub mod uds;
pub mod validators;

#[cfg(test)]
pub(crate) mod testing;


pub use can::{open_bus, CanBus, CanFrame};
pub use constants::EcuVariant;
pub use error::{FlashError, Result};
pub use flasher::{
    CanFlasher, CounterResetMode, FlashLog, FlashPhase, FlashSettings, WriteResult,
};
pub use session::{Adapter, SessionManager};
pub use uds::{DiagnosticSession, UdsClient};

/// Cooperative cancellation token for long operations. Clones share state;
/// cancelling any clone stops the operation at its next checkpoint
/// (before each chunk, before each keep-alive tick, on recv wakeups).
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Error out if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FlashError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep that wakes early on cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let slice = Duration::from_millis(20);
        let mut remaining = duration;
        while !remaining.is_zero() {
            self.check()?;
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining -= step;
        }
        self.check()
    }
}
