//! Flash orchestrator
//!
//! High-level read/write pipelines for calibration, NVRAM and full-binary
//! images. Every write runs through the same safety gates: binary
//! validation, data integrity, CRC zones, battery voltage, programming
//! session, security access, and a verified finish. A failed gate aborts
//! the whole operation before any transport traffic.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::can::open_bus;
use crate::checksum::{crc32_bmw, validate_trailer, validate_zones};
use crate::constants::{limits, routines, timing, uds, EcuVariant};
use crate::error::{FlashError, Result};
use crate::isotp::IsoTpTransport;
use crate::session::Adapter;
use crate::uds::UdsClient;
use crate::validators::{
    check_data_integrity, check_forbidden, validate_binary, validate_nvram_patch,
};
use crate::CancelToken;

/// NVRAM address of the flash counter.
const FLASH_COUNTER_ADDR: u32 = 0x1F0000;

/// NVRAM address of the flash counter backup copy.
const FLASH_COUNTER_BACKUP_ADDR: u32 = 0x1FF000;

/// Outcome of an atomic write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteResult {
    Success,
    Timeout,
    NegativeResponse(u8),
    ChecksumMismatch,
    SessionLost,
    SecurityDenied,
    PartialWrite,
    RollbackFailed,
}

impl WriteResult {
    fn from_error(err: &FlashError) -> Self {
        match err {
            FlashError::UdsTimeout { .. } | FlashError::IsoTpTimeout(_) => WriteResult::Timeout,
            FlashError::NegativeResponse { nrc, .. } => WriteResult::NegativeResponse(*nrc),
            FlashError::ChecksumMismatch(_) => WriteResult::ChecksumMismatch,
            FlashError::SessionLost { .. } => WriteResult::SessionLost,
            FlashError::SecurityAccessDenied | FlashError::InvalidKey => {
                WriteResult::SecurityDenied
            }
            // Cancelling or failing mid-transfer leaves the region
            // partially written.
            FlashError::PartialWrite { .. } | FlashError::Cancelled => WriteResult::PartialWrite,
            _ => WriteResult::Timeout,
        }
    }
}

/// One entry of the per-invocation flash operation log.
#[derive(Debug, Clone, Serialize)]
pub struct FlashOperation {
    pub address: u32,
    pub size: usize,
    pub planned_checksum: Option<u32>,
    pub actual_checksum: Option<u32>,
    pub status: WriteResult,
    pub retries: u32,
    pub started_at: DateTime<Utc>,
}

/// In-memory log of write operations, used for reporting only.
#[derive(Debug, Default, Serialize)]
pub struct FlashLog {
    pub operations: Vec<FlashOperation>,
}

/// Aggregate view of a [`FlashLog`].
#[derive(Debug, Serialize)]
pub struct FlashSummary {
    pub total_operations: usize,
    pub successful: usize,
    pub failed: usize,
    pub bytes_written: usize,
}

impl FlashLog {
    fn record(&mut self, op: FlashOperation) {
        self.operations.push(op);
    }

    pub fn summary(&self) -> FlashSummary {
        let successful = self
            .operations
            .iter()
            .filter(|op| op.status == WriteResult::Success)
            .count();
        FlashSummary {
            total_operations: self.operations.len(),
            successful,
            failed: self.operations.len() - successful,
            bytes_written: self
                .operations
                .iter()
                .filter(|op| op.status == WriteResult::Success)
                .map(|op| op.size)
                .sum(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Flash counter reset behavior, usually parsed from a settings string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterResetMode {
    Always,
    Never,
    Ask,
}

impl std::str::FromStr for CounterResetMode {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(CounterResetMode::Always),
            "false" | "0" | "no" => Ok(CounterResetMode::Never),
            "ask" => Ok(CounterResetMode::Ask),
            other => Err(FlashError::PreconditionFailed(format!(
                "invalid flash counter reset mode '{other}' (expected true/false/ask)"
            ))),
        }
    }
}

/// Orchestrator configuration. Routine ids vary by ECU variant and are
/// deliberately overridable.
#[derive(Debug, Clone)]
pub struct FlashSettings {
    pub ecu: EcuVariant,
    pub erase_routine: u16,
    pub checksum_routine: u16,
    pub counter_reset: CounterResetMode,
    /// Non-interactive answer for [`CounterResetMode::Ask`]; `None`
    /// skips the reset with a warning.
    pub counter_reset_confirm: Option<bool>,
    pub reveal_secrets: bool,
    pub tester_present_interval: Duration,
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            ecu: EcuVariant::Msd80,
            erase_routine: routines::ERASE,
            checksum_routine: routines::CHECKSUM,
            counter_reset: CounterResetMode::Never,
            counter_reset_confirm: None,
            reveal_secrets: false,
            tester_present_interval: timing::TESTER_PRESENT_INTERVAL,
        }
    }
}

/// Per-operation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    Idle,
    Validating,
    SessionEntry,
    Unlocking,
    Preconditions,
    Downloading,
    Transferring,
    Exiting,
    VerifyingChecksum,
    PostActions,
    Done,
    Failed,
}

/// Progress reporting wrapper around the caller's callback.
struct Progress<'a>(Option<&'a mut dyn FnMut(&str, u8)>);

impl Progress<'_> {
    fn report(&mut self, message: &str, percent: u8) {
        debug!("progress {percent}%: {message}");
        if let Some(cb) = self.0.as_mut() {
            cb(message, percent);
        }
    }
}

/// Background TesterPresent keep-alive. Sends `3E 80` on the shared
/// transport strictly between UDS transactions (the transport mutex
/// guarantees it never interleaves with an in-flight transfer).
struct KeepAlive {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl KeepAlive {
    fn start(
        transport: Arc<Mutex<IsoTpTransport>>,
        interval: Duration,
        cancel: CancelToken,
    ) -> Self {
        info!("starting background TesterPresent keep-alive");
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = std::thread::spawn(move || {
            let slice = Duration::from_millis(20);
            'outer: loop {
                let mut waited = Duration::ZERO;
                while waited < interval {
                    if stop_flag.load(Ordering::SeqCst) || cancel.is_cancelled() {
                        break 'outer;
                    }
                    let step = (interval - waited).min(slice);
                    std::thread::sleep(step);
                    waited += step;
                }
                if stop_flag.load(Ordering::SeqCst) || cancel.is_cancelled() {
                    break;
                }
                if let Ok(mut transport) = transport.lock() {
                    // Suppressed positive response; nothing to read back.
                    if let Err(e) = transport.send(&[
                        uds::TESTER_PRESENT,
                        uds::tester_present::SUPPRESS_RESPONSE,
                    ]) {
                        warn!("keep-alive send failed: {e}");
                    }
                }
            }
        });
        Self { stop, handle }
    }

    fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.handle.join();
        info!("stopped background TesterPresent keep-alive");
    }
}

/// Closes the shared bus; the handle registered with a [`SessionManager`].
pub struct BusAdapter(Arc<Mutex<IsoTpTransport>>);

impl Adapter for BusAdapter {
    fn close(&mut self) -> Result<()> {
        self.0.lock().unwrap().close()
    }
}

/// High-level ECU flasher over a UDS client.
pub struct CanFlasher {
    uds: UdsClient,
    pub settings: FlashSettings,
    cancel: CancelToken,
    log: FlashLog,
    phase: FlashPhase,
    keep_alive: Option<KeepAlive>,
    /// Last battery voltage read, for error reporting.
    battery_voltage: Option<f32>,
}

impl CanFlasher {
    pub fn new(mut uds: UdsClient, settings: FlashSettings) -> Self {
        uds.reveal_secrets = settings.reveal_secrets;
        let cancel = CancelToken::new();
        uds.set_cancel_token(cancel.clone());
        Self {
            uds,
            settings,
            cancel,
            log: FlashLog::default(),
            phase: FlashPhase::Idle,
            keep_alive: None,
            battery_voltage: None,
        }
    }

    /// Open a CAN bus and build the flasher on top of it. Fails closed if
    /// the hardware is absent.
    pub fn connect(
        interface: &str,
        channel: &str,
        bitrate: u32,
        settings: FlashSettings,
    ) -> Result<Self> {
        let bus = open_bus(interface, channel, bitrate)?;
        let uds = UdsClient::new(
            bus,
            crate::constants::can::ECU_TX_ID,
            crate::constants::can::ECU_RX_ID,
        );
        info!("flasher connected: {interface} {channel} @ {bitrate} bps ({})",
            settings.ecu.name());
        Ok(Self::new(uds, settings))
    }

    /// Token that cancels the running operation from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> FlashPhase {
        self.phase
    }

    pub fn log(&self) -> &FlashLog {
        &self.log
    }

    pub fn uds_mut(&mut self) -> &mut UdsClient {
        &mut self.uds
    }

    /// Most recent battery voltage reading, if any.
    pub fn last_battery_voltage(&self) -> Option<f32> {
        self.battery_voltage
    }

    /// Register the underlying bus with a session manager so scope exit
    /// closes it.
    pub fn register_with(&self, manager: &mut crate::session::SessionManager, name: &str) {
        manager.register(name, Box::new(BusAdapter(self.uds.transport())));
    }

    /// Stop the keep-alive and close the bus.
    pub fn close(&mut self) -> Result<()> {
        self.stop_keep_alive();
        self.uds.close()
    }

    fn set_phase(&mut self, phase: FlashPhase) {
        debug!("flash phase: {:?} -> {phase:?}", self.phase);
        self.phase = phase;
    }

    /// Whether the current operation got far enough that the ECU was
    /// asked to accept data. Failures before this never enter the
    /// operation log; nothing was attempted on the wire.
    fn write_was_attempted(&self) -> bool {
        matches!(
            self.phase,
            FlashPhase::Downloading
                | FlashPhase::Transferring
                | FlashPhase::Exiting
                | FlashPhase::VerifyingChecksum
                | FlashPhase::PostActions
        )
    }

    fn start_keep_alive(&mut self) {
        if self.keep_alive.is_none() {
            self.keep_alive = Some(KeepAlive::start(
                self.uds.transport(),
                self.settings.tester_present_interval,
                self.cancel.clone(),
            ));
        }
    }

    fn stop_keep_alive(&mut self) {
        if let Some(keep_alive) = self.keep_alive.take() {
            keep_alive.stop();
        }
    }

    /// Wrap a pipeline so every failure releases the keep-alive, lands in
    /// the `Failed` phase and reaches the progress callback as a terminal
    /// message with remediation.
    fn finish<T>(&mut self, progress: &mut Progress<'_>, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                self.stop_keep_alive();
                self.set_phase(FlashPhase::Failed);
                progress.report(&format!("FAILED: {err}. {}", err.remediation()), 100);
                Err(err)
            }
        }
    }

    // ========================================================================
    // SAFETY GATES
    // ========================================================================

    /// Battery voltage gate: below 12.0 V aborts, below 12.5 V warns. An
    /// unreadable DID is logged and does not block the operation.
    fn check_battery_voltage(&mut self) -> Result<()> {
        match self.uds.read_battery_voltage() {
            Ok(volts) => {
                self.battery_voltage = Some(volts);
                if volts < limits::BATTERY_MIN_VOLTS {
                    warn!("battery voltage too low: {volts:.1} V");
                    return Err(FlashError::BatteryTooLow { voltage: volts });
                }
                if volts < limits::BATTERY_WARN_VOLTS {
                    warn!(
                        "battery voltage marginal: {volts:.1} V (recommended \
                         at least {:.1} V); connect a charger",
                        limits::BATTERY_WARN_VOLTS
                    );
                }
                Ok(())
            }
            Err(e) => {
                warn!("could not read battery voltage (DID 0xF405): {e}");
                Ok(())
            }
        }
    }

    /// Advisory precondition check via the checksum routine. Never blocks
    /// the operation; some ECU variants do not implement it.
    pub fn check_programming_preconditions(&mut self) -> bool {
        info!(
            "checking programming preconditions (routine 0x{:04X})",
            self.settings.checksum_routine
        );
        match self
            .uds
            .routine_control(uds::routine::START, self.settings.checksum_routine, &[])
        {
            Ok(_) => {
                info!("ECU ready for programming");
                true
            }
            Err(e) => {
                warn!("programming precondition check not conclusive: {e}");
                true
            }
        }
    }

    /// Explicit flash erase routine. Most MSD80 flows erase implicitly on
    /// RequestDownload; this is for variants that require it.
    pub fn erase_flash(&mut self, address: u32, size: u32) -> Result<()> {
        info!("erasing flash @ 0x{address:08X}, {size} bytes");
        let mut data = address.to_be_bytes().to_vec();
        data.extend_from_slice(&size.to_be_bytes());
        self.uds
            .routine_control(uds::routine::START, self.settings.erase_routine, &data)?;
        Ok(())
    }

    /// ECU-side checksum verification routine for one zone (0 = all).
    pub fn verify_checksum(&mut self, zone: u8) -> Result<()> {
        info!("verifying ECU checksums (zone {zone})");
        let record = self.uds.routine_control(
            uds::routine::START,
            self.settings.checksum_routine,
            &[zone],
        )?;
        match record.first() {
            Some(0x00) | None => Ok(()),
            Some(status) => Err(FlashError::ChecksumMismatch(format!(
                "ECU checksum routine reported status 0x{status:02X} for zone {zone}"
            ))),
        }
    }

    // ========================================================================
    // READ PIPELINES
    // ========================================================================

    /// Read an arbitrary region in chunks of at most 512 bytes, streaming
    /// into the sink. Enters the programming session and unlocks first.
    /// Reads touch nothing, so no forbidden-region policy applies.
    pub fn read_region(
        &mut self,
        address: u32,
        size: u32,
        sink: &mut dyn Write,
        progress: Option<&mut dyn FnMut(&str, u8)>,
    ) -> Result<()> {
        let mut progress = Progress(progress);
        let result = self.read_region_inner(address, size, sink, &mut progress);
        self.finish(&mut progress, result)
    }

    fn read_region_inner(
        &mut self,
        address: u32,
        size: u32,
        sink: &mut dyn Write,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        self.set_phase(FlashPhase::SessionEntry);
        progress.report("Entering programming session...", 0);
        self.uds.enter_programming_session()?;

        self.set_phase(FlashPhase::Unlocking);
        progress.report("Unlocking ECU...", 5);
        self.uds.unlock()?;

        self.set_phase(FlashPhase::Transferring);
        let chunk_size = limits::MAX_TRANSFER_SIZE as u32;
        let mut offset = 0u32;
        while offset < size {
            self.cancel.check()?;
            let this_chunk = chunk_size.min(size - offset);
            let data = self.uds.read_memory(address + offset, this_chunk)?;
            if data.len() != this_chunk as usize {
                return Err(FlashError::WriteFailure(format!(
                    "short read at 0x{:08X}: got {} of {} bytes",
                    address + offset,
                    data.len(),
                    this_chunk
                )));
            }
            sink.write_all(&data).map_err(FlashError::BusIo)?;
            offset += this_chunk;

            let percent = 5 + ((offset as u64 * 95) / size as u64) as u8;
            progress.report(
                &format!("Reading memory... {} / {} bytes", offset, size),
                percent,
            );
        }

        self.set_phase(FlashPhase::Done);
        progress.report("Read complete", 100);
        Ok(())
    }

    /// Read the full calibration region.
    pub fn read_calibration(
        &mut self,
        progress: Option<&mut dyn FnMut(&str, u8)>,
    ) -> Result<Vec<u8>> {
        let map = self.settings.ecu.memory_map();
        let mut data = Vec::with_capacity(map.calibration_size as usize);
        self.read_region(map.calibration_start, map.calibration_size, &mut data, progress)?;
        info!("read {} bytes of calibration data", data.len());
        Ok(data)
    }

    /// Read boot, calibration and program flash into the sink. Returns
    /// the number of bytes read.
    pub fn read_full_flash(
        &mut self,
        sink: &mut dyn Write,
        progress: Option<&mut dyn FnMut(&str, u8)>,
    ) -> Result<u64> {
        let map = self.settings.ecu.memory_map();
        let size = map.program_start + map.program_size - map.boot_start;
        self.read_region(map.boot_start, size, sink, progress)?;
        info!("read {size} bytes of full flash");
        Ok(size as u64)
    }

    // ========================================================================
    // WRITE PIPELINES
    // ========================================================================

    /// Chunked TransferData loop with cycling block counter and periodic
    /// battery re-checks.
    fn transfer_loop(
        &mut self,
        data: &[u8],
        block_size: usize,
        progress: &mut Progress<'_>,
        label: &str,
        base_percent: u8,
        span_percent: u8,
    ) -> Result<()> {
        let total_blocks = data.len().div_ceil(block_size);
        let mut block_sequence = 1u8;
        let mut offset = 0usize;
        let mut block_index = 0usize;

        while offset < data.len() {
            self.cancel.check()?;
            let end = (offset + block_size).min(data.len());
            let chunk = &data[offset..end];

            self.uds.transfer_data(block_sequence, chunk).map_err(|e| {
                warn!("transfer failed at block {block_index} (offset 0x{offset:X}): {e}");
                e
            })?;

            offset = end;
            block_index += 1;
            // Sequence cycles 1..255 then wraps through 0.
            block_sequence = block_sequence.wrapping_add(1);

            if block_index % limits::BATTERY_CHECK_BLOCKS == 0 {
                self.check_battery_voltage().map_err(|e| {
                    warn!("battery fell below the limit mid-transfer");
                    e
                })?;
            }

            let percent =
                base_percent + ((offset as u64 * span_percent as u64) / data.len() as u64) as u8;
            progress.report(
                &format!("{label}... block {block_index}/{total_blocks}"),
                percent,
            );
        }
        Ok(())
    }

    /// Shared download/transfer/exit segment of every write pipeline.
    fn download_and_transfer(
        &mut self,
        address: u32,
        data: &[u8],
        max_block_cap: usize,
        progress: &mut Progress<'_>,
        label: &str,
    ) -> Result<()> {
        self.set_phase(FlashPhase::Downloading);
        progress.report("Requesting download...", 15);
        let max_block = self.uds.request_download(address, data.len() as u32)?;
        let block_size = max_block.min(max_block_cap).max(1);
        debug!("using block size {block_size} (ECU max {max_block})");

        self.set_phase(FlashPhase::Transferring);
        self.start_keep_alive();
        let transferred = self.transfer_loop(data, block_size, progress, label, 15, 80);
        self.stop_keep_alive();
        transferred?;

        self.set_phase(FlashPhase::Exiting);
        progress.report("Finalizing transfer...", 95);
        self.uds.request_transfer_exit()?;
        Ok(())
    }

    fn record_op(
        &mut self,
        address: u32,
        data: &[u8],
        actual_checksum: Option<u32>,
        status: WriteResult,
    ) {
        self.log.record(FlashOperation {
            address,
            size: data.len(),
            planned_checksum: Some(crc32_bmw(data)),
            actual_checksum,
            status,
            retries: 0,
            started_at: Utc::now(),
        });
    }

    /// Flash the calibration region.
    pub fn flash_calibration(
        &mut self,
        image: &[u8],
        progress: Option<&mut dyn FnMut(&str, u8)>,
    ) -> Result<WriteResult> {
        let mut progress = Progress(progress);
        let result = self.flash_calibration_inner(image, &mut progress);
        if let Err(e) = &result {
            if self.write_was_attempted() {
                let status = WriteResult::from_error(e);
                self.record_op(
                    self.settings.ecu.memory_map().calibration_start,
                    image,
                    None,
                    status,
                );
            }
        }
        self.finish(&mut progress, result)
    }

    fn flash_calibration_inner(
        &mut self,
        image: &[u8],
        progress: &mut Progress<'_>,
    ) -> Result<WriteResult> {
        let map = self.settings.ecu.memory_map();
        info!(
            "flashing calibration: {} bytes to 0x{:08X}",
            image.len(),
            map.calibration_start
        );

        // Hard gates, in order; each aborts the whole operation.
        self.set_phase(FlashPhase::Validating);
        progress.report("Validating binary...", 0);
        let (ok, errors) = validate_binary(image, self.settings.ecu);
        if !ok {
            return Err(FlashError::BinaryValidation(errors));
        }
        check_data_integrity(image)?;

        progress.report("Validating CRC zones...", 2);
        let mismatches = validate_zones(image);
        if !mismatches.is_empty() {
            return Err(FlashError::ChecksumMismatch(format!(
                "{} CRC zone(s) invalid: {}",
                mismatches.len(),
                mismatches
                    .iter()
                    .map(|m| m.zone)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        if let Some(mismatch) = validate_trailer(image) {
            return Err(FlashError::ChecksumMismatch(format!(
                "trailing CRC-32 invalid: calculated 0x{:08X}, stored 0x{:08X}",
                mismatch.calculated, mismatch.stored
            )));
        }

        progress.report("Checking battery voltage...", 4);
        self.check_battery_voltage()?;

        self.set_phase(FlashPhase::SessionEntry);
        progress.report("Entering programming session...", 5);
        self.uds.enter_programming_session()?;

        self.set_phase(FlashPhase::Unlocking);
        progress.report("Unlocking ECU...", 10);
        self.uds.unlock()?;

        self.set_phase(FlashPhase::Preconditions);
        progress.report("Checking ECU readiness...", 12);
        self.check_programming_preconditions();

        self.download_and_transfer(
            map.calibration_start,
            image,
            limits::MAX_TRANSFER_SIZE,
            progress,
            "Transferring calibration",
        )?;

        self.set_phase(FlashPhase::VerifyingChecksum);
        progress.report("Verifying ECU checksums...", 98);
        self.verify_checksum(0)?;

        self.set_phase(FlashPhase::PostActions);
        self.maybe_reset_flash_counter();
        self.stop_keep_alive();

        self.record_op(map.calibration_start, image, None, WriteResult::Success);
        self.set_phase(FlashPhase::Done);
        progress.report("Flash complete", 100);
        info!("calibration flash successful");
        Ok(WriteResult::Success)
    }

    /// Flash data into the NVRAM region: 2 KiB blocks, mandatory
    /// pre-write backup into the caller's sink, and byte-exact read-back
    /// verification afterwards.
    pub fn flash_nvram(
        &mut self,
        data: &[u8],
        nvram_offset: u32,
        backup: &mut dyn Write,
        progress: Option<&mut dyn FnMut(&str, u8)>,
    ) -> Result<WriteResult> {
        let mut progress = Progress(progress);
        let result = self.flash_nvram_inner(data, nvram_offset, backup, &mut progress);
        if let Err(e) = &result {
            if self.write_was_attempted() {
                let status = WriteResult::from_error(e);
                self.record_op(nvram_offset, data, None, status);
            }
        }
        self.finish(&mut progress, result)
    }

    fn flash_nvram_inner(
        &mut self,
        data: &[u8],
        nvram_offset: u32,
        backup: &mut dyn Write,
        progress: &mut Progress<'_>,
    ) -> Result<WriteResult> {
        info!(
            "flashing NVRAM region: offset 0x{nvram_offset:06X}, {} bytes",
            data.len()
        );

        self.set_phase(FlashPhase::Validating);
        progress.report("Validating NVRAM data...", 0);
        let (ok, errors) = validate_nvram_patch(data);
        if !ok {
            return Err(FlashError::BinaryValidation(errors));
        }

        progress.report("Checking battery voltage...", 1);
        self.check_battery_voltage()?;

        self.set_phase(FlashPhase::SessionEntry);
        progress.report("Entering programming session...", 5);
        self.uds.enter_programming_session()?;

        self.set_phase(FlashPhase::Unlocking);
        progress.report("Unlocking ECU...", 8);
        self.uds.unlock()?;

        // Mandatory backup of the current contents before any write.
        progress.report("Backing up current NVRAM contents...", 10);
        let mut offset = 0u32;
        while (offset as usize) < data.len() {
            self.cancel.check()?;
            let chunk = (limits::MAX_TRANSFER_SIZE as u32).min(data.len() as u32 - offset);
            let existing = self.uds.read_memory(nvram_offset + offset, chunk)?;
            backup.write_all(&existing).map_err(FlashError::BusIo)?;
            offset += chunk;
        }
        backup.flush().map_err(FlashError::BusIo)?;

        self.download_and_transfer(
            nvram_offset,
            data,
            limits::NVRAM_BLOCK_SIZE,
            progress,
            "Transferring NVRAM",
        )?;

        // Post-write verification: re-read and compare byte for byte.
        self.set_phase(FlashPhase::VerifyingChecksum);
        progress.report("Verifying written NVRAM...", 97);
        let mut read_back = Vec::with_capacity(data.len());
        let mut offset = 0u32;
        while (offset as usize) < data.len() {
            self.cancel.check()?;
            let chunk = (limits::MAX_TRANSFER_SIZE as u32).min(data.len() as u32 - offset);
            let block = self.uds.read_memory(nvram_offset + offset, chunk)?;
            read_back.extend_from_slice(&block);
            offset += chunk;
        }
        if read_back != data {
            return Err(FlashError::ChecksumMismatch(
                "NVRAM read-back does not match written data".to_string(),
            ));
        }

        self.record_op(
            nvram_offset,
            data,
            Some(crc32_bmw(&read_back)),
            WriteResult::Success,
        );
        self.set_phase(FlashPhase::Done);
        progress.report("NVRAM flash complete", 100);
        info!("NVRAM region flash successful and verified");
        Ok(WriteResult::Success)
    }

    /// Flash a complete 2 MiB image, region by region, with a
    /// soft reset at the end. This is the recovery path: the boot region
    /// is written here and only here, so no forbidden-region policy
    /// applies. Normal flows must use [`CanFlasher::write_region`].
    pub fn flash_full_binary(
        &mut self,
        image: &[u8],
        progress: Option<&mut dyn FnMut(&str, u8)>,
    ) -> Result<WriteResult> {
        let mut progress = Progress(progress);
        let result = self.flash_full_binary_inner(image, &mut progress);
        self.finish(&mut progress, result)
    }

    fn flash_full_binary_inner(
        &mut self,
        image: &[u8],
        progress: &mut Progress<'_>,
    ) -> Result<WriteResult> {
        info!("flashing full binary: {} bytes", image.len());

        self.set_phase(FlashPhase::Validating);
        progress.report("Validating binary...", 0);
        let (ok, errors) = validate_binary(image, self.settings.ecu);
        if !ok {
            return Err(FlashError::BinaryValidation(errors));
        }
        if image.len() != self.settings.ecu.full_image_size() {
            return Err(FlashError::BinaryValidation(vec![format!(
                "full binary must be exactly 0x{:X} bytes",
                self.settings.ecu.full_image_size()
            )]));
        }

        progress.report("Validating trailing CRC-32...", 2);
        if let Some(mismatch) = validate_trailer(image) {
            return Err(FlashError::ChecksumMismatch(format!(
                "trailing CRC-32 invalid: calculated 0x{:08X}, stored 0x{:08X}",
                mismatch.calculated, mismatch.stored
            )));
        }

        progress.report("Checking battery voltage...", 4);
        self.check_battery_voltage()?;

        self.set_phase(FlashPhase::SessionEntry);
        progress.report("Entering programming session...", 5);
        self.uds.enter_programming_session()?;

        self.set_phase(FlashPhase::Unlocking);
        progress.report("Unlocking ECU...", 8);
        self.uds.unlock()?;

        // Image split used by the recovery flow; each region gets its own
        // download/transfer/exit cycle.
        let regions: [(u32, usize, &str); 4] = [
            (0x000000, 0x100000, "boot + program code"),
            (0x100000, 0x080000, "calibration data"),
            (0x180000, 0x070000, "reserved region"),
            (0x1F0000, 0x010000, "NVRAM region"),
        ];

        self.start_keep_alive();
        let mut base_percent = 10u8;
        let span_per_region = 80 / regions.len() as u8;
        for (offset, size, name) in regions {
            info!("flashing {name} at 0x{offset:06X} ({size} bytes)");
            progress.report(&format!("Flashing {name}..."), base_percent);

            let region = &image[offset as usize..offset as usize + size];
            let result: Result<()> = (|| {
                let max_block = self.uds.request_download(offset, size as u32)?;
                let block_size = max_block.min(limits::NVRAM_BLOCK_SIZE).max(1);
                self.transfer_loop(
                    region,
                    block_size,
                    progress,
                    name,
                    base_percent,
                    span_per_region,
                )?;
                self.uds.request_transfer_exit()?;
                Ok(())
            })();
            if let Err(e) = result {
                self.stop_keep_alive();
                self.record_op(offset, region, None, WriteResult::from_error(&e));
                return Err(e);
            }
            self.record_op(offset, region, None, WriteResult::Success);
            base_percent += span_per_region;
            info!("{name} complete");
        }
        self.stop_keep_alive();

        self.set_phase(FlashPhase::VerifyingChecksum);
        progress.report("Verifying ECU checksums...", 92);
        self.verify_checksum(0)?;

        self.set_phase(FlashPhase::PostActions);
        self.maybe_reset_flash_counter();

        progress.report("Resetting ECU...", 97);
        self.uds.soft_reset()?;

        self.set_phase(FlashPhase::Done);
        progress.report("Full binary flash complete", 100);
        info!("full binary flash successful; ECU restarting, wait before reconnecting");
        Ok(WriteResult::Success)
    }

    /// Guarded write for arbitrary image regions (map patches). The
    /// forbidden-region policy runs before anything touches the bus.
    pub fn write_region(
        &mut self,
        image_offset: u32,
        data: &[u8],
        progress: Option<&mut dyn FnMut(&str, u8)>,
    ) -> Result<WriteResult> {
        let mut progress = Progress(progress);
        let result = self.write_region_inner(image_offset, data, &mut progress);
        if let Err(e) = &result {
            if self.write_was_attempted() {
                let status = WriteResult::from_error(e);
                self.record_op(image_offset, data, None, status);
            }
        }
        self.finish(&mut progress, result)
    }

    fn write_region_inner(
        &mut self,
        image_offset: u32,
        data: &[u8],
        progress: &mut Progress<'_>,
    ) -> Result<WriteResult> {
        self.set_phase(FlashPhase::Validating);
        progress.report("Checking write target...", 0);

        // Fail closed before any CAN traffic.
        check_forbidden(image_offset, data.len())?;
        check_data_integrity(data)?;

        progress.report("Checking battery voltage...", 2);
        self.check_battery_voltage()?;

        self.set_phase(FlashPhase::SessionEntry);
        progress.report("Entering programming session...", 5);
        self.uds.enter_programming_session()?;

        self.set_phase(FlashPhase::Unlocking);
        progress.report("Unlocking ECU...", 10);
        self.uds.unlock()?;

        self.download_and_transfer(
            image_offset,
            data,
            limits::MAX_TRANSFER_SIZE,
            progress,
            "Writing region",
        )?;

        self.set_phase(FlashPhase::VerifyingChecksum);
        progress.report("Verifying ECU checksums...", 98);
        self.verify_checksum(0)?;

        self.record_op(image_offset, data, None, WriteResult::Success);
        self.set_phase(FlashPhase::Done);
        progress.report("Region write complete", 100);
        Ok(WriteResult::Success)
    }

    // ========================================================================
    // NVRAM HELPERS / FLASH COUNTER
    // ========================================================================

    /// Write a small byte sequence into NVRAM: optional backup of the
    /// current bytes, programming session, download, and a read-back
    /// verification. Used for flash-counter and readiness patches.
    pub fn write_nvram_bytes(
        &mut self,
        address: u32,
        data: &[u8],
        mut backup: Option<&mut dyn Write>,
    ) -> Result<WriteResult> {
        info!("writing {} bytes to NVRAM @ 0x{address:06X}", data.len());
        if data.is_empty() {
            return Err(FlashError::WriteFailure("empty NVRAM write".to_string()));
        }

        // Best-effort backup; a failed read is logged, not fatal.
        if let Some(sink) = backup.as_mut() {
            match self.uds.read_memory(address, data.len() as u32) {
                Ok(existing) => {
                    sink.write_all(&existing).map_err(FlashError::BusIo)?;
                    sink.flush().map_err(FlashError::BusIo)?;
                }
                Err(e) => warn!("could not back up NVRAM block before write: {e}"),
            }
        }

        self.check_battery_voltage()?;
        self.uds.enter_programming_session()?;
        self.uds.unlock()?;

        let max_block = self.uds.request_download(address, data.len() as u32)?;
        let block_size = max_block.min(data.len()).max(1);

        self.start_keep_alive();
        let mut progress = Progress(None);
        let transferred =
            self.transfer_loop(data, block_size, &mut progress, "NVRAM write", 0, 100);
        self.stop_keep_alive();
        transferred?;

        self.uds.request_transfer_exit()?;

        let read_back = self.uds.read_memory(address, data.len() as u32)?;
        if read_back != data {
            self.record_op(address, data, None, WriteResult::ChecksumMismatch);
            return Err(FlashError::ChecksumMismatch(
                "NVRAM read-back does not match written data".to_string(),
            ));
        }

        self.record_op(
            address,
            data,
            Some(crc32_bmw(&read_back)),
            WriteResult::Success,
        );
        info!("NVRAM write verified");
        Ok(WriteResult::Success)
    }

    /// Best-effort flash counter reset, controlled by the
    /// settings mode. Writes four zero bytes to the counter and a backup
    /// copy; failures are logged and never fail the parent operation.
    pub fn maybe_reset_flash_counter(&mut self) -> bool {
        let do_reset = match self.settings.counter_reset {
            CounterResetMode::Always => true,
            CounterResetMode::Never => {
                debug!("flash counter reset disabled by settings");
                return false;
            }
            CounterResetMode::Ask => match self.settings.counter_reset_confirm {
                Some(answer) => answer,
                None => {
                    warn!(
                        "flash counter reset set to 'ask' with no confirmation \
                         available; skipping"
                    );
                    false
                }
            },
        };
        if !do_reset {
            return false;
        }

        info!("resetting ECU flash counter (best effort)");
        let zeros = [0u8; 4];
        let primary = match self.write_nvram_bytes(FLASH_COUNTER_ADDR, &zeros, None) {
            Ok(_) => true,
            Err(e) => {
                warn!("flash counter primary write failed: {e}");
                false
            }
        };

        if primary {
            if let Err(e) = self.write_nvram_bytes(FLASH_COUNTER_BACKUP_ADDR, &zeros, None) {
                warn!("flash counter backup write failed: {e}");
            }
        }
        primary
    }
}
