//! UDS (ISO 14229) client
//!
//! Request/response state machine over ISO-TP: positive/negative response
//! parsing, responsePending (0x78) handling, and session recovery when the
//! programming session drops mid-operation. Also carries the BMW session
//! ladder and the security-access unlock sequence.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::can::CanBus;
use crate::constants::{timing, uds};
use crate::error::{nrc_name, FlashError, Result};
use crate::isotp::IsoTpTransport;
use crate::security::{format_secret, Algorithm, ALGORITHM_ORDER, SECURITY_LEVELS};
use crate::CancelToken;

/// Diagnostic session types the client can enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSession {
    Default,
    Programming,
    Extended,
    BmwProgramming,
    BmwExtended,
}

impl DiagnosticSession {
    pub fn as_byte(self) -> u8 {
        match self {
            DiagnosticSession::Default => uds::session::DEFAULT,
            DiagnosticSession::Programming => uds::session::PROGRAMMING,
            DiagnosticSession::Extended => uds::session::EXTENDED,
            DiagnosticSession::BmwProgramming => uds::session::BMW_PROGRAMMING,
            DiagnosticSession::BmwExtended => uds::session::BMW_EXTENDED,
        }
    }
}

/// Session and security state tracked by the client.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session: DiagnosticSession,
    pub security_unlocked: bool,
    pub level: Option<u8>,
    pub algorithm: Option<Algorithm>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            session: DiagnosticSession::Default,
            security_unlocked: false,
            level: None,
            algorithm: None,
        }
    }
}

/// Timing knobs, all overridable; defaults match the BMW PT-CAN values.
#[derive(Debug, Clone)]
pub struct UdsTiming {
    pub p2: Duration,
    pub p2_star: Duration,
    pub pending_wait: Duration,
    pub max_pending_retries: u32,
    pub max_session_recoveries: u32,
}

impl Default for UdsTiming {
    fn default() -> Self {
        Self {
            p2: timing::P2,
            p2_star: timing::P2_STAR,
            pending_wait: timing::RESPONSE_PENDING_WAIT,
            max_pending_retries: timing::MAX_PENDING_RETRIES,
            max_session_recoveries: timing::MAX_SESSION_RECOVERIES,
        }
    }
}

/// ECU reprogramming status word (16 bit). Bits beyond the ones named
/// here are reserved; nothing in this crate drives decisions from them.
#[derive(Debug, Clone, Copy)]
pub struct ReprogrammingStatus {
    pub raw: u16,
}

impl ReprogrammingStatus {
    pub const PROGRAMMING_IN_PROGRESS: u16 = 0x0001;
    pub const PROGRAMMING_COMPLETE: u16 = 0x0002;
    pub const PROGRAMMING_ERROR: u16 = 0x0004;
    pub const CHECKSUM_ERROR: u16 = 0x0008;
    pub const SECURITY_ACCESS_DENIED: u16 = 0x0010;
    pub const FLASH_ERASE_IN_PROGRESS: u16 = 0x0100;
    pub const FLASH_WRITE_IN_PROGRESS: u16 = 0x0200;
    pub const VERIFICATION_IN_PROGRESS: u16 = 0x0400;

    pub fn from_word(raw: u16) -> Self {
        Self { raw }
    }

    pub fn is_busy(self) -> bool {
        self.raw
            & (Self::PROGRAMMING_IN_PROGRESS
                | Self::FLASH_ERASE_IN_PROGRESS
                | Self::FLASH_WRITE_IN_PROGRESS
                | Self::VERIFICATION_IN_PROGRESS)
            != 0
    }

    pub fn has_error(self) -> bool {
        self.raw
            & (Self::PROGRAMMING_ERROR | Self::CHECKSUM_ERROR | Self::SECURITY_ACCESS_DENIED)
            != 0
    }
}

/// UDS client bound to one ECU over a shared ISO-TP transport.
///
/// The transport sits behind a mutex so the background TesterPresent
/// keep-alive can send between transactions without ever interleaving
/// frames with an in-flight transfer.
pub struct UdsClient {
    transport: Arc<Mutex<IsoTpTransport>>,
    pub timing: UdsTiming,
    pub state: SessionState,
    pub reveal_secrets: bool,
    cancel: CancelToken,
    in_recovery: bool,
}

impl UdsClient {
    pub fn new(bus: Box<dyn CanBus>, tx_id: u32, rx_id: u32) -> Self {
        let transport = IsoTpTransport::new(bus, tx_id, rx_id);
        Self::from_transport(Arc::new(Mutex::new(transport)))
    }

    pub fn from_transport(transport: Arc<Mutex<IsoTpTransport>>) -> Self {
        Self {
            transport,
            timing: UdsTiming::default(),
            state: SessionState::default(),
            reveal_secrets: false,
            cancel: CancelToken::new(),
            in_recovery: false,
        }
    }

    /// Shared handle to the transport, for the keep-alive task.
    pub fn transport(&self) -> Arc<Mutex<IsoTpTransport>> {
        Arc::clone(&self.transport)
    }

    /// Install the cancel token checked inside waits.
    pub fn set_cancel_token(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    /// Close the underlying bus.
    pub fn close(&mut self) -> Result<()> {
        self.transport.lock().unwrap().close()
    }

    // ========================================================================
    // CORE REQUEST/RESPONSE
    // ========================================================================

    /// Send a UDS request with the full retry and recovery policy:
    /// responsePending handling, then session recovery (re-enter the
    /// programming session and re-unlock) for session-related NRCs and
    /// timeouts, up to the recovery budget.
    pub fn send_uds(&mut self, service: u8, data: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let mut recoveries = 0u32;
        loop {
            let result = self.send_request_once(service, data, timeout);
            let err = match result {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            let recoverable = !self.in_recovery
                && match &err {
                    FlashError::UdsTimeout { .. } => true,
                    FlashError::NegativeResponse { nrc, .. } => matches!(
                        *nrc,
                        uds::nrc::CONDITIONS_NOT_CORRECT
                            | uds::nrc::SUB_FUNCTION_NOT_SUPPORTED_IN_ACTIVE_SESSION
                            | uds::nrc::SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION
                    ),
                    _ => false,
                };
            if !recoverable {
                return Err(err);
            }

            if recoveries >= self.timing.max_session_recoveries {
                return Err(match err {
                    FlashError::NegativeResponse { .. } => FlashError::SessionLost { service },
                    other => other,
                });
            }
            recoveries += 1;
            warn!(
                "service 0x{service:02X} hit a recoverable failure ({err}); \
                 session recovery attempt {recoveries}/{}",
                self.timing.max_session_recoveries
            );
            if !self.recover_session() {
                debug!("session recovery attempt {recoveries} failed");
            }
        }
    }

    /// Convenience wrapper using the standard P2 timeout.
    pub fn send_uds_p2(&mut self, service: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.send_uds(service, data, self.timing.p2)
    }

    /// One transmit plus the responsePending loop; no recovery.
    fn send_request_once(&mut self, service: u8, data: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.cancel.check()?;

        let mut request = Vec::with_capacity(1 + data.len());
        request.push(service);
        request.extend_from_slice(data);

        {
            let mut transport = self.transport.lock().unwrap();
            transport.send(&request)?;
        }

        let mut pending = 0u32;
        loop {
            self.cancel.check()?;
            let response = {
                let mut transport = self.transport.lock().unwrap();
                transport.recv(timeout)
            };
            let response = match response {
                Ok(Some(r)) => r,
                Ok(None) => return Err(FlashError::UdsTimeout { service }),
                // A torn multi-frame response counts as a timeout at this
                // layer; the recovery policy decides what happens next.
                Err(FlashError::IsoTpTimeout(_)) => {
                    return Err(FlashError::UdsTimeout { service })
                }
                Err(e) => return Err(e),
            };

            if response.is_empty() {
                continue;
            }

            // Positive response
            if response[0] == service.wrapping_add(uds::POSITIVE_RESPONSE_OFFSET) {
                return Ok(response[1..].to_vec());
            }

            // Negative response
            if response[0] == uds::NEGATIVE_RESPONSE && response.len() >= 3 {
                let failed_service = response[1];
                let nrc = response[2];

                if failed_service == service && nrc == uds::nrc::RESPONSE_PENDING {
                    pending += 1;
                    if pending > self.timing.max_pending_retries {
                        warn!(
                            "service 0x{service:02X}: more than {} responsePending responses",
                            self.timing.max_pending_retries
                        );
                        return Err(FlashError::UdsTimeout { service });
                    }
                    debug!(
                        "response pending, waiting ({pending}/{})",
                        self.timing.max_pending_retries
                    );
                    // Do not resend; the ECU answers when it is ready.
                    self.cancel.sleep(self.timing.pending_wait)?;
                    continue;
                }

                warn!(
                    "negative response: service 0x{failed_service:02X}, NRC 0x{nrc:02X} ({})",
                    nrc_name(nrc)
                );
                return Err(FlashError::NegativeResponse {
                    service: failed_service,
                    nrc,
                });
            }

            // A response to something else; keep waiting for ours.
            warn!(
                "unexpected response SID 0x{:02X} to service 0x{service:02X}, discarding",
                response[0]
            );
        }
    }

    /// Re-enter the programming session and re-unlock. Requests issued
    /// here never trigger a nested recovery.
    fn recover_session(&mut self) -> bool {
        warn!("attempting session recovery: re-enter programming session and unlock");
        self.in_recovery = true;
        self.state.security_unlocked = false;
        self.state.level = None;
        self.state.algorithm = None;

        let result = self
            .enter_programming_session()
            .and_then(|_| self.unlock().map(|_| ()));
        self.in_recovery = false;

        match result {
            Ok(()) => {
                info!("session recovery successful");
                true
            }
            Err(e) => {
                warn!("session recovery failed: {e}");
                false
            }
        }
    }

    // ========================================================================
    // SESSION MANAGEMENT
    // ========================================================================

    fn try_session(&mut self, session: DiagnosticSession) -> Result<()> {
        self.send_request_once(
            uds::DIAGNOSTIC_SESSION_CONTROL,
            &[session.as_byte()],
            self.timing.p2,
        )?;
        self.state.session = session;
        Ok(())
    }

    /// Enter the programming session, trying the BMW-specific type (0x85)
    /// first and falling back to the standard one (0x02).
    pub fn enter_programming_session(&mut self) -> Result<()> {
        debug!("trying BMW programming session (0x85)");
        if self.try_session(DiagnosticSession::BmwProgramming).is_ok() {
            info!("BMW programming session established (0x85)");
            return Ok(());
        }

        debug!("trying standard programming session (0x02)");
        match self.try_session(DiagnosticSession::Programming) {
            Ok(()) => {
                info!("standard programming session established (0x02)");
                Ok(())
            }
            Err(e) => {
                warn!("failed to enter programming session (tried 0x85 and 0x02): {e}");
                Err(FlashError::PreconditionFailed(
                    "failed to enter programming session".to_string(),
                ))
            }
        }
    }

    /// Enter the BMW extended diagnostic session (0x87), used by some
    /// flash sequences before the programming session.
    pub fn enter_bmw_extended_session(&mut self) -> Result<()> {
        self.try_session(DiagnosticSession::BmwExtended)?;
        info!("BMW extended session established (0x87)");
        Ok(())
    }

    /// Enter an arbitrary diagnostic session.
    pub fn enter_session(&mut self, session: DiagnosticSession) -> Result<()> {
        self.try_session(session)
    }

    /// ECU reset (UDS 0x11).
    pub fn ecu_reset(&mut self, reset_type: u8) -> Result<()> {
        self.send_uds(uds::ECU_RESET, &[reset_type], self.timing.p2)?;
        Ok(())
    }

    /// Soft reset (0x11 0x03), used after a successful flash.
    pub fn soft_reset(&mut self) -> Result<()> {
        info!("performing ECU soft reset (0x11 0x03)");
        self.ecu_reset(uds::reset::SOFT)
    }

    /// TesterPresent (0x3E). With `suppress_response` the keep-alive goes
    /// out as a bare single frame and no response is awaited.
    pub fn tester_present(&mut self, suppress_response: bool) -> Result<()> {
        if suppress_response {
            let mut transport = self.transport.lock().unwrap();
            transport.send(&[
                uds::TESTER_PRESENT,
                uds::tester_present::SUPPRESS_RESPONSE,
            ])
        } else {
            self.send_uds(
                uds::TESTER_PRESENT,
                &[uds::tester_present::RESPOND],
                self.timing.p2,
            )?;
            Ok(())
        }
    }

    /// CommunicationControl (UDS 0x28).
    pub fn communication_control(&mut self, control_type: u8, comm_type: u8) -> Result<()> {
        self.send_uds(
            uds::COMMUNICATION_CONTROL,
            &[control_type, comm_type],
            self.timing.p2,
        )?;
        Ok(())
    }

    // ========================================================================
    // SECURITY ACCESS
    // ========================================================================

    /// Request a security seed (0x27, odd sub-function). The sub-function
    /// echo leading the response is stripped.
    pub fn request_seed(&mut self, level: u8) -> Result<Vec<u8>> {
        let data = self.send_request_once(uds::SECURITY_ACCESS, &[level], self.timing.p2)?;
        let seed = match data.split_first() {
            Some((&echo, rest)) if echo == level => rest.to_vec(),
            _ => {
                warn!("seed response missing sub-function echo, using raw payload");
                data
            }
        };
        // An already-unlocked level answers with an all-zero seed.
        info!(
            "received seed (level 0x{level:02X}): {}",
            format_secret(&seed, self.reveal_secrets)
        );
        Ok(seed)
    }

    /// Send a security key (0x27, even sub-function = seed level + 1).
    pub fn send_key(&mut self, level: u8, key: &[u8]) -> Result<()> {
        debug!(
            "sending key (level 0x{level:02X}): {}",
            format_secret(key, self.reveal_secrets)
        );
        let mut data = vec![level.wrapping_add(1)];
        data.extend_from_slice(key);
        self.send_request_once(uds::SECURITY_ACCESS, &data, self.timing.p2)?;
        Ok(())
    }

    /// Full unlock sequence: every level in [0x01, 0x03, 0x11], every
    /// algorithm in [standard, v1, v2, v3]; first positive response wins.
    ///
    /// Idempotent: once unlocked, further calls return the cached result
    /// without any seed/key exchange.
    pub fn unlock(&mut self) -> Result<(u8, Algorithm)> {
        if self.state.security_unlocked {
            if let (Some(level), Some(algorithm)) = (self.state.level, self.state.algorithm) {
                debug!("ECU already unlocked (level 0x{level:02X}, {})", algorithm.name());
                return Ok((level, algorithm));
            }
        }

        info!("unlocking ECU");
        for level in SECURITY_LEVELS {
            debug!("trying security level 0x{level:02X}");
            let seed = match self.request_seed(level) {
                Ok(seed) if seed.is_empty() => {
                    warn!("empty seed for level 0x{level:02X}, trying next level");
                    continue;
                }
                Ok(seed) if seed.iter().all(|&b| b == 0) => {
                    // All-zero seed: this level is already unlocked.
                    info!("level 0x{level:02X} already unlocked (zero seed)");
                    self.state.security_unlocked = true;
                    self.state.level = Some(level);
                    self.state.algorithm = Some(Algorithm::Standard);
                    return Ok((level, Algorithm::Standard));
                }
                Ok(seed) => seed,
                Err(e) => {
                    debug!("seed request for level 0x{level:02X} failed: {e}");
                    continue;
                }
            };

            for algorithm in ALGORITHM_ORDER {
                let key = match algorithm.compute_key(&seed) {
                    Ok(key) => key,
                    Err(_) => {
                        // Seed length does not fit this algorithm.
                        continue;
                    }
                };

                match self.send_key(level, &key) {
                    Ok(()) => {
                        info!(
                            "ECU unlocked: level 0x{level:02X}, algorithm {}, seed {}",
                            algorithm.name(),
                            format_secret(&seed, self.reveal_secrets)
                        );
                        self.state.security_unlocked = true;
                        self.state.level = Some(level);
                        self.state.algorithm = Some(algorithm);
                        return Ok((level, algorithm));
                    }
                    Err(e) => {
                        debug!("algorithm {} rejected: {e}", algorithm.name());
                    }
                }
            }
        }

        warn!("all security levels and algorithms failed; ECU remains locked");
        Err(FlashError::SecurityAccessDenied)
    }

    // ========================================================================
    // DATA SERVICES
    // ========================================================================

    /// ReadDataByIdentifier (0x22). Returns the payload after the DID echo.
    pub fn read_did(&mut self, did: u16) -> Result<Vec<u8>> {
        let response = self.send_uds(uds::READ_DATA_BY_ID, &did.to_be_bytes(), self.timing.p2)?;
        if response.len() < 2 {
            return Err(FlashError::WriteFailure(format!(
                "short response reading DID 0x{did:04X}"
            )));
        }
        let echoed = u16::from_be_bytes([response[0], response[1]]);
        if echoed != did {
            return Err(FlashError::WriteFailure(format!(
                "DID mismatch: requested 0x{did:04X}, got 0x{echoed:04X}"
            )));
        }
        Ok(response[2..].to_vec())
    }

    /// WriteDataByIdentifier (0x2E).
    pub fn write_did(&mut self, did: u16, data: &[u8]) -> Result<()> {
        let mut payload = did.to_be_bytes().to_vec();
        payload.extend_from_slice(data);
        self.send_uds(uds::WRITE_DATA_BY_ID, &payload, self.timing.p2_star)?;
        Ok(())
    }

    /// ReadMemoryByAddress (0x23), 4-byte address and length fields.
    pub fn read_memory(&mut self, address: u32, size: u32) -> Result<Vec<u8>> {
        let mut payload = vec![0x44];
        payload.extend_from_slice(&address.to_be_bytes());
        payload.extend_from_slice(&size.to_be_bytes());
        self.send_uds(uds::READ_MEMORY_BY_ADDRESS, &payload, self.timing.p2_star)
    }

    /// WriteMemoryByAddress (0x3D).
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut payload = vec![0x44];
        payload.extend_from_slice(&address.to_be_bytes());
        payload.extend_from_slice(&(data.len() as u32).to_be_bytes());
        payload.extend_from_slice(data);
        self.send_uds(uds::WRITE_MEMORY_BY_ADDRESS, &payload, self.timing.p2_star)?;
        Ok(())
    }

    /// InputOutputControlByIdentifier (0x30).
    pub fn io_control_by_id(
        &mut self,
        did: u16,
        control_parameter: u8,
        control_state: &[u8],
    ) -> Result<Vec<u8>> {
        let mut payload = did.to_be_bytes().to_vec();
        payload.push(control_parameter);
        payload.extend_from_slice(control_state);
        self.send_uds(uds::IO_CONTROL_BY_ID, &payload, self.timing.p2_star)
    }

    /// RoutineControl (0x31). Returns the routine status record, i.e. the
    /// bytes after the control type and routine id echo.
    pub fn routine_control(
        &mut self,
        control_type: u8,
        routine_id: u16,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let mut payload = vec![control_type];
        payload.extend_from_slice(&routine_id.to_be_bytes());
        payload.extend_from_slice(data);
        let response = self.send_uds(uds::ROUTINE_CONTROL, &payload, self.timing.p2_star)?;
        Ok(response.get(3..).unwrap_or_default().to_vec())
    }

    // ========================================================================
    // UPLOAD / DOWNLOAD
    // ========================================================================

    /// RequestDownload (0x34). Returns the maximum block length the ECU
    /// accepts for the following TransferData requests.
    pub fn request_download(&mut self, address: u32, size: u32) -> Result<usize> {
        info!("requesting download: 0x{address:08X}, {size} bytes");
        let mut payload = vec![0x00, 0x44];
        payload.extend_from_slice(&address.to_be_bytes());
        payload.extend_from_slice(&size.to_be_bytes());
        let response = self.send_uds(uds::REQUEST_DOWNLOAD, &payload, self.timing.p2_star)?;

        // [lengthFormatIdentifier] [maxNumberOfBlockLength ...]
        if response.is_empty() {
            return Err(FlashError::WriteFailure(
                "empty RequestDownload response".to_string(),
            ));
        }
        let n = (response[0] >> 4) as usize;
        if n == 0 || response.len() < 1 + n || n > 4 {
            return Err(FlashError::WriteFailure(format!(
                "malformed RequestDownload response: {response:02X?}"
            )));
        }
        let mut max_block = 0usize;
        for &byte in &response[1..1 + n] {
            max_block = (max_block << 8) | byte as usize;
        }
        info!("download accepted, max block length {max_block}");
        Ok(max_block)
    }

    /// TransferData (0x36) for one block.
    pub fn transfer_data(&mut self, block_sequence: u8, data: &[u8]) -> Result<()> {
        let mut payload = vec![block_sequence];
        payload.extend_from_slice(data);
        self.send_uds(uds::TRANSFER_DATA, &payload, self.timing.p2_star)?;
        Ok(())
    }

    /// RequestTransferExit (0x37).
    pub fn request_transfer_exit(&mut self) -> Result<()> {
        info!("requesting transfer exit");
        self.send_uds(uds::REQUEST_TRANSFER_EXIT, &[], self.timing.p2_star)?;
        Ok(())
    }

    // ========================================================================
    // IDENTIFICATION
    // ========================================================================

    /// Read the VIN (DID 0xF190) as a printable ASCII string.
    pub fn read_vin(&mut self) -> Result<String> {
        let raw = self.read_did(crate::constants::dids::VIN)?;
        let vin: String = raw
            .iter()
            .filter(|&&b| (0x20..=0x7E).contains(&b))
            .map(|&b| b as char)
            .collect();
        let vin = vin.trim().to_string();
        if vin.is_empty() {
            return Err(FlashError::WriteFailure("empty VIN response".to_string()));
        }
        info!("VIN: {vin}");
        Ok(vin)
    }

    /// Read battery voltage (DID 0xF405), reported in 0.1 V units.
    pub fn read_battery_voltage(&mut self) -> Result<f32> {
        let raw = self.read_did(crate::constants::dids::BATTERY_VOLTAGE)?;
        if raw.len() < 2 {
            return Err(FlashError::WriteFailure(
                "short battery voltage response".to_string(),
            ));
        }
        let volts = u16::from_be_bytes([raw[0], raw[1]]) as f32 / 10.0;
        debug!("battery voltage: {volts:.1} V");
        Ok(volts)
    }

    /// Read DTCs via ReadDTCInformation (0x19 0x02) with an all-set
    /// status mask, parsed into structured records.
    pub fn read_dtcs(&mut self, db: Option<&dyn crate::dtc::DtcDatabase>) -> Result<Vec<crate::dtc::Dtc>> {
        let data = self.send_uds(uds::READ_DTC_INFO, &[0x02, 0xFF], self.timing.p2_star)?;
        let mut full = vec![0x59];
        full.extend_from_slice(&data);
        Ok(crate::dtc::parse_dtc_response(&full, Some(0x59), db))
    }

    /// Clear all stored DTCs (ClearDiagnosticInformation 0x14, group
    /// 0xFFFFFF).
    pub fn clear_dtcs(&mut self) -> Result<()> {
        info!("clearing all DTCs");
        self.send_uds(
            uds::CLEAR_DIAGNOSTIC_INFO,
            &[0xFF, 0xFF, 0xFF],
            self.timing.p2_star,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEcu;

    fn client(ecu: &MockEcu) -> UdsClient {
        let mut client = UdsClient::new(Box::new(ecu.clone()), 0x6F1, 0x6F9);
        client.timing.p2 = Duration::from_millis(30);
        client.timing.p2_star = Duration::from_millis(60);
        client.timing.pending_wait = Duration::from_millis(2);
        client
    }

    #[test]
    fn test_read_vin_single_frame() {
        // `22 F1 90` answered by `62 F1 90 57 42 41`.
        let ecu = MockEcu::new(|req| {
            assert_eq!(req, &[0x22, 0xF1, 0x90]);
            vec![vec![0x62, 0xF1, 0x90, 0x57, 0x42, 0x41]]
        });
        let mut uds = client(&ecu);

        let vin = uds.read_vin().unwrap();
        assert_eq!(vin, "WBA");

        // The request went out as a padded single frame.
        let frames = ecu.sent_frames();
        assert_eq!(
            frames[0].padded(),
            [0x03, 0x22, 0xF1, 0x90, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_response_pending_then_positive() {
        // Three 7F 31 78 responses, then the positive response.
        let ecu = MockEcu::new(|req| {
            assert_eq!(req[0], 0x31);
            vec![
                vec![0x7F, 0x31, 0x78],
                vec![0x7F, 0x31, 0x78],
                vec![0x7F, 0x31, 0x78],
                vec![0x71, 0x01, 0xFF, 0x01, 0x00],
            ]
        });
        let mut uds = client(&ecu);

        let record = uds.routine_control(0x01, 0xFF01, &[]).unwrap();
        assert_eq!(record, vec![0x00]);
    }

    #[test]
    fn test_pending_budget_exhausted() {
        // Eleven pendings exceed the 10-retry budget.
        let ecu = MockEcu::new(|_| vec![vec![0x7F, 0x31, 0x78]; 11]);
        let mut uds = client(&ecu);
        uds.timing.max_session_recoveries = 0;

        let err = uds
            .send_uds(0x31, &[0x01, 0xFF, 0x01], Duration::from_millis(30))
            .unwrap_err();
        assert_eq!(err.kind(), "UdsTimeout");
    }

    #[test]
    fn test_pending_budget_boundary() {
        // Exactly ten pendings followed by a positive response succeed.
        let ecu = MockEcu::new(|_| {
            let mut r = vec![vec![0x7F, 0x31, 0x78]; 10];
            r.push(vec![0x71, 0x01, 0xFF, 0x01, 0x00]);
            r
        });
        let mut uds = client(&ecu);
        let record = uds.routine_control(0x01, 0xFF01, &[]).unwrap();
        assert_eq!(record, vec![0x00]);
    }

    #[test]
    fn test_negative_response_surfaces_nrc() {
        let ecu = MockEcu::new(|_| vec![vec![0x7F, 0x34, 0x31]]);
        let mut uds = client(&ecu);

        let err = uds.request_download(0x810000, 0x40000).unwrap_err();
        match err {
            FlashError::NegativeResponse { service, nrc } => {
                assert_eq!(service, 0x34);
                assert_eq!(nrc, 0x31);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_security_unlock_first_algorithm_wins() {
        // Seed 0x1234 at level 0x01; the standard key
        // 0xC723 is accepted.
        let ecu = MockEcu::new(|req| {
            match req {
                [0x27, 0x01] => vec![vec![0x67, 0x01, 0x12, 0x34]],
                [0x27, 0x02, 0xC7, 0x23] => vec![vec![0x67, 0x02]],
                [0x27, 0x02, ..] => vec![vec![0x7F, 0x27, 0x35]],
                _ => vec![vec![0x7F, req[0], 0x11]],
            }
        });
        let mut uds = client(&ecu);

        let (level, algorithm) = uds.unlock().unwrap();
        assert_eq!(level, 0x01);
        assert_eq!(algorithm, Algorithm::Standard);
        assert!(uds.state.security_unlocked);
    }

    #[test]
    fn test_security_fallback_across_algorithms() {
        // A 4-byte seed: the standard algorithm computes a key from the
        // first two bytes and is rejected (NRC 0x35); v1 succeeds.
        let seed = [0xA0u8, 0xB1, 0xC2, 0xD3];
        let v1_key = Algorithm::V1.compute_key(&seed).unwrap();
        let ecu = MockEcu::new(move |req| {
            if req == [0x27, 0x01] {
                let mut r = vec![0x67, 0x01];
                r.extend_from_slice(&seed);
                return vec![r];
            }
            if req.len() >= 2 && req[0] == 0x27 && req[1] == 0x02 {
                if req[2..] == v1_key[..] {
                    return vec![vec![0x67, 0x02]];
                }
                return vec![vec![0x7F, 0x27, 0x35]];
            }
            vec![vec![0x7F, req[0], 0x11]]
        });
        let mut uds = client(&ecu);

        let (level, algorithm) = uds.unlock().unwrap();
        assert_eq!(level, 0x01);
        assert_eq!(algorithm, Algorithm::V1);
    }

    #[test]
    fn test_unlock_is_idempotent() {
        let ecu = MockEcu::new(|req| match req {
            [0x27, 0x01] => vec![vec![0x67, 0x01, 0x12, 0x34]],
            [0x27, 0x02, 0xC7, 0x23] => vec![vec![0x67, 0x02]],
            _ => vec![vec![0x7F, req[0], 0x11]],
        });
        let mut uds = client(&ecu);

        uds.unlock().unwrap();
        let frames_after_first = ecu.sent_count();

        // Second unlock performs no seed/key exchange.
        let (level, algorithm) = uds.unlock().unwrap();
        assert_eq!(level, 0x01);
        assert_eq!(algorithm, Algorithm::Standard);
        assert_eq!(ecu.sent_count(), frames_after_first);
    }

    #[test]
    fn test_all_algorithms_fail_raises_security_denied() {
        let ecu = MockEcu::new(|req| match req {
            [0x27, level] if level % 2 == 1 => vec![vec![0x67, *level, 0xAA, 0xBB, 0xCC, 0xDD]],
            [0x27, ..] => vec![vec![0x7F, 0x27, 0x35]],
            _ => vec![vec![0x7F, req[0], 0x11]],
        });
        let mut uds = client(&ecu);

        let err = uds.unlock().unwrap_err();
        assert_eq!(err.kind(), "SecurityAccessDenied");
    }

    #[test]
    fn test_session_recovery_budget() {
        // Every data request fails with a session NRC; session entry and
        // security succeed, so each recovery "works" and the request is
        // retried until the budget runs out.
        let ecu = MockEcu::new(|req| match req[0] {
            0x10 => vec![vec![0x50, req[1]]],
            0x27 => match req[1] {
                0x01 => vec![vec![0x67, 0x01, 0x12, 0x34]],
                _ => vec![vec![0x67, req[1]]],
            },
            _ => vec![vec![0x7F, req[0], 0x7F]],
        });
        let mut uds = client(&ecu);

        let err = uds
            .send_uds(0x23, &[0x44, 0x00, 0x81, 0x00, 0x00], Duration::from_millis(30))
            .unwrap_err();
        match err {
            FlashError::SessionLost { service } => assert_eq!(service, 0x23),
            other => panic!("expected SessionLost, got {other:?}"),
        }

        // Original request sent 1 + 3 recovery retries = 4 times.
        let attempts = ecu
            .sent_frames()
            .iter()
            .filter(|f| f.data.len() > 1 && f.data[1] == 0x23)
            .count();
        assert_eq!(attempts, 4);
    }

    #[test]
    fn test_recovery_reestablishes_session_then_succeeds() {
        // First read fails with CONDITIONS_NOT_CORRECT until a programming
        // session has been entered; after recovery the read succeeds.
        let session_entered = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = session_entered.clone();
        let ecu = MockEcu::new(move |req| match req[0] {
            0x10 => {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                vec![vec![0x50, req[1]]]
            }
            0x27 => match req[1] {
                0x01 => vec![vec![0x67, 0x01, 0x12, 0x34]],
                _ => vec![vec![0x67, req[1]]],
            },
            0x22 => {
                if flag.load(std::sync::atomic::Ordering::SeqCst) {
                    vec![vec![0x62, req[1], req[2], 0x42]]
                } else {
                    vec![vec![0x7F, 0x22, 0x22]]
                }
            }
            _ => vec![vec![0x7F, req[0], 0x11]],
        });
        let mut uds = client(&ecu);

        let data = uds.read_did(0x1234).unwrap();
        assert_eq!(data, vec![0x42]);
        assert!(uds.state.security_unlocked);
    }

    #[test]
    fn test_programming_session_fallback_to_standard() {
        // ECU rejects 0x85 but accepts 0x02.
        let ecu = MockEcu::new(|req| match req {
            [0x10, 0x85] => vec![vec![0x7F, 0x10, 0x12]],
            [0x10, 0x02] => vec![vec![0x50, 0x02]],
            _ => vec![vec![0x7F, req[0], 0x11]],
        });
        let mut uds = client(&ecu);

        uds.enter_programming_session().unwrap();
        assert_eq!(uds.state.session, DiagnosticSession::Programming);
    }

    #[test]
    fn test_tester_present_suppressed_sends_single_frame() {
        let ecu = MockEcu::new(|_| vec![]);
        let mut uds = client(&ecu);

        uds.tester_present(true).unwrap();
        let frames = ecu.sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].data, &[0x02, 0x3E, 0x80]);
    }

    #[test]
    fn test_request_download_parses_block_length() {
        let ecu = MockEcu::new(|req| {
            assert_eq!(req[0], 0x34);
            assert_eq!(req[1], 0x00); // no compression/encryption
            assert_eq!(req[2], 0x44); // 4-byte address and length
            vec![vec![0x74, 0x20, 0x02, 0x00]]
        });
        let mut uds = client(&ecu);

        let max_block = uds.request_download(0x810000, 0x40000).unwrap();
        assert_eq!(max_block, 0x200);
    }

    #[test]
    fn test_read_memory_round_trip() {
        let ecu = MockEcu::new(|req| {
            assert_eq!(req[0], 0x23);
            let addr = u32::from_be_bytes([req[2], req[3], req[4], req[5]]);
            let size = u32::from_be_bytes([req[6], req[7], req[8], req[9]]);
            assert_eq!(addr, 0x810000);
            let mut resp = vec![0x63];
            resp.extend((0..size).map(|i| i as u8));
            vec![resp]
        });
        let mut uds = client(&ecu);

        let data = uds.read_memory(0x810000, 16).unwrap();
        assert_eq!(data.len(), 16);
        assert_eq!(data[3], 3);
    }

    #[test]
    fn test_read_dtcs_parses_triplets() {
        let ecu = MockEcu::new(|req| {
            assert_eq!(req, &[0x19, 0x02, 0xFF]);
            vec![vec![0x59, 0x02, 0x03, 0x00, 0x09]]
        });
        let mut uds = client(&ecu);

        let dtcs = uds.read_dtcs(None).unwrap();
        assert_eq!(dtcs.len(), 1);
        assert_eq!(dtcs[0].code, "P0300");
        assert!(dtcs[0].confirmed);
    }

    #[test]
    fn test_clear_dtcs() {
        let ecu = MockEcu::new(|req| {
            assert_eq!(req, &[0x14, 0xFF, 0xFF, 0xFF]);
            vec![vec![0x54]]
        });
        let mut uds = client(&ecu);
        uds.clear_dtcs().unwrap();
    }

    #[test]
    fn test_reprogramming_status_word() {
        let status = ReprogrammingStatus::from_word(0x0201);
        assert!(status.is_busy());
        assert!(!status.has_error());

        let status = ReprogrammingStatus::from_word(0x0008);
        assert!(status.has_error());
        assert!(!status.is_busy());

        // Reserved bits alone report neither busy nor error.
        let status = ReprogrammingStatus::from_word(0x8000);
        assert!(!status.is_busy());
        assert!(!status.has_error());
    }
}
