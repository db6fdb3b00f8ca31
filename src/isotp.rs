//! ISO-TP (ISO 15765-2) transport layer
//!
//! Segments payloads up to 4095 bytes into Single Frame or First Frame +
//! Consecutive Frames with a Flow Control handshake, and reassembles the
//! same on receive. This layer preserves payload octets exactly and never
//! interprets UDS semantics.

use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::can::{CanBus, CanFrame};
use crate::constants::timing;
use crate::error::{FlashError, Result};

/// Maximum payload length of classical ISO-TP (12-bit length field).
pub const MAX_PAYLOAD: usize = 4095;

/// Frame type nibbles (upper nibble of the PCI byte).
const PCI_SINGLE: u8 = 0x00;
const PCI_FIRST: u8 = 0x10;
const PCI_CONSECUTIVE: u8 = 0x20;
const PCI_FLOW_CONTROL: u8 = 0x30;

/// Flow Control status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    ContinueToSend,
    Wait,
    Overflow,
}

impl FlowStatus {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x00 => Some(FlowStatus::ContinueToSend),
            0x01 => Some(FlowStatus::Wait),
            0x02 => Some(FlowStatus::Overflow),
            _ => None,
        }
    }
}

/// Decode an STmin byte to the separation time between consecutive frames.
///
/// 0..=127 is milliseconds, 0xF1..=0xF9 is 100..900 microseconds, all
/// other values are reserved and mapped to the minimum delay.
pub fn decode_st_min(st_min: u8) -> Duration {
    match st_min {
        0..=127 => Duration::from_millis(st_min as u64),
        0xF1..=0xF9 => Duration::from_micros((st_min - 0xF0) as u64 * 100),
        _ => timing::CF_DELAY,
    }
}

/// ISO-TP endpoint bound to one TX/RX arbitration id pair on a CAN bus.
pub struct IsoTpTransport {
    bus: Box<dyn CanBus>,
    tx_id: u32,
    rx_id: u32,
    /// Sender wait for Flow Control after a First Frame.
    pub n_bs: Duration,
    /// Receiver wait for each Consecutive Frame.
    pub n_cr: Duration,
    /// Minimum delay between transmitted consecutive frames.
    pub cf_delay: Duration,
}

impl IsoTpTransport {
    pub fn new(bus: Box<dyn CanBus>, tx_id: u32, rx_id: u32) -> Self {
        Self {
            bus,
            tx_id,
            rx_id,
            n_bs: timing::N_BS,
            n_cr: timing::N_CR,
            cf_delay: timing::CF_DELAY,
        }
    }

    pub fn tx_id(&self) -> u32 {
        self.tx_id
    }

    pub fn rx_id(&self) -> u32 {
        self.rx_id
    }

    /// Close the underlying bus.
    pub fn close(&mut self) -> Result<()> {
        self.bus.close()
    }

    /// Send one payload, segmenting as needed.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(FlashError::WriteFailure(
                "empty ISO-TP payload".to_string(),
            ));
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(FlashError::WriteFailure(format!(
                "payload of {} bytes exceeds ISO-TP maximum of {MAX_PAYLOAD}",
                payload.len()
            )));
        }

        if payload.len() <= 7 {
            self.send_single_frame(payload)
        } else {
            self.send_multi_frame(payload)
        }
    }

    fn send_single_frame(&mut self, payload: &[u8]) -> Result<()> {
        let mut data = vec![PCI_SINGLE | payload.len() as u8];
        data.extend_from_slice(payload);
        let frame = CanFrame::new(self.tx_id, &data)?;
        trace!("TX SF {:02X?}", frame.padded());
        self.bus.send(&frame)
    }

    fn send_multi_frame(&mut self, payload: &[u8]) -> Result<()> {
        let total = payload.len();

        // First Frame carries the 12-bit length and the first 6 bytes.
        let mut data = vec![
            PCI_FIRST | ((total >> 8) & 0x0F) as u8,
            (total & 0xFF) as u8,
        ];
        data.extend_from_slice(&payload[..6]);
        let frame = CanFrame::new(self.tx_id, &data)?;
        trace!("TX FF len={total} {:02X?}", frame.padded());
        self.bus.send(&frame)?;

        let (mut block_size, mut st_min) = self.await_continue_to_send()?;
        let mut separation = decode_st_min(st_min).max(self.cf_delay);

        let mut offset = 6;
        let mut seq = 1u8;
        let mut frames_in_block = 0u32;

        while offset < total {
            // Block exhausted: wait for the next Flow Control.
            if block_size > 0 && frames_in_block >= block_size as u32 {
                let (bs, st) = self.await_continue_to_send()?;
                block_size = bs;
                st_min = st;
                separation = decode_st_min(st_min).max(self.cf_delay);
                frames_in_block = 0;
            }

            let end = (offset + 7).min(total);
            let mut data = vec![PCI_CONSECUTIVE | (seq & 0x0F)];
            data.extend_from_slice(&payload[offset..end]);
            let frame = CanFrame::new(self.tx_id, &data)?;
            trace!("TX CF seq={seq} {:02X?}", frame.padded());
            self.bus.send(&frame)?;

            offset = end;
            seq = (seq + 1) & 0x0F;
            frames_in_block += 1;

            if offset < total && !separation.is_zero() {
                std::thread::sleep(separation);
            }
        }
        Ok(())
    }

    /// Wait for a Flow Control and resolve Wait states. Returns the
    /// (block_size, st_min) of the ContinueToSend that ends the wait.
    fn await_continue_to_send(&mut self) -> Result<(u8, u8)> {
        loop {
            let Some((status, block_size, st_min)) = self.wait_for_flow_control()? else {
                return Err(FlashError::IsoTpTimeout("flow control"));
            };
            match status {
                FlowStatus::ContinueToSend => return Ok((block_size, st_min)),
                FlowStatus::Wait => {
                    debug!("flow control Wait, re-waiting for next FC");
                    continue;
                }
                FlowStatus::Overflow => return Err(FlashError::IsoTpOverflow),
            }
        }
    }

    fn wait_for_flow_control(&mut self) -> Result<Option<(FlowStatus, u8, u8)>> {
        let deadline = Instant::now() + self.n_bs;
        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!("flow control timeout after {:?}", self.n_bs);
                return Ok(None);
            }
            let slice = (deadline - now).min(Duration::from_millis(100));
            let Some(frame) = self.bus.recv(slice)? else {
                continue;
            };
            if frame.id != self.rx_id || frame.data.is_empty() {
                continue;
            }
            if frame.data[0] & 0xF0 == PCI_FLOW_CONTROL {
                let status = FlowStatus::from_nibble(frame.data[0] & 0x0F);
                let block_size = frame.data.get(1).copied().unwrap_or(0);
                let st_min = frame.data.get(2).copied().unwrap_or(0);
                trace!(
                    "RX FC status={status:?} BS={block_size} STmin=0x{st_min:02X}"
                );
                let Some(status) = status else {
                    warn!("reserved flow control status, treating as timeout");
                    return Ok(None);
                };
                return Ok(Some((status, block_size, st_min)));
            }
            // Anything else while waiting for FC is unexpected; discard.
            trace!("discarding non-FC frame while awaiting flow control");
        }
    }

    fn send_flow_control(&mut self, status: u8, block_size: u8, st_min: u8) -> Result<()> {
        let data = [PCI_FLOW_CONTROL | (status & 0x0F), block_size, st_min];
        let frame = CanFrame::new(self.tx_id, &data)?;
        trace!("TX FC {:02X?}", frame.padded());
        self.bus.send(&frame)
    }

    /// Receive one complete payload, or `None` if nothing complete arrives
    /// within the timeout. Frames from other arbitration ids are discarded
    /// without error.
    pub fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = (deadline - now).min(Duration::from_millis(100));
            let Some(frame) = self.bus.recv(slice)? else {
                continue;
            };
            if frame.id != self.rx_id || frame.data.is_empty() {
                continue;
            }

            match frame.data[0] & 0xF0 {
                PCI_SINGLE => {
                    let len = (frame.data[0] & 0x0F) as usize;
                    if len == 0 || len > 7 || frame.data.len() <= len {
                        warn!("malformed single frame, length nibble {len}");
                        continue;
                    }
                    trace!("RX SF {:02X?}", frame.data);
                    return Ok(Some(frame.data[1..1 + len].to_vec()));
                }
                PCI_FIRST => {
                    if frame.data.len() < 2 {
                        warn!("malformed first frame, missing length byte");
                        continue;
                    }
                    return self.recv_multi_frame(&frame).map(Some);
                }
                // Stray CF or FC with no transfer in progress.
                _ => {
                    trace!("discarding unexpected frame {:02X?}", frame.data);
                    continue;
                }
            }
        }
    }

    /// Reassemble a multi-frame message after its First Frame.
    fn recv_multi_frame(&mut self, first: &CanFrame) -> Result<Vec<u8>> {
        let total = (((first.data[0] & 0x0F) as usize) << 8) | first.data[1] as usize;
        let mut payload: Vec<u8> = first.data[2..].to_vec();
        payload.truncate(total);
        trace!("RX FF len={total}");

        // Tell the sender to stream everything without pauses.
        self.send_flow_control(0x00, 0, 0)?;

        let mut expected_seq = 1u8;
        let mut cf_deadline = Instant::now() + self.n_cr;

        while payload.len() < total {
            let now = Instant::now();
            if now >= cf_deadline {
                warn!(
                    "consecutive frame timeout with {}/{} bytes",
                    payload.len(),
                    total
                );
                return Err(FlashError::IsoTpTimeout("consecutive frame"));
            }
            let slice = (cf_deadline - now).min(Duration::from_millis(100));
            let Some(frame) = self.bus.recv(slice)? else {
                continue;
            };
            if frame.id != self.rx_id || frame.data.is_empty() {
                continue;
            }
            if frame.data[0] & 0xF0 != PCI_CONSECUTIVE {
                trace!("discarding non-CF frame mid-reassembly");
                continue;
            }

            let seq = frame.data[0] & 0x0F;
            if seq != expected_seq {
                // Tolerated: some ECUs skip or repeat sequence numbers.
                warn!("CF sequence mismatch: expected {expected_seq}, got {seq}");
            }

            let remaining = total - payload.len();
            let take = remaining.min(7).min(frame.data.len() - 1);
            payload.extend_from_slice(&frame.data[1..1 + take]);
            trace!("RX CF seq={seq} {}/{} bytes", payload.len(), total);

            expected_seq = (expected_seq + 1) & 0x0F;
            cf_deadline = Instant::now() + self.n_cr;
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEcu;

    fn transport(ecu: &MockEcu) -> IsoTpTransport {
        let mut tp = IsoTpTransport::new(Box::new(ecu.clone()), 0x6F1, 0x6F9);
        // Keep test latency low.
        tp.n_bs = Duration::from_millis(50);
        tp.n_cr = Duration::from_millis(50);
        tp.cf_delay = Duration::ZERO;
        tp
    }

    /// Echo handler: replies with the request payload unchanged.
    fn echo_ecu() -> MockEcu {
        MockEcu::new(|req| vec![req.to_vec()])
    }

    #[test]
    fn test_st_min_decoding() {
        assert_eq!(decode_st_min(0), Duration::from_millis(0));
        assert_eq!(decode_st_min(10), Duration::from_millis(10));
        assert_eq!(decode_st_min(127), Duration::from_millis(127));
        assert_eq!(decode_st_min(0xF1), Duration::from_micros(100));
        assert_eq!(decode_st_min(0xF9), Duration::from_micros(900));
        // Reserved values fall back to the minimum delay.
        assert_eq!(decode_st_min(0x80), timing::CF_DELAY);
        assert_eq!(decode_st_min(0xFA), timing::CF_DELAY);
    }

    #[test]
    fn test_single_frame_round_trip() {
        let ecu = echo_ecu();
        let mut tp = transport(&ecu);

        tp.send(&[0x3E, 0x00]).unwrap();
        let resp = tp.recv(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(resp, vec![0x3E, 0x00]);

        let frames = ecu.sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, vec![0x02, 0x3E, 0x00]);
    }

    #[test]
    fn test_multi_frame_round_trip_all_lengths() {
        // Lengths crossing the SF/FF boundary and a couple of large ones.
        for len in [1usize, 6, 7, 8, 13, 14, 62, 200, 4095] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let ecu = echo_ecu();
            let mut tp = transport(&ecu);

            tp.send(&payload).unwrap();
            let resp = tp
                .recv(Duration::from_millis(500))
                .unwrap()
                .unwrap_or_else(|| panic!("no response for len {len}"));
            assert_eq!(resp, payload, "round trip failed for len {len}");
        }
    }

    #[test]
    fn test_multi_frame_wire_layout() {
        // 20-byte payload: service 0x36, block 0x01, with
        // 18 data bytes 0x02..0x13.
        let payload: Vec<u8> = {
            let mut p = vec![0x36, 0x01];
            p.extend(0x02..=0x13u8);
            p
        };
        assert_eq!(payload.len(), 20);

        let ecu = echo_ecu();
        let mut tp = transport(&ecu);
        tp.send(&payload).unwrap();

        let frames = ecu.sent_frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames[0].padded(),
            [0x14, 0x01, 0x36, 0x01, 0x02, 0x03, 0x04, 0x05]
        );
        assert_eq!(
            frames[1].padded(),
            [0x21, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C]
        );
        assert_eq!(
            frames[2].padded(),
            [0x22, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13]
        );
    }

    #[test]
    fn test_block_size_is_honored() {
        // 62 bytes: FF carries 6, then 8 CFs carry the remaining 56.
        let payload: Vec<u8> = (0..62).collect();
        let ecu = echo_ecu();
        ecu.set_flow_control(3, 0);
        let mut tp = transport(&ecu);

        tp.send(&payload).unwrap();
        let resp = tp.recv(Duration::from_millis(500)).unwrap().unwrap();
        assert_eq!(resp, payload);

        // All 9 request frames made it out in order despite the blocks.
        let cf_count = ecu
            .sent_frames()
            .iter()
            .filter(|f| f.data[0] & 0xF0 == 0x20)
            .count();
        assert_eq!(cf_count, 8);
    }

    #[test]
    fn test_sequence_numbers_cycle() {
        // 120 bytes => FF(6) + 17 CFs, sequence must wrap 15 -> 0 -> 1.
        let payload: Vec<u8> = (0..120).map(|i| i as u8).collect();
        let ecu = echo_ecu();
        let mut tp = transport(&ecu);
        tp.send(&payload).unwrap();

        let seqs: Vec<u8> = ecu
            .sent_frames()
            .iter()
            .filter(|f| f.data[0] & 0xF0 == 0x20)
            .map(|f| f.data[0] & 0x0F)
            .collect();
        for (k, seq) in seqs.iter().enumerate() {
            assert_eq!(*seq as usize, (k + 1) % 16);
        }
    }

    #[test]
    fn test_flow_control_wait_then_continue() {
        let payload: Vec<u8> = (0..20).collect();
        let ecu = echo_ecu();
        // Two Waits, then ContinueToSend.
        ecu.script_fc_statuses(&[0x01, 0x01, 0x00]);
        let mut tp = transport(&ecu);

        tp.send(&payload).unwrap();
        let resp = tp.recv(Duration::from_millis(200)).unwrap().unwrap();
        assert_eq!(resp, payload);
    }

    #[test]
    fn test_flow_control_overflow_aborts() {
        let payload: Vec<u8> = (0..20).collect();
        let ecu = echo_ecu();
        ecu.script_fc_statuses(&[0x02]);
        let mut tp = transport(&ecu);

        let err = tp.send(&payload).unwrap_err();
        assert_eq!(err.kind(), "IsoTpOverflow");
        // FF went out, but no consecutive frames followed.
        let cf_count = ecu
            .sent_frames()
            .iter()
            .filter(|f| f.data[0] & 0xF0 == 0x20)
            .count();
        assert_eq!(cf_count, 0);
    }

    #[test]
    fn test_missing_flow_control_times_out() {
        // ECU that never answers anything.
        let ecu = MockEcu::new(|_| vec![]);
        // Suppress the FC the mock would send for a FF by using a foreign
        // listening id; the mock then ignores our frames entirely.
        let mut tp = IsoTpTransport::new(Box::new(ecu.clone()), 0x123, 0x6F9);
        tp.n_bs = Duration::from_millis(20);
        tp.cf_delay = Duration::ZERO;

        let payload: Vec<u8> = (0..20).collect();
        let err = tp.send(&payload).unwrap_err();
        assert_eq!(err.kind(), "IsoTpTimeout");
    }

    #[test]
    fn test_recv_discards_foreign_ids() {
        let ecu = echo_ecu();
        ecu.inject_frame(CanFrame {
            id: 0x612,
            data: vec![0x02, 0x7E, 0x00],
        });
        ecu.inject_frame(CanFrame {
            id: 0x6F9,
            data: vec![0x02, 0x50, 0x02],
        });
        let mut tp = transport(&ecu);

        let resp = tp.recv(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(resp, vec![0x50, 0x02]);
    }

    #[test]
    fn test_recv_timeout_returns_none() {
        let ecu = MockEcu::new(|_| vec![]);
        let mut tp = transport(&ecu);
        let resp = tp.recv(Duration::from_millis(20)).unwrap();
        assert!(resp.is_none());
    }

    #[test]
    fn test_recv_sends_flow_control_for_first_frame() {
        let ecu = MockEcu::new(|req| {
            // Respond with 10 bytes so the ECU sends FF + CF.
            let mut resp = vec![req[0] + 0x40];
            resp.extend_from_slice(&[0u8; 9]);
            vec![resp]
        });
        let mut tp = transport(&ecu);
        tp.send(&[0x22, 0xF1, 0x90]).unwrap();
        let resp = tp.recv(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(resp.len(), 10);
        assert_eq!(resp[0], 0x62);

        // The tester answered the FF with ContinueToSend, BS=0, STmin=0.
        let fc: Vec<_> = ecu
            .sent_frames()
            .into_iter()
            .filter(|f| f.data[0] & 0xF0 == 0x30)
            .collect();
        assert_eq!(fc.len(), 1);
        assert_eq!(&fc[0].data[..3], &[0x30, 0x00, 0x00]);
    }

    #[test]
    fn test_payload_bounds() {
        let ecu = echo_ecu();
        let mut tp = transport(&ecu);
        assert!(tp.send(&[]).is_err());
        let too_big = vec![0u8; MAX_PAYLOAD + 1];
        assert!(tp.send(&too_big).is_err());
    }
}
