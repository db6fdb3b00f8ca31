//! Test doubles for CAN-level tests.
//!
//! [`MockEcu`] is a scripted ECU sitting on an in-memory [`CanBus`]. It
//! reassembles ISO-TP requests from the tester, answers through a handler
//! closure, and segments responses back into frames, including the Flow
//! Control handshake for multi-frame requests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::can::{CanBus, CanFrame};
use crate::error::Result;

/// Install the test log subscriber once; respects `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Responses a handler can produce for one request. Each payload is sent
/// as its own ISO-TP message, in order (e.g. several `7F xx 78` pending
/// responses followed by the final positive response).
pub type Responses = Vec<Vec<u8>>;

struct MockEcuInner {
    tx_id: u32,
    rx_id: u32,
    handler: Box<dyn FnMut(&[u8]) -> Responses + Send>,
    /// Every frame the tester transmitted, in order.
    sent: Vec<CanFrame>,
    outbox: VecDeque<CanFrame>,
    // Inbound multi-frame reassembly
    rx_payload: Vec<u8>,
    rx_expected: usize,
    rx_active: bool,
    // Flow control behavior toward the tester
    fc_block_size: u8,
    fc_st_min: u8,
    fc_statuses: VecDeque<u8>,
    cfs_since_fc: usize,
    closed: bool,
}

impl MockEcuInner {
    fn push_flow_control(&mut self) {
        let status = self.fc_statuses.pop_front().unwrap_or(0x00);
        self.outbox.push_back(CanFrame {
            id: self.rx_id,
            data: vec![0x30 | (status & 0x0F), self.fc_block_size, self.fc_st_min],
        });
    }

    /// Emit flow controls for a First Frame. A scripted Wait is followed
    /// by further scripted statuses until a non-Wait goes out, the way a
    /// busy ECU eventually sends ContinueToSend.
    fn push_flow_controls_for_first_frame(&mut self) {
        loop {
            let status = self.fc_statuses.pop_front().unwrap_or(0x00);
            self.outbox.push_back(CanFrame {
                id: self.rx_id,
                data: vec![0x30 | (status & 0x0F), self.fc_block_size, self.fc_st_min],
            });
            if status != 0x01 {
                break;
            }
        }
    }

    fn enqueue_response(&mut self, payload: &[u8]) {
        if payload.len() <= 7 {
            let mut data = vec![payload.len() as u8];
            data.extend_from_slice(payload);
            self.outbox.push_back(CanFrame {
                id: self.rx_id,
                data,
            });
            return;
        }

        let total = payload.len();
        let mut data = vec![0x10 | ((total >> 8) & 0x0F) as u8, (total & 0xFF) as u8];
        data.extend_from_slice(&payload[..6]);
        self.outbox.push_back(CanFrame {
            id: self.rx_id,
            data,
        });

        let mut offset = 6;
        let mut seq = 1u8;
        while offset < total {
            let end = (offset + 7).min(total);
            let mut data = vec![0x20 | (seq & 0x0F)];
            data.extend_from_slice(&payload[offset..end]);
            self.outbox.push_back(CanFrame {
                id: self.rx_id,
                data,
            });
            offset = end;
            seq = (seq + 1) & 0x0F;
        }
    }

    fn complete_request(&mut self, payload: Vec<u8>) {
        let responses = (self.handler)(&payload);
        for response in responses {
            self.enqueue_response(&response);
        }
    }

    fn handle_frame(&mut self, frame: &CanFrame) {
        if frame.id != self.tx_id || frame.data.is_empty() {
            return;
        }
        let pci = frame.data[0];
        match pci & 0xF0 {
            0x00 => {
                let len = (pci & 0x0F) as usize;
                if len >= 1 && frame.data.len() > len {
                    let payload = frame.data[1..1 + len].to_vec();
                    self.complete_request(payload);
                }
            }
            0x10 => {
                let total = (((pci & 0x0F) as usize) << 8) | frame.data[1] as usize;
                self.rx_payload = frame.data[2..8.min(frame.data.len())].to_vec();
                self.rx_payload.truncate(total);
                self.rx_expected = total;
                self.rx_active = true;
                self.cfs_since_fc = 0;
                self.push_flow_controls_for_first_frame();
            }
            0x20 => {
                if self.rx_active {
                    let remaining = self.rx_expected - self.rx_payload.len();
                    let take = remaining.min(7).min(frame.data.len().saturating_sub(1));
                    self.rx_payload
                        .extend_from_slice(&frame.data[1..1 + take]);
                    self.cfs_since_fc += 1;
                    if self.rx_payload.len() >= self.rx_expected {
                        self.rx_active = false;
                        let payload = std::mem::take(&mut self.rx_payload);
                        self.complete_request(payload);
                    } else if self.fc_block_size > 0
                        && self.cfs_since_fc == self.fc_block_size as usize
                    {
                        self.cfs_since_fc = 0;
                        self.push_flow_control();
                    }
                }
            }
            // Tester flow control for our own multi-frame responses: the
            // consecutive frames are already queued, nothing to do.
            0x30 => {}
            _ => {}
        }
    }
}

/// Clonable handle to the mock ECU; clones share state so tests can keep
/// one handle for inspection while the transport owns another.
#[derive(Clone)]
pub struct MockEcu(Arc<Mutex<MockEcuInner>>);

impl std::fmt::Debug for MockEcu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEcu").finish_non_exhaustive()
    }
}

impl MockEcu {
    pub fn new<H>(handler: H) -> Self
    where
        H: FnMut(&[u8]) -> Responses + Send + 'static,
    {
        Self(Arc::new(Mutex::new(MockEcuInner {
            tx_id: crate::constants::can::ECU_TX_ID,
            rx_id: crate::constants::can::ECU_RX_ID,
            handler: Box::new(handler),
            sent: Vec::new(),
            outbox: VecDeque::new(),
            rx_payload: Vec::new(),
            rx_expected: 0,
            rx_active: false,
            fc_block_size: 0,
            fc_st_min: 0,
            fc_statuses: VecDeque::new(),
            cfs_since_fc: 0,
            closed: false,
        })))
    }

    /// Flow control parameters advertised to the tester on multi-frame
    /// requests.
    pub fn set_flow_control(&self, block_size: u8, st_min: u8) {
        let mut inner = self.0.lock().unwrap();
        inner.fc_block_size = block_size;
        inner.fc_st_min = st_min;
    }

    /// Script the statuses of successive Flow Control frames (0x00 CTS,
    /// 0x01 Wait, 0x02 Overflow). Unscripted FCs are ContinueToSend.
    pub fn script_fc_statuses(&self, statuses: &[u8]) {
        let mut inner = self.0.lock().unwrap();
        inner.fc_statuses = statuses.iter().copied().collect();
    }

    /// Inject a raw frame the ECU will send unprompted.
    pub fn inject_frame(&self, frame: CanFrame) {
        self.0.lock().unwrap().outbox.push_back(frame);
    }

    /// All frames the tester transmitted, in order.
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.0.lock().unwrap().sent.clone()
    }

    /// Number of frames the tester transmitted.
    pub fn sent_count(&self) -> usize {
        self.0.lock().unwrap().sent.len()
    }

    pub fn is_closed(&self) -> bool {
        self.0.lock().unwrap().closed
    }
}

// ============================================================================
// SCRIPTED DME SIMULATOR
// ============================================================================

/// State of the simulated DME behind [`sim_dme`].
pub struct SimState {
    /// Flat address space covering flash (0x800000..) and NVRAM (0x1F0000..).
    pub mem: Vec<u8>,
    /// Battery voltage in 0.1 V units for DID 0xF405.
    pub battery_dv: u16,
    pub vin: &'static [u8],
    /// Make the ECU-side checksum routine (0xFF01) report a failure.
    pub fail_checksum_routine: bool,
    pub session: u8,
    pub unlocked: bool,
    download: Option<Download>,
}

struct Download {
    address: u32,
    size: u32,
    received: u32,
}

/// Address space size for the simulator: covers 0x000000..0xA00000.
const SIM_MEM_SIZE: usize = 0xA0_0000;

/// A DME that answers the full programming flow: sessions, the standard
/// seed/key exchange, battery DID, routines, download/transfer/exit,
/// memory reads, and soft reset. Returns the bus plus shared state for
/// inspection and fault injection.
pub fn sim_dme() -> (MockEcu, Arc<Mutex<SimState>>) {
    let state = Arc::new(Mutex::new(SimState {
        mem: vec![0u8; SIM_MEM_SIZE],
        battery_dv: 138,
        vin: b"WBANU53558B316063",
        fail_checksum_routine: false,
        session: 0x01,
        unlocked: false,
        download: None,
    }));

    let shared = state.clone();
    let ecu = MockEcu::new(move |req| {
        let mut guard = shared.lock().unwrap();
        let st = &mut *guard;
        let resp: Vec<u8> = match req[0] {
            0x10 => {
                st.session = req[1];
                vec![0x50, req[1]]
            }
            0x11 => vec![0x51, req[1]],
            0x27 => match req[1] {
                0x01 => vec![0x67, 0x01, 0x12, 0x34],
                0x02 => {
                    if req[2..] == [0xC7, 0x23] {
                        st.unlocked = true;
                        vec![0x67, 0x02]
                    } else {
                        vec![0x7F, 0x27, 0x35]
                    }
                }
                _ => vec![0x7F, 0x27, 0x12],
            },
            0x22 => {
                let did = u16::from_be_bytes([req[1], req[2]]);
                match did {
                    0xF405 => {
                        let dv = st.battery_dv.to_be_bytes();
                        vec![0x62, req[1], req[2], dv[0], dv[1]]
                    }
                    0xF190 => {
                        let mut r = vec![0x62, req[1], req[2]];
                        r.extend_from_slice(st.vin);
                        r
                    }
                    _ => vec![0x7F, 0x22, 0x31],
                }
            }
            0x23 => {
                let addr = u32::from_be_bytes([req[2], req[3], req[4], req[5]]) as usize;
                let size = u32::from_be_bytes([req[6], req[7], req[8], req[9]]) as usize;
                if addr + size <= st.mem.len() {
                    let mut r = vec![0x63];
                    r.extend_from_slice(&st.mem[addr..addr + size]);
                    r
                } else {
                    vec![0x7F, 0x23, 0x31]
                }
            }
            0x31 => {
                let routine = u16::from_be_bytes([req[2], req[3]]);
                let status = if routine == 0xFF01 && st.fail_checksum_routine {
                    0x01
                } else {
                    0x00
                };
                vec![0x71, req[1], req[2], req[3], status]
            }
            0x34 => {
                let addr = u32::from_be_bytes([req[3], req[4], req[5], req[6]]);
                let size = u32::from_be_bytes([req[7], req[8], req[9], req[10]]);
                st.download = Some(Download {
                    address: addr,
                    size,
                    received: 0,
                });
                // Max block length 2048
                vec![0x74, 0x20, 0x08, 0x00]
            }
            0x36 => match st.download.as_mut() {
                Some(dl) => {
                    let chunk = &req[2..];
                    let offset = (dl.address + dl.received) as usize;
                    let end = offset + chunk.len();
                    dl.received += chunk.len() as u32;
                    if dl.received > dl.size || end > SIM_MEM_SIZE {
                        vec![0x7F, 0x36, 0x71]
                    } else {
                        st.mem[offset..end].copy_from_slice(chunk);
                        vec![0x76, req[1]]
                    }
                }
                None => vec![0x7F, 0x36, 0x24],
            },
            0x37 => {
                st.download = None;
                vec![0x77]
            }
            0x3E => {
                let sub = req.get(1).copied().unwrap_or(0);
                if sub & 0x80 != 0 {
                    // Positive response suppressed
                    return vec![];
                }
                vec![0x7E, sub]
            }
            other => vec![0x7F, other, 0x11],
        };
        vec![resp]
    });

    (ecu, state)
}

impl CanBus for MockEcu {
    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let mut inner = self.0.lock().unwrap();
        inner.sent.push(frame.clone());
        inner.handle_frame(frame);
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        {
            let mut inner = self.0.lock().unwrap();
            if let Some(frame) = inner.outbox.pop_front() {
                return Ok(Some(frame));
            }
        }
        // Nothing queued; model an idle bus without spinning hot.
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        self.0.lock().unwrap().closed = true;
        Ok(())
    }
}
