//! CAN frame I/O
//!
//! Wraps interface-specific CAN drivers behind the [`CanBus`] trait. Two
//! backends are provided: native SocketCAN (Linux) and the K+DCAN cable,
//! whose FTDI firmware bridges raw CAN frames over a serial port.
//!
//! There is no stub or mock fallback here: if the hardware cannot be
//! opened, [`open_bus`] returns an error and the operation fails closed.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::constants::can as can_const;
use crate::error::{FlashError, Result};

/// A classical CAN frame with an 11-bit arbitration id and up to 8 data
/// bytes. Frames are padded with 0x00 to 8 bytes on transmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Create a frame, validating the 11-bit id and data length.
    pub fn new(id: u32, data: &[u8]) -> Result<Self> {
        if id > 0x7FF {
            return Err(FlashError::WriteFailure(format!(
                "CAN id 0x{id:X} does not fit in 11 bits"
            )));
        }
        if data.len() > can_const::FRAME_LEN {
            return Err(FlashError::WriteFailure(format!(
                "CAN data length {} exceeds 8 bytes",
                data.len()
            )));
        }
        Ok(Self {
            id,
            data: data.to_vec(),
        })
    }

    /// Data padded to the full 8-byte frame length.
    pub fn padded(&self) -> [u8; 8] {
        let mut out = [can_const::PADDING; 8];
        out[..self.data.len()].copy_from_slice(&self.data);
        out
    }
}

/// Interface-agnostic CAN bus. Single-producer/single-consumer per bus;
/// higher layers serialize access at the UDS-transaction boundary.
pub trait CanBus: Send + std::fmt::Debug {
    /// Transmit one frame, padded to 8 bytes.
    fn send(&mut self, frame: &CanFrame) -> Result<()>;

    /// Receive the next frame, or `None` if the timeout expires.
    fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>>;

    /// Release the underlying device. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Open a CAN bus by interface type.
///
/// Supported interfaces:
/// - `"socketcan"`: native Linux CAN, `channel` is the netdev name (`can0`).
///   The bitrate is configured on the netdev, not here.
/// - `"kdcan"`: K+DCAN cable in D-CAN mode, `channel` is the serial port.
pub fn open_bus(interface: &str, channel: &str, bitrate: u32) -> Result<Box<dyn CanBus>> {
    match interface {
        "socketcan" => {
            #[cfg(target_os = "linux")]
            {
                Ok(Box::new(SocketCanBus::open(channel)?))
            }
            #[cfg(not(target_os = "linux"))]
            {
                let _ = bitrate;
                Err(FlashError::BusOpen {
                    interface: interface.to_string(),
                    channel: channel.to_string(),
                    detail: "SocketCAN is only available on Linux".to_string(),
                })
            }
        }
        "kdcan" => Ok(Box::new(KdcanBridge::open(channel, bitrate)?)),
        other => Err(FlashError::BusOpen {
            interface: other.to_string(),
            channel: channel.to_string(),
            detail: "unknown CAN interface (expected 'socketcan' or 'kdcan')".to_string(),
        }),
    }
}

// ============================================================================
// SOCKETCAN BACKEND (Linux)
// ============================================================================

#[cfg(target_os = "linux")]
pub use self::linux::SocketCanBus;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use socketcan::{CanFrame as RawFrame, CanSocket, EmbeddedFrame, Id, Socket, StandardId};

    /// SocketCAN bus. The netdev must already be up at the right bitrate
    /// (`ip link set can0 up type can bitrate 500000`).
    #[derive(Debug)]
    pub struct SocketCanBus {
        socket: Option<CanSocket>,
        channel: String,
    }

    impl SocketCanBus {
        pub fn open(channel: &str) -> Result<Self> {
            let socket = CanSocket::open(channel).map_err(|e| FlashError::BusOpen {
                interface: "socketcan".to_string(),
                channel: channel.to_string(),
                detail: e.to_string(),
            })?;
            info!("SocketCAN bus opened on {channel}");
            Ok(Self {
                socket: Some(socket),
                channel: channel.to_string(),
            })
        }

        fn socket(&self) -> Result<&CanSocket> {
            self.socket
                .as_ref()
                .ok_or_else(|| FlashError::WriteFailure("CAN bus already closed".to_string()))
        }
    }

    impl CanBus for SocketCanBus {
        fn send(&mut self, frame: &CanFrame) -> Result<()> {
            let id = StandardId::new(frame.id as u16).ok_or_else(|| {
                FlashError::WriteFailure(format!("CAN id 0x{:X} out of standard range", frame.id))
            })?;
            let raw = RawFrame::new(id, &frame.padded()).ok_or_else(|| {
                FlashError::WriteFailure("failed to build SocketCAN frame".to_string())
            })?;
            debug!("TX 0x{:03X} {:02X?}", frame.id, frame.padded());
            self.socket()?.write_frame(&raw).map_err(FlashError::BusIo)
        }

        fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
            let socket = self.socket()?;
            match socket.read_frame_timeout(timeout) {
                Ok(raw) => {
                    let id = match raw.id() {
                        Id::Standard(sid) => sid.as_raw() as u32,
                        Id::Extended(eid) => eid.as_raw(),
                    };
                    debug!("RX 0x{:03X} {:02X?}", id, raw.data());
                    Ok(Some(CanFrame {
                        id,
                        data: raw.data().to_vec(),
                    }))
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    Ok(None)
                }
                Err(e) => Err(FlashError::BusIo(e)),
            }
        }

        fn close(&mut self) -> Result<()> {
            if self.socket.take().is_some() {
                info!("SocketCAN bus on {} closed", self.channel);
            }
            Ok(())
        }
    }
}

// ============================================================================
// K+DCAN SERIAL BRIDGE BACKEND
// ============================================================================

/// K+DCAN cable in D-CAN mode.
///
/// The cable's FTDI firmware bridges CAN to serial. Mode selection is on
/// the RTS pin (RTS=1 selects D-CAN at 500 kbaud) and frames travel as
/// 11-byte records: `[LEN] [ID_HI] [ID_LO] [DATA x 8]`.
#[derive(Debug)]
pub struct KdcanBridge {
    port: Option<Box<dyn serialport::SerialPort>>,
    channel: String,
    rx_buf: Vec<u8>,
}

/// Serial record length for one bridged CAN frame.
const BRIDGE_RECORD_LEN: usize = 11;

/// Value of the leading length byte expected by the cable firmware.
const BRIDGE_LEN_BYTE: u8 = 12;

impl KdcanBridge {
    pub fn open(channel: &str, bitrate: u32) -> Result<Self> {
        let mut port = serialport::new(channel, bitrate)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| FlashError::BusOpen {
                interface: "kdcan".to_string(),
                channel: channel.to_string(),
                detail: e.to_string(),
            })?;

        // RTS high selects D-CAN mode on the cable
        port.write_request_to_send(true)
            .map_err(|e| FlashError::BusOpen {
                interface: "kdcan".to_string(),
                channel: channel.to_string(),
                detail: format!("failed to set RTS: {e}"),
            })?;
        port.clear(serialport::ClearBuffer::All)
            .map_err(|e| FlashError::BusOpen {
                interface: "kdcan".to_string(),
                channel: channel.to_string(),
                detail: format!("failed to clear buffers: {e}"),
            })?;
        std::thread::sleep(Duration::from_millis(100));

        info!("K+DCAN bridge opened on {channel} in D-CAN mode at {bitrate} baud");
        Ok(Self {
            port: Some(port),
            channel: channel.to_string(),
            rx_buf: Vec::new(),
        })
    }

    fn port(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| FlashError::WriteFailure("CAN bus already closed".to_string()))
    }

    /// Pop one complete bridged frame out of the receive buffer, if any.
    fn pop_record(&mut self) -> Option<CanFrame> {
        if self.rx_buf.len() < BRIDGE_RECORD_LEN {
            return None;
        }
        let record: Vec<u8> = self.rx_buf.drain(..BRIDGE_RECORD_LEN).collect();
        let id = ((record[1] as u32) << 8) | (record[2] as u32);
        Some(CanFrame {
            id,
            data: record[3..11].to_vec(),
        })
    }
}

impl CanBus for KdcanBridge {
    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let mut record = Vec::with_capacity(BRIDGE_RECORD_LEN);
        record.push(BRIDGE_LEN_BYTE);
        record.push(((frame.id >> 8) & 0xFF) as u8);
        record.push((frame.id & 0xFF) as u8);
        record.extend_from_slice(&frame.padded());

        debug!("TX 0x{:03X} {:02X?}", frame.id, frame.padded());
        let port = self.port()?;
        port.write_all(&record).map_err(FlashError::BusIo)?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        if let Some(frame) = self.pop_record() {
            return Ok(Some(frame));
        }

        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 64];
        loop {
            let n = {
                let port = self.port()?;
                match port.read(&mut chunk) {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
                    Err(e) => return Err(FlashError::BusIo(e)),
                }
            };
            if n > 0 {
                self.rx_buf.extend_from_slice(&chunk[..n]);
                if let Some(frame) = self.pop_record() {
                    debug!("RX 0x{:03X} {:02X?}", frame.id, frame.data);
                    return Ok(Some(frame));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            info!("K+DCAN bridge on {} closed", self.channel);
        }
        Ok(())
    }
}
