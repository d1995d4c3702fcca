// Transport-level wire messages: handshake, heartbeat and data frames.
//
// Layouts:
//   HANDSHAKE_REQUEST : utf8 protocol, bytes login
//   HANDSHAKE_ACCEPT  : i32 hbIntervalMs, i32 hbLossThreshold, u8 hbDisabled
//   HANDSHAKE_REJECT  : utf8 reason
//   HEARTBEAT         : (empty)
//   DATA              : raw payload

use crate::error::{ClusterError, Result};
use crate::network::frame::{FrameReader, FrameWriter};
use bytes::Bytes;
use std::time::Duration;

pub mod frame_type {
    pub const HANDSHAKE_REQUEST: u8 = 1;
    pub const HANDSHAKE_ACCEPT: u8 = 2;
    pub const HANDSHAKE_REJECT: u8 = 3;
    pub const HEARTBEAT: u8 = 4;
    pub const DATA: u8 = 5;
}

/// Heartbeat parameters granted by the accepting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatParams {
    pub interval: Duration,
    pub loss_threshold: u32,
    pub disabled: bool,
}

impl HeartbeatParams {
    pub fn read_idle_timeout(&self) -> Duration {
        self.interval * self.loss_threshold.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    HandshakeRequest { protocol: String, login: Bytes },
    HandshakeAccept(HeartbeatParams),
    HandshakeReject { reason: String },
    Heartbeat,
    Data(Bytes),
}

impl TransportFrame {
    pub fn encode(&self) -> Bytes {
        match self {
            TransportFrame::HandshakeRequest { protocol, login } => {
                let mut w = FrameWriter::new();
                w.write_str(protocol);
                w.write_bytes(login);
                w.finish(frame_type::HANDSHAKE_REQUEST)
            }
            TransportFrame::HandshakeAccept(params) => {
                let mut w = FrameWriter::new();
                w.write_i32(params.interval.as_millis() as i32);
                w.write_i32(params.loss_threshold as i32);
                w.write_bool(params.disabled);
                w.finish(frame_type::HANDSHAKE_ACCEPT)
            }
            TransportFrame::HandshakeReject { reason } => {
                let mut w = FrameWriter::new();
                w.write_str(reason);
                w.finish(frame_type::HANDSHAKE_REJECT)
            }
            TransportFrame::Heartbeat => FrameWriter::new().finish(frame_type::HEARTBEAT),
            TransportFrame::Data(payload) => {
                let mut w = FrameWriter::new();
                w.write_raw(payload);
                w.finish(frame_type::DATA)
            }
        }
    }

    pub fn decode(frame_type: u8, body: Bytes) -> Result<Self> {
        let mut r = FrameReader::new(body);
        match frame_type {
            frame_type::HANDSHAKE_REQUEST => {
                let protocol = r.read_str()?;
                let login = r.read_bytes()?;
                Ok(TransportFrame::HandshakeRequest { protocol, login })
            }
            frame_type::HANDSHAKE_ACCEPT => {
                let interval_ms = r.read_i32()?;
                if interval_ms < 0 {
                    return Err(ClusterError::Codec(format!(
                        "negative heartbeat interval: {}",
                        interval_ms
                    )));
                }
                let loss_threshold = r.read_i32()?;
                let disabled = r.read_bool()?;
                Ok(TransportFrame::HandshakeAccept(HeartbeatParams {
                    interval: Duration::from_millis(interval_ms as u64),
                    loss_threshold: loss_threshold.max(1) as u32,
                    disabled,
                }))
            }
            frame_type::HANDSHAKE_REJECT => {
                let reason = r.read_str()?;
                Ok(TransportFrame::HandshakeReject { reason })
            }
            frame_type::HEARTBEAT => Ok(TransportFrame::Heartbeat),
            frame_type::DATA => Ok(TransportFrame::Data(r.read_remaining())),
            other => Err(ClusterError::Codec(format!(
                "unknown transport frame type: {}",
                other
            ))),
        }
    }
}
