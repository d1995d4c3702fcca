// Messaging wire protocol.
//
// Payload layouts on a channel connector:
//   REQUEST        : u32 correlation, u8 flags, [i32 affinity], bytes payload
//   NOTIFICATION   : u8 flags, [i32 affinity], bytes payload
//   RESPONSE_CHUNK : u32 correlation, bytes payload
//   RESPONSE_FINAL : u32 correlation, bytes payload
//   RESPONSE_ERROR : u32 correlation, utf8 stackTrace
//
// Correlation ids are 31-bit, locally unique per channel, and never reused
// across physical sends of one logical request.

use crate::error::{ClusterError, Result};
use crate::network::frame::{FrameReader, FrameWriter};
use bytes::Bytes;

mod msg_type {
    pub const REQUEST: u8 = 20;
    pub const NOTIFICATION: u8 = 21;
    pub const RESPONSE_CHUNK: u8 = 22;
    pub const RESPONSE_FINAL: u8 = 23;
    pub const RESPONSE_ERROR: u8 = 24;
}

const FLAG_AFFINITY: u8 = 0b0000_0001;

/// 32-bit FNV-1a over an application affinity key.
pub fn affinity_hash(key: &[u8]) -> i32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in key {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash as i32
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageFrame {
    Request {
        correlation: u32,
        affinity: Option<i32>,
        payload: Bytes,
    },
    Notification {
        affinity: Option<i32>,
        payload: Bytes,
    },
    Chunk {
        correlation: u32,
        payload: Bytes,
    },
    Final {
        correlation: u32,
        payload: Bytes,
    },
    Error {
        correlation: u32,
        stack_trace: String,
    },
}

impl MessageFrame {
    pub fn encode(&self) -> Bytes {
        let mut w = FrameWriter::new();
        match self {
            MessageFrame::Request {
                correlation,
                affinity,
                payload,
            } => {
                w.write_u8(msg_type::REQUEST);
                w.write_u32(*correlation);
                write_affinity(&mut w, affinity);
                w.write_bytes(payload);
            }
            MessageFrame::Notification { affinity, payload } => {
                w.write_u8(msg_type::NOTIFICATION);
                write_affinity(&mut w, affinity);
                w.write_bytes(payload);
            }
            MessageFrame::Chunk {
                correlation,
                payload,
            } => {
                w.write_u8(msg_type::RESPONSE_CHUNK);
                w.write_u32(*correlation);
                w.write_bytes(payload);
            }
            MessageFrame::Final {
                correlation,
                payload,
            } => {
                w.write_u8(msg_type::RESPONSE_FINAL);
                w.write_u32(*correlation);
                w.write_bytes(payload);
            }
            MessageFrame::Error {
                correlation,
                stack_trace,
            } => {
                w.write_u8(msg_type::RESPONSE_ERROR);
                w.write_u32(*correlation);
                w.write_str(stack_trace);
            }
        }
        w.into_bytes()
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut r = FrameReader::new(payload);
        match r.read_u8()? {
            msg_type::REQUEST => {
                let correlation = r.read_u32()?;
                let affinity = read_affinity(&mut r)?;
                let payload = r.read_bytes()?;
                Ok(MessageFrame::Request {
                    correlation,
                    affinity,
                    payload,
                })
            }
            msg_type::NOTIFICATION => {
                let affinity = read_affinity(&mut r)?;
                let payload = r.read_bytes()?;
                Ok(MessageFrame::Notification { affinity, payload })
            }
            msg_type::RESPONSE_CHUNK => Ok(MessageFrame::Chunk {
                correlation: r.read_u32()?,
                payload: r.read_bytes()?,
            }),
            msg_type::RESPONSE_FINAL => Ok(MessageFrame::Final {
                correlation: r.read_u32()?,
                payload: r.read_bytes()?,
            }),
            msg_type::RESPONSE_ERROR => Ok(MessageFrame::Error {
                correlation: r.read_u32()?,
                stack_trace: r.read_str()?,
            }),
            other => Err(ClusterError::Codec(format!(
                "unknown messaging frame type: {}",
                other
            ))),
        }
    }
}

fn write_affinity(w: &mut FrameWriter, affinity: &Option<i32>) {
    match affinity {
        Some(hash) => {
            w.write_u8(FLAG_AFFINITY);
            w.write_i32(*hash);
        }
        None => w.write_u8(0),
    }
}

fn read_affinity(r: &mut FrameReader) -> Result<Option<i32>> {
    let flags = r.read_u8()?;
    if flags & FLAG_AFFINITY != 0 {
        Ok(Some(r.read_i32()?))
    } else {
        Ok(None)
    }
}
