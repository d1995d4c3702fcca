// Length-prefixed wire framing.
//
// Every frame is `u32 big-endian length | u8 type | body`; the length covers
// the type byte and the body. Bodies are built with `FrameWriter` and parsed
// with `FrameReader`: integers big-endian, strings and byte blocks prefixed
// with an i32 length.

use crate::error::{ClusterError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Builds one frame body.
#[derive(Debug, Default)]
pub struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn write_u128(&mut self, v: u128) {
        self.buf.put_u128(v);
    }

    pub fn write_str(&mut self, s: &str) {
        self.buf.put_i32(s.len() as i32);
        self.buf.put_slice(s.as_bytes());
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.buf.put_i32(b.len() as i32);
        self.buf.put_slice(b);
    }

    pub fn write_raw(&mut self, b: &[u8]) {
        self.buf.put_slice(b);
    }

    /// Finishes the body into a complete frame with the given type byte.
    pub fn finish(self, frame_type: u8) -> Bytes {
        encode_frame(frame_type, &self.buf)
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Parses one frame body.
#[derive(Debug)]
pub struct FrameReader {
    buf: Bytes,
}

impl FrameReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(ClusterError::Codec(format!(
                "frame underflow: need {} bytes, have {}",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn read_u128(&mut self) -> Result<u128> {
        self.need(16)?;
        Ok(self.buf.get_u128())
    }

    pub fn read_str(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ClusterError::Codec(format!("invalid UTF-8 string: {}", e)))
    }

    pub fn read_bytes(&mut self) -> Result<Bytes> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(ClusterError::Codec(format!("negative block length: {}", len)));
        }
        let len = len as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Remainder of the body, unframed.
    pub fn read_remaining(&mut self) -> Bytes {
        self.buf.split_to(self.buf.remaining())
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}

/// Assembles `length | type | body` into one contiguous buffer.
pub fn encode_frame(frame_type: u8, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(5 + body.len());
    out.put_u32(1 + body.len() as u32);
    out.put_u8(frame_type);
    out.put_slice(body);
    out.freeze()
}

/// Reads one complete frame from the stream.
pub async fn read_frame<R>(stream: &mut R, max_frame_size: usize) -> Result<(u8, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len == 0 {
        return Err(ClusterError::Codec("zero-length frame".to_string()));
    }
    if len > max_frame_size {
        return Err(ClusterError::Codec(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_frame_size
        )));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;

    let frame_type = body[0];
    let payload = Bytes::from(body).slice(1..);
    Ok((frame_type, payload))
}

/// Writes one already-encoded frame and flushes it.
pub async fn write_frame<W>(stream: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}
