//! Frame structure and the incremental encoder/decoder.

use crate::error::{CodecError, CodecResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic prefix of every frame ("REEF").
pub const FRAME_MAGIC: u32 = 0x5245_4546;

/// Fixed header size preceding the body.
pub const FRAME_HEADER_LEN: usize = 12;

/// Response status carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Ok,
    NotFound,
    Busy,
    ServerError,
    /// Status code this client version does not know about
    Unknown(u16),
}

impl FrameStatus {
    pub fn to_u16(self) -> u16 {
        match self {
            FrameStatus::Ok => 0x0000,
            FrameStatus::NotFound => 0x0001,
            FrameStatus::Busy => 0x0002,
            FrameStatus::ServerError => 0x0003,
            FrameStatus::Unknown(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            0x0000 => FrameStatus::Ok,
            0x0001 => FrameStatus::NotFound,
            0x0002 => FrameStatus::Busy,
            0x0003 => FrameStatus::ServerError,
            other => FrameStatus::Unknown(other),
        }
    }

    /// Whether the operation itself succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, FrameStatus::Ok)
    }
}

/// One wire frame: envelope fields plus an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub flags: u8,
    pub status: FrameStatus,
    pub body: Bytes,
}

impl Frame {
    /// Set when this frame is a chunk of a multi-frame response and more
    /// frames for the same request follow.
    pub const FLAG_PARTIAL: u8 = 0x01;

    const FLAG_MASK: u8 = Self::FLAG_PARTIAL;

    /// Build a request frame (requests always carry `Ok` status).
    pub fn request(opcode: u8, body: Bytes) -> Self {
        Self {
            opcode,
            flags: 0,
            status: FrameStatus::Ok,
            body,
        }
    }

    /// Build a response frame.
    pub fn response(opcode: u8, status: FrameStatus, body: Bytes) -> Self {
        Self {
            opcode,
            flags: 0,
            status,
            body,
        }
    }

    /// Mark this frame as a non-final chunk.
    pub fn partial(mut self) -> Self {
        self.flags |= Self::FLAG_PARTIAL;
        self
    }

    pub fn is_partial(&self) -> bool {
        self.flags & Self::FLAG_PARTIAL != 0
    }
}

/// Append one encoded frame to `dst`.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    dst.reserve(FRAME_HEADER_LEN + frame.body.len());
    dst.put_u32(FRAME_MAGIC);
    dst.put_u8(frame.opcode);
    dst.put_u8(frame.flags);
    dst.put_u16(frame.status.to_u16());
    dst.put_u32(frame.body.len() as u32);
    dst.extend_from_slice(&frame.body);
}

/// Try to decode one frame from the front of `src`.
///
/// Returns `Ok(None)` when more bytes are needed. On a recoverable error the
/// offending frame has been consumed and decoding may continue; on an
/// unrecoverable one the buffer contents are undefined and the connection
/// must be closed.
pub fn decode_frame(src: &mut BytesMut, max_body_len: usize) -> CodecResult<Option<Frame>> {
    if src.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let mut header = &src[..FRAME_HEADER_LEN];
    let magic = header.get_u32();
    if magic != FRAME_MAGIC {
        return Err(CodecError::InvalidMagic {
            expected: FRAME_MAGIC,
            actual: magic,
        });
    }
    let opcode = header.get_u8();
    let flags = header.get_u8();
    let status = header.get_u16();
    let body_len = header.get_u32() as usize;

    if body_len > max_body_len {
        return Err(CodecError::OversizedFrame {
            size: body_len,
            max: max_body_len,
        });
    }
    if src.len() < FRAME_HEADER_LEN + body_len {
        // Incomplete; hint the allocator at the full frame size.
        src.reserve(FRAME_HEADER_LEN + body_len - src.len());
        return Ok(None);
    }

    src.advance(FRAME_HEADER_LEN);
    let body = src.split_to(body_len).freeze();

    if flags & !Frame::FLAG_MASK != 0 {
        return Err(CodecError::ReservedFlags { flags });
    }

    Ok(Some(Frame {
        opcode,
        flags,
        status: FrameStatus::from_u16(status),
        body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode;

    const MAX: usize = 1024 * 1024;

    #[test]
    fn roundtrip_single_frame() {
        let frame = Frame::request(opcode::GET, Bytes::from_static(b"key-1"));
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf);

        let decoded = decode_frame(&mut buf, MAX).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_frames_split_across_reads() {
        let frame = Frame::response(opcode::QUERY, FrameStatus::Ok, Bytes::from_static(b"row"));
        let mut encoded = BytesMut::new();
        encode_frame(&frame, &mut encoded);

        let mut buf = BytesMut::new();
        for chunk in encoded.chunks(5) {
            // Nothing decodable until the final chunk lands.
            buf.extend_from_slice(chunk);
            if buf.len() < FRAME_HEADER_LEN + frame.body.len() {
                assert_eq!(decode_frame(&mut buf, MAX).unwrap(), None);
            }
        }
        assert_eq!(decode_frame(&mut buf, MAX).unwrap(), Some(frame));
    }

    #[test]
    fn decodes_pipelined_frames() {
        let a = Frame::request(opcode::GET, Bytes::from_static(b"a"));
        let b = Frame::request(opcode::SET, Bytes::from_static(b"b"));
        let mut buf = BytesMut::new();
        encode_frame(&a, &mut buf);
        encode_frame(&b, &mut buf);

        assert_eq!(decode_frame(&mut buf, MAX).unwrap(), Some(a));
        assert_eq!(decode_frame(&mut buf, MAX).unwrap(), Some(b));
        assert_eq!(decode_frame(&mut buf, MAX).unwrap(), None);
    }

    #[test]
    fn bad_magic_is_unrecoverable() {
        let mut buf = BytesMut::from(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0, 0, 0, 0, 0][..]);
        let err = decode_frame(&mut buf, MAX).unwrap_err();
        assert!(matches!(err, CodecError::InvalidMagic { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn oversized_body_is_unrecoverable() {
        let frame = Frame::request(opcode::SET, Bytes::from(vec![0u8; 64]));
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf);

        let err = decode_frame(&mut buf, 16).unwrap_err();
        assert!(matches!(err, CodecError::OversizedFrame { size: 64, max: 16 }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn reserved_flags_fail_one_frame_only() {
        let mut bad = Frame::request(opcode::GET, Bytes::from_static(b"k"));
        bad.flags = 0x80;
        let good = Frame::request(opcode::GET, Bytes::from_static(b"k2"));

        let mut buf = BytesMut::new();
        encode_frame(&bad, &mut buf);
        encode_frame(&good, &mut buf);

        let err = decode_frame(&mut buf, MAX).unwrap_err();
        assert!(err.is_recoverable());
        // The stream stays aligned; the next frame decodes normally.
        assert_eq!(decode_frame(&mut buf, MAX).unwrap(), Some(good));
    }

    #[test]
    fn partial_flag_roundtrip() {
        let chunk = Frame::response(opcode::QUERY, FrameStatus::Ok, Bytes::from_static(b"r1")).partial();
        assert!(chunk.is_partial());

        let mut buf = BytesMut::new();
        encode_frame(&chunk, &mut buf);
        let decoded = decode_frame(&mut buf, MAX).unwrap().unwrap();
        assert!(decoded.is_partial());
    }
}
