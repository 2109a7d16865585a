use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    Codec,
    error::{Error, ErrorKind, Result},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

bitflags! {
    impl FrameFlags: u8 {
        /// The envelope part is MessagePack rather than JSON.
        const UseMessagePack = 1;
    }
}

impl From<Codec> for FrameFlags {
    fn from(codec: Codec) -> Self {
        match codec {
            Codec::Json => FrameFlags::empty(),
            Codec::MessagePack => FrameFlags::UseMessagePack,
        }
    }
}

/// One multipart message on a socket connection.
///
/// Wire layout: magic `MRPC` and the length of the rest (both u32 BE),
/// then the flags byte, the part count byte, and each part as a u32 BE
/// length followed by its bytes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: FrameFlags,
    pub parts: Vec<Bytes>,
}

const HEADER_SIZE: usize = 2 * std::mem::size_of::<u32>();

impl Frame {
    #[must_use]
    pub fn new(codec: Codec, mut routing: Vec<Bytes>, body: Bytes) -> Self {
        routing.push(body);
        Self {
            flags: codec.into(),
            parts: routing,
        }
    }

    #[must_use]
    pub fn codec(&self) -> Codec {
        Codec::from_msgpack_flag(self.flags.contains(FrameFlags::UseMessagePack))
    }

    /// Every part but the last.
    #[must_use]
    pub fn routing(&self) -> &[Bytes] {
        match self.parts.split_last() {
            Some((_, routing)) => routing,
            None => &[],
        }
    }

    #[must_use]
    pub fn body(&self) -> Option<&Bytes> {
        self.parts.last()
    }

    /// # Errors
    ///
    /// Returns `TcpParseMsgFailed` for a frame without parts.
    pub fn into_parts(mut self) -> Result<(Vec<Bytes>, Bytes)> {
        let body = self.parts.pop().ok_or_else(|| {
            Error::new(ErrorKind::TcpParseMsgFailed, "frame without parts".to_string())
        })?;
        Ok((self.parts, body))
    }

    /// # Errors
    ///
    /// Fails with `InvalidArgument` for more than 255 parts and with
    /// `TcpParseMsgFailed` when the frame exceeds the size limit.
    pub fn encode(&self) -> Result<Bytes> {
        let nparts = u8::try_from(self.parts.len())?;
        let len: usize = 2 + self
            .parts
            .iter()
            .map(|part| std::mem::size_of::<u32>() + part.len())
            .sum::<usize>();
        if HEADER_SIZE + len >= super::MAX_MSG_SIZE {
            return Err(Error::new(
                ErrorKind::TcpParseMsgFailed,
                format!("msg is too long: {len}"),
            ));
        }

        let mut bytes = BytesMut::with_capacity(HEADER_SIZE + len);
        bytes.put_u32(super::MAGIC_NUM);
        bytes.put_u32(u32::try_from(len)?);
        bytes.put_u8(self.flags.bits());
        bytes.put_u8(nparts);
        for part in &self.parts {
            bytes.put_u32(u32::try_from(part.len())?);
            bytes.extend_from_slice(part);
        }
        Ok(bytes.freeze())
    }

    /// Takes one complete frame off the front of `buffer`, or returns
    /// `None` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns `TcpParseMsgFailed` when the bytes are not a valid frame;
    /// the connection cannot be resynchronized after that.
    pub fn parse(buffer: &mut BytesMut) -> Result<Option<Self>> {
        if buffer.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mut header = &buffer[..HEADER_SIZE];
        let magic = header.get_u32();
        if magic != super::MAGIC_NUM {
            return Err(Error::new(
                ErrorKind::TcpParseMsgFailed,
                format!("invalid header: {magic:08X}"),
            ));
        }

        let len = usize::try_from(header.get_u32())?;
        if HEADER_SIZE + len >= super::MAX_MSG_SIZE {
            return Err(Error::new(
                ErrorKind::TcpParseMsgFailed,
                format!("msg is too long: {len}"),
            ));
        }
        if buffer.len() < HEADER_SIZE + len {
            return Ok(None);
        }

        buffer.advance(HEADER_SIZE);
        let body = buffer.split_to(len).freeze();
        Self::parse_body(body).map(Some)
    }

    fn parse_body(mut body: Bytes) -> Result<Self> {
        let invalid = |msg: &str| Error::new(ErrorKind::TcpParseMsgFailed, msg.to_string());

        if body.remaining() < 2 {
            return Err(invalid("truncated frame header"));
        }
        let flags = FrameFlags::from_bits(body.get_u8())
            .ok_or_else(|| invalid("unknown frame flags"))?;
        let nparts = body.get_u8();
        if nparts == 0 {
            return Err(invalid("frame without parts"));
        }

        let mut parts = Vec::with_capacity(usize::from(nparts));
        for _ in 0..nparts {
            if body.remaining() < std::mem::size_of::<u32>() {
                return Err(invalid("truncated part length"));
            }
            let len = usize::try_from(body.get_u32())?;
            if body.remaining() < len {
                return Err(invalid("truncated part"));
            }
            parts.push(body.split_to(len));
        }
        if body.has_remaining() {
            return Err(invalid("trailing bytes after last part"));
        }
        Ok(Self { flags, parts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_parse() {
        let frame = Frame::new(
            Codec::Json,
            vec![Bytes::from_static(b"conn"), Bytes::from_static(b"id")],
            Bytes::from_static(b"{}"),
        );
        assert_eq!(frame.routing().len(), 2);
        assert_eq!(frame.codec(), Codec::Json);
        let encoded = frame.encode().unwrap();
        assert_eq!(&encoded[..4], b"MRPC");

        // two frames back to back, the second one arriving in pieces
        let mut buffer = BytesMut::from(&encoded[..]);
        buffer.extend_from_slice(&encoded[..5]);
        assert_eq!(Frame::parse(&mut buffer).unwrap(), Some(frame.clone()));
        assert_eq!(Frame::parse(&mut buffer).unwrap(), None);
        buffer.extend_from_slice(&encoded[5..]);
        assert_eq!(Frame::parse(&mut buffer).unwrap(), Some(frame));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_frame_parts() {
        let frame = Frame::new(Codec::MessagePack, vec![], Bytes::from_static(b"\x80"));
        assert!(frame.flags.contains(FrameFlags::UseMessagePack));
        assert!(frame.routing().is_empty());
        let (routing, body) = frame.into_parts().unwrap();
        assert!(routing.is_empty());
        assert_eq!(&body[..], b"\x80");

        assert!(Frame::default().into_parts().is_err());
        assert!(Frame::default().routing().is_empty());
    }

    #[test]
    fn test_invalid_frames() {
        let mut buffer = BytesMut::from(&b"RUA!\0\0\0\0"[..]);
        let err = Frame::parse(&mut buffer).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TcpParseMsgFailed);

        let mut buffer = BytesMut::new();
        buffer.put_u32(u32::from_be_bytes(*b"MRPC"));
        buffer.put_u32(u32::MAX);
        assert!(Frame::parse(&mut buffer).is_err());

        // declares two parts but carries one
        let mut buffer = BytesMut::new();
        buffer.put_u32(u32::from_be_bytes(*b"MRPC"));
        buffer.put_u32(2 + 4 + 1);
        buffer.put_u8(0);
        buffer.put_u8(2);
        buffer.put_u32(1);
        buffer.put_u8(b'x');
        assert!(Frame::parse(&mut buffer).is_err());

        let mut buffer = BytesMut::new();
        buffer.put_u32(u32::from_be_bytes(*b"MRPC"));
        buffer.put_u32(2);
        buffer.put_u8(0x80);
        buffer.put_u8(1);
        assert!(Frame::parse(&mut buffer).is_err());
    }
}
