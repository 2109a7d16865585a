use bytes::{Bytes, BytesMut};

use crate::error::{Error, ErrorKind, Result};

/// 128-bit random token linking a bus request to its replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId([u8; CorrelationId::LEN]);

impl CorrelationId {
    /// Width of the ID prefix on the wire.
    pub const LEN: usize = 16;

    #[allow(clippy::new_without_default)]
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Prefixes `body` with this ID.
    #[must_use]
    pub fn frame(&self, body: &[u8]) -> Bytes {
        let mut bytes = BytesMut::with_capacity(Self::LEN + body.len());
        bytes.extend_from_slice(&self.0);
        bytes.extend_from_slice(body);
        bytes.freeze()
    }

    /// Splits a framed payload into its ID and the remaining body.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` when the payload is shorter than an ID.
    pub fn split(mut payload: Bytes) -> Result<(Self, Bytes)> {
        if payload.len() < Self::LEN {
            return Err(Error::new(
                ErrorKind::Protocol,
                format!("payload too short for correlation id: {}", payload.len()),
            ));
        }
        let head = payload.split_to(Self::LEN);
        let mut id = [0u8; Self::LEN];
        id.copy_from_slice(&head);
        Ok((Self(id), payload))
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0).simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_and_split() {
        let id = CorrelationId::new();
        assert_ne!(id, CorrelationId::new());
        assert_eq!(id.to_string().len(), 32);

        let framed = id.frame(b"{\".code\":200}");
        assert_eq!(framed.len(), CorrelationId::LEN + 13);
        let (parsed, body) = CorrelationId::split(framed).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(&body[..], b"{\".code\":200}");

        let err = CorrelationId::split(Bytes::from_static(b"short")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
    }
}
