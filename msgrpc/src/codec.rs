use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::Result;

/// Envelope serialization format.
///
/// JSON is human readable and is what the demo clients default to;
/// MessagePack is written with named fields so both formats decode into the
/// same mapping-shaped envelopes.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum Codec {
    Json,
    #[default]
    MessagePack,
}

impl Codec {
    #[must_use]
    pub fn from_msgpack_flag(use_msgpack: bool) -> Self {
        if use_msgpack {
            Codec::MessagePack
        } else {
            Codec::Json
        }
    }

    /// # Errors
    ///
    /// Returns `SerializeFailed` if the value cannot be encoded.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Bytes> {
        let bytes = match self {
            Codec::Json => serde_json::to_vec(value)?,
            Codec::MessagePack => rmp_serde::to_vec_named(value)?,
        };
        Ok(bytes.into())
    }

    /// # Errors
    ///
    /// Returns `DeserializeFailed` if the bytes are not a valid encoding.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }

    /// Guesses the format of an encoded envelope: JSON envelopes start
    /// with `{` after optional whitespace, and neither byte can open a
    /// MessagePack map.
    #[must_use]
    pub fn detect(bytes: &[u8]) -> Self {
        let first = bytes.iter().find(|b| !b.is_ascii_whitespace());
        if first == Some(&b'{') {
            Codec::Json
        } else {
            Codec::MessagePack
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Request, Response};
    use serde_json::json;

    #[test]
    fn test_msgpack_keeps_reserved_keys() {
        let request = Request::new("scale")
            .with("value", json!(2.5))
            .with("factor", json!(null));
        let bytes = Codec::MessagePack.encode(&request).unwrap();
        assert_eq!(Codec::detect(&bytes), Codec::MessagePack);

        let decoded: Request = Codec::MessagePack.decode(&bytes).unwrap();
        assert_eq!(decoded.method(), Some("scale"));
        assert_eq!(decoded.params["value"], json!(2.5));
        assert!(decoded.params.contains_key("factor"));
    }

    #[test]
    fn test_detect_json() {
        let bytes = Codec::Json.encode(&Response::ok(json!([1, 2]))).unwrap();
        assert_eq!(Codec::detect(&bytes), Codec::Json);
        let decoded: Response = Codec::Json.decode(&bytes).unwrap();
        assert_eq!(decoded.result, Some(json!([1, 2])));
    }

    #[test]
    fn test_detect_json_after_whitespace() {
        let bytes = b" \r\n\t{\".method\": \"add\", \"a\": 1}";
        assert_eq!(Codec::detect(bytes), Codec::Json);
        let request: Request = Codec::detect(bytes).decode(bytes).unwrap();
        assert_eq!(request.method(), Some("add"));
        assert_eq!(request.params["a"], json!(1));
        assert_eq!(Codec::detect(b"  "), Codec::MessagePack);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(Codec::Json.decode::<Request>(b"{not json").is_err());
        assert!(Codec::MessagePack.decode::<Request>(&[0xc1]).is_err());
    }
}
