//! Request and response envelopes.
//!
//! Envelopes are structured, transport-agnostic mappings. A request carries
//! the reserved `.method` key plus one entry per supplied parameter; a
//! response carries `.code` plus `.result`, `.message` or
//! `.message` + `.traceback`. Turning them into bytes is the job of
//! [`Codec`](crate::Codec).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, ErrorKind, Result};

/// Key naming the target procedure in a request envelope.
pub const METHOD_KEY: &str = ".method";

/// Status code carried in the `.code` field of a response.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    /// The request carries no procedure name.
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    /// The procedure failed while executing.
    pub const INTERNAL_ERROR: StatusCode = StatusCode(500);
    /// The socket worker pool backlog is full.
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);

    fn missing() -> Self {
        Self::INTERNAL_ERROR
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Request {
    #[serde(rename = ".method", default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Request {
    #[must_use]
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            params: Map::new(),
        }
    }

    /// Serializes `value` and stores it under the parameter `name`.
    ///
    /// # Errors
    ///
    /// Returns `SerializeFailed` if the value cannot be represented.
    pub fn insert<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| Error::new(ErrorKind::SerializeFailed, format!("{name}: {e}")))?;
        self.params.insert(name.to_string(), value);
        Ok(())
    }

    #[must_use]
    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }

    /// The procedure name, treating an empty string as absent.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref().filter(|m| !m.is_empty())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    #[serde(rename = ".code", default = "StatusCode::missing")]
    pub code: StatusCode,
    #[serde(rename = ".result", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(rename = ".message", default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = ".traceback", default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl Response {
    #[must_use]
    pub fn ok(result: Value) -> Self {
        Self {
            code: StatusCode::OK,
            result: Some(result),
            message: None,
            traceback: None,
        }
    }

    #[must_use]
    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            result: None,
            message: Some(message.into()),
            traceback: None,
        }
    }

    #[must_use]
    pub fn failure(message: impl Into<String>, traceback: String) -> Self {
        Self {
            code: StatusCode::INTERNAL_ERROR,
            result: None,
            message: Some(message.into()),
            traceback: Some(traceback),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::OK
    }

    /// Maps the status code to the caller-visible outcome.
    ///
    /// | code  | outcome                                    |
    /// |-------|--------------------------------------------|
    /// | 200   | `.result` (null when absent)               |
    /// | 400   | [`ErrorKind::Protocol`]                    |
    /// | 404   | [`ErrorKind::NotFound`] with the message   |
    /// | 500   | [`ErrorKind::RemoteExecution`] with trace  |
    /// | other | [`ErrorKind::Protocol`] naming the code    |
    ///
    /// # Errors
    ///
    /// Every code other than 200 is an error.
    pub fn into_result(self) -> Result<Value> {
        match self.code {
            StatusCode::OK => Ok(self.result.unwrap_or(Value::Null)),
            StatusCode::BAD_REQUEST => Err(Error::new(
                ErrorKind::Protocol,
                "message missing .method".to_string(),
            )),
            StatusCode::NOT_FOUND => Err(Error::new(
                ErrorKind::NotFound,
                self.message.unwrap_or_default(),
            )),
            StatusCode::INTERNAL_ERROR => Err(Error::remote(
                self.message.unwrap_or_default(),
                self.traceback.unwrap_or_default(),
            )),
            code => {
                let mut msg = format!("unknown result code: {code}");
                if let Some(message) = self.message {
                    msg = format!("{msg} ({message})");
                }
                Err(Error::new(ErrorKind::Protocol, msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_shape() {
        let request = Request::new("add").with("a", json!(1)).with("b", json!(2));
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({".method": "add", "a": 1, "b": 2})
        );

        let parsed: Request = serde_json::from_value(json!({"a": 1})).unwrap();
        assert_eq!(parsed.method(), None);
        assert_eq!(parsed.params["a"], 1);

        let parsed: Request = serde_json::from_value(json!({".method": ""})).unwrap();
        assert_eq!(parsed.method(), None);
    }

    #[test]
    fn test_response_shape() {
        assert_eq!(
            serde_json::to_value(Response::ok(json!(3))).unwrap(),
            json!({".code": 200, ".result": 3})
        );
        assert_eq!(
            serde_json::to_value(Response::error(StatusCode::NOT_FOUND, "nope")).unwrap(),
            json!({".code": 404, ".message": "nope"})
        );

        let missing_code: Response = serde_json::from_value(json!({".message": "x"})).unwrap();
        assert_eq!(missing_code.code, StatusCode::INTERNAL_ERROR);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(Response::ok(json!("x")).into_result(), Ok(json!("x")));

        let null_result: Response = serde_json::from_value(json!({".code": 200})).unwrap();
        assert_eq!(null_result.into_result(), Ok(Value::Null));

        let err = Response::error(StatusCode::BAD_REQUEST, "Missing .method")
            .into_result()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);

        let err = Response::error(StatusCode::NOT_FOUND, ".method sub not found")
            .into_result()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.msg, ".method sub not found");

        let err = Response::failure("boom", "frame 0".into())
            .into_result()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RemoteExecution);
        assert_eq!(err.traceback.as_deref(), Some("frame 0"));

        let err = Response::error(StatusCode(418), "teapot")
            .into_result()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
        assert!(err.msg.contains("418"));
    }
}
