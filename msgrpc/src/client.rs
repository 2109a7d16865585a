use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_inline_default::serde_inline_default;
use serde_json::{Map, Value};
use std::time::Duration;

use crate::{
    Codec, Procedure, Request, Transport,
    error::{Error, ErrorKind, Result},
};

/// Client-side settings shared by the correlated transports.
#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ClientConfig {
    /// Window for a point call before it fails with `Timeout`.
    #[serde_inline_default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Collection window of a scatter call.
    #[serde_inline_default(Duration::from_millis(500))]
    #[serde(with = "humantime_serde")]
    pub scatter_timeout: Duration,
    #[serde_inline_default(true)]
    pub use_msgpack: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

impl ClientConfig {
    #[must_use]
    pub fn codec(&self) -> Codec {
        Codec::from_msgpack_flag(self.use_msgpack)
    }
}

/// Generic RPC client over any [`Transport`].
///
/// Typed clients generated by [`service`](crate::service) wrap one of
/// these; [`Client::stub`] offers the same envelope building from a
/// runtime [`Procedure`] descriptor.
#[derive(Debug, Clone)]
pub struct Client<T> {
    transport: T,
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sends `request` and maps the response status to a result.
    ///
    /// # Errors
    ///
    /// `Protocol` for 400 and unrecognized codes, `NotFound` for 404,
    /// `RemoteExecution` for 500, plus any transport failure.
    pub async fn invoke(&self, request: Request) -> Result<Value> {
        let method = request.method.clone().unwrap_or_default();
        let response = self.transport.send(request).await?;
        tracing::trace!("{method} -> {}", response.code);
        response.into_result()
    }

    /// [`invoke`](Self::invoke) and decode the result into `R`.
    ///
    /// # Errors
    ///
    /// As `invoke`, plus `DeserializeFailed` when the result does not fit `R`.
    pub async fn invoke_as<R: DeserializeOwned>(&self, request: Request) -> Result<R> {
        let value = self.invoke(request).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::new(ErrorKind::DeserializeFailed, e.to_string()))
    }

    /// Calls `method` with named parameters.
    ///
    /// # Errors
    ///
    /// As [`invoke_as`](Self::invoke_as).
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = match serde_json::to_value(params)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("parameters of {method} must be a mapping, got {other}"),
                ));
            }
        };
        let request = Request {
            method: Some(method.to_string()),
            params,
        };
        self.invoke_as(request).await
    }

    #[must_use]
    pub fn stub<'a>(&'a self, procedure: &'a Procedure) -> Stub<'a, T> {
        Stub {
            client: self,
            procedure,
        }
    }
}

/// Client-side stub for one procedure, checking arity before sending.
#[derive(Debug)]
pub struct Stub<'a, T> {
    client: &'a Client<T>,
    procedure: &'a Procedure,
}

impl<T: Transport> Stub<'_, T> {
    /// # Errors
    ///
    /// `InvalidArgument` when the arguments do not fit the descriptor,
    /// otherwise as [`Client::invoke`].
    pub async fn call(&self, positional: Vec<Value>, optional: Map<String, Value>) -> Result<Value> {
        let request = self.procedure.build_request(positional, optional)?;
        self.client.invoke(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.scatter_timeout, Duration::from_millis(500));
        assert_eq!(config.codec(), Codec::MessagePack);

        let config: ClientConfig =
            serde_json::from_value(serde_json::json!({"timeout": "250ms", "use_msgpack": false}))
                .unwrap();
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.codec(), Codec::Json);
    }
}
