use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{
    envelope::{METHOD_KEY, Request},
    error::{BoxError, Error, ErrorKind, Result},
};

/// Calling convention of one exported procedure.
///
/// Required parameters must be supplied by every caller; optional ones
/// may be left out, in which case the procedure sees them as absent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Procedure {
    pub name: String,
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

impl Procedure {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: vec![],
            optional: vec![],
        }
    }

    #[must_use]
    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    #[must_use]
    pub fn optional(mut self, name: impl Into<String>) -> Self {
        self.optional.push(name.into());
        self
    }

    /// All declared parameter names, required first.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.required
            .iter()
            .chain(self.optional.iter())
            .map(String::as_str)
    }

    /// # Errors
    ///
    /// Fails when the name is empty or a parameter name is empty, reserved
    /// or declared twice.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "procedure name is empty".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for param in self.params() {
            if param.is_empty() || param == METHOD_KEY {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("{}: invalid parameter name {param:?}", self.name),
                ));
            }
            if !seen.insert(param) {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("{}: duplicate parameter {param}", self.name),
                ));
            }
        }
        Ok(())
    }

    /// Builds the request envelope for a call with `positional` values for
    /// the required parameters and any subset of the optional ones.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on an arity mismatch or an undeclared
    /// optional name.
    pub fn build_request(
        &self,
        positional: Vec<Value>,
        optional: Map<String, Value>,
    ) -> Result<Request> {
        if positional.len() != self.required.len() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!(
                    "{} takes {} required arguments, {} given",
                    self.name,
                    self.required.len(),
                    positional.len()
                ),
            ));
        }

        let mut request = Request::new(self.name.clone());
        for (name, value) in self.required.iter().zip(positional) {
            request.params.insert(name.clone(), value);
        }
        for (name, value) in optional {
            if !self.optional.contains(&name) {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("{} got an unexpected argument {name}", self.name),
                ));
            }
            request.params.insert(name, value);
        }
        Ok(request)
    }

    /// Picks this procedure's parameters out of a request, dropping
    /// anything undeclared.
    pub(crate) fn extract(&self, mut params: Map<String, Value>) -> Args {
        let values = self
            .params()
            .filter_map(|name| params.remove(name).map(|v| (name.to_string(), v)))
            .collect();
        Args { values }
    }
}

/// Parameter values handed to a procedure handler.
#[derive(Debug, Default, Clone)]
pub struct Args {
    values: Map<String, Value>,
}

impl Args {
    #[must_use]
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Decodes a required parameter. A missing one decodes from null, so
    /// only types that accept null tolerate being left out.
    ///
    /// # Errors
    ///
    /// Fails when the value does not decode into `T`.
    pub fn required<T: DeserializeOwned>(&self, name: &str) -> std::result::Result<T, BoxError> {
        let value = self.values.get(name).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| BoxError::from(format!("invalid argument `{name}`: {e}")))
    }

    /// Decodes an optional parameter; absent and null both map to `None`.
    ///
    /// # Errors
    ///
    /// Fails when a present value does not decode into `T`.
    pub fn optional<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> std::result::Result<Option<T>, BoxError> {
        match self.values.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| BoxError::from(format!("invalid argument `{name}`: {e}"))),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    #[must_use]
    pub fn into_inner(self) -> Map<String, Value> {
        self.values
    }
}

/// Encodes a procedure's return value as the `.result` of a response.
///
/// # Errors
///
/// Fails when the value cannot be represented as structured data.
pub fn into_value<T: Serialize>(value: &T) -> std::result::Result<Value, BoxError> {
    serde_json::to_value(value).map_err(|e| BoxError::from(format!("invalid result: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn some_method() -> Procedure {
        Procedure::new("some_method")
            .required("foo")
            .required("bar")
            .optional("zot")
    }

    #[test]
    fn test_build_request() {
        let procedure = some_method();
        let request = procedure
            .build_request(vec![json!(1), json!(2)], Map::new())
            .unwrap();
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({".method": "some_method", "foo": 1, "bar": 2})
        );

        let mut optional = Map::new();
        optional.insert("zot".into(), json!(3));
        let request = procedure
            .build_request(vec![json!(1), json!(2)], optional)
            .unwrap();
        assert_eq!(request.params["zot"], 3);

        let err = procedure.build_request(vec![json!(1)], Map::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let mut unexpected = Map::new();
        unexpected.insert("foo".into(), json!(3));
        assert!(
            procedure
                .build_request(vec![json!(1), json!(2)], unexpected)
                .is_err()
        );
    }

    #[test]
    fn test_validate() {
        assert!(some_method().validate().is_ok());
        assert!(Procedure::new("").validate().is_err());
        assert!(Procedure::new("f").required(".method").validate().is_err());
        assert!(
            Procedure::new("f")
                .required("a")
                .optional("a")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_extract_args() {
        let procedure = some_method();
        let request = Request::new("some_method")
            .with("foo", json!(1))
            .with("zot", json!(null))
            .with("extra", json!(true));
        let args = procedure.extract(request.params);

        assert_eq!(args.required::<i64>("foo").unwrap(), 1);
        assert_eq!(args.required::<Option<i64>>("bar").unwrap(), None);
        assert!(args.required::<i64>("bar").is_err());
        assert_eq!(args.optional::<i64>("zot").unwrap(), None);
        assert!(args.get("extra").is_none());
    }
}
