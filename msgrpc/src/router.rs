use foldhash::fast::RandomState;
use futures_util::{FutureExt, future::BoxFuture};
use serde_json::Value;
use std::{collections::HashMap, future::Future, sync::Arc};

use crate::{
    Args, Procedure,
    error::{BoxError, Error, ErrorKind, Result},
};

pub type Handler =
    Box<dyn Fn(Args) -> BoxFuture<'static, std::result::Result<Value, BoxError>> + Send + Sync>;

/// One dispatch table entry.
pub struct Method {
    pub procedure: Arc<Procedure>,
    pub(crate) handler: Handler,
}

/// Dispatch table: procedure name to descriptor and callable.
#[derive(Default)]
pub struct Router {
    methods: HashMap<String, Method, RandomState>,
}

impl Router {
    /// Registers one procedure and returns its descriptor.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor is invalid or its name is already taken.
    pub fn add_procedure<F, Fut>(
        &mut self,
        procedure: Procedure,
        handler: F,
    ) -> Result<Arc<Procedure>>
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, BoxError>> + Send + 'static,
    {
        procedure.validate()?;
        if self.methods.contains_key(&procedure.name) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("procedure {} is already registered", procedure.name),
            ));
        }

        let procedure = Arc::new(procedure);
        tracing::debug!(
            "export {}(required: {:?}, optional: {:?})",
            procedure.name,
            procedure.required,
            procedure.optional
        );
        self.methods.insert(
            procedure.name.clone(),
            Method {
                procedure: procedure.clone(),
                handler: Box::new(move |args| handler(args).boxed()),
            },
        );
        Ok(procedure)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &String> {
        self.methods.keys()
    }

    pub fn procedures(&self) -> impl Iterator<Item = &Arc<Procedure>> {
        self.methods.values().map(|m| &m.procedure)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.methods.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration() {
        let mut router = Router::default();
        let procedure = router
            .add_procedure(Procedure::new("ping"), |_| async { Ok(Value::Null) })
            .unwrap();
        assert_eq!(procedure.name, "ping");
        assert_eq!(router.len(), 1);

        let err = router
            .add_procedure(Procedure::new("ping"), |_| async { Ok(Value::Null) })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let err = router
            .add_procedure(Procedure::new("bad").required(".method"), |_| async {
                Ok(Value::Null)
            })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert_eq!(router.method_names().count(), 1);
    }
}
