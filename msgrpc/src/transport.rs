use std::future::Future;

use crate::{Dispatcher, Request, Response, error::Result};

/// Carries a request envelope to a dispatcher and brings its response back.
///
/// [`Client`](crate::Client) is generic over this trait and maps the
/// response status the same way for every implementation.
pub trait Transport: Send + Sync {
    /// # Errors
    ///
    /// Transport-level failures only (timeouts, broken connections,
    /// undecodable frames). Remote failures come back as responses.
    fn send(&self, request: Request) -> impl Future<Output = Result<Response>> + Send;
}

/// Same-process transport: the dispatcher runs inline on the caller's task.
#[derive(Debug, Clone)]
pub struct DirectTransport {
    dispatcher: Dispatcher,
    echo: bool,
}

impl DirectTransport {
    #[must_use]
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            echo: false,
        }
    }

    /// Logs every envelope passing through at debug level.
    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

impl Transport for DirectTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        if self.echo {
            tracing::debug!("IN: {request:?}");
        }
        let response = self.dispatcher.dispatch(request).await;
        if self.echo {
            tracing::debug!("OUT: {response:?}");
        }
        Ok(response)
    }
}
