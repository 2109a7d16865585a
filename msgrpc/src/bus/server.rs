use std::sync::{Arc, Weak};

use super::{BusEndpoint, BusMessage, HandlerId, Mailbox, RPC_REPLY, RPC_REQUEST};
use crate::{Codec, CorrelationId, Dispatcher, Request, Response, StatusCode, error::Result};

/// Serves a dispatcher to request-kind messages arriving at an endpoint.
///
/// Each reply goes back to the requester's private group, tagged with the
/// request's correlation ID and encoded in the request's own format. An
/// endpoint serves at most one dispatcher at a time.
pub struct BusServer<M: Mailbox> {
    endpoint: Arc<BusEndpoint<M>>,
    request_handler: HandlerId,
}

impl<M: Mailbox> BusServer<M> {
    /// Serving stops when the returned server is dropped.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the endpoint already handles requests.
    pub fn serve(endpoint: &Arc<BusEndpoint<M>>, dispatcher: Dispatcher) -> Result<Self> {
        let mut names: Vec<&str> = dispatcher.procedures().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        tracing::info!("serving {names:?} on {}", endpoint.private_group());

        let weak = Arc::downgrade(endpoint);
        let request_handler = endpoint.register_exclusive(RPC_REQUEST, move |msg| {
            Self::receive(&weak, &dispatcher, msg);
        })?;
        Ok(Self {
            endpoint: endpoint.clone(),
            request_handler,
        })
    }

    fn receive(endpoint: &Weak<BusEndpoint<M>>, dispatcher: &Dispatcher, msg: BusMessage) {
        let BusMessage {
            sender, payload, ..
        } = msg;
        let (id, body) = match CorrelationId::split(payload) {
            Ok(split) => split,
            Err(e) => {
                tracing::warn!("drop request from {sender}: {e}");
                return;
            }
        };

        let endpoint = endpoint.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let codec = Codec::detect(&body);
            let response = match codec.decode::<Request>(&body) {
                Ok(request) => dispatcher.dispatch(request).await,
                Err(e) => {
                    tracing::warn!("malformed request {id} from {sender}: {e}");
                    Response::error(StatusCode::BAD_REQUEST, format!("malformed request: {e}"))
                }
            };

            let Some(endpoint) = endpoint.upgrade() else {
                return;
            };
            let body = match codec.encode(&response) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!("encode reply {id} failed: {e}");
                    return;
                }
            };
            if let Err(e) = endpoint.send(&[sender.as_str()], RPC_REPLY, id.frame(&body)) {
                tracing::warn!("reply {id} to {sender} failed: {e}");
            }
        });
    }

    pub fn stop(&self) {
        self.endpoint.remove(RPC_REQUEST, self.request_handler);
    }
}

impl<M: Mailbox> Drop for BusServer<M> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<M: Mailbox> std::fmt::Debug for BusServer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusServer")
            .field("endpoint", &self.endpoint.private_group())
            .field("request_handler", &self.request_handler)
            .finish()
    }
}
