use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use super::{BusEndpoint, BusMessage, HandlerId, Mailbox, RPC_REPLY, RPC_REQUEST};
use crate::{
    Client, ClientConfig, Codec, CorrelationId, Gathered, PendingRegistry, Request, Response,
    Transport,
    error::{Error, ErrorKind, Result},
};

/// Correlated request/reply on top of a bus endpoint.
///
/// Every request gets a fresh [`CorrelationId`] registered in this
/// client's [`PendingRegistry`]; replies of kind [`RPC_REPLY`] are matched
/// by that ID and nothing else. Several clients may share one endpoint,
/// each one picking out the replies to its own requests.
pub struct BusClient<M: Mailbox> {
    endpoint: Arc<BusEndpoint<M>>,
    registry: Arc<PendingRegistry>,
    config: ClientConfig,
    reply_handler: HandlerId,
}

impl<M: Mailbox> BusClient<M> {
    /// # Errors
    ///
    /// `InvalidArgument` when the endpoint's reply kind is held exclusively.
    pub fn new(endpoint: &Arc<BusEndpoint<M>>, config: ClientConfig) -> Result<Arc<Self>> {
        let registry = PendingRegistry::new();
        let weak: Weak<PendingRegistry> = Arc::downgrade(&registry);
        let reply_handler = endpoint.register(RPC_REPLY, move |msg| {
            if let Some(registry) = weak.upgrade() {
                Self::receive(&registry, msg);
            }
        })?;
        Ok(Arc::new(Self {
            endpoint: endpoint.clone(),
            registry,
            config,
            reply_handler,
        }))
    }

    fn receive(registry: &PendingRegistry, msg: BusMessage) {
        let BusMessage {
            sender, payload, ..
        } = msg;
        let (id, body) = match CorrelationId::split(payload) {
            Ok(split) => split,
            Err(e) => {
                tracing::warn!("drop reply from {sender}: {e}");
                return;
            }
        };
        if !registry.contains(&id) {
            tracing::trace!("reply {id} from {sender} is not for this client");
            return;
        }
        let reply = Codec::detect(&body).decode::<Response>(&body);
        registry.deliver(&id, &sender, reply);
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PendingRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn endpoint(&self) -> &Arc<BusEndpoint<M>> {
        &self.endpoint
    }

    fn send_request(&self, groups: &[&str], id: CorrelationId, request: &Request) -> Result<()> {
        let body = self.config.codec().encode(request)?;
        tracing::debug!(
            "send {id} {} to {groups:?}",
            request.method().unwrap_or_default()
        );
        self.endpoint
            .send(groups, RPC_REQUEST, id.frame(&body))
            .inspect_err(|_| {
                self.registry.discard(&id);
            })
    }

    /// Sends `request` to `groups` and waits for the first reply.
    ///
    /// # Errors
    ///
    /// `Timeout` when no reply arrives within `timeout`, `BusSendFailed`
    /// when the bus refuses the message, or the decode error of the reply.
    pub async fn invoke(
        &self,
        groups: &[&str],
        request: Request,
        timeout: Duration,
    ) -> Result<Response> {
        let id = CorrelationId::new();
        let rx = self.registry.register_call(id, timeout)?;
        self.send_request(groups, id, &request)?;
        rx.await
            .map_err(|_| Error::new(ErrorKind::Closed, format!("pending call {id} dropped")))?
    }

    /// Sends `request` to `groups` and collects every reply that arrives
    /// within `window`.
    ///
    /// # Errors
    ///
    /// `BusSendFailed` when the bus refuses the message. Remote failures
    /// are reported per sender in [`Gathered::failures`].
    pub async fn scatter(
        &self,
        groups: &[&str],
        request: Request,
        window: Duration,
    ) -> Result<Gathered> {
        let id = CorrelationId::new();
        let rx = self.registry.register_scatter(id, window)?;
        self.send_request(groups, id, &request)?;
        rx.await
            .map_err(|_| Error::new(ErrorKind::Closed, format!("scatter {id} dropped")))
    }

    /// A [`Transport`] addressing `group` with this client's timeouts.
    #[must_use]
    pub fn transport(self: &Arc<Self>, group: &str) -> BusTransport<M> {
        BusTransport {
            client: self.clone(),
            group: group.to_string(),
            timeout: self.config.timeout,
            scatter_timeout: self.config.scatter_timeout,
        }
    }
}

impl<M: Mailbox> Drop for BusClient<M> {
    fn drop(&mut self) {
        self.endpoint.remove(RPC_REPLY, self.reply_handler);
    }
}

impl<M: Mailbox> std::fmt::Debug for BusClient<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("endpoint", &self.endpoint)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

/// A [`BusClient`] bound to one target group.
pub struct BusTransport<M: Mailbox> {
    client: Arc<BusClient<M>>,
    group: String,
    timeout: Duration,
    scatter_timeout: Duration,
}

impl<M: Mailbox> BusTransport<M> {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_scatter_timeout(mut self, window: Duration) -> Self {
        self.scatter_timeout = window;
        self
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// # Errors
    ///
    /// See [`BusClient::scatter`].
    pub async fn scatter(&self, request: Request) -> Result<Gathered> {
        self.client
            .scatter(&[self.group.as_str()], request, self.scatter_timeout)
            .await
    }
}

impl<M: Mailbox> Clone for BusTransport<M> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            group: self.group.clone(),
            timeout: self.timeout,
            scatter_timeout: self.scatter_timeout,
        }
    }
}

impl<M: Mailbox> std::fmt::Debug for BusTransport<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusTransport")
            .field("group", &self.group)
            .field("timeout", &self.timeout)
            .field("scatter_timeout", &self.scatter_timeout)
            .finish()
    }
}

impl<M: Mailbox> Transport for BusTransport<M> {
    async fn send(&self, request: Request) -> Result<Response> {
        self.client
            .invoke(&[self.group.as_str()], request, self.timeout)
            .await
    }
}

impl<M: Mailbox> Client<BusTransport<M>> {
    /// Asks every member of the transport's group and gathers the replies
    /// of the scatter window.
    ///
    /// # Errors
    ///
    /// See [`BusClient::scatter`].
    pub async fn scatter(&self, request: Request) -> Result<Gathered> {
        self.transport().scatter(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Dispatcher, Procedure, Router,
        bus::{BusServer, LocalBus},
        procedure::into_value,
    };
    use serde_json::json;

    #[tokio::test]
    async fn test_point_call_over_local_bus() {
        let bus = LocalBus::new();
        let mut router = Router::default();
        router
            .add_procedure(Procedure::new("add").required("a").required("b"), |args| async move {
                let a: i64 = args.required("a")?;
                let b: i64 = args.required("b")?;
                into_value(&(a + b))
            })
            .unwrap();

        let (mailbox, events) = bus.connect("server").unwrap();
        let server_endpoint = BusEndpoint::start(mailbox, events);
        server_endpoint.join_group("calc").unwrap();
        let _server = BusServer::serve(&server_endpoint, Dispatcher::new(router)).unwrap();

        let (mailbox, events) = bus.connect("client").unwrap();
        let client_endpoint = BusEndpoint::start(mailbox, events);
        let bus_client = BusClient::new(&client_endpoint, ClientConfig::default()).unwrap();
        let client = Client::new(bus_client.transport("calc"));

        let sum: i64 = client.call("add", &json!({"a": 1, "b": 2})).await.unwrap();
        assert_eq!(sum, 3);
        assert!(bus_client.registry().is_empty());
    }
}
