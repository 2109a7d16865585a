use bytes::Bytes;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpStream, sync::RwLock};

use super::{Frame, Waiter, connection, connection::FrameSender};
use crate::{
    ClientConfig, Request, Response, TaskSupervisor, Transport,
    error::{Error, ErrorKind, Result},
};

/// Client side of the socket transport.
///
/// Keeps one connection to the server, opened on first use and reopened
/// after it drops. Each call sends a message ID as its single routing
/// part and waits for the reply echoing it, for at most the configured
/// timeout. Must be created inside a tokio runtime.
pub struct SocketTransport {
    addr: SocketAddr,
    config: ClientConfig,
    waiter: Arc<Waiter>,
    connection: RwLock<Option<FrameSender>>,
    task_supervisor: TaskSupervisor,
}

impl SocketTransport {
    #[must_use]
    pub fn new(addr: SocketAddr, config: ClientConfig) -> Self {
        Self {
            addr,
            config,
            waiter: Arc::default(),
            connection: RwLock::default(),
            task_supervisor: TaskSupervisor::create(),
        }
    }

    /// Creates the transport and opens its connection right away.
    ///
    /// # Errors
    ///
    /// Returns `TcpConnectFailed` when the server is unreachable.
    pub async fn connect(addr: SocketAddr, config: ClientConfig) -> Result<Self> {
        let transport = Self::new(addr, config);
        transport.acquire().await?;
        Ok(transport)
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn waiter(&self) -> &Waiter {
        &self.waiter
    }

    async fn acquire(&self) -> Result<FrameSender> {
        if let Ok(connection) = self.connection.try_read()
            && let Some(conn) = connection.as_ref()
            && !conn.is_closed()
        {
            return Ok(conn.clone());
        }

        let mut connection = self.connection.write().await;
        if let Some(conn) = connection.as_ref()
            && !conn.is_closed()
        {
            return Ok(conn.clone());
        }

        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, e.to_string()))?;
        tracing::debug!("connected to {}", self.addr);
        let waiter = self.waiter.clone();
        let conn = connection::start(
            stream,
            self.addr,
            &self.task_supervisor,
            move |_: &FrameSender, frame: Frame| Self::receive(&waiter, frame),
            || {},
        );
        *connection = Some(conn.clone());
        Ok(conn)
    }

    fn receive(waiter: &Waiter, frame: Frame) {
        let msg_id = frame
            .routing()
            .first()
            .and_then(|part| <[u8; 8]>::try_from(&part[..]).ok())
            .map(u64::from_be_bytes);
        match msg_id {
            Some(msg_id) => waiter.post(msg_id, frame),
            None => tracing::warn!("drop reply without message id: {:?}", frame.routing()),
        }
    }

    pub fn stop(&self) {
        self.task_supervisor.stop();
    }
}

impl Transport for SocketTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        let codec = self.config.codec();
        let body = codec.encode(&request)?;
        let conn = self.acquire().await?;

        let (msg_id, rx) = self.waiter.alloc();
        let frame = Frame::new(codec, vec![Bytes::copy_from_slice(&msg_id.to_be_bytes())], body);
        conn.send(&frame).await?;

        let reply = tokio::time::timeout(self.config.timeout, rx.recv())
            .await
            .map_err(|_| {
                Error::new(
                    ErrorKind::Timeout,
                    format!("no reply for message {msg_id} within {:?}", self.config.timeout),
                )
            })??;
        let codec = reply.codec();
        let (_, body) = reply.into_parts()?;
        codec.decode(&body)
    }
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTransport")
            .field("addr", &self.addr)
            .field("config", &self.config)
            .field("waiter", &self.waiter)
            .finish_non_exhaustive()
    }
}
