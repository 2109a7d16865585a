use bytes::Bytes;
use dashmap::DashMap;
use foldhash::fast::RandomState;
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::net::TcpStream;
use tokio_util::sync::DropGuard;

use super::{Frame, WorkerPool, WorkerPoolConfig, connection, connection::FrameSender};
use crate::{
    Codec, Dispatcher, Request, Response, StatusCode, TaskSupervisor,
    error::{Error, ErrorKind, Result},
};

type Connections = Arc<DashMap<u64, FrameSender, RandomState>>;

type Job = (FrameSender, Frame);

/// Socket front end of a dispatcher.
///
/// Every inbound frame gets the identity of its connection prepended as
/// the first routing part and goes to a [`WorkerPool`] along with the
/// connection's write side. When the pool's backlog is full the frame is
/// answered at once with code 503.
pub struct SocketServer {
    state: Arc<ServerState>,
}

struct ServerState {
    connections: Connections,
    pool: WorkerPool<Job>,
    next_conn_id: AtomicU64,
    task_supervisor: TaskSupervisor,
}

impl SocketServer {
    /// # Errors
    ///
    /// `InvalidArgument` when `config` is out of range.
    pub fn new(dispatcher: Dispatcher, config: &WorkerPoolConfig) -> Result<Self> {
        config.validate()?;
        let task_supervisor = TaskSupervisor::create();
        let pool = WorkerPool::start(config, &task_supervisor, move |job: Job| {
            Self::work(dispatcher.clone(), job)
        })?;
        Ok(Self {
            state: Arc::new(ServerState {
                connections: Connections::default(),
                pool,
                next_conn_id: AtomicU64::default(),
                task_supervisor,
            }),
        })
    }

    /// Binds `addr` and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Returns `TcpBindFailed` when the address cannot be bound.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;

        let state = self.state.clone();
        self.state.task_supervisor.spawn("accept loop", async move {
            tracing::info!("start listening: {listener_addr}");
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => state.accept(stream, peer),
                    Err(e) => {
                        tracing::error!("accept on {listener_addr} failed: {e}");
                        break;
                    }
                }
            }
        });
        Ok(listener_addr)
    }

    async fn work(dispatcher: Dispatcher, (conn, frame): Job) {
        let codec = frame.codec();
        let (conn_id, routing, body) = match split_routing(frame) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!("drop unroutable frame: {e}");
                return;
            }
        };
        let response = match codec.decode::<Request>(&body) {
            Ok(request) => dispatcher.dispatch(request).await,
            Err(e) => {
                tracing::warn!("malformed request on connection {conn_id}: {e}");
                Response::error(StatusCode::BAD_REQUEST, format!("malformed request: {e}"))
            }
        };

        if conn.is_closed() {
            tracing::debug!("connection {conn_id} is gone, drop reply");
            return;
        }
        match reply_frame(codec, routing, &response) {
            Ok(frame) => {
                if let Err(e) = conn.send(&frame).await {
                    tracing::warn!("reply on connection {conn_id} failed: {e}");
                }
            }
            Err(e) => tracing::error!("encode reply failed: {e}"),
        }
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.state.connections.len()
    }

    pub fn stop(&self) {
        self.state.task_supervisor.stop();
    }

    #[must_use]
    pub fn drop_guard(&self) -> DropGuard {
        self.state.task_supervisor.drop_guard()
    }

    pub async fn join(&self) {
        self.state.task_supervisor.all_stopped().await;
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ServerState {
    fn accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::AcqRel);
        tracing::debug!("accept connection {conn_id} from {peer}");

        let conn = connection::start(
            stream,
            peer,
            &self.task_supervisor,
            {
                let state = self.clone();
                move |conn: &FrameSender, mut frame: Frame| {
                    frame
                        .parts
                        .insert(0, Bytes::copy_from_slice(&conn_id.to_be_bytes()));
                    if let Err((conn, frame)) = state.pool.try_submit((conn.clone(), frame)) {
                        reject(&conn, frame);
                    }
                }
            },
            {
                let connections = self.connections.clone();
                move || {
                    connections.remove(&conn_id);
                }
            },
        );
        self.connections.insert(conn_id, conn);
    }
}

fn reject(conn: &FrameSender, frame: Frame) {
    let codec = frame.codec();
    let Ok((conn_id, routing, _)) = split_routing(frame) else {
        return;
    };
    tracing::warn!("worker pool backlog is full, reject frame on connection {conn_id}");
    let response = Response::error(
        StatusCode::SERVICE_UNAVAILABLE,
        "worker pool backlog is full",
    );
    if let Err(e) = reply_frame(codec, routing, &response).and_then(|f| conn.try_send(&f)) {
        tracing::warn!("reject on connection {conn_id} failed: {e}");
    }
}

/// Splits a server-side frame into its connection ID, the routing parts
/// the peer expects back, and the envelope.
fn split_routing(frame: Frame) -> Result<(u64, Vec<Bytes>, Bytes)> {
    let (mut routing, body) = frame.into_parts()?;
    if routing.is_empty() {
        return Err(Error::new(
            ErrorKind::TcpParseMsgFailed,
            "frame without connection identity".to_string(),
        ));
    }
    let conn = routing.remove(0);
    let conn: [u8; 8] = conn[..].try_into().map_err(|_| {
        Error::new(
            ErrorKind::TcpParseMsgFailed,
            format!("invalid connection identity: {conn:?}"),
        )
    })?;
    Ok((u64::from_be_bytes(conn), routing, body))
}

fn reply_frame(codec: Codec, routing: Vec<Bytes>, response: &Response) -> Result<Frame> {
    Ok(Frame::new(codec, routing, codec.encode(response)?))
}

impl std::fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketServer")
            .field("connections", &self.state.connections.len())
            .field("pool", &self.state.pool)
            .finish()
    }
}
