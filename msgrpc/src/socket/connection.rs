use std::{io::IoSlice, net::SocketAddr};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use super::Frame;
use crate::{
    TaskSupervisor,
    error::{Error, ErrorKind, Result},
};

/// Write side of a connection. Cloned into every task that replies on it.
#[derive(Debug, Clone)]
pub(crate) struct FrameSender {
    stream: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

impl FrameSender {
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode()?;
        self.stream
            .send(bytes)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpSendMsgFailed, e.to_string()))
    }

    /// Queues `frame` without waiting for room in the write queue.
    pub fn try_send(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode()?;
        self.stream
            .try_send(bytes)
            .map_err(|e| Error::new(ErrorKind::TcpSendMsgFailed, e.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.stream.is_closed()
    }
}

/// Starts the read and write loops of `stream` under `supervisor`.
///
/// `on_frame` sees every inbound frame in arrival order, together with the
/// sender of the same connection. `on_close` runs once the read side ends,
/// unless the supervisor stopped first.
pub(crate) fn start<H, C>(
    stream: TcpStream,
    peer: SocketAddr,
    supervisor: &TaskSupervisor,
    mut on_frame: H,
    on_close: C,
) -> FrameSender
where
    H: FnMut(&FrameSender, Frame) + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!("set nodelay for {peer} failed: {e}");
    }
    let (recv_stream, send_stream) = stream.into_split();
    let (sender, receiver) = mpsc::channel(1024);
    let conn = FrameSender {
        stream: sender,
        closed: CancellationToken::new(),
    };
    let closed = conn.closed.clone();

    supervisor.spawn("socket send loop", {
        let closed = closed.clone();
        async move {
            tokio::select! {
                () = closed.cancelled() => {}
                r = start_send_loop(send_stream, receiver) => {
                    if let Err(e) = r {
                        tracing::error!("send loop for {peer} failed: {e}");
                    }
                    closed.cancel();
                }
            }
        }
    });

    supervisor.spawn("socket recv loop", {
        let conn = conn.clone();
        async move {
            tokio::select! {
                () = closed.cancelled() => {}
                r = start_recv_loop(recv_stream, |frame| on_frame(&conn, frame)) => {
                    match r {
                        Ok(()) => tracing::debug!("{peer} closed the connection"),
                        Err(e) => tracing::error!("recv loop for {peer} failed: {e}"),
                    }
                    closed.cancel();
                }
            }
            on_close();
        }
    });

    conn
}

async fn start_recv_loop<H: FnMut(Frame)>(
    mut recv_stream: OwnedReadHalf,
    mut on_frame: H,
) -> Result<()> {
    let mut buffer = BytesMut::with_capacity(1 << 16);
    loop {
        if let Some(frame) = Frame::parse(&mut buffer)? {
            on_frame(frame);
        } else {
            let n = recv_stream
                .read_buf(&mut buffer)
                .await
                .map_err(|e| Error::new(ErrorKind::TcpRecvMsgFailed, e.to_string()))?;
            if n == 0 {
                return if buffer.is_empty() {
                    Ok(())
                } else {
                    Err(Error::new(
                        ErrorKind::TcpRecvMsgFailed,
                        format!("socket eof inside a frame ({} bytes)", buffer.len()),
                    ))
                };
            }
        }
    }
}

async fn start_send_loop(
    mut send_stream: OwnedWriteHalf,
    mut receiver: mpsc::Receiver<Bytes>,
) -> Result<()> {
    const LIMIT: usize = 64;
    let mut msgs = Vec::with_capacity(LIMIT);
    loop {
        let mut bufs = [IoSlice::new(&[]); LIMIT];

        let n = receiver.recv_many(&mut msgs, LIMIT).await;
        if n == 0 {
            return Ok(());
        }

        for (msg, io_slice) in msgs.iter().zip(&mut bufs) {
            *io_slice = IoSlice::new(msg);
        }

        let mut slices = &mut bufs[..msgs.len()];
        while !slices.is_empty() {
            match send_stream.write_vectored(slices).await {
                Ok(0) => {
                    return Err(Error::new(
                        ErrorKind::TcpSendMsgFailed,
                        "socket closed while writing".to_string(),
                    ));
                }
                Ok(n) => {
                    IoSlice::advance_slices(&mut slices, n);
                }
                Err(e) => {
                    return Err(Error::new(ErrorKind::TcpSendMsgFailed, e.to_string()));
                }
            }
        }
        msgs.clear();
    }
}
