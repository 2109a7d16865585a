use foldhash::fast::RandomState;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

use super::Frame;
use crate::error::{Error, ErrorKind, Result};

/// Reply waiter of a socket client.
///
/// Hands out increasing message IDs that the client sends as a routing
/// part and stores the channel each reply frame is posted to.
#[derive(Default)]
pub struct Waiter {
    index: AtomicU64,
    id_map: dashmap::DashMap<u64, oneshot::Sender<Frame>, RandomState>,
}

/// Receives the reply for one message ID. Dropping it unregisters the ID,
/// so a call abandoned on timeout leaves nothing behind.
pub struct WaitReceiver<'a> {
    rx: oneshot::Receiver<Frame>,
    waiter: &'a Waiter,
    msg_id: u64,
}

impl WaitReceiver<'_> {
    /// # Errors
    ///
    /// Returns `Closed` when the waiter dropped the entry.
    pub async fn recv(mut self) -> Result<Frame> {
        (&mut self.rx)
            .await
            .map_err(|e| Error::new(ErrorKind::Closed, e.to_string()))
    }
}

impl Drop for WaitReceiver<'_> {
    fn drop(&mut self) {
        self.waiter.remove(self.msg_id);
    }
}

impl Waiter {
    pub fn alloc(&self) -> (u64, WaitReceiver<'_>) {
        let msg_id = self.index.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.id_map.insert(msg_id, tx);
        (
            msg_id,
            WaitReceiver {
                rx,
                waiter: self,
                msg_id,
            },
        )
    }

    /// Completes the call waiting for `msg_id`.
    pub fn post(&self, msg_id: u64, frame: Frame) {
        if let Some((_, tx)) = self.id_map.remove(&msg_id) {
            let _ = tx.send(frame);
        } else {
            tracing::warn!("Waiter post failed for msg_id: {msg_id}");
        }
    }

    #[must_use]
    pub fn contains_message_id(&self, msg_id: u64) -> bool {
        self.id_map.contains_key(&msg_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.id_map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id_map.is_empty()
    }

    fn remove(&self, msg_id: u64) {
        self.id_map.remove(&msg_id);
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("pending", &self.id_map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Codec;
    use bytes::Bytes;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_waiter() {
        let waiter = Arc::new(Waiter::default());

        let (msg_id, rx) = waiter.alloc();
        assert_eq!(msg_id, 0);

        let handle = {
            let waiter = Arc::clone(&waiter);
            tokio::spawn(async move {
                tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                let frame = Frame::new(Codec::Json, vec![], Bytes::from_static(b"{}"));
                waiter.post(msg_id, frame);
            })
        };

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.body().map(|b| &b[..]), Some(&b"{}"[..]));
        handle.await.unwrap();
        assert!(waiter.is_empty());

        let (msg_id, rx) = waiter.alloc();
        assert!(waiter.contains_message_id(msg_id));
        drop(rx);
        assert!(!waiter.contains_message_id(msg_id));
    }
}
