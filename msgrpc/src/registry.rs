use dashmap::DashMap;
use foldhash::fast::RandomState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};
use tokio::{sync::oneshot, task::AbortHandle};

use crate::{
    CorrelationId, Response,
    error::{Error, ErrorKind, Result},
};

/// Replies collected by a scatter call, keyed by responder identity.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Gathered {
    pub successes: BTreeMap<String, Value>,
    pub failures: BTreeMap<String, Error>,
}

impl Gathered {
    /// Records the first reply of `sender`; later ones are ignored.
    fn record(&mut self, sender: &str, reply: Result<Response>) {
        if self.successes.contains_key(sender) || self.failures.contains_key(sender) {
            tracing::debug!("ignore duplicate scatter reply from {sender}");
            return;
        }
        match reply.and_then(Response::into_result) {
            Ok(value) => {
                self.successes.insert(sender.to_string(), value);
            }
            Err(err) => {
                self.failures.insert(sender.to_string(), err);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PendingCall {
    tx: oneshot::Sender<Result<Response>>,
    created: Instant,
    timeout: Duration,
    timer: Option<AbortHandle>,
}

struct ScatterAccumulator {
    tx: oneshot::Sender<Gathered>,
    gathered: Gathered,
    created: Instant,
}

/// In-flight correlated requests of one client.
///
/// Entries leave the registry through exactly one of two paths: a reply
/// removes a point call, or its timer fires. Both paths remove through the
/// map, so whichever gets there first completes the call and the other
/// finds nothing. Scatter entries only end on their timer.
#[derive(Default)]
pub struct PendingRegistry {
    calls: DashMap<CorrelationId, PendingCall, RandomState>,
    scatters: DashMap<CorrelationId, ScatterAccumulator, RandomState>,
}

impl PendingRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Registers a point call that fails with `Timeout` after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `id` is already pending.
    pub fn register_call(
        self: &Arc<Self>,
        id: CorrelationId,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<Response>>> {
        self.ensure_vacant(&id)?;
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            id,
            PendingCall {
                tx,
                created: Instant::now(),
                timeout,
                timer: None,
            },
        );

        let timer = self.schedule(id, timeout);
        match self.calls.get_mut(&id) {
            Some(mut call) => call.timer = Some(timer),
            // already expired
            None => timer.abort(),
        }
        Ok(rx)
    }

    /// Registers a scatter call that completes with everything gathered
    /// once `window` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `id` is already pending.
    pub fn register_scatter(
        self: &Arc<Self>,
        id: CorrelationId,
        window: Duration,
    ) -> Result<oneshot::Receiver<Gathered>> {
        self.ensure_vacant(&id)?;
        let (tx, rx) = oneshot::channel();
        self.scatters.insert(
            id,
            ScatterAccumulator {
                tx,
                gathered: Gathered::default(),
                created: Instant::now(),
            },
        );
        self.schedule(id, window);
        Ok(rx)
    }

    /// Routes a reply to its pending entry. Returns false when nothing is
    /// waiting for `id`, e.g. because it already timed out.
    pub fn deliver(&self, id: &CorrelationId, sender: &str, reply: Result<Response>) -> bool {
        if let Some((_, call)) = self.calls.remove(id) {
            if let Some(timer) = call.timer {
                timer.abort();
            }
            tracing::debug!("{id} answered by {sender} in {:?}", call.created.elapsed());
            if call.tx.send(reply).is_err() {
                tracing::debug!("caller of {id} is gone");
            }
            true
        } else if let Some(mut scatter) = self.scatters.get_mut(id) {
            scatter.gathered.record(sender, reply);
            true
        } else {
            tracing::warn!("no pending request for {id} (reply from {sender})");
            false
        }
    }

    /// Drops an entry without completing it, for sends that never left.
    pub fn discard(&self, id: &CorrelationId) -> bool {
        let call = self.calls.remove(id).map(|(_, call)| {
            if let Some(timer) = call.timer {
                timer.abort();
            }
        });
        let scatter = self.scatters.remove(id);
        call.is_some() || scatter.is_some()
    }

    #[must_use]
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.calls.contains_key(id) || self.scatters.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len() + self.scatters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_vacant(&self, id: &CorrelationId) -> Result<()> {
        if self.contains(id) {
            Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("correlation id {id} is already pending"),
            ))
        } else {
            Ok(())
        }
    }

    fn schedule(self: &Arc<Self>, id: CorrelationId, after: Duration) -> AbortHandle {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire(&id);
            }
        })
        .abort_handle()
    }

    fn expire(&self, id: &CorrelationId) {
        if let Some((_, call)) = self.calls.remove(id) {
            tracing::debug!("{id} timed out after {:?}", call.created.elapsed());
            let err = Error::new(
                ErrorKind::Timeout,
                format!("no reply for {id} within {:?}", call.timeout),
            );
            let _ = call.tx.send(Err(err));
        } else if let Some((_, scatter)) = self.scatters.remove(id) {
            tracing::debug!(
                "{id} gathered {} replies in {:?}",
                scatter.gathered.len(),
                scatter.created.elapsed()
            );
            let _ = scatter.tx.send(scatter.gathered);
        }
    }
}

impl std::fmt::Debug for PendingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRegistry")
            .field("calls", &self.calls.len())
            .field("scatters", &self.scatters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_reply_completes_once() {
        let registry = PendingRegistry::new();
        let id = CorrelationId::new();
        let rx = registry.register_call(id, Duration::from_secs(5)).unwrap();
        assert!(registry.register_call(id, Duration::from_secs(5)).is_err());

        assert!(registry.deliver(&id, "#a", Ok(Response::ok(json!(1)))));
        assert!(!registry.deliver(&id, "#a", Ok(Response::ok(json!(2)))));
        assert_eq!(rx.await.unwrap().unwrap().result, Some(json!(1)));

        // the aborted timer must not resurrect anything
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once_without_leak() {
        let registry = PendingRegistry::new();
        let id = CorrelationId::new();
        let rx = registry.register_call(id, Duration::from_secs(5)).unwrap();
        assert!(registry.contains(&id));

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(!registry.contains(&id));
        assert!(!registry.deliver(&id, "#late", Ok(Response::ok(json!(1)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scatter_waits_for_window() {
        let registry = PendingRegistry::new();
        let id = CorrelationId::new();
        let mut rx = registry
            .register_scatter(id, Duration::from_millis(500))
            .unwrap();

        registry.deliver(&id, "#a", Ok(Response::ok(json!("a"))));
        registry.deliver(&id, "#b", Ok(Response::failure("boom", "trace".into())));
        registry.deliver(&id, "#a", Ok(Response::ok(json!("again"))));
        registry.deliver(
            &id,
            "#c",
            Err(Error::kind(ErrorKind::DeserializeFailed)),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        let gathered = rx.await.unwrap();
        assert_eq!(gathered.successes.len(), 1);
        assert_eq!(gathered.successes["#a"], json!("a"));
        assert_eq!(gathered.failures["#b"].kind, ErrorKind::RemoteExecution);
        assert_eq!(gathered.failures["#c"].kind, ErrorKind::DeserializeFailed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_discard() {
        let registry = PendingRegistry::new();
        let id = CorrelationId::new();
        let rx = registry.register_call(id, Duration::from_secs(5)).unwrap();
        assert!(registry.discard(&id));
        assert!(!registry.discard(&id));
        assert!(rx.await.is_err());
    }
}
