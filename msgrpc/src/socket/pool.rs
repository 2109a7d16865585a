use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use std::{future::Future, sync::Arc};
use tokio::sync::{Semaphore, mpsc, mpsc::error::TrySendError};

use crate::{
    TaskSupervisor,
    error::{Error, ErrorKind, Result},
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct WorkerPoolConfig {
    /// Jobs executing at the same time.
    #[serde_inline_default(50)]
    pub workers: usize,
    /// Jobs allowed to wait for a free worker before new ones are refused.
    #[serde_inline_default(1024)]
    pub backlog: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

impl WorkerPoolConfig {
    /// # Errors
    ///
    /// `InvalidArgument` when either bound is zero or `workers` exceeds
    /// what a semaphore can count.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > Semaphore::MAX_PERMITS {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!(
                    "workers must be within 1..={}, got {}",
                    Semaphore::MAX_PERMITS,
                    self.workers
                ),
            ));
        }
        if self.backlog == 0 {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "backlog must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bounded pool of worker tasks fed from a bounded backlog.
///
/// A pump task takes a job off the backlog only once a worker permit is
/// free, so at most `workers` jobs run and at most `backlog` wait.
pub struct WorkerPool<J> {
    backlog: mpsc::Sender<J>,
    workers: Arc<Semaphore>,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// # Errors
    ///
    /// `InvalidArgument` when `config` fails [`WorkerPoolConfig::validate`].
    pub fn start<F, Fut>(
        config: &WorkerPoolConfig,
        supervisor: &TaskSupervisor,
        work: F,
    ) -> Result<Self>
    where
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        config.validate()?;
        let (backlog, receiver) = mpsc::channel(config.backlog);
        let workers = Arc::new(Semaphore::new(config.workers));
        supervisor.spawn(
            "worker pool pump",
            Self::pump(receiver, workers.clone(), Arc::new(work)),
        );
        tracing::debug!("worker pool started: {config:?}");
        Ok(Self { backlog, workers })
    }

    async fn pump<F, Fut>(mut receiver: mpsc::Receiver<J>, workers: Arc<Semaphore>, work: Arc<F>)
    where
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            let Ok(permit) = workers.clone().acquire_owned().await else {
                break;
            };
            let Some(job) = receiver.recv().await else {
                break;
            };
            let work = work.clone();
            tokio::spawn(async move {
                work(job).await;
                drop(permit);
            });
        }
    }

    /// Queues `job`, handing it back when the backlog is full or the pool
    /// has stopped.
    pub fn try_submit(&self, job: J) -> std::result::Result<(), J> {
        self.backlog.try_send(job).map_err(|e| match e {
            TrySendError::Full(job) | TrySendError::Closed(job) => job,
        })
    }

    /// Workers currently free.
    #[must_use]
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }
}

impl<J> std::fmt::Debug for WorkerPool<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("idle_workers", &self.workers.available_permits())
            .field("backlog_capacity", &self.backlog.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.workers, 50);
        assert_eq!(config.backlog, 1024);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_config_is_refused() {
        let supervisor = TaskSupervisor::create();
        for config in [
            WorkerPoolConfig {
                workers: 0,
                backlog: 8,
            },
            WorkerPoolConfig {
                workers: Semaphore::MAX_PERMITS + 1,
                backlog: 8,
            },
            WorkerPoolConfig {
                workers: 4,
                backlog: 0,
            },
        ] {
            let err = WorkerPool::start(&config, &supervisor, |_: ()| async {}).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument);
        }
        supervisor.stop();
    }

    #[tokio::test]
    async fn test_backlog_rejects_when_full() {
        let supervisor = TaskSupervisor::create();
        let config = WorkerPoolConfig {
            workers: 1,
            backlog: 1,
        };
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::start(&config, &supervisor, move |(n, gate): (u32, oneshot::Receiver<()>)| {
            let done_tx = done_tx.clone();
            async move {
                let _ = gate.await;
                let _ = done_tx.send(n);
            }
        })
        .unwrap();

        let (gate0, rx0) = oneshot::channel();
        assert!(pool.try_submit((0, rx0)).is_ok());
        // let the pump hand job 0 to the only worker
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.idle_workers(), 0);

        let (gate1, rx1) = oneshot::channel();
        assert!(pool.try_submit((1, rx1)).is_ok());
        let (_gate2, rx2) = oneshot::channel();
        let rejected = pool.try_submit((2, rx2)).unwrap_err();
        assert_eq!(rejected.0, 2);

        gate0.send(()).unwrap();
        assert_eq!(done_rx.recv().await, Some(0));
        gate1.send(()).unwrap();
        assert_eq!(done_rx.recv().await, Some(1));

        supervisor.stop();
        supervisor.all_stopped().await;
    }
}
