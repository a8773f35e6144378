// Supervised task group.
//
// Every background loop of the coordinator runs inside a `TaskGroup`. A group
// owns its tasks through a `JoinSet` and a shared shutdown signal, so
// stopping the group stops all of them uniformly.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::debug;

pub struct TaskGroup {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl TaskGroup {
    pub fn new(name: &'static str) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { name, shutdown_tx, tasks: Mutex::new(JoinSet::new()) }
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Receiver that flips to `true` when the group shuts down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a task that is dropped when the group shuts down.
    pub fn spawn<F>(&self, task: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_signal();
        let group = self.name;
        self.tasks().spawn(async move {
            tokio::select! {
                _ = fut => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    debug!(group, task, "task stopped");
                }
            }
        });
    }

    /// Run `tick` every `period` until shutdown. The first tick runs after
    /// one full period.
    pub fn spawn_periodic<F, Fut>(&self, task: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(task, async move {
            loop {
                tokio::time::sleep(period).await;
                tick().await;
            }
        });
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every task to stop, then abort and reap whatever is left.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let mut tasks = std::mem::take(&mut *self.tasks());
        tasks.shutdown().await;
        debug!(group = self.name, "task group shut down");
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
