//! Work dispatch: a bounded worker pool over object keys.
//!
//! Notifications are keyed by lifecycle object. At most one pass runs per
//! key at a time; notifications arriving while a pass is in flight
//! coalesce into a single rerun. Pass failures are logged and dropped —
//! reconciliation is level-triggered, so the next notification (or the
//! rerun) re-evaluates the world from scratch.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::controller::{BindingController, InstanceController};
use crate::errors::OperonResult;
use crate::model::ObjectKey;

/// A lifecycle controller the dispatcher can drive.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey) -> OperonResult<()>;
}

#[async_trait]
impl Reconcile for InstanceController {
    async fn reconcile(&self, key: &ObjectKey) -> OperonResult<()> {
        // Resolves to the inherent reconcile pass.
        InstanceController::reconcile(self, key).await
    }
}

#[async_trait]
impl Reconcile for BindingController {
    async fn reconcile(&self, key: &ObjectKey) -> OperonResult<()> {
        BindingController::reconcile(self, key).await
    }
}

#[derive(Default)]
struct DispatchState {
    queue: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    active: HashSet<ObjectKey>,
    rerun: HashSet<ObjectKey>,
}

struct Shared {
    state: Mutex<DispatchState>,
    wake: Notify,
    shutdown: AtomicBool,
}

/// Worker pool driving one controller.
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn `workers` tasks over `controller`.
    pub fn start(controller: Arc<dyn Reconcile>, workers: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(DispatchState::default()),
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
        });

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    worker_loop(worker_id, shared, controller).await;
                })
            })
            .collect();

        Self {
            shared,
            workers: handles,
        }
    }

    /// Notify the pool that `key` may need reconciliation.
    pub async fn notify(&self, key: ObjectKey) {
        let mut state = self.shared.state.lock().await;
        if state.active.contains(&key) {
            // Coalesce: one rerun after the in-flight pass finishes.
            state.rerun.insert(key);
        } else if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.shared.wake.notify_one();
        }
    }

    /// Stop accepting work and wait for in-flight passes to finish.
    pub async fn shutdown(self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
        for handle in self.workers {
            if let Err(err) = handle.await {
                warn!(error = %err, "dispatch worker panicked");
            }
        }
    }
}

async fn worker_loop(worker_id: usize, shared: Arc<Shared>, controller: Arc<dyn Reconcile>) {
    loop {
        let key = {
            let mut state = shared.state.lock().await;
            match state.queue.pop_front() {
                Some(key) => {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    Some(key)
                }
                None => None,
            }
        };

        let Some(key) = key else {
            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
            shared.wake.notified().await;
            continue;
        };

        debug!(worker_id, object = %key, "reconciling");
        if let Err(err) = controller.reconcile(&key).await {
            warn!(worker_id, object = %key, error = %err, "reconcile pass failed");
        }

        let mut state = shared.state.lock().await;
        state.active.remove(&key);
        if state.rerun.remove(&key) && state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            shared.wake.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Recording {
        passes: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    struct RecordingController {
        stats: Arc<Recording>,
    }

    #[async_trait]
    impl Reconcile for RecordingController {
        async fn reconcile(&self, _key: &ObjectKey) -> OperonResult<()> {
            let now = self.stats.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.stats.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.stats.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.stats.passes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn stats() -> Arc<Recording> {
        Arc::new(Recording {
            passes: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn processes_every_notified_key() {
        let stats = stats();
        let dispatcher = Dispatcher::start(
            Arc::new(RecordingController {
                stats: stats.clone(),
            }),
            4,
        );

        for i in 0..8 {
            dispatcher.notify(ObjectKey::new("default", format!("i{i}"))).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        dispatcher.shutdown().await;

        assert_eq!(stats.passes.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn duplicate_notifications_coalesce() {
        let stats = stats();
        let dispatcher = Dispatcher::start(
            Arc::new(RecordingController {
                stats: stats.clone(),
            }),
            4,
        );

        let key = ObjectKey::new("default", "i1");
        // One pass starts; the burst while it runs coalesces into at most
        // one rerun.
        dispatcher.notify(key.clone()).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        for _ in 0..5 {
            dispatcher.notify(key.clone()).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        dispatcher.shutdown().await;

        let passes = stats.passes.load(Ordering::SeqCst);
        assert!((1..=2).contains(&passes), "got {passes} passes");
        // A single key never runs concurrently with itself.
        assert_eq!(stats.max_concurrent.load(Ordering::SeqCst), 1);
    }
}
