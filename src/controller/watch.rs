//! Watch-list divergence reporting.
//!
//! The set of downstream kinds a controller must watch follows from the
//! templates its plans render; when that set drifts from the configured
//! watch list, the process must rebuild its subscriptions. Controllers
//! report the divergence through a [`WatchReporter`]; the owning process
//! drives a [`WatchSupervisor`] which debounces bursts (many objects
//! reconciling after a plan change) into a single restart decision.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::ApiVersionKind;

/// Order-insensitive watch-list comparison.
pub fn watch_lists_equal(left: &[ApiVersionKind], right: &[ApiVersionKind]) -> bool {
    let left: BTreeSet<&ApiVersionKind> = left.iter().collect();
    let right: BTreeSet<&ApiVersionKind> = right.iter().collect();
    left == right
}

/// Event emitted when a controller's configuration no longer matches what
/// its workload requires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerEvent {
    ConfigurationChanged {
        controller: &'static str,
        needed: Vec<ApiVersionKind>,
    },
}

/// A coalesced restart decision: which controllers need their
/// subscriptions rebuilt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestartDecision {
    pub controllers: BTreeSet<&'static str>,
}

/// Controller-side handle for reporting divergence.
#[derive(Clone, Debug)]
pub struct WatchReporter {
    sender: mpsc::UnboundedSender<ControllerEvent>,
}

impl WatchReporter {
    /// Compare the configured and needed watch lists, reporting when they
    /// diverge. Returns whether a report was sent.
    pub fn report_if_changed(
        &self,
        controller: &'static str,
        configured: &[ApiVersionKind],
        needed: &[ApiVersionKind],
    ) -> bool {
        if watch_lists_equal(configured, needed) {
            return false;
        }
        info!(
            controller,
            configured = configured.len(),
            needed = needed.len(),
            "watch list diverged from configuration"
        );
        if self
            .sender
            .send(ControllerEvent::ConfigurationChanged {
                controller,
                needed: needed.to_vec(),
            })
            .is_err()
        {
            warn!(controller, "watch supervisor is gone, dropping report");
        }
        true
    }
}

/// Owner-side half: collects divergence reports and emits one decision per
/// quiet window.
pub struct WatchSupervisor {
    receiver: mpsc::UnboundedReceiver<ControllerEvent>,
    debounce: Duration,
}

impl WatchSupervisor {
    pub fn channel(debounce: Duration) -> (WatchReporter, WatchSupervisor) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            WatchReporter { sender },
            WatchSupervisor { receiver, debounce },
        )
    }

    /// Wait for the next restart decision. Returns `None` once every
    /// reporter has been dropped and the queue is drained.
    pub async fn next_restart(&mut self) -> Option<RestartDecision> {
        let first = self.receiver.recv().await?;
        let mut decision = RestartDecision::default();
        Self::absorb(&mut decision, first);

        // Keep absorbing until the stream stays quiet for the debounce
        // window.
        loop {
            match timeout(self.debounce, self.receiver.recv()).await {
                Ok(Some(event)) => Self::absorb(&mut decision, event),
                Ok(None) | Err(_) => break,
            }
        }
        Some(decision)
    }

    fn absorb(decision: &mut RestartDecision, event: ControllerEvent) {
        match event {
            ControllerEvent::ConfigurationChanged { controller, .. } => {
                decision.controllers.insert(controller);
            }
        }
    }
}
