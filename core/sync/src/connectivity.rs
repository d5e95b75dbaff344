//! Reachability tracking for the remote authority.
//!
//! Two inputs feed the flag: the platform-level reachability signal
//! (authoritative) and failed remote calls (corroborating evidence). Edge
//! events are delivered through a watch channel, so subscribers observe
//! each transition exactly once and duplicate signals at the same state
//! produce no event. Delivering an edge never blocks callers that are
//! enqueuing new local work.

use tokio::sync::watch;
use tracing::{debug, info};

/// Monitors transitions between reachable and unreachable network state.
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_reachable: bool) -> Self {
        let (state, _) = watch::channel(initially_reachable);
        Self { state }
    }

    /// Current reachability flag.
    pub fn is_reachable(&self) -> bool {
        *self.state.borrow()
    }

    /// Apply the platform-level reachability signal. Authoritative: an
    /// explicit online signal overrides any failure evidence.
    ///
    /// Returns `true` when this call caused a transition.
    pub fn set_reachable(&self, reachable: bool) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == reachable {
                false
            } else {
                *state = reachable;
                true
            }
        });
        if changed {
            info!(
                reachable,
                "connectivity transition: became {}",
                if reachable { "reachable" } else { "unreachable" }
            );
        }
        changed
    }

    /// Record a failed remote call as evidence that the authority is
    /// unreachable. Corroborating only: a later platform online event
    /// always wins.
    pub fn report_remote_failure(&self) {
        if self.set_reachable(false) {
            debug!("marked unreachable after failed remote call");
        }
    }

    /// Subscribe to reachability transitions.
    ///
    /// The receiver's `changed()` future resolves once per transition;
    /// coalesced duplicates at the same state are never delivered.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}
