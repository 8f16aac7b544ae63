//! Revision-guarded topology discovery.
//!
//! Each topology response starts a new run tagged with the next revision.
//! Nothing already in flight is cancelled; results belonging to an older
//! revision are simply ignored when they would take effect.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::oneshot;

use crate::stats::parse_listener_line;
use crate::types::{Link, LinkType, NetworkState};

/// Delay between a topology response and reconciliation of its run.
pub const GRACE_PERIOD: Duration = Duration::from_millis(3000);

/// Result of reconciling the current run.
#[derive(Debug)]
pub struct Reconciled {
    pub network: NetworkState,
    pub dropped: usize,
    pub callbacks: Vec<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
pub struct Coordinator {
    revision: u64,
    pending: HashSet<String>,
    draft: Option<NetworkState>,
    callbacks: Vec<oneshot::Sender<()>>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Servers of the current run that have not finished their report.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Whether a run is waiting for its grace period to end.
    pub fn in_progress(&self) -> bool {
        self.draft.is_some()
    }

    /// Register a continuation fired once the next reconciliation commits.
    pub fn on_complete(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.callbacks.push(tx);
        rx
    }

    /// Begin a new run, superseding any previous one.
    ///
    /// Returns the run's revision and the servers that must be sent a
    /// capability query, in sorted order.
    pub fn begin(&mut self, links: &[Link]) -> (u64, Vec<String>) {
        let servers: BTreeSet<&str> = links
            .iter()
            .flat_map(|link| [link.address.as_str(), link.access_via.as_str()])
            .collect();

        self.revision += 1;
        self.pending = servers.iter().map(|s| s.to_string()).collect();
        self.draft = Some(
            servers
                .iter()
                .map(|s| (s.to_string(), Default::default()))
                .collect(),
        );
        info!(
            "Discovery revision {} with {} servers",
            self.revision,
            servers.len()
        );
        (
            self.revision,
            servers.into_iter().map(str::to_string).collect(),
        )
    }

    /// Apply one listener line from `server`'s capability report.
    ///
    /// Lines from servers not pending in the current run, lines that do not
    /// parse, and non-TLS listeners are ignored.
    pub fn on_capability_line(&mut self, server: &str, line: &str) {
        if !self.pending.contains(server) {
            return;
        }
        let Some(ports) = self.draft.as_mut().and_then(|d| d.get_mut(server)) else {
            return;
        };
        match parse_listener_line(line) {
            Ok(listener) if listener.is_tls => {
                let link = if listener.is_peer_only {
                    LinkType::S2s
                } else {
                    LinkType::C2s
                };
                ports.add(link, listener.port);
            }
            Ok(_) => {}
            Err(e) => debug!("Ignoring line from {}: {}", server, e),
        }
    }

    pub fn on_capability_end(&mut self, server: &str) {
        self.pending.remove(server);
    }

    /// Close the run tagged `revision`.
    ///
    /// Returns `None` when a newer run has superseded it. Otherwise servers
    /// that never finished their report are dropped from the draft, which is
    /// handed back along with the continuations to fire.
    pub fn reconcile(&mut self, revision: u64) -> Option<Reconciled> {
        if revision != self.revision {
            debug!(
                "Ignoring stale reconciliation {} (current {})",
                revision, self.revision
            );
            return None;
        }
        let mut network = self.draft.take()?;
        let dropped = self.pending.len();
        for server in self.pending.drain() {
            network.remove(&server);
        }
        Some(Reconciled {
            network,
            dropped,
            callbacks: std::mem::take(&mut self.callbacks),
        })
    }
}
