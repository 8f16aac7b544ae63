//! The discovery and probing engine.
//!
//! One task owns every piece of mutable state (job queue, discovery run,
//! transient snapshot, revision counter) and processes events one at a
//! time, so nothing here needs a lock. Probes and timers run as separate
//! tasks that report back through the event channel.

use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::channel::Outbound;
use crate::commands::{self, Command, CommandError};
use crate::config::Config;
use crate::discovery::{Coordinator, GRACE_PERIOD};
use crate::prober::Prober;
use crate::scheduler::{jobs_for, jobs_for_network, JobId, Scheduler};
use crate::store::{StateStore, StoreError};
use crate::types::{Check, Job, Link};

/// Certificates expiring within this window count as expiring soon.
const EXPIRING_SOON_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug)]
pub enum EngineEvent {
    /// The control channel is connected and privileged.
    SessionReady,
    Topology(Vec<Link>),
    CapabilityLine { server: String, line: String },
    CapabilityEnd { server: String },
    GraceElapsed { revision: u64 },
    ProbeFinished { id: JobId, check: Check },
    Command { reply_to: String, command: Command },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to persist state: {0}")]
    Store(#[from] StoreError),
}

/// Snapshot of engine progress for the `info` command.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub discovery_pending: usize,
    pub discovery_in_progress: bool,
    pub queued: usize,
    pub in_flight: usize,
    pub rate: f64,
    pub network_servers: usize,
    pub network_last_updated: i64,
    pub expiry_servers: usize,
    pub expiry_last_updated: i64,
    /// A transient snapshot exists although no job is queued or running.
    pub stale_transient: bool,
}

pub struct Engine {
    config: Arc<Config>,
    store: StateStore,
    discovery: Coordinator,
    scheduler: Scheduler,
    prober: Arc<dyn Prober>,
    events: mpsc::UnboundedSender<EngineEvent>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Engine {
    /// `events` must feed the receiver later passed to [`Engine::run`];
    /// timers and probes report back through it.
    pub fn new(
        config: Arc<Config>,
        store: StateStore,
        prober: Arc<dyn Prober>,
        events: mpsc::UnboundedSender<EngineEvent>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            config,
            store,
            discovery: Coordinator::new(),
            scheduler: Scheduler::new(),
            prober,
            events,
            outbound,
        }
    }

    /// Process events until persisting state fails.
    ///
    /// The engine keeps a sender for its own event channel, so the channel
    /// never closes; shutdown is by aborting the task.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> Result<(), EngineError> {
        let mut ticker = interval(Scheduler::period(self.config.rate));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick(),
                Some(event) = events.recv() => self.handle(event, now_millis())?,
            }
        }
    }

    pub fn handle(&mut self, event: EngineEvent, now: i64) -> Result<(), EngineError> {
        match event {
            EngineEvent::SessionReady => self.start_discovery(),
            EngineEvent::Topology(links) => self.on_topology(&links),
            EngineEvent::CapabilityLine { server, line } => {
                self.discovery.on_capability_line(&server, &line)
            }
            EngineEvent::CapabilityEnd { server } => self.discovery.on_capability_end(&server),
            EngineEvent::GraceElapsed { revision } => self.on_grace_elapsed(revision, now)?,
            EngineEvent::ProbeFinished { id, check } => self.on_probe_finished(id, check, now)?,
            EngineEvent::Command { reply_to, command } => self.on_command(reply_to, command, now),
        }
        Ok(())
    }

    pub fn start_discovery(&mut self) {
        info!("Refreshing network state");
        self.send(Outbound::Links);
    }

    fn on_topology(&mut self, links: &[Link]) {
        let (revision, servers) = self.discovery.begin(links);
        for server in servers {
            self.send(Outbound::StatsP { server });
        }
        let events = self.events.clone();
        tokio::spawn(async move {
            sleep(GRACE_PERIOD).await;
            let _ = events.send(EngineEvent::GraceElapsed { revision });
        });
    }

    fn on_grace_elapsed(&mut self, revision: u64, now: i64) -> Result<(), EngineError> {
        let Some(done) = self.discovery.reconcile(revision) else {
            return Ok(());
        };
        self.store.commit_network(done.network, now)?;
        info!(
            "State refresh complete with {} not responding",
            done.dropped
        );
        for callback in done.callbacks {
            let _ = callback.send(());
        }
        Ok(())
    }

    /// Start at most one queued job.
    pub fn on_tick(&mut self) {
        if self.scheduler.queued() == 0 {
            return;
        }
        self.store.ensure_transient();
        let Some((id, job)) = self.scheduler.dispatch() else {
            return;
        };
        info!(
            "Starting job {}, {}:{}, {}",
            job.server, job.addr, job.port, job.link
        );
        let prober = Arc::clone(&self.prober);
        let events = self.events.clone();
        tokio::spawn(async move {
            let check = prober.probe(&job).await;
            let _ = events.send(EngineEvent::ProbeFinished { id, check });
        });
    }

    fn on_probe_finished(&mut self, id: JobId, check: Check, now: i64) -> Result<(), EngineError> {
        let Some(job) = self.scheduler.finish(id) else {
            debug!("Ignoring repeated completion of job {}", id);
            return Ok(());
        };
        info!(
            "Ended job {}, {}:{}, {} with status {:?}",
            job.server, job.addr, job.port, job.link, check.status
        );
        self.store.record(&job.server, check);
        if self.scheduler.is_idle() {
            self.store.commit_expiry(now)?;
        }
        Ok(())
    }

    fn enqueue(&mut self, jobs: Vec<Job>) -> usize {
        let count = jobs.len();
        for job in jobs {
            self.scheduler.enqueue(job);
        }
        count
    }

    /// Queue a probe of every TLS port of `server`.
    pub fn refresh(&mut self, server: &str) -> Result<usize, CommandError> {
        let ports = self
            .store
            .committed()
            .network_state
            .get(server)
            .ok_or(CommandError::NoSuchServer)?;
        let jobs = jobs_for(server, self.config.dial_addr(server), ports);
        if jobs.is_empty() {
            return Ok(0);
        }
        self.store.begin_server_refresh(server);
        Ok(self.enqueue(jobs))
    }

    /// Queue a probe of every known port, discarding all previous results.
    pub fn refresh_all(&mut self) -> (usize, usize) {
        let network = &self.store.committed().network_state;
        let servers = network.len();
        let jobs = jobs_for_network(network, &self.config);
        // A running batch must still lose its earlier results.
        if jobs.is_empty() && !self.store.has_transient() {
            return (0, servers);
        }
        info!("Refreshing all...");
        self.store.reset_transient();
        (self.enqueue(jobs), servers)
    }

    pub fn check(&self, server: &str) -> Result<&[Check], CommandError> {
        let committed = self.store.committed();
        match committed.expiry_state.get(server) {
            Some(entry) => Ok(&entry.checks),
            None if committed.network_state.contains_key(server) => {
                Err(CommandError::NotProcessed)
            }
            None => Err(CommandError::NoSuchServer),
        }
    }

    /// Successful checks whose certificate has expired, most recent first.
    pub fn expired(&self, now: i64) -> Vec<(String, Check)> {
        let mut found = self.successful_checks(|ts| ts < now);
        found.sort_by_key(|(_, check)| std::cmp::Reverse(check.expiry_ts));
        found
    }

    /// Successful checks expiring within seven days, soonest first.
    pub fn expiring_soon(&self, now: i64) -> Vec<(String, Check)> {
        let mut found = self.successful_checks(|ts| now < ts && ts < now + EXPIRING_SOON_MS);
        found.sort_by_key(|(_, check)| check.expiry_ts);
        found
    }

    fn successful_checks(&self, keep: impl Fn(i64) -> bool) -> Vec<(String, Check)> {
        self.store
            .committed()
            .expiry_state
            .iter()
            .flat_map(|(server, entry)| entry.checks.iter().map(move |check| (server, check)))
            .filter(|(_, check)| check.success_expiry().is_some_and(&keep))
            .map(|(server, check)| (server.clone(), check.clone()))
            .collect()
    }

    pub fn status(&self) -> Status {
        let committed = self.store.committed();
        Status {
            discovery_pending: self.discovery.pending(),
            discovery_in_progress: self.discovery.in_progress(),
            queued: self.scheduler.queued(),
            in_flight: self.scheduler.in_flight(),
            rate: self.config.rate,
            network_servers: committed.network_state.len(),
            network_last_updated: committed.network_last_updated,
            expiry_servers: committed.expiry_state.len(),
            expiry_last_updated: committed.expiry_last_updated,
            stale_transient: self.store.has_transient() && self.scheduler.is_idle(),
        }
    }

    fn on_command(&mut self, reply_to: String, command: Command, now: i64) {
        let rediscover = command == Command::RefreshNet;
        for text in commands::execute(self, command, now) {
            self.send(Outbound::reply(reply_to.clone(), text));
        }
        if rediscover {
            let done = self.discovery.on_complete();
            let outbound = self.outbound.clone();
            tokio::spawn(async move {
                if done.await.is_ok() {
                    let _ = outbound.send(Outbound::reply(reply_to, "Done!"));
                }
            });
            self.start_discovery();
        }
    }

    fn send(&self, message: Outbound) {
        if self.outbound.send(message).is_err() {
            warn!("Control channel is gone, dropping outbound message");
        }
    }
}
