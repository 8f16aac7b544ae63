//! FIFO job queue and in-flight bookkeeping.
//!
//! The scheduler only bounds how fast probes start; it never limits how
//! many are running at once.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::config::Config;
use crate::types::{Job, LinkType, NetworkState, ServerPorts};

/// Identifies one dispatched job until its first completion.
pub type JobId = u64;

#[derive(Debug, Default)]
pub struct Scheduler {
    queue: VecDeque<Job>,
    in_flight: HashMap<JobId, Job>,
    next_id: JobId,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tick period for `rate` jobs per second.
    pub fn period(rate: f64) -> Duration {
        Duration::from_secs_f64(1.0 / rate)
    }

    pub fn enqueue(&mut self, job: Job) {
        self.queue.push_back(job);
    }

    /// Pop the next job and mark it in flight.
    pub fn dispatch(&mut self) -> Option<(JobId, Job)> {
        let job = self.queue.pop_front()?;
        let id = self.next_id;
        self.next_id += 1;
        self.in_flight.insert(id, job.clone());
        Some((id, job))
    }

    /// Close job `id`. Only the first call for an id returns the job.
    pub fn finish(&mut self, id: JobId) -> Option<Job> {
        self.in_flight.remove(&id)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }
}

/// Jobs for every TLS port of `server`, client ports first.
pub fn jobs_for(server: &str, addr: &str, ports: &ServerPorts) -> Vec<Job> {
    let c2s = ports.c2s.iter().map(|&port| (port, LinkType::C2s));
    let s2s = ports.s2s.iter().map(|&port| (port, LinkType::S2s));
    c2s.chain(s2s)
        .map(|(port, link)| Job {
            server: server.to_string(),
            addr: addr.to_string(),
            port,
            link,
        })
        .collect()
}

/// Jobs for the whole network, dialling overridden addresses where configured.
pub fn jobs_for_network(network: &NetworkState, config: &Config) -> Vec<Job> {
    network
        .iter()
        .flat_map(|(server, ports)| jobs_for(server, config.dial_addr(server), ports))
        .collect()
}
