//! Data structures shared by the discovery, probing and storage code.
//!
//! These types are serialised using [`serde`](https://serde.rs/) into the
//! persisted state document, so their field names are part of the on-disk
//! format and must not change.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Server address → its TLS listener ports.
pub type NetworkState = BTreeMap<String, ServerPorts>;

/// Server address → checks recorded during the last committed batch.
pub type ExpiryState = BTreeMap<String, ExpiryEntry>;

/// TLS listeners advertised by one server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPorts {
    pub c2s: Vec<u16>,
    pub s2s: Vec<u16>,
}

impl ServerPorts {
    /// Record a port under the given link type, ignoring duplicates.
    pub fn add(&mut self, link: LinkType, port: u16) {
        let ports = match link {
            LinkType::C2s => &mut self.c2s,
            LinkType::S2s => &mut self.s2s,
        };
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
}

/// Whether a listener faces clients or peer servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    C2s,
    S2s,
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkType::C2s => write!(f, "C2S"),
            LinkType::S2s => write!(f, "S2S"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Success,
    Timeout,
    Error,
}

/// Outcome of a single TLS probe.
///
/// `expiry`, `expiry_ts` and `valid` are only present for
/// [`CheckStatus::Success`]; use the constructors to keep it that way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub addr: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub link: LinkType,
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    #[serde(rename = "expiryTS", default, skip_serializing_if = "Option::is_none")]
    pub expiry_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
}

impl Check {
    pub fn success(job: &Job, expiry: String, expiry_ts: i64, valid: bool) -> Self {
        Self {
            expiry: Some(expiry),
            expiry_ts: Some(expiry_ts),
            valid: Some(valid),
            ..Self::failed(job, CheckStatus::Success)
        }
    }

    pub fn timeout(job: &Job) -> Self {
        Self::failed(job, CheckStatus::Timeout)
    }

    pub fn error(job: &Job) -> Self {
        Self::failed(job, CheckStatus::Error)
    }

    fn failed(job: &Job, status: CheckStatus) -> Self {
        Self {
            addr: job.addr.clone(),
            port: job.port,
            link: job.link,
            status,
            expiry: None,
            expiry_ts: None,
            valid: None,
        }
    }

    /// Expiry timestamp (epoch ms) of a successful check.
    pub fn success_expiry(&self) -> Option<i64> {
        match self.status {
            CheckStatus::Success => self.expiry_ts,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryEntry {
    pub checks: Vec<Check>,
}

/// One scheduled probe. Never mutated after it is queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Server name as known to the network.
    pub server: String,
    /// Address actually dialled; differs from `server` when overridden.
    pub addr: String,
    pub port: u16,
    pub link: LinkType,
}

/// A peer link reported by the topology query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub address: String,
    pub access_via: String,
}

/// The durable, externally visible state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedState {
    pub expiry_state: ExpiryState,
    pub network_state: NetworkState,
    pub expiry_last_updated: i64,
    pub network_last_updated: i64,
}

impl CommittedState {
    pub fn new(now: i64) -> Self {
        Self {
            expiry_last_updated: now,
            network_last_updated: now,
            ..Default::default()
        }
    }
}
