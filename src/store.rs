//! Committed state, the transient expiry snapshot, and persistence.
//!
//! Readers only ever see [`CommittedState`]. Probe results accumulate in a
//! transient copy of the expiry map which replaces the committed one in a
//! single step once a batch drains.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

use crate::types::{Check, CommittedState, ExpiryState, NetworkState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("state file {path} is malformed: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for full state snapshots.
pub trait Persist: Send {
    fn save(&mut self, state: &CommittedState) -> Result<(), StoreError>;
}

/// JSON document on disk, rewritten wholesale on every save.
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the existing document, or write a fresh one stamped `now`.
    pub fn load_or_init(&mut self, now: i64) -> Result<CommittedState, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No state at {}, starting fresh", self.path.display());
                let state = CommittedState::new(now);
                self.save(&state)?;
                Ok(state)
            }
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Persist for JsonFile {
    fn save(&mut self, state: &CommittedState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(state)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let io_err = |source: io::Error| StoreError::Io {
            path: tmp.clone(),
            source,
        };
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        info!("Persisted data to disk");
        Ok(())
    }
}

pub struct StateStore {
    committed: CommittedState,
    transient: Option<ExpiryState>,
    persist: Box<dyn Persist>,
}

impl StateStore {
    pub fn new(committed: CommittedState, persist: Box<dyn Persist>) -> Self {
        Self {
            committed,
            transient: None,
            persist,
        }
    }

    pub fn committed(&self) -> &CommittedState {
        &self.committed
    }

    pub fn has_transient(&self) -> bool {
        self.transient.is_some()
    }

    /// Start a full refresh: every previous check is discarded.
    pub fn reset_transient(&mut self) {
        self.transient = Some(ExpiryState::new());
    }

    /// Start a refresh of one server, keeping every other server's checks.
    ///
    /// When a batch is already running its snapshot is reused so results
    /// already gathered for other servers survive.
    pub fn begin_server_refresh(&mut self, server: &str) {
        let committed = &self.committed.expiry_state;
        self.transient
            .get_or_insert_with(|| committed.clone())
            .remove(server);
    }

    /// Create the transient snapshot from committed state if none exists.
    pub fn ensure_transient(&mut self) {
        if self.transient.is_none() {
            debug!("Copying committed state to transient");
            self.transient = Some(self.committed.expiry_state.clone());
        }
    }

    pub fn record(&mut self, server: &str, check: Check) {
        self.ensure_transient();
        if let Some(transient) = self.transient.as_mut() {
            transient
                .entry(server.to_string())
                .or_default()
                .checks
                .push(check);
        }
    }

    /// Replace committed expiry state with the transient snapshot.
    pub fn commit_expiry(&mut self, now: i64) -> Result<(), StoreError> {
        let Some(transient) = self.transient.take() else {
            return Ok(());
        };
        self.committed.expiry_state = transient;
        self.committed.expiry_last_updated = now;
        info!("Replaced committed expiry state with transient state");
        self.persist.save(&self.committed)
    }

    pub fn commit_network(&mut self, network: NetworkState, now: i64) -> Result<(), StoreError> {
        self.committed.network_state = network;
        self.committed.network_last_updated = now;
        self.persist.save(&self.committed)
    }
}
