use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::SystemTime,
};

use thiserror::Error;
use widestring::U16String;

use crate::event::{Architecture, Pid};

/// Process metadata shared between the sensor and its plugins.
///
/// The sensor inserts a process before its create event is broadcast and
/// removes it after the terminate event has been delivered, so plugins can
/// always query the process they are being notified about.
#[derive(Debug, Clone, Default)]
pub struct ProcessCache {
    processes: Arc<RwLock<HashMap<Pid, ProcessInfo>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub ppid: Pid,
    pub image: U16String,
    pub architecture: Architecture,
    pub wow64: bool,
    pub create_time: SystemTime,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("process {0} not found")]
    ProcessNotFound(Pid),
}

impl ProcessCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `info` for `pid`, returning the entry of a previous process
    /// which used the same pid.
    pub fn insert(&self, pid: Pid, info: ProcessInfo) -> Option<ProcessInfo> {
        let stale = self
            .processes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, info);
        if stale.is_some() {
            log::debug!("pid {pid} reused before its terminate notification");
        }
        stale
    }

    pub fn get(&self, pid: Pid) -> Result<ProcessInfo, CacheError> {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
            .ok_or(CacheError::ProcessNotFound(pid))
    }

    pub fn remove(&self, pid: Pid) -> Option<ProcessInfo> {
        self.processes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
