use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use crate::record::Record;

/// Most recent activity lines kept in the status log.
pub const LOG_CAPACITY: usize = 10;

/// Latest records per page plus a bounded activity log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusState {
    pub data: BTreeMap<u32, Vec<Record>>,
    pub log: VecDeque<String>,
}

impl StatusState {
    /// Replaces the records held for `page` wholesale.
    pub fn set_page(&mut self, page: u32, records: Vec<Record>) {
        self.data.insert(page, records);
    }

    /// Appends a log line, evicting the oldest once `LOG_CAPACITY` is reached.
    pub fn push_log(&mut self, line: impl Into<String>) {
        if self.log.len() >= LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(line.into());
    }
}

/// Shared handle to the single process-wide `StatusState`.
///
/// Writers go through [`StatusHandle::update`], which holds the write lock for
/// the whole closure, so each update is one atomic read-modify-write. Readers
/// get a cloned snapshot and never observe a half-applied update.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<RwLock<StatusState>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut StatusState) -> T,
    {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn read<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&StatusState) -> T,
    {
        let state = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    pub fn snapshot(&self) -> StatusState {
        self.read(StatusState::clone)
    }
}
