// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Run ownership records. The telemetry pipeline needs to know who owns a
//! run and whether it exists; how that's persisted (database, another
//! service, an in-memory map) is opaque to everything upstream of
//! [`RecordStore`].

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::HubError;

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub owner: String,
}

/// Owns the mapping from run-id to its owning principal.
pub trait RecordStore: Send + Sync {
    fn get_run(&self, run_id: &str) -> Result<RunRecord, HubError>;
    fn create_run(&self, run_id: &str, owner: &str) -> Result<(), HubError>;

    /// Whether `principal` may subscribe to or otherwise access `run_id`,
    /// given `is_superuser`.
    fn check_access(&self, run_id: &str, principal: &str, is_superuser: bool) -> Result<(), HubError> {
        let record = self.get_run(run_id)?;
        if is_superuser || record.owner == principal {
            Ok(())
        } else {
            Err(HubError::AccessDenied)
        }
    }
}

/// In-memory reference implementation, sufficient for tests and single-process
/// deployments; a real deployment backs this with whatever durable store
/// tracks run ownership.
pub struct InMemoryRecordStore {
    runs: RwLock<HashMap<String, RunRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self { runs: RwLock::new(HashMap::new()) }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn get_run(&self, run_id: &str) -> Result<RunRecord, HubError> {
        self.runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .cloned()
            .ok_or(HubError::NotFound)
    }

    fn create_run(&self, run_id: &str, owner: &str) -> Result<(), HubError> {
        self.runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id.to_owned(), RunRecord { run_id: run_id.to_owned(), owner: owner.to_owned() });
        Ok(())
    }
}
