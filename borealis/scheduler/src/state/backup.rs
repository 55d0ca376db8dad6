// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Backup export and the staged restore workflow: a backup is a serialized
//! snapshot on disk; recovery stages one, lets an operator inspect and prune
//! it, then commits it as the live state.

use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use borealis_core::clock::Clock;
use borealis_core::error::{BorealisError, Result};
use borealis_core::model::{ScheduledTask, TaskQuery};

use crate::storage::stores::Snapshot;
use crate::storage::TransactionalStorage;

struct StagedRecovery {
    backup_id: String,
    snapshot: Snapshot,
}

pub struct BackupManager {
    storage: Arc<TransactionalStorage>,
    backup_dir: PathBuf,
    clock: Arc<dyn Clock>,
    staged: Mutex<Option<StagedRecovery>>,
}

impl BackupManager {
    pub fn new(
        storage: Arc<TransactionalStorage>,
        backup_dir: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            backup_dir: backup_dir.into(),
            clock,
            staged: Mutex::new(None),
        }
    }

    /// Serialize the current stores to `backup_dir`, returning the backup id.
    pub async fn perform_backup(&self) -> Result<String> {
        let snapshot = Snapshot {
            timestamp_ms: self.clock.now_millis(),
            stores: self.storage.read(|stores| stores.clone()),
        };
        let backup_id = format!("scheduler-backup-{}", snapshot.timestamp_ms);

        std::fs::create_dir_all(&self.backup_dir)?;
        let path = self.backup_dir.join(&backup_id);
        std::fs::write(&path, serde_json::to_vec(&snapshot)?)?;
        info!("Wrote backup {backup_id} to {}", path.display());
        Ok(backup_id)
    }

    pub fn list_backups(&self) -> Result<Vec<String>> {
        let mut backups = vec![];
        match std::fs::read_dir(&self.backup_dir) {
            Ok(entries) => {
                for entry in entries {
                    let name = entry?.file_name().to_string_lossy().into_owned();
                    if name.starts_with("scheduler-backup-") {
                        backups.push(name);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        backups.sort();
        Ok(backups)
    }

    /// Load a backup into the staging area for inspection.
    pub fn stage_recovery(&self, backup_id: &str) -> Result<()> {
        let mut staged = self.staged.lock();
        if let Some(existing) = staged.as_ref() {
            return Err(BorealisError::RecoveryError(format!(
                "Backup {} is already staged, unload it first",
                existing.backup_id
            )));
        }

        let path = self.backup_dir.join(backup_id);
        let bytes = std::fs::read(&path).map_err(|e| {
            BorealisError::RecoveryError(format!("Backup {backup_id} not found: {e}"))
        })?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| {
            BorealisError::RecoveryError(format!("Backup {backup_id} is corrupt: {e}"))
        })?;

        info!(
            "Staged backup {backup_id} with {} tasks",
            snapshot.stores.tasks.len()
        );
        *staged = Some(StagedRecovery {
            backup_id: backup_id.to_owned(),
            snapshot,
        });
        Ok(())
    }

    /// Query tasks in the staged snapshot.
    pub fn query_recovery(&self, query: &TaskQuery) -> Result<Vec<ScheduledTask>> {
        let staged = self.staged.lock();
        let staged = staged.as_ref().ok_or_else(|| {
            BorealisError::RecoveryError("No recovery is staged".to_owned())
        })?;
        Ok(staged.snapshot.stores.fetch_tasks(query))
    }

    /// Prune tasks from the staged snapshot before committing it.
    pub fn delete_recovery_tasks(&self, query: &TaskQuery) -> Result<usize> {
        let mut staged = self.staged.lock();
        let staged = staged.as_mut().ok_or_else(|| {
            BorealisError::RecoveryError("No recovery is staged".to_owned())
        })?;
        let tasks = &mut staged.snapshot.stores.tasks;
        let before = tasks.len();
        tasks.retain(|_, task| !query.matches(task));
        Ok(before - tasks.len())
    }

    /// Replace the live stores with the staged snapshot.
    pub async fn commit_recovery(&self) -> Result<()> {
        let staged = self.staged.lock().take().ok_or_else(|| {
            BorealisError::RecoveryError("No recovery is staged".to_owned())
        })?;
        info!("Committing staged recovery from {}", staged.backup_id);
        self.storage.restore_from(staged.snapshot.stores).await
    }

    pub fn unload_recovery(&self) -> Result<()> {
        let unloaded = self.staged.lock().take();
        if let Some(unloaded) = unloaded {
            info!("Unloaded staged recovery {}", unloaded.backup_id);
        }
        Ok(())
    }

    pub fn has_staged_recovery(&self) -> bool {
        self.staged.lock().is_some()
    }
}
