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

//! The transactional storage facade. Every mutation of scheduler state flows
//! through [`TransactionalStorage::write`]; each committed transaction
//! appends exactly one record to the underlying log.

pub mod log;
pub mod stores;

use std::ops::Deref;
use std::sync::Arc;

use ::log::{debug, info};
use parking_lot::RwLock;
use tokio::sync::Mutex;

use borealis_core::clock::Clock;
use borealis_core::error::Result;
use borealis_core::model::{
    HostAttributes, JobConfiguration, JobKey, Lock, LockKey, ResourceAggregate,
    ScheduledTask,
};

use crate::metrics::SchedulerMetricsCollector;
use crate::storage::log::LogStore;
use crate::storage::stores::{Op, Snapshot, Stores};

/// Mutable view handed to a write transaction. Reads through `Deref` observe
/// the caller's own uncommitted writes; every mutation is captured as an
/// [`Op`] for the commit-time log record.
pub struct WriteTxn<'a> {
    stores: &'a mut Stores,
    ops: &'a mut Vec<Op>,
}

impl WriteTxn<'_> {
    fn record(&mut self, op: Op) {
        self.stores.apply(&op);
        self.ops.push(op);
    }

    pub fn save_tasks(&mut self, tasks: Vec<ScheduledTask>) {
        if !tasks.is_empty() {
            self.record(Op::SaveTasks(tasks));
        }
    }

    pub fn remove_tasks(&mut self, task_ids: Vec<String>) {
        if !task_ids.is_empty() {
            self.record(Op::RemoveTasks(task_ids));
        }
    }

    pub fn save_job(&mut self, job: JobConfiguration) {
        self.record(Op::SaveJob(job));
    }

    pub fn remove_job(&mut self, key: JobKey) {
        self.record(Op::RemoveJob(key));
    }

    pub fn save_quota(&mut self, role: impl Into<String>, quota: ResourceAggregate) {
        self.record(Op::SaveQuota {
            role: role.into(),
            quota,
        });
    }

    pub fn remove_quota(&mut self, role: impl Into<String>) {
        self.record(Op::RemoveQuota(role.into()));
    }

    pub fn save_lock(&mut self, lock: Lock) {
        self.record(Op::SaveLock(lock));
    }

    pub fn remove_lock(&mut self, key: LockKey) {
        self.record(Op::RemoveLock(key));
    }

    pub fn save_host_attributes(&mut self, attributes: HostAttributes) {
        self.record(Op::SaveHostAttributes(attributes));
    }

    pub fn save_framework_id(&mut self, framework_id: impl Into<String>) {
        self.record(Op::SaveFrameworkId(framework_id.into()));
    }
}

impl Deref for WriteTxn<'_> {
    type Target = Stores;

    fn deref(&self) -> &Stores {
        self.stores
    }
}

/// Serializes all writers, keeps the committed stores behind a read-write
/// lock, and appends one log record per committed transaction. Recovery is
/// snapshot load plus ordered replay.
pub struct TransactionalStorage {
    stores: RwLock<Stores>,
    write_lock: Mutex<()>,
    log: Arc<dyn LogStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn SchedulerMetricsCollector>,
}

impl TransactionalStorage {
    pub fn new(
        log: Arc<dyn LogStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn SchedulerMetricsCollector>,
    ) -> Self {
        Self {
            stores: RwLock::new(Stores::default()),
            write_lock: Mutex::new(()),
            log,
            clock,
            metrics,
        }
    }

    /// Snapshot-consistent read of the committed stores.
    pub fn read<T>(&self, f: impl FnOnce(&Stores) -> T) -> T {
        f(&self.stores.read())
    }

    /// Run `f` as a write transaction. The transaction works on a copy of
    /// the committed stores; on success its ops are appended to the log as a
    /// single record and the copy replaces the committed state. On error
    /// nothing is persisted and nothing becomes visible.
    pub async fn write<T>(
        &self,
        f: impl FnOnce(&mut WriteTxn) -> Result<T>,
    ) -> Result<T> {
        let _writer = self.write_lock.lock().await;

        let mut working = self.stores.read().clone();
        let mut ops = Vec::new();
        let result = f(&mut WriteTxn {
            stores: &mut working,
            ops: &mut ops,
        })?;

        if !ops.is_empty() {
            self.log.append_ops(&ops).await?;
            self.metrics.record_log_append();
            *self.stores.write() = working;
        }

        Ok(result)
    }

    /// Serialize every store into one snapshot record and truncate the log.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let _writer = self.write_lock.lock().await;

        let snapshot = Snapshot {
            timestamp_ms: self.clock.now_millis(),
            stores: self.stores.read().clone(),
        };
        self.log.write_snapshot(&snapshot).await?;
        self.metrics.record_snapshot();
        info!(
            "Wrote log snapshot with {} tasks and {} jobs",
            snapshot.stores.tasks.len(),
            snapshot.stores.jobs.len()
        );
        Ok(snapshot)
    }

    /// Rebuild the stores from the latest snapshot plus subsequent records.
    pub async fn recover(&self) -> Result<()> {
        let _writer = self.write_lock.lock().await;

        let contents = self.log.restore().await?;
        let mut stores = contents
            .snapshot
            .map(|snapshot| snapshot.stores)
            .unwrap_or_default();
        let replayed = contents.batches.len();
        for batch in &contents.batches {
            for op in batch {
                stores.apply(op);
            }
        }

        info!(
            "Recovered {} tasks and {} jobs after replaying {} log records",
            stores.tasks.len(),
            stores.jobs.len(),
            replayed
        );
        *self.stores.write() = stores;
        Ok(())
    }

    /// Replace the entire committed state, e.g. when an operator commits a
    /// staged recovery, and immediately re-snapshot so the log agrees.
    pub async fn restore_from(&self, stores: Stores) -> Result<()> {
        {
            let _writer = self.write_lock.lock().await;
            *self.stores.write() = stores;
        }
        debug!("Restored stores from staged state, writing snapshot");
        self.snapshot().await?;
        Ok(())
    }
}
