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

use std::sync::Arc;

use log::info;

use borealis_core::clock::Clock;
use borealis_core::error::Result;
use borealis_core::model::{TaskQuery, TaskState};

use crate::config::SchedulerConfig;
use crate::metrics::SchedulerMetricsCollector;
use crate::state::backup::BackupManager;
use crate::state::lock_manager::LockManager;
use crate::state::maintenance::MaintenanceManager;
use crate::state::offer_manager::OfferManager;
use crate::state::preemptor::PriorityPreemptor;
use crate::state::quota_manager::QuotaManager;
use crate::state::task_assigner::TaskAssigner;
use crate::state::task_groups::{RateLimiter, TaskGroups, TruncatedBinaryBackoff};
use crate::state::task_manager::{TaskLauncher, TaskManager};
use crate::storage::log::LogStore;
use crate::storage::TransactionalStorage;

pub mod backup;
pub mod lock_manager;
pub mod maintenance;
pub mod offer_manager;
pub mod preemptor;
pub mod quota_manager;
pub mod task_assigner;
pub mod task_groups;
pub mod task_manager;
pub mod task_state_machine;

/// The composed scheduler core: storage plus every manager, with the
/// placement and preemption seams resolved.
pub struct SchedulerState {
    pub storage: Arc<TransactionalStorage>,
    pub task_manager: Arc<TaskManager>,
    pub offer_manager: Arc<OfferManager>,
    pub task_groups: Arc<TaskGroups>,
    pub lock_manager: LockManager,
    pub quota_manager: QuotaManager,
    pub maintenance: MaintenanceManager,
    pub backup_manager: BackupManager,
}

impl SchedulerState {
    pub fn new(
        log: Arc<dyn LogStore>,
        launcher: Arc<dyn TaskLauncher>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn SchedulerMetricsCollector>,
        config: SchedulerConfig,
    ) -> Self {
        let storage = Arc::new(TransactionalStorage::new(
            log,
            clock.clone(),
            metrics.clone(),
        ));
        let task_manager = Arc::new(TaskManager::new(
            storage.clone(),
            launcher.clone(),
            clock.clone(),
            metrics.clone(),
            config.clone(),
        ));
        let offer_manager = Arc::new(OfferManager::default());
        let assigner = Arc::new(TaskAssigner::new(
            storage.clone(),
            offer_manager.clone(),
            task_manager.clone(),
            launcher,
        ));
        let preemptor = Arc::new(PriorityPreemptor::new(
            storage.clone(),
            task_manager.clone(),
        ));
        let task_groups = Arc::new(TaskGroups::new(
            assigner,
            preemptor,
            Arc::new(RateLimiter::new(config.scheduling_rate_limit_qps)),
            Arc::new(TruncatedBinaryBackoff::new(
                config.initial_penalty_ms,
                config.max_penalty_ms,
            )),
            clock.clone(),
            metrics,
        ));
        let lock_manager = LockManager::new(storage.clone(), clock.clone());
        let quota_manager = QuotaManager::new(storage.clone());
        let maintenance =
            MaintenanceManager::new(storage.clone(), task_manager.clone());
        let backup_manager =
            BackupManager::new(storage.clone(), config.backup_dir.clone(), clock);

        Self {
            storage,
            task_manager,
            offer_manager,
            task_groups,
            lock_manager,
            quota_manager,
            maintenance,
            backup_manager,
        }
    }

    /// Recover storage from the log, rebuild the state machines, and arm the
    /// scheduling loop with every PENDING task. Only after this returns is
    /// the scheduler ready to serve.
    pub async fn init(&self) -> Result<usize> {
        self.storage.recover().await?;
        self.task_manager.seed_machines();

        let pending = self.storage.read(|stores| {
            stores.fetch_tasks(&TaskQuery::all().with_statuses([TaskState::Pending]))
        });
        let pending_count = pending.len();
        self.task_groups.storage_ready(pending, || {
            self.task_manager.startup_reschedule_delay_ms()
        });
        info!("Scheduler state is ready, {pending_count} tasks re-entered the scheduling loop");
        Ok(pending_count)
    }
}
