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

//! Host maintenance lifecycle: NONE → SCHEDULED → DRAINING → DRAINED → NONE.
//! Draining a host restarts its active tasks elsewhere; a draining host with
//! no active tasks left flips to DRAINED.

use std::sync::Arc;

use log::info;

use borealis_core::error::Result;
use borealis_core::model::{
    HostAttributes, MaintenanceMode, TaskQuery, TaskState,
};

use crate::state::task_manager::{StateChange, TaskManager};
use crate::storage::TransactionalStorage;

/// One host's maintenance status, as reported to operators.
#[derive(Debug, Clone, PartialEq)]
pub struct HostStatus {
    pub host: String,
    pub mode: MaintenanceMode,
}

pub struct MaintenanceManager {
    storage: Arc<TransactionalStorage>,
    task_manager: Arc<TaskManager>,
}

impl MaintenanceManager {
    pub fn new(
        storage: Arc<TransactionalStorage>,
        task_manager: Arc<TaskManager>,
    ) -> Self {
        Self {
            storage,
            task_manager,
        }
    }

    async fn set_modes(
        &self,
        hosts: &[String],
        mode: MaintenanceMode,
    ) -> Result<Vec<HostStatus>> {
        let hosts = hosts.to_vec();
        self.storage
            .write(move |txn| {
                let mut statuses = vec![];
                for host in hosts {
                    let mut attrs = txn
                        .fetch_host_attributes(&host)
                        .cloned()
                        .unwrap_or_else(|| HostAttributes::new(&host));
                    attrs.mode = mode;
                    statuses.push(HostStatus {
                        host: attrs.host.clone(),
                        mode,
                    });
                    txn.save_host_attributes(attrs);
                }
                Ok(statuses)
            })
            .await
    }

    /// NONE → SCHEDULED: mark hosts for upcoming maintenance so the
    /// scheduler can plan around them.
    pub async fn start_maintenance(&self, hosts: &[String]) -> Result<Vec<HostStatus>> {
        info!("Scheduling maintenance on {hosts:?}");
        self.set_modes(hosts, MaintenanceMode::Scheduled).await
    }

    /// SCHEDULED → DRAINING: evict every active task from the hosts by
    /// restarting it (kill + reschedule elsewhere). Returns the host
    /// statuses plus the committed task changes for the event bus.
    pub async fn drain(
        &self,
        hosts: &[String],
    ) -> Result<(Vec<HostStatus>, Vec<StateChange>)> {
        info!("Draining hosts {hosts:?}");
        let mut statuses = self.set_modes(hosts, MaintenanceMode::Draining).await?;

        let mut all_changes = vec![];
        for host in hosts {
            let query = TaskQuery::all().active().with_slave_host(host.clone());
            let matched = self
                .storage
                .read(|stores| !stores.fetch_tasks(&query).is_empty());
            if matched {
                let (_, changes) = self
                    .task_manager
                    .change_states_matching(
                        &query,
                        TaskState::Restarting,
                        Some(format!("Host {host} is draining for maintenance")),
                    )
                    .await?;
                all_changes.extend(changes);
            }
        }

        // Hosts that were already empty drain immediately.
        for status in &mut statuses {
            if self.check_drained(&status.host).await? {
                status.mode = MaintenanceMode::Drained;
            }
        }
        Ok((statuses, all_changes))
    }

    /// A DRAINING host with zero active tasks becomes DRAINED. Invoked for
    /// each terminal state change observed on the event bus.
    pub async fn check_drained(&self, host: &str) -> Result<bool> {
        let host = host.to_owned();
        self.storage
            .write(move |txn| {
                let Some(attrs) = txn.fetch_host_attributes(&host).cloned() else {
                    return Ok(false);
                };
                if attrs.mode != MaintenanceMode::Draining {
                    return Ok(false);
                }
                let query = TaskQuery::all().active().with_slave_host(&host);
                if !txn.fetch_tasks(&query).is_empty() {
                    return Ok(false);
                }
                let mut drained = attrs;
                drained.mode = MaintenanceMode::Drained;
                txn.save_host_attributes(drained);
                info!("Host {host} has drained");
                Ok(true)
            })
            .await
    }

    /// Back to NONE; the host is schedulable again.
    pub async fn end_maintenance(&self, hosts: &[String]) -> Result<Vec<HostStatus>> {
        info!("Ending maintenance on {hosts:?}");
        self.set_modes(hosts, MaintenanceMode::None).await
    }

    pub fn status(&self, hosts: &[String]) -> Vec<HostStatus> {
        self.storage.read(|stores| {
            hosts
                .iter()
                .map(|host| HostStatus {
                    host: host.clone(),
                    mode: stores
                        .fetch_host_attributes(host)
                        .map(|attrs| attrs.mode)
                        .unwrap_or(MaintenanceMode::None),
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use borealis_core::clock::SystemClock;
    use borealis_core::model::{
        AssignedTask, Identity, JobKey, ResourceRequest, ScheduledTask, TaskConfig,
    };

    use crate::config::SchedulerConfig;
    use crate::metrics::InProcessMetricsCollector;
    use crate::storage::log::MemoryLogStore;
    use crate::test_utils::RecordingLauncher;

    use super::*;

    struct Fixture {
        storage: Arc<TransactionalStorage>,
        manager: MaintenanceManager,
        task_manager: Arc<TaskManager>,
        launcher: Arc<RecordingLauncher>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(TransactionalStorage::new(
            Arc::new(MemoryLogStore::default()),
            Arc::new(SystemClock),
            Arc::new(InProcessMetricsCollector::default()),
        ));
        let launcher = Arc::new(RecordingLauncher::default());
        let task_manager = Arc::new(TaskManager::new(
            storage.clone(),
            launcher.clone(),
            Arc::new(SystemClock),
            Arc::new(InProcessMetricsCollector::default()),
            SchedulerConfig::default(),
        ));
        let manager = MaintenanceManager::new(storage.clone(), task_manager.clone());
        Fixture {
            storage,
            manager,
            task_manager,
            launcher,
        }
    }

    async fn running_task(storage: &TransactionalStorage, task_id: &str, host: &str) {
        let config = TaskConfig {
            job: JobKey::new("web", "prod", "api"),
            owner: Identity::new("ops"),
            is_service: true,
            priority: 0,
            production: false,
            max_task_failures: -1,
            resources: ResourceRequest::new(1.0, 100, 10),
            command: "run".to_owned(),
            constraints: vec![],
            metadata: BTreeMap::new(),
        };
        let mut assigned = AssignedTask::new(task_id, 0, config);
        assigned.slave_host = Some(host.to_owned());
        storage
            .write(|txn| {
                txn.save_tasks(vec![ScheduledTask {
                    assigned,
                    status: TaskState::Running,
                    failure_count: 0,
                    ancestor_id: None,
                    task_events: vec![],
                }]);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_none_scheduled_draining_drained_none() -> Result<()> {
        let f = fixture();
        let hosts = vec!["hostA".to_owned()];

        assert_eq!(f.manager.status(&hosts)[0].mode, MaintenanceMode::None);

        let statuses = f.manager.start_maintenance(&hosts).await?;
        assert_eq!(statuses[0].mode, MaintenanceMode::Scheduled);

        // No active tasks: draining completes immediately.
        let (statuses, _) = f.manager.drain(&hosts).await?;
        assert_eq!(statuses[0].mode, MaintenanceMode::Drained);

        let statuses = f.manager.end_maintenance(&hosts).await?;
        assert_eq!(statuses[0].mode, MaintenanceMode::None);
        Ok(())
    }

    #[tokio::test]
    async fn test_drain_restarts_active_tasks() -> Result<()> {
        let f = fixture();
        running_task(&f.storage, "t-1", "hostA").await;
        running_task(&f.storage, "t-2", "hostB").await;

        let (statuses, changes) = f.manager.drain(&["hostA".to_owned()]).await?;
        assert_eq!(statuses[0].mode, MaintenanceMode::Draining);
        assert!(changes
            .iter()
            .any(|c| c.task_id == "t-1" && c.to == TaskState::Restarting));

        f.storage.read(|stores| {
            assert_eq!(
                stores.fetch_task("t-1").unwrap().status,
                TaskState::Restarting
            );
            // Other hosts are untouched.
            assert_eq!(stores.fetch_task("t-2").unwrap().status, TaskState::Running);
        });
        assert_eq!(f.launcher.killed(), vec!["t-1".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_host_drains_once_tasks_terminate() -> Result<()> {
        let f = fixture();
        running_task(&f.storage, "t-1", "hostA").await;

        f.manager.drain(&["hostA".to_owned()]).await?;
        assert!(!f.manager.check_drained("hostA").await?);

        // The agent confirms the kill; RESTARTING -> KILLED reschedules the
        // task and leaves the host without active work.
        f.task_manager
            .change_state("t-1", TaskState::Killed, None)
            .await?;
        assert!(f.manager.check_drained("hostA").await?);
        assert_eq!(
            f.manager.status(&["hostA".to_owned()])[0].mode,
            MaintenanceMode::Drained
        );
        Ok(())
    }
}
