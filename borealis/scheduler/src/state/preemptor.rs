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

//! Victim search for tasks that repeatedly fail to place: displace a
//! strictly lower-priority RUNNING task whose slot would fit the candidate.

use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use borealis_core::error::Result;
use borealis_core::model::{ResourceAggregate, TaskConfig, TaskState};

use crate::state::task_assigner::PlacementView;
use crate::state::task_groups::Preemptor;
use crate::state::task_manager::TaskManager;
use crate::storage::TransactionalStorage;

/// Production workloads outrank non-production ones; within the same tier
/// the numeric priority ladder decides. The victim must be strictly lower.
fn preempts(candidate: &TaskConfig, victim: &TaskConfig) -> bool {
    if candidate.production != victim.production {
        candidate.production
    } else {
        victim.priority < candidate.priority
    }
}

pub struct PriorityPreemptor {
    storage: Arc<TransactionalStorage>,
    task_manager: Arc<TaskManager>,
}

impl PriorityPreemptor {
    pub fn new(
        storage: Arc<TransactionalStorage>,
        task_manager: Arc<TaskManager>,
    ) -> Self {
        Self {
            storage,
            task_manager,
        }
    }
}

#[async_trait]
impl Preemptor for PriorityPreemptor {
    async fn attempt_preemption_for(&self, task_id: &str) -> Result<Option<String>> {
        let Some(candidate) = self.storage.read(|stores| {
            stores
                .fetch_task(task_id)
                .filter(|task| task.status == TaskState::Pending)
                .cloned()
        }) else {
            return Ok(None);
        };

        let view = PlacementView::capture(&self.storage);
        let mut victims = self.storage.read(|stores| {
            stores
                .tasks
                .values()
                .filter(|task| task.status == TaskState::Running)
                .filter(|task| preempts(candidate.config(), task.config()))
                .filter(|task| {
                    ResourceAggregate::from(&task.config().resources)
                        .can_fit(&candidate.config().resources)
                })
                .filter(|task| {
                    task.assigned
                        .slave_host
                        .as_ref()
                        .map(|host| {
                            view.satisfies_constraints(host, candidate.config())
                        })
                        .unwrap_or(false)
                })
                .cloned()
                .collect::<Vec<_>>()
        });
        // Displace the cheapest victim first: non-production before
        // production, then ascending priority.
        victims.sort_by_key(|task| (task.config().production, task.config().priority));

        let Some(victim) = victims.first() else {
            return Ok(None);
        };
        let victim_id = victim.task_id().to_owned();
        info!(
            "Preempting task {} (priority {}) on host {:?} to make room for {} (priority {})",
            victim_id,
            victim.config().priority,
            victim.assigned.slave_host,
            task_id,
            candidate.config().priority
        );
        self.task_manager
            .change_state(
                &victim_id,
                TaskState::Preempting,
                Some(format!("Preempted in favor of {task_id}")),
            )
            .await?;
        Ok(Some(victim_id))
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use borealis_core::clock::SystemClock;
    use borealis_core::model::{
        AssignedTask, Identity, JobKey, ResourceRequest, ScheduledTask,
    };

    use crate::config::SchedulerConfig;
    use crate::metrics::InProcessMetricsCollector;
    use crate::storage::log::MemoryLogStore;
    use crate::test_utils::RecordingLauncher;

    use super::*;

    fn config(priority: i32, production: bool) -> TaskConfig {
        TaskConfig {
            job: JobKey::new("web", "prod", format!("job-p{priority}")),
            owner: Identity::new("ops"),
            is_service: false,
            priority,
            production,
            max_task_failures: 1,
            resources: ResourceRequest::new(1.0, 100, 10),
            command: "run".to_owned(),
            constraints: vec![],
            metadata: BTreeMap::new(),
        }
    }

    fn task(
        task_id: &str,
        status: TaskState,
        priority: i32,
        production: bool,
        host: Option<&str>,
    ) -> ScheduledTask {
        let mut assigned = AssignedTask::new(task_id, 0, config(priority, production));
        assigned.slave_host = host.map(str::to_owned);
        assigned.slave_id = host.map(|h| format!("slave-{h}"));
        ScheduledTask {
            assigned,
            status,
            failure_count: 0,
            ancestor_id: None,
            task_events: vec![],
        }
    }

    struct Fixture {
        storage: Arc<TransactionalStorage>,
        preemptor: PriorityPreemptor,
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
        let preemptor = PriorityPreemptor::new(storage.clone(), task_manager);
        Fixture {
            storage,
            preemptor,
            launcher,
        }
    }

    async fn save(storage: &TransactionalStorage, tasks: Vec<ScheduledTask>) {
        storage
            .write(|txn| {
                txn.save_tasks(tasks);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lower_priority_victim_is_preempted() -> Result<()> {
        let f = fixture();
        save(
            &f.storage,
            vec![
                task("victim", TaskState::Running, 0, false, Some("hostA")),
                task("candidate", TaskState::Pending, 10, false, None),
            ],
        )
        .await;

        let victim = f.preemptor.attempt_preemption_for("candidate").await?;
        assert_eq!(victim.as_deref(), Some("victim"));

        f.storage.read(|stores| {
            assert_eq!(
                stores.fetch_task("victim").unwrap().status,
                TaskState::Preempting
            );
            // The candidate stays PENDING in its group.
            assert_eq!(
                stores.fetch_task("candidate").unwrap().status,
                TaskState::Pending
            );
        });
        // PREEMPTING emits a kill toward the agent.
        assert_eq!(f.launcher.killed(), vec!["victim".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_equal_priority_is_not_preempted() -> Result<()> {
        let f = fixture();
        save(
            &f.storage,
            vec![
                task("victim", TaskState::Running, 5, false, Some("hostA")),
                task("candidate", TaskState::Pending, 5, false, None),
            ],
        )
        .await;

        assert!(f
            .preemptor
            .attempt_preemption_for("candidate")
            .await?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_production_candidate_preempts_nonprod_regardless_of_priority(
    ) -> Result<()> {
        let f = fixture();
        save(
            &f.storage,
            vec![
                task("victim", TaskState::Running, 100, false, Some("hostA")),
                task("candidate", TaskState::Pending, 0, true, None),
            ],
        )
        .await;

        let victim = f.preemptor.attempt_preemption_for("candidate").await?;
        assert_eq!(victim.as_deref(), Some("victim"));
        Ok(())
    }

    #[tokio::test]
    async fn test_nonprod_candidate_never_preempts_production() -> Result<()> {
        let f = fixture();
        save(
            &f.storage,
            vec![
                task("victim", TaskState::Running, 0, true, Some("hostA")),
                task("candidate", TaskState::Pending, 100, false, None),
            ],
        )
        .await;

        assert!(f
            .preemptor
            .attempt_preemption_for("candidate")
            .await?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_victim_must_fit_candidate_resources() -> Result<()> {
        let f = fixture();
        let mut candidate = task("candidate", TaskState::Pending, 10, false, None);
        candidate.assigned.config.resources = ResourceRequest::new(8.0, 8192, 100);
        save(
            &f.storage,
            vec![
                task("victim", TaskState::Running, 0, false, Some("hostA")),
                candidate,
            ],
        )
        .await;

        assert!(f
            .preemptor
            .attempt_preemption_for("candidate")
            .await?
            .is_none());
        Ok(())
    }
}
