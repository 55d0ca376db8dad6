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

//! Typed in-memory stores, materialized from the log at startup and mutated
//! only through captured [`Op`]s so replay stays deterministic.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use borealis_core::model::{
    HostAttributes, JobConfiguration, JobKey, Lock, LockKey, MaintenanceMode,
    ResourceAggregate, RoleSummary, ScheduledTask, TaskQuery,
};

/// One persisted mutation. A committed write transaction appends its ops as
/// a single log record; applying the same ops in order rebuilds the stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    SaveTasks(Vec<ScheduledTask>),
    RemoveTasks(Vec<String>),
    SaveJob(JobConfiguration),
    RemoveJob(JobKey),
    SaveQuota { role: String, quota: ResourceAggregate },
    RemoveQuota(String),
    SaveLock(Lock),
    RemoveLock(LockKey),
    SaveHostAttributes(HostAttributes),
    SaveFrameworkId(String),
}

/// The complete scheduler state: task, job, quota, lock, host-attribute and
/// scheduler stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stores {
    pub tasks: HashMap<String, ScheduledTask>,
    pub jobs: HashMap<JobKey, JobConfiguration>,
    pub quotas: HashMap<String, ResourceAggregate>,
    pub locks: HashMap<LockKey, Lock>,
    pub host_attributes: HashMap<String, HostAttributes>,
    pub framework_id: Option<String>,
}

impl Stores {
    pub fn apply(&mut self, op: &Op) {
        match op {
            Op::SaveTasks(tasks) => {
                for task in tasks {
                    self.tasks.insert(task.task_id().to_owned(), task.clone());
                }
            }
            Op::RemoveTasks(task_ids) => {
                for task_id in task_ids {
                    self.tasks.remove(task_id);
                }
            }
            Op::SaveJob(job) => {
                self.jobs.insert(job.key.clone(), job.clone());
            }
            Op::RemoveJob(key) => {
                self.jobs.remove(key);
            }
            Op::SaveQuota { role, quota } => {
                self.quotas.insert(role.clone(), *quota);
            }
            Op::RemoveQuota(role) => {
                self.quotas.remove(role);
            }
            Op::SaveLock(lock) => {
                self.locks.insert(lock.key.clone(), lock.clone());
            }
            Op::RemoveLock(key) => {
                self.locks.remove(key);
            }
            Op::SaveHostAttributes(attributes) => {
                self.host_attributes
                    .insert(attributes.host.clone(), attributes.clone());
            }
            Op::SaveFrameworkId(framework_id) => {
                self.framework_id = Some(framework_id.clone());
            }
        }
    }

    pub fn fetch_task(&self, task_id: &str) -> Option<&ScheduledTask> {
        self.tasks.get(task_id)
    }

    pub fn fetch_tasks(&self, query: &TaskQuery) -> Vec<ScheduledTask> {
        let mut matched: Vec<ScheduledTask> = self
            .tasks
            .values()
            .filter(|task| query.matches(task))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.task_id().cmp(b.task_id()));
        matched
    }

    pub fn fetch_job(&self, key: &JobKey) -> Option<&JobConfiguration> {
        self.jobs.get(key)
    }

    pub fn fetch_jobs(&self, role: Option<&str>) -> Vec<JobConfiguration> {
        let mut jobs: Vec<JobConfiguration> = self
            .jobs
            .values()
            .filter(|job| role.map(|r| job.key.role == r).unwrap_or(true))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.key.cmp(&b.key));
        jobs
    }

    pub fn fetch_quota(&self, role: &str) -> Option<ResourceAggregate> {
        self.quotas.get(role).copied()
    }

    pub fn fetch_lock(&self, key: &LockKey) -> Option<&Lock> {
        self.locks.get(key)
    }

    pub fn fetch_host_attributes(&self, host: &str) -> Option<&HostAttributes> {
        self.host_attributes.get(host)
    }

    pub fn hosts_in_mode(&self, mode: MaintenanceMode) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .host_attributes
            .values()
            .filter(|attrs| attrs.mode == mode)
            .map(|attrs| attrs.host.clone())
            .collect();
        hosts.sort();
        hosts
    }

    /// Resources consumed by active production tasks of the role.
    pub fn prod_consumption(&self, role: &str) -> ResourceAggregate {
        let mut consumed = ResourceAggregate::default();
        for task in self.tasks.values() {
            if task.status.is_active()
                && task.config().production
                && task.job_key().role == role
            {
                consumed.accumulate(&task.config().resources);
            }
        }
        consumed
    }

    /// Roles with live tasks or stored templates, with per-role job counts.
    pub fn role_summaries(&self) -> Vec<RoleSummary> {
        let mut by_role: HashMap<String, (std::collections::HashSet<JobKey>, usize)> =
            HashMap::new();
        for task in self.tasks.values() {
            let entry = by_role
                .entry(task.job_key().role.clone())
                .or_default();
            entry.0.insert(task.job_key().clone());
        }
        for job in self.jobs.values() {
            let entry = by_role.entry(job.key.role.clone()).or_default();
            if job.cron_schedule.is_some() {
                entry.1 += 1;
            } else {
                entry.0.insert(job.key.clone());
            }
        }

        let mut summaries: Vec<RoleSummary> = by_role
            .into_iter()
            .map(|(role, (jobs, cron_job_count))| RoleSummary {
                role,
                job_count: jobs.len(),
                cron_job_count,
            })
            .collect();
        summaries.sort_by(|a, b| a.role.cmp(&b.role));
        summaries
    }
}

/// A complete serialized image of all stores. A snapshot record supersedes
/// all earlier log records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp_ms: u64,
    pub stores: Stores,
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use borealis_core::model::{
        AssignedTask, Identity, ResourceRequest, TaskConfig, TaskState,
    };

    use super::*;

    fn test_task(task_id: &str, role: &str, production: bool) -> ScheduledTask {
        let config = TaskConfig {
            job: JobKey::new(role, "prod", "api"),
            owner: Identity::new("ops"),
            is_service: false,
            priority: 0,
            production,
            max_task_failures: 1,
            resources: ResourceRequest::new(1.0, 128, 16),
            command: "run".to_owned(),
            constraints: vec![],
            metadata: BTreeMap::new(),
        };
        ScheduledTask {
            assigned: AssignedTask::new(task_id, 0, config),
            status: TaskState::Running,
            failure_count: 0,
            ancestor_id: None,
            task_events: vec![],
        }
    }

    #[test]
    fn test_apply_is_deterministic() {
        let ops = vec![
            Op::SaveTasks(vec![test_task("t-1", "web", true)]),
            Op::SaveTasks(vec![test_task("t-2", "web", false)]),
            Op::SaveQuota {
                role: "web".to_owned(),
                quota: ResourceAggregate::new(10.0, 1024, 1024),
            },
            Op::RemoveTasks(vec!["t-2".to_owned()]),
            Op::SaveFrameworkId("fw-1".to_owned()),
        ];

        let mut a = Stores::default();
        let mut b = Stores::default();
        for op in &ops {
            a.apply(op);
        }
        for op in &ops {
            b.apply(op);
        }

        assert_eq!(a, b);
        assert_eq!(a.tasks.len(), 1);
        assert!(a.fetch_task("t-1").is_some());
        assert_eq!(a.framework_id.as_deref(), Some("fw-1"));
    }

    #[test]
    fn test_prod_consumption_counts_only_active_production() {
        let mut stores = Stores::default();
        stores.apply(&Op::SaveTasks(vec![
            test_task("t-1", "web", true),
            test_task("t-2", "web", false),
        ]));

        let mut finished = test_task("t-3", "web", true);
        finished.status = TaskState::Finished;
        stores.apply(&Op::SaveTasks(vec![finished]));

        let consumed = stores.prod_consumption("web");
        assert_eq!(consumed.num_cpus, 1.0);
        assert_eq!(consumed.ram_mb, 128);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut stores = Stores::default();
        stores.apply(&Op::SaveTasks(vec![test_task("t-1", "web", true)]));
        let snapshot = Snapshot {
            timestamp_ms: 42,
            stores: stores.clone(),
        };

        let encoded = serde_json::to_vec(&snapshot).unwrap();
        let decoded: Snapshot = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.stores, stores);
    }
}
