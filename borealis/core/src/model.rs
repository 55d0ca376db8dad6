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

//! Domain model shared by the scheduler core: tasks, jobs, resources, locks,
//! quotas, host attributes, and offers. Everything here is serializable since
//! it all flows through log records and snapshots.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Coordinates of a job: `(role, environment, name)`.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct JobKey {
    pub role: String,
    pub environment: String,
    pub name: String,
}

impl JobKey {
    pub fn new(
        role: impl Into<String>,
        environment: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            environment: environment.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.role, self.environment, self.name)
    }
}

/// The identity that owns a job or holds a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user: String,
}

impl Identity {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

/// Resources requested by a single task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub num_cpus: f64,
    pub ram_mb: u64,
    pub disk_mb: u64,
    /// Named ports to be bound from an offer's port ranges at placement time.
    pub requested_ports: Vec<String>,
}

impl ResourceRequest {
    pub fn new(num_cpus: f64, ram_mb: u64, disk_mb: u64) -> Self {
        Self {
            num_cpus,
            ram_mb,
            disk_mb,
            requested_ports: vec![],
        }
    }

    pub fn with_ports(mut self, ports: Vec<String>) -> Self {
        self.requested_ports = ports;
        self
    }
}

/// An instance-count-agnostic resource aggregate, used for quotas, offers
/// and consumption sums.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceAggregate {
    pub num_cpus: f64,
    pub ram_mb: u64,
    pub disk_mb: u64,
}

impl ResourceAggregate {
    pub fn new(num_cpus: f64, ram_mb: u64, disk_mb: u64) -> Self {
        Self {
            num_cpus,
            ram_mb,
            disk_mb,
        }
    }

    /// Whether this aggregate covers `request`.
    pub fn can_fit(&self, request: &ResourceRequest) -> bool {
        self.num_cpus >= request.num_cpus
            && self.ram_mb >= request.ram_mb
            && self.disk_mb >= request.disk_mb
    }

    /// Whether this aggregate covers `other` component-wise.
    pub fn at_least(&self, other: &ResourceAggregate) -> bool {
        self.num_cpus >= other.num_cpus
            && self.ram_mb >= other.ram_mb
            && self.disk_mb >= other.disk_mb
    }

    pub fn accumulate(&mut self, request: &ResourceRequest) {
        self.num_cpus += request.num_cpus;
        self.ram_mb += request.ram_mb;
        self.disk_mb += request.disk_mb;
    }

    pub fn scale(&self, count: u32) -> ResourceAggregate {
        ResourceAggregate {
            num_cpus: self.num_cpus * count as f64,
            ram_mb: self.ram_mb * count as u64,
            disk_mb: self.disk_mb * count as u64,
        }
    }
}

impl From<&ResourceRequest> for ResourceAggregate {
    fn from(request: &ResourceRequest) -> Self {
        ResourceAggregate {
            num_cpus: request.num_cpus,
            ram_mb: request.ram_mb,
            disk_mb: request.disk_mb,
        }
    }
}

/// Predicate over a single host attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstraintPredicate {
    /// The attribute must carry exactly this value.
    Equal(String),
    /// The attribute must carry at least one of these values.
    ValueSet(BTreeSet<String>),
    /// At most this many active tasks of the same job per distinct attribute
    /// value.
    Limit(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    pub predicate: ConstraintPredicate,
}

impl Constraint {
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predicate: ConstraintPredicate::Equal(value.into()),
        }
    }

    pub fn value_set<I: IntoIterator<Item = String>>(
        name: impl Into<String>,
        values: I,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: ConstraintPredicate::ValueSet(values.into_iter().collect()),
        }
    }

    pub fn limit(name: impl Into<String>, max_per_value: u32) -> Self {
        Self {
            name: name.into(),
            predicate: ConstraintPredicate::Limit(max_per_value),
        }
    }
}

/// Lifecycle states of a task. See the transition table in the scheduler's
/// task state machine for the legal edges.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum TaskState {
    Init,
    Pending,
    Throttled,
    Assigned,
    Starting,
    Running,
    Preempting,
    Restarting,
    Killing,
    Finished,
    Failed,
    Killed,
    Lost,
    Unknown,
}

impl TaskState {
    /// Terminal states are never mutated except to delete.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Killed | TaskState::Lost
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskState::Pending
                | TaskState::Throttled
                | TaskState::Assigned
                | TaskState::Starting
                | TaskState::Running
                | TaskState::Preempting
                | TaskState::Restarting
                | TaskState::Killing
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TaskState::Init => "INIT",
            TaskState::Pending => "PENDING",
            TaskState::Throttled => "THROTTLED",
            TaskState::Assigned => "ASSIGNED",
            TaskState::Starting => "STARTING",
            TaskState::Running => "RUNNING",
            TaskState::Preempting => "PREEMPTING",
            TaskState::Restarting => "RESTARTING",
            TaskState::Killing => "KILLING",
            TaskState::Finished => "FINISHED",
            TaskState::Failed => "FAILED",
            TaskState::Killed => "KILLED",
            TaskState::Lost => "LOST",
            TaskState::Unknown => "UNKNOWN",
        };
        write!(f, "{name}")
    }
}

/// One entry of a task's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub timestamp_ms: u64,
    pub status: TaskState,
    pub message: Option<String>,
    pub scheduler_host: Option<String>,
}

/// Immutable task configuration. Two configs with equal scheduling-relevant
/// fields belong to the same [`GroupKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub job: JobKey,
    pub owner: Identity,
    pub is_service: bool,
    pub priority: i32,
    pub production: bool,
    /// -1 means unlimited reschedules on failure.
    pub max_task_failures: i32,
    pub resources: ResourceRequest,
    pub command: String,
    pub constraints: Vec<Constraint>,
    pub metadata: BTreeMap<String, String>,
}

impl TaskConfig {
    /// The configuration fingerprint that decides which scheduling group the
    /// task batches into.
    pub fn group_key(&self) -> GroupKey {
        let fingerprint = serde_json::to_string(self)
            .unwrap_or_else(|_| format!("{}|{}", self.job, self.command));
        let mut hasher = DefaultHasher::new();
        fingerprint.hash(&mut hasher);
        GroupKey(format!("{}:{:016x}", self.job, hasher.finish()))
    }
}

/// Equivalence class of task configurations that schedule identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKey(pub String);

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A task plus its identity and, once placed, its host assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedTask {
    pub task_id: String,
    pub instance_id: u32,
    pub config: TaskConfig,
    pub slave_id: Option<String>,
    pub slave_host: Option<String>,
    pub assigned_ports: BTreeMap<String, u16>,
}

impl AssignedTask {
    pub fn new(task_id: impl Into<String>, instance_id: u32, config: TaskConfig) -> Self {
        Self {
            task_id: task_id.into(),
            instance_id,
            config,
            slave_id: None,
            slave_host: None,
            assigned_ports: BTreeMap::new(),
        }
    }
}

/// The authoritative record of one scheduling attempt of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub assigned: AssignedTask,
    pub status: TaskState,
    pub failure_count: i32,
    /// Prior task id when this task is a reschedule.
    pub ancestor_id: Option<String>,
    /// Append-only, monotone non-decreasing in timestamp; the last entry's
    /// status equals `status`.
    pub task_events: Vec<TaskEvent>,
}

impl ScheduledTask {
    pub fn task_id(&self) -> &str {
        &self.assigned.task_id
    }

    pub fn job_key(&self) -> &JobKey {
        &self.assigned.config.job
    }

    pub fn config(&self) -> &TaskConfig {
        &self.assigned.config
    }

    pub fn latest_event(&self) -> Option<&TaskEvent> {
        self.task_events.last()
    }
}

/// Stored job template. Only cron/templated jobs are persisted; instance-job
/// configs are reconstructed from live tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfiguration {
    pub key: JobKey,
    pub owner: Identity,
    pub cron_schedule: Option<String>,
    pub instance_count: u32,
    pub task_config: TaskConfig,
}

/// Scope of an advisory lock. Today always a job key.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum LockKey {
    Job(JobKey),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LockKey::Job(key) => write!(f, "job:{key}"),
        }
    }
}

/// An advisory exclusion token scoped to a lock key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub key: LockKey,
    pub token: String,
    pub user: Identity,
    pub timestamp_ms: u64,
    pub message: Option<String>,
}

/// Host maintenance lifecycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
pub enum MaintenanceMode {
    #[default]
    None,
    Scheduled,
    Draining,
    Drained,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub values: BTreeSet<String>,
}

impl Attribute {
    pub fn new<I: IntoIterator<Item = String>>(
        name: impl Into<String>,
        values: I,
    ) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter().collect(),
        }
    }
}

/// Per-host attribute set used for constraint matching, plus the host's
/// maintenance mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostAttributes {
    pub host: String,
    pub slave_id: Option<String>,
    pub attributes: Vec<Attribute>,
    pub mode: MaintenanceMode,
}

impl HostAttributes {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            slave_id: None,
            attributes: vec![],
            mode: MaintenanceMode::None,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// A time-bounded advertisement of available resources on a worker host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostOffer {
    pub offer_id: String,
    pub slave_id: String,
    pub host: String,
    pub resources: ResourceAggregate,
    pub port_ranges: Vec<(u16, u16)>,
}

impl HostOffer {
    /// All concrete ports advertised by this offer, in range order.
    pub fn available_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.port_ranges.iter().flat_map(|(lo, hi)| *lo..=*hi)
    }
}

/// Query over scheduled tasks. An unset field matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskQuery {
    pub role: Option<String>,
    pub environment: Option<String>,
    pub job_name: Option<String>,
    pub task_ids: Option<HashSet<String>>,
    pub statuses: Option<HashSet<TaskState>>,
    pub instance_ids: Option<HashSet<u32>>,
    pub slave_host: Option<String>,
}

impl TaskQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_job(key: &JobKey) -> Self {
        Self {
            role: Some(key.role.clone()),
            environment: Some(key.environment.clone()),
            job_name: Some(key.name.clone()),
            ..Self::default()
        }
    }

    pub fn by_role(role: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            ..Self::default()
        }
    }

    pub fn by_task_id(task_id: impl Into<String>) -> Self {
        let mut ids = HashSet::new();
        ids.insert(task_id.into());
        Self {
            task_ids: Some(ids),
            ..Self::default()
        }
    }

    pub fn with_statuses<I: IntoIterator<Item = TaskState>>(mut self, states: I) -> Self {
        self.statuses = Some(states.into_iter().collect());
        self
    }

    pub fn with_instance_ids<I: IntoIterator<Item = u32>>(mut self, ids: I) -> Self {
        self.instance_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_slave_host(mut self, host: impl Into<String>) -> Self {
        self.slave_host = Some(host.into());
        self
    }

    /// Restrict to the active states.
    pub fn active(mut self) -> Self {
        self.statuses = Some(
            [
                TaskState::Pending,
                TaskState::Throttled,
                TaskState::Assigned,
                TaskState::Starting,
                TaskState::Running,
                TaskState::Preempting,
                TaskState::Restarting,
                TaskState::Killing,
            ]
            .into_iter()
            .collect(),
        );
        self
    }

    pub fn matches(&self, task: &ScheduledTask) -> bool {
        let key = task.job_key();
        if let Some(role) = &self.role {
            if &key.role != role {
                return false;
            }
        }
        if let Some(environment) = &self.environment {
            if &key.environment != environment {
                return false;
            }
        }
        if let Some(job_name) = &self.job_name {
            if &key.name != job_name {
                return false;
            }
        }
        if let Some(task_ids) = &self.task_ids {
            if !task_ids.contains(task.task_id()) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(instance_ids) = &self.instance_ids {
            if !instance_ids.contains(&task.assigned.instance_id) {
                return false;
            }
        }
        if let Some(slave_host) = &self.slave_host {
            if task.assigned.slave_host.as_deref() != Some(slave_host.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Per-role summary returned by the read-only role query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSummary {
    pub role: String,
    pub job_count: usize,
    pub cron_job_count: usize,
}

/// A role's quota and its current production consumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaInfo {
    pub quota: ResourceAggregate,
    pub prod_consumption: ResourceAggregate,
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_config(job_name: &str) -> TaskConfig {
        TaskConfig {
            job: JobKey::new("web", "prod", job_name),
            owner: Identity::new("ops"),
            is_service: true,
            priority: 0,
            production: true,
            max_task_failures: -1,
            resources: ResourceRequest::new(1.0, 128, 16),
            command: "run".to_owned(),
            constraints: vec![],
            metadata: BTreeMap::new(),
        }
    }

    fn test_task(task_id: &str, status: TaskState) -> ScheduledTask {
        ScheduledTask {
            assigned: AssignedTask::new(task_id, 0, test_config("api")),
            status,
            failure_count: 0,
            ancestor_id: None,
            task_events: vec![],
        }
    }

    #[test]
    fn test_group_key_stability() {
        let a = test_config("api");
        let b = test_config("api");
        assert_eq!(a.group_key(), b.group_key());

        let mut c = test_config("api");
        c.resources.ram_mb = 256;
        assert_ne!(a.group_key(), c.group_key());

        let d = test_config("cache");
        assert_ne!(a.group_key(), d.group_key());
    }

    #[test]
    fn test_state_partitions() {
        let terminal = [
            TaskState::Finished,
            TaskState::Failed,
            TaskState::Killed,
            TaskState::Lost,
        ];
        let active = [
            TaskState::Pending,
            TaskState::Throttled,
            TaskState::Assigned,
            TaskState::Starting,
            TaskState::Running,
            TaskState::Preempting,
            TaskState::Restarting,
            TaskState::Killing,
        ];

        for state in terminal {
            assert!(state.is_terminal(), "{state} should be terminal");
            assert!(!state.is_active());
        }
        for state in active {
            assert!(state.is_active(), "{state} should be active");
            assert!(!state.is_terminal());
        }
        assert!(!TaskState::Init.is_active());
        assert!(!TaskState::Unknown.is_terminal());
    }

    #[test]
    fn test_resource_fit() {
        let offer = ResourceAggregate::new(4.0, 4096, 40_960);
        assert!(offer.can_fit(&ResourceRequest::new(1.0, 100, 10)));
        assert!(!offer.can_fit(&ResourceRequest::new(8.0, 100, 10)));
        assert!(!offer.can_fit(&ResourceRequest::new(1.0, 8192, 10)));
    }

    #[test]
    fn test_query_matching() {
        let task = test_task("t-1", TaskState::Running);

        assert!(TaskQuery::all().matches(&task));
        assert!(TaskQuery::by_job(&JobKey::new("web", "prod", "api")).matches(&task));
        assert!(!TaskQuery::by_job(&JobKey::new("web", "prod", "db")).matches(&task));
        assert!(TaskQuery::by_task_id("t-1").matches(&task));
        assert!(!TaskQuery::by_task_id("t-2").matches(&task));
        assert!(TaskQuery::all()
            .with_statuses([TaskState::Running])
            .matches(&task));
        assert!(!TaskQuery::all()
            .with_statuses([TaskState::Pending])
            .matches(&task));
        assert!(TaskQuery::all().active().matches(&task));
        assert!(!TaskQuery::all()
            .with_slave_host("hostA")
            .matches(&task));
    }

    #[test]
    fn test_offer_ports() {
        let offer = HostOffer {
            offer_id: "o-1".to_owned(),
            slave_id: "s-1".to_owned(),
            host: "hostA".to_owned(),
            resources: ResourceAggregate::new(4.0, 4096, 40_960),
            port_ranges: vec![(31000, 31002), (32000, 32000)],
        };
        let ports: Vec<u16> = offer.available_ports().collect();
        assert_eq!(ports, vec![31000, 31001, 31002, 32000]);
    }

    #[test]
    fn test_model_round_trips_through_json() {
        let task = test_task("t-1", TaskState::Pending);
        let encoded = serde_json::to_string(&task).unwrap();
        let decoded: ScheduledTask = serde_json::from_str(&encoded).unwrap();
        assert_eq!(task, decoded);
    }
}
