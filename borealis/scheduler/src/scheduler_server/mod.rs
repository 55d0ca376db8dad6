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

//! The scheduler server: wires storage, managers, the event loop and the
//! scheduling loop together and exposes the operation surface the (external)
//! RPC layer translates onto.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};

use borealis_core::clock::Clock;
use borealis_core::error::{BorealisError, Result};
use borealis_core::event_loop::EventLoop;
use borealis_core::model::{
    HostAttributes, HostOffer, Identity, JobConfiguration, JobKey, Lock, LockKey,
    QuotaInfo, ResourceAggregate, RoleSummary, ScheduledTask, TaskConfig, TaskQuery,
    TaskState,
};

use crate::config::SchedulerConfig;
use crate::metrics::SchedulerMetricsCollector;
use crate::scheduler_server::event::SchedulerEvent;
use crate::scheduler_server::task_scheduler::TaskScheduler;
use crate::state::lock_manager::LockManager;
use crate::state::maintenance::HostStatus;
use crate::state::quota_manager::QuotaManager;
use crate::state::task_manager::{StateChange, TaskLauncher, TxnSideEffects};
use crate::state::SchedulerState;
use crate::storage::log::LogStore;

pub mod event;
pub mod task_scheduler;

/// Authentication seam. The credential check itself is an external
/// collaborator; the scheduler only asks whether the caller may act on a
/// role, or with admin capability.
pub trait CapabilityValidator: Send + Sync + 'static {
    fn authorize(&self, caller: &Identity, role: &str) -> Result<()>;

    fn authorize_admin(&self, caller: &Identity) -> Result<()>;
}

/// Default validator for embedded and test deployments.
pub struct AllowAllValidator;

impl CapabilityValidator for AllowAllValidator {
    fn authorize(&self, _caller: &Identity, _role: &str) -> Result<()> {
        Ok(())
    }

    fn authorize_admin(&self, _caller: &Identity) -> Result<()> {
        Ok(())
    }
}

pub struct SchedulerServer {
    pub scheduler_name: String,
    pub start_time: u128,
    pub(crate) state: Arc<SchedulerState>,
    event_loop: EventLoop<SchedulerEvent>,
    task_scheduler: Arc<TaskScheduler>,
    auth: Arc<dyn CapabilityValidator>,
    config: SchedulerConfig,
}

impl SchedulerServer {
    pub fn new(
        scheduler_name: String,
        log: Arc<dyn LogStore>,
        launcher: Arc<dyn TaskLauncher>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn SchedulerMetricsCollector>,
        auth: Arc<dyn CapabilityValidator>,
        config: SchedulerConfig,
    ) -> Self {
        let state = Arc::new(SchedulerState::new(
            log,
            launcher,
            clock,
            metrics,
            config.clone(),
        ));
        let task_scheduler = Arc::new(TaskScheduler::new(state.clone()));
        let event_loop = EventLoop::new(
            "task_scheduler",
            config.event_loop_buffer_size,
            task_scheduler.clone(),
        );

        Self {
            scheduler_name,
            start_time: timestamp_millis() as u128,
            state,
            event_loop,
            task_scheduler,
            auth,
            config,
        }
    }

    /// Recover state, arm the scheduling loop, and start the periodic
    /// snapshot task.
    pub async fn init(&mut self) -> Result<()> {
        self.state.init().await?;
        self.event_loop.start()?;
        self.start_snapshot_timer();
        Ok(())
    }

    pub fn pending_tasks(&self) -> usize {
        self.task_scheduler.pending_tasks()
    }

    fn start_snapshot_timer(&self) {
        let storage = self.state.storage.clone();
        let interval_ms = self.config.dlog_snapshot_interval_ms;
        tokio::task::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                if let Err(e) = storage.snapshot().await {
                    warn!("Periodic log snapshot failed: {e}");
                }
            }
        });
    }

    async fn publish_changes(&self, changes: &[StateChange]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let sender = self.event_loop.get_sender()?;

        let pending: Vec<String> = changes
            .iter()
            .filter(|c| c.to == TaskState::Pending && !c.deleted)
            .map(|c| c.task_id.clone())
            .collect();
        if !pending.is_empty() {
            sender
                .post_event(SchedulerEvent::TasksPending { task_ids: pending })
                .await?;
        }

        let deleted: Vec<String> = changes
            .iter()
            .filter(|c| c.deleted)
            .map(|c| c.task_id.clone())
            .collect();
        if !deleted.is_empty() {
            sender
                .post_event(SchedulerEvent::TasksDeleted { task_ids: deleted })
                .await?;
        }

        for change in changes {
            sender
                .post_event(SchedulerEvent::TaskStateChanged {
                    task_id: change.task_id.clone(),
                    from: change.from,
                    to: change.to,
                    slave_host: change.slave_host.clone(),
                })
                .await?;
        }
        Ok(())
    }

    fn validate_job(job: &JobConfiguration) -> Result<()> {
        let key = &job.key;
        if key.role.is_empty() || key.environment.is_empty() || key.name.is_empty() {
            return Err(BorealisError::InvalidRequest(
                "Job key components must not be empty".to_owned(),
            ));
        }
        if job.instance_count == 0 {
            return Err(BorealisError::InvalidRequest(
                "Jobs must have at least one instance".to_owned(),
            ));
        }
        if job.task_config.command.is_empty() {
            return Err(BorealisError::InvalidRequest(
                "Task command must not be empty".to_owned(),
            ));
        }
        if job.task_config.max_task_failures < -1 {
            return Err(BorealisError::InvalidRequest(
                "maxTaskFailures must be -1 (unlimited) or non-negative".to_owned(),
            ));
        }
        if let Some(schedule) = &job.cron_schedule {
            if schedule.is_empty() {
                return Err(BorealisError::InvalidRequest(
                    "Cron schedule must not be empty".to_owned(),
                ));
            }
        }
        if job.task_config.job != *key {
            return Err(BorealisError::InvalidRequest(
                "Task config job key does not match the job".to_owned(),
            ));
        }
        Ok(())
    }

    /// Pure: return the defaults-applied task configs this job would run.
    pub fn populate_job_config(&self, job: &JobConfiguration) -> Result<Vec<TaskConfig>> {
        Self::validate_job(job)?;
        Ok((0..job.instance_count)
            .map(|_| job.task_config.clone())
            .collect())
    }

    /// Create PENDING tasks for each instance of the job, or register the
    /// cron template when the job carries a schedule.
    pub async fn create_job(
        &self,
        caller: &Identity,
        job: JobConfiguration,
        lock_token: Option<&str>,
    ) -> Result<Vec<String>> {
        Self::validate_job(&job)?;
        self.auth.authorize(caller, &job.key.role)?;

        let key = job.key.clone();
        let token = lock_token.map(str::to_owned);
        let task_manager = self.state.task_manager.clone();
        let mut effects = TxnSideEffects::default();

        let task_ids = self
            .state
            .storage
            .write(|txn| {
                LockManager::validate_in_txn(txn, &LockKey::Job(key.clone()), token.as_deref())?;
                if txn.fetch_job(&key).is_some() {
                    return Err(BorealisError::InvalidRequest(format!(
                        "Job {key} already exists"
                    )));
                }
                let live = txn.fetch_tasks(&TaskQuery::by_job(&key).active());
                if !live.is_empty() {
                    return Err(BorealisError::InvalidRequest(format!(
                        "Job {key} already exists with {} active tasks",
                        live.len()
                    )));
                }

                if job.cron_schedule.is_some() {
                    txn.save_job(job.clone());
                    return Ok(vec![]);
                }

                QuotaManager::check_admission(txn, &job.task_config, job.instance_count)?;
                let mut task_ids = vec![];
                for instance_id in 0..job.instance_count {
                    task_ids.push(task_manager.create_task(
                        txn,
                        &job.task_config,
                        instance_id,
                        &mut effects,
                    )?);
                }
                Ok(task_ids)
            })
            .await?;

        let changes = self.state.task_manager.finish(effects).await;
        self.publish_changes(&changes).await?;
        info!(
            "Created job {key} with {} tasks for {}",
            task_ids.len(),
            caller.user
        );
        Ok(task_ids)
    }

    /// Update the stored template of a known cron job.
    pub async fn replace_cron_template(
        &self,
        caller: &Identity,
        job: JobConfiguration,
        lock_token: Option<&str>,
    ) -> Result<()> {
        Self::validate_job(&job)?;
        if job.cron_schedule.is_none() {
            return Err(BorealisError::InvalidRequest(
                "Job is not a cron job".to_owned(),
            ));
        }
        self.auth.authorize(caller, &job.key.role)?;

        let key = job.key.clone();
        let token = lock_token.map(str::to_owned);
        self.state
            .storage
            .write(move |txn| {
                LockManager::validate_in_txn(txn, &LockKey::Job(key.clone()), token.as_deref())?;
                match txn.fetch_job(&key) {
                    Some(existing) if existing.cron_schedule.is_some() => {
                        txn.save_job(job);
                        Ok(())
                    }
                    _ => Err(BorealisError::InvalidRequest(format!(
                        "No cron job found for {key}"
                    ))),
                }
            })
            .await
    }

    /// Launch tasks from a stored cron template now.
    pub async fn start_cron_job(&self, caller: &Identity, key: &JobKey) -> Result<Vec<String>> {
        self.auth.authorize(caller, &key.role)?;

        let key = key.clone();
        let task_manager = self.state.task_manager.clone();
        let mut effects = TxnSideEffects::default();

        let task_ids = self
            .state
            .storage
            .write(|txn| {
                let Some(template) = txn.fetch_job(&key).cloned() else {
                    return Err(BorealisError::InvalidRequest(format!(
                        "No cron job found for {key}"
                    )));
                };
                if template.cron_schedule.is_none() {
                    return Err(BorealisError::InvalidRequest(format!(
                        "{key} is not a cron job"
                    )));
                }
                if !txn.fetch_tasks(&TaskQuery::by_job(&key).active()).is_empty() {
                    return Err(BorealisError::ScheduleError(format!(
                        "Cron job {key} is still running"
                    )));
                }

                QuotaManager::check_admission(
                    txn,
                    &template.task_config,
                    template.instance_count,
                )?;
                let mut task_ids = vec![];
                for instance_id in 0..template.instance_count {
                    task_ids.push(task_manager.create_task(
                        txn,
                        &template.task_config,
                        instance_id,
                        &mut effects,
                    )?);
                }
                Ok(task_ids)
            })
            .await?;

        let changes = self.state.task_manager.finish(effects).await;
        self.publish_changes(&changes).await?;
        Ok(task_ids)
    }

    pub fn get_tasks_status(&self, query: &TaskQuery) -> Vec<ScheduledTask> {
        self.state.storage.read(|stores| stores.fetch_tasks(query))
    }

    /// Stored cron templates plus instance jobs reconstructed from live
    /// tasks.
    pub fn get_jobs(&self, role: Option<&str>) -> Vec<JobConfiguration> {
        self.state.storage.read(|stores| {
            let mut jobs = stores.fetch_jobs(role);

            let mut by_key: std::collections::HashMap<JobKey, JobConfiguration> =
                std::collections::HashMap::new();
            for task in stores.tasks.values() {
                if !task.status.is_active() {
                    continue;
                }
                let key = task.job_key();
                if role.map(|r| key.role != r).unwrap_or(false)
                    || jobs.iter().any(|j| &j.key == key)
                {
                    continue;
                }
                let entry = by_key.entry(key.clone()).or_insert_with(|| {
                    JobConfiguration {
                        key: key.clone(),
                        owner: task.config().owner.clone(),
                        cron_schedule: None,
                        instance_count: 0,
                        task_config: task.config().clone(),
                    }
                });
                entry.instance_count += 1;
            }

            jobs.extend(by_key.into_values());
            jobs.sort_by(|a, b| a.key.cmp(&b.key));
            jobs
        })
    }

    pub fn get_role_summary(&self) -> Vec<RoleSummary> {
        self.state.storage.read(|stores| stores.role_summaries())
    }

    pub fn get_quota(&self, role: &str) -> QuotaInfo {
        self.state.quota_manager.get_quota(role)
    }

    /// Privileged: update a role's quota.
    pub async fn set_quota(
        &self,
        caller: &Identity,
        role: &str,
        quota: ResourceAggregate,
    ) -> Result<()> {
        self.auth.authorize_admin(caller)?;
        info!("Admin {} is updating quota for role {role}", caller.user);
        self.state.quota_manager.set_quota(role, quota).await
    }

    /// Transition matched tasks toward KILLING and wait for them to die.
    pub async fn kill_tasks(
        &self,
        caller: &Identity,
        query: &TaskQuery,
        lock_token: Option<&str>,
    ) -> Result<Vec<String>> {
        match &query.role {
            Some(role) => self.auth.authorize(caller, role)?,
            None => self.auth.authorize_admin(caller)?,
        }
        if let Some(key) = Self::job_key_of(query) {
            self.state
                .lock_manager
                .validate_if_locked(&LockKey::Job(key), lock_token)?;
        }

        let changes = self
            .state
            .task_manager
            .kill_tasks(query, Some(format!("Killed by {}", caller.user)))
            .await?;
        self.publish_changes(&changes).await?;
        Ok(changes.iter().map(|c| c.task_id.clone()).collect())
    }

    /// Restart specific instances of a job (kill + reschedule elsewhere).
    pub async fn restart_shards(
        &self,
        caller: &Identity,
        key: &JobKey,
        instance_ids: &[u32],
        lock_token: Option<&str>,
    ) -> Result<()> {
        self.auth.authorize(caller, &key.role)?;
        self.state
            .lock_manager
            .validate_if_locked(&LockKey::Job(key.clone()), lock_token)?;

        let query = TaskQuery::by_job(key)
            .active()
            .with_instance_ids(instance_ids.iter().copied());
        let (_, changes) = self
            .state
            .task_manager
            .change_states_matching(
                &query,
                TaskState::Restarting,
                Some(format!("Restarted by {}", caller.user)),
            )
            .await?;
        self.publish_changes(&changes).await?;
        Ok(())
    }

    /// Create additional PENDING instances of an existing job.
    pub async fn add_instances(
        &self,
        caller: &Identity,
        key: &JobKey,
        instance_ids: &[u32],
        task_config: &TaskConfig,
        lock_token: Option<&str>,
    ) -> Result<Vec<String>> {
        self.auth.authorize(caller, &key.role)?;
        if task_config.job != *key {
            return Err(BorealisError::InvalidRequest(
                "Task config job key does not match the job".to_owned(),
            ));
        }

        let key = key.clone();
        let token = lock_token.map(str::to_owned);
        let instance_ids = instance_ids.to_vec();
        let config = task_config.clone();
        let task_manager = self.state.task_manager.clone();
        let mut effects = TxnSideEffects::default();

        let task_ids = self
            .state
            .storage
            .write(|txn| {
                LockManager::validate_in_txn(txn, &LockKey::Job(key.clone()), token.as_deref())?;
                let live = txn.fetch_tasks(
                    &TaskQuery::by_job(&key)
                        .active()
                        .with_instance_ids(instance_ids.iter().copied()),
                );
                if !live.is_empty() {
                    return Err(BorealisError::InvalidRequest(format!(
                        "{} of the requested instances are already active",
                        live.len()
                    )));
                }

                QuotaManager::check_admission(txn, &config, instance_ids.len() as u32)?;
                let mut task_ids = vec![];
                for instance_id in &instance_ids {
                    task_ids.push(task_manager.create_task(
                        txn,
                        &config,
                        *instance_id,
                        &mut effects,
                    )?);
                }
                Ok(task_ids)
            })
            .await?;

        let changes = self.state.task_manager.finish(effects).await;
        self.publish_changes(&changes).await?;
        Ok(task_ids)
    }

    pub async fn acquire_lock(
        &self,
        caller: &Identity,
        key: LockKey,
        message: Option<String>,
    ) -> Result<Lock> {
        let LockKey::Job(job_key) = &key;
        self.auth.authorize(caller, &job_key.role)?;
        self.state
            .lock_manager
            .acquire_lock(key, caller.clone(), message)
            .await
    }

    pub async fn release_lock(&self, caller: &Identity, lock: &Lock) -> Result<()> {
        let LockKey::Job(job_key) = &lock.key;
        self.auth.authorize(caller, &job_key.role)?;
        self.state.lock_manager.release_lock(lock).await
    }

    /// Privileged: inject a state transition, still subject to the
    /// transition table.
    pub async fn force_task_state(
        &self,
        caller: &Identity,
        task_id: &str,
        state: TaskState,
    ) -> Result<()> {
        self.auth.authorize_admin(caller)?;
        info!(
            "Admin {} is forcing task {task_id} to {state}",
            caller.user
        );

        let current = self
            .state
            .storage
            .read(|stores| stores.fetch_task(task_id).map(|t| t.status));
        let Some(current) = current else {
            return Err(BorealisError::InvalidRequest(format!(
                "Task {task_id} does not exist"
            )));
        };

        let changes = self
            .state
            .task_manager
            .change_state(
                task_id,
                state,
                Some(format!("State forced by {}", caller.user)),
            )
            .await?;
        if changes.is_empty() && current != state {
            return Err(BorealisError::InvalidRequest(format!(
                "Operator-requested transition {current} -> {state} is not legal"
            )));
        }
        self.publish_changes(&changes).await?;
        Ok(())
    }

    /// Entry point for agent status updates from the executor protocol.
    pub async fn status_update(
        &self,
        task_id: &str,
        state: TaskState,
        message: Option<String>,
    ) -> Result<()> {
        let changes = self
            .state
            .task_manager
            .change_state(task_id, state, message)
            .await?;
        self.publish_changes(&changes).await?;
        Ok(())
    }

    /// New resource offers from the cluster manager. First sight of a host
    /// also seeds its attribute record.
    pub async fn resource_offers(&self, offers: Vec<HostOffer>) -> Result<()> {
        let hosts: Vec<(String, String)> = offers
            .iter()
            .map(|offer| (offer.host.clone(), offer.slave_id.clone()))
            .collect();
        self.state
            .storage
            .write(move |txn| {
                for (host, slave_id) in hosts {
                    let mut attrs = txn
                        .fetch_host_attributes(&host)
                        .cloned()
                        .unwrap_or_else(|| HostAttributes::new(&host));
                    if attrs.slave_id.as_deref() != Some(slave_id.as_str()) {
                        attrs.slave_id = Some(slave_id);
                        txn.save_host_attributes(attrs);
                    }
                }
                Ok(())
            })
            .await?;
        self.state.offer_manager.add_offers(offers);
        Ok(())
    }

    pub fn offer_rescinded(&self, offer_id: &str) {
        self.state.offer_manager.rescind(offer_id);
    }

    pub async fn start_maintenance(
        &self,
        caller: &Identity,
        hosts: &[String],
    ) -> Result<Vec<HostStatus>> {
        self.auth.authorize_admin(caller)?;
        self.state.maintenance.start_maintenance(hosts).await
    }

    pub async fn drain_hosts(
        &self,
        caller: &Identity,
        hosts: &[String],
    ) -> Result<Vec<HostStatus>> {
        self.auth.authorize_admin(caller)?;
        let (statuses, changes) = self.state.maintenance.drain(hosts).await?;
        self.publish_changes(&changes).await?;
        Ok(statuses)
    }

    pub fn maintenance_status(&self, hosts: &[String]) -> Vec<HostStatus> {
        self.state.maintenance.status(hosts)
    }

    pub async fn end_maintenance(
        &self,
        caller: &Identity,
        hosts: &[String],
    ) -> Result<Vec<HostStatus>> {
        self.auth.authorize_admin(caller)?;
        self.state.maintenance.end_maintenance(hosts).await
    }

    pub async fn perform_backup(&self, caller: &Identity) -> Result<String> {
        self.auth.authorize_admin(caller)?;
        self.state.backup_manager.perform_backup().await
    }

    pub fn list_backups(&self, caller: &Identity) -> Result<Vec<String>> {
        self.auth.authorize_admin(caller)?;
        self.state.backup_manager.list_backups()
    }

    pub fn stage_recovery(&self, caller: &Identity, backup_id: &str) -> Result<()> {
        self.auth.authorize_admin(caller)?;
        self.state.backup_manager.stage_recovery(backup_id)
    }

    pub fn query_recovery(
        &self,
        caller: &Identity,
        query: &TaskQuery,
    ) -> Result<Vec<ScheduledTask>> {
        self.auth.authorize_admin(caller)?;
        self.state.backup_manager.query_recovery(query)
    }

    pub fn delete_recovery_tasks(
        &self,
        caller: &Identity,
        query: &TaskQuery,
    ) -> Result<usize> {
        self.auth.authorize_admin(caller)?;
        self.state.backup_manager.delete_recovery_tasks(query)
    }

    /// Commit the staged snapshot as the live state and re-arm the
    /// scheduling loop against it.
    pub async fn commit_recovery(&self, caller: &Identity) -> Result<()> {
        self.auth.authorize_admin(caller)?;
        self.state.backup_manager.commit_recovery().await?;

        self.state.task_manager.seed_machines();
        let pending = self.state.storage.read(|stores| {
            stores.fetch_tasks(&TaskQuery::all().with_statuses([TaskState::Pending]))
        });
        self.state.task_groups.storage_ready(pending, || {
            self.state.task_manager.startup_reschedule_delay_ms()
        });
        Ok(())
    }

    pub fn unload_recovery(&self, caller: &Identity) -> Result<()> {
        self.auth.authorize_admin(caller)?;
        self.state.backup_manager.unload_recovery()
    }

    /// Force a log snapshot now.
    pub async fn snapshot(&self, caller: &Identity) -> Result<()> {
        self.auth.authorize_admin(caller)?;
        self.state.storage.snapshot().await?;
        Ok(())
    }

    pub fn get_version(&self) -> &'static str {
        borealis_core::BOREALIS_VERSION
    }

    fn job_key_of(query: &TaskQuery) -> Option<JobKey> {
        match (&query.role, &query.environment, &query.job_name) {
            (Some(role), Some(environment), Some(name)) => {
                Some(JobKey::new(role.clone(), environment.clone(), name.clone()))
            }
            _ => None,
        }
    }
}

pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs()
}

pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}
