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

//! The state-machine host: one machine per live task id, a single
//! `change_state` entry point for agent updates, placement results and
//! operator transitions, and the interpreter that applies emitted
//! [`WorkCommand`]s inside the enclosing storage transaction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, info, warn};
use rand::Rng;
use uuid::Uuid;

use borealis_core::clock::Clock;
use borealis_core::error::{BorealisError, Result};
use borealis_core::model::{
    AssignedTask, HostOffer, ScheduledTask, TaskEvent, TaskQuery, TaskState,
};

use crate::config::SchedulerConfig;
use crate::metrics::SchedulerMetricsCollector;
use crate::state::task_state_machine::{
    transition, TaskStateMachine, TransitionContext, TransitionOutcome, WorkCommand,
};
use crate::storage::{TransactionalStorage, WriteTxn};

/// Seam to the cluster manager: launching an assigned task against a
/// reserved offer and killing a remote process.
#[async_trait]
pub trait TaskLauncher: Send + Sync + 'static {
    async fn launch_task(&self, offer: &HostOffer, task: &AssignedTask) -> Result<()>;

    async fn kill_task(&self, task_id: &str) -> Result<()>;
}

/// A committed state change, reported to the event bus so the scheduling
/// loop and the maintenance controller can react.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub task_id: String,
    pub from: TaskState,
    pub to: TaskState,
    pub slave_host: Option<String>,
    /// Set when the record was removed rather than updated.
    pub deleted: bool,
}

/// Side effects accumulated while a transaction is open and applied after it
/// commits: machine-map sync, agent kills, replacement tasks entering the
/// scheduling loop.
#[derive(Debug, Default)]
pub struct TxnSideEffects {
    pub changes: Vec<StateChange>,
    pub kills: Vec<String>,
}

pub struct TaskManager {
    storage: Arc<TransactionalStorage>,
    launcher: Arc<dyn TaskLauncher>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn SchedulerMetricsCollector>,
    config: SchedulerConfig,
    machines: DashMap<String, TaskStateMachine>,
}

impl TaskManager {
    pub fn new(
        storage: Arc<TransactionalStorage>,
        launcher: Arc<dyn TaskLauncher>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn SchedulerMetricsCollector>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            storage,
            launcher,
            clock,
            metrics,
            config,
            machines: DashMap::new(),
        }
    }

    /// Rebuild the machine map from recovered storage. Called once, before
    /// the scheduling loop is armed.
    pub fn seed_machines(&self) {
        self.machines.clear();
        self.storage.read(|stores| {
            for task in stores.tasks.values() {
                self.machines.insert(
                    task.task_id().to_owned(),
                    TaskStateMachine::new(task.task_id(), task.status),
                );
            }
        });
        info!("Seeded {} task state machines", self.machines.len());
    }

    pub fn machine_state(&self, task_id: &str) -> Option<TaskState> {
        self.machines.get(task_id).map(|m| m.state())
    }

    pub fn live_machine_count(&self) -> usize {
        self.machines.len()
    }

    /// Drive a single task toward `target` in its own transaction.
    pub async fn change_state(
        &self,
        task_id: &str,
        target: TaskState,
        message: Option<String>,
    ) -> Result<Vec<StateChange>> {
        let mut effects = TxnSideEffects::default();
        self.storage
            .write(|txn| {
                self.apply_transition(txn, task_id, target, message, None, &mut effects)
            })
            .await?;
        Ok(self.finish(effects).await)
    }

    /// Drive every task matching `query` toward `target` in one transaction.
    /// Fails with `InvalidRequest` when nothing matches.
    pub async fn change_states_matching(
        &self,
        query: &TaskQuery,
        target: TaskState,
        message: Option<String>,
    ) -> Result<(Vec<String>, Vec<StateChange>)> {
        let mut effects = TxnSideEffects::default();
        let matched = self
            .storage
            .write(|txn| {
                let matched = txn.fetch_tasks(query);
                if matched.is_empty() {
                    return Err(BorealisError::InvalidRequest(
                        "No tasks found that match the query".to_owned(),
                    ));
                }
                for task in &matched {
                    self.apply_transition(
                        txn,
                        task.task_id(),
                        target,
                        message.clone(),
                        None,
                        &mut effects,
                    )?;
                }
                Ok(matched
                    .iter()
                    .map(|t| t.task_id().to_owned())
                    .collect::<Vec<_>>())
            })
            .await?;
        let changes = self.finish(effects).await;
        Ok((matched, changes))
    }

    /// Transition matched tasks toward KILLING and wait, with bounded
    /// exponential backoff, for all of them to reach a terminal state or be
    /// deleted. Exhausting the budget surfaces `Timeout`; the KILLING states
    /// stand.
    pub async fn kill_tasks(
        &self,
        query: &TaskQuery,
        message: Option<String>,
    ) -> Result<Vec<StateChange>> {
        let (matched, changes) = self
            .change_states_matching(query, TaskState::Killing, message)
            .await?;
        self.await_terminal(&matched).await?;
        Ok(changes)
    }

    async fn await_terminal(&self, task_ids: &[String]) -> Result<()> {
        let mut backoff_ms = self.config.kill_task_initial_backoff_ms;
        let mut waited_ms = 0u64;

        loop {
            let outstanding = self.storage.read(|stores| {
                task_ids
                    .iter()
                    .filter(|id| {
                        stores
                            .fetch_task(id)
                            .map(|t| !t.status.is_terminal())
                            .unwrap_or(false)
                    })
                    .count()
            });
            if outstanding == 0 {
                return Ok(());
            }
            if waited_ms >= self.config.kill_task_max_wait_ms {
                return Err(BorealisError::Timeout(format!(
                    "Timed out waiting for {outstanding} tasks to transition to a terminal state"
                )));
            }

            let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 4 + 1);
            let sleep_ms = (backoff_ms + jitter)
                .min(self.config.kill_task_max_wait_ms - waited_ms);
            debug!("{outstanding} killed tasks still live, backing off {sleep_ms}ms");
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            waited_ms += sleep_ms;
            backoff_ms = (backoff_ms * 2).min(self.config.kill_task_max_backoff_ms);
        }
    }

    /// Apply a transition inside an open transaction. The optional
    /// `mutation` runs against the task's assignment when the new state is
    /// persisted (placement uses it to record the host and ports).
    pub fn apply_transition(
        &self,
        txn: &mut WriteTxn,
        task_id: &str,
        target: TaskState,
        message: Option<String>,
        mutation: Option<&dyn Fn(&mut AssignedTask)>,
        effects: &mut TxnSideEffects,
    ) -> Result<bool> {
        let Some(task) = txn.fetch_task(task_id).cloned() else {
            // An agent acknowledged a task this scheduler has no record of.
            if matches!(
                target,
                TaskState::Assigned | TaskState::Starting | TaskState::Running
            ) {
                warn!("Agent reported unknown task {task_id} as {target}, killing it");
                effects.kills.push(task_id.to_owned());
            } else {
                debug!("Dropping {target} update for unknown task {task_id}");
            }
            return Ok(false);
        };

        let ctx = TransitionContext {
            is_service: task.config().is_service,
            failure_count: task.failure_count,
            max_task_failures: task.config().max_task_failures,
        };

        match transition(task.status, target, ctx) {
            TransitionOutcome::Noop => Ok(false),
            TransitionOutcome::Illegal { commands } => {
                self.metrics
                    .record_illegal_transition(task_id, task.status, target);
                for command in commands {
                    if command == WorkCommand::Kill {
                        effects.kills.push(task_id.to_owned());
                    }
                }
                Ok(false)
            }
            TransitionOutcome::Progress { target, commands } => {
                let from = task.status;
                let mut updated = task;
                let mut deleted = false;

                for command in commands {
                    match command {
                        WorkCommand::Kill => effects.kills.push(task_id.to_owned()),
                        WorkCommand::IncrementFailures => updated.failure_count += 1,
                        WorkCommand::UpdateState => {
                            if let Some(mutate) = mutation {
                                mutate(&mut updated.assigned);
                            }
                            updated.status = target;
                            updated.task_events.push(TaskEvent {
                                timestamp_ms: self.clock.now_millis(),
                                status: target,
                                message: message.clone(),
                                scheduler_host: Some(
                                    self.config.scheduler_host.clone(),
                                ),
                            });
                            txn.save_tasks(vec![updated.clone()]);
                        }
                        WorkCommand::Delete => {
                            txn.remove_tasks(vec![task_id.to_owned()]);
                            deleted = true;
                        }
                        WorkCommand::Reschedule => {
                            let replacement = self.synthesize_replacement(&updated);
                            effects.changes.push(StateChange {
                                task_id: replacement.task_id().to_owned(),
                                from: TaskState::Init,
                                to: TaskState::Pending,
                                slave_host: None,
                                deleted: false,
                            });
                            txn.save_tasks(vec![replacement]);
                        }
                    }
                }

                self.metrics.record_state_transition(from, target);
                effects.changes.push(StateChange {
                    task_id: task_id.to_owned(),
                    from,
                    to: target,
                    slave_host: updated.assigned.slave_host.clone(),
                    deleted,
                });
                Ok(true)
            }
        }
    }

    /// Create a brand-new task for `instance_id` of `config` inside an open
    /// transaction. The machine starts at INIT and is immediately driven to
    /// PENDING so the creation flows through the same transition machinery
    /// as everything else.
    pub fn create_task(
        &self,
        txn: &mut WriteTxn,
        config: &borealis_core::model::TaskConfig,
        instance_id: u32,
        effects: &mut TxnSideEffects,
    ) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        let task = ScheduledTask {
            assigned: AssignedTask::new(task_id.clone(), instance_id, config.clone()),
            status: TaskState::Init,
            failure_count: 0,
            ancestor_id: None,
            task_events: vec![],
        };
        txn.save_tasks(vec![task]);
        self.apply_transition(
            txn,
            &task_id,
            TaskState::Pending,
            Some("Task created".to_owned()),
            None,
            effects,
        )?;
        Ok(task_id)
    }

    /// A reschedule is a new task record with a fresh id, the same config
    /// and instance, the ancestor chain extended, and the failure count
    /// carried over so `max_task_failures` bounds the whole chain.
    fn synthesize_replacement(&self, ancestor: &ScheduledTask) -> ScheduledTask {
        let task_id = Uuid::new_v4().to_string();
        debug!(
            "Rescheduling task {} as {} (instance {} of {})",
            ancestor.task_id(),
            task_id,
            ancestor.assigned.instance_id,
            ancestor.job_key()
        );
        ScheduledTask {
            assigned: AssignedTask::new(
                task_id,
                ancestor.assigned.instance_id,
                ancestor.config().clone(),
            ),
            status: TaskState::Pending,
            failure_count: ancestor.failure_count,
            ancestor_id: Some(ancestor.task_id().to_owned()),
            task_events: vec![TaskEvent {
                timestamp_ms: self.clock.now_millis(),
                status: TaskState::Pending,
                message: Some(format!("Rescheduled from {}", ancestor.task_id())),
                scheduler_host: Some(self.config.scheduler_host.clone()),
            }],
        }
    }

    /// Sync the machine map and dispatch agent kills for a committed
    /// transaction, returning the committed changes.
    pub async fn finish(&self, effects: TxnSideEffects) -> Vec<StateChange> {
        for change in &effects.changes {
            if change.deleted {
                self.machines.remove(&change.task_id);
            } else {
                self.machines.insert(
                    change.task_id.clone(),
                    TaskStateMachine::new(&change.task_id, change.to),
                );
            }
        }

        let kills: Vec<_> = effects
            .kills
            .iter()
            .map(|task_id| {
                let launcher = self.launcher.clone();
                let task_id = task_id.clone();
                async move {
                    if let Err(e) = launcher.kill_task(&task_id).await {
                        warn!("Failed to send kill for task {task_id}: {e}");
                    }
                }
            })
            .collect();
        join_all(kills).await;

        effects.changes
    }

    /// Initial delay applied to a task re-entering the scheduling loop after
    /// failover, bounded random to avoid a thundering herd.
    pub fn startup_reschedule_delay_ms(&self) -> u64 {
        let bound = self.config.max_startup_reschedule_delay_ms.max(1);
        rand::thread_rng().gen_range(0..bound)
    }
}
