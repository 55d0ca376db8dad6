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

use async_trait::async_trait;
use log::{debug, error, info, warn};

use borealis_core::error::{BorealisError, Result};
use borealis_core::event_loop::{EventAction, EventSender};

use crate::scheduler_server::event::SchedulerEvent;
use crate::state::SchedulerState;

/// Consumes [`SchedulerEvent`]s: pending tasks join their groups, deleted
/// tasks leave them, and terminal transitions on draining hosts advance the
/// maintenance lifecycle.
pub struct TaskScheduler {
    state: Arc<SchedulerState>,
}

impl TaskScheduler {
    pub fn new(state: Arc<SchedulerState>) -> Self {
        Self { state }
    }

    pub fn pending_tasks(&self) -> usize {
        self.state.task_groups.pending_tasks()
    }
}

#[async_trait]
impl EventAction<SchedulerEvent> for TaskScheduler {
    fn on_start(&self) {
        info!("Starting the task scheduler");
    }

    fn on_stop(&self) {
        info!("Stopping the task scheduler");
    }

    async fn on_receive(
        &self,
        event: SchedulerEvent,
        _tx_event: &EventSender<SchedulerEvent>,
    ) -> Result<()> {
        match event {
            SchedulerEvent::TasksPending { task_ids } => {
                for task_id in task_ids {
                    let task = self
                        .state
                        .storage
                        .read(|stores| stores.fetch_task(&task_id).cloned());
                    match task {
                        Some(task) => {
                            self.state.task_groups.task_pending(&task, 0)
                        }
                        None => debug!(
                            "Pending task {task_id} vanished before it joined a group"
                        ),
                    }
                }
            }
            SchedulerEvent::TasksDeleted { task_ids } => {
                self.state.task_groups.tasks_deleted(&task_ids);
            }
            SchedulerEvent::TaskStateChanged {
                task_id,
                from,
                to,
                slave_host,
            } => {
                debug!("Task {task_id} transitioned {from} -> {to}");
                if to.is_terminal() {
                    if let Some(host) = slave_host {
                        if let Err(e) = self.state.maintenance.check_drained(&host).await
                        {
                            warn!("Drain check for host {host} failed: {e}");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn on_error(&self, error: BorealisError) {
        error!("Error processing scheduler event: {error}");
    }
}
