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

//! Borealis scheduler specific configs

use std::path::PathBuf;

/// Configuration for the borealis scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Hostname recorded on task audit events emitted by this scheduler.
    pub scheduler_host: String,
    /// First delay of the kill-confirmation wait loop.
    pub kill_task_initial_backoff_ms: u64,
    /// Cap on a single kill-confirmation wait.
    pub kill_task_max_backoff_ms: u64,
    /// Total budget for waiting on killed tasks to reach a terminal state.
    pub kill_task_max_wait_ms: u64,
    /// Interval between automatic full snapshots of the distributed log.
    pub dlog_snapshot_interval_ms: u64,
    /// Maximum size of a single log entry.
    pub dlog_max_entry_size: usize,
    /// Grace period for flushing the log on shutdown.
    pub dlog_shutdown_grace_period_ms: u64,
    /// Global cap on placement attempts per second across all task groups.
    pub scheduling_rate_limit_qps: f64,
    /// Initial per-group penalty after a failed placement attempt.
    pub initial_penalty_ms: u64,
    /// Cap on the per-group penalty.
    pub max_penalty_ms: u64,
    /// Upper bound of the random initial delay applied to tasks re-enqueued
    /// when storage becomes ready after a failover.
    pub max_startup_reschedule_delay_ms: u64,
    /// Buffer size of the scheduler event loop.
    pub event_loop_buffer_size: usize,
    /// Directory holding exported backups.
    pub backup_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_host: "localhost".to_owned(),
            kill_task_initial_backoff_ms: 1_000,
            kill_task_max_backoff_ms: 30_000,
            kill_task_max_wait_ms: 60_000,
            dlog_snapshot_interval_ms: 5 * 60 * 1_000,
            dlog_max_entry_size: 512 * 1024,
            dlog_shutdown_grace_period_ms: 5_000,
            scheduling_rate_limit_qps: 40.0,
            initial_penalty_ms: 1_000,
            max_penalty_ms: 60_000,
            max_startup_reschedule_delay_ms: 30_000,
            event_loop_buffer_size: 10_000,
            backup_dir: PathBuf::from("/var/lib/borealis/backups"),
        }
    }
}

impl SchedulerConfig {
    pub fn with_scheduler_host(mut self, host: impl Into<String>) -> Self {
        self.scheduler_host = host.into();
        self
    }

    pub fn with_kill_task_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.kill_task_initial_backoff_ms = initial_ms;
        self.kill_task_max_backoff_ms = max_ms;
        self
    }

    pub fn with_kill_task_max_wait_ms(mut self, max_wait_ms: u64) -> Self {
        self.kill_task_max_wait_ms = max_wait_ms;
        self
    }

    pub fn with_snapshot_interval_ms(mut self, interval_ms: u64) -> Self {
        self.dlog_snapshot_interval_ms = interval_ms;
        self
    }

    pub fn with_rate_limit_qps(mut self, qps: f64) -> Self {
        self.scheduling_rate_limit_qps = qps;
        self
    }

    pub fn with_penalty_ms(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_penalty_ms = initial_ms;
        self.max_penalty_ms = max_ms;
        self
    }

    pub fn with_max_startup_reschedule_delay_ms(mut self, delay_ms: u64) -> Self {
        self.max_startup_reschedule_delay_ms = delay_ms;
        self
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }
}
