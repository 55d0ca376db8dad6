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

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use borealis_core::model::TaskState;

/// Sink for scheduler-internal counters. The default implementation keeps
/// in-process atomics; deployments wanting an external metrics pipeline plug
/// in their own collector.
pub trait SchedulerMetricsCollector: Send + Sync + Debug {
    fn record_state_transition(&self, from: TaskState, to: TaskState);

    fn record_illegal_transition(&self, task_id: &str, from: TaskState, to: TaskState);

    fn record_placement_attempt(&self, scheduled: bool);

    fn record_preemption_attempt(&self, victim_found: bool);

    fn record_log_append(&self);

    fn record_snapshot(&self);
}

#[derive(Debug, Default)]
pub struct InProcessMetricsCollector {
    pub state_transitions: AtomicU64,
    pub illegal_transitions: AtomicU64,
    pub placement_attempts: AtomicU64,
    pub placement_failures: AtomicU64,
    pub preemption_attempts: AtomicU64,
    pub preemption_victims: AtomicU64,
    pub log_appends: AtomicU64,
    pub snapshots: AtomicU64,
}

impl InProcessMetricsCollector {
    pub fn illegal_transitions(&self) -> u64 {
        self.illegal_transitions.load(Ordering::SeqCst)
    }

    pub fn placement_failures(&self) -> u64 {
        self.placement_failures.load(Ordering::SeqCst)
    }

    pub fn snapshots(&self) -> u64 {
        self.snapshots.load(Ordering::SeqCst)
    }
}

impl SchedulerMetricsCollector for InProcessMetricsCollector {
    fn record_state_transition(&self, _from: TaskState, _to: TaskState) {
        self.state_transitions.fetch_add(1, Ordering::SeqCst);
    }

    fn record_illegal_transition(&self, task_id: &str, from: TaskState, to: TaskState) {
        log::warn!("Illegal state transition attempted for task {task_id}: {from} -> {to}");
        self.illegal_transitions.fetch_add(1, Ordering::SeqCst);
    }

    fn record_placement_attempt(&self, scheduled: bool) {
        self.placement_attempts.fetch_add(1, Ordering::SeqCst);
        if !scheduled {
            self.placement_failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record_preemption_attempt(&self, victim_found: bool) {
        self.preemption_attempts.fetch_add(1, Ordering::SeqCst);
        if victim_found {
            self.preemption_victims.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record_log_append(&self) {
        self.log_appends.fetch_add(1, Ordering::SeqCst);
    }

    fn record_snapshot(&self) {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct NoopMetricsCollector {}

impl SchedulerMetricsCollector for NoopMetricsCollector {
    fn record_state_transition(&self, _from: TaskState, _to: TaskState) {}

    fn record_illegal_transition(&self, _task_id: &str, _from: TaskState, _to: TaskState) {
    }

    fn record_placement_attempt(&self, _scheduled: bool) {}

    fn record_preemption_attempt(&self, _victim_found: bool) {}

    fn record_log_append(&self) {}

    fn record_snapshot(&self) {}
}
