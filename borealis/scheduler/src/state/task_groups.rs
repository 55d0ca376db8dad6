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

//! The scheduling loop: pending tasks batched by configuration fingerprint,
//! one cooperative worker per group, per-group backoff and a global rate
//! limit on placement attempts.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;

use borealis_core::clock::Clock;
use borealis_core::error::Result;
use borealis_core::model::{GroupKey, ScheduledTask};

use crate::metrics::SchedulerMetricsCollector;

/// Placement action seam: attempt to place one PENDING task against the
/// current offer pool.
#[async_trait]
pub trait TaskPlacer: Send + Sync + 'static {
    /// `Ok(true)` when the task was assigned and launched, `Ok(false)` when
    /// no compatible offer exists.
    async fn try_place(&self, task_id: &str) -> Result<bool>;
}

/// Preemption seam, consulted after a failed placement attempt.
#[async_trait]
pub trait Preemptor: Send + Sync + 'static {
    /// Search for a lower-priority victim whose slot would fit `task_id`,
    /// and initiate its eviction. Returns the victim's task id if one was
    /// found.
    async fn attempt_preemption_for(&self, task_id: &str) -> Result<Option<String>>;
}

/// Produces the next penalty after a failed attempt.
pub trait BackoffStrategy: Send + Sync + 'static {
    fn initial_ms(&self) -> u64;

    fn next_ms(&self, current_ms: u64) -> u64;
}

/// Doubles the penalty up to a cap, with up to 10% jitter so groups created
/// together don't tick in lockstep.
#[derive(Debug, Clone)]
pub struct TruncatedBinaryBackoff {
    initial_ms: u64,
    max_ms: u64,
}

impl TruncatedBinaryBackoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self { initial_ms, max_ms }
    }
}

impl BackoffStrategy for TruncatedBinaryBackoff {
    fn initial_ms(&self) -> u64 {
        self.initial_ms
    }

    fn next_ms(&self, current_ms: u64) -> u64 {
        let doubled = current_ms.saturating_mul(2).max(1);
        let jitter = rand::thread_rng().gen_range(0..=doubled / 10 + 1);
        doubled.saturating_add(jitter).min(self.max_ms)
    }
}

/// Token-bucket limiter on global placement attempts. A caller may block for
/// up to one permit interval.
pub struct RateLimiter {
    interval: Duration,
    next_free: tokio::sync::Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(permits_per_second: f64) -> Self {
        let interval = Duration::from_secs_f64(1.0 / permits_per_second.max(0.001));
        Self {
            interval,
            next_free: tokio::sync::Mutex::new(Instant::now()),
        }
    }

    pub async fn acquire(&self) {
        let wait = {
            let mut next_free = self.next_free.lock().await;
            let now = Instant::now();
            let scheduled_at = (*next_free).max(now);
            *next_free = scheduled_at + self.interval;
            scheduled_at.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Empty,
    Ready,
    NotReady { ready_at_ms: u64 },
}

/// FIFO of pending tasks sharing one configuration fingerprint.
struct TaskGroup {
    queue: VecDeque<(String, u64)>,
    penalty_ms: u64,
}

impl TaskGroup {
    fn new(initial_penalty_ms: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            penalty_ms: initial_penalty_ms,
        }
    }

    fn state(&self, now_ms: u64) -> GroupState {
        match self.queue.front() {
            None => GroupState::Empty,
            Some((_, ready_at_ms)) if *ready_at_ms <= now_ms => GroupState::Ready,
            Some((_, ready_at_ms)) => GroupState::NotReady {
                ready_at_ms: *ready_at_ms,
            },
        }
    }

    fn contains(&self, task_id: &str) -> bool {
        self.queue.iter().any(|(id, _)| id == task_id)
    }
}

enum Tick {
    Attempt(String),
    Sleep(u64),
    MaybeDrop,
}

/// Host of all task groups. Groups are created lazily when the first task
/// with a fingerprint enters PENDING and invalidated when their queue
/// drains.
pub struct TaskGroups {
    inner: Arc<GroupsInner>,
}

struct GroupsInner {
    groups: Mutex<HashMap<GroupKey, Arc<Mutex<TaskGroup>>>>,
    placer: Arc<dyn TaskPlacer>,
    preemptor: Arc<dyn Preemptor>,
    rate_limiter: Arc<RateLimiter>,
    backoff: Arc<dyn BackoffStrategy>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn SchedulerMetricsCollector>,
}

impl TaskGroups {
    pub fn new(
        placer: Arc<dyn TaskPlacer>,
        preemptor: Arc<dyn Preemptor>,
        rate_limiter: Arc<RateLimiter>,
        backoff: Arc<dyn BackoffStrategy>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn SchedulerMetricsCollector>,
    ) -> Self {
        Self {
            inner: Arc::new(GroupsInner {
                groups: Mutex::new(HashMap::new()),
                placer,
                preemptor,
                rate_limiter,
                backoff,
                clock,
                metrics,
            }),
        }
    }

    /// A task has entered PENDING: enqueue it into its group, creating the
    /// group (and its worker) on first use.
    pub fn task_pending(&self, task: &ScheduledTask, initial_delay_ms: u64) {
        let key = task.config().group_key();
        let ready_at_ms = self.inner.clock.now_millis() + initial_delay_ms;
        let task_id = task.task_id().to_owned();

        let spawn = {
            let mut groups = self.inner.groups.lock();
            match groups.get(&key) {
                Some(group) => {
                    let mut group = group.lock();
                    if !group.contains(&task_id) {
                        group.queue.push_back((task_id, ready_at_ms));
                    }
                    None
                }
                None => {
                    let group = Arc::new(Mutex::new(TaskGroup::new(
                        self.inner.backoff.initial_ms(),
                    )));
                    group.lock().queue.push_back((task_id, ready_at_ms));
                    groups.insert(key.clone(), group.clone());
                    Some(group)
                }
            }
        };

        if let Some(group) = spawn {
            debug!("Creating task group {key}");
            GroupsInner::spawn_group_worker(self.inner.clone(), key, group);
        }
    }

    /// Storage is recovered: re-enqueue every PENDING task, each with its
    /// own bounded-random delay.
    pub fn storage_ready<F: Fn() -> u64>(&self, pending: Vec<ScheduledTask>, delay_ms: F) {
        for task in pending {
            self.task_pending(&task, delay_ms());
        }
    }

    /// Deleted tasks are dropped from their queues; the group worker
    /// invalidates the group once it drains.
    pub fn tasks_deleted(&self, task_ids: &[String]) {
        let groups = self.inner.groups.lock();
        for group in groups.values() {
            let mut group = group.lock();
            group
                .queue
                .retain(|(id, _)| !task_ids.iter().any(|t| t == id));
        }
    }

    pub fn group_count(&self) -> usize {
        self.inner.groups.lock().len()
    }

    pub fn pending_tasks(&self) -> usize {
        self.inner
            .groups
            .lock()
            .values()
            .map(|group| group.lock().queue.len())
            .sum()
    }
}

impl GroupsInner {
    fn spawn_group_worker(
        this: Arc<GroupsInner>,
        key: GroupKey,
        group: Arc<Mutex<TaskGroup>>,
    ) {
        tokio::spawn(async move {
            loop {
                let tick = {
                    let mut group = group.lock();
                    let now_ms = this.clock.now_millis();
                    match group.state(now_ms) {
                        GroupState::Empty => Tick::MaybeDrop,
                        GroupState::NotReady { ready_at_ms } => {
                            Tick::Sleep(ready_at_ms - now_ms)
                        }
                        GroupState::Ready => {
                            let (task_id, _) = group
                                .queue
                                .pop_front()
                                .expect("READY implies a head entry");
                            Tick::Attempt(task_id)
                        }
                    }
                };

                match tick {
                    Tick::MaybeDrop => {
                        // Re-check emptiness under both locks so an enqueue
                        // racing this drop is not lost.
                        let mut groups = this.groups.lock();
                        let group_ref = group.lock();
                        if group_ref.queue.is_empty() {
                            groups.remove(&key);
                            debug!("Dropping drained task group {key}");
                            return;
                        }
                    }
                    Tick::Sleep(ms) => {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    Tick::Attempt(task_id) => {
                        this.rate_limiter.acquire().await;
                        let scheduled = match this.placer.try_place(&task_id).await {
                            Ok(scheduled) => scheduled,
                            Err(e) => {
                                warn!("Placement attempt for {task_id} failed: {e}");
                                false
                            }
                        };
                        this.metrics.record_placement_attempt(scheduled);

                        if scheduled {
                            let penalty_ms = {
                                let mut group = group.lock();
                                group.penalty_ms = this.backoff.initial_ms();
                                group.penalty_ms
                            };
                            tokio::time::sleep(Duration::from_millis(penalty_ms))
                                .await;
                        } else {
                            {
                                let mut group = group.lock();
                                group.penalty_ms =
                                    this.backoff.next_ms(group.penalty_ms);
                                let ready_at_ms =
                                    this.clock.now_millis() + group.penalty_ms;
                                group.queue.push_back((task_id.clone(), ready_at_ms));
                            }
                            match this.preemptor.attempt_preemption_for(&task_id).await
                            {
                                Ok(victim) => this
                                    .metrics
                                    .record_preemption_attempt(victim.is_some()),
                                Err(e) => {
                                    warn!("Preemption search for {task_id} failed: {e}")
                                }
                            }
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use borealis_core::clock::SystemClock;
    use borealis_core::model::{
        AssignedTask, Identity, JobKey, ResourceRequest, TaskConfig, TaskState,
    };

    use crate::metrics::InProcessMetricsCollector;

    use super::*;

    #[derive(Default)]
    struct ScriptedPlacer {
        /// Succeed from this attempt number onward.
        succeed_after: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl TaskPlacer for ScriptedPlacer {
        async fn try_place(&self, _task_id: &str) -> Result<bool> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(attempt >= self.succeed_after)
        }
    }

    #[derive(Default)]
    struct NoopPreemptor {
        asked: AtomicUsize,
    }

    #[async_trait]
    impl Preemptor for NoopPreemptor {
        async fn attempt_preemption_for(&self, _task_id: &str) -> Result<Option<String>> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    fn test_task(task_id: &str, job_name: &str) -> ScheduledTask {
        let config = TaskConfig {
            job: JobKey::new("web", "prod", job_name),
            owner: Identity::new("ops"),
            is_service: false,
            priority: 0,
            production: false,
            max_task_failures: 1,
            resources: ResourceRequest::new(1.0, 128, 16),
            command: "run".to_owned(),
            constraints: vec![],
            metadata: BTreeMap::new(),
        };
        ScheduledTask {
            assigned: AssignedTask::new(task_id, 0, config),
            status: TaskState::Pending,
            failure_count: 0,
            ancestor_id: None,
            task_events: vec![],
        }
    }

    fn test_groups(
        placer: Arc<dyn TaskPlacer>,
        preemptor: Arc<dyn Preemptor>,
    ) -> Arc<TaskGroups> {
        Arc::new(TaskGroups::new(
            placer,
            preemptor,
            Arc::new(RateLimiter::new(1_000.0)),
            Arc::new(TruncatedBinaryBackoff::new(5, 50)),
            Arc::new(SystemClock),
            Arc::new(InProcessMetricsCollector::default()),
        ))
    }

    async fn await_condition<F: Fn() -> bool>(condition: F, timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_group_drains_and_invalidates_on_success() {
        let placer = Arc::new(ScriptedPlacer::default());
        let groups = test_groups(placer.clone(), Arc::new(NoopPreemptor::default()));

        groups.task_pending(&test_task("t-1", "api"), 0);
        groups.task_pending(&test_task("t-2", "api"), 0);
        assert_eq!(groups.group_count(), 1);

        assert!(
            await_condition(|| groups.group_count() == 0, 2_000).await,
            "group should drain and drop itself"
        );
        assert_eq!(placer.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_same_fingerprint_shares_a_group() {
        let placer = Arc::new(ScriptedPlacer {
            succeed_after: usize::MAX,
            ..Default::default()
        });
        let groups = test_groups(placer, Arc::new(NoopPreemptor::default()));

        groups.task_pending(&test_task("t-1", "api"), 1_000);
        groups.task_pending(&test_task("t-2", "api"), 1_000);
        groups.task_pending(&test_task("t-3", "cache"), 1_000);

        assert_eq!(groups.group_count(), 2);
        assert_eq!(groups.pending_tasks(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_ignored() {
        let placer = Arc::new(ScriptedPlacer {
            succeed_after: usize::MAX,
            ..Default::default()
        });
        let groups = test_groups(placer, Arc::new(NoopPreemptor::default()));

        let task = test_task("t-1", "api");
        groups.task_pending(&task, 1_000);
        groups.task_pending(&task, 1_000);
        assert_eq!(groups.pending_tasks(), 1);
    }

    #[tokio::test]
    async fn test_failure_backs_off_and_consults_preemptor() {
        let placer = Arc::new(ScriptedPlacer {
            succeed_after: 2,
            ..Default::default()
        });
        let preemptor = Arc::new(NoopPreemptor::default());
        let groups = test_groups(placer.clone(), preemptor.clone());

        groups.task_pending(&test_task("t-1", "api"), 0);

        assert!(
            await_condition(|| groups.group_count() == 0, 2_000).await,
            "task should eventually place after failed attempts"
        );
        assert_eq!(placer.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(preemptor.asked.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_deleted_tasks_leave_their_queue() {
        let placer = Arc::new(ScriptedPlacer {
            succeed_after: usize::MAX,
            ..Default::default()
        });
        let groups = test_groups(placer, Arc::new(NoopPreemptor::default()));

        groups.task_pending(&test_task("t-1", "api"), 5_000);
        groups.task_pending(&test_task("t-2", "api"), 5_000);
        groups.tasks_deleted(&["t-1".to_owned()]);
        assert_eq!(groups.pending_tasks(), 1);
    }

    #[tokio::test]
    async fn test_backoff_doubles_and_caps() {
        let backoff = TruncatedBinaryBackoff::new(10, 100);
        let mut penalty = backoff.initial_ms();
        penalty = backoff.next_ms(penalty);
        assert!(penalty >= 20 && penalty <= 23, "got {penalty}");

        for _ in 0..10 {
            penalty = backoff.next_ms(penalty);
        }
        assert_eq!(penalty, 100);
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_permits() {
        let limiter = RateLimiter::new(100.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        // 5 permits at 100qps: at least ~40ms after the first free permit.
        assert!(start.elapsed() >= Duration::from_millis(35));
    }
}
