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

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use borealis_core::clock::SystemClock;
use borealis_core::error::Result;
use borealis_core::model::{
    AssignedTask, HostOffer, Identity, JobConfiguration, JobKey, ResourceAggregate,
    ResourceRequest, TaskConfig, TaskState,
};

use crate::config::SchedulerConfig;
use crate::metrics::InProcessMetricsCollector;
use crate::scheduler_server::{AllowAllValidator, SchedulerServer};
use crate::state::task_manager::TaskLauncher;
use crate::storage::log::MemoryLogStore;

/// Launcher that records launches and kills instead of talking to a cluster
/// manager.
#[derive(Default)]
pub struct RecordingLauncher {
    launched: Mutex<Vec<String>>,
    killed: Mutex<Vec<String>>,
}

impl RecordingLauncher {
    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().clone()
    }
}

#[async_trait]
impl TaskLauncher for RecordingLauncher {
    async fn launch_task(&self, _offer: &HostOffer, task: &AssignedTask) -> Result<()> {
        self.launched.lock().push(task.task_id.clone());
        Ok(())
    }

    async fn kill_task(&self, task_id: &str) -> Result<()> {
        self.killed.lock().push(task_id.to_owned());
        Ok(())
    }
}

/// An initialized scheduler wired for tests: in-memory log, recording
/// launcher, fast backoffs.
pub struct SchedulerTest {
    pub server: SchedulerServer,
    pub launcher: Arc<RecordingLauncher>,
    pub metrics: Arc<InProcessMetricsCollector>,
    pub log: Arc<MemoryLogStore>,
}

impl SchedulerTest {
    pub async fn new() -> Result<Self> {
        Self::with_config(test_scheduler_config()).await
    }

    pub async fn with_config(config: SchedulerConfig) -> Result<Self> {
        let log = Arc::new(MemoryLogStore::default());
        Self::with_log_store(config, log).await
    }

    pub async fn with_log_store(
        config: SchedulerConfig,
        log: Arc<MemoryLogStore>,
    ) -> Result<Self> {
        let launcher = Arc::new(RecordingLauncher::default());
        let metrics = Arc::new(InProcessMetricsCollector::default());
        let mut server = SchedulerServer::new(
            "localhost:8081".to_owned(),
            log.clone(),
            launcher.clone(),
            Arc::new(SystemClock),
            metrics.clone(),
            Arc::new(AllowAllValidator),
            config,
        );
        server.init().await?;
        Ok(Self {
            server,
            launcher,
            metrics,
            log,
        })
    }

    /// Poll until the task reaches `expected`, or fail after `timeout_ms`.
    pub async fn await_task_state(
        &self,
        task_id: &str,
        expected: TaskState,
        timeout_ms: u64,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let current = self
                .server
                .state
                .storage
                .read(|stores| stores.fetch_task(task_id).map(|t| t.status));
            if current == Some(expected) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until some task of the job reaches `expected`, returning its id.
    pub async fn await_job_task_in(
        &self,
        key: &JobKey,
        expected: TaskState,
        timeout_ms: u64,
    ) -> Option<String> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let found = self.server.state.storage.read(|stores| {
                stores
                    .tasks
                    .values()
                    .find(|t| t.job_key() == key && t.status == expected)
                    .map(|t| t.task_id().to_owned())
            });
            if found.is_some() {
                return found;
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

pub fn test_scheduler_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_scheduler_host("test-scheduler")
        .with_penalty_ms(5, 100)
        .with_rate_limit_qps(1_000.0)
        .with_kill_task_backoff(5, 20)
        .with_kill_task_max_wait_ms(1_000)
        .with_max_startup_reschedule_delay_ms(1)
}

pub fn test_task_config(job_name: &str, is_service: bool) -> TaskConfig {
    TaskConfig {
        job: JobKey::new("r1", "prod", job_name),
        owner: Identity::new("ops"),
        is_service,
        priority: 0,
        production: false,
        max_task_failures: -1,
        resources: ResourceRequest::new(1.0, 100, 10),
        command: "run-server".to_owned(),
        constraints: vec![],
        metadata: BTreeMap::new(),
    }
}

pub fn test_job(job_name: &str, instance_count: u32, is_service: bool) -> JobConfiguration {
    JobConfiguration {
        key: JobKey::new("r1", "prod", job_name),
        owner: Identity::new("ops"),
        cron_schedule: None,
        instance_count,
        task_config: test_task_config(job_name, is_service),
    }
}

pub fn test_offer(offer_id: &str, host: &str) -> HostOffer {
    HostOffer {
        offer_id: offer_id.to_owned(),
        slave_id: format!("slave-{host}"),
        host: host.to_owned(),
        resources: ResourceAggregate::new(4.0, 4096, 40_960),
        port_ranges: vec![(31000, 31100)],
    }
}

pub fn operator() -> Identity {
    Identity::new("operator")
}
