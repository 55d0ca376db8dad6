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

//! Borealis scheduler binary.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use log::info;

use borealis_core::clock::SystemClock;
use borealis_core::error::Result;
use borealis_core::model::{AssignedTask, HostOffer};
use borealis_core::BOREALIS_VERSION;
use borealis_scheduler::config::SchedulerConfig;
use borealis_scheduler::metrics::InProcessMetricsCollector;
use borealis_scheduler::scheduler_server::{AllowAllValidator, SchedulerServer};
use borealis_scheduler::state::task_manager::TaskLauncher;
use borealis_scheduler::storage::log::FileLogStore;

#[derive(Debug, Parser)]
#[clap(name = "borealis-scheduler", version = BOREALIS_VERSION)]
struct Opt {
    /// Hostname recorded on task audit events.
    #[clap(long, env = "BOREALIS_SCHEDULER_HOST", default_value = "localhost")]
    scheduler_host: String,

    /// Directory holding the mutation log and snapshots.
    #[clap(long, default_value = "/var/lib/borealis/dlog")]
    dlog_dir: PathBuf,

    /// Interval between automatic log snapshots, in milliseconds.
    #[clap(long, default_value_t = 300_000)]
    dlog_snapshot_interval: u64,

    /// Maximum size of a single log entry, in bytes.
    #[clap(long, default_value_t = 524_288)]
    dlog_max_entry_size: usize,

    /// First delay of the kill-confirmation wait loop, in milliseconds.
    #[clap(long, default_value_t = 1_000)]
    kill_task_initial_backoff: u64,

    /// Cap on a single kill-confirmation wait, in milliseconds.
    #[clap(long, default_value_t = 30_000)]
    kill_task_max_backoff: u64,

    /// Global cap on placement attempts per second.
    #[clap(long, default_value_t = 40.0)]
    scheduling_rate_limit: f64,

    /// Directory holding exported backups.
    #[clap(long, default_value = "/var/lib/borealis/backups")]
    backup_dir: PathBuf,
}

/// Stand-in launcher until a cluster-manager driver is attached; every
/// launch and kill is only logged.
struct LoggingLauncher;

#[async_trait]
impl TaskLauncher for LoggingLauncher {
    async fn launch_task(&self, offer: &HostOffer, task: &AssignedTask) -> Result<()> {
        info!(
            "Would launch task {} on host {} via offer {}",
            task.task_id, offer.host, offer.offer_id
        );
        Ok(())
    }

    async fn kill_task(&self, task_id: &str) -> Result<()> {
        info!("Would kill task {task_id}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let opt = Opt::parse();
    let config = SchedulerConfig::default()
        .with_scheduler_host(opt.scheduler_host.clone())
        .with_snapshot_interval_ms(opt.dlog_snapshot_interval)
        .with_kill_task_backoff(opt.kill_task_initial_backoff, opt.kill_task_max_backoff)
        .with_rate_limit_qps(opt.scheduling_rate_limit)
        .with_backup_dir(opt.backup_dir.clone());

    let shutdown_grace_ms = config.dlog_shutdown_grace_period_ms;
    let log = Arc::new(FileLogStore::try_new(&opt.dlog_dir, opt.dlog_max_entry_size)?);
    let mut server = SchedulerServer::new(
        format!("{}:borealis", opt.scheduler_host),
        log,
        Arc::new(LoggingLauncher),
        Arc::new(SystemClock),
        Arc::new(InProcessMetricsCollector::default()),
        Arc::new(AllowAllValidator),
        config,
    );

    server.init().await?;
    info!(
        "Borealis scheduler {} is ready with {} pending tasks",
        server.scheduler_name,
        server.pending_tasks()
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(borealis_core::error::BorealisError::from)?;

    // Flush a final snapshot within the shutdown grace period.
    let grace = std::time::Duration::from_millis(shutdown_grace_ms);
    let root = borealis_core::model::Identity::new("root");
    match tokio::time::timeout(grace, server.snapshot(&root)).await {
        Ok(Ok(())) => info!("Final snapshot written, shutting down"),
        Ok(Err(e)) => info!("Final snapshot failed: {e}"),
        Err(_) => info!("Final snapshot did not complete within the grace period"),
    }
    Ok(())
}
