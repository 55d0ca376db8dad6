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

//! Per-role quota admission: production workloads of a role may not consume
//! more than the role's granted resource aggregate.

use std::sync::Arc;

use log::info;

use borealis_core::error::{BorealisError, Result};
use borealis_core::model::{QuotaInfo, ResourceAggregate, TaskConfig};

use crate::storage::stores::Stores;
use crate::storage::TransactionalStorage;

pub struct QuotaManager {
    storage: Arc<TransactionalStorage>,
}

impl QuotaManager {
    pub fn new(storage: Arc<TransactionalStorage>) -> Self {
        Self { storage }
    }

    pub async fn set_quota(&self, role: &str, quota: ResourceAggregate) -> Result<()> {
        let role = role.to_owned();
        info!(
            "Setting quota for role {role}: {} cpus, {} MB ram, {} MB disk",
            quota.num_cpus, quota.ram_mb, quota.disk_mb
        );
        self.storage
            .write(move |txn| {
                txn.save_quota(role, quota);
                Ok(())
            })
            .await
    }

    pub fn get_quota(&self, role: &str) -> QuotaInfo {
        self.storage.read(|stores| QuotaInfo {
            quota: stores.fetch_quota(role).unwrap_or_default(),
            prod_consumption: stores.prod_consumption(role),
        })
    }

    /// Admission check for creating `instance_count` new tasks of `config`,
    /// evaluated against the transaction's own view so creation and check
    /// are atomic. Non-production tasks are exempt from quota.
    pub fn check_admission(
        stores: &Stores,
        config: &TaskConfig,
        instance_count: u32,
    ) -> Result<()> {
        if !config.production {
            return Ok(());
        }

        let role = &config.job.role;
        let quota = stores.fetch_quota(role).unwrap_or_default();
        let mut proposed = stores.prod_consumption(role);
        let addition =
            ResourceAggregate::from(&config.resources).scale(instance_count);
        proposed.num_cpus += addition.num_cpus;
        proposed.ram_mb += addition.ram_mb;
        proposed.disk_mb += addition.disk_mb;

        if quota.at_least(&proposed) {
            Ok(())
        } else {
            Err(BorealisError::ScheduleError(format!(
                "Quota exceeded for role {role}: requested {:.1} cpus/{} MB ram/{} MB disk \
                 against a quota of {:.1} cpus/{} MB ram/{} MB disk",
                proposed.num_cpus,
                proposed.ram_mb,
                proposed.disk_mb,
                quota.num_cpus,
                quota.ram_mb,
                quota.disk_mb
            )))
        }
    }
}
