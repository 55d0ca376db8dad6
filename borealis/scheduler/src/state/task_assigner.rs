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

//! The placement action: match one PENDING task against the offer pool,
//! assign ports, transition it to ASSIGNED and emit the launch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};

use borealis_core::error::Result;
use borealis_core::model::{
    ConstraintPredicate, HostAttributes, HostOffer, JobKey, MaintenanceMode,
    ScheduledTask, TaskConfig, TaskState,
};

use crate::state::task_groups::TaskPlacer;
use crate::state::task_manager::{TaskLauncher, TaskManager, TxnSideEffects};
use crate::storage::TransactionalStorage;

/// The cluster facts a placement or preemption decision is made against:
/// attributes and maintenance mode per host, plus where each job's active
/// tasks currently sit.
pub(crate) struct PlacementView {
    pub attributes: HashMap<String, HostAttributes>,
    pub active_tasks: Vec<(JobKey, String)>,
}

impl PlacementView {
    pub fn capture(storage: &TransactionalStorage) -> Self {
        storage.read(|stores| PlacementView {
            attributes: stores.host_attributes.clone(),
            active_tasks: stores
                .tasks
                .values()
                .filter(|task| task.status.is_active())
                .filter_map(|task| {
                    task.assigned
                        .slave_host
                        .as_ref()
                        .map(|host| (task.job_key().clone(), host.clone()))
                })
                .collect(),
        })
    }

    fn mode(&self, host: &str) -> MaintenanceMode {
        self.attributes
            .get(host)
            .map(|attrs| attrs.mode)
            .unwrap_or(MaintenanceMode::None)
    }

    /// Whether `host` satisfies every constraint of `config`.
    pub fn satisfies_constraints(&self, host: &str, config: &TaskConfig) -> bool {
        let attrs = self.attributes.get(host);
        for constraint in &config.constraints {
            let attribute =
                attrs.and_then(|attrs| attrs.attribute(&constraint.name));
            match &constraint.predicate {
                ConstraintPredicate::Equal(value) => {
                    if !attribute.map(|a| a.values.contains(value)).unwrap_or(false) {
                        return false;
                    }
                }
                ConstraintPredicate::ValueSet(values) => {
                    let matched = attribute
                        .map(|a| a.values.iter().any(|v| values.contains(v)))
                        .unwrap_or(false);
                    if !matched {
                        return false;
                    }
                }
                ConstraintPredicate::Limit(max_per_value) => {
                    // Count this job's active tasks on hosts sharing any of
                    // the attribute's values here. An absent attribute
                    // cannot be verified, so it vetoes the host.
                    let Some(attribute) = attribute else {
                        return false;
                    };
                    let colocated = self
                        .active_tasks
                        .iter()
                        .filter(|(job, task_host)| {
                            job == &config.job
                                && self
                                    .attributes
                                    .get(task_host)
                                    .and_then(|a| a.attribute(&constraint.name))
                                    .map(|a| {
                                        a.values
                                            .iter()
                                            .any(|v| attribute.values.contains(v))
                                    })
                                    .unwrap_or(false)
                        })
                        .count();
                    if colocated >= *max_per_value as usize {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// First-fit, offer-driven placement.
pub struct TaskAssigner {
    storage: Arc<TransactionalStorage>,
    offers: Arc<crate::state::offer_manager::OfferManager>,
    task_manager: Arc<TaskManager>,
    launcher: Arc<dyn TaskLauncher>,
}

impl TaskAssigner {
    pub fn new(
        storage: Arc<TransactionalStorage>,
        offers: Arc<crate::state::offer_manager::OfferManager>,
        task_manager: Arc<TaskManager>,
        launcher: Arc<dyn TaskLauncher>,
    ) -> Self {
        Self {
            storage,
            offers,
            task_manager,
            launcher,
        }
    }

    fn offer_fits(
        view: &PlacementView,
        offer: &HostOffer,
        task: &ScheduledTask,
    ) -> bool {
        if matches!(
            view.mode(&offer.host),
            MaintenanceMode::Draining | MaintenanceMode::Drained
        ) {
            return false;
        }
        let request = &task.config().resources;
        if !offer.resources.can_fit(request) {
            return false;
        }
        if offer.available_ports().count() < request.requested_ports.len() {
            return false;
        }
        view.satisfies_constraints(&offer.host, task.config())
    }

    fn assign_ports(
        offer: &HostOffer,
        requested: &[String],
    ) -> Option<BTreeMap<String, u16>> {
        let mut available = offer.available_ports();
        let mut assigned = BTreeMap::new();
        for name in requested {
            assigned.insert(name.clone(), available.next()?);
        }
        Some(assigned)
    }
}

#[async_trait]
impl TaskPlacer for TaskAssigner {
    async fn try_place(&self, task_id: &str) -> Result<bool> {
        let Some(task) =
            self.storage.read(|stores| stores.fetch_task(task_id).cloned())
        else {
            // Deleted while queued; report success so the group drops it.
            debug!("Task {task_id} no longer exists, dropping from its group");
            return Ok(true);
        };
        if task.status != TaskState::Pending {
            debug!(
                "Task {task_id} is {}, not PENDING, dropping from its group",
                task.status
            );
            return Ok(true);
        }

        let view = PlacementView::capture(&self.storage);
        let Some(matched) = self
            .offers
            .snapshot()
            .into_iter()
            .find(|offer| Self::offer_fits(&view, offer, &task))
        else {
            return Ok(false);
        };

        // Reserve the offer; a concurrent placement may have taken it.
        let Some(offer) = self.offers.take(&matched.offer_id) else {
            return Ok(false);
        };
        let Some(ports) =
            Self::assign_ports(&offer, &task.config().resources.requested_ports)
        else {
            self.offers.return_offer(offer);
            return Ok(false);
        };

        let slave_id = offer.slave_id.clone();
        let slave_host = offer.host.clone();
        let assigned_ports = ports.clone();
        let mutation = move |assigned: &mut borealis_core::model::AssignedTask| {
            assigned.slave_id = Some(slave_id.clone());
            assigned.slave_host = Some(slave_host.clone());
            assigned.assigned_ports = assigned_ports.clone();
        };

        let mut effects = TxnSideEffects::default();
        let transitioned = self
            .storage
            .write(|txn| {
                self.task_manager.apply_transition(
                    txn,
                    task_id,
                    TaskState::Assigned,
                    Some(format!("Assigned to host {}", offer.host)),
                    Some(&mutation),
                    &mut effects,
                )
            })
            .await;

        match transitioned {
            Ok(true) => {
                self.task_manager.finish(effects).await;
                info!(
                    "Assigned task {task_id} to host {} with ports {:?}",
                    offer.host, ports
                );
                if let Some(launched) = self
                    .storage
                    .read(|stores| stores.fetch_task(task_id).cloned())
                {
                    if let Err(e) =
                        self.launcher.launch_task(&offer, &launched.assigned).await
                    {
                        warn!("Launch of task {task_id} on {} failed: {e}", offer.host);
                    }
                }
                Ok(true)
            }
            Ok(false) => {
                // Raced into a non-PENDING state; the task left the loop.
                self.offers.return_offer(offer);
                Ok(true)
            }
            Err(e) => {
                self.offers.return_offer(offer);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use borealis_core::clock::SystemClock;
    use borealis_core::error::Result;
    use borealis_core::model::{
        AssignedTask, Attribute, Constraint, Identity, ResourceAggregate,
        ResourceRequest, TaskEvent,
    };

    use crate::config::SchedulerConfig;
    use crate::metrics::InProcessMetricsCollector;
    use crate::state::offer_manager::OfferManager;
    use crate::storage::log::MemoryLogStore;
    use crate::test_utils::RecordingLauncher;

    use super::*;

    struct Fixture {
        storage: Arc<TransactionalStorage>,
        offers: Arc<OfferManager>,
        assigner: TaskAssigner,
        launcher: Arc<RecordingLauncher>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(TransactionalStorage::new(
            Arc::new(MemoryLogStore::default()),
            Arc::new(SystemClock),
            Arc::new(InProcessMetricsCollector::default()),
        ));
        let launcher = Arc::new(RecordingLauncher::default());
        let task_manager = Arc::new(TaskManager::new(
            storage.clone(),
            launcher.clone(),
            Arc::new(SystemClock),
            Arc::new(InProcessMetricsCollector::default()),
            SchedulerConfig::default(),
        ));
        let offers = Arc::new(OfferManager::default());
        let assigner = TaskAssigner::new(
            storage.clone(),
            offers.clone(),
            task_manager,
            launcher.clone(),
        );
        Fixture {
            storage,
            offers,
            assigner,
            launcher,
        }
    }

    fn pending_task(task_id: &str, constraints: Vec<Constraint>) -> ScheduledTask {
        let config = TaskConfig {
            job: JobKey::new("web", "prod", "api"),
            owner: Identity::new("ops"),
            is_service: false,
            priority: 0,
            production: false,
            max_task_failures: 1,
            resources: ResourceRequest::new(1.0, 100, 10)
                .with_ports(vec!["http".to_owned()]),
            command: "run".to_owned(),
            constraints,
            metadata: BTreeMap::new(),
        };
        ScheduledTask {
            assigned: AssignedTask::new(task_id, 0, config),
            status: TaskState::Pending,
            failure_count: 0,
            ancestor_id: None,
            task_events: vec![TaskEvent {
                timestamp_ms: 0,
                status: TaskState::Pending,
                message: None,
                scheduler_host: None,
            }],
        }
    }

    fn big_offer(offer_id: &str, host: &str) -> HostOffer {
        HostOffer {
            offer_id: offer_id.to_owned(),
            slave_id: format!("slave-{host}"),
            host: host.to_owned(),
            resources: ResourceAggregate::new(4.0, 4096, 40_960),
            port_ranges: vec![(31000, 31010)],
        }
    }

    async fn save_task(storage: &TransactionalStorage, task: ScheduledTask) {
        storage
            .write(|txn| {
                txn.save_tasks(vec![task]);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_place_assigns_host_and_ports() -> Result<()> {
        let f = fixture();
        save_task(&f.storage, pending_task("t-1", vec![])).await;
        f.offers.add_offer(big_offer("o-1", "hostA"));

        assert!(f.assigner.try_place("t-1").await?);

        f.storage.read(|stores| {
            let task = stores.fetch_task("t-1").unwrap();
            assert_eq!(task.status, TaskState::Assigned);
            assert_eq!(task.assigned.slave_host.as_deref(), Some("hostA"));
            assert_eq!(task.assigned.assigned_ports.get("http"), Some(&31000));
        });
        assert_eq!(f.offers.offer_count(), 0);
        assert_eq!(f.launcher.launched(), vec!["t-1".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_offer_is_a_scheduling_failure() -> Result<()> {
        let f = fixture();
        save_task(&f.storage, pending_task("t-1", vec![])).await;

        assert!(!f.assigner.try_place("t-1").await?);
        f.storage.read(|stores| {
            assert_eq!(stores.fetch_task("t-1").unwrap().status, TaskState::Pending);
        });
        Ok(())
    }

    #[tokio::test]
    async fn test_too_small_offer_is_skipped() -> Result<()> {
        let f = fixture();
        save_task(&f.storage, pending_task("t-1", vec![])).await;
        f.offers.add_offer(HostOffer {
            resources: ResourceAggregate::new(0.5, 50, 5),
            ..big_offer("o-1", "hostA")
        });

        assert!(!f.assigner.try_place("t-1").await?);
        assert_eq!(f.offers.offer_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_draining_host_is_skipped() -> Result<()> {
        let f = fixture();
        save_task(&f.storage, pending_task("t-1", vec![])).await;
        f.storage
            .write(|txn| {
                let mut attrs = HostAttributes::new("hostA");
                attrs.mode = MaintenanceMode::Draining;
                txn.save_host_attributes(attrs);
                Ok(())
            })
            .await?;
        f.offers.add_offer(big_offer("o-1", "hostA"));
        f.offers.add_offer(big_offer("o-2", "hostB"));

        assert!(f.assigner.try_place("t-1").await?);
        f.storage.read(|stores| {
            assert_eq!(
                stores.fetch_task("t-1").unwrap().assigned.slave_host.as_deref(),
                Some("hostB")
            );
        });
        Ok(())
    }

    #[tokio::test]
    async fn test_equal_constraint_filters_hosts() -> Result<()> {
        let f = fixture();
        save_task(
            &f.storage,
            pending_task("t-1", vec![Constraint::equal("rack", "r2")]),
        )
        .await;
        f.storage
            .write(|txn| {
                let mut host_a = HostAttributes::new("hostA");
                host_a.attributes =
                    vec![Attribute::new("rack", ["r1".to_owned()])];
                txn.save_host_attributes(host_a);
                let mut host_b = HostAttributes::new("hostB");
                host_b.attributes =
                    vec![Attribute::new("rack", ["r2".to_owned()])];
                txn.save_host_attributes(host_b);
                Ok(())
            })
            .await?;
        f.offers.add_offer(big_offer("o-1", "hostA"));
        f.offers.add_offer(big_offer("o-2", "hostB"));

        assert!(f.assigner.try_place("t-1").await?);
        f.storage.read(|stores| {
            assert_eq!(
                stores.fetch_task("t-1").unwrap().assigned.slave_host.as_deref(),
                Some("hostB")
            );
        });
        Ok(())
    }

    #[tokio::test]
    async fn test_limit_constraint_spreads_instances() -> Result<()> {
        let f = fixture();

        // An active instance of the same job already sits on hostA.
        let mut running = pending_task("t-0", vec![]);
        running.status = TaskState::Running;
        running.assigned.slave_host = Some("hostA".to_owned());
        save_task(&f.storage, running).await;

        save_task(
            &f.storage,
            pending_task("t-1", vec![Constraint::limit("host", 1)]),
        )
        .await;
        f.storage
            .write(|txn| {
                for host in ["hostA", "hostB"] {
                    let mut attrs = HostAttributes::new(host);
                    attrs.attributes =
                        vec![Attribute::new("host", [host.to_owned()])];
                    txn.save_host_attributes(attrs);
                }
                Ok(())
            })
            .await?;
        f.offers.add_offer(big_offer("o-1", "hostA"));
        f.offers.add_offer(big_offer("o-2", "hostB"));

        assert!(f.assigner.try_place("t-1").await?);
        f.storage.read(|stores| {
            assert_eq!(
                stores.fetch_task("t-1").unwrap().assigned.slave_host.as_deref(),
                Some("hostB")
            );
        });
        Ok(())
    }

    #[tokio::test]
    async fn test_non_pending_task_drops_from_queue() -> Result<()> {
        let f = fixture();
        let mut task = pending_task("t-1", vec![]);
        task.status = TaskState::Killing;
        save_task(&f.storage, task).await;
        f.offers.add_offer(big_offer("o-1", "hostA"));

        // Reported as placed so the group stops retrying, but untouched.
        assert!(f.assigner.try_place("t-1").await?);
        assert_eq!(f.offers.offer_count(), 1);
        assert!(f.launcher.launched().is_empty());
        Ok(())
    }
}
