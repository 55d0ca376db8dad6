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

//! Named advisory locks keyed by job. Mutating operations that declared a
//! lock pass the caller's held token through `validate_if_locked` before
//! proceeding.

use std::sync::Arc;

use log::info;
use uuid::Uuid;

use borealis_core::clock::Clock;
use borealis_core::error::{BorealisError, Result};
use borealis_core::model::{Identity, Lock, LockKey};

use crate::storage::stores::Stores;
use crate::storage::TransactionalStorage;

pub struct LockManager {
    storage: Arc<TransactionalStorage>,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(storage: Arc<TransactionalStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Create a lock for `key`, failing if one already exists.
    pub async fn acquire_lock(
        &self,
        key: LockKey,
        user: Identity,
        message: Option<String>,
    ) -> Result<Lock> {
        let lock = Lock {
            key: key.clone(),
            token: Uuid::new_v4().to_string(),
            user,
            timestamp_ms: self.clock.now_millis(),
            message,
        };
        let created = lock.clone();

        self.storage
            .write(move |txn| {
                if let Some(existing) = txn.fetch_lock(&key) {
                    return Err(BorealisError::LockError(format!(
                        "Lock on {key} is already held by {}",
                        existing.user.user
                    )));
                }
                txn.save_lock(lock);
                Ok(())
            })
            .await?;

        info!("Acquired lock on {} for {}", created.key, created.user.user);
        Ok(created)
    }

    /// Remove the lock iff the presented token matches.
    pub async fn release_lock(&self, held: &Lock) -> Result<()> {
        let key = held.key.clone();
        let token = held.token.clone();
        self.storage
            .write(move |txn| {
                validate_held_token(txn.fetch_lock(&key), &key, Some(&token))?;
                txn.remove_lock(key);
                Ok(())
            })
            .await
    }

    /// Fail when a lock exists for `key` and the supplied token does not
    /// match. No lock means no restriction.
    pub fn validate_if_locked(&self, key: &LockKey, held_token: Option<&str>) -> Result<()> {
        self.storage
            .read(|stores| validate_held_token(stores.fetch_lock(key), key, held_token))
    }

    /// Transaction-scoped variant, for mutations that validate and mutate
    /// atomically.
    pub fn validate_in_txn(
        stores: &Stores,
        key: &LockKey,
        held_token: Option<&str>,
    ) -> Result<()> {
        validate_held_token(stores.fetch_lock(key), key, held_token)
    }
}

fn validate_held_token(
    existing: Option<&Lock>,
    key: &LockKey,
    held_token: Option<&str>,
) -> Result<()> {
    match (existing, held_token) {
        (None, _) => Ok(()),
        (Some(existing), Some(token)) if existing.token == token => Ok(()),
        (Some(existing), Some(_)) => Err(BorealisError::LockError(format!(
            "Presented token does not match the lock on {key} held by {}",
            existing.user.user
        ))),
        (Some(existing), None) => Err(BorealisError::LockError(format!(
            "{key} is locked by {} and no token was presented",
            existing.user.user
        ))),
    }
}

#[cfg(test)]
mod test {
    use borealis_core::clock::SystemClock;
    use borealis_core::model::JobKey;

    use crate::metrics::InProcessMetricsCollector;
    use crate::storage::log::MemoryLogStore;

    use super::*;

    fn manager() -> LockManager {
        let storage = Arc::new(TransactionalStorage::new(
            Arc::new(MemoryLogStore::default()),
            Arc::new(SystemClock),
            Arc::new(InProcessMetricsCollector::default()),
        ));
        LockManager::new(storage, Arc::new(SystemClock))
    }

    fn job_key() -> LockKey {
        LockKey::Job(JobKey::new("web", "prod", "api"))
    }

    #[tokio::test]
    async fn test_acquire_release_acquire() -> Result<()> {
        let manager = manager();

        let lock = manager
            .acquire_lock(job_key(), Identity::new("alice"), None)
            .await?;
        manager.release_lock(&lock).await?;
        manager
            .acquire_lock(job_key(), Identity::new("bob"), None)
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_double_acquire_fails() -> Result<()> {
        let manager = manager();

        manager
            .acquire_lock(job_key(), Identity::new("alice"), None)
            .await?;
        let second = manager
            .acquire_lock(job_key(), Identity::new("bob"), None)
            .await;
        assert!(matches!(second, Err(BorealisError::LockError(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_validate_if_locked() -> Result<()> {
        let manager = manager();

        // No lock: always succeeds, token or not.
        manager.validate_if_locked(&job_key(), None)?;
        manager.validate_if_locked(&job_key(), Some("stale"))?;

        let lock = manager
            .acquire_lock(job_key(), Identity::new("alice"), None)
            .await?;

        manager.validate_if_locked(&job_key(), Some(&lock.token))?;
        assert!(matches!(
            manager.validate_if_locked(&job_key(), None),
            Err(BorealisError::LockError(_))
        ));
        assert!(matches!(
            manager.validate_if_locked(&job_key(), Some("wrong")),
            Err(BorealisError::LockError(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_release_with_stale_token_fails() -> Result<()> {
        let manager = manager();

        let lock = manager
            .acquire_lock(job_key(), Identity::new("alice"), None)
            .await?;
        let mut stale = lock.clone();
        stale.token = "stale".to_owned();

        assert!(matches!(
            manager.release_lock(&stale).await,
            Err(BorealisError::LockError(_))
        ));
        // The real token still works.
        manager.release_lock(&lock).await?;
        Ok(())
    }
}
