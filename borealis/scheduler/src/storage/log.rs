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

//! Log store backends. The replicated transport itself is an external
//! collaborator; everything in the scheduler reaches it through [`LogStore`].

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use log::{info, warn};
use parking_lot::Mutex;

use borealis_core::error::{BorealisError, Result};

use crate::storage::stores::{Op, Snapshot};

/// Everything a restore yields: the latest snapshot (if any) and the op
/// batches appended after it, in commit order.
#[derive(Debug, Default)]
pub struct LogContents {
    pub snapshot: Option<Snapshot>,
    pub batches: Vec<Vec<Op>>,
}

/// Append-only mutation log with snapshot compaction.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Append one committed op batch as a single record.
    async fn append_ops(&self, ops: &[Op]) -> Result<()>;

    /// Write a full snapshot record and truncate all prior records.
    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Read back the latest snapshot and every record appended after it.
    async fn restore(&self) -> Result<LogContents>;
}

fn encode_batch(ops: &[Op], max_entry_size: usize) -> Result<Vec<u8>> {
    let encoded = serde_json::to_vec(ops)
        .map_err(|e| BorealisError::StorageError(format!("Could not encode log record: {e}")))?;
    if encoded.len() > max_entry_size {
        return Err(BorealisError::StorageError(format!(
            "Log record of {} bytes exceeds the maximum entry size of {} bytes",
            encoded.len(),
            max_entry_size
        )));
    }
    Ok(encoded)
}

/// In-memory log, used by tests and by deployments that delegate durability
/// entirely to an external replicated log.
pub struct MemoryLogStore {
    max_entry_size: usize,
    inner: Mutex<LogContentsCell>,
}

#[derive(Default)]
struct LogContentsCell {
    snapshot: Option<Snapshot>,
    batches: Vec<Vec<Op>>,
}

impl MemoryLogStore {
    pub fn new(max_entry_size: usize) -> Self {
        Self {
            max_entry_size,
            inner: Mutex::new(LogContentsCell::default()),
        }
    }

    pub fn record_count(&self) -> usize {
        self.inner.lock().batches.len()
    }

    pub fn has_snapshot(&self) -> bool {
        self.inner.lock().snapshot.is_some()
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new(512 * 1024)
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append_ops(&self, ops: &[Op]) -> Result<()> {
        encode_batch(ops, self.max_entry_size)?;
        self.inner.lock().batches.push(ops.to_vec());
        Ok(())
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.snapshot = Some(snapshot.clone());
        inner.batches.clear();
        Ok(())
    }

    async fn restore(&self) -> Result<LogContents> {
        let inner = self.inner.lock();
        Ok(LogContents {
            snapshot: inner.snapshot.clone(),
            batches: inner.batches.clone(),
        })
    }
}

/// File-backed log: a JSON-lines mutation log plus a snapshot file in one
/// directory. Writers are already serialized by the storage facade, so plain
/// appends are safe.
pub struct FileLogStore {
    log_path: PathBuf,
    snapshot_path: PathBuf,
    max_entry_size: usize,
    io_lock: Mutex<()>,
}

impl FileLogStore {
    pub fn try_new(dir: impl Into<PathBuf>, max_entry_size: usize) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        info!("Opening file log store in {}", dir.display());
        Ok(Self {
            log_path: dir.join("mutations.log"),
            snapshot_path: dir.join("snapshot.json"),
            max_entry_size,
            io_lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn append_ops(&self, ops: &[Op]) -> Result<()> {
        let encoded = encode_batch(ops, self.max_entry_size)?;

        let _guard = self.io_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        file.write_all(&encoded)?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        Ok(())
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let encoded = serde_json::to_vec(snapshot).map_err(|e| {
            BorealisError::StorageError(format!("Could not encode snapshot: {e}"))
        })?;

        let _guard = self.io_lock.lock();
        let staged = self.snapshot_path.with_extension("staged");
        std::fs::write(&staged, &encoded)?;
        std::fs::rename(&staged, &self.snapshot_path)?;
        // Records preceding the snapshot are superseded.
        File::create(&self.log_path)?.sync_data()?;
        Ok(())
    }

    async fn restore(&self) -> Result<LogContents> {
        let _guard = self.io_lock.lock();

        let snapshot = match std::fs::read(&self.snapshot_path) {
            Ok(bytes) => Some(serde_json::from_slice(&bytes).map_err(|e| {
                BorealisError::StorageError(format!("Corrupt snapshot record: {e}"))
            })?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let mut batches = vec![];
        match File::open(&self.log_path) {
            Ok(file) => {
                for (line_number, line) in BufReader::new(file).lines().enumerate() {
                    let line = line?;
                    if line.is_empty() {
                        continue;
                    }
                    let ops: Vec<Op> = serde_json::from_str(&line).map_err(|e| {
                        BorealisError::StorageError(format!(
                            "Corrupt log record at line {}: {e}",
                            line_number + 1
                        ))
                    })?;
                    batches.push(ops);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("No mutation log found at {}", self.log_path.display());
            }
            Err(e) => return Err(e.into()),
        }

        Ok(LogContents { snapshot, batches })
    }
}

#[cfg(test)]
mod test {
    use borealis_core::model::ResourceAggregate;

    use crate::storage::stores::Stores;

    use super::*;

    fn quota_op(role: &str, cpus: f64) -> Op {
        Op::SaveQuota {
            role: role.to_owned(),
            quota: ResourceAggregate::new(cpus, 1024, 1024),
        }
    }

    #[tokio::test]
    async fn test_memory_log_round_trip() -> Result<()> {
        let store = MemoryLogStore::default();
        store.append_ops(&[quota_op("web", 1.0)]).await?;
        store.append_ops(&[quota_op("db", 2.0)]).await?;

        let contents = store.restore().await?;
        assert!(contents.snapshot.is_none());
        assert_eq!(contents.batches.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_truncates_prior_records() -> Result<()> {
        let store = MemoryLogStore::default();
        store.append_ops(&[quota_op("web", 1.0)]).await?;

        let snapshot = Snapshot {
            timestamp_ms: 1,
            stores: Stores::default(),
        };
        store.write_snapshot(&snapshot).await?;
        store.append_ops(&[quota_op("db", 2.0)]).await?;

        let contents = store.restore().await?;
        assert!(contents.snapshot.is_some());
        assert_eq!(contents.batches.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_max_entry_size_enforced() {
        let store = MemoryLogStore::new(8);
        let result = store.append_ops(&[quota_op("web", 1.0)]).await;
        assert!(matches!(result, Err(BorealisError::StorageError(_))));
    }

    #[tokio::test]
    async fn test_file_log_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileLogStore::try_new(dir.path(), 512 * 1024)?;

        store.append_ops(&[quota_op("web", 1.0)]).await?;
        store.append_ops(&[quota_op("db", 2.0)]).await?;

        let contents = store.restore().await?;
        assert!(contents.snapshot.is_none());
        assert_eq!(contents.batches.len(), 2);
        assert_eq!(contents.batches[0], vec![quota_op("web", 1.0)]);

        let snapshot = Snapshot {
            timestamp_ms: 7,
            stores: Stores::default(),
        };
        store.write_snapshot(&snapshot).await?;

        let contents = store.restore().await?;
        assert_eq!(contents.snapshot.unwrap().timestamp_ms, 7);
        assert!(contents.batches.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_file_log_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = FileLogStore::try_new(dir.path(), 512 * 1024)?;
            store.append_ops(&[quota_op("web", 1.0)]).await?;
        }

        let reopened = FileLogStore::try_new(dir.path(), 512 * 1024)?;
        let contents = reopened.restore().await?;
        assert_eq!(contents.batches.len(), 1);
        Ok(())
    }
}
