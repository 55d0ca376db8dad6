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

//! Borealis error types

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::result;

pub type Result<T> = result::Result<T, BorealisError>;

/// Borealis error
#[derive(Debug)]
pub enum BorealisError {
    /// Malformed input, unknown job, illegal operator transition, duplicate job.
    InvalidRequest(String),
    /// The requested entity does not exist.
    NotFound(String),
    /// Missing or insufficient credentials.
    AuthFailed(String),
    /// Scheduling domain violation, e.g. quota exceeded or cron collision.
    ScheduleError(String),
    /// Mutation attempted against a key locked by another holder.
    LockError(String),
    /// Backup not found, staging conflict, or corrupt snapshot.
    RecoveryError(String),
    /// The underlying log is unavailable or replay failed.
    StorageError(String),
    /// A bounded wait was exhausted.
    Timeout(String),
    /// A wait was interrupted before completion.
    Interrupted,
    IoError(io::Error),
    SerdeError(serde_json::Error),
    /// Unanticipated invariant violation.
    Internal(String),
}

impl From<io::Error> for BorealisError {
    fn from(e: io::Error) -> Self {
        BorealisError::IoError(e)
    }
}

impl From<serde_json::Error> for BorealisError {
    fn from(e: serde_json::Error) -> Self {
        BorealisError::SerdeError(e)
    }
}

impl Display for BorealisError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            BorealisError::InvalidRequest(desc) => {
                write!(f, "Invalid request: {desc}")
            }
            BorealisError::NotFound(desc) => write!(f, "Not found: {desc}"),
            BorealisError::AuthFailed(desc) => {
                write!(f, "Authentication failed: {desc}")
            }
            BorealisError::ScheduleError(desc) => {
                write!(f, "Scheduling error: {desc}")
            }
            BorealisError::LockError(desc) => write!(f, "Lock error: {desc}"),
            BorealisError::RecoveryError(desc) => {
                write!(f, "Recovery error: {desc}")
            }
            BorealisError::StorageError(desc) => {
                write!(f, "Storage error: {desc}")
            }
            BorealisError::Timeout(desc) => write!(f, "Timed out: {desc}"),
            BorealisError::Interrupted => write!(f, "Interrupted"),
            BorealisError::IoError(e) => write!(f, "IO error: {e}"),
            BorealisError::SerdeError(e) => write!(f, "Serde error: {e}"),
            BorealisError::Internal(desc) => {
                write!(f, "Internal error: {desc}")
            }
        }
    }
}

impl Error for BorealisError {}

/// Wire-level response codes carried by every RPC response. The RPC surface
/// itself lives outside this crate; this is the translation contract it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    InvalidRequest,
    AuthFailed,
    Error,
    Warning,
}

impl From<&BorealisError> for ResponseCode {
    fn from(e: &BorealisError) -> Self {
        match e {
            BorealisError::InvalidRequest(_)
            | BorealisError::NotFound(_)
            | BorealisError::LockError(_)
            | BorealisError::ScheduleError(_) => ResponseCode::InvalidRequest,
            BorealisError::AuthFailed(_) => ResponseCode::AuthFailed,
            _ => ResponseCode::Error,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_response_code_translation() {
        let cases = vec![
            (
                BorealisError::InvalidRequest("bad".to_owned()),
                ResponseCode::InvalidRequest,
            ),
            (
                BorealisError::LockError("held".to_owned()),
                ResponseCode::InvalidRequest,
            ),
            (
                BorealisError::AuthFailed("who".to_owned()),
                ResponseCode::AuthFailed,
            ),
            (
                BorealisError::StorageError("log".to_owned()),
                ResponseCode::Error,
            ),
            (
                BorealisError::Timeout("kill".to_owned()),
                ResponseCode::Error,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(ResponseCode::from(&error), expected);
        }
    }
}
