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

use borealis_core::model::TaskState;

/// Committed state-change notifications flowing from the storage boundary to
/// the scheduling loop and the maintenance controller.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// Tasks entered PENDING and must join their scheduling groups.
    TasksPending { task_ids: Vec<String> },
    /// Task records were deleted and must leave their queues.
    TasksDeleted { task_ids: Vec<String> },
    /// A task's committed status changed.
    TaskStateChanged {
        task_id: String,
        from: TaskState,
        to: TaskState,
        slave_host: Option<String>,
    },
}
