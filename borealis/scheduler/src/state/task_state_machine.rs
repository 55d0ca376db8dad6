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

//! The per-task state machine. `transition` is a pure function from
//! `(state, target, context)` to an outcome carrying the side-effect
//! commands; the task manager interprets those commands inside the enclosing
//! storage transaction.

use borealis_core::model::TaskState;

/// Side effects emitted by a state transition, applied by the interpreter in
/// the order given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkCommand {
    /// Persist the new status and append an audit event.
    UpdateState,
    /// Instruct the agent to terminate the remote process.
    Kill,
    /// Synthesize a replacement task with a fresh task id.
    Reschedule,
    /// Bump the task's failure count.
    IncrementFailures,
    /// Remove the task record entirely.
    Delete,
}

/// The per-task facts a transition decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext {
    pub is_service: bool,
    pub failure_count: i32,
    /// -1 means unlimited.
    pub max_task_failures: i32,
}

impl TransitionContext {
    fn reschedule_on_failure(&self) -> bool {
        self.max_task_failures == -1
            || self.failure_count < self.max_task_failures - 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Status unchanged, silently dropped.
    Noop,
    /// Not an edge of the transition table. Counted, never an error. A
    /// terminal task re-acknowledged by an agent still carries a Kill for
    /// the zombie process.
    Illegal { commands: Vec<WorkCommand> },
    /// A legal transition. `target` may differ from the requested state
    /// (a STARTING/RUNNING task that stops reporting becomes LOST).
    Progress {
        target: TaskState,
        commands: Vec<WorkCommand>,
    },
}

/// Whether `from -> to` is an edge of the transition table.
pub fn is_legal(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    match from {
        Init => matches!(to, Pending | Throttled | Unknown),
        Pending => matches!(to, Assigned | Killing),
        Throttled => matches!(to, Pending | Killing),
        Assigned => matches!(
            to,
            Starting
                | Running
                | Finished
                | Failed
                | Restarting
                | Killed
                | Killing
                | Lost
                | Preempting
        ),
        Starting => matches!(
            to,
            Running | Finished | Failed | Restarting | Killing | Killed | Lost | Preempting
        ),
        Running => matches!(
            to,
            Finished | Restarting | Failed | Killing | Killed | Lost | Preempting
        ),
        Preempting | Restarting => {
            matches!(to, Finished | Failed | Killing | Killed | Lost)
        }
        Killing => matches!(to, Finished | Failed | Killed | Lost | Unknown),
        Finished | Failed | Killed | Lost => matches!(to, Unknown),
        Unknown => false,
    }
}

/// Compute the outcome of driving a task at `from` toward `to`.
pub fn transition(
    from: TaskState,
    to: TaskState,
    ctx: TransitionContext,
) -> TransitionOutcome {
    use TaskState::*;

    if from == to {
        return TransitionOutcome::Noop;
    }

    // The agent stopped reporting a task it had acknowledged.
    let to = if matches!(from, Starting | Running) && to == Unknown {
        Lost
    } else {
        to
    };

    if !is_legal(from, to) {
        let commands = if from.is_terminal() && matches!(to, Assigned | Starting | Running)
        {
            vec![WorkCommand::Kill]
        } else {
            vec![]
        };
        return TransitionOutcome::Illegal { commands };
    }

    let mut commands = vec![];

    // Kill the remote process when leaving it behind.
    let kills = match to {
        Killing => matches!(from, Assigned | Starting | Running),
        Restarting | Preempting => true,
        Lost => matches!(from, Preempting | Restarting),
        _ => false,
    };
    if kills {
        commands.push(WorkCommand::Kill);
    }

    if to == Failed {
        commands.push(WorkCommand::IncrementFailures);
    }

    let deletes = match (from, to) {
        // No agent has ever been involved; drop the record instead of
        // updating it.
        (Pending | Throttled, Killing) => true,
        // Remote removal observed, or the machine never produced a record
        // an agent acknowledged.
        (_, Unknown) => true,
        _ => false,
    };
    if deletes {
        commands.push(WorkCommand::Delete);
    } else if to != Unknown {
        commands.push(WorkCommand::UpdateState);
    }

    let reschedules = match to {
        Finished => ctx.is_service,
        Failed => ctx.is_service || ctx.reschedule_on_failure(),
        Killed | Lost => matches!(
            from,
            Assigned | Starting | Running | Preempting | Restarting
        ),
        _ => false,
    };
    if reschedules {
        commands.push(WorkCommand::Reschedule);
    }

    TransitionOutcome::Progress {
        target: to,
        commands,
    }
}

/// One live task's machine. Constructible at any initial state so machines
/// can be rebuilt from the recovered log.
#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    task_id: String,
    state: TaskState,
}

impl TaskStateMachine {
    pub fn new(task_id: impl Into<String>, initial_state: TaskState) -> Self {
        Self {
            task_id: task_id.into(),
            state: initial_state,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Attempt to advance toward `to`, updating the held state on progress.
    pub fn step(&mut self, to: TaskState, ctx: TransitionContext) -> TransitionOutcome {
        let outcome = transition(self.state, to, ctx);
        if let TransitionOutcome::Progress { target, .. } = &outcome {
            self.state = *target;
        }
        outcome
    }
}
