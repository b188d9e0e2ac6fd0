//! Task state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a task as recorded by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet handed to a worker.
    Pending,
    /// Accepted by a worker.
    Dispatched,
    /// The worker reported the agent process as started.
    Running,
    Completed,
    Failed,
    /// Cancelled by its owner.
    Cancelled,
    /// Forced terminal by the zombie reconciler.
    Interrupted,
}

impl TaskStatus {
    /// Statuses in which a worker is (presumed to be) executing the task.
    pub const ACTIVE: [TaskStatus; 2] = [TaskStatus::Dispatched, TaskStatus::Running];

    /// Check if this state allows transitioning to another state.
    ///
    /// `Running → Running` is allowed so progress callbacks can refresh
    /// `updated_at` without changing status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Dispatched)
                | (Dispatched, Running)
                | (Running, Running)
                | (Dispatched, Completed)
                | (Running, Completed)
                | (Dispatched, Failed)
                | (Running, Failed)
                | (Dispatched, Cancelled)
                | (Running, Cancelled)
                | (Dispatched, Interrupted)
                | (Running, Interrupted)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Interrupted
        )
    }

    /// Check if a worker is expected to be running this task.
    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "dispatched" => Ok(Self::Dispatched),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Dispatched,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Interrupted,
    ];

    #[test]
    fn happy_path_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Dispatched));
        assert!(TaskStatus::Dispatched.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn cancel_only_from_active() {
        for status in ALL {
            let expected = matches!(status, TaskStatus::Dispatched | TaskStatus::Running);
            assert_eq!(
                status.can_transition_to(TaskStatus::Cancelled),
                expected,
                "{status} -> cancelled"
            );
        }
    }

    #[test]
    fn interrupt_only_from_active() {
        for status in ALL {
            let expected = matches!(status, TaskStatus::Dispatched | TaskStatus::Running);
            assert_eq!(status.can_transition_to(TaskStatus::Interrupted), expected);
        }
    }

    #[test]
    fn terminal_states_reject_everything() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn pending_cannot_skip_dispatch() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn status_string_roundtrip() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("stuck".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Interrupted).unwrap();
        assert_eq!(json, "\"interrupted\"");
    }
}
