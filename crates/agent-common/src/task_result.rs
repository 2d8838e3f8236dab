// TaskResult and the merge rule that folds step results into a job result.

use serde::{Deserialize, Serialize};

/// Outcome of a job, step, or task record.
///
/// The discriminant order matters: `merge` relies on higher values being
/// less favorable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TaskResult {
    Succeeded = 0,
    SucceededWithIssues = 1,
    Failed = 2,
    Canceled = 3,
    Skipped = 4,
    Abandoned = 5,
}

impl TaskResult {
    /// Create a `TaskResult` from its integer representation.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(TaskResult::Succeeded),
            1 => Some(TaskResult::SucceededWithIssues),
            2 => Some(TaskResult::Failed),
            3 => Some(TaskResult::Canceled),
            4 => Some(TaskResult::Skipped),
            5 => Some(TaskResult::Abandoned),
            _ => None,
        }
    }

    /// Merge a newly observed result into the running result.
    ///
    /// Precedence (best to worst): `Succeeded` < `SucceededWithIssues` <
    /// `Failed`. Once the running result is `Canceled`, `Skipped`, or
    /// `Abandoned` it is sticky and later step results cannot improve or
    /// change it.
    pub fn merge(current: Option<TaskResult>, coming: TaskResult) -> TaskResult {
        match current {
            None => coming,
            Some(current) => {
                if current > TaskResult::Failed {
                    return current;
                }
                if coming >= current {
                    return coming;
                }
                current
            }
        }
    }
}

impl std::fmt::Display for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskResult::Succeeded => write!(f, "Succeeded"),
            TaskResult::SucceededWithIssues => write!(f, "SucceededWithIssues"),
            TaskResult::Failed => write!(f, "Failed"),
            TaskResult::Canceled => write!(f, "Canceled"),
            TaskResult::Skipped => write!(f, "Skipped"),
            TaskResult::Abandoned => write!(f, "Abandoned"),
        }
    }
}
