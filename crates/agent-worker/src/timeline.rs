// Timeline records: the server-visible live state of a job and its steps.
// A record is mutated only by its owning execution context and flushed to
// the control plane through the job server queue.

use agent_common::TaskResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Issues beyond this count per severity are counted but not listed.
pub const MAX_ISSUE_COUNT: usize = 10;

/// The kind of a timeline record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    Job,
    Task,
}

/// Lifecycle state of a timeline record. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimelineRecordState {
    Pending,
    InProgress,
    Completed,
}

/// Severity of an issue attached to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueType {
    Error,
    Warning,
}

/// A single error or warning attached to a timeline record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub message: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl Issue {
    pub fn new(issue_type: IssueType, message: impl Into<String>) -> Self {
        Self {
            issue_type,
            message: message.into(),
            data: HashMap::new(),
        }
    }
}

/// A server-visible record of a job's or step's live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineRecord {
    pub id: Uuid,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub order: u32,
    pub name: String,
    pub ref_name: String,
    pub record_type: RecordType,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub percent_complete: u8,
    pub state: TimelineRecordState,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub warning_count: u32,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl TimelineRecord {
    pub fn new(
        id: Uuid,
        parent_id: Option<Uuid>,
        order: u32,
        name: impl Into<String>,
        ref_name: impl Into<String>,
        record_type: RecordType,
    ) -> Self {
        Self {
            id,
            parent_id,
            order,
            name: name.into(),
            ref_name: ref_name.into(),
            record_type,
            start_time: None,
            finish_time: None,
            percent_complete: 0,
            state: TimelineRecordState::Pending,
            result: None,
            error_count: 0,
            warning_count: 0,
            issues: Vec::new(),
            variables: HashMap::new(),
        }
    }

    /// Advance the record state. Returns `false` (and leaves the record
    /// untouched) if the transition would regress.
    pub fn transition_to(&mut self, state: TimelineRecordState) -> bool {
        if state < self.state {
            return false;
        }
        self.state = state;
        true
    }

    /// Append an issue, respecting the per-severity list cap. The matching
    /// counter is always incremented; the return value reports whether the
    /// issue made it into the list.
    pub fn add_issue(&mut self, issue: Issue) -> bool {
        let listed = match issue.issue_type {
            IssueType::Error => {
                self.error_count += 1;
                self.issues
                    .iter()
                    .filter(|i| i.issue_type == IssueType::Error)
                    .count()
                    < MAX_ISSUE_COUNT
            }
            IssueType::Warning => {
                self.warning_count += 1;
                self.issues
                    .iter()
                    .filter(|i| i.issue_type == IssueType::Warning)
                    .count()
                    < MAX_ISSUE_COUNT
            }
        };

        if listed {
            self.issues.push(issue);
        }
        listed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TimelineRecord {
        TimelineRecord::new(
            Uuid::new_v4(),
            None,
            1,
            "Build",
            "__build",
            RecordType::Task,
        )
    }

    #[test]
    fn state_never_regresses() {
        let mut rec = record();
        assert!(rec.transition_to(TimelineRecordState::InProgress));
        assert!(rec.transition_to(TimelineRecordState::Completed));
        assert!(!rec.transition_to(TimelineRecordState::InProgress));
        assert_eq!(rec.state, TimelineRecordState::Completed);
        assert!(!rec.transition_to(TimelineRecordState::Pending));
    }

    #[test]
    fn same_state_transition_is_allowed() {
        let mut rec = record();
        assert!(rec.transition_to(TimelineRecordState::InProgress));
        assert!(rec.transition_to(TimelineRecordState::InProgress));
    }

    #[test]
    fn issue_list_caps_at_ten_per_severity() {
        let mut rec = record();
        for i in 0..15 {
            rec.add_issue(Issue::new(IssueType::Error, format!("error {i}")));
        }
        for i in 0..12 {
            rec.add_issue(Issue::new(IssueType::Warning, format!("warning {i}")));
        }

        assert_eq!(rec.error_count, 15);
        assert_eq!(rec.warning_count, 12);
        let errors = rec
            .issues
            .iter()
            .filter(|i| i.issue_type == IssueType::Error)
            .count();
        let warnings = rec
            .issues
            .iter()
            .filter(|i| i.issue_type == IssueType::Warning)
            .count();
        assert_eq!(errors, MAX_ISSUE_COUNT);
        assert_eq!(warnings, MAX_ISSUE_COUNT);
    }

    #[test]
    fn issue_serializes_with_type_field() {
        let issue = Issue::new(IssueType::Warning, "deprecated input");
        let json = serde_json::to_string(&issue).unwrap();
        assert!(json.contains("\"type\":\"Warning\""));
    }
}
