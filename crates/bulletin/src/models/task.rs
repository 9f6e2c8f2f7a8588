// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::MAX_ANNOTATION_BYTES;
use crate::error::{BbsError, Result, ValidationError};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Waiting for a cell.
    Pending,
    /// Running on a cell.
    Running,
    /// Finished, result not yet collected.
    Completed,
    /// A consumer is collecting the result.
    Resolving,
}

impl TaskState {
    /// Upper-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Resolving => "RESOLVING",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Environment variable passed to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    /// Name.
    pub name: String,
    /// Value.
    pub value: String,
}

/// One-shot unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub task_guid: String,
    /// Owning domain.
    pub domain: String,
    /// Root filesystem reference.
    pub rootfs: String,
    /// Opaque action to run.
    #[serde(default)]
    pub action: Value,
    /// Environment passed to the action.
    #[serde(default)]
    pub env: Vec<EnvironmentVariable>,
    /// Memory limit in MB.
    #[serde(default)]
    pub memory_mb: i32,
    /// Disk limit in MB.
    #[serde(default)]
    pub disk_mb: i32,
    /// Relative CPU weight (0..=100).
    #[serde(default)]
    pub cpu_weight: u32,
    /// Whether the container runs privileged.
    #[serde(default)]
    pub privileged: bool,
    /// Log stream identifier.
    #[serde(default)]
    pub log_guid: String,
    /// Log source name.
    #[serde(default)]
    pub log_source: String,
    /// Metrics stream identifier.
    #[serde(default)]
    pub metrics_guid: String,
    /// File whose contents become the result.
    #[serde(default)]
    pub result_file: String,
    /// Where to announce completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_callback_url: Option<String>,
    /// Free-form annotation.
    #[serde(default)]
    pub annotation: String,
    /// Opaque egress rules.
    #[serde(default)]
    pub egress_rules: Vec<Value>,

    /// Lifecycle state.
    #[serde(default = "pending")]
    pub state: TaskState,
    /// Cell running (or that ran) the task.
    #[serde(default)]
    pub cell_id: String,
    /// Whether the task failed.
    #[serde(default)]
    pub failed: bool,
    /// Why the task failed.
    #[serde(default)]
    pub failure_reason: String,
    /// Contents of `result_file`.
    #[serde(default)]
    pub result: String,
    /// Nanosecond creation timestamp.
    #[serde(default)]
    pub created_at: i64,
    /// Nanosecond timestamp of the last write.
    #[serde(default)]
    pub updated_at: i64,
    /// Nanosecond timestamp of the first completion.
    #[serde(default)]
    pub first_completed_at: i64,
}

fn pending() -> TaskState {
    TaskState::Pending
}

impl Task {
    /// A pending task with the required fields set and everything else defaulted.
    pub fn new(
        task_guid: impl Into<String>,
        domain: impl Into<String>,
        rootfs: impl Into<String>,
        action: Value,
    ) -> Self {
        Self {
            task_guid: task_guid.into(),
            domain: domain.into(),
            rootfs: rootfs.into(),
            action,
            env: Vec::new(),
            memory_mb: 0,
            disk_mb: 0,
            cpu_weight: 0,
            privileged: false,
            log_guid: String::new(),
            log_source: String::new(),
            metrics_guid: String::new(),
            result_file: String::new(),
            completion_callback_url: None,
            annotation: String::new(),
            egress_rules: Vec::new(),
            state: TaskState::Pending,
            cell_id: String::new(),
            failed: false,
            failure_reason: String::new(),
            result: String::new(),
            created_at: 0,
            updated_at: 0,
            first_completed_at: 0,
        }
    }

    /// Check the definition fields, reporting all failures at once.
    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(BbsError::NoDomain);
        }

        let mut errors = ValidationError::new();
        errors.check(
            self.task_guid.is_empty() || self.task_guid.contains('/'),
            "task_guid",
        );
        errors.check(self.rootfs.is_empty(), "rootfs");
        errors.check(self.action.is_null(), "action");
        errors.check(self.cpu_weight > 100, "cpu_weight");
        errors.check(self.memory_mb < 0, "memory_mb");
        errors.check(self.disk_mb < 0, "disk_mb");
        errors.check(self.annotation.len() > MAX_ANNOTATION_BYTES, "annotation");
        if let Some(url) = &self.completion_callback_url {
            errors.check(reqwest::Url::parse(url).is_err(), "completion_callback_url");
        }
        errors.into_result()
    }

    /// Whether a completion callback should be delivered for this task.
    pub fn has_callback(&self) -> bool {
        self.completion_callback_url
            .as_ref()
            .is_some_and(|url| !url.is_empty())
    }
}

/// Selects tasks in queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Only tasks of this domain.
    pub domain: Option<String>,
    /// Only tasks on this cell.
    pub cell_id: Option<String>,
}

impl TaskFilter {
    /// Whether `task` passes the filter.
    pub fn matches(&self, task: &Task) -> bool {
        self.domain.as_ref().is_none_or(|d| *d == task.domain)
            && self.cell_id.as_ref().is_none_or(|c| *c == task.cell_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Task {
        Task::new("t-1", "d", "docker:///alpine", json!({"run": {"path": "true"}}))
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());

        let mut task = sample();
        task.domain.clear();
        assert_eq!(task.validate(), Err(BbsError::NoDomain));

        let mut task = sample();
        task.task_guid.clear();
        task.completion_callback_url = Some("not a url".to_string());
        let Err(BbsError::Validation(errors)) = task.validate() else {
            panic!("expected validation error");
        };
        assert_eq!(errors.fields(), ["task_guid", "completion_callback_url"]);
    }

    #[test]
    fn test_state_wire_names() {
        let mut task = sample();
        task.state = TaskState::Resolving;
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["state"], "RESOLVING");
        assert!(value.get("completion_callback_url").is_none());

        let decoded: Task = serde_json::from_value(json!({
            "task_guid": "t",
            "domain": "d",
            "rootfs": "r",
        }))
        .unwrap();
        assert_eq!(decoded.state, TaskState::Pending);
    }

    #[test]
    fn test_filter() {
        let mut task = sample();
        task.cell_id = "cell-a".to_string();
        let by_cell = TaskFilter {
            cell_id: Some("cell-a".to_string()),
            ..Default::default()
        };
        assert!(by_cell.matches(&task));
        task.cell_id = "cell-b".to_string();
        assert!(!by_cell.matches(&task));
    }
}
