// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for bulletin.
//!
//! Every operation surfaces a [`BbsError`]. The set of variants is closed and
//! each variant carries a stable wire code (see [`BbsError::error_code`]) that
//! the API façade forwards to its clients.

use std::fmt;

use thiserror::Error;

use crate::models::{ActualLrpState, TaskState};

/// Result type using [`BbsError`].
pub type Result<T> = std::result::Result<T, BbsError>;

/// A lifecycle transition that can be refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Actual LRP claimed by a cell.
    Claimed,
    /// Actual LRP started on a cell.
    Started,
    /// Actual LRP crashed.
    Crashed,
    /// Actual LRP returned to the unclaimed pool.
    Unclaimed,
    /// Actual LRP placement failed.
    Failed,
    /// Actual LRP evacuated from a draining cell.
    Evacuated,
    /// Task cancelled.
    Cancelled,
    /// Task resolved (deleted).
    Resolved,
    /// Task marked as resolving.
    MarkedResolving,
}

impl Transition {
    /// Suffix used in the `cannot_be_*` wire codes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Started => "started",
            Self::Crashed => "crashed",
            Self::Unclaimed => "unclaimed",
            Self::Failed => "failed",
            Self::Evacuated => "evacuated",
            Self::Cancelled => "cancelled",
            Self::Resolved => "resolved",
            Self::MarkedResolving => "marked_resolving",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field-level validation failures, accumulated across a whole record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    fields: Vec<String>,
}

impl ValidationError {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an invalid field.
    pub fn add(&mut self, field: impl Into<String>) {
        self.fields.push(field.into());
    }

    /// Record an invalid field when `invalid` holds.
    pub fn check(&mut self, invalid: bool, field: &str) {
        if invalid {
            self.add(field);
        }
    }

    /// Names of the fields that failed validation, in the order found.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Whether no field failed.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// `Ok(())` when nothing failed, the aggregated error otherwise.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(BbsError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid field(s): {}", self.fields.join(", "))
    }
}

impl std::error::Error for ValidationError {}

/// Domain errors.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum BbsError {
    /// The key does not exist in the store.
    #[error("resource not found: {key}")]
    ResourceNotFound {
        /// Store key that was looked up.
        key: String,
    },

    /// The key already exists in the store.
    #[error("resource already exists: {key}")]
    ResourceExists {
        /// Store key that was written.
        key: String,
    },

    /// The stored index moved since it was read.
    #[error("index mismatch writing {key}")]
    IndexMismatch {
        /// Store key that was written.
        key: String,
    },

    /// The stored record does not match the caller's keys.
    #[error("comparison failed for {key}")]
    ComparisonFailed {
        /// Store key that was compared.
        key: String,
    },

    /// A stored or submitted payload could not be decoded.
    #[error("invalid format: {reason}")]
    InvalidFormat {
        /// Decoder message.
        reason: String,
    },

    /// The TTL requested for a key was rejected by the store.
    #[error("invalid ttl")]
    InvalidTtl,

    /// The store did not answer in time.
    #[error("store request timed out")]
    Timeout,

    /// The store (or a service it depends on) is unreachable.
    #[error("service unavailable: {reason}")]
    ServiceUnavailable {
        /// Underlying failure.
        reason: String,
    },

    /// No process guid was supplied.
    #[error("no process guid")]
    NoProcessGuid,

    /// No cell id was supplied.
    #[error("no cell id")]
    NoCellId,

    /// No domain was supplied.
    #[error("no domain")]
    NoDomain,

    /// One or more fields failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The actual LRP is in a state that refuses the transition.
    #[error("actual LRP cannot be {transition}{}", describe_state(.state))]
    ActualLrpCannotBe {
        /// Refused transition.
        transition: Transition,
        /// State the record was in, `None` when there was no record.
        state: Option<ActualLrpState>,
    },

    /// The task is in a state that refuses the transition.
    #[error("task cannot be {transition} from {state}")]
    TaskCannotBe {
        /// Refused transition.
        transition: Transition,
        /// State the task was in.
        state: TaskState,
    },

    /// The task does not exist.
    #[error("task not found: {task_guid}")]
    TaskNotFound {
        /// Guid that was looked up.
        task_guid: String,
    },

    /// The task is owned by another cell.
    #[error("task {task_guid} is running on a different cell ({cell_id})")]
    TaskRunningOnDifferentCell {
        /// Task guid.
        task_guid: String,
        /// Cell that currently owns the task.
        cell_id: String,
    },

    /// Generic refused task state change.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: TaskState,
        /// Requested state.
        to: TaskState,
    },
}

impl BbsError {
    /// Stable code sent across the API boundary.
    pub fn error_code(&self) -> String {
        match self {
            Self::ResourceNotFound { .. } => "resource_not_found".into(),
            Self::ResourceExists { .. } => "resource_exists".into(),
            Self::IndexMismatch { .. } => "index_mismatch".into(),
            Self::ComparisonFailed { .. } => "comparison_failed".into(),
            Self::InvalidFormat { .. } => "invalid_format".into(),
            Self::InvalidTtl => "invalid_ttl".into(),
            Self::Timeout => "timeout".into(),
            Self::ServiceUnavailable { .. } => "service_unavailable".into(),
            Self::NoProcessGuid => "no_process_guid".into(),
            Self::NoCellId => "no_cell_id".into(),
            Self::NoDomain => "no_domain".into(),
            Self::Validation(_) => "invalid_request".into(),
            Self::ActualLrpCannotBe { transition, .. } | Self::TaskCannotBe { transition, .. } => {
                format!("cannot_be_{}", transition.as_str())
            }
            Self::TaskNotFound { .. } => "task_not_found".into(),
            Self::TaskRunningOnDifferentCell { .. } => "task_running_on_different_cell".into(),
            Self::InvalidStateTransition { .. } => "invalid_state_transition".into(),
        }
    }

    /// HTTP status the façade answers with for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ResourceNotFound { .. } | Self::TaskNotFound { .. } => 404,
            Self::ResourceExists { .. }
            | Self::IndexMismatch { .. }
            | Self::ComparisonFailed { .. } => 409,
            Self::InvalidFormat { .. }
            | Self::InvalidTtl
            | Self::NoProcessGuid
            | Self::NoCellId
            | Self::NoDomain
            | Self::Validation(_) => 400,
            Self::Timeout | Self::ServiceUnavailable { .. } => 503,
            Self::ActualLrpCannotBe { .. }
            | Self::TaskCannotBe { .. }
            | Self::TaskRunningOnDifferentCell { .. }
            | Self::InvalidStateTransition { .. } => 409,
        }
    }

    /// Whether re-reading and retrying the operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IndexMismatch { .. } | Self::Timeout | Self::ServiceUnavailable { .. }
        )
    }

    /// Whether this is a missing-key error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ResourceNotFound { .. })
    }

    /// Refused actual LRP transition.
    pub fn cannot_be(transition: Transition, state: impl Into<Option<ActualLrpState>>) -> Self {
        Self::ActualLrpCannotBe {
            transition,
            state: state.into(),
        }
    }
}

fn describe_state(state: &Option<ActualLrpState>) -> String {
    match state {
        Some(state) => format!(" from {state}"),
        None => " (no such record)".to_string(),
    }
}

impl From<serde_json::Error> for BbsError {
    fn from(err: serde_json::Error) -> Self {
        BbsError::InvalidFormat {
            reason: err.to_string(),
        }
    }
}
