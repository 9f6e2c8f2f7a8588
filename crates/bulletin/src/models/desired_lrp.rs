// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{MAX_ANNOTATION_BYTES, ModificationTag};
use crate::error::{BbsError, Result, ValidationError};

/// Declared specification of a long-running process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredLrp {
    /// Unique identifier.
    pub process_guid: String,
    /// Owning domain.
    pub domain: String,
    /// Number of instances to keep running.
    #[serde(default)]
    pub instances: i32,
    /// Root filesystem reference.
    pub rootfs: String,
    /// Opaque action run for each instance.
    #[serde(default)]
    pub action: Value,
    /// Opaque action run before `action`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<Value>,
    /// Seconds a starting instance may take before it is considered unhealthy.
    #[serde(default)]
    pub start_timeout: u32,
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
    /// Exposed container ports.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Opaque routing information keyed by router.
    #[serde(default)]
    pub routes: BTreeMap<String, Value>,
    /// Free-form annotation.
    #[serde(default)]
    pub annotation: String,
    /// Log stream identifier.
    #[serde(default)]
    pub log_guid: String,
    /// Log source name.
    #[serde(default)]
    pub log_source: String,
    /// Metrics stream identifier.
    #[serde(default)]
    pub metrics_guid: String,
    /// Opaque egress rules.
    #[serde(default)]
    pub egress_rules: Vec<Value>,
    /// Version marker.
    #[serde(default)]
    pub modification_tag: ModificationTag,
}

impl DesiredLrp {
    /// A desired LRP with the required fields set and everything else defaulted.
    pub fn new(
        process_guid: impl Into<String>,
        domain: impl Into<String>,
        rootfs: impl Into<String>,
        action: Value,
    ) -> Self {
        Self {
            process_guid: process_guid.into(),
            domain: domain.into(),
            instances: 0,
            rootfs: rootfs.into(),
            action,
            setup: None,
            start_timeout: 0,
            memory_mb: 0,
            disk_mb: 0,
            cpu_weight: 0,
            privileged: false,
            ports: Vec::new(),
            routes: BTreeMap::new(),
            annotation: String::new(),
            log_guid: String::new(),
            log_source: String::new(),
            metrics_guid: String::new(),
            egress_rules: Vec::new(),
            modification_tag: ModificationTag::default(),
        }
    }

    /// Check every field, reporting all failures at once.
    pub fn validate(&self) -> Result<()> {
        if self.process_guid.is_empty() {
            return Err(BbsError::NoProcessGuid);
        }
        if self.domain.is_empty() {
            return Err(BbsError::NoDomain);
        }

        let mut errors = ValidationError::new();
        errors.check(self.process_guid.contains('/'), "process_guid");
        errors.check(self.rootfs.is_empty(), "rootfs");
        errors.check(self.instances < 0, "instances");
        errors.check(self.action.is_null(), "action");
        errors.check(self.cpu_weight > 100, "cpu_weight");
        errors.check(self.memory_mb < 0, "memory_mb");
        errors.check(self.disk_mb < 0, "disk_mb");
        errors.check(self.annotation.len() > MAX_ANNOTATION_BYTES, "annotation");
        errors.into_result()
    }
}

/// Partial update accepted by `update_desired_lrp`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredLrpUpdate {
    /// New instance count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<i32>,
    /// Replacement routes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<BTreeMap<String, Value>>,
    /// Replacement annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

impl DesiredLrpUpdate {
    /// Reject negative counts and oversized annotations.
    pub fn validate(&self) -> Result<()> {
        let mut errors = ValidationError::new();
        errors.check(self.instances.is_some_and(|n| n < 0), "instances");
        errors.check(
            self.annotation
                .as_ref()
                .is_some_and(|a| a.len() > MAX_ANNOTATION_BYTES),
            "annotation",
        );
        errors.into_result()
    }

    /// Apply to `lrp`, returning the previous instance count.
    pub fn apply_to(&self, lrp: &mut DesiredLrp) -> i32 {
        let previous = lrp.instances;
        if let Some(instances) = self.instances {
            lrp.instances = instances;
        }
        if let Some(routes) = &self.routes {
            lrp.routes = routes.clone();
        }
        if let Some(annotation) = &self.annotation {
            lrp.annotation = annotation.clone();
        }
        previous
    }
}

/// Selects desired LRPs in queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredLrpFilter {
    /// Only return LRPs of this domain.
    pub domain: Option<String>,
}

impl DesiredLrpFilter {
    /// Whether `lrp` passes the filter.
    pub fn matches(&self, lrp: &DesiredLrp) -> bool {
        self.domain.as_ref().is_none_or(|d| *d == lrp.domain)
    }
}

/// Auction request for a set of indices of one desired LRP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrpStartRequest {
    /// The process to place.
    pub desired_lrp: DesiredLrp,
    /// Indices that need a cell.
    pub indices: Vec<i32>,
}

impl LrpStartRequest {
    /// Request for `indices` of `desired_lrp`.
    pub fn new(desired_lrp: DesiredLrp, indices: Vec<i32>) -> Self {
        Self {
            desired_lrp,
            indices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> DesiredLrp {
        let mut lrp = DesiredLrp::new(
            "web-1",
            "apps",
            "docker:///nginx",
            json!({"run": {"path": "nginx"}}),
        );
        lrp.instances = 2;
        lrp
    }

    #[test]
    fn test_valid_desired_lrp() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_missing_identifiers() {
        let mut lrp = sample();
        lrp.process_guid.clear();
        assert_eq!(lrp.validate(), Err(BbsError::NoProcessGuid));

        let mut lrp = sample();
        lrp.domain.clear();
        assert_eq!(lrp.validate(), Err(BbsError::NoDomain));
    }

    #[test]
    fn test_validation_lists_every_field() {
        let mut lrp = sample();
        lrp.instances = -1;
        lrp.rootfs.clear();
        lrp.action = Value::Null;

        let Err(BbsError::Validation(errors)) = lrp.validate() else {
            panic!("expected validation error");
        };
        assert_eq!(errors.fields(), ["rootfs", "instances", "action"]);
    }

    #[test]
    fn test_update_rejects_negative_instances() {
        let update = DesiredLrpUpdate {
            instances: Some(-3),
            ..Default::default()
        };
        assert!(matches!(update.validate(), Err(BbsError::Validation(_))));
    }

    #[test]
    fn test_update_apply() {
        let mut lrp = sample();
        let update = DesiredLrpUpdate {
            instances: Some(5),
            annotation: Some("scaled".to_string()),
            ..Default::default()
        };
        let previous = update.apply_to(&mut lrp);

        assert_eq!(previous, 2);
        assert_eq!(lrp.instances, 5);
        assert_eq!(lrp.annotation, "scaled");
        assert!(lrp.routes.is_empty());
    }

    #[test]
    fn test_wire_format() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["process_guid"], "web-1");
        assert_eq!(value["modification_tag"]["index"], 0);
        assert!(value.get("setup").is_none());

        let decoded: DesiredLrp = serde_json::from_value(json!({
            "process_guid": "g",
            "domain": "d",
            "rootfs": "r",
            "action": {"run": {}},
        }))
        .unwrap();
        assert_eq!(decoded.instances, 0);
    }
}
