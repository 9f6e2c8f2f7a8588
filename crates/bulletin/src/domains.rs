// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fresh-domain registry.
//!
//! A domain is fresh while its TTL key exists. Whoever owns a domain's
//! source of truth keeps upserting it; if that stops, the key lapses and
//! convergence stops retiring instances of the domain.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::debug;

use crate::error::{BbsError, Result, ValidationError};
use crate::paths;
use crate::store::StoreGateway;

/// Reads and refreshes domain freshness keys.
#[derive(Clone)]
pub struct DomainRegistry {
    gateway: StoreGateway,
}

impl DomainRegistry {
    /// Registry over `gateway`.
    pub fn new(gateway: StoreGateway) -> Self {
        Self { gateway }
    }

    /// Mark `domain` fresh for `ttl`; a zero TTL never expires.
    pub async fn upsert_domain(&self, domain: &str, ttl: Duration) -> Result<()> {
        if domain.is_empty() {
            return Err(BbsError::NoDomain);
        }
        let mut errors = ValidationError::new();
        errors.check(domain.contains('/'), "domain");
        errors.into_result()?;

        let ttl = (!ttl.is_zero()).then_some(ttl);
        self.gateway
            .set_with_ttl(&paths::domain(domain), Vec::new(), ttl)
            .await?;
        debug!(domain, ttl_secs = ttl.map(|t| t.as_secs()), "Upserted domain");
        Ok(())
    }

    /// Names of the currently fresh domains.
    pub async fn domains(&self) -> Result<BTreeSet<String>> {
        let nodes = self.gateway.list(paths::DOMAIN_ROOT).await?;
        Ok(nodes
            .iter()
            .map(|node| paths::leaf_name(&node.key).to_string())
            .collect())
    }
}
