//! Tenant directory
//!
//! Resolves access tokens to tenants, checks that an instance belongs to the
//! tenant asking for it, and enforces monthly message quotas.

use crate::config::TenantConfig;
use crate::core::errors::DirectoryError;
use crate::core::types::InstanceId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
}

/// An instance as registered in the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub instance_id: InstanceId,
    pub tenant_id: String,
}

#[async_trait]
pub trait TenantDirectory: Send + Sync + 'static {
    async fn resolve_token(&self, token: &str) -> Result<Option<Tenant>, DirectoryError>;

    /// Look up an instance, returning `None` if it does not belong to the tenant
    async fn resolve_instance(
        &self,
        tenant_id: &str,
        instance_id: &InstanceId,
    ) -> Result<Option<SessionRecord>, DirectoryError>;

    async fn within_monthly_limit(&self, tenant_id: &str) -> Result<bool, DirectoryError>;

    /// Check the quota and count one message against it in a single step.
    ///
    /// Returns false, without counting, once the tenant is at its limit.
    async fn try_consume_quota(&self, tenant_id: &str) -> Result<bool, DirectoryError>;

    /// Give back a unit taken by [`TenantDirectory::try_consume_quota`] for a
    /// message that was not accepted
    async fn refund_quota(&self, _tenant_id: &str) -> Result<(), DirectoryError> {
        Ok(())
    }
}

struct TenantEntry {
    tenant: Tenant,
    instances: HashSet<InstanceId>,
    monthly_limit: Option<u64>,
}

/// Directory built from static configuration.
///
/// Usage counters live in memory and start at zero on every restart.
pub struct StaticDirectory {
    by_token: HashMap<String, String>,
    tenants: HashMap<String, TenantEntry>,
    usage: DashMap<String, u64>,
}

impl StaticDirectory {
    pub fn from_config(tenants: &[TenantConfig]) -> Self {
        let mut by_token = HashMap::new();
        let mut entries = HashMap::new();

        for t in tenants {
            by_token.insert(t.token.clone(), t.id.clone());
            entries.insert(
                t.id.clone(),
                TenantEntry {
                    tenant: Tenant {
                        id: t.id.clone(),
                        name: t.name.clone().unwrap_or_else(|| t.id.clone()),
                    },
                    instances: t.instances.iter().map(|i| InstanceId::new(i.as_str())).collect(),
                    monthly_limit: t.monthly_limit,
                },
            );
        }

        Self {
            by_token,
            tenants: entries,
            usage: DashMap::new(),
        }
    }

    /// Messages counted against the tenant this month
    pub fn usage(&self, tenant_id: &str) -> u64 {
        self.usage.get(tenant_id).map(|u| *u).unwrap_or(0)
    }

    /// Start a new billing month
    pub fn reset_usage(&self) {
        self.usage.clear();
    }
}

#[async_trait]
impl TenantDirectory for StaticDirectory {
    async fn resolve_token(&self, token: &str) -> Result<Option<Tenant>, DirectoryError> {
        Ok(self
            .by_token
            .get(token)
            .and_then(|id| self.tenants.get(id))
            .map(|entry| entry.tenant.clone()))
    }

    async fn resolve_instance(
        &self,
        tenant_id: &str,
        instance_id: &InstanceId,
    ) -> Result<Option<SessionRecord>, DirectoryError> {
        let found = self
            .tenants
            .get(tenant_id)
            .is_some_and(|entry| entry.instances.contains(instance_id));

        if !found {
            debug!(tenant = tenant_id, instance = %instance_id, "Instance not registered for tenant");
            return Ok(None);
        }

        Ok(Some(SessionRecord {
            instance_id: instance_id.clone(),
            tenant_id: tenant_id.to_string(),
        }))
    }

    async fn within_monthly_limit(&self, tenant_id: &str) -> Result<bool, DirectoryError> {
        let limit = match self.tenants.get(tenant_id) {
            Some(entry) => entry.monthly_limit,
            None => return Ok(false),
        };
        Ok(limit.map_or(true, |limit| self.usage(tenant_id) < limit))
    }

    async fn try_consume_quota(&self, tenant_id: &str) -> Result<bool, DirectoryError> {
        let Some(entry) = self.tenants.get(tenant_id) else {
            return Ok(false);
        };

        // The entry guard holds the shard lock across check and increment
        let mut used = self.usage.entry(tenant_id.to_string()).or_insert(0);
        if entry.monthly_limit.is_some_and(|limit| *used >= limit) {
            return Ok(false);
        }
        *used += 1;
        Ok(true)
    }

    async fn refund_quota(&self, tenant_id: &str) -> Result<(), DirectoryError> {
        if let Some(mut used) = self.usage.get_mut(tenant_id) {
            *used = used.saturating_sub(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> StaticDirectory {
        StaticDirectory::from_config(&[TenantConfig {
            id: "acme".to_string(),
            name: Some("Acme".to_string()),
            token: "secret".to_string(),
            instances: vec!["acme-1".to_string()],
            monthly_limit: Some(2),
        }])
    }

    #[tokio::test]
    async fn test_resolve_token() {
        let dir = directory();
        let tenant = dir.resolve_token("secret").await.unwrap().unwrap();
        assert_eq!(tenant.id, "acme");
        assert_eq!(tenant.name, "Acme");
        assert!(dir.resolve_token("wrong").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_instance_ownership() {
        let dir = directory();
        assert!(dir
            .resolve_instance("acme", &InstanceId::from("acme-1"))
            .await
            .unwrap()
            .is_some());
        assert!(dir
            .resolve_instance("acme", &InstanceId::from("other"))
            .await
            .unwrap()
            .is_none());
        assert!(dir
            .resolve_instance("nobody", &InstanceId::from("acme-1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_monthly_limit() {
        let dir = directory();
        assert!(dir.within_monthly_limit("acme").await.unwrap());
        assert!(dir.try_consume_quota("acme").await.unwrap());
        assert!(dir.try_consume_quota("acme").await.unwrap());
        assert!(!dir.try_consume_quota("acme").await.unwrap());
        assert!(!dir.within_monthly_limit("acme").await.unwrap());
        assert_eq!(dir.usage("acme"), 2);

        dir.refund_quota("acme").await.unwrap();
        assert_eq!(dir.usage("acme"), 1);
        assert!(dir.within_monthly_limit("acme").await.unwrap());

        dir.reset_usage();
        assert_eq!(dir.usage("acme"), 0);
        assert!(!dir.try_consume_quota("nobody").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_never_exceed_limit() {
        let dir = std::sync::Arc::new(StaticDirectory::from_config(&[TenantConfig {
            id: "acme".to_string(),
            name: None,
            token: "secret".to_string(),
            instances: vec![],
            monthly_limit: Some(50),
        }]));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let dir = dir.clone();
                tokio::spawn(async move { dir.try_consume_quota("acme").await.unwrap() })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 50);
        assert_eq!(dir.usage("acme"), 50);
    }
}
