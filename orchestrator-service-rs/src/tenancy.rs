//! Tenant registry and daily quotas.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Days, TimeZone, Utc};
use config_rs::TenancyConfig;
use dashmap::DashMap;
use error_handling::{Error, Result};
use shared_types::{TenantPlan, TenantStats};
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct TenantRecord {
    plan: TenantPlan,
    active: bool,
    used: u64,
    resets_at: DateTime<Utc>,
}

impl TenantRecord {
    fn new(plan: TenantPlan, now: DateTime<Utc>) -> Self {
        Self {
            plan,
            active: true,
            used: 0,
            resets_at: next_midnight(now),
        }
    }

    fn roll_over(&mut self, now: DateTime<Utc>) {
        if now >= self.resets_at {
            self.used = 0;
            self.resets_at = next_midnight(now);
        }
    }

    fn stats(&self, tenant_id: &str) -> TenantStats {
        TenantStats {
            tenant_id: tenant_id.to_string(),
            plan: self.plan.name.clone(),
            active: self.active,
            daily_limit: self.plan.daily_limit,
            used: self.used,
            remaining: self.plan.daily_limit.saturating_sub(self.used),
            resets_at: self.resets_at,
        }
    }
}

fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .unwrap_or(now)
}

pub struct TenantRegistry {
    plans: HashMap<String, u64>,
    default_plan: String,
    allow_unknown: bool,
    tenants: DashMap<String, TenantRecord>,
}

impl TenantRegistry {
    pub fn new(config: &TenancyConfig) -> Self {
        Self {
            plans: config.plans.clone(),
            default_plan: config.default_plan.clone(),
            allow_unknown: config.allow_unknown_tenants,
            tenants: DashMap::new(),
        }
    }

    fn plan(&self, name: &str) -> Result<TenantPlan> {
        self.plans
            .get(name)
            .map(|limit| TenantPlan {
                name: name.to_string(),
                daily_limit: *limit,
            })
            .ok_or_else(|| Error::invalid_request(format!("unknown plan '{}'", name)))
    }

    /// Registers a tenant, or moves an existing one to another plan
    pub fn register(&self, tenant_id: &str, plan: &str) -> Result<TenantStats> {
        let plan = self.plan(plan)?;
        let now = Utc::now();
        let mut record = self
            .tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantRecord::new(plan.clone(), now));
        record.plan = plan;
        info!(tenant = %tenant_id, plan = %record.plan.name, "Tenant registered");
        Ok(record.stats(tenant_id))
    }

    /// Counts one request against the tenant's daily ceiling
    pub fn check_and_consume(&self, tenant_id: &str) -> Result<TenantStats> {
        self.check_and_consume_at(tenant_id, Utc::now())
    }

    /// Rejects unknown (when not auto-provisioned) and inactive tenants without consuming quota
    pub fn ensure_active(&self, tenant_id: &str) -> Result<()> {
        self.provision(tenant_id, Utc::now())?;
        match self.tenants.get(tenant_id) {
            Some(record) if !record.active => Err(Error::invalid_request(format!("tenant '{}' is inactive", tenant_id))),
            _ => Ok(()),
        }
    }

    fn provision(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<()> {
        if !self.tenants.contains_key(tenant_id) {
            if !self.allow_unknown {
                return Err(Error::invalid_request(format!("unknown tenant '{}'", tenant_id)));
            }
            let plan = self.plan(&self.default_plan)?;
            self.tenants
                .entry(tenant_id.to_string())
                .or_insert_with(|| TenantRecord::new(plan, now));
        }
        Ok(())
    }

    pub fn check_and_consume_at(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<TenantStats> {
        self.provision(tenant_id, now)?;

        let mut record = self
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| Error::internal(format!("tenant '{}' vanished during admission", tenant_id)))?;

        if !record.active {
            return Err(Error::invalid_request(format!("tenant '{}' is inactive", tenant_id)));
        }

        record.roll_over(now);
        if record.used >= record.plan.daily_limit {
            let retry_after = (record.resets_at - now).to_std().unwrap_or(Duration::ZERO);
            warn!(
                tenant = %tenant_id,
                plan = %record.plan.name,
                limit = record.plan.daily_limit,
                "Daily quota exhausted"
            );
            return Err(Error::RateLimitExceeded {
                scope: format!("tenant:{}", tenant_id),
                tier: "daily-quota".to_string(),
                retry_after,
            });
        }

        record.used += 1;
        Ok(record.stats(tenant_id))
    }

    pub fn stats(&self, tenant_id: &str) -> Option<TenantStats> {
        self.tenants.get_mut(tenant_id).map(|mut record| {
            record.roll_over(Utc::now());
            record.stats(tenant_id)
        })
    }

    pub fn set_active(&self, tenant_id: &str, active: bool) -> Result<TenantStats> {
        let mut record = self
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| Error::invalid_request(format!("unknown tenant '{}'", tenant_id)))?;
        record.active = active;
        info!(tenant = %tenant_id, active, "Tenant activation changed");
        Ok(record.stats(tenant_id))
    }

    pub fn reset_usage(&self, tenant_id: &str) -> Result<TenantStats> {
        let mut record = self
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| Error::invalid_request(format!("unknown tenant '{}'", tenant_id)))?;
        record.used = 0;
        info!(tenant = %tenant_id, "Tenant usage reset");
        Ok(record.stats(tenant_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(allow_unknown: bool) -> TenantRegistry {
        let mut config = TenancyConfig::default();
        config.plans.insert("tiny".to_string(), 2);
        config.allow_unknown_tenants = allow_unknown;
        TenantRegistry::new(&config)
    }

    #[test]
    fn test_quota_ceiling_is_never_exceeded() {
        let tenants = registry(true);
        tenants.register("acme", "tiny").unwrap();

        assert_eq!(tenants.check_and_consume("acme").unwrap().remaining, 1);
        assert_eq!(tenants.check_and_consume("acme").unwrap().remaining, 0);

        let err = tenants.check_and_consume("acme").unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded { ref tier, .. } if tier == "daily-quota"));
        assert_eq!(tenants.stats("acme").unwrap().used, 2);
    }

    #[test]
    fn test_quota_resets_at_utc_midnight() {
        let mut config = TenancyConfig::default();
        config.plans.insert("tiny".to_string(), 2);
        config.default_plan = "tiny".to_string();
        let tenants = TenantRegistry::new(&config);

        let evening = Utc.with_ymd_and_hms(2026, 3, 1, 23, 0, 0).unwrap();
        tenants.check_and_consume_at("acme", evening).unwrap();
        tenants.check_and_consume_at("acme", evening).unwrap();

        let err = tenants.check_and_consume_at("acme", evening).unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3600)));

        let after_midnight = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 1).unwrap();
        let stats = tenants.check_and_consume_at("acme", after_midnight).unwrap();
        assert_eq!(stats.used, 1);
        assert_eq!(stats.resets_at, Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_unknown_and_inactive_tenants() {
        let open = registry(true);
        let stats = open.check_and_consume("newcorp").unwrap();
        assert_eq!(stats.plan, "free");
        assert_eq!(stats.daily_limit, 100);

        let closed = registry(false);
        assert!(matches!(
            closed.check_and_consume("newcorp"),
            Err(Error::InvalidRequest { .. })
        ));

        open.set_active("newcorp", false).unwrap();
        assert!(matches!(
            open.check_and_consume("newcorp"),
            Err(Error::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_reset_usage() {
        let tenants = registry(true);
        tenants.register("acme", "tiny").unwrap();
        tenants.check_and_consume("acme").unwrap();
        tenants.check_and_consume("acme").unwrap();
        assert!(tenants.check_and_consume("acme").is_err());

        assert_eq!(tenants.reset_usage("acme").unwrap().used, 0);
        assert!(tenants.check_and_consume("acme").is_ok());
        assert!(tenants.reset_usage("ghost").is_err());
    }
}
