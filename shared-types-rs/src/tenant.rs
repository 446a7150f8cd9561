use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tenant's subscription plan and its daily request ceiling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantPlan {
    pub name: String,
    pub daily_limit: u64,
}

/// Usage snapshot for one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantStats {
    pub tenant_id: String,
    pub plan: String,
    pub active: bool,
    pub daily_limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub resets_at: DateTime<Utc>,
}
