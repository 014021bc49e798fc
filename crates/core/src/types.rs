//! Shared primitives used across the billing core: tenancy, environments,
//! property filters, and raw usage events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A tenant owning catalog data and customers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A user belonging to a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// Isolated data environment within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    Development,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub kind: EnvironmentKind,
    pub name: String,
}

/// A billable customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    /// Caller-supplied identifier, unique per tenant.
    pub external_id: String,
    pub name: String,
    pub email: String,
    pub tenant_id: Uuid,
    pub environment_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// One key with its admissible values. An empty value list means the key is
/// unconstrained. Meters carry an ordered list of these groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub key: String,
    pub values: Vec<String>,
}

impl FilterGroup {
    /// Whether the given property value satisfies this group.
    pub fn matches(&self, value: Option<&str>) -> bool {
        if self.values.is_empty() {
            return true;
        }
        match value {
            Some(v) => self.values.iter().any(|allowed| allowed == v),
            None => false,
        }
    }
}

/// A raw metered usage event as ingested upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: String,
    pub event_name: String,
    pub external_customer_id: String,
    pub properties: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    /// Fetch a property as a string, if present and string-typed.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    /// Fetch a numeric property. Accepts JSON numbers and numeric strings.
    pub fn property_number(&self, key: &str) -> Option<f64> {
        match self.properties.get(key) {
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }
}
