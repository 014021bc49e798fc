//! Credit grant applications: one attempted application of a grant to a
//! subscription in a specific period.

use crate::idempotency;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// CGA lifecycle state.
///
/// ```text
/// (none) ──create──▶ SCHEDULED ──due──▶ PENDING ──apply──▶ APPLIED
///                                         ▲  │
///                                   retry │  │ failure
///                                         └── FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Scheduled,
    Pending,
    Applied,
    Failed,
}

impl ApplicationStatus {
    /// Transition guard; APPLIED is terminal.
    pub fn can_transition(&self, to: ApplicationStatus) -> bool {
        use ApplicationStatus::*;
        match (*self, to) {
            (Scheduled, Pending) => true,
            (Pending, Applied) | (Pending, Failed) => true,
            (Failed, Pending) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditGrantApplication {
    pub id: Uuid,
    pub grant_id: Uuid,
    pub subscription_id: Uuid,
    pub scheduled_for: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub application_status: ApplicationStatus,
    pub credits_applied: Decimal,
    pub failure_reason: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreditGrantApplication {
    /// Deterministic key for (grant, subscription, period). No wall clock.
    pub fn derive_idempotency_key(
        grant_id: Uuid,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> String {
        idempotency::derive_key(
            "credit_grant_application",
            &[
                &grant_id.to_string(),
                &subscription_id.to_string(),
                &period_start.to_rfc3339(),
                &period_end.to_rfc3339(),
            ],
        )
    }

    /// Whether this application is due for processing at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.application_status.is_terminal() {
            return false;
        }
        match self.application_status {
            ApplicationStatus::Failed => {
                self.next_retry_at.map(|at| at <= now).unwrap_or(false)
            }
            _ => self.scheduled_for <= now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn test_transition_guard() {
        use ApplicationStatus::*;
        assert!(Scheduled.can_transition(Pending));
        assert!(Pending.can_transition(Applied));
        assert!(Pending.can_transition(Failed));
        assert!(Failed.can_transition(Pending));

        // APPLIED is terminal, and no shortcut skips PENDING.
        assert!(!Applied.can_transition(Pending));
        assert!(!Applied.can_transition(Failed));
        assert!(!Scheduled.can_transition(Applied));
        assert!(!Failed.can_transition(Applied));
    }

    #[test]
    fn test_idempotency_key_stability() {
        let grant = Uuid::new_v4();
        let sub = Uuid::new_v4();
        let ps = utc(2024, 3, 1);
        let pe = utc(2024, 4, 1);

        let a = CreditGrantApplication::derive_idempotency_key(grant, sub, ps, pe);
        let b = CreditGrantApplication::derive_idempotency_key(grant, sub, ps, pe);
        assert_eq!(a, b);

        // Different period, different key.
        let c = CreditGrantApplication::derive_idempotency_key(grant, sub, pe, utc(2024, 5, 1));
        assert_ne!(a, c);
    }

    #[test]
    fn test_is_due() {
        let now = utc(2024, 3, 15);
        let mut cga = CreditGrantApplication {
            id: Uuid::new_v4(),
            grant_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            scheduled_for: utc(2024, 3, 1),
            period_start: utc(2024, 3, 1),
            period_end: utc(2024, 4, 1),
            application_status: ApplicationStatus::Scheduled,
            credits_applied: Decimal::ZERO,
            failure_reason: None,
            next_retry_at: None,
            retry_count: 0,
            idempotency_key: "k".into(),
            created_at: utc(2024, 3, 1),
            updated_at: utc(2024, 3, 1),
        };
        assert!(cga.is_due(now));

        cga.scheduled_for = utc(2024, 4, 1);
        assert!(!cga.is_due(now));

        // Failed applications wait for their retry slot.
        cga.application_status = ApplicationStatus::Failed;
        cga.next_retry_at = Some(utc(2024, 3, 16));
        assert!(!cga.is_due(now));
        cga.next_retry_at = Some(utc(2024, 3, 14));
        assert!(cga.is_due(now));

        cga.application_status = ApplicationStatus::Applied;
        assert!(!cga.is_due(now));
    }
}
