//! Status condition bookkeeping. Conditions keep their
//! `lastTransitionTime` across reconciles unless the status flips, so
//! `kubectl describe` shows when something actually changed rather than
//! when the operator last looked.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::chrono::Utc;

pub const READY: &str = "Ready";
pub const CERTIFICATES_READY: &str = "CertificatesReady";
pub const CONFIG_APPLIED: &str = "ConfigApplied";
pub const RESOURCES_RESOLVED: &str = "ResourcesResolved";

pub fn condition(
    type_: &str,
    ok: bool,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> Condition {
    let status = if ok { "True" } else { "False" };
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation,
        last_transition_time: Time(Utc::now()),
    }
}

/// Insert or replace by condition type. An unchanged status keeps the
/// previous transition time.
pub fn upsert(conditions: &mut Vec<Condition>, mut next: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == next.type_) {
        Some(existing) => {
            if existing.status == next.status {
                next.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = next;
        }
        None => conditions.push(next),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::chrono::TimeZone;

    fn fixed(cond: &mut Condition) -> Time {
        let t = Time(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        cond.last_transition_time = t.clone();
        t
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let mut first = condition(READY, true, "PlanApplied", "2 pods", Some(1));
        let stamp = fixed(&mut first);
        let mut conditions = vec![first];

        upsert(&mut conditions, condition(READY, true, "PlanApplied", "3 pods", Some(2)));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, stamp);
        assert_eq!(conditions[0].message, "3 pods");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn flipped_status_bumps_transition_time() {
        let mut first = condition(READY, true, "PlanApplied", "", None);
        let stamp = fixed(&mut first);
        let mut conditions = vec![first];

        upsert(&mut conditions, condition(READY, false, "ApplyFailed", "", None));
        assert_ne!(conditions[0].last_transition_time, stamp);
        assert_eq!(conditions[0].status, "False");
    }

    #[test]
    fn distinct_types_coexist() {
        let mut conditions = vec![];
        upsert(&mut conditions, condition(READY, true, "Ok", "", None));
        upsert(&mut conditions, condition(CONFIG_APPLIED, false, "Pending", "", None));
        assert_eq!(conditions.len(), 2);
    }
}
