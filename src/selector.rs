//! Client-side evaluation of `metav1.LabelSelector`, used when matching
//! pipeline selectors against resources during resolution and watch fan-in.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

/// A selector with neither matchLabels nor matchExpressions selects nothing
/// in a pipeline (unlike the Kubernetes list semantics, where it would
/// select everything).
pub fn is_empty(selector: &LabelSelector) -> bool {
    selector
        .match_labels
        .as_ref()
        .map(|m| m.is_empty())
        .unwrap_or(true)
        && selector
            .match_expressions
            .as_ref()
            .map(|e| e.is_empty())
            .unwrap_or(true)
}

/// Evaluate a selector against an object's labels.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    if let Some(exprs) = &selector.match_expressions {
        for expr in exprs {
            let value = labels.get(&expr.key);
            let values = expr.values.as_deref().unwrap_or(&[]);
            let ok = match expr.operator.as_str() {
                "In" => value.map(|v| values.contains(v)).unwrap_or(false),
                "NotIn" => value.map(|v| !values.contains(v)).unwrap_or(true),
                "Exists" => value.is_some(),
                "DoesNotExist" => value.is_none(),
                _ => false,
            };
            if !ok {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn expr(key: &str, op: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: op.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn match_labels_all_must_hold() {
        let sel = LabelSelector {
            match_labels: Some(labels(&[("role", "edge"), ("site", "ams")])),
            match_expressions: None,
        };
        assert!(matches(&sel, &labels(&[("role", "edge"), ("site", "ams"), ("x", "y")])));
        assert!(!matches(&sel, &labels(&[("role", "edge")])));
        assert!(!matches(&sel, &labels(&[("role", "core"), ("site", "ams")])));
    }

    #[test]
    fn match_expressions() {
        let sel = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                expr("role", "In", &["edge", "core"]),
                expr("decommissioned", "DoesNotExist", &[]),
            ]),
        };
        assert!(matches(&sel, &labels(&[("role", "core")])));
        assert!(!matches(&sel, &labels(&[("role", "lab")])));
        assert!(!matches(&sel, &labels(&[("role", "core"), ("decommissioned", "1")])));
    }

    #[test]
    fn not_in_and_exists() {
        let sel = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![expr("site", "NotIn", &["lab"]), expr("site", "Exists", &[])]),
        };
        assert!(matches(&sel, &labels(&[("site", "ams")])));
        assert!(!matches(&sel, &labels(&[("site", "lab")])));
        // NotIn passes on absent keys but Exists does not
        assert!(!matches(&sel, &labels(&[])));
    }

    #[test]
    fn empty_selector_is_flagged_empty() {
        assert!(is_empty(&LabelSelector::default()));
        assert!(is_empty(&LabelSelector {
            match_labels: Some(Default::default()),
            match_expressions: Some(vec![]),
        }));
        assert!(!is_empty(&LabelSelector {
            match_labels: Some(labels(&[("a", "b")])),
            match_expressions: None,
        }));
    }

    #[test]
    fn unknown_operator_never_matches() {
        let sel = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![expr("a", "Gt", &["1"])]),
        };
        assert!(!matches(&sel, &labels(&[("a", "2")])));
    }
}
