//! Minimal typed views of the cert-manager.io resources the operator
//! consumes. These CRDs are installed by cert-manager itself; only the
//! fields the operator touches are modeled.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "cert-manager.io", version = "v1", kind = "Certificate", namespaced)]
#[kube(status = "CertificateStatus")]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub secret_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    pub issuer_ref: CertificateIssuerRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertificateIssuerRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    #[serde(default)]
    pub conditions: Vec<CertificateCondition>,
}

/// cert-manager's condition shape predates `metav1.Condition`.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertificateCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Certificate {
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.condition_type == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
    }

    /// A permanently failed issuance; surfaced as `CertificatesReady=False`
    /// rather than retried tightly.
    pub fn is_failed(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.condition_type == "Issuing" && c.status == "False")
            })
            .unwrap_or(false)
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "cert-manager.io", version = "v1", kind = "Issuer", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<CaIssuer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_signed: Option<SelfSignedIssuer>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CaIssuer {
    pub secret_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct SelfSignedIssuer {}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_conditions(conditions: Vec<CertificateCondition>) -> Certificate {
        Certificate {
            metadata: Default::default(),
            spec: CertificateSpec {
                secret_name: "s".into(),
                common_name: None,
                dns_names: vec![],
                issuer_ref: CertificateIssuerRef {
                    name: "ca".into(),
                    kind: None,
                    group: None,
                },
                duration: None,
                usages: vec![],
            },
            status: Some(CertificateStatus { conditions }),
        }
    }

    #[test]
    fn readiness_follows_the_ready_condition() {
        let ready = with_conditions(vec![CertificateCondition {
            condition_type: "Ready".into(),
            status: "True".into(),
            reason: None,
            message: None,
        }]);
        assert!(ready.is_ready());

        let pending = with_conditions(vec![CertificateCondition {
            condition_type: "Ready".into(),
            status: "False".into(),
            reason: Some("Pending".into()),
            message: None,
        }]);
        assert!(!pending.is_ready());
        assert!(!with_conditions(vec![]).is_ready());
    }
}
