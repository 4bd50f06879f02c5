//! cert-manager Certificate materialization for a cluster: per-pod API
//! server certificates, the tunnel server certificate, and the shared
//! collector→target client certificate.

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, warn};

use crate::cert_manager::{Certificate, CertificateIssuerRef, CertificateSpec, Issuer};
use crate::children::FIELD_MANAGER;
use crate::crd::{Cluster, IssuerRef};
use crate::Result;

pub fn api_cert_name(cluster: &Cluster, pod: i32) -> String {
    format!("{}-tls-{pod}", cluster.name_any())
}

pub fn tunnel_cert_name(cluster: &Cluster) -> String {
    format!("{}-tunnel-tls", cluster.name_any())
}

pub fn client_cert_name(cluster: &Cluster) -> String {
    format!("{}-client-tls", cluster.name_any())
}

/// Aggregate issuance state for everything `desired_certificates` returns.
#[derive(Debug, Default)]
pub struct CertificateHealth {
    pub ready: bool,
    pub failed: Vec<String>,
}

fn certificate(
    cluster: &Cluster,
    name: String,
    issuer: &IssuerRef,
    dns_names: Vec<String>,
    common_name: Option<String>,
    usages: Vec<String>,
) -> Certificate {
    let mut cert = Certificate::new(
        &name,
        CertificateSpec {
            secret_name: name.clone(),
            common_name,
            dns_names,
            issuer_ref: CertificateIssuerRef {
                name: issuer.name.clone(),
                kind: Some(issuer.kind.clone()),
                group: Some("cert-manager.io".into()),
            },
            duration: None,
            usages,
        },
    );
    cert.metadata.namespace = cluster.namespace();
    cert.metadata.owner_references = cluster.controller_owner_ref(&()).map(|o| vec![o]);
    cert
}

/// Every Certificate this cluster needs. Per-pod API certificates are
/// skipped in CSI mode, where the driver issues them at mount time.
pub fn desired_certificates(cluster: &Cluster) -> Vec<Certificate> {
    let mut certs = Vec::new();
    let server_usages = vec!["server auth".to_string()];

    if let Some(tls) = cluster.api_tls() {
        if !tls.use_csi_driver {
            if let Some(issuer) = &tls.issuer_ref {
                for pod in 0..cluster.spec.replicas {
                    certs.push(certificate(
                        cluster,
                        api_cert_name(cluster, pod),
                        issuer,
                        vec![cluster.pod_host(pod)],
                        None,
                        server_usages.clone(),
                    ));
                }
            }
        }
    }

    if let Some(tunnel) = &cluster.spec.grpc_tunnel {
        if let Some(issuer) = tunnel.tls.as_ref().and_then(|t| t.issuer_ref.as_ref()) {
            let svc = crate::children::tunnel_service_name(cluster);
            let ns = cluster.namespace().unwrap_or_default();
            certs.push(certificate(
                cluster,
                tunnel_cert_name(cluster),
                issuer,
                vec![format!("{svc}.{ns}.svc.cluster.local"), svc],
                None,
                server_usages,
            ));
        }
    }

    if let Some(issuer) = cluster
        .spec
        .client_tls
        .as_ref()
        .and_then(|c| c.issuer_ref.as_ref())
    {
        certs.push(certificate(
            cluster,
            client_cert_name(cluster),
            issuer,
            vec![],
            Some(cluster.name_any()),
            vec!["client auth".into()],
        ));
    }
    certs
}

/// Apply the desired Certificates and report their issuance state.
pub async fn ensure_certificates(client: &Client, cluster: &Cluster) -> Result<CertificateHealth> {
    let ns = cluster.namespace().unwrap_or_default();
    let api: Api<Certificate> = Api::namespaced(client.clone(), &ns);
    let params = PatchParams::apply(FIELD_MANAGER).force();

    let desired = desired_certificates(cluster);
    let mut health = CertificateHealth {
        ready: true,
        failed: Vec::new(),
    };
    for cert in &desired {
        let name = cert.name_any();
        api.patch(&name, &params, &Patch::Apply(cert)).await?;
        match api.get_opt(&name).await? {
            Some(live) if live.is_ready() => {}
            Some(live) => {
                health.ready = false;
                if live.is_failed() {
                    health.failed.push(name);
                }
            }
            None => health.ready = false,
        }
    }
    Ok(health)
}

/// Remove every Certificate the cluster could have created, including
/// per-pod certificates from before a scale-down.
pub async fn cleanup_certificates(client: &Client, cluster: &Cluster) -> Result<()> {
    let ns = cluster.namespace().unwrap_or_default();
    let api: Api<Certificate> = Api::namespaced(client.clone(), &ns);
    let mut names: Vec<String> = (0..cluster.spec.replicas)
        .map(|pod| api_cert_name(cluster, pod))
        .collect();
    names.push(tunnel_cert_name(cluster));
    names.push(client_cert_name(cluster));
    for name in names {
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => debug!(%name, "deleted certificate"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => warn!(%name, error = %e, "failed to delete certificate"),
        }
    }
    Ok(())
}

/// TLS material for dialing a TLS-enabled cluster's pods: the operator's
/// own client identity plus the roots that verify pod certificates (the
/// API issuer's CA and any configured bundle secret).
pub async fn pod_tls_material(
    client: &Client,
    cluster: &Cluster,
) -> Result<Option<crate::collector::TlsMaterial>> {
    let Some(tls) = cluster.api_tls() else {
        return Ok(None);
    };
    let ns = cluster.namespace().unwrap_or_default();
    let mut roots = Vec::new();
    if let Some(issuer) = &tls.issuer_ref {
        if let Some(ca) = issuer_ca(client, &ns, issuer).await? {
            roots.push(ca);
        }
    }
    if let Some(bundle) = &tls.ca_bundle_secret {
        let secrets: Api<Secret> = Api::namespaced(client.clone(), &ns);
        if let Some(secret) = secrets.get_opt(bundle).await? {
            if let Some(ca) = secret.data.unwrap_or_default().get("ca.crt") {
                roots.push(ca.0.clone());
            }
        }
    }
    Ok(Some(crate::collector::TlsMaterial::load(roots).await?))
}

/// PEM of the CA backing a cert-manager Issuer, used to verify collector
/// pod certificates on apply POSTs and SSE connections.
pub async fn issuer_ca(client: &Client, namespace: &str, issuer: &IssuerRef) -> Result<Option<Vec<u8>>> {
    if issuer.kind != "Issuer" {
        debug!(kind = %issuer.kind, "only namespaced Issuers are introspected for a CA");
        return Ok(None);
    }
    let issuers: Api<Issuer> = Api::namespaced(client.clone(), namespace);
    let Some(found) = issuers.get_opt(&issuer.name).await? else {
        return Ok(None);
    };
    let Some(secret_name) = found.spec.ca.as_ref().map(|ca| ca.secret_name.clone()) else {
        return Ok(None);
    };
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let Some(secret) = secrets.get_opt(&secret_name).await? else {
        return Ok(None);
    };
    let data = secret.data.unwrap_or_default();
    Ok(data
        .get("ca.crt")
        .or_else(|| data.get("tls.crt"))
        .map(|b| b.0.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ApiServer, ClusterSpec, ServerTls};
    use kube::core::ObjectMeta;

    fn cluster(replicas: i32, csi: bool) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some("core".into()),
                namespace: Some("default".into()),
                uid: Some("u-1".into()),
                ..Default::default()
            },
            spec: ClusterSpec {
                image: "gnmic".into(),
                replicas,
                api: Some(ApiServer {
                    rest_port: 7890,
                    gnmi_port: None,
                    tls: Some(ServerTls {
                        issuer_ref: Some(IssuerRef {
                            name: "ca".into(),
                            kind: "Issuer".into(),
                        }),
                        use_csi_driver: csi,
                        ca_bundle_secret: None,
                    }),
                }),
                grpc_tunnel: None,
                client_tls: None,
                resources: None,
                env: vec![],
            },
            status: None,
        }
    }

    #[test]
    fn one_server_certificate_per_pod() {
        let certs = desired_certificates(&cluster(3, false));
        let names: Vec<String> = certs.iter().map(|c| c.name_any()).collect();
        assert_eq!(names, vec!["core-tls-0", "core-tls-1", "core-tls-2"]);
        assert_eq!(
            certs[1].spec.dns_names,
            vec!["core-1.core.default.svc.cluster.local"]
        );
    }

    #[test]
    fn csi_mode_skips_per_pod_certificates() {
        assert!(desired_certificates(&cluster(3, true)).is_empty());
    }

    #[test]
    fn client_certificate_has_client_auth_usage() {
        let mut c = cluster(1, true);
        c.spec.client_tls = Some(crate::crd::ClientTls {
            issuer_ref: Some(IssuerRef {
                name: "ca".into(),
                kind: "Issuer".into(),
            }),
            ca: true,
        });
        let certs = desired_certificates(&c);
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].name_any(), "core-client-tls");
        assert_eq!(certs[0].spec.usages, vec!["client auth"]);
    }
}
