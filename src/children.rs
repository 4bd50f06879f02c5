//! Materialization of a Cluster's child objects: headless Service,
//! StatefulSet, collector base ConfigMap, tunnel Service, controller-CA
//! ConfigMap and per-prometheus-output scrape Services. All children carry
//! an owner reference to their Cluster; Kubernetes garbage collection does
//! the bulk of the cleanup on deletion.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::{json, Value};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::certs;
use crate::crd::Cluster;
use crate::plan::ApplyPlan;
use crate::{Error, Result};

pub(crate) const FIELD_MANAGER: &str = "gnmic-operator";

pub const CLUSTER_LABEL: &str = "gnmic.dev/cluster";
pub const COMPONENT_LABEL: &str = "gnmic.dev/component";

const CONFIG_KEY: &str = "config.yaml";
const OPERATOR_CA_PATH_ENV: &str = "GNMIC_TLS_CA";
const OPERATOR_CA_PATH_DEFAULT: &str = "/etc/gnmic-operator/ca/ca.crt";

pub fn config_map_name(cluster: &Cluster) -> String {
    format!("{}-config", cluster.name_any())
}

pub fn controller_ca_name(cluster: &Cluster) -> String {
    format!("{}-controller-ca", cluster.name_any())
}

pub fn tunnel_service_name(cluster: &Cluster) -> String {
    format!("{}-tunnel", cluster.name_any())
}

/// Scrape Service for one prometheus output; `output_key` is
/// `namespace/pipeline/output`.
pub fn prometheus_service_name(cluster: &Cluster, output_key: &str) -> String {
    let mut parts = output_key.splitn(2, '/');
    let _ns = parts.next();
    let rest = parts.next().unwrap_or(output_key).replace('/', "-");
    let mut name = format!("{}-{rest}-prom", cluster.name_any());
    name.truncate(63);
    name.trim_end_matches('-').to_string()
}

pub fn base_labels(cluster: &Cluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "gnmic".to_string()),
        ("app.kubernetes.io/instance".to_string(), cluster.name_any()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "gnmic-operator".to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster.name_any()),
    ])
}

fn owner_refs(cluster: &Cluster) -> Value {
    match cluster.controller_owner_ref(&()) {
        Some(owner) => json!([owner]),
        None => json!([]),
    }
}

async fn apply<K>(api: &Api<K>, name: &str, obj: &K) -> Result<()>
where
    K: Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(obj))
        .await?;
    Ok(())
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            debug!(%name, "deleted child object");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Headless Service giving every pod the stable DNS name the apply loop
/// and SSE streams dial: `<sts>-<i>.<sts>.<ns>.svc.cluster.local`.
pub async fn ensure_headless_service(client: &Client, cluster: &Cluster) -> Result<()> {
    let ns = cluster.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = cluster.sts_name();
    let mut ports = vec![json!({"name": "rest", "port": cluster.rest_port()})];
    if let Some(gnmi) = cluster.spec.api.as_ref().and_then(|a| a.gnmi_port) {
        ports.push(json!({"name": "gnmi", "port": gnmi}));
    }
    let service: Service = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "namespace": ns,
            "labels": base_labels(cluster),
            "ownerReferences": owner_refs(cluster),
        },
        "spec": {
            "clusterIP": "None",
            "publishNotReadyAddresses": true,
            "selector": base_labels(cluster),
            "ports": ports,
        }
    }))
    .map_err(Error::SerializationError)?;
    apply(&Api::namespaced(client.clone(), &ns), &name, &service).await
}

/// LoadBalancer/NodePort Service in front of the gRPC tunnel listeners.
pub async fn ensure_tunnel_service(client: &Client, cluster: &Cluster) -> Result<()> {
    let Some(tunnel) = &cluster.spec.grpc_tunnel else {
        return Ok(());
    };
    let ns = cluster.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = tunnel_service_name(cluster);
    let service: Service = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "namespace": ns,
            "labels": base_labels(cluster),
            "ownerReferences": owner_refs(cluster),
        },
        "spec": {
            "type": tunnel.service_type.clone().unwrap_or_else(|| "ClusterIP".into()),
            "selector": base_labels(cluster),
            "ports": [{"name": "tunnel", "port": tunnel.port}],
        }
    }))
    .map_err(Error::SerializationError)?;
    apply(&Api::namespaced(client.clone(), &ns), &name, &service).await
}

/// The collector's base configuration file: API server listener (with its
/// certificate paths) and, when configured, the tunnel server block.
pub fn collector_config(cluster: &Cluster) -> Result<String> {
    let mut api_server = json!({"address": format!(":{}", cluster.rest_port())});
    if cluster.api_tls().is_some() {
        api_server["tls"] = json!({
            "cert-file": "/etc/gnmic/tls/tls.crt",
            "key-file": "/etc/gnmic/tls/tls.key",
            "ca-file": "/etc/gnmic/controller-ca/ca.crt",
        });
    }
    let mut config = json!({"api-server": api_server});
    if let Some(tunnel) = &cluster.spec.grpc_tunnel {
        let mut tunnel_server = json!({"address": format!(":{}", tunnel.port)});
        if tunnel.tls.is_some() {
            tunnel_server["tls"] = json!({
                "cert-file": "/etc/gnmic/tunnel-tls/tls.crt",
                "key-file": "/etc/gnmic/tunnel-tls/tls.key",
            });
        }
        config["tunnel-server"] = tunnel_server;
    }
    serde_yaml::to_string(&config).map_err(|e| Error::InvalidConfig {
        name: cluster.name_any(),
        reason: e.to_string(),
    })
}

/// Write the base ConfigMap, diffing on content so the StatefulSet is not
/// churned by no-op reconciles.
pub async fn ensure_config_map(client: &Client, cluster: &Cluster) -> Result<()> {
    let ns = cluster.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = config_map_name(cluster);
    let content = collector_config(cluster)?;
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &ns);

    if let Some(existing) = api.get_opt(&name).await? {
        let unchanged = existing
            .data
            .as_ref()
            .and_then(|d| d.get(CONFIG_KEY))
            .map(|c| c == &content)
            .unwrap_or(false);
        if unchanged {
            return Ok(());
        }
        info!(%name, "collector config changed, updating");
    }

    let cm: ConfigMap = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": name,
            "namespace": ns,
            "labels": base_labels(cluster),
            "ownerReferences": owner_refs(cluster),
        },
        "data": {CONFIG_KEY: content}
    }))
    .map_err(Error::SerializationError)?;
    apply(&api, &name, &cm).await
}

/// Sync the operator's own CA into the cluster namespace so collectors can
/// verify the operator's client certificate on apply POSTs.
pub async fn sync_controller_ca(client: &Client, cluster: &Cluster) -> Result<()> {
    if cluster.api_tls().is_none() {
        return Ok(());
    }
    let path = std::env::var(OPERATOR_CA_PATH_ENV).unwrap_or_else(|_| OPERATOR_CA_PATH_DEFAULT.into());
    let ca = match fs::read_to_string(&path).await {
        Ok(ca) => ca,
        Err(e) => {
            warn!(%path, error = %e, "operator CA not readable, skipping controller-ca sync");
            return Ok(());
        }
    };
    let ns = cluster.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = controller_ca_name(cluster);
    let cm: ConfigMap = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": name,
            "namespace": ns,
            "labels": base_labels(cluster),
            "ownerReferences": owner_refs(cluster),
        },
        "data": {"ca.crt": ca}
    }))
    .map_err(Error::SerializationError)?;
    apply(&Api::namespaced(client.clone(), &ns), &name, &cm).await
}

fn tls_volumes(cluster: &Cluster) -> (Vec<Value>, Vec<Value>) {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();

    if let Some(tls) = cluster.api_tls() {
        if tls.use_csi_driver {
            let issuer = tls.issuer_ref.as_ref().map(|i| i.name.clone()).unwrap_or_default();
            let dns = format!(
                "${{POD_NAME}}.{}.${{POD_NAMESPACE}}.svc.cluster.local",
                cluster.sts_name()
            );
            volumes.push(json!({
                "name": "api-tls",
                "csi": {
                    "driver": "csi.cert-manager.io",
                    "readOnly": true,
                    "volumeAttributes": {
                        "csi.cert-manager.io/issuer-name": issuer,
                        "csi.cert-manager.io/dns-names": dns,
                    }
                }
            }));
            mounts.push(json!({"name": "api-tls", "mountPath": "/etc/gnmic/tls", "readOnly": true}));
        } else {
            // all per-pod secrets projected into per-pod directories, the
            // right one picked at mount time via subPathExpr
            let sources: Vec<Value> = (0..cluster.spec.replicas)
                .map(|pod| {
                    let secret = certs::api_cert_name(cluster, pod);
                    let dir = format!("{}-{pod}", cluster.sts_name());
                    json!({
                        "secret": {
                            "name": secret,
                            "optional": true,
                            "items": [
                                {"key": "tls.crt", "path": format!("{dir}/tls.crt")},
                                {"key": "tls.key", "path": format!("{dir}/tls.key")},
                                {"key": "ca.crt", "path": format!("{dir}/ca.crt")},
                            ]
                        }
                    })
                })
                .collect();
            volumes.push(json!({"name": "api-tls", "projected": {"sources": sources}}));
            mounts.push(json!({
                "name": "api-tls",
                "mountPath": "/etc/gnmic/tls",
                "subPathExpr": "$(POD_NAME)",
                "readOnly": true,
            }));
        }
        volumes.push(json!({
            "name": "controller-ca",
            "configMap": {"name": controller_ca_name(cluster), "optional": true}
        }));
        mounts.push(json!({"name": "controller-ca", "mountPath": "/etc/gnmic/controller-ca", "readOnly": true}));
    }

    if cluster
        .spec
        .grpc_tunnel
        .as_ref()
        .and_then(|t| t.tls.as_ref())
        .is_some()
    {
        volumes.push(json!({
            "name": "tunnel-tls",
            "secret": {"secretName": certs::tunnel_cert_name(cluster), "optional": true}
        }));
        mounts.push(json!({"name": "tunnel-tls", "mountPath": "/etc/gnmic/tunnel-tls", "readOnly": true}));
    }

    if cluster.spec.client_tls.is_some() {
        volumes.push(json!({
            "name": "client-tls",
            "secret": {"secretName": certs::client_cert_name(cluster), "optional": true}
        }));
        mounts.push(json!({"name": "client-tls", "mountPath": "/etc/gnmic/client-tls", "readOnly": true}));
    }

    (volumes, mounts)
}

pub async fn ensure_stateful_set(client: &Client, cluster: &Cluster) -> Result<()> {
    let ns = cluster.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = cluster.sts_name();

    let mut ports = vec![json!({"name": "rest", "containerPort": cluster.rest_port()})];
    if let Some(gnmi) = cluster.spec.api.as_ref().and_then(|a| a.gnmi_port) {
        ports.push(json!({"name": "gnmi", "containerPort": gnmi}));
    }
    if let Some(tunnel) = &cluster.spec.grpc_tunnel {
        ports.push(json!({"name": "tunnel", "containerPort": tunnel.port}));
    }

    let mut env = vec![json!({
        "name": "POD_NAME",
        "valueFrom": {"fieldRef": {"fieldPath": "metadata.name"}}
    })];
    for var in &cluster.spec.env {
        env.push(serde_json::to_value(var).map_err(Error::SerializationError)?);
    }

    let (mut volumes, mut mounts) = tls_volumes(cluster);
    volumes.push(json!({"name": "config", "configMap": {"name": config_map_name(cluster)}}));
    mounts.push(json!({"name": "config", "mountPath": "/etc/gnmic/config", "readOnly": true}));

    let resources = match &cluster.spec.resources {
        Some(r) => serde_json::to_value(r).map_err(Error::SerializationError)?,
        None => json!({}),
    };

    let sts: StatefulSet = serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {
            "name": name,
            "namespace": ns,
            "labels": base_labels(cluster),
            "ownerReferences": owner_refs(cluster),
        },
        "spec": {
            "serviceName": name,
            "replicas": cluster.spec.replicas,
            "selector": {"matchLabels": base_labels(cluster)},
            "template": {
                "metadata": {"labels": base_labels(cluster)},
                "spec": {
                    "containers": [{
                        "name": "collector",
                        "image": cluster.spec.image,
                        "args": ["--config", format!("/etc/gnmic/config/{CONFIG_KEY}")],
                        "ports": ports,
                        "env": env,
                        "resources": resources,
                        "volumeMounts": mounts,
                    }],
                    "volumes": volumes,
                }
            }
        }
    }))
    .map_err(Error::SerializationError)?;
    apply(&Api::namespaced(client.clone(), &ns), &name, &sts).await
}

/// Middle segment of an `namespace/pipeline/output` plan key.
fn pipeline_of(output_key: &str) -> Option<&str> {
    output_key.split('/').nth(1)
}

/// One scrape Service per prometheus output in the plan; stale Services
/// from removed outputs are deleted. `pipeline_labels` carries each
/// contributing pipeline's extra labels, stamped onto its Services.
pub async fn ensure_prometheus_services(
    client: &Client,
    cluster: &Cluster,
    plan: &ApplyPlan,
    pipeline_labels: &BTreeMap<String, BTreeMap<String, String>>,
) -> Result<()> {
    let ns = cluster.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api: Api<Service> = Api::namespaced(client.clone(), &ns);

    let mut desired = BTreeMap::new();
    for (output_key, port) in &plan.prometheus_ports {
        desired.insert(
            prometheus_service_name(cluster, output_key),
            (*port, pipeline_of(output_key).unwrap_or_default().to_string()),
        );
    }

    for (name, (port, pipeline)) in &desired {
        let mut labels = base_labels(cluster);
        if let Some(extra) = pipeline_labels.get(pipeline) {
            labels.extend(extra.clone());
        }
        labels.insert(COMPONENT_LABEL.to_string(), "prometheus-output".to_string());
        let service: Service = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": name,
                "namespace": ns,
                "labels": labels,
                "annotations": {
                    "prometheus.io/scrape": "true",
                    "prometheus.io/port": port.to_string(),
                    "prometheus.io/path": "/metrics",
                },
                "ownerReferences": owner_refs(cluster),
            },
            "spec": {
                "selector": base_labels(cluster),
                "ports": [{"name": "metrics", "port": port, "targetPort": port}],
            }
        }))
        .map_err(Error::SerializationError)?;
        apply(&api, name, &service).await?;
    }

    let selector = format!(
        "{CLUSTER_LABEL}={},{COMPONENT_LABEL}=prometheus-output",
        cluster.name_any()
    );
    let existing = api.list(&ListParams::default().labels(&selector)).await?;
    for svc in existing {
        let name = svc.name_any();
        if !desired.contains_key(&name) {
            delete_ignoring_missing(&api, &name).await?;
        }
    }
    Ok(())
}

/// Finalizer-driven teardown. Owner references cover most children; this
/// exists for explicit sequencing and for artifacts that need it.
pub async fn cleanup(client: &Client, cluster: &Cluster) -> Result<()> {
    let ns = cluster.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    let sts: Api<StatefulSet> = Api::namespaced(client.clone(), &ns);
    delete_ignoring_missing(&sts, &cluster.sts_name()).await?;

    let services: Api<Service> = Api::namespaced(client.clone(), &ns);
    delete_ignoring_missing(&services, &cluster.sts_name()).await?;
    delete_ignoring_missing(&services, &tunnel_service_name(cluster)).await?;
    let selector = format!(
        "{CLUSTER_LABEL}={},{COMPONENT_LABEL}=prometheus-output",
        cluster.name_any()
    );
    for svc in services.list(&ListParams::default().labels(&selector)).await? {
        delete_ignoring_missing(&services, &svc.name_any()).await?;
    }

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &ns);
    delete_ignoring_missing(&config_maps, &config_map_name(cluster)).await?;
    delete_ignoring_missing(&config_maps, &controller_ca_name(cluster)).await?;

    certs::cleanup_certificates(client, cluster).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ApiServer, ClusterSpec, GrpcTunnel, IssuerRef, ServerTls};
    use kube::core::ObjectMeta;

    fn cluster() -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some("core".into()),
                namespace: Some("default".into()),
                uid: Some("u-1".into()),
                ..Default::default()
            },
            spec: ClusterSpec {
                image: "gnmic:latest".into(),
                replicas: 2,
                api: Some(ApiServer {
                    rest_port: 7890,
                    gnmi_port: Some(57400),
                    tls: Some(ServerTls {
                        issuer_ref: Some(IssuerRef {
                            name: "ca".into(),
                            kind: "Issuer".into(),
                        }),
                        use_csi_driver: false,
                        ca_bundle_secret: None,
                    }),
                }),
                grpc_tunnel: Some(GrpcTunnel {
                    port: 57401,
                    tls: None,
                    service_type: None,
                }),
                client_tls: None,
                resources: None,
                env: vec![],
            },
            status: None,
        }
    }

    #[test]
    fn collector_config_has_api_and_tunnel_blocks() {
        let yaml = collector_config(&cluster()).unwrap();
        let value: serde_json::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(value["api-server"]["address"], ":7890");
        assert_eq!(value["api-server"]["tls"]["cert-file"], "/etc/gnmic/tls/tls.crt");
        assert_eq!(value["tunnel-server"]["address"], ":57401");
        assert!(value["tunnel-server"].get("tls").is_none());
    }

    #[test]
    fn plaintext_cluster_config_has_no_tls_block() {
        let mut c = cluster();
        c.spec.api = None;
        c.spec.grpc_tunnel = None;
        let yaml = collector_config(&c).unwrap();
        let value: serde_json::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(value["api-server"]["address"], ":7890");
        assert!(value["api-server"].get("tls").is_none());
        assert!(value.get("tunnel-server").is_none());
    }

    #[test]
    fn projected_tls_volume_has_one_source_per_pod() {
        let (volumes, mounts) = tls_volumes(&cluster());
        let api_tls = volumes
            .iter()
            .find(|v| v["name"] == "api-tls")
            .expect("api-tls volume");
        assert_eq!(api_tls["projected"]["sources"].as_array().unwrap().len(), 2);
        assert_eq!(
            api_tls["projected"]["sources"][1]["secret"]["items"][0]["path"],
            "core-1/tls.crt"
        );
        let mount = mounts.iter().find(|m| m["name"] == "api-tls").unwrap();
        assert_eq!(mount["subPathExpr"], "$(POD_NAME)");
    }

    #[test]
    fn prometheus_service_names_are_dns_safe() {
        let c = cluster();
        assert_eq!(
            prometheus_service_name(&c, "default/pipe/o"),
            "core-pipe-o-prom"
        );
        let long = format!("default/{}/{}", "p".repeat(40), "o".repeat(40));
        let name = prometheus_service_name(&c, &long);
        assert!(name.len() <= 63);
        assert!(!name.ends_with('-'));
    }
}
