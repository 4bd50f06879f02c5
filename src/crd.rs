use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::selector;

pub const GROUP: &str = "gnmic.dev";
pub const VERSION: &str = "v1alpha1";

/// Default REST port of the collector's API server.
pub const DEFAULT_REST_PORT: i32 = 7890;

fn default_image() -> String {
    "ghcr.io/openconfig/gnmic:latest".to_string()
}

fn default_replicas() -> i32 {
    1
}

fn default_rest_port() -> i32 {
    DEFAULT_REST_PORT
}

fn default_tunnel_port() -> i32 {
    57401
}

fn default_true() -> bool {
    true
}

fn default_issuer_kind() -> String {
    "Issuer".to_string()
}

/// `namespace/name` of a namespaced object, the key format used throughout
/// apply plans and caches.
pub fn namespaced_name(obj: &impl ResourceExt) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// A pool of collector pods run as a StatefulSet, fed by the apply plans of
/// the Pipelines that reference it.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "Cluster", group = "gnmic.dev", version = "v1alpha1", namespaced)]
#[kube(status = "ClusterStatus", shortname = "gcl")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    pub api: Option<ApiServer>,
    pub grpc_tunnel: Option<GrpcTunnel>,
    /// Client certificate the collectors present to targets (mTLS).
    pub client_tls: Option<ClientTls>,
    pub resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiServer {
    #[serde(default = "default_rest_port")]
    pub rest_port: i32,
    pub gnmi_port: Option<i32>,
    pub tls: Option<ServerTls>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerTls {
    pub issuer_ref: Option<IssuerRef>,
    /// Mount certificates through the cert-manager CSI driver instead of
    /// per-pod Certificate objects.
    #[serde(default)]
    pub use_csi_driver: bool,
    /// Secret holding an additional CA bundle to trust.
    pub ca_bundle_secret: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    pub name: String,
    #[serde(default = "default_issuer_kind")]
    pub kind: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct GrpcTunnel {
    #[serde(default = "default_tunnel_port")]
    pub port: i32,
    pub tls: Option<ServerTls>,
    pub service_type: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientTls {
    pub issuer_ref: Option<IssuerRef>,
    /// Whether the issued secret carries a `ca.crt` the collector can verify
    /// targets against. When false targets are dialed with `skip-verify`.
    #[serde(default = "default_true")]
    pub ca: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub targets: i32,
    #[serde(default)]
    pub subscriptions: i32,
    #[serde(default)]
    pub outputs: i32,
    #[serde(default)]
    pub inputs: i32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Cluster {
    pub fn rest_port(&self) -> i32 {
        self.spec
            .api
            .as_ref()
            .map(|a| a.rest_port)
            .unwrap_or(DEFAULT_REST_PORT)
    }

    /// TLS is on for the collector API as soon as an issuer is configured.
    pub fn api_tls(&self) -> Option<&ServerTls> {
        self.spec.api.as_ref().and_then(|a| a.tls.as_ref())
    }

    pub fn rest_scheme(&self) -> &'static str {
        if self.api_tls().is_some() {
            "https"
        } else {
            "http"
        }
    }

    /// StatefulSet (and headless Service) name for this cluster.
    pub fn sts_name(&self) -> String {
        self.name_any()
    }

    /// Stable DNS name of pod `index`, `<sts>-<i>.<sts>.<ns>.svc.cluster.local`.
    pub fn pod_host(&self, index: i32) -> String {
        let sts = self.sts_name();
        format!(
            "{sts}-{index}.{sts}.{ns}.svc.cluster.local",
            ns = self.namespace().unwrap_or_default()
        )
    }

    pub fn pod_base_url(&self, index: i32) -> String {
        format!(
            "{}://{}:{}",
            self.rest_scheme(),
            self.pod_host(index),
            self.rest_port()
        )
    }
}

/// Direct references plus label selectors naming resources of one kind.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRefs {
    #[serde(default)]
    pub refs: Vec<String>,
    #[serde(default)]
    pub selectors: Vec<LabelSelector>,
}

impl ResourceRefs {
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty() && self.selectors.iter().all(selector::is_empty)
    }

    /// Does a resource with this name and these labels fall into the set?
    pub fn matches(&self, name: &str, labels: &BTreeMap<String, String>) -> bool {
        self.refs.iter().any(|r| r == name)
            || self
                .selectors
                .iter()
                .any(|s| !selector::is_empty(s) && selector::matches(s, labels))
    }
}

/// Like [`ResourceRefs`] with an attached, ordered processor chain.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedRefs {
    #[serde(default)]
    pub refs: Vec<String>,
    #[serde(default)]
    pub selectors: Vec<LabelSelector>,
    /// Processors to run first, in exactly this order (duplicates allowed).
    #[serde(default)]
    pub processor_refs: Vec<String>,
    #[serde(default)]
    pub processor_selectors: Vec<LabelSelector>,
}

impl ProcessedRefs {
    pub fn matches(&self, name: &str, labels: &BTreeMap<String, String>) -> bool {
        self.refs.iter().any(|r| r == name)
            || self
                .selectors
                .iter()
                .any(|s| !selector::is_empty(s) && selector::matches(s, labels))
    }

    pub fn matches_processor(&self, name: &str, labels: &BTreeMap<String, String>) -> bool {
        self.processor_refs.iter().any(|r| r == name)
            || self
                .processor_selectors
                .iter()
                .any(|s| !selector::is_empty(s) && selector::matches(s, labels))
    }
}

/// Binds a Cluster to the resources it should collect from and publish to.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "Pipeline", group = "gnmic.dev", version = "v1alpha1", namespaced)]
#[kube(status = "PipelineStatus", shortname = "gpl")]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// Name of the Cluster (same namespace) this pipeline feeds.
    pub cluster_ref: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub targets: ResourceRefs,
    #[serde(default)]
    pub tunnel_target_policies: ResourceRefs,
    #[serde(default)]
    pub subscriptions: ResourceRefs,
    #[serde(default)]
    pub outputs: ProcessedRefs,
    #[serde(default)]
    pub inputs: ProcessedRefs,
    /// Extra labels stamped on generated child objects.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub status: Option<String>,
    #[serde(default)]
    pub targets: i32,
    #[serde(default)]
    pub subscriptions: i32,
    #[serde(default)]
    pub outputs: i32,
    #[serde(default)]
    pub inputs: i32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A gNMI device to collect from.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "Target", group = "gnmic.dev", version = "v1alpha1", namespaced)]
#[kube(status = "TargetStatus", shortname = "gtg")]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    /// `host:port` the collector dials.
    pub address: String,
    /// TargetProfile (same namespace) with connection settings.
    pub profile: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    /// Number of clusters currently collecting this target.
    #[serde(default)]
    pub clusters: i32,
    /// Aggregate over all cluster states, `READY` or `DEGRADED`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connection_state: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cluster_states: BTreeMap<String, ClusterTargetState>,
}

/// One collector cluster's view of a target.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTargetState {
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    pub connection_state: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subscriptions: BTreeMap<String, String>,
    pub last_updated: Option<String>,
}

/// Reusable connection settings shared by Targets and tunnel policies.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "TargetProfile", group = "gnmic.dev", version = "v1alpha1", namespaced)]
#[kube(shortname = "gtp")]
#[serde(rename_all = "camelCase")]
pub struct TargetProfileSpec {
    /// Secret with `username`/`password` keys.
    pub credentials_ref: Option<String>,
    pub tls: Option<ProfileTls>,
    pub timeout: Option<String>,
    pub retry_timer: Option<String>,
    pub encoding: Option<String>,
    pub tcp_keepalive: Option<String>,
    pub proxy: Option<String>,
    pub compression: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProfileTls {
    pub server_name: Option<String>,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    #[serde(default)]
    pub cipher_suites: Vec<String>,
}

/// A gNMI subscription request template.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(kind = "Subscription", group = "gnmic.dev", version = "v1alpha1", namespaced)]
#[kube(shortname = "gsub")]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    #[serde(default)]
    pub paths: Vec<String>,
    pub prefix: Option<String>,
    /// `ONCE`, `POLL`, `STREAM` or `STREAM/<SAMPLE|ON_CHANGE|TARGET_DEFINED>`.
    pub mode: Option<String>,
    pub sample_interval: Option<String>,
    pub heartbeat_interval: Option<String>,
    pub suppress_redundant: Option<bool>,
    pub encoding: Option<String>,
    pub qos: Option<i32>,
    pub depth: Option<i32>,
    pub updates_only: Option<bool>,
    pub history: Option<HistoryWindow>,
    #[serde(default)]
    pub stream_subscriptions: Vec<StreamSubscription>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct HistoryWindow {
    pub snapshot: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamSubscription {
    #[serde(default)]
    pub paths: Vec<String>,
    pub stream_mode: Option<String>,
    pub sample_interval: Option<String>,
    pub heartbeat_interval: Option<String>,
    pub suppress_redundant: Option<bool>,
}

/// A sink the collector writes events to. `config` is the collector-native
/// output configuration as an opaque YAML document.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "Output", group = "gnmic.dev", version = "v1alpha1", namespaced)]
#[kube(shortname = "gout")]
#[serde(rename_all = "camelCase")]
pub struct OutputSpec {
    /// `file`, `kafka`, `prometheus`, `prometheus_write`, `nats`,
    /// `jetstream`, `influxdb`, `tcp` or `udp`.
    #[serde(rename = "type")]
    pub output_type: String,
    pub config: Option<String>,
    /// Kubernetes Service to resolve broker/remote addresses from.
    pub service: Option<ServiceResolution>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResolution {
    /// Service name in the Output's namespace.
    #[serde(rename = "ref")]
    pub service_ref: Option<String>,
    pub selector: Option<LabelSelector>,
    /// Restrict to the named service port.
    pub port: Option<String>,
}

/// A stream the collector consumes events from.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "Input", group = "gnmic.dev", version = "v1alpha1", namespaced)]
#[kube(shortname = "gin")]
#[serde(rename_all = "camelCase")]
pub struct InputSpec {
    /// `kafka`, `nats` or `jetstream`.
    #[serde(rename = "type")]
    pub input_type: String,
    pub config: Option<String>,
}

/// An event processor attachable to outputs and inputs.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "Processor", group = "gnmic.dev", version = "v1alpha1", namespaced)]
#[kube(shortname = "gproc")]
#[serde(rename_all = "camelCase")]
pub struct ProcessorSpec {
    /// `event-*` processor type.
    #[serde(rename = "type")]
    pub processor_type: String,
    pub config: Option<String>,
}

/// Connection settings for targets that dial in over the gRPC tunnel,
/// matched by tunnel type/id regex.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "TunnelTargetPolicy", group = "gnmic.dev", version = "v1alpha1", namespaced)]
#[kube(shortname = "gttp")]
#[serde(rename_all = "camelCase")]
pub struct TunnelTargetPolicySpec {
    #[serde(rename = "match")]
    pub tunnel_match: TunnelMatch,
    /// TargetProfile (same namespace) applied to matched tunnel targets.
    pub profile: String,
}

/// Regexes are validated by the admission webhook, not re-checked here.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct TunnelMatch {
    #[serde(rename = "type")]
    pub target_type: Option<String>,
    pub id: Option<String>,
}
