//! The Cluster reconciler: materializes child objects, resolves and
//! aggregates enabled pipelines into an apply plan, distributes the plan
//! across ready pods, and reflects the outcome into Cluster and Pipeline
//! status. Also home to the fan-in mapping that turns changes of any
//! referenced resource into Cluster reconcile requests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::chrono::Utc;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType};
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::reflector::ObjectRef;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, field, info, instrument, warn, Span};

use crate::children::{self, FIELD_MANAGER};
use crate::collector::CollectorClient;
use crate::conditions;
use crate::crd::{
    namespaced_name, Cluster, ClusterStatus, Input, Output, Pipeline, Processor,
    ServiceResolution, Subscription, Target, TargetProfile, TunnelTargetPolicy,
};
use crate::operator::Context;
use crate::plan::{self, ApplyPlan, PipelineData};
use crate::resolver::Resolver;
use crate::translate::Credentials;
use crate::{certs, distribute, pipeline, selector, target_state, telemetry};
use crate::{Error, Result};

pub static CLUSTER_FINALIZER: &str = "clusters.gnmic.dev";

const CREDENTIALS_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEUE_IDLE: Duration = Duration::from_secs(5 * 60);
const REQUEUE_WAITING: Duration = Duration::from_secs(10);

#[instrument(skip(cluster, ctx), fields(trace_id, cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    Span::current().record("trace_id", field::display(&telemetry::get_trace_id()));
    let start = Instant::now();
    ctx.metrics.reconciliations.with_label_values(&["cluster"]).inc();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &ns);
    let action = finalizer(&api, CLUSTER_FINALIZER, cluster.clone(), |event| async {
        match event {
            Finalizer::Apply(c) => c.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(c) => c.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)));

    ctx.metrics
        .reconcile_duration
        .with_label_values(&["cluster"])
        .observe(start.elapsed().as_secs_f64());
    info!("Reconciled Cluster \"{}\" in {}", cluster.name_any(), ns);
    action
}

pub fn error_policy(_cluster: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {error:?}");
    ctx.metrics
        .failures
        .with_label_values(&["cluster", error.metric_label()])
        .inc();
    Action::requeue(Duration::from_secs(15))
}

enum Resolution {
    Resolved(Box<ResolvedPipeline>),
    MissingTunnel,
}

struct ResolvedPipeline {
    pipeline: Pipeline,
    data: PipelineData,
    /// Direct refs that did not resolve, for `ResourcesResolved`.
    missing: Vec<String>,
}

impl Cluster {
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let client = ctx.client.clone();
        let ns = self
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let name = self.name_any();

        children::ensure_headless_service(&client, self).await?;

        let tls_configured = self.api_tls().is_some()
            || self
                .spec
                .grpc_tunnel
                .as_ref()
                .and_then(|t| t.tls.as_ref())
                .is_some()
            || self.spec.client_tls.is_some();
        if tls_configured {
            let health = certs::ensure_certificates(&client, self).await?;
            if !health.ready {
                let (reason, message) = if health.failed.is_empty() {
                    ("Pending".to_string(), "certificates not yet issued".to_string())
                } else {
                    ("IssuanceFailed".to_string(), format!("failed certificates: {}", health.failed.join(", ")))
                };
                self.write_status(&ctx, |status| {
                    conditions::upsert(
                        &mut status.conditions,
                        conditions::condition(
                            conditions::CERTIFICATES_READY,
                            false,
                            &reason,
                            &message,
                            self.metadata.generation,
                        ),
                    );
                })
                .await?;
                // a permanently failed issuance is not going to fix itself
                // in ten seconds
                let delay = if health.failed.is_empty() {
                    REQUEUE_WAITING
                } else {
                    REQUEUE_IDLE
                };
                return Ok(Action::requeue(delay));
            }
            children::sync_controller_ca(&client, self).await?;
        }

        children::ensure_tunnel_service(&client, self).await?;
        children::ensure_config_map(&client, self).await?;
        children::ensure_stateful_set(&client, self).await?;

        // every enabled pipeline pointing at this cluster contributes
        let pipelines_api: Api<Pipeline> = Api::namespaced(client.clone(), &ns);
        let mut resolved: Vec<ResolvedPipeline> = Vec::new();
        for pipe in pipelines_api.list(&ListParams::default()).await? {
            if !pipe.spec.enabled || pipe.spec.cluster_ref != name {
                continue;
            }
            match self.resolve_pipeline(&ctx, &pipe).await? {
                Resolution::Resolved(r) => resolved.push(*r),
                Resolution::MissingTunnel => {
                    warn!(pipeline = %pipe.name_any(), "pipeline has tunnel policies but cluster has no grpcTunnel");
                    pipeline::update_status(&client, &ns, &pipe.name_any(), |p, status| {
                        status.status = Some("Error: ClusterMissingTunnel".to_string());
                        conditions::upsert(
                            &mut status.conditions,
                            conditions::condition(
                                conditions::READY,
                                false,
                                "ClusterMissingTunnel",
                                "pipeline references tunnel target policies but the cluster has no grpcTunnel block",
                                p.metadata.generation,
                            ),
                        );
                    })
                    .await?;
                }
            }
        }

        let datas: Vec<PipelineData> = resolved.iter().map(|r| r.data.clone()).collect();
        let built = plan::build(&datas, self.spec.client_tls.as_ref());
        let plan = match built {
            Ok(plan) => plan,
            Err(e @ (Error::InvalidConfig { .. } | Error::PortPoolExhausted { .. })) => {
                warn!(error = %e, "plan build rejected");
                self.write_status(&ctx, |status| {
                    conditions::upsert(
                        &mut status.conditions,
                        conditions::condition(
                            conditions::READY,
                            false,
                            "InvalidConfiguration",
                            &e.to_string(),
                            self.metadata.generation,
                        ),
                    );
                })
                .await?;
                return Ok(Action::requeue(REQUEUE_IDLE));
            }
            Err(e) => return Err(e),
        };

        // publish atomically for the inspection endpoint
        ctx.plans
            .write()
            .await
            .insert(namespaced_name(self), Arc::new(plan.clone()));

        let pipeline_labels: BTreeMap<String, BTreeMap<String, String>> = resolved
            .iter()
            .map(|r| (r.data.name.clone(), r.pipeline.spec.labels.clone()))
            .collect();
        children::ensure_prometheus_services(&client, self, &plan, &pipeline_labels).await?;

        let sts_api: Api<StatefulSet> = Api::namespaced(client.clone(), &ns);
        let ready_replicas = sts_api
            .get_opt(&self.sts_name())
            .await?
            .and_then(|s| s.status)
            .map(|s| s.ready_replicas.unwrap_or(0))
            .unwrap_or(0);

        if ready_replicas == 0 {
            self.write_status(&ctx, |status| {
                apply_counts(status, &plan, 0);
                let generation = self.metadata.generation;
                conditions::upsert(
                    &mut status.conditions,
                    conditions::condition(conditions::READY, false, "NoReadyPods", "no collector pods are ready", generation),
                );
                if tls_configured {
                    conditions::upsert(
                        &mut status.conditions,
                        conditions::condition(conditions::CERTIFICATES_READY, true, "Issued", "", generation),
                    );
                }
            })
            .await?;
            return Ok(Action::requeue(Duration::from_secs(15)));
        }

        // fan the plan out, one share per ready pod
        let tls_material = certs::pod_tls_material(&client, self).await?;
        let mut failures = Vec::new();
        for pod in 0..ready_replicas {
            let share = distribute::distribute(&plan, pod, ready_replicas);
            ctx.metrics.applies.inc();
            let outcome = match CollectorClient::new(&self.pod_base_url(pod), tls_material.as_ref()) {
                Ok(collector) => collector.apply(&share).await,
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                ctx.metrics.apply_failures.inc();
                warn!(pod, error = %e, "config apply failed");
                failures.push(format!("pod {pod}: {e}"));
            } else {
                debug!(pod, targets = share.targets.len(), "config applied");
            }
        }

        if !failures.is_empty() {
            let recorder = ctx.diagnostics.read().await.recorder(client.clone());
            recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "ApplyFailed".into(),
                        note: Some(failures.join("; ")),
                        action: "Applying".into(),
                        secondary: None,
                    },
                    &self.object_ref(&()),
                )
                .await
                .map_err(Error::KubeError)?;
        }

        let generation = self.metadata.generation;
        let applied = failures.is_empty();
        let failure_note = failures.join("; ");
        self.write_status(&ctx, |status| {
            apply_counts(status, &plan, ready_replicas);
            conditions::upsert(
                &mut status.conditions,
                conditions::condition(
                    conditions::READY,
                    applied,
                    if applied { "Reconciled" } else { "ApplyFailed" },
                    "",
                    generation,
                ),
            );
            conditions::upsert(
                &mut status.conditions,
                conditions::condition(
                    conditions::CONFIG_APPLIED,
                    applied,
                    if applied { "Applied" } else { "ApplyFailed" },
                    &failure_note,
                    generation,
                ),
            );
            if tls_configured {
                conditions::upsert(
                    &mut status.conditions,
                    conditions::condition(conditions::CERTIFICATES_READY, true, "Issued", "", generation),
                );
            }
        })
        .await?;

        for r in &resolved {
            write_pipeline_status(&client, &ns, r).await?;
        }

        if applied {
            Ok(Action::requeue(REQUEUE_IDLE))
        } else {
            Ok(Action::requeue(Duration::from_secs(30)))
        }
    }

    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let ns = self
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let name = self.name_any();
        info!(cluster = %name, "cleaning up cluster");

        target_state::teardown_cluster(&ctx, &ns, &name).await?;
        children::cleanup(&ctx.client, self).await?;
        ctx.plans.write().await.remove(&namespaced_name(self));

        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
        recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: "DeleteCluster".into(),
                    note: Some(format!("Delete `{name}`")),
                    action: "Reconciling".into(),
                    secondary: None,
                },
                &self.object_ref(&()),
            )
            .await
            .map_err(Error::KubeError)?;
        Ok(Action::await_change())
    }

    async fn resolve_pipeline(&self, ctx: &Context, pipe: &Pipeline) -> Result<Resolution> {
        let ns = pipe
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let spec = &pipe.spec;

        if !spec.tunnel_target_policies.is_empty() && self.spec.grpc_tunnel.is_none() {
            return Ok(Resolution::MissingTunnel);
        }

        let resolver = Resolver::new(ctx.client.clone(), &ns);
        let targets: Vec<Target> = resolver
            .resolve(&spec.targets.refs, &spec.targets.selectors)
            .await?;
        let tunnel_policies: Vec<TunnelTargetPolicy> = resolver
            .resolve(
                &spec.tunnel_target_policies.refs,
                &spec.tunnel_target_policies.selectors,
            )
            .await?;
        let subscriptions: Vec<Subscription> = resolver
            .resolve(&spec.subscriptions.refs, &spec.subscriptions.selectors)
            .await?;
        let outputs: Vec<Output> = resolver
            .resolve(&spec.outputs.refs, &spec.outputs.selectors)
            .await?;
        let inputs: Vec<Input> = resolver
            .resolve(&spec.inputs.refs, &spec.inputs.selectors)
            .await?;
        let output_processors: Vec<Processor> = resolver
            .resolve_processors(&spec.outputs.processor_refs, &spec.outputs.processor_selectors)
            .await?;
        let input_processors: Vec<Processor> = resolver
            .resolve_processors(&spec.inputs.processor_refs, &spec.inputs.processor_selectors)
            .await?;

        // profiles referenced by targets and tunnel policies, same namespace
        let profile_api: Api<TargetProfile> = Api::namespaced(ctx.client.clone(), &ns);
        let wanted: BTreeSet<String> = targets
            .iter()
            .map(|t| t.spec.profile.clone())
            .chain(tunnel_policies.iter().map(|p| p.spec.profile.clone()))
            .collect();
        let mut profiles = BTreeMap::new();
        for profile_name in wanted {
            match profile_api.get_opt(&profile_name).await? {
                Some(profile) => {
                    profiles.insert(profile_name, profile);
                }
                None => debug!(profile = %profile_name, "profile not found"),
            }
        }

        let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
        let mut credentials = BTreeMap::new();
        for profile in profiles.values() {
            let Some(secret_name) = &profile.spec.credentials_ref else {
                continue;
            };
            if credentials.contains_key(secret_name) {
                continue;
            }
            let fetched = tokio::time::timeout(CREDENTIALS_TIMEOUT, secrets.get_opt(secret_name))
                .await
                .map_err(|_| Error::Timeout("credentials secret"))??;
            match fetched {
                Some(secret) => {
                    credentials.insert(secret_name.clone(), secret_credentials(&secret));
                }
                None => debug!(secret = %secret_name, "credentials secret not found"),
            }
        }

        let mut output_addresses = BTreeMap::new();
        for output in &outputs {
            if let Some(resolution) = &output.spec.service {
                let addresses = service_addresses(&ctx.client, &ns, resolution).await?;
                if !addresses.is_empty() {
                    output_addresses.insert(output.name_any(), addresses);
                }
            }
        }

        let mut missing = Vec::new();
        note_missing(&mut missing, "target", &spec.targets.refs, names(&targets));
        note_missing(&mut missing, "subscription", &spec.subscriptions.refs, names(&subscriptions));
        note_missing(&mut missing, "output", &spec.outputs.refs, names(&outputs));
        note_missing(&mut missing, "input", &spec.inputs.refs, names(&inputs));

        Ok(Resolution::Resolved(Box::new(ResolvedPipeline {
            pipeline: pipe.clone(),
            data: PipelineData {
                namespace: ns,
                name: pipe.name_any(),
                targets,
                subscriptions,
                outputs,
                inputs,
                output_processors,
                input_processors,
                tunnel_policies,
                profiles,
                credentials,
                output_addresses,
            },
            missing,
        })))
    }

    /// Mutate a copy of the current status and write it back, skipping the
    /// write when nothing changed (transition times survive via upsert).
    async fn write_status(
        &self,
        ctx: &Context,
        mutate: impl FnOnce(&mut ClusterStatus),
    ) -> Result<()> {
        let mut status = self.status.clone().unwrap_or_default();
        mutate(&mut status);
        if self.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let ns = self
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &ns);
        let patch = Patch::Apply(json!({
            "apiVersion": "gnmic.dev/v1alpha1",
            "kind": "Cluster",
            "status": status,
        }));
        api.patch_status(
            &self.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &patch,
        )
        .await?;
        Ok(())
    }
}

fn apply_counts(status: &mut ClusterStatus, plan: &ApplyPlan, ready_replicas: i32) {
    status.ready_replicas = ready_replicas;
    status.targets = plan.targets.len() as i32;
    status.subscriptions = plan.subscriptions.len() as i32;
    status.outputs = plan.outputs.len() as i32;
    status.inputs = plan.inputs.len() as i32;
}

fn names<K: ResourceExt>(objs: &[K]) -> BTreeSet<String> {
    objs.iter().map(|o| o.name_any()).collect()
}

fn note_missing(missing: &mut Vec<String>, kind: &str, refs: &[String], resolved: BTreeSet<String>) {
    for r in refs {
        if !resolved.contains(r) {
            missing.push(format!("{kind}/{r}"));
        }
    }
}

fn secret_credentials(secret: &Secret) -> Credentials {
    let data = secret.data.clone().unwrap_or_default();
    let get = |key: &str| {
        data.get(key)
            .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
    };
    Credentials {
        username: get("username"),
        password: get("password"),
    }
}

/// `host:port` pairs of the Services an output points at, used for broker
/// address injection.
async fn service_addresses(
    client: &Client,
    ns: &str,
    resolution: &ServiceResolution,
) -> Result<Vec<String>> {
    let api: Api<Service> = Api::namespaced(client.clone(), ns);
    let mut services: Vec<Service> = Vec::new();
    if let Some(name) = &resolution.service_ref {
        if let Some(svc) = api.get_opt(name).await? {
            services.push(svc);
        }
    }
    if let Some(sel) = &resolution.selector {
        if !selector::is_empty(sel) {
            for svc in api.list(&ListParams::default()).await? {
                if selector::matches(sel, svc.labels())
                    && !services.iter().any(|s| s.name_any() == svc.name_any())
                {
                    services.push(svc);
                }
            }
        }
    }

    let mut addresses = Vec::new();
    for svc in services {
        let Some(spec) = svc.spec else { continue };
        let host = format!("{}.{ns}.svc.cluster.local", svc.metadata.name.clone().unwrap_or_default());
        for port in spec.ports.unwrap_or_default() {
            if let Some(want) = &resolution.port {
                if port.name.as_deref() != Some(want.as_str()) {
                    continue;
                }
            }
            addresses.push(format!("{host}:{}", port.port));
        }
    }
    addresses.sort();
    addresses.dedup();
    Ok(addresses)
}

async fn write_pipeline_status(client: &Client, ns: &str, resolved: &ResolvedPipeline) -> Result<()> {
    let data = &resolved.data;
    let declared_targets = !resolved.pipeline.spec.targets.is_empty();
    let incomplete = declared_targets && data.targets.is_empty();
    let missing = resolved.missing.clone();
    let counts = (
        data.targets.len() as i32,
        data.subscriptions.len() as i32,
        data.outputs.len() as i32,
        data.inputs.len() as i32,
    );
    pipeline::update_status(client, ns, &data.name, move |p, status| {
        (status.targets, status.subscriptions, status.outputs, status.inputs) = counts;
        let phase = if incomplete { "Incomplete" } else { "Ready" };
        status.status = Some(phase.to_string());
        let generation = p.metadata.generation;
        conditions::upsert(
            &mut status.conditions,
            conditions::condition(
                conditions::READY,
                !incomplete,
                if incomplete { "NoTargets" } else { "Reconciled" },
                if incomplete { "no referenced targets resolved" } else { "" },
                generation,
            ),
        );
        conditions::upsert(
            &mut status.conditions,
            conditions::condition(
                conditions::RESOURCES_RESOLVED,
                missing.is_empty(),
                if missing.is_empty() { "AllResolved" } else { "MissingReferences" },
                &missing.join(", "),
                generation,
            ),
        );
    })
    .await
}

/// Fan-in: which Clusters must reconcile because this resource changed?
/// Enabled pipelines in the resource's namespace whose refs or selectors
/// cover it, mapped to their `clusterRef`, deduplicated.
fn clusters_selecting<F>(pipelines: &[Arc<Pipeline>], namespace: &str, pred: F) -> Vec<ObjectRef<Cluster>>
where
    F: Fn(&Pipeline) -> bool,
{
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for pipe in pipelines {
        if pipe.namespace().as_deref() != Some(namespace) || !pipe.spec.enabled {
            continue;
        }
        if !pred(pipe) {
            continue;
        }
        if seen.insert(pipe.spec.cluster_ref.clone()) {
            out.push(ObjectRef::new(&pipe.spec.cluster_ref).within(namespace));
        }
    }
    out
}

pub fn clusters_for_pipeline(pipe: &Pipeline) -> Option<ObjectRef<Cluster>> {
    let ns = pipe.namespace()?;
    Some(ObjectRef::new(&pipe.spec.cluster_ref).within(&ns))
}

pub fn clusters_for_target(pipelines: &[Arc<Pipeline>], target: &Target) -> Vec<ObjectRef<Cluster>> {
    let ns = target.namespace().unwrap_or_default();
    let name = target.name_any();
    clusters_selecting(pipelines, &ns, |p| p.spec.targets.matches(&name, target.labels()))
}

pub fn clusters_for_subscription(
    pipelines: &[Arc<Pipeline>],
    sub: &Subscription,
) -> Vec<ObjectRef<Cluster>> {
    let ns = sub.namespace().unwrap_or_default();
    let name = sub.name_any();
    clusters_selecting(pipelines, &ns, |p| {
        p.spec.subscriptions.matches(&name, sub.labels())
    })
}

pub fn clusters_for_output(pipelines: &[Arc<Pipeline>], output: &Output) -> Vec<ObjectRef<Cluster>> {
    let ns = output.namespace().unwrap_or_default();
    let name = output.name_any();
    clusters_selecting(pipelines, &ns, |p| p.spec.outputs.matches(&name, output.labels()))
}

pub fn clusters_for_input(pipelines: &[Arc<Pipeline>], input: &Input) -> Vec<ObjectRef<Cluster>> {
    let ns = input.namespace().unwrap_or_default();
    let name = input.name_any();
    clusters_selecting(pipelines, &ns, |p| p.spec.inputs.matches(&name, input.labels()))
}

/// Processors fan out through both the output and the input processor
/// chains.
pub fn clusters_for_processor(
    pipelines: &[Arc<Pipeline>],
    processor: &Processor,
) -> Vec<ObjectRef<Cluster>> {
    let ns = processor.namespace().unwrap_or_default();
    let name = processor.name_any();
    clusters_selecting(pipelines, &ns, |p| {
        p.spec.outputs.matches_processor(&name, processor.labels())
            || p.spec.inputs.matches_processor(&name, processor.labels())
    })
}

pub fn clusters_for_tunnel_policy(
    pipelines: &[Arc<Pipeline>],
    policy: &TunnelTargetPolicy,
) -> Vec<ObjectRef<Cluster>> {
    let ns = policy.namespace().unwrap_or_default();
    let name = policy.name_any();
    clusters_selecting(pipelines, &ns, |p| {
        p.spec.tunnel_target_policies.matches(&name, policy.labels())
    })
}

/// Profile changes reach clusters through the Targets that use the
/// profile.
pub fn clusters_for_profile(
    pipelines: &[Arc<Pipeline>],
    targets: &[Arc<Target>],
    profile: &TargetProfile,
) -> Vec<ObjectRef<Cluster>> {
    let ns = profile.namespace().unwrap_or_default();
    let name = profile.name_any();
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    for target in targets {
        if target.namespace().as_deref() != Some(ns.as_str()) || target.spec.profile != name {
            continue;
        }
        for reference in clusters_for_target(pipelines, target) {
            if seen.insert(reference.to_string()) {
                out.push(reference);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{PipelineSpec, ProcessedRefs, ResourceRefs, TargetSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::core::ObjectMeta;

    fn meta(name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn pipeline(name: &str, cluster: &str, spec: PipelineSpec) -> Arc<Pipeline> {
        Arc::new(Pipeline {
            metadata: meta(name, &[]),
            spec: PipelineSpec {
                cluster_ref: cluster.into(),
                ..spec
            },
            status: None,
        })
    }

    fn base_spec() -> PipelineSpec {
        PipelineSpec {
            cluster_ref: String::new(),
            enabled: true,
            targets: ResourceRefs::default(),
            tunnel_target_policies: ResourceRefs::default(),
            subscriptions: ResourceRefs::default(),
            outputs: ProcessedRefs::default(),
            inputs: ProcessedRefs::default(),
            labels: Default::default(),
        }
    }

    fn target(name: &str, labels: &[(&str, &str)]) -> Target {
        Target {
            metadata: meta(name, labels),
            spec: TargetSpec {
                address: "1.1.1.1:57400".into(),
                profile: "p".into(),
            },
            status: None,
        }
    }

    #[test]
    fn target_change_enqueues_referencing_clusters_once() {
        let mut by_ref = base_spec();
        by_ref.targets.refs = vec!["r1".into()];
        let mut by_selector = base_spec();
        by_selector.targets.selectors = vec![LabelSelector {
            match_labels: Some([("role".to_string(), "edge".to_string())].into()),
            match_expressions: None,
        }];
        let mut unrelated = base_spec();
        unrelated.targets.refs = vec!["other".into()];

        let pipelines = vec![
            pipeline("a", "core", by_ref),
            pipeline("b", "core", by_selector),
            pipeline("c", "lab", unrelated),
        ];
        let refs = clusters_for_target(&pipelines, &target("r1", &[("role", "edge")]));
        // both matching pipelines point at the same cluster: one request
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "core");
    }

    #[test]
    fn disabled_pipelines_do_not_fan_in() {
        let mut spec = base_spec();
        spec.targets.refs = vec!["r1".into()];
        spec.enabled = false;
        let pipelines = vec![pipeline("a", "core", spec)];
        assert!(clusters_for_target(&pipelines, &target("r1", &[])).is_empty());
    }

    #[test]
    fn processor_changes_fan_out_via_output_and_input_chains() {
        let mut via_outputs = base_spec();
        via_outputs.outputs.processor_refs = vec!["norm".into()];
        let mut via_inputs = base_spec();
        via_inputs.inputs.processor_refs = vec!["norm".into()];
        let pipelines = vec![
            pipeline("a", "core", via_outputs),
            pipeline("b", "edge", via_inputs),
        ];
        let processor = Processor {
            metadata: meta("norm", &[]),
            spec: crate::crd::ProcessorSpec {
                processor_type: "event-strings".into(),
                config: None,
            },
        };
        let refs = clusters_for_processor(&pipelines, &processor);
        let names: Vec<String> = refs.iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["core", "edge"]);
    }

    #[test]
    fn profile_changes_reach_clusters_through_their_targets() {
        let mut spec = base_spec();
        spec.targets.refs = vec!["r1".into()];
        let pipelines = vec![pipeline("a", "core", spec)];
        let targets = vec![Arc::new(target("r1", &[]))];
        let profile = TargetProfile {
            metadata: meta("p", &[]),
            spec: crate::crd::TargetProfileSpec {
                credentials_ref: None,
                tls: None,
                timeout: None,
                retry_timer: None,
                encoding: None,
                tcp_keepalive: None,
                proxy: None,
                compression: None,
            },
        };
        let refs = clusters_for_profile(&pipelines, &targets, &profile);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "core");

        let other = TargetProfile {
            metadata: meta("unused", &[]),
            spec: profile.spec.clone(),
        };
        assert!(clusters_for_profile(&pipelines, &targets, &other).is_empty());
    }

    #[test]
    fn missing_refs_are_recorded_per_kind() {
        let mut missing = Vec::new();
        note_missing(
            &mut missing,
            "target",
            &["a".to_string(), "b".to_string()],
            BTreeSet::from(["a".to_string()]),
        );
        assert_eq!(missing, vec!["target/b"]);
    }
}
