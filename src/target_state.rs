//! Per-pod target-state streaming: one task per collector pod consuming
//! the SSE state stream, with a periodic snapshot poll as the recovery
//! path for events lost across reconnects. Both paths funnel into
//! `Target.status.clusterStates` with bounded conflict retries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use kube::runtime::controller::Action;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::certs;
use crate::collector::{CollectorClient, SseFrame, SseParser, TargetState, TlsMaterial};
use crate::crd::{Cluster, ClusterTargetState, Target};
use crate::operator::{Context, Metrics};
use crate::{Error, Result};

pub const POLL_INTERVAL: Duration = Duration::from_secs(15);
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(10);
const CONFLICT_RETRIES: usize = 5;

/// `<namespace>/<cluster>/<podIndex>`
pub fn stream_key(namespace: &str, cluster: &str, pod: i32) -> String {
    format!("{namespace}/{cluster}/{pod}")
}

pub struct StreamHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl StreamHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Keeps the stream set in sync with the cluster's desired replicas.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let ns = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = cluster.name_any();

    // deletion is torn down by the cluster finalizer
    if cluster.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    if cluster.spec.replicas <= 0 {
        teardown_cluster(&ctx, &ns, &name).await?;
        return Ok(Action::requeue(Duration::from_secs(300)));
    }

    let sts_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &ns);
    if sts_api.get_opt(&cluster.sts_name()).await?.is_none() {
        cancel_streams(&ctx, &format!("{ns}/{name}/")).await;
        return Ok(Action::requeue(Duration::from_secs(10)));
    }

    let tls = certs::pod_tls_material(&ctx.client, &cluster).await?;
    let desired = cluster.spec.replicas;
    let mut streams = ctx.streams.lock().await;

    for pod in 0..desired {
        let key = stream_key(&ns, &name, pod);
        if streams.get(&key).map(StreamHandle::is_finished).unwrap_or(false) {
            streams.remove(&key);
        }
        if !streams.contains_key(&key) {
            info!(%key, "starting target state stream");
            let token = CancellationToken::new();
            let task = StreamTask {
                kube: ctx.client.clone(),
                metrics: ctx.metrics.clone(),
                base_url: cluster.pod_base_url(pod),
                namespace: ns.clone(),
                cluster: name.clone(),
                key: key.clone(),
                tls: tls.clone(),
            };
            let handle = tokio::spawn(run_stream(task, token.clone()));
            streams.insert(key, StreamHandle { token, handle });
        }
    }

    // pods beyond the desired replica count are going away
    let prefix = format!("{ns}/{name}/");
    let excess: Vec<String> = streams
        .keys()
        .filter(|key| {
            key.strip_prefix(&prefix)
                .and_then(|pod| pod.parse::<i32>().ok())
                .map(|pod| pod >= desired)
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    for key in excess {
        if let Some(handle) = streams.remove(&key) {
            info!(%key, "cancelling target state stream");
            handle.cancel();
        }
    }

    Ok(Action::requeue(Duration::from_secs(300)))
}

pub fn error_policy(_cluster: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("target state reconcile failed: {error:?}");
    ctx.metrics.failures.with_label_values(&["targetstate", error.metric_label()]).inc();
    Action::requeue(Duration::from_secs(15))
}

/// Cancel every stream of the cluster and drop its entry from all Target
/// statuses. Used on deletion and on scale-to-zero.
pub async fn teardown_cluster(ctx: &Context, namespace: &str, cluster: &str) -> Result<()> {
    cancel_streams(ctx, &format!("{namespace}/{cluster}/")).await;
    let targets: Api<Target> = Api::namespaced(ctx.client.clone(), namespace);
    for target in targets.list(&ListParams::default()).await? {
        let has_entry = target
            .status
            .as_ref()
            .map(|s| s.cluster_states.contains_key(cluster))
            .unwrap_or(false);
        if has_entry {
            update_target_state(&ctx.client, namespace, &target.name_any(), cluster, None).await?;
        }
    }
    Ok(())
}

pub async fn cancel_streams(ctx: &Context, prefix: &str) {
    let mut streams = ctx.streams.lock().await;
    let keys: Vec<String> = streams
        .keys()
        .filter(|key| key.starts_with(prefix))
        .cloned()
        .collect();
    for key in keys {
        if let Some(handle) = streams.remove(&key) {
            info!(%key, "cancelling target state stream");
            handle.cancel();
        }
    }
}

struct StreamTask {
    kube: Client,
    metrics: Metrics,
    base_url: String,
    namespace: String,
    cluster: String,
    key: String,
    tls: Option<TlsMaterial>,
}

async fn run_stream(task: StreamTask, token: CancellationToken) {
    let collector = match CollectorClient::new(&task.base_url, task.tls.as_ref()) {
        Ok(collector) => collector,
        Err(e) => {
            warn!(key = %task.key, error = %e, "failed to build collector client");
            return;
        }
    };
    tokio::select! {
        _ = token.cancelled() => debug!(key = %task.key, "stream cancelled"),
        _ = sse_loop(&task, &collector) => {}
        _ = poll_loop(&task, &collector) => {}
    }
}

/// Reconnecting SSE consumer: 2s backoff doubling to a 10s cap, reset on
/// every successful connect.
async fn sse_loop(task: &StreamTask, collector: &CollectorClient) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        match collector.open_state_stream().await {
            Ok(resp) => {
                backoff = BACKOFF_INITIAL;
                debug!(key = %task.key, "state stream connected");
                let mut parser = SseParser::default();
                let mut body = resp.bytes_stream();
                while let Some(chunk) = body.next().await {
                    match chunk {
                        Ok(bytes) => {
                            for frame in parser.push(&bytes) {
                                handle_frame(task, frame).await;
                            }
                        }
                        Err(e) => {
                            warn!(key = %task.key, error = %e, "state stream read failed");
                            break;
                        }
                    }
                }
                info!(key = %task.key, "state stream ended, reconnecting");
            }
            Err(e) => debug!(key = %task.key, error = %e, "state stream connect failed"),
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

async fn handle_frame(task: &StreamTask, frame: SseFrame) {
    let Some(event) = frame.decode() else {
        debug!(key = %task.key, "undecodable state frame");
        return;
    };
    if !event.is_target_state() {
        return;
    }
    task.metrics.sse_events.inc();
    let kind = event.effective_type(frame.event.as_deref());
    let (ns, name) = split_target_name(&event.name, &task.namespace);
    let state = if kind == "delete" {
        None
    } else {
        Some(to_cluster_state(event.object.clone().unwrap_or_default()))
    };
    if let Err(e) = update_target_state(&task.kube, &ns, &name, &task.cluster, state).await {
        warn!(key = %task.key, target = %name, error = %e, "failed to update target status");
    }
}

/// Snapshot reconciliation on a fixed ticker; papers over any event lost
/// while the SSE stream was down.
async fn poll_loop(task: &StreamTask, collector: &CollectorClient) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match collector.targets().await {
            Ok(entries) => {
                for entry in entries {
                    let Some(state) = entry.state else { continue };
                    let (ns, name) = split_target_name(&entry.name, &task.namespace);
                    if let Err(e) = update_target_state(
                        &task.kube,
                        &ns,
                        &name,
                        &task.cluster,
                        Some(to_cluster_state(state)),
                    )
                    .await
                    {
                        warn!(key = %task.key, target = %name, error = %e, "failed to reconcile target status");
                    }
                }
            }
            Err(e) => debug!(key = %task.key, error = %e, "target poll failed"),
        }
    }
}

/// Stream names are `namespace/target`; bare names fall back to the
/// stream's own namespace.
fn split_target_name(name: &str, fallback_ns: &str) -> (String, String) {
    match name.split_once('/') {
        Some((ns, n)) => (ns.to_string(), n.to_string()),
        None => (fallback_ns.to_string(), name.to_string()),
    }
}

fn to_cluster_state(state: TargetState) -> ClusterTargetState {
    ClusterTargetState {
        state: state.state,
        failed_reason: state.failed_reason,
        connection_state: state.connection_state,
        subscriptions: state.subscriptions,
        last_updated: state.last_updated,
    }
}

/// Aggregate `(clusters, connectionState)` over all per-cluster entries:
/// READY only when every cluster reports a running, READY target.
pub fn summarize(states: &BTreeMap<String, ClusterTargetState>) -> (i32, String) {
    if states.is_empty() {
        return (0, String::new());
    }
    let all_ready = states.values().all(|s| {
        s.state.as_deref() == Some("running") && s.connection_state.as_deref() == Some("READY")
    });
    let summary = if all_ready { "READY" } else { "DEGRADED" };
    (states.len() as i32, summary.to_string())
}

/// Merge one cluster's view into a Target's status (or remove it when the
/// target was deleted on that cluster) and recompute the summary. Writers
/// race across streams and with the poll loop; the resource version
/// serializes them, with up to five retries on conflict.
pub async fn update_target_state(
    client: &Client,
    namespace: &str,
    name: &str,
    cluster: &str,
    state: Option<ClusterTargetState>,
) -> Result<()> {
    let api: Api<Target> = Api::namespaced(client.clone(), namespace);
    for attempt in 0.. {
        let Some(mut target) = api.get_opt(name).await? else {
            // the CR is gone; nothing to reflect state into
            return Ok(());
        };
        let mut status = target.status.clone().unwrap_or_default();
        match &state {
            Some(s) => {
                status.cluster_states.insert(cluster.to_string(), s.clone());
            }
            None => {
                status.cluster_states.remove(cluster);
            }
        }
        let (clusters, connection_state) = summarize(&status.cluster_states);
        status.clusters = clusters;
        status.connection_state = connection_state;

        if target.status.as_ref() == Some(&status) {
            return Ok(());
        }
        target.status = Some(status);
        let body = serde_json::to_vec(&target).map_err(Error::SerializationError)?;
        match api.replace_status(name, &PostParams::default(), body).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt + 1 < CONFLICT_RETRIES => {
                debug!(target = %name, attempt, "conflict updating target status, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(state: &str, connection: &str) -> ClusterTargetState {
        ClusterTargetState {
            state: Some(state.to_string()),
            connection_state: Some(connection.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn summary_is_empty_without_any_cluster() {
        assert_eq!(summarize(&BTreeMap::new()), (0, String::new()));
    }

    #[test]
    fn summary_ready_only_when_all_clusters_ready() {
        let mut states = BTreeMap::new();
        states.insert("core".to_string(), entry("running", "READY"));
        assert_eq!(summarize(&states), (1, "READY".to_string()));

        states.insert("edge".to_string(), entry("running", "TRANSIENT_FAILURE"));
        assert_eq!(summarize(&states), (2, "DEGRADED".to_string()));

        states.insert("edge".to_string(), entry("running", "READY"));
        assert_eq!(summarize(&states), (2, "READY".to_string()));
    }

    #[test]
    fn stopped_target_degrades_even_when_connection_ready() {
        let mut states = BTreeMap::new();
        states.insert("core".to_string(), entry("stopped", "READY"));
        assert_eq!(summarize(&states).1, "DEGRADED");
    }

    #[test]
    fn target_names_split_on_namespace() {
        assert_eq!(
            split_target_name("lab/router1", "default"),
            ("lab".to_string(), "router1".to_string())
        );
        assert_eq!(
            split_target_name("router1", "default"),
            ("default".to_string(), "router1".to_string())
        );
    }

    #[test]
    fn stream_keys_carry_namespace_cluster_and_pod() {
        assert_eq!(stream_key("default", "core", 2), "default/core/2");
    }
}
