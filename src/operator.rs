use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{future::BoxFuture, FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::{
    api::ListParams,
    runtime::{
        events::{Recorder, Reporter},
        reflector,
        watcher::{self, Config},
        Controller, WatchStreamExt,
    },
    Api, Client,
};
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::cert_manager::Certificate;
use crate::crd::{
    Cluster, Input, Output, Pipeline, Processor, Subscription, Target, TargetProfile,
    TunnelTargetPolicy,
};
use crate::plan::ApplyPlan;
use crate::target_state::StreamHandle;
use crate::{cluster, pipeline, target_state};

/// Context shared by all three controllers.
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Built plans by cluster `namespace/name`, served by the inspection
    /// endpoint. Writers publish whole plans under the write lock.
    pub plans: Arc<RwLock<HashMap<String, Arc<ApplyPlan>>>>,
    /// Live SSE stream tasks by `namespace/cluster/pod`.
    pub streams: Arc<Mutex<HashMap<String, StreamHandle>>>,
}

// Prometheus metrics exposed on /metrics
#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub applies: IntCounter,
    pub apply_failures: IntCounter,
    pub sse_events: IntCounter,
}

impl Metrics {
    fn new() -> Self {
        let reconcile_histogram = register_histogram_vec!(
            "gnmic_operator_reconcile_duration_seconds",
            "The duration of reconcile to complete in seconds",
            &["controller"],
            vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]
        )
        .unwrap();

        Metrics {
            reconciliations: register_int_counter_vec!(
                "gnmic_operator_reconciliations_total",
                "reconciliations",
                &["controller"]
            )
            .unwrap(),
            failures: register_int_counter_vec!(
                "gnmic_operator_reconciliation_errors_total",
                "reconciliation errors",
                &["controller", "error"]
            )
            .unwrap(),
            reconcile_duration: reconcile_histogram,
            applies: register_int_counter!(
                "gnmic_operator_config_applies_total",
                "config apply requests sent to collector pods"
            )
            .unwrap(),
            apply_failures: register_int_counter!(
                "gnmic_operator_config_apply_failures_total",
                "config apply requests that failed"
            )
            .unwrap(),
            sse_events: register_int_counter!(
                "gnmic_operator_target_state_events_total",
                "target state events consumed from collector pods"
            )
            .unwrap(),
        }
    }
}

// Diagnostics to be exposed on the webserver
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Diagnostics {
    fn new() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "gnmic-operator".into(),
        }
    }

    pub fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

/// Data owned by the Operator
#[derive(Clone)]
pub struct Operator {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Plan cache shared with the Cluster reconciler
    plans: Arc<RwLock<HashMap<String, Arc<ApplyPlan>>>>,
}

/// Operator that owns the Cluster, Pipeline and TargetState controllers
impl Operator {
    /// Lifecycle initialization interface for the app
    ///
    /// This returns an `Operator` that drives the controllers + a future to
    /// be awaited. It is up to `main` to wait for the controller stream.
    pub async fn new() -> (Self, BoxFuture<'static, ()>) {
        let client = Client::try_default().await.expect("Create Client");
        let metrics = Metrics::new();
        let diagnostics = Arc::new(RwLock::new(Diagnostics::new()));
        let plans: Arc<RwLock<HashMap<String, Arc<ApplyPlan>>>> = Default::default();
        let streams: Arc<Mutex<HashMap<String, StreamHandle>>> = Default::default();
        let context = Arc::new(Context {
            client: client.clone(),
            diagnostics: diagnostics.clone(),
            metrics,
            plans: plans.clone(),
            streams,
        });

        let clusters = Api::<Cluster>::all(client.clone());
        // Ensure the CRDs are installed before loop-watching
        let _r = clusters
            .list(&ListParams::default().limit(1))
            .await
            .expect("Are the crds installed? please run: cargo run --bin crdgen | kubectl apply -f -");

        // Reflector stores backing the cross-resource fan-in mappers.
        let (pipeline_store, pipeline_writer) = reflector::store::<Pipeline>();
        let pipeline_reflector = reflector::reflector(
            pipeline_writer,
            watcher::watcher(Api::<Pipeline>::all(client.clone()), Config::default()).default_backoff(),
        )
        .touched_objects()
        .filter_map(|r| async move { r.ok() })
        .for_each(|_| futures::future::ready(()));
        tokio::spawn(pipeline_reflector);

        let (target_store, target_writer) = reflector::store::<Target>();
        let target_reflector = reflector::reflector(
            target_writer,
            watcher::watcher(Api::<Target>::all(client.clone()), Config::default()).default_backoff(),
        )
        .touched_objects()
        .filter_map(|r| async move { r.ok() })
        .for_each(|_| futures::future::ready(()));
        tokio::spawn(target_reflector);

        let cluster_controller = Controller::new(clusters.clone(), Config::default().any_semantic())
            .owns(Api::<StatefulSet>::all(client.clone()), Config::default())
            .owns(Api::<Service>::all(client.clone()), Config::default())
            .owns(Api::<ConfigMap>::all(client.clone()), Config::default())
            .owns(Api::<Certificate>::all(client.clone()), Config::default())
            .watches(Api::<Pipeline>::all(client.clone()), Config::default(), |p: Pipeline| {
                cluster::clusters_for_pipeline(&p)
            })
            .watches(Api::<Target>::all(client.clone()), Config::default(), {
                let store = pipeline_store.clone();
                move |t: Target| cluster::clusters_for_target(&store.state(), &t)
            })
            .watches(Api::<Subscription>::all(client.clone()), Config::default(), {
                let store = pipeline_store.clone();
                move |s: Subscription| cluster::clusters_for_subscription(&store.state(), &s)
            })
            .watches(Api::<Output>::all(client.clone()), Config::default(), {
                let store = pipeline_store.clone();
                move |o: Output| cluster::clusters_for_output(&store.state(), &o)
            })
            .watches(Api::<Input>::all(client.clone()), Config::default(), {
                let store = pipeline_store.clone();
                move |i: Input| cluster::clusters_for_input(&store.state(), &i)
            })
            .watches(Api::<Processor>::all(client.clone()), Config::default(), {
                let store = pipeline_store.clone();
                move |p: Processor| cluster::clusters_for_processor(&store.state(), &p)
            })
            .watches(Api::<TunnelTargetPolicy>::all(client.clone()), Config::default(), {
                let store = pipeline_store.clone();
                move |p: TunnelTargetPolicy| cluster::clusters_for_tunnel_policy(&store.state(), &p)
            })
            .watches(Api::<TargetProfile>::all(client.clone()), Config::default(), {
                let pipelines = pipeline_store.clone();
                let targets = target_store.clone();
                move |p: TargetProfile| {
                    cluster::clusters_for_profile(&pipelines.state(), &targets.state(), &p)
                }
            })
            .shutdown_on_signal()
            .run(cluster::reconcile, cluster::error_policy, context.clone())
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()));

        let pipeline_controller = Controller::new(
            Api::<Pipeline>::all(client.clone()),
            Config::default().any_semantic(),
        )
        .shutdown_on_signal()
        .run(pipeline::reconcile, pipeline::error_policy, context.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

        // Separate controller so stream lifecycle follows pod readiness
        // without re-running the full cluster reconcile.
        let target_state_controller = Controller::new(clusters, Config::default().any_semantic())
            .owns(Api::<StatefulSet>::all(client.clone()), Config::default())
            .shutdown_on_signal()
            .run(target_state::reconcile, target_state::error_policy, context)
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()));

        let controllers = futures::future::join3(
            cluster_controller,
            pipeline_controller,
            target_state_controller,
        )
        .map(|_| warn!("all controllers exited"))
        .boxed();

        (Self { diagnostics, plans }, controllers)
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Cached plan for the inspection endpoint. Plans are published whole;
    /// readers never see a half-built plan.
    pub async fn plan(&self, namespace: &str, name: &str) -> Option<Arc<ApplyPlan>> {
        self.plans.read().await.get(&format!("{namespace}/{name}")).cloned()
    }

    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        prometheus::gather()
    }
}
