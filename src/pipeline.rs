//! The Pipeline reconciler is intentionally light: it validates the
//! cluster reference and stamps coarse status. Counts and the detailed
//! `Ready`/`ResourcesResolved` conditions are written by the Cluster
//! reconciler during plan build, which this controller reaches through the
//! watch fan-in.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, instrument, warn};

use crate::conditions;
use crate::crd::{Cluster, Pipeline, PipelineStatus};
use crate::operator::Context;
use crate::{Error, Result};

const CONFLICT_RETRIES: usize = 5;

#[instrument(skip(pipe, ctx), fields(pipeline = %pipe.name_any()))]
pub async fn reconcile(pipe: Arc<Pipeline>, ctx: Arc<Context>) -> Result<Action> {
    ctx.metrics.reconciliations.with_label_values(&["pipeline"]).inc();
    let ns = pipe
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = pipe.name_any();

    let clusters: Api<Cluster> = Api::namespaced(ctx.client.clone(), &ns);
    if clusters.get_opt(&pipe.spec.cluster_ref).await?.is_none() {
        warn!(cluster = %pipe.spec.cluster_ref, "pipeline references a missing cluster");
        update_status(&ctx.client, &ns, &name, |p, status| {
            status.status = Some("Error: Cluster not found".to_string());
            conditions::upsert(
                &mut status.conditions,
                conditions::condition(
                    conditions::READY,
                    false,
                    "ClusterNotFound",
                    &format!("cluster {} does not exist", p.spec.cluster_ref),
                    p.metadata.generation,
                ),
            );
        })
        .await?;
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    if !pipe.spec.enabled {
        update_status(&ctx.client, &ns, &name, |p, status| {
            status.status = Some("Disabled".to_string());
            conditions::upsert(
                &mut status.conditions,
                conditions::condition(
                    conditions::READY,
                    false,
                    "Disabled",
                    "pipeline is disabled",
                    p.metadata.generation,
                ),
            );
        })
        .await?;
        return Ok(Action::requeue(Duration::from_secs(5 * 60)));
    }

    // the cluster reconciler refines this with counts and conditions
    update_status(&ctx.client, &ns, &name, |_, status| {
        if status.status.is_none() {
            status.status = Some("Ready".to_string());
        }
    })
    .await?;
    Ok(Action::requeue(Duration::from_secs(5 * 60)))
}

pub fn error_policy(_pipe: Arc<Pipeline>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("pipeline reconcile failed: {error:?}");
    ctx.metrics
        .failures
        .with_label_values(&["pipeline", error.metric_label()])
        .inc();
    Action::requeue(Duration::from_secs(30))
}

/// Read-modify-write of a pipeline's status with bounded conflict retries.
/// Both this controller and the Cluster reconciler write here; the
/// resource version serializes them.
pub async fn update_status(
    client: &Client,
    namespace: &str,
    name: &str,
    mutate: impl Fn(&Pipeline, &mut PipelineStatus),
) -> Result<()> {
    let api: Api<Pipeline> = Api::namespaced(client.clone(), namespace);
    for attempt in 0.. {
        let Some(mut pipe) = api.get_opt(name).await? else {
            return Ok(());
        };
        let mut status = pipe.status.clone().unwrap_or_default();
        mutate(&pipe, &mut status);
        if pipe.status.as_ref() == Some(&status) {
            return Ok(());
        }
        pipe.status = Some(status);
        let body = serde_json::to_vec(&pipe).map_err(Error::SerializationError)?;
        match api.replace_status(name, &PostParams::default(), body).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt + 1 < CONFLICT_RETRIES => {
                debug!(pipeline = %name, attempt, "conflict updating pipeline status, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
