//! Apply-plan assembly: aggregates the resolved resources of every enabled
//! pipeline of one Cluster into the concrete configuration pushed to the
//! collector pods.

use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::crd::{
    namespaced_name, ClientTls, Input, Output, Processor, Subscription, Target, TargetProfile,
    TunnelTargetPolicy,
};
use crate::translate::{self, Credentials, SubscriptionConfig, TargetConfig, TunnelMatchConfig};
use crate::{Error, Result};

/// First port handed to `type=prometheus` outputs.
pub const PROMETHEUS_PORT_BASE: u16 = 9804;
/// Number of ports in the pool, `[base, base+1008]`.
pub const PROMETHEUS_PORT_POOL: u16 = 1009;

/// Everything one pipeline contributes to a plan, fully resolved: the CRs
/// themselves plus side data (profiles, credentials, service addresses)
/// fetched during resolution.
#[derive(Clone, Debug, Default)]
pub struct PipelineData {
    pub namespace: String,
    pub name: String,
    pub targets: Vec<Target>,
    pub subscriptions: Vec<Subscription>,
    pub outputs: Vec<Output>,
    pub inputs: Vec<Input>,
    /// Processor chains, already ordered (refs first, selector matches after).
    pub output_processors: Vec<Processor>,
    pub input_processors: Vec<Processor>,
    pub tunnel_policies: Vec<TunnelTargetPolicy>,
    /// Profiles by plain name, all from the pipeline's namespace.
    pub profiles: BTreeMap<String, TargetProfile>,
    /// Secret contents by secret name.
    pub credentials: BTreeMap<String, Credentials>,
    /// Resolved `host:port` addresses by output plain name.
    pub output_addresses: BTreeMap<String, Vec<String>>,
}

impl PipelineData {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Outputs and inputs are materialized once per pipeline (their
    /// processor chains differ per pipeline), so their plan keys carry the
    /// pipeline name.
    pub fn output_key(&self, output: &str) -> String {
        format!("{}/{}/{}", self.namespace, self.name, output)
    }

    fn profile_and_credentials(&self, profile: &str) -> Option<(&TargetProfile, Option<&Credentials>)> {
        let profile = self.profiles.get(profile)?;
        let creds = profile
            .spec
            .credentials_ref
            .as_deref()
            .and_then(|secret| self.credentials.get(secret));
        Some((profile, creds))
    }
}

/// The concrete configuration for one Cluster, aggregated over all of its
/// enabled pipelines. Serializes to the collector's apply request body.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ApplyPlan {
    pub targets: BTreeMap<String, TargetConfig>,
    pub subscriptions: BTreeMap<String, SubscriptionConfig>,
    pub outputs: BTreeMap<String, Map<String, Value>>,
    pub inputs: BTreeMap<String, Map<String, Value>>,
    pub processors: BTreeMap<String, Map<String, Value>>,
    pub tunnel_target_matches: BTreeMap<String, TunnelMatchConfig>,
    pub prometheus_ports: BTreeMap<String, u16>,
}

/// Build the apply plan for one cluster. Deterministic: the same resolved
/// pipeline set yields a bit-identical plan. Missing references were
/// already dropped during resolution; the only hard failures are
/// undecodable user config and prometheus pool exhaustion.
pub fn build(pipelines: &[PipelineData], client_tls: Option<&ClientTls>) -> Result<ApplyPlan> {
    let mut plan = ApplyPlan::default();

    let mut sorted: Vec<&PipelineData> = pipelines.iter().collect();
    sorted.sort_by_key(|p| p.key());

    // Outputs first: later phases only reference outputs that survived
    // translation (a user-duplicated prometheus listen drops the output).
    for p in &sorted {
        let processor_keys: Vec<String> = p
            .output_processors
            .iter()
            .map(|proc| namespaced_name(proc))
            .collect();
        let mut seen_listen = BTreeSet::new();
        for output in &p.outputs {
            let key = p.output_key(&output.name_any());
            if plan.outputs.contains_key(&key) {
                continue;
            }
            let addresses = p
                .output_addresses
                .get(&output.name_any())
                .cloned()
                .unwrap_or_default();
            let cfg = translate::output_config(&key, &output.spec, &processor_keys, &addresses)?;
            if output.spec.output_type == "prometheus" {
                if let Some(listen) = cfg.get("listen").and_then(Value::as_str) {
                    if !seen_listen.insert(listen.to_string()) {
                        warn!(output = %key, %listen, "duplicate prometheus listen in pipeline, skipping output");
                        continue;
                    }
                }
            }
            plan.outputs.insert(key, cfg);
        }
    }

    // Relationship maps over the surviving outputs.
    let mut sub_outputs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut target_subs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for p in &sorted {
        let output_keys: Vec<String> = p
            .outputs
            .iter()
            .map(|o| p.output_key(&o.name_any()))
            .filter(|k| plan.outputs.contains_key(k))
            .collect();
        for sub in &p.subscriptions {
            sub_outputs
                .entry(namespaced_name(sub))
                .or_default()
                .extend(output_keys.iter().cloned());
        }
        let sub_keys: Vec<String> = p.subscriptions.iter().map(|s| namespaced_name(s)).collect();
        for target in &p.targets {
            target_subs
                .entry(namespaced_name(target))
                .or_default()
                .extend(sub_keys.iter().cloned());
        }
    }

    // Targets: one entry per CR, first pipeline wins (duplicate names are
    // the same CR). A missing profile drops the target, never the plan.
    for p in &sorted {
        for target in &p.targets {
            let key = namespaced_name(target);
            if plan.targets.contains_key(&key) {
                continue;
            }
            let Some((profile, creds)) = p.profile_and_credentials(&target.spec.profile) else {
                warn!(target = %key, profile = %target.spec.profile, "profile not found, dropping target");
                continue;
            };
            let mut cfg = translate::target_config(target, &profile.spec, creds, client_tls);
            cfg.subscriptions = target_subs
                .get(&key)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default();
            plan.targets.insert(key, cfg);
        }
    }

    for p in &sorted {
        for sub in &p.subscriptions {
            let key = namespaced_name(sub);
            if plan.subscriptions.contains_key(&key) {
                continue;
            }
            let mut cfg = translate::subscription_config(&sub.spec);
            cfg.outputs = sub_outputs
                .get(&key)
                .map(|o| o.iter().cloned().collect())
                .unwrap_or_default();
            plan.subscriptions.insert(key, cfg);
        }
    }

    for p in &sorted {
        let output_keys: Vec<String> = p
            .outputs
            .iter()
            .map(|o| p.output_key(&o.name_any()))
            .filter(|k| plan.outputs.contains_key(k))
            .collect();
        let processor_keys: Vec<String> = p
            .input_processors
            .iter()
            .map(|proc| namespaced_name(proc))
            .collect();
        for input in &p.inputs {
            let key = p.output_key(&input.name_any());
            if plan.inputs.contains_key(&key) {
                continue;
            }
            let cfg = translate::input_config(&key, &input.spec, &output_keys, &processor_keys)?;
            plan.inputs.insert(key, cfg);
        }
    }

    for p in &sorted {
        for proc in p.output_processors.iter().chain(p.input_processors.iter()) {
            let key = namespaced_name(proc);
            if plan.processors.contains_key(&key) {
                continue;
            }
            let cfg = translate::processor_config(&key, &proc.spec)?;
            plan.processors.insert(key, cfg);
        }
    }

    for p in &sorted {
        for policy in &p.tunnel_policies {
            let key = namespaced_name(policy);
            if plan.tunnel_target_matches.contains_key(&key) {
                continue;
            }
            let Some((profile, creds)) = p.profile_and_credentials(&policy.spec.profile) else {
                warn!(policy = %key, profile = %policy.spec.profile, "profile not found, dropping tunnel policy");
                continue;
            };
            let cfg = translate::tunnel_target_match(&policy.spec, &profile.spec, creds, client_tls);
            plan.tunnel_target_matches.insert(key, cfg);
        }
    }

    allocate_prometheus_ports(&mut plan)?;
    Ok(plan)
}

/// 32-bit FNV-1a. Used for prometheus port probing and target placement,
/// where the hash must be stable across processes and releases.
pub(crate) fn fnv32a(s: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in s.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Give every prometheus output a distinct listen port from
/// `[base, base+pool)` via double hashing with open addressing. Outputs are
/// visited in key order so the same input set always produces the same
/// ports. User-specified `listen` values are honored and their ports
/// reserved first.
fn allocate_prometheus_ports(plan: &mut ApplyPlan) -> Result<()> {
    let pool = u32::from(PROMETHEUS_PORT_POOL);
    let mut taken = vec![false; pool as usize];
    let mut unassigned = Vec::new();

    for (key, cfg) in plan.outputs.iter() {
        if cfg.get("type").and_then(Value::as_str) != Some("prometheus") {
            continue;
        }
        match cfg.get("listen").and_then(Value::as_str) {
            Some(listen) => match parse_listen_port(listen) {
                Some(port) => {
                    plan.prometheus_ports.insert(key.clone(), port);
                    if let Some(slot) = port.checked_sub(PROMETHEUS_PORT_BASE) {
                        if u32::from(slot) < pool {
                            taken[slot as usize] = true;
                        }
                    }
                }
                None => warn!(output = %key, %listen, "unparsable listen address on prometheus output"),
            },
            None => unassigned.push(key.clone()),
        }
    }

    for key in unassigned {
        let h1 = fnv32a(&key) % pool;
        let stride = fnv32a(&format!("step:{key}")) % (pool - 1) + 1;
        let mut port = None;
        for i in 0..pool {
            let slot = ((h1 + i * stride) % pool) as usize;
            if !taken[slot] {
                taken[slot] = true;
                port = Some(PROMETHEUS_PORT_BASE + slot as u16);
                break;
            }
        }
        let port = port.ok_or(Error::PortPoolExhausted {
            base: PROMETHEUS_PORT_BASE,
            size: PROMETHEUS_PORT_POOL,
        })?;
        if let Some(cfg) = plan.outputs.get_mut(&key) {
            cfg.insert("listen".into(), Value::String(format!(":{port}")));
        }
        plan.prometheus_ports.insert(key, port);
    }
    Ok(())
}

fn parse_listen_port(listen: &str) -> Option<u16> {
    listen.rsplit_once(':')?.1.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        InputSpec, OutputSpec, ProcessorSpec, SubscriptionSpec, TargetProfileSpec, TargetSpec,
        TunnelMatch, TunnelTargetPolicySpec,
    };
    use kube::core::ObjectMeta;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        }
    }

    fn target(name: &str, address: &str, profile: &str) -> Target {
        Target {
            metadata: meta(name),
            spec: TargetSpec {
                address: address.into(),
                profile: profile.into(),
            },
            status: None,
        }
    }

    fn profile(name: &str) -> TargetProfile {
        TargetProfile {
            metadata: meta(name),
            spec: TargetProfileSpec {
                credentials_ref: None,
                tls: None,
                timeout: None,
                retry_timer: None,
                encoding: None,
                tcp_keepalive: None,
                proxy: None,
                compression: None,
            },
        }
    }

    fn subscription(name: &str) -> Subscription {
        Subscription {
            metadata: meta(name),
            spec: SubscriptionSpec {
                paths: vec!["/interfaces".into()],
                mode: Some("STREAM/SAMPLE".into()),
                sample_interval: Some("10s".into()),
                ..Default::default()
            },
        }
    }

    fn output(name: &str, output_type: &str, config: Option<&str>) -> Output {
        Output {
            metadata: meta(name),
            spec: OutputSpec {
                output_type: output_type.into(),
                config: config.map(String::from),
                service: None,
            },
        }
    }

    fn processor(name: &str) -> Processor {
        Processor {
            metadata: meta(name),
            spec: ProcessorSpec {
                processor_type: "event-strings".into(),
                config: None,
            },
        }
    }

    fn pipeline_data(name: &str) -> PipelineData {
        PipelineData {
            namespace: "default".into(),
            name: name.into(),
            ..Default::default()
        }
    }

    fn simple_pipeline() -> PipelineData {
        let mut p = pipeline_data("pipe");
        p.targets = vec![target("a", "1.1.1.1:57400", "p"), target("b", "1.1.1.2:57400", "p")];
        p.profiles.insert("p".into(), profile("p"));
        p.subscriptions = vec![subscription("s")];
        p.outputs = vec![output("o", "prometheus", None)];
        p
    }

    #[test]
    fn simple_pipeline_plan_shape() {
        let plan = build(&[simple_pipeline()], None).unwrap();

        assert_eq!(
            plan.targets.keys().cloned().collect::<Vec<_>>(),
            vec!["default/a", "default/b"]
        );
        assert_eq!(plan.targets["default/a"].subscriptions, vec!["default/s"]);

        assert_eq!(plan.subscriptions["default/s"].outputs, vec!["default/pipe/o"]);
        assert_eq!(plan.subscriptions["default/s"].mode.as_deref(), Some("STREAM"));

        let listen = plan.outputs["default/pipe/o"]["listen"].as_str().unwrap();
        let port: u16 = listen.trim_start_matches(':').parse().unwrap();
        assert!((PROMETHEUS_PORT_BASE..PROMETHEUS_PORT_BASE + PROMETHEUS_PORT_POOL).contains(&port));
        assert_eq!(plan.prometheus_ports["default/pipe/o"], port);
    }

    #[test]
    fn build_is_idempotent() {
        let pipelines = vec![simple_pipeline()];
        let first = build(&pipelines, None).unwrap();
        let second = build(&pipelines, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_profile_drops_target_without_error() {
        let mut p = simple_pipeline();
        p.targets.push(target("c", "1.1.1.3:57400", "missing"));
        let plan = build(&[p], None).unwrap();
        assert!(plan.targets.contains_key("default/a"));
        assert!(!plan.targets.contains_key("default/c"));
    }

    #[test]
    fn prometheus_ports_are_unique_and_stable() {
        let mut p = pipeline_data("pipe");
        for i in 0..200 {
            p.outputs.push(output(&format!("prom{i}"), "prometheus", None));
        }
        let plan = build(&[p.clone()], None).unwrap();
        let ports: BTreeSet<u16> = plan.prometheus_ports.values().copied().collect();
        assert_eq!(ports.len(), 200);
        for port in &ports {
            assert!((PROMETHEUS_PORT_BASE..PROMETHEUS_PORT_BASE + PROMETHEUS_PORT_POOL).contains(port));
        }
        let again = build(&[p], None).unwrap();
        assert_eq!(plan.prometheus_ports, again.prometheus_ports);
    }

    #[test]
    fn user_listen_is_honored_and_duplicates_skipped() {
        let mut p = pipeline_data("pipe");
        p.outputs = vec![
            output("one", "prometheus", Some("listen: \":9900\"")),
            output("two", "prometheus", Some("listen: \":9900\"")),
            output("three", "prometheus", None),
        ];
        let plan = build(&[p], None).unwrap();
        assert_eq!(plan.prometheus_ports["default/pipe/one"], 9900);
        // second output with the same listen is dropped entirely
        assert!(!plan.outputs.contains_key("default/pipe/two"));
        assert!(plan.outputs.contains_key("default/pipe/three"));
    }

    #[test]
    fn processor_chain_order_is_preserved_in_outputs() {
        let mut p = simple_pipeline();
        p.output_processors = vec![processor("c"), processor("a"), processor("c")];
        let plan = build(&[p], None).unwrap();
        assert_eq!(
            plan.outputs["default/pipe/o"]["event-processors"],
            serde_json::json!(["default/c", "default/a", "default/c"])
        );
        // materialized once each
        assert_eq!(plan.processors.len(), 2);
    }

    #[test]
    fn inputs_reference_their_pipelines_outputs() {
        let mut p = simple_pipeline();
        p.inputs = vec![Input {
            metadata: meta("in"),
            spec: InputSpec {
                input_type: "nats".into(),
                config: None,
            },
        }];
        let plan = build(&[p], None).unwrap();
        assert_eq!(
            plan.inputs["default/pipe/in"]["outputs"],
            serde_json::json!(["default/pipe/o"])
        );
    }

    #[test]
    fn shared_subscription_unions_outputs_across_pipelines() {
        let mut p1 = simple_pipeline();
        p1.targets.clear();
        let mut p2 = pipeline_data("other");
        p2.subscriptions = vec![subscription("s")];
        p2.outputs = vec![output("o2", "file", None)];
        let plan = build(&[p1, p2], None).unwrap();
        assert_eq!(
            plan.subscriptions["default/s"].outputs,
            vec!["default/other/o2", "default/pipe/o"]
        );
    }

    #[test]
    fn tunnel_policies_materialize_with_profiles() {
        let mut p = pipeline_data("pipe");
        p.profiles.insert("p".into(), profile("p"));
        p.tunnel_policies = vec![
            TunnelTargetPolicy {
                metadata: meta("pol"),
                spec: TunnelTargetPolicySpec {
                    tunnel_match: TunnelMatch {
                        target_type: Some("GNMI_GNOI".into()),
                        id: Some("edge-.*".into()),
                    },
                    profile: "p".into(),
                },
            },
            TunnelTargetPolicy {
                metadata: meta("orphan"),
                spec: TunnelTargetPolicySpec {
                    tunnel_match: TunnelMatch::default(),
                    profile: "missing".into(),
                },
            },
        ];
        let plan = build(&[p], None).unwrap();
        assert_eq!(plan.tunnel_target_matches.len(), 1);
        assert_eq!(
            plan.tunnel_target_matches["default/pol"].id.as_deref(),
            Some("edge-.*")
        );
    }

    #[test]
    fn invalid_output_config_aborts_the_build() {
        let mut p = pipeline_data("pipe");
        p.outputs = vec![output("bad", "file", Some("- not\n- a map"))];
        assert!(matches!(
            build(&[p], None),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn fnv32a_matches_reference_vectors() {
        // standard FNV-1a test vectors
        assert_eq!(fnv32a(""), 0x811c9dc5);
        assert_eq!(fnv32a("a"), 0xe40c292c);
        assert_eq!(fnv32a("foobar"), 0xbf9cf968);
    }
}
