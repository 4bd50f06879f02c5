//! Pure translators from declarative specs to the collector's native
//! configuration entries. Everything here is deterministic; the only
//! failure mode is an undecodable user-supplied `config` blob.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crd::{
    ClientTls, InputSpec, OutputSpec, ProcessorSpec, SubscriptionSpec, Target, TargetProfileSpec,
    TunnelTargetPolicySpec,
};
use crate::{Error, Result};

/// Mount point of the shared collector→target client certificate.
pub const CLIENT_TLS_DIR: &str = "/etc/gnmic/client-tls";

const DEFAULT_TIMEOUT: &str = "10s";
const DEFAULT_RETRY_TIMER: &str = "2s";

/// Username/password material read from a profile's credentials Secret.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Collector-native target entry.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TargetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub timeout: String,
    pub retry_timer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_verify: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_ca: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_min_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_max_version: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub cipher_suites: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_keepalive: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub subscriptions: Vec<String>,
}

/// Collector-native subscription entry. `outputs` is wired up by the plan
/// builder once all pipelines are aggregated.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SubscriptionConfig {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppress_redundant: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qos: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updates_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub stream_subscriptions: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub outputs: Vec<String>,
}

/// Tunnel match entry: a target config without an address, selected by
/// tunnel type/id regex.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TunnelMatchConfig {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub config: TargetConfig,
}

/// Base connection config shared by targets and tunnel matches.
fn connection_config(
    profile: &TargetProfileSpec,
    credentials: Option<&Credentials>,
    client_tls: Option<&ClientTls>,
) -> TargetConfig {
    let mut cfg = TargetConfig {
        timeout: profile.timeout.clone().unwrap_or_else(|| DEFAULT_TIMEOUT.into()),
        retry_timer: profile
            .retry_timer
            .clone()
            .unwrap_or_else(|| DEFAULT_RETRY_TIMER.into()),
        encoding: profile.encoding.clone(),
        tcp_keepalive: profile.tcp_keepalive.clone(),
        proxy: profile.proxy.clone(),
        compression: profile.compression.clone(),
        ..TargetConfig::default()
    };
    if let Some(creds) = credentials {
        cfg.username = creds.username.clone();
        cfg.password = creds.password.clone();
    }
    match (client_tls, profile.tls.as_ref()) {
        (None, None) => {
            cfg.insecure = Some(true);
        }
        (None, Some(tls)) => {
            cfg.skip_verify = Some(true);
            cfg.tls_min_version = tls.min_version.clone();
            cfg.tls_max_version = tls.max_version.clone();
            cfg.cipher_suites = tls.cipher_suites.clone();
        }
        (Some(client), tls) => {
            cfg.tls_cert = Some(format!("{CLIENT_TLS_DIR}/tls.crt"));
            cfg.tls_key = Some(format!("{CLIENT_TLS_DIR}/tls.key"));
            if client.ca {
                cfg.tls_ca = Some(format!("{CLIENT_TLS_DIR}/ca.crt"));
                cfg.skip_verify = Some(false);
            } else {
                cfg.skip_verify = Some(true);
            }
            if let Some(tls) = tls {
                cfg.tls_server_name = tls.server_name.clone();
                cfg.tls_min_version = tls.min_version.clone();
                cfg.tls_max_version = tls.max_version.clone();
                cfg.cipher_suites = tls.cipher_suites.clone();
            }
        }
    }
    cfg
}

pub fn target_config(
    target: &Target,
    profile: &TargetProfileSpec,
    credentials: Option<&Credentials>,
    client_tls: Option<&ClientTls>,
) -> TargetConfig {
    let mut cfg = connection_config(profile, credentials, client_tls);
    cfg.address = Some(target.spec.address.clone());
    cfg
}

pub fn tunnel_target_match(
    policy: &TunnelTargetPolicySpec,
    profile: &TargetProfileSpec,
    credentials: Option<&Credentials>,
    client_tls: Option<&ClientTls>,
) -> TunnelMatchConfig {
    TunnelMatchConfig {
        target_type: policy.tunnel_match.target_type.clone(),
        id: policy.tunnel_match.id.clone(),
        config: connection_config(profile, credentials, client_tls),
    }
}

pub fn subscription_config(spec: &SubscriptionSpec) -> SubscriptionConfig {
    // `STREAM/SAMPLE` style modes split into mode + stream-mode.
    let (mode, stream_mode) = match spec.mode.as_deref() {
        Some(m) => match m.split_once('/') {
            Some((mode, stream)) => (Some(mode.to_string()), Some(stream.to_string())),
            None => (Some(m.to_string()), None),
        },
        None => (None, None),
    };
    SubscriptionConfig {
        paths: spec.paths.clone(),
        prefix: spec.prefix.clone(),
        mode,
        stream_mode,
        sample_interval: spec.sample_interval.clone(),
        heartbeat_interval: spec.heartbeat_interval.clone(),
        suppress_redundant: spec.suppress_redundant,
        encoding: spec.encoding.clone(),
        qos: spec.qos,
        depth: spec.depth,
        updates_only: spec.updates_only,
        history: spec
            .history
            .as_ref()
            .and_then(|h| serde_json::to_value(h).ok()),
        stream_subscriptions: spec
            .stream_subscriptions
            .iter()
            .filter_map(|s| serde_json::to_value(s).ok())
            .collect(),
        outputs: Vec::new(),
    }
}

pub fn output_config(
    name: &str,
    spec: &OutputSpec,
    processors: &[String],
    addresses: &[String],
) -> Result<Map<String, Value>> {
    let mut cfg = decode_config(name, spec.config.as_deref())?;
    match spec.output_type.as_str() {
        "nats" | "jetstream" => {
            if !addresses.is_empty() {
                let joined = addresses
                    .iter()
                    .map(|a| format!("nats://{a}"))
                    .collect::<Vec<_>>()
                    .join(",");
                cfg.insert("address".into(), Value::String(joined));
            }
        }
        "kafka" => {
            if !addresses.is_empty() {
                cfg.insert("address".into(), Value::String(addresses.join(",")));
            }
        }
        "prometheus_write" | "influxdb" => {
            if !addresses.is_empty() {
                let scheme = if cfg.contains_key("tls") { "https" } else { "http" };
                let joined = addresses
                    .iter()
                    .map(|a| format!("{scheme}://{a}"))
                    .collect::<Vec<_>>()
                    .join(",");
                cfg.insert("url".into(), Value::String(joined));
            }
        }
        "prometheus" => {
            cfg.entry("path".to_string())
                .or_insert_with(|| Value::String("/metrics".into()));
        }
        _ => {}
    }
    cfg.insert("type".into(), Value::String(spec.output_type.clone()));
    if !processors.is_empty() {
        cfg.insert(
            "event-processors".into(),
            Value::Array(processors.iter().cloned().map(Value::String).collect()),
        );
    }
    Ok(cfg)
}

pub fn input_config(
    name: &str,
    spec: &InputSpec,
    outputs: &[String],
    processors: &[String],
) -> Result<Map<String, Value>> {
    let mut cfg = decode_config(name, spec.config.as_deref())?;
    cfg.insert("type".into(), Value::String(spec.input_type.clone()));
    cfg.insert(
        "outputs".into(),
        Value::Array(outputs.iter().cloned().map(Value::String).collect()),
    );
    if !processors.is_empty() {
        cfg.insert(
            "event-processors".into(),
            Value::Array(processors.iter().cloned().map(Value::String).collect()),
        );
    }
    Ok(cfg)
}

/// Processors are wrapped under their type key, the shape the collector's
/// processor registry expects.
pub fn processor_config(name: &str, spec: &ProcessorSpec) -> Result<Map<String, Value>> {
    let inner = decode_config(name, spec.config.as_deref())?;
    let mut cfg = Map::new();
    cfg.insert(spec.processor_type.clone(), Value::Object(inner));
    Ok(cfg)
}

/// Decode a user-supplied YAML/JSON blob into a string-keyed map.
pub fn decode_config(name: &str, raw: Option<&str>) -> Result<Map<String, Value>> {
    let raw = match raw {
        Some(r) if !r.trim().is_empty() => r,
        _ => return Ok(Map::new()),
    };
    let parsed: serde_yaml::Value = serde_yaml::from_str(raw).map_err(|e| Error::InvalidConfig {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    match normalize(name, parsed)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(Error::InvalidConfig {
            name: name.to_string(),
            reason: format!("config must be a mapping, got {other}"),
        }),
    }
}

/// YAML mappings may be keyed by any scalar; JSON requires string keys.
/// Stringify keys recursively so the config round-trips through the apply
/// POST body.
fn normalize(name: &str, value: serde_yaml::Value) -> Result<Value> {
    let invalid = |reason: String| Error::InvalidConfig {
        name: name.to_string(),
        reason,
    };
    Ok(match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                let f = n.as_f64().ok_or_else(|| invalid("unrepresentable number".into()))?;
                Value::Number(
                    serde_json::Number::from_f64(f)
                        .ok_or_else(|| invalid(format!("unrepresentable number {f}")))?,
                )
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(seq) => Value::Array(
            seq.into_iter()
                .map(|v| normalize(name, v))
                .collect::<Result<_>>()?,
        ),
        serde_yaml::Value::Mapping(mapping) => {
            let mut map = Map::new();
            for (k, v) in mapping {
                let key = match k {
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    other => return Err(invalid(format!("unsupported map key {other:?}"))),
                };
                map.insert(key, normalize(name, v)?);
            }
            Value::Object(map)
        }
        serde_yaml::Value::Tagged(tagged) => normalize(name, tagged.value)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{IssuerRef, ProfileTls, TargetSpec};
    use kube::core::ObjectMeta;
    use serde_json::json;

    fn target(address: &str) -> Target {
        Target {
            metadata: ObjectMeta {
                name: Some("t1".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: TargetSpec {
                address: address.into(),
                profile: "p".into(),
            },
            status: None,
        }
    }

    fn profile() -> TargetProfileSpec {
        TargetProfileSpec {
            credentials_ref: None,
            tls: None,
            timeout: None,
            retry_timer: None,
            encoding: Some("json_ietf".into()),
            tcp_keepalive: None,
            proxy: None,
            compression: None,
        }
    }

    fn client_tls(ca: bool) -> ClientTls {
        ClientTls {
            issuer_ref: Some(IssuerRef {
                name: "ca-issuer".into(),
                kind: "Issuer".into(),
            }),
            ca,
        }
    }

    #[test]
    fn plaintext_target_is_insecure() {
        let cfg = target_config(&target("1.1.1.1:57400"), &profile(), None, None);
        assert_eq!(cfg.address.as_deref(), Some("1.1.1.1:57400"));
        assert_eq!(cfg.insecure, Some(true));
        assert_eq!(cfg.skip_verify, None);
        assert_eq!(cfg.timeout, "10s");
        assert_eq!(cfg.retry_timer, "2s");
        assert_eq!(cfg.encoding.as_deref(), Some("json_ietf"));
    }

    #[test]
    fn profile_tls_without_client_cert_skips_verification() {
        let mut p = profile();
        p.tls = Some(ProfileTls {
            server_name: Some("router".into()),
            min_version: Some("1.2".into()),
            max_version: None,
            cipher_suites: vec!["TLS_AES_128_GCM_SHA256".into()],
        });
        let cfg = target_config(&target("r:57400"), &p, None, None);
        assert_eq!(cfg.insecure, None);
        assert_eq!(cfg.skip_verify, Some(true));
        assert_eq!(cfg.tls_min_version.as_deref(), Some("1.2"));
        assert_eq!(cfg.cipher_suites, vec!["TLS_AES_128_GCM_SHA256".to_string()]);
        assert!(cfg.tls_cert.is_none());
    }

    #[test]
    fn cluster_client_tls_mounts_cert_paths() {
        let cfg = target_config(&target("r:57400"), &profile(), None, Some(&client_tls(true)));
        assert_eq!(cfg.tls_cert.as_deref(), Some("/etc/gnmic/client-tls/tls.crt"));
        assert_eq!(cfg.tls_key.as_deref(), Some("/etc/gnmic/client-tls/tls.key"));
        assert_eq!(cfg.tls_ca.as_deref(), Some("/etc/gnmic/client-tls/ca.crt"));
        assert_eq!(cfg.skip_verify, Some(false));

        let cfg = target_config(&target("r:57400"), &profile(), None, Some(&client_tls(false)));
        assert_eq!(cfg.tls_ca, None);
        assert_eq!(cfg.skip_verify, Some(true));
    }

    #[test]
    fn client_tls_layers_profile_settings_on_top() {
        let mut p = profile();
        p.tls = Some(ProfileTls {
            server_name: Some("router.lab".into()),
            min_version: Some("1.3".into()),
            max_version: Some("1.3".into()),
            cipher_suites: vec![],
        });
        let cfg = target_config(&target("r:57400"), &p, None, Some(&client_tls(true)));
        assert_eq!(cfg.tls_server_name.as_deref(), Some("router.lab"));
        assert_eq!(cfg.tls_min_version.as_deref(), Some("1.3"));
        assert_eq!(cfg.skip_verify, Some(false));
    }

    #[test]
    fn credentials_propagate() {
        let creds = Credentials {
            username: Some("admin".into()),
            password: Some("secret".into()),
        };
        let cfg = target_config(&target("r:57400"), &profile(), Some(&creds), None);
        assert_eq!(cfg.username.as_deref(), Some("admin"));
        assert_eq!(cfg.password.as_deref(), Some("secret"));
    }

    #[test]
    fn stream_sample_mode_splits() {
        let spec = SubscriptionSpec {
            paths: vec!["/interfaces".into()],
            mode: Some("STREAM/SAMPLE".into()),
            sample_interval: Some("10s".into()),
            ..Default::default()
        };
        let cfg = subscription_config(&spec);
        assert_eq!(cfg.mode.as_deref(), Some("STREAM"));
        assert_eq!(cfg.stream_mode.as_deref(), Some("SAMPLE"));
        assert_eq!(cfg.sample_interval.as_deref(), Some("10s"));

        let spec = SubscriptionSpec {
            mode: Some("ONCE".into()),
            ..Default::default()
        };
        let cfg = subscription_config(&spec);
        assert_eq!(cfg.mode.as_deref(), Some("ONCE"));
        assert_eq!(cfg.stream_mode, None);
    }

    #[test]
    fn nats_output_gets_comma_joined_addresses() {
        let spec = OutputSpec {
            output_type: "nats".into(),
            config: Some("subject: telemetry".into()),
            service: None,
        };
        let cfg = output_config(
            "default/p/o",
            &spec,
            &[],
            &["nats-0:4222".into(), "nats-1:4222".into()],
        )
        .unwrap();
        assert_eq!(cfg["address"], json!("nats://nats-0:4222,nats://nats-1:4222"));
        assert_eq!(cfg["subject"], json!("telemetry"));
        assert_eq!(cfg["type"], json!("nats"));
    }

    #[test]
    fn prometheus_write_scheme_follows_tls_presence() {
        let spec = OutputSpec {
            output_type: "prometheus_write".into(),
            config: Some("tls: {}\n".into()),
            service: None,
        };
        let cfg = output_config("o", &spec, &[], &["prom:9090".into()]).unwrap();
        assert_eq!(cfg["url"], json!("https://prom:9090"));

        let spec = OutputSpec {
            output_type: "prometheus_write".into(),
            config: None,
            service: None,
        };
        let cfg = output_config("o", &spec, &[], &["prom:9090".into()]).unwrap();
        assert_eq!(cfg["url"], json!("http://prom:9090"));
    }

    #[test]
    fn prometheus_path_defaults_but_is_not_overwritten() {
        let spec = OutputSpec {
            output_type: "prometheus".into(),
            config: None,
            service: None,
        };
        let cfg = output_config("o", &spec, &[], &[]).unwrap();
        assert_eq!(cfg["path"], json!("/metrics"));

        let spec = OutputSpec {
            output_type: "prometheus".into(),
            config: Some("path: /telemetry".into()),
            service: None,
        };
        let cfg = output_config("o", &spec, &[], &[]).unwrap();
        assert_eq!(cfg["path"], json!("/telemetry"));
    }

    #[test]
    fn processors_attach_in_given_order() {
        let spec = OutputSpec {
            output_type: "file".into(),
            config: None,
            service: None,
        };
        let cfg = output_config("o", &spec, &["default/c".into(), "default/a".into()], &[]).unwrap();
        assert_eq!(cfg["event-processors"], json!(["default/c", "default/a"]));
    }

    #[test]
    fn input_config_carries_outputs() {
        let spec = InputSpec {
            input_type: "kafka".into(),
            config: Some("topic: telemetry".into()),
        };
        let cfg = input_config("i", &spec, &["default/p/o".into()], &[]).unwrap();
        assert_eq!(cfg["type"], json!("kafka"));
        assert_eq!(cfg["outputs"], json!(["default/p/o"]));
        assert_eq!(cfg["topic"], json!("telemetry"));
    }

    #[test]
    fn processor_wraps_config_under_type() {
        let spec = ProcessorSpec {
            processor_type: "event-strings".into(),
            config: Some("value-names: [\".*\"]".into()),
        };
        let cfg = processor_config("p", &spec).unwrap();
        assert_eq!(cfg["event-strings"], json!({"value-names": [".*"]}));
    }

    #[test]
    fn yaml_non_string_keys_are_stringified() {
        let cfg = decode_config("o", Some("ports:\n  57400: grpc\n  true: yes\n")).unwrap();
        assert_eq!(cfg["ports"], json!({"57400": "grpc", "true": "yes"}));
    }

    #[test]
    fn invalid_yaml_fails_the_translation() {
        let err = decode_config("default/o", Some(": not yaml: [")).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));

        let err = decode_config("default/o", Some("- a\n- b\n")).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn tunnel_match_has_no_address() {
        let policy = TunnelTargetPolicySpec {
            tunnel_match: crate::crd::TunnelMatch {
                target_type: Some("GNMI_GNOI".into()),
                id: Some("router.*".into()),
            },
            profile: "p".into(),
        };
        let cfg = tunnel_target_match(&policy, &profile(), None, None);
        assert_eq!(cfg.target_type.as_deref(), Some("GNMI_GNOI"));
        assert_eq!(cfg.id.as_deref(), Some("router.*"));
        assert_eq!(cfg.config.address, None);
        assert_eq!(cfg.config.insecure, Some(true));
    }
}
