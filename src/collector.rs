//! HTTP client for a single collector pod: config apply, target snapshot
//! polling, and the target-state SSE stream.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::plan::ApplyPlan;
use crate::{Error, Result};

pub const APPLY_PATH: &str = "/api/v1/config/apply";
pub const TARGETS_PATH: &str = "/api/v1/targets";
pub const SSE_PATH: &str = "/api/v1/sse/targets?store=state";

const APPLY_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const ENV_TLS_CERT: &str = "GNMIC_TLS_CERT";
const ENV_TLS_KEY: &str = "GNMIC_TLS_KEY";
const ENV_TLS_CA: &str = "GNMIC_TLS_CA";

const DEFAULT_TLS_CERT: &str = "/etc/gnmic-operator/certs/tls.crt";
const DEFAULT_TLS_KEY: &str = "/etc/gnmic-operator/certs/tls.key";
const DEFAULT_TLS_CA: &str = "/etc/gnmic-operator/ca/ca.crt";

fn env_path(var: &str, default: &str) -> PathBuf {
    env::var(var).map(PathBuf::from).unwrap_or_else(|_| default.into())
}

/// Client certificate and trust roots for talking to TLS-enabled pods.
/// The identity comes from the operator's own mounted certificate
/// (overridable via `GNMIC_TLS_*`); roots are the issuer CA backing the
/// cluster's certificates plus any configured bundle.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterial {
    identity_pem: Vec<u8>,
    roots: Vec<Vec<u8>>,
}

impl TlsMaterial {
    pub async fn load(extra_roots: Vec<Vec<u8>>) -> Result<Self> {
        let cert_path = env_path(ENV_TLS_CERT, DEFAULT_TLS_CERT);
        let key_path = env_path(ENV_TLS_KEY, DEFAULT_TLS_KEY);
        let cert = fs::read(&cert_path).await.map_err(|e| {
            Error::TlsMaterial(format!("client cert {}: {e}", cert_path.display()))
        })?;
        let key = fs::read(&key_path)
            .await
            .map_err(|e| Error::TlsMaterial(format!("client key {}: {e}", key_path.display())))?;
        let mut identity_pem = cert;
        identity_pem.extend_from_slice(&key);

        let mut roots = extra_roots;
        let ca_path = env_path(ENV_TLS_CA, DEFAULT_TLS_CA);
        if let Ok(ca) = fs::read(&ca_path).await {
            roots.push(ca);
        }
        Ok(Self { identity_pem, roots })
    }
}

pub struct CollectorClient {
    http: reqwest::Client,
    base_url: String,
}

impl CollectorClient {
    /// `base_url` is `http[s]://<pod-dns>:<rest-port>`, no trailing slash.
    pub fn new(base_url: &str, tls: Option<&TlsMaterial>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .use_rustls_tls();
        if let Some(tls) = tls {
            builder = builder.identity(reqwest::Identity::from_pem(&tls.identity_pem)?);
            for root in &tls.roots {
                builder = builder.add_root_certificate(reqwest::Certificate::from_pem(root)?);
            }
        }
        Ok(Self {
            http: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Push a per-pod apply plan. Anything but 2xx is a failure.
    pub async fn apply(&self, plan: &ApplyPlan) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}{APPLY_PATH}", self.base_url))
            .timeout(APPLY_TIMEOUT)
            .json(plan)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::ApplyFailed {
                pod: self.base_url.clone(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }

    /// Full target snapshot, the recovery path for events lost while the
    /// SSE stream was down.
    pub async fn targets(&self) -> Result<Vec<TargetEntry>> {
        let resp = self
            .http
            .get(format!("{}{TARGETS_PATH}", self.base_url))
            .timeout(APPLY_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Open the state stream. The caller owns read timeouts and reconnect
    /// policy; the response body is a long-lived chunked stream.
    pub async fn open_state_stream(&self) -> Result<reqwest::Response> {
        let resp = self
            .http
            .get(format!("{}{SSE_PATH}", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp)
    }
}

/// One pod's view of a target, as served by both the snapshot endpoint and
/// SSE `object` payloads.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TargetState {
    pub intended_state: Option<String>,
    pub state: Option<String>,
    pub failed_reason: Option<String>,
    pub last_updated: Option<String>,
    pub connection_state: Option<String>,
    #[serde(default)]
    pub subscriptions: BTreeMap<String, String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TargetEntry {
    pub name: String,
    #[serde(default)]
    pub state: Option<TargetState>,
}

/// Decoded `data:` payload of a state stream frame.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct StateEvent {
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub store: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub object: Option<TargetState>,
}

impl StateEvent {
    /// Only target-state events are interesting; the stream multiplexes
    /// other stores/kinds.
    pub fn is_target_state(&self) -> bool {
        self.kind == "targets" && self.store == "state"
    }

    /// The payload's own event-type wins over the SSE `event:` line.
    pub fn effective_type<'a>(&'a self, frame_event: Option<&'a str>) -> &'a str {
        self.event_type
            .as_deref()
            .or(frame_event)
            .unwrap_or("update")
    }
}

/// A parsed SSE frame: optional `event:` name and the joined `data:` lines.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn decode(&self) -> Option<StateEvent> {
        serde_json::from_str(&self.data).ok()
    }
}

/// Incremental SSE parser. Feed it raw body chunks; it emits complete
/// frames. Comment lines (`: keepalive`) and unknown fields are dropped,
/// per the SSE wire format.
#[derive(Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            self.line(line, &mut frames);
        }
        frames
    }

    fn line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                frames.push(SseFrame {
                    event: self.event.take(),
                    data: self.data.join("\n"),
                });
                self.data.clear();
            } else {
                self.event = None;
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("event:") {
            self.event = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_frame() {
        let mut parser = SseParser::default();
        let frames =
            parser.push(b"event: update\ndata: {\"kind\":\"targets\"}\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: Some("update".into()),
                data: "{\"kind\":\"targets\"}".into(),
            }]
        );
    }

    #[test]
    fn reassembles_frames_split_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"event: del").is_empty());
        assert!(parser.push(b"ete\ndata: {\"name\":").is_empty());
        let frames = parser.push(b"\"default/a\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("delete"));
        assert_eq!(frames[0].data, "{\"name\":\"default/a\"}");
    }

    #[test]
    fn keepalive_comments_and_blank_lines_are_skipped() {
        let mut parser = SseParser::default();
        let frames = parser.push(b": ping\n\n: ping\ndata: {}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{}");
        assert_eq!(frames[0].event, None);
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let mut parser = SseParser::default();
        let frames = parser.push(b"event: create\r\ndata: {}\r\n\r\n");
        assert_eq!(frames[0].event.as_deref(), Some("create"));
    }

    #[test]
    fn multiple_data_lines_join_with_newline() {
        let mut parser = SseParser::default();
        let frames = parser.push(b"data: {\ndata: }\n\n");
        assert_eq!(frames[0].data, "{\n}");
    }

    #[test]
    fn event_name_does_not_leak_into_next_frame() {
        let mut parser = SseParser::default();
        let frames = parser.push(b"event: delete\ndata: {}\n\ndata: {}\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("delete"));
        assert_eq!(frames[1].event, None);
    }

    #[test]
    fn state_events_filter_on_kind_and_store() {
        let frame = SseFrame {
            event: Some("update".into()),
            data: r#"{"store":"state","kind":"targets","name":"default/a","object":{"state":"running","connection-state":"READY"}}"#.into(),
        };
        let event = frame.decode().unwrap();
        assert!(event.is_target_state());
        assert_eq!(event.effective_type(frame.event.as_deref()), "update");
        let state = event.object.unwrap();
        assert_eq!(state.state.as_deref(), Some("running"));
        assert_eq!(state.connection_state.as_deref(), Some("READY"));

        let other = SseFrame {
            event: None,
            data: r#"{"store":"config","kind":"targets","name":"x"}"#.into(),
        };
        assert!(!other.decode().unwrap().is_target_state());
    }

    #[test]
    fn payload_event_type_wins_over_frame_event() {
        let frame = SseFrame {
            event: Some("update".into()),
            data: r#"{"store":"state","kind":"targets","name":"a","event-type":"delete"}"#.into(),
        };
        let event = frame.decode().unwrap();
        assert_eq!(event.effective_type(frame.event.as_deref()), "delete");
    }
}
