use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("invalid config on {name}: {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("prometheus listen port pool exhausted (base {base}, size {size})")]
    PortPoolExhausted { base: u16, size: u16 },

    #[error("Http error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("apply rejected by {pod}: HTTP {status}")]
    ApplyFailed { pod: String, status: u16 },

    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),

    #[error("tls material unavailable: {0}")]
    TlsMaterial(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::FinalizerError(_) => "finalizer",
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::InvalidConfig { .. } => "invalid_config",
            Error::PortPoolExhausted { .. } => "port_pool",
            Error::HttpError(_) => "http",
            Error::ApplyFailed { .. } => "apply",
            Error::MissingObjectKey(_) => "missing_key",
            Error::TlsMaterial(_) => "tls",
            Error::Timeout(_) => "timeout",
            Error::IoError(_) => "io",
        }
    }
}

pub mod cert_manager;
pub mod certs;
pub mod children;
pub mod cluster;
pub mod collector;
pub mod conditions;
pub mod crd;
pub mod distribute;
pub mod operator;
pub mod pipeline;
pub mod plan;
pub mod resolver;
pub mod selector;
pub mod target_state;
pub mod telemetry;
pub mod translate;
