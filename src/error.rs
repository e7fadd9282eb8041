use derive_more::From;
use k8s_openapi::serde_json;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Kube(kube::Error),

    #[from]
    Infer(kube::config::InferConfigError),

    #[from]
    Watch(kube::runtime::watcher::Error),

    #[from]
    HttpHeader(hyper::http::Error),

    #[from]
    Io(std::io::Error),

    /// Rejected configuration, reported at construction time
    InvalidConfig(String),

    /// Resource type the cluster does not serve
    UnknownResourceType(String),

    /// Resource type exists but does not support the verb
    UnsupportedVerb { resource_type: String, verb: String },

    /// An object could not be decoded into a `Resource`
    Decode(String),

    /// The watcher has been stopped and cannot accept new subscriptions
    WatcherStopped,

    /// Watching is turned off in the configuration
    WatchDisabled,

    /// Health check failure with a reason
    Unhealthy(String),

    /// The manager has been closed
    Closed,

    /// Custom error message
    Custom(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::InvalidConfig(msg) => write!(fmt, "invalid configuration: {msg}"),
            Self::UnknownResourceType(rt) => write!(fmt, "unknown resource type: {rt}"),
            Self::UnsupportedVerb {
                resource_type,
                verb,
            } => write!(fmt, "resource type {resource_type} does not support {verb}"),
            Self::Decode(msg) => write!(fmt, "decode failure: {msg}"),
            Self::WatcherStopped => write!(fmt, "watcher is stopped"),
            Self::WatchDisabled => write!(fmt, "watching is disabled"),
            Self::Unhealthy(reason) => write!(fmt, "unhealthy: {reason}"),
            Self::Closed => write!(fmt, "cache manager is closed"),
            Self::Custom(msg) => write!(fmt, "{msg}"),
            _ => write!(fmt, "{self:?}"),
        }
    }
}

impl std::error::Error for Error {}
