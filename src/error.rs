use thiserror::Error;

/// The taxonomy of error kinds the engine must distinguish, per the
/// propagation policy: only `Config` escapes the process boundary, the
/// rest are caught and logged at their nearest component.
#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no credentials available for host {host}")]
    Credential { host: String },

    #[error("transport error contacting {host}: {message}")]
    Transport { host: String, message: String },

    #[error("transport timeout contacting {host} after {timeout_secs}s")]
    TransportTimeout { host: String, timeout_secs: u64 },

    #[error("transport {transport} is not supported by the remote executor")]
    UnsupportedTransport { transport: String },

    #[error("failed to parse event fragment: {0}")]
    Parse(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("notifier error delivering to {url}: {message}")]
    Notifier { url: String, message: String },

    #[error("remediation failed on {host}: {message}")]
    Remediation { host: String, message: String },
}

pub type Result<T> = std::result::Result<T, SentinelError>;

impl From<duckdb::Error> for SentinelError {
    fn from(e: duckdb::Error) -> Self {
        SentinelError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for SentinelError {
    fn from(e: reqwest::Error) -> Self {
        SentinelError::Notifier {
            url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            message: e.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for SentinelError {
    fn from(e: serde_yaml::Error) -> Self {
        SentinelError::Config(e.to_string())
    }
}
