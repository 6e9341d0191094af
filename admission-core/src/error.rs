use thiserror::Error;

/// Error kinds produced by the core. Mirrors the kinds named in the design
/// (not type names): Unauthenticated, Configuration, Argument, Upstream.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Token missing, malformed, expired, nbf in the future, wrong audience,
    /// unknown issuer, signature invalid, or key-fetch failure.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Duplicate issuers, missing authentication section, unsupported key
    /// type. Raised at load time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Service-name mismatch into an aggregator, invalid distribution
    /// parameters, merge of mismatched metric value variants. Programmer
    /// error; callers should not retry.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Check/Quota/Report call to the upstream Service Control API failed.
    #[error("upstream error: {0}")]
    Upstream(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn argument(msg: impl Into<String>) -> Self {
        Self::Argument(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }
}

impl From<jsonwebtoken::errors::Error> for CoreError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        CoreError::Unauthenticated(value.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(value: reqwest::Error) -> Self {
        CoreError::Unauthenticated(format!("key fetch failed: {value}"))
    }
}
