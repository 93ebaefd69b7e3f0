//! Typed error hierarchy for the batchpilot orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `ProviderError` — unified taxonomy over the LLM provider adapters
//! - `ManifestError` — run-state load/save failures
//! - `ExprError` — expression lexing, parsing, and evaluation failures

use thiserror::Error;

/// Unified error taxonomy over the provider adapters.
///
/// Routing is driven by the variant, never by substring matching on the
/// message: `"400"` appears in too many unrelated contexts to be a signal.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Rate limited (HTTP 429). Retry with exponential backoff.
    #[error("Rate limited by {provider}: {message}")]
    RateLimit { provider: String, message: String },

    /// Authentication or billing failure (HTTP 401/402/403). Aborts the run;
    /// no retry at any layer.
    #[error("Authentication/billing error from {provider} (status {status}): {message}")]
    Authentication {
        provider: String,
        status: u16,
        message: String,
    },

    /// Transient transport failure (5xx, timeout, connection reset). Retryable.
    #[error("Transient error from {provider}: {message}")]
    Transient { provider: String, message: String },

    /// Any other structured API error. Logged and retried per policy.
    #[error("Provider error from {provider} (status {status}): {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    /// The provider returned a payload we could not interpret.
    #[error("Malformed response from {provider}: {message}")]
    MalformedResponse { provider: String, message: String },

    /// Batch id unknown to the provider.
    #[error("Batch {batch_id} not found at {provider}")]
    BatchNotFound { provider: String, batch_id: String },
}

impl ProviderError {
    /// Fatal errors bypass every retry layer and abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Retryable errors go through the adapter's backoff loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit { .. } | Self::Transient { .. } | Self::Api { .. }
        )
    }

    /// Classify a reqwest transport failure as a transient provider error.
    pub fn from_transport(provider: &str, err: &reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("request timed out: {err}")
        } else {
            err.to_string()
        };
        Self::Transient {
            provider: provider.to_string(),
            message,
        }
    }

    /// Classify an HTTP status + body into the taxonomy.
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        let message = truncate_body(body);
        match status {
            429 => Self::RateLimit {
                provider: provider.to_string(),
                message,
            },
            401 | 402 | 403 => Self::Authentication {
                provider: provider.to_string(),
                status,
                message,
            },
            500..=599 | 408 => Self::Transient {
                provider: provider.to_string(),
                message,
            },
            _ => Self::Api {
                provider: provider.to_string(),
                status,
                message,
            },
        }
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 500;
    if body.len() > MAX {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    } else {
        body.to_string()
    }
}

/// Errors from loading or saving run state.
///
/// `Missing` and `Unparseable` are distinct because callers react
/// differently: a missing manifest means "not a run directory", an
/// unparseable one means corruption that must be surfaced, never repaired
/// silently.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("No manifest found at {path}")]
    Missing { path: std::path::PathBuf },

    #[error("Manifest at {path} is unparseable: {source}")]
    Unparseable {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to read manifest at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to save manifest at {path}: {source}")]
    Save {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the sandboxed expression evaluator.
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("Syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("Undefined name '{name}'")]
    Undefined { name: String },

    #[error("Type error: {0}")]
    Type(String),

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Evaluation error: {0}")]
    Eval(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_are_fatal_and_not_retryable() {
        let err = ProviderError::from_status("openai", 401, "invalid api key");
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limit_is_retryable() {
        let err = ProviderError::from_status("anthropic", 429, "slow down");
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn server_errors_are_transient() {
        let err = ProviderError::from_status("gemini", 503, "overloaded");
        assert!(matches!(err, ProviderError::Transient { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn status_classification_is_structural_not_substring() {
        // A 5xx body mentioning "400" must not classify as fatal.
        let err = ProviderError::from_status("openai", 500, "upstream said 400 bad gateway");
        assert!(!err.is_fatal());
        assert!(err.is_retryable());
    }

    #[test]
    fn manifest_missing_and_unparseable_are_distinct() {
        let missing = ManifestError::Missing {
            path: "/tmp/x/MANIFEST.json".into(),
        };
        assert!(matches!(missing, ManifestError::Missing { .. }));
        let bad: serde_json::Error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let unparseable = ManifestError::Unparseable {
            path: "/tmp/x/MANIFEST.json".into(),
            source: bad,
        };
        assert!(matches!(unparseable, ManifestError::Unparseable { .. }));
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(2000);
        let err = ProviderError::from_status("openai", 500, &body);
        assert!(err.to_string().len() < 700);
    }
}
