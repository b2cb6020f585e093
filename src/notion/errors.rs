//! Notion API Error Types
//!
//! Structured error handling for calls against the Notion REST API.
//! Separates transient failures (retried by the client) from permanent ones.

use std::error::Error as StdError;
use std::io;

/// Notion API error types
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Non-2xx response other than a rate limit. Never retried.
    #[error("Notion API error ({status}): {message} ({code})")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Every attempt hit a rate limit or a transient network failure.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Network error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Request cancelled")]
    Cancelled,
}

/// Error body returned by the Notion API on failure
#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl UpstreamError {
    /// Build an API error from a status code and the raw response body.
    ///
    /// Falls back to the raw body as the message when it is not the usual
    /// `{code, message}` JSON.
    pub fn from_status(status: u16, body: &str) -> Self {
        let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
        let message = if parsed.message.is_empty() {
            body.trim().to_string()
        } else {
            parsed.message
        };
        let code = if parsed.code.is_empty() {
            "unknown".to_string()
        } else {
            parsed.code
        };
        UpstreamError::Api {
            status,
            code,
            message,
        }
    }

    /// Whether this error is worth another attempt
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Transport(e) => is_transient_transport(e),
            _ => false,
        }
    }

    /// Whether the failure came from the caller's cancellation signal
    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpstreamError::Cancelled)
    }
}

/// Classify a transport failure as transient.
///
/// Timeouts, connection resets, broken pipes, unexpected end-of-stream and
/// "connection closed" anywhere in the source chain count as transient.
fn is_transient_transport(err: &reqwest::Error) -> bool {
    if err.is_timeout() {
        return true;
    }

    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        let text = cause.to_string().to_ascii_lowercase();
        if text.contains("connection closed")
            || text.contains("connection reset")
            || text.contains("broken pipe")
            || text.contains("unexpected eof")
            || text.contains("unexpected end of file")
        {
            return true;
        }
        source = cause.source();
    }

    false
}
