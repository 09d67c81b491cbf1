use serde::Deserialize;
use thiserror::Error;

use crate::models::ErrorKind;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Email confirmation pending: {0}")]
    ConfirmationPending(String),

    #[error("Session rejected by provider: {0}")]
    SessionRejected(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Identity provider is not configured")]
    NotConfigured,
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// GoTrue error body. Older servers use `error`/`error_description`,
/// newer ones `error_code`/`msg`.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorBody {
    fn code(&self) -> Option<&str> {
        self.error_code.as_deref().or(self.error.as_deref())
    }

    fn message(&self) -> Option<&str> {
        self.msg
            .as_deref()
            .or(self.error_description.as_deref())
            .or(self.message.as_deref())
    }
}

impl ProviderError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let detail = parsed
            .message()
            .map(Self::truncate_body)
            .unwrap_or_else(|| Self::truncate_body(body));

        match (status.as_u16(), parsed.code()) {
            (_, Some("email_not_confirmed")) => ProviderError::ConfirmationPending(detail),
            (_, Some("invalid_credentials")) | (400, Some("invalid_grant")) => {
                ProviderError::InvalidCredentials(detail)
            }
            (401 | 403, _) => ProviderError::SessionRejected(detail),
            (429, _) => ProviderError::RateLimited,
            (500..=599, _) => ProviderError::ServerError(detail),
            _ => ProviderError::Rejected(format!("Status {}: {}", status, detail)),
        }
    }

    /// Returns true if the failure is transient and the operation can be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RateLimited
            | ProviderError::ServerError(_)
            | ProviderError::Unavailable(_) => true,
            ProviderError::NetworkError(e) => {
                if e.is_connect() || e.is_timeout() || e.is_request() {
                    return true;
                }
                e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::InvalidCredentials(_) => ErrorKind::InvalidCredentials,
            ProviderError::ConfirmationPending(_) => ErrorKind::ConfirmationPending,
            ProviderError::NotConfigured => ErrorKind::NotConfigured,
            ProviderError::SessionRejected(_)
            | ProviderError::Rejected(_)
            | ProviderError::InvalidResponse(_) => ErrorKind::ProviderRejected,
            ProviderError::RateLimited
            | ProviderError::ServerError(_)
            | ProviderError::NetworkError(_)
            | ProviderError::Unavailable(_) => ErrorKind::ProviderUnavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status_invalid_grant() {
        let body = r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#;
        let err = ProviderError::from_status(StatusCode::BAD_REQUEST, body);
        assert!(matches!(err, ProviderError::InvalidCredentials(ref m) if m == "Invalid login credentials"));
        assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
    }

    #[test]
    fn test_from_status_new_style_codes() {
        let body = r#"{"code":400,"error_code":"invalid_credentials","msg":"Invalid login credentials"}"#;
        let err = ProviderError::from_status(StatusCode::BAD_REQUEST, body);
        assert_eq!(err.kind(), ErrorKind::InvalidCredentials);

        let body = r#"{"code":400,"error_code":"email_not_confirmed","msg":"Email not confirmed"}"#;
        let err = ProviderError::from_status(StatusCode::BAD_REQUEST, body);
        assert_eq!(err.kind(), ErrorKind::ConfirmationPending);
    }

    #[test]
    fn test_from_status_buckets() {
        assert!(matches!(
            ProviderError::from_status(StatusCode::UNAUTHORIZED, "{}"),
            ProviderError::SessionRejected(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderError::RateLimited
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::BAD_GATEWAY, "upstream down"),
            ProviderError::ServerError(ref m) if m == "upstream down"
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::UNPROCESSABLE_ENTITY, r#"{"msg":"User already registered"}"#),
            ProviderError::Rejected(ref m) if m.contains("User already registered")
        ));
    }

    #[test]
    fn test_truncate_long_body() {
        let body = "x".repeat(MAX_ERROR_BODY_LENGTH + 100);
        let truncated = ProviderError::truncate_body(&body);
        assert!(truncated.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(truncated.contains("truncated, 600 total bytes"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(MAX_ERROR_BODY_LENGTH);
        let truncated = ProviderError::truncate_body(&body);
        assert!(truncated.contains("truncated"));
    }

    #[test]
    fn test_is_transient() {
        assert!(ProviderError::RateLimited.is_transient());
        assert!(ProviderError::ServerError("503".to_string()).is_transient());
        assert!(ProviderError::Unavailable("offline".to_string()).is_transient());
        assert!(!ProviderError::InvalidCredentials("bad".to_string()).is_transient());
        assert!(!ProviderError::SessionRejected("revoked".to_string()).is_transient());
        assert!(!ProviderError::NotConfigured.is_transient());
    }

    #[test]
    fn test_kind_for_unavailable_family() {
        assert_eq!(ProviderError::RateLimited.kind(), ErrorKind::ProviderUnavailable);
        assert_eq!(
            ProviderError::Unavailable("x".to_string()).kind(),
            ErrorKind::ProviderUnavailable
        );
        assert_eq!(ProviderError::NotConfigured.kind(), ErrorKind::NotConfigured);
    }
}
