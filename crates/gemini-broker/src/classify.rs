//! Upstream failure classification
//!
//! Maps a generation-API error response to the report the caller should
//! make. The broker does no HTTP itself; this is a pure helper so every
//! caller penalizes keys the same way.
//!
//! - 429 is a hard failure: the provider throttled this key's traffic.
//! - 400 dispatches on the body: an invalid-key complaint retires the
//!   key, anything else is a malformed request charged as a hard failure.
//! - 401/403 mean the credential itself is bad.
//! - Timeouts and 5xx are the server's problem, not the key's.

/// What a failed upstream call should do to the key that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient server-side trouble. No penalty.
    Soft,
    /// The provider rejected this key's traffic. Strike and cooldown.
    Hard,
    /// The credential itself is invalid. Retire the key.
    Fatal,
}

/// Invalid-credential message patterns in 400 responses.
const BAD_KEY_PATTERNS: &[&str] = &[
    "api key not valid",
    "api_key_invalid",
    "api key expired",
    "expired api key",
];

/// Classify a 400 response body as an invalid credential or a malformed
/// request attributable to the key.
pub fn classify_400(body: &str) -> FailureKind {
    let lower = body.to_lowercase();
    for pattern in BAD_KEY_PATTERNS {
        if lower.contains(pattern) {
            return FailureKind::Fatal;
        }
    }
    FailureKind::Hard
}

/// Classify an upstream error by HTTP status and response body.
pub fn classify_status(status: u16, body: &str) -> FailureKind {
    match status {
        429 => FailureKind::Hard,
        400 => classify_400(body),
        401 | 403 => FailureKind::Fatal,
        408 | 500 | 502 | 503 | 504 => FailureKind::Soft,
        _ => FailureKind::Soft,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_429_is_hard() {
        assert_eq!(classify_status(429, "rate limit exceeded"), FailureKind::Hard);
    }

    #[test]
    fn classify_400_invalid_key_is_fatal() {
        let body = r#"{"error":{"message":"API key not valid. Please pass a valid API key."}}"#;
        assert_eq!(classify_status(400, body), FailureKind::Fatal);
    }

    #[test]
    fn classify_400_reason_code_is_fatal() {
        let body = r#"{"error":{"status":"INVALID_ARGUMENT","details":[{"reason":"API_KEY_INVALID"}]}}"#;
        assert_eq!(classify_status(400, body), FailureKind::Fatal);
    }

    #[test]
    fn classify_400_malformed_request_is_hard() {
        let body = r#"{"error":{"message":"Invalid JSON payload received."}}"#;
        assert_eq!(classify_status(400, body), FailureKind::Hard);
    }

    #[test]
    fn classify_400_case_insensitive() {
        let body = r#"{"error":{"message":"API KEY EXPIRED"}}"#;
        assert_eq!(classify_400(body), FailureKind::Fatal);
    }

    #[test]
    fn classify_401_403_fatal() {
        assert_eq!(classify_status(401, "unauthorized"), FailureKind::Fatal);
        assert_eq!(classify_status(403, "forbidden"), FailureKind::Fatal);
    }

    #[test]
    fn classify_server_errors_soft() {
        for status in [408, 500, 502, 503, 504] {
            assert_eq!(classify_status(status, ""), FailureKind::Soft, "status {status}");
        }
    }

    #[test]
    fn classify_unknown_status_soft() {
        assert_eq!(classify_status(418, "i'm a teapot"), FailureKind::Soft);
    }
}
