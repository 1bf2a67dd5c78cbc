use adpulse_core::blocking::{BlockingKind, Severity};
use adpulse_core::error::AppError;
use adpulse_core::traits::{BlockingClassifier, Classification};

/// Markers in an error message that indicate a challenge page.
const CHALLENGE_MARKERS: &[&str] = &["captcha", "checkpoint"];

/// Classifies fetch failures by HTTP status and challenge markers.
///
/// | failure                      | kind       | severity |
/// |------------------------------|------------|----------|
/// | HTTP 429                     | rate_limit | medium   |
/// | HTTP 403                     | ip_blocked | high     |
/// | captcha / checkpoint page    | captcha    | high     |
/// | page without an active count | unknown    | low      |
///
/// Timeouts and connection errors are not treated as blocking.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusClassifier;

impl BlockingClassifier for StatusClassifier {
    fn classify(&self, error: &AppError) -> Option<Classification> {
        let (kind, severity) = match error {
            AppError::HttpStatus { status: 429, .. } => (BlockingKind::RateLimit, Severity::Medium),
            AppError::HttpStatus { status: 403, .. } => (BlockingKind::IpBlocked, Severity::High),
            AppError::HttpError(msg) if is_challenge(msg) => {
                (BlockingKind::Captcha, Severity::High)
            }
            AppError::Extraction(_) => (BlockingKind::Unknown, Severity::Low),
            _ => return None,
        };
        Some(Classification {
            kind,
            severity,
            retry_after_seconds: None,
        })
    }
}

fn is_challenge(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| lower.contains(m))
}
