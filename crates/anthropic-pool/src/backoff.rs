//! Response classification and cooldown computation
//!
//! Given an HTTP status and an optional body, decides whether a failure is
//! service-wide (return to the caller unchanged) or account-specific (mark
//! the account and fail over), and if account-specific, for how long to
//! cool it down. Pure functions of status/body/headers/now — no I/O, no
//! mutation — generalized from `quota.rs`'s `classify_429`/`classify_status`
//! pair into the full reason taxonomy and tiered cooldown schedule.

use chrono::DateTime;
use serde_json::Value;

/// Why an account-specific failure occurred, in the priority order in which
/// signals are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    AuthFailed,
    QuotaExhausted,
    RateLimitExceeded,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::AuthFailed => "AUTH_FAILED",
            FailureReason::QuotaExhausted => "QUOTA_EXHAUSTED",
            FailureReason::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
        }
    }
}

/// The two outcomes a response can be classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Return the response to the caller unchanged; do not switch account.
    ServiceWide,
    /// Mark the account and try another.
    AccountSpecific(FailureReason),
}

const AUTH_SIGNALS: &[&str] = &[
    "authentication",
    "invalid_api_key",
    "invalid_grant",
    "unauthorized",
    "invalid access token",
    "expired token",
];

const QUOTA_SIGNALS: &[&str] = &[
    "quota",
    "billing",
    "permission",
    "insufficient_permissions",
    "exhausted",
    "credit balance",
    "forbidden",
];

const TYPE_SIGNALS: &[&str] = &[
    "rate_limit",
    "quota",
    "billing",
    "permission",
    "authentication",
    "invalid_api_key",
    "insufficient_permissions",
    "invalid_grant",
];

const MESSAGE_SIGNALS: &[&str] = &[
    "rate limit",
    "would exceed",
    "quota",
    "exhausted",
    "credit balance",
    "billing",
    "permission",
    "forbidden",
    "unauthorized",
    "authentication",
    "not authorized",
];

/// Classify a response by status and (best-effort parsed) body.
pub fn classify(status: u16, body: Option<&Value>) -> Classification {
    let has_account_specific_signal = || body_has_signal(body, TYPE_SIGNALS, MESSAGE_SIGNALS);

    match status {
        429 => Classification::AccountSpecific(assign_reason(status, body)),
        401 => Classification::AccountSpecific(FailureReason::AuthFailed),
        400 | 403 if has_account_specific_signal() => {
            Classification::AccountSpecific(assign_reason(status, body))
        }
        _ => Classification::ServiceWide,
    }
}

fn assign_reason(status: u16, body: Option<&Value>) -> FailureReason {
    if status == 401 || body_has_signal(body, &[], AUTH_SIGNALS) {
        return FailureReason::AuthFailed;
    }
    if body_has_signal(body, &[], QUOTA_SIGNALS) {
        return FailureReason::QuotaExhausted;
    }
    FailureReason::RateLimitExceeded
}

fn body_has_signal(body: Option<&Value>, type_signals: &[&str], text_signals: &[&str]) -> bool {
    let Some(body) = body else { return false };

    let error_type = body
        .get("error")
        .and_then(|e| e.get("type"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_lowercase();
    if !type_signals.is_empty() && type_signals.iter().any(|s| error_type.contains(s)) {
        return true;
    }

    let error_message = body
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_lowercase();
    if text_signals.iter().any(|s| error_message.contains(s)) {
        return true;
    }

    // Also check error.type against text signals, and the whole stringified
    // body against both sets — catches shapes that don't nest under "error".
    if text_signals.iter().any(|s| error_type.contains(s)) {
        return true;
    }
    let stringified = body.to_string().to_lowercase();
    if !type_signals.is_empty() && type_signals.iter().any(|s| stringified.contains(s)) {
        return true;
    }
    text_signals.iter().any(|s| stringified.contains(s))
}

/// Tiered quota backoff in milliseconds, indexed by (zero-based) consecutive
/// failure count, saturating at the last tier.
const QUOTA_TIERS_MS: [u64; 4] = [60_000, 300_000, 1_800_000, 7_200_000];

const AUTH_COOLDOWN_MS: u64 = 5_000;
const RATE_LIMIT_COOLDOWN_MS: u64 = 30_000;
const MIN_RETRY_AFTER_MS: u64 = 2_000;

/// Compute the cooldown duration in ms for an account-specific failure.
///
/// `retry_after` is the parsed `Retry-After` header, if any (§4.2's parsing
/// rules are applied by [`parse_retry_after`] before this is called).
pub fn cooldown_ms(reason: FailureReason, consecutive_failures: u32, retry_after_ms: Option<u64>) -> u64 {
    if reason != FailureReason::AuthFailed
        && let Some(retry_after_ms) = retry_after_ms
    {
        return retry_after_ms.max(MIN_RETRY_AFTER_MS);
    }

    match reason {
        FailureReason::AuthFailed => AUTH_COOLDOWN_MS,
        FailureReason::QuotaExhausted => {
            let tier = (consecutive_failures as usize).min(QUOTA_TIERS_MS.len() - 1);
            QUOTA_TIERS_MS[tier]
        }
        FailureReason::RateLimitExceeded => RATE_LIMIT_COOLDOWN_MS,
    }
}

/// Parse a `Retry-After` header value per §4.2/§8: integer seconds or an
/// HTTP-date, both must resolve to a positive, future duration or this
/// fails closed (returns `None`).
pub fn parse_retry_after(value: &str, now_ms: u64) -> Option<u64> {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<i64>() {
        return if seconds > 0 {
            Some(seconds as u64 * 1000)
        } else {
            None
        };
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let target_ms = u64::try_from(date.timestamp_millis()).ok()?;
    if target_ms > now_ms {
        Some(target_ms - now_ms)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_429_is_always_account_specific() {
        assert_eq!(
            classify(429, None),
            Classification::AccountSpecific(FailureReason::RateLimitExceeded)
        );
    }

    #[test]
    fn status_401_is_always_auth_failed() {
        assert_eq!(
            classify(401, None),
            Classification::AccountSpecific(FailureReason::AuthFailed)
        );
    }

    #[test]
    fn status_500_is_service_wide() {
        assert_eq!(classify(500, None), Classification::ServiceWide);
    }

    #[test]
    fn status_503_and_529_are_service_wide() {
        assert_eq!(classify(503, None), Classification::ServiceWide);
        assert_eq!(classify(529, None), Classification::ServiceWide);
    }

    #[test]
    fn status_400_without_signal_is_service_wide() {
        let body = json!({"error": {"type": "invalid_request_error", "message": "bad field"}});
        assert_eq!(classify(400, Some(&body)), Classification::ServiceWide);
    }

    #[test]
    fn status_400_with_quota_signal_is_account_specific() {
        let body = json!({"error": {"type": "invalid_request_error", "message": "quota exhausted"}});
        assert_eq!(
            classify(400, Some(&body)),
            Classification::AccountSpecific(FailureReason::QuotaExhausted)
        );
    }

    #[test]
    fn status_403_with_permission_signal_is_account_specific() {
        let body = json!({"error": {"type": "permission_error", "message": "forbidden"}});
        assert_eq!(
            classify(403, Some(&body)),
            Classification::AccountSpecific(FailureReason::QuotaExhausted)
        );
    }

    #[test]
    fn reason_priority_prefers_auth_over_quota() {
        let body = json!({"error": {"type": "authentication_error", "message": "quota and auth"}});
        assert_eq!(
            classify(400, Some(&body)),
            Classification::AccountSpecific(FailureReason::AuthFailed)
        );
    }

    #[test]
    fn cooldown_auth_is_fixed_five_seconds() {
        assert_eq!(cooldown_ms(FailureReason::AuthFailed, 0, None), 5_000);
    }

    #[test]
    fn cooldown_rate_limit_is_fixed_thirty_seconds() {
        assert_eq!(cooldown_ms(FailureReason::RateLimitExceeded, 0, None), 30_000);
    }

    #[test]
    fn cooldown_quota_tiers_by_consecutive_failures() {
        assert_eq!(cooldown_ms(FailureReason::QuotaExhausted, 0, None), 60_000);
        assert_eq!(cooldown_ms(FailureReason::QuotaExhausted, 1, None), 300_000);
        assert_eq!(cooldown_ms(FailureReason::QuotaExhausted, 2, None), 1_800_000);
        assert_eq!(cooldown_ms(FailureReason::QuotaExhausted, 3, None), 7_200_000);
    }

    #[test]
    fn cooldown_quota_saturates_at_tier_three() {
        assert_eq!(cooldown_ms(FailureReason::QuotaExhausted, 50, None), 7_200_000);
    }

    #[test]
    fn cooldown_retry_after_overrides_default_except_for_auth() {
        assert_eq!(
            cooldown_ms(FailureReason::RateLimitExceeded, 0, Some(45_000)),
            45_000
        );
        assert_eq!(cooldown_ms(FailureReason::AuthFailed, 0, Some(45_000)), 5_000);
    }

    #[test]
    fn cooldown_retry_after_is_floored_at_two_seconds() {
        assert_eq!(cooldown_ms(FailureReason::RateLimitExceeded, 0, Some(500)), 2_000);
    }

    #[test]
    fn retry_after_parses_positive_integer_seconds() {
        assert_eq!(parse_retry_after("30", 0), Some(30_000));
    }

    #[test]
    fn retry_after_rejects_zero_and_negative() {
        assert_eq!(parse_retry_after("0", 0), None);
        assert_eq!(parse_retry_after("-5", 0), None);
    }

    #[test]
    fn retry_after_rejects_past_http_date() {
        assert_eq!(
            parse_retry_after("Sun, 06 Nov 1994 08:49:37 GMT", 1_700_000_000_000),
            None
        );
    }

    #[test]
    fn retry_after_accepts_future_http_date() {
        let now_ms = 1_700_000_000_000i64;
        let future_ms = now_ms + 60_000;
        let datetime = chrono::DateTime::from_timestamp_millis(future_ms).unwrap();
        let formatted = datetime.to_rfc2822();
        let parsed = parse_retry_after(&formatted, now_ms as u64).unwrap();
        assert!(parsed > 0 && parsed <= 61_000);
    }

    #[test]
    fn retry_after_rejects_garbage() {
        assert_eq!(parse_retry_after("not-a-date", 0), None);
    }
}
