use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome code written when an exchange fails for any reason.
pub const TIMEOUT_CODE: &str = "timeout";

/// One line of the output stream: the outcome of a single attempted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Completion time, RFC 3339 UTC with nanoseconds
    pub timestamp: String,
    /// Phase the request was dispatched in
    pub phase: String,
    /// Exchange duration in milliseconds, 0.1 ms precision
    pub latency_ms: f64,
    /// Response code name, or [`TIMEOUT_CODE`] on failure
    pub outcome_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub bytes_in: usize,
    pub bytes_out: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,
}

impl OutcomeRecord {
    pub fn success(
        phase: &str,
        elapsed: Duration,
        outcome_code: String,
        bytes_in: usize,
        bytes_out: usize,
        test_id: Option<String>,
    ) -> Self {
        Self {
            timestamp: now_rfc3339(),
            phase: phase.to_string(),
            latency_ms: round_latency_ms(elapsed),
            outcome_code,
            error_detail: None,
            bytes_in,
            bytes_out,
            test_id,
        }
    }

    pub fn failure(
        phase: &str,
        elapsed: Duration,
        error_detail: String,
        bytes_out: usize,
        test_id: Option<String>,
    ) -> Self {
        Self {
            timestamp: now_rfc3339(),
            phase: phase.to_string(),
            latency_ms: round_latency_ms(elapsed),
            outcome_code: TIMEOUT_CODE.to_string(),
            error_detail: Some(error_detail),
            bytes_in: 0,
            bytes_out,
            test_id,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome_code == TIMEOUT_CODE
    }
}

/// Milliseconds rounded to one decimal place.
pub fn round_latency_ms(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 10_000.0).round() / 10.0
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}
