use crate::exchange::{AccessRequest, ExchangeError, Exchanger};
use crate::record::OutcomeRecord;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::debug;

/// Pool of synthetic identities `user0000`, `user0001`, ...
#[derive(Debug, Clone)]
pub struct UserPool {
    names: Vec<String>,
}

impl UserPool {
    /// Names wrap after `user9999`; an empty pool is bumped to one user.
    pub fn new(count: usize) -> Self {
        let names = (0..count.max(1))
            .map(|i| format!("user{:04}", i % 10_000))
            .collect();
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> &str {
        &self.names[rng.gen_range(0..self.names.len())]
    }
}

/// Performs one timed exchange per call and turns it into an [`OutcomeRecord`].
pub struct RequestExecutor {
    exchanger: Arc<dyn Exchanger>,
    password: String,
    timeout: Duration,
    test_id: Option<String>,
}

impl RequestExecutor {
    pub fn new(
        exchanger: Arc<dyn Exchanger>,
        password: impl Into<String>,
        timeout: Duration,
        test_id: Option<String>,
    ) -> Self {
        Self {
            exchanger,
            password: password.into(),
            timeout,
            test_id: test_id.filter(|id| !id.is_empty()),
        }
    }

    /// Never fails: every error becomes a `"timeout"` record.
    pub async fn execute(&self, phase: &str, username: &str) -> OutcomeRecord {
        let request = AccessRequest::new(username, self.password.as_str())
            .with_calling_station_id(self.test_id.clone());
        let bytes_out = self.exchanger.request_len(&request);

        let start = Instant::now();
        let result = match timeout(self.timeout, self.exchanger.exchange(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(self.timeout)),
        };
        let elapsed = start.elapsed();

        match result {
            Ok(response) => OutcomeRecord::success(
                phase,
                elapsed,
                response.code.to_string(),
                response.bytes_in,
                bytes_out,
                self.test_id.clone(),
            ),
            Err(e) => {
                debug!("Exchange for {} failed after {:?}: {}", username, elapsed, e);
                OutcomeRecord::failure(phase, elapsed, e.to_string(), bytes_out, self.test_id.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchanger;
    use crate::radius::ResponseCode;
    use crate::record::TIMEOUT_CODE;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_user_pool_names() {
        let pool = UserPool::new(3);
        assert_eq!(pool.names, ["user0000", "user0001", "user0002"]);

        let wrapped = UserPool::new(10_002);
        assert_eq!(wrapped.names[10_000], "user0000");
        assert_eq!(wrapped.names[10_001], "user0001");

        let empty = UserPool::new(0);
        assert_eq!(empty.len(), 1);
    }

    #[test]
    fn test_user_pool_pick_is_deterministic_with_seed() {
        let pool = UserPool::new(1000);
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let name = pool.pick(&mut a);
            assert_eq!(name, pool.pick(&mut b));
            assert!(name.starts_with("user"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_success() {
        let exchanger = Arc::new(MockExchanger::new(Duration::from_millis(12)));
        let executor = RequestExecutor::new(
            exchanger,
            "pass123",
            Duration::from_secs(2),
            Some("run-1".to_string()),
        );

        let record = executor.execute("steady", "user0007").await;
        assert_eq!(record.phase, "steady");
        assert_eq!(record.outcome_code, "Access-Accept");
        assert_eq!(record.latency_ms, 12.0);
        assert_eq!(record.bytes_in, 20);
        assert!(record.bytes_out > 20);
        assert_eq!(record.error_detail, None);
        assert_eq!(record.test_id.as_deref(), Some("run-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_reject_keeps_code() {
        let exchanger = Arc::new(
            MockExchanger::new(Duration::from_millis(1)).with_code(ResponseCode::AccessReject),
        );
        let executor = RequestExecutor::new(exchanger, "pass123", Duration::from_secs(2), None);

        let record = executor.execute("warmup", "user0001").await;
        assert_eq!(record.outcome_code, "Access-Reject");
        assert!(record.error_detail.is_none());
        assert!(record.test_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_timeout() {
        let exchanger = Arc::new(MockExchanger::new(Duration::from_secs(10)));
        let executor = RequestExecutor::new(exchanger, "pass123", Duration::from_secs(2), None);

        let record = executor.execute("spike", "user0001").await;
        assert_eq!(record.outcome_code, TIMEOUT_CODE);
        assert_eq!(record.latency_ms, 2000.0);
        assert_eq!(record.bytes_in, 0);
        assert!(record.bytes_out > 0);
        assert_eq!(
            record.error_detail.as_deref(),
            Some("exchange timed out after 2s")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_transport_error_is_recorded_as_timeout() {
        let exchanger = Arc::new(MockExchanger::new(Duration::from_millis(3)).fail_every(1));
        let executor = RequestExecutor::new(exchanger, "pass123", Duration::from_secs(2), None);

        let record = executor.execute("steady", "user0001").await;
        assert_eq!(record.outcome_code, TIMEOUT_CODE);
        assert!(record
            .error_detail
            .as_deref()
            .unwrap()
            .contains("connection refused"));
        assert_eq!(record.bytes_in, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_test_id_is_dropped() {
        let exchanger = Arc::new(MockExchanger::new(Duration::ZERO));
        let executor =
            RequestExecutor::new(exchanger, "pass123", Duration::from_secs(1), Some(String::new()));
        let record = executor.execute("steady", "user0001").await;
        assert!(record.test_id.is_none());
    }
}
