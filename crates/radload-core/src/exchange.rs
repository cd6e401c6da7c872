use crate::radius::ResponseCode;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("exchange timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("cannot encode request: {0}")]
    Encode(String),
}

/// An authentication attempt for one synthetic user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub username: String,
    pub password: String,
    pub nas_ip: Ipv4Addr,
    /// Correlation tag, sent as Calling-Station-Id
    pub calling_station_id: Option<String>,
}

impl AccessRequest {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            nas_ip: Ipv4Addr::LOCALHOST,
            calling_station_id: None,
        }
    }

    pub fn with_calling_station_id(mut self, id: Option<String>) -> Self {
        self.calling_station_id = id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessResponse {
    pub code: ResponseCode,
    /// Size of the reply datagram
    pub bytes_in: usize,
}

pub type ExchangeFuture<'a> =
    Pin<Box<dyn Future<Output = Result<AccessResponse, ExchangeError>> + Send + 'a>>;

/// One request/response round trip against the system under test.
///
/// Implementations do not bound their own wait: callers wrap
/// [`Exchanger::exchange`] in a timeout and drop the future on expiry.
pub trait Exchanger: Send + Sync {
    fn name(&self) -> &'static str;

    /// Serialized size of `request` on the wire.
    fn request_len(&self, request: &AccessRequest) -> usize;

    fn exchange<'a>(&'a self, request: &'a AccessRequest) -> ExchangeFuture<'a>;
}

/// In-process exchanger for dry runs and tests.
pub struct MockExchanger {
    delay: Duration,
    code: ResponseCode,
    /// Every Nth exchange fails with a transport error (0 = never)
    fail_every: u64,
    calls: AtomicU64,
}

impl MockExchanger {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            code: ResponseCode::AccessAccept,
            fail_every: 0,
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_code(mut self, code: ResponseCode) -> Self {
        self.code = code;
        self
    }

    pub fn fail_every(mut self, n: u64) -> Self {
        self.fail_every = n;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Exchanger for MockExchanger {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn request_len(&self, request: &AccessRequest) -> usize {
        crate::radius::access_request_len(request)
    }

    fn exchange<'a>(&'a self, _request: &'a AccessRequest) -> ExchangeFuture<'a> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
            sleep(self.delay).await;

            if self.fail_every > 0 && call % self.fail_every == 0 {
                return Err(ExchangeError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }

            Ok(AccessResponse {
                code: self.code,
                bytes_in: crate::radius::HEADER_LEN,
            })
        })
    }
}
