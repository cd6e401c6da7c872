use anyhow::{Context, Result};
use radload_core::{
    validate_address, AccessRequest, Exchanger, ExchangeError, ResponseCode, UdpExchanger,
};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{info, warn};

const EXIT_REJECTED: u8 = 1;
const EXIT_UNREACHABLE: u8 = 2;

struct Settings {
    addr: String,
    secret: String,
    user: String,
    password: String,
    test_id: Option<String>,
    timeout: Duration,
}

fn getenv(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl Settings {
    fn from_env() -> Self {
        let timeout = humantime::parse_duration(&getenv("RADIUS_TIMEOUT", "2s")).unwrap_or_else(|e| {
            warn!("Ignoring invalid RADIUS_TIMEOUT: {}", e);
            Duration::from_secs(2)
        });
        Self {
            addr: getenv("RADIUS_ADDR", "127.0.0.1:1812"),
            secret: getenv("RADIUS_SECRET", "testing123"),
            user: getenv("RADIUS_USER", "testuser"),
            password: getenv("RADIUS_PASS", "pass123"),
            test_id: std::env::var("TEST_ID").ok().filter(|v| !v.is_empty()),
            timeout,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_env();

    let addr = match reachable(&settings).await {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Target unreachable: {e:#}");
            return ExitCode::from(EXIT_UNREACHABLE);
        }
    };

    let exchanger = UdpExchanger::new(addr, settings.secret.as_bytes().to_vec(), Duration::from_secs(1));
    let request = AccessRequest::new(settings.user.as_str(), settings.password.as_str())
        .with_calling_station_id(settings.test_id.clone());

    let start = Instant::now();
    let result = match tokio::time::timeout(settings.timeout, exchanger.exchange(&request)).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout(settings.timeout)),
    };
    let latency_ms = start.elapsed().as_millis();

    match result {
        Ok(response) => {
            println!("Access result: {}", response.code);
            info!("{} answered in {}ms", addr, latency_ms);
            if response.code == ResponseCode::AccessAccept {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_REJECTED)
            }
        }
        Err(e) => {
            eprintln!("Access error: {e}");
            ExitCode::from(EXIT_REJECTED)
        }
    }
}

/// Validate the address and make sure a UDP socket can be pointed at it.
async fn reachable(settings: &Settings) -> Result<SocketAddr> {
    validate_address(&settings.addr)?;

    let addr = tokio::time::timeout(settings.timeout, tokio::net::lookup_host(&settings.addr))
        .await
        .context("address lookup timed out")?
        .with_context(|| format!("Failed to resolve {}", settings.addr))?
        .next()
        .with_context(|| format!("No addresses found for {}", settings.addr))?;

    let bind: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await.context("UDP bind failed")?;
    socket.connect(addr).await.context("UDP dial failed")?;
    Ok(addr)
}
