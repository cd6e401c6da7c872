use crate::plan::{PhasePlan, PhaseSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid target address {0:?}: expected host:port")]
    InvalidAddress(String),
    #[error("max workers must be at least 1 (got {0})")]
    InvalidWorkers(usize),
    #[error("rate for {name} must be a finite, non-negative number (got {rate})")]
    InvalidRate { name: String, rate: f64 },
    #[error("spike multiplier must be a finite, non-negative number (got {0})")]
    InvalidMultiplier(f64),
    #[error("per-request timeout must be greater than zero")]
    ZeroTimeout,
    #[error("channel capacity must be at least 1")]
    ZeroChannelCapacity,
    #[error("unknown phase {0:?}")]
    UnknownPhase(String),
    #[error("phase plan is empty")]
    EmptyPlan,
    #[error("phase {0} has no name")]
    UnnamedPhase(usize),
    #[error("failed to read plan file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse plan file: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub target: TargetConfig,
    pub scenario: ScenarioConfig,
    /// Custom ordered phases replacing the standard warmup/steady/spike plan
    #[serde(default)]
    pub phases: Option<Vec<PhaseSpec>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// RADIUS server address (host:port)
    pub address: String,
    /// Shared secret
    pub secret: String,
    /// Password sent for every synthetic user
    pub password: String,
    /// Per-request timeout
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Retransmission interval while waiting for a reply
    #[serde(rename = "retransmit_ms", with = "duration_ms")]
    pub retransmit: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Size of the synthetic user pool
    pub users: usize,
    /// Steady-state requests per second
    pub rps: f64,
    /// Maximum concurrent in-flight requests
    pub workers: usize,
    #[serde(rename = "warmup_ms", with = "duration_ms")]
    pub warmup: Duration,
    #[serde(rename = "steady_ms", with = "duration_ms")]
    pub steady: Duration,
    #[serde(rename = "spike_ms", with = "duration_ms")]
    pub spike: Duration,
    pub spike_multiplier: f64,
    pub phase: PhaseSelector,
    pub pacing: Pacing,
    /// Capacity of the record channel feeding the metrics sink
    pub channel_capacity: usize,
    /// Seed for username selection, entropy when absent
    #[serde(default)]
    pub seed: Option<u64>,
    /// Correlation tag copied into every request and record
    #[serde(default)]
    pub test_id: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target: TargetConfig {
                address: "127.0.0.1:1812".to_string(),
                secret: "testing123".to_string(),
                password: "pass123".to_string(),
                timeout: Duration::from_secs(2),
                retransmit: Duration::from_secs(1),
            },
            scenario: ScenarioConfig {
                users: 1000,
                rps: 200.0,
                workers: 512,
                warmup: Duration::from_secs(5),
                steady: Duration::from_secs(30),
                spike: Duration::from_secs(10),
                spike_multiplier: 3.0,
                phase: PhaseSelector::All,
                pacing: Pacing::Ticker,
                channel_capacity: crate::sink::DEFAULT_CHANNEL_CAPACITY,
                seed: None,
                test_id: None,
            },
            phases: None,
        }
    }
}

impl RunConfig {
    /// Reject everything that must stop a run before the first dispatch.
    ///
    /// A rate or spike multiplier of exactly zero is accepted and turns the
    /// phase into a no-op. Negative or non-finite values are a
    /// [`ConfigError`], never a silently skipped phase.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_address(&self.target.address)?;
        if self.target.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.scenario.workers == 0 || self.scenario.workers > u32::MAX as usize {
            return Err(ConfigError::InvalidWorkers(self.scenario.workers));
        }
        if self.scenario.channel_capacity == 0 {
            return Err(ConfigError::ZeroChannelCapacity);
        }
        if !self.scenario.spike_multiplier.is_finite() || self.scenario.spike_multiplier < 0.0 {
            return Err(ConfigError::InvalidMultiplier(self.scenario.spike_multiplier));
        }
        validate_rate("rps", self.scenario.rps)?;
        if let Some(phases) = &self.phases {
            for (idx, phase) in phases.iter().enumerate() {
                if phase.name.trim().is_empty() {
                    return Err(ConfigError::UnnamedPhase(idx));
                }
                validate_rate(&phase.name, phase.rate)?;
            }
        }
        self.plan().map(|_| ())
    }

    /// The ordered phases this run will execute.
    pub fn plan(&self) -> Result<PhasePlan, ConfigError> {
        let full = match &self.phases {
            Some(phases) if phases.is_empty() => return Err(ConfigError::EmptyPlan),
            Some(phases) => PhasePlan::new(phases.clone()),
            None => PhasePlan::standard(
                self.scenario.rps,
                self.scenario.warmup,
                self.scenario.steady,
                self.scenario.spike,
                self.scenario.spike_multiplier,
            ),
        };
        full.select(&self.scenario.phase)
    }
}

fn validate_rate(name: &str, rate: f64) -> Result<(), ConfigError> {
    if !rate.is_finite() || rate < 0.0 {
        return Err(ConfigError::InvalidRate {
            name: name.to_string(),
            rate,
        });
    }
    Ok(())
}

/// Checks the `host:port` shape without resolving the host.
pub fn validate_address(address: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidAddress(address.to_string());
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host == "[]" {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(p) if p != 0 => Ok(()),
        _ => Err(invalid()),
    }
}

/// Which phases of the plan to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PhaseSelector {
    All,
    Named(String),
}

impl FromStr for PhaseSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s.is_empty() || s == "all" {
            Ok(PhaseSelector::All)
        } else {
            Ok(PhaseSelector::Named(s))
        }
    }
}

impl From<String> for PhaseSelector {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(selector) => selector,
            Err(never) => match never {},
        }
    }
}

impl From<PhaseSelector> for String {
    fn from(selector: PhaseSelector) -> Self {
        selector.to_string()
    }
}

impl fmt::Display for PhaseSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseSelector::All => f.write_str("all"),
            PhaseSelector::Named(name) => f.write_str(name),
        }
    }
}

/// Source of dispatch events inside a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pacing {
    /// Fixed-interval ticker, missed ticks are dropped
    #[default]
    Ticker,
    /// Token bucket with a single-token burst
    TokenBucket,
}

impl FromStr for Pacing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ticker" => Ok(Pacing::Ticker),
            "token-bucket" | "token_bucket" | "bucket" => Ok(Pacing::TokenBucket),
            other => Err(format!(
                "invalid pacing {other:?}, must be 'ticker' or 'token-bucket'"
            )),
        }
    }
}

/// A TOML file listing custom phases:
///
/// ```toml
/// [[phases]]
/// name = "ramp"
/// rate = 50.0
/// duration_ms = 10000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    pub phases: Vec<PhaseSpec>,
}

impl PlanFile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let plan: PlanFile = toml::from_str(&contents)?;
        Ok(plan)
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RunConfig::default();
        config.validate().unwrap();

        let plan = config.plan().unwrap();
        let names: Vec<_> = plan.phases().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["warmup", "steady", "spike"]);
        assert_eq!(plan.phases()[2].rate, 600.0);
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let mut config = RunConfig::default();
        config.scenario.workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWorkers(0))
        ));

        let mut config = RunConfig::default();
        config.scenario.rps = -1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRate { .. })
        ));

        let mut config = RunConfig::default();
        config.scenario.rps = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.target.timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroTimeout)));

        let mut config = RunConfig::default();
        config.scenario.phase = "cooldown".parse().unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownPhase(_))
        ));
    }

    #[test]
    fn test_zero_rate_is_not_a_config_error() {
        let mut config = RunConfig::default();
        config.scenario.rps = 0.0;
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unnamed_phase() {
        let mut config = RunConfig::default();
        config.phases = Some(vec![
            PhaseSpec::new("ramp", 20.0, Duration::from_millis(200)),
            PhaseSpec::new("  ", 20.0, Duration::from_millis(200)),
        ]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnnamedPhase(1))
        ));

        config.phases = Some(vec![PhaseSpec::new("", 20.0, Duration::from_millis(200))]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnnamedPhase(0))
        ));
    }

    #[test]
    fn test_vanishing_rate_is_valid() {
        let mut config = RunConfig::default();
        config.phases = Some(vec![PhaseSpec::new("slow", 1e-300, Duration::from_millis(200))]);
        config.validate().unwrap();
        assert_eq!(config.plan().unwrap().phases()[0].expected_dispatches(), 0);
    }

    #[test]
    fn test_validate_address() {
        assert!(validate_address("127.0.0.1:1812").is_ok());
        assert!(validate_address("radius.example.net:1812").is_ok());
        assert!(validate_address("[::1]:1812").is_ok());
        assert!(validate_address("127.0.0.1").is_err());
        assert!(validate_address(":1812").is_err());
        assert!(validate_address("host:0").is_err());
        assert!(validate_address("host:radius").is_err());
    }

    #[test]
    fn test_phase_selector_parse() {
        assert_eq!("all".parse::<PhaseSelector>().unwrap(), PhaseSelector::All);
        assert_eq!("".parse::<PhaseSelector>().unwrap(), PhaseSelector::All);
        assert_eq!(
            "Spike".parse::<PhaseSelector>().unwrap(),
            PhaseSelector::Named("spike".to_string())
        );
    }

    #[test]
    fn test_pacing_parse() {
        assert_eq!("ticker".parse::<Pacing>().unwrap(), Pacing::Ticker);
        assert_eq!("token-bucket".parse::<Pacing>().unwrap(), Pacing::TokenBucket);
        assert!("poisson".parse::<Pacing>().is_err());
    }

    #[test]
    fn test_plan_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[phases]]
name = "ramp"
rate = 50.0
duration_ms = 2000

[[phases]]
name = "hold"
rate = 150.0
duration_ms = 8000
"#
        )
        .unwrap();

        let plan = PlanFile::from_file(file.path()).unwrap();
        assert_eq!(plan.phases.len(), 2);
        assert_eq!(plan.phases[0].name, "ramp");
        assert_eq!(plan.phases[1].duration, Duration::from_secs(8));

        let mut config = RunConfig::default();
        config.phases = Some(plan.phases);
        config.scenario.phase = "hold".parse().unwrap();
        let selected = config.plan().unwrap();
        assert_eq!(selected.phases().len(), 1);
        assert_eq!(selected.phases()[0].rate, 150.0);
    }

    #[test]
    fn test_config_serde() {
        let config = RunConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["target"]["timeout_ms"], 2000);
        assert_eq!(json["scenario"]["phase"], "all");
        assert_eq!(json["scenario"]["pacing"], "ticker");

        let back: RunConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.scenario.steady, Duration::from_secs(30));
    }
}
