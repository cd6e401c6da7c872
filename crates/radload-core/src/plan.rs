use crate::config::{ConfigError, PhaseSelector};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest dispatch interval, guards against extreme rates.
pub const MIN_INTERVAL: Duration = Duration::from_micros(1);

/// One named interval of a run with its own offered rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    /// Offered requests per second
    pub rate: f64,
    #[serde(rename = "duration_ms", with = "crate::config::duration_ms")]
    pub duration: Duration,
}

impl PhaseSpec {
    pub fn new(name: impl Into<String>, rate: f64, duration: Duration) -> Self {
        Self {
            name: name.into(),
            rate,
            duration,
        }
    }

    /// A phase with a non-positive rate or duration dispatches nothing.
    pub fn is_runnable(&self) -> bool {
        self.rate > 0.0 && self.rate.is_finite() && !self.duration.is_zero()
    }

    /// Spacing between dispatch events, never below [`MIN_INTERVAL`] and
    /// never beyond the phase duration.
    pub fn interval(&self) -> Duration {
        if !self.is_runnable() {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(1.0 / self.rate)
            .unwrap_or(self.duration)
            .min(self.duration)
            .max(MIN_INTERVAL)
    }

    /// Requests the phase offers if every tick fires.
    pub fn expected_dispatches(&self) -> u64 {
        if !self.is_runnable() {
            return 0;
        }
        let interval = self.interval();
        if interval >= self.duration {
            return 0;
        }
        (self.duration.as_nanos() / interval.as_nanos()) as u64
    }
}

/// Ordered phases, executed strictly one after another.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    phases: Vec<PhaseSpec>,
}

impl PhasePlan {
    pub fn new(phases: Vec<PhaseSpec>) -> Self {
        Self { phases }
    }

    /// The `warmup -> steady -> spike` sequence.
    pub fn standard(
        rate: f64,
        warmup: Duration,
        steady: Duration,
        spike: Duration,
        spike_multiplier: f64,
    ) -> Self {
        Self::new(vec![
            PhaseSpec::new("warmup", rate, warmup),
            PhaseSpec::new("steady", rate, steady),
            PhaseSpec::new("spike", rate * spike_multiplier, spike),
        ])
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    /// Keep every phase, or only the one named by the selector.
    pub fn select(self, selector: &PhaseSelector) -> Result<Self, ConfigError> {
        match selector {
            PhaseSelector::All => Ok(self),
            PhaseSelector::Named(name) => self
                .phases
                .into_iter()
                .find(|p| p.name.eq_ignore_ascii_case(name))
                .map(|p| Self::new(vec![p]))
                .ok_or_else(|| ConfigError::UnknownPhase(name.clone())),
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.phases
            .iter()
            .filter(|p| p.is_runnable())
            .map(|p| p.duration)
            .sum()
    }

    /// The phase scheduled at `elapsed` since the start of the run.
    pub fn phase_at(&self, elapsed: Duration) -> Option<&PhaseSpec> {
        let mut cumulative = Duration::ZERO;
        for phase in self.phases.iter().filter(|p| p.is_runnable()) {
            cumulative += phase.duration;
            if elapsed < cumulative {
                return Some(phase);
            }
        }
        None
    }
}
