use crate::config::{ConfigError, RunConfig};
use crate::exchange::Exchanger;
use crate::executor::{RequestExecutor, UserPool};
use crate::limiter::{ConcurrencyLimiter, LimiterClosed};
use crate::pacer::{PhaseOutcome, PhasePacer};
use crate::plan::PhasePlan;
use crate::record::OutcomeRecord;
use crate::sink::{MetricsSink, SinkReport};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Limiter(#[from] LimiterClosed),
    #[error("output stream: {0}")]
    Sink(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub phases: Vec<PhaseOutcome>,
    pub written: u64,
    pub skipped: u64,
    /// Written records with a failure outcome
    pub failures: u64,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn dispatched(&self) -> u64 {
        self.phases.iter().map(|p| p.dispatched).sum()
    }
}

/// Runs the selected phases in order and owns the end-of-run drain.
pub struct PhaseSequencer {
    plan: PhasePlan,
    pacer: PhasePacer,
    limiter: ConcurrencyLimiter,
    executor: Arc<RequestExecutor>,
    users: Arc<UserPool>,
    seed: Option<u64>,
}

impl PhaseSequencer {
    pub fn new(
        plan: PhasePlan,
        pacer: PhasePacer,
        limiter: ConcurrencyLimiter,
        executor: RequestExecutor,
        users: UserPool,
        seed: Option<u64>,
    ) -> Self {
        Self {
            plan,
            pacer,
            limiter,
            executor: Arc::new(executor),
            users: Arc::new(users),
            seed,
        }
    }

    /// Validate `config` and wire up every component around `exchanger`.
    pub fn from_config(
        config: &RunConfig,
        exchanger: Arc<dyn Exchanger>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let executor = RequestExecutor::new(
            exchanger,
            config.target.password.clone(),
            config.target.timeout,
            config.scenario.test_id.clone(),
        );
        Ok(Self::new(
            config.plan()?,
            PhasePacer::new(config.scenario.pacing),
            ConcurrencyLimiter::new(config.scenario.workers)?,
            executor,
            UserPool::new(config.scenario.users),
            config.scenario.seed,
        ))
    }

    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Run every phase, then wait until no request is still in flight.
    ///
    /// `records` is dropped on return, so once the caller drops its own
    /// senders the sink sees end of stream with every record delivered.
    pub async fn run(
        &self,
        records: mpsc::Sender<OutcomeRecord>,
    ) -> Result<Vec<PhaseOutcome>, LimiterClosed> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut outcomes = Vec::with_capacity(self.plan.phases().len());

        for phase in self.plan.phases() {
            if !phase.is_runnable() {
                warn!(
                    "Skipping phase {}: rate={} duration={:?}",
                    phase.name, phase.rate, phase.duration
                );
                outcomes.push(self.pacer.run(phase, &self.limiter, drop).await);
                continue;
            }

            info!(
                "Starting phase {}: {:.1} req/s for {:?} (interval {:?})",
                phase.name,
                phase.rate,
                phase.duration,
                phase.interval()
            );

            let phase_name: Arc<str> = Arc::from(phase.name.as_str());
            let outcome = self
                .pacer
                .run(phase, &self.limiter, |permit| {
                    let username = self.users.pick(&mut rng).to_string();
                    let executor = self.executor.clone();
                    let records = records.clone();
                    let phase_name = phase_name.clone();

                    tokio::spawn(async move {
                        let record = executor.execute(&phase_name, &username).await;
                        if records.send(record).await.is_err() {
                            warn!("Metrics sink closed; dropping record for {}", username);
                        }
                        drop(permit);
                    });
                })
                .await;

            info!(
                "Finished phase {}: dispatched={} achieved={:.1} req/s in_flight={}",
                outcome.name,
                outcome.dispatched,
                outcome.achieved_rate(),
                self.limiter.in_flight()
            );
            outcomes.push(outcome);
        }

        info!(
            "Waiting for {} in-flight requests to complete...",
            self.limiter.in_flight()
        );
        self.limiter.drain().await?;
        Ok(outcomes)
    }

    /// Full lifecycle: start the sink, run, drain, close and flush.
    pub async fn run_to_writer<W>(
        &self,
        writer: W,
        channel_capacity: usize,
    ) -> Result<(W, RunReport), RunError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let start = Instant::now();
        let (records, sink) = MetricsSink::spawn(writer, channel_capacity);

        let phases = self.run(records).await;
        // The sender is gone either way; let the sink finish before reporting.
        let (writer, SinkReport { written, skipped, failures }) = sink.finish().await?;
        let phases = phases?;

        let report = RunReport {
            phases,
            written,
            skipped,
            failures,
            elapsed: start.elapsed(),
        };
        if report.written + report.skipped != report.dispatched() {
            warn!(
                "Record count mismatch: dispatched={} written={} skipped={}",
                report.dispatched(),
                report.written,
                report.skipped
            );
        }
        Ok((writer, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Pacing;
    use crate::exchange::MockExchanger;
    use crate::plan::PhaseSpec;
    use crate::record::TIMEOUT_CODE;
    use std::collections::HashMap;

    fn sequencer(plan: PhasePlan, exchanger: MockExchanger, workers: usize) -> PhaseSequencer {
        PhaseSequencer::new(
            plan,
            PhasePacer::new(Pacing::Ticker),
            ConcurrencyLimiter::new(workers).unwrap(),
            RequestExecutor::new(
                Arc::new(exchanger),
                "pass123",
                Duration::from_millis(200),
                Some("seq-test".to_string()),
            ),
            UserPool::new(10),
            Some(1),
        )
    }

    fn parse(out: Vec<u8>) -> Vec<OutcomeRecord> {
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_dispatch_yields_one_record() {
        let plan = PhasePlan::standard(
            50.0,
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(200),
            2.0,
        );
        let seq = sequencer(plan, MockExchanger::new(Duration::from_millis(30)), 8);

        let (out, report) = seq.run_to_writer(Vec::new(), 16).await.unwrap();
        let records = parse(out);

        assert_eq!(report.written, report.dispatched());
        assert_eq!(records.len() as u64, report.dispatched());
        assert_eq!(report.skipped, 0);
        assert_eq!(report.failures, 0);
        assert_eq!(seq.limiter().in_flight(), 0);

        let mut per_phase: HashMap<&str, u64> = HashMap::new();
        for r in &records {
            *per_phase.entry(r.phase.as_str()).or_default() += 1;
            assert_eq!(r.test_id.as_deref(), Some("seq-test"));
            assert!(r.latency_ms > 0.0);
        }
        for outcome in &report.phases {
            assert_eq!(per_phase.get(outcome.name.as_str()).copied().unwrap_or(0), outcome.dispatched);
        }
        // spike runs at twice the base rate
        assert!(report.phases[2].dispatched > report.phases[0].dispatched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_recorded_not_raised() {
        let plan = PhasePlan::new(vec![PhaseSpec::new("steady", 20.0, Duration::from_millis(500))]);
        let seq = sequencer(plan, MockExchanger::new(Duration::from_secs(5)), 4);

        let (out, report) = seq.run_to_writer(Vec::new(), 4).await.unwrap();
        let records = parse(out);

        assert!(report.dispatched() > 0);
        assert_eq!(records.len() as u64, report.dispatched());
        assert!(records.iter().all(|r| r.outcome_code == TIMEOUT_CODE));
        assert!(records.iter().all(|r| r.latency_ms == 200.0));
        assert_eq!(report.failures, report.written);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_phase_produces_no_records() {
        let plan = PhasePlan::new(vec![
            PhaseSpec::new("warmup", 0.0, Duration::from_secs(1)),
            PhaseSpec::new("steady", 10.0, Duration::from_millis(500)),
            PhaseSpec::new("spike", 30.0, Duration::ZERO),
        ]);
        let seq = sequencer(plan, MockExchanger::new(Duration::from_millis(5)), 4);

        let (out, report) = seq.run_to_writer(Vec::new(), 4).await.unwrap();
        let records = parse(out);

        assert_eq!(report.phases[0].dispatched, 0);
        assert_eq!(report.phases[2].dispatched, 0);
        assert!(records.iter().all(|r| r.phase == "steady"));
        assert_eq!(records.len() as u64, report.phases[1].dispatched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_channel_does_not_deadlock_drain() {
        let plan = PhasePlan::new(vec![PhaseSpec::new("steady", 500.0, Duration::from_millis(300))]);
        let seq = sequencer(plan, MockExchanger::new(Duration::from_millis(1)), 64);

        let (out, report) = seq.run_to_writer(Vec::new(), 1).await.unwrap();
        assert_eq!(parse(out).len() as u64, report.dispatched());
    }

    #[tokio::test(start_paused = true)]
    async fn test_from_config() {
        let mut config = RunConfig::default();
        config.scenario.phase = "warmup".parse().unwrap();
        config.scenario.warmup = Duration::from_millis(100);
        config.scenario.rps = 100.0;

        let seq = PhaseSequencer::from_config(
            &config,
            Arc::new(MockExchanger::new(Duration::from_millis(2))),
        )
        .unwrap();
        assert_eq!(seq.plan().phases().len(), 1);

        let (out, report) = seq.run_to_writer(Vec::new(), 64).await.unwrap();
        assert_eq!(parse(out).len() as u64, report.dispatched());
        assert!(report.dispatched() >= 9);

        config.scenario.workers = 0;
        assert!(PhaseSequencer::from_config(
            &config,
            Arc::new(MockExchanger::new(Duration::ZERO))
        )
        .is_err());
    }
}
