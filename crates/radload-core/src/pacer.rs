use crate::config::Pacing;
use crate::limiter::{ConcurrencyLimiter, SlotPermit};
use crate::plan::PhaseSpec;
use crate::rate_limiter::TokenBucket;
use serde::Serialize;
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Resolution of the tokio timer wheel.
const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

/// Stand-in deadline for durations past what `Instant` can represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn offset(start: Instant, by: Duration) -> Instant {
    start
        .checked_add(by)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// What one phase actually did.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseOutcome {
    pub name: String,
    pub rate: f64,
    pub duration: Duration,
    /// Dispatch events that obtained a slot
    pub dispatched: u64,
    pub elapsed: Duration,
}

impl PhaseOutcome {
    fn skipped(phase: &PhaseSpec) -> Self {
        Self {
            name: phase.name.clone(),
            rate: phase.rate,
            duration: phase.duration,
            dispatched: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn achieved_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.dispatched as f64 / secs
        } else {
            0.0
        }
    }
}

enum Ticks {
    Ticker(Interval),
    Bucket(TokenBucket),
}

impl Ticks {
    fn new(pacing: Pacing, phase: &PhaseSpec, start: Instant) -> Self {
        let interval = phase.interval();
        match pacing {
            Pacing::Ticker => {
                let mut ticker = interval_at(offset(start, interval), interval);
                // Below timer resolution several ticks come due per wakeup;
                // releasing them together is what holds the offered rate.
                if interval < TIMER_RESOLUTION {
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
                } else {
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                }
                Ticks::Ticker(ticker)
            }
            Pacing::TokenBucket => {
                let per_wakeup = (phase.rate * TIMER_RESOLUTION.as_secs_f64()).ceil();
                Ticks::Bucket(TokenBucket::with_burst(phase.rate, per_wakeup.max(1.0) as u32))
            }
        }
    }

    async fn next(&mut self) {
        match self {
            Ticks::Ticker(ticker) => {
                ticker.tick().await;
            }
            Ticks::Bucket(bucket) => bucket.acquire().await,
        }
    }
}

/// Emits dispatch events for one phase at its offered rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhasePacer {
    pacing: Pacing,
}

impl PhasePacer {
    pub fn new(pacing: Pacing) -> Self {
        Self { pacing }
    }

    /// Run `phase` until its deadline, calling `dispatch` with a held slot
    /// for every event.
    ///
    /// The deadline is checked against both the next tick and the slot
    /// wait, and wins any tie, so a saturated limiter cannot stretch the
    /// phase and nothing is dispatched after it ends.
    pub async fn run<F>(
        &self,
        phase: &PhaseSpec,
        limiter: &ConcurrencyLimiter,
        mut dispatch: F,
    ) -> PhaseOutcome
    where
        F: FnMut(SlotPermit),
    {
        if !phase.is_runnable() {
            return PhaseOutcome::skipped(phase);
        }

        let start = Instant::now();
        let deadline = offset(start, phase.duration);
        let mut ticks = Ticks::new(self.pacing, phase, start);
        let expiry = sleep_until(deadline);
        tokio::pin!(expiry);

        let mut dispatched = 0u64;
        let mut saturated = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = &mut expiry => break,
                _ = ticks.next() => {}
            }

            let permit = match limiter.try_acquire() {
                Some(permit) => Some(permit),
                None => {
                    saturated += 1;
                    tokio::select! {
                        biased;
                        _ = &mut expiry => None,
                        permit = limiter.acquire() => match permit {
                            Ok(permit) => Some(permit),
                            Err(e) => {
                                warn!("Phase {} stopped early: {}", phase.name, e);
                                None
                            }
                        },
                    }
                }
            };
            let Some(permit) = permit else { break };

            dispatch(permit);
            dispatched += 1;
        }

        if saturated > 0 {
            debug!(
                "Phase {}: {} dispatch events waited for a free slot",
                phase.name, saturated
            );
        }

        PhaseOutcome {
            name: phase.name.clone(),
            rate: phase.rate,
            duration: phase.duration,
            dispatched,
            elapsed: start.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_count_matches_rate() {
        let limiter = ConcurrencyLimiter::new(64).unwrap();
        let phase = PhaseSpec::new("steady", 100.0, Duration::from_secs(1));
        let start = Instant::now();
        let mut fired_at = Vec::new();

        let outcome = PhasePacer::new(Pacing::Ticker)
            .run(&phase, &limiter, |_permit| fired_at.push(Instant::now()))
            .await;

        assert!(
            (99..=100).contains(&outcome.dispatched),
            "dispatched: {}",
            outcome.dispatched
        );
        assert_eq!(outcome.dispatched as usize, fired_at.len());
        assert!(fired_at.iter().all(|t| *t < start + phase.duration));
        assert!(outcome.elapsed >= phase.duration);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_pacing_matches_rate() {
        let limiter = ConcurrencyLimiter::new(64).unwrap();
        let phase = PhaseSpec::new("steady", 200.0, Duration::from_secs(2));

        let outcome = PhasePacer::new(Pacing::TokenBucket)
            .run(&phase, &limiter, drop)
            .await;

        assert!(
            (398..=400).contains(&outcome.dispatched),
            "dispatched: {}",
            outcome.dispatched
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_millisecond_interval_holds_rate() {
        let limiter = ConcurrencyLimiter::new(64).unwrap();
        let phase = PhaseSpec::new("flood", 5000.0, Duration::from_millis(200));

        let outcome = PhasePacer::new(Pacing::Ticker)
            .run(&phase, &limiter, drop)
            .await;

        assert!(
            (990..=1000).contains(&outcome.dispatched),
            "dispatched: {}",
            outcome.dispatched
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_runnable_phase_is_noop() {
        let limiter = ConcurrencyLimiter::new(4).unwrap();
        let pacer = PhasePacer::default();

        for phase in [
            PhaseSpec::new("warmup", 0.0, Duration::from_secs(5)),
            PhaseSpec::new("warmup", 50.0, Duration::ZERO),
        ] {
            let start = Instant::now();
            let outcome = pacer
                .run(&phase, &limiter, |_| panic!("no dispatch expected"))
                .await;
            assert_eq!(outcome.dispatched, 0);
            assert_eq!(Instant::now(), start);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_limiter_does_not_stretch_phase() {
        let limiter = ConcurrencyLimiter::new(1).unwrap();
        let held = limiter.acquire().await.unwrap();
        let phase = PhaseSpec::new("spike", 1000.0, Duration::from_millis(100));

        let start = Instant::now();
        let outcome = PhasePacer::default().run(&phase, &limiter, drop).await;

        assert_eq!(outcome.dispatched, 0);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_never_exceeds_capacity() {
        let limiter = ConcurrencyLimiter::new(2).unwrap();
        let phase = PhaseSpec::new("steady", 100.0, Duration::from_secs(1));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let outcome = PhasePacer::default()
            .run(&phase, &limiter, |permit| {
                let active = active.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                });
            })
            .await;
        limiter.drain().await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
        // Two slots held 50ms each cap throughput near 40/s.
        assert!(outcome.dispatched <= 45, "dispatched: {}", outcome.dispatched);
        assert!(outcome.dispatched >= 30, "dispatched: {}", outcome.dispatched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanishing_rate_dispatches_nothing() {
        let limiter = ConcurrencyLimiter::new(4).unwrap();
        let phase = PhaseSpec::new("slow", 1e-300, Duration::from_millis(200));

        for pacing in [Pacing::Ticker, Pacing::TokenBucket] {
            let start = Instant::now();
            let outcome = PhasePacer::new(pacing).run(&phase, &limiter, drop).await;
            assert_eq!(outcome.dispatched, 0);
            assert_eq!(start.elapsed(), Duration::from_millis(200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_offset_saturates_instead_of_overflowing() {
        let start = Instant::now();
        assert_eq!(offset(start, Duration::from_secs(1)), start + Duration::from_secs(1));
        assert_eq!(offset(start, Duration::MAX), start + FAR_FUTURE);
    }
}
