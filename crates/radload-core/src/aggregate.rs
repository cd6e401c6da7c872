use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::BufRead;
use tracing::warn;

/// Outcome code counted as success.
pub const ACCEPT_CODE: &str = "Access-Accept";
/// Label for records that carry no phase.
pub const UNKNOWN_PHASE: &str = "unknown";

/// The subset of an output line the aggregator reads.
///
/// Everything is optional so unknown or missing fields never reject a
/// line. Only JSON objects are records.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordLine {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub outcome_code: Option<String>,
    #[serde(default)]
    pub error_detail: Option<String>,
}

/// Short field names written by older streams.
const FIELD_ALIASES: [(&str, &str); 2] = [("outcome_code", "code"), ("error_detail", "err")];

impl RecordLine {
    /// Parse one line, which must be a JSON object.
    ///
    /// When both a field and its short alias are present the full name
    /// wins, unless it is null.
    pub fn parse(line: &[u8]) -> Result<Self, serde_json::Error> {
        let mut fields: Map<String, Value> = serde_json::from_slice(line)?;
        for (name, alias) in FIELD_ALIASES {
            let Some(value) = fields.remove(alias) else {
                continue;
            };
            if fields.get(name).map_or(true, Value::is_null) {
                fields.insert(name.to_string(), value);
            }
        }
        serde_json::from_value(Value::Object(fields))
    }
}

/// Running statistics for one phase label.
#[derive(Debug, Clone, Default)]
pub struct PhaseStats {
    pub count: u64,
    pub ok: u64,
    pub errors: u64,
    samples: Vec<f64>,
    min: Option<f64>,
    max: Option<f64>,
}

impl PhaseStats {
    fn record(&mut self, ok: bool, latency_ms: Option<f64>) {
        self.count += 1;
        if ok {
            self.ok += 1;
        } else {
            self.errors += 1;
        }

        if let Some(latency) = latency_ms.filter(|l| *l > 0.0 && l.is_finite()) {
            self.samples.push(latency);
            self.min = Some(self.min.map_or(latency, |m| m.min(latency)));
            self.max = Some(self.max.map_or(latency, |m| m.max(latency)));
        }
    }

    /// Latency samples in arrival order.
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.errors as f64 / self.count as f64 * 100.0
        }
    }

    pub fn summarize(&self, phase: &str) -> PhaseSummary {
        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);

        PhaseSummary {
            phase: phase.to_string(),
            count: self.count,
            ok: self.ok,
            errors: self.errors,
            error_rate: self.error_rate(),
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
            min: self.min.unwrap_or(0.0),
            max: self.max.unwrap_or(0.0),
        }
    }
}

/// Final per-phase numbers, latencies in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSummary {
    pub phase: String,
    pub count: u64,
    pub ok: u64,
    pub errors: u64,
    /// Errors as a percentage of count
    pub error_rate: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
}

/// Linear-interpolated percentile of an ascending slice.
///
/// `p` is clamped to `[0, 100]`; an empty slice yields 0.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 100.0) };
    let last = sorted.len() - 1;

    let pos = p / 100.0 * last as f64;
    let lower = pos.floor() as usize;
    let upper = (pos.ceil() as usize).min(last);
    if lower == upper {
        return sorted[lower];
    }
    let (a, b) = (sorted[lower], sorted[upper]);
    let frac = pos - lower as f64;
    // Keep rounding from stepping outside the bracketing samples.
    (a + (b - a) * frac).max(a).min(b)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Non-blank lines seen
    pub lines: u64,
    /// Lines that did not parse as a record
    pub malformed: u64,
}

/// Groups a stream of output lines by phase.
#[derive(Debug, Default)]
pub struct StreamAggregator {
    phases: BTreeMap<String, PhaseStats>,
    report: IngestReport,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, line: RecordLine) {
        let phase = match line.phase {
            Some(p) if !p.is_empty() => p,
            _ => UNKNOWN_PHASE.to_string(),
        };
        let ok = line
            .outcome_code
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(ACCEPT_CODE));

        self.phases
            .entry(phase)
            .or_default()
            .record(ok, line.latency_ms);
    }

    /// Parse and record one line. Blank lines are ignored.
    pub fn ingest_line(&mut self, line: &[u8]) -> Result<(), serde_json::Error> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        self.report.lines += 1;
        match RecordLine::parse(line) {
            Ok(rec) => {
                self.record(rec);
                Ok(())
            }
            Err(e) => {
                self.report.malformed += 1;
                Err(e)
            }
        }
    }

    /// Consume a newline-delimited stream to its end.
    ///
    /// Malformed lines are logged and skipped; only a read failure stops
    /// ingestion.
    pub fn ingest<R: BufRead>(&mut self, mut reader: R) -> std::io::Result<IngestReport> {
        let mut buf = Vec::with_capacity(512);
        let mut line_no = 0u64;
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            line_no += 1;
            if let Err(e) = self.ingest_line(&buf) {
                warn!("Skipping line {}: {}", line_no, e);
            }
        }
        Ok(self.report)
    }

    pub fn report(&self) -> IngestReport {
        self.report
    }

    pub fn stats(&self, phase: &str) -> Option<&PhaseStats> {
        self.phases.get(phase)
    }

    /// Current summaries, sorted by phase name.
    pub fn summaries(&self) -> Vec<PhaseSummary> {
        self.phases
            .iter()
            .map(|(phase, stats)| stats.summarize(phase))
            .collect()
    }

    pub fn finish(self) -> Vec<PhaseSummary> {
        self.summaries()
    }
}

pub const TABLE_HEADER: &str =
    "Phase\tCount\tOK\tErrors\tErrorRate%\tP50(ms)\tP95(ms)\tP99(ms)\tMin(ms)\tMax(ms)";

/// Tab-separated report, one header row then one row per phase.
pub fn render_table(summaries: &[PhaseSummary]) -> String {
    let mut out = String::new();
    out.push_str(TABLE_HEADER);
    out.push('\n');
    for s in summaries {
        let _ = writeln!(
            out,
            "{}\t{}\t{}\t{}\t{:.2}\t{:.1}\t{:.1}\t{:.1}\t{:.1}\t{:.1}",
            s.phase, s.count, s.ok, s.errors, s.error_rate, s.p50, s.p95, s.p99, s.min, s.max
        );
    }
    out
}
