#![forbid(unsafe_code)]

// Run-wide metric registry shared by every virtual user. Counters sum,
// trends keep raw millisecond samples for percentile stats, rates track a
// flagged/total fraction (failure rate for http_req_failed, pass rate for
// checks). Thresholds are evaluated over the whole run at the end.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid threshold expression '{0}' (expected <metric>:p95<N, <metric>:rate<F or <metric>:rate>F)")]
pub struct ThresholdError(String);

#[derive(Debug, Default, Clone, Copy)]
struct RateAcc {
    flagged: u64,
    total: u64,
}

/// Thread-safe metric sink. Lock sections are short; workers only ever
/// append or increment.
#[derive(Default)]
pub struct Registry {
    counters: Mutex<HashMap<String, u64>>,
    trends: Mutex<HashMap<String, Vec<u64>>>,
    rates: Mutex<HashMap<String, RateAcc>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1);
    }

    pub fn add_counter(&self, name: &str, amount: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name.to_string()).or_default() += amount;
        }
    }

    /// Records one duration sample (milliseconds) into a named trend.
    pub fn record_duration(&self, name: &str, ms: u64) {
        if let Ok(mut trends) = self.trends.lock() {
            trends.entry(name.to_string()).or_default().push(ms);
        }
    }

    /// Records one observation into a named rate. The reported fraction is
    /// flagged/total, whatever polarity the caller gives `flagged`.
    pub fn add_rate(&self, name: &str, flagged: bool) {
        if let Ok(mut rates) = self.rates.lock() {
            let acc = rates.entry(name.to_string()).or_default();
            acc.total += 1;
            if flagged {
                acc.flagged += 1;
            }
        }
    }

    /// Records a named pass/fail check, and folds it into the global
    /// `checks` rate. Returns `pass` so call sites can stay expression-shaped.
    pub fn check(&self, name: &str, pass: bool) -> bool {
        self.add_rate("checks", pass);
        self.add_rate(name, pass);
        pass
    }

    /// Aggregates everything recorded so far into an immutable report.
    pub fn snapshot(&self) -> RunReport {
        let counters = self
            .counters
            .lock()
            .map(|c| c.clone().into_iter().collect())
            .unwrap_or_default();

        let trends = self
            .trends
            .lock()
            .map(|t| {
                t.iter()
                    .map(|(name, samples)| (name.clone(), TrendStats::from_samples(samples)))
                    .collect()
            })
            .unwrap_or_default();

        let rates = self
            .rates
            .lock()
            .map(|r| {
                r.iter()
                    .map(|(name, acc)| {
                        let rate = if acc.total > 0 {
                            acc.flagged as f64 / acc.total as f64
                        } else {
                            0.0
                        };
                        (
                            name.clone(),
                            RateStats {
                                flagged: acc.flagged,
                                total: acc.total,
                                rate,
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        RunReport {
            counters,
            trends,
            rates,
        }
    }
}

/// Percentile statistics for a single trend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrendStats {
    pub count: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl TrendStats {
    fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let count = sorted.len();
        Self {
            count,
            min_ms: sorted[0],
            max_ms: *sorted.last().unwrap(),
            avg_ms: sorted.iter().sum::<u64>() / count as u64,
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            p99_ms: percentile(&sorted, 0.99),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateStats {
    pub flagged: u64,
    pub total: u64,
    pub rate: f64,
}

/// Immutable end-of-run aggregation, in stable name order for reporting.
#[derive(Debug, Default)]
pub struct RunReport {
    pub counters: BTreeMap<String, u64>,
    pub trends: BTreeMap<String, TrendStats>,
    pub rates: BTreeMap<String, RateStats>,
}

impl RunReport {
    pub fn trend(&self, name: &str) -> Option<&TrendStats> {
        self.trends.get(name)
    }

    pub fn rate(&self, name: &str) -> Option<&RateStats> {
        self.rates.get(name)
    }

    pub fn evaluate(&self, thresholds: &[Threshold]) -> Vec<Verdict> {
        thresholds.iter().map(|t| t.evaluate(self)).collect()
    }

    pub fn print_summary(&self, verdicts: &[Verdict]) {
        println!("\n=== Load Test Summary ===");

        if !self.counters.is_empty() {
            println!("\nCounters:");
            for (name, value) in &self.counters {
                println!("  {name}: {value}");
            }
        }

        if !self.trends.is_empty() {
            println!("\nTrends:");
            for (name, stats) in &self.trends {
                println!(
                    "  {name}: avg={}ms p50={}ms p95={}ms p99={}ms min={}ms max={}ms (n={})",
                    stats.avg_ms,
                    stats.p50_ms,
                    stats.p95_ms,
                    stats.p99_ms,
                    stats.min_ms,
                    stats.max_ms,
                    stats.count
                );
            }
        }

        if !self.rates.is_empty() {
            println!("\nRates:");
            for (name, stats) in &self.rates {
                println!(
                    "  {name}: {:.2}% ({}/{})",
                    stats.rate * 100.0,
                    stats.flagged,
                    stats.total
                );
            }
        }

        if !verdicts.is_empty() {
            println!("\nThresholds:");
            for verdict in verdicts {
                let outcome = if verdict.passed { "PASS" } else { "FAIL" };
                println!("  [{outcome}] {} ({})", verdict.expression, verdict.observed);
            }
        }

        println!("========================\n");
    }
}

/// A pass/fail condition over one aggregated metric for the whole run.
#[derive(Debug, Clone, PartialEq)]
pub enum Threshold {
    /// Trend p95 must stay under the limit (milliseconds).
    TrendP95Below { metric: String, limit_ms: u64 },
    /// Rate fraction must stay under the limit.
    RateBelow { metric: String, limit: f64 },
    /// Rate fraction must stay above the limit.
    RateAbove { metric: String, limit: f64 },
}

#[derive(Debug, Clone)]
pub struct Verdict {
    pub expression: String,
    pub passed: bool,
    pub observed: String,
}

impl Threshold {
    /// Parses the compact form used on the command line:
    /// `http_req_duration:p95<500`, `http_req_failed:rate<0.01`,
    /// `checks:rate>0.99`.
    pub fn parse(expr: &str) -> Result<Self, ThresholdError> {
        let bad = || ThresholdError(expr.to_string());
        let (metric, condition) = expr.split_once(':').ok_or_else(bad)?;
        if metric.is_empty() {
            return Err(bad());
        }
        let metric = metric.to_string();

        if let Some(limit) = condition.strip_prefix("p95<") {
            let limit_ms = limit.trim().parse().map_err(|_| bad())?;
            return Ok(Threshold::TrendP95Below { metric, limit_ms });
        }
        if let Some(limit) = condition.strip_prefix("rate<") {
            let limit = limit.trim().parse().map_err(|_| bad())?;
            return Ok(Threshold::RateBelow { metric, limit });
        }
        if let Some(limit) = condition.strip_prefix("rate>") {
            let limit = limit.trim().parse().map_err(|_| bad())?;
            return Ok(Threshold::RateAbove { metric, limit });
        }
        Err(bad())
    }

    pub fn expression(&self) -> String {
        match self {
            Threshold::TrendP95Below { metric, limit_ms } => format!("{metric}:p95<{limit_ms}"),
            Threshold::RateBelow { metric, limit } => format!("{metric}:rate<{limit}"),
            Threshold::RateAbove { metric, limit } => format!("{metric}:rate>{limit}"),
        }
    }

    /// A threshold over a metric that recorded no samples passes; only
    /// observed data can violate a bound.
    pub fn evaluate(&self, report: &RunReport) -> Verdict {
        let (passed, observed) = match self {
            Threshold::TrendP95Below { metric, limit_ms } => match report.trend(metric) {
                Some(stats) if stats.count > 0 => {
                    (stats.p95_ms < *limit_ms, format!("p95={}ms", stats.p95_ms))
                }
                _ => (true, "no samples".to_string()),
            },
            Threshold::RateBelow { metric, limit } => match report.rate(metric) {
                Some(stats) if stats.total > 0 => {
                    (stats.rate < *limit, format!("rate={:.4}", stats.rate))
                }
                _ => (true, "no samples".to_string()),
            },
            Threshold::RateAbove { metric, limit } => match report.rate(metric) {
                Some(stats) if stats.total > 0 => {
                    (stats.rate > *limit, format!("rate={:.4}", stats.rate))
                }
                _ => (true, "no samples".to_string()),
            },
        };
        Verdict {
            expression: self.expression(),
            passed,
            observed,
        }
    }
}

fn percentile(sorted_data: &[u64], p: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let idx = (p * (sorted_data.len() - 1) as f64).round() as usize;
    sorted_data[idx.min(sorted_data.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_sum_across_callers() {
        let registry = Registry::new();
        for _ in 0..3 {
            registry.inc_counter("ws_messages_sent");
        }
        registry.add_counter("ws_messages_sent", 2);

        let report = registry.snapshot();
        assert_eq!(report.counters.get("ws_messages_sent"), Some(&5));
    }

    #[test]
    fn test_trend_percentiles() {
        let registry = Registry::new();
        for ms in 1..=100 {
            registry.record_duration("http_req_duration", ms);
        }

        let report = registry.snapshot();
        let stats = report.trend("http_req_duration").unwrap();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min_ms, 1);
        assert_eq!(stats.max_ms, 100);
        assert_eq!(stats.p50_ms, 51);
        assert_eq!(stats.p95_ms, 95);
    }

    #[test]
    fn test_check_feeds_named_and_global_rates() {
        let registry = Registry::new();
        assert!(registry.check("room list 200", true));
        assert!(!registry.check("room list 200", false));
        registry.check("room detail 200", true);

        let report = registry.snapshot();
        let named = report.rate("room list 200").unwrap();
        assert_eq!((named.flagged, named.total), (1, 2));
        let global = report.rate("checks").unwrap();
        assert_eq!((global.flagged, global.total), (2, 3));
    }

    #[test]
    fn test_threshold_parsing() {
        assert_eq!(
            Threshold::parse("http_req_duration:p95<500").unwrap(),
            Threshold::TrendP95Below {
                metric: "http_req_duration".to_string(),
                limit_ms: 500
            }
        );
        assert_eq!(
            Threshold::parse("http_req_failed:rate<0.01").unwrap(),
            Threshold::RateBelow {
                metric: "http_req_failed".to_string(),
                limit: 0.01
            }
        );
        assert_eq!(
            Threshold::parse("checks:rate>0.99").unwrap(),
            Threshold::RateAbove {
                metric: "checks".to_string(),
                limit: 0.99
            }
        );

        assert!(Threshold::parse("nonsense").is_err());
        assert!(Threshold::parse("m:p95<abc").is_err());
        assert!(Threshold::parse(":p95<100").is_err());
    }

    #[test]
    fn test_slow_server_violates_p95_threshold() {
        let registry = Registry::new();
        // Every request pinned at 600ms must fail a p95<500 bound.
        for _ in 0..50 {
            registry.record_duration("http_req_duration", 600);
        }

        let report = registry.snapshot();
        let threshold = Threshold::parse("http_req_duration:p95<500").unwrap();
        let verdict = threshold.evaluate(&report);
        assert!(!verdict.passed);
        assert_eq!(verdict.observed, "p95=600ms");
    }

    #[test]
    fn test_error_rate_threshold() {
        let registry = Registry::new();
        for i in 0..100 {
            registry.add_rate("http_req_failed", i < 5);
        }

        let report = registry.snapshot();
        let threshold = Threshold::parse("http_req_failed:rate<0.01").unwrap();
        assert!(!threshold.evaluate(&report).passed);

        let loose = Threshold::parse("http_req_failed:rate<0.10").unwrap();
        assert!(loose.evaluate(&report).passed);
    }

    #[test]
    fn test_threshold_on_absent_metric_passes() {
        let report = RunReport::default();
        let threshold = Threshold::parse("ws_message_latency:p95<500").unwrap();
        let verdict = threshold.evaluate(&report);
        assert!(verdict.passed);
        assert_eq!(verdict.observed, "no samples");
    }
}
