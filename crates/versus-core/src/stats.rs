use crate::histogram::Histogram;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::time::Duration;

/// Percentile buckets printed for every endpoint.
pub const RENDER_PERCENTILES: [usize; 6] = [25, 50, 75, 90, 95, 99];

/// Per-endpoint counters, updated by the pool's workers under one lock per
/// response and read by the report once the workers have stopped.
#[derive(Debug, Clone, Default)]
pub struct EndpointStats {
    /// Workers the numbers were produced with; total latency divided by this
    /// approximates wall time.
    pub concurrency: usize,
    pub num_total: u64,
    pub num_errors: u64,
    pub total_elapsed: Duration,
    /// Time spent on errored requests specifically.
    pub time_errors: Duration,
    pub errors: BTreeMap<String, u64>,
    pub min_latency: Option<Duration>,
    timing: Histogram,
}

impl EndpointStats {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    /// Record one finished exchange.
    pub fn count(&mut self, error: Option<&str>, elapsed: Duration) {
        self.num_total += 1;
        self.total_elapsed += elapsed;
        self.timing.add(elapsed.as_secs_f64());
        if let Some(msg) = error {
            self.num_errors += 1;
            self.time_errors += elapsed;
            *self.errors.entry(msg.to_string()).or_insert(0) += 1;
        }
    }

    /// Fold in a transport's lowest observed latency.
    pub fn observe_min_latency(&mut self, latency: Option<Duration>) {
        let Some(latency) = latency else {
            return;
        };
        match self.min_latency {
            Some(current) if current <= latency => {}
            _ => self.min_latency = Some(latency),
        }
    }

    pub fn timing(&self) -> &Histogram {
        &self.timing
    }

    pub fn error_rate(&self) -> f64 {
        if self.num_total == 0 {
            return 0.0;
        }
        (self.num_errors * 100) as f64 / self.num_total as f64
    }

    /// Requests per second, scaled by concurrency.
    pub fn requests_per_second(&self) -> f64 {
        let concurrency = self.concurrency.max(1);
        (self.num_total as f64 * concurrency as f64) / self.timing.total()
    }

    pub fn render(&mut self, w: &mut impl Write) -> io::Result<()> {
        if self.num_total == 0 {
            writeln!(w, "   No requests.")?;
            return Ok(());
        }

        write!(w, "\n   Requests:   {:0.2} per second", self.requests_per_second())?;
        if self.num_errors > 0 && self.num_errors != self.num_total {
            let err_rps = self.num_errors as f64 / self.time_errors.as_secs_f64();
            write!(w, ", {:0.2} per second for errors", err_rps)?;
        }
        writeln!(w)?;

        let stddev = self.timing.variance().sqrt();
        writeln!(
            w,
            "   Timing:     {:0.4}s avg, {:0.4}s min, {:0.4}s max",
            self.timing.average(),
            self.timing.min(),
            self.timing.max()
        )?;
        writeln!(w, "               {:0.4}s standard deviation", stddev)?;
        if let Some(latency) = self.min_latency {
            writeln!(
                w,
                "               {:0.4}s minimum transport latency",
                latency.as_secs_f64()
            )?;
        }

        writeln!(w, "\n   Percentiles:")?;
        let percentiles = self.timing.percentiles(&RENDER_PERCENTILES);
        for (bucket, value) in RENDER_PERCENTILES.iter().zip(percentiles) {
            writeln!(w, "     {}% in {:0.4}s", bucket, value)?;
        }

        writeln!(w, "\n   Errors: {:0.2}%", self.error_rate())?;
        for (msg, num) in &self.errors {
            writeln!(w, "     {} × {:?}", num, msg)?;
        }

        Ok(())
    }
}
