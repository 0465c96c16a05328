/// Latency histogram that retains every sample.
///
/// Samples are kept so percentiles can be computed exactly by sorting. Memory
/// grows linearly with the number of requests; a sparse bucketed sketch would
/// bound it at the cost of exact nearest-rank values.
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    samples: Vec<f64>,
    sorted: bool,
    min: f64,
    max: f64,
    total: f64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample (seconds).
    pub fn add(&mut self, point: f64) {
        self.samples.push(point);
        self.sorted = self.samples.len() == 1;
        self.total += point;
        if self.samples.len() == 1 || self.min > point {
            self.min = point;
        }
        if self.samples.len() == 1 || self.max < point {
            self.max = point;
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Mean of all samples. NaN when empty.
    pub fn average(&self) -> f64 {
        self.total / self.samples.len() as f64
    }

    /// Population variance (divides by the sample count). NaN when empty.
    pub fn variance(&self) -> f64 {
        let mean = self.average();
        let sum: f64 = self
            .samples
            .iter()
            .map(|v| {
                let delta = v - mean;
                delta * delta
            })
            .sum();
        sum / self.samples.len() as f64
    }

    /// Nearest-rank percentiles for whole-percent buckets (95 means 95%).
    ///
    /// Buckets must be in non-decreasing order. Each bucket takes the first
    /// sample whose rank `i * 100 / n` reaches it; buckets left over once the
    /// samples run out get the maximum. Returns zeros when there are no samples.
    pub fn percentiles(&mut self, buckets: &[usize]) -> Vec<f64> {
        let mut r = vec![0.0; buckets.len()];
        let n = self.samples.len();
        if n == 0 || buckets.is_empty() {
            return r;
        }

        if !self.sorted {
            self.samples.sort_by(f64::total_cmp);
            self.sorted = true;
        }

        let mut j = 0;
        for (i, &value) in self.samples.iter().enumerate() {
            if i * 100 / n >= buckets[j] {
                r[j] = value;
                j += 1;
                if j == buckets.len() {
                    return r;
                }
            }
        }

        // Fill up the remaining buckets with the highest value.
        let highest = self.samples[n - 1];
        for slot in &mut r[j..] {
            *slot = highest;
        }
        r
    }
}
