use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const RESERVOIR_CAPACITY: usize = 512;

/// Counter set shared by the window totals and the per-pod/per-node tables.
#[derive(Debug, Default, Clone)]
pub struct SubStats {
    pub events: u64,
    pub queries: u64,
    pub errors: u64,
    pub sum_exec_ms: u64,
}

impl SubStats {
    fn absorb(&mut self, obs: &Observation) {
        self.events += 1;
        if obs.is_query {
            self.queries += 1;
            self.sum_exec_ms += u64::from(obs.exec_ms.unwrap_or_default());
        }
        if obs.is_error {
            self.errors += 1;
        }
    }

    fn merge(&mut self, other: &SubStats) {
        self.events += other.events;
        self.queries += other.queries;
        self.errors += other.errors;
        self.sum_exec_ms += other.sum_exec_ms;
    }
}

/// Algorithm-R reservoir of execution times for one bucket.
#[derive(Debug)]
pub struct Reservoir {
    samples: Vec<u32>,
    seen: u64,
}

impl Reservoir {
    fn new() -> Self {
        Self {
            samples: Vec::new(),
            seen: 0,
        }
    }

    fn observe(&mut self, ms: u32, rng: &mut StdRng) {
        self.seen += 1;
        if self.samples.len() < RESERVOIR_CAPACITY {
            self.samples.push(ms);
        } else {
            let slot = rng.gen_range(0..self.seen);
            if (slot as usize) < RESERVOIR_CAPACITY {
                self.samples[slot as usize] = ms;
            }
        }
    }

    pub fn samples(&self) -> &[u32] {
        &self.samples
    }
}

#[derive(Debug, Clone)]
pub struct Observation<'a> {
    pub pod: &'a str,
    pub node: Option<&'a str>,
    pub is_query: bool,
    pub is_error: bool,
    pub exec_ms: Option<u32>,
}

#[derive(Debug)]
struct Bucket {
    second: i64,
    totals: SubStats,
    reservoir: Reservoir,
    per_pod: HashMap<String, SubStats>,
    per_node: HashMap<String, SubStats>,
}

impl Bucket {
    fn new(second: i64) -> Self {
        Self {
            second,
            totals: SubStats::default(),
            reservoir: Reservoir::new(),
            per_pod: HashMap::new(),
            per_node: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Percentiles {
    pub p50: u32,
    pub p95: u32,
    pub p99: u32,
}

/// Sliding window of 1-second buckets. Events land in the bucket of their
/// receive second; buckets fall off the moment they slip out of the window.
pub struct RollingWindow {
    window_secs: i64,
    buckets: VecDeque<Bucket>,
    rng: StdRng,
}

impl RollingWindow {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs: window_secs.max(1) as i64,
            buckets: VecDeque::new(),
            rng: StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(window_secs: u64, seed: u64) -> Self {
        Self {
            window_secs: window_secs.max(1) as i64,
            buckets: VecDeque::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn observe(&mut self, second: i64, obs: Observation<'_>) {
        if let Some(back) = self.buckets.back() {
            // Too old to matter even if the sender's clock is sane.
            if second <= back.second - self.window_secs {
                return;
            }
        }
        let index = match self
            .buckets
            .iter()
            .rposition(|bucket| bucket.second <= second)
        {
            Some(i) if self.buckets[i].second == second => i,
            Some(i) => {
                self.buckets.insert(i + 1, Bucket::new(second));
                i + 1
            }
            None => {
                self.buckets.push_front(Bucket::new(second));
                0
            }
        };
        let bucket = &mut self.buckets[index];
        bucket.totals.absorb(&obs);
        bucket
            .per_pod
            .entry(obs.pod.to_string())
            .or_default()
            .absorb(&obs);
        if let Some(node) = obs.node {
            bucket
                .per_node
                .entry(node.to_string())
                .or_default()
                .absorb(&obs);
        }
        if obs.is_query {
            if let Some(ms) = obs.exec_ms {
                bucket.reservoir.observe(ms, &mut self.rng);
            }
        }
    }

    /// A bucket `[s, s+1)` is dropped the instant its upper bound slips past
    /// `now - window`.
    pub fn evict(&mut self, now_second: i64) {
        let horizon = now_second - self.window_secs;
        while let Some(front) = self.buckets.front() {
            if front.second + 1 <= horizon {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_secs as u64
    }

    pub fn totals(&self) -> SubStats {
        let mut totals = SubStats::default();
        for bucket in &self.buckets {
            totals.merge(&bucket.totals);
        }
        totals
    }

    pub fn per_pod_totals(&self) -> HashMap<String, SubStats> {
        let mut out: HashMap<String, SubStats> = HashMap::new();
        for bucket in &self.buckets {
            for (pod, stats) in &bucket.per_pod {
                out.entry(pod.clone()).or_default().merge(stats);
            }
        }
        out
    }

    pub fn per_node_totals(&self) -> HashMap<String, SubStats> {
        let mut out: HashMap<String, SubStats> = HashMap::new();
        for bucket in &self.buckets {
            for (node, stats) in &bucket.per_node {
                out.entry(node.clone()).or_default().merge(stats);
            }
        }
        out
    }

    #[cfg(test)]
    fn sample_count(&self) -> usize {
        self.buckets.iter().map(|b| b.reservoir.samples().len()).sum()
    }

    /// Nearest-rank percentiles over the merged reservoir plus any synthetic
    /// in-flight observations for this tick.
    pub fn percentiles(&self, synthetic: &[u32]) -> Percentiles {
        let mut samples: Vec<u32> = self
            .buckets
            .iter()
            .flat_map(|b| b.reservoir.samples().iter().copied())
            .chain(synthetic.iter().copied())
            .collect();
        if samples.is_empty() {
            return Percentiles::default();
        }
        samples.sort_unstable();
        let rank = |q: f64| -> u32 {
            let n = samples.len() as f64;
            let idx = ((q * n).ceil() as usize).clamp(1, samples.len()) - 1;
            samples[idx]
        };
        Percentiles {
            p50: rank(0.50),
            p95: rank(0.95),
            p99: rank(0.99),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pod: &str, ms: u32) -> Observation<'_> {
        Observation {
            pod,
            node: None,
            is_query: true,
            is_error: false,
            exec_ms: Some(ms),
        }
    }

    #[test]
    fn observation_increments_counts_and_sum() {
        let mut window = RollingWindow::with_seed(60, 7);
        window.observe(100, query("p", 5));
        window.observe(100, query("p", 7));
        let totals = window.totals();
        assert_eq!(totals.queries, 2);
        assert_eq!(totals.sum_exec_ms, 12);
        assert_eq!(window.per_pod_totals()["p"].queries, 2);
    }

    #[test]
    fn eviction_removes_expired_buckets_only() {
        let mut window = RollingWindow::with_seed(60, 7);
        window.observe(100, query("p", 5));
        window.observe(159, query("p", 5));
        window.evict(160);
        assert_eq!(window.totals().queries, 2);
        window.evict(161);
        assert_eq!(window.totals().queries, 1, "second 100 fell out at 161");
        window.evict(220);
        assert_eq!(window.totals().queries, 0);
    }

    #[test]
    fn out_of_order_arrival_lands_in_its_own_bucket() {
        let mut window = RollingWindow::with_seed(60, 7);
        window.observe(100, query("p", 5));
        window.observe(98, query("p", 7));
        window.evict(100);
        assert_eq!(window.totals().queries, 2);
        // the older bucket still evicts on time
        window.evict(159);
        assert_eq!(window.totals().queries, 1);
    }

    #[test]
    fn percentiles_with_synthetic_observations() {
        let mut window = RollingWindow::with_seed(60, 7);
        for ms in 1..=100 {
            window.observe(100, query("p", ms));
        }
        let plain = window.percentiles(&[]);
        assert_eq!(plain.p50, 50);
        assert_eq!(plain.p95, 95);
        assert_eq!(plain.p99, 99);

        let spiked = window.percentiles(&[10_000]);
        assert!(spiked.p99 >= 100);
    }

    #[test]
    fn reservoir_caps_per_bucket_memory() {
        let mut window = RollingWindow::with_seed(60, 7);
        for i in 0..(RESERVOIR_CAPACITY as u32 * 2) {
            window.observe(100, query("p", i));
        }
        assert_eq!(window.totals().queries, RESERVOIR_CAPACITY as u64 * 2);
        assert_eq!(window.sample_count(), RESERVOIR_CAPACITY);
    }
}
