// Part of ethercat-bus. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! SDO round-trip measurement.

use crate::bus::Bus;
use crate::link::{Link, LinkProvider};
use crate::slave::lock;
use crate::types::{Error, Result, SlavePos};
use log::*;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Summary of a latency run, all times in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleStats {
    pub count: usize,
    pub errors: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub std_ms: f64,
    pub samples_ms: Vec<f64>,
}

impl CycleStats {
    /// `None` for an empty sample set.
    pub fn from_samples(samples: &[Duration], errors: usize) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let samples_ms: Vec<f64> = samples.iter().map(|d| d.as_nanos() as f64 / 1e6).collect();
        let mut sorted = samples_ms.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;
        let var = sorted.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        let quantile = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];

        Some(CycleStats {
            count: n,
            errors,
            min_ms: sorted[0],
            max_ms: sorted[n - 1],
            mean_ms: mean,
            median_ms: sorted[n / 2],
            p95_ms: quantile(0.95),
            p99_ms: quantile(0.99),
            std_ms: var.sqrt(),
            samples_ms,
        })
    }
}

/// Times SDO uploads from one object of a slave, outside the cyclic
/// exchange.  Each request holds the link for its duration.
pub struct LatencyProbe<'a, P: LinkProvider> {
    bus: &'a Bus<P>,
    index: u16,
    subindex: u8,
}

impl<'a, P: LinkProvider> LatencyProbe<'a, P> {
    /// Probes the device type object 0x1000:00.
    pub fn new(bus: &'a Bus<P>) -> Self {
        LatencyProbe { bus, index: 0x1000, subindex: 0 }
    }

    pub fn object(mut self, index: u16, subindex: u8) -> Self {
        self.index = index;
        self.subindex = subindex;
        self
    }

    /// Collects `sample_count` successful round trips.  Failed requests are
    /// counted and retried; the run is abandoned when the bus leaves OP or
    /// as many requests failed as samples were asked for.
    pub fn run(&self, slave: SlavePos, sample_count: usize) -> Result<CycleStats> {
        if sample_count == 0 {
            return Err(Error::Configuration("latency test needs at least one sample".into()));
        }
        let inner = self.bus.inner();
        let operational = || inner.state().is_operational() && !inner.is_reconnecting();
        if !operational() {
            return Err(Error::Communication(format!(
                "latency test needs an operational bus, bus is {}",
                inner.state()
            )));
        }
        if !inner.has_slave(slave) {
            return Err(Error::Configuration(format!("no slave at position {}", slave)));
        }
        info!(
            "PROBE: {} samples from slave {} at 0x{:04X}:{:02X}",
            sample_count, slave, self.index, self.subindex
        );

        let mut samples = Vec::with_capacity(sample_count);
        let mut errors = 0;
        let mut buf = [0u8; 64];
        while samples.len() < sample_count {
            if !operational() {
                return Err(Error::Communication(format!(
                    "bus left OPERATIONAL after {} of {} samples",
                    samples.len(),
                    sample_count
                )));
            }
            let result = match lock(inner.link()).as_mut() {
                Some(link) => {
                    let start = Instant::now();
                    link.sdo_read(slave, self.index, self.subindex, &mut buf)
                        .map(|_| start.elapsed())
                }
                None => return Err(Error::Communication("link lost during latency test".into())),
            };
            match result {
                Ok(rtt) => samples.push(rtt),
                Err(e) => {
                    errors += 1;
                    debug!("PROBE: request failed: {}", e);
                    if errors >= sample_count {
                        return Err(Error::Communication(format!(
                            "{} requests failed, last error: {}",
                            errors, e
                        )));
                    }
                }
            }
        }

        let stats = CycleStats::from_samples(&samples, errors)
            .ok_or_else(|| Error::Communication("no samples collected".into()))?;
        info!(
            "PROBE: min {:.3} ms, median {:.3} ms, p99 {:.3} ms, max {:.3} ms, {} errors",
            stats.min_ms, stats.median_ms, stats.p99_ms, stats.max_ms, stats.errors
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics() {
        let samples: Vec<Duration> = (1..=100).map(Duration::from_millis).collect();
        let stats = CycleStats::from_samples(&samples, 3).unwrap();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.min_ms, 1.0);
        assert_eq!(stats.max_ms, 100.0);
        assert!((stats.mean_ms - 50.5).abs() < 1e-9);
        assert_eq!(stats.median_ms, 51.0);
        assert_eq!(stats.p95_ms, 96.0);
        assert_eq!(stats.p99_ms, 100.0);
        assert!((stats.std_ms - 28.866_070).abs() < 1e-5);
        assert_eq!(stats.samples_ms.len(), 100);
    }

    #[test]
    fn single_and_empty() {
        let stats = CycleStats::from_samples(&[Duration::from_micros(250)], 0).unwrap();
        assert_eq!(stats.min_ms, 0.25);
        assert_eq!(stats.p99_ms, 0.25);
        assert_eq!(stats.std_ms, 0.0);
        assert!(CycleStats::from_samples(&[], 5).is_none());
    }

    #[test]
    fn samples_keep_their_order() {
        let samples = [3, 1, 2].iter().map(|&ms| Duration::from_millis(ms)).collect::<Vec<_>>();
        let stats = CycleStats::from_samples(&samples, 0).unwrap();
        assert_eq!(stats.samples_ms, vec![3.0, 1.0, 2.0]);
        assert_eq!(stats.median_ms, 2.0);
    }
}
