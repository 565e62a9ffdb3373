// Clock synchronization between producer and consumer
//
// Each inlet connection probes its outlet periodically. A probe records four
// timestamps: t0 (consumer send), t1 (producer receive), t2 (producer send) and
// t3 (consumer receive). From these:
//
//   offset = ((t0 - t1) + (t3 - t2)) / 2     local clock minus remote clock
//   rtt    = (t3 - t0) - (t2 - t1)
//
// so a producer timestamp maps to consumer time as `remote + offset`. Probes with
// an unusually long round trip carry the most asymmetric delay, so they are
// discarded instead of being folded into the estimate.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::Instant;

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic local time in seconds
pub fn local_clock() -> f64 {
    CLOCK_EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Probes needed before the outlier filter kicks in
const MIN_PROBES_FOR_FILTER: usize = 4;

/// Weight of a new accepted probe in the smoothed offset
const SMOOTHING: f64 = 0.25;

/// Jitter (seconds) tolerated above the percentile threshold
const RTT_TOLERANCE: f64 = 1e-4;

/// Result of folding one probe into the estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Accepted { offset: f64, rtt: f64 },
    Outlier { rtt: f64, threshold: f64 },
    Invalid,
}

/// Snapshot of the estimator
#[derive(Debug, Clone, Serialize)]
pub struct ClockStats {
    pub offset: Option<f64>,
    pub last_rtt: Option<f64>,
    pub accepted_probes: u64,
    pub rejected_probes: u64,
}

/// Running estimate of the clock offset of one connection
#[derive(Debug, Clone)]
pub struct ClockSync {
    rtts: VecDeque<f64>,
    window: usize,
    percentile: f64,
    estimate: Option<f64>,
    last_rtt: Option<f64>,
    accepted: u64,
    rejected: u64,
}

impl ClockSync {
    pub fn new(window: usize, percentile: f64) -> Self {
        Self {
            rtts: VecDeque::with_capacity(window),
            window: window.max(1),
            percentile: percentile.clamp(f64::MIN_POSITIVE, 1.0),
            estimate: None,
            last_rtt: None,
            accepted: 0,
            rejected: 0,
        }
    }

    /// Fold a completed probe into the estimate
    pub fn record_probe(&mut self, t0: f64, t1: f64, t2: f64, t3: f64) -> ProbeOutcome {
        let rtt = (t3 - t0) - (t2 - t1);
        let offset = ((t0 - t1) + (t3 - t2)) / 2.0;
        if !rtt.is_finite() || !offset.is_finite() || rtt < 0.0 {
            self.rejected += 1;
            return ProbeOutcome::Invalid;
        }

        let threshold = if self.rtts.len() >= MIN_PROBES_FOR_FILTER {
            Some(percentile(&self.rtts, self.percentile) + RTT_TOLERANCE)
        } else {
            None
        };

        if self.rtts.len() == self.window {
            self.rtts.pop_front();
        }
        self.rtts.push_back(rtt);
        self.last_rtt = Some(rtt);

        if let Some(threshold) = threshold {
            if rtt > threshold {
                self.rejected += 1;
                return ProbeOutcome::Outlier { rtt, threshold };
            }
        }

        self.estimate = Some(match self.estimate {
            None => offset,
            Some(current) => current + SMOOTHING * (offset - current),
        });
        self.accepted += 1;

        ProbeOutcome::Accepted { offset, rtt }
    }

    /// Current offset (local minus remote), if any probe was accepted
    pub fn offset(&self) -> Option<f64> {
        self.estimate
    }

    /// Map a remote timestamp into local clock time
    pub fn translate(&self, remote_timestamp: f64) -> f64 {
        remote_timestamp + self.estimate.unwrap_or(0.0)
    }

    pub fn stats(&self) -> ClockStats {
        ClockStats {
            offset: self.estimate,
            last_rtt: self.last_rtt,
            accepted_probes: self.accepted,
            rejected_probes: self.rejected,
        }
    }
}

fn percentile(values: &VecDeque<f64>, p: f64) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let index = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[index.min(sorted.len() - 1)]
}
