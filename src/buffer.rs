// Bounded sample buffers
//
// `SampleRing` is the producer-side ring: one copy of each sample, shared by every
// consumer connection through its own cursor. `SampleQueue` is the consumer-side
// FIFO an inlet drains with `pull_sample`. Both evict the oldest entries once the
// retention budget is exceeded, by sample count or by age, whichever binds first.
// Producers are never blocked by slow consumers.

use crate::error::{LslError, LslResult};
use crate::types::{NominalRate, Sample};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Rate assumed when sizing buffers of irregular streams
pub const IRREGULAR_ASSUMED_RATE: f64 = 100.0;

/// Maximum buffered duration and count before the oldest samples are evicted
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionBudget {
    pub max_samples: usize,
    pub max_age: Duration,
}

impl RetentionBudget {
    /// Size a budget for a stream of the given rate
    ///
    /// # Arguments
    /// * `rate` - Nominal rate; irregular streams assume `IRREGULAR_ASSUMED_RATE`
    /// * `buffer_seconds` - Retention time in seconds
    /// * `cap` - Hard upper bound on the sample count
    pub fn for_stream(rate: NominalRate, buffer_seconds: f64, cap: usize) -> LslResult<Self> {
        if !buffer_seconds.is_finite() || buffer_seconds <= 0.0 {
            return Err(LslError::Configuration(format!(
                "Buffer length must be a positive number of seconds (got {})",
                buffer_seconds
            )));
        }

        let max_age = Duration::try_from_secs_f64(buffer_seconds).map_err(|_| {
            LslError::Configuration(format!(
                "Buffer length of {} seconds is too large",
                buffer_seconds
            ))
        })?;

        let assumed_rate = match rate {
            NominalRate::Irregular => IRREGULAR_ASSUMED_RATE,
            NominalRate::Regular(hz) => hz,
        };
        let wanted = (assumed_rate * buffer_seconds).ceil();
        let max_samples = if wanted >= cap as f64 {
            cap
        } else {
            wanted as usize
        };

        Ok(Self {
            max_samples: max_samples.max(1),
            max_age,
        })
    }

    fn is_expired(&self, stored_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(stored_at) > self.max_age
    }
}

/// Metrics for buffer monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BufferMetrics {
    pub total_pushed: u64,
    pub total_evicted: u64,
    pub current_size: usize,
    pub peak_size: usize,
    pub capacity: usize,
}

struct RingEntry {
    seq: u64,
    stored_at: Instant,
    sample: Arc<Sample>,
}

struct RingInner {
    entries: VecDeque<RingEntry>,
    next_seq: u64,
    total_evicted: u64,
    peak_size: usize,
}

impl RingInner {
    fn evict(&mut self, budget: &RetentionBudget, now: Instant) {
        while let Some(front) = self.entries.front() {
            if self.entries.len() > budget.max_samples || budget.is_expired(front.stored_at, now) {
                self.entries.pop_front();
                self.total_evicted += 1;
            } else {
                break;
            }
        }
    }

    fn first_seq(&self) -> u64 {
        self.entries.front().map(|e| e.seq).unwrap_or(self.next_seq)
    }
}

/// Samples handed to one consumer by `SampleRing::read_from`
#[derive(Debug, Default)]
pub struct ReadBatch {
    pub samples: Vec<(u64, Arc<Sample>)>,
    /// Samples the cursor missed because they were evicted first
    pub skipped: u64,
}

/// Producer-side ring buffer with independent consumer cursors
///
/// Sequence numbers start at 0 and increase by one per pushed sample. A cursor is
/// the sequence number of the next sample a consumer wants.
pub struct SampleRing {
    inner: Mutex<RingInner>,
    budget: RetentionBudget,
    published: watch::Sender<u64>,
}

impl SampleRing {
    pub fn new(budget: RetentionBudget) -> Self {
        let (published, _) = watch::channel(0);
        Self {
            inner: Mutex::new(RingInner {
                entries: VecDeque::with_capacity(budget.max_samples.min(4096)),
                next_seq: 0,
                total_evicted: 0,
                peak_size: 0,
            }),
            budget,
            published,
        }
    }

    /// Append a sample, evicting the oldest ones beyond the budget. Returns its sequence number.
    pub fn push(&self, sample: Sample) -> u64 {
        let now = Instant::now();
        let (seq, next_seq) = {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.entries.push_back(RingEntry {
                seq,
                stored_at: now,
                sample: Arc::new(sample),
            });
            inner.next_seq += 1;
            inner.evict(&self.budget, now);
            inner.peak_size = inner.peak_size.max(inner.entries.len());
            (seq, inner.next_seq)
        };

        self.published.send_replace(next_seq);
        seq
    }

    /// Read up to `max` samples starting at `cursor`, advancing it
    pub fn read_from(&self, cursor: &mut u64, max: usize) -> ReadBatch {
        let mut inner = self.inner.lock();
        inner.evict(&self.budget, Instant::now());

        let first = inner.first_seq();
        let mut batch = ReadBatch::default();
        if *cursor < first {
            batch.skipped = first - *cursor;
            *cursor = first;
        }

        let start = (*cursor - first) as usize;
        batch.samples = inner
            .entries
            .iter()
            .skip(start)
            .take(max)
            .map(|entry| (entry.seq, Arc::clone(&entry.sample)))
            .collect();
        *cursor += batch.samples.len() as u64;

        batch
    }

    /// Sequence number of the oldest retained sample (where a new consumer starts)
    pub fn oldest_seq(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.evict(&self.budget, Instant::now());
        inner.first_seq()
    }

    /// Sequence number the next pushed sample will get
    pub fn next_seq(&self) -> u64 {
        self.inner.lock().next_seq
    }

    /// Watch that changes whenever a sample is pushed
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.published.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn budget(&self) -> RetentionBudget {
        self.budget
    }

    pub fn metrics(&self) -> BufferMetrics {
        let inner = self.inner.lock();
        BufferMetrics {
            total_pushed: inner.next_seq,
            total_evicted: inner.total_evicted,
            current_size: inner.entries.len(),
            peak_size: inner.peak_size,
            capacity: self.budget.max_samples,
        }
    }
}

/// Consumer-side FIFO of received samples
///
/// Not synchronized on its own; the inlet keeps it under the same lock as its
/// connection state so `pull_sample` can wait on both.
pub struct SampleQueue {
    entries: VecDeque<(Instant, Sample)>,
    budget: RetentionBudget,
    total_pushed: u64,
    total_evicted: u64,
    peak_size: usize,
}

impl SampleQueue {
    pub fn new(budget: RetentionBudget) -> Self {
        Self {
            entries: VecDeque::with_capacity(budget.max_samples.min(4096)),
            budget,
            total_pushed: 0,
            total_evicted: 0,
            peak_size: 0,
        }
    }

    /// Append a received sample. Returns how many old samples were evicted.
    pub fn push(&mut self, sample: Sample, now: Instant) -> usize {
        self.entries.push_back((now, sample));
        self.total_pushed += 1;
        let evicted = self.evict(now);
        self.peak_size = self.peak_size.max(self.entries.len());
        evicted
    }

    /// Remove and return the oldest retained sample
    pub fn pop(&mut self, now: Instant) -> Option<Sample> {
        self.evict(now);
        self.entries.pop_front().map(|(_, sample)| sample)
    }

    /// Remove and return up to `max` samples, oldest first
    pub fn drain(&mut self, max: usize, now: Instant) -> Vec<Sample> {
        self.evict(now);
        let count = max.min(self.entries.len());
        self.entries.drain(..count).map(|(_, sample)| sample).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn metrics(&self) -> BufferMetrics {
        BufferMetrics {
            total_pushed: self.total_pushed,
            total_evicted: self.total_evicted,
            current_size: self.entries.len(),
            peak_size: self.peak_size,
            capacity: self.budget.max_samples,
        }
    }

    fn evict(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some((stored_at, _)) = self.entries.front() {
            if self.entries.len() > self.budget.max_samples || self.budget.is_expired(*stored_at, now) {
                self.entries.pop_front();
                evicted += 1;
            } else {
                break;
            }
        }
        self.total_evicted += evicted as u64;
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SampleValues;

    fn sample(n: i32) -> Sample {
        Sample::new(SampleValues::Int32(vec![n]), n as f64)
    }

    fn budget(max_samples: usize) -> RetentionBudget {
        RetentionBudget {
            max_samples,
            max_age: Duration::from_secs(60),
        }
    }

    fn values(batch: &ReadBatch) -> Vec<i32> {
        batch
            .samples
            .iter()
            .map(|(_, s)| match &s.values {
                SampleValues::Int32(v) => v[0],
                other => panic!("unexpected values {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_budget_sizing() {
        let b = RetentionBudget::for_stream(NominalRate::Regular(250.0), 2.0, 1_000_000).unwrap();
        assert_eq!(b.max_samples, 500);
        assert_eq!(b.max_age, Duration::from_secs(2));

        let b = RetentionBudget::for_stream(NominalRate::Irregular, 300.0, 1_000_000).unwrap();
        assert_eq!(b.max_samples, 30_000);

        let b = RetentionBudget::for_stream(NominalRate::Regular(1e6), 360.0, 1000).unwrap();
        assert_eq!(b.max_samples, 1000);

        let b = RetentionBudget::for_stream(NominalRate::Regular(0.001), 1.0, 1000).unwrap();
        assert_eq!(b.max_samples, 1);

        assert!(RetentionBudget::for_stream(NominalRate::Irregular, 0.0, 10).is_err());
        assert!(RetentionBudget::for_stream(NominalRate::Irregular, f64::NAN, 10).is_err());

        let err = RetentionBudget::for_stream(NominalRate::Irregular, 1e30, 10).unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_ring_keeps_newest_capacity_samples() {
        let ring = SampleRing::new(budget(3));
        for n in 0..5 {
            ring.push(sample(n));
        }

        let mut cursor = 0;
        let batch = ring.read_from(&mut cursor, 100);
        assert_eq!(batch.skipped, 2);
        assert_eq!(values(&batch), vec![2, 3, 4]);
        assert_eq!(cursor, 5);

        let metrics = ring.metrics();
        assert_eq!(metrics.total_pushed, 5);
        assert_eq!(metrics.total_evicted, 2);
        assert_eq!(metrics.current_size, 3);
    }

    #[test]
    fn test_independent_cursors() {
        let ring = SampleRing::new(budget(100));
        for n in 0..10 {
            ring.push(sample(n));
        }

        let mut fast = ring.oldest_seq();
        let mut slow = ring.oldest_seq();

        assert_eq!(values(&ring.read_from(&mut fast, 100)), (0..10).collect::<Vec<_>>());
        assert_eq!(values(&ring.read_from(&mut slow, 4)), vec![0, 1, 2, 3]);
        assert_eq!(values(&ring.read_from(&mut slow, 100)), (4..10).collect::<Vec<_>>());

        // Reading does not consume: the ring still holds everything
        assert_eq!(ring.len(), 10);
        assert!(ring.read_from(&mut fast, 100).samples.is_empty());
    }

    #[test]
    fn test_ring_age_eviction() {
        let ring = SampleRing::new(RetentionBudget {
            max_samples: 100,
            max_age: Duration::from_millis(50),
        });
        ring.push(sample(1));
        std::thread::sleep(Duration::from_millis(120));
        ring.push(sample(2));

        let mut cursor = 0;
        let batch = ring.read_from(&mut cursor, 100);
        assert_eq!(values(&batch), vec![2]);
        assert_eq!(batch.skipped, 1);
    }

    #[test]
    fn test_ring_publishes_pushes() {
        let ring = SampleRing::new(budget(10));
        let mut rx = ring.subscribe();
        assert!(!rx.has_changed().unwrap());

        ring.push(sample(1));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
        assert_eq!(ring.next_seq(), 1);
    }

    #[test]
    fn test_queue_fifo_and_eviction() {
        let mut queue = SampleQueue::new(budget(3));
        let now = Instant::now();
        for n in 0..5 {
            queue.push(sample(n), now);
        }
        assert_eq!(queue.len(), 3);

        let pulled: Vec<f64> = std::iter::from_fn(|| queue.pop(now))
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(pulled, vec![2.0, 3.0, 4.0]);
        assert!(queue.pop(now).is_none());
        assert_eq!(queue.metrics().total_evicted, 2);
    }

    #[test]
    fn test_queue_drain_and_age() {
        let mut queue = SampleQueue::new(RetentionBudget {
            max_samples: 10,
            max_age: Duration::from_secs(1),
        });
        let start = Instant::now();
        queue.push(sample(1), start);
        queue.push(sample(2), start + Duration::from_millis(900));
        queue.push(sample(3), start + Duration::from_millis(950));

        // First sample is older than the budget by now
        let drained = queue.drain(10, start + Duration::from_millis(1500));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].timestamp, 2.0);
        assert!(queue.is_empty());
    }
}
