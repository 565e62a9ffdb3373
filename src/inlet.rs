// Consumer endpoint
//
// An inlet runs one connection task on the transport runtime. The task resolves the
// stream if needed, connects, checks the handshake, then feeds received samples into
// a `SampleQueue` and answers its own clock probes. Callers pull from the queue on
// their own thread; `pull_sample` waits on a condition variable tied to the queue,
// so polling at any rate never spins and never blocks past its timeout.

use crate::buffer::{BufferMetrics, RetentionBudget, SampleQueue};
use crate::clock::{local_clock, ClockStats, ClockSync, ProbeOutcome};
use crate::config::TransportConfig;
use crate::discovery::{DiscoveryService, ResolveTimeout, ResolvedStream};
use crate::error::{LslError, LslResult};
use crate::predicate::Predicate;
use crate::types::{ChannelValue, NominalRate, Sample, StreamDescriptor};
use crate::wire::{Frame, FrameCodec, SampleLayout, PROTOCOL_VERSION};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection state of an inlet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InletState {
    /// Waiting for a matching stream to appear
    Resolving,
    /// Opening the first connection
    Connecting,
    Connected,
    /// Connection dropped; retrying with backoff
    Reconnecting,
    /// Connection dropped and recovery is disabled
    Lost,
    /// Closed by the owner
    Closed,
}

impl InletState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InletState::Lost | InletState::Closed)
    }
}

/// Options for opening an inlet
#[derive(Debug, Clone)]
pub struct InletOptions {
    /// Receive buffer retention in seconds
    pub buffer_seconds: f64,
    /// Re-resolve and reconnect when the connection drops
    pub recover: bool,
    /// Cap on buffered samples (defaults to the transport's limit)
    pub max_buffered_samples: Option<usize>,
}

impl Default for InletOptions {
    fn default() -> Self {
        Self {
            buffer_seconds: 360.0,
            recover: true,
            max_buffered_samples: None,
        }
    }
}

impl InletOptions {
    pub fn with_buffer_seconds(mut self, buffer_seconds: f64) -> Self {
        self.buffer_seconds = buffer_seconds;
        self
    }

    pub fn with_recover(mut self, recover: bool) -> Self {
        self.recover = recover;
        self
    }

    fn budget(&self, rate: NominalRate, config: &TransportConfig) -> LslResult<RetentionBudget> {
        let cap = self
            .max_buffered_samples
            .unwrap_or(config.max_buffered_samples)
            .min(config.max_buffered_samples);
        RetentionBudget::for_stream(rate, self.buffer_seconds, cap)
    }
}

/// Where the connection task finds its outlet
pub(crate) enum InletTarget {
    Resolved(ResolvedStream),
    Matching(Predicate),
}

struct Inbox {
    queue: SampleQueue,
    state: InletState,
    lost_reason: Option<String>,
    /// Descriptor the inlet was opened for
    descriptor: Option<StreamDescriptor>,
    /// Uid of the outlet instance samples currently come from
    connected_uid: Option<String>,
    last_seq: Option<u64>,
    endpoint: Option<SocketAddr>,
}

struct InletShared {
    inbox: Mutex<Inbox>,
    changed: Condvar,
    clock: Mutex<ClockSync>,
}

impl InletShared {
    fn set_state(&self, state: InletState) {
        let mut inbox = self.inbox.lock();
        if inbox.state.is_terminal() {
            return;
        }
        inbox.state = state;
        drop(inbox);
        self.changed.notify_all();
    }

    fn mark_lost(&self, reason: String) {
        let mut inbox = self.inbox.lock();
        if inbox.state.is_terminal() {
            return;
        }
        warn!("Inlet connection lost: {}", reason);
        inbox.state = InletState::Lost;
        inbox.lost_reason = Some(reason);
        drop(inbox);
        self.changed.notify_all();
    }

    fn deliver(&self, seq: u64, sample: Arc<Sample>) {
        let sample = Arc::try_unwrap(sample).unwrap_or_else(|shared| (*shared).clone());
        let mut inbox = self.inbox.lock();
        if inbox.last_seq.is_some_and(|last| seq <= last) {
            return;
        }
        inbox.last_seq = Some(seq);
        let evicted = inbox.queue.push(sample, Instant::now());
        drop(inbox);

        if evicted > 0 {
            debug!("Receive buffer full, evicted {} sample(s)", evicted);
        }
        self.changed.notify_all();
    }
}

/// Consumer endpoint of one stream
pub struct Inlet {
    shared: Arc<InletShared>,
    shutdown: CancellationToken,
}

impl Inlet {
    /// Start the connection task for `target` on the transport runtime
    pub(crate) fn open(
        target: InletTarget,
        options: InletOptions,
        discovery: Arc<DiscoveryService>,
        config: Arc<TransportConfig>,
        runtime: &Handle,
    ) -> LslResult<Self> {
        let (descriptor, state) = match &target {
            InletTarget::Resolved(stream) => (Some(stream.descriptor.clone()), InletState::Connecting),
            InletTarget::Matching(_) => (None, InletState::Resolving),
        };
        let rate = descriptor
            .as_ref()
            .map_or(NominalRate::Irregular, |d| d.nominal_rate());
        let budget = options.budget(rate, &config)?;

        let shared = Arc::new(InletShared {
            inbox: Mutex::new(Inbox {
                queue: SampleQueue::new(budget),
                state,
                lost_reason: None,
                descriptor,
                connected_uid: None,
                last_seq: None,
                endpoint: None,
            }),
            changed: Condvar::new(),
            clock: Mutex::new(ClockSync::new(
                config.clock_window,
                config.clock_outlier_percentile,
            )),
        });
        let shutdown = CancellationToken::new();

        let task = ConnectionTask {
            shared: shared.clone(),
            discovery,
            config,
            options,
            shutdown: shutdown.clone(),
        };
        runtime.spawn(task.run(target));

        Ok(Self { shared, shutdown })
    }

    /// Take the oldest buffered sample, waiting up to `timeout` for one to arrive
    ///
    /// `Duration::ZERO` polls without blocking. Returns `Ok(None)` when nothing arrived
    /// in time, including while the inlet is reconnecting. Buffered samples are still
    /// handed out after the connection is lost; after that the call fails with
    /// `ConnectionLost`, or `Closed` once the inlet was closed.
    pub fn pull_sample(&self, timeout: Duration) -> LslResult<Option<Sample>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut inbox = self.shared.inbox.lock();
        loop {
            if let Some(sample) = inbox.queue.pop(Instant::now()) {
                return Ok(Some(sample));
            }
            terminal_error(&inbox)?;

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    self.shared.changed.wait_until(&mut inbox, deadline);
                }
                None => self.shared.changed.wait(&mut inbox),
            }
        }
    }

    /// Like `pull_sample`, but returns native values of type `T`
    ///
    /// Fails with `TypeMismatch` without consuming anything if the stream does not
    /// carry `T` values.
    pub fn pull_sample_as<T: ChannelValue>(&self, timeout: Duration) -> LslResult<Option<(Vec<T>, f64)>> {
        if let Some(descriptor) = self.descriptor() {
            if descriptor.encoding() != T::ENCODING {
                return Err(LslError::TypeMismatch {
                    expected: descriptor.encoding(),
                    actual: T::ENCODING,
                });
            }
        }

        match self.pull_sample(timeout)? {
            None => Ok(None),
            Some(sample) => {
                let actual = sample.values.encoding();
                let values = T::from_values(sample.values).ok_or(LslError::TypeMismatch {
                    expected: actual,
                    actual: T::ENCODING,
                })?;
                Ok(Some((values, sample.timestamp)))
            }
        }
    }

    /// Take up to `max` buffered samples without waiting
    pub fn pull_chunk(&self, max: usize) -> LslResult<Vec<Sample>> {
        let mut inbox = self.shared.inbox.lock();
        let samples = inbox.queue.drain(max, Instant::now());
        if samples.is_empty() {
            terminal_error(&inbox)?;
        }
        Ok(samples)
    }

    pub fn samples_available(&self) -> usize {
        self.shared.inbox.lock().queue.len()
    }

    /// Wait until the inlet is connected. Returns false on timeout.
    pub fn wait_connected(&self, timeout: Duration) -> LslResult<bool> {
        let deadline = Instant::now().checked_add(timeout);
        let mut inbox = self.shared.inbox.lock();
        loop {
            if inbox.state == InletState::Connected {
                return Ok(true);
            }
            terminal_error(&inbox)?;

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    self.shared.changed.wait_until(&mut inbox, deadline);
                }
                None => self.shared.changed.wait(&mut inbox),
            }
        }
    }

    /// Estimated offset to add to producer timestamps, once a probe completed
    pub fn time_correction(&self) -> Option<f64> {
        self.shared.clock.lock().offset()
    }

    /// Map a producer timestamp into local clock time
    pub fn translate(&self, remote_timestamp: f64) -> f64 {
        self.shared.clock.lock().translate(remote_timestamp)
    }

    pub fn clock_stats(&self) -> ClockStats {
        self.shared.clock.lock().stats()
    }

    pub fn state(&self) -> InletState {
        self.shared.inbox.lock().state
    }

    /// Descriptor of the stream, unknown while still resolving
    pub fn descriptor(&self) -> Option<StreamDescriptor> {
        self.shared.inbox.lock().descriptor.clone()
    }

    /// Endpoint of the current or last connection
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.shared.inbox.lock().endpoint
    }

    pub fn metrics(&self) -> BufferMetrics {
        self.shared.inbox.lock().queue.metrics()
    }

    /// Close the connection and drop buffered samples
    pub fn close(&self) {
        {
            let mut inbox = self.shared.inbox.lock();
            if inbox.state == InletState::Closed {
                return;
            }
            inbox.state = InletState::Closed;
            inbox.queue.clear();
        }
        self.shutdown.cancel();
        self.shared.changed.notify_all();
        debug!("Inlet closed");
    }
}

impl Drop for Inlet {
    fn drop(&mut self) {
        self.close();
    }
}

fn terminal_error(inbox: &MutexGuard<'_, Inbox>) -> LslResult<()> {
    match inbox.state {
        InletState::Lost => Err(LslError::ConnectionLost(
            inbox
                .lost_reason
                .clone()
                .unwrap_or_else(|| "connection dropped".to_string()),
        )),
        InletState::Closed => Err(LslError::Closed),
        _ => Ok(()),
    }
}

/// Marks the inlet lost if its task stops for any reason other than `close`,
/// e.g. because the transport runtime shut down underneath it
struct TaskGuard(Arc<InletShared>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.mark_lost("connection task stopped".to_string());
    }
}

struct ConnectionTask {
    shared: Arc<InletShared>,
    discovery: Arc<DiscoveryService>,
    config: Arc<TransportConfig>,
    options: InletOptions,
    shutdown: CancellationToken,
}

impl ConnectionTask {
    async fn run(self, target: InletTarget) {
        let _guard = TaskGuard(self.shared.clone());

        let mut current = match target {
            InletTarget::Resolved(stream) => stream,
            InletTarget::Matching(predicate) => match self.resolve_initial(&predicate).await {
                Some(stream) => stream,
                None => return,
            },
        };

        let mut backoff = self.config.reconnect_initial_backoff;
        let mut ever_connected = false;
        loop {
            let mut connected = false;
            let result = self.stream_samples(&current, &mut connected).await;
            ever_connected |= connected;
            if self.shutdown.is_cancelled() {
                return;
            }

            let error = match result {
                Ok(()) => LslError::ConnectionLost("outlet closed the connection".to_string()),
                Err(e) => e,
            };
            if !self.options.recover {
                self.shared.mark_lost(error.to_string());
                return;
            }

            if connected {
                backoff = self.config.reconnect_initial_backoff;
            }
            // Connecting holds until the first handshake succeeds
            if ever_connected {
                self.shared.set_state(InletState::Reconnecting);
            }
            warn!(
                "Inlet for '{}' unreachable ({}); retrying in {:?}",
                current.descriptor.name(),
                error,
                backoff
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.reconnect_max_backoff);

            match self.reresolve(&current.descriptor).await {
                Ok(Some(found)) => {
                    if found.endpoint != current.endpoint {
                        info!(
                            "Stream '{}' re-resolved at {}",
                            found.descriptor.name(),
                            found.endpoint
                        );
                    }
                    current = found;
                }
                Ok(None) => {}
                Err(LslError::Cancelled | LslError::Closed) => return,
                Err(e) => debug!("Re-resolving '{}' failed: {}", current.descriptor.name(), e),
            }
        }
    }

    async fn resolve_initial(&self, predicate: &Predicate) -> Option<ResolvedStream> {
        let found = self
            .discovery
            .resolve(predicate, 1, ResolveTimeout::Forever, &self.shutdown)
            .await
            .ok()?
            .into_iter()
            .next()?;

        let budget = match self.options.budget(found.descriptor.nominal_rate(), &self.config) {
            Ok(budget) => budget,
            Err(e) => {
                self.shared.mark_lost(e.to_string());
                return None;
            }
        };

        {
            let mut inbox = self.shared.inbox.lock();
            inbox.descriptor = Some(found.descriptor.clone());
            inbox.queue = SampleQueue::new(budget);
        }
        self.shared.set_state(InletState::Connecting);
        Some(found)
    }

    /// Look the stream up again by source id (or uid), preferring the newest instance
    async fn reresolve(&self, descriptor: &StreamDescriptor) -> LslResult<Option<ResolvedStream>> {
        let predicate = if descriptor.source_id().is_empty() {
            Predicate::by_property("uid", descriptor.uid())?
        } else {
            Predicate::by_property("source_id", descriptor.source_id())?
        };

        let found = self
            .discovery
            .resolve(
                &predicate,
                1,
                ResolveTimeout::After(self.config.reresolve_timeout),
                &self.shutdown,
            )
            .await?;

        Ok(found
            .into_iter()
            .max_by(|a, b| a.descriptor.created_at().total_cmp(&b.descriptor.created_at())))
    }

    async fn stream_samples(&self, current: &ResolvedStream, connected: &mut bool) -> LslResult<()> {
        let endpoint = current.endpoint;
        let config = &self.config;

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| LslError::ConnectionLost(format!("timed out connecting to {}", endpoint)))?
            .map_err(|e| LslError::ConnectionLost(format!("cannot connect to {}: {}", endpoint, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let mut framed = Framed::new(stream, FrameCodec::new(config.max_frame_bytes));

        let (expected_uid, resume_after) = {
            let inbox = self.shared.inbox.lock();
            match &inbox.connected_uid {
                Some(uid) => (uid.clone(), inbox.last_seq),
                None => (current.descriptor.uid().to_string(), None),
            }
        };
        framed
            .send(Frame::Hello {
                protocol_version: PROTOCOL_VERSION,
                expected_uid,
                resume_after,
            })
            .await?;

        let handshake = tokio::time::timeout(config.connect_timeout, framed.next())
            .await
            .map_err(|_| LslError::ConnectionLost(format!("no handshake from {}", endpoint)))?;
        let descriptor = match handshake {
            Some(Ok(Frame::Handshake(descriptor))) => descriptor,
            Some(Ok(other)) => {
                return Err(LslError::Protocol(format!(
                    "Expected handshake, got {:?}",
                    other
                )))
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(LslError::ConnectionLost(format!(
                    "{} closed the connection during the handshake",
                    endpoint
                )))
            }
        };

        self.accept_handshake(&descriptor, endpoint)?;
        framed.codec_mut().set_layout(SampleLayout::of(&descriptor));
        *connected = true;
        info!(
            "Inlet connected to '{}' ({}) at {}",
            descriptor.name(),
            descriptor.uid(),
            endpoint
        );

        let mut probe = tokio::time::interval(config.clock_probe_interval);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = probe.tick() => {
                    framed.send(Frame::Ping { t0: local_clock() }).await?;
                }
                frame = framed.next() => match frame {
                    Some(Ok(Frame::Sample { seq, sample })) => self.shared.deliver(seq, sample),
                    Some(Ok(Frame::Pong { t0, t1, t2 })) => {
                        let t3 = local_clock();
                        let outcome = self.shared.clock.lock().record_probe(t0, t1, t2, t3);
                        match outcome {
                            ProbeOutcome::Accepted { offset, rtt } => {
                                debug!("Clock probe: offset {:.6}s, rtt {:.6}s", offset, rtt)
                            }
                            ProbeOutcome::Outlier { rtt, threshold } => {
                                debug!("Discarded clock probe: rtt {:.6}s above {:.6}s", rtt, threshold)
                            }
                            ProbeOutcome::Invalid => debug!("Discarded invalid clock probe"),
                        }
                    }
                    Some(Ok(other)) => {
                        return Err(LslError::Protocol(format!(
                            "Unexpected frame from outlet: {:?}",
                            other
                        )))
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(LslError::ConnectionLost(format!(
                            "{} closed the connection",
                            endpoint
                        )))
                    }
                }
            }
        }
    }

    /// Check the outlet's descriptor against the one the inlet was opened for
    fn accept_handshake(&self, descriptor: &StreamDescriptor, endpoint: SocketAddr) -> LslResult<()> {
        let mut inbox = self.shared.inbox.lock();
        if let Some(expected) = &inbox.descriptor {
            expected.check_layout(descriptor)?;
            if !expected.same_source(descriptor) {
                return Err(LslError::Protocol(format!(
                    "{} now serves a different stream ('{}')",
                    endpoint,
                    descriptor.name()
                )));
            }
        }

        if inbox.connected_uid.as_deref() != Some(descriptor.uid()) {
            // Restarted producer: sequence numbers and clock start over
            inbox.connected_uid = Some(descriptor.uid().to_string());
            inbox.last_seq = None;
            *self.shared.clock.lock() =
                ClockSync::new(self.config.clock_window, self.config.clock_outlier_percentile);
        }
        inbox.endpoint = Some(endpoint);
        if !inbox.state.is_terminal() {
            inbox.state = InletState::Connected;
        }
        drop(inbox);

        self.shared.changed.notify_all();
        Ok(())
    }
}
