// Producer endpoint
//
// An outlet owns a TCP listener and one `SampleRing`. Each accepted consumer gets a
// writer task that reads the ring through its own cursor, so pushing never waits on
// the network and slow consumers only lose samples that aged out of the ring.

use crate::buffer::{BufferMetrics, RetentionBudget, SampleRing};
use crate::clock::local_clock;
use crate::config::TransportConfig;
use crate::discovery::{DiscoveryService, ResolvedStream};
use crate::error::{LslError, LslResult};
use crate::types::{ChannelValue, Sample, SampleValues, StreamDescriptor};
use crate::wire::{sample_frame_len, Frame, FrameCodec, PROTOCOL_VERSION};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Samples written per flush to one consumer
const WRITE_BATCH: usize = 1024;

struct OutletContext {
    descriptor: StreamDescriptor,
    ring: Arc<SampleRing>,
    consumers: AtomicUsize,
    config: Arc<TransportConfig>,
}

/// Producer endpoint of one stream
pub struct Outlet {
    context: Arc<OutletContext>,
    endpoint: SocketAddr,
    discovery: Arc<DiscoveryService>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Outlet {
    /// Bind a listener, start serving consumers and advertise the stream
    ///
    /// Fails with `LslError::Resource` if no listening socket can be bound.
    pub(crate) async fn create(
        descriptor: StreamDescriptor,
        buffer_seconds: f64,
        discovery: Arc<DiscoveryService>,
        config: Arc<TransportConfig>,
    ) -> LslResult<Self> {
        let budget = RetentionBudget::for_stream(
            descriptor.nominal_rate(),
            buffer_seconds,
            config.max_buffered_samples,
        )?;

        let listener = TcpListener::bind((config.bind_addr, 0))
            .await
            .map_err(|e| LslError::resource(format!("bind outlet '{}'", descriptor.name()), e))?;
        let endpoint = listener
            .local_addr()
            .map_err(|e| LslError::resource("outlet listener address", e))?;

        let context = Arc::new(OutletContext {
            descriptor: descriptor.clone(),
            ring: Arc::new(SampleRing::new(budget)),
            consumers: AtomicUsize::new(0),
            config,
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(listener, context.clone(), shutdown.clone()));

        discovery
            .advertise(ResolvedStream {
                descriptor: descriptor.clone(),
                endpoint,
            })
            .await;

        info!(
            "Outlet '{}' ({}, {} x {}) serving on {} with room for {} samples",
            descriptor.name(),
            descriptor.content_type(),
            descriptor.channel_count(),
            descriptor.encoding(),
            endpoint,
            budget.max_samples
        );

        Ok(Self {
            context,
            endpoint,
            discovery,
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    /// Push one sample stamped with the current `local_clock()`
    ///
    /// The values must have the stream's encoding and exactly `channel_count` entries,
    /// and their encoded frame must fit in `max_frame_bytes`.
    /// Returns the sample's sequence number.
    pub fn push(&self, values: SampleValues) -> LslResult<u64> {
        self.push_with_timestamp(values, local_clock())
    }

    /// Push one sample with an explicit producer timestamp
    pub fn push_with_timestamp(&self, values: SampleValues, timestamp: f64) -> LslResult<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LslError::Closed);
        }
        self.context.descriptor.validate_values(&values)?;
        let frame_len = sample_frame_len(&values);
        if frame_len > self.context.config.max_frame_bytes {
            return Err(LslError::Configuration(format!(
                "Sample needs {} bytes on the wire, more than the {} byte frame limit",
                frame_len, self.context.config.max_frame_bytes
            )));
        }
        Ok(self.context.ring.push(Sample::new(values, timestamp)))
    }

    /// Push one sample from a slice of native values
    pub fn push_typed<T: ChannelValue + Clone>(&self, values: &[T]) -> LslResult<u64> {
        self.push(T::into_values(values.to_vec()))
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.context.descriptor
    }

    /// Address the outlet listens on
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Consumers that completed the handshake and are still connected
    pub fn consumer_count(&self) -> usize {
        self.context.consumers.load(Ordering::Acquire)
    }

    pub fn have_consumers(&self) -> bool {
        self.consumer_count() > 0
    }

    pub fn metrics(&self) -> BufferMetrics {
        self.context.ring.metrics()
    }

    /// Withdraw the advertisement and drop every consumer connection
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.discovery.withdraw(self.context.descriptor.uid());
        self.shutdown.cancel();
        info!(
            "Outlet '{}' on {} closed",
            self.context.descriptor.name(),
            self.endpoint
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Outlet {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(listener: TcpListener, context: Arc<OutletContext>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                    tokio::spawn(serve_consumer(stream, peer, context.clone(), shutdown.clone()));
                }
                Err(e) => {
                    error!("Outlet '{}' accept error: {}", context.descriptor.name(), e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!("Accept loop of '{}' stopped", context.descriptor.name());
}

/// Decrements the consumer count when a connection ends, however it ends
struct ConsumerSlot<'a>(&'a AtomicUsize);

impl<'a> ConsumerSlot<'a> {
    fn take(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for ConsumerSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn serve_consumer(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<OutletContext>,
    shutdown: CancellationToken,
) {
    let name = context.descriptor.name().to_string();
    match run_consumer(stream, peer, &context, &shutdown).await {
        Ok(()) => info!("Consumer {} of '{}' disconnected", peer, name),
        Err(e) => warn!("Consumer {} of '{}' dropped: {}", peer, name, e),
    }
}

async fn run_consumer(
    stream: TcpStream,
    peer: SocketAddr,
    context: &OutletContext,
    shutdown: &CancellationToken,
) -> LslResult<()> {
    let descriptor = &context.descriptor;
    let mut framed = Framed::new(stream, FrameCodec::new(context.config.max_frame_bytes));

    let hello = tokio::time::timeout(context.config.connect_timeout, framed.next())
        .await
        .map_err(|_| LslError::Protocol(format!("No hello from {}", peer)))?;
    let (expected_uid, resume_after) = match hello {
        Some(Ok(Frame::Hello {
            protocol_version,
            expected_uid,
            resume_after,
        })) => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(LslError::Protocol(format!(
                    "Unsupported protocol version {}",
                    protocol_version
                )));
            }
            (expected_uid, resume_after)
        }
        Some(Ok(other)) => {
            return Err(LslError::Protocol(format!(
                "Expected hello, got {:?}",
                other
            )))
        }
        Some(Err(e)) => return Err(e),
        None => return Ok(()),
    };

    framed.send(Frame::Handshake(descriptor.clone())).await?;

    let oldest = context.ring.oldest_seq();
    let mut cursor = match resume_after {
        Some(last) if expected_uid == descriptor.uid() => {
            last.saturating_add(1).clamp(oldest, context.ring.next_seq())
        }
        _ => oldest,
    };

    let _slot = ConsumerSlot::take(&context.consumers);
    info!(
        "Consumer {} connected to '{}' starting at sample {}",
        peer,
        descriptor.name(),
        cursor
    );

    let mut published = context.ring.subscribe();
    loop {
        published.borrow_and_update();

        loop {
            let batch = context.ring.read_from(&mut cursor, WRITE_BATCH);
            if batch.skipped > 0 {
                debug!(
                    "Consumer {} fell behind; {} samples were evicted before delivery",
                    peer, batch.skipped
                );
            }
            if batch.samples.is_empty() {
                break;
            }
            for (seq, sample) in batch.samples {
                framed.feed(Frame::Sample { seq, sample }).await?;
            }
            framed.flush().await?;
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            changed = published.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            incoming = framed.next() => match incoming {
                Some(Ok(Frame::Ping { t0 })) => {
                    let t1 = local_clock();
                    framed.send(Frame::Pong { t0, t1, t2: local_clock() }).await?;
                }
                Some(Ok(other)) => {
                    return Err(LslError::Protocol(format!(
                        "Unexpected frame from consumer: {:?}",
                        other
                    )))
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }
}
