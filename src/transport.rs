// Synchronous entry point
//
// A `Transport` owns a tokio runtime and one discovery service. Outlets and inlets
// are created through it and run their background work on its runtime, while every
// public method blocks the calling thread only. Several transports can live in one
// process; each has its own discovery socket and index.
//
// The blocking methods must not be called from inside an async context.

use crate::config::TransportConfig;
use crate::discovery::{DiscoveryService, ResolveTimeout, ResolvedStream};
use crate::error::{LslError, LslResult};
use crate::inlet::{Inlet, InletOptions, InletTarget};
use crate::outlet::Outlet;
use crate::predicate::Predicate;
use crate::types::{StreamDescriptor, ValueEncoding};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Transport {
    runtime: Option<Runtime>,
    discovery: Arc<DiscoveryService>,
    config: Arc<TransportConfig>,
}

impl Transport {
    /// Start the runtime and bind the discovery socket
    pub fn new(config: TransportConfig) -> LslResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("ddalab-lsl");
        if let Some(threads) = config.worker_threads {
            builder.worker_threads(threads);
        }
        let runtime = builder
            .build()
            .map_err(|e| LslError::resource("start transport runtime", e))?;

        let discovery = runtime.block_on(DiscoveryService::bind(config.clone()))?;
        info!("Transport started (discovery on {})", discovery.local_addr());

        Ok(Self {
            runtime: Some(runtime),
            discovery,
            config,
        })
    }

    /// Transport configured from `LSL_*` environment variables
    pub fn from_env() -> LslResult<Self> {
        Self::new(TransportConfig::from_env()?)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Address of this transport's discovery socket
    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery.local_addr()
    }

    /// Handle to the runtime background tasks run on
    pub fn runtime_handle(&self) -> LslResult<Handle> {
        self.runtime
            .as_ref()
            .map(|runtime| runtime.handle().clone())
            .ok_or(LslError::Closed)
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> LslResult<F::Output> {
        let runtime = self.runtime.as_ref().ok_or(LslError::Closed)?;
        Ok(runtime.block_on(future))
    }

    /// Create and advertise an outlet
    ///
    /// `buffer_seconds` bounds how long pushed samples stay available to consumers.
    pub fn create_outlet(&self, descriptor: StreamDescriptor, buffer_seconds: f64) -> LslResult<Outlet> {
        self.block_on(Outlet::create(
            descriptor,
            buffer_seconds,
            self.discovery.clone(),
            self.config.clone(),
        ))?
    }

    /// Resolve streams matching a predicate expression
    ///
    /// Returns once `min_count` streams are known or the timeout elapses; an empty
    /// result means nothing was found. `ResolveTimeout::Forever` blocks until enough
    /// streams appear, possibly forever; use `resolve_with_cancel` to keep a way out.
    pub fn resolve(
        &self,
        predicate: &str,
        min_count: usize,
        timeout: ResolveTimeout,
    ) -> LslResult<Vec<ResolvedStream>> {
        let predicate = Predicate::parse(predicate)?;
        self.resolve_with_cancel(&predicate, min_count, timeout, &CancellationToken::new())
    }

    /// Resolve with a cancellation token; cancelling ends the wait with `LslError::Cancelled`
    pub fn resolve_with_cancel(
        &self,
        predicate: &Predicate,
        min_count: usize,
        timeout: ResolveTimeout,
        cancel: &CancellationToken,
    ) -> LslResult<Vec<ResolvedStream>> {
        self.block_on(self.discovery.resolve(predicate, min_count, timeout, cancel))?
    }

    /// Every stream seen within `wait`
    pub fn resolve_all(&self, wait: Duration) -> LslResult<Vec<ResolvedStream>> {
        self.resolve_with_cancel(
            &Predicate::any(),
            usize::MAX,
            ResolveTimeout::After(wait),
            &CancellationToken::new(),
        )
    }

    /// Streams currently in the discovery index, without waiting
    pub fn known_streams(&self) -> Vec<ResolvedStream> {
        self.discovery.index().all()
    }

    /// Open an inlet on a resolved stream
    pub fn open_inlet(&self, stream: &ResolvedStream, options: InletOptions) -> LslResult<Inlet> {
        Inlet::open(
            InletTarget::Resolved(stream.clone()),
            options,
            self.discovery.clone(),
            self.config.clone(),
            &self.runtime_handle()?,
        )
    }

    /// Open an inlet that resolves its stream in the background
    ///
    /// Returns immediately in the `Resolving` state; the inlet connects to the first
    /// stream that matches `predicate` and waits until one does or it is closed.
    pub fn open_inlet_matching(&self, predicate: &str, options: InletOptions) -> LslResult<Inlet> {
        let predicate = Predicate::parse(predicate)?;
        Inlet::open(
            InletTarget::Matching(predicate),
            options,
            self.discovery.clone(),
            self.config.clone(),
            &self.runtime_handle()?,
        )
    }

    /// Resolve a stream by name and type and open an inlet on it
    ///
    /// Returns `Ok(None)` when no such stream showed up within the timeout. A stream
    /// with the right name and type but a different encoding or channel count is a
    /// `TypeMismatch` or `SampleShape` error.
    pub fn resolve_and_open_inlet(
        &self,
        name: &str,
        content_type: &str,
        channel_count: u32,
        encoding: ValueEncoding,
        timeout: ResolveTimeout,
        options: InletOptions,
    ) -> LslResult<Option<Inlet>> {
        self.resolve_and_open_inlet_with_cancel(
            name,
            content_type,
            channel_count,
            encoding,
            timeout,
            options,
            &CancellationToken::new(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn resolve_and_open_inlet_with_cancel(
        &self,
        name: &str,
        content_type: &str,
        channel_count: u32,
        encoding: ValueEncoding,
        timeout: ResolveTimeout,
        options: InletOptions,
        cancel: &CancellationToken,
    ) -> LslResult<Option<Inlet>> {
        let predicate = Predicate::name_and_type(name, content_type)?;
        debug!("Resolving \"{}\"", predicate);

        let found = self.resolve_with_cancel(&predicate, 1, timeout, cancel)?;
        let Some(first) = found.first() else {
            info!("No stream matching \"{}\" found", predicate);
            return Ok(None);
        };

        let fits = |stream: &&ResolvedStream| {
            stream.descriptor.encoding() == encoding
                && stream.descriptor.channel_count() == channel_count
        };
        let Some(stream) = found.iter().find(fits) else {
            let descriptor = &first.descriptor;
            if descriptor.encoding() != encoding {
                return Err(LslError::TypeMismatch {
                    expected: encoding,
                    actual: descriptor.encoding(),
                });
            }
            return Err(LslError::SampleShape {
                expected: channel_count as usize,
                actual: descriptor.channel_count() as usize,
            });
        };

        info!(
            "Opening inlet on '{}' ({}) at {}",
            stream.descriptor.name(),
            stream.descriptor.uid(),
            stream.endpoint
        );
        self.open_inlet(stream, options).map(Some)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.discovery.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
        debug!("Transport stopped");
    }
}
