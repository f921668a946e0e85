//! Mock media engine for Room Service testing.
//!
//! Wraps the loopback engine and can be configured to:
//! - Refuse router creation
//! - Hang on transport creation (exercises the bounded engine wait)
//! - Fail a transport from the engine side
//!
//! It also counts router creations and closes so tests can assert that a
//! room's router is released exactly once.
//!
//! # Example
//!
//! ```rust,ignore
//! use room_test_utils::MockMediaEngine;
//!
//! let engine = MockMediaEngine::new();
//! engine.hang_transports(true);
//! // create-transport now times out after the engine timeout
//! ```

use async_trait::async_trait;
use common::types::{ProducerId, RouterId, TransportId};
use room_service::errors::EngineError;
use room_service::media::engine::{EngineEventSender, TransportOptions};
use room_service::media::{
    LoopbackEngine, MediaEngine, MediaRouter, MediaTransport, RtpCapabilities, RtpCodecCapability,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Router bookkeeping shared between the engine and the router wrapper.
#[derive(Debug)]
pub struct RouterProbe {
    pub id: RouterId,
    closes: AtomicUsize,
}

impl RouterProbe {
    /// Number of times `close` was called on this router.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Switches {
    fail_routers: AtomicBool,
    hang_transports: AtomicBool,
}

/// Mock media engine.
pub struct MockMediaEngine {
    inner: LoopbackEngine,
    switches: Arc<Switches>,
    routers: Mutex<Vec<Arc<RouterProbe>>>,
}

impl Default for MockMediaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMediaEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: LoopbackEngine::new(),
            switches: Arc::new(Switches::default()),
            routers: Mutex::new(Vec::new()),
        }
    }

    /// Mark the engine unavailable (or available again).
    pub fn set_available(&self, available: bool) {
        self.inner.set_available(available);
    }

    /// Make `create_router` fail while the engine still reports available.
    pub fn fail_router_creation(&self, fail: bool) {
        self.switches.fail_routers.store(fail, Ordering::SeqCst);
    }

    /// Make `create_transport` never resolve.
    pub fn hang_transports(&self, hang: bool) {
        self.switches.hang_transports.store(hang, Ordering::SeqCst);
    }

    /// Close a transport from the engine side.
    pub fn fail_transport(&self, transport_id: TransportId) -> bool {
        self.inner.fail_transport(transport_id)
    }

    /// Every router created so far, oldest first.
    #[must_use]
    pub fn routers(&self) -> Vec<Arc<RouterProbe>> {
        self.routers.lock().unwrap().clone()
    }

    #[must_use]
    pub fn routers_created(&self) -> usize {
        self.routers.lock().unwrap().len()
    }

    /// Routers that were never closed.
    #[must_use]
    pub fn open_routers(&self) -> usize {
        self.routers
            .lock()
            .unwrap()
            .iter()
            .filter(|probe| probe.close_count() == 0)
            .count()
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn MediaRouter>, EngineError> {
        if self.switches.fail_routers.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable("mock router failure".to_string()));
        }
        let inner = self.inner.create_router(codecs).await?;
        let probe = Arc::new(RouterProbe {
            id: inner.id(),
            closes: AtomicUsize::new(0),
        });
        self.routers.lock().unwrap().push(Arc::clone(&probe));
        Ok(Arc::new(MockRouter {
            inner,
            probe,
            switches: Arc::clone(&self.switches),
        }))
    }
}

struct MockRouter {
    inner: Arc<dyn MediaRouter>,
    probe: Arc<RouterProbe>,
    switches: Arc<Switches>,
}

#[async_trait]
impl MediaRouter for MockRouter {
    fn id(&self) -> RouterId {
        self.inner.id()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.inner.rtp_capabilities()
    }

    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        self.inner.can_consume(producer_id, rtp_capabilities)
    }

    async fn create_transport(
        &self,
        options: TransportOptions,
        events: EngineEventSender,
    ) -> Result<Arc<dyn MediaTransport>, EngineError> {
        if self.switches.hang_transports.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.create_transport(options, events).await
    }

    async fn close(&self) {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await;
    }
}
