//! In-process loopback media engine.
//!
//! Issues identifiers and transport parameters, enforces codec compatibility
//! by media kind, tracks producer/consumer relationships and raises the same
//! lifecycle events a real SFU would. It forwards no packets. Used for local
//! development and as the base of the test engine.

use super::engine::{
    ConsumerType, DtlsFingerprint, DtlsParameters, EngineEvent, EngineEventSender, IceCandidate,
    IceParameters, MediaConsumer, MediaEngine, MediaKind, MediaProducer, MediaRouter,
    MediaTransport, ProduceRequest, RtpCapabilities, RtpCodecCapability, RtpParameters,
    TransportOptions, TransportParameters,
};
use crate::errors::EngineError;

use async_trait::async_trait;
use common::types::{ConsumerId, PeerId, ProducerId, RouterId, TransportId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

type SharedState = Arc<Mutex<RouterState>>;

fn lock(state: &Mutex<RouterState>) -> MutexGuard<'_, RouterState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Loopback engine. Cheap to clone through `Arc`.
pub struct LoopbackEngine {
    available: AtomicBool,
    routers: Mutex<Vec<Weak<Mutex<RouterState>>>>,
    ssrc_seed: Arc<AtomicU32>,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            routers: Mutex::new(Vec::new()),
            ssrc_seed: Arc::new(AtomicU32::new(1_000)),
        }
    }

    /// Mark the engine (un)available, as if its worker died or restarted.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Close a transport from the engine side, as a DTLS failure would.
    /// Returns whether the transport existed.
    pub fn fail_transport(&self, transport_id: TransportId) -> bool {
        let routers = self
            .routers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect::<Vec<_>>();

        for router in routers {
            let mut state = lock(&router);
            if state.transports.contains_key(&transport_id) {
                warn!(target: "rs.engine", transport_id = %transport_id, "Loopback transport failed");
                state.close_transport(transport_id, true);
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn MediaRouter>, EngineError> {
        if !self.is_available() {
            return Err(EngineError::Unavailable(
                "loopback engine is stopped".to_string(),
            ));
        }
        if codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "router needs at least one codec".to_string(),
            ));
        }

        let mut payload_type = FIRST_DYNAMIC_PAYLOAD_TYPE;
        let codecs = codecs
            .iter()
            .map(|codec| {
                let mut codec = codec.clone();
                if codec.preferred_payload_type.is_none() {
                    codec.preferred_payload_type = Some(payload_type);
                    payload_type = payload_type.saturating_add(1);
                }
                codec
            })
            .collect();

        let state: SharedState = Arc::new(Mutex::new(RouterState::default()));
        {
            let mut routers = self.routers.lock().unwrap_or_else(PoisonError::into_inner);
            routers.retain(|router| router.strong_count() > 0);
            routers.push(Arc::downgrade(&state));
        }

        let router = LoopbackRouter {
            id: RouterId::new(),
            capabilities: RtpCapabilities {
                codecs,
                header_extensions: Vec::new(),
            },
            state,
            ssrc_seed: Arc::clone(&self.ssrc_seed),
        };
        info!(target: "rs.engine", router_id = %router.id, "Loopback router created");

        Ok(Arc::new(router))
    }
}

#[derive(Default)]
struct RouterState {
    closed: bool,
    transports: HashMap<TransportId, TransportState>,
    producers: HashMap<ProducerId, ProducerState>,
    consumers: HashMap<ConsumerId, ConsumerState>,
}

struct TransportState {
    events: EngineEventSender,
    peer_id: PeerId,
}

struct ProducerState {
    transport_id: TransportId,
    kind: MediaKind,
    paused: bool,
}

struct ConsumerState {
    transport_id: TransportId,
    producer_id: ProducerId,
}

impl RouterState {
    fn emit(&self, transport_id: TransportId, event: EngineEvent) {
        if let Some(transport) = self.transports.get(&transport_id) {
            // Receiver gone means the owner already tore down.
            let _ = transport.events.send(event);
        }
    }

    fn close_consumer(&mut self, consumer_id: ConsumerId, notify_owner: bool) {
        if let Some(consumer) = self.consumers.remove(&consumer_id) {
            if notify_owner {
                self.emit(
                    consumer.transport_id,
                    EngineEvent::ConsumerClosed {
                        consumer_id,
                        producer_id: consumer.producer_id,
                    },
                );
            }
        }
    }

    /// Closing a producer always notifies the owners of its consumers.
    fn close_producer(&mut self, producer_id: ProducerId, notify_owner: bool) {
        let Some(producer) = self.producers.remove(&producer_id) else {
            return;
        };

        let dependent: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, consumer)| consumer.producer_id == producer_id)
            .map(|(id, _)| *id)
            .collect();
        for consumer_id in dependent {
            self.close_consumer(consumer_id, true);
        }

        if notify_owner {
            self.emit(
                producer.transport_id,
                EngineEvent::ProducerClosed { producer_id },
            );
        }
    }

    fn close_transport(&mut self, transport_id: TransportId, notify_owner: bool) {
        if !self.transports.contains_key(&transport_id) {
            return;
        }

        let producers: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, producer)| producer.transport_id == transport_id)
            .map(|(id, _)| *id)
            .collect();
        for producer_id in producers {
            self.close_producer(producer_id, notify_owner);
        }

        let consumers: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, consumer)| consumer.transport_id == transport_id)
            .map(|(id, _)| *id)
            .collect();
        for consumer_id in consumers {
            self.close_consumer(consumer_id, notify_owner);
        }

        if notify_owner {
            self.emit(transport_id, EngineEvent::TransportClosed { transport_id });
        }
        self.transports.remove(&transport_id);
    }
}

struct LoopbackRouter {
    id: RouterId,
    capabilities: RtpCapabilities,
    state: SharedState,
    ssrc_seed: Arc<AtomicU32>,
}

impl LoopbackRouter {
    fn supported_codecs(
        &self,
        kind: MediaKind,
        rtp_capabilities: &RtpCapabilities,
    ) -> Vec<RtpCodecCapability> {
        self.capabilities
            .codecs
            .iter()
            .filter(|codec| codec.kind == kind)
            .filter(|codec| {
                rtp_capabilities.codecs.iter().any(|remote| {
                    remote.kind == kind
                        && remote.mime_type.eq_ignore_ascii_case(&codec.mime_type)
                        && remote.clock_rate == codec.clock_rate
                })
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MediaRouter for LoopbackRouter {
    fn id(&self) -> RouterId {
        self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let kind = match lock(&self.state).producers.get(&producer_id) {
            Some(producer) => producer.kind,
            None => return false,
        };
        !self.supported_codecs(kind, rtp_capabilities).is_empty()
    }

    async fn create_transport(
        &self,
        options: TransportOptions,
        events: EngineEventSender,
    ) -> Result<Arc<dyn MediaTransport>, EngineError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(EngineError::Closed("Router".to_string()));
        }

        let id = TransportId::new();
        state.transports.insert(
            id,
            TransportState {
                events,
                peer_id: options.peer_id,
            },
        );

        let port = u16::try_from(40_000 + (id.0.as_u128() % 10_000)).unwrap_or(40_000);
        let parameters = TransportParameters {
            id,
            ice_parameters: fresh_ice_parameters(),
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: "127.0.0.1".to_string(),
                port,
                protocol: "udp".to_string(),
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: Some("auto".to_string()),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: fingerprint(),
                }],
            },
        };

        debug!(
            target: "rs.engine",
            router_id = %self.id,
            transport_id = %id,
            peer_id = %options.peer_id,
            direction = ?options.direction,
            "Loopback transport created"
        );

        Ok(Arc::new(LoopbackTransport {
            parameters,
            router_capabilities: self.capabilities.clone(),
            state: Arc::clone(&self.state),
            ssrc_seed: Arc::clone(&self.ssrc_seed),
        }))
    }

    async fn close(&self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;
        let transports: Vec<TransportId> = state.transports.keys().copied().collect();
        for transport_id in transports {
            state.close_transport(transport_id, true);
        }
        info!(target: "rs.engine", router_id = %self.id, "Loopback router closed");
    }
}

struct LoopbackTransport {
    parameters: TransportParameters,
    router_capabilities: RtpCapabilities,
    state: SharedState,
    ssrc_seed: Arc<AtomicU32>,
}

impl LoopbackTransport {
    fn ensure_open(&self, state: &RouterState) -> Result<(), EngineError> {
        if state.transports.contains_key(&self.parameters.id) {
            Ok(())
        } else {
            Err(EngineError::Closed("Transport".to_string()))
        }
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn id(&self) -> TransportId {
        self.parameters.id
    }

    fn parameters(&self) -> TransportParameters {
        self.parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "dtlsParameters must carry at least one fingerprint".to_string(),
            ));
        }
        let state = lock(&self.state);
        self.ensure_open(&state)
    }

    async fn produce(&self, request: ProduceRequest) -> Result<Arc<dyn MediaProducer>, EngineError> {
        if !request.rtp_parameters.is_object() {
            return Err(EngineError::InvalidParameters(
                "rtpParameters must be an object".to_string(),
            ));
        }
        let mut state = lock(&self.state);
        self.ensure_open(&state)?;
        if state
            .transports
            .get(&self.parameters.id)
            .is_some_and(|transport| transport.peer_id != request.peer_id)
        {
            return Err(EngineError::InvalidParameters(
                "transport belongs to another peer".to_string(),
            ));
        }

        let id = ProducerId::new();
        state.producers.insert(
            id,
            ProducerState {
                transport_id: self.parameters.id,
                kind: request.kind,
                paused: false,
            },
        );

        Ok(Arc::new(LoopbackProducer {
            id,
            kind: request.kind,
            state: Arc::clone(&self.state),
        }))
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<Arc<dyn MediaConsumer>, EngineError> {
        let mut state = lock(&self.state);
        self.ensure_open(&state)?;

        let (kind, producer_paused) = match state.producers.get(&producer_id) {
            Some(producer) => (producer.kind, producer.paused),
            None => return Err(EngineError::UnknownProducer(producer_id.to_string())),
        };

        let codecs: Vec<RtpCodecCapability> = self
            .router_capabilities
            .codecs
            .iter()
            .filter(|codec| codec.kind == kind)
            .filter(|codec| {
                rtp_capabilities.codecs.iter().any(|remote| {
                    remote.kind == kind
                        && remote.mime_type.eq_ignore_ascii_case(&codec.mime_type)
                        && remote.clock_rate == codec.clock_rate
                })
            })
            .cloned()
            .collect();
        if codecs.is_empty() {
            return Err(EngineError::Incompatible(producer_id.to_string()));
        }

        let id = ConsumerId::new();
        let ssrc = self.ssrc_seed.fetch_add(1, Ordering::Relaxed);
        let rtp_parameters = serde_json::json!({
            "mid": id.to_string(),
            "codecs": codecs.iter().map(|codec| serde_json::json!({
                "mimeType": codec.mime_type,
                "payloadType": codec.preferred_payload_type,
                "clockRate": codec.clock_rate,
                "channels": codec.channels,
                "parameters": codec.parameters,
            })).collect::<Vec<_>>(),
            "encodings": [{ "ssrc": ssrc }],
        });

        state.consumers.insert(
            id,
            ConsumerState {
                transport_id: self.parameters.id,
                producer_id,
            },
        );

        Ok(Arc::new(LoopbackConsumer {
            id,
            producer_id,
            kind,
            rtp_parameters,
            producer_paused,
            state: Arc::clone(&self.state),
        }))
    }

    async fn restart_ice(&self) -> Result<IceParameters, EngineError> {
        let state = lock(&self.state);
        self.ensure_open(&state)?;
        Ok(fresh_ice_parameters())
    }

    async fn close(&self) {
        lock(&self.state).close_transport(self.parameters.id, false);
    }
}

struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    state: SharedState,
}

impl LoopbackProducer {
    fn set_paused(&self, paused: bool) -> Result<(), EngineError> {
        let mut state = lock(&self.state);
        let producer = state
            .producers
            .get_mut(&self.id)
            .ok_or_else(|| EngineError::Closed("Producer".to_string()))?;
        producer.paused = paused;
        Ok(())
    }
}

#[async_trait]
impl MediaProducer for LoopbackProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn pause(&self) -> Result<(), EngineError> {
        self.set_paused(true)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.set_paused(false)
    }

    async fn close(&self) {
        lock(&self.state).close_producer(self.id, false);
    }
}

struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    producer_paused: bool,
    state: SharedState,
}

#[async_trait]
impl MediaConsumer for LoopbackConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> ConsumerType {
        ConsumerType::Simple
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if lock(&self.state).consumers.contains_key(&self.id) {
            Ok(())
        } else {
            Err(EngineError::Closed("Consumer".to_string()))
        }
    }

    async fn close(&self) {
        lock(&self.state).close_consumer(self.id, false);
    }
}

fn fresh_ice_parameters() -> IceParameters {
    IceParameters {
        username_fragment: Uuid::new_v4().simple().to_string(),
        password: format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        ),
        ice_lite: true,
    }
}

fn fingerprint() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
