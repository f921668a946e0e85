//! Peer session: the media handles owned by one signaling connection.
//!
//! A `PeerSession` is driven by exactly one connection task, so its maps need
//! no locking and a client's requests are applied in order. Handles are keyed
//! by id; producers and consumers remember the transport they were created
//! on, and consumers the producer they forward.
//!
//! Engine calls are bounded by the configured engine timeout. Room
//! registration happens after the engine call returns, so the room actor is
//! never held across an engine await.

use crate::errors::RoomError;
use crate::media::engine::{
    ConsumerType, DtlsParameters, EngineEvent, IceParameters, ProduceRequest, RtpParameters,
    TransportOptions, TransportParameters,
};
use crate::media::{
    self, EngineEventSender, MediaConsumer, MediaKind, MediaProducer, MediaRouter, MediaSource,
    MediaTransport, RtpCapabilities, TransportDirection,
};

use super::messages::ProducerSummary;
use super::room::RoomHandle;

use common::types::{ConsumerId, PeerId, ProducerId, TransportId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct OwnedTransport {
    handle: Arc<dyn MediaTransport>,
    direction: TransportDirection,
}

struct OwnedProducer {
    handle: Arc<dyn MediaProducer>,
    transport_id: TransportId,
    source: MediaSource,
}

struct OwnedConsumer {
    handle: Arc<dyn MediaConsumer>,
    transport_id: TransportId,
    producer_id: ProducerId,
}

/// Result of a successful consume.
#[derive(Debug, Clone)]
pub struct ConsumeOutcome {
    pub consumer_id: ConsumerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub consumer_type: ConsumerType,
    pub producer_paused: bool,
    /// The producer and the peer that owns it.
    pub producer: ProducerSummary,
}

/// What changed in the session after an engine event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotice {
    /// One of this peer's consumers closed; the client must be told.
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    /// One of this peer's producers closed underneath it.
    ProducerClosed {
        producer_id: ProducerId,
        source: MediaSource,
    },
    TransportClosed { transport_id: TransportId },
}

pub struct PeerSession {
    peer_id: PeerId,
    user_id: UserId,
    display_name: String,
    room: RoomHandle,
    router: Arc<dyn MediaRouter>,
    engine_timeout: Duration,
    engine_events: EngineEventSender,
    transports: HashMap<TransportId, OwnedTransport>,
    producers: HashMap<ProducerId, OwnedProducer>,
    consumers: HashMap<ConsumerId, OwnedConsumer>,
}

impl PeerSession {
    /// Create a session bound to `room`. The returned receiver carries the
    /// engine's lifecycle events for every transport this session creates.
    pub fn new(
        peer_id: PeerId,
        user_id: UserId,
        display_name: String,
        room: RoomHandle,
        engine_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (engine_events, receiver) = mpsc::unbounded_channel();
        let router = room.router();
        let session = Self {
            peer_id,
            user_id,
            display_name,
            room,
            router,
            engine_timeout,
            engine_events,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        };
        (session, receiver)
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    #[must_use]
    pub fn room(&self) -> &RoomHandle {
        &self.room
    }

    #[must_use]
    pub fn router_capabilities(&self) -> RtpCapabilities {
        self.router.rtp_capabilities()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    fn transport(&self, transport_id: TransportId) -> Result<&OwnedTransport, RoomError> {
        self.transports
            .get(&transport_id)
            .ok_or_else(|| RoomError::NotFound("Transport".to_string()))
    }

    pub async fn create_transport(
        &mut self,
        direction: TransportDirection,
    ) -> Result<TransportParameters, RoomError> {
        let options = TransportOptions {
            direction,
            peer_id: self.peer_id,
        };
        let transport = media::bounded(
            self.engine_timeout,
            "create_transport",
            self.router
                .create_transport(options, self.engine_events.clone()),
        )
        .await?;

        let parameters = transport.parameters();
        self.transports.insert(
            parameters.id,
            OwnedTransport {
                handle: transport,
                direction,
            },
        );
        debug!(
            target: "rs.peer",
            peer_id = %self.peer_id,
            transport_id = %parameters.id,
            ?direction,
            "Transport created"
        );
        Ok(parameters)
    }

    pub async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RoomError> {
        let transport = Arc::clone(&self.transport(transport_id)?.handle);
        media::bounded(
            self.engine_timeout,
            "connect_transport",
            transport.connect(dtls_parameters),
        )
        .await
    }

    /// Create a producer and announce it to the room.
    pub async fn produce(
        &mut self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        source: Option<MediaSource>,
    ) -> Result<ProducerSummary, RoomError> {
        let owned = self.transport(transport_id)?;
        if owned.direction != TransportDirection::Send {
            return Err(RoomError::InvalidState(
                "Producers require a send transport".to_string(),
            ));
        }
        let transport = Arc::clone(&owned.handle);

        let producer = media::bounded(
            self.engine_timeout,
            "produce",
            transport.produce(ProduceRequest {
                kind,
                rtp_parameters,
                peer_id: self.peer_id,
            }),
        )
        .await?;

        let source = source.unwrap_or_else(|| MediaSource::default_for(kind));
        let summary = ProducerSummary {
            producer_id: producer.id(),
            peer_id: self.peer_id,
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            kind,
            source,
            paused: false,
        };

        if let Err(e) = self.room.register_producer(summary.clone()).await {
            self.close_engine_producer(&producer).await;
            return Err(e);
        }

        self.producers.insert(
            summary.producer_id,
            OwnedProducer {
                handle: producer,
                transport_id,
                source,
            },
        );
        Ok(summary)
    }

    /// Create a paused consumer for another peer's producer. The caller
    /// replies to the client and then calls [`PeerSession::resume_consumer`].
    pub async fn consume(
        &mut self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumeOutcome, RoomError> {
        let owned = self.transport(transport_id)?;
        if owned.direction != TransportDirection::Recv {
            return Err(RoomError::InvalidState(
                "Consumers require a receive transport".to_string(),
            ));
        }
        let transport = Arc::clone(&owned.handle);

        let producer = self
            .room
            .lookup_producer(producer_id)
            .await?
            .ok_or_else(|| RoomError::NotFound("Producer".to_string()))?;

        if !self.router.can_consume(producer_id, &rtp_capabilities) {
            return Err(RoomError::CannotConsume(producer_id.to_string()));
        }

        let consumer = media::bounded(
            self.engine_timeout,
            "consume",
            transport.consume(producer_id, rtp_capabilities),
        )
        .await?;

        let outcome = ConsumeOutcome {
            consumer_id: consumer.id(),
            transport_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type(),
            producer_paused: consumer.producer_paused(),
            producer,
        };
        self.consumers.insert(
            outcome.consumer_id,
            OwnedConsumer {
                handle: consumer,
                transport_id,
                producer_id,
            },
        );
        Ok(outcome)
    }

    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), RoomError> {
        let consumer = self
            .consumers
            .get(&consumer_id)
            .map(|owned| Arc::clone(&owned.handle))
            .ok_or_else(|| RoomError::NotFound("Consumer".to_string()))?;
        media::bounded(self.engine_timeout, "resume_consumer", consumer.resume()).await
    }

    /// Owner check for a producer id this session does not hold.
    async fn foreign_producer_error(&self, producer_id: ProducerId, action: &str) -> RoomError {
        match self.room.lookup_producer(producer_id).await {
            Ok(Some(_)) => RoomError::Forbidden(format!("Only the owner may {action} this producer")),
            Ok(None) => RoomError::NotFound("Producer".to_string()),
            Err(e) => e,
        }
    }

    /// Close one of this peer's producers. The room broadcasts
    /// `producer-closed` to every peer, the owner included.
    pub async fn close_producer(&mut self, producer_id: ProducerId) -> Result<MediaSource, RoomError> {
        let Some(owned) = self.producers.remove(&producer_id) else {
            return Err(self.foreign_producer_error(producer_id, "close").await);
        };
        self.close_engine_producer(&owned.handle).await;
        self.room.producer_closed(producer_id, self.peer_id).await?;
        Ok(owned.source)
    }

    /// Pause or resume one of this peer's producers.
    pub async fn mute_producer(
        &self,
        producer_id: ProducerId,
        mute: bool,
    ) -> Result<(MediaKind, MediaSource), RoomError> {
        let Some(owned) = self.producers.get(&producer_id) else {
            return Err(self.foreign_producer_error(producer_id, "mute").await);
        };
        let producer = Arc::clone(&owned.handle);
        let source = owned.source;

        if mute {
            media::bounded(self.engine_timeout, "pause_producer", producer.pause()).await?;
        } else {
            media::bounded(self.engine_timeout, "resume_producer", producer.resume()).await?;
        }
        self.room
            .producer_muted(producer_id, self.peer_id, mute)
            .await?;
        Ok((producer.kind(), source))
    }

    pub async fn restart_ice(&self, transport_id: TransportId) -> Result<IceParameters, RoomError> {
        let transport = Arc::clone(&self.transport(transport_id)?.handle);
        media::bounded(self.engine_timeout, "restart_ice", transport.restart_ice()).await
    }

    /// Apply an engine lifecycle event to the session maps.
    pub async fn on_engine_event(&mut self, event: EngineEvent) -> Vec<EngineNotice> {
        match event {
            EngineEvent::ConsumerClosed {
                consumer_id,
                producer_id,
            } => self
                .consumers
                .remove(&consumer_id)
                .map(|_| EngineNotice::ConsumerClosed {
                    consumer_id,
                    producer_id,
                })
                .into_iter()
                .collect(),

            EngineEvent::ProducerClosed { producer_id } => {
                self.unlist_producer(producer_id).await.into_iter().collect()
            }

            EngineEvent::TransportClosed { transport_id } => {
                if self.transports.remove(&transport_id).is_none() {
                    return Vec::new();
                }
                warn!(
                    target: "rs.peer",
                    peer_id = %self.peer_id,
                    transport_id = %transport_id,
                    "Transport closed by engine"
                );

                let mut notices = Vec::new();
                let orphaned: Vec<ProducerId> = self
                    .producers
                    .iter()
                    .filter(|(_, p)| p.transport_id == transport_id)
                    .map(|(id, _)| *id)
                    .collect();
                for producer_id in orphaned {
                    notices.extend(self.unlist_producer(producer_id).await);
                }

                let consumers: Vec<(ConsumerId, ProducerId)> = self
                    .consumers
                    .iter()
                    .filter(|(_, c)| c.transport_id == transport_id)
                    .map(|(id, c)| (*id, c.producer_id))
                    .collect();
                for (consumer_id, producer_id) in consumers {
                    self.consumers.remove(&consumer_id);
                    notices.push(EngineNotice::ConsumerClosed {
                        consumer_id,
                        producer_id,
                    });
                }

                notices.push(EngineNotice::TransportClosed { transport_id });
                notices
            }
        }
    }

    /// Forget a producer the engine closed and unlist it from the room.
    async fn unlist_producer(&mut self, producer_id: ProducerId) -> Option<EngineNotice> {
        let owned = self.producers.remove(&producer_id)?;
        if let Err(e) = self.room.producer_closed(producer_id, self.peer_id).await {
            debug!(
                target: "rs.peer",
                peer_id = %self.peer_id,
                error = %e,
                "Room gone while unlisting producer"
            );
        }
        Some(EngineNotice::ProducerClosed {
            producer_id,
            source: owned.source,
        })
    }

    /// A remote producer closed: close every consumer forwarding it.
    /// Returns the consumers that were still open.
    pub async fn on_remote_producer_closed(&mut self, producer_id: ProducerId) -> Vec<ConsumerId> {
        let affected: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.producer_id == producer_id)
            .map(|(id, _)| *id)
            .collect();

        for consumer_id in &affected {
            if let Some(owned) = self.consumers.remove(consumer_id) {
                if tokio::time::timeout(self.engine_timeout, owned.handle.close())
                    .await
                    .is_err()
                {
                    warn!(
                        target: "rs.peer",
                        peer_id = %self.peer_id,
                        consumer_id = %consumer_id,
                        "Consumer close timed out"
                    );
                }
            }
        }
        affected
    }

    async fn close_engine_producer(&self, producer: &Arc<dyn MediaProducer>) {
        if tokio::time::timeout(self.engine_timeout, producer.close())
            .await
            .is_err()
        {
            warn!(
                target: "rs.peer",
                peer_id = %self.peer_id,
                producer_id = %producer.id(),
                "Producer close timed out"
            );
        }
    }

    /// Close every transport this session owns, cascading to its producers
    /// and consumers. Best effort: each close is bounded and a failure does
    /// not stop the rest. Idempotent.
    pub async fn close_all(&mut self) -> Vec<(ProducerId, MediaSource)> {
        let closed_producers: Vec<(ProducerId, MediaSource)> = self
            .producers
            .drain()
            .map(|(id, owned)| (id, owned.source))
            .collect();
        self.consumers.clear();

        for (transport_id, owned) in self.transports.drain() {
            if tokio::time::timeout(self.engine_timeout, owned.handle.close())
                .await
                .is_err()
            {
                warn!(
                    target: "rs.peer",
                    peer_id = %self.peer_id,
                    transport_id = %transport_id,
                    "Transport close timed out, continuing"
                );
            }
        }

        debug!(
            target: "rs.peer",
            peer_id = %self.peer_id,
            producers = closed_producers.len(),
            "Peer media closed"
        );
        closed_producers
    }
}
