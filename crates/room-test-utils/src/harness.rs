//! In-process Room Service harness.
//!
//! Builds the full signaling stack on the in-memory store, the in-process
//! bus and [`MockMediaEngine`], and drives connections over channels the
//! same way the WebSocket layer does.

use crate::fixtures::{dtls_parameters, mint_token, rtp_parameters, test_config};
use crate::mock_engine::MockMediaEngine;

use axum::Router;
use common::types::{ConsumerId, MeetingId, PeerId, ProducerId, RoomId, TransportId, UserId};
use room_service::actors::RoomRegistry;
use room_service::auth::{Identity, IdentityResolver};
use room_service::bus::{EventBus, LocalEventBus};
use room_service::config::Config;
use room_service::media::{default_media_codecs, MediaEngine, MediaKind, MediaSource, RtpCapabilities, TransportDirection};
use room_service::meetings::{
    CreateMeeting, InMemoryMeetingStore, Meeting, MeetingLifecycle, MeetingStore, WaitingRoom,
};
use room_service::routes::{build_routes, AppState};
use room_service::signaling::{
    run_host_channel, run_session, ClientMessage, ConnectRequest, HostClientMessage,
    HostServerMessage, Inbound, ServerMessage, SignalingContext,
};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a test waits for an expected frame.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a test waits to conclude no frame is coming.
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// The signaling stack wired for tests.
pub struct Harness {
    pub config: Config,
    pub engine: Arc<MockMediaEngine>,
    pub store: Arc<InMemoryMeetingStore>,
    pub bus: Arc<LocalEventBus>,
    pub registry: Arc<RoomRegistry>,
    pub lifecycle: Arc<MeetingLifecycle>,
    pub waiting_room: Arc<WaitingRoom>,
    pub ctx: SignalingContext,
    shutdown: CancellationToken,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    #[must_use]
    pub fn with_config(config: Config) -> Self {
        let engine = Arc::new(MockMediaEngine::new());
        let store = Arc::new(InMemoryMeetingStore::new());
        let bus = Arc::new(LocalEventBus::new());
        let shutdown = CancellationToken::new();

        let dyn_store: Arc<dyn MeetingStore> = store.clone();
        let dyn_bus: Arc<dyn EventBus> = bus.clone();
        let dyn_engine: Arc<dyn MediaEngine> = engine.clone();

        let registry = Arc::new(RoomRegistry::new(
            dyn_engine,
            default_media_codecs(),
            config.engine_timeout,
            shutdown.child_token(),
        ));
        let waiting_room = Arc::new(WaitingRoom::new(Arc::clone(&dyn_store), Arc::clone(&dyn_bus)));
        let lifecycle = Arc::new(MeetingLifecycle::new(
            Arc::clone(&dyn_store),
            Arc::clone(&dyn_bus),
            Arc::clone(&registry),
            Arc::clone(&waiting_room),
        ));
        let ctx = SignalingContext {
            identity: Arc::new(IdentityResolver::new(&config.jwt_secret, config.allow_guests)),
            store: dyn_store,
            bus: dyn_bus,
            registry: Arc::clone(&registry),
            lifecycle: Arc::clone(&lifecycle),
            waiting_room: Arc::clone(&waiting_room),
            engine_timeout: config.engine_timeout,
            shutdown: shutdown.clone(),
        };

        Self {
            config,
            engine,
            store,
            bus,
            registry,
            lifecycle,
            waiting_room,
            ctx,
            shutdown,
        }
    }

    /// The HTTP router over this harness's services.
    #[must_use]
    pub fn router(&self) -> Router {
        build_routes(Arc::new(AppState {
            config: self.config.clone(),
            signaling: self.ctx.clone(),
        }))
    }

    /// Create a meeting hosted by `host`.
    pub async fn create_meeting(&self, host: &str, request: CreateMeeting) -> Meeting {
        self.lifecycle
            .create(&identity(host), request)
            .await
            .expect("meeting created")
    }

    /// Current stored record of a meeting.
    pub async fn meeting(&self, meeting_id: MeetingId) -> Meeting {
        self.lifecycle.get(meeting_id).await.expect("meeting exists")
    }

    /// Connect an authenticated user to a room.
    pub fn connect(&self, room_id: &RoomId, user_id: &str) -> TestClient {
        self.connect_with(ConnectRequest {
            room_id: room_id.clone(),
            token: Some(mint_token(user_id, None)),
            display_name: None,
            password: None,
        })
    }

    /// Connect an authenticated user with a meeting password.
    pub fn connect_with_password(&self, room_id: &RoomId, user_id: &str, password: &str) -> TestClient {
        self.connect_with(ConnectRequest {
            room_id: room_id.clone(),
            token: Some(mint_token(user_id, None)),
            display_name: None,
            password: Some(password.to_string()),
        })
    }

    /// Connect a guest (no token).
    pub fn connect_guest(&self, room_id: &RoomId, name: &str) -> TestClient {
        self.connect_with(ConnectRequest {
            room_id: room_id.clone(),
            token: None,
            display_name: Some(name.to_string()),
            password: None,
        })
    }

    pub fn connect_with(&self, request: ConnectRequest) -> TestClient {
        let (inbound_tx, inbound_rx) = mpsc::channel(32);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_buffer);
        let task = tokio::spawn(run_session(self.ctx.clone(), request, inbound_rx, outbound_tx));
        TestConnection {
            to_server: Some(inbound_tx),
            from_server: outbound_rx,
            task,
        }
    }

    /// Open the host's waiting-room channel.
    pub fn connect_host(&self, meeting_id: MeetingId, host: &str) -> TestHost {
        let (inbound_tx, inbound_rx) = mpsc::channel(32);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_buffer);
        let task = tokio::spawn(run_host_channel(
            self.ctx.clone(),
            meeting_id,
            Some(mint_token(host, None)),
            inbound_rx,
            outbound_tx,
        ));
        TestConnection {
            to_server: Some(inbound_tx),
            from_server: outbound_rx,
            task,
        }
    }

    /// Wait until the registry holds no rooms.
    pub async fn wait_for_no_rooms(&self) {
        tokio::time::timeout(FRAME_TIMEOUT, async {
            while self.registry.room_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("rooms were not removed");
    }

    /// Stop every connection and room.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.shutdown(Duration::from_secs(1)).await;
    }
}

/// Authenticated identity for `user_id`.
#[must_use]
pub fn identity(user_id: &str) -> Identity {
    Identity {
        user_id: UserId::from(user_id),
        display_name: user_id.to_string(),
        is_guest: false,
    }
}

/// One connection driven by a test.
pub struct TestConnection<C, S> {
    to_server: Option<mpsc::Sender<Inbound<C>>>,
    from_server: mpsc::Receiver<S>,
    task: JoinHandle<()>,
}

pub type TestClient = TestConnection<ClientMessage, ServerMessage>;
pub type TestHost = TestConnection<HostClientMessage, HostServerMessage>;

impl<C: Send + 'static, S: Debug> TestConnection<C, S> {
    pub async fn send(&self, message: C) {
        self.send_inbound(Inbound::Message(message)).await;
    }

    /// Send a frame the decoder rejected.
    pub async fn send_malformed(&self) {
        self.send_inbound(Inbound::Malformed {
            reason: "test".to_string(),
        })
        .await;
    }

    async fn send_inbound(&self, frame: Inbound<C>) {
        self.to_server
            .as_ref()
            .expect("connection already dropped")
            .send(frame)
            .await
            .expect("server stopped reading");
    }

    /// Next frame, failing the test if none arrives in time.
    pub async fn recv(&mut self) -> S {
        tokio::time::timeout(FRAME_TIMEOUT, self.from_server.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed while waiting for a frame")
    }

    /// Skip frames until one matches `pred`.
    pub async fn recv_until(&mut self, pred: impl Fn(&S) -> bool) -> S {
        loop {
            let frame = self.recv().await;
            if pred(&frame) {
                return frame;
            }
        }
    }

    /// Frame received within [`QUIET_PERIOD`], if any.
    pub async fn try_recv(&mut self) -> Option<S> {
        tokio::time::timeout(QUIET_PERIOD, self.from_server.recv())
            .await
            .ok()
            .flatten()
    }

    /// Assert nothing is sent for [`QUIET_PERIOD`].
    pub async fn expect_silence(&mut self) {
        if let Some(frame) = self.try_recv().await {
            panic!("expected no frame, got {frame:?}");
        }
    }

    /// Wait for the server to close the connection, returning the frames
    /// sent before it did.
    pub async fn closed(&mut self) -> Vec<S> {
        let mut frames = Vec::new();
        tokio::time::timeout(FRAME_TIMEOUT, async {
            while let Some(frame) = self.from_server.recv().await {
                frames.push(frame);
            }
        })
        .await
        .expect("connection was not closed");
        frames
    }

    /// Drop the connection and wait for the server side to finish.
    pub async fn disconnect(mut self) {
        self.to_server.take();
        tokio::time::timeout(FRAME_TIMEOUT, &mut self.task)
            .await
            .expect("session did not finish")
            .expect("session task panicked");
    }

    /// Whether the server side has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// The `room-info` snapshot a joined client receives first.
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub peer_id: PeerId,
    pub meeting_id: MeetingId,
    pub capabilities: RtpCapabilities,
    pub peers: Vec<room_service::actors::PeerSummary>,
    pub producers: Vec<room_service::actors::ProducerSummary>,
}

impl TestClient {
    /// Expect `room-info` as the next frame.
    pub async fn joined(&mut self) -> RoomInfo {
        match self.recv().await {
            ServerMessage::RoomInfo {
                peer_id,
                meeting_id,
                router_rtp_capabilities,
                peers,
                producers,
                ..
            } => RoomInfo {
                peer_id,
                meeting_id,
                capabilities: router_rtp_capabilities,
                peers,
                producers,
            },
            other => panic!("expected room-info, got {other:?}"),
        }
    }

    /// Expect an `error` frame and return its kind.
    pub async fn error_kind(&mut self) -> String {
        match self.recv().await {
            ServerMessage::Error { kind, .. } => kind,
            other => panic!("expected error, got {other:?}"),
        }
    }

    /// Create and connect a transport.
    pub async fn transport(&mut self, direction: TransportDirection) -> TransportId {
        self.send(ClientMessage::CreateTransport { direction }).await;
        let transport_id = match self.recv().await {
            ServerMessage::TransportCreated { transport_id, .. } => transport_id,
            other => panic!("expected transport-created, got {other:?}"),
        };
        self.send(ClientMessage::ConnectTransport {
            transport_id,
            dtls_parameters: dtls_parameters(),
        })
        .await;
        match self.recv().await {
            ServerMessage::TransportConnected { .. } => transport_id,
            other => panic!("expected transport-connected, got {other:?}"),
        }
    }

    /// Produce on a send transport.
    pub async fn produce(
        &mut self,
        transport_id: TransportId,
        kind: MediaKind,
        source: Option<MediaSource>,
    ) -> ProducerId {
        self.send(ClientMessage::Produce {
            transport_id,
            kind,
            rtp_parameters: rtp_parameters(kind),
            source,
        })
        .await;
        match self.recv().await {
            ServerMessage::ProducerCreated { producer_id, .. } => producer_id,
            other => panic!("expected producer-created, got {other:?}"),
        }
    }

    /// Consume a producer on a receive transport; returns the consumer id
    /// once `consumer-created` and `consumer-resumed` have arrived.
    pub async fn consume(
        &mut self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> ConsumerId {
        self.send(ClientMessage::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
        })
        .await;
        let consumer_id = match self.recv().await {
            ServerMessage::ConsumerCreated { consumer_id, .. } => consumer_id,
            other => panic!("expected consumer-created, got {other:?}"),
        };
        match self.recv().await {
            ServerMessage::ConsumerResumed { consumer_id: resumed } => {
                assert_eq!(resumed, consumer_id);
                consumer_id
            }
            other => panic!("expected consumer-resumed, got {other:?}"),
        }
    }
}
